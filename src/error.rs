use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::NodeId;

#[derive(Debug, Error)]
pub enum RaftError {
    #[error("server #{0} does not exist in this cluster")]
    UnknownNode(NodeId),

    #[error("not leader, current leader is {leader}")]
    NotLeader { leader: NodeId },

    #[error("transport failure: {0}")]
    Transport(String),

    #[error("persistence failure on {}: {source}", .path.display())]
    Persistence {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("node {0} has stopped")]
    Stopped(NodeId),
}

impl RaftError {
    pub(crate) fn persistence(path: impl Into<PathBuf>, source: io::Error) -> Self {
        RaftError::Persistence {
            path: path.into(),
            source,
        }
    }

    /// Errors after which a node must stop participating.
    pub fn is_fatal(&self) -> bool {
        matches!(self, RaftError::Persistence { .. })
    }
}
