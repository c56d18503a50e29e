pub mod cluster;
pub mod config;
pub mod election_timer;
pub mod error;
pub mod impls;
pub mod mailbox;
mod node;
pub mod raft_log;
pub mod raft_network;
mod raft_state;
pub mod raft_storage;
mod utils;

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt::Debug;

pub use cluster::LocalCluster;
pub use config::{ClusterConfig, RaftConfig};
pub use error::RaftError;
pub use mailbox::ClientResponse;
pub use node::{Node, NodeHandle};
pub use raft_state::RaftRole;

pub use self::raft_log::{FileLog, Log, LogEntry, MemLog};
pub use self::raft_network::{Destination, Envelope, Msg, RaftNetwork};
pub use self::raft_storage::TermStore;

pub type NodeId = u64;
pub type Term = u64;
pub type LogIndex = u64;

/// Opaque client command carried through the log.
///
/// Anything that can be cloned, sent across threads and written to disk as
/// JSON qualifies.
pub trait Command: Clone + Debug + Send + Serialize + DeserializeOwned + 'static {}

impl<T> Command for T where T: Clone + Debug + Send + Serialize + DeserializeOwned + 'static {}
