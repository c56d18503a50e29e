//! Cluster and per-node settings.
//!
//! Both structs load from JSON; any field left out of the file takes its
//! default value.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::RaftError;
use crate::NodeId;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RaftConfig {
    /// Interval between leader heartbeats. Replication retries tick at half of it.
    pub heartbeat_rate_ms: u64,
    pub election_wait_min_ms: u64,
    pub election_wait_max_ms: u64,
    /// Capacity of the client inbox and outbox.
    pub mailbox_cap: usize,
}

impl Default for RaftConfig {
    fn default() -> Self {
        RaftConfig {
            heartbeat_rate_ms: 100,
            election_wait_min_ms: 300,
            election_wait_max_ms: 600,
            mailbox_cap: 10,
        }
    }
}

impl RaftConfig {
    pub fn heartbeat_rate(&self) -> Duration {
        Duration::from_millis(self.heartbeat_rate_ms)
    }

    pub fn replication_tick(&self) -> Duration {
        self.heartbeat_rate() / 2
    }

    pub fn validate(&self) -> Result<(), RaftError> {
        if self.heartbeat_rate_ms == 0 {
            return Err(RaftError::Config("heartbeat_rate_ms must be positive".into()));
        }
        if self.election_wait_min_ms >= self.election_wait_max_ms {
            return Err(RaftError::Config(format!(
                "election_wait_min_ms ({}) must be below election_wait_max_ms ({})",
                self.election_wait_min_ms, self.election_wait_max_ms
            )));
        }
        if self.heartbeat_rate_ms >= self.election_wait_min_ms {
            return Err(RaftError::Config(format!(
                "heartbeat_rate_ms ({}) must be below election_wait_min_ms ({})",
                self.heartbeat_rate_ms, self.election_wait_min_ms
            )));
        }
        if self.mailbox_cap == 0 {
            return Err(RaftError::Config("mailbox_cap must be positive".into()));
        }
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    pub members: Vec<NodeId>,
    /// Holds `terms.json` and one `<id>.log.json` per node.
    pub data_dir: PathBuf,
    /// Capacity of each node's inbound message queue.
    pub chan_cap: usize,
    pub raft: RaftConfig,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        ClusterConfig {
            members: vec![1, 2, 3, 4, 5],
            data_dir: PathBuf::from("log"),
            chan_cap: 256,
            raft: RaftConfig::default(),
        }
    }
}

impl ClusterConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, RaftError> {
        let path = path.as_ref();
        let blob = fs::read_to_string(path)
            .map_err(|e| RaftError::Config(format!("cannot read {}: {}", path.display(), e)))?;
        let config: ClusterConfig = serde_json::from_str(&blob)
            .map_err(|e| RaftError::Config(format!("cannot parse {}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), RaftError> {
        if self.members.is_empty() {
            return Err(RaftError::Config("cluster needs at least one member".into()));
        }
        let mut seen = HashSet::new();
        for &id in &self.members {
            if id == 0 {
                return Err(RaftError::Config("node id 0 is reserved for \"no leader\"".into()));
            }
            if !seen.insert(id) {
                return Err(RaftError::Config(format!("duplicate member id {}", id)));
            }
        }
        if self.chan_cap == 0 {
            return Err(RaftError::Config("chan_cap must be positive".into()));
        }
        self.raft.validate()
    }

    pub fn terms_path(&self) -> PathBuf {
        self.data_dir.join("terms.json")
    }

    pub fn log_path(&self, id: NodeId) -> PathBuf {
        self.data_dir.join(format!("{}.log.json", id))
    }
}
