//! A whole cluster in one process: one shared term table, one log file per
//! node, nodes wired together by `ChanNetwork`.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crate::config::ClusterConfig;
use crate::error::RaftError;
use crate::impls::{ChanNetwork, NetworkControl};
use crate::node::{Node, NodeHandle};
use crate::raft_log::FileLog;
use crate::raft_network::RaftNetwork;
use crate::raft_storage::TermStore;
use crate::{Command, NodeId};

const POLL: Duration = Duration::from_millis(10);

pub struct LocalCluster<E: Command> {
    config: ClusterConfig,
    control: NetworkControl,
    nodes: Vec<NodeHandle<FileLog<E>>>,
}

impl<E: Command> LocalCluster<E> {
    pub fn start(config: ClusterConfig) -> Result<Self, RaftError> {
        config.validate()?;
        let terms = Arc::new(TermStore::open(config.terms_path(), config.members.iter().copied())?);
        let (networks, control) = ChanNetwork::cluster(&config.members, config.chan_cap);

        let mut nodes = Vec::with_capacity(networks.len());
        for network in networks {
            let log = FileLog::open(config.log_path(network.self_id()))?;
            nodes.push(Node::new(&config.raft, terms.clone(), log, network)?.start());
        }
        log::info!(
            "Started cluster of {} nodes in {}",
            nodes.len(),
            config.data_dir.display()
        );

        Ok(LocalCluster {
            config,
            control,
            nodes,
        })
    }

    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    pub fn control(&self) -> &NetworkControl {
        &self.control
    }

    pub fn nodes(&self) -> &[NodeHandle<FileLog<E>>] {
        &self.nodes
    }

    pub fn node(&self, id: NodeId) -> Option<&NodeHandle<FileLog<E>>> {
        self.nodes.iter().find(|n| n.id() == id)
    }

    pub fn leaders(&self) -> Vec<NodeId> {
        self.nodes
            .iter()
            .filter(|n| n.is_leader())
            .map(|n| n.id())
            .collect()
    }

    /// Polls until exactly one of `ids` believes it leads and every other
    /// one of `ids` follows it. Returns that leader.
    pub fn wait_for_leader_among(&self, ids: &[NodeId], timeout: Duration) -> Option<NodeId> {
        let deadline = Instant::now() + timeout;
        loop {
            let group: Vec<_> = self.nodes.iter().filter(|n| ids.contains(&n.id())).collect();
            let leaders: Vec<_> = group.iter().filter(|n| n.is_leader()).map(|n| n.id()).collect();
            if let [leader] = leaders.as_slice() {
                if group.iter().all(|n| n.leader() == *leader) {
                    return Some(*leader);
                }
            }
            if Instant::now() >= deadline {
                return None;
            }
            thread::sleep(POLL);
        }
    }

    pub fn wait_for_leader(&self, timeout: Duration) -> Option<NodeId> {
        let ids: Vec<_> = self.nodes.iter().map(|n| n.id()).collect();
        self.wait_for_leader_among(&ids, timeout)
    }

    /// Stops every node and waits for their threads.
    pub fn shutdown(&mut self) {
        for node in self.nodes.iter_mut() {
            node.shutdown();
        }
    }
}
