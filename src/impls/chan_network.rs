use std::collections::{HashMap, HashSet};
use std::fmt::Debug;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use crossbeam::channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};

use crate::error::RaftError;
use crate::raft_network::{Destination, Envelope, Msg, RaftNetwork};
use crate::NodeId;

/// Which nodes can currently reach each other. Empty means fully connected.
#[derive(Debug, Default)]
struct Links {
    groups: HashMap<NodeId, usize>,
}

impl Links {
    fn connected(&self, a: NodeId, b: NodeId) -> bool {
        match (self.groups.get(&a), self.groups.get(&b)) {
            (Some(ga), Some(gb)) => ga == gb,
            // nodes left out of every group stay reachable by everyone
            _ => true,
        }
    }
}

/// Shared by every `ChanNetwork` of one in-process cluster.
#[derive(Debug)]
struct Fabric {
    members: HashSet<NodeId>,
    msg_counter: AtomicU64,
    links: Mutex<Links>,
}

impl Fabric {
    fn links(&self) -> MutexGuard<'_, Links> {
        self.links.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Test/demo handle for cutting and restoring links.
#[derive(Clone, Debug)]
pub struct NetworkControl {
    fabric: Arc<Fabric>,
}

impl NetworkControl {
    /// Splits the cluster: nodes in different groups can no longer exchange
    /// messages. Traffic across the cut is dropped silently.
    pub fn partition(&self, groups: &[&[NodeId]]) {
        let mut links = self.fabric.links();
        links.groups.clear();
        for (group_id, group) in groups.iter().enumerate() {
            for &id in group.iter() {
                links.groups.insert(id, group_id);
            }
        }
        log::info!("Network partitioned into {:?}", groups);
    }

    pub fn heal(&self) {
        self.fabric.links().groups.clear();
        log::info!("Network healed");
    }
}

/// In-process transport over bounded crossbeam channels, one inbound queue
/// per node. A full queue drops the message.
pub struct ChanNetwork<E> {
    id: NodeId,
    peers: Vec<NodeId>,
    outbound: HashMap<NodeId, Sender<Envelope<E>>>,
    inbound: Receiver<Envelope<E>>,
    fabric: Arc<Fabric>,
}

impl<E> Debug for ChanNetwork<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChanNetwork")
            .field("id", &self.id)
            .field("peers", &self.peers)
            .field("pending", &self.inbound.len())
            .finish()
    }
}

impl<E: Clone> ChanNetwork<E> {
    /// Wires a fully connected cluster. Networks come back in `ids` order.
    pub fn cluster(ids: &[NodeId], chan_cap: usize) -> (Vec<ChanNetwork<E>>, NetworkControl) {
        let fabric = Arc::new(Fabric {
            members: ids.iter().copied().collect(),
            msg_counter: AtomicU64::new(0),
            links: Mutex::new(Links::default()),
        });

        let mut senders = HashMap::new();
        let mut receivers = Vec::new();
        for &id in ids {
            let (tx, rx) = bounded(chan_cap);
            senders.insert(id, tx);
            receivers.push(rx);
        }

        let networks = ids
            .iter()
            .zip(receivers)
            .map(|(&id, inbound)| ChanNetwork {
                id,
                peers: ids.iter().copied().filter(|&p| p != id).collect(),
                outbound: senders
                    .iter()
                    .filter(|(p, _)| **p != id)
                    .map(|(&p, tx)| (p, tx.clone()))
                    .collect(),
                inbound,
                fabric: fabric.clone(),
            })
            .collect();

        (networks, NetworkControl { fabric })
    }

    fn deliver(&self, peer_id: NodeId, envelope: Envelope<E>) -> Result<(), RaftError> {
        if !self.fabric.links().connected(self.id, peer_id) {
            log::trace!("[{}] Link to {} is cut, dropping {:?}", self.id, peer_id, envelope.msg_id);
            return Ok(());
        }
        let tx = self
            .outbound
            .get(&peer_id)
            .ok_or(RaftError::UnknownNode(peer_id))?;
        tx.try_send(envelope).map_err(|e| match e {
            TrySendError::Full(_) => RaftError::Transport(format!("inbound queue of {} is full", peer_id)),
            TrySendError::Disconnected(_) => RaftError::Transport(format!("node {} is gone", peer_id)),
        })
    }
}

impl<E: Clone + Debug + Send + 'static> RaftNetwork for ChanNetwork<E> {
    type Command = E;

    fn self_id(&self) -> NodeId {
        self.id
    }

    fn peer_ids(&self) -> Box<dyn Iterator<Item = NodeId> + '_> {
        Box::new(self.peers.iter().copied())
    }

    fn send(&self, to: Destination, msg: Msg<E>) -> Result<(), RaftError> {
        let envelope = Envelope {
            to,
            from: self.id,
            msg_id: self.fabric.msg_counter.fetch_add(1, Ordering::Relaxed) + 1,
            msg,
        };
        match to {
            Destination::Node(peer_id) => self.deliver(peer_id, envelope),
            Destination::Broadcast => {
                // keep going past failures, report the last one
                let mut result = Ok(());
                for &peer_id in &self.peers {
                    if let Err(e) = self.deliver(peer_id, envelope.clone()) {
                        result = Err(e);
                    }
                }
                result
            }
        }
    }

    fn receive_timeout(&self, timeout: Duration) -> Option<Envelope<E>> {
        let deadline = Instant::now() + timeout;
        loop {
            let wait = deadline.saturating_duration_since(Instant::now());
            match self.inbound.recv_timeout(wait) {
                Ok(envelope) if self.fabric.members.contains(&envelope.from) => return Some(envelope),
                Ok(envelope) => {
                    log::debug!("[{}] Dropping message from non-member {}", self.id, envelope.from);
                }
                Err(RecvTimeoutError::Timeout) => return None,
                Err(RecvTimeoutError::Disconnected) => {
                    // no peer can reach us (single-node cluster); still honor the wait
                    std::thread::sleep(deadline.saturating_duration_since(Instant::now()));
                    return None;
                }
            }
        }
    }
}
