use std::fmt::Debug;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::RaftError;
use crate::raft_log::LogEntry;
use crate::{LogIndex, NodeId, Term};

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Destination {
    Node(NodeId),
    Broadcast,
}

/// Protocol payloads. Every message a leader or candidate originates carries
/// its term; peers never look terms up anywhere else.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Msg<E> {
    /// Leader's no-op. Also used as the payload-free probe to peers that
    /// already acknowledged the entry under replication.
    Heartbeat { term: Term },
    VoteRequest { term: Term, candidate: NodeId },
    VoteGrant { term: Term },
    AppendAck { index: LogIndex },
    Append { term: Term, entry: LogEntry<E> },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Envelope<E> {
    /// As addressed by the sender.
    pub to: Destination,
    /// Filled in by the transport on send.
    pub from: NodeId,
    /// Monotonic per cluster, opaque to the consensus layer.
    pub msg_id: u64,
    pub msg: Msg<E>,
}

/// Peer messaging capability.
///
/// Delivery is at-most-once, unordered and lossy: a successful `send` only
/// means the message was handed over. The consensus layer retries at the
/// protocol level and never relies on transport acknowledgements.
pub trait RaftNetwork: Send + Sync + Debug + 'static {
    type Command;

    fn self_id(&self) -> NodeId;

    /// All other cluster members.
    fn peer_ids(&self) -> Box<dyn Iterator<Item = NodeId> + '_>;

    fn send(&self, to: Destination, msg: Msg<Self::Command>) -> Result<(), RaftError>;

    /// Next inbound message, or `None` once `timeout` elapses. Messages from
    /// senders outside the cluster never surface here.
    fn receive_timeout(&self, timeout: Duration) -> Option<Envelope<Self::Command>>;

    fn broadcast(&self, msg: Msg<Self::Command>) -> Result<(), RaftError> {
        self.send(Destination::Broadcast, msg)
    }
}
