//! Client-facing mailbox: commands go in through the inbox, responses come
//! back through the outbox.

use std::time::Duration;

use crossbeam::channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};

use crate::error::RaftError;
use crate::{LogIndex, NodeId};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ClientResponse {
    /// Replicated on a majority and committed under this index.
    Accepted { index: LogIndex },
    /// Leader id 0 means none is known yet.
    NotLeader { leader: NodeId },
}

impl ClientResponse {
    pub fn into_result(self) -> Result<LogIndex, RaftError> {
        match self {
            ClientResponse::Accepted { index } => Ok(index),
            ClientResponse::NotLeader { leader } => Err(RaftError::NotLeader { leader }),
        }
    }
}

pub fn mailbox<E>(id: NodeId, cap: usize) -> (ClientMailbox<E>, Mailbox<E>) {
    let (inbox_tx, inbox_rx) = bounded(cap);
    let (outbox_tx, outbox_rx) = bounded(cap);
    (
        ClientMailbox {
            id,
            inbox: inbox_tx,
            outbox: outbox_rx,
        },
        Mailbox {
            id,
            inbox: inbox_rx,
            outbox: outbox_tx,
        },
    )
}

/// The half held by the layer above.
#[derive(Debug)]
pub struct ClientMailbox<E> {
    id: NodeId,
    inbox: Sender<E>,
    outbox: Receiver<ClientResponse>,
}

impl<E> ClientMailbox<E> {
    /// Queues a command; blocks while the inbox is full. The response
    /// arrives later on the outbox. A command lost to a leadership change
    /// mid-replication gets no response at all.
    pub fn submit(&self, command: E) -> Result<(), RaftError> {
        self.inbox.send(command).map_err(|_| RaftError::Stopped(self.id))
    }

    pub fn recv_timeout(&self, timeout: Duration) -> Result<Option<ClientResponse>, RaftError> {
        match self.outbox.recv_timeout(timeout) {
            Ok(response) => Ok(Some(response)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(RaftError::Stopped(self.id)),
        }
    }

    pub fn try_recv(&self) -> Option<ClientResponse> {
        self.outbox.try_recv().ok()
    }
}

/// The half held by the node.
#[derive(Debug)]
pub struct Mailbox<E> {
    id: NodeId,
    pub(crate) inbox: Receiver<E>,
    outbox: Sender<ClientResponse>,
}

impl<E> Mailbox<E> {
    /// Never blocks the node: if the client stopped draining the outbox the
    /// response is dropped.
    pub fn respond(&self, response: ClientResponse) {
        match self.outbox.try_send(response) {
            Ok(()) => {}
            Err(TrySendError::Full(r)) => {
                log::warn!("[{}] Client outbox full, dropping {:?}", self.id, r);
            }
            Err(TrySendError::Disconnected(_)) => {
                log::debug!("[{}] Client went away", self.id);
            }
        }
    }
}
