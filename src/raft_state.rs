use std::collections::HashSet;
use std::fmt::Debug;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::RaftError;
use crate::raft_log::{Log, LogEntry};
use crate::raft_network::{Destination, Envelope, Msg, RaftNetwork};
use crate::raft_storage::TermStore;
use crate::utils;
use crate::{LogIndex, NodeId, Term};

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RaftRole {
    Follower,
    Candidate,
    Leader,
}

/// One leader-side replication round: the entry in flight and who has it.
#[derive(Debug)]
pub(crate) struct Round {
    index: LogIndex,
    acks: HashSet<NodeId>,
}

#[derive(Debug)]
pub(crate) enum RoleState {
    Follower,
    Candidate {
        // peers that granted us their vote this term
        votes: HashSet<NodeId>,
    },
    Leader {
        round: Option<Round>,
    },
}

impl RoleState {
    fn role(&self) -> RaftRole {
        match self {
            RoleState::Follower => RaftRole::Follower,
            RoleState::Candidate { .. } => RaftRole::Candidate,
            RoleState::Leader { .. } => RaftRole::Leader,
        }
    }
}

/// Everything one node knows, guarded by a single lock in `Node`.
///
/// The term itself lives in the `TermStore`: every read goes to the store
/// and every change is persisted before the handler carries on.
pub(crate) struct RaftState<L: Log> {
    id: NodeId,
    peers: Vec<NodeId>,
    terms: Arc<TermStore>,
    log: L,

    role_state: RoleState,
    voted: bool,
    // 0 when unknown
    leader: NodeId,
    last_minted: LogIndex,
}

impl<L: Log> Debug for RaftState<L> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RaftState")
            .field("id", &self.id)
            .field("term", &self.terms.get(self.id).ok())
            .field("role", &self.role_state.role())
            .field("voted", &self.voted)
            .field("leader", &self.leader)
            .field("log_len", &self.log.len())
            .finish()
    }
}

pub(crate) fn send_best_effort<N: RaftNetwork>(net: &N, to: Destination, msg: Msg<N::Command>) {
    if let Err(e) = net.send(to, msg) {
        log::warn!("[{}] Send to {:?} failed: {}", net.self_id(), to, e);
    }
}

fn now_nanos() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}

impl<L: Log> RaftState<L> {
    pub(crate) fn new(id: NodeId, peers: Vec<NodeId>, terms: Arc<TermStore>, log: L) -> Result<Self, RaftError> {
        // fail early on an id the term table does not know
        terms.get(id)?;
        Ok(RaftState {
            id,
            peers,
            terms,
            log,
            role_state: RoleState::Follower,
            voted: false,
            leader: 0,
            last_minted: 0,
        })
    }

    pub(crate) fn term(&self) -> Result<Term, RaftError> {
        self.terms.get(self.id)
    }

    fn set_term(&mut self, term: Term) -> Result<(), RaftError> {
        self.terms.set(self.id, term)
    }

    pub(crate) fn role(&self) -> RaftRole {
        self.role_state.role()
    }

    pub(crate) fn is_leader(&self) -> bool {
        matches!(self.role_state, RoleState::Leader { .. })
    }

    pub(crate) fn leader(&self) -> NodeId {
        self.leader
    }

    pub(crate) fn log(&self) -> &L {
        &self.log
    }

    pub(crate) fn discard_up_to(&mut self, index: LogIndex) -> Result<usize, RaftError> {
        let removed = self.log.discard_up_to(index)?;
        log::info!("[{}] Discarded {} entries up to {}", self.id, removed, index);
        Ok(removed)
    }

    fn majority(&self) -> usize {
        utils::majority(self.peers.len() + 1)
    }

    fn step_down(&mut self, reason: &str) {
        if !matches!(self.role_state, RoleState::Follower) {
            log::info!("[{}] {:?} -> Follower: {}", self.id, self.role(), reason);
            if let RoleState::Leader { round: Some(round) } = &self.role_state {
                log::warn!("[{}] Abandoning replication of entry {}", self.id, round.index);
            }
            self.role_state = RoleState::Follower;
        }
    }

    /// Stops taking part after a fatal error.
    pub(crate) fn halt(&mut self) {
        self.step_down("halted");
        self.leader = 0;
    }

    /// Moves to `term` if it is newer than ours. Returns the term now held.
    fn observe_term(&mut self, term: Term, from: NodeId) -> Result<Term, RaftError> {
        let own = self.term()?;
        if term > own {
            log::debug!("[{}] Term {} -> {} seen from {}", self.id, own, term, from);
            self.set_term(term)?;
            self.voted = false;
            return Ok(term);
        }
        Ok(own)
    }

    /// Election timer fired. Followers and stuck candidates start a new
    /// election; leaders ignore it.
    pub(crate) fn election_timeout<N>(&mut self, net: &N) -> Result<(), RaftError>
    where
        N: RaftNetwork<Command = L::Command>,
    {
        if self.is_leader() {
            return Ok(());
        }
        let term = self.term()? + 1;
        self.set_term(term)?;
        self.voted = true;
        self.leader = 0;
        self.role_state = RoleState::Candidate {
            votes: HashSet::new(),
        };
        log::info!("[{}] Election timeout, standing for term {}", self.id, term);

        send_best_effort(
            net,
            Destination::Broadcast,
            Msg::VoteRequest {
                term,
                candidate: self.id,
            },
        );
        self.count_votes(net, term);
        Ok(())
    }

    fn count_votes<N>(&mut self, net: &N, term: Term)
    where
        N: RaftNetwork<Command = L::Command>,
    {
        let granted = match &self.role_state {
            // our own vote counts as one
            RoleState::Candidate { votes } => votes.len() + 1,
            _ => return,
        };
        if granted >= self.majority() {
            log::info!("[{}] Received {} votes, leader for term {}", self.id, granted, term);
            self.role_state = RoleState::Leader { round: None };
            self.leader = self.id;
            send_best_effort(net, Destination::Broadcast, Msg::Heartbeat { term });
        }
    }

    /// Classifies one inbound message. Returns whether the election timer
    /// should be re-armed.
    pub(crate) fn handle<N>(&mut self, net: &N, envelope: Envelope<L::Command>) -> Result<bool, RaftError>
    where
        N: RaftNetwork<Command = L::Command>,
    {
        let from = envelope.from;
        log::trace!("[{}] <- {}: {:?}", self.id, from, envelope.msg);
        match envelope.msg {
            Msg::Heartbeat { term } => self.heartbeat(from, term),
            Msg::VoteRequest { term, candidate } => self.vote(net, term, candidate),
            Msg::VoteGrant { term } => self.vote_granted(net, from, term),
            Msg::AppendAck { index } => {
                self.append_ack(from, index);
                Ok(false)
            }
            Msg::Append { term, entry } => self.append(net, from, term, entry),
        }
    }

    fn heartbeat(&mut self, from: NodeId, term: Term) -> Result<bool, RaftError> {
        let own = self.term()?;
        if term < own {
            log::debug!("[{}] Ignoring heartbeat from {} with stale term {}", self.id, from, term);
            return Ok(false);
        }
        self.observe_term(term, from)?;
        self.step_down(&format!("{} leads term {}", from, term));
        if self.leader != from {
            log::info!("[{}] Following {} in term {}", self.id, from, term);
        }
        self.leader = from;
        Ok(true)
    }

    /// Voting rule: a newer term resets our vote (and demotes us), an older
    /// one is refused outright, and within a term at most one grant goes out.
    fn vote<N>(&mut self, net: &N, term: Term, candidate: NodeId) -> Result<bool, RaftError>
    where
        N: RaftNetwork<Command = L::Command>,
    {
        if candidate == self.id {
            return Ok(false);
        }
        let own = self.term()?;
        if term < own {
            log::debug!("[{}] Refusing stale vote request from {} (term {} < {})", self.id, candidate, term, own);
            return Ok(false);
        }
        if term > own {
            self.observe_term(term, candidate)?;
            self.step_down(&format!("{} stands for term {}", candidate, term));
        }
        if self.voted {
            return Ok(false);
        }

        log::info!("[{}] Voting for {} in term {}", self.id, candidate, term);
        self.voted = true;
        send_best_effort(net, Destination::Node(candidate), Msg::VoteGrant { term });
        Ok(true)
    }

    fn vote_granted<N>(&mut self, net: &N, from: NodeId, term: Term) -> Result<bool, RaftError>
    where
        N: RaftNetwork<Command = L::Command>,
    {
        let own = self.term()?;
        let counted = match &mut self.role_state {
            RoleState::Candidate { votes } => term == own && votes.insert(from),
            _ => false,
        };
        if counted {
            log::debug!("[{}] Vote from {} in term {}", self.id, from, term);
            self.count_votes(net, own);
        }
        Ok(false)
    }

    fn append_ack(&mut self, from: NodeId, index: LogIndex) {
        if let RoleState::Leader { round: Some(round) } = &mut self.role_state {
            if round.index == index && round.acks.insert(from) {
                log::debug!("[{}] {} acknowledged {}", self.id, from, index);
            }
        }
    }

    fn append<N>(&mut self, net: &N, from: NodeId, term: Term, entry: LogEntry<L::Command>) -> Result<bool, RaftError>
    where
        N: RaftNetwork<Command = L::Command>,
    {
        let index = entry.index;
        if !self.heartbeat(from, term)? {
            return Ok(false);
        }
        self.log.upsert(entry)?;
        send_best_effort(net, Destination::Node(from), Msg::AppendAck { index });
        Ok(true)
    }

    /// Periodic leader no-op.
    pub(crate) fn send_heartbeat<N>(&self, net: &N) -> Result<(), RaftError>
    where
        N: RaftNetwork<Command = L::Command>,
    {
        if self.is_leader() {
            send_best_effort(net, Destination::Broadcast, Msg::Heartbeat { term: self.term()? });
        }
        Ok(())
    }

    fn mint_index(&mut self) -> LogIndex {
        let index = now_nanos()
            .max(self.last_minted + 1)
            .max(self.log.last_index() + 1);
        self.last_minted = index;
        index
    }

    /// Stores a fresh uncommitted entry and opens a round for it.
    /// Returns the term the round belongs to.
    pub(crate) fn begin_round(&mut self, data: L::Command) -> Result<(Term, LogEntry<L::Command>), RaftError> {
        if !self.is_leader() {
            return Err(RaftError::NotLeader { leader: self.leader });
        }
        let term = self.term()?;
        let entry = LogEntry::new(self.mint_index(), data);
        self.log.upsert(entry.clone())?;
        self.role_state = RoleState::Leader {
            round: Some(Round {
                index: entry.index,
                acks: HashSet::new(),
            }),
        };
        log::debug!("[{}] Replicating entry {} in term {}", self.id, entry.index, term);
        Ok((term, entry))
    }

    /// Peers that acknowledged the round's entry, or `None` if the round is
    /// gone because we no longer lead `term`.
    pub(crate) fn round_acks(&self, term: Term) -> Option<HashSet<NodeId>> {
        if self.term().ok()? != term {
            return None;
        }
        match &self.role_state {
            RoleState::Leader { round: Some(round) } => Some(round.acks.clone()),
            _ => None,
        }
    }

    /// Peer acks a round needs, the leader counting as one.
    pub(crate) fn acks_needed(&self) -> usize {
        self.majority() - 1
    }

    /// Closes the round and marks its entry committed.
    pub(crate) fn commit_round(&mut self, term: Term) -> Result<Option<LogEntry<L::Command>>, RaftError> {
        if self.term()? != term {
            return Ok(None);
        }
        let index = match &mut self.role_state {
            RoleState::Leader { round } => match round.take() {
                Some(round) => round.index,
                None => return Ok(None),
            },
            _ => return Ok(None),
        };
        let entry = match self.log.get(index) {
            Some(entry) => entry.clone().committed(),
            None => return Ok(None),
        };
        self.log.upsert(entry.clone())?;
        log::info!("[{}] Committed entry {}", self.id, index);
        Ok(Some(entry))
    }

    pub(crate) fn peers(&self) -> &[NodeId] {
        &self.peers
    }
}
