use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam::channel::RecvTimeoutError;

use crate::config::RaftConfig;
use crate::election_timer::ElectionTimer;
use crate::error::RaftError;
use crate::mailbox::{mailbox, ClientMailbox, ClientResponse, Mailbox};
use crate::raft_log::{Log, LogEntry};
use crate::raft_network::{Destination, Msg, RaftNetwork};
use crate::raft_state::{send_best_effort, RaftRole, RaftState};
use crate::raft_storage::TermStore;
use crate::{LogIndex, NodeId, Term};

// Upper bound on any blocking wait, so both threads notice a stop request.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

type Shared<L> = Arc<Mutex<RaftState<L>>>;

fn lock<L: Log>(state: &Mutex<RaftState<L>>) -> MutexGuard<'_, RaftState<L>> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Takes the node out of the cluster: no role, no known leader, both
/// threads wind down.
fn halt<L: Log>(id: NodeId, state: &Mutex<RaftState<L>>, stop: &AtomicBool, err: &RaftError) {
    log::error!("[{}] {}; node stops participating", id, err);
    lock(state).halt();
    stop.store(true, Ordering::SeqCst);
}

/// Fatal errors halt the node; anything else is logged.
fn fail<L: Log>(id: NodeId, state: &Mutex<RaftState<L>>, stop: &AtomicBool, err: RaftError) {
    if err.is_fatal() {
        halt(id, state, stop, &err);
    } else {
        log::warn!("[{}] {}", id, err);
    }
}

// Node configuration, state & network, before the threads start
pub struct Node<L, N>
where
    L: Log,
    N: RaftNetwork<Command = L::Command>,
{
    id: NodeId,
    config: RaftConfig,
    state: RaftState<L>,
    network: N,
}

impl<L, N> Node<L, N>
where
    L: Log,
    N: RaftNetwork<Command = L::Command>,
{
    pub fn new(config: &RaftConfig, terms: Arc<TermStore>, log: L, network: N) -> Result<Self, RaftError> {
        config.validate()?;
        let id = network.self_id();
        let peers = network.peer_ids().collect();
        let state = RaftState::new(id, peers, terms, log)?;

        Ok(Node {
            id,
            config: config.clone(),
            state,
            network,
        })
    }

    /// Spawns the dispatch thread (inbound messages raced against the
    /// election timer) and the driver thread (client commands, heartbeats
    /// and replication rounds). Both share the node state behind one lock.
    pub fn start(self) -> NodeHandle<L> {
        log::info!("[{}] Start node", self.id);
        let id = self.id;
        let (client, mailbox) = mailbox(id, self.config.mailbox_cap);
        let state = Arc::new(Mutex::new(self.state));
        let network = Arc::new(self.network);
        let stop = Arc::new(AtomicBool::new(false));

        let dispatcher = Dispatcher {
            id,
            state: state.clone(),
            network: network.clone(),
            timer: ElectionTimer::new(self.config.election_wait_min_ms, self.config.election_wait_max_ms),
            stop: stop.clone(),
        };
        let driver = Driver {
            id,
            config: self.config,
            state: state.clone(),
            network,
            mailbox,
            stop: stop.clone(),
        };

        let threads = vec![
            thread::spawn(move || dispatcher.run()),
            thread::spawn(move || driver.run()),
        ];

        NodeHandle {
            id,
            state,
            client,
            stop,
            threads,
        }
    }
}

struct Dispatcher<L: Log, N> {
    id: NodeId,
    state: Shared<L>,
    network: Arc<N>,
    timer: ElectionTimer,
    stop: Arc<AtomicBool>,
}

impl<L, N> Dispatcher<L, N>
where
    L: Log,
    N: RaftNetwork<Command = L::Command>,
{
    fn run(mut self) {
        while !self.stop.load(Ordering::SeqCst) {
            // an expired deadline wins over any backlog in the inbound queue
            let result = if self.timer.expired() {
                let result = lock(&self.state).election_timeout(&*self.network);
                self.timer.reset();
                result
            } else {
                let wait = self.timer.remaining().min(POLL_INTERVAL);
                match self.network.receive_timeout(wait) {
                    Some(envelope) => {
                        let handled = lock(&self.state).handle(&*self.network, envelope);
                        handled.map(|reset| {
                            if reset {
                                self.timer.reset();
                            }
                        })
                    }
                    None => Ok(()),
                }
            };

            if let Err(e) = result {
                fail(self.id, &self.state, &self.stop, e);
            }
        }
        log::debug!("[{}] Dispatch loop exited", self.id);
    }
}

struct Driver<L: Log, N> {
    id: NodeId,
    config: RaftConfig,
    state: Shared<L>,
    network: Arc<N>,
    mailbox: Mailbox<L::Command>,
    stop: Arc<AtomicBool>,
}

impl<L, N> Driver<L, N>
where
    L: Log,
    N: RaftNetwork<Command = L::Command>,
{
    fn stopped(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    fn run(self) {
        let rate = self.config.heartbeat_rate();
        let mut next_heartbeat = Instant::now() + rate;

        while !self.stopped() {
            let wait = next_heartbeat
                .saturating_duration_since(Instant::now())
                .min(POLL_INTERVAL);
            match self.mailbox.inbox.recv_timeout(wait) {
                Ok(command) => self.handle_client(command),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }

            if Instant::now() >= next_heartbeat && !self.stopped() {
                let result = lock(&self.state).send_heartbeat(&*self.network);
                if let Err(e) = result {
                    fail(self.id, &self.state, &self.stop, e);
                }
                next_heartbeat = Instant::now() + rate;
            }
        }
        log::debug!("[{}] Driver loop exited", self.id);
    }

    fn handle_client(&self, command: L::Command) {
        match self.replicate(command) {
            Ok(Some(index)) => self.mailbox.respond(ClientResponse::Accepted { index }),
            Ok(None) => {}
            Err(RaftError::NotLeader { leader }) => {
                log::debug!("[{}] Not leader, redirecting client to {}", self.id, leader);
                self.mailbox.respond(ClientResponse::NotLeader { leader });
            }
            Err(e) => fail(self.id, &self.state, &self.stop, e),
        }
    }

    /// Runs one replication round. `Ok(None)` means the round was abandoned
    /// and the client gets no answer.
    fn replicate(&self, command: L::Command) -> Result<Option<LogIndex>, RaftError> {
        let tick = self.config.replication_tick();
        let (term, entry) = lock(&self.state).begin_round(command)?;
        let index = entry.index;
        send_best_effort(
            &*self.network,
            Destination::Broadcast,
            Msg::Append {
                term,
                entry: entry.clone(),
            },
        );

        loop {
            thread::sleep(tick);
            if self.stopped() {
                return Ok(None);
            }

            let state = lock(&self.state);
            let acks = match state.round_acks(term) {
                Some(acks) => acks,
                None => {
                    log::info!("[{}] Lost leadership of term {}, dropping entry {}", self.id, term, index);
                    return Ok(None);
                }
            };
            if acks.len() >= state.acks_needed() {
                break;
            }
            for &peer in state.peers() {
                let msg = if acks.contains(&peer) {
                    Msg::Heartbeat { term }
                } else {
                    Msg::Append {
                        term,
                        entry: entry.clone(),
                    }
                };
                send_best_effort(&*self.network, Destination::Node(peer), msg);
            }
        }

        let committed = match lock(&self.state).commit_round(term)? {
            Some(entry) => entry,
            None => return Ok(None),
        };
        send_best_effort(
            &*self.network,
            Destination::Broadcast,
            Msg::Append {
                term,
                entry: committed,
            },
        );
        // give the commit a moment to reach followers; it is not acknowledged
        thread::sleep(tick);
        Ok(Some(index))
    }
}

/// Running node: client mailbox plus read-only status queries.
///
/// Dropping the handle stops the node.
pub struct NodeHandle<L: Log> {
    id: NodeId,
    state: Shared<L>,
    client: ClientMailbox<L::Command>,
    stop: Arc<AtomicBool>,
    threads: Vec<JoinHandle<()>>,
}

impl<L: Log> NodeHandle<L> {
    pub fn id(&self) -> NodeId {
        self.id
    }

    /// Queues a command. The answer comes back through `recv_response`.
    pub fn submit(&self, command: L::Command) -> Result<(), RaftError> {
        self.client.submit(command)
    }

    pub fn recv_response(&self, timeout: Duration) -> Result<Option<ClientResponse>, RaftError> {
        self.client.recv_timeout(timeout)
    }

    pub fn try_recv_response(&self) -> Option<ClientResponse> {
        self.client.try_recv()
    }

    pub fn is_leader(&self) -> bool {
        lock(&self.state).is_leader()
    }

    pub fn role(&self) -> RaftRole {
        lock(&self.state).role()
    }

    pub fn term(&self) -> Result<Term, RaftError> {
        lock(&self.state).term()
    }

    /// 0 while no leader is known.
    pub fn leader(&self) -> NodeId {
        lock(&self.state).leader()
    }

    /// Compacts the local log, dropping every entry with index <= `index`.
    /// A failed write halts the node like any other persistence error.
    pub fn discard_up_to(&self, index: LogIndex) -> Result<usize, RaftError> {
        let result = lock(&self.state).discard_up_to(index);
        if let Err(e) = &result {
            if e.is_fatal() {
                halt(self.id, &self.state, &self.stop, e);
            }
        }
        result
    }

    pub fn log_entry(&self, index: LogIndex) -> Option<LogEntry<L::Command>> {
        lock(&self.state).log().get(index).cloned()
    }

    pub fn log_len(&self) -> usize {
        lock(&self.state).log().len()
    }

    pub fn is_running(&self) -> bool {
        !self.stop.load(Ordering::SeqCst)
    }

    pub fn shutdown(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        for t in self.threads.drain(..) {
            if t.join().is_err() {
                log::error!("[{}] Node thread panicked", self.id);
            }
        }
    }
}

impl<L: Log> Drop for NodeHandle<L> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::{lock, Dispatcher, Node, NodeHandle};
    use crate::config::RaftConfig;
    use crate::election_timer::ElectionTimer;
    use crate::error::RaftError;
    use crate::impls::ChanNetwork;
    use crate::mailbox::ClientResponse;
    use crate::raft_log::{FileLog, Log, MemLog};
    use crate::raft_network::{Destination, Envelope, Msg, RaftNetwork};
    use crate::raft_state::{RaftRole, RaftState};
    use crate::raft_storage::TermStore;
    use crate::NodeId;
    use std::fs;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, Mutex};
    use std::thread;
    use std::time::{Duration, Instant};
    use tempfile::tempdir;

    fn config() -> RaftConfig {
        RaftConfig {
            heartbeat_rate_ms: 20,
            election_wait_min_ms: 60,
            election_wait_max_ms: 120,
            mailbox_cap: 4,
        }
    }

    fn wait_until<F: Fn() -> bool>(timeout: Duration, cond: F) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        cond()
    }

    /// Starts node 1 of a two node cluster and grants its first vote request
    /// from node 2, which the test plays by hand.
    fn lead_pair<L: Log<Command = String>>(config: &RaftConfig, log: L) -> (NodeHandle<L>, ChanNetwork<String>) {
        let terms = Arc::new(TermStore::in_memory(vec![1, 2]));
        let (mut networks, _control) = ChanNetwork::cluster(&[1, 2], 64);
        let peer = networks.pop().unwrap();
        let node = Node::new(config, terms, log, networks.pop().unwrap())
            .unwrap()
            .start();

        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline {
            if let Some(envelope) = peer.receive_timeout(Duration::from_millis(20)) {
                if let Msg::VoteRequest { term, .. } = envelope.msg {
                    peer.send(Destination::Node(1), Msg::VoteGrant { term }).unwrap();
                    break;
                }
            }
        }
        assert!(wait_until(Duration::from_secs(1), || node.is_leader()));
        (node, peer)
    }

    /// Always has one more stale ack queued for node 1.
    #[derive(Debug)]
    struct BackloggedNetwork {
        sent: Mutex<Vec<Msg<String>>>,
    }

    impl RaftNetwork for BackloggedNetwork {
        type Command = String;

        fn self_id(&self) -> NodeId {
            1
        }

        fn peer_ids(&self) -> Box<dyn Iterator<Item = NodeId> + '_> {
            Box::new(vec![2, 3].into_iter())
        }

        fn send(&self, _to: Destination, msg: Msg<String>) -> Result<(), RaftError> {
            self.sent.lock().unwrap().push(msg);
            Ok(())
        }

        fn receive_timeout(&self, _timeout: Duration) -> Option<Envelope<String>> {
            Some(Envelope {
                to: Destination::Node(1),
                from: 2,
                msg_id: 0,
                msg: Msg::AppendAck { index: 0 },
            })
        }
    }

    #[test]
    fn single_node_elects_itself_and_commits() {
        let terms = Arc::new(TermStore::in_memory(vec![1]));
        let (mut networks, _control) = ChanNetwork::<String>::cluster(&[1], 8);
        let node = Node::new(&config(), terms, MemLog::new(), networks.remove(0))
            .unwrap()
            .start();

        assert!(wait_until(Duration::from_secs(2), || node.is_leader()));
        assert_eq!(1, node.leader());
        assert!(node.term().unwrap() >= 1);

        node.submit("X".to_string()).unwrap();
        let index = match node.recv_response(Duration::from_secs(2)).unwrap() {
            Some(ClientResponse::Accepted { index }) => index,
            other => panic!("unexpected response {:?}", other),
        };
        assert_eq!(None, node.try_recv_response());
        let entry = node.log_entry(index).unwrap();
        assert!(entry.commit);
        assert_eq!("X", entry.data);

        assert_eq!(1, node.discard_up_to(index).unwrap());
        assert_eq!(0, node.log_len());
    }

    #[test]
    fn rejects_invalid_config() {
        let terms = Arc::new(TermStore::in_memory(vec![1]));
        let (mut networks, _control) = ChanNetwork::<String>::cluster(&[1], 8);
        let mut bad = config();
        bad.election_wait_min_ms = bad.election_wait_max_ms;
        assert!(Node::new(&bad, terms, MemLog::new(), networks.remove(0)).is_err());
    }

    #[test]
    fn stopping_closes_the_mailbox() {
        let terms = Arc::new(TermStore::in_memory(vec![1]));
        let (mut networks, _control) = ChanNetwork::<String>::cluster(&[1], 8);
        let mut node = Node::new(&config(), terms, MemLog::new(), networks.remove(0))
            .unwrap()
            .start();
        node.shutdown();
        assert!(!node.is_running());
        assert!(node.submit("late".to_string()).is_err());
    }

    #[test]
    fn heartbeats_keep_their_rate() {
        // not a multiple of the poll interval, and close to the election window
        let config = RaftConfig {
            heartbeat_rate_ms: 120,
            election_wait_min_ms: 145,
            election_wait_max_ms: 250,
            mailbox_cap: 4,
        };
        let (node, peer) = lead_pair(&config, MemLog::new());

        let mut arrivals = Vec::new();
        let deadline = Instant::now() + Duration::from_secs(3);
        while arrivals.len() < 8 && Instant::now() < deadline {
            if let Some(envelope) = peer.receive_timeout(Duration::from_millis(10)) {
                if let Msg::Heartbeat { .. } = envelope.msg {
                    arrivals.push(Instant::now());
                }
            }
        }
        assert_eq!(8, arrivals.len());

        // the first heartbeat is the one announcing the election
        let gaps: Vec<u128> = arrivals
            .windows(2)
            .skip(1)
            .map(|pair| (pair[1] - pair[0]).as_millis())
            .collect();
        assert!(gaps.iter().all(|&gap| gap < 140), "heartbeat gaps {:?}", gaps);
        assert!(node.is_leader());
    }

    #[test]
    fn election_timer_fires_through_a_backlog() {
        let terms = Arc::new(TermStore::in_memory(vec![1, 2, 3]));
        let state = Arc::new(Mutex::new(
            RaftState::new(1, vec![2, 3], terms, MemLog::new()).unwrap(),
        ));
        let network = Arc::new(BackloggedNetwork {
            sent: Mutex::new(Vec::new()),
        });
        let stop = Arc::new(AtomicBool::new(false));
        let dispatcher = Dispatcher {
            id: 1,
            state: state.clone(),
            network: network.clone(),
            timer: ElectionTimer::new(20, 40),
            stop: stop.clone(),
        };
        let handle = thread::spawn(move || dispatcher.run());

        let started = wait_until(Duration::from_secs(1), || lock(&state).role() == RaftRole::Candidate);
        stop.store(true, Ordering::SeqCst);
        handle.join().unwrap();

        assert!(started);
        let sent = network.sent.lock().unwrap();
        assert!(sent.iter().any(|m| matches!(m, Msg::VoteRequest { candidate: 1, .. })));
    }

    #[test]
    fn write_failure_halts_the_node() {
        let dir = tempdir().unwrap();
        let data = dir.path().join("data");
        let log = FileLog::open(data.join("1.log.json")).unwrap();
        let (mut node, peer) = lead_pair(&config(), log);

        // the log directory cannot be created any more
        fs::write(&data, b"not a directory").unwrap();
        node.submit("X".to_string()).unwrap();

        assert!(wait_until(Duration::from_secs(2), || !node.is_running()));
        assert!(!node.is_leader());
        assert_eq!(RaftRole::Follower, node.role());
        assert_eq!(0, node.leader());
        assert_eq!(None, node.try_recv_response());

        // let in-flight traffic land, then the node must stay silent
        thread::sleep(Duration::from_millis(100));
        while peer.receive_timeout(Duration::from_millis(1)).is_some() {}
        assert!(peer.receive_timeout(Duration::from_millis(300)).is_none());

        node.shutdown();
        assert!(node.submit("Y".to_string()).is_err());
    }

    #[test]
    fn failed_compaction_halts_the_node() {
        let dir = tempdir().unwrap();
        let data = dir.path().join("data");
        let terms = Arc::new(TermStore::in_memory(vec![1]));
        let (mut networks, _control) = ChanNetwork::<String>::cluster(&[1], 8);
        let log = FileLog::open(data.join("1.log.json")).unwrap();
        let node = Node::new(&config(), terms, log, networks.remove(0))
            .unwrap()
            .start();
        assert!(wait_until(Duration::from_secs(2), || node.is_leader()));

        node.submit("X".to_string()).unwrap();
        let index = match node.recv_response(Duration::from_secs(2)).unwrap() {
            Some(ClientResponse::Accepted { index }) => index,
            other => panic!("unexpected response {:?}", other),
        };

        fs::remove_dir_all(&data).unwrap();
        fs::write(&data, b"not a directory").unwrap();

        assert!(node.discard_up_to(index).unwrap_err().is_fatal());
        assert!(!node.is_running());
        assert!(!node.is_leader());
        // memory still matches what is on disk
        assert!(node.log_entry(index).unwrap().commit);
    }
}
