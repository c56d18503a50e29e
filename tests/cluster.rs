//! End-to-end scenarios on an in-process cluster.

use std::collections::HashMap;
use std::path::Path;
use std::thread;
use std::time::{Duration, Instant};

use rsm_raft::{ClientResponse, ClusterConfig, LocalCluster, RaftConfig};
use tempfile::tempdir;

const ELECTION_WAIT: Duration = Duration::from_secs(5);
const RESPONSE_WAIT: Duration = Duration::from_secs(5);

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn config(dir: &Path, members: Vec<u64>) -> ClusterConfig {
    ClusterConfig {
        members,
        data_dir: dir.to_path_buf(),
        chan_cap: 256,
        raft: RaftConfig {
            heartbeat_rate_ms: 30,
            election_wait_min_ms: 150,
            election_wait_max_ms: 300,
            mailbox_cap: 10,
        },
    }
}

fn start(dir: &Path) -> LocalCluster<String> {
    LocalCluster::start(config(dir, vec![1, 2, 3, 4, 5])).unwrap()
}

/// Submits through `leader` and waits for the committed index.
fn replicate(cluster: &LocalCluster<String>, leader: u64, command: &str) -> u64 {
    let node = cluster.node(leader).unwrap();
    node.submit(command.to_string()).unwrap();
    match node.recv_response(RESPONSE_WAIT).unwrap() {
        Some(ClientResponse::Accepted { index }) => index,
        other => panic!("expected acceptance from {}, got {:?}", leader, other),
    }
}

fn wait_until<F: Fn() -> bool>(timeout: Duration, cond: F) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    cond()
}

#[test]
fn five_nodes_elect_one_leader() {
    init_logger();
    let dir = tempdir().unwrap();
    let cluster = start(dir.path());

    let leader = cluster.wait_for_leader(ELECTION_WAIT).expect("no leader elected");
    for node in cluster.nodes() {
        assert_eq!(leader, node.leader(), "node {} follows someone else", node.id());
        assert_eq!(node.id() == leader, node.is_leader());
    }

    // while things settle: terms never go back, and no term has two leaders
    let mut last_terms: HashMap<u64, u64> = HashMap::new();
    let deadline = Instant::now() + Duration::from_millis(600);
    while Instant::now() < deadline {
        let mut leaders_by_term: HashMap<u64, Vec<u64>> = HashMap::new();
        for node in cluster.nodes() {
            let term = node.term().unwrap();
            let last = last_terms.entry(node.id()).or_insert(0);
            assert!(term >= *last, "term of {} went from {} to {}", node.id(), last, term);
            *last = term;
            if node.is_leader() {
                leaders_by_term.entry(term).or_default().push(node.id());
            }
        }
        for (term, leaders) in leaders_by_term {
            assert!(leaders.len() <= 1, "term {} has leaders {:?}", term, leaders);
        }
        thread::sleep(Duration::from_millis(15));
    }
}

#[test]
fn leader_replicates_to_majority() {
    init_logger();
    let dir = tempdir().unwrap();
    let cluster = start(dir.path());
    let leader = cluster.wait_for_leader(ELECTION_WAIT).expect("no leader elected");

    let index = replicate(&cluster, leader, "X");

    let entry = cluster.node(leader).unwrap().log_entry(index).unwrap();
    assert!(entry.commit);
    assert_eq!("X", entry.data);

    let committed_peers = || {
        cluster
            .nodes()
            .iter()
            .filter(|n| n.id() != leader)
            .filter(|n| match n.log_entry(index) {
                Some(e) => e.commit && e.data == "X",
                None => false,
            })
            .count()
    };
    assert!(
        wait_until(Duration::from_secs(2), || committed_peers() >= 2),
        "only {} peers committed {}",
        committed_peers(),
        index
    );
}

#[test]
fn follower_redirects_without_replicating() {
    init_logger();
    let dir = tempdir().unwrap();
    let cluster = start(dir.path());
    let leader = cluster.wait_for_leader(ELECTION_WAIT).expect("no leader elected");

    let follower = cluster.nodes().iter().find(|n| n.id() != leader).unwrap();
    follower.submit("Y".to_string()).unwrap();
    assert_eq!(
        Some(ClientResponse::NotLeader { leader }),
        follower.recv_response(Duration::from_secs(1)).unwrap()
    );

    thread::sleep(Duration::from_millis(100));
    for node in cluster.nodes() {
        assert_eq!(0, node.log_len(), "node {} stored something", node.id());
    }
}

#[test]
fn minority_partition_never_leads() {
    init_logger();
    let dir = tempdir().unwrap();
    let cluster = start(dir.path());
    // cut before the first election timer can fire
    cluster.control().partition(&[&[1, 2], &[3, 4, 5]]);

    let leader = cluster
        .wait_for_leader_among(&[3, 4, 5], ELECTION_WAIT)
        .expect("majority side elected no leader");
    assert!([3, 4, 5].contains(&leader));

    let deadline = Instant::now() + Duration::from_secs(1);
    while Instant::now() < deadline {
        for id in &[1, 2] {
            assert!(!cluster.node(*id).unwrap().is_leader(), "minority node {} leads", id);
        }
        thread::sleep(Duration::from_millis(10));
    }

    // the majority side still commits
    replicate(&cluster, leader, "during partition");

    cluster.control().heal();
    assert!(cluster.wait_for_leader(Duration::from_secs(10)).is_some());
}

#[test]
fn compaction_keeps_later_entries() {
    init_logger();
    let dir = tempdir().unwrap();
    let cluster = start(dir.path());
    let leader = cluster.wait_for_leader(ELECTION_WAIT).expect("no leader elected");

    let first = replicate(&cluster, leader, "a");
    let second = replicate(&cluster, leader, "b");
    assert!(second > first);

    let node = cluster.node(leader).unwrap();
    assert_eq!(1, node.discard_up_to(first).unwrap());
    assert!(node.log_entry(first).is_none());
    let kept = node.log_entry(second).unwrap();
    assert_eq!("b", kept.data);
    assert!(kept.commit);
}

#[test]
fn restart_recovers_terms_and_log() {
    init_logger();
    let dir = tempdir().unwrap();

    let (index, terms_before) = {
        let mut cluster = start(dir.path());
        let leader = cluster.wait_for_leader(ELECTION_WAIT).expect("no leader elected");
        let index = replicate(&cluster, leader, "durable");
        let terms: Vec<u64> = cluster.nodes().iter().map(|n| n.term().unwrap()).collect();
        cluster.shutdown();
        (index, terms)
    };

    let cluster = start(dir.path());
    for (node, before) in cluster.nodes().iter().zip(terms_before) {
        assert!(node.term().unwrap() >= before);
    }
    let copies = cluster
        .nodes()
        .iter()
        .filter(|n| n.log_entry(index).map(|e| e.data == "durable").unwrap_or(false))
        .count();
    assert!(copies >= 3, "entry {} survived on {} nodes", index, copies);
}
