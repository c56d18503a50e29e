use env_logger;
use log::info;
use rsm_raft::{ClientResponse, ClusterConfig, LocalCluster, RaftError};
use std::env;
use std::error::Error;
use std::io;
use std::io::BufRead;
use std::process;
use std::time::Duration;

const RESPONSE_WAIT: Duration = Duration::from_secs(5);
const ELECTION_WAIT: Duration = Duration::from_secs(5);

fn load_config() -> Result<ClusterConfig, RaftError> {
    match env::args().nth(1) {
        Some(path) => ClusterConfig::load(path),
        None => {
            let mut config = ClusterConfig::default();
            config.data_dir = env::temp_dir().join(format!("rsm-raft-{}", process::id()));
            Ok(config)
        }
    }
}

fn submit(cluster: &LocalCluster<String>, command: &str) -> Result<(), RaftError> {
    let leader = cluster.leaders().first().copied();
    let target = leader.unwrap_or(cluster.config().members[0]);
    let node = cluster.node(target).ok_or(RaftError::UnknownNode(target))?;

    info!("Send command to node {}", target);
    node.submit(command.to_owned())?;
    match node.recv_response(RESPONSE_WAIT)? {
        Some(ClientResponse::Accepted { index }) => println!("Appended: {}", index),
        Some(ClientResponse::NotLeader { leader }) => println!("Error: Leader = {}", leader),
        None => println!("No response from node {} (leadership changed?)", target),
    }
    Ok(())
}

fn status(cluster: &LocalCluster<String>) {
    for node in cluster.nodes() {
        let term = node
            .term()
            .map(|t| t.to_string())
            .unwrap_or_else(|e| e.to_string());
        println!(
            "node {}: {:?} term={} leader={} log={}",
            node.id(),
            node.role(),
            term,
            node.leader(),
            node.log_len()
        );
    }
}

fn discard(cluster: &LocalCluster<String>, args: &str) -> Result<(), RaftError> {
    let mut parts = args.split_whitespace().map(str::parse::<u64>);
    match (parts.next(), parts.next()) {
        (Some(Ok(id)), Some(Ok(index))) => {
            let node = cluster.node(id).ok_or(RaftError::UnknownNode(id))?;
            println!("Discarded {} entries", node.discard_up_to(index)?);
        }
        _ => println!("usage: DISCARD <node> <index>"),
    }
    Ok(())
}

fn run() -> Result<(), Box<dyn Error>> {
    let config = load_config()?;
    let mut cluster: LocalCluster<String> = LocalCluster::start(config)?;

    match cluster.wait_for_leader(ELECTION_WAIT) {
        Some(leader) => println!("Leader elected: {}", leader),
        None => println!("No leader yet"),
    }

    let mut line = String::new();
    let stdin = io::stdin();
    let mut reader = io::BufReader::new(stdin);
    loop {
        line.clear();
        let read = reader.read_line(&mut line)?;
        let input = line.trim();
        if read == 0 || input == "EXIT" {
            break;
        }

        let (verb, rest) = match input.find(' ') {
            Some(at) => (&input[..at], input[at + 1..].trim()),
            None => (input, ""),
        };
        let result = match verb {
            "SUBMIT" if !rest.is_empty() => submit(&cluster, rest),
            "STATUS" => {
                status(&cluster);
                Ok(())
            }
            "DISCARD" => discard(&cluster, rest),
            "" => Ok(()),
            _ => {
                println!("commands: SUBMIT <text> | STATUS | DISCARD <node> <index> | EXIT");
                Ok(())
            }
        };
        if let Err(e) = result {
            println!("Error: {}", e);
        }
    }

    cluster.shutdown();
    Ok(())
}

fn main() {
    env_logger::init();
    if let Err(e) = run() {
        eprintln!("rsm-raft: {}", e);
        process::exit(1);
    }
}
