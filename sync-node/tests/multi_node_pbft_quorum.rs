//! Drives PBFT consensus across four real, independently-bound HTTP
//! servers on distinct loopback addresses (127.0.0.1..127.0.0.4 all route
//! to loopback, giving each node a genuinely distinct hostname without
//! needing DNS or `/etc/hosts`). This exercises an actual 3-of-4 commit
//! quorum and Byzantine isolation through real peer exchange, rather than
//! single-process simulation.

use std::net::{SocketAddr, TcpListener as StdTcpListener};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use sync_node::config::NodeConfig;
use sync_node::http;
use sync_node::orchestrator::NodeOrchestrator;

const HOSTS: [&str; 4] = ["127.0.0.1", "127.0.0.2", "127.0.0.3", "127.0.0.4"];

fn all_node_urls(port: u16) -> Vec<String> {
    HOSTS.iter().map(|h| format!("http://{h}:{port}")).collect()
}

fn node_config(index: usize, port: u16) -> NodeConfig {
    let all_nodes = all_node_urls(port);
    let peers = all_nodes.iter().enumerate().filter(|(i, _)| *i != index).map(|(_, u)| u.clone()).collect();
    NodeConfig {
        port,
        node_id: HOSTS[index].to_string(),
        all_nodes,
        peers,
        redis_host: "redis".to_string(),
        redis_port: 6379,
        raft: raft_engine::Config::default(),
        pbft_byzantine_threshold: 3,
        rpc_deadline: Duration::from_millis(500),
        broadcast_deadline: Duration::from_millis(300),
        settling_delay: Duration::from_millis(10),
    }
}

/// Binds all four nodes before returning, so there is no race between a
/// node accepting its socket and the test sending its first request.
async fn spawn_cluster(port: u16) -> Vec<Arc<NodeOrchestrator>> {
    let mut nodes = Vec::with_capacity(HOSTS.len());
    for i in 0..HOSTS.len() {
        let addr: SocketAddr = format!("{}:{port}", HOSTS[i]).parse().expect("valid loopback address");
        let listener = StdTcpListener::bind(addr).expect("bind loopback alias (127.0.0.0/8 is all loopback on Linux)");
        let node = Arc::new(NodeOrchestrator::new(node_config(i, port)));
        let app = http::router(node.clone());
        let server = axum::Server::from_tcp(listener).expect("from_tcp").serve(app.into_make_service());
        tokio::spawn(server);
        nodes.push(node);
    }
    nodes
}

async fn status_of(host: &str, port: u16) -> Value {
    reqwest::get(format!("http://{host}:{port}/pbft/status")).await.unwrap().json().await.unwrap()
}

async fn wait_for_execution(host: &str, port: u16, sequence: u64) {
    for _ in 0..30 {
        let status = status_of(host, port).await;
        if status["last_executed"].as_u64().unwrap_or(0) >= sequence {
            return;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    panic!("node {host} never executed sequence {sequence}");
}

#[tokio::test]
async fn four_node_cluster_reaches_commit_quorum_via_real_peer_exchange() {
    let port = 19300;
    let _nodes = spawn_cluster(port).await;
    let client = reqwest::Client::new();

    let resp: Value = client
        .post(format!("http://{}:{port}/pbft/request", HOSTS[0]))
        .json(&json!({ "op": "transfer", "from": "A", "to": "B", "amount": 100 }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(resp["status"], "consensus_started");
    let sequence = resp["sequence"].as_u64().unwrap();

    for host in HOSTS {
        wait_for_execution(host, port, sequence).await;
        let status = status_of(host, port).await;
        assert_eq!(status["executed_count"].as_u64().unwrap(), 1);
        assert_eq!(status["last_executed"].as_u64().unwrap(), sequence);
    }
}

#[tokio::test]
async fn repeated_equivocation_from_primary_is_isolated_without_blocking_quorum() {
    let port = 19301;
    let _nodes = spawn_cluster(port).await;
    let client = reqwest::Client::new();

    // A legitimate first round, so every honest node's pre_prepare_log has
    // a real digest for the primary to equivocate against below.
    let resp: Value = client
        .post(format!("http://{}:{port}/pbft/request", HOSTS[0]))
        .json(&json!({ "op": "noop", "n": 1 }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let first_sequence = resp["sequence"].as_u64().unwrap();
    wait_for_execution(HOSTS[1], port, first_sequence).await;

    // The primary equivocates three times (a prepare with a digest that
    // doesn't match its own stored pre-prepare); the byzantine threshold
    // is 3, so every honest peer should cross it and mark the primary.
    for _ in 0..3 {
        let _: Value = client
            .post(format!("http://{}:{port}/pbft/simulate-byzantine?behavior_type=conflicting_prepare", HOSTS[0]))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
    }

    for honest in &HOSTS[1..] {
        let status = status_of(honest, port).await;
        let byzantine_nodes: Vec<String> = serde_json::from_value(status["byzantine_nodes"].clone()).unwrap();
        assert!(
            byzantine_nodes.contains(&HOSTS[0].to_string()),
            "{honest} did not mark the equivocating primary byzantine: {status}"
        );
    }

    // A second round still reaches quorum: the three honest replicas' own
    // prepares are enough (quorum_size == 3 for n=4, f=1), and the
    // isolated primary's prepare is silently dropped everywhere, never
    // counted toward any quorum.
    let resp2: Value = client
        .post(format!("http://{}:{port}/pbft/request", HOSTS[0]))
        .json(&json!({ "op": "noop", "n": 2 }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let second_sequence = resp2["sequence"].as_u64().unwrap();
    for honest in &HOSTS[1..] {
        wait_for_execution(honest, port, second_sequence).await;
    }
}
