mod fixtures;

use std::time::Duration;

use fixtures::{build_cluster, TestCommand};
use raft_engine::Role;

/// After the leader appends an entry, every follower eventually has it in
/// its log and applies it via the commit monitor.
#[tokio::test]
async fn log_replicates_and_applies_to_all_followers() {
    let (rafts, logs) = build_cluster(3).await;
    for raft in &rafts {
        raft.activate().await;
        tokio::time::sleep(Duration::from_millis(30)).await;
    }
    tokio::time::sleep(Duration::from_millis(500)).await;

    let leader_idx = futures::future::join_all(rafts.iter().map(|r| r.role()))
        .await
        .iter()
        .position(|r| *r == Role::Leader)
        .expect("a leader must have been elected");

    assert!(rafts[leader_idx].submit(TestCommand(7)).await);

    tokio::time::sleep(Duration::from_millis(400)).await;

    for raft in &rafts {
        assert_eq!(raft.log_len().await, 1);
        assert_eq!(raft.last_applied().await, 1);
    }
    for log in &logs {
        assert_eq!(log.lock().await.as_slice(), &[TestCommand(7)]);
    }
}

/// Submitting at a non-leader is rejected immediately (not forwarded — that
/// is the Node Orchestrator's job) and the log is left untouched.
#[tokio::test]
async fn submit_at_non_leader_returns_false() {
    let (rafts, _logs) = build_cluster(3).await;
    // No activation: every node stays a pristine Follower.
    assert!(!rafts[0].submit(TestCommand(1)).await);
    assert_eq!(rafts[0].log_len().await, 0);
}
