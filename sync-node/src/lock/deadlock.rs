//! Wait-for graph cycle detection: copy-on-simulate the graph with the
//! hypothetical edges a new acquire would add, then DFS with a recursion
//! stack for cycle detection.

use std::collections::{HashMap, HashSet};

use raft_engine::NodeId;

pub type WaitForGraph = HashMap<NodeId, HashSet<NodeId>>;

/// True if `graph` contains a cycle reachable from any node.
pub fn has_cycle(graph: &WaitForGraph) -> bool {
    let mut visited = HashSet::new();
    let mut rec_stack = HashSet::new();
    for node in graph.keys() {
        if !visited.contains(node) && dfs(graph, node, &mut visited, &mut rec_stack) {
            return true;
        }
    }
    false
}

fn dfs(graph: &WaitForGraph, node: &NodeId, visited: &mut HashSet<NodeId>, rec_stack: &mut HashSet<NodeId>) -> bool {
    visited.insert(node.clone());
    rec_stack.insert(node.clone());
    if let Some(neighbors) = graph.get(node) {
        for neighbor in neighbors {
            if !visited.contains(neighbor) {
                if dfs(graph, neighbor, visited, rec_stack) {
                    return true;
                }
            } else if rec_stack.contains(neighbor) {
                return true;
            }
        }
    }
    rec_stack.remove(node);
    false
}

/// Would granting `lock_type` on behalf of `requester`, given the lock's
/// `current_owners`, create a cycle in `graph`? Does not mutate `graph`.
pub fn would_deadlock(graph: &WaitForGraph, requester: &NodeId, current_owners: &[NodeId]) -> bool {
    let mut sim = graph.clone();
    let entry = sim.entry(requester.clone()).or_default();
    for owner in current_owners {
        if owner != requester {
            entry.insert(owner.clone());
        }
    }
    has_cycle(&sim)
}
