//! Dependency-graph cycle detection.
//!
//! Dependencies are modeled as an external edge table, never as object
//! pointers. Cycle checks run at write time: before inserting the edge
//! `car -> blocked_by`, walk depth-first from `blocked_by` along existing
//! edges; if `car` is reachable, the insert would close a loop.

use std::collections::{HashMap, HashSet};

/// Would adding `car -> blocked_by` create a cycle in `edges`?
///
/// `edges` are `(car_id, blocked_by)` pairs restricted to active
/// (non-cancelled) cars; the caller applies that restriction when loading.
pub fn would_create_cycle(edges: &[(String, String)], car: &str, blocked_by: &str) -> bool {
    if car == blocked_by {
        return true;
    }

    let mut adjacency: HashMap<&str, Vec<&str>> = HashMap::new();
    for (from, to) in edges {
        adjacency.entry(from.as_str()).or_default().push(to.as_str());
    }

    let mut visited: HashSet<&str> = HashSet::new();
    let mut stack = vec![blocked_by];
    while let Some(node) = stack.pop() {
        if node == car {
            return true;
        }
        if !visited.insert(node) {
            continue;
        }
        if let Some(next) = adjacency.get(node) {
            stack.extend(next.iter().copied());
        }
    }
    false
}
