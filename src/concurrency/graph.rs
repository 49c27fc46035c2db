//! Wait-for graph for deadlock detection
//!
//! Nodes are client identities; an edge `A -> B` means "A is waiting on a lock
//! held (or queued ahead) by B". Only identifiers are stored, never references
//! to the transactions themselves.
//!
//! ```text
//! T1 waits for T2:  T1 -> T2
//! T2 waits for T3:  T2 -> T3
//! T3 waits for T1:  T3 -> T1   (cycle = deadlock)
//! ```
//!
//! The graph carries no lock of its own; the transaction manager mutates it
//! under its graph mutex.

use std::collections::{HashMap, HashSet};

use crate::types::ClientId;

/// DFS marking
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Color {
    /// On the current DFS path
    InProgress,
    /// Fully explored, no cycle through it
    Done,
}

#[derive(Debug, Default)]
pub struct WaitForGraph {
    /// waiter -> holders it waits on
    edges: HashMap<ClientId, HashSet<ClientId>>,
}

impl WaitForGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `waiter -> holder`. Returns false if the edge was already present.
    pub fn add_edge(&mut self, waiter: ClientId, holder: ClientId) -> bool {
        self.edges.entry(waiter).or_default().insert(holder)
    }

    pub fn remove_edge(&mut self, waiter: ClientId, holder: ClientId) {
        if let Some(holders) = self.edges.get_mut(&waiter) {
            holders.remove(&holder);
            if holders.is_empty() {
                self.edges.remove(&waiter);
            }
        }
    }

    /// Drops every outgoing edge of `waiter` (its wait has been resolved).
    pub fn clear_waits(&mut self, waiter: ClientId) {
        self.edges.remove(&waiter);
    }

    /// Drops `node` and every edge touching it.
    pub fn remove_node(&mut self, node: ClientId) {
        self.edges.remove(&node);
        self.edges.retain(|_, holders| {
            holders.remove(&node);
            !holders.is_empty()
        });
    }

    pub fn has_edge(&self, waiter: ClientId, holder: ClientId) -> bool {
        self.edges
            .get(&waiter)
            .map_or(false, |holders| holders.contains(&holder))
    }

    /// Clients `waiter` is waiting on
    pub fn edges_from(&self, waiter: ClientId) -> Vec<ClientId> {
        self.edges
            .get(&waiter)
            .map(|holders| holders.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn edge_count(&self) -> usize {
        self.edges.values().map(HashSet::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.edges.is_empty()
    }

    /// Whether a cycle is reachable from `start`.
    ///
    /// Only the part of the graph reachable from `start` is explored, so the
    /// cost tracks the neighborhood of the edge just added.
    pub fn detect_cycle_from(&self, start: ClientId) -> bool {
        let mut colors = HashMap::new();
        self.dfs_finds_cycle(start, &mut colors)
    }

    /// Whether any cycle exists anywhere in the graph.
    pub fn detect_cycle(&self) -> bool {
        let mut colors = HashMap::new();
        self.edges
            .keys()
            .any(|&node| !colors.contains_key(&node) && self.dfs_finds_cycle(node, &mut colors))
    }

    /// Iterative three-color DFS. Unvisited nodes are absent from `colors`.
    fn dfs_finds_cycle(&self, start: ClientId, colors: &mut HashMap<ClientId, Color>) -> bool {
        let mut stack: Vec<(ClientId, Vec<ClientId>)> = vec![(start, self.edges_from(start))];
        colors.insert(start, Color::InProgress);

        while let Some((node, pending)) = stack.last_mut() {
            match pending.pop() {
                Some(next) => match colors.get(&next) {
                    Some(Color::InProgress) => return true,
                    Some(Color::Done) => {}
                    None => {
                        colors.insert(next, Color::InProgress);
                        let successors = self.edges_from(next);
                        stack.push((next, successors));
                    }
                },
                None => {
                    colors.insert(*node, Color::Done);
                    stack.pop();
                }
            }
        }

        false
    }
}
