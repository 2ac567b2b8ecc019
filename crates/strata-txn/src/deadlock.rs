//! Deadlock detection via wait-for graph.
//!
//! A transaction blocked on a lock adds edges `waiter -> holder` for every
//! transaction holding a conflicting lock. A cycle through the requester
//! means deadlock; the requester is the one that gives up.

use std::collections::{HashMap, HashSet};
use strata_common::TxnId;

/// Wait-for graph. Owned by the lock table and guarded by its mutex.
#[derive(Debug, Default)]
pub struct WaitForGraph {
    /// Adjacency list: waiter -> holders it is blocked on.
    edges: HashMap<TxnId, HashSet<TxnId>>,
}

impl WaitForGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the outgoing edges of `waiter`.
    pub fn set_waits(&mut self, waiter: TxnId, holders: &[TxnId]) {
        let set = self.edges.entry(waiter).or_default();
        set.clear();
        set.extend(holders.iter().copied().filter(|h| *h != waiter));
    }

    /// Drops the edges of a transaction that stopped waiting.
    pub fn remove_waiter(&mut self, waiter: TxnId) {
        self.edges.remove(&waiter);
    }

    /// Drops a finished transaction as waiter and as holder.
    pub fn remove_txn(&mut self, txn_id: TxnId) {
        self.edges.remove(&txn_id);
        for holders in self.edges.values_mut() {
            holders.remove(&txn_id);
        }
        self.edges.retain(|_, holders| !holders.is_empty());
    }

    /// Returns a cycle that passes through `start`, if there is one.
    ///
    /// The cycle is listed starting at `start` in wait order.
    pub fn cycle_through(&self, start: TxnId) -> Option<Vec<TxnId>> {
        let mut visited = HashSet::new();
        let mut path = Vec::new();
        visited.insert(start);
        if Self::dfs(start, start, &self.edges, &mut visited, &mut path) {
            Some(path)
        } else {
            None
        }
    }

    fn dfs(
        node: TxnId,
        target: TxnId,
        edges: &HashMap<TxnId, HashSet<TxnId>>,
        visited: &mut HashSet<TxnId>,
        path: &mut Vec<TxnId>,
    ) -> bool {
        path.push(node);
        if let Some(holders) = edges.get(&node) {
            for &holder in holders {
                if holder == target {
                    return true;
                }
                if visited.insert(holder) && Self::dfs(holder, target, edges, visited, path) {
                    return true;
                }
            }
        }
        path.pop();
        false
    }

    /// Number of edges in the graph.
    pub fn edge_count(&self) -> usize {
        self.edges.values().map(|s| s.len()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_deadlock() {
        let mut wfg = WaitForGraph::new();
        wfg.set_waits(TxnId(1), &[TxnId(2)]);
        wfg.set_waits(TxnId(2), &[TxnId(3)]);
        assert!(wfg.cycle_through(TxnId(1)).is_none());
        assert!(wfg.cycle_through(TxnId(3)).is_none());
        assert_eq!(wfg.edge_count(), 2);
    }

    #[test]
    fn test_simple_deadlock() {
        let mut wfg = WaitForGraph::new();
        wfg.set_waits(TxnId(1), &[TxnId(2)]);
        wfg.set_waits(TxnId(2), &[TxnId(1)]);
        assert_eq!(wfg.cycle_through(TxnId(2)), Some(vec![TxnId(2), TxnId(1)]));
    }

    #[test]
    fn test_three_way_deadlock() {
        let mut wfg = WaitForGraph::new();
        wfg.set_waits(TxnId(1), &[TxnId(2)]);
        wfg.set_waits(TxnId(2), &[TxnId(3)]);
        wfg.set_waits(TxnId(3), &[TxnId(1)]);
        let cycle = wfg.cycle_through(TxnId(3)).unwrap();
        assert_eq!(cycle, vec![TxnId(3), TxnId(1), TxnId(2)]);
    }

    #[test]
    fn test_cycle_not_through_requester() {
        let mut wfg = WaitForGraph::new();
        wfg.set_waits(TxnId(1), &[TxnId(2)]);
        wfg.set_waits(TxnId(2), &[TxnId(1)]);
        // 3 waits on the cycle but is not part of it
        wfg.set_waits(TxnId(3), &[TxnId(1)]);
        assert!(wfg.cycle_through(TxnId(3)).is_none());
    }

    #[test]
    fn test_remove_breaks_cycle() {
        let mut wfg = WaitForGraph::new();
        wfg.set_waits(TxnId(1), &[TxnId(2)]);
        wfg.set_waits(TxnId(2), &[TxnId(1)]);
        wfg.remove_txn(TxnId(1));
        assert!(wfg.cycle_through(TxnId(2)).is_none());
        assert_eq!(wfg.edge_count(), 0);
    }

    #[test]
    fn test_set_waits_replaces_edges() {
        let mut wfg = WaitForGraph::new();
        wfg.set_waits(TxnId(1), &[TxnId(2), TxnId(3)]);
        wfg.set_waits(TxnId(1), &[TxnId(4), TxnId(1)]);
        assert_eq!(wfg.edge_count(), 1);
        wfg.remove_waiter(TxnId(1));
        assert_eq!(wfg.edge_count(), 0);
    }
}
