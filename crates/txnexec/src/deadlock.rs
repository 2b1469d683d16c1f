//! Deadlock detection using a wait-for graph.
//!
//! Each time a lock request comes back with the lock held by other
//! transactions, the waiter records an edge to every holder:
//!
//! ```text
//! T1 waits for T2:  T1 -> T2
//! T2 waits for T1:  T2 -> T1 (cycle = deadlock)
//! ```
//!
//! The graph only knows about waits observed on this node. Deadlocks
//! spanning transactions coordinated from different nodes are caught by the
//! lock timeout instead.
use std::collections::{BTreeSet, HashMap, HashSet};

use parking_lot::Mutex;
use tablemeta::types::TxnName;

#[derive(Debug, Default)]
pub struct WaitForGraph {
    /// Waiter -> holders it's waiting on.
    edges: Mutex<HashMap<TxnName, BTreeSet<TxnName>>>,
}

impl WaitForGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace what `waiter` is waiting on.
    pub fn set_waiting(&self, waiter: &TxnName, holders: &[TxnName]) {
        let holders: BTreeSet<_> = holders.iter().filter(|h| *h != waiter).cloned().collect();
        let mut edges = self.edges.lock();
        if holders.is_empty() {
            edges.remove(waiter);
        } else {
            edges.insert(waiter.clone(), holders);
        }
    }

    /// `txn` is no longer waiting on anything.
    pub fn clear(&self, txn: &TxnName) {
        self.edges.lock().remove(txn);
    }

    /// Find a cycle passing through `start`, returned as the path starting
    /// and ending at `start`.
    pub fn find_cycle(&self, start: &TxnName) -> Option<Vec<TxnName>> {
        let edges = self.edges.lock();
        let mut visited = HashSet::new();
        let mut path = vec![start.clone()];
        if Self::dfs(&edges, start, start, &mut visited, &mut path) {
            Some(path)
        } else {
            None
        }
    }

    fn dfs(
        edges: &HashMap<TxnName, BTreeSet<TxnName>>,
        start: &TxnName,
        current: &TxnName,
        visited: &mut HashSet<TxnName>,
        path: &mut Vec<TxnName>,
    ) -> bool {
        let Some(next) = edges.get(current) else {
            return false;
        };

        for holder in next {
            if holder == start {
                path.push(holder.clone());
                return true;
            }
            if !visited.insert(holder.clone()) {
                continue;
            }
            path.push(holder.clone());
            if Self::dfs(edges, start, holder, visited, path) {
                return true;
            }
            path.pop();
        }
        false
    }

    /// Number of transactions currently waiting.
    pub fn waiting(&self) -> usize {
        self.edges.lock().len()
    }
}
