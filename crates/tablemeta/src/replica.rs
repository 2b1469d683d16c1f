//! Boundary to the storage engine holding a node's copies of tables.
use std::collections::{BTreeSet, HashMap};

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::debug;

use crate::errors::{MetaError, Result};
use crate::types::{TableIdentity, TxnName};

/// Storage for the table copies hosted on one node.
///
/// Statements are applied inside a named transaction and only become
/// durable when that transaction is finished with `commit = true`.
#[async_trait]
pub trait ReplicaStore: Send + Sync {
    /// Apply a fully substituted statement, returning the number of rows
    /// affected.
    async fn apply(&self, txn: &TxnName, statement: &str) -> Result<u64>;

    /// Commit or roll back everything applied under `txn`. Finishing an
    /// unknown transaction is a no-op.
    async fn finish(&self, txn: &TxnName, commit: bool) -> Result<()>;

    /// If this node holds a copy of the table.
    async fn has_table(&self, table: &TableIdentity) -> bool;
}

/// Failure to inject into [`MemoryReplicaStore`] calls.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyFault {
    /// Fails like a broken connection or disk.
    Io,
    /// Fails with a concurrent update.
    ConcurrentUpdate(TableIdentity),
    /// Fails with resource exhaustion.
    Exhausted,
}

#[derive(Debug, Default)]
struct MemoryInner {
    tables: BTreeSet<TableIdentity>,
    pending: HashMap<TxnName, Vec<String>>,
    committed: Vec<String>,
    finished: Vec<(TxnName, bool)>,
    faults: Vec<(String, ApplyFault, Option<usize>)>,
    finish_faults: Vec<ApplyFault>,
}

/// In-memory replica store.
///
/// Keeps applied statements as a log rather than interpreting them.
#[derive(Debug)]
pub struct MemoryReplicaStore {
    node: String,
    inner: Mutex<MemoryInner>,
}

impl MemoryReplicaStore {
    pub fn new(node: impl Into<String>) -> Self {
        MemoryReplicaStore {
            node: node.into(),
            inner: Mutex::new(MemoryInner::default()),
        }
    }

    pub fn add_table(&self, table: TableIdentity) {
        self.inner.lock().tables.insert(table);
    }

    /// Fail applies of statements containing `pattern`.
    ///
    /// `times` limits how many applies fail, `None` fails forever.
    pub fn inject_fault(&self, pattern: impl Into<String>, fault: ApplyFault, times: Option<usize>) {
        self.inner.lock().faults.push((pattern.into(), fault, times));
    }

    /// Fail the next finish call. Queued faults are used in order.
    pub fn inject_finish_fault(&self, fault: ApplyFault) {
        self.inner.lock().finish_faults.push(fault);
    }

    /// Statements durably committed, in commit order.
    pub fn committed(&self) -> Vec<String> {
        self.inner.lock().committed.clone()
    }

    /// Statements applied under a transaction that hasn't finished yet.
    pub fn pending(&self, txn: &TxnName) -> Vec<String> {
        self.inner
            .lock()
            .pending
            .get(txn)
            .cloned()
            .unwrap_or_default()
    }

    /// Every finish call received, in order.
    pub fn finished(&self) -> Vec<(TxnName, bool)> {
        self.inner.lock().finished.clone()
    }

    fn take_fault(inner: &mut MemoryInner, statement: &str) -> Option<ApplyFault> {
        let idx = inner
            .faults
            .iter()
            .position(|(pattern, _, _)| statement.contains(pattern.as_str()))?;
        let (_, fault, times) = &mut inner.faults[idx];
        let fault = fault.clone();
        if let Some(remaining) = times {
            *remaining = remaining.saturating_sub(1);
            if *remaining == 0 {
                inner.faults.remove(idx);
            }
        }
        Some(fault)
    }

    fn fault_error(&self, fault: ApplyFault) -> MetaError {
        match fault {
            ApplyFault::Io => MetaError::ReplicaFailure {
                replica: self.node.clone(),
                message: "i/o error".to_string(),
            },
            ApplyFault::ConcurrentUpdate(table) => MetaError::ConcurrentUpdate { table },
            ApplyFault::Exhausted => MetaError::ResourceExhausted {
                node: self.node.clone(),
            },
        }
    }
}

#[async_trait]
impl ReplicaStore for MemoryReplicaStore {
    async fn apply(&self, txn: &TxnName, statement: &str) -> Result<u64> {
        let mut inner = self.inner.lock();
        if let Some(fault) = Self::take_fault(&mut inner, statement) {
            debug!(node = %self.node, %txn, ?fault, "injected apply failure");
            return Err(self.fault_error(fault));
        }

        inner
            .pending
            .entry(txn.clone())
            .or_default()
            .push(statement.to_string());
        Ok(1)
    }

    async fn finish(&self, txn: &TxnName, commit: bool) -> Result<()> {
        let mut inner = self.inner.lock();
        if !inner.finish_faults.is_empty() {
            let fault = inner.finish_faults.remove(0);
            debug!(node = %self.node, %txn, ?fault, "injected finish failure");
            return Err(self.fault_error(fault));
        }
        inner.finished.push((txn.clone(), commit));
        let applied = inner.pending.remove(txn).unwrap_or_default();
        if commit {
            inner.committed.extend(applied);
        }
        Ok(())
    }

    async fn has_table(&self, table: &TableIdentity) -> bool {
        self.inner.lock().tables.contains(table)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::NodeHandle;

    #[tokio::test]
    async fn commit_and_rollback() {
        let store = MemoryReplicaStore::new("n1");
        let node = NodeHandle::new("n1");
        let (t1, t2) = (TxnName::new(&node, 1, 1), TxnName::new(&node, 1, 2));

        store.apply(&t1, "insert 1").await.unwrap();
        store.apply(&t2, "insert 2").await.unwrap();
        assert_eq!(vec!["insert 1".to_string()], store.pending(&t1));

        store.finish(&t1, true).await.unwrap();
        store.finish(&t2, false).await.unwrap();

        assert_eq!(vec!["insert 1".to_string()], store.committed());
        assert!(store.pending(&t2).is_empty());
        assert_eq!(vec![(t1, true), (t2, false)], store.finished());
    }

    #[tokio::test]
    async fn faults_run_out() {
        let store = MemoryReplicaStore::new("n1");
        let txn = TxnName::new(&NodeHandle::new("n1"), 1, 1);
        store.inject_fault("orders", ApplyFault::Io, Some(1));

        assert!(matches!(
            store.apply(&txn, "update orders").await,
            Err(MetaError::ReplicaFailure { .. })
        ));
        assert_eq!(1, store.apply(&txn, "update orders").await.unwrap());
        assert_eq!(1, store.apply(&txn, "update items").await.unwrap());
    }
}
