//! Lock acquisition for a transaction.
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use tablemeta::types::{LockClass, LockGrant, LockResponse, NodeHandle, TableIdentity, TxnName};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::deadlock::WaitForGraph;
use crate::directory::LocationDirectory;
use crate::errors::{ExecError, Result};

/// State of one unit of work within a session.
///
/// Owned by the session that created it and never shared.
#[derive(Debug)]
pub struct TransactionContext {
    name: TxnName,
    auto_commit: bool,
    grants: HashMap<TableIdentity, LockGrant>,
    /// Nodes that applied at least one statement of this transaction.
    ledger: BTreeSet<NodeHandle>,
    acquired: u64,
    released: u64,
}

impl TransactionContext {
    pub fn new(name: TxnName, auto_commit: bool) -> Self {
        TransactionContext {
            name,
            auto_commit,
            grants: HashMap::new(),
            ledger: BTreeSet::new(),
            acquired: 0,
            released: 0,
        }
    }

    pub fn name(&self) -> &TxnName {
        &self.name
    }

    pub fn auto_commit(&self) -> bool {
        self.auto_commit
    }

    pub fn set_auto_commit(&mut self, auto_commit: bool) {
        self.auto_commit = auto_commit;
    }

    pub fn grant(&self, table: &TableIdentity) -> Option<&LockGrant> {
        self.grants.get(table)
    }

    pub fn grants(&self) -> impl Iterator<Item = &LockGrant> {
        self.grants.values()
    }

    /// Record that a node applied a statement under this transaction.
    pub fn record_participant(&mut self, node: NodeHandle) {
        self.ledger.insert(node);
    }

    pub fn participants(&self) -> &BTreeSet<NodeHandle> {
        &self.ledger
    }

    /// Number of distinct grants acquired so far.
    pub fn acquired(&self) -> u64 {
        self.acquired
    }

    pub fn released(&self) -> u64 {
        self.released
    }

    /// If the transaction holds no locks and touched no node.
    pub fn is_empty(&self) -> bool {
        self.grants.is_empty() && self.ledger.is_empty()
    }
}

/// Budget for a single acquisition.
#[derive(Debug, Clone, Copy)]
pub struct LockWait {
    pub timeout: Duration,
    pub check_interval: Duration,
    /// Allow linking to a remote replica if the table has no manager.
    pub allow_remote_search: bool,
}

/// Acquires and releases table locks on behalf of transactions.
#[derive(Debug)]
pub struct LockBroker {
    directory: Arc<LocationDirectory>,
    waits: Arc<WaitForGraph>,
}

impl LockBroker {
    pub fn new(directory: Arc<LocationDirectory>, waits: Arc<WaitForGraph>) -> Self {
        LockBroker { directory, waits }
    }

    /// Acquire at least `class` on a table for the transaction.
    ///
    /// A grant already held with a sufficient class is returned without a
    /// new request. Otherwise the owning manager is polled every
    /// `check_interval` until the lock is granted, a deadlock involving the
    /// transaction is found, or `timeout` elapses.
    pub async fn acquire(
        &self,
        table: &TableIdentity,
        class: LockClass,
        ctx: &mut TransactionContext,
        wait: LockWait,
        cancel: &CancellationToken,
    ) -> Result<LockGrant> {
        if let Some(grant) = ctx.grants.get(table) {
            if grant.class.satisfies(class) {
                return Ok(grant.clone());
            }
        }

        let txn = ctx.name.clone();
        let start = Instant::now();
        let deadline = start + wait.timeout;

        let result = loop {
            let resp = match self
                .directory
                .lock_proxy(table, class, &txn, wait.allow_remote_search)
                .await
            {
                Ok(resp) => resp,
                Err(e) => break Err(e),
            };

            match resp {
                LockResponse::Granted(grant) => break Ok(grant),
                LockResponse::Waiting { holders } => {
                    self.waits.set_waiting(&txn, &holders);
                    if let Some(cycle) = self.waits.find_cycle(&txn) {
                        warn!(%table, %txn, ?cycle, "deadlock detected");
                        break Err(ExecError::Deadlock {
                            table: table.clone(),
                            cycle,
                        });
                    }
                }
                LockResponse::Migrating | LockResponse::Moved => {
                    debug!(%table, %txn, "manager migrating, waiting");
                }
            }

            let now = Instant::now();
            if now >= deadline {
                break Err(ExecError::LockTimeout {
                    table: table.clone(),
                    waited: now - start,
                });
            }

            let nap = wait.check_interval.min(deadline - now);
            let cancelled = tokio::select! {
                _ = tokio::time::sleep(nap) => false,
                _ = cancel.cancelled() => true,
            };
            if cancelled {
                break Err(ExecError::Cancelled);
            }
        };

        self.waits.clear(&txn);
        let grant = result?;
        debug!(%table, %txn, class = %grant.class, waited = ?start.elapsed(), "acquired lock");
        if ctx.grants.insert(table.clone(), grant.clone()).is_none() {
            ctx.acquired += 1;
        }
        Ok(grant)
    }

    /// Release every grant held by the transaction.
    ///
    /// Each grant is released exactly once. Failing to reach a manager is
    /// logged, the lock state went with the manager.
    pub async fn release_all(&self, ctx: &mut TransactionContext, committed: bool) {
        let txn = ctx.name.clone();
        for (table, _grant) in ctx.grants.drain() {
            if let Err(e) = self.directory.release(&table, &txn, committed).await {
                warn!(%table, %txn, %e, "failed to release lock");
            }
            ctx.released += 1;
        }
        self.waits.clear(&txn);
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use tablemeta::local::{InProcessTransport, SharedLocator, start_inprocess_node};
    use tablemeta::node::NodeServices;
    use tablemeta::types::{ManagerRecord, ManagerState};

    use super::*;

    fn broker(node: &Arc<NodeServices>, transport: &InProcessTransport) -> LockBroker {
        let directory = Arc::new(LocationDirectory::new(
            node.clone(),
            Arc::new(transport.clone()),
            Arc::new(SharedLocator::new(node.handle().clone())),
            false,
        ));
        LockBroker::new(directory, Arc::new(WaitForGraph::new()))
    }

    fn wait(timeout_ms: u64, interval_ms: u64) -> LockWait {
        LockWait {
            timeout: Duration::from_millis(timeout_ms),
            check_interval: Duration::from_millis(interval_ms),
            allow_remote_search: false,
        }
    }

    fn local_table(node: &Arc<NodeServices>, name: &str) -> TableIdentity {
        let table = TableIdentity::new("public", name);
        let replicas: BTreeSet<_> = [node.handle().clone()].into_iter().collect();
        node.host_manager_from_state(ManagerState::fresh(table.clone(), replicas.clone()));
        node.system_table()
            .unwrap()
            .register_table(ManagerRecord::new(table.clone(), node.handle().clone(), replicas))
            .unwrap();
        table
    }

    #[tokio::test]
    async fn sufficient_grant_reused() {
        logutil::init_test();
        let transport = InProcessTransport::new();
        let (n1, _) = start_inprocess_node(&transport, "n1", true);
        let table = local_table(&n1, "t");
        let broker = broker(&n1, &transport);
        let cancel = CancellationToken::new();

        let mut ctx = TransactionContext::new(TxnName::new(n1.handle(), 1, 1), true);
        let g1 = broker
            .acquire(&table, LockClass::Write, &mut ctx, wait(100, 10), &cancel)
            .await
            .unwrap();
        let g2 = broker
            .acquire(&table, LockClass::Read, &mut ctx, wait(100, 10), &cancel)
            .await
            .unwrap();
        assert_eq!(g1, g2);
        assert_eq!(LockClass::Write, g2.class);
        assert_eq!(1, ctx.acquired());
        assert_eq!(1, ctx.grants().count());
        assert_eq!(Some(&g1), ctx.grant(&table));

        broker.release_all(&mut ctx, true).await;
        assert_eq!(ctx.acquired(), ctx.released());
        assert!(ctx.is_empty());
        assert!(n1.manager(&table).unwrap().holders().is_empty());
    }

    #[tokio::test]
    async fn times_out_while_held() {
        logutil::init_test();
        let transport = InProcessTransport::new();
        let (n1, _) = start_inprocess_node(&transport, "n1", true);
        let table = local_table(&n1, "t");
        let broker = broker(&n1, &transport);
        let cancel = CancellationToken::new();

        let mut holder = TransactionContext::new(TxnName::new(n1.handle(), 1, 1), false);
        broker
            .acquire(&table, LockClass::Write, &mut holder, wait(100, 10), &cancel)
            .await
            .unwrap();

        let mut waiter = TransactionContext::new(TxnName::new(n1.handle(), 2, 1), false);
        let err = broker
            .acquire(&table, LockClass::Read, &mut waiter, wait(50, 20), &cancel)
            .await
            .unwrap_err();
        match err {
            ExecError::LockTimeout { waited, .. } => assert!(waited >= Duration::from_millis(50)),
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(0, waiter.acquired());
    }

    #[tokio::test]
    async fn cancelled_while_waiting() {
        logutil::init_test();
        let transport = InProcessTransport::new();
        let (n1, _) = start_inprocess_node(&transport, "n1", true);
        let table = local_table(&n1, "t");
        let broker = broker(&n1, &transport);

        let mut holder = TransactionContext::new(TxnName::new(n1.handle(), 1, 1), false);
        broker
            .acquire(
                &table,
                LockClass::Write,
                &mut holder,
                wait(100, 10),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        let cancel = CancellationToken::new();
        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            canceller.cancel();
        });

        let mut waiter = TransactionContext::new(TxnName::new(n1.handle(), 2, 1), false);
        let err = broker
            .acquire(&table, LockClass::Write, &mut waiter, wait(5_000, 1_000), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, ExecError::Cancelled));
    }
}
