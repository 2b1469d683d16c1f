//! Sends mutations to every replica of a table.
//!
//! Two phases with this node coordinating. Phase one applies the statement
//! on each replica in turn and stops at the first failure. Phase two
//! finishes the transaction on every participant, committing only if
//! phase one succeeded everywhere. Phase two for a successful statement
//! runs when the enclosing transaction completes.
use std::sync::Arc;

use tablemeta::errors::MetaError;
use tablemeta::node::NodeServices;
use tablemeta::rpc::Transport;
use tablemeta::types::{LockGrant, NodeHandle, TxnName};
use tracing::{Instrument, debug, debug_span, warn};

use crate::errors::{ExecError, Result};

/// Result of applying a statement on one replica.
#[derive(Debug)]
pub struct ReplicaResult {
    pub replica: NodeHandle,
    pub result: Result<u64, MetaError>,
}

/// Aggregate result of propagating one statement.
#[derive(Debug)]
pub struct PropagationOutcome {
    pub success: bool,
    /// One entry per replica contacted, in order. Replicas after the first
    /// failure aren't contacted.
    pub results: Vec<ReplicaResult>,
    /// Rows affected, zero if the statement was rolled back.
    pub update_count: u64,
    /// Update sequence number of the table once the transaction commits.
    pub update_id: u64,
}

impl PropagationOutcome {
    /// The first replica failure, if any.
    pub fn failure(&self) -> Option<(&NodeHandle, &MetaError)> {
        self.results
            .iter()
            .find_map(|r| r.result.as_ref().err().map(|e| (&r.replica, e)))
    }

    /// Convert a failed outcome to the error surfaced to the caller.
    pub fn into_result(self) -> Result<PropagationOutcome> {
        let failure = self.failure().map(|(replica, err)| replica_error(replica, err));
        match failure {
            Some(err) => Err(err),
            None => Ok(self),
        }
    }
}

pub struct ReplicaPropagator {
    local: Arc<NodeServices>,
    transport: Arc<dyn Transport>,
}

impl std::fmt::Debug for ReplicaPropagator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicaPropagator")
            .field("local", self.local.handle())
            .finish_non_exhaustive()
    }
}

impl ReplicaPropagator {
    pub fn new(local: Arc<NodeServices>, transport: Arc<dyn Transport>) -> Self {
        ReplicaPropagator { local, transport }
    }

    /// Apply a fully substituted statement on every replica of the grant.
    ///
    /// Any failure, including not being able to reach a replica, rolls the
    /// transaction back on every replica of the grant. Nothing is retried.
    pub async fn execute(
        &self,
        statement: &str,
        txn: &TxnName,
        grant: &LockGrant,
    ) -> PropagationOutcome {
        let span = debug_span!("propagate", table = %grant.table, %txn);
        async {
            let mut results = Vec::with_capacity(grant.replicas.len());
            let mut failed = false;

            for replica in &grant.replicas {
                let result = self.apply_at(replica, txn, statement).await;
                if let Err(e) = &result {
                    warn!(%replica, %e, "replica failed to apply statement");
                    failed = true;
                }
                results.push(ReplicaResult {
                    replica: replica.clone(),
                    result,
                });
                if failed {
                    break;
                }
            }

            if failed {
                self.finish(&grant.replicas, txn, false).await.ok();
                return PropagationOutcome {
                    success: false,
                    results,
                    update_count: 0,
                    update_id: grant.update_id,
                };
            }

            let update_count = results
                .first()
                .and_then(|r| r.result.as_ref().ok().copied())
                .unwrap_or(0);
            debug!(replicas = results.len(), update_count, "statement applied on all replicas");
            PropagationOutcome {
                success: true,
                results,
                update_count,
                update_id: grant.update_id + 1,
            }
        }
        .instrument(span)
        .await
    }

    async fn apply_at(
        &self,
        replica: &NodeHandle,
        txn: &TxnName,
        statement: &str,
    ) -> Result<u64, MetaError> {
        if replica == self.local.handle() {
            return self.local.store().apply(txn, statement).await;
        }
        let client = self.transport.connect(replica).await?;
        client.apply(txn, statement).await
    }

    /// Send the outcome of a transaction to every participant.
    ///
    /// Every participant is contacted even if some fail. The first failure
    /// is returned.
    pub async fn finish<'a>(
        &self,
        participants: impl IntoIterator<Item = &'a NodeHandle>,
        txn: &TxnName,
        commit: bool,
    ) -> Result<()> {
        let mut first_err = None;
        for node in participants {
            let result = if node == self.local.handle() {
                self.local.store().finish(txn, commit).await
            } else {
                match self.transport.connect(node).await {
                    Ok(client) => client.finish_transaction(txn, commit).await,
                    Err(e) => Err(e),
                }
            };

            if let Err(e) = result {
                warn!(%node, %txn, commit, %e, "failed to finish transaction on replica");
                if first_err.is_none() {
                    first_err = Some(replica_error(node, &e));
                }
            }
        }

        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

fn replica_error(replica: &NodeHandle, err: &MetaError) -> ExecError {
    match err {
        MetaError::ConcurrentUpdate { table } => ExecError::ConcurrentUpdate {
            table: table.clone(),
        },
        MetaError::ResourceExhausted { .. } => ExecError::OutOfMemory,
        err => ExecError::ReplicaFailure {
            replica: replica.to_string(),
            message: err.to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use tablemeta::local::{InProcessTransport, start_inprocess_node};
    use tablemeta::replica::{ApplyFault, MemoryReplicaStore};
    use tablemeta::types::{LockClass, TableIdentity};

    use super::*;

    struct Cluster {
        propagator: ReplicaPropagator,
        stores: Vec<Arc<MemoryReplicaStore>>,
        grant: LockGrant,
        txn: TxnName,
    }

    fn cluster(transport: &InProcessTransport) -> Cluster {
        let mut nodes = Vec::new();
        let mut stores = Vec::new();
        for addr in ["n1", "n2", "n3"] {
            let (node, store) = start_inprocess_node(transport, addr, addr == "n1");
            nodes.push(node);
            stores.push(store);
        }
        let txn = TxnName::new(nodes[0].handle(), 1, 1);
        let grant = LockGrant {
            table: TableIdentity::new("public", "orders"),
            class: LockClass::Write,
            holder: txn.clone(),
            replicas: nodes.iter().map(|n| n.handle().clone()).collect(),
            update_id: 4,
        };
        Cluster {
            propagator: ReplicaPropagator::new(nodes[0].clone(), Arc::new(transport.clone())),
            stores,
            grant,
            txn,
        }
    }

    #[tokio::test]
    async fn all_replicas_apply() {
        logutil::init_test();
        let transport = InProcessTransport::new();
        let c = cluster(&transport);
        let stmt = "UPDATE orders SET qty = 1";

        let outcome = c.propagator.execute(stmt, &c.txn, &c.grant).await;
        assert!(outcome.success);
        assert_eq!(1, outcome.update_count);
        assert_eq!(5, outcome.update_id);
        for store in &c.stores {
            assert_eq!(vec![stmt.to_string()], store.pending(&c.txn));
        }

        c.propagator
            .finish(&c.grant.replicas, &c.txn, true)
            .await
            .unwrap();
        for store in &c.stores {
            assert_eq!(vec![stmt.to_string()], store.committed());
            assert_eq!(vec![(c.txn.clone(), true)], store.finished());
        }
    }

    #[tokio::test]
    async fn failed_replica_aborts_everywhere() {
        logutil::init_test();
        let transport = InProcessTransport::new();
        let c = cluster(&transport);
        c.stores[1].inject_fault("UPDATE", ApplyFault::Io, None);

        let outcome = c
            .propagator
            .execute("UPDATE orders SET qty = 2", &c.txn, &c.grant)
            .await;
        assert!(!outcome.success);
        assert_eq!(0, outcome.update_count);
        // Stops at the failing replica.
        assert_eq!(2, outcome.results.len());
        for store in &c.stores {
            assert!(store.committed().is_empty());
            assert_eq!(vec![(c.txn.clone(), false)], store.finished());
        }

        let err = outcome.into_result().unwrap_err();
        assert!(matches!(err, ExecError::ReplicaFailure { ref replica, .. } if replica == "n2"));
    }

    #[tokio::test]
    async fn unreachable_replica_counts_as_failure() {
        logutil::init_test();
        let transport = InProcessTransport::new();
        let c = cluster(&transport);
        transport.set_reachable("n3", false);

        let outcome = c
            .propagator
            .execute("DELETE FROM orders", &c.txn, &c.grant)
            .await;
        assert!(!outcome.success);
        assert!(outcome.failure().unwrap().1.is_unreachable());
        assert_eq!(vec![(c.txn.clone(), false)], c.stores[0].finished());
        assert_eq!(vec![(c.txn.clone(), false)], c.stores[1].finished());
    }
}
