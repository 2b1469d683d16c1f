//! Lifecycle of a single statement.
//!
//! ```text
//! CREATED -> PREPARED -> LOCKING -> EXECUTING -> COMMITTING   -> DONE
//!                                             \-> ROLLING_BACK -> DONE
//! ```
//!
//! Any failure along the way rolls back the enclosing transaction and
//! releases its locks. A successful statement completes the transaction if
//! the session is in auto-commit mode, or if the statement isn't
//! transactional.
use std::fmt;

use tablemeta::types::{LockClass, LockGrant, TableIdentity};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, debug_span, error, warn};

use crate::config::SessionConfig;
use crate::engine::Engine;
use crate::errors::{ExecError, Result};
use crate::lock::{LockWait, TransactionContext};
use crate::statement::{ExecContext, ExecOutcome, PreparedStatement, checkpoint};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecState {
    Created,
    Prepared,
    Locking,
    Executing,
    Committing,
    RollingBack,
    Done,
}

impl fmt::Display for ExecState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ExecState::Created => "CREATED",
            ExecState::Prepared => "PREPARED",
            ExecState::Locking => "LOCKING",
            ExecState::Executing => "EXECUTING",
            ExecState::Committing => "COMMITTING",
            ExecState::RollingBack => "ROLLING_BACK",
            ExecState::Done => "DONE",
        };
        write!(f, "{s}")
    }
}

/// Executes one statement within a transaction.
pub struct StatementExecutor<'a> {
    engine: &'a Engine,
    settings: &'a SessionConfig,
    cancel: &'a CancellationToken,
    state: ExecState,
    /// If the transaction was committed or rolled back by this statement.
    completed: bool,
}

impl<'a> StatementExecutor<'a> {
    pub fn new(
        engine: &'a Engine,
        settings: &'a SessionConfig,
        cancel: &'a CancellationToken,
    ) -> Self {
        StatementExecutor {
            engine,
            settings,
            cancel,
            state: ExecState::Created,
            completed: false,
        }
    }

    pub fn state(&self) -> ExecState {
        self.state
    }

    /// If the transaction ended with this statement. The transaction
    /// context must not be used again if so.
    pub fn completed_transaction(&self) -> bool {
        self.completed
    }

    fn transition(&mut self, to: ExecState) {
        debug!(from = %self.state, %to, "statement state");
        self.state = to;
    }

    /// Run the statement. Errors carry the statement text with parameters
    /// substituted.
    pub async fn execute(
        &mut self,
        stmt: &mut dyn PreparedStatement,
        txn: &mut TransactionContext,
    ) -> Result<ExecOutcome> {
        let sql = match crate::statement::substitute_parameters(stmt.sql(), stmt.parameters()) {
            Ok(sql) => sql,
            Err(e) => return Err(e.with_statement(stmt.sql())),
        };

        let span = debug_span!("execute", txn = %txn.name());
        let result = self.run(stmt, txn, &sql).instrument(span).await;

        match result {
            Ok(outcome) => {
                if txn.auto_commit() || !stmt.is_transactional() {
                    self.transition(ExecState::Committing);
                    let committed = self.complete(txn, true).await;
                    self.transition(ExecState::Done);
                    committed.map_err(|e| e.with_statement(&sql))?;
                } else {
                    self.transition(ExecState::Done);
                }
                Ok(outcome)
            }
            Err(e) => {
                self.transition(ExecState::RollingBack);
                self.fail(txn, &e).await;
                self.transition(ExecState::Done);
                Err(e.with_statement(sql))
            }
        }
    }

    /// Roll back after a failed statement. Running out of memory during
    /// rollback after running out of memory during execution shuts the
    /// engine down.
    async fn fail(&mut self, txn: &mut TransactionContext, err: &ExecError) {
        let out_of_memory = err.is_out_of_memory();
        if out_of_memory {
            self.engine.reserve().release();
        }

        debug!(txn = %txn.name(), %err, "rolling back");
        if let Err(rollback_err) = self.complete(txn, false).await {
            if out_of_memory && rollback_err.is_out_of_memory() {
                error!(txn = %txn.name(), "out of memory during rollback");
                self.engine.shutdown_immediately();
            } else {
                warn!(txn = %txn.name(), %rollback_err, "rollback incomplete");
            }
        }
    }

    /// Finish the transaction on every participant and release its locks.
    async fn complete(&mut self, txn: &mut TransactionContext, commit: bool) -> Result<()> {
        self.completed = true;
        complete_transaction(self.engine, txn, commit).await
    }

    async fn run(
        &mut self,
        stmt: &mut dyn PreparedStatement,
        txn: &mut TransactionContext,
        sql: &str,
    ) -> Result<ExecOutcome> {
        checkpoint(self.cancel)?;

        let version = self.engine.schema_version();
        if stmt.always_recompile() || stmt.modification_id() < version {
            debug!(from = stmt.modification_id(), to = version, "recompiling statement");
            stmt.recompile(version).await?;
        }
        self.transition(ExecState::Prepared);

        // Retrying after an earlier statement in the transaction was applied
        // would lose it, the failed attempt rolled back every replica.
        let retryable = txn.participants().is_empty();
        let deadline = Instant::now() + self.settings.lock_timeout;
        let backoff = self.engine.config().concurrent_update_backoff;

        loop {
            match self.attempt(stmt, txn, sql).await {
                Err(e)
                    if retryable
                        && e.is_concurrent_update()
                        && Instant::now() + backoff < deadline =>
                {
                    debug!(%e, ?backoff, "concurrent update, retrying statement");
                    // Discard anything the failed attempt applied locally.
                    self.engine
                        .services()
                        .store()
                        .finish(txn.name(), false)
                        .await?;
                    let cancelled = tokio::select! {
                        _ = tokio::time::sleep(backoff) => false,
                        _ = self.cancel.cancelled() => true,
                    };
                    if cancelled {
                        return Err(ExecError::Cancelled);
                    }
                }
                result => return result,
            }
        }
    }

    async fn attempt(
        &mut self,
        stmt: &dyn PreparedStatement,
        txn: &mut TransactionContext,
        sql: &str,
    ) -> Result<ExecOutcome> {
        self.transition(ExecState::Locking);
        let class = stmt.lock_class();
        let wait = LockWait {
            timeout: self.settings.lock_timeout,
            check_interval: self.settings.deadlock_check_interval,
            allow_remote_search: true,
        };

        let tables = stmt.tables();
        let mut grants = Vec::with_capacity(tables.len());
        for table in &tables {
            checkpoint(self.cancel)?;
            let grant = if table.is_system() {
                self.metadata_grant(table, class, txn)
            } else {
                self.engine
                    .broker()
                    .acquire(table, class, txn, wait, self.cancel)
                    .await?
            };
            grants.push(grant);
        }

        self.transition(ExecState::Executing);
        checkpoint(self.cancel)?;

        let local = self.engine.node();
        let target = grants.iter().find(|g| !g.table.is_system());
        if let Some(target) = target {
            if !stmt.is_query() && !target.is_local_only(local) {
                let outcome = self.engine.propagator().execute(sql, txn.name(), target).await;
                let outcome = outcome.into_result()?;
                for result in &outcome.results {
                    txn.record_participant(result.replica.clone());
                }
                return Ok(ExecOutcome::UpdateCount(outcome.update_count));
            }
        }

        let ctx = ExecContext {
            txn: txn.name(),
            node: self.engine.services(),
            cancel: self.cancel,
            grants: &grants,
        };
        let outcome = stmt.execute(&ctx).await?;
        checkpoint(self.cancel)?;

        if !stmt.is_read_only() {
            txn.record_participant(local.clone());
        }
        Ok(outcome)
    }

    /// Metadata tables aren't replicated or locked through a manager.
    fn metadata_grant(
        &self,
        table: &TableIdentity,
        class: LockClass,
        txn: &TransactionContext,
    ) -> LockGrant {
        LockGrant {
            table: table.clone(),
            class,
            holder: txn.name().clone(),
            replicas: vec![self.engine.node().clone()],
            update_id: 0,
        }
    }
}

/// Commit or roll back a transaction on every node that applied part of
/// it, then release its locks.
pub(crate) async fn complete_transaction(
    engine: &Engine,
    txn: &mut TransactionContext,
    commit: bool,
) -> Result<()> {
    let participants: Vec<_> = txn.participants().iter().cloned().collect();
    let finished = engine
        .propagator()
        .finish(&participants, txn.name(), commit)
        .await;
    engine
        .broker()
        .release_all(txn, commit && finished.is_ok())
        .await;
    debug!(
        txn = %txn.name(),
        commit,
        participants = participants.len(),
        acquired = txn.acquired(),
        released = txn.released(),
        "transaction complete"
    );
    finished
}
