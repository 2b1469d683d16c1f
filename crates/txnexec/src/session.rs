use std::sync::Arc;

use parking_lot::Mutex;
use tablemeta::types::TxnName;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::admin::AdminStatement;
use crate::config::{AutoCommit, SessionConfig, SessionSetting};
use crate::engine::Engine;
use crate::errors::{ExecError, Result};
use crate::executor::{StatementExecutor, complete_transaction};
use crate::lock::TransactionContext;
use crate::statement::{ExecOutcome, PreparedStatement};

/// Session state only touched while executing a statement.
#[derive(Debug)]
struct SessionState {
    config: SessionConfig,
    txn: Option<TransactionContext>,
    txn_seq: u64,
    closed: bool,
}

/// A per-client session.
///
/// Statements of one session run one at a time. Statements of different
/// sessions run in parallel. Dropping a session with an open transaction
/// rolls it back in the background.
#[derive(Debug)]
pub struct Session {
    id: u64,
    engine: Arc<Engine>,
    state: tokio::sync::Mutex<SessionState>,
    /// Token for the statement currently running. Replaced once a cancelled
    /// statement has finished.
    cancel: Mutex<CancellationToken>,
}

impl Session {
    pub(crate) fn new(id: u64, engine: Arc<Engine>) -> Session {
        let config = SessionConfig::new(engine.config());
        Session {
            id,
            engine,
            state: tokio::sync::Mutex::new(SessionState {
                config,
                txn: None,
                txn_seq: 0,
                closed: false,
            }),
            cancel: Mutex::new(CancellationToken::new()),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Cancel the statement currently running, if any.
    ///
    /// Cancellation is cooperative, the statement notices at its next
    /// checkpoint and rolls back.
    pub fn cancel(&self) {
        debug!(session = self.id, "cancelling statement");
        self.cancel.lock().cancel();
    }

    fn statement_token(&self) -> CancellationToken {
        let mut cancel = self.cancel.lock();
        if cancel.is_cancelled() {
            *cancel = CancellationToken::new();
        }
        cancel.clone()
    }

    /// Execute a prepared statement.
    pub async fn execute(&self, stmt: &mut dyn PreparedStatement) -> Result<ExecOutcome> {
        let mut state = self.state.lock().await;
        self.check_usable(&state)?;
        self.engine.reserve().replenish();

        let cancel = self.statement_token();
        let SessionState {
            config,
            txn,
            txn_seq,
            ..
        } = &mut *state;
        let txn = txn.get_or_insert_with(|| self.begin_txn(txn_seq, config.auto_commit));

        let mut executor = StatementExecutor::new(&self.engine, config, &cancel);
        let result = executor.execute(stmt, txn).await;
        if executor.completed_transaction() {
            state.txn = None;
        }
        result
    }

    /// Execute an administrative statement. Roles always move to this
    /// node.
    pub async fn execute_admin(&self, sql: &str) -> Result<()> {
        let state = self.state.lock().await;
        self.check_usable(&state)?;

        let stmt = AdminStatement::parse(sql)
            .and_then(|stmt| {
                stmt.ok_or_else(|| ExecError::Syntax("not an administrative statement".to_string()))
            })
            .map_err(|e| e.with_statement(sql))?;

        info!(session = self.id, %stmt, "executing administrative statement");
        let migrator = self.engine.migrator();
        let result = match &stmt {
            AdminStatement::MigrateTableManager(table) => {
                migrator.migrate_table_manager(table).await
            }
            AdminStatement::MigrateSystemTable => migrator.migrate_system_table().await,
            AdminStatement::RecreateTableManager(table) => {
                migrator.recreate_table_manager(table).await
            }
        };
        result.map_err(|e| e.with_statement(sql))
    }

    /// Commit the current transaction, if any.
    pub async fn commit(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        self.check_usable(&state)?;
        self.finish_txn(&mut state, true).await
    }

    /// Roll back the current transaction, if any.
    pub async fn rollback(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        self.check_usable(&state)?;
        self.finish_txn(&mut state, false).await
    }

    /// Roll back any open transaction and close the session.
    pub async fn close(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.closed {
            return Ok(());
        }
        state.closed = true;
        debug!(session = self.id, "closing session");
        self.finish_txn(&mut state, false).await
    }

    /// Change a session setting. Turning auto-commit on commits the open
    /// transaction.
    pub async fn set_setting(&self, name: &str, value: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        self.check_usable(&state)?;

        let was_auto_commit = state.config.auto_commit;
        state.config.set_from_str(name, value)?;

        if name.eq_ignore_ascii_case(AutoCommit::NAME) {
            let auto_commit = state.config.auto_commit;
            if auto_commit && !was_auto_commit {
                self.finish_txn(&mut state, true).await?;
            } else if let Some(txn) = state.txn.as_mut() {
                txn.set_auto_commit(auto_commit);
            }
        }
        Ok(())
    }

    /// Restore every setting to the engine's defaults.
    pub async fn reset_settings(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        self.check_usable(&state)?;

        let was_auto_commit = state.config.auto_commit;
        state.config = SessionConfig::new(self.engine.config());
        if state.config.auto_commit && !was_auto_commit {
            self.finish_txn(&mut state, true).await?;
        }
        Ok(())
    }

    pub async fn get_setting(&self, name: &str) -> Result<String> {
        let state = self.state.lock().await;
        state.config.get_as_string(name)
    }

    /// If a transaction is open.
    pub async fn in_transaction(&self) -> bool {
        self.state.lock().await.txn.is_some()
    }

    fn check_usable(&self, state: &SessionState) -> Result<()> {
        self.engine.check_open()?;
        if state.closed {
            return Err(ExecError::SessionClosed);
        }
        Ok(())
    }

    fn begin_txn(&self, txn_seq: &mut u64, auto_commit: bool) -> TransactionContext {
        *txn_seq += 1;
        let name = TxnName::new(self.engine.node(), self.id, *txn_seq);
        debug!(session = self.id, txn = %name, "starting transaction");
        TransactionContext::new(name, auto_commit)
    }

    async fn finish_txn(&self, state: &mut SessionState, commit: bool) -> Result<()> {
        match state.txn.take() {
            Some(mut txn) => complete_transaction(&self.engine, &mut txn, commit).await,
            None => Ok(()),
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        let Some(mut txn) = self.state.get_mut().txn.take() else {
            return;
        };

        let handle = match tokio::runtime::Handle::try_current() {
            Ok(handle) => handle,
            Err(_) => {
                warn!(session = self.id, txn = %txn.name(), "no runtime to roll back dropped session, locks stay held");
                return;
            }
        };

        debug!(session = self.id, txn = %txn.name(), "rolling back transaction of dropped session");
        let engine = self.engine.clone();
        handle.spawn(async move {
            if let Err(e) = complete_transaction(&engine, &mut txn, false).await {
                warn!(txn = %txn.name(), %e, "failed to roll back transaction of dropped session");
            }
        });
    }
}
