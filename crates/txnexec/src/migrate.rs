//! Move a management role to this node.
//!
//! The old instance is the only source of truth until it completes the
//! migration, after which the new one is. There's no consensus involved:
//! "prepare" on the old instance admits a single migration at a time.
use std::sync::Arc;

use tablemeta::manager::TableManager;
use tablemeta::rpc::NodeClient;
use tablemeta::system_table::SystemTable;
use tablemeta::types::{MigrationState, NodeHandle, RoleId, StateBlob, TableIdentity};
use tracing::{error, info, warn};

use crate::directory::LocationDirectory;
use crate::errors::{ExecError, Result, internal};

#[derive(Debug)]
pub struct RoleMigrator {
    directory: Arc<LocationDirectory>,
}

impl RoleMigrator {
    pub fn new(directory: Arc<LocationDirectory>) -> Self {
        RoleMigrator { directory }
    }

    fn me(&self) -> &NodeHandle {
        self.directory.node().handle()
    }

    /// Move the Table Manager for a table to this node.
    ///
    /// Fails with `MigrationInProgress` or `AlreadyMoved` if another
    /// migration got there first. Any failure before the old instance
    /// completes leaves it authoritative.
    pub async fn migrate_table_manager(&self, table: &TableIdentity) -> Result<()> {
        let system_table = self.directory.system_table_client().await?;
        let record = system_table
            .lookup(table)
            .await?
            .ok_or_else(|| ExecError::TableOrViewNotFound(table.clone()))?;

        let me = self.me().clone();
        if record.host == me && self.directory.node().active_manager(table).is_some() {
            info!(%table, "table manager already hosted here");
            return Ok(());
        }

        system_table
            .set_migration_state(table, MigrationState::Migrating)
            .await?;

        let role = RoleId::TableManager(table.clone());
        info!(%table, from = %record.host, to = %me, "migrating table manager");

        let old = match self.directory.connect(&record.host).await {
            Ok(old) => old,
            Err(e) => {
                self.reset_record(system_table.as_ref(), table).await;
                return Err(e);
            }
        };

        let replacement = Arc::new(TableManager::pending(table.clone(), me.clone()));
        let state = match self.pull_state(old.as_ref(), &role, &me).await {
            Ok(StateBlob::TableManager(state)) => state,
            Ok(_) => {
                self.abandon(old.as_ref(), &role).await;
                self.reset_record(system_table.as_ref(), table).await;
                return Err(internal!("unexpected state blob for {role}"));
            }
            Err(e) => {
                self.reset_record(system_table.as_ref(), table).await;
                if matches!(e, ExecError::AlreadyMoved(_)) {
                    self.directory.invalidate(table);
                }
                return Err(e);
            }
        };
        replacement.install_state(state);

        if let Err(e) = old.complete_migration(&role).await {
            self.abandon(old.as_ref(), &role).await;
            self.reset_record(system_table.as_ref(), table).await;
            return Err(e.into());
        }

        // From here the new instance is the source of truth.
        self.directory.node().host_manager(replacement);
        if let Err(e) = system_table
            .update_manager_location(table, &record.host, &me)
            .await
        {
            // Nothing routes to the new instance. The record keeps naming the
            // retired host, which answers moved until RECREATE TABLEMANAGER
            // replaces it.
            error!(%table, new_host = %me, %e, "failed to record migrated table manager");
            self.directory.node().drop_manager(table);
            self.directory.invalidate(table);
            self.reset_record(system_table.as_ref(), table).await;
            return Err(e.into());
        }
        self.directory.cache_location(table, me);

        info!(%table, "table manager migrated");
        Ok(())
    }

    /// Move the System Table to this node.
    pub async fn migrate_system_table(&self) -> Result<()> {
        let locator = self.directory.locator();
        let current = locator.current().await?;
        let me = self.me().clone();
        if current == me && self.directory.node().system_table().is_ok() {
            info!("system table already hosted here");
            return Ok(());
        }

        info!(from = %current, to = %me, "migrating system table");
        let role = RoleId::SystemTable;
        let old = self.directory.connect(&current).await?;

        let replacement = Arc::new(SystemTable::pending(me.clone()));
        let state = match self.pull_state(old.as_ref(), &role, &me).await? {
            StateBlob::SystemTable(state) => state,
            StateBlob::TableManager(_) => {
                self.abandon(old.as_ref(), &role).await;
                return Err(internal!("unexpected state blob for {role}"));
            }
        };
        replacement.install_state(state);

        if let Err(e) = old.complete_migration(&role).await {
            self.abandon(old.as_ref(), &role).await;
            return Err(e.into());
        }

        self.directory.node().host_system_table(replacement);
        locator
            .compare_and_set(&current, &me)
            .await
            .inspect_err(|e| error!(%e, "failed to record migrated system table"))?;

        info!("system table migrated");
        Ok(())
    }

    /// Rebuild the Table Manager for a table on this node, discarding the
    /// lock state of the previous instance.
    pub async fn recreate_table_manager(&self, table: &TableIdentity) -> Result<()> {
        let host = self.directory.recreate_manager(table).await?;
        if &host != self.me() {
            warn!(%table, %host, "table manager was recreated on another node");
        }
        Ok(())
    }

    /// Prepare the old instance and pull its state. The old instance is
    /// returned to active if the transfer fails.
    async fn pull_state(
        &self,
        old: &dyn NodeClient,
        role: &RoleId,
        me: &NodeHandle,
    ) -> Result<StateBlob> {
        old.prepare_for_migration(role, me).await?;
        match old.transfer_state(role).await {
            Ok(blob) => Ok(blob),
            Err(e) => {
                warn!(%role, %e, "state transfer failed, abandoning migration");
                self.abandon(old, role).await;
                Err(e.into())
            }
        }
    }

    async fn abandon(&self, old: &dyn NodeClient, role: &RoleId) {
        if let Err(e) = old.abort_migration(role).await {
            warn!(%role, %e, "failed to abort migration on old instance");
        }
    }

    async fn reset_record(&self, system_table: &dyn NodeClient, table: &TableIdentity) {
        if let Err(e) = system_table
            .set_migration_state(table, MigrationState::Active)
            .await
        {
            warn!(%table, %e, "failed to reset migration state");
        }
    }
}
