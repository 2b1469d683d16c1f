//! The services hosted by a single database node.
use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, info};

use crate::errors::{MetaError, Result};
use crate::manager::TableManager;
use crate::replica::ReplicaStore;
use crate::system_table::SystemTable;
use crate::types::{ManagerState, NodeHandle, RoleId, StateBlob, TableIdentity};

/// Management roles and storage living on one node.
///
/// Retired (moved) manager instances stay registered so late requests get a
/// moved answer instead of a "no such manager" failure, which would
/// otherwise trigger a recreation.
pub struct NodeServices {
    handle: NodeHandle,
    managers: RwLock<HashMap<TableIdentity, Arc<TableManager>>>,
    system_table: RwLock<Option<Arc<SystemTable>>>,
    store: Arc<dyn ReplicaStore>,
}

impl std::fmt::Debug for NodeServices {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeServices")
            .field("handle", &self.handle)
            .finish_non_exhaustive()
    }
}

impl NodeServices {
    pub fn new(handle: NodeHandle, store: Arc<dyn ReplicaStore>) -> Self {
        NodeServices {
            handle,
            managers: RwLock::new(HashMap::new()),
            system_table: RwLock::new(None),
            store,
        }
    }

    pub fn handle(&self) -> &NodeHandle {
        &self.handle
    }

    pub fn store(&self) -> &Arc<dyn ReplicaStore> {
        &self.store
    }

    /// Start hosting a System Table instance, replacing any previous one.
    pub fn host_system_table(&self, system_table: Arc<SystemTable>) {
        info!(node = %self.handle, "hosting system table");
        *self.system_table.write() = Some(system_table);
    }

    /// Get the System Table hosted here.
    pub fn system_table(&self) -> Result<Arc<SystemTable>> {
        self.system_table
            .read()
            .clone()
            .ok_or_else(|| MetaError::NotSystemTable {
                node: self.handle.to_string(),
            })
    }

    /// Start hosting a Table Manager instance, replacing any previous one.
    pub fn host_manager(&self, manager: Arc<TableManager>) {
        debug!(node = %self.handle, table = %manager.table(), "hosting table manager");
        self.managers
            .write()
            .insert(manager.table().clone(), manager);
    }

    /// Host a new manager built from the given state.
    pub fn host_manager_from_state(&self, state: ManagerState) -> Arc<TableManager> {
        let manager = Arc::new(TableManager::pending(
            state.table.clone(),
            self.handle.clone(),
        ));
        manager.install_state(state);
        self.host_manager(manager.clone());
        manager
    }

    pub fn drop_manager(&self, table: &TableIdentity) -> Option<Arc<TableManager>> {
        self.managers.write().remove(table)
    }

    /// Get the manager instance hosted here for a table, in whatever state
    /// it's in.
    pub fn manager(&self, table: &TableIdentity) -> Result<Arc<TableManager>> {
        self.managers
            .read()
            .get(table)
            .cloned()
            .ok_or_else(|| MetaError::NoSuchManager {
                node: self.handle.to_string(),
                table: table.clone(),
            })
    }

    /// Get the manager for a table only if it's hosted here and serving.
    pub fn active_manager(&self, table: &TableIdentity) -> Option<Arc<TableManager>> {
        self.managers
            .read()
            .get(table)
            .filter(|m| m.is_active())
            .cloned()
    }

    pub fn prepare_for_migration(&self, role: &RoleId, new_owner: &NodeHandle) -> Result<()> {
        match role {
            RoleId::SystemTable => self.system_table()?.prepare_for_migration(new_owner),
            RoleId::TableManager(table) => self.manager(table)?.prepare_for_migration(new_owner),
        }
    }

    pub fn transfer_state(&self, role: &RoleId) -> Result<StateBlob> {
        match role {
            RoleId::SystemTable => Ok(StateBlob::SystemTable(
                self.system_table()?.transfer_state()?,
            )),
            RoleId::TableManager(table) => Ok(StateBlob::TableManager(
                self.manager(table)?.transfer_state()?,
            )),
        }
    }

    pub fn complete_migration(&self, role: &RoleId) -> Result<()> {
        match role {
            RoleId::SystemTable => self.system_table()?.complete_migration(),
            RoleId::TableManager(table) => self.manager(table)?.complete_migration(),
        }
    }

    pub fn abort_migration(&self, role: &RoleId) -> Result<()> {
        match role {
            RoleId::SystemTable => self.system_table()?.abort_migration(),
            RoleId::TableManager(table) => self.manager(table)?.abort_migration(),
        }
    }
}
