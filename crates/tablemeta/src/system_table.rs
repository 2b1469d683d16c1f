//! The System Table role, the directory of Table Managers.
use std::collections::{BTreeSet, HashMap};

use parking_lot::Mutex;
use tracing::{debug, info};

use crate::errors::{MetaError, Result, internal};
use crate::manager::{RoleState, begin_migration, cancel_migration, finish_migration};
use crate::types::{
    DirectoryState, ManagerRecord, MigrationState, NodeHandle, RoleId, TableIdentity,
};

#[derive(Debug)]
struct Inner {
    role: RoleState,
    records: HashMap<TableIdentity, ManagerRecord>,
    /// Every node known to hold a copy of a table, whether or not it's
    /// currently active.
    replicas: HashMap<TableIdentity, BTreeSet<NodeHandle>>,
    active: BTreeSet<NodeHandle>,
}

/// Maps table identities to the node currently managing them.
///
/// Records change only through `register_table`, `update_manager_location`
/// (compare and swap on the current host), migration state transitions and
/// removal.
#[derive(Debug)]
pub struct SystemTable {
    host: NodeHandle,
    inner: Mutex<Inner>,
}

impl SystemTable {
    /// Create an active, empty directory.
    pub fn new(host: NodeHandle) -> Self {
        let directory = Self::pending(host.clone());
        let mut state = DirectoryState::default();
        state.active.insert(host);
        directory.install_state(state);
        directory
    }

    /// Create an empty directory waiting on state from the instance it
    /// replaces.
    pub fn pending(host: NodeHandle) -> Self {
        SystemTable {
            host,
            inner: Mutex::new(Inner {
                role: RoleState::Pending,
                records: HashMap::new(),
                replicas: HashMap::new(),
                active: BTreeSet::new(),
            }),
        }
    }

    pub fn install_state(&self, state: DirectoryState) {
        let mut inner = self.inner.lock();
        inner.records = state
            .records
            .into_iter()
            .map(|r| (r.table.clone(), r))
            .collect();
        inner.replicas = state.replicas.into_iter().collect();
        inner.active = state.active;
        inner.active.insert(self.host.clone());
        inner.role = RoleState::Active;
    }

    pub fn role_state(&self) -> RoleState {
        self.inner.lock().role.clone()
    }

    /// Lock the inner state, failing if this instance isn't serving.
    ///
    /// Reads are still served while preparing for migration, writes are not.
    fn serving(&self, write: bool) -> Result<parking_lot::MutexGuard<'_, Inner>> {
        let inner = self.inner.lock();
        let rejected = match &inner.role {
            RoleState::Active => None,
            RoleState::Preparing { .. } if !write => None,
            RoleState::Preparing { .. } => Some(MetaError::MigrationInProgress {
                role: RoleId::SystemTable,
            }),
            RoleState::Moved { .. } => Some(MetaError::Moved {
                role: RoleId::SystemTable,
            }),
            RoleState::Pending => Some(internal!("system table has not been activated")),
        };
        match rejected {
            None => Ok(inner),
            Some(err) => Err(err),
        }
    }

    /// Find the manager record for a table.
    pub fn lookup(&self, table: &TableIdentity) -> Result<Option<ManagerRecord>> {
        let inner = self.serving(false)?;
        Ok(inner.records.get(table).cloned())
    }

    /// Register a newly created table and its manager.
    ///
    /// Registering a table that already has a record fails unless the record
    /// is identical.
    pub fn register_table(&self, record: ManagerRecord) -> Result<()> {
        let mut inner = self.serving(true)?;
        if let Some(existing) = inner.records.get(&record.table) {
            if existing.host != record.host {
                return Err(MetaError::LocationChanged {
                    role: RoleId::TableManager(record.table.clone()),
                    expected: record.host.clone(),
                    found: existing.host.clone(),
                });
            }
        }

        info!(table = %record.table, host = %record.host, "registering table");
        inner
            .replicas
            .entry(record.table.clone())
            .or_default()
            .extend(record.replicas.iter().cloned());
        inner.records.insert(record.table.clone(), record);
        Ok(())
    }

    /// Remove a table from the directory.
    pub fn remove_table(&self, table: &TableIdentity) -> Result<Option<ManagerRecord>> {
        let mut inner = self.serving(true)?;
        inner.replicas.remove(table);
        Ok(inner.records.remove(table))
    }

    /// Point a table's record at a new host if it still points at
    /// `expected`. The record becomes active.
    pub fn update_manager_location(
        &self,
        table: &TableIdentity,
        expected: &NodeHandle,
        new_host: &NodeHandle,
    ) -> Result<()> {
        let mut inner = self.serving(true)?;
        let record = inner
            .records
            .get_mut(table)
            .ok_or_else(|| internal!("no record for {table}"))?;

        if &record.host != expected {
            return Err(MetaError::LocationChanged {
                role: RoleId::TableManager(table.clone()),
                expected: expected.clone(),
                found: record.host.clone(),
            });
        }

        debug!(%table, from = %expected, to = %new_host, "updating manager location");
        record.host = new_host.clone();
        record.state = MigrationState::Active;
        Ok(())
    }

    /// Move a record between ACTIVE and MIGRATING.
    ///
    /// ACTIVE -> MIGRATING fails if a migration is already recorded, which
    /// keeps a single migration in flight per table.
    pub fn set_migration_state(&self, table: &TableIdentity, state: MigrationState) -> Result<()> {
        let mut inner = self.serving(true)?;
        let record = inner
            .records
            .get_mut(table)
            .ok_or_else(|| internal!("no record for {table}"))?;

        match (record.state, state) {
            (MigrationState::Active, MigrationState::Migrating)
            | (MigrationState::Migrating, MigrationState::Active) => {
                record.state = state;
                Ok(())
            }
            (MigrationState::Migrating, MigrationState::Migrating) => {
                Err(MetaError::MigrationInProgress {
                    role: RoleId::TableManager(table.clone()),
                })
            }
            (from, to) => Err(internal!(
                "invalid migration state transition for {table}: {from:?} -> {to:?}"
            )),
        }
    }

    /// Record that a node holds a copy of the table.
    pub fn add_replica(&self, table: &TableIdentity, node: NodeHandle) -> Result<()> {
        let mut inner = self.serving(true)?;
        inner.replicas.entry(table.clone()).or_default().insert(node.clone());
        if let Some(record) = inner.records.get_mut(table) {
            record.replicas.insert(node);
        }
        Ok(())
    }

    /// Nodes holding a copy of the table that are currently active.
    pub fn replicas_on_active_machines(&self, table: &TableIdentity) -> Result<Vec<NodeHandle>> {
        let inner = self.serving(false)?;
        Ok(inner
            .replicas
            .get(table)
            .map(|nodes| {
                nodes
                    .iter()
                    .filter(|n| inner.active.contains(*n))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    pub fn add_active_node(&self, node: NodeHandle) -> Result<()> {
        let mut inner = self.serving(true)?;
        inner.active.insert(node);
        Ok(())
    }

    pub fn remove_active_node(&self, node: &NodeHandle) -> Result<()> {
        let mut inner = self.serving(true)?;
        inner.active.remove(node);
        Ok(())
    }

    pub fn active_nodes(&self) -> Result<Vec<NodeHandle>> {
        let inner = self.serving(false)?;
        Ok(inner.active.iter().cloned().collect())
    }

    pub fn prepare_for_migration(&self, new_owner: &NodeHandle) -> Result<()> {
        let mut inner = self.inner.lock();
        begin_migration(&mut inner.role, || RoleId::SystemTable, new_owner)?;
        info!(%new_owner, "system table preparing for migration");
        Ok(())
    }

    pub fn transfer_state(&self) -> Result<DirectoryState> {
        let inner = self.inner.lock();
        match inner.role {
            RoleState::Preparing { .. } => {
                let mut records: Vec<_> = inner.records.values().cloned().collect();
                records.sort_by(|a, b| a.table.cmp(&b.table));
                let mut replicas: Vec<_> = inner
                    .replicas
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect();
                replicas.sort_by(|a, b| a.0.cmp(&b.0));
                Ok(DirectoryState {
                    records,
                    replicas,
                    active: inner.active.clone(),
                })
            }
            RoleState::Moved { .. } => Err(MetaError::AlreadyMoved {
                role: RoleId::SystemTable,
            }),
            _ => Err(internal!("system table state requested while not preparing")),
        }
    }

    pub fn complete_migration(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        finish_migration(&mut inner.role, || RoleId::SystemTable)
    }

    pub fn abort_migration(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        cancel_migration(&mut inner.role, || RoleId::SystemTable)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn orders() -> TableIdentity {
        TableIdentity::new("public", "orders")
    }

    fn directory_with_orders() -> (SystemTable, NodeHandle, NodeHandle) {
        let n1 = NodeHandle::new("n1");
        let n2 = NodeHandle::new("n2");
        let dir = SystemTable::new(n1.clone());
        dir.add_active_node(n2.clone()).unwrap();
        dir.register_table(ManagerRecord::new(
            orders(),
            n1.clone(),
            [n1.clone(), n2.clone()].into_iter().collect(),
        ))
        .unwrap();
        (dir, n1, n2)
    }

    #[test]
    fn lookup_registered() {
        let (dir, n1, _) = directory_with_orders();
        let record = dir.lookup(&orders()).unwrap().unwrap();
        assert_eq!(n1, record.host);
        assert_eq!(MigrationState::Active, record.state);
        assert!(
            dir.lookup(&TableIdentity::new("public", "missing"))
                .unwrap()
                .is_none()
        );
    }

    #[test]
    fn location_compare_and_swap() {
        let (dir, n1, n2) = directory_with_orders();
        let n3 = NodeHandle::new("n3");

        dir.update_manager_location(&orders(), &n1, &n2).unwrap();
        let err = dir.update_manager_location(&orders(), &n1, &n3).unwrap_err();
        assert!(matches!(err, MetaError::LocationChanged { .. }));
        assert_eq!(n2, dir.lookup(&orders()).unwrap().unwrap().host);
    }

    #[test]
    fn single_migration_per_table() {
        let (dir, _, _) = directory_with_orders();
        dir.set_migration_state(&orders(), MigrationState::Migrating)
            .unwrap();
        assert!(matches!(
            dir.set_migration_state(&orders(), MigrationState::Migrating),
            Err(MetaError::MigrationInProgress { .. })
        ));
        dir.set_migration_state(&orders(), MigrationState::Active)
            .unwrap();
    }

    #[test]
    fn replicas_filtered_by_membership() {
        let (dir, n1, n2) = directory_with_orders();
        assert_eq!(
            vec![n1.clone(), n2.clone()],
            dir.replicas_on_active_machines(&orders()).unwrap()
        );

        dir.remove_active_node(&n2).unwrap();
        assert_eq!(vec![n1], dir.replicas_on_active_machines(&orders()).unwrap());
    }

    #[test]
    fn migrated_directory() {
        let (dir, _, n2) = directory_with_orders();
        dir.prepare_for_migration(&n2).unwrap();

        // Reads still work, writes don't.
        assert!(dir.lookup(&orders()).unwrap().is_some());
        assert!(matches!(
            dir.remove_table(&orders()),
            Err(MetaError::MigrationInProgress { .. })
        ));

        let state = dir.transfer_state().unwrap();
        dir.complete_migration().unwrap();
        assert!(matches!(dir.lookup(&orders()), Err(MetaError::Moved { .. })));

        let replacement = SystemTable::pending(n2.clone());
        replacement.install_state(state);
        assert!(replacement.lookup(&orders()).unwrap().is_some());
        assert!(replacement.active_nodes().unwrap().contains(&n2));
    }
}
