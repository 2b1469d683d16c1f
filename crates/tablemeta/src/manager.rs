//! The Table Manager role.
//!
//! A Table Manager owns the lock state and replica membership for a single
//! table. Exactly one active instance exists per table at a time. During a
//! migration the instance moves through `Active -> Preparing -> Moved`, and
//! once moved it answers every request with `Moved` so callers go back to
//! the directory.
use std::collections::BTreeSet;

use parking_lot::Mutex;
use tracing::debug;

use crate::errors::{MetaError, Result, internal};
use crate::types::{
    LockClass, LockGrant, LockResponse, ManagerState, NodeHandle, RoleId, TableIdentity, TxnName,
};

/// Where a role instance is in its lifecycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoleState {
    /// Constructed for an incoming migration, waiting for state.
    Pending,
    /// Serving requests.
    Active,
    /// Not admitting new requests, state may be pulled.
    Preparing { new_owner: NodeHandle },
    /// Retired. All requests fail with moved.
    Moved { new_owner: NodeHandle },
}

/// Check that a role can begin a migration, returning the appropriate error
/// if it can't.
pub(crate) fn begin_migration(
    state: &mut RoleState,
    role: impl FnOnce() -> RoleId,
    new_owner: &NodeHandle,
) -> Result<()> {
    match state {
        RoleState::Active => {
            *state = RoleState::Preparing {
                new_owner: new_owner.clone(),
            };
            Ok(())
        }
        RoleState::Preparing { .. } => Err(MetaError::MigrationInProgress { role: role() }),
        RoleState::Moved { .. } => Err(MetaError::AlreadyMoved { role: role() }),
        RoleState::Pending => Err(internal!("{} has not been activated", role())),
    }
}

pub(crate) fn finish_migration(state: &mut RoleState, role: impl FnOnce() -> RoleId) -> Result<()> {
    match state {
        RoleState::Preparing { new_owner } => {
            *state = RoleState::Moved {
                new_owner: new_owner.clone(),
            };
            Ok(())
        }
        RoleState::Moved { .. } => Err(MetaError::AlreadyMoved { role: role() }),
        _ => Err(internal!("{} is not preparing for migration", role())),
    }
}

pub(crate) fn cancel_migration(state: &mut RoleState, role: impl FnOnce() -> RoleId) -> Result<()> {
    match state {
        RoleState::Preparing { .. } => {
            *state = RoleState::Active;
            Ok(())
        }
        RoleState::Active => Ok(()),
        RoleState::Moved { .. } => Err(MetaError::AlreadyMoved { role: role() }),
        RoleState::Pending => Err(internal!("{} has not been activated", role())),
    }
}

/// Locks currently held on the table.
#[derive(Debug, Default)]
struct LockTable {
    writer: Option<(TxnName, LockClass)>,
    readers: BTreeSet<TxnName>,
}

impl LockTable {
    /// Try to take a lock, returning the class now held by `txn`, or the
    /// conflicting holders.
    fn try_lock(&mut self, txn: &TxnName, class: LockClass) -> Result<LockClass, Vec<TxnName>> {
        if let Some((writer, held)) = &self.writer {
            if writer == txn {
                // Already exclusive. Upgrade from WRITE to CREATE if asked,
                // never downgrade.
                let held = (*held).max(class);
                self.writer = Some((txn.clone(), held));
                return Ok(held);
            }
            return Err(vec![writer.clone()]);
        }

        match class {
            LockClass::None => Ok(LockClass::None),
            LockClass::Read => {
                self.readers.insert(txn.clone());
                Ok(LockClass::Read)
            }
            LockClass::Write | LockClass::Create => {
                let others: Vec<_> = self.readers.iter().filter(|r| *r != txn).cloned().collect();
                if !others.is_empty() {
                    return Err(others);
                }
                self.readers.remove(txn);
                self.writer = Some((txn.clone(), class));
                Ok(class)
            }
        }
    }

    /// Drop all locks held by `txn`. Returns the class that was held.
    fn unlock(&mut self, txn: &TxnName) -> LockClass {
        if let Some((writer, class)) = &self.writer {
            if writer == txn {
                let class = *class;
                self.writer = None;
                return class;
            }
        }
        if self.readers.remove(txn) {
            LockClass::Read
        } else {
            LockClass::None
        }
    }

    fn holders(&self) -> Vec<TxnName> {
        let mut holders: Vec<_> = self.readers.iter().cloned().collect();
        if let Some((writer, _)) = &self.writer {
            holders.push(writer.clone());
        }
        holders
    }
}

#[derive(Debug)]
struct Inner {
    role: RoleState,
    replicas: BTreeSet<NodeHandle>,
    update_id: u64,
    locks: LockTable,
}

/// Lock and replica state for one table.
///
/// All methods take the internal mutex for their whole duration, so a
/// request admitted before `prepare_for_migration` always completes before
/// the state is handed off.
#[derive(Debug)]
pub struct TableManager {
    table: TableIdentity,
    host: NodeHandle,
    inner: Mutex<Inner>,
}

impl TableManager {
    /// Create an active manager with no locks held.
    pub fn new(table: TableIdentity, host: NodeHandle, replicas: BTreeSet<NodeHandle>) -> Self {
        let manager = Self::pending(table.clone(), host);
        manager.install_state(ManagerState::fresh(table, replicas));
        manager
    }

    /// Create an empty instance waiting to receive state from the instance
    /// it replaces.
    pub fn pending(table: TableIdentity, host: NodeHandle) -> Self {
        TableManager {
            table,
            host,
            inner: Mutex::new(Inner {
                role: RoleState::Pending,
                replicas: BTreeSet::new(),
                update_id: 0,
                locks: LockTable::default(),
            }),
        }
    }

    /// Load state into this instance and start serving requests.
    pub fn install_state(&self, state: ManagerState) {
        let mut inner = self.inner.lock();
        inner.replicas = state.replicas;
        inner.update_id = state.update_id;
        inner.locks = LockTable {
            writer: state.writer,
            readers: state.readers,
        };
        inner.role = RoleState::Active;
    }

    pub fn table(&self) -> &TableIdentity {
        &self.table
    }

    pub fn host(&self) -> &NodeHandle {
        &self.host
    }

    pub fn role_state(&self) -> RoleState {
        self.inner.lock().role.clone()
    }

    pub fn is_active(&self) -> bool {
        self.inner.lock().role == RoleState::Active
    }

    pub fn update_id(&self) -> u64 {
        self.inner.lock().update_id
    }

    fn role_id(&self) -> RoleId {
        RoleId::TableManager(self.table.clone())
    }

    fn moved_error(&self) -> MetaError {
        MetaError::Moved {
            role: self.role_id(),
        }
    }

    /// Request a lock for a transaction.
    ///
    /// A transaction that already holds a sufficient class gets its existing
    /// lock back. Upgrading READ to WRITE waits until it's the only reader.
    pub fn request_lock(&self, class: LockClass, txn: &TxnName) -> LockResponse {
        let mut inner = self.inner.lock();
        match &inner.role {
            RoleState::Active => (),
            RoleState::Preparing { .. } | RoleState::Pending => return LockResponse::Migrating,
            RoleState::Moved { .. } => return LockResponse::Moved,
        }

        match inner.locks.try_lock(txn, class) {
            Ok(held) => {
                debug!(table = %self.table, %txn, %held, "lock granted");
                LockResponse::Granted(LockGrant {
                    table: self.table.clone(),
                    class: held,
                    holder: txn.clone(),
                    replicas: inner.replicas.iter().cloned().collect(),
                    update_id: inner.update_id,
                })
            }
            Err(holders) => {
                debug!(table = %self.table, %txn, ?holders, "lock held by other transactions");
                LockResponse::Waiting { holders }
            }
        }
    }

    /// Release every lock `txn` holds on this table.
    ///
    /// A committed exclusive lock advances the update sequence number.
    /// Returns the update id after release.
    ///
    /// Releases are refused while preparing for a migration, the state may
    /// already have been handed to the new instance. Callers retry and
    /// follow the move.
    pub fn release_lock(&self, txn: &TxnName, committed: bool) -> Result<u64> {
        let mut inner = self.inner.lock();
        match inner.role {
            RoleState::Active => (),
            RoleState::Preparing { .. } | RoleState::Pending => {
                return Err(MetaError::MigrationInProgress {
                    role: self.role_id(),
                });
            }
            RoleState::Moved { .. } => return Err(self.moved_error()),
        }

        let held = inner.locks.unlock(txn);
        if committed && held.is_exclusive() {
            inner.update_id += 1;
        }
        debug!(table = %self.table, %txn, %held, committed, update_id = inner.update_id, "lock released");
        Ok(inner.update_id)
    }

    /// Transactions currently holding locks.
    pub fn holders(&self) -> Vec<TxnName> {
        self.inner.lock().locks.holders()
    }

    /// Stop admitting new requests ahead of a hand-off to `new_owner`.
    pub fn prepare_for_migration(&self, new_owner: &NodeHandle) -> Result<()> {
        let mut inner = self.inner.lock();
        begin_migration(&mut inner.role, || self.role_id(), new_owner)?;
        debug!(table = %self.table, %new_owner, "table manager preparing for migration");
        Ok(())
    }

    /// Snapshot the full state. Only valid while preparing.
    pub fn transfer_state(&self) -> Result<ManagerState> {
        let inner = self.inner.lock();
        match inner.role {
            RoleState::Preparing { .. } => Ok(ManagerState {
                table: self.table.clone(),
                replicas: inner.replicas.clone(),
                update_id: inner.update_id,
                writer: inner.locks.writer.clone(),
                readers: inner.locks.readers.clone(),
            }),
            RoleState::Moved { .. } => Err(MetaError::AlreadyMoved {
                role: self.role_id(),
            }),
            _ => Err(internal!(
                "state requested from {} that is not preparing",
                self.role_id()
            )),
        }
    }

    /// Retire this instance.
    pub fn complete_migration(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        finish_migration(&mut inner.role, || self.role_id())?;
        debug!(table = %self.table, "table manager moved");
        Ok(())
    }

    /// Abandon a migration, this instance stays authoritative.
    pub fn abort_migration(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        cancel_migration(&mut inner.role, || self.role_id())
    }
}
