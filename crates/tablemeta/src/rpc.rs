//! RPC surface between nodes.
//!
//! Every call may fail with [`MetaError::Unreachable`] if the remote node
//! can't be talked to. Callers decide whether that's a retry or an abort.
//!
//! [`MetaError::Unreachable`]: crate::errors::MetaError::Unreachable
use std::sync::Arc;

use async_trait::async_trait;

use crate::errors::Result;
use crate::types::{
    LockClass, LockResponse, ManagerRecord, MigrationState, NodeHandle, RoleId,
    StateBlob, TableIdentity, TxnName,
};

/// Client to a single (possibly remote) node.
#[async_trait]
pub trait NodeClient: Send + Sync {
    /// The node this client talks to.
    fn node(&self) -> &NodeHandle;

    /// Look up the manager record for a table. Requires the node to host the
    /// System Table.
    async fn lookup(&self, table: &TableIdentity) -> Result<Option<ManagerRecord>>;

    async fn register_table(&self, record: ManagerRecord) -> Result<()>;

    async fn remove_table(&self, table: &TableIdentity) -> Result<Option<ManagerRecord>>;

    /// Compare and swap the host of a table's manager.
    async fn update_manager_location(
        &self,
        table: &TableIdentity,
        expected: &NodeHandle,
        new_host: &NodeHandle,
    ) -> Result<()>;

    async fn set_migration_state(&self, table: &TableIdentity, state: MigrationState)
    -> Result<()>;

    /// Add or remove a node from the set of active machines.
    async fn set_node_active(&self, node: &NodeHandle, active: bool) -> Result<()>;

    /// Replicas of a table hosted on currently active nodes.
    async fn active_replicas(&self, table: &TableIdentity) -> Result<Vec<NodeHandle>>;

    /// Request a lock from the table's manager hosted on this node.
    async fn request_lock(
        &self,
        table: &TableIdentity,
        class: LockClass,
        txn: &TxnName,
    ) -> Result<LockResponse>;

    /// Release all locks `txn` holds on the table, returning the update id
    /// afterwards.
    async fn release_lock(&self, table: &TableIdentity, txn: &TxnName, committed: bool)
    -> Result<u64>;

    async fn prepare_for_migration(&self, role: &RoleId, new_owner: &NodeHandle) -> Result<()>;

    async fn transfer_state(&self, role: &RoleId) -> Result<StateBlob>;

    async fn complete_migration(&self, role: &RoleId) -> Result<()>;

    async fn abort_migration(&self, role: &RoleId) -> Result<()>;

    /// Apply a statement to this node's replica.
    async fn apply(&self, txn: &TxnName, statement: &str) -> Result<u64>;

    /// Commit or roll back everything applied under `txn` on this node.
    async fn finish_transaction(&self, txn: &TxnName, commit: bool) -> Result<()>;

    /// Ask the node to serve as a linked copy of the table.
    async fn accept_link(&self, table: &TableIdentity) -> Result<bool>;
}

/// Produces clients for nodes.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn connect(&self, node: &NodeHandle) -> Result<Arc<dyn NodeClient>>;
}

/// The top-level record of which node hosts the System Table.
#[async_trait]
pub trait DirectoryLocator: Send + Sync {
    async fn current(&self) -> Result<NodeHandle>;

    /// Point the record at `new_host` if it currently points at `expected`.
    async fn compare_and_set(&self, expected: &NodeHandle, new_host: &NodeHandle) -> Result<()>;
}
