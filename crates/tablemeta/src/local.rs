//! In-process transport.
//!
//! Useful for tests, as well as when running every node of a cluster inside
//! one process. Nodes can be marked unreachable to simulate failures.
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::{debug, info};

use crate::errors::{MetaError, Result};
use crate::node::NodeServices;
use crate::replica::MemoryReplicaStore;
use crate::rpc::{DirectoryLocator, NodeClient, Transport};
use crate::system_table::SystemTable;
use crate::types::{
    LockClass, LockResponse, ManagerRecord, MigrationState, NodeHandle, RoleId,
    StateBlob, TableIdentity, TxnName,
};

/// Routes calls directly to node services in the same process.
#[derive(Debug, Default, Clone)]
pub struct InProcessTransport {
    nodes: Arc<RwLock<HashMap<String, Arc<NodeServices>>>>,
    down: Arc<RwLock<HashSet<String>>>,
}

impl InProcessTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_node(&self, node: Arc<NodeServices>) {
        self.nodes
            .write()
            .insert(node.handle().address().to_string(), node);
    }

    pub fn node(&self, address: &str) -> Option<Arc<NodeServices>> {
        self.nodes.read().get(address).cloned()
    }

    /// Mark a node as (un)reachable. Calls to an unreachable node fail,
    /// including calls through clients obtained before the change.
    pub fn set_reachable(&self, address: &str, reachable: bool) {
        info!(%address, reachable, "changing node reachability");
        let mut down = self.down.write();
        if reachable {
            down.remove(address);
        } else {
            down.insert(address.to_string());
        }
    }
}

#[async_trait]
impl Transport for InProcessTransport {
    async fn connect(&self, node: &NodeHandle) -> Result<Arc<dyn NodeClient>> {
        let services = self
            .nodes
            .read()
            .get(node.address())
            .cloned()
            .ok_or_else(|| MetaError::Unreachable {
                address: node.address().to_string(),
            })?;

        let client = InProcessClient {
            handle: node.clone(),
            services,
            down: self.down.clone(),
        };
        client.check()?;
        Ok(Arc::new(client))
    }
}

struct InProcessClient {
    handle: NodeHandle,
    services: Arc<NodeServices>,
    down: Arc<RwLock<HashSet<String>>>,
}

impl InProcessClient {
    fn check(&self) -> Result<()> {
        if self.down.read().contains(self.handle.address()) {
            debug!(node = %self.handle, "rejecting call to unreachable node");
            return Err(MetaError::Unreachable {
                address: self.handle.address().to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl NodeClient for InProcessClient {
    fn node(&self) -> &NodeHandle {
        &self.handle
    }

    async fn lookup(&self, table: &TableIdentity) -> Result<Option<ManagerRecord>> {
        self.check()?;
        self.services.system_table()?.lookup(table)
    }

    async fn register_table(&self, record: ManagerRecord) -> Result<()> {
        self.check()?;
        self.services.system_table()?.register_table(record)
    }

    async fn remove_table(&self, table: &TableIdentity) -> Result<Option<ManagerRecord>> {
        self.check()?;
        self.services.system_table()?.remove_table(table)
    }

    async fn update_manager_location(
        &self,
        table: &TableIdentity,
        expected: &NodeHandle,
        new_host: &NodeHandle,
    ) -> Result<()> {
        self.check()?;
        self.services
            .system_table()?
            .update_manager_location(table, expected, new_host)
    }

    async fn set_migration_state(
        &self,
        table: &TableIdentity,
        state: MigrationState,
    ) -> Result<()> {
        self.check()?;
        self.services
            .system_table()?
            .set_migration_state(table, state)
    }

    async fn set_node_active(&self, node: &NodeHandle, active: bool) -> Result<()> {
        self.check()?;
        let system_table = self.services.system_table()?;
        if active {
            system_table.add_active_node(node.clone())
        } else {
            system_table.remove_active_node(node)
        }
    }

    async fn active_replicas(&self, table: &TableIdentity) -> Result<Vec<NodeHandle>> {
        self.check()?;
        self.services
            .system_table()?
            .replicas_on_active_machines(table)
    }

    async fn request_lock(
        &self,
        table: &TableIdentity,
        class: LockClass,
        txn: &TxnName,
    ) -> Result<LockResponse> {
        self.check()?;
        Ok(self.services.manager(table)?.request_lock(class, txn))
    }

    async fn release_lock(
        &self,
        table: &TableIdentity,
        txn: &TxnName,
        committed: bool,
    ) -> Result<u64> {
        self.check()?;
        self.services.manager(table)?.release_lock(txn, committed)
    }

    async fn prepare_for_migration(&self, role: &RoleId, new_owner: &NodeHandle) -> Result<()> {
        self.check()?;
        self.services.prepare_for_migration(role, new_owner)
    }

    async fn transfer_state(&self, role: &RoleId) -> Result<StateBlob> {
        self.check()?;
        // Go through the wire format so nothing is shared with the old
        // instance.
        let buf = self.services.transfer_state(role)?.encode()?;
        StateBlob::decode(&buf)
    }

    async fn complete_migration(&self, role: &RoleId) -> Result<()> {
        self.check()?;
        self.services.complete_migration(role)
    }

    async fn abort_migration(&self, role: &RoleId) -> Result<()> {
        self.check()?;
        self.services.abort_migration(role)
    }

    async fn apply(&self, txn: &TxnName, statement: &str) -> Result<u64> {
        self.check()?;
        self.services.store().apply(txn, statement).await
    }

    async fn finish_transaction(&self, txn: &TxnName, commit: bool) -> Result<()> {
        self.check()?;
        self.services.store().finish(txn, commit).await
    }

    async fn accept_link(&self, table: &TableIdentity) -> Result<bool> {
        self.check()?;
        Ok(self.services.store().has_table(table).await)
    }
}

/// Directory locator shared by every node in the process.
#[derive(Debug, Clone)]
pub struct SharedLocator {
    current: Arc<RwLock<NodeHandle>>,
}

impl SharedLocator {
    pub fn new(system_table_host: NodeHandle) -> Self {
        SharedLocator {
            current: Arc::new(RwLock::new(system_table_host)),
        }
    }
}

#[async_trait]
impl DirectoryLocator for SharedLocator {
    async fn current(&self) -> Result<NodeHandle> {
        Ok(self.current.read().clone())
    }

    async fn compare_and_set(&self, expected: &NodeHandle, new_host: &NodeHandle) -> Result<()> {
        let mut current = self.current.write();
        if &*current != expected {
            return Err(MetaError::LocationChanged {
                role: RoleId::SystemTable,
                expected: expected.clone(),
                found: current.clone(),
            });
        }
        *current = new_host.clone();
        Ok(())
    }
}

/// Start a node backed by a [`MemoryReplicaStore`] and register it with the
/// transport.
///
/// If `system_table` is true, the node also hosts a fresh System Table.
pub fn start_inprocess_node(
    transport: &InProcessTransport,
    address: &str,
    system_table: bool,
) -> (Arc<NodeServices>, Arc<MemoryReplicaStore>) {
    let handle = NodeHandle::new(address);
    let store = Arc::new(MemoryReplicaStore::new(address));
    let node = Arc::new(NodeServices::new(handle.clone(), store.clone()));
    if system_table {
        node.host_system_table(Arc::new(SystemTable::new(handle)));
    }
    transport.add_node(node.clone());
    (node, store)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unreachable_after_connect() {
        let transport = InProcessTransport::new();
        let (n1, _) = start_inprocess_node(&transport, "n1", true);

        let client = transport.connect(n1.handle()).await.unwrap();
        client
            .lookup(&TableIdentity::new("public", "t"))
            .await
            .unwrap();

        transport.set_reachable("n1", false);
        assert!(
            client
                .lookup(&TableIdentity::new("public", "t"))
                .await
                .unwrap_err()
                .is_unreachable()
        );
        assert!(transport.connect(n1.handle()).await.is_err());

        transport.set_reachable("n1", true);
        client
            .lookup(&TableIdentity::new("public", "t"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn unknown_node_is_unreachable() {
        let transport = InProcessTransport::new();
        let err = transport
            .connect(&NodeHandle::new("nowhere"))
            .await
            .err()
            .unwrap();
        assert!(err.is_unreachable());
    }

    #[tokio::test]
    async fn locator_compare_and_set() {
        let (n1, n2, n3) = (
            NodeHandle::new("n1"),
            NodeHandle::new("n2"),
            NodeHandle::new("n3"),
        );
        let locator = SharedLocator::new(n1.clone());
        locator.compare_and_set(&n1, &n2).await.unwrap();
        assert!(locator.compare_and_set(&n1, &n3).await.is_err());
        assert_eq!(n2, locator.current().await.unwrap());
    }
}
