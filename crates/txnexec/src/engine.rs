use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use tablemeta::node::NodeServices;
use tablemeta::rpc::{DirectoryLocator, Transport};
use tablemeta::types::{ManagerRecord, ManagerState, NodeHandle, TableIdentity};
use tracing::{error, info};

use crate::config::ExecConfig;
use crate::deadlock::WaitForGraph;
use crate::directory::LocationDirectory;
use crate::errors::{ExecError, Result};
use crate::lock::LockBroker;
use crate::memory::MemoryReserve;
use crate::migrate::RoleMigrator;
use crate::propagate::ReplicaPropagator;
use crate::session::Session;

/// Entry point for executing statements on one node.
#[derive(Debug)]
pub struct Engine {
    node: Arc<NodeServices>,
    config: ExecConfig,
    directory: Arc<LocationDirectory>,
    broker: LockBroker,
    propagator: ReplicaPropagator,
    migrator: RoleMigrator,
    /// Bumped on every schema change, prepared statements built against an
    /// older version are recompiled.
    schema_version: AtomicU64,
    next_session_id: AtomicU64,
    closed: AtomicBool,
    reserve: MemoryReserve,
}

impl Engine {
    pub fn new(
        node: Arc<NodeServices>,
        transport: Arc<dyn Transport>,
        locator: Arc<dyn DirectoryLocator>,
        config: ExecConfig,
    ) -> Result<Arc<Engine>> {
        config.validate()?;

        let directory = Arc::new(LocationDirectory::new(
            node.clone(),
            transport.clone(),
            locator,
            config.search_remote,
        )
        .with_release_wait(config.lock_timeout));
        let waits = Arc::new(WaitForGraph::new());

        Ok(Arc::new(Engine {
            broker: LockBroker::new(directory.clone(), waits),
            propagator: ReplicaPropagator::new(node.clone(), transport),
            migrator: RoleMigrator::new(directory.clone()),
            reserve: MemoryReserve::new(config.memory_reserve_bytes),
            node,
            config,
            directory,
            schema_version: AtomicU64::new(0),
            next_session_id: AtomicU64::new(1),
            closed: AtomicBool::new(false),
        }))
    }

    pub fn new_session(self: &Arc<Self>) -> Result<Session> {
        self.check_open()?;
        let id = self.next_session_id.fetch_add(1, Ordering::Relaxed);
        Ok(Session::new(id, self.clone()))
    }

    pub fn node(&self) -> &NodeHandle {
        self.node.handle()
    }

    pub fn services(&self) -> &Arc<NodeServices> {
        &self.node
    }

    pub fn config(&self) -> &ExecConfig {
        &self.config
    }

    pub fn directory(&self) -> &Arc<LocationDirectory> {
        &self.directory
    }

    pub fn broker(&self) -> &LockBroker {
        &self.broker
    }

    pub fn propagator(&self) -> &ReplicaPropagator {
        &self.propagator
    }

    pub fn migrator(&self) -> &RoleMigrator {
        &self.migrator
    }

    pub fn reserve(&self) -> &MemoryReserve {
        &self.reserve
    }

    pub fn schema_version(&self) -> u64 {
        self.schema_version.load(Ordering::Acquire)
    }

    /// Invalidate every prepared statement plan.
    pub fn bump_schema_version(&self) -> u64 {
        self.schema_version.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Mark this node as active (or not) in the directory. Only replicas on
    /// active nodes are candidates for remote links.
    pub async fn set_active(&self, active: bool) -> Result<()> {
        let client = self.directory.system_table_client().await?;
        client.set_node_active(self.node(), active).await?;
        Ok(())
    }

    /// Register a new table whose manager lives on this node.
    pub async fn create_table(&self, table: &TableIdentity, replicas: &[NodeHandle]) -> Result<()> {
        self.check_open()?;
        let replicas: BTreeSet<_> = if replicas.is_empty() {
            [self.node().clone()].into_iter().collect()
        } else {
            replicas.iter().cloned().collect()
        };

        let client = self.directory.system_table_client().await?;
        if client.lookup(table).await?.is_some() {
            return Err(ExecError::TableExists(table.clone()));
        }

        self.node
            .host_manager_from_state(ManagerState::fresh(table.clone(), replicas.clone()));
        let record = ManagerRecord::new(table.clone(), self.node().clone(), replicas);
        if let Err(e) = client.register_table(record).await {
            self.node.drop_manager(table);
            return Err(e.into());
        }

        self.directory.cache_location(table, self.node().clone());
        self.bump_schema_version();
        info!(%table, "created table");
        Ok(())
    }

    /// Remove a table from the directory. Its manager stops serving.
    pub async fn drop_table(&self, table: &TableIdentity) -> Result<()> {
        self.check_open()?;
        let client = self.directory.system_table_client().await?;
        let record = client
            .remove_table(table)
            .await?
            .ok_or_else(|| ExecError::TableOrViewNotFound(table.clone()))?;

        if &record.host == self.node() {
            self.node.drop_manager(table);
        }
        self.directory.invalidate(table);
        self.bump_schema_version();
        info!(%table, "dropped table");
        Ok(())
    }

    /// Stop executing statements on this node. Used when rolling back after
    /// running out of memory fails too, the node's state can no longer be
    /// trusted.
    pub fn shutdown_immediately(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            error!(node = %self.node(), "shutting down immediately");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn check_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(ExecError::DatabaseClosed);
        }
        Ok(())
    }
}
