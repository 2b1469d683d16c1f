//! Resolve tables to the node hosting their Table Manager.
//!
//! The directory answer can be stale by the time it's used: the manager may
//! have migrated (it answers "moved") or died (calls to it fail). Lock
//! requests go through [`LocationDirectory::lock_proxy`] which handles both,
//! re-resolving once on a move and recreating the manager once on a failure.
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::RwLock;
use tablemeta::errors::MetaError;
use tablemeta::node::NodeServices;
use tablemeta::rpc::{DirectoryLocator, NodeClient, Transport};
use tablemeta::types::{
    LockClass, LockGrant, LockResponse, ManagerRecord, ManagerState, MigrationState, NodeHandle,
    RoleId, TableIdentity, TxnName,
};
use tokio::time::Instant;
use tracing::{Instrument, debug, debug_span, info, warn};

use crate::config::DEFAULT_LOCK_TIMEOUT;
use crate::errors::{ExecError, Result};

/// How often a release refused by a migrating manager is retried.
const RELEASE_RETRY_INTERVAL: Duration = Duration::from_millis(10);

/// Counters for diagnostics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DirectoryStats {
    /// Lock requests re-resolved after the manager answered "moved".
    pub moved_retries: u64,
    /// Managers rebuilt after the previous one failed.
    pub recreations: u64,
    /// Tables without a directory record linked to a remote replica.
    pub remote_links: u64,
}

#[derive(Debug, Default)]
struct Counters {
    moved_retries: AtomicU64,
    recreations: AtomicU64,
    remote_links: AtomicU64,
}

/// Client side of the location service for one node.
pub struct LocationDirectory {
    node: Arc<NodeServices>,
    transport: Arc<dyn Transport>,
    locator: Arc<dyn DirectoryLocator>,
    /// Last known manager host per table. Never held across a call.
    cache: RwLock<HashMap<TableIdentity, NodeHandle>>,
    /// Tables served through a link to a remote replica.
    links: RwLock<HashMap<TableIdentity, NodeHandle>>,
    search_remote: bool,
    /// How long a release waits for a manager migration to finish.
    release_wait: Duration,
    counters: Counters,
}

impl std::fmt::Debug for LocationDirectory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocationDirectory")
            .field("node", self.node.handle())
            .field("search_remote", &self.search_remote)
            .finish_non_exhaustive()
    }
}

impl LocationDirectory {
    pub fn new(
        node: Arc<NodeServices>,
        transport: Arc<dyn Transport>,
        locator: Arc<dyn DirectoryLocator>,
        search_remote: bool,
    ) -> Self {
        LocationDirectory {
            node,
            transport,
            locator,
            cache: RwLock::new(HashMap::new()),
            links: RwLock::new(HashMap::new()),
            search_remote,
            release_wait: DEFAULT_LOCK_TIMEOUT,
            counters: Counters::default(),
        }
    }

    pub fn with_release_wait(mut self, release_wait: Duration) -> Self {
        self.release_wait = release_wait;
        self
    }

    pub fn node(&self) -> &Arc<NodeServices> {
        &self.node
    }

    pub fn stats(&self) -> DirectoryStats {
        DirectoryStats {
            moved_retries: self.counters.moved_retries.load(Ordering::Relaxed),
            recreations: self.counters.recreations.load(Ordering::Relaxed),
            remote_links: self.counters.remote_links.load(Ordering::Relaxed),
        }
    }

    /// Get a client for a node. Calls to the local node still go through
    /// the transport.
    pub async fn connect(&self, node: &NodeHandle) -> Result<Arc<dyn NodeClient>> {
        Ok(self.transport.connect(node).await?)
    }

    /// Client to whichever node currently hosts the System Table.
    pub async fn system_table_client(&self) -> Result<Arc<dyn NodeClient>> {
        let host = self.locator.current().await?;
        self.connect(&host).await
    }

    pub fn locator(&self) -> &Arc<dyn DirectoryLocator> {
        &self.locator
    }

    /// Remember where a table's manager lives.
    pub fn cache_location(&self, table: &TableIdentity, host: NodeHandle) {
        self.cache.write().insert(table.clone(), host);
    }

    pub fn invalidate(&self, table: &TableIdentity) {
        self.cache.write().remove(table);
        self.links.write().remove(table);
    }

    /// If the table is served through a link to a remote replica.
    pub fn linked_replica(&self, table: &TableIdentity) -> Option<NodeHandle> {
        self.links.read().get(table).cloned()
    }

    /// Fetch the directory record for a table.
    ///
    /// If the System Table moved between reading the locator and calling
    /// it, the locator is read once more.
    pub async fn lookup_record(&self, table: &TableIdentity) -> Result<Option<ManagerRecord>> {
        let client = self.system_table_client().await.map_err(|e| directory_failure(table, e))?;
        match client.lookup(table).await {
            Ok(record) => Ok(record),
            Err(MetaError::Moved { .. }) => {
                debug!(%table, "system table moved during lookup, retrying");
                let client = self
                    .system_table_client()
                    .await
                    .map_err(|e| directory_failure(table, e))?;
                client.lookup(table).await.map_err(|e| directory_failure(table, e))
            }
            Err(e) => Err(directory_failure(table, e)),
        }
    }

    /// Resolve the node hosting the table's manager.
    ///
    /// Metadata tables resolve locally without any remote call. Other
    /// tables resolve from the cache, which the create, migrate and recreate
    /// paths keep pointing at this node for managers hosted here. A manager
    /// hosted here is never trusted on its own, the directory may have
    /// moved the role elsewhere. Returns `None` if the directory has no
    /// record for the table.
    pub async fn resolve(
        &self,
        table: &TableIdentity,
        bypass_cache: bool,
    ) -> Result<Option<NodeHandle>> {
        if table.is_system() {
            return Ok(Some(self.node.handle().clone()));
        }

        if !bypass_cache {
            if let Some(host) = self.cache.read().get(table).cloned() {
                return Ok(Some(host));
            }
        }

        let record = self.lookup_record(table).await?;
        match record {
            Some(record) => {
                self.cache_location(table, record.host.clone());
                Ok(Some(record.host))
            }
            None => {
                self.cache.write().remove(table);
                Ok(None)
            }
        }
    }

    /// Request a lock from the table's manager, wherever it currently is.
    ///
    /// `Moved` answers and manager failures are handled here and never
    /// returned. `Waiting` and `Migrating` answers are returned for the
    /// caller to poll.
    pub async fn lock_proxy(
        &self,
        table: &TableIdentity,
        class: LockClass,
        txn: &TxnName,
        allow_remote_search: bool,
    ) -> Result<LockResponse> {
        if let Some(replica) = self.linked_replica(table) {
            return Ok(linked_grant(table, class, txn, replica));
        }

        let host = match self.resolve(table, false).await? {
            Some(host) => host,
            None => return self.link_remote(table, class, txn, allow_remote_search).await,
        };

        let span = debug_span!("lock_proxy", %table, %txn, %class, %host);
        match self.request_from(&host, table, class, txn).instrument(span).await {
            Ok(LockResponse::Moved) => self.after_moved(table, class, txn, allow_remote_search).await,
            Ok(resp) => Ok(resp),
            Err(e) => self.after_failure(table, class, txn, &host, e).await,
        }
    }

    /// Re-resolve bypassing the cache and retry once. A second move is a
    /// directory failure, unless the record shows the migration hasn't
    /// finished, in which case the caller keeps polling.
    async fn after_moved(
        &self,
        table: &TableIdentity,
        class: LockClass,
        txn: &TxnName,
        allow_remote_search: bool,
    ) -> Result<LockResponse> {
        self.counters.moved_retries.fetch_add(1, Ordering::Relaxed);
        debug!(%table, %txn, "manager moved, re-resolving");

        let record = match self.lookup_record(table).await? {
            Some(record) => record,
            None => {
                self.cache.write().remove(table);
                return self.link_remote(table, class, txn, allow_remote_search).await;
            }
        };
        let host = record.host.clone();
        self.cache_location(table, host.clone());

        match self.request_from(&host, table, class, txn).await {
            Ok(LockResponse::Moved) if record.state == MigrationState::Migrating => {
                // The old instance retired but the record isn't updated yet.
                debug!(%table, %txn, "record still migrating, waiting");
                self.cache.write().remove(table);
                Ok(LockResponse::Migrating)
            }
            Ok(LockResponse::Moved) => {
                self.cache.write().remove(table);
                Err(ExecError::DirectoryFailure {
                    table: table.clone(),
                    reason: format!("manager moved again after re-resolving to {host}"),
                })
            }
            Ok(resp) => Ok(resp),
            Err(e) => self.after_failure(table, class, txn, &host, e).await,
        }
    }

    /// Recreate the manager once and retry against the new instance.
    async fn after_failure(
        &self,
        table: &TableIdentity,
        class: LockClass,
        txn: &TxnName,
        failed_host: &NodeHandle,
        err: MetaError,
    ) -> Result<LockResponse> {
        self.cache.write().remove(table);

        // Only recreate if the directory still names the failed host, the
        // manager may have moved in the meantime.
        if let Ok(Some(record)) = self.lookup_record(table).await {
            if &record.host != failed_host {
                debug!(%table, host = %record.host, "manager relocated, retrying");
                self.cache_location(table, record.host.clone());
                return match self.request_from(&record.host, table, class, txn).await {
                    Ok(resp) => Ok(resp),
                    Err(e) => Err(ExecError::ManagerUnreachable {
                        table: table.clone(),
                        reason: e.to_string(),
                    }),
                };
            }
        }

        warn!(%table, host = %failed_host, %err, "table manager failed, recreating");
        let host = self
            .recreate_manager(table)
            .await
            .map_err(|recreate_err| ExecError::ManagerUnreachable {
                table: table.clone(),
                reason: format!("{err}; recreation failed: {recreate_err}"),
            })?;

        match self.request_from(&host, table, class, txn).await {
            Ok(LockResponse::Moved) => Err(ExecError::DirectoryFailure {
                table: table.clone(),
                reason: format!("recreated manager on {host} reports moved"),
            }),
            Ok(resp) => Ok(resp),
            Err(e) => Err(ExecError::ManagerUnreachable {
                table: table.clone(),
                reason: e.to_string(),
            }),
        }
    }

    async fn request_from(
        &self,
        host: &NodeHandle,
        table: &TableIdentity,
        class: LockClass,
        txn: &TxnName,
    ) -> Result<LockResponse, MetaError> {
        if host == self.node.handle() {
            return Ok(self.node.manager(table)?.request_lock(class, txn));
        }
        let client = self.transport.connect(host).await?;
        client.request_lock(table, class, txn).await
    }

    /// Release every lock `txn` holds on a table.
    ///
    /// A manager preparing for a migration refuses the release, it's
    /// retried until the migration finishes or is abandoned. If the manager
    /// moved since the lock was granted, the release follows it.
    pub async fn release(&self, table: &TableIdentity, txn: &TxnName, committed: bool) -> Result<()> {
        if table.is_system() || self.linked_replica(table).is_some() {
            return Ok(());
        }

        let deadline = Instant::now() + self.release_wait;
        let mut bypass_cache = false;
        loop {
            let host = match self.resolve(table, bypass_cache).await? {
                Some(host) => host,
                None => return Ok(()),
            };

            let err = match self.release_at(&host, table, txn, committed).await {
                Ok(_) => return Ok(()),
                Err(e) => e,
            };
            let retry = match &err {
                MetaError::MigrationInProgress { .. } => true,
                MetaError::Moved { .. } => match self.lookup_record(table).await? {
                    None => return Ok(()),
                    Some(record) if record.host != host => {
                        debug!(%table, %txn, to = %record.host, "manager moved, following for release");
                        bypass_cache = true;
                        continue;
                    }
                    // Retired, but the record hasn't been pointed elsewhere
                    // yet.
                    Some(record) => record.state == MigrationState::Migrating,
                },
                _ => false,
            };
            if !retry || Instant::now() >= deadline {
                return Err(err.into());
            }

            debug!(%table, %txn, "manager migrating, retrying release");
            tokio::time::sleep(RELEASE_RETRY_INTERVAL).await;
            bypass_cache = true;
        }
    }

    async fn release_at(
        &self,
        host: &NodeHandle,
        table: &TableIdentity,
        txn: &TxnName,
        committed: bool,
    ) -> Result<u64, MetaError> {
        if host == self.node.handle() {
            return self.node.manager(table)?.release_lock(txn, committed);
        }
        let client = self.transport.connect(host).await?;
        client.release_lock(table, txn, committed).await
    }

    /// Build a fresh manager for the table on this node from its directory
    /// record, and point the record at it.
    ///
    /// Lock state held by the failed instance is lost. If another node
    /// recreated the manager first, its location is returned instead.
    pub async fn recreate_manager(&self, table: &TableIdentity) -> Result<NodeHandle> {
        let client = self.system_table_client().await?;
        let record = client
            .lookup(table)
            .await?
            .ok_or_else(|| ExecError::TableOrViewNotFound(table.clone()))?;

        let me = self.node.handle().clone();
        let role = RoleId::TableManager(table.clone());
        let fenced = if record.host != me {
            self.fence(&record.host, &role, &me).await?
        } else {
            None
        };

        let previous = self.node.drop_manager(table);
        self.node
            .host_manager_from_state(ManagerState::fresh(table.clone(), record.replicas.clone()));

        match client.update_manager_location(table, &record.host, &me).await {
            Ok(()) => {
                self.counters.recreations.fetch_add(1, Ordering::Relaxed);
                info!(%table, old_host = %record.host, "recreated table manager");
                self.cache_location(table, me.clone());
                self.retire(fenced, &role).await;
                Ok(me)
            }
            Err(MetaError::LocationChanged { found, .. }) => {
                debug!(%table, winner = %found, "manager recreated elsewhere");
                self.node.drop_manager(table);
                if let Some(previous) = previous {
                    self.node.host_manager(previous);
                }
                self.cache_location(table, found.clone());
                // The record no longer names the old host either.
                self.retire(fenced, &role).await;
                Ok(found)
            }
            Err(e) => {
                self.node.drop_manager(table);
                if let Some(previous) = previous {
                    self.node.host_manager(previous);
                }
                if let Some(old) = fenced {
                    if let Err(e) = old.abort_migration(&role).await {
                        warn!(%role, %e, "failed to reactivate fenced manager");
                    }
                }
                Err(e.into())
            }
        }
    }

    /// Stop the previous manager instance from admitting requests while it's
    /// being replaced.
    ///
    /// Returns a client to it if it was fenced, `None` if it can't be
    /// reached or isn't serving anyway.
    async fn fence(
        &self,
        host: &NodeHandle,
        role: &RoleId,
        me: &NodeHandle,
    ) -> Result<Option<Arc<dyn NodeClient>>> {
        let old = match self.transport.connect(host).await {
            Ok(old) => old,
            Err(e) => {
                warn!(%role, %host, %e, "previous manager unreachable, not fenced");
                return Ok(None);
            }
        };
        match old.prepare_for_migration(role, me).await {
            Ok(()) => Ok(Some(old)),
            Err(
                e @ (MetaError::Unreachable { .. }
                | MetaError::NoSuchManager { .. }
                | MetaError::AlreadyMoved { .. }),
            ) => {
                debug!(%role, %host, %e, "previous manager not serving, not fenced");
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn retire(&self, fenced: Option<Arc<dyn NodeClient>>, role: &RoleId) {
        if let Some(old) = fenced {
            if let Err(e) = old.complete_migration(role).await {
                warn!(%role, %e, "failed to retire previous manager");
            }
        }
    }

    /// Link to a remote replica of a table that has no directory record.
    ///
    /// Candidates are probed in the order the directory returns them,
    /// skipping this node and any that can't be reached.
    async fn link_remote(
        &self,
        table: &TableIdentity,
        class: LockClass,
        txn: &TxnName,
        allow_remote_search: bool,
    ) -> Result<LockResponse> {
        if !(self.search_remote && allow_remote_search) {
            return Err(ExecError::TableOrViewNotFound(table.clone()));
        }

        let client = self.system_table_client().await.map_err(|e| directory_failure(table, e))?;
        let candidates = client
            .active_replicas(table)
            .await
            .map_err(|e| directory_failure(table, e))?;

        for candidate in candidates {
            if &candidate == self.node.handle() {
                continue;
            }
            let accepted = match self.transport.connect(&candidate).await {
                Ok(remote) => remote.accept_link(table).await,
                Err(e) => Err(e),
            };
            match accepted {
                Ok(true) => {
                    self.counters.remote_links.fetch_add(1, Ordering::Relaxed);
                    info!(%table, replica = %candidate, "linked to remote replica");
                    self.links.write().insert(table.clone(), candidate.clone());
                    return Ok(linked_grant(table, class, txn, candidate));
                }
                Ok(false) => debug!(%table, replica = %candidate, "replica declined link"),
                Err(e) => debug!(%table, replica = %candidate, %e, "skipping unreachable replica"),
            }
        }

        Err(ExecError::TableOrViewNotFound(table.clone()))
    }
}

fn linked_grant(
    table: &TableIdentity,
    class: LockClass,
    txn: &TxnName,
    replica: NodeHandle,
) -> LockResponse {
    LockResponse::Granted(LockGrant {
        table: table.clone(),
        class,
        holder: txn.clone(),
        replicas: vec![replica],
        update_id: 0,
    })
}

fn directory_failure(table: &TableIdentity, err: impl std::fmt::Display) -> ExecError {
    ExecError::DirectoryFailure {
        table: table.clone(),
        reason: err.to_string(),
    }
}
