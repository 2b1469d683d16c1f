use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tablemeta::local::{InProcessTransport, SharedLocator, start_inprocess_node};
use tablemeta::node::NodeServices;
use tablemeta::replica::MemoryReplicaStore;
use tablemeta::types::{NodeHandle, TableIdentity};
use txnexec::config::ExecConfig;
use txnexec::engine::Engine;
use txnexec::errors::Result;
use txnexec::session::Session;
use txnexec::statement::{
    ExecContext, ExecOutcome, PreparedStatement, Value, substitute_parameters,
};

#[allow(dead_code)]
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

#[allow(dead_code)]
pub fn test_config() -> ExecConfig {
    ExecConfig {
        lock_timeout: Duration::from_secs(2),
        deadlock_check_interval: Duration::from_millis(20),
        concurrent_update_backoff: Duration::from_millis(10),
        ..Default::default()
    }
}

pub struct TestNode {
    pub services: Arc<NodeServices>,
    pub store: Arc<MemoryReplicaStore>,
    pub engine: Arc<Engine>,
}

impl TestNode {
    #[allow(dead_code)]
    pub fn handle(&self) -> &NodeHandle {
        self.services.handle()
    }

    #[allow(dead_code)]
    pub fn session(&self) -> Arc<Session> {
        Arc::new(self.engine.new_session().unwrap())
    }
}

/// Nodes `n1`..`nN` in one process. `n1` starts out hosting the System
/// Table. Every node is active.
pub struct TestCluster {
    pub transport: InProcessTransport,
    pub locator: Arc<SharedLocator>,
    pub nodes: Vec<TestNode>,
}

#[allow(dead_code)]
impl TestCluster {
    pub async fn new(size: usize) -> TestCluster {
        Self::with_config(size, test_config()).await
    }

    pub async fn with_config(size: usize, config: ExecConfig) -> TestCluster {
        logutil::init_test();

        let transport = InProcessTransport::new();
        let mut started = Vec::with_capacity(size);
        for i in 0..size {
            let address = format!("n{}", i + 1);
            started.push(start_inprocess_node(&transport, &address, i == 0));
        }
        let locator = Arc::new(SharedLocator::new(started[0].0.handle().clone()));

        let mut nodes = Vec::with_capacity(size);
        for (services, store) in started {
            let engine = Engine::new(
                services.clone(),
                Arc::new(transport.clone()),
                locator.clone(),
                config.clone(),
            )
            .unwrap();
            engine.set_active(true).await.unwrap();
            nodes.push(TestNode {
                services,
                store,
                engine,
            });
        }

        TestCluster {
            transport,
            locator,
            nodes,
        }
    }

    /// Node by its number, `node(1)` is `n1`.
    pub fn node(&self, n: usize) -> &TestNode {
        &self.nodes[n - 1]
    }

    pub fn handles(&self, ns: &[usize]) -> Vec<NodeHandle> {
        ns.iter().map(|n| self.node(*n).handle().clone()).collect()
    }

    /// Create a table with its manager on `owner` and copies on `replicas`.
    pub async fn create_table(&self, owner: usize, name: &str, replicas: &[usize]) -> TableIdentity {
        let table = TableIdentity::parse(name).unwrap();
        self.node(owner)
            .engine
            .create_table(&table, &self.handles(replicas))
            .await
            .unwrap();
        for n in replicas {
            self.node(*n).store.add_table(table.clone());
        }
        table
    }
}

/// Scripted statement.
///
/// Mutations executed locally apply their substituted text to the local
/// store. Queries return the configured rows.
#[derive(Debug, Clone)]
pub struct TestStatement {
    pub sql: String,
    pub query: bool,
    pub transactional: bool,
    pub params: Vec<Value>,
    pub tables: Vec<TableIdentity>,
    pub rows: Vec<Vec<Value>>,
    pub modification_id: u64,
    pub always_recompile: bool,
    pub recompiles: usize,
    /// Units of work done while executing, with a cancellation checkpoint
    /// before each.
    pub steps: usize,
    pub step_duration: Duration,
    /// Tracks how many statements sharing the probe execute at once.
    pub probe: Option<Arc<ConcurrencyProbe>>,
}

#[allow(dead_code)]
impl TestStatement {
    pub fn query(sql: &str, tables: &[&TableIdentity]) -> Self {
        TestStatement {
            sql: sql.to_string(),
            query: true,
            transactional: true,
            params: Vec::new(),
            tables: tables.iter().map(|t| (*t).clone()).collect(),
            rows: vec![vec![Value::Int(1)]],
            modification_id: 0,
            always_recompile: false,
            recompiles: 0,
            steps: 0,
            step_duration: Duration::ZERO,
            probe: None,
        }
    }

    pub fn update(sql: &str, tables: &[&TableIdentity]) -> Self {
        TestStatement {
            query: false,
            rows: Vec::new(),
            ..Self::query(sql, tables)
        }
    }

    pub fn with_params(mut self, params: Vec<Value>) -> Self {
        self.params = params;
        self
    }

    pub fn non_transactional(mut self) -> Self {
        self.transactional = false;
        self
    }

    pub fn with_work(mut self, steps: usize, step_duration: Duration) -> Self {
        self.steps = steps;
        self.step_duration = step_duration;
        self
    }

    pub fn with_probe(mut self, probe: Arc<ConcurrencyProbe>) -> Self {
        self.probe = Some(probe);
        self
    }
}

#[async_trait]
impl PreparedStatement for TestStatement {
    fn sql(&self) -> &str {
        &self.sql
    }

    fn is_query(&self) -> bool {
        self.query
    }

    fn is_transactional(&self) -> bool {
        self.transactional
    }

    fn is_read_only(&self) -> bool {
        self.query
    }

    fn parameters(&self) -> &[Value] {
        &self.params
    }

    fn tables(&self) -> Vec<TableIdentity> {
        self.tables.clone()
    }

    fn modification_id(&self) -> u64 {
        self.modification_id
    }

    fn always_recompile(&self) -> bool {
        self.always_recompile
    }

    async fn recompile(&mut self, modification_id: u64) -> Result<()> {
        self.modification_id = modification_id;
        self.recompiles += 1;
        Ok(())
    }

    async fn execute(&self, ctx: &ExecContext<'_>) -> Result<ExecOutcome> {
        let _guard = self.probe.as_ref().map(|p| p.enter());
        for _ in 0..self.steps {
            ctx.checkpoint()?;
            tokio::time::sleep(self.step_duration).await;
        }

        if self.query {
            return Ok(ExecOutcome::Rows(self.rows.clone()));
        }
        let sql = substitute_parameters(&self.sql, &self.params)?;
        let count = ctx.store().apply(ctx.txn(), &sql).await?;
        Ok(ExecOutcome::UpdateCount(count))
    }
}

/// Records the highest number of holders seen at once.
#[derive(Debug, Default)]
pub struct ConcurrencyProbe {
    current: AtomicUsize,
    max: AtomicUsize,
}

#[allow(dead_code)]
impl ConcurrencyProbe {
    pub fn enter(&self) -> ProbeGuard<'_> {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.max.fetch_max(now, Ordering::SeqCst);
        ProbeGuard { probe: self }
    }

    pub fn max(&self) -> usize {
        self.max.load(Ordering::SeqCst)
    }
}

pub struct ProbeGuard<'a> {
    probe: &'a ConcurrencyProbe,
}

impl Drop for ProbeGuard<'_> {
    fn drop(&mut self) {
        self.probe.current.fetch_sub(1, Ordering::SeqCst);
    }
}
