//! Instrumented in-memory driver shared by the integration tests
//!
//! Statements are not parsed. Anything containing `INVALID` fails, `SELECT`
//! returns a single row and everything else affects one row. Statements run
//! inside a transaction are only counted as committed once the commit goes
//! through, which is enough to observe atomicity from the outside.

#![allow(dead_code)]

use async_trait::async_trait;
use multidb_connector::core::{
    duration_millis, ConnectionPool, ConnectorConfig, DatabaseError, DatabaseRow, DatabaseValue, Driver,
    ModuleConfig, PoolSettings, PoolStatus, QueryOutput, RawConnection, ReleaseMode, Result,
};
use multidb_connector::Connector;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Counters and failure switches observed by the tests
#[derive(Default)]
pub struct MockState {
    pub acquires: AtomicUsize,
    pub releases: AtomicUsize,
    pub discards: AtomicUsize,
    pub begins: AtomicUsize,
    pub commits: AtomicUsize,
    pub rollbacks: AtomicUsize,
    pub pools_created: AtomicUsize,

    /// Modules whose pool refuses every acquire
    pub failing_modules: Mutex<HashSet<String>>,
    pub fail_begin: AtomicBool,
    pub fail_commit: AtomicBool,
    pub fail_rollback: AtomicBool,

    /// Every statement that reached a connection, in order
    pub executed: Mutex<Vec<String>>,
    /// Statements whose effects are durable
    pub committed: Mutex<Vec<String>>,

    /// Highest number of simultaneous holders seen for any one connection
    pub max_concurrent_use: AtomicUsize,
    in_use: Mutex<HashMap<usize, usize>>,
    next_id: AtomicUsize,
}

impl MockState {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn count(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }

    pub fn set(flag: &AtomicBool, value: bool) {
        flag.store(value, Ordering::SeqCst);
    }

    /// Make every acquire on `module` fail as if the server refused the connection
    pub fn fail_acquire_for(&self, module: &str) {
        self.failing_modules.lock().insert(module.to_string());
    }

    /// Let `module` hand out connections again
    pub fn restore_acquire_for(&self, module: &str) {
        self.failing_modules.lock().remove(module);
    }

    /// Total connections given back, whichever way
    pub fn closes(&self) -> usize {
        Self::count(&self.releases) + Self::count(&self.discards)
    }

    pub fn executed(&self) -> Vec<String> {
        self.executed.lock().clone()
    }

    pub fn committed(&self) -> Vec<String> {
        self.committed.lock().clone()
    }

    fn check_out(&self, id: usize) {
        let mut in_use = self.in_use.lock();
        let holders = in_use.entry(id).or_insert(0);
        *holders += 1;
        self.max_concurrent_use
            .fetch_max(*holders, Ordering::SeqCst);
    }

    fn check_in(&self, id: usize) {
        let mut in_use = self.in_use.lock();
        if let Some(holders) = in_use.get_mut(&id) {
            *holders = holders.saturating_sub(1);
        }
    }
}

/// Driver handing out [`MockPool`]s that share one [`MockState`]
pub struct MockDriver {
    state: Arc<MockState>,
}

impl MockDriver {
    pub fn new(state: Arc<MockState>) -> Self {
        Self { state }
    }
}

impl Driver for MockDriver {
    fn create_pool(
        &self,
        module: &str,
        _config: &ModuleConfig,
        settings: &PoolSettings,
    ) -> Result<Arc<dyn ConnectionPool>> {
        self.state.pools_created.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(MockPool {
            module: module.to_string(),
            state: Arc::clone(&self.state),
            permits: Arc::new(Semaphore::new(settings.max_size)),
            max_size: settings.max_size,
            acquire_timeout: settings.acquire_timeout,
            idle: Arc::new(Mutex::new(Vec::new())),
        }))
    }
}

pub struct MockPool {
    module: String,
    state: Arc<MockState>,
    permits: Arc<Semaphore>,
    max_size: usize,
    acquire_timeout: Duration,
    idle: Arc<Mutex<Vec<usize>>>,
}

#[async_trait]
impl ConnectionPool for MockPool {
    async fn acquire(&self) -> Result<Box<dyn RawConnection>> {
        if self.state.failing_modules.lock().contains(&self.module) {
            return Err(DatabaseError::connection_failed(
                format!("mock://{}", self.module),
                "connection refused",
            ));
        }

        let permit = tokio::time::timeout(
            self.acquire_timeout,
            Arc::clone(&self.permits).acquire_owned(),
        )
        .await
        .map_err(|_| DatabaseError::pool_exhausted(&self.module, duration_millis(self.acquire_timeout)))?
        .map_err(|_| DatabaseError::connection("pool closed"))?;

        let id = self
            .idle
            .lock()
            .pop()
            .unwrap_or_else(|| self.state.next_id.fetch_add(1, Ordering::SeqCst));

        self.state.acquires.fetch_add(1, Ordering::SeqCst);
        self.state.check_out(id);

        Ok(Box::new(MockConnection {
            id,
            state: Arc::clone(&self.state),
            idle: Arc::clone(&self.idle),
            _permit: permit,
            pending: Vec::new(),
            in_transaction: false,
        }))
    }

    fn status(&self) -> PoolStatus {
        let checked_out = self.max_size - self.permits.available_permits();
        let idle = self.idle.lock().len();
        PoolStatus {
            size: checked_out + idle,
            available: idle,
            waiting: 0,
        }
    }

    async fn close(&self) {
        self.permits.close();
    }
}

pub struct MockConnection {
    id: usize,
    state: Arc<MockState>,
    idle: Arc<Mutex<Vec<usize>>>,
    _permit: OwnedSemaphorePermit,
    pending: Vec<String>,
    in_transaction: bool,
}

#[async_trait]
impl RawConnection for MockConnection {
    async fn query(&mut self, sql: &str, _params: &[DatabaseValue]) -> Result<QueryOutput> {
        // give interleaved callers a chance to run
        tokio::task::yield_now().await;

        self.state.executed.lock().push(sql.to_string());
        if sql.contains("INVALID") {
            return Err(DatabaseError::query(format!("syntax error near '{}'", sql)));
        }

        if sql.trim_start().to_uppercase().starts_with("SELECT") {
            let mut row = DatabaseRow::new();
            row.insert("1".to_string(), DatabaseValue::Int(1));
            return Ok(QueryOutput::from_rows(vec![row]));
        }

        if self.in_transaction {
            self.pending.push(sql.to_string());
        } else {
            self.state.committed.lock().push(sql.to_string());
        }
        Ok(QueryOutput::from_affected(1, None))
    }

    async fn begin(&mut self) -> Result<()> {
        self.state.begins.fetch_add(1, Ordering::SeqCst);
        if self.state.fail_begin.load(Ordering::SeqCst) {
            return Err(DatabaseError::connection("begin rejected"));
        }
        self.in_transaction = true;
        Ok(())
    }

    async fn commit(&mut self) -> Result<()> {
        self.state.commits.fetch_add(1, Ordering::SeqCst);
        if self.state.fail_commit.load(Ordering::SeqCst) {
            return Err(DatabaseError::connection("commit rejected"));
        }
        self.state.committed.lock().append(&mut self.pending);
        self.in_transaction = false;
        Ok(())
    }

    async fn rollback(&mut self) -> Result<()> {
        self.state.rollbacks.fetch_add(1, Ordering::SeqCst);
        if self.state.fail_rollback.load(Ordering::SeqCst) {
            return Err(DatabaseError::connection("rollback rejected"));
        }
        self.pending.clear();
        self.in_transaction = false;
        Ok(())
    }

    async fn release(self: Box<Self>, mode: ReleaseMode) -> Result<()> {
        self.state.check_in(self.id);
        match mode {
            ReleaseMode::Return => {
                self.state.releases.fetch_add(1, Ordering::SeqCst);
                self.idle.lock().push(self.id);
            }
            ReleaseMode::Discard => {
                self.state.discards.fetch_add(1, Ordering::SeqCst);
            }
        }
        Ok(())
    }
}

/// Configuration with one module per name. The mock ignores the target.
pub fn config(modules: &[&str]) -> ConnectorConfig {
    modules.iter().fold(
        ConnectorConfig::new().with_pool(
            PoolSettings::default()
                .with_max_size(4)
                .with_acquire_timeout(Duration::from_secs(2)),
        ),
        |config, name| config.module(*name, ModuleConfig::sqlite(format!("{}.db", name))),
    )
}

/// Route connector logs to the test harness; `RUST_LOG` picks the level
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Connector over the mock driver with the given modules
pub fn mock_connector(modules: &[&str]) -> (Connector, Arc<MockState>) {
    init_tracing();
    let state = MockState::new();
    let connector = Connector::with_driver(config(modules), &MockDriver::new(Arc::clone(&state)));
    (connector, state)
}
