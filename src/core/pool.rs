//! One connection pool per module
//!
//! Pools are created eagerly when the manager is built and live as long as
//! the connector. A module whose configuration is invalid, or whose driver
//! refused to build a pool, is recorded in the ledger and has no pool.

use super::config::ConnectorConfig;
use super::connection::Connection;
use super::driver::{ConnectionPool, Driver, PoolStatus};
use super::error::{DatabaseError, ErrorKind};
use super::ledger::{ErrorLedger, ErrorRecord};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info};

/// Ledger component tag for pool failures
pub const POOL_COMPONENT: &str = "ConnectionPool";

/// Owns the module pools
pub struct PoolManager {
    pools: BTreeMap<String, Arc<dyn ConnectionPool>>,
    ledger: Arc<ErrorLedger>,
}

impl PoolManager {
    /// Create one pool for every configured module
    pub fn new(config: &ConnectorConfig, driver: &dyn Driver, ledger: Arc<ErrorLedger>) -> Self {
        let mut pools = BTreeMap::new();

        for (name, module) in &config.modules {
            if name.trim().is_empty() {
                ledger.record(
                    POOL_COMPONENT,
                    ErrorKind::Config,
                    DatabaseError::config(format!("invalid module name '{}'", name)),
                );
                continue;
            }

            let created = module
                .validate(name)
                .and_then(|_| driver.create_pool(name, module, &config.pool));

            match created {
                Ok(pool) => {
                    info!(
                        module = %name,
                        target = %module.redacted_url(),
                        max_size = config.pool.max_size,
                        "created connection pool"
                    );
                    pools.insert(name.clone(), pool);
                }
                Err(e) => {
                    let kind = e.kind();
                    ledger.record(POOL_COMPONENT, kind, e);
                }
            }
        }

        Self { pools, ledger }
    }

    /// A manager without pools, used when the connector configuration is rejected
    pub fn empty(ledger: Arc<ErrorLedger>) -> Self {
        Self {
            pools: BTreeMap::new(),
            ledger,
        }
    }

    /// Take a connection for `module`.
    ///
    /// Failures are recorded under the `ConnectionPool` component and the
    /// recorded entry is returned so callers can chain onto it.
    pub async fn acquire(&self, module: &str) -> Result<Connection, ErrorRecord> {
        let pool = self.pools.get(module).ok_or_else(|| {
            self.ledger.record(
                POOL_COMPONENT,
                ErrorKind::Pool,
                DatabaseError::unknown_module(module),
            )
        })?;

        match pool.acquire().await {
            Ok(raw) => {
                debug!(module = %module, "acquired connection");
                Ok(Connection::new(module, raw))
            }
            Err(e) => Err(self.ledger.record(POOL_COMPONENT, ErrorKind::Pool, e)),
        }
    }

    /// Whether a pool exists for `module`
    pub fn contains(&self, module: &str) -> bool {
        self.pools.contains_key(module)
    }

    /// Names of modules that have a pool, sorted
    pub fn module_names(&self) -> Vec<String> {
        self.pools.keys().cloned().collect()
    }

    /// Occupancy of a module's pool
    pub fn status(&self, module: &str) -> Option<PoolStatus> {
        self.pools.get(module).map(|pool| pool.status())
    }

    /// Close every pool
    pub async fn close_all(&self) {
        for (name, pool) in &self.pools {
            pool.close().await;
            info!(module = %name, "closed connection pool");
        }
    }
}

impl std::fmt::Debug for PoolManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolManager")
            .field("modules", &self.pools.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::{ModuleConfig, PoolSettings};
    use crate::core::driver::RawConnection;
    use crate::core::error::Result;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct IdlePool;

    #[async_trait]
    impl ConnectionPool for IdlePool {
        async fn acquire(&self) -> Result<Box<dyn RawConnection>> {
            Err(DatabaseError::connection("no connections in this pool"))
        }

        fn status(&self) -> PoolStatus {
            PoolStatus::default()
        }

        async fn close(&self) {}
    }

    #[derive(Default)]
    struct CountingDriver {
        created: AtomicUsize,
    }

    impl Driver for CountingDriver {
        fn create_pool(
            &self,
            _module: &str,
            _config: &ModuleConfig,
            _settings: &PoolSettings,
        ) -> Result<Arc<dyn ConnectionPool>> {
            self.created.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(IdlePool))
        }
    }

    #[cfg(feature = "sqlite")]
    #[test]
    fn test_blank_module_name_gets_no_pool() {
        let config = ConnectorConfig::new()
            .module("main", ModuleConfig::sqlite("main.db"))
            .module("  ", ModuleConfig::sqlite("blank.db"));
        let driver = CountingDriver::default();
        let ledger = Arc::new(ErrorLedger::new());

        let pools = PoolManager::new(&config, &driver, Arc::clone(&ledger));

        assert_eq!(pools.module_names(), vec!["main"]);
        assert!(!pools.contains("  "));
        assert_eq!(driver.created.load(Ordering::SeqCst), 1);

        let last = ledger.get_last_error().expect("blank name recorded");
        assert_eq!(last.kind, ErrorKind::Config);
        assert_eq!(last.component, POOL_COMPONENT);
    }

    #[test]
    fn test_empty_manager_has_no_pools() {
        let pools = PoolManager::empty(Arc::new(ErrorLedger::new()));
        assert!(pools.module_names().is_empty());
        assert!(pools.status("main").is_none());
    }

    #[tokio::test]
    async fn test_unknown_module_is_recorded() {
        let ledger = Arc::new(ErrorLedger::new());
        let pools = PoolManager::empty(Arc::clone(&ledger));

        let record = pools.acquire("missing").await.err().expect("no pool");
        assert_eq!(record.kind, ErrorKind::Pool);
        assert_eq!(ledger.len(), 1);
    }
}
