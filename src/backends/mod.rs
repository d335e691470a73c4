//! Database backend implementations
//!
//! Each backend provides a [`ConnectionPool`] for one kind of server.
//! [`BackendDriver`] picks the backend from a module's `driver` setting;
//! drivers whose cargo feature is off are rejected when the pool is built.

#[cfg(feature = "mysql")]
pub mod mysql;
#[cfg(feature = "postgres")]
pub mod postgres;
#[cfg(feature = "sqlite")]
pub mod sqlite;

#[cfg(feature = "mysql")]
pub use mysql::{MysqlConnection, MysqlPool};
#[cfg(feature = "postgres")]
pub use postgres::{PostgresConnection, PostgresPool};
#[cfg(feature = "sqlite")]
pub use sqlite::{SqliteConnection, SqlitePool};

use crate::core::{
    config::{ModuleConfig, PoolSettings},
    database_types::DatabaseType,
    driver::{ConnectionPool, Driver},
    error::{DatabaseError, Result},
};
use std::sync::Arc;
use tracing::debug;

/// Driver backed by the backends compiled into this build
#[derive(Debug, Clone, Copy, Default)]
pub struct BackendDriver;

impl BackendDriver {
    pub fn new() -> Self {
        Self
    }
}

impl Driver for BackendDriver {
    #[allow(unused_variables)]
    fn create_pool(
        &self,
        module: &str,
        config: &ModuleConfig,
        settings: &PoolSettings,
    ) -> Result<Arc<dyn ConnectionPool>> {
        debug!(
            module = %module,
            driver = %config.driver,
            target = %config.redacted_url(),
            max_size = settings.max_size,
            "creating pool"
        );

        match config.driver {
            #[cfg(feature = "mysql")]
            DatabaseType::Mysql => MysqlPool::create(module, config, settings),
            #[cfg(feature = "postgres")]
            DatabaseType::Postgres => PostgresPool::create(module, config, settings),
            #[cfg(feature = "sqlite")]
            DatabaseType::Sqlite => SqlitePool::create(module, config, settings),
            #[allow(unreachable_patterns)]
            other => Err(DatabaseError::unsupported(format!(
                "module '{}' uses the {} driver, which requires the '{}' feature",
                module,
                other,
                other.feature_name()
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(not(feature = "mysql"))]
    #[test]
    fn test_disabled_backend_is_unsupported() {
        let config = ModuleConfig::new(DatabaseType::Mysql).host("localhost");
        let err = BackendDriver::new()
            .create_pool("main", &config, &PoolSettings::default())
            .err()
            .expect("mysql is not compiled in");
        assert!(matches!(err, DatabaseError::UnsupportedOperation(_)));
    }

    #[cfg(feature = "sqlite")]
    #[tokio::test]
    async fn test_sqlite_dispatch() {
        let dir = tempfile::tempdir().unwrap();
        let config = ModuleConfig::sqlite(dir.path().join("dispatch.db"));
        let pool = BackendDriver::new()
            .create_pool("main", &config, &PoolSettings::default())
            .unwrap();
        let conn = pool.acquire().await.unwrap();
        conn.release(crate::core::driver::ReleaseMode::Return)
            .await
            .unwrap();
        assert_eq!(pool.status().available, 1);
    }
}
