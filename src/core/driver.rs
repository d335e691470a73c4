//! Contract between the connector and a database driver
//!
//! The connector never talks to a wire protocol itself. A [`Driver`] turns a
//! module configuration into a [`ConnectionPool`], the pool hands out
//! [`RawConnection`]s, and every call on them is a suspension point that may
//! fail with a driver-specific [`DatabaseError`].

use super::config::{ModuleConfig, PoolSettings};
use super::error::{DatabaseError, Result};
use super::value::{DatabaseValue, QueryOutput};
use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// How a connection leaves its holder
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseMode {
    /// Hand the connection back to its pool for reuse
    Return,
    /// Detach from the pool and disconnect; the connection may be dirty
    Discard,
}

/// One physical connection, exclusively owned by whoever acquired it
#[async_trait]
pub trait RawConnection: Send {
    /// Run one statement with positional parameters
    async fn query(&mut self, sql: &str, params: &[DatabaseValue]) -> Result<QueryOutput>;

    /// Start a transaction
    async fn begin(&mut self) -> Result<()>;

    /// Commit the current transaction
    async fn commit(&mut self) -> Result<()>;

    /// Roll back the current transaction
    async fn rollback(&mut self) -> Result<()>;

    /// Give the connection up. Consumes the connection, so it runs at most once.
    async fn release(self: Box<Self>, mode: ReleaseMode) -> Result<()>;
}

/// Snapshot of pool occupancy
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStatus {
    /// Total number of connections in the pool
    pub size: usize,
    /// Number of idle connections
    pub available: usize,
    /// Number of acquires waiting for a connection
    pub waiting: usize,
}

/// A managed set of connections to one module's database
#[async_trait]
pub trait ConnectionPool: Send + Sync {
    /// Take exclusive ownership of one connection.
    ///
    /// Exhaustion surfaces as an error once the configured acquire timeout
    /// elapses; it never blocks forever.
    async fn acquire(&self) -> Result<Box<dyn RawConnection>>;

    /// Current occupancy
    fn status(&self) -> PoolStatus;

    /// Stop handing out connections and drop idle ones
    async fn close(&self);
}

/// Factory for module pools
pub trait Driver: Send + Sync {
    /// Build the pool for `module`. Called once per module at connector construction.
    fn create_pool(
        &self,
        module: &str,
        config: &ModuleConfig,
        settings: &PoolSettings,
    ) -> Result<Arc<dyn ConnectionPool>>;
}

/// Whole milliseconds in `duration`, saturating at `u64::MAX`
pub fn duration_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Bound a driver call by `timeout`, reporting expiry as a query timeout
pub async fn with_timeout<T, F>(timeout: Duration, operation: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    tokio::time::timeout(timeout, operation)
        .await
        .map_err(|_| DatabaseError::query_timeout(duration_millis(timeout)))?
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_with_timeout_passes_result_through() {
        let value = tokio_test::block_on(with_timeout(Duration::from_secs(1), async {
            Ok::<_, DatabaseError>(7)
        }));
        assert_eq!(tokio_test::assert_ok!(value), 7);
    }

    #[tokio::test]
    async fn test_with_timeout_expires() {
        let result = with_timeout(Duration::from_millis(5), async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok::<_, DatabaseError>(())
        })
        .await;

        assert!(matches!(result, Err(DatabaseError::QueryTimeout { timeout_ms: 5 })));
    }

    #[test]
    fn test_duration_millis_saturates() {
        assert_eq!(duration_millis(Duration::from_millis(1500)), 1500);
        assert_eq!(duration_millis(Duration::MAX), u64::MAX);
    }
}
