//! Uniform facade over a pooled connection
//!
//! Callers see the same five operations whatever backend produced the
//! connection. `close` consumes the facade, so nothing can run on a
//! connection after it has been released.

use super::driver::{RawConnection, ReleaseMode};
use super::error::{DatabaseError, Result};
use super::value::{DatabaseValue, QueryOutput};

/// A connection acquired for one module
pub struct Connection {
    module: String,
    raw: Option<Box<dyn RawConnection>>,
}

impl Connection {
    pub(crate) fn new(module: impl Into<String>, raw: Box<dyn RawConnection>) -> Self {
        Self {
            module: module.into(),
            raw: Some(raw),
        }
    }

    /// Module this connection belongs to
    pub fn module(&self) -> &str {
        &self.module
    }

    fn raw(&mut self) -> Result<&mut Box<dyn RawConnection>> {
        self.raw
            .as_mut()
            .ok_or_else(|| DatabaseError::resource("connection already released"))
    }

    /// Run a statement. `values` bind positionally; pass `&[]` for raw SQL.
    pub async fn query(&mut self, sql: &str, values: &[DatabaseValue]) -> Result<QueryOutput> {
        self.raw()?.query(sql, values).await
    }

    /// Issue a driver-level begin
    pub async fn begin_transaction(&mut self) -> Result<()> {
        self.raw()?
            .begin()
            .await
            .map_err(|e| as_transaction_error("begin", e))
    }

    /// Issue a driver-level commit
    pub async fn commit(&mut self) -> Result<()> {
        self.raw()?
            .commit()
            .await
            .map_err(|e| as_transaction_error("commit", e))
    }

    /// Issue a driver-level rollback
    pub async fn rollback(&mut self) -> Result<()> {
        self.raw()?
            .rollback()
            .await
            .map_err(|e| as_transaction_error("rollback", e))
    }

    /// Release the connection back to its pool, or discard it.
    pub async fn close(mut self, mode: ReleaseMode) -> Result<()> {
        let raw = self
            .raw
            .take()
            .ok_or_else(|| DatabaseError::resource("connection already released"))?;

        raw.release(mode).await.map_err(|e| match e {
            DatabaseError::ResourceError(_) => e,
            other => DatabaseError::resource(format!(
                "failed to release connection for module '{}': {}",
                self.module, other
            )),
        })
    }
}

fn as_transaction_error(operation: &str, err: DatabaseError) -> DatabaseError {
    match err {
        DatabaseError::TransactionError(_) => err,
        other => DatabaseError::transaction(format!("{} failed: {}", operation, other)),
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("module", &self.module)
            .field("released", &self.raw.is_none())
            .finish()
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if self.raw.is_some() {
            tracing::warn!(
                module = %self.module,
                "connection dropped without close(); the backend decides whether it is reused"
            );
        }
    }
}
