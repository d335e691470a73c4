//! Transaction handles
//!
//! A [`TransactionHandle`] owns exactly one connection from `begin_transaction`
//! until it reaches a terminal call on the connector. State moves
//! `Open -> Committed | RolledBack -> Closed`; the connection is closed exactly
//! once, when the handle leaves its last state that still needs it.

use super::connection::Connection;
use super::error::{DatabaseError, Result};
use super::value::{DatabaseValue, QueryOutput};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle of a transaction handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransactionState {
    Open,
    Committed,
    RolledBack,
    Closed,
}

impl TransactionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionState::Open => "open",
            TransactionState::Committed => "committed",
            TransactionState::RolledBack => "rolled_back",
            TransactionState::Closed => "closed",
        }
    }
}

impl std::fmt::Display for TransactionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What happens to the connection after commit or rollback
///
/// `true` converts to [`CloseBehavior::Release`] and `false` to
/// [`CloseBehavior::Retain`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CloseBehavior {
    /// Release the connection back to its pool
    #[default]
    Release,
    /// Keep the connection on the handle for further work
    Retain,
}

impl From<bool> for CloseBehavior {
    fn from(close_after: bool) -> Self {
        if close_after {
            CloseBehavior::Release
        } else {
            CloseBehavior::Retain
        }
    }
}

/// Caller-held reference to a transaction bound to one connection
pub struct TransactionHandle {
    id: Uuid,
    module: String,
    state: TransactionState,
    connection: Option<Connection>,
}

impl TransactionHandle {
    pub(crate) fn new(connection: Connection) -> Self {
        Self {
            id: Uuid::new_v4(),
            module: connection.module().to_string(),
            state: TransactionState::Open,
            connection: Some(connection),
        }
    }

    /// Unique id, used in logs
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Module the connection came from
    pub fn module(&self) -> &str {
        &self.module
    }

    pub fn state(&self) -> TransactionState {
        self.state
    }

    pub fn is_open(&self) -> bool {
        self.state == TransactionState::Open
    }

    /// Whether the handle still owns its connection
    pub fn holds_connection(&self) -> bool {
        self.connection.is_some()
    }

    pub(crate) fn set_state(&mut self, state: TransactionState) {
        self.state = state;
    }

    pub(crate) fn connection_mut(&mut self) -> Option<&mut Connection> {
        self.connection.as_mut()
    }

    pub(crate) fn take_connection(&mut self) -> Option<Connection> {
        self.connection.take()
    }

    /// Run a statement on this transaction's connection
    ///
    /// # Errors
    ///
    /// Returns an error if the transaction is not open, the handle no longer
    /// owns a connection or the statement fails. A retained connection has
    /// to be reopened with `begin_on` before it accepts statements again.
    pub async fn query(&mut self, sql: &str, values: &[DatabaseValue]) -> Result<QueryOutput> {
        let state = self.state;
        let conn = match self.connection.as_mut() {
            Some(conn) if state == TransactionState::Open => conn,
            _ => {
                return Err(DatabaseError::transaction(format!(
                    "Cannot query on {} transaction",
                    state
                )))
            }
        };

        conn.query(sql, values).await
    }
}

impl std::fmt::Debug for TransactionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionHandle")
            .field("id", &self.id)
            .field("module", &self.module)
            .field("state", &self.state)
            .field("holds_connection", &self.connection.is_some())
            .finish()
    }
}

impl Drop for TransactionHandle {
    fn drop(&mut self) {
        if self.connection.is_some() {
            tracing::warn!(
                transaction_id = %self.id,
                module = %self.module,
                state = %self.state,
                "transaction handle dropped without commit, rollback or close; connection leaked to drop"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::driver::{RawConnection, ReleaseMode};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_close_behavior_from_bool() {
        assert_eq!(CloseBehavior::from(true), CloseBehavior::Release);
        assert_eq!(CloseBehavior::from(false), CloseBehavior::Retain);
        assert_eq!(CloseBehavior::default(), CloseBehavior::Release);
    }

    #[test]
    fn test_state_display() {
        assert_eq!(TransactionState::RolledBack.to_string(), "rolled_back");
        assert_eq!(TransactionState::Open.as_str(), "open");
    }

    struct CountingConnection {
        queries: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl RawConnection for CountingConnection {
        async fn query(&mut self, _sql: &str, _params: &[DatabaseValue]) -> Result<QueryOutput> {
            self.queries.fetch_add(1, Ordering::SeqCst);
            Ok(QueryOutput::from_affected(1, None))
        }

        async fn begin(&mut self) -> Result<()> {
            Ok(())
        }

        async fn commit(&mut self) -> Result<()> {
            Ok(())
        }

        async fn rollback(&mut self) -> Result<()> {
            Ok(())
        }

        async fn release(self: Box<Self>, _mode: ReleaseMode) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_query_requires_open_state() {
        let queries = Arc::new(AtomicUsize::new(0));
        let raw = Box::new(CountingConnection {
            queries: Arc::clone(&queries),
        });
        let mut handle = TransactionHandle::new(Connection::new("main", raw));

        assert!(handle.query("INSERT INTO t VALUES (1)", &[]).await.is_ok());

        for state in [TransactionState::Committed, TransactionState::RolledBack] {
            handle.set_state(state);
            let err = handle
                .query("INSERT INTO t VALUES (2)", &[])
                .await
                .err()
                .expect("finished transaction must reject statements");
            assert!(matches!(err, DatabaseError::TransactionError(_)));
            assert!(err.to_string().contains(state.as_str()));
        }
        assert_eq!(queries.load(Ordering::SeqCst), 1);

        if let Some(conn) = handle.take_connection() {
            conn.close(ReleaseMode::Return).await.unwrap();
        }
    }
}
