//! Error types for the connector
//!
//! Driver and pool calls fail with [`DatabaseError`]. The public connector
//! surface never returns these directly; each one is classified into an
//! [`ErrorKind`] and recorded in the connector's error ledger.

use serde::{Deserialize, Serialize};

/// Result type alias for internal connector and driver operations
pub type Result<T> = std::result::Result<T, DatabaseError>;

/// Closed taxonomy of recorded failures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    /// Missing or invalid module name, SQL text or configuration
    Config,
    /// Pool acquire or connect failure
    Pool,
    /// Statement execution failure
    Query,
    /// Begin, commit or rollback failure
    Transaction,
    /// Close or release failure
    Resource,
    /// An error input whose shape carries no usable message
    MalformedError,
}

impl ErrorKind {
    /// Stable lowercase name used in logs
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Config => "config",
            ErrorKind::Pool => "pool",
            ErrorKind::Query => "query",
            ErrorKind::Transaction => "transaction",
            ErrorKind::Resource => "resource",
            ErrorKind::MalformedError => "malformed_error",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error types for connector and driver operations
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    /// Invalid configuration or caller input
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// No pool exists for the requested module
    #[error("Unknown module: {0}")]
    UnknownModule(String),

    /// Connection failed with details
    #[error("Connection failed to {target} - {message}")]
    ConnectionFailed {
        target: String,
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Connection error (generic)
    #[error("Connection error: {0}")]
    ConnectionError(String),

    /// Connection pool exhausted
    #[error("Connection pool exhausted for module '{module}' after waiting {timeout_ms}ms")]
    PoolExhausted { module: String, timeout_ms: u64 },

    /// Query execution error
    #[error("Query execution error: {0}")]
    QueryError(String),

    /// Query timeout
    #[error("Query timeout after {timeout_ms}ms")]
    QueryTimeout { timeout_ms: u64 },

    /// Transaction error
    #[error("Transaction error: {0}")]
    TransactionError(String),

    /// Close or release error
    #[error("Resource error: {0}")]
    ResourceError(String),

    /// Backend compiled out of this build
    #[error("Unsupported operation: {0}")]
    UnsupportedOperation(String),

    /// IO error
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    /// JSON error while loading configuration
    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    /// SQLite error
    #[cfg(feature = "sqlite")]
    #[error("SQLite error: {0}")]
    SqliteError(#[from] rusqlite::Error),

    /// PostgreSQL error
    #[cfg(feature = "postgres")]
    #[error("PostgreSQL error: {0}")]
    PostgresError(#[from] tokio_postgres::Error),

    /// MySQL error
    #[cfg(feature = "mysql")]
    #[error("MySQL error: {0}")]
    MysqlError(String),
}

impl DatabaseError {
    /// Create a configuration error
    pub fn config<S: Into<String>>(msg: S) -> Self {
        DatabaseError::Config(msg.into())
    }

    /// Create an unknown module error
    pub fn unknown_module<S: Into<String>>(module: S) -> Self {
        DatabaseError::UnknownModule(module.into())
    }

    /// Create a connection failed error with target details
    pub fn connection_failed(target: impl Into<String>, message: impl Into<String>) -> Self {
        DatabaseError::ConnectionFailed {
            target: target.into(),
            message: message.into(),
            source: None,
        }
    }

    /// Create a connection failed error with source error
    pub fn connection_failed_with_source(
        target: impl Into<String>,
        message: impl Into<String>,
        source: Box<dyn std::error::Error + Send + Sync>,
    ) -> Self {
        DatabaseError::ConnectionFailed {
            target: target.into(),
            message: message.into(),
            source: Some(source),
        }
    }

    /// Create a new connection error (generic)
    pub fn connection<S: Into<String>>(msg: S) -> Self {
        DatabaseError::ConnectionError(msg.into())
    }

    /// Create a pool exhausted error
    pub fn pool_exhausted(module: impl Into<String>, timeout_ms: u64) -> Self {
        DatabaseError::PoolExhausted {
            module: module.into(),
            timeout_ms,
        }
    }

    /// Create a new query error
    pub fn query<S: Into<String>>(msg: S) -> Self {
        DatabaseError::QueryError(msg.into())
    }

    /// Create a query timeout error
    pub fn query_timeout(timeout_ms: u64) -> Self {
        DatabaseError::QueryTimeout { timeout_ms }
    }

    /// Create a new transaction error
    pub fn transaction<S: Into<String>>(msg: S) -> Self {
        DatabaseError::TransactionError(msg.into())
    }

    /// Create a new resource error
    pub fn resource<S: Into<String>>(msg: S) -> Self {
        DatabaseError::ResourceError(msg.into())
    }

    /// Create a new unsupported operation error
    pub fn unsupported<S: Into<String>>(msg: S) -> Self {
        DatabaseError::UnsupportedOperation(msg.into())
    }

    /// Classify this error into the recorded taxonomy.
    ///
    /// Driver-native errors classify as `Query`; callers that know the
    /// operation (begin, commit, release) pass an explicit kind instead.
    pub fn kind(&self) -> ErrorKind {
        match self {
            DatabaseError::Config(_)
            | DatabaseError::UnknownModule(_)
            | DatabaseError::UnsupportedOperation(_)
            | DatabaseError::JsonError(_)
            | DatabaseError::IoError(_) => ErrorKind::Config,
            DatabaseError::ConnectionFailed { .. }
            | DatabaseError::ConnectionError(_)
            | DatabaseError::PoolExhausted { .. } => ErrorKind::Pool,
            DatabaseError::QueryError(_) | DatabaseError::QueryTimeout { .. } => ErrorKind::Query,
            DatabaseError::TransactionError(_) => ErrorKind::Transaction,
            DatabaseError::ResourceError(_) => ErrorKind::Resource,
            #[cfg(feature = "sqlite")]
            DatabaseError::SqliteError(_) => ErrorKind::Query,
            #[cfg(feature = "postgres")]
            DatabaseError::PostgresError(_) => ErrorKind::Query,
            #[cfg(feature = "mysql")]
            DatabaseError::MysqlError(_) => ErrorKind::Query,
        }
    }
}

#[cfg(feature = "mysql")]
impl From<mysql_async::Error> for DatabaseError {
    fn from(err: mysql_async::Error) -> Self {
        DatabaseError::MysqlError(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let err = DatabaseError::connection("Failed to connect");
        assert!(matches!(err, DatabaseError::ConnectionError(_)));

        let err = DatabaseError::query("Invalid SQL");
        assert!(matches!(err, DatabaseError::QueryError(_)));

        let err = DatabaseError::pool_exhausted("main", 5000);
        assert!(matches!(err, DatabaseError::PoolExhausted { .. }));
    }

    #[test]
    fn test_error_display() {
        let err = DatabaseError::connection("Connection refused");
        assert_eq!(err.to_string(), "Connection error: Connection refused");

        let err = DatabaseError::unknown_module("billing");
        assert_eq!(err.to_string(), "Unknown module: billing");

        let err = DatabaseError::pool_exhausted("main", 250);
        assert_eq!(
            err.to_string(),
            "Connection pool exhausted for module 'main' after waiting 250ms"
        );
    }

    #[test]
    fn test_error_kind_mapping() {
        assert_eq!(DatabaseError::config("x").kind(), ErrorKind::Config);
        assert_eq!(DatabaseError::unknown_module("x").kind(), ErrorKind::Config);
        assert_eq!(DatabaseError::pool_exhausted("x", 1).kind(), ErrorKind::Pool);
        assert_eq!(
            DatabaseError::connection_failed("db:3306", "refused").kind(),
            ErrorKind::Pool
        );
        assert_eq!(DatabaseError::query_timeout(10).kind(), ErrorKind::Query);
        assert_eq!(DatabaseError::transaction("x").kind(), ErrorKind::Transaction);
        assert_eq!(DatabaseError::resource("x").kind(), ErrorKind::Resource);
    }

    #[test]
    fn test_error_kind_display() {
        assert_eq!(ErrorKind::MalformedError.to_string(), "malformed_error");
        assert_eq!(ErrorKind::Pool.as_str(), "pool");
    }
}
