//! # Multi-module database connector
//!
//! An async database access layer for applications that talk to several
//! independently configured databases ("modules"). Each module gets its own
//! connection pool. On top of the pools the connector offers:
//!
//! - one-shot statements on a private pooled connection
//! - explicit transactions that pin one connection from begin to close
//! - batches and units of work that commit only if every step succeeds
//! - an error ledger: operations report failure as `None`/`false` and append
//!   a structured, chainable [`ErrorRecord`] describing what went wrong
//!
//! ## Supported Databases
//!
//! | Database | Feature | Pooling |
//! |----------|---------|---------|
//! | SQLite | `sqlite` (default) | deadpool-sqlite |
//! | MySQL | `mysql` | mysql_async |
//! | PostgreSQL | `postgres` | deadpool-postgres |
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use multidb_connector::prelude::*;
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = ConnectorConfig::new()
//!         .module("main", ModuleConfig::sqlite("/tmp/app.db"));
//!     let connector = Connector::new(config);
//!
//!     if !connector.init().await {
//!         for record in connector.get_error() {
//!             eprintln!("{}", record);
//!         }
//!         return;
//!     }
//!
//!     connector
//!         .query_db(
//!             Some("CREATE TABLE IF NOT EXISTS users (id INTEGER PRIMARY KEY, name TEXT)"),
//!             Some("main"),
//!             None,
//!             None,
//!         )
//!         .await;
//!
//!     let rows = connector
//!         .query_db(Some("SELECT name FROM users"), Some("main"), None, None)
//!         .await;
//!     println!("{:?}", rows);
//! }
//! ```
//!
//! ### Working with Transactions
//!
//! ```rust,no_run
//! use multidb_connector::prelude::*;
//!
//! # async fn transfer(connector: &Connector) -> bool {
//! let Some(mut tx) = connector.begin_transaction("main").await else {
//!     return false;
//! };
//!
//! let debit = connector
//!     .query_db(
//!         Some("UPDATE accounts SET balance = balance - ? WHERE id = ?"),
//!         Some("main"),
//!         Some(&[DatabaseValue::from(100), DatabaseValue::from(1)]),
//!         Some(&mut tx),
//!     )
//!     .await;
//!
//! if debit.is_none() {
//!     connector.roll_back_transaction(&mut tx, CloseBehavior::Release).await;
//!     return false;
//! }
//! connector.commit_transaction(&mut tx, CloseBehavior::Release).await
//! # }
//! ```

/// Connector, transactions, error ledger and the driver contract
pub mod core;

/// Database backend implementations
pub mod backends;

/// Prelude for convenient imports
///
/// ```rust
/// use multidb_connector::prelude::*;
///
/// let config = ConnectorConfig::new().module("main", ModuleConfig::sqlite("app.db"));
/// assert!(config.validate().is_ok());
/// ```
pub mod prelude {
    pub use crate::backends::BackendDriver;
    pub use crate::core::{
        CloseBehavior, Connector, ConnectorConfig, DatabaseError, DatabaseRow, DatabaseType,
        DatabaseValue, ErrorKind, ErrorRecord, ModuleConfig, PoolSettings, QueryOutput, Result,
        SslConfig, Statement, TransactionHandle, TransactionState,
    };
}

// Re-export at root level for convenience
pub use backends::BackendDriver;
pub use self::core::{
    CloseBehavior, Connector, ConnectorConfig, DatabaseError, DatabaseRow, DatabaseType,
    DatabaseValue, ErrorKind, ErrorLedger, ErrorRecord, ModuleConfig, PoolSettings, QueryOutput,
    Result, SslConfig, Statement, TransactionHandle, TransactionState,
};
