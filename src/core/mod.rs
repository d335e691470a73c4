//! Core connector types and traits
//!
//! This module provides the building blocks of the connector: error types and
//! the error ledger, configuration, the driver contract, the connection
//! facade, pools, transactions and statement execution.

pub mod config;
pub mod connection;
pub mod connector;
pub mod database_types;
pub mod driver;
pub mod error;
pub mod executor;
pub mod ledger;
pub mod pool;
pub mod transaction;
pub mod value;

// Re-export commonly used types
pub use config::{ConnectorConfig, ModuleConfig, PoolSettings, SslConfig, TlsMaterial};
pub use connection::Connection;
pub use connector::{Connector, CONNECTOR_COMPONENT, TRANSACTION_COMPONENT};
pub use database_types::DatabaseType;
pub use driver::{duration_millis, ConnectionPool, Driver, PoolStatus, RawConnection, ReleaseMode};
pub use error::{DatabaseError, ErrorKind, Result};
pub use executor::{ScopedWork, Statement, EXECUTOR_COMPONENT};
pub use ledger::{ErrorCause, ErrorInput, ErrorLedger, ErrorRecord};
pub use pool::{PoolManager, POOL_COMPONENT};
pub use transaction::{CloseBehavior, TransactionHandle, TransactionState};
pub use value::{DatabaseRow, DatabaseValue, QueryOutput};
