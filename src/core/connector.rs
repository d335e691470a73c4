//! The multi-module connector
//!
//! [`Connector`] ties the pieces together: it builds one pool per module,
//! verifies them in [`Connector::init`], coordinates explicit transactions and
//! exposes the error ledger. None of its public operations return `Err`:
//! a `None` or `false` result means a record was appended to the ledger.
//!
//! Statement execution lives in the `executor` module as a second `impl`
//! block on the same type.

use super::config::ConnectorConfig;
use super::connection::Connection;
use super::driver::{Driver, PoolStatus, ReleaseMode};
use super::error::{DatabaseError, ErrorKind};
use super::ledger::{ErrorInput, ErrorLedger, ErrorRecord};
use super::pool::PoolManager;
use super::transaction::{CloseBehavior, TransactionHandle, TransactionState};
use crate::backends::BackendDriver;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Ledger component tag for construction and health checks
pub const CONNECTOR_COMPONENT: &str = "Connector";

/// Ledger component tag for begin/commit/rollback/close
pub const TRANSACTION_COMPONENT: &str = "TransactionCoordinator";

/// Database access layer over a set of named modules
pub struct Connector {
    pub(crate) pools: PoolManager,
    pub(crate) ledger: Arc<ErrorLedger>,
    configured: Vec<String>,
    require_init: bool,
    initialized: AtomicBool,
}

impl Connector {
    /// Build a connector whose pools come from the compiled-in backends
    pub fn new(config: ConnectorConfig) -> Self {
        Self::with_driver(config, &BackendDriver::new())
    }

    /// Build a connector whose pools come from `driver`
    pub fn with_driver(config: ConnectorConfig, driver: &dyn Driver) -> Self {
        let ledger = Arc::new(ErrorLedger::new());

        let pools = match config.validate() {
            Ok(()) => PoolManager::new(&config, driver, Arc::clone(&ledger)),
            Err(e) => {
                ledger.record(CONNECTOR_COMPONENT, ErrorKind::Config, e);
                PoolManager::empty(Arc::clone(&ledger))
            }
        };

        Self {
            pools,
            ledger,
            configured: config.modules.keys().cloned().collect(),
            require_init: config.require_init_before_query,
            initialized: AtomicBool::new(false),
        }
    }

    /// Verify that every configured module can hand out and take back a connection.
    ///
    /// Returns `false` if any module fails; the failures are in the ledger.
    pub async fn init(&self) -> bool {
        let mut healthy = !self.configured.is_empty();

        for module in &self.configured {
            let conn = match self.pools.acquire(module).await {
                Ok(conn) => conn,
                Err(_) => {
                    healthy = false;
                    continue;
                }
            };

            if let Err(e) = conn.close(ReleaseMode::Return).await {
                self.ledger.record(CONNECTOR_COMPONENT, ErrorKind::Resource, e);
                healthy = false;
            }
        }

        self.initialized.store(healthy, Ordering::Release);
        if healthy {
            info!(modules = self.configured.len(), "connector initialized");
        } else {
            warn!("connector initialization failed; see error ledger");
        }
        healthy
    }

    /// Whether the last `init()` succeeded
    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    /// Modules that have a pool
    pub fn module_names(&self) -> Vec<String> {
        self.pools.module_names()
    }

    /// Occupancy of a module's pool
    pub fn pool_status(&self, module: &str) -> Option<PoolStatus> {
        self.pools.status(module)
    }

    /// Close every pool. Connections still held by handles are unaffected
    /// until they are closed.
    pub async fn shutdown(&self) {
        self.pools.close_all().await;
        self.initialized.store(false, Ordering::Release);
    }

    /// Fail when the connector requires `init()` and it has not succeeded
    pub(crate) fn ensure_ready(&self, component: &str) -> Result<(), ErrorRecord> {
        if self.require_init && !self.is_initialized() {
            return Err(self.ledger.record(
                component,
                ErrorKind::Config,
                DatabaseError::config("connector is not initialized; call init() first"),
            ));
        }
        Ok(())
    }

    /// Fail on a missing or blank module name
    pub(crate) fn require_module<'a>(
        &self,
        component: &str,
        module_name: Option<&'a str>,
    ) -> Result<&'a str, ErrorRecord> {
        match module_name.map(str::trim) {
            Some(name) if !name.is_empty() => Ok(name),
            _ => Err(self.ledger.record(
                component,
                ErrorKind::Config,
                DatabaseError::config("invalid module name: module name is missing"),
            )),
        }
    }

    // ------------------------------------------------------------------
    // Transaction coordinator
    // ------------------------------------------------------------------

    /// Acquire a connection for `module_name` and begin a transaction on it
    pub async fn begin_transaction(&self, module_name: &str) -> Option<TransactionHandle> {
        self.ensure_ready(TRANSACTION_COMPONENT).ok()?;
        let module = self
            .require_module(TRANSACTION_COMPONENT, Some(module_name))
            .ok()?;

        let mut conn = self.pools.acquire(module).await.ok()?;

        if let Err(e) = conn.begin_transaction().await {
            let begin = self
                .ledger
                .record(TRANSACTION_COMPONENT, ErrorKind::Transaction, e);
            self.close_connection(conn, ReleaseMode::Discard, Some(begin))
                .await;
            return None;
        }

        let handle = TransactionHandle::new(conn);
        debug!(transaction_id = %handle.id(), module = %module, "transaction started");
        Some(handle)
    }

    /// Begin a new transaction on a handle that kept its connection after
    /// commit or rollback with [`CloseBehavior::Retain`]
    pub async fn begin_on(&self, handle: &mut TransactionHandle) -> bool {
        let state = handle.state();
        let reusable = matches!(
            state,
            TransactionState::Committed | TransactionState::RolledBack
        ) && handle.holds_connection();

        if !reusable {
            self.ledger.record(
                TRANSACTION_COMPONENT,
                ErrorKind::Transaction,
                DatabaseError::transaction(format!(
                    "cannot begin on a {} transaction without a retained connection",
                    state
                )),
            );
            return false;
        }

        let begun = match handle.connection_mut() {
            Some(conn) => conn.begin_transaction().await,
            None => Err(DatabaseError::transaction("retained connection missing")),
        };

        match begun {
            Ok(()) => {
                handle.set_state(TransactionState::Open);
                debug!(transaction_id = %handle.id(), "transaction restarted on retained connection");
                true
            }
            Err(e) => {
                let begin = self
                    .ledger
                    .record(TRANSACTION_COMPONENT, ErrorKind::Transaction, e);
                self.release_handle(handle, ReleaseMode::Discard, Some(begin))
                    .await;
                false
            }
        }
    }

    /// Commit an open transaction.
    ///
    /// A failed commit is compensated with a rollback; a failed rollback is
    /// recorded chained to the commit failure and forces the connection to be
    /// discarded. `close_after` accepts `bool` (`true` releases the connection).
    pub async fn commit_transaction(
        &self,
        handle: &mut TransactionHandle,
        close_after: impl Into<CloseBehavior>,
    ) -> bool {
        let close_after = close_after.into();
        let Some(conn) = self.open_connection(handle, "commit") else {
            return false;
        };

        let commit_error = match conn.commit().await {
            Ok(()) => None,
            Err(e) => Some(e),
        };

        let Some(commit_error) = commit_error else {
            handle.set_state(TransactionState::Committed);
            debug!(transaction_id = %handle.id(), "transaction committed");
            if close_after == CloseBehavior::Release {
                self.release_handle(handle, ReleaseMode::Return, None).await;
            }
            return true;
        };

        let commit = self
            .ledger
            .record(TRANSACTION_COMPONENT, ErrorKind::Transaction, commit_error);
        warn!(transaction_id = %handle.id(), "commit failed; rolling back");

        let rollback_result = match handle.connection_mut() {
            Some(conn) => conn.rollback().await,
            None => Err(DatabaseError::transaction("connection missing for rollback")),
        };

        match rollback_result {
            Ok(()) => {
                handle.set_state(TransactionState::RolledBack);
                if close_after == CloseBehavior::Release {
                    self.release_handle(handle, ReleaseMode::Return, None).await;
                }
            }
            Err(e) => {
                let rollback = self.ledger.record_chained(
                    TRANSACTION_COMPONENT,
                    ErrorKind::Transaction,
                    e,
                    commit,
                );
                handle.set_state(TransactionState::RolledBack);
                self.release_handle(handle, ReleaseMode::Discard, Some(rollback))
                    .await;
            }
        }

        false
    }

    /// Roll back an open transaction.
    ///
    /// A failed rollback always closes the connection, discarding it from
    /// its pool, whatever `close_after` says.
    pub async fn roll_back_transaction(
        &self,
        handle: &mut TransactionHandle,
        close_after: impl Into<CloseBehavior>,
    ) -> bool {
        let close_after = close_after.into();
        let Some(conn) = self.open_connection(handle, "roll back") else {
            return false;
        };

        match conn.rollback().await {
            Ok(()) => {
                handle.set_state(TransactionState::RolledBack);
                debug!(transaction_id = %handle.id(), "transaction rolled back");
                if close_after == CloseBehavior::Release {
                    self.release_handle(handle, ReleaseMode::Return, None).await;
                }
                true
            }
            Err(e) => {
                let rollback = self
                    .ledger
                    .record(TRANSACTION_COMPONENT, ErrorKind::Transaction, e);
                handle.set_state(TransactionState::RolledBack);
                self.release_handle(handle, ReleaseMode::Discard, Some(rollback))
                    .await;
                false
            }
        }
    }

    /// Release the handle's connection.
    ///
    /// Closing a handle that is still `Open` discards the connection, since
    /// its transaction was never finished. A second close records a
    /// `Resource` error and returns `false`.
    pub async fn close_transaction(&self, handle: &mut TransactionHandle) -> bool {
        if !handle.holds_connection() {
            self.ledger.record(
                TRANSACTION_COMPONENT,
                ErrorKind::Resource,
                DatabaseError::resource(format!(
                    "transaction {} is already closed",
                    handle.id()
                )),
            );
            handle.set_state(TransactionState::Closed);
            return false;
        }

        let mode = if handle.is_open() {
            warn!(transaction_id = %handle.id(), "closing a transaction that was never committed or rolled back");
            ReleaseMode::Discard
        } else {
            ReleaseMode::Return
        };

        self.release_handle(handle, mode, None).await
    }

    /// The handle's connection if it is open, recording why not otherwise
    fn open_connection<'h>(
        &self,
        handle: &'h mut TransactionHandle,
        operation: &str,
    ) -> Option<&'h mut Connection> {
        if !handle.is_open() {
            self.ledger.record(
                TRANSACTION_COMPONENT,
                ErrorKind::Transaction,
                DatabaseError::transaction(format!(
                    "cannot {} a {} transaction",
                    operation,
                    handle.state()
                )),
            );
            return None;
        }

        if !handle.holds_connection() {
            self.ledger.record(
                TRANSACTION_COMPONENT,
                ErrorKind::Transaction,
                DatabaseError::transaction("open transaction has no connection"),
            );
            handle.set_state(TransactionState::Closed);
            return None;
        }

        handle.connection_mut()
    }

    /// Take the connection off the handle and close it. The handle ends `Closed`.
    async fn release_handle(
        &self,
        handle: &mut TransactionHandle,
        mode: ReleaseMode,
        cause: Option<ErrorRecord>,
    ) -> bool {
        let released = match handle.take_connection() {
            Some(conn) => self.close_connection(conn, mode, cause).await,
            None => true,
        };
        handle.set_state(TransactionState::Closed);
        debug!(transaction_id = %handle.id(), ?mode, "transaction closed");
        released
    }

    /// Close a connection, recording a failure chained to `cause` if given
    pub(crate) async fn close_connection(
        &self,
        conn: Connection,
        mode: ReleaseMode,
        cause: Option<ErrorRecord>,
    ) -> bool {
        match conn.close(mode).await {
            Ok(()) => true,
            Err(e) => {
                match cause {
                    Some(cause) => self.ledger.record_chained(
                        TRANSACTION_COMPONENT,
                        ErrorKind::Resource,
                        e,
                        cause,
                    ),
                    None => self
                        .ledger
                        .record(TRANSACTION_COMPONENT, ErrorKind::Resource, e),
                };
                false
            }
        }
    }

    // ------------------------------------------------------------------
    // Error ledger
    // ------------------------------------------------------------------

    /// Append a record to this connector's ledger
    pub fn populate_error(
        &self,
        component: &str,
        kind: ErrorKind,
        primary: impl Into<ErrorInput>,
        cause: Option<ErrorInput>,
        reset: bool,
    ) -> ErrorRecord {
        self.ledger
            .populate_error(component, kind, primary, cause, reset)
    }

    /// Every recorded error, oldest first
    pub fn get_error(&self) -> Vec<ErrorRecord> {
        self.ledger.get_error()
    }

    /// Most recent recorded error
    pub fn get_last_error(&self) -> Option<ErrorRecord> {
        self.ledger.get_last_error()
    }

    /// Clear the ledger
    pub fn reset_error(&self) {
        self.ledger.reset_error()
    }

    /// Direct access to the ledger
    pub fn ledger(&self) -> &ErrorLedger {
        &self.ledger
    }
}

impl std::fmt::Debug for Connector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connector")
            .field("pools", &self.pools)
            .field("require_init", &self.require_init)
            .field("initialized", &self.is_initialized())
            .field("errors", &self.ledger.len())
            .finish()
    }
}
