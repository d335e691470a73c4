//! Statement execution on the connector
//!
//! Single statements run on a private connection that is always released
//! afterwards, or on a caller's transaction whose connection stays with the
//! caller. Batches and arbitrary units of work run inside a private
//! transaction that commits only if every step succeeds.

use super::connector::Connector;
use super::driver::ReleaseMode;
use super::error::{DatabaseError, ErrorKind, Result};
use super::transaction::{CloseBehavior, TransactionHandle};
use super::value::{DatabaseValue, QueryOutput};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;
use tracing::debug;

/// Ledger component tag for statement failures
pub const EXECUTOR_COMPONENT: &str = "QueryExecutor";

/// Future returned by a unit of work passed to [`Connector::query_with_transaction`]
pub type ScopedWork<'t, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 't>>;

/// One statement of a batch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Statement {
    pub sql: String,
    #[serde(default)]
    pub values: Vec<DatabaseValue>,
}

impl Statement {
    /// Statement without parameters
    pub fn new(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            values: Vec::new(),
        }
    }

    /// Statement with positional parameters
    pub fn with_values(sql: impl Into<String>, values: Vec<DatabaseValue>) -> Self {
        Self {
            sql: sql.into(),
            values,
        }
    }

    /// Append one positional parameter
    pub fn bind(mut self, value: impl Into<DatabaseValue>) -> Self {
        self.values.push(value.into());
        self
    }
}

impl Connector {
    /// Execute one statement against `module_name`.
    ///
    /// With `transaction`, the statement runs on that transaction's
    /// connection and the connection is left open. Without it, a connection
    /// is acquired for this call and released afterwards whatever the
    /// outcome. A missing `sql` or `module_name` is recorded without any I/O.
    pub async fn query_db(
        &self,
        sql: Option<&str>,
        module_name: Option<&str>,
        values: Option<&[DatabaseValue]>,
        transaction: Option<&mut TransactionHandle>,
    ) -> Option<QueryOutput> {
        let sql = match sql.map(str::trim) {
            Some(sql) if !sql.is_empty() => sql,
            _ => {
                self.ledger.record(
                    EXECUTOR_COMPONENT,
                    ErrorKind::Config,
                    DatabaseError::config("invalid query: SQL text is missing"),
                );
                return None;
            }
        };
        let module = self
            .require_module(EXECUTOR_COMPONENT, module_name)
            .ok()?;
        self.ensure_ready(EXECUTOR_COMPONENT).ok()?;

        let values = values.unwrap_or(&[]);

        match transaction {
            Some(handle) => self.query_in_transaction(sql, module, values, handle).await,
            None => self.query_private(sql, module, values).await,
        }
    }

    async fn query_in_transaction(
        &self,
        sql: &str,
        module: &str,
        values: &[DatabaseValue],
        handle: &mut TransactionHandle,
    ) -> Option<QueryOutput> {
        if handle.module() != module {
            self.ledger.record(
                EXECUTOR_COMPONENT,
                ErrorKind::Config,
                DatabaseError::config(format!(
                    "transaction {} belongs to module '{}', not '{}'",
                    handle.id(),
                    handle.module(),
                    module
                )),
            );
            return None;
        }

        match handle.query(sql, values).await {
            Ok(output) => Some(output),
            Err(e) => {
                let kind = if matches!(e, DatabaseError::TransactionError(_)) {
                    ErrorKind::Transaction
                } else {
                    ErrorKind::Query
                };
                self.ledger.record(EXECUTOR_COMPONENT, kind, e);
                None
            }
        }
    }

    async fn query_private(
        &self,
        sql: &str,
        module: &str,
        values: &[DatabaseValue],
    ) -> Option<QueryOutput> {
        let mut conn = self.pools.acquire(module).await.ok()?;

        let result = conn.query(sql, values).await;
        let released = conn.close(ReleaseMode::Return).await;

        let output = match result {
            Ok(output) => Some(output),
            Err(e) => {
                self.ledger.record(EXECUTOR_COMPONENT, ErrorKind::Query, e);
                None
            }
        };

        if let Err(e) = released {
            self.ledger.record(EXECUTOR_COMPONENT, ErrorKind::Resource, e);
        }

        output
    }

    /// Run `statements` in order inside one private transaction.
    ///
    /// The first failing statement stops the batch: later statements do not
    /// run, the transaction is rolled back and the whole call returns `None`.
    /// On success the per-statement outputs are returned in order.
    pub async fn query_db_multiple(
        &self,
        statements: &[Statement],
        module_name: Option<&str>,
    ) -> Option<Vec<QueryOutput>> {
        let module = self
            .require_module(EXECUTOR_COMPONENT, module_name)
            .ok()?;

        if let Some(position) = statements.iter().position(|s| s.sql.trim().is_empty()) {
            self.ledger.record(
                EXECUTOR_COMPONENT,
                ErrorKind::Config,
                DatabaseError::config(format!(
                    "invalid query: statement {} of the batch has no SQL text",
                    position + 1
                )),
            );
            return None;
        }
        self.ensure_ready(EXECUTOR_COMPONENT).ok()?;

        if statements.is_empty() {
            return Some(Vec::new());
        }

        let batch = statements.to_vec();
        let total = batch.len();

        self.query_with_transaction(module, move |tx| {
            Box::pin(async move {
                let mut outputs = Vec::with_capacity(total);
                for (index, statement) in batch.iter().enumerate() {
                    let output = tx
                        .query(&statement.sql, &statement.values)
                        .await
                        .map_err(|e| {
                            DatabaseError::query(format!(
                                "statement {} of {} failed: {}",
                                index + 1,
                                total,
                                e
                            ))
                        })?;
                    outputs.push(output);
                }
                Ok::<_, DatabaseError>(outputs)
            })
        })
        .await
    }

    /// Run a unit of work inside a private transaction on `module_name`.
    ///
    /// Begins a transaction, runs `work` with its handle, commits when `work`
    /// succeeds and rolls back when it fails. The connection is released on
    /// every path. `work` must not commit, roll back or close the handle itself.
    pub async fn query_with_transaction<T, F>(&self, module_name: &str, work: F) -> Option<T>
    where
        F: for<'t> FnOnce(&'t mut TransactionHandle) -> ScopedWork<'t, T>,
        T: Send,
    {
        let mut handle = self.begin_transaction(module_name).await?;
        debug!(transaction_id = %handle.id(), module = %module_name, "running scoped work");

        match work(&mut handle).await {
            Ok(value) => {
                if self
                    .commit_transaction(&mut handle, CloseBehavior::Release)
                    .await
                {
                    Some(value)
                } else {
                    None
                }
            }
            Err(e) => {
                let kind = e.kind();
                self.ledger.record(EXECUTOR_COMPONENT, kind, e);
                self.roll_back_transaction(&mut handle, CloseBehavior::Release)
                    .await;
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_statement_builders() {
        let statement = Statement::new("INSERT INTO t (a, b) VALUES (?, ?)")
            .bind(1)
            .bind("two");

        assert_eq!(
            statement.values,
            vec![DatabaseValue::Int(1), DatabaseValue::Text("two".to_string())]
        );

        let parsed: Statement = serde_json::from_str(r#"{"sql": "SELECT 1"}"#).unwrap();
        assert_eq!(parsed, Statement::new("SELECT 1"));
    }
}
