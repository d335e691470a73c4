//! MySQL backend
//!
//! Wraps `mysql_async::Pool`. Transactions are driven with plain
//! `START TRANSACTION` / `COMMIT` / `ROLLBACK` statements on the pooled
//! `Conn`, so one connection carries the whole transaction.

use crate::core::{
    config::{ModuleConfig, PoolSettings, SslConfig},
    driver::{duration_millis, with_timeout, ConnectionPool, PoolStatus, RawConnection, ReleaseMode},
    error::{DatabaseError, Result},
    value::{DatabaseRow, DatabaseValue, QueryOutput},
};
use async_trait::async_trait;
use chrono::{Datelike, NaiveDate, Timelike};
use mysql_async::prelude::Queryable;
use mysql_async::{Conn, OptsBuilder, Params, Pool, PoolConstraints, PoolOpts, Row, SslOpts, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Pool of MySQL connections for one module
pub struct MysqlPool {
    module: String,
    pool: Pool,
    acquire_timeout: Duration,
    operation_timeout: Duration,
    in_use: Arc<AtomicUsize>,
    waiting: AtomicUsize,
}

impl MysqlPool {
    /// Build the pool. Connections are opened lazily by mysql_async.
    ///
    /// # Errors
    ///
    /// Returns error if the module configuration cannot be expressed as pool options
    pub fn create(
        module: &str,
        config: &ModuleConfig,
        settings: &PoolSettings,
    ) -> Result<Arc<dyn ConnectionPool>> {
        let host = config
            .host
            .clone()
            .ok_or_else(|| DatabaseError::config(format!("module '{}' has no host", module)))?;

        let constraints = PoolConstraints::new(0, settings.max_size).ok_or_else(|| {
            DatabaseError::config(format!(
                "invalid pool size {} for module '{}'",
                settings.max_size, module
            ))
        })?;

        let mut opts = OptsBuilder::default()
            .ip_or_hostname(host)
            .tcp_port(config.effective_port().unwrap_or(3306))
            .user(config.user.clone())
            .pass(config.password.clone())
            .db_name(config.database.clone())
            .pool_opts(PoolOpts::default().with_constraints(constraints));

        if let Some(ssl) = ssl_opts(module, &config.ssl)? {
            opts = opts.ssl_opts(ssl);
        }

        Ok(Arc::new(Self {
            module: module.to_string(),
            pool: Pool::new(opts),
            acquire_timeout: settings.acquire_timeout,
            operation_timeout: settings.operation_timeout,
            in_use: Arc::new(AtomicUsize::new(0)),
            waiting: AtomicUsize::new(0),
        }))
    }
}

/// Translate the module TLS setting into mysql_async options
fn ssl_opts(module: &str, ssl: &SslConfig) -> Result<Option<SslOpts>> {
    match ssl {
        SslConfig::Enabled(false) => Ok(None),
        SslConfig::Enabled(true) => Ok(Some(SslOpts::default())),
        SslConfig::Material(material) => {
            if material.key.is_some() || material.cert.is_some() {
                return Err(DatabaseError::unsupported(format!(
                    "module '{}': client certificate authentication is not supported by the mysql backend",
                    module
                )));
            }
            let mut opts = SslOpts::default();
            if let Some(ca) = &material.ca {
                opts = opts.with_root_certs(vec![ca.clone().into()]);
            }
            Ok(Some(opts))
        }
    }
}

#[async_trait]
impl ConnectionPool for MysqlPool {
    async fn acquire(&self) -> Result<Box<dyn RawConnection>> {
        self.waiting.fetch_add(1, Ordering::AcqRel);
        let acquired = tokio::time::timeout(self.acquire_timeout, self.pool.get_conn()).await;
        self.waiting.fetch_sub(1, Ordering::AcqRel);

        let conn = acquired
            .map_err(|_| DatabaseError::pool_exhausted(&self.module, duration_millis(self.acquire_timeout)))?
            .map_err(|e| {
                DatabaseError::connection_failed_with_source(
                    &self.module,
                    "Failed to acquire connection",
                    Box::new(e),
                )
            })?;

        self.in_use.fetch_add(1, Ordering::AcqRel);
        Ok(Box::new(MysqlConnection {
            module: self.module.clone(),
            conn: Some(conn),
            operation_timeout: self.operation_timeout,
            in_transaction: false,
            in_use: Arc::clone(&self.in_use),
        }))
    }

    fn status(&self) -> PoolStatus {
        let in_use = self.in_use.load(Ordering::Acquire);
        PoolStatus {
            size: in_use,
            available: 0,
            waiting: self.waiting.load(Ordering::Acquire),
        }
    }

    async fn close(&self) {
        if let Err(e) = self.pool.clone().disconnect().await {
            warn!(module = %self.module, error = %e, "failed to disconnect mysql pool");
        }
    }
}

/// One pooled MySQL connection
pub struct MysqlConnection {
    module: String,
    conn: Option<Conn>,
    operation_timeout: Duration,
    in_transaction: bool,
    in_use: Arc<AtomicUsize>,
}

impl MysqlConnection {
    fn conn_mut(&mut self) -> Result<&mut Conn> {
        self.conn
            .as_mut()
            .ok_or_else(|| DatabaseError::resource("connection already released"))
    }

    async fn run_control(&mut self, sql: &'static str) -> Result<()> {
        let timeout = self.operation_timeout;
        let conn = self.conn_mut()?;
        with_timeout(timeout, async move {
            conn.query_drop(sql)
                .await
                .map_err(|e| DatabaseError::transaction(format!("{}: {}", sql, e)))
        })
        .await
    }
}

#[async_trait]
impl RawConnection for MysqlConnection {
    async fn query(&mut self, sql: &str, params: &[DatabaseValue]) -> Result<QueryOutput> {
        let timeout = self.operation_timeout;
        let conn = self.conn_mut()?;

        with_timeout(timeout, async move {
            let rows: Vec<Row> = if params.is_empty() {
                conn.query(sql).await?
            } else {
                let values: Vec<Value> = params.iter().map(value_to_mysql).collect();
                conn.exec(sql, Params::Positional(values)).await?
            };

            let last_insert_id = conn.last_insert_id().filter(|id| *id > 0);
            Ok::<_, DatabaseError>(QueryOutput {
                rows: rows.iter().map(row_to_database_row).collect(),
                affected_rows: conn.affected_rows(),
                last_insert_id,
            })
        })
        .await
    }

    async fn begin(&mut self) -> Result<()> {
        self.run_control("START TRANSACTION").await?;
        self.in_transaction = true;
        Ok(())
    }

    async fn commit(&mut self) -> Result<()> {
        self.run_control("COMMIT").await?;
        self.in_transaction = false;
        Ok(())
    }

    async fn rollback(&mut self) -> Result<()> {
        self.run_control("ROLLBACK").await?;
        self.in_transaction = false;
        Ok(())
    }

    async fn release(self: Box<Self>, mode: ReleaseMode) -> Result<()> {
        let mut this = self;
        let conn = this
            .conn
            .take()
            .ok_or_else(|| DatabaseError::resource("connection already released"))?;

        if mode == ReleaseMode::Discard || this.in_transaction {
            debug!(module = %this.module, "disconnecting mysql connection");
            conn.disconnect()
                .await
                .map_err(|e| DatabaseError::resource(format!("disconnect failed: {}", e)))?;
        } else {
            drop(conn);
        }
        Ok(())
    }
}

impl Drop for MysqlConnection {
    fn drop(&mut self) {
        if self.conn.is_some() && self.in_transaction {
            warn!(
                module = %self.module,
                "mysql connection dropped inside a transaction"
            );
        }
        self.in_use.fetch_sub(1, Ordering::AcqRel);
    }
}

fn row_to_database_row(row: &Row) -> DatabaseRow {
    let mut db_row = DatabaseRow::new();
    for (idx, column) in row.columns_ref().iter().enumerate() {
        let value = row
            .as_ref(idx)
            .map(mysql_to_value)
            .unwrap_or(DatabaseValue::Null);
        db_row.insert(column.name_str().to_string(), value);
    }
    db_row
}

#[allow(unreachable_patterns)]
fn mysql_to_value(value: &Value) -> DatabaseValue {
    match value {
        Value::NULL => DatabaseValue::Null,
        Value::Bytes(bytes) => match String::from_utf8(bytes.clone()) {
            Ok(text) => DatabaseValue::Text(text),
            Err(e) => DatabaseValue::Bytes(e.into_bytes()),
        },
        Value::Int(v) => DatabaseValue::Int(*v),
        Value::UInt(v) => DatabaseValue::UInt(*v),
        Value::Float(v) => DatabaseValue::Double(*v as f64),
        Value::Double(v) => DatabaseValue::Double(*v),
        Value::Date(year, month, day, hour, minute, second, micros) => {
            NaiveDate::from_ymd_opt(*year as i32, *month as u32, *day as u32)
                .and_then(|date| {
                    date.and_hms_micro_opt(*hour as u32, *minute as u32, *second as u32, *micros)
                })
                .map(DatabaseValue::Timestamp)
                .unwrap_or(DatabaseValue::Null)
        }
        Value::Time(negative, days, hours, minutes, seconds, micros) => DatabaseValue::Text(format!(
            "{}{}:{:02}:{:02}.{:06}",
            if *negative { "-" } else { "" },
            *days * 24 + *hours as u32,
            minutes,
            seconds,
            micros
        )),
        other => DatabaseValue::Text(format!("{:?}", other)),
    }
}

fn value_to_mysql(value: &DatabaseValue) -> Value {
    match value {
        DatabaseValue::Null => Value::NULL,
        DatabaseValue::Bool(v) => Value::Int(*v as i64),
        DatabaseValue::Int(v) => Value::Int(*v),
        DatabaseValue::UInt(v) => Value::UInt(*v),
        DatabaseValue::Double(v) => Value::Double(*v),
        DatabaseValue::Text(v) => Value::Bytes(v.clone().into_bytes()),
        DatabaseValue::Bytes(v) => Value::Bytes(v.clone()),
        DatabaseValue::Timestamp(ts) => Value::Date(
            ts.year() as u16,
            ts.month() as u8,
            ts.day() as u8,
            ts.hour() as u8,
            ts.minute() as u8,
            ts.second() as u8,
            ts.nanosecond() / 1_000,
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::TlsMaterial;
    use crate::core::database_types::DatabaseType;

    #[test]
    fn test_value_mapping() {
        assert_eq!(value_to_mysql(&DatabaseValue::Bool(true)), Value::Int(1));
        assert_eq!(
            mysql_to_value(&Value::Bytes(b"abc".to_vec())),
            DatabaseValue::Text("abc".to_string())
        );
        assert_eq!(
            mysql_to_value(&Value::Bytes(vec![0xff, 0xfe])),
            DatabaseValue::Bytes(vec![0xff, 0xfe])
        );

        let ts = NaiveDate::from_ymd_opt(2024, 2, 29)
            .and_then(|d| d.and_hms_micro_opt(13, 5, 9, 250))
            .unwrap();
        let round = mysql_to_value(&value_to_mysql(&DatabaseValue::Timestamp(ts)));
        assert_eq!(round, DatabaseValue::Timestamp(ts));
    }

    #[test]
    fn test_client_certificates_rejected() {
        let ssl = SslConfig::Material(TlsMaterial {
            ca: None,
            key: Some("/etc/ssl/client.key".into()),
            cert: Some("/etc/ssl/client.pem".into()),
        });
        assert!(ssl_opts("main", &ssl).is_err());
        assert!(ssl_opts("main", &SslConfig::Enabled(false)).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_pool_created_lazily() {
        let config = ModuleConfig::new(DatabaseType::Mysql)
            .host("127.0.0.1")
            .user("root")
            .database("app");
        let pool = MysqlPool::create("main", &config, &PoolSettings::default()).unwrap();
        assert_eq!(pool.status().size, 0);
    }
}
