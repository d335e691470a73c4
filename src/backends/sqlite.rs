//! SQLite backend
//!
//! Pools `rusqlite` connections with deadpool. The module's `database`
//! setting is the file path. Every driver call runs on deadpool's blocking
//! worker via `interact` and is bounded by the operation timeout.

use crate::core::{
    config::{ModuleConfig, PoolSettings},
    driver::{duration_millis, with_timeout, ConnectionPool, PoolStatus, RawConnection, ReleaseMode},
    error::{DatabaseError, Result},
    value::{DatabaseRow, DatabaseValue, QueryOutput},
};
use async_trait::async_trait;
use deadpool_sqlite::{Config, Object, Pool, PoolConfig, PoolError, Runtime};
use rusqlite::{params_from_iter, Row};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Pool of SQLite connections for one module
pub struct SqlitePool {
    module: String,
    target: String,
    pool: Pool,
    acquire_timeout: Duration,
    operation_timeout: Duration,
    wal_enabled: AtomicBool,
}

impl SqlitePool {
    /// Build the pool. No connection is opened until the first acquire.
    ///
    /// # Errors
    ///
    /// Returns error if the module has no path or deadpool rejects the configuration
    pub fn create(
        module: &str,
        config: &ModuleConfig,
        settings: &PoolSettings,
    ) -> Result<Arc<dyn ConnectionPool>> {
        let path = config.database.as_deref().ok_or_else(|| {
            DatabaseError::config(format!("module '{}' has no database path", module))
        })?;

        let mut pool_config = PoolConfig::new(settings.max_size);
        pool_config.timeouts.wait = Some(settings.acquire_timeout);

        let mut deadpool_config = Config::new(path);
        deadpool_config.pool = Some(pool_config);

        let pool = deadpool_config
            .create_pool(Runtime::Tokio1)
            .map_err(|e| DatabaseError::config(format!("Failed to create pool: {}", e)))?;

        Ok(Arc::new(Self {
            module: module.to_string(),
            target: config.redacted_url(),
            pool,
            acquire_timeout: settings.acquire_timeout,
            operation_timeout: settings.operation_timeout,
            wal_enabled: AtomicBool::new(false),
        }))
    }
}

#[async_trait]
impl ConnectionPool for SqlitePool {
    async fn acquire(&self) -> Result<Box<dyn RawConnection>> {
        let object = self.pool.get().await.map_err(|e| match e {
            PoolError::Timeout(_) => {
                DatabaseError::pool_exhausted(&self.module, duration_millis(self.acquire_timeout))
            }
            other => DatabaseError::connection_failed(&self.target, other.to_string()),
        })?;

        let busy_timeout = self.operation_timeout;
        let enable_wal = !self.wal_enabled.load(Ordering::Acquire);

        with_timeout(self.operation_timeout, async {
            object
                .interact(move |conn| {
                    conn.busy_timeout(busy_timeout)?;
                    conn.execute_batch("PRAGMA foreign_keys = ON")?;
                    if enable_wal {
                        // journal_mode returns a row, so it goes through query_row
                        conn.query_row("PRAGMA journal_mode = WAL", [], |_| Ok(()))?;
                    }
                    Ok::<_, rusqlite::Error>(())
                })
                .await
                .map_err(|e| {
                    DatabaseError::connection_failed(&self.target, format!("Interact error: {}", e))
                })?
                .map_err(|e| DatabaseError::connection_failed(&self.target, e.to_string()))
        })
        .await?;

        if enable_wal {
            self.wal_enabled.store(true, Ordering::Release);
        }

        Ok(Box::new(SqliteConnection {
            module: self.module.clone(),
            object: Some(object),
            operation_timeout: self.operation_timeout,
            in_transaction: false,
        }))
    }

    fn status(&self) -> PoolStatus {
        let status = self.pool.status();
        PoolStatus {
            size: status.size,
            available: status.available,
            waiting: status.waiting,
        }
    }

    async fn close(&self) {
        self.pool.close();
    }
}

/// One pooled SQLite connection
pub struct SqliteConnection {
    module: String,
    object: Option<Object>,
    operation_timeout: Duration,
    in_transaction: bool,
}

impl SqliteConnection {
    fn object(&self) -> Result<&Object> {
        self.object
            .as_ref()
            .ok_or_else(|| DatabaseError::resource("connection already released"))
    }

    async fn run_control(&mut self, sql: &'static str) -> Result<()> {
        let object = self.object()?;

        with_timeout(self.operation_timeout, async move {
            object
                .interact(move |conn| conn.execute_batch(sql))
                .await
                .map_err(|e| DatabaseError::transaction(format!("Interact error: {}", e)))?
                .map_err(DatabaseError::from)
        })
        .await
    }
}

#[async_trait]
impl RawConnection for SqliteConnection {
    async fn query(&mut self, sql: &str, params: &[DatabaseValue]) -> Result<QueryOutput> {
        let object = self.object()?;
        let sql = sql.to_string();
        let params = params.to_vec();

        with_timeout(self.operation_timeout, async move {
            object
                .interact(move |conn| run_statement(conn, &sql, &params))
                .await
                .map_err(|e| DatabaseError::query(format!("Interact error: {}", e)))?
                .map_err(DatabaseError::from)
        })
        .await
    }

    async fn begin(&mut self) -> Result<()> {
        self.run_control("BEGIN").await?;
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
        let object = this
            .object
            .take()
            .ok_or_else(|| DatabaseError::resource("connection already released"))?;

        if mode == ReleaseMode::Discard || this.in_transaction {
            debug!(module = %this.module, "discarding sqlite connection");
            drop(Object::take(object));
        } else {
            drop(object);
        }
        Ok(())
    }
}

impl Drop for SqliteConnection {
    fn drop(&mut self) {
        if let Some(object) = self.object.take() {
            if self.in_transaction {
                warn!(
                    module = %self.module,
                    "sqlite connection dropped inside a transaction; removing it from the pool"
                );
                drop(Object::take(object));
            }
        }
    }
}

/// Execute one statement, returning rows when it has result columns
fn run_statement(
    conn: &mut rusqlite::Connection,
    sql: &str,
    params: &[DatabaseValue],
) -> rusqlite::Result<QueryOutput> {
    let sqlite_params: Vec<Box<dyn rusqlite::ToSql>> = params.iter().map(value_to_param).collect();
    let mut stmt = conn.prepare(sql)?;

    if stmt.column_count() > 0 {
        let rows = stmt.query_map(params_from_iter(sqlite_params.iter()), row_to_database_row)?;
        let rows = rows.collect::<rusqlite::Result<Vec<_>>>()?;
        return Ok(QueryOutput::from_rows(rows));
    }

    let rowid_before = conn.last_insert_rowid();
    let affected = stmt.execute(params_from_iter(sqlite_params.iter()))?;
    drop(stmt);

    // last_insert_rowid is sticky, so only a changed value belongs to this statement
    let last_insert_id = match conn.last_insert_rowid() {
        id if affected > 0 && id > 0 && id != rowid_before => Some(id as u64),
        _ => None,
    };
    Ok(QueryOutput::from_affected(affected as u64, last_insert_id))
}

/// Convert a rusqlite Row to a DatabaseRow
fn row_to_database_row(row: &Row) -> rusqlite::Result<DatabaseRow> {
    let mut db_row = DatabaseRow::new();
    let column_count = row.as_ref().column_count();

    for i in 0..column_count {
        let column_name = row.as_ref().column_name(i)?.to_string();
        let value = match row.get_ref(i)? {
            rusqlite::types::ValueRef::Null => DatabaseValue::Null,
            rusqlite::types::ValueRef::Integer(v) => DatabaseValue::Int(v),
            rusqlite::types::ValueRef::Real(v) => DatabaseValue::Double(v),
            rusqlite::types::ValueRef::Text(v) => {
                DatabaseValue::Text(String::from_utf8_lossy(v).to_string())
            }
            rusqlite::types::ValueRef::Blob(v) => DatabaseValue::Bytes(v.to_vec()),
        };
        db_row.insert(column_name, value);
    }

    Ok(db_row)
}

/// Convert DatabaseValue to rusqlite parameter
fn value_to_param(value: &DatabaseValue) -> Box<dyn rusqlite::ToSql> {
    match value {
        DatabaseValue::Null => Box::new(None::<i64>),
        DatabaseValue::Bool(v) => Box::new(*v),
        DatabaseValue::Int(v) => Box::new(*v),
        DatabaseValue::UInt(v) => match i64::try_from(*v) {
            Ok(v) => Box::new(v),
            Err(_) => Box::new(v.to_string()),
        },
        DatabaseValue::Double(v) => Box::new(*v),
        DatabaseValue::Text(v) => Box::new(v.clone()),
        DatabaseValue::Bytes(v) => Box::new(v.clone()),
        DatabaseValue::Timestamp(v) => Box::new(v.format("%Y-%m-%d %H:%M:%S%.f").to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn module(dir: &tempfile::TempDir) -> ModuleConfig {
        ModuleConfig::sqlite(dir.path().join("unit.db"))
    }

    #[tokio::test]
    async fn test_sqlite_query_and_execute() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let pool = SqlitePool::create("main", &module(&dir), &PoolSettings::default())?;

        let mut conn = pool.acquire().await?;
        conn.query("CREATE TABLE test (id INTEGER PRIMARY KEY, name TEXT)", &[])
            .await?;

        let inserted = conn
            .query(
                "INSERT INTO test (name) VALUES (?)",
                &[DatabaseValue::from("Alice")],
            )
            .await?;
        assert_eq!(inserted.affected_rows, 1);
        assert_eq!(inserted.last_insert_id, Some(1));

        let selected = conn.query("SELECT id, name FROM test", &[]).await?;
        assert_eq!(selected.rows.len(), 1);
        assert_eq!(selected.scalar("name").and_then(|v| v.as_str()), Some("Alice"));

        conn.release(ReleaseMode::Return).await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_update_does_not_report_earlier_insert_id() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let pool = SqlitePool::create("main", &module(&dir), &PoolSettings::default())?;

        let mut conn = pool.acquire().await?;
        conn.query("CREATE TABLE t (id INTEGER PRIMARY KEY, n TEXT)", &[]).await?;

        let inserted = conn.query("INSERT INTO t (n) VALUES ('a')", &[]).await?;
        assert_eq!(inserted.last_insert_id, Some(1));

        let updated = conn.query("UPDATE t SET n = 'b'", &[]).await?;
        assert_eq!(updated.affected_rows, 1);
        assert_eq!(updated.last_insert_id, None);

        let deleted = conn.query("DELETE FROM t", &[]).await?;
        assert_eq!(deleted.affected_rows, 1);
        assert_eq!(deleted.last_insert_id, None);

        let second = conn.query("INSERT INTO t (id, n) VALUES (7, 'c')", &[]).await?;
        assert_eq!(second.last_insert_id, Some(7));

        conn.release(ReleaseMode::Return).await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_wal_is_retried_after_failed_setup() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let config = module(&dir);
        let path = dir.path().join("unit.db");

        let blocker = rusqlite::Connection::open(&path)?;
        blocker.execute_batch("CREATE TABLE t (id INTEGER); BEGIN EXCLUSIVE;")?;

        let settings = PoolSettings::default().with_operation_timeout(Duration::from_millis(300));
        let pool = SqlitePool::create("main", &config, &settings)?;
        assert!(pool.acquire().await.is_err());

        blocker.execute_batch("COMMIT")?;
        drop(blocker);

        let mut conn = pool.acquire().await?;
        let mode = conn.query("PRAGMA journal_mode", &[]).await?;
        assert_eq!(
            mode.scalar("journal_mode").and_then(|v| v.as_str()),
            Some("wal")
        );
        conn.release(ReleaseMode::Return).await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_sqlite_rollback_discards_changes() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let pool = SqlitePool::create("main", &module(&dir), &PoolSettings::default())?;

        let mut conn = pool.acquire().await?;
        conn.query("CREATE TABLE test (id INTEGER PRIMARY KEY)", &[]).await?;
        conn.begin().await?;
        conn.query("INSERT INTO test (id) VALUES (1)", &[]).await?;
        conn.rollback().await?;

        let count = conn.query("SELECT COUNT(*) AS n FROM test", &[]).await?;
        assert_eq!(count.scalar("n").and_then(DatabaseValue::as_i64), Some(0));

        conn.release(ReleaseMode::Return).await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_sqlite_pool_exhaustion() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let settings = PoolSettings::default()
            .with_max_size(1)
            .with_acquire_timeout(Duration::from_millis(50));
        let pool = SqlitePool::create("main", &module(&dir), &settings)?;

        let held = pool.acquire().await?;
        let err = pool.acquire().await.err().expect("second acquire must fail");
        assert!(matches!(err, DatabaseError::PoolExhausted { .. }));

        held.release(ReleaseMode::Return).await?;
        assert!(pool.acquire().await.is_ok());
        Ok(())
    }

    #[tokio::test]
    async fn test_sqlite_discard_shrinks_pool() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let pool = SqlitePool::create("main", &module(&dir), &PoolSettings::default())?;

        let conn = pool.acquire().await?;
        assert_eq!(pool.status().size, 1);
        conn.release(ReleaseMode::Discard).await?;
        assert_eq!(pool.status().size, 0);
        Ok(())
    }
}
