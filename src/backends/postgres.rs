//! PostgreSQL backend
//!
//! Pools `tokio_postgres` clients with deadpool-postgres. Only plaintext
//! connections are built; a module that asks for TLS is rejected when its
//! pool is created.

use crate::core::{
    config::{ModuleConfig, PoolSettings},
    driver::{duration_millis, with_timeout, ConnectionPool, PoolStatus, RawConnection, ReleaseMode},
    error::{DatabaseError, Result},
    value::{DatabaseRow, DatabaseValue, QueryOutput},
};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use deadpool_postgres::{Manager, ManagerConfig, Object, Pool, PoolError, RecyclingMethod, Runtime};
use std::sync::Arc;
use std::time::Duration;
use tokio_postgres::types::{FromSqlOwned, ToSql, Type};
use tokio_postgres::{NoTls, Row};
use tracing::{debug, warn};
use uuid::Uuid;

/// Pool of PostgreSQL clients for one module
pub struct PostgresPool {
    module: String,
    target: String,
    pool: Pool,
    acquire_timeout: Duration,
    operation_timeout: Duration,
}

impl PostgresPool {
    /// Build the pool. Clients connect on first acquire.
    ///
    /// # Errors
    ///
    /// Returns error if TLS is requested or deadpool rejects the configuration
    pub fn create(
        module: &str,
        config: &ModuleConfig,
        settings: &PoolSettings,
    ) -> Result<Arc<dyn ConnectionPool>> {
        if config.ssl.is_enabled() {
            return Err(DatabaseError::config(format!(
                "module '{}': TLS connections are not supported by the postgres backend",
                module
            )));
        }

        let host = config
            .host
            .as_deref()
            .ok_or_else(|| DatabaseError::config(format!("module '{}' has no host", module)))?;

        let mut pg_config = tokio_postgres::Config::new();
        pg_config
            .host(host)
            .port(config.effective_port().unwrap_or(5432))
            .connect_timeout(settings.acquire_timeout);
        if let Some(user) = &config.user {
            pg_config.user(user);
        }
        if let Some(password) = &config.password {
            pg_config.password(password);
        }
        if let Some(database) = &config.database {
            pg_config.dbname(database);
        }

        let manager = Manager::from_config(
            pg_config,
            NoTls,
            ManagerConfig {
                recycling_method: RecyclingMethod::Fast,
            },
        );

        let pool = Pool::builder(manager)
            .max_size(settings.max_size)
            .wait_timeout(Some(settings.acquire_timeout))
            .runtime(Runtime::Tokio1)
            .build()
            .map_err(|e| DatabaseError::config(format!("Failed to create pool: {}", e)))?;

        Ok(Arc::new(Self {
            module: module.to_string(),
            target: config.redacted_url(),
            pool,
            acquire_timeout: settings.acquire_timeout,
            operation_timeout: settings.operation_timeout,
        }))
    }
}

#[async_trait]
impl ConnectionPool for PostgresPool {
    async fn acquire(&self) -> Result<Box<dyn RawConnection>> {
        let client = self.pool.get().await.map_err(|e| match e {
            PoolError::Timeout(_) => {
                DatabaseError::pool_exhausted(&self.module, duration_millis(self.acquire_timeout))
            }
            other => DatabaseError::connection_failed(&self.target, other.to_string()),
        })?;

        Ok(Box::new(PostgresConnection {
            module: self.module.clone(),
            client: Some(client),
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

/// One pooled PostgreSQL client
pub struct PostgresConnection {
    module: String,
    client: Option<Object>,
    operation_timeout: Duration,
    in_transaction: bool,
}

impl PostgresConnection {
    fn client(&self) -> Result<&Object> {
        self.client
            .as_ref()
            .ok_or_else(|| DatabaseError::resource("connection already released"))
    }

    async fn run_control(&mut self, sql: &'static str) -> Result<()> {
        let client = self.client()?;
        with_timeout(self.operation_timeout, async move {
            client
                .batch_execute(sql)
                .await
                .map_err(|e| DatabaseError::transaction(format!("{}: {}", sql, e)))
        })
        .await
    }
}

#[async_trait]
impl RawConnection for PostgresConnection {
    async fn query(&mut self, sql: &str, params: &[DatabaseValue]) -> Result<QueryOutput> {
        let client = self.client()?;

        with_timeout(self.operation_timeout, async move {
            let statement = client.prepare(sql).await?;
            let pg_params = bind_params(params, statement.params())?;
            let param_refs: Vec<&(dyn ToSql + Sync)> = pg_params
                .iter()
                .map(|p| p.as_ref() as &(dyn ToSql + Sync))
                .collect();

            if statement.columns().is_empty() {
                let affected = client.execute(&statement, &param_refs).await?;
                Ok::<_, DatabaseError>(QueryOutput::from_affected(affected, None))
            } else {
                let rows = client.query(&statement, &param_refs).await?;
                let rows = rows
                    .iter()
                    .map(row_to_database_row)
                    .collect::<Result<Vec<_>>>()?;
                Ok::<_, DatabaseError>(QueryOutput::from_rows(rows))
            }
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
        let client = this
            .client
            .take()
            .ok_or_else(|| DatabaseError::resource("connection already released"))?;

        if mode == ReleaseMode::Discard || this.in_transaction {
            debug!(module = %this.module, "discarding postgres client");
            drop(Object::take(client));
        } else {
            drop(client);
        }
        Ok(())
    }
}

impl Drop for PostgresConnection {
    fn drop(&mut self) {
        if let Some(client) = self.client.take() {
            if self.in_transaction {
                warn!(
                    module = %self.module,
                    "postgres client dropped inside a transaction; removing it from the pool"
                );
                drop(Object::take(client));
            }
        }
    }
}

/// Read one column; SQL NULL is `None`
fn column<T: FromSqlOwned>(row: &Row, idx: usize) -> Result<Option<T>> {
    Ok(row.try_get::<_, Option<T>>(idx)?)
}

fn row_to_database_row(row: &Row) -> Result<DatabaseRow> {
    let mut db_row = DatabaseRow::new();

    for (idx, col) in row.columns().iter().enumerate() {
        let value = match col.type_().name() {
            "bool" => column::<bool>(row, idx)?.map(DatabaseValue::Bool),
            "int2" => column::<i16>(row, idx)?.map(|v| DatabaseValue::Int(v.into())),
            "int4" => column::<i32>(row, idx)?.map(|v| DatabaseValue::Int(v.into())),
            "int8" => column::<i64>(row, idx)?.map(DatabaseValue::Int),
            "oid" => column::<u32>(row, idx)?.map(|v| DatabaseValue::UInt(v.into())),
            "float4" => column::<f32>(row, idx)?.map(|v| DatabaseValue::Double(v.into())),
            "float8" => column::<f64>(row, idx)?.map(DatabaseValue::Double),
            "text" | "varchar" | "bpchar" | "name" | "citext" | "unknown" => {
                column::<String>(row, idx)?.map(DatabaseValue::Text)
            }
            "bytea" => column::<Vec<u8>>(row, idx)?.map(DatabaseValue::Bytes),
            "timestamp" => column::<NaiveDateTime>(row, idx)?.map(DatabaseValue::Timestamp),
            "timestamptz" => {
                column::<DateTime<Utc>>(row, idx)?.map(|v| DatabaseValue::Timestamp(v.naive_utc()))
            }
            "date" => column::<NaiveDate>(row, idx)?
                .and_then(|v| v.and_hms_opt(0, 0, 0))
                .map(DatabaseValue::Timestamp),
            "uuid" => column::<Uuid>(row, idx)?.map(|v| DatabaseValue::Text(v.to_string())),
            "json" | "jsonb" => {
                column::<serde_json::Value>(row, idx)?.map(|v| DatabaseValue::Text(v.to_string()))
            }
            other => {
                return Err(DatabaseError::query(format!(
                    "column '{}' has unsupported type {}; cast it to text in the query",
                    col.name(),
                    other
                )))
            }
        };
        db_row.insert(col.name().to_string(), value.unwrap_or(DatabaseValue::Null));
    }

    Ok(db_row)
}

/// A bind parameter converted to the Rust type its placeholder expects
#[derive(Debug, Clone, PartialEq)]
enum PgParam {
    Bool(Option<bool>),
    Int2(Option<i16>),
    Int4(Option<i32>),
    Int8(Option<i64>),
    Oid(Option<u32>),
    Float4(Option<f32>),
    Float8(Option<f64>),
    Text(Option<String>),
    Bytes(Option<Vec<u8>>),
    Date(Option<NaiveDate>),
    Timestamp(Option<NaiveDateTime>),
    TimestampTz(Option<DateTime<Utc>>),
    Uuid(Option<Uuid>),
    Json(Option<serde_json::Value>),
}

impl PgParam {
    fn into_sql(self) -> Box<dyn ToSql + Sync + Send> {
        match self {
            PgParam::Bool(v) => Box::new(v),
            PgParam::Int2(v) => Box::new(v),
            PgParam::Int4(v) => Box::new(v),
            PgParam::Int8(v) => Box::new(v),
            PgParam::Oid(v) => Box::new(v),
            PgParam::Float4(v) => Box::new(v),
            PgParam::Float8(v) => Box::new(v),
            PgParam::Text(v) => Box::new(v),
            PgParam::Bytes(v) => Box::new(v),
            PgParam::Date(v) => Box::new(v),
            PgParam::Timestamp(v) => Box::new(v),
            PgParam::TimestampTz(v) => Box::new(v),
            PgParam::Uuid(v) => Box::new(v),
            PgParam::Json(v) => Box::new(v),
        }
    }
}

/// Convert `values` for the placeholders of a prepared statement
fn bind_params(
    values: &[DatabaseValue],
    types: &[Type],
) -> Result<Vec<Box<dyn ToSql + Sync + Send>>> {
    if values.len() != types.len() {
        return Err(DatabaseError::query(format!(
            "statement expects {} parameters, got {}",
            types.len(),
            values.len()
        )));
    }

    values
        .iter()
        .zip(types)
        .enumerate()
        .map(|(idx, (value, ty))| {
            bind_param(value, ty)
                .map(PgParam::into_sql)
                .map_err(|e| match e {
                    DatabaseError::QueryError(message) => {
                        DatabaseError::query(format!("parameter ${}: {}", idx + 1, message))
                    }
                    other => other,
                })
        })
        .collect()
}

fn mismatch(value: &DatabaseValue, ty: &Type) -> DatabaseError {
    DatabaseError::query(format!(
        "cannot bind {} value to a {} parameter",
        value.type_name(),
        ty.name()
    ))
}

fn out_of_range(value: impl std::fmt::Display, ty: &Type) -> DatabaseError {
    DatabaseError::query(format!("value {} is out of range for {}", value, ty.name()))
}

/// Integer view of a value for integer placeholders
fn integer(value: &DatabaseValue, ty: &Type) -> Result<Option<i64>> {
    match value {
        DatabaseValue::Null => Ok(None),
        DatabaseValue::Bool(v) => Ok(Some(i64::from(*v))),
        DatabaseValue::Int(v) => Ok(Some(*v)),
        DatabaseValue::UInt(v) => i64::try_from(*v).map(Some).map_err(|_| out_of_range(v, ty)),
        DatabaseValue::Text(v) => v
            .trim()
            .parse::<i64>()
            .map(Some)
            .map_err(|_| mismatch(value, ty)),
        _ => Err(mismatch(value, ty)),
    }
}

fn narrow<T: TryFrom<i64>>(value: Option<i64>, ty: &Type) -> Result<Option<T>> {
    value
        .map(|v| T::try_from(v).map_err(|_| out_of_range(v, ty)))
        .transpose()
}

/// Floating point view of a value for float placeholders
fn float(value: &DatabaseValue, ty: &Type) -> Result<Option<f64>> {
    match value {
        DatabaseValue::Null => Ok(None),
        DatabaseValue::Int(v) => Ok(Some(*v as f64)),
        DatabaseValue::UInt(v) => Ok(Some(*v as f64)),
        DatabaseValue::Double(v) => Ok(Some(*v)),
        DatabaseValue::Text(v) => v
            .trim()
            .parse::<f64>()
            .map(Some)
            .map_err(|_| mismatch(value, ty)),
        _ => Err(mismatch(value, ty)),
    }
}

fn bind_param(value: &DatabaseValue, ty: &Type) -> Result<PgParam> {
    let param = match ty.name() {
        "bool" => PgParam::Bool(match value {
            DatabaseValue::Null => None,
            DatabaseValue::Bool(v) => Some(*v),
            DatabaseValue::Int(v) => Some(*v != 0),
            _ => return Err(mismatch(value, ty)),
        }),
        "int2" => PgParam::Int2(narrow(integer(value, ty)?, ty)?),
        "int4" => PgParam::Int4(narrow(integer(value, ty)?, ty)?),
        "int8" => PgParam::Int8(integer(value, ty)?),
        "oid" => PgParam::Oid(narrow(integer(value, ty)?, ty)?),
        "float4" => PgParam::Float4(float(value, ty)?.map(|v| v as f32)),
        "float8" => PgParam::Float8(float(value, ty)?),
        "text" | "varchar" | "bpchar" | "name" | "citext" | "unknown" => PgParam::Text(match value {
            DatabaseValue::Null => None,
            DatabaseValue::Bytes(_) => return Err(mismatch(value, ty)),
            DatabaseValue::Text(v) => Some(v.clone()),
            other => Some(other.to_string()),
        }),
        "bytea" => PgParam::Bytes(match value {
            DatabaseValue::Null => None,
            DatabaseValue::Bytes(v) => Some(v.clone()),
            DatabaseValue::Text(v) => Some(v.clone().into_bytes()),
            _ => return Err(mismatch(value, ty)),
        }),
        "date" => PgParam::Date(match value {
            DatabaseValue::Null => None,
            DatabaseValue::Timestamp(v) => Some(v.date()),
            _ => return Err(mismatch(value, ty)),
        }),
        "timestamp" => PgParam::Timestamp(match value {
            DatabaseValue::Null => None,
            DatabaseValue::Timestamp(v) => Some(*v),
            _ => return Err(mismatch(value, ty)),
        }),
        "timestamptz" => PgParam::TimestampTz(match value {
            DatabaseValue::Null => None,
            DatabaseValue::Timestamp(v) => Some(DateTime::from_naive_utc_and_offset(*v, Utc)),
            _ => return Err(mismatch(value, ty)),
        }),
        "uuid" => PgParam::Uuid(match value {
            DatabaseValue::Null => None,
            DatabaseValue::Text(v) => Some(Uuid::parse_str(v).map_err(|_| mismatch(value, ty))?),
            _ => return Err(mismatch(value, ty)),
        }),
        "json" | "jsonb" => PgParam::Json(match value {
            DatabaseValue::Null => None,
            DatabaseValue::Text(v) => Some(serde_json::from_str(v)?),
            DatabaseValue::Bool(v) => Some((*v).into()),
            DatabaseValue::Int(v) => Some((*v).into()),
            DatabaseValue::UInt(v) => Some((*v).into()),
            DatabaseValue::Double(v) => Some((*v).into()),
            _ => return Err(mismatch(value, ty)),
        }),
        other => {
            return Err(DatabaseError::query(format!(
                "unsupported parameter type {}; cast the placeholder to text",
                other
            )))
        }
    };
    Ok(param)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::SslConfig;
    use crate::core::database_types::DatabaseType;

    fn module() -> ModuleConfig {
        ModuleConfig::new(DatabaseType::Postgres)
            .host("127.0.0.1")
            .user("postgres")
            .database("app")
    }

    #[test]
    fn test_tls_rejected() {
        let config = module().ssl(SslConfig::Enabled(true));
        let err = PostgresPool::create("reports", &config, &PoolSettings::default())
            .err()
            .expect("tls must be rejected");
        assert!(matches!(err, DatabaseError::Config(_)));
    }

    #[test]
    fn test_integers_bind_to_declared_width() {
        let one = DatabaseValue::from(1);
        assert_eq!(bind_param(&one, &Type::INT2).unwrap(), PgParam::Int2(Some(1)));
        assert_eq!(bind_param(&one, &Type::INT4).unwrap(), PgParam::Int4(Some(1)));
        assert_eq!(bind_param(&one, &Type::INT8).unwrap(), PgParam::Int8(Some(1)));
        assert_eq!(
            bind_param(&DatabaseValue::UInt(7), &Type::INT4).unwrap(),
            PgParam::Int4(Some(7))
        );
        assert_eq!(bind_param(&one, &Type::FLOAT8).unwrap(), PgParam::Float8(Some(1.0)));
    }

    #[test]
    fn test_out_of_range_integer_is_a_query_error() {
        let err = bind_param(&DatabaseValue::Int(70_000), &Type::INT2).unwrap_err();
        assert!(matches!(err, DatabaseError::QueryError(_)));
        assert!(err.to_string().contains("out of range"));

        assert!(bind_param(&DatabaseValue::UInt(u64::MAX), &Type::INT8).is_err());
    }

    #[test]
    fn test_null_takes_the_placeholder_type() {
        assert_eq!(bind_param(&DatabaseValue::Null, &Type::INT4).unwrap(), PgParam::Int4(None));
        assert_eq!(bind_param(&DatabaseValue::Null, &Type::TEXT).unwrap(), PgParam::Text(None));
        assert_eq!(
            bind_param(&DatabaseValue::Null, &Type::TIMESTAMPTZ).unwrap(),
            PgParam::TimestampTz(None)
        );
    }

    #[test]
    fn test_text_and_timestamp_binding() {
        assert_eq!(
            bind_param(&DatabaseValue::Double(2.5), &Type::FLOAT4).unwrap(),
            PgParam::Float4(Some(2.5))
        );
        assert_eq!(
            bind_param(&DatabaseValue::Int(42), &Type::VARCHAR).unwrap(),
            PgParam::Text(Some("42".to_string()))
        );

        let ts = NaiveDate::from_ymd_opt(2024, 2, 29)
            .and_then(|d| d.and_hms_opt(12, 0, 0))
            .unwrap();
        assert_eq!(
            bind_param(&DatabaseValue::Timestamp(ts), &Type::TIMESTAMPTZ).unwrap(),
            PgParam::TimestampTz(Some(DateTime::from_naive_utc_and_offset(ts, Utc)))
        );
        assert!(bind_param(&DatabaseValue::Text("soon".into()), &Type::TIMESTAMP).is_err());
    }

    #[test]
    fn test_unmapped_parameter_type_is_rejected() {
        let err = bind_param(&DatabaseValue::Text("1.50".into()), &Type::NUMERIC).unwrap_err();
        assert!(err.to_string().contains("numeric"));
    }

    #[test]
    fn test_parameter_count_must_match() {
        let err = bind_params(&[DatabaseValue::from(1)], &[Type::INT4, Type::INT4])
            .err()
            .expect("count mismatch");
        assert!(err.to_string().contains("expects 2 parameters, got 1"));
    }

    #[tokio::test]
    async fn test_pool_created_without_connecting() {
        let pool = PostgresPool::create("reports", &module(), &PoolSettings::default()).unwrap();
        assert_eq!(pool.status().size, 0);
    }
}
