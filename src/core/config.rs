//! Module and connector configuration
//!
//! A connector is built from a map of module name to [`ModuleConfig`]. The
//! types deserialize from JSON so deployments can keep them in a file; code
//! can use the builder methods instead.

use super::database_types::DatabaseType;
use super::error::{DatabaseError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Client-side TLS files for a module
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TlsMaterial {
    /// CA certificate (PEM) used to verify the server
    #[serde(default)]
    pub ca: Option<PathBuf>,
    /// Client private key (PEM)
    #[serde(default)]
    pub key: Option<PathBuf>,
    /// Client certificate chain (PEM)
    #[serde(default)]
    pub cert: Option<PathBuf>,
}

/// TLS setting: a plain switch or explicit material
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SslConfig {
    Enabled(bool),
    Material(TlsMaterial),
}

impl Default for SslConfig {
    fn default() -> Self {
        SslConfig::Enabled(false)
    }
}

impl SslConfig {
    pub fn is_enabled(&self) -> bool {
        !matches!(self, SslConfig::Enabled(false))
    }

    pub fn material(&self) -> Option<&TlsMaterial> {
        match self {
            SslConfig::Material(material) => Some(material),
            SslConfig::Enabled(_) => None,
        }
    }
}

/// Connection settings for one module. Immutable once a connector is built.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleConfig {
    #[serde(default)]
    pub driver: DatabaseType,
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    /// Database name, or the file path for SQLite
    #[serde(default)]
    pub database: Option<String>,
    #[serde(default)]
    pub ssl: SslConfig,
}

impl std::fmt::Debug for ModuleConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleConfig")
            .field("driver", &self.driver)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .field("database", &self.database)
            .field("ssl", &self.ssl)
            .finish()
    }
}

impl ModuleConfig {
    /// Create a new module configuration for the given driver
    pub fn new(driver: DatabaseType) -> Self {
        Self {
            driver,
            ..Default::default()
        }
    }

    /// SQLite module backed by the file at `path`
    pub fn sqlite(path: impl AsRef<Path>) -> Self {
        Self::new(DatabaseType::Sqlite).database(path.as_ref().to_string_lossy())
    }

    /// Set the database host
    pub fn host<S: Into<String>>(mut self, host: S) -> Self {
        self.host = Some(host.into());
        self
    }

    /// Set the database port
    pub fn port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    /// Set the user name
    pub fn user<S: Into<String>>(mut self, user: S) -> Self {
        self.user = Some(user.into());
        self
    }

    /// Set the password
    pub fn password<S: Into<String>>(mut self, password: S) -> Self {
        self.password = Some(password.into());
        self
    }

    /// Set the database name (file path for SQLite)
    pub fn database<S: Into<String>>(mut self, database: S) -> Self {
        self.database = Some(database.into());
        self
    }

    /// Set the TLS configuration
    pub fn ssl(mut self, ssl: SslConfig) -> Self {
        self.ssl = ssl;
        self
    }

    /// Port after applying the driver default
    pub fn effective_port(&self) -> Option<u16> {
        self.port.or_else(|| self.driver.default_port())
    }

    /// Connection target for logs and error messages, without the password
    pub fn redacted_url(&self) -> String {
        match self.driver {
            DatabaseType::Sqlite => format!(
                "sqlite://{}",
                self.database.as_deref().unwrap_or(":memory:")
            ),
            driver => {
                let user = self
                    .user
                    .as_deref()
                    .map(|u| format!("{}@", u))
                    .unwrap_or_default();
                let port = self
                    .effective_port()
                    .map(|p| format!(":{}", p))
                    .unwrap_or_default();
                format!(
                    "{}://{}{}{}/{}",
                    driver,
                    user,
                    self.host.as_deref().unwrap_or("localhost"),
                    port,
                    self.database.as_deref().unwrap_or("")
                )
            }
        }
    }

    /// Check that the module can be turned into a pool
    pub fn validate(&self, module: &str) -> Result<()> {
        if !self.driver.is_enabled() {
            return Err(DatabaseError::unsupported(format!(
                "module '{}' uses driver '{}' but the '{}' feature is not enabled",
                module,
                self.driver,
                self.driver.feature_name()
            )));
        }

        if self.driver.is_networked() {
            if self.host.as_deref().map_or(true, |h| h.trim().is_empty()) {
                return Err(DatabaseError::config(format!(
                    "module '{}' has no host",
                    module
                )));
            }
        } else if self.database.as_deref().map_or(true, |d| d.trim().is_empty()) {
            return Err(DatabaseError::config(format!(
                "module '{}' has no database path",
                module
            )));
        }

        Ok(())
    }
}

/// Serde helper storing durations as milliseconds
mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

/// Pool sizing and timeouts applied to every module
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolSettings {
    /// Maximum number of connections per module pool
    pub max_size: usize,
    /// How long an acquire may wait before reporting pool exhaustion
    #[serde(rename = "acquire_timeout_ms", with = "millis")]
    pub acquire_timeout: Duration,
    /// Upper bound for a single driver call (query, begin, commit, rollback)
    #[serde(rename = "operation_timeout_ms", with = "millis")]
    pub operation_timeout: Duration,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max_size: 16,
            acquire_timeout: Duration::from_secs(5),
            operation_timeout: Duration::from_secs(30),
        }
    }
}

impl PoolSettings {
    /// Set maximum pool size
    pub fn with_max_size(mut self, size: usize) -> Self {
        self.max_size = size;
        self
    }

    /// Set connection acquisition timeout
    pub fn with_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }

    /// Set driver operation timeout
    pub fn with_operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout = timeout;
        self
    }
}

/// Everything a connector is constructed from
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectorConfig {
    pub modules: BTreeMap<String, ModuleConfig>,
    #[serde(default)]
    pub pool: PoolSettings,
    /// Reject queries and transactions until `init()` has succeeded
    #[serde(default)]
    pub require_init_before_query: bool,
}

impl ConnectorConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a module
    pub fn module(mut self, name: impl Into<String>, config: ModuleConfig) -> Self {
        self.modules.insert(name.into(), config);
        self
    }

    pub fn with_pool(mut self, pool: PoolSettings) -> Self {
        self.pool = pool;
        self
    }

    pub fn require_init(mut self, required: bool) -> Self {
        self.require_init_before_query = required;
        self
    }

    /// Parse a JSON document
    pub fn from_json_str(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Read and parse a JSON file
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    /// Connector-level checks. Per-module problems are reported by
    /// [`ModuleConfig::validate`] when pools are created.
    pub fn validate(&self) -> Result<()> {
        if self.modules.is_empty() {
            return Err(DatabaseError::config("no modules configured"));
        }
        if let Some(name) = self.modules.keys().find(|name| name.trim().is_empty()) {
            return Err(DatabaseError::config(format!(
                "invalid module name '{}'",
                name
            )));
        }
        if self.pool.max_size == 0 {
            return Err(DatabaseError::config("pool max_size must be at least 1"));
        }
        Ok(())
    }
}
