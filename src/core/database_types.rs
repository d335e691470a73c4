//! Driver selection for a module
//!
//! Each configured module names the backend its pool is created with.

use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Supported database drivers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseType {
    /// MySQL/MariaDB database
    #[default]
    Mysql,
    /// PostgreSQL database
    Postgres,
    /// SQLite database file
    Sqlite,
}

impl DatabaseType {
    /// Convert database type to string representation
    pub fn to_str(&self) -> &'static str {
        match self {
            DatabaseType::Mysql => "mysql",
            DatabaseType::Postgres => "postgres",
            DatabaseType::Sqlite => "sqlite",
        }
    }

    /// Port used when a module does not set one
    pub fn default_port(&self) -> Option<u16> {
        match self {
            DatabaseType::Mysql => Some(3306),
            DatabaseType::Postgres => Some(5432),
            DatabaseType::Sqlite => None,
        }
    }

    /// Whether the backend talks to a server over the network
    pub fn is_networked(&self) -> bool {
        !matches!(self, DatabaseType::Sqlite)
    }

    /// Whether this build carries the backend for this driver
    pub fn is_enabled(&self) -> bool {
        match self {
            DatabaseType::Mysql => cfg!(feature = "mysql"),
            DatabaseType::Postgres => cfg!(feature = "postgres"),
            DatabaseType::Sqlite => cfg!(feature = "sqlite"),
        }
    }

    /// Cargo feature that enables the backend
    pub fn feature_name(&self) -> &'static str {
        match self {
            DatabaseType::Mysql => "mysql",
            DatabaseType::Postgres => "postgres",
            DatabaseType::Sqlite => "sqlite",
        }
    }
}

impl std::fmt::Display for DatabaseType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_str())
    }
}

impl FromStr for DatabaseType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "mysql" | "mariadb" => Ok(DatabaseType::Mysql),
            "postgres" | "postgresql" => Ok(DatabaseType::Postgres),
            "sqlite" | "sqlite3" => Ok(DatabaseType::Sqlite),
            _ => Err(format!("Invalid database type: '{}'", s)),
        }
    }
}
