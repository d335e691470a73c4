//! Bind parameters, result cells and query output
//!
//! Values are driver-neutral so one statement list can be replayed against
//! any backend.

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A single bind parameter or result cell
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DatabaseValue {
    /// SQL NULL
    Null,
    /// Boolean value
    Bool(bool),
    /// Signed integer
    Int(i64),
    /// Unsigned integer (MySQL `UNSIGNED` columns)
    UInt(u64),
    /// Floating point
    Double(f64),
    /// Text value
    Text(String),
    /// Binary data
    Bytes(Vec<u8>),
    /// Date and time without zone
    Timestamp(NaiveDateTime),
}

impl DatabaseValue {
    /// Get the value as a boolean
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            DatabaseValue::Bool(v) => Some(*v),
            DatabaseValue::Int(v) => Some(*v != 0),
            DatabaseValue::UInt(v) => Some(*v != 0),
            _ => None,
        }
    }

    /// Get the value as an i64
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            DatabaseValue::Int(v) => Some(*v),
            DatabaseValue::UInt(v) => i64::try_from(*v).ok(),
            DatabaseValue::Bool(v) => Some(*v as i64),
            DatabaseValue::Text(s) => s.parse().ok(),
            _ => None,
        }
    }

    /// Get the value as an f64
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            DatabaseValue::Double(v) => Some(*v),
            DatabaseValue::Int(v) => Some(*v as f64),
            DatabaseValue::UInt(v) => Some(*v as f64),
            DatabaseValue::Text(s) => s.parse().ok(),
            _ => None,
        }
    }

    /// Borrow the value as text without conversion
    pub fn as_str(&self) -> Option<&str> {
        match self {
            DatabaseValue::Text(s) => Some(s.as_str()),
            _ => None,
        }
    }

    /// Borrow the value as bytes (text is exposed as its UTF-8 bytes)
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            DatabaseValue::Bytes(b) => Some(b),
            DatabaseValue::Text(s) => Some(s.as_bytes()),
            _ => None,
        }
    }

    /// Check if the value is null
    pub fn is_null(&self) -> bool {
        matches!(self, DatabaseValue::Null)
    }

    /// Get the type name of this value
    pub fn type_name(&self) -> &'static str {
        match self {
            DatabaseValue::Null => "null",
            DatabaseValue::Bool(_) => "bool",
            DatabaseValue::Int(_) => "int",
            DatabaseValue::UInt(_) => "uint",
            DatabaseValue::Double(_) => "double",
            DatabaseValue::Text(_) => "text",
            DatabaseValue::Bytes(_) => "bytes",
            DatabaseValue::Timestamp(_) => "timestamp",
        }
    }
}

impl std::fmt::Display for DatabaseValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DatabaseValue::Null => f.write_str("NULL"),
            DatabaseValue::Bool(v) => write!(f, "{}", v),
            DatabaseValue::Int(v) => write!(f, "{}", v),
            DatabaseValue::UInt(v) => write!(f, "{}", v),
            DatabaseValue::Double(v) => write!(f, "{}", v),
            DatabaseValue::Text(s) => f.write_str(s),
            DatabaseValue::Bytes(b) => write!(f, "<{} bytes>", b.len()),
            DatabaseValue::Timestamp(ts) => write!(f, "{}", ts.format("%Y-%m-%d %H:%M:%S%.f")),
        }
    }
}

impl From<bool> for DatabaseValue {
    fn from(v: bool) -> Self {
        DatabaseValue::Bool(v)
    }
}

impl From<i32> for DatabaseValue {
    fn from(v: i32) -> Self {
        DatabaseValue::Int(v as i64)
    }
}

impl From<i64> for DatabaseValue {
    fn from(v: i64) -> Self {
        DatabaseValue::Int(v)
    }
}

impl From<u64> for DatabaseValue {
    fn from(v: u64) -> Self {
        DatabaseValue::UInt(v)
    }
}

impl From<f64> for DatabaseValue {
    fn from(v: f64) -> Self {
        DatabaseValue::Double(v)
    }
}

impl From<String> for DatabaseValue {
    fn from(v: String) -> Self {
        DatabaseValue::Text(v)
    }
}

impl From<&str> for DatabaseValue {
    fn from(v: &str) -> Self {
        DatabaseValue::Text(v.to_string())
    }
}

impl From<Vec<u8>> for DatabaseValue {
    fn from(v: Vec<u8>) -> Self {
        DatabaseValue::Bytes(v)
    }
}

impl From<NaiveDateTime> for DatabaseValue {
    fn from(v: NaiveDateTime) -> Self {
        DatabaseValue::Timestamp(v)
    }
}

impl<T: Into<DatabaseValue>> From<Option<T>> for DatabaseValue {
    fn from(v: Option<T>) -> Self {
        match v {
            Some(val) => val.into(),
            None => DatabaseValue::Null,
        }
    }
}

/// A row of results (column name -> value mapping)
pub type DatabaseRow = HashMap<String, DatabaseValue>;

/// Driver result of one statement
///
/// Row-returning statements fill `rows`; data-changing statements report
/// `affected_rows` and, where the driver exposes one, `last_insert_id`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryOutput {
    pub rows: Vec<DatabaseRow>,
    pub affected_rows: u64,
    pub last_insert_id: Option<u64>,
}

impl QueryOutput {
    /// Output of a row-returning statement
    pub fn from_rows(rows: Vec<DatabaseRow>) -> Self {
        Self {
            rows,
            ..Default::default()
        }
    }

    /// Output of a data-changing statement
    pub fn from_affected(affected_rows: u64, last_insert_id: Option<u64>) -> Self {
        Self {
            rows: Vec::new(),
            affected_rows,
            last_insert_id,
        }
    }

    /// First row, if any
    pub fn first(&self) -> Option<&DatabaseRow> {
        self.rows.first()
    }

    /// Value of `column` in the first row
    pub fn scalar(&self, column: &str) -> Option<&DatabaseValue> {
        self.first().and_then(|row| row.get(column))
    }
}
