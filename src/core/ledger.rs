//! Per-connector error ledger
//!
//! Failures on the public connector surface are not returned as `Err`; they
//! are appended here as [`ErrorRecord`]s, oldest first, and callers inspect
//! the ledger after an operation reports `None` or `false`.

use super::error::{DatabaseError, ErrorKind};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// Component tag used for records about malformed error input
const LEDGER_COMPONENT: &str = "ErrorLedger";

/// What caused a recorded error
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ErrorCause {
    /// An earlier record this failure followed from
    Record(Box<ErrorRecord>),
    /// Raw text of the underlying driver or input error
    Raw(String),
}

/// One entry in the ledger
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub kind: ErrorKind,
    pub message: String,
    pub component: String,
    pub timestamp: DateTime<Utc>,
    pub cause: Option<ErrorCause>,
}

impl ErrorRecord {
    /// Create a record stamped with the current time and no cause
    pub fn new(kind: ErrorKind, component: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            component: component.into(),
            timestamp: Utc::now(),
            cause: None,
        }
    }

    /// Attach a cause
    pub fn with_cause(mut self, cause: ErrorCause) -> Self {
        self.cause = Some(cause);
        self
    }

    /// Iterate this record followed by every nested record cause
    pub fn chain(&self) -> impl Iterator<Item = &ErrorRecord> {
        std::iter::successors(Some(self), |record| match &record.cause {
            Some(ErrorCause::Record(inner)) => Some(inner.as_ref()),
            _ => None,
        })
    }

    /// Message of the innermost cause
    pub fn root_cause(&self) -> &str {
        let last = self.chain().last().unwrap_or(self);
        match &last.cause {
            Some(ErrorCause::Raw(raw)) => raw,
            _ => &last.message,
        }
    }
}

impl std::fmt::Display for ErrorRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}: {}", self.component, self.kind, self.message)?;
        match &self.cause {
            Some(ErrorCause::Record(inner)) => write!(f, " (caused by {})", inner),
            Some(ErrorCause::Raw(raw)) if raw != &self.message => {
                write!(f, " (caused by {})", raw)
            }
            _ => Ok(()),
        }
    }
}

/// Accepted shapes for [`ErrorLedger::populate_error`]
#[derive(Debug)]
pub enum ErrorInput {
    /// Plain message text
    Message(String),
    /// A connector or driver error
    Error(DatabaseError),
    /// An already-built record, used to chain failures
    Record(ErrorRecord),
    /// Loosely shaped input: a string, or an object with a string `message`
    Json(serde_json::Value),
}

impl ErrorInput {
    /// Message carried by this input, `None` when the shape has none
    fn message(&self) -> Option<String> {
        match self {
            ErrorInput::Message(msg) => Some(msg.clone()),
            ErrorInput::Error(err) => Some(err.to_string()),
            ErrorInput::Record(record) => Some(record.message.clone()),
            ErrorInput::Json(serde_json::Value::String(msg)) => Some(msg.clone()),
            ErrorInput::Json(serde_json::Value::Object(map)) => map
                .get("message")
                .and_then(serde_json::Value::as_str)
                .map(str::to_string),
            ErrorInput::Json(_) => None,
        }
    }

    fn into_cause(self) -> Option<ErrorCause> {
        match self {
            ErrorInput::Record(record) => Some(ErrorCause::Record(Box::new(record))),
            ErrorInput::Error(err) => Some(ErrorCause::Raw(error_chain_text(&err))),
            ErrorInput::Json(value) => Some(ErrorCause::Raw(value.to_string())),
            ErrorInput::Message(msg) => Some(ErrorCause::Raw(msg)),
        }
    }
}

/// Render an error and its `source()` chain on one line
fn error_chain_text(err: &(dyn std::error::Error + 'static)) -> String {
    let mut text = err.to_string();
    let mut source = err.source();
    while let Some(inner) = source {
        text.push_str(": ");
        text.push_str(&inner.to_string());
        source = inner.source();
    }
    text
}

impl From<&str> for ErrorInput {
    fn from(msg: &str) -> Self {
        ErrorInput::Message(msg.to_string())
    }
}

impl From<String> for ErrorInput {
    fn from(msg: String) -> Self {
        ErrorInput::Message(msg)
    }
}

impl From<DatabaseError> for ErrorInput {
    fn from(err: DatabaseError) -> Self {
        ErrorInput::Error(err)
    }
}

impl From<ErrorRecord> for ErrorInput {
    fn from(record: ErrorRecord) -> Self {
        ErrorInput::Record(record)
    }
}

impl From<serde_json::Value> for ErrorInput {
    fn from(value: serde_json::Value) -> Self {
        ErrorInput::Json(value)
    }
}

/// Ordered, append-only history of recorded errors
///
/// Interior mutability lets the connector record from `&self` methods while
/// several operations are in flight.
#[derive(Debug, Default)]
pub struct ErrorLedger {
    records: Mutex<Vec<ErrorRecord>>,
}

impl ErrorLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one record built from `primary`.
    ///
    /// `cause` defaults to `primary` when omitted. `reset` clears the ledger
    /// first. An input without a usable message is recorded as
    /// [`ErrorKind::MalformedError`]. Returns a copy of the appended record.
    pub fn populate_error(
        &self,
        component: &str,
        kind: ErrorKind,
        primary: impl Into<ErrorInput>,
        cause: Option<ErrorInput>,
        reset: bool,
    ) -> ErrorRecord {
        let primary = primary.into();

        let record = match primary.message() {
            Some(message) => {
                let cause = match cause {
                    Some(cause) => cause.into_cause(),
                    None => primary.into_cause(),
                };
                ErrorRecord {
                    kind,
                    message,
                    component: component.to_string(),
                    timestamp: Utc::now(),
                    cause,
                }
            }
            None => ErrorRecord::new(
                ErrorKind::MalformedError,
                LEDGER_COMPONENT,
                format!(
                    "malformed error input from {}: expected a message string or an object with a 'message' field",
                    component
                ),
            )
            .with_cause(ErrorCause::Raw(format!("{:?}", primary))),
        };

        tracing::warn!(
            component = %record.component,
            kind = %record.kind,
            message = %record.message,
            "recorded error"
        );

        let mut records = self.records.lock();
        if reset {
            records.clear();
        }
        records.push(record.clone());
        record
    }

    /// Append a record built from a connector or driver error
    pub fn record(&self, component: &str, kind: ErrorKind, err: DatabaseError) -> ErrorRecord {
        self.populate_error(component, kind, err, None, false)
    }

    /// Append a record whose cause is an earlier record
    pub fn record_chained(
        &self,
        component: &str,
        kind: ErrorKind,
        err: DatabaseError,
        cause: ErrorRecord,
    ) -> ErrorRecord {
        self.populate_error(component, kind, err, Some(ErrorInput::Record(cause)), false)
    }

    /// Whole ledger, oldest first
    pub fn get_error(&self) -> Vec<ErrorRecord> {
        self.records.lock().clone()
    }

    /// Most recent record
    pub fn get_last_error(&self) -> Option<ErrorRecord> {
        self.records.lock().last().cloned()
    }

    pub fn reset_error(&self) {
        self.records.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }
}
