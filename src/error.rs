//! WolfSync Error Types

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::RowEvent;

/// Result type alias for WolfSync operations
pub type Result<T> = std::result::Result<T, Error>;

/// Failure classification driving the batch retry policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorClass {
    /// Connectivity, timeouts, cancellation. Retried with backoff.
    Transient,
    /// The payload itself is bad. Retrying replays the same bytes.
    DataIntegrity,
    /// Anything else that aborts the unit of work
    Fatal,
}

impl ErrorClass {
    pub fn code(&self) -> &'static str {
        match self {
            ErrorClass::Transient => "TRANSIENT",
            ErrorClass::DataIntegrity => "DATA",
            ErrorClass::Fatal => "FATAL",
        }
    }

    pub fn from_code(code: &str) -> Self {
        match code {
            "TRANSIENT" => ErrorClass::Transient,
            "DATA" => ErrorClass::DataIntegrity,
            _ => ErrorClass::Fatal,
        }
    }
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// Classified SQL failure reported by a platform
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SqlErrorKind {
    UniqueViolation,
    ForeignKeyViolation,
    Timeout,
    Connection,
    Other,
}

/// WolfSync error types
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(#[from] toml::de::Error),

    // Capture log errors
    #[error("Capture log error: {0}")]
    CaptureLog(String),

    #[error("Capture log corrupted at offset {offset}: {reason}")]
    CaptureLogCorrupted { offset: u64, reason: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    // Database errors
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("SQL error ({kind:?}): {message}")]
    Sql { kind: SqlErrorKind, message: String },

    // Data errors
    #[error("Malformed row data{}: {reason}", .event.as_ref().map(|e| format!(" in {}", e.describe())).unwrap_or_default())]
    Malformed {
        reason: String,
        event: Option<Box<RowEvent>>,
    },

    #[error("Unresolved conflict for {}: {reason}", .event.describe())]
    Conflict { reason: String, event: Box<RowEvent> },

    #[error("Target table missing: {table}")]
    TableMissing {
        table: String,
        event: Option<Box<RowEvent>>,
    },

    #[error("Extension '{name}' failed: {reason}")]
    Extension {
        name: String,
        reason: String,
        fatal: bool,
    },

    // Routing errors
    #[error("Routing error: {0}")]
    Routing(String),

    #[error("Invalid router expression '{expression}': {reason}")]
    RouterExpression { expression: String, reason: String },

    // Staging errors
    #[error("Staging error: {0}")]
    Staging(String),

    #[error("Staged resource not ready: {0}")]
    StageNotReady(String),

    #[error("Staged resource already being written: {0}")]
    StageBusy(String),

    #[error("Staged resource not found: {0}")]
    StageNotFound(String),

    // Batch lifecycle errors
    #[error("Batch {batch} cannot move from {from} to {to}")]
    InvalidTransition { batch: String, from: String, to: String },

    #[error("Batch not found: {0}")]
    BatchNotFound(String),

    #[error("Batch {received} arrived out of order, expected {expected}")]
    OutOfOrder { expected: u64, received: u64 },

    // Transport errors
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Connection timeout to {0}")]
    ConnectionTimeout(String),

    // State errors
    #[error("State error: {0}")]
    State(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Shutdown in progress")]
    ShuttingDown,
}

impl Error {
    /// Build a malformation error that carries the offending event
    pub fn malformed(reason: impl Into<String>, event: &RowEvent) -> Self {
        Error::Malformed {
            reason: reason.into(),
            event: Some(Box::new(event.clone())),
        }
    }

    /// Classify this error for the batch failure policy
    pub fn class(&self) -> ErrorClass {
        match self {
            Error::Transport(_)
            | Error::ConnectionTimeout(_)
            | Error::OutOfOrder { .. }
            | Error::StageNotReady(_)
            | Error::StageBusy(_)
            | Error::Cancelled => ErrorClass::Transient,
            Error::Database(e) => match e {
                sqlx::Error::Io(_)
                | sqlx::Error::PoolTimedOut
                | sqlx::Error::PoolClosed
                | sqlx::Error::WorkerCrashed
                | sqlx::Error::Tls(_) => ErrorClass::Transient,
                _ => ErrorClass::Fatal,
            },
            Error::Sql { kind, .. } => match kind {
                SqlErrorKind::Timeout | SqlErrorKind::Connection => ErrorClass::Transient,
                SqlErrorKind::UniqueViolation | SqlErrorKind::ForeignKeyViolation => {
                    ErrorClass::DataIntegrity
                }
                SqlErrorKind::Other => ErrorClass::Fatal,
            },
            Error::Malformed { .. }
            | Error::Conflict { .. }
            | Error::TableMissing { .. }
            | Error::CaptureLogCorrupted { .. } => ErrorClass::DataIntegrity,
            _ => ErrorClass::Fatal,
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        self.class() == ErrorClass::Transient
    }

    /// Check if an extension failure must abort the surrounding unit of work
    pub fn is_fatal_extension(&self) -> bool {
        matches!(self, Error::Extension { fatal: true, .. })
    }

    /// The row event this error is about, if known
    pub fn event(&self) -> Option<&RowEvent> {
        match self {
            Error::Malformed { event, .. } | Error::TableMissing { event, .. } => event.as_deref(),
            Error::Conflict { event, .. } => Some(event),
            _ => None,
        }
    }

    /// Check if the platform reported a uniqueness violation
    pub fn is_unique_violation(&self) -> bool {
        matches!(
            self,
            Error::Sql {
                kind: SqlErrorKind::UniqueViolation,
                ..
            }
        )
    }
}

impl From<rusqlite::Error> for Error {
    fn from(e: rusqlite::Error) -> Self {
        let kind = match &e {
            rusqlite::Error::SqliteFailure(err, _) => match err.code {
                rusqlite::ErrorCode::ConstraintViolation => match err.extended_code {
                    // SQLITE_CONSTRAINT_FOREIGNKEY
                    787 => SqlErrorKind::ForeignKeyViolation,
                    // SQLITE_CONSTRAINT_PRIMARYKEY, SQLITE_CONSTRAINT_UNIQUE
                    1555 | 2067 => SqlErrorKind::UniqueViolation,
                    _ => SqlErrorKind::Other,
                },
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked => {
                    SqlErrorKind::Timeout
                }
                rusqlite::ErrorCode::CannotOpen => SqlErrorKind::Connection,
                _ => SqlErrorKind::Other,
            },
            _ => SqlErrorKind::Other,
        };
        Error::Sql {
            kind,
            message: format!("SQLite error: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{RowEvent, TableIdentity};

    #[test]
    fn test_classification() {
        assert!(Error::Transport("reset".into()).is_retryable());
        assert!(Error::Cancelled.is_retryable());
        assert!(!Error::Config("bad".into()).is_retryable());

        let event = RowEvent::delete(TableIdentity::new("t"), vec!["id".into()], vec![Some("1".into())]);
        let err = Error::malformed("column count mismatch", &event);
        assert_eq!(err.class(), ErrorClass::DataIntegrity);
        assert_eq!(err.event().unwrap().table.name, "t");
    }

    #[test]
    fn test_sqlite_unique_violation_is_classified() {
        let conn = rusqlite::Connection::open_in_memory().unwrap();
        conn.execute_batch("CREATE TABLE t (id INTEGER PRIMARY KEY); INSERT INTO t VALUES (1);")
            .unwrap();
        let err: Error = conn.execute("INSERT INTO t VALUES (1)", []).unwrap_err().into();
        assert!(err.is_unique_violation());
        assert_eq!(err.class(), ErrorClass::DataIntegrity);
    }

    #[test]
    fn test_class_codes_round_trip() {
        for class in [ErrorClass::Transient, ErrorClass::DataIntegrity, ErrorClass::Fatal] {
            assert_eq!(ErrorClass::from_code(class.code()), class);
        }
    }
}
