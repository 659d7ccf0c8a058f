//! Error types for quilldb
//!
//! One crate-wide error enum; every variant maps to a stable [`ErrorKind`]
//! that the boundary layers report to clients.

use serde::Serialize;
use thiserror::Error;

/// Stable error classification exposed at the API boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ErrorKind {
    SyntaxError,
    NotFound,
    AlreadyExists,
    Conflict,
    PermissionDenied,
    NotSupported,
    LockTimeout,
    TxnState,
    IoError,
    Corruption,
}

/// The main error type for quilldb
#[derive(Error, Debug)]
pub enum Error {
    // ========== Parser Errors ==========
    #[error("Syntax error near '{0}'")]
    Syntax(String),

    // ========== Missing Objects ==========
    #[error("Database '{0}' not found")]
    DatabaseNotFound(String),

    #[error("Table '{0}' not found")]
    TableNotFound(String),

    #[error("Column '{0}' not found in table '{1}'")]
    ColumnNotFound(String, String),

    #[error("Index '{0}' not found on table '{1}'")]
    IndexNotFound(String, String),

    #[error("View '{0}' not found")]
    ViewNotFound(String),

    #[error("Savepoint '{0}' not found")]
    SavepointNotFound(String),

    #[error("Foreign key '{0}' not found on table '{1}'")]
    ForeignKeyNotFound(String, String),

    // ========== Existing Objects ==========
    #[error("Database '{0}' already exists")]
    DatabaseAlreadyExists(String),

    #[error("Table '{0}' already exists")]
    TableAlreadyExists(String),

    #[error("Column '{0}' already exists in table '{1}'")]
    ColumnAlreadyExists(String, String),

    #[error("Index already exists on column '{0}' of table '{1}'")]
    IndexAlreadyExists(String, String),

    #[error("View '{0}' already exists")]
    ViewAlreadyExists(String),

    #[error("Foreign key '{0}' already exists")]
    ForeignKeyAlreadyExists(String),

    // ========== Constraint Violations ==========
    #[error("Duplicate entry '{value}' for key '{key}'")]
    DuplicateKey { key: String, value: String },

    #[error("Foreign key violation: {0}")]
    ForeignKeyViolation(String),

    #[error("Cannot SET NULL: column '{0}' is not nullable")]
    NotNullable(String),

    #[error("Operation restricted by foreign key from table '{0}'")]
    RestrictViolation(String),

    // ========== Access Control ==========
    #[error("Permission denied on '{0}'")]
    PermissionDenied(String),

    // ========== Unsupported Operations ==========
    #[error("Not supported: {0}")]
    NotSupported(String),

    // ========== Locking ==========
    #[error("Lock timeout on {0}")]
    LockTimeout(String),

    // ========== Transaction State ==========
    #[error("Transaction error: {0}")]
    TxnState(String),

    // ========== I/O ==========
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("WAL offset mismatch for table '{table}': logged {expected}, appended at {actual}")]
    WalOffsetMismatch {
        table: String,
        expected: u64,
        actual: u64,
    },

    #[error("Record image at offset {offset} changed length: {expected} -> {actual} bytes")]
    RecordLengthChanged {
        offset: u64,
        expected: usize,
        actual: usize,
    },

    #[error("Value count does not match column count for table '{0}'")]
    FieldCountMismatch(String),

    // ========== Corruption ==========
    #[error("Corrupt {file}: {detail}")]
    Corruption { file: String, detail: String },
}

impl Error {
    /// The stable kind reported across the API boundary.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Syntax(_) | Error::FieldCountMismatch(_) => ErrorKind::SyntaxError,
            Error::DatabaseNotFound(_)
            | Error::TableNotFound(_)
            | Error::ColumnNotFound(_, _)
            | Error::IndexNotFound(_, _)
            | Error::ViewNotFound(_)
            | Error::SavepointNotFound(_)
            | Error::ForeignKeyNotFound(_, _) => ErrorKind::NotFound,
            Error::DatabaseAlreadyExists(_)
            | Error::TableAlreadyExists(_)
            | Error::ColumnAlreadyExists(_, _)
            | Error::IndexAlreadyExists(_, _)
            | Error::ViewAlreadyExists(_)
            | Error::ForeignKeyAlreadyExists(_) => ErrorKind::AlreadyExists,
            Error::DuplicateKey { .. }
            | Error::ForeignKeyViolation(_)
            | Error::NotNullable(_)
            | Error::RestrictViolation(_) => ErrorKind::Conflict,
            Error::PermissionDenied(_) => ErrorKind::PermissionDenied,
            Error::NotSupported(_) => ErrorKind::NotSupported,
            Error::LockTimeout(_) => ErrorKind::LockTimeout,
            Error::TxnState(_) => ErrorKind::TxnState,
            Error::Io(_) | Error::WalOffsetMismatch { .. } | Error::RecordLengthChanged { .. } => {
                ErrorKind::IoError
            }
            Error::Corruption { .. } => ErrorKind::Corruption,
        }
    }
}

/// Result type alias for quilldb operations
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::TableNotFound("users".to_string());
        assert_eq!(err.to_string(), "Table 'users' not found");
        assert_eq!(err.kind(), ErrorKind::NotFound);

        let err = Error::DuplicateKey {
            key: "PRIMARY".to_string(),
            value: "1".to_string(),
        };
        assert_eq!(err.to_string(), "Duplicate entry '1' for key 'PRIMARY'");
        assert_eq!(err.kind(), ErrorKind::Conflict);
    }

    #[test]
    fn test_io_error_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err: Error = io.into();
        assert_eq!(err.kind(), ErrorKind::IoError);
    }
}
