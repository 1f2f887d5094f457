//! Error types for ReactorDB.
//!
//! All errors are strongly typed using thiserror and grouped by who has to
//! act on them: usage errors (the caller asked for something invalid),
//! schema errors (the file was written by an incompatible version) and
//! integrity errors (the data itself is malformed).

use std::path::PathBuf;

use thiserror::Error;

use crate::version::SchemaVersion;

/// Errors caused by invalid calls or invalid open-mode/path combinations.
#[derive(Debug, Error)]
pub enum UsageError {
    #[error("Database {path} is already open")]
    AlreadyOpen { path: PathBuf },

    #[error("Database {path} is not open")]
    NotOpen { path: PathBuf },

    #[error("Database {path} was opened read-only")]
    ReadOnly { path: PathBuf },

    #[error("Database file not found: {path}")]
    FileNotFound { path: PathBuf },

    #[error("Database file already exists: {path}")]
    FileExists { path: PathBuf },

    #[error("Refusing to open {path} for writing: it is the configured restart source")]
    RestartSourceOverwrite { path: PathBuf },

    #[error("Database {path} is locked by another writer")]
    Locked { path: PathBuf },

    #[error("Time step {group} is not stored in the database")]
    TimeStepNotFound { group: String },

    #[error("Invalid argument: {message}")]
    InvalidArgument { message: String },
}

/// Errors caused by the schema version of a file.
#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("Database version {found} is unsupported; migrate the file to version 3 first")]
    Unsupported { found: String },

    #[error("{operation} requires database version {required} or newer, file is {found}")]
    VersionTooOld {
        operation: String,
        required: SchemaVersion,
        found: SchemaVersion,
    },

    #[error("Cannot determine database version: {reason}")]
    Unreadable { reason: String },
}

/// Errors caused by malformed stored or packed data.
#[derive(Debug, Error)]
pub enum IntegrityError {
    #[error("Corrupted data at '{path}': {reason}")]
    Corrupted { path: String, reason: String },

    #[error("Parameter '{param}' has elements of differing dimensionality ({first} vs {other}); shapes cannot form a rectangular table")]
    JaggedShape {
        param: String,
        first: usize,
        other: usize,
    },

    #[error("Parameter '{param}' mixes incompatible value kinds: {reason}")]
    IncompatibleValues { param: String, reason: String },

    #[error("Parameter '{param}' stored for type '{type_name}' is not defined in the registry")]
    UnknownParameter { type_name: String, param: String },
}

impl IntegrityError {
    pub(crate) fn corrupted(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Corrupted {
            path: path.into(),
            reason: reason.into(),
        }
    }
}

/// Top-level error type for ReactorDB.
#[derive(Debug, Error)]
pub enum DatabaseError {
    #[error("Usage error: {0}")]
    Usage(#[from] UsageError),

    #[error("Schema error: {0}")]
    Schema(#[from] SchemaError),

    #[error("Integrity error: {0}")]
    Integrity(#[from] IntegrityError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl DatabaseError {
    /// Creates an internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Creates an invalid-argument usage error.
    #[must_use]
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::Usage(UsageError::InvalidArgument {
            message: message.into(),
        })
    }

    /// Classifies a failed read of the container node at `path`.
    ///
    /// Checksum failures, truncation and missing nodes mean the file does
    /// not hold what its structure promises, so they become
    /// [`IntegrityError::Corrupted`]; anything else stays an I/O error.
    #[must_use]
    pub fn from_read(path: &str, err: std::io::Error) -> Self {
        use std::io::ErrorKind;
        match err.kind() {
            ErrorKind::InvalidData | ErrorKind::UnexpectedEof | ErrorKind::NotFound => {
                Self::Integrity(IntegrityError::corrupted(path, err.to_string()))
            }
            _ => Self::Io(err),
        }
    }

    /// Returns true if this is a usage error.
    #[must_use]
    pub const fn is_usage(&self) -> bool {
        matches!(self, Self::Usage(_))
    }

    /// Returns true if this is a schema/version error.
    #[must_use]
    pub const fn is_schema(&self) -> bool {
        matches!(self, Self::Schema(_))
    }

    /// Returns true if this is a data-integrity error.
    ///
    /// I/O errors of kind `InvalidData` come from failed frame checksums and
    /// count as integrity failures too.
    #[must_use]
    pub fn is_integrity(&self) -> bool {
        match self {
            Self::Integrity(_) => true,
            Self::Io(e) => e.kind() == std::io::ErrorKind::InvalidData,
            _ => false,
        }
    }

    /// Returns true if this error is an invalid-argument usage error.
    #[must_use]
    pub const fn is_invalid_argument(&self) -> bool {
        matches!(self, Self::Usage(UsageError::InvalidArgument { .. }))
    }
}

/// Result type alias for ReactorDB operations.
pub type DbResult<T> = Result<T, DatabaseError>;
