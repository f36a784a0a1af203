//! Error types for the operation lifecycle.
//!
//! Everything below the HTTP and CLI edges returns [`OperationError`]. The
//! binary wraps it with `anyhow` context; the web layer maps each variant to a
//! status code.

use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// The two record kinds stored per operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordKind {
    Job,
    Output,
}

impl RecordKind {
    /// Name of the directory holding records of this kind inside a scope.
    pub fn dir_name(&self) -> &'static str {
        match self {
            Self::Job => "jobs",
            Self::Output => "output",
        }
    }
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Job => f.write_str("Job"),
            Self::Output => f.write_str("Output"),
        }
    }
}

#[derive(Error, Debug)]
pub enum OperationError {
    /// The referenced server has no configuration.
    #[error("No barman config found for '{0}'.")]
    ScopeConfig(String),

    /// The operation type cannot run against the requested scope.
    #[error("Operation type '{op_type}' is not supported for {scope}")]
    UnsupportedScope { op_type: String, scope: String },

    /// Record content failed validation.
    #[error("{0}")]
    MalformedContent(String),

    #[error("Invalid operation ID '{0}'")]
    InvalidId(String),

    #[error("{kind} file for operation '{id}' already exists")]
    AlreadyExists { kind: RecordKind, id: String },

    #[error("{kind} file for operation '{id}' does not exist")]
    NotFound { kind: RecordKind, id: String },

    /// Neither a job nor an output record exists for the ID.
    #[error("Operation '{0}' does not exist")]
    OperationNotExists(String),

    /// A requested backup could not be found in the server's catalog.
    #[error("Backup '{0}' does not exist")]
    BackupNotFound(String),

    /// `barman diagnose` failed or printed something that is not JSON.
    #[error("Diagnose failed: {0}")]
    Diagnose(String),

    #[error("'{}' exists but it is not a directory", .0.display())]
    NotADirectory(PathBuf),

    #[error("I/O error on '{}': {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse '{}': {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    /// A blocking filesystem task panicked or was cancelled.
    #[error("Background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl OperationError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

pub type Result<T, E = OperationError> = std::result::Result<T, E>;
