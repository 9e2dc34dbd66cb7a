//! Error types for truthgraph-core

use std::fmt;
use thiserror::Error;

use crate::config::ConfigError;

/// Error kinds, used for logging and for mapping onto caller-facing codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Branch, node or schema element absent
    NotFound,
    /// Cardinality / kind / field violations
    Validation,
    /// Ambiguous lookups, concurrent collisions, immutable divergence points
    Conflict,
    /// Transient connectivity to the graph store
    StoreUnavailable,
    /// Malformed query text or parameter mismatch (programmer error)
    Query,
    /// Migration execution or validation failure
    Migration,
    /// Explicitly unimplemented functionality
    NotSupported,
    /// Serialization/deserialization errors
    Serialization,
    /// Configuration errors
    Config,
    /// Internal errors (bugs, corrupted rows)
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::NotFound => "not_found",
            ErrorKind::Validation => "validation",
            ErrorKind::Conflict => "conflict",
            ErrorKind::StoreUnavailable => "store_unavailable",
            ErrorKind::Query => "query",
            ErrorKind::Migration => "migration",
            ErrorKind::NotSupported => "not_supported",
            ErrorKind::Serialization => "serialization",
            ErrorKind::Config => "config",
            ErrorKind::Internal => "internal",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Error category for retry logic
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Retry automatically (connection lost, database busy)
    Transient,
    /// Never retry (invalid input, malformed query, missing data)
    Permanent,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::Transient => "transient",
            ErrorCategory::Permanent => "permanent",
        }
    }
}

/// Unified error type for the graph core
#[derive(Debug, Error)]
pub enum GraphError {
    #[error("Unable to find the branch '{0}' in the database")]
    BranchNotFound(String),

    #[error("Unable to find the node {identifier} of kind {kind} on branch {branch}")]
    NodeNotFound {
        branch: String,
        kind: String,
        identifier: String,
    },

    #[error("Unable to find the schema '{0}'")]
    SchemaNotFound(String),

    #[error("Validation error on '{field}': {message}")]
    Validation { field: String, message: String },

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Graph store unavailable: {message}")]
    StoreUnavailable {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("Query error: {message}")]
    Query {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("Query '{0}' has already been executed")]
    AlreadyExecuted(String),

    #[error("Migration {name} failed: {}", .errors.join("; "))]
    Migration {
        name: String,
        errors: Vec<String>,
        /// Migrations applied before the failure, in order
        applied: Vec<String>,
    },

    #[error("Not supported: {0}")]
    NotSupported(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl GraphError {
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    pub fn node_not_found(
        branch: impl Into<String>,
        kind: impl Into<String>,
        identifier: impl Into<String>,
    ) -> Self {
        Self::NodeNotFound {
            branch: branch.into(),
            kind: kind.into(),
            identifier: identifier.into(),
        }
    }

    pub fn store_unavailable(message: impl Into<String>) -> Self {
        Self::StoreUnavailable {
            message: message.into(),
            source: None,
        }
    }

    pub fn query(message: impl Into<String>) -> Self {
        Self::Query {
            message: message.into(),
            source: None,
        }
    }

    pub fn internal<E: fmt::Display>(e: E) -> Self {
        Self::Internal(e.to_string())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            GraphError::BranchNotFound(_)
            | GraphError::NodeNotFound { .. }
            | GraphError::SchemaNotFound(_) => ErrorKind::NotFound,
            GraphError::Validation { .. } => ErrorKind::Validation,
            GraphError::Conflict(_) => ErrorKind::Conflict,
            GraphError::StoreUnavailable { .. } => ErrorKind::StoreUnavailable,
            GraphError::Query { .. } | GraphError::AlreadyExecuted(_) => ErrorKind::Query,
            GraphError::Migration { .. } => ErrorKind::Migration,
            GraphError::NotSupported(_) => ErrorKind::NotSupported,
            GraphError::Serialization(_) => ErrorKind::Serialization,
            GraphError::Config(_) => ErrorKind::Config,
            GraphError::Internal(_) => ErrorKind::Internal,
        }
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            GraphError::StoreUnavailable { .. } => ErrorCategory::Transient,
            _ => ErrorCategory::Permanent,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.category() == ErrorCategory::Transient
    }
}

// SQLite error conversions
#[cfg(feature = "sqlite")]
impl From<rusqlite::Error> for GraphError {
    fn from(err: rusqlite::Error) -> Self {
        use rusqlite::ErrorCode;

        let transient = matches!(
            &err,
            rusqlite::Error::SqliteFailure(e, _)
                if matches!(
                    e.code,
                    ErrorCode::DatabaseBusy
                        | ErrorCode::DatabaseLocked
                        | ErrorCode::SystemIoFailure
                        | ErrorCode::CannotOpen
                )
        );
        let message = format!("SQLite error: {}", err);
        if transient {
            GraphError::StoreUnavailable {
                message,
                source: Some(Box::new(err)),
            }
        } else {
            GraphError::Query {
                message,
                source: Some(Box::new(err)),
            }
        }
    }
}

// PostgreSQL error conversions
#[cfg(feature = "postgres")]
impl From<sqlx::Error> for GraphError {
    fn from(err: sqlx::Error) -> Self {
        let transient = matches!(
            &err,
            sqlx::Error::Io(_)
                | sqlx::Error::PoolTimedOut
                | sqlx::Error::PoolClosed
                | sqlx::Error::WorkerCrashed
        );
        let message = format!("PostgreSQL error: {}", err);
        if transient {
            GraphError::StoreUnavailable {
                message,
                source: Some(Box::new(err)),
            }
        } else {
            GraphError::Query {
                message,
                source: Some(Box::new(err)),
            }
        }
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, GraphError>;
