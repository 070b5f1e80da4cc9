//! Error types for entityproxy
//!
//! This module defines the error hierarchy used throughout the proxy.
//! We use `thiserror` for library-style errors with clear error chains.
//! `ProxyError` is the request-level taxonomy the HTTP layer turns into
//! status codes; `DbError` and `ConfigError` are the layer-local errors.

use crate::db::types::Record;
use serde_json::Value;
use tokio_postgres::error::SqlState;

/// Request-level error for the proxy
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    /// No caller identity on the request
    #[error("Unauthorized")]
    Unauthorized,

    /// Identity present but the role does not allow the operation
    #[error("Forbidden: {0}")]
    Forbidden(String),

    /// Malformed or incomplete request
    #[error("{0}")]
    BadRequest(String),

    /// The addressed record does not exist
    #[error("NOT_FOUND")]
    NotFound,

    /// The caller's `updated_date` token is stale
    #[error("CONCURRENCY_ERROR")]
    Concurrency { current: Box<Record> },

    /// The caller's prior-value token no longer matches the stored value
    #[error("CONCURRENCY_ERROR")]
    ValueConflict {
        current_value: Value,
        current: Box<Record>,
    },

    /// A record with the same unique key fields already exists
    #[error("DUPLICATE_ERROR")]
    Duplicate { existing: Box<Record> },

    /// Store or managed backend failure
    #[error("{0}")]
    Database(#[from] DbError),
}

/// Database and backend operation errors
#[derive(Debug, thiserror::Error)]
pub enum DbError {
    /// Failed to establish connection
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Pool could not be built or could not hand out a connection
    #[error("Connection pool error: {0}")]
    Pool(String),

    /// Statement execution failed
    #[error("Query execution failed: {0}")]
    QueryFailed(String),

    /// The statement referenced a relation that does not exist
    #[error("Relation does not exist: {0}")]
    UndefinedTable(String),

    /// The request cannot be turned into a statement
    #[error("{0}")]
    InvalidInput(String),

    /// The managed backend answered with an error status
    #[error("Managed backend error ({status}): {message}")]
    Upstream { status: u16, message: String },

    /// The managed backend could not be reached
    #[error("Managed backend unavailable: {0}")]
    UpstreamUnavailable(String),
}

impl DbError {
    /// Whether this error carries the "relation does not exist" signature
    pub fn is_undefined_table(&self) -> bool {
        matches!(self, DbError::UndefinedTable(_))
    }
}

impl From<tokio_postgres::Error> for DbError {
    fn from(err: tokio_postgres::Error) -> Self {
        match err.as_db_error() {
            Some(db) if *db.code() == SqlState::UNDEFINED_TABLE => {
                DbError::UndefinedTable(db.message().to_string())
            }
            Some(db) => DbError::QueryFailed(db.message().to_string()),
            None => DbError::QueryFailed(err.to_string()),
        }
    }
}

impl From<deadpool_postgres::PoolError> for DbError {
    fn from(err: deadpool_postgres::PoolError) -> Self {
        match err {
            deadpool_postgres::PoolError::Backend(e) => DbError::ConnectionFailed(e.to_string()),
            other => DbError::Pool(other.to_string()),
        }
    }
}

impl From<reqwest::Error> for DbError {
    fn from(err: reqwest::Error) -> Self {
        match err.status() {
            Some(status) => DbError::Upstream {
                status: status.as_u16(),
                message: err.to_string(),
            },
            None => DbError::UpstreamUnavailable(err.to_string()),
        }
    }
}

/// Configuration loading/parsing errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Home directory not found
    #[error("Could not determine home directory")]
    NoHomeDir,

    /// Config file not found or unreadable
    #[error("Configuration file not found: {0}")]
    NotFound(String),

    /// Failed to parse TOML
    #[error("Failed to parse configuration: {0}")]
    ParseError(#[from] toml::de::Error),

    /// Invalid configuration value
    #[error("Invalid configuration: {0}")]
    Invalid(String),

    /// Per-request credential token could not be decoded
    #[error("Invalid credential token: {0}")]
    InvalidToken(String),
}

/// Specialized Result type for request handling
pub type Result<T> = std::result::Result<T, ProxyError>;

/// Specialized Result type for database operations
pub type DbResult<T> = std::result::Result<T, DbError>;

/// Specialized Result type for config operations
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;
