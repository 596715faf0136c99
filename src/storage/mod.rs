//! Storage Layer - SQLite-backed persistence
//!
//! System of record is a single SQLite file with tables:
//! - markers(id, latitude, longitude, title, description, created_at, updated_at)
//! - images(id, marker_id -> markers.id ON DELETE CASCADE, uri, name, date_added, size, type)
//!
//! The schema version lives in `PRAGMA user_version` on the same file.

pub mod retry;
pub mod schema;
pub mod store;

use std::sync::Arc;
use std::time::Duration;

use rusqlite::types::Value;

pub use retry::RetryPolicy;
pub use schema::Migration;
pub use store::{Connector, FileConnector, MemoryConnector, Store};

/// Result type alias for storage operations
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Storage-layer failures. Every variant keeps the underlying SQLite error.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Opening or configuring the connection failed. Only surfaced as the
    /// cause of [`StoreError::InitFailed`].
    #[error("Connection failed: {source}")]
    ConnectionFailed {
        #[source]
        source: rusqlite::Error,
    },

    #[error("Database initialization failed: {cause}")]
    InitFailed {
        #[source]
        cause: Arc<StoreError>,
    },

    #[error("Migration v{version} failed: {source}")]
    MigrationFailed {
        version: u32,
        #[source]
        source: rusqlite::Error,
    },

    #[error("Query failed: {source}")]
    QueryFailed {
        #[source]
        source: rusqlite::Error,
    },

    #[error("Mutation failed: {source}")]
    MutationFailed {
        #[source]
        source: rusqlite::Error,
    },

    #[error("Transaction failed after {attempts} attempt(s): {source}")]
    TransactionFailed {
        attempts: u32,
        #[source]
        source: rusqlite::Error,
    },
}

/// Runtime limits for the store. All values are plain fields so tests can
/// shrink delays to nothing.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// SQLite busy timeout applied to the connection
    pub connection_timeout: Duration,
    /// Longest one transaction attempt waits for the connection. A timed out
    /// wait fails that attempt only; the retry count is unaffected.
    pub transaction_timeout: Duration,
    pub max_retry_attempts: u32,
    pub retry_base_delay: Duration,
    /// Emit every statement at debug level
    pub log_statements: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            connection_timeout: Duration::from_millis(5000),
            transaction_timeout: Duration::from_millis(10_000),
            max_retry_attempts: 3,
            retry_base_delay: Duration::from_millis(1000),
            log_statements: false,
        }
    }
}

impl StoreConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::linear(self.max_retry_attempts, self.retry_base_delay)
    }
}

/// One SQL statement with positional arguments
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    pub sql: String,
    pub args: Vec<Value>,
}

impl Statement {
    pub fn new(sql: impl Into<String>, args: Vec<Value>) -> Self {
        Self {
            sql: sql.into(),
            args,
        }
    }
}

/// Outcome of a single-statement write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MutationResult {
    pub changes: usize,
    /// Rowid of the inserted row, if the statement inserted one
    pub inserted_id: Option<i64>,
}
