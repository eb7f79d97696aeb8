//! Error types for the key-value log.
//!
//! Drivers classify every engine failure exactly once into a [`DriverError`]; everything above
//! the driver works with that closed classification instead of inspecting engine messages.

use thiserror::Error;

pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// An engine failure, classified by the dialect that produced it.
#[derive(Debug, Error)]
pub enum DriverError {
    /// Busy/locked engine, nested transaction, checkpoint, stale connection. Safe to re-issue.
    #[error("transient engine error: {0}")]
    Transient(#[source] BoxError),

    /// Unique-constraint violation on `(prev_revision, name)`.
    #[error("constraint violation: {0}")]
    Conflict(#[source] BoxError),

    /// Anything else.
    #[error("engine error: {0}")]
    Fatal(#[source] BoxError),
}

impl DriverError {
    pub fn transient(err: impl Into<BoxError>) -> Self { DriverError::Transient(err.into()) }

    pub fn conflict(err: impl Into<BoxError>) -> Self { DriverError::Conflict(err.into()) }

    pub fn fatal(err: impl Into<BoxError>) -> Self { DriverError::Fatal(err.into()) }

    pub fn is_transient(&self) -> bool { matches!(self, DriverError::Transient(_)) }

    pub fn is_conflict(&self) -> bool { matches!(self, DriverError::Conflict(_)) }
}

/// Errors surfaced across the backend boundary.
///
/// Only [`StoreError::KeyExists`], [`StoreError::Compacted`] and [`StoreError::FutureRevision`]
/// are expected to be translated into protocol status codes; the rest are infrastructure failures.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("key exists")]
    KeyExists,

    #[error("required revision {requested} has been compacted (compacted to {compacted})")]
    Compacted { requested: i64, compacted: i64 },

    #[error("required revision {requested} is a future revision (current {current})")]
    FutureRevision { requested: i64, current: i64 },

    #[error("operation cancelled")]
    Cancelled,

    #[error("store is closed")]
    Closed,

    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("schema error: {0}")]
    Schema(String),

    #[error(transparent)]
    Driver(#[from] DriverError),
}

impl StoreError {
    /// Conflicts and compaction errors are part of normal operation and are not logged as failures.
    pub fn is_expected(&self) -> bool {
        matches!(self, StoreError::KeyExists | StoreError::Compacted { .. } | StoreError::FutureRevision { .. } | StoreError::Cancelled)
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid connection string {0:?}: {1}")]
    Endpoint(String, String),

    #[error("unsupported driver {0:?}")]
    UnsupportedDriver(String),

    #[error("invalid value {value:?} for {key}: {reason}")]
    InvalidValue { key: String, value: String, reason: String },
}

impl ConfigError {
    pub fn invalid(key: &str, value: &str, reason: impl Into<String>) -> Self {
        ConfigError::InvalidValue { key: key.to_owned(), value: value.to_owned(), reason: reason.into() }
    }
}
