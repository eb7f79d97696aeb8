//! The seam between the dialect-agnostic executor and a concrete SQL engine.

use std::time::Duration;

use async_trait::async_trait;

use crate::error::DriverError;

/// A statement parameter or result column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SqlValue {
    Null,
    Integer(i64),
    Text(String),
    Blob(Vec<u8>),
}

impl SqlValue {
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            SqlValue::Integer(i) => Some(*i),
            SqlValue::Null => Some(0),
            _ => None,
        }
    }

    pub fn into_bytes(self) -> Option<Vec<u8>> {
        match self {
            SqlValue::Blob(b) => Some(b),
            SqlValue::Text(s) => Some(s.into_bytes()),
            SqlValue::Null => Some(Vec::new()),
            SqlValue::Integer(_) => None,
        }
    }

    pub fn into_string(self) -> Option<String> {
        match self {
            SqlValue::Text(s) => Some(s),
            SqlValue::Blob(b) => String::from_utf8(b).ok(),
            _ => None,
        }
    }
}

impl From<i64> for SqlValue {
    fn from(value: i64) -> Self { SqlValue::Integer(value) }
}

impl From<bool> for SqlValue {
    fn from(value: bool) -> Self { SqlValue::Integer(if value { 1 } else { 0 }) }
}

impl From<&str> for SqlValue {
    fn from(value: &str) -> Self { SqlValue::Text(value.to_owned()) }
}

impl From<String> for SqlValue {
    fn from(value: String) -> Self { SqlValue::Text(value) }
}

impl From<Vec<u8>> for SqlValue {
    fn from(value: Vec<u8>) -> Self { if value.is_empty() { SqlValue::Null } else { SqlValue::Blob(value) } }
}

impl<T: Into<SqlValue>> From<Option<T>> for SqlValue {
    fn from(value: Option<T>) -> Self {
        match value {
            Some(v) => v.into(),
            None => SqlValue::Null,
        }
    }
}

pub type Row = Vec<SqlValue>;

/// Result of a statement that does not return rows.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Executed {
    pub rows_affected: u64,
    pub last_insert_id: i64,
}

/// How the executor re-issues statements that failed transiently.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    /// Linear backoff, capped.
    pub fn delay(&self, attempt: u32) -> Duration { self.base_delay.saturating_mul(attempt).min(self.max_delay) }
}

impl Default for RetryPolicy {
    fn default() -> Self { Self { max_attempts: 20, base_delay: Duration::from_millis(5), max_delay: Duration::from_millis(250) } }
}

/// Constants a dialect supplies and the executor consumes unchanged.
#[derive(Debug, Clone)]
pub struct Dialect {
    pub name: &'static str,
    /// Serialise writes in-process (single-writer engines).
    pub lock_writes: bool,
    pub retry: RetryPolicy,
    /// Returns the database size in bytes as a single integer.
    pub size_sql: &'static str,
}

/// A SQL engine holding the `kine` table.
///
/// Implementations classify every failure into [`DriverError`]; they never retry on their own.
#[async_trait]
pub trait Driver: Send + Sync + 'static {
    fn dialect(&self) -> &Dialect;

    /// Creates or upgrades the schema. Failing here aborts startup.
    async fn migrate(&self) -> Result<(), DriverError>;

    async fn query(&self, sql: &str, params: Vec<SqlValue>) -> Result<Vec<Row>, DriverError>;

    async fn execute(&self, sql: &str, params: Vec<SqlValue>) -> Result<Executed, DriverError>;

    /// Runs all statements in one transaction; nothing is applied if any of them fails.
    async fn transaction(&self, statements: Vec<(String, Vec<SqlValue>)>) -> Result<Vec<Executed>, DriverError>;

    async fn close(&self) {}
}
