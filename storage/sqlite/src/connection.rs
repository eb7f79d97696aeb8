//! bb8 connection management for the kine database.
//!
//! A rusqlite `Connection` is blocking and not `Sync`, so each pooled connection sits behind a
//! tokio mutex and all work on it runs on the blocking thread pool.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use rusqlite::Connection;
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::SqliteError;

/// Where the database lives.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SqliteConfig {
    File(PathBuf),
    /// Private to one connection, so only usable with a pool of size 1.
    Memory,
}

/// Per-connection settings applied when the pool opens a connection.
#[derive(Clone, Debug)]
pub struct ConnectionOptions {
    /// How long SQLite itself waits on a locked database before reporting BUSY.
    pub busy_timeout: Duration,
    pub statement_cache_capacity: usize,
}

impl Default for ConnectionOptions {
    fn default() -> Self { Self { busy_timeout: Duration::from_secs(5), statement_cache_capacity: 64 } }
}

const PRAGMAS: &str = "PRAGMA journal_mode=WAL;
PRAGMA synchronous=NORMAL;
PRAGMA cache_size=-64000;
PRAGMA temp_store=MEMORY;";

/// Runs blocking rusqlite work off the async runtime.
async fn blocking<T, F>(f: F) -> Result<T, SqliteError>
where
    F: FnOnce() -> Result<T, SqliteError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f).await.map_err(|e| SqliteError::TaskJoin(e.to_string()))?
}

pub struct SqliteConnectionManager {
    config: SqliteConfig,
    options: ConnectionOptions,
}

impl SqliteConnectionManager {
    pub fn new(config: SqliteConfig, options: ConnectionOptions) -> Self { Self { config, options } }

    pub fn file(path: impl Into<PathBuf>) -> Self { Self::new(SqliteConfig::File(path.into()), ConnectionOptions::default()) }

    pub fn memory() -> Self { Self::new(SqliteConfig::Memory, ConnectionOptions::default()) }

    pub fn config(&self) -> &SqliteConfig { &self.config }

    fn open(config: &SqliteConfig, options: &ConnectionOptions) -> Result<Connection, SqliteError> {
        let conn = match config {
            SqliteConfig::File(path) => Connection::open(path)?,
            SqliteConfig::Memory => Connection::open_in_memory()?,
        };
        conn.busy_timeout(options.busy_timeout)?;
        conn.set_prepared_statement_cache_capacity(options.statement_cache_capacity);
        conn.execute_batch(PRAGMAS)?;
        debug!("opened sqlite connection to {config:?}");
        Ok(conn)
    }
}

/// One pooled connection. Clones share the same underlying connection.
#[derive(Clone)]
pub struct PooledConnection {
    inner: Arc<Mutex<Connection>>,
}

impl PooledConnection {
    pub fn new(conn: Connection) -> Self { Self { inner: Arc::new(Mutex::new(conn)) } }

    /// Runs a read or single statement against the connection.
    pub async fn with_connection<F, T>(&self, f: F) -> Result<T, SqliteError>
    where
        F: FnOnce(&Connection) -> Result<T, SqliteError> + Send + 'static,
        T: Send + 'static,
    {
        self.with_connection_mut(move |conn| f(conn)).await
    }

    /// Runs `f` with exclusive access, as transactions and migrations need.
    pub async fn with_connection_mut<F, T>(&self, f: F) -> Result<T, SqliteError>
    where
        F: FnOnce(&mut Connection) -> Result<T, SqliteError> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.inner.clone();
        blocking(move || f(&mut conn.blocking_lock())).await
    }
}

impl bb8::ManageConnection for SqliteConnectionManager {
    type Connection = PooledConnection;
    type Error = SqliteError;

    fn connect(&self) -> impl std::future::Future<Output = Result<Self::Connection, Self::Error>> + Send {
        let (config, options) = (self.config.clone(), self.options.clone());
        blocking(move || Self::open(&config, &options).map(PooledConnection::new))
    }

    #[allow(refining_impl_trait)]
    fn is_valid<'a, 'b>(&'a self, conn: &'b mut Self::Connection) -> impl std::future::Future<Output = Result<(), Self::Error>> + Send {
        let conn = conn.clone();
        async move { conn.with_connection(|c| c.execute_batch("SELECT 1").map_err(SqliteError::from)).await }
    }

    fn has_broken(&self, _conn: &mut Self::Connection) -> bool { false }
}
