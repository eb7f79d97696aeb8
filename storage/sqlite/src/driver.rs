//! The SQLite and dqlite [`Driver`]: a bb8 pool of rusqlite connections behind one dialect.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use kine_core::config::parse_duration;
use kine_core::{ConfigError, Dialect, Driver, DriverError, Executed, RetryPolicy, Row, SqlValue};
use rusqlite::{params_from_iter, TransactionBehavior};
use tracing::info;

use crate::connection::{ConnectionOptions, SqliteConfig, SqliteConnectionManager};
use crate::error::SqliteError;
use crate::schema;
use crate::value::{from_sql, SqliteValue};

/// Default connection pool size for file databases
const DEFAULT_POOL_SIZE: u32 = 10;

const SIZE_SQL: &str = "SELECT page_count * page_size FROM pragma_page_count(), pragma_page_size()";

/// Which engine sits behind the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flavor {
    /// Embedded single-node SQLite; one writer at a time.
    Sqlite,
    /// Raft-replicated dqlite, reached through the node's SQL connection.
    Dqlite,
}

impl Flavor {
    pub fn dialect(self) -> Dialect {
        match self {
            Flavor::Sqlite => Dialect { name: "sqlite", lock_writes: true, retry: RetryPolicy::default(), size_sql: SIZE_SQL },
            Flavor::Dqlite => Dialect {
                name: "dqlite",
                lock_writes: false,
                retry: RetryPolicy { max_attempts: 100, base_delay: Duration::from_millis(10), max_delay: Duration::from_secs(1) },
                size_sql: SIZE_SQL,
            },
        }
    }

    /// Lower-case message fragments of errors that are safe to re-issue.
    pub fn transient_messages(self) -> &'static [&'static str] {
        match self {
            Flavor::Sqlite => &["database is locked", "database table is locked", "cannot start a transaction within a transaction"],
            Flavor::Dqlite => &[
                "database is locked",
                "database table is locked",
                "cannot start a transaction within a transaction",
                "checkpoint in progress",
                "leadership lost",
                "not leader",
                "bad connection",
                "disconnected",
            ],
        }
    }
}

/// Pool and connection settings taken from the connection string.
#[derive(Debug, Clone, Default)]
pub struct DriverOptions {
    /// Defaults to 10 for files and 1 for `:memory:`.
    pub pool_size: Option<u32>,
    pub connection: ConnectionOptions,
}

impl DriverOptions {
    /// Consumes the driver's own parameters and returns the rest.
    pub fn from_params(params: Vec<(String, String)>) -> Result<(Self, Vec<(String, String)>), ConfigError> {
        let mut options = DriverOptions::default();
        let mut rest = Vec::new();
        for (key, value) in params {
            match key.as_str() {
                "pool-size" => match value.parse::<u32>() {
                    Ok(size) if size > 0 => options.pool_size = Some(size),
                    _ => return Err(ConfigError::invalid(&key, &value, "expected a positive integer")),
                },
                "busy-timeout" => options.connection.busy_timeout = parse_duration(&key, &value)?,
                "statement-cache-size" => {
                    options.connection.statement_cache_capacity =
                        value.parse().map_err(|_| ConfigError::invalid(&key, &value, "expected an integer"))?
                }
                _ => rest.push((key, value)),
            }
        }
        Ok((options, rest))
    }
}

/// A [`Driver`] over a bb8 pool of rusqlite connections.
pub struct SqliteDriver {
    pool: bb8::Pool<SqliteConnectionManager>,
    flavor: Flavor,
    dialect: Dialect,
}

impl SqliteDriver {
    /// Create a driver with an existing pool
    pub fn new(pool: bb8::Pool<SqliteConnectionManager>, flavor: Flavor) -> Self { Self { pool, flavor, dialect: flavor.dialect() } }

    /// Open (or create) a file database
    pub async fn open(path: impl AsRef<Path>, flavor: Flavor, options: DriverOptions) -> Result<Self, SqliteError> {
        let path: PathBuf = path.as_ref().to_owned();
        let pool_size = options.pool_size.unwrap_or(DEFAULT_POOL_SIZE);
        info!("opening {} database {} with {pool_size} connections", flavor.dialect().name, path.display());
        let manager = SqliteConnectionManager::new(SqliteConfig::File(path), options.connection);
        let pool = bb8::Pool::builder().max_size(pool_size).build(manager).await?;
        Ok(Self::new(pool, flavor))
    }

    /// Open an in-memory database, which lives as long as its single connection
    pub async fn open_in_memory(options: DriverOptions) -> Result<Self, SqliteError> {
        let manager = SqliteConnectionManager::new(SqliteConfig::Memory, options.connection);
        let pool = bb8::Pool::builder().max_size(1).idle_timeout(None).max_lifetime(None).build(manager).await?;
        Ok(Self::new(pool, Flavor::Sqlite))
    }

    pub fn flavor(&self) -> Flavor { self.flavor }

    /// Get a reference to the connection pool (for testing/diagnostics)
    pub fn pool(&self) -> &bb8::Pool<SqliteConnectionManager> { &self.pool }

    async fn conn(&self) -> Result<bb8::PooledConnection<'_, SqliteConnectionManager>, DriverError> {
        self.pool.get().await.map_err(|e| SqliteError::from(e).classify(self.flavor))
    }
}

#[async_trait]
impl Driver for SqliteDriver {
    fn dialect(&self) -> &Dialect { &self.dialect }

    async fn migrate(&self) -> Result<(), DriverError> {
        let conn = self.conn().await?;
        conn.with_connection_mut(schema::migrate).await.map_err(|e| e.classify(self.flavor))
    }

    async fn query(&self, sql: &str, params: Vec<SqlValue>) -> Result<Vec<Row>, DriverError> {
        let conn = self.conn().await?;
        let sql = sql.to_owned();
        conn.with_connection(move |c| {
            let mut stmt = c.prepare_cached(&sql)?;
            let columns = stmt.column_count();
            let mut rows = stmt.query(params_from_iter(params.iter().map(SqliteValue)))?;
            let mut results = Vec::new();
            while let Some(row) = rows.next()? {
                results.push((0..columns).map(|i| from_sql(row.get_ref(i)?)).collect::<Result<Row, SqliteError>>()?);
            }
            Ok(results)
        })
        .await
        .map_err(|e| e.classify(self.flavor))
    }

    async fn execute(&self, sql: &str, params: Vec<SqlValue>) -> Result<Executed, DriverError> {
        let conn = self.conn().await?;
        let sql = sql.to_owned();
        conn.with_connection(move |c| {
            let rows_affected = c.prepare_cached(&sql)?.execute(params_from_iter(params.iter().map(SqliteValue)))? as u64;
            Ok(Executed { rows_affected, last_insert_id: c.last_insert_rowid() })
        })
        .await
        .map_err(|e| e.classify(self.flavor))
    }

    async fn transaction(&self, statements: Vec<(String, Vec<SqlValue>)>) -> Result<Vec<Executed>, DriverError> {
        let conn = self.conn().await?;
        conn.with_connection_mut(move |c| {
            let tx = c.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let mut results = Vec::with_capacity(statements.len());
            for (sql, params) in &statements {
                let rows_affected = tx.prepare_cached(sql)?.execute(params_from_iter(params.iter().map(SqliteValue)))? as u64;
                results.push(Executed { rows_affected, last_insert_id: tx.last_insert_rowid() });
            }
            tx.commit()?;
            Ok(results)
        })
        .await
        .map_err(|e| e.classify(self.flavor))
    }
}
