//! Connection-string parsing and store construction.
//!
//! Recognised forms:
//!
//! - `""` embedded SQLite at `./db/state.db`
//! - `sqlite://relative/path.db`, `sqlite:///absolute/path.db`
//! - `sqlite::memory:`
//! - `dqlite://path/to/node.db`
//!
//! Query parameters configure the driver (`pool-size`, `busy-timeout`, `statement-cache-size`)
//! and the store (see [`StoreConfig`]). Unknown parameters are logged and ignored.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use kine_core::{ConfigError, Driver, LogStore, StoreConfig};
use kine_storage_sqlite::{DriverOptions, Flavor, SqliteDriver};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Where an empty connection string puts the database.
pub const DEFAULT_PATH: &str = "db/state.db";

const MEMORY: &str = ":memory:";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    Sqlite(PathBuf),
    SqliteMemory,
    Dqlite(PathBuf),
}

/// A parsed connection string.
#[derive(Debug, Clone)]
pub struct Endpoint {
    pub target: Target,
    pub driver: DriverOptions,
    pub config: StoreConfig,
}

impl Endpoint {
    pub fn parse(endpoint: &str) -> Result<Self, ConfigError> {
        let endpoint = endpoint.trim();
        if endpoint.is_empty() {
            return Ok(Self { target: Target::Sqlite(PathBuf::from(DEFAULT_PATH)), driver: DriverOptions::default(), config: StoreConfig::default() });
        }

        let Some((scheme, rest)) = endpoint.split_once(':') else {
            return Err(ConfigError::Endpoint(endpoint.to_owned(), "missing scheme".to_owned()));
        };
        let (location, query) = rest.split_once('?').unwrap_or((rest, ""));
        let location = location.strip_prefix("//").unwrap_or(location);

        let target = match scheme {
            "sqlite" if location == MEMORY => Target::SqliteMemory,
            "sqlite" => Target::Sqlite(file_path(location)),
            "dqlite" if location == MEMORY => {
                return Err(ConfigError::Endpoint(endpoint.to_owned(), "dqlite needs a database path".to_owned()))
            }
            "dqlite" => Target::Dqlite(file_path(location)),
            other => return Err(ConfigError::UnsupportedDriver(other.to_owned())),
        };

        let params: Vec<(String, String)> = url::form_urlencoded::parse(query.as_bytes()).into_owned().collect();
        let (driver, rest) = DriverOptions::from_params(params)?;
        let (config, rest) = StoreConfig::from_params(rest)?;
        for (key, value) in rest {
            warn!("ignoring unknown connection parameter {key}={value}");
        }

        Ok(Self { target, driver, config })
    }

    /// Opens the database and builds a store that has not been started yet.
    pub async fn open(self) -> anyhow::Result<LogStore> {
        let driver = match self.target {
            Target::SqliteMemory => {
                if self.driver.pool_size.is_some_and(|size| size != 1) {
                    debug!("ignoring pool-size for an in-memory database");
                }
                SqliteDriver::open_in_memory(self.driver).await?
            }
            Target::Sqlite(path) => {
                create_parent(&path).await?;
                SqliteDriver::open(&path, Flavor::Sqlite, self.driver).await?
            }
            Target::Dqlite(path) => {
                create_parent(&path).await?;
                SqliteDriver::open(&path, Flavor::Dqlite, self.driver).await?
            }
        };
        let driver: Arc<dyn Driver> = Arc::new(driver);
        Ok(LogStore::new(driver, self.config))
    }
}

/// Parses `endpoint`, opens the database, migrates it and starts the background tasks.
pub async fn connect(ctx: &CancellationToken, endpoint: &str) -> anyhow::Result<Arc<LogStore>> {
    let parsed = Endpoint::parse(endpoint)?;
    let target = parsed.target.clone();
    let store = parsed.open().await.with_context(|| format!("opening {target:?}"))?;
    store.start(ctx).await.with_context(|| format!("starting store on {target:?}"))?;
    info!("kine store ready on {target:?}");
    Ok(Arc::new(store))
}

fn file_path(location: &str) -> PathBuf {
    if location.is_empty() {
        PathBuf::from(DEFAULT_PATH)
    } else {
        PathBuf::from(location)
    }
}

async fn create_parent(path: &Path) -> anyhow::Result<()> {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => {
            tokio::fs::create_dir_all(parent).await.with_context(|| format!("creating {}", parent.display()))
        }
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use kine_core::AdmissionPolicy;

    use super::*;

    #[test]
    fn empty_string_uses_the_default_file() {
        let endpoint = Endpoint::parse("").unwrap();
        assert_eq!(endpoint.target, Target::Sqlite(PathBuf::from("db/state.db")));
        assert_eq!(endpoint.config, StoreConfig::default());
    }

    #[test]
    fn schemes_select_the_flavor() {
        assert_eq!(Endpoint::parse("sqlite::memory:").unwrap().target, Target::SqliteMemory);
        assert_eq!(Endpoint::parse("sqlite://:memory:").unwrap().target, Target::SqliteMemory);
        assert_eq!(Endpoint::parse("sqlite://data/kine.db").unwrap().target, Target::Sqlite(PathBuf::from("data/kine.db")));
        assert_eq!(Endpoint::parse("sqlite:///var/lib/kine.db").unwrap().target, Target::Sqlite(PathBuf::from("/var/lib/kine.db")));
        assert_eq!(Endpoint::parse("dqlite://node/db.bin").unwrap().target, Target::Dqlite(PathBuf::from("node/db.bin")));
    }

    #[test]
    fn bad_endpoints_are_rejected() {
        assert_eq!(Endpoint::parse("postgres://localhost/kine").unwrap_err(), ConfigError::UnsupportedDriver("postgres".into()));
        assert!(matches!(Endpoint::parse("just-a-path").unwrap_err(), ConfigError::Endpoint(..)));
        assert!(matches!(Endpoint::parse("dqlite::memory:").unwrap_err(), ConfigError::Endpoint(..)));
        assert!(matches!(Endpoint::parse("sqlite::memory:?poll-interval=soon").unwrap_err(), ConfigError::InvalidValue { .. }));
    }

    #[test]
    fn query_parameters_reach_driver_and_store() {
        let endpoint = Endpoint::parse(
            "sqlite://state.db?pool-size=3&busy-timeout=2s&compact-interval=0&watch-queue-size=8\
             &admission-control-policy=limit-concurrent-transactions\
             &admission-control-policy-limit-max-concurrent-txn=5&unknown=1",
        )
        .unwrap();
        assert_eq!(endpoint.driver.pool_size, Some(3));
        assert_eq!(endpoint.driver.connection.busy_timeout, Duration::from_secs(2));
        assert_eq!(endpoint.config.compact_interval, Duration::ZERO);
        assert_eq!(endpoint.config.watch_queue_size, 8);
        assert_eq!(endpoint.config.admission, AdmissionPolicy::LimitConcurrentTransactions { max_concurrent: 5, only_writes: false });
    }

    #[test]
    fn parameters_are_percent_decoded() {
        let endpoint = Endpoint::parse("sqlite::memory:?poll-interval=250ms&compact-retention=%31%30").unwrap();
        assert_eq!(endpoint.config.poll_interval, Duration::from_millis(250));
        assert_eq!(endpoint.config.compact_retention, 10);
    }
}
