//! A revisioned, watchable key-value log over a single SQL table.
//!
//! [`LogStore`] implements the etcd-style [`Backend`] operations on top of any [`Driver`]: every
//! write appends a row whose id is the new global revision, reads are snapshot queries, and a
//! single poller fans committed rows out to watchers.

pub mod admission;
pub mod backend;
pub mod broadcaster;
pub mod compactor;
pub mod config;
pub mod driver;
pub mod error;
pub mod executor;
pub mod store;
pub mod types;

pub use admission::{AdmissionController, AdmissionPolicy, TxnKind};
pub use backend::Backend;
pub use broadcaster::{WatchClosed, Watcher};
pub use compactor::Compaction;
pub use config::StoreConfig;
pub use driver::{Dialect, Driver, Executed, RetryPolicy, Row, SqlValue};
pub use error::{BoxError, ConfigError, DriverError, StoreError};
pub use executor::Executor;
pub use store::LogStore;
pub use types::{Event, KeyRange, KeyValue, LogRow, UpdateResult, COMPACT_REV_KEY};

#[cfg(test)]
#[ctor::ctor]
fn init_tracing() {
    use std::str::FromStr;
    let level = std::env::var("LOG_LEVEL").ok().and_then(|level| tracing::Level::from_str(&level).ok()).unwrap_or(tracing::Level::INFO);
    tracing_subscriber::fmt().with_max_level(level).with_test_writer().init();
}
