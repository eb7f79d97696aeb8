//! SQLite and dqlite drivers for the kine key-value log.
//!
//! Both flavours talk to the engine through a bb8 pool of rusqlite connections, every call
//! running on `spawn_blocking`. They differ in the constants they hand the executor:
//!
//! - [`Flavor::Sqlite`]: embedded single-node database. Writes are serialised in-process so the
//!   single SQLite writer is not hammered with busy errors.
//! - [`Flavor::Dqlite`]: Raft-replicated database consumed through the node's SQL connection.
//!   Writes are not serialised locally, the retry budget is larger, and leadership changes and
//!   checkpoints count as transient.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use kine_core::{LogStore, StoreConfig};
//! use kine_storage_sqlite::{DriverOptions, Flavor, SqliteDriver};
//!
//! let driver = SqliteDriver::open("db/state.db", Flavor::Sqlite, DriverOptions::default()).await?;
//! let store = LogStore::new(Arc::new(driver), StoreConfig::default());
//! store.start(&ctx).await?;
//! ```

mod connection;
mod driver;
mod error;
pub mod schema;
mod value;

pub use connection::{ConnectionOptions, PooledConnection, SqliteConfig, SqliteConnectionManager};
pub use driver::{DriverOptions, Flavor, SqliteDriver};
pub use error::SqliteError;
pub use value::SqliteValue;
