//! An etcd-shaped key-value log kept in a single SQL table.
//!
//! Every write appends a row whose id is the new cluster revision. Reads at a revision, watches
//! from a revision and compaction all work off that log. [`connect`] turns a connection string
//! into a running [`LogStore`]:
//!
//! ```rust,ignore
//! let ctx = CancellationToken::new();
//! let store = kine::connect(&ctx, "sqlite://db/state.db?compact-interval=10m").await?;
//! let revision = store.create(&ctx, "/registry/pods/a", b"spec".to_vec(), 0).await?;
//! ```

pub mod endpoint;
pub mod status;

pub use endpoint::{connect, Endpoint, Target};
pub use status::{to_etcd_error, EtcdError, GrpcCode};

pub use kine_core::{
    AdmissionPolicy, Backend, Compaction, ConfigError, Event, KeyValue, LogStore, StoreConfig, StoreError, UpdateResult, WatchClosed,
    Watcher,
};
pub use kine_storage_sqlite::{Flavor, SqliteDriver};
