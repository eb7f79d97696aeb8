use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::broadcaster::Watcher;
use crate::error::StoreError;
use crate::types::{KeyValue, UpdateResult};

/// The etcd-facing operations of the key-value log.
///
/// Every read returns the revision it was served at. `revision = 0` always means "current".
#[async_trait]
pub trait Backend: Send + Sync {
    async fn start(&self, ctx: &CancellationToken) -> Result<(), StoreError>;

    /// First live key in `[key, range_end)` (or exactly `key` when `range_end` is empty).
    async fn get(
        &self,
        ctx: &CancellationToken,
        key: &str,
        range_end: &str,
        limit: i64,
        revision: i64,
    ) -> Result<(i64, Option<KeyValue>), StoreError>;

    async fn create(&self, ctx: &CancellationToken, key: &str, value: Vec<u8>, lease: i64) -> Result<i64, StoreError>;

    async fn delete(&self, ctx: &CancellationToken, key: &str, revision: i64) -> Result<UpdateResult, StoreError>;

    async fn list(
        &self,
        ctx: &CancellationToken,
        prefix: &str,
        start_key: &str,
        limit: i64,
        revision: i64,
    ) -> Result<(i64, Vec<KeyValue>), StoreError>;

    async fn count(&self, ctx: &CancellationToken, prefix: &str) -> Result<(i64, i64), StoreError>;

    async fn update(
        &self,
        ctx: &CancellationToken,
        key: &str,
        value: Vec<u8>,
        revision: i64,
        lease: i64,
    ) -> Result<UpdateResult, StoreError>;

    async fn watch(&self, ctx: &CancellationToken, key: &str, revision: i64) -> Result<Watcher, StoreError>;

    async fn db_size(&self, ctx: &CancellationToken) -> Result<i64, StoreError>;

    async fn do_compact(&self, ctx: &CancellationToken) -> Result<(), StoreError>;

    async fn current_revision(&self, ctx: &CancellationToken) -> Result<i64, StoreError>;

    async fn compact_revision(&self, ctx: &CancellationToken) -> Result<i64, StoreError>;

    async fn close(&self);
}
