//! The log-structured key-value store.
//!
//! Every write appends one row chained from the row it replaces; the unique index on
//! `(prev_revision, name)` decides races between writers. Reads are snapshot queries for the
//! newest row per key at or below a revision.

use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::admission::{AdmissionController, TxnKind};
use crate::backend::Backend;
use crate::broadcaster::{Broadcaster, Watcher};
use crate::compactor::{Compaction, Compactor};
use crate::config::StoreConfig;
use crate::driver::Driver;
use crate::error::StoreError;
use crate::executor::Executor;
use crate::types::{KeyRange, KeyValue, LogRow, NewRow, UpdateResult};

/// Re-read and retry budget of an unconditional delete racing other writers.
const UNCONDITIONAL_DELETE_ATTEMPTS: usize = 16;

pub struct LogStore {
    executor: Arc<Executor>,
    admission: AdmissionController,
    broadcaster: Broadcaster,
    compactor: Arc<Compactor>,
    config: StoreConfig,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for LogStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogStore").finish_non_exhaustive()
    }
}

impl LogStore {
    pub fn new(driver: Arc<dyn Driver>, config: StoreConfig) -> Self {
        Self::with_executor(Executor::new(driver), config)
    }

    pub fn with_executor(executor: Executor, config: StoreConfig) -> Self {
        let executor = Arc::new(executor);
        let shutdown = CancellationToken::new();
        let broadcaster = Broadcaster::new(executor.clone(), &config, shutdown.clone());
        let compactor = Arc::new(Compactor::new(executor.clone(), broadcaster.clone(), &config));
        Self {
            admission: AdmissionController::new(config.admission),
            executor,
            broadcaster,
            compactor,
            config,
            shutdown,
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn config(&self) -> &StoreConfig { &self.config }

    pub fn executor(&self) -> &Arc<Executor> { &self.executor }

    pub fn broadcaster(&self) -> &Broadcaster { &self.broadcaster }

    pub fn admission(&self) -> &AdmissionController { &self.admission }

    fn check_open(&self) -> Result<(), StoreError> { if self.shutdown.is_cancelled() { Err(StoreError::Closed) } else { Ok(()) } }

    /// Runs the schema migration and spawns the poller and compactor.
    pub async fn start(&self, ctx: &CancellationToken) -> Result<(), StoreError> {
        self.check_open()?;
        let dialect = self.executor.dialect().name;
        tokio::select! {
            _ = ctx.cancelled() => return Err(StoreError::Cancelled),
            migrated = self.executor.driver().migrate() => migrated.map_err(|err| {
                warn!("{dialect}: schema migration failed: {err}");
                StoreError::Schema(err.to_string())
            })?,
        }

        let poller = self.broadcaster.start().await?;
        let compactor = tokio::spawn(self.compactor.clone().run(self.shutdown.clone()));
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner).extend([poller, compactor]);
        info!("{dialect}: store started at revision {}", self.broadcaster.last_seen());
        Ok(())
    }

    /// The revision a read is served at, after checking it against the horizon.
    async fn read_revision(&self, ctx: &CancellationToken, revision: i64) -> Result<i64, StoreError> {
        let current = self.executor.current_revision(ctx).await?;
        if revision <= 0 {
            return Ok(current);
        }
        if revision > current {
            return Err(StoreError::FutureRevision { requested: revision, current });
        }
        self.check_not_compacted(ctx, revision).await?;
        Ok(revision)
    }

    async fn check_not_compacted(&self, ctx: &CancellationToken, revision: i64) -> Result<(), StoreError> {
        let compacted = self.executor.compact_revision(ctx).await?;
        if revision < compacted {
            debug!("read at revision {revision} below horizon {compacted}");
            return Err(StoreError::Compacted { requested: revision, compacted });
        }
        Ok(())
    }

    async fn snapshot(&self, ctx: &CancellationToken, range: &KeyRange, revision: i64, limit: i64) -> Result<(i64, Vec<LogRow>), StoreError> {
        let at = self.read_revision(ctx, revision).await?;
        let rows = self.executor.list(ctx, range, at, limit).await?;
        // A compaction that overtook a historical read may have removed rows it needed.
        if revision > 0 {
            self.check_not_compacted(ctx, revision).await?;
        }
        Ok((at, rows))
    }

    /// Current revision and the key's live value, if any.
    async fn current_state(&self, ctx: &CancellationToken, key: &str) -> Result<(i64, Option<KeyValue>), StoreError> {
        let revision = self.executor.current_revision(ctx).await?;
        let kv = self.executor.latest(ctx, key).await?.filter(|row| !row.deleted).map(|row| row.to_kv());
        Ok((revision, kv))
    }

    async fn live(&self, ctx: &CancellationToken, key: &str) -> Result<Option<KeyValue>, StoreError> {
        Ok(self.executor.latest(ctx, key).await?.filter(|row| !row.deleted).map(|row| row.to_kv()))
    }

    /// The first live key of the range. `_limit` is accepted for protocol parity; at most one
    /// key is ever returned.
    pub async fn get(&self, ctx: &CancellationToken, key: &str, range_end: &str, _limit: i64, revision: i64) -> Result<(i64, Option<KeyValue>), StoreError> {
        self.check_open()?;
        let _admission = self.admission.admit(ctx, TxnKind::Read).await?;
        let range = KeyRange::from_range(key, range_end);
        let (revision, rows) = self.snapshot(ctx, &range, revision, 1).await?;
        Ok((revision, rows.first().map(LogRow::to_kv)))
    }

    pub async fn list(&self, ctx: &CancellationToken, prefix: &str, start_key: &str, limit: i64, revision: i64) -> Result<(i64, Vec<KeyValue>), StoreError> {
        self.check_open()?;
        let _admission = self.admission.admit(ctx, TxnKind::Read).await?;
        let range = KeyRange::from_prefix(prefix).starting_at(start_key);
        let (revision, rows) = self.snapshot(ctx, &range, revision, limit).await?;
        Ok((revision, rows.iter().map(LogRow::to_kv).collect()))
    }

    pub async fn count(&self, ctx: &CancellationToken, prefix: &str) -> Result<(i64, i64), StoreError> {
        self.check_open()?;
        let _admission = self.admission.admit(ctx, TxnKind::Read).await?;
        let revision = self.executor.current_revision(ctx).await?;
        let count = self.executor.count(ctx, &KeyRange::from_prefix(prefix), revision).await?;
        Ok((revision, count))
    }

    pub async fn create(&self, ctx: &CancellationToken, key: &str, value: Vec<u8>, lease: i64) -> Result<i64, StoreError> {
        self.check_open()?;
        let _admission = self.admission.admit(ctx, TxnKind::Write).await?;
        let prev_revision = match self.executor.latest(ctx, key).await? {
            Some(row) if !row.deleted => {
                debug!("create {key}: exists at revision {}", row.id);
                return Err(StoreError::KeyExists);
            }
            Some(tombstone) => tombstone.id,
            None => 0,
        };
        let revision = self.executor.insert(ctx, NewRow::create(key, value, lease, prev_revision)).await?;
        debug!("create {key}: revision {revision}");
        self.broadcaster.notify();
        Ok(revision)
    }

    pub async fn update(&self, ctx: &CancellationToken, key: &str, value: Vec<u8>, revision: i64, lease: i64) -> Result<UpdateResult, StoreError> {
        self.check_open()?;
        let _admission = self.admission.admit(ctx, TxnKind::Write).await?;
        let Some(current) = self.live(ctx, key).await? else {
            let revision = self.executor.current_revision(ctx).await?;
            return Ok(UpdateResult { revision, kv: None, succeeded: false });
        };
        if current.mod_revision != revision {
            debug!("update {key}: stale revision {revision}, current {}", current.mod_revision);
            let revision = self.executor.current_revision(ctx).await?;
            return Ok(UpdateResult { revision, kv: Some(current), succeeded: false });
        }

        let row = NewRow::update(&current, value.clone(), lease);
        match self.executor.insert(ctx, row).await {
            Ok(new_revision) => {
                debug!("update {key}: revision {new_revision}");
                self.broadcaster.notify();
                let kv = KeyValue { key: key.to_owned(), create_revision: current.create_revision, mod_revision: new_revision, value, lease };
                Ok(UpdateResult { revision: new_revision, kv: Some(kv), succeeded: true })
            }
            Err(StoreError::KeyExists) => {
                debug!("update {key}: lost race at revision {revision}");
                let (revision, kv) = self.current_state(ctx, key).await?;
                Ok(UpdateResult { revision, kv, succeeded: false })
            }
            Err(err) => Err(err),
        }
    }

    pub async fn delete(&self, ctx: &CancellationToken, key: &str, revision: i64) -> Result<UpdateResult, StoreError> {
        self.check_open()?;
        let _admission = self.admission.admit(ctx, TxnKind::Write).await?;
        for _ in 0..UNCONDITIONAL_DELETE_ATTEMPTS {
            let Some(current) = self.live(ctx, key).await? else {
                let revision = self.executor.current_revision(ctx).await?;
                return Ok(UpdateResult { revision, kv: None, succeeded: true });
            };
            if revision != 0 && current.mod_revision != revision {
                debug!("delete {key}: stale revision {revision}, current {}", current.mod_revision);
                let revision = self.executor.current_revision(ctx).await?;
                return Ok(UpdateResult { revision, kv: Some(current), succeeded: false });
            }

            match self.executor.insert(ctx, NewRow::tombstone(&current)).await {
                Ok(new_revision) => {
                    debug!("delete {key}: revision {new_revision}");
                    self.broadcaster.notify();
                    return Ok(UpdateResult { revision: new_revision, kv: Some(current), succeeded: true });
                }
                Err(StoreError::KeyExists) if revision == 0 => debug!("delete {key}: lost race, re-reading"),
                Err(StoreError::KeyExists) => {
                    debug!("delete {key}: lost race at revision {revision}");
                    let (revision, kv) = self.current_state(ctx, key).await?;
                    return Ok(UpdateResult { revision, kv, succeeded: false });
                }
                Err(err) => return Err(err),
            }
        }
        warn!("delete {key}: gave up after {UNCONDITIONAL_DELETE_ATTEMPTS} lost races");
        let (revision, kv) = self.current_state(ctx, key).await?;
        Ok(UpdateResult { revision, kv, succeeded: false })
    }

    /// Streams every change to `key` (or below it, for a `/`-terminated prefix) from `revision`
    /// on. Revision 0 starts after the current revision.
    pub async fn watch(&self, ctx: &CancellationToken, key: &str, revision: i64) -> Result<Watcher, StoreError> {
        self.check_open()?;
        let start = if revision > 0 { revision } else { self.executor.current_revision(ctx).await? + 1 };
        self.broadcaster.watch(ctx.child_token(), KeyRange::from_prefix(key), start).await
    }

    pub async fn db_size(&self, ctx: &CancellationToken) -> Result<i64, StoreError> {
        self.check_open()?;
        self.executor.size(ctx).await
    }

    /// One compaction pass honouring the retention window.
    pub async fn do_compact(&self, ctx: &CancellationToken) -> Result<Option<Compaction>, StoreError> {
        self.check_open()?;
        let _admission = self.admission.admit(ctx, TxnKind::Write).await?;
        self.compactor.compact(ctx).await
    }

    /// Compacts up to `revision`, as far as open watches allow.
    pub async fn compact(&self, ctx: &CancellationToken, revision: i64) -> Result<Option<Compaction>, StoreError> {
        self.check_open()?;
        let _admission = self.admission.admit(ctx, TxnKind::Write).await?;
        self.compactor.compact_to(ctx, revision).await
    }

    pub async fn current_revision(&self, ctx: &CancellationToken) -> Result<i64, StoreError> {
        self.check_open()?;
        self.executor.current_revision(ctx).await
    }

    pub async fn compact_revision(&self, ctx: &CancellationToken) -> Result<i64, StoreError> {
        self.check_open()?;
        self.executor.compact_revision(ctx).await
    }

    /// Stops background tasks, ends every watch and closes the driver. Idempotent.
    pub async fn close(&self) {
        if self.shutdown.is_cancelled() {
            return;
        }
        self.shutdown.cancel();
        self.admission.close();
        let tasks = std::mem::take(&mut *self.tasks.lock().unwrap_or_else(PoisonError::into_inner));
        for task in tasks {
            if let Err(err) = task.await {
                warn!("background task ended abnormally: {err}");
            }
        }
        self.executor.driver().close().await;
        info!("{}: store closed", self.executor.dialect().name);
    }
}

impl Drop for LogStore {
    fn drop(&mut self) { self.shutdown.cancel(); }
}

#[async_trait]
impl Backend for LogStore {
    async fn start(&self, ctx: &CancellationToken) -> Result<(), StoreError> { LogStore::start(self, ctx).await }

    async fn get(&self, ctx: &CancellationToken, key: &str, range_end: &str, limit: i64, revision: i64) -> Result<(i64, Option<KeyValue>), StoreError> {
        LogStore::get(self, ctx, key, range_end, limit, revision).await
    }

    async fn create(&self, ctx: &CancellationToken, key: &str, value: Vec<u8>, lease: i64) -> Result<i64, StoreError> {
        LogStore::create(self, ctx, key, value, lease).await
    }

    async fn delete(&self, ctx: &CancellationToken, key: &str, revision: i64) -> Result<UpdateResult, StoreError> {
        LogStore::delete(self, ctx, key, revision).await
    }

    async fn list(&self, ctx: &CancellationToken, prefix: &str, start_key: &str, limit: i64, revision: i64) -> Result<(i64, Vec<KeyValue>), StoreError> {
        LogStore::list(self, ctx, prefix, start_key, limit, revision).await
    }

    async fn count(&self, ctx: &CancellationToken, prefix: &str) -> Result<(i64, i64), StoreError> { LogStore::count(self, ctx, prefix).await }

    async fn update(&self, ctx: &CancellationToken, key: &str, value: Vec<u8>, revision: i64, lease: i64) -> Result<UpdateResult, StoreError> {
        LogStore::update(self, ctx, key, value, revision, lease).await
    }

    async fn watch(&self, ctx: &CancellationToken, key: &str, revision: i64) -> Result<Watcher, StoreError> {
        LogStore::watch(self, ctx, key, revision).await
    }

    async fn db_size(&self, ctx: &CancellationToken) -> Result<i64, StoreError> { LogStore::db_size(self, ctx).await }

    async fn do_compact(&self, ctx: &CancellationToken) -> Result<(), StoreError> { LogStore::do_compact(self, ctx).await.map(|_| ()) }

    async fn current_revision(&self, ctx: &CancellationToken) -> Result<i64, StoreError> { LogStore::current_revision(self, ctx).await }

    async fn compact_revision(&self, ctx: &CancellationToken) -> Result<i64, StoreError> { LogStore::compact_revision(self, ctx).await }

    async fn close(&self) { LogStore::close(self).await }
}
