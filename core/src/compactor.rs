//! Background removal of history that is no longer readable.
//!
//! Compaction walks the horizon forward in batches. Each batch deletes the rows superseded or
//! tombstoned inside it and records the new horizon in the same transaction, so a crash leaves
//! the table consistent at some batch boundary. The target never passes the broadcaster's safe
//! horizon, which keeps every open watch able to finish its replay.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::broadcaster::Broadcaster;
use crate::config::StoreConfig;
use crate::error::StoreError;
use crate::executor::Executor;

/// What a compaction pass did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Compaction {
    /// Horizon before the pass.
    pub from: i64,
    /// Horizon after the pass.
    pub to: i64,
    pub deleted: u64,
}

pub struct Compactor {
    executor: Arc<Executor>,
    broadcaster: Broadcaster,
    interval: Duration,
    retention: i64,
    batch_size: i64,
    poll_interval: Duration,
    running: Mutex<()>,
}

impl Compactor {
    pub fn new(executor: Arc<Executor>, broadcaster: Broadcaster, config: &StoreConfig) -> Self {
        Self {
            executor,
            broadcaster,
            interval: config.compact_interval,
            retention: config.compact_retention,
            batch_size: config.compact_batch_size.max(1),
            poll_interval: config.poll_interval,
            running: Mutex::new(()),
        }
    }

    /// Compacts everything older than the retention window.
    pub async fn compact(&self, ctx: &CancellationToken) -> Result<Option<Compaction>, StoreError> {
        let current = self.executor.current_revision(ctx).await?;
        self.compact_to(ctx, current - self.retention).await
    }

    /// Compacts up to `revision`, or as close to it as open watches allow. Returns `None` when
    /// another pass is already running.
    pub async fn compact_to(&self, ctx: &CancellationToken, revision: i64) -> Result<Option<Compaction>, StoreError> {
        let Ok(_running) = self.running.try_lock() else {
            debug!("compaction already in progress");
            return Ok(None);
        };

        let current = self.executor.current_revision(ctx).await?;
        if revision > current {
            return Err(StoreError::FutureRevision { requested: revision, current });
        }
        let start = self.executor.compact_revision(ctx).await?;
        let mut outcome = Compaction { from: start, to: start, deleted: 0 };
        if revision <= start {
            return Ok(Some(outcome));
        }

        // give the poller a chance to catch up with recent writes
        if self.broadcaster.last_seen() < revision {
            self.broadcaster.wait_for(revision, (self.poll_interval * 2).max(Duration::from_secs(1))).await;
        }

        while outcome.to < revision {
            let end = (outcome.to + self.batch_size).min(revision).min(self.broadcaster.safe_horizon());
            if end <= outcome.to {
                debug!("compaction held at {} by open watches", outcome.to);
                break;
            }
            outcome.deleted += self.executor.compact(ctx, outcome.to, end).await?;
            outcome.to = end;
        }

        if outcome.to > outcome.from {
            info!("compacted revisions {}..={}: {} rows deleted", outcome.from + 1, outcome.to, outcome.deleted);
        }
        Ok(Some(outcome))
    }

    /// Runs periodic compaction until `shutdown` fires. A zero interval disables it.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        if self.interval.is_zero() {
            debug!("periodic compaction disabled");
            return;
        }
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.interval) => {}
            }
            match self.compact(&shutdown).await {
                Ok(_) | Err(StoreError::Cancelled) => {}
                Err(err) => warn!("periodic compaction failed: {err}"),
            }
        }
        debug!("compactor stopped");
    }
}
