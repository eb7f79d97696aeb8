//! Turns the append-only table into ordered event streams.
//!
//! A single poller reads newly committed rows in id order and hands them to every live
//! subscription. A new watch first replays history from its start revision straight out of the
//! table, then joins the live set at exactly the revision the poller has not yet delivered, so a
//! watcher sees every matching revision once and in order.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, info, warn};

use crate::config::StoreConfig;
use crate::error::StoreError;
use crate::executor::Executor;
use crate::types::{Event, KeyRange, LogRow};

/// How long the poller waits for a missing revision before skipping it.
const GAP_TIMEOUT: Duration = Duration::from_secs(5);

/// Why a watch stream ended.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WatchClosed {
    #[error("watch cancelled")]
    Cancelled,
    #[error("required revision {requested} has been compacted (compacted to {compacted})")]
    Compacted { requested: i64, compacted: i64 },
    #[error("watcher fell behind and was dropped")]
    Overflow,
    #[error("store shut down")]
    Shutdown,
    #[error("watch failed: {0}")]
    Failed(String),
}

impl From<WatchClosed> for StoreError {
    fn from(reason: WatchClosed) -> Self {
        match reason {
            WatchClosed::Compacted { requested, compacted } => StoreError::Compacted { requested, compacted },
            WatchClosed::Shutdown => StoreError::Closed,
            _ => StoreError::Cancelled,
        }
    }
}

/// The receiving end of a watch. Dropping it cancels the watch.
pub struct Watcher {
    id: u64,
    start_revision: i64,
    receiver: mpsc::Receiver<Vec<Event>>,
    closed: Arc<OnceLock<WatchClosed>>,
    _cancel_on_drop: DropGuard,
}

impl Watcher {
    pub fn id(&self) -> u64 { self.id }

    /// First revision this watch delivers.
    pub fn start_revision(&self) -> i64 { self.start_revision }

    /// Next batch of events, in revision order. `None` once the watch has ended; see
    /// [`Watcher::close_reason`].
    pub async fn recv(&mut self) -> Option<Vec<Event>> { self.receiver.recv().await }

    pub fn close_reason(&self) -> Option<WatchClosed> { self.closed.get().cloned() }
}

impl std::fmt::Debug for Watcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Watcher").field("id", &self.id).field("start_revision", &self.start_revision).finish()
    }
}

struct Subscriber {
    range: KeyRange,
    /// Revisions below this were delivered by replay.
    min_revision: i64,
    sender: mpsc::Sender<Vec<Event>>,
    closed: Arc<OnceLock<WatchClosed>>,
    cancel: CancellationToken,
}

impl Subscriber {
    fn close(self, reason: WatchClosed) {
        let _ = self.closed.set(reason);
        self.cancel.cancel();
    }
}

#[derive(Default)]
struct State {
    /// Highest revision handed to live subscribers.
    last_seen: i64,
    live: HashMap<u64, Subscriber>,
    /// Watches still replaying, keyed by id, with the lowest revision each still needs.
    replaying: HashMap<u64, i64>,
}

struct Inner {
    executor: Arc<Executor>,
    state: Mutex<State>,
    next_id: AtomicU64,
    wake: Notify,
    progress: watch::Sender<i64>,
    poll_interval: Duration,
    batch_size: i64,
    queue_size: usize,
    shutdown: CancellationToken,
}

impl Inner {
    fn state(&self) -> MutexGuard<'_, State> { self.state.lock().unwrap_or_else(PoisonError::into_inner) }
}

#[derive(Clone)]
pub struct Broadcaster(Arc<Inner>);

impl Broadcaster {
    pub fn new(executor: Arc<Executor>, config: &StoreConfig, shutdown: CancellationToken) -> Self {
        Self(Arc::new(Inner {
            executor,
            state: Mutex::new(State::default()),
            next_id: AtomicU64::new(1),
            wake: Notify::new(),
            progress: watch::Sender::new(0),
            poll_interval: config.poll_interval,
            batch_size: config.poll_batch_size.max(1),
            queue_size: config.watch_queue_size.max(1),
            shutdown,
        }))
    }

    /// Positions the poller at the current revision and spawns it.
    pub async fn start(&self) -> Result<JoinHandle<()>, StoreError> {
        let current = self.0.executor.current_revision(&self.0.shutdown).await?;
        self.0.state().last_seen = current;
        self.0.progress.send_replace(current);
        info!("broadcaster: polling from revision {current} every {:?}", self.0.poll_interval);
        Ok(tokio::spawn(self.0.clone().poll_loop()))
    }

    /// Wakes the poller early; called after local writes.
    pub fn notify(&self) { self.0.wake.notify_one(); }

    pub fn last_seen(&self) -> i64 { self.0.state().last_seen }

    /// Highest revision compaction may remove without breaking any watch.
    pub fn safe_horizon(&self) -> i64 {
        let state = self.0.state();
        state.replaying.values().fold(state.last_seen, |horizon, next| horizon.min(next - 1))
    }

    pub fn watcher_count(&self) -> usize {
        let state = self.0.state();
        state.live.len() + state.replaying.len()
    }

    /// Waits until the poller has delivered `revision`, or `timeout` passes.
    pub async fn wait_for(&self, revision: i64, timeout: Duration) -> bool {
        let mut progress = self.0.progress.subscribe();
        self.notify();
        let reached = matches!(tokio::time::timeout(timeout, progress.wait_for(|seen| *seen >= revision)).await, Ok(Ok(_)));
        reached
    }

    /// Starts a watch on `range` delivering every revision from `start` on.
    ///
    /// Fails with [`StoreError::Compacted`] when `start` is below the compaction horizon.
    pub async fn watch(&self, ctx: CancellationToken, range: KeyRange, start: i64) -> Result<Watcher, StoreError> {
        let inner = &self.0;
        if inner.shutdown.is_cancelled() {
            return Err(StoreError::Closed);
        }
        let id = inner.next_id.fetch_add(1, Ordering::Relaxed);
        // hold the horizon before checking it
        inner.state().replaying.insert(id, start);

        let compacted = match inner.executor.compact_revision(&ctx).await {
            Ok(compacted) => compacted,
            Err(err) => {
                inner.state().replaying.remove(&id);
                return Err(err);
            }
        };
        if start < compacted {
            inner.state().replaying.remove(&id);
            debug!("watch {id}: revision {start} is below the compaction horizon {compacted}");
            return Err(StoreError::Compacted { requested: start, compacted });
        }

        let (sender, receiver) = mpsc::channel(inner.queue_size);
        let closed = Arc::new(OnceLock::new());
        debug!("watch {id}: {range:?} from revision {start}");
        tokio::spawn(inner.clone().run_watch(id, range, start, compacted, sender, closed.clone(), ctx.clone()));

        Ok(Watcher { id, start_revision: start, receiver, closed, _cancel_on_drop: ctx.drop_guard() })
    }
}

impl Inner {
    #[allow(clippy::too_many_arguments)]
    async fn run_watch(
        self: Arc<Self>,
        id: u64,
        range: KeyRange,
        start: i64,
        compacted: i64,
        sender: mpsc::Sender<Vec<Event>>,
        closed: Arc<OnceLock<WatchClosed>>,
        ctx: CancellationToken,
    ) {
        let mut sender = Some(sender);
        let reason = match self.replay(id, range, start, compacted, &mut sender, &closed, &ctx).await {
            Ok(()) => tokio::select! {
                _ = ctx.cancelled() => WatchClosed::Cancelled,
                _ = self.shutdown.cancelled() => WatchClosed::Shutdown,
            },
            Err(reason) => reason,
        };

        let removed = {
            let mut state = self.state();
            state.replaying.remove(&id);
            state.live.remove(&id)
        };
        let _ = closed.set(reason);
        debug!("watch {id}: closed ({})", closed.get().map(ToString::to_string).unwrap_or_default());
        // the channel ends only after the reason is visible
        drop(removed);
        drop(sender);
    }

    /// Streams history until the watch can join the live set. On success the sender has moved
    /// into the live subscription.
    #[allow(clippy::too_many_arguments)]
    async fn replay(
        &self,
        id: u64,
        range: KeyRange,
        start: i64,
        compacted_at_start: i64,
        sender: &mut Option<mpsc::Sender<Vec<Event>>>,
        closed: &Arc<OnceLock<WatchClosed>>,
        ctx: &CancellationToken,
    ) -> Result<(), WatchClosed> {
        let failed = |err: StoreError| match err {
            StoreError::Cancelled => WatchClosed::Cancelled,
            err => WatchClosed::Failed(err.to_string()),
        };
        let mut next = start;
        loop {
            // every revision up to here was committed before the query below starts
            let delivered_live = self.state().last_seen;
            let rows = self.executor.after_in(ctx, &range, next - 1, self.batch_size).await.map_err(failed)?;

            // compaction may have started before this watch held the horizon
            let compacted = self.executor.compact_revision(ctx).await.map_err(failed)?;
            if compacted > compacted_at_start && compacted >= next {
                return Err(WatchClosed::Compacted { requested: next, compacted });
            }

            let full = rows.len() as i64 >= self.batch_size;
            if let Some(last) = rows.last() {
                next = last.id + 1;
                let events: Vec<Event> = rows.iter().map(LogRow::to_event).collect();
                let Some(tx) = sender.as_ref() else { return Err(WatchClosed::Cancelled) };
                tokio::select! {
                    _ = ctx.cancelled() => return Err(WatchClosed::Cancelled),
                    _ = self.shutdown.cancelled() => return Err(WatchClosed::Shutdown),
                    sent = tx.send(events) => sent.map_err(|_| WatchClosed::Cancelled)?,
                }
            }
            if full {
                self.state().replaying.insert(id, next);
                continue;
            }
            next = next.max(delivered_live + 1);

            let mut state = self.state();
            if state.last_seen < next {
                state.replaying.remove(&id);
                let Some(sender) = sender.take() else { return Err(WatchClosed::Cancelled) };
                let subscriber =
                    Subscriber { range, min_revision: next, sender, closed: closed.clone(), cancel: ctx.clone() };
                state.live.insert(id, subscriber);
                debug!("watch {id}: live from revision {next}");
                return Ok(());
            }
            state.replaying.insert(id, next);
        }
    }

    async fn poll_loop(self: Arc<Self>) {
        let mut gap: Option<(i64, Instant)> = None;
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = self.wake.notified() => {}
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
            loop {
                match self.poll_once(&mut gap).await {
                    Ok(true) => continue,
                    Ok(false) => break,
                    Err(StoreError::Cancelled) => return,
                    Err(err) => {
                        warn!("broadcaster: poll failed: {err}");
                        break;
                    }
                }
            }
        }
        let closing: Vec<Subscriber> = self.state().live.drain().map(|(_, subscriber)| subscriber).collect();
        for subscriber in closing {
            subscriber.close(WatchClosed::Shutdown);
        }
        debug!("broadcaster: poller stopped");
    }

    /// Delivers one batch. Returns whether more rows may be waiting.
    async fn poll_once(&self, gap: &mut Option<(i64, Instant)>) -> Result<bool, StoreError> {
        let last_seen = self.state().last_seen;
        let rows = self.executor.after(&self.shutdown, last_seen, self.batch_size).await?;
        let Some(first) = rows.first() else {
            *gap = None;
            return Ok(false);
        };

        // A missing id is usually a transaction that has not committed yet.
        if first.id != last_seen + 1 {
            match *gap {
                Some((missing, since)) if missing == last_seen + 1 && since.elapsed() >= GAP_TIMEOUT => {
                    warn!("broadcaster: skipping missing revisions {}..{}", last_seen + 1, first.id - 1);
                }
                Some((missing, _)) if missing == last_seen + 1 => return Ok(false),
                _ => {
                    *gap = Some((last_seen + 1, Instant::now()));
                    return Ok(false);
                }
            }
        }
        *gap = None;

        let contiguous = rows.windows(2).position(|pair| pair[1].id != pair[0].id + 1).map_or(rows.len(), |i| i + 1);
        let more = contiguous < rows.len() || rows.len() as i64 >= self.batch_size;
        self.dispatch(&rows[..contiguous]);
        Ok(more && contiguous == rows.len())
    }

    fn dispatch(&self, rows: &[LogRow]) {
        let Some(last) = rows.last() else { return };
        let events: Vec<Event> = rows.iter().filter(|row| !row.is_metadata()).map(LogRow::to_event).collect();

        let mut state = self.state();
        state.last_seen = last.id;
        let mut dropped = Vec::new();
        for (id, subscriber) in state.live.iter() {
            let batch: Vec<Event> = events
                .iter()
                .filter(|event| event.revision() >= subscriber.min_revision && subscriber.range.contains(&event.kv.key))
                .cloned()
                .collect();
            if batch.is_empty() {
                continue;
            }
            match subscriber.sender.try_send(batch) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    warn!("watch {id}: queue full, dropping slow watcher");
                    dropped.push((*id, WatchClosed::Overflow));
                }
                Err(TrySendError::Closed(_)) => dropped.push((*id, WatchClosed::Cancelled)),
            }
        }
        for (id, reason) in dropped {
            if let Some(subscriber) = state.live.remove(&id) {
                subscriber.close(reason);
            }
        }
        drop(state);
        self.progress.send_replace(last.id);
    }
}
