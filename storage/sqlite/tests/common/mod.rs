use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use kine_core::{Event, LogStore, StoreConfig, Watcher};
use kine_storage_sqlite::{DriverOptions, Flavor, SqliteDriver};
use tokio_util::sync::CancellationToken;
use tracing::Level;

// Initialize tracing for tests
#[ctor::ctor]
fn init_tracing() {
    // if LOG_LEVEL env var is set, use it
    if let Ok(level) = std::env::var("LOG_LEVEL") {
        tracing_subscriber::fmt().with_max_level(Level::from_str(&level).unwrap()).with_test_writer().init();
    } else {
        tracing_subscriber::fmt().with_max_level(Level::INFO).with_test_writer().init();
    }
}

/// Fast polling, no background compaction; `overrides` win.
#[allow(unused)]
pub fn config(overrides: &[(&str, &str)]) -> anyhow::Result<StoreConfig> {
    let mut params = vec![("poll-interval", "20ms"), ("compact-interval", "0")];
    params.extend_from_slice(overrides);
    let (config, rest) = StoreConfig::from_params(params)?;
    assert!(rest.is_empty(), "unexpected params {rest:?}");
    Ok(config)
}

#[allow(unused)]
pub async fn memory_store(overrides: &[(&str, &str)]) -> anyhow::Result<Arc<LogStore>> {
    let driver = SqliteDriver::open_in_memory(DriverOptions::default()).await?;
    let store = Arc::new(LogStore::new(Arc::new(driver), config(overrides)?));
    store.start(&CancellationToken::new()).await?;
    Ok(store)
}

#[allow(unused)]
pub async fn file_store(path: &Path, overrides: &[(&str, &str)]) -> anyhow::Result<Arc<LogStore>> {
    let options = DriverOptions { pool_size: Some(8), ..Default::default() };
    let driver = SqliteDriver::open(path, Flavor::Sqlite, options).await?;
    let store = Arc::new(LogStore::new(Arc::new(driver), config(overrides)?));
    store.start(&CancellationToken::new()).await?;
    Ok(store)
}

/// Receives until an event at `revision` or later arrives, failing after a few seconds.
#[allow(unused)]
pub async fn events_until(watcher: &mut Watcher, revision: i64) -> anyhow::Result<Vec<Event>> {
    let mut events = Vec::new();
    while events.last().map_or(true, |event: &Event| event.revision() < revision) {
        match tokio::time::timeout(Duration::from_secs(5), watcher.recv()).await {
            Ok(Some(batch)) => events.extend(batch),
            Ok(None) => anyhow::bail!("watch closed early: {:?}", watcher.close_reason()),
            Err(_) => anyhow::bail!("timed out waiting for revision {revision}, got {:?}", revisions(&events)),
        }
    }
    Ok(events)
}

/// Asserts nothing arrives for a short while.
#[allow(unused)]
pub async fn assert_quiet(watcher: &mut Watcher) {
    if let Ok(Some(batch)) = tokio::time::timeout(Duration::from_millis(150), watcher.recv()).await {
        panic!("unexpected events {:?}", revisions(&batch));
    }
}

#[allow(unused)]
pub fn revisions(events: &[Event]) -> Vec<i64> { events.iter().map(Event::revision).collect() }
