mod common;

use std::collections::HashSet;
use std::sync::Arc;

use kine_core::{Backend, StoreError, COMPACT_REV_KEY};
use tokio_util::sync::CancellationToken;

#[tokio::test]
async fn create_update_delete_walkthrough() -> anyhow::Result<()> {
    let store = common::memory_store(&[]).await?;
    let ctx = CancellationToken::new();

    assert_eq!(store.create(&ctx, "a", b"v1".to_vec(), 0).await?, 1);

    let updated = store.update(&ctx, "a", b"v2".to_vec(), 1, 0).await?;
    assert!(updated.succeeded);
    assert_eq!(updated.revision, 2);
    let kv = updated.kv.unwrap();
    assert_eq!((kv.create_revision, kv.mod_revision, kv.value), (1, 2, b"v2".to_vec()));

    // stale revision: conflict, nothing written
    let stale = store.update(&ctx, "a", b"v3".to_vec(), 1, 0).await?;
    assert!(!stale.succeeded);
    assert_eq!(stale.kv.map(|kv| kv.mod_revision), Some(2));
    assert_eq!(store.current_revision(&ctx).await?, 2);

    let deleted = store.delete(&ctx, "a", 2).await?;
    assert!(deleted.succeeded);
    assert_eq!(deleted.revision, 3);
    assert_eq!(deleted.kv.map(|kv| kv.value), Some(b"v2".to_vec()));

    let (revision, kv) = store.get(&ctx, "a", "", 0, 0).await?;
    assert_eq!(revision, 3);
    assert!(kv.is_none());
    Ok(())
}

#[tokio::test]
async fn revisions_increase_across_keys() -> anyhow::Result<()> {
    let store = common::memory_store(&[]).await?;
    let ctx = CancellationToken::new();

    let mut last = 0;
    for i in 0..20 {
        let key = format!("/registry/pods/p{}", i % 4);
        let revision = match store.get(&ctx, &key, "", 0, 0).await?.1 {
            None => store.create(&ctx, &key, vec![i], 0).await?,
            Some(kv) => store.update(&ctx, &key, vec![i], kv.mod_revision, 0).await?.revision,
        };
        assert!(revision > last, "revision {revision} after {last}");
        last = revision;
    }
    assert_eq!(store.current_revision(&ctx).await?, last);
    Ok(())
}

#[tokio::test]
async fn create_conflicts_with_a_live_key_only() -> anyhow::Result<()> {
    let store = common::memory_store(&[]).await?;
    let ctx = CancellationToken::new();

    let first = store.create(&ctx, "/a", b"1".to_vec(), 0).await?;
    assert!(matches!(store.create(&ctx, "/a", b"2".to_vec(), 0).await, Err(StoreError::KeyExists)));
    assert_eq!(store.current_revision(&ctx).await?, first);

    store.delete(&ctx, "/a", 0).await?;
    let recreated = store.create(&ctx, "/a", b"3".to_vec(), 7).await?;
    let (_, kv) = store.get(&ctx, "/a", "", 0, 0).await?;
    let kv = kv.unwrap();
    assert_eq!(kv.create_revision, recreated);
    assert_eq!(kv.mod_revision, recreated);
    assert_eq!(kv.lease, 7);
    Ok(())
}

#[tokio::test]
async fn stale_writes_do_not_mutate() -> anyhow::Result<()> {
    let store = common::memory_store(&[]).await?;
    let ctx = CancellationToken::new();

    let created = store.create(&ctx, "/a", b"1".to_vec(), 0).await?;
    let current = store.update(&ctx, "/a", b"2".to_vec(), created, 0).await?.revision;

    let stale_delete = store.delete(&ctx, "/a", created).await?;
    assert!(!stale_delete.succeeded);
    assert_eq!(stale_delete.revision, current);
    assert_eq!(stale_delete.kv.map(|kv| kv.value), Some(b"2".to_vec()));

    let (_, kv) = store.get(&ctx, "/a", "", 0, 0).await?;
    assert_eq!(kv.map(|kv| kv.mod_revision), Some(current));
    assert_eq!(store.current_revision(&ctx).await?, current);
    Ok(())
}

#[tokio::test]
async fn writes_to_missing_keys() -> anyhow::Result<()> {
    let store = common::memory_store(&[]).await?;
    let ctx = CancellationToken::new();
    store.create(&ctx, "/other", b"x".to_vec(), 0).await?;

    let update = store.update(&ctx, "/missing", b"1".to_vec(), 1, 0).await?;
    assert!(!update.succeeded);
    assert!(update.kv.is_none());

    let delete = store.delete(&ctx, "/missing", 0).await?;
    assert!(delete.succeeded);
    assert!(delete.kv.is_none());
    assert_eq!(delete.revision, 1);
    Ok(())
}

#[tokio::test]
async fn list_honours_prefix_start_key_and_limit() -> anyhow::Result<()> {
    let store = common::memory_store(&[]).await?;
    let ctx = CancellationToken::new();
    for key in ["/registry/pods/a", "/registry/pods/b", "/registry/pods/c", "/registry/podsx", "/registry/services/a"] {
        store.create(&ctx, key, key.as_bytes().to_vec(), 0).await?;
    }
    store.delete(&ctx, "/registry/pods/b", 0).await?;

    let keys = |kvs: Vec<kine_core::KeyValue>| kvs.into_iter().map(|kv| kv.key).collect::<Vec<_>>();

    let (revision, kvs) = store.list(&ctx, "/registry/pods/", "", 0, 0).await?;
    assert_eq!(revision, 6);
    assert_eq!(keys(kvs), vec!["/registry/pods/a", "/registry/pods/c"]);

    let (_, kvs) = store.list(&ctx, "/registry/", "/registry/pods/b", 2, 0).await?;
    assert_eq!(keys(kvs), vec!["/registry/pods/c", "/registry/podsx"]);

    // no trailing slash: exactly that key
    let (_, kvs) = store.list(&ctx, "/registry/pods/a", "", 0, 0).await?;
    assert_eq!(keys(kvs), vec!["/registry/pods/a"]);

    assert_eq!(store.count(&ctx, "/registry/pods/").await?, (6, 2));
    assert_eq!(store.count(&ctx, "/registry/").await?, (6, 4));
    Ok(())
}

#[tokio::test]
async fn get_returns_the_first_key_of_a_range() -> anyhow::Result<()> {
    let store = common::memory_store(&[]).await?;
    let ctx = CancellationToken::new();
    store.create(&ctx, "/b", b"b".to_vec(), 0).await?;
    store.create(&ctx, "/c", b"c".to_vec(), 0).await?;

    let (_, kv) = store.get(&ctx, "/a", "/z", 0, 0).await?;
    assert_eq!(kv.map(|kv| kv.key), Some("/b".to_string()));
    let (_, kv) = store.get(&ctx, "/a", "/b", 0, 0).await?;
    assert!(kv.is_none());
    Ok(())
}

#[tokio::test]
async fn snapshot_reads_ignore_later_writes() -> anyhow::Result<()> {
    let store = common::memory_store(&[]).await?;
    let ctx = CancellationToken::new();

    let r1 = store.create(&ctx, "/s/a", b"1".to_vec(), 0).await?;
    let (_, before) = store.list(&ctx, "/s/", "", 0, r1).await?;

    let r2 = store.update(&ctx, "/s/a", b"2".to_vec(), r1, 0).await?.revision;
    store.create(&ctx, "/s/b", b"b".to_vec(), 0).await?;
    store.delete(&ctx, "/s/a", r2).await?;

    let (revision, after) = store.list(&ctx, "/s/", "", 0, r1).await?;
    assert_eq!(revision, r1);
    assert_eq!(before, after);

    let (_, kv) = store.get(&ctx, "/s/a", "", 0, r2).await?;
    assert_eq!(kv.map(|kv| kv.value), Some(b"2".to_vec()));
    let (_, kv) = store.get(&ctx, "/s/a", "", 0, 0).await?;
    assert!(kv.is_none());
    Ok(())
}

#[tokio::test]
async fn reads_past_the_current_revision_fail() -> anyhow::Result<()> {
    let store = common::memory_store(&[]).await?;
    let ctx = CancellationToken::new();
    store.create(&ctx, "/a", b"1".to_vec(), 0).await?;
    let err = store.get(&ctx, "/a", "", 0, 5).await.unwrap_err();
    assert!(matches!(err, StoreError::FutureRevision { requested: 5, current: 1 }));
    Ok(())
}

#[tokio::test]
async fn racing_updates_have_exactly_one_winner() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let store = common::file_store(&dir.path().join("state.db"), &[]).await?;
    let ctx = CancellationToken::new();
    let base = store.create(&ctx, "/race", b"0".to_vec(), 0).await?;

    let mut tasks = Vec::new();
    for i in 0..16u8 {
        let store = store.clone();
        let ctx = ctx.clone();
        tasks.push(tokio::spawn(async move { store.update(&ctx, "/race", vec![i], base, 0).await }));
    }
    let mut winners = Vec::new();
    let mut losers = Vec::new();
    for task in tasks {
        let result = task.await??;
        if result.succeeded {
            winners.push(result);
        } else {
            losers.push(result);
        }
    }
    assert_eq!(winners.len(), 1);
    assert_eq!(losers.len(), 15);

    let (_, kv) = store.get(&ctx, "/race", "", 0, 0).await?;
    assert_eq!(kv, winners[0].kv);
    assert_eq!(store.current_revision(&ctx).await?, base + 1);

    // each loser retries from the revision it was handed back and gets through
    for loser in losers {
        let mut seen = loser.kv.map(|kv| kv.mod_revision).unwrap_or_default();
        assert!(seen > base);
        loop {
            let retried = store.update(&ctx, "/race", b"retry".to_vec(), seen, 0).await?;
            if retried.succeeded {
                assert!(retried.revision > seen);
                break;
            }
            // the stored value moved on since the loser read it
            seen = retried.kv.map(|kv| kv.mod_revision).unwrap_or_default();
        }
    }
    assert_eq!(store.current_revision(&ctx).await?, base + 16);
    Ok(())
}

#[tokio::test]
async fn racing_creates_have_exactly_one_winner() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let store = common::file_store(&dir.path().join("state.db"), &[]).await?;
    let ctx = CancellationToken::new();

    let mut tasks = Vec::new();
    for i in 0..8u8 {
        let store = store.clone();
        let ctx = ctx.clone();
        tasks.push(tokio::spawn(async move { store.create(&ctx, "/lock", vec![i], 0).await }));
    }
    let mut created = 0;
    for task in tasks {
        match task.await? {
            Ok(_) => created += 1,
            Err(StoreError::KeyExists) => {}
            Err(err) => return Err(err.into()),
        }
    }
    assert_eq!(created, 1);
    Ok(())
}

#[tokio::test]
async fn compaction_discards_history_only() -> anyhow::Result<()> {
    let store = common::memory_store(&[("compact-batch-size", "2")]).await?;
    let ctx = CancellationToken::new();

    let mut revision = store.create(&ctx, "/c/a", b"0".to_vec(), 0).await?;
    for i in 1..6u8 {
        revision = store.update(&ctx, "/c/a", vec![i], revision, 0).await?.revision;
    }
    store.create(&ctx, "/c/gone", b"x".to_vec(), 0).await?;
    store.delete(&ctx, "/c/gone", 0).await?;
    let head = store.current_revision(&ctx).await?;

    let compaction = store.compact(&ctx, head).await?.unwrap();
    assert_eq!((compaction.from, compaction.to), (0, head));
    assert!(compaction.deleted >= 7, "deleted {}", compaction.deleted);
    assert_eq!(store.compact_revision(&ctx).await?, head);

    let err = store.get(&ctx, "/c/a", "", 0, revision - 1).await.unwrap_err();
    assert!(matches!(err, StoreError::Compacted { .. }));

    let (_, kv) = store.get(&ctx, "/c/a", "", 0, 0).await?;
    assert_eq!(kv.map(|kv| (kv.mod_revision, kv.value)), Some((revision, vec![5])));

    // the horizon row never shows up
    let (_, kvs) = store.list(&ctx, "", "", 0, 0).await?;
    assert!(kvs.iter().all(|kv| kv.key != COMPACT_REV_KEY));
    assert_eq!(store.count(&ctx, "").await?.1, 1);

    // writes keep chaining from the surviving rows
    let next = store.update(&ctx, "/c/a", b"after".to_vec(), revision, 0).await?;
    assert!(next.succeeded);
    Ok(())
}

#[tokio::test]
async fn compacting_to_a_tombstone_keeps_the_current_revision() -> anyhow::Result<()> {
    let store = common::memory_store(&[]).await?;
    let ctx = CancellationToken::new();

    store.create(&ctx, "/a", b"1".to_vec(), 0).await?;
    store.delete(&ctx, "/a", 0).await?;
    let first = store.current_revision(&ctx).await?;
    store.compact(&ctx, first).await?.unwrap();

    store.create(&ctx, "/b", b"1".to_vec(), 0).await?;
    let head = store.delete(&ctx, "/b", 0).await?.revision;
    assert_eq!(store.current_revision(&ctx).await?, head);

    let compaction = store.compact(&ctx, head).await?.unwrap();
    assert_eq!(compaction.to, head);
    assert_eq!(store.current_revision(&ctx).await?, head);

    let (revision, kv) = store.get(&ctx, "/b", "", 0, head).await?;
    assert_eq!((revision, kv), (head, None));
    assert_eq!(store.count(&ctx, "/").await?, (head, 0));

    let mut watcher = store.watch(&ctx, "/c", 0).await?;
    assert_eq!(watcher.start_revision(), head + 1);
    let next = store.create(&ctx, "/c", b"1".to_vec(), 0).await?;
    assert_eq!(next, head + 1);
    let events = common::events_until(&mut watcher, next).await?;
    assert_eq!(common::revisions(&events), vec![next]);
    Ok(())
}

#[tokio::test]
async fn compaction_respects_retention() -> anyhow::Result<()> {
    let store = common::memory_store(&[("compact-retention", "3")]).await?;
    let ctx = CancellationToken::new();
    for i in 0..10 {
        store.create(&ctx, &format!("/k{i}"), vec![], 0).await?;
    }
    let compaction = store.do_compact(&ctx).await?.unwrap();
    assert_eq!(compaction.to, 7);
    assert!(store.compact(&ctx, 100).await.is_err());

    // the horizon never moves backwards
    let again = store.do_compact(&ctx).await?.unwrap();
    assert_eq!(again.from, 7);
    assert!(again.to >= again.from);
    Ok(())
}

#[tokio::test]
async fn file_database_survives_reopen() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("state.db");
    let ctx = CancellationToken::new();

    let store = common::file_store(&path, &[]).await?;
    let created = store.create(&ctx, "/persist", b"1".to_vec(), 0).await?;
    assert!(store.db_size(&ctx).await? > 0);
    store.close().await;
    assert!(matches!(store.get(&ctx, "/persist", "", 0, 0).await, Err(StoreError::Closed)));
    drop(store);

    let store = common::file_store(&path, &[]).await?;
    assert_eq!(store.current_revision(&ctx).await?, created);
    let next = store.update(&ctx, "/persist", b"2".to_vec(), created, 0).await?;
    assert_eq!(next.revision, created + 1);
    Ok(())
}

#[tokio::test]
async fn the_store_is_usable_as_a_backend() -> anyhow::Result<()> {
    let store = common::memory_store(&[]).await?;
    let backend: Arc<dyn Backend> = store;
    let ctx = CancellationToken::new();

    let mut seen = HashSet::new();
    for key in ["/x/1", "/x/2", "/x/3"] {
        seen.insert(backend.create(&ctx, key, vec![], 0).await?);
    }
    assert_eq!(seen.len(), 3);
    assert_eq!(backend.count(&ctx, "/x/").await?.1, 3);
    backend.do_compact(&ctx).await?;
    backend.close().await;
    Ok(())
}
