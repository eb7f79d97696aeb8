//! Dialect-agnostic statements against the single `kine` table.
//!
//! Every statement goes through [`Executor::retry`]: transient engine errors are re-issued after
//! a short sleep until the dialect's attempt budget runs out, while constraint violations are
//! translated into [`StoreError::KeyExists`] and returned at once.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::{Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::driver::{Dialect, Driver, Executed, Row, SqlValue};
use crate::error::{DriverError, StoreError};
use crate::types::{KeyRange, LogRow, NewRow, COMPACT_REV_KEY};

/// Decides whether a failed statement may be re-issued.
pub type RetryPredicate = Arc<dyn Fn(&DriverError) -> bool + Send + Sync>;

const COLUMNS: &str = "kv.id, kv.name, kv.created, kv.deleted, kv.create_revision, kv.prev_revision, kv.lease, kv.value, kv.old_value";

/// SQL text, rendered once per executor.
struct Statements {
    current_revision: String,
    compact_revision: String,
    latest: String,
    list_exact: String,
    list_range: String,
    count_exact: String,
    count_range: String,
    after: String,
    after_exact: String,
    after_range: String,
    insert: String,
    compact_superseded: String,
    compact_tombstones: String,
    compact_rev_insert: String,
    compact_rev_update: String,
}

impl Statements {
    fn new() -> Self {
        // `?2 IS NULL` turns an unbounded range end into "no upper bound".
        let range = "mkv.name >= ?1 AND (?2 IS NULL OR mkv.name < ?2)";
        let exact = "mkv.name = ?1";
        let list = |filter: &str| {
            format!(
                r#"SELECT {COLUMNS} FROM kine AS kv
                JOIN (SELECT MAX(mkv.id) AS id FROM kine AS mkv
                      WHERE {filter} AND mkv.name <> '{COMPACT_REV_KEY}' AND mkv.id <= ?3
                      GROUP BY mkv.name) AS maxkv ON maxkv.id = kv.id
                WHERE kv.deleted = 0
                ORDER BY kv.name ASC
                LIMIT ?4"#
            )
        };
        let count = |filter: &str| {
            format!(
                r#"SELECT COUNT(kv.id) FROM kine AS kv
                JOIN (SELECT MAX(mkv.id) AS id FROM kine AS mkv
                      WHERE {filter} AND mkv.name <> '{COMPACT_REV_KEY}' AND mkv.id <= ?3
                      GROUP BY mkv.name) AS maxkv ON maxkv.id = kv.id
                WHERE kv.deleted = 0"#
            )
        };
        let after = |filter: &str| {
            format!(
                r#"SELECT {COLUMNS} FROM kine AS kv
                WHERE {filter} AND kv.name <> '{COMPACT_REV_KEY}' AND kv.id > ?3
                ORDER BY kv.id ASC
                LIMIT ?4"#
            )
        };

        Self {
            current_revision: "SELECT MAX(rkv.id) FROM kine AS rkv".to_owned(),
            compact_revision: format!("SELECT prev_revision FROM kine WHERE name = '{COMPACT_REV_KEY}' ORDER BY id DESC LIMIT 1"),
            latest: format!("SELECT {COLUMNS} FROM kine AS kv WHERE kv.name = ?1 ORDER BY kv.id DESC LIMIT 1"),
            list_exact: list(exact),
            list_range: list(range),
            count_exact: count(exact),
            count_range: count(range),
            after: format!("SELECT {COLUMNS} FROM kine AS kv WHERE kv.id > ?1 ORDER BY kv.id ASC LIMIT ?2"),
            after_exact: after(&exact.replace("mkv.", "kv.")),
            after_range: after(&range.replace("mkv.", "kv.")),
            insert: "INSERT INTO kine(name, created, deleted, create_revision, prev_revision, lease, value, old_value)
                     VALUES(?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)"
                .to_owned(),
            // Every superseded row is the prev_revision of the row that replaced it.
            compact_superseded: format!(
                r#"DELETE FROM kine WHERE id IN (
                    SELECT kp.prev_revision FROM kine AS kp
                    WHERE kp.name <> '{COMPACT_REV_KEY}' AND kp.prev_revision <> 0 AND kp.id > ?1 AND kp.id <= ?2)"#
            ),
            // The newest row carries the current revision and is kept even when it is a tombstone.
            compact_tombstones: format!(
                r#"DELETE FROM kine WHERE deleted <> 0 AND id > ?1 AND id <= ?2 AND name <> '{COMPACT_REV_KEY}'
                AND id <> (SELECT MAX(rkv.id) FROM kine AS rkv)"#
            ),
            compact_rev_insert: format!(
                r#"INSERT INTO kine(name, created, deleted, create_revision, prev_revision, lease, value, old_value)
                SELECT '{COMPACT_REV_KEY}', 0, 0, 0, ?1, 0, NULL, NULL
                WHERE NOT EXISTS (SELECT 1 FROM kine WHERE name = '{COMPACT_REV_KEY}')"#
            ),
            compact_rev_update: format!("UPDATE kine SET prev_revision = ?1 WHERE name = '{COMPACT_REV_KEY}'"),
        }
    }

    fn list(&self, range: &KeyRange) -> &str {
        match range {
            KeyRange::Exact(_) => &self.list_exact,
            KeyRange::Range { .. } => &self.list_range,
        }
    }

    fn count(&self, range: &KeyRange) -> &str {
        match range {
            KeyRange::Exact(_) => &self.count_exact,
            KeyRange::Range { .. } => &self.count_range,
        }
    }

    fn after(&self, range: &KeyRange) -> &str {
        match range {
            KeyRange::Exact(_) => &self.after_exact,
            KeyRange::Range { .. } => &self.after_range,
        }
    }
}

fn range_params(range: &KeyRange) -> Vec<SqlValue> {
    match range {
        KeyRange::Exact(key) => vec![key.as_str().into(), SqlValue::Null],
        KeyRange::Range { start, end } => vec![start.as_str().into(), end.clone().into()],
    }
}

/// SQLite treats a negative LIMIT as "no limit".
fn limit_param(limit: i64) -> SqlValue { SqlValue::Integer(if limit > 0 { limit } else { -1 }) }

pub struct Executor {
    driver: Arc<dyn Driver>,
    statements: Statements,
    should_retry: RetryPredicate,
    write_lock: Option<Mutex<()>>,
}

impl Executor {
    pub fn new(driver: Arc<dyn Driver>) -> Self {
        let write_lock = if driver.dialect().lock_writes { Some(Mutex::new(())) } else { None };
        Self { driver, statements: Statements::new(), should_retry: Arc::new(DriverError::is_transient), write_lock }
    }

    /// Replace the retry predicate (defaults to [`DriverError::is_transient`]).
    pub fn with_retry_predicate(mut self, predicate: RetryPredicate) -> Self {
        self.should_retry = predicate;
        self
    }

    pub fn dialect(&self) -> &Dialect { self.driver.dialect() }

    pub fn driver(&self) -> &Arc<dyn Driver> { &self.driver }

    /// Runs `op` until it succeeds, fails for good, the attempt budget is exhausted or `ctx` is
    /// cancelled. Cancellation is checked before every attempt and during the backoff sleep.
    pub async fn retry<T, F, Fut>(&self, ctx: &CancellationToken, statement: &'static str, mut op: F) -> Result<T, StoreError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, DriverError>>,
    {
        let policy = self.dialect().retry;
        let mut attempt = 1;
        loop {
            if ctx.is_cancelled() {
                return Err(StoreError::Cancelled);
            }
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) if attempt < policy.max_attempts && (self.should_retry)(&err) => {
                    debug!("{statement}: attempt {attempt} failed, retrying: {err}");
                    tokio::select! {
                        _ = ctx.cancelled() => return Err(StoreError::Cancelled),
                        _ = tokio::time::sleep(policy.delay(attempt)) => {}
                    }
                    attempt += 1;
                }
                Err(err) => return Err(self.translate_err(statement, attempt, err)),
            }
        }
    }

    /// Maps a final driver error to the error callers see.
    pub fn translate_err(&self, statement: &'static str, attempts: u32, err: DriverError) -> StoreError {
        match err {
            DriverError::Conflict(_) => {
                debug!("{statement}: {err}");
                StoreError::KeyExists
            }
            DriverError::Transient(_) => {
                error!(dialect = self.dialect().name, attempts, "{statement}: retries exhausted: {err}");
                StoreError::Driver(err)
            }
            DriverError::Fatal(_) => {
                error!(dialect = self.dialect().name, attempts, "{statement}: {err}");
                StoreError::Driver(err)
            }
        }
    }

    async fn query(&self, ctx: &CancellationToken, statement: &'static str, sql: &str, params: Vec<SqlValue>) -> Result<Vec<Row>, StoreError> {
        self.retry(ctx, statement, || self.driver.query(sql, params.clone())).await
    }

    async fn query_i64(&self, ctx: &CancellationToken, statement: &'static str, sql: &str, params: Vec<SqlValue>) -> Result<i64, StoreError> {
        let rows = self.query(ctx, statement, sql, params).await?;
        Ok(rows.into_iter().next().and_then(|row| row.into_iter().next()).and_then(|v| v.as_i64()).unwrap_or(0))
    }

    async fn query_rows(&self, ctx: &CancellationToken, statement: &'static str, sql: &str, params: Vec<SqlValue>) -> Result<Vec<LogRow>, StoreError> {
        self.query(ctx, statement, sql, params).await?.into_iter().map(decode_row).collect::<Result<_, _>>().map_err(StoreError::Driver)
    }

    pub async fn current_revision(&self, ctx: &CancellationToken) -> Result<i64, StoreError> {
        self.query_i64(ctx, "current_revision", &self.statements.current_revision, vec![]).await
    }

    pub async fn compact_revision(&self, ctx: &CancellationToken) -> Result<i64, StoreError> {
        self.query_i64(ctx, "compact_revision", &self.statements.compact_revision, vec![]).await
    }

    /// The newest row of `key`, tombstones included.
    pub async fn latest(&self, ctx: &CancellationToken, key: &str) -> Result<Option<LogRow>, StoreError> {
        let rows = self.query_rows(ctx, "latest", &self.statements.latest, vec![key.into()]).await?;
        Ok(rows.into_iter().next())
    }

    /// Live keys in `range` as of `revision`, ordered by key.
    pub async fn list(&self, ctx: &CancellationToken, range: &KeyRange, revision: i64, limit: i64) -> Result<Vec<LogRow>, StoreError> {
        let mut params = range_params(range);
        params.push(revision.into());
        params.push(limit_param(limit));
        self.query_rows(ctx, "list", self.statements.list(range), params).await
    }

    pub async fn count(&self, ctx: &CancellationToken, range: &KeyRange, revision: i64) -> Result<i64, StoreError> {
        let mut params = range_params(range);
        params.push(revision.into());
        self.query_i64(ctx, "count", self.statements.count(range), params).await
    }

    /// Every row with `id > revision`, metadata included, in commit order.
    pub async fn after(&self, ctx: &CancellationToken, revision: i64, limit: i64) -> Result<Vec<LogRow>, StoreError> {
        self.query_rows(ctx, "after", &self.statements.after, vec![revision.into(), limit_param(limit)]).await
    }

    /// Rows in `range` with `id > revision`, in commit order.
    pub async fn after_in(&self, ctx: &CancellationToken, range: &KeyRange, revision: i64, limit: i64) -> Result<Vec<LogRow>, StoreError> {
        let mut params = range_params(range);
        params.push(revision.into());
        params.push(limit_param(limit));
        self.query_rows(ctx, "after_in", self.statements.after(range), params).await
    }

    /// Appends a row and returns its revision. A lost race on `(prev_revision, name)` comes back
    /// as [`StoreError::KeyExists`] without being retried.
    pub async fn insert(&self, ctx: &CancellationToken, row: NewRow) -> Result<i64, StoreError> {
        let params: Vec<SqlValue> = vec![
            row.name.into(),
            row.created.into(),
            row.deleted.into(),
            row.create_revision.into(),
            row.prev_revision.into(),
            row.lease.into(),
            row.value.into(),
            row.old_value.into(),
        ];
        let (sql, params) = (&self.statements.insert, &params);
        let executed: Executed = self
            .retry(ctx, "insert", || async move {
                let _guard = self.lock_writes().await;
                self.driver.execute(sql, params.clone()).await
            })
            .await?;
        Ok(executed.last_insert_id)
    }

    /// Removes history in `(start, end]` and records `end` as the new compaction horizon, all in
    /// one transaction. Returns the number of rows deleted.
    pub async fn compact(&self, ctx: &CancellationToken, start: i64, end: i64) -> Result<u64, StoreError> {
        let bounds = || vec![SqlValue::Integer(start), SqlValue::Integer(end)];
        // the horizon row is created before anything is deleted so it is already counted in MAX(id)
        let statements = vec![
            (self.statements.compact_rev_insert.clone(), vec![end.into()]),
            (self.statements.compact_superseded.clone(), bounds()),
            (self.statements.compact_tombstones.clone(), bounds()),
            (self.statements.compact_rev_update.clone(), vec![end.into()]),
        ];
        let statements = &statements;
        let results = self
            .retry(ctx, "compact", || async move {
                let _guard = self.lock_writes().await;
                self.driver.transaction(statements.clone()).await
            })
            .await?;
        Ok(results.iter().skip(1).take(2).map(|r| r.rows_affected).sum())
    }

    async fn lock_writes(&self) -> Option<MutexGuard<'_, ()>> {
        match &self.write_lock {
            Some(lock) => Some(lock.lock().await),
            None => None,
        }
    }

    pub async fn size(&self, ctx: &CancellationToken) -> Result<i64, StoreError> {
        let sql = self.dialect().size_sql;
        self.query_i64(ctx, "size", sql, vec![]).await
    }
}

fn decode_row(row: Row) -> Result<LogRow, DriverError> {
    let malformed = |column: &str| DriverError::fatal(format!("malformed kine row: bad {column} column"));
    let mut columns = row.into_iter();
    let mut next = |column: &'static str| columns.next().ok_or_else(|| malformed(column));

    Ok(LogRow {
        id: next("id")?.as_i64().ok_or_else(|| malformed("id"))?,
        name: next("name")?.into_string().ok_or_else(|| malformed("name"))?,
        created: next("created")?.as_i64().ok_or_else(|| malformed("created"))? != 0,
        deleted: next("deleted")?.as_i64().ok_or_else(|| malformed("deleted"))? != 0,
        create_revision: next("create_revision")?.as_i64().ok_or_else(|| malformed("create_revision"))?,
        prev_revision: next("prev_revision")?.as_i64().ok_or_else(|| malformed("prev_revision"))?,
        lease: next("lease")?.as_i64().ok_or_else(|| malformed("lease"))?,
        value: next("value")?.into_bytes().ok_or_else(|| malformed("value"))?,
        old_value: next("old_value")?.into_bytes().ok_or_else(|| malformed("old_value"))?,
    })
}
