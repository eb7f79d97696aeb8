//! Error types for the SQLite drivers

use kine_core::DriverError;
use rusqlite::ErrorCode;
use thiserror::Error;

use crate::driver::Flavor;

#[derive(Debug, Error)]
pub enum SqliteError {
    #[error("SQLite error: {0}")]
    Rusqlite(#[from] rusqlite::Error),

    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Timed out waiting for a pooled connection")]
    PoolTimeout,

    #[error("Schema error: {0}")]
    Schema(String),

    #[error("Task join error: {0}")]
    TaskJoin(String),

    #[error("Malformed row: {0}")]
    MalformedRow(String),
}

impl From<bb8::RunError<SqliteError>> for SqliteError {
    fn from(err: bb8::RunError<SqliteError>) -> Self {
        match err {
            bb8::RunError::User(err) => err,
            bb8::RunError::TimedOut => SqliteError::PoolTimeout,
        }
    }
}

impl SqliteError {
    /// Sorts the error into the closed classification the executor works with.
    pub fn classify(self, flavor: Flavor) -> DriverError {
        if let SqliteError::Rusqlite(rusqlite::Error::SqliteFailure(err, _)) = &self {
            match err.code {
                ErrorCode::ConstraintViolation
                    if err.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
                        || err.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY =>
                {
                    return DriverError::conflict(self)
                }
                ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked => return DriverError::transient(self),
                _ => {}
            }
        }
        if matches!(self, SqliteError::PoolTimeout) {
            return DriverError::transient(self);
        }

        let message = self.to_string().to_ascii_lowercase();
        if flavor.transient_messages().iter().any(|pattern| message.contains(pattern)) {
            DriverError::transient(self)
        } else {
            DriverError::fatal(self)
        }
    }
}

#[cfg(test)]
mod tests {
    use rusqlite::ffi;

    use super::*;

    fn failure(code: i32, message: &str) -> SqliteError {
        SqliteError::Rusqlite(rusqlite::Error::SqliteFailure(ffi::Error::new(code), Some(message.to_owned())))
    }

    #[test]
    fn unique_violations_are_conflicts() {
        let err = failure(ffi::SQLITE_CONSTRAINT_UNIQUE, "UNIQUE constraint failed: kine.prev_revision, kine.name");
        assert!(err.classify(Flavor::Sqlite).is_conflict());
    }

    #[test]
    fn other_constraints_are_fatal() {
        let err = failure(ffi::SQLITE_CONSTRAINT_NOTNULL, "NOT NULL constraint failed: kine.name");
        assert!(matches!(err.classify(Flavor::Sqlite), DriverError::Fatal(_)));
    }

    #[test]
    fn busy_and_locked_are_transient() {
        assert!(failure(ffi::SQLITE_BUSY, "database is locked").classify(Flavor::Sqlite).is_transient());
        assert!(failure(ffi::SQLITE_LOCKED, "database table is locked").classify(Flavor::Sqlite).is_transient());
        assert!(SqliteError::PoolTimeout.classify(Flavor::Sqlite).is_transient());
    }

    #[test]
    fn nested_transactions_are_transient() {
        let err = failure(ffi::SQLITE_ERROR, "cannot start a transaction within a transaction");
        assert!(err.classify(Flavor::Sqlite).is_transient());
    }

    #[test]
    fn replication_errors_are_transient_only_for_dqlite() {
        let leadership = || failure(ffi::SQLITE_IOERR, "leadership lost");
        assert!(leadership().classify(Flavor::Dqlite).is_transient());
        assert!(matches!(leadership().classify(Flavor::Sqlite), DriverError::Fatal(_)));
        assert!(failure(ffi::SQLITE_ERROR, "checkpoint in progress").classify(Flavor::Dqlite).is_transient());
    }
}
