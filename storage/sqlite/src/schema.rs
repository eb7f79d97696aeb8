//! The `kine` table and its migrations, versioned through `PRAGMA user_version`.
//!
//! | version | layout |
//! |---|---|
//! | 0 | empty database, or a table created before versioning |
//! | 1 | table and lookup indexes, no uniqueness on `(prev_revision, name)` |
//! | 2 | current: adds `kine_name_prev_revision_uindex` |

use rusqlite::{Connection, TransactionBehavior};
use tracing::{debug, info, warn};

use crate::error::SqliteError;

pub const SCHEMA_VERSION: i64 = 2;

const CREATE_TABLE: &str = "CREATE TABLE IF NOT EXISTS kine (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL,
    created INTEGER,
    deleted INTEGER,
    create_revision INTEGER,
    prev_revision INTEGER,
    lease INTEGER,
    value BLOB,
    old_value BLOB
)";

const LOOKUP_INDEXES: [&str; 2] = [
    "CREATE INDEX IF NOT EXISTS kine_name_index ON kine (name, id)",
    "CREATE INDEX IF NOT EXISTS kine_id_deleted_index ON kine (id, deleted)",
];

const UNIQUE_INDEX: &str = "CREATE UNIQUE INDEX IF NOT EXISTS kine_name_prev_revision_uindex ON kine (prev_revision, name)";

/// Legacy tables could hold several rows chained from the same predecessor; the newest wins.
const DEDUPLICATE: &str = "DELETE FROM kine WHERE id NOT IN (SELECT MAX(id) FROM kine GROUP BY prev_revision, name)";

pub fn user_version(conn: &Connection) -> Result<i64, SqliteError> {
    Ok(conn.query_row("PRAGMA user_version", [], |row| row.get(0))?)
}

/// Brings the schema to [`SCHEMA_VERSION`] in one immediate transaction.
pub fn migrate(conn: &mut Connection) -> Result<(), SqliteError> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let version = user_version(&tx)?;
    if version > SCHEMA_VERSION {
        return Err(SqliteError::Schema(format!("database schema version {version} is newer than supported version {SCHEMA_VERSION}")));
    }
    if version == SCHEMA_VERSION {
        debug!("schema is at version {version}");
        return Ok(());
    }

    tx.execute_batch(CREATE_TABLE)?;
    for index in LOOKUP_INDEXES {
        tx.execute_batch(index)?;
    }
    let removed = tx.execute(DEDUPLICATE, [])?;
    if removed > 0 {
        warn!("removed {removed} duplicate rows before adding the unique revision index");
    }
    tx.execute_batch(UNIQUE_INDEX)?;
    tx.pragma_update(None, "user_version", SCHEMA_VERSION)?;
    tx.commit()?;

    info!("schema migrated from version {version} to {SCHEMA_VERSION}");
    Ok(())
}

/// Creates the version 1 layout. Only used to exercise upgrades.
pub fn create_legacy(conn: &Connection) -> Result<(), SqliteError> {
    conn.execute_batch(CREATE_TABLE)?;
    for index in LOOKUP_INDEXES {
        conn.execute_batch(index)?;
    }
    conn.pragma_update(None, "user_version", 1)?;
    Ok(())
}
