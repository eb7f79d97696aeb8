//! Conversions between executor values and rusqlite values

use kine_core::SqlValue;
use rusqlite::types::{ToSql, ToSqlOutput, ValueRef};

use crate::error::SqliteError;

/// Binds a [`SqlValue`] as a statement parameter without copying it.
pub struct SqliteValue<'a>(pub &'a SqlValue);

impl ToSql for SqliteValue<'_> {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::Borrowed(match self.0 {
            SqlValue::Null => ValueRef::Null,
            SqlValue::Integer(i) => ValueRef::Integer(*i),
            SqlValue::Text(s) => ValueRef::Text(s.as_bytes()),
            SqlValue::Blob(b) => ValueRef::Blob(b),
        }))
    }
}

/// Reads a result column. The kine table stores no REAL values, so one is a malformed row.
pub fn from_sql(value: ValueRef<'_>) -> Result<SqlValue, SqliteError> {
    Ok(match value {
        ValueRef::Null => SqlValue::Null,
        ValueRef::Integer(i) => SqlValue::Integer(i),
        ValueRef::Real(f) => return Err(SqliteError::MalformedRow(format!("unexpected REAL value {f}"))),
        ValueRef::Text(t) => SqlValue::Text(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(b) => SqlValue::Blob(b.to_vec()),
    })
}
