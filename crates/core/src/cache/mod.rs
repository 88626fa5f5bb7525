//! SQLite-backed dependency index for cached pages.
//!
//! This module provides the persistent side of the cache using SQLite
//! with async access via tokio-rusqlite. It supports:
//!
//! - Cache entries keyed by (site, URI), replaced transactionally
//! - Element, field, query-signature, tag and include dependencies
//! - Resolution of changed elements and tags into cache ids
//! - Scheduled element expiry rows
//! - Automatic schema migrations and WAL mode for concurrent access

pub mod connection;
pub mod elements;
pub mod entries;
pub mod expiry;
pub mod hash;
pub mod includes;
pub mod migrations;
pub mod queries;
pub mod resolve;
pub mod tags;

pub use crate::Error;

pub use connection::CacheDb;
pub use expiry::ExpiryRow;
pub use includes::IncludeFragment;
pub use queries::StoredQuery;
pub use resolve::PurgeMode;

use std::collections::BTreeSet;

use tokio_rusqlite::rusqlite::{self, params_from_iter, types::Value};

/// Upper bound on bound parameters per `IN (...)` statement.
const MAX_IN_PARAMS: usize = 500;

/// `?,?,?` for an `IN (...)` list of `n` parameters.
pub(crate) fn placeholders(n: usize) -> String {
    vec!["?"; n].join(",")
}

pub(crate) fn int_values<'a>(ids: impl IntoIterator<Item = &'a i64>) -> Vec<Value> {
    ids.into_iter().map(|id| Value::Integer(*id)).collect()
}

pub(crate) fn text_values<'a>(values: impl IntoIterator<Item = &'a String>) -> Vec<Value> {
    values.into_iter().map(|v| Value::Text(v.clone())).collect()
}

/// Run `sql` over `list` in bounded chunks and collect the first column.
///
/// `sql` holds one `{list}` slot for the placeholders; `leading` binds the
/// positional parameters that come before it.
pub(crate) fn select_ids_in(
    conn: &rusqlite::Connection, sql: &str, leading: &[Value], list: &[Value],
) -> Result<BTreeSet<i64>, Error> {
    let mut found = BTreeSet::new();
    for chunk in list.chunks(MAX_IN_PARAMS) {
        let query = sql.replace("{list}", &placeholders(chunk.len()));
        let mut stmt = conn.prepare(&query)?;
        let values = leading.iter().chain(chunk.iter());
        let rows = stmt.query_map(params_from_iter(values), |row| row.get::<_, i64>(0))?;
        for row in rows {
            found.insert(row?);
        }
    }
    Ok(found)
}

/// Run a statement over `list` in bounded chunks; returns affected rows.
pub(crate) fn execute_in(
    conn: &rusqlite::Connection, sql: &str, leading: &[Value], list: &[Value],
) -> Result<usize, Error> {
    let mut affected = 0;
    for chunk in list.chunks(MAX_IN_PARAMS) {
        let query = sql.replace("{list}", &placeholders(chunk.len()));
        affected += conn.execute(&query, params_from_iter(leading.iter().chain(chunk.iter())))?;
    }
    Ok(affected)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_placeholders() {
        assert_eq!(placeholders(1), "?");
        assert_eq!(placeholders(3), "?,?,?");
    }

    #[tokio::test]
    async fn test_select_ids_in_chunks() {
        let db = CacheDb::open_in_memory().await.unwrap();
        let found = db
            .conn
            .call(|conn| -> Result<BTreeSet<i64>, Error> {
                conn.execute_batch("CREATE TABLE nums (n INTEGER NOT NULL)")?;
                for n in 1..=1200_i64 {
                    conn.execute("INSERT INTO nums (n) VALUES (?1)", [n])?;
                }
                let wanted: Vec<i64> = (1..=1200).filter(|n| n % 2 == 0).collect();
                let sql = "SELECT n FROM nums WHERE n > ? AND n IN ({list})";
                select_ids_in(conn, sql, &[Value::Integer(100)], &int_values(&wanted))
            })
            .await
            .unwrap();
        assert_eq!(found.len(), 550);
        assert_eq!(found.first(), Some(&102));
    }
}
