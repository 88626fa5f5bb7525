//! Scheduled element visibility changes.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_rusqlite::params;
use tokio_rusqlite::rusqlite::{self, OptionalExtension};

use super::connection::CacheDb;
use crate::Error;
use crate::model::{from_db_timestamp, to_db_timestamp};

const ROW_COLUMNS: &str = "element_id, element_type, source_ids, post_date, expiry_date, next_at";

/// One element with pending visibility changes.
///
/// The element's own dates are kept so the row can move on to the next
/// instant after one fires.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExpiryRow {
    pub element_id: i64,
    pub element_type: String,
    pub source_ids: BTreeSet<i64>,
    pub post_date: Option<DateTime<Utc>>,
    pub expiry_date: Option<DateTime<Utc>>,
    /// Earliest instant not yet handled by a sweep.
    pub next_at: DateTime<Utc>,
}

impl ExpiryRow {
    /// Earliest of the element's dates strictly after `now`.
    pub fn next_after(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        [self.post_date, self.expiry_date].into_iter().flatten().filter(|date| *date > now).min()
    }
}

type RawRow = (i64, String, String, Option<String>, Option<String>, String);

fn read_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawRow> {
    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?, row.get(5)?))
}

fn into_row(raw: RawRow) -> Result<ExpiryRow, Error> {
    let (element_id, element_type, source_ids, post_date, expiry_date, next_at) = raw;
    let source_ids: BTreeSet<i64> = serde_json::from_str(&source_ids)
        .map_err(|e| Error::CorruptRow(format!("element {element_id} source ids: {e}")))?;
    Ok(ExpiryRow {
        element_id,
        element_type,
        source_ids,
        post_date: post_date.as_deref().map(from_db_timestamp).transpose()?,
        expiry_date: expiry_date.as_deref().map(from_db_timestamp).transpose()?,
        next_at: from_db_timestamp(&next_at)?,
    })
}

impl CacheDb {
    /// Insert or overwrite the schedule row for an element.
    pub async fn upsert_expiry(&self, row: &ExpiryRow) -> Result<(), Error> {
        let source_ids = serde_json::to_string(&row.source_ids)?;
        let row = row.clone();
        self.conn
            .call(move |conn| -> Result<(), Error> {
                conn.execute(
                    "INSERT INTO element_expiry_dates
                        (element_id, element_type, source_ids, post_date, expiry_date, next_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                     ON CONFLICT(element_id) DO UPDATE SET
                        element_type = excluded.element_type,
                        source_ids = excluded.source_ids,
                        post_date = excluded.post_date,
                        expiry_date = excluded.expiry_date,
                        next_at = excluded.next_at",
                    params![
                        row.element_id,
                        &row.element_type,
                        &source_ids,
                        row.post_date.map(to_db_timestamp),
                        row.expiry_date.map(to_db_timestamp),
                        to_db_timestamp(row.next_at)
                    ],
                )?;
                Ok(())
            })
            .await
            .map_err(Error::from)
    }

    pub async fn delete_expiry(&self, element_id: i64) -> Result<(), Error> {
        self.conn
            .call(move |conn| -> Result<(), Error> {
                conn.execute("DELETE FROM element_expiry_dates WHERE element_id = ?1", [element_id])?;
                Ok(())
            })
            .await
            .map_err(Error::from)
    }

    pub async fn expiry_for(&self, element_id: i64) -> Result<Option<ExpiryRow>, Error> {
        self.conn
            .call(move |conn| -> Result<Option<ExpiryRow>, Error> {
                let row = conn
                    .query_row(
                        &format!("SELECT {ROW_COLUMNS} FROM element_expiry_dates WHERE element_id = ?1"),
                        [element_id],
                        read_row,
                    )
                    .optional()?;
                row.map(into_row).transpose()
            })
            .await
            .map_err(Error::from)
    }

    /// Rows whose next instant is at or before `now`, earliest first.
    pub async fn due_expiries(&self, now: DateTime<Utc>) -> Result<Vec<ExpiryRow>, Error> {
        let now = to_db_timestamp(now);
        self.conn
            .call(move |conn| -> Result<Vec<ExpiryRow>, Error> {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {ROW_COLUMNS} FROM element_expiry_dates
                     WHERE next_at <= ?1 ORDER BY next_at, element_id"
                ))?;
                let raw = stmt.query_map([&now], read_row)?.collect::<Result<Vec<_>, _>>()?;
                raw.into_iter().map(into_row).collect()
            })
            .await
            .map_err(Error::from)
    }

    /// Move swept rows on to their next instant after `now`, deleting rows
    /// with none left. Returns the number of rows advanced or deleted.
    ///
    /// A row rescheduled to a later instant since it was read is kept as is.
    pub async fn advance_expiries(&self, rows: &[ExpiryRow], now: DateTime<Utc>) -> Result<usize, Error> {
        let steps: Vec<(i64, Option<String>)> =
            rows.iter().map(|row| (row.element_id, row.next_after(now).map(to_db_timestamp))).collect();
        let now = to_db_timestamp(now);
        self.conn
            .call(move |conn| -> Result<usize, Error> {
                let tx = conn.transaction()?;
                let mut changed = 0;
                {
                    let mut advance = tx.prepare(
                        "UPDATE element_expiry_dates SET next_at = ?3 WHERE element_id = ?1 AND next_at <= ?2",
                    )?;
                    let mut delete =
                        tx.prepare("DELETE FROM element_expiry_dates WHERE element_id = ?1 AND next_at <= ?2")?;
                    for (element_id, next_at) in &steps {
                        changed += match next_at {
                            Some(next_at) => advance.execute(params![element_id, &now, next_at])?,
                            None => delete.execute(params![element_id, &now])?,
                        };
                    }
                }
                tx.commit()?;
                Ok(changed)
            })
            .await
            .map_err(Error::from)
    }

    /// Earliest scheduled instant, if any row remains.
    pub async fn next_expiry_date(&self) -> Result<Option<DateTime<Utc>>, Error> {
        self.conn
            .call(|conn| -> Result<Option<DateTime<Utc>>, Error> {
                let next: Option<String> =
                    conn.query_row("SELECT MIN(next_at) FROM element_expiry_dates", [], |row| row.get(0))?;
                next.as_deref().map(from_db_timestamp).transpose()
            })
            .await
            .map_err(Error::from)
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, SubsecRound};

    use super::*;

    fn row(element_id: i64, next_at: DateTime<Utc>) -> ExpiryRow {
        ExpiryRow {
            element_id,
            element_type: "entry".to_string(),
            source_ids: BTreeSet::from([1]),
            post_date: None,
            expiry_date: Some(next_at),
            next_at,
        }
    }

    #[tokio::test]
    async fn test_upsert_keeps_one_row_per_element() {
        let db = CacheDb::open_in_memory().await.unwrap();
        let now = Utc::now();
        db.upsert_expiry(&row(1, now + Duration::days(2))).await.unwrap();
        db.upsert_expiry(&row(1, now + Duration::days(1))).await.unwrap();

        let stored = db.expiry_for(1).await.unwrap().unwrap();
        assert_eq!(stored.source_ids, BTreeSet::from([1]));
        assert!(stored.next_at < now + Duration::days(2));
    }

    #[tokio::test]
    async fn test_due_and_advance() {
        let db = CacheDb::open_in_memory().await.unwrap();
        let now = Utc::now();
        db.upsert_expiry(&row(1, now - Duration::minutes(5))).await.unwrap();
        db.upsert_expiry(&row(2, now + Duration::hours(1))).await.unwrap();

        let due = db.due_expiries(now).await.unwrap();
        assert_eq!(due.iter().map(|r| r.element_id).collect::<Vec<_>>(), vec![1]);

        assert_eq!(db.advance_expiries(&due, now).await.unwrap(), 1);
        assert!(db.expiry_for(1).await.unwrap().is_none());

        let next = db.next_expiry_date().await.unwrap().unwrap();
        assert!(next > now);
    }

    #[tokio::test]
    async fn test_advance_moves_to_later_date() {
        let db = CacheDb::open_in_memory().await.unwrap();
        let now = Utc::now().trunc_subsecs(6);
        let publish = now - Duration::minutes(1);
        let expire = now + Duration::hours(4);
        let scheduled = ExpiryRow { post_date: Some(publish), expiry_date: Some(expire), ..row(1, publish) };
        db.upsert_expiry(&scheduled).await.unwrap();

        let due = db.due_expiries(now).await.unwrap();
        assert_eq!(db.advance_expiries(&due, now).await.unwrap(), 1);

        let stored = db.expiry_for(1).await.unwrap().unwrap();
        assert_eq!(stored.next_at, expire);
        assert_eq!(stored.post_date, Some(publish));
        assert!(db.due_expiries(now).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_advance_keeps_rescheduled_rows() {
        let db = CacheDb::open_in_memory().await.unwrap();
        let now = Utc::now();
        let stale = row(1, now - Duration::minutes(1));
        db.upsert_expiry(&row(1, now + Duration::hours(1))).await.unwrap();

        assert_eq!(db.advance_expiries(&[stale], now).await.unwrap(), 0);
        assert!(db.expiry_for(1).await.unwrap().is_some());
    }
}
