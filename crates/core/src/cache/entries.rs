//! Cache entry rows.
//!
//! A cache entry is replaced, never duplicated: saving a (site, URI) deletes the
//! previous row and, through `ON DELETE CASCADE`, every dependency row it owned,
//! in the same transaction that writes the new entry and its dependencies.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use tokio_rusqlite::params;
use tokio_rusqlite::rusqlite::{self, OptionalExtension, types::Value};

use super::connection::CacheDb;
use super::{execute_in, int_values, select_ids_in};
use crate::Error;
use crate::model::{CacheEntry, DependencySet, SiteUri, TrackedFields, from_db_timestamp, to_db_timestamp};

type EntryRow = (i64, i64, String, String, Option<String>);

const ENTRY_COLUMNS: &str = "id, site_id, uri, created_at, expiry_date";

impl CacheDb {
    /// Replace the cache entry for `site_uri` and write its dependency set.
    ///
    /// Query and include dependencies whose rows no longer exist are skipped.
    pub async fn save_cache_entry(
        &self, site_uri: &SiteUri, deps: &DependencySet, created_at: DateTime<Utc>,
        expiry_date: Option<DateTime<Utc>>,
    ) -> Result<CacheEntry, Error> {
        let site_uri = site_uri.clone();
        let deps = deps.clone();
        let created = to_db_timestamp(created_at);
        let expires = expiry_date.map(to_db_timestamp);
        self.conn
            .call(move |conn| -> Result<CacheEntry, Error> {
                let tx = conn.transaction()?;
                tx.execute(
                    "DELETE FROM caches WHERE site_id = ?1 AND uri = ?2",
                    params![site_uri.site_id, &site_uri.uri],
                )?;
                tx.execute(
                    "INSERT INTO caches (site_id, uri, created_at, expiry_date) VALUES (?1, ?2, ?3, ?4)",
                    params![site_uri.site_id, &site_uri.uri, &created, &expires],
                )?;
                let cache_id = tx.last_insert_rowid();
                write_dependencies(&tx, cache_id, &deps)?;
                tx.commit()?;

                into_entry((cache_id, site_uri.site_id, site_uri.uri, created, expires))
            })
            .await
            .map_err(Error::from)
    }

    /// Get the live entry for a (site, URI).
    pub async fn cache_entry(&self, site_uri: &SiteUri) -> Result<Option<CacheEntry>, Error> {
        let site_uri = site_uri.clone();
        self.conn
            .call(move |conn| -> Result<Option<CacheEntry>, Error> {
                let row = conn
                    .query_row(
                        &format!("SELECT {ENTRY_COLUMNS} FROM caches WHERE site_id = ?1 AND uri = ?2"),
                        params![site_uri.site_id, &site_uri.uri],
                        read_entry_row,
                    )
                    .optional()?;
                row.map(into_entry).transpose()
            })
            .await
            .map_err(Error::from)
    }

    /// Load the entries for a set of cache ids; unknown ids are ignored.
    pub async fn cache_entries(&self, cache_ids: &BTreeSet<i64>) -> Result<Vec<CacheEntry>, Error> {
        let ids = int_values(cache_ids);
        self.conn
            .call(move |conn| -> Result<Vec<CacheEntry>, Error> { load_entries(conn, &ids) })
            .await
            .map_err(Error::from)
    }

    /// Read back the dependency set stored for a cache entry.
    pub async fn cache_dependencies(&self, cache_id: i64) -> Result<DependencySet, Error> {
        self.conn
            .call(move |conn| -> Result<DependencySet, Error> {
                let mut deps = DependencySet::default();

                let mut stmt =
                    conn.prepare("SELECT element_id, track_all_fields FROM element_caches WHERE cache_id = ?1")?;
                let rows = stmt.query_map([cache_id], |row| Ok((row.get::<_, i64>(0)?, row.get::<_, bool>(1)?)))?;
                for row in rows {
                    let (element_id, all) = row?;
                    let fields = if all { TrackedFields::All } else { TrackedFields::Only(BTreeSet::new()) };
                    deps.elements.insert(element_id, fields);
                }

                let mut stmt =
                    conn.prepare("SELECT element_id, field_id FROM element_field_caches WHERE cache_id = ?1")?;
                let rows = stmt.query_map([cache_id], |row| Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?)))?;
                let mut field_rows: BTreeMap<i64, BTreeSet<i64>> = BTreeMap::new();
                for row in rows {
                    let (element_id, field_id) = row?;
                    field_rows.entry(element_id).or_default().insert(field_id);
                }
                for (element_id, field_ids) in field_rows {
                    if let Some(TrackedFields::Only(fields)) = deps.elements.get_mut(&element_id) {
                        *fields = field_ids;
                    }
                }

                deps.query_ids =
                    collect_ids(conn, "SELECT query_id FROM element_query_caches WHERE cache_id = ?1", cache_id)?;
                deps.include_ids =
                    collect_ids(conn, "SELECT include_id FROM include_caches WHERE cache_id = ?1", cache_id)?;

                let mut stmt = conn.prepare("SELECT tag FROM cache_tags WHERE cache_id = ?1")?;
                let rows = stmt.query_map([cache_id], |row| row.get::<_, String>(0))?;
                for row in rows {
                    deps.tags.insert(row?);
                }

                Ok(deps)
            })
            .await
            .map_err(Error::from)
    }

    /// Cache ids for a site whose URI matches any pattern.
    ///
    /// A trailing `*` makes the pattern a prefix match; otherwise it must equal
    /// the stored URI. A leading `/` is ignored.
    pub async fn cache_ids_for_uris(&self, site_id: i64, patterns: &[String]) -> Result<BTreeSet<i64>, Error> {
        let patterns = patterns.to_vec();
        self.conn
            .call(move |conn| -> Result<BTreeSet<i64>, Error> {
                let mut found = BTreeSet::new();
                for pattern in &patterns {
                    let pattern = pattern.trim().trim_start_matches('/');
                    let (sql, value) = match pattern.strip_suffix('*') {
                        Some(prefix) => (
                            "SELECT id FROM caches WHERE site_id = ?1 AND uri LIKE ?2 ESCAPE '\\'",
                            format!("{}%", escape_like(prefix)),
                        ),
                        None => ("SELECT id FROM caches WHERE site_id = ?1 AND uri = ?2", pattern.to_string()),
                    };
                    let mut stmt = conn.prepare(sql)?;
                    let rows = stmt.query_map(params![site_id, value], |row| row.get::<_, i64>(0))?;
                    for row in rows {
                        found.insert(row?);
                    }
                }
                Ok(found)
            })
            .await
            .map_err(Error::from)
    }

    /// Cache ids whose expiry date is at or before `now`.
    pub async fn expired_cache_ids(&self, now: DateTime<Utc>) -> Result<BTreeSet<i64>, Error> {
        let now = to_db_timestamp(now);
        self.conn
            .call(move |conn| -> Result<BTreeSet<i64>, Error> {
                let mut stmt =
                    conn.prepare("SELECT id FROM caches WHERE expiry_date IS NOT NULL AND expiry_date <= ?1")?;
                let ids = stmt
                    .query_map([&now], |row| row.get::<_, i64>(0))?
                    .collect::<Result<BTreeSet<_>, _>>()?;
                Ok(ids)
            })
            .await
            .map_err(Error::from)
    }

    /// Earliest cache entry expiry strictly after `now`.
    pub async fn next_cache_expiry(&self, now: DateTime<Utc>) -> Result<Option<DateTime<Utc>>, Error> {
        let now = to_db_timestamp(now);
        self.conn
            .call(move |conn| -> Result<Option<DateTime<Utc>>, Error> {
                let next: Option<String> = conn.query_row(
                    "SELECT MIN(expiry_date) FROM caches WHERE expiry_date > ?1",
                    [&now],
                    |row| row.get(0),
                )?;
                next.as_deref().map(from_db_timestamp).transpose()
            })
            .await
            .map_err(Error::from)
    }

    pub async fn all_cache_ids(&self) -> Result<BTreeSet<i64>, Error> {
        self.conn
            .call(|conn| -> Result<BTreeSet<i64>, Error> {
                let mut stmt = conn.prepare("SELECT id FROM caches")?;
                let ids = stmt.query_map([], |row| row.get::<_, i64>(0))?.collect::<Result<BTreeSet<_>, _>>()?;
                Ok(ids)
            })
            .await
            .map_err(Error::from)
    }

    /// Delete every cache entry and its dependency rows.
    pub async fn delete_all_cache_entries(&self) -> Result<usize, Error> {
        self.conn
            .call(|conn| -> Result<usize, Error> { Ok(conn.execute("DELETE FROM caches", [])?) })
            .await
            .map_err(Error::from)
    }

    pub async fn count_cache_entries(&self) -> Result<i64, Error> {
        self.conn
            .call(|conn| -> Result<i64, Error> {
                Ok(conn.query_row("SELECT COUNT(*) FROM caches", [], |row| row.get(0))?)
            })
            .await
            .map_err(Error::from)
    }
}

fn write_dependencies(conn: &rusqlite::Connection, cache_id: i64, deps: &DependencySet) -> Result<(), Error> {
    let mut element_stmt =
        conn.prepare("INSERT INTO element_caches (cache_id, element_id, track_all_fields) VALUES (?1, ?2, ?3)")?;
    let mut field_stmt =
        conn.prepare("INSERT INTO element_field_caches (cache_id, element_id, field_id) VALUES (?1, ?2, ?3)")?;
    for (element_id, fields) in &deps.elements {
        match fields {
            TrackedFields::Only(field_ids) if !field_ids.is_empty() => {
                element_stmt.execute(params![cache_id, element_id, false])?;
                for field_id in field_ids {
                    field_stmt.execute(params![cache_id, element_id, field_id])?;
                }
            }
            // An empty field list would leave a narrowed dependency with nothing to match.
            _ => {
                element_stmt.execute(params![cache_id, element_id, true])?;
            }
        }
    }

    let mut stmt = conn.prepare(
        "INSERT OR IGNORE INTO element_query_caches (cache_id, query_id)
         SELECT ?1, id FROM element_queries WHERE id = ?2",
    )?;
    for query_id in &deps.query_ids {
        stmt.execute(params![cache_id, query_id])?;
    }

    let mut stmt = conn.prepare("INSERT OR IGNORE INTO cache_tags (cache_id, tag) VALUES (?1, ?2)")?;
    for tag in &deps.tags {
        stmt.execute(params![cache_id, tag])?;
    }

    let mut stmt = conn.prepare(
        "INSERT OR IGNORE INTO include_caches (cache_id, include_id)
         SELECT ?1, id FROM includes WHERE id = ?2",
    )?;
    for include_id in &deps.include_ids {
        stmt.execute(params![cache_id, include_id])?;
    }

    Ok(())
}

fn collect_ids(conn: &rusqlite::Connection, sql: &str, cache_id: i64) -> Result<BTreeSet<i64>, Error> {
    let mut stmt = conn.prepare(sql)?;
    let ids = stmt
        .query_map([cache_id], |row| row.get::<_, i64>(0))?
        .collect::<Result<BTreeSet<_>, _>>()?;
    Ok(ids)
}

fn read_entry_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<EntryRow> {
    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?))
}

fn into_entry((id, site_id, uri, created_at, expiry_date): EntryRow) -> Result<CacheEntry, Error> {
    Ok(CacheEntry {
        id,
        site_uri: SiteUri::new(site_id, uri),
        created_at: from_db_timestamp(&created_at)?,
        expiry_date: expiry_date.as_deref().map(from_db_timestamp).transpose()?,
    })
}

pub(crate) fn load_entries(conn: &rusqlite::Connection, ids: &[Value]) -> Result<Vec<CacheEntry>, Error> {
    let mut entries = Vec::with_capacity(ids.len());
    for chunk in ids.chunks(500) {
        let sql = format!(
            "SELECT {ENTRY_COLUMNS} FROM caches WHERE id IN ({}) ORDER BY id",
            super::placeholders(chunk.len())
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(rusqlite::params_from_iter(chunk.iter()), read_entry_row)?;
        for row in rows {
            entries.push(into_entry(row?)?);
        }
    }
    Ok(entries)
}

/// Delete entries by id, returning the rows that existed.
pub(crate) fn delete_entries(conn: &rusqlite::Connection, ids: &[Value]) -> Result<Vec<CacheEntry>, Error> {
    let entries = load_entries(conn, ids)?;
    execute_in(conn, "DELETE FROM caches WHERE id IN ({list})", &[], ids)?;
    Ok(entries)
}

/// Mark entries expired as of `now`, returning the updated rows.
pub(crate) fn expire_entries(
    conn: &rusqlite::Connection, ids: &[Value], now: &str,
) -> Result<Vec<CacheEntry>, Error> {
    let leading = [Value::Text(now.to_string())];
    execute_in(conn, "UPDATE caches SET expiry_date = ? WHERE id IN ({list})", &leading, ids)?;
    load_entries(conn, ids)
}

/// Existing cache ids among `ids`.
pub(crate) fn existing_ids(conn: &rusqlite::Connection, ids: &[Value]) -> Result<BTreeSet<i64>, Error> {
    select_ids_in(conn, "SELECT id FROM caches WHERE id IN ({list})", &[], ids)
}

fn escape_like(value: &str) -> String {
    value.replace('\\', "\\\\").replace('%', "\\%").replace('_', "\\_")
}

/// Make inserts of element dependencies on `element_id` abort.
#[cfg(test)]
pub(crate) async fn reject_element_rows(db: &CacheDb, element_id: i64) {
    db.conn
        .call(move |conn| {
            conn.execute_batch(&format!(
                "CREATE TRIGGER reject_element_{element_id} BEFORE INSERT ON element_caches
                 WHEN NEW.element_id = {element_id}
                 BEGIN SELECT RAISE(ABORT, 'element rejected'); END;"
            ))
        })
        .await
        .unwrap();
}

#[cfg(test)]
mod tests {
    use super::*;

    fn deps_with_element(element_id: i64) -> DependencySet {
        let mut deps = DependencySet::default();
        deps.elements.insert(element_id, TrackedFields::All);
        deps
    }

    #[tokio::test]
    async fn test_save_replaces_existing_entry() {
        let db = CacheDb::open_in_memory().await.unwrap();
        let uri = SiteUri::new(1, "page");

        let first = db.save_cache_entry(&uri, &deps_with_element(1), Utc::now(), None).await.unwrap();
        let second = db.save_cache_entry(&uri, &deps_with_element(2), Utc::now(), None).await.unwrap();

        assert_ne!(first.id, second.id);
        assert_eq!(db.count_cache_entries().await.unwrap(), 1);
        assert_eq!(db.cache_entry(&uri).await.unwrap().unwrap().id, second.id);

        assert!(db.cache_dependencies(first.id).await.unwrap().is_empty());
        let deps = db.cache_dependencies(second.id).await.unwrap();
        assert_eq!(deps.elements.keys().copied().collect::<Vec<_>>(), vec![2]);
    }

    #[tokio::test]
    async fn test_failed_save_rolls_back_everything() {
        let db = CacheDb::open_in_memory().await.unwrap();
        let uri = SiteUri::new(1, "page");
        let mut before = deps_with_element(1);
        before.tags.insert("old".to_string());
        let kept = db.save_cache_entry(&uri, &before, Utc::now(), None).await.unwrap();

        reject_element_rows(&db, 2).await;
        let mut after = deps_with_element(1);
        after.elements.insert(2, TrackedFields::All);
        after.tags.insert("new".to_string());
        assert!(db.save_cache_entry(&uri, &after, Utc::now(), None).await.is_err());

        assert_eq!(db.count_cache_entries().await.unwrap(), 1);
        assert_eq!(db.cache_entry(&uri).await.unwrap().unwrap().id, kept.id);
        assert_eq!(db.cache_dependencies(kept.id).await.unwrap(), before);
        assert!(db.cache_ids_for_tags(&BTreeSet::from(["new".to_string()])).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_field_dependencies_round_trip() {
        let db = CacheDb::open_in_memory().await.unwrap();
        let mut deps = DependencySet::default();
        deps.elements.insert(1, TrackedFields::Only(BTreeSet::from([10, 11])));
        deps.elements.insert(2, TrackedFields::Only(BTreeSet::new()));
        deps.tags.insert("nav".to_string());

        let entry = db.save_cache_entry(&SiteUri::new(1, "page"), &deps, Utc::now(), None).await.unwrap();
        let stored = db.cache_dependencies(entry.id).await.unwrap();

        assert_eq!(stored.elements[&1], TrackedFields::Only(BTreeSet::from([10, 11])));
        assert_eq!(stored.elements[&2], TrackedFields::All);
        assert_eq!(stored.tags, BTreeSet::from(["nav".to_string()]));
    }

    #[tokio::test]
    async fn test_missing_query_dependency_is_skipped() {
        let db = CacheDb::open_in_memory().await.unwrap();
        let mut deps = DependencySet::default();
        deps.query_ids.insert(999);

        let entry = db.save_cache_entry(&SiteUri::new(1, "page"), &deps, Utc::now(), None).await.unwrap();
        assert!(db.cache_dependencies(entry.id).await.unwrap().query_ids.is_empty());
    }

    #[tokio::test]
    async fn test_cache_ids_for_uris_with_wildcard() {
        let db = CacheDb::open_in_memory().await.unwrap();
        let deps = DependencySet::default();
        let blog = db.save_cache_entry(&SiteUri::new(1, "blog"), &deps, Utc::now(), None).await.unwrap();
        let post = db.save_cache_entry(&SiteUri::new(1, "blog/post"), &deps, Utc::now(), None).await.unwrap();
        db.save_cache_entry(&SiteUri::new(1, "about"), &deps, Utc::now(), None).await.unwrap();
        db.save_cache_entry(&SiteUri::new(2, "blog"), &deps, Utc::now(), None).await.unwrap();

        let exact = db.cache_ids_for_uris(1, &["/blog".to_string()]).await.unwrap();
        assert_eq!(exact, BTreeSet::from([blog.id]));

        let prefix = db.cache_ids_for_uris(1, &["blog*".to_string()]).await.unwrap();
        assert_eq!(prefix, BTreeSet::from([blog.id, post.id]));
    }

    #[tokio::test]
    async fn test_like_wildcards_are_escaped() {
        let db = CacheDb::open_in_memory().await.unwrap();
        let deps = DependencySet::default();
        db.save_cache_entry(&SiteUri::new(1, "a_b"), &deps, Utc::now(), None).await.unwrap();
        db.save_cache_entry(&SiteUri::new(1, "axb"), &deps, Utc::now(), None).await.unwrap();

        let found = db.cache_ids_for_uris(1, &["a_*".to_string()]).await.unwrap();
        assert_eq!(found.len(), 1);
    }

    #[tokio::test]
    async fn test_expired_cache_ids() {
        let db = CacheDb::open_in_memory().await.unwrap();
        let now = Utc::now();
        let deps = DependencySet::default();
        let stale = db
            .save_cache_entry(&SiteUri::new(1, "old"), &deps, now, Some(now - chrono::Duration::minutes(1)))
            .await
            .unwrap();
        db.save_cache_entry(&SiteUri::new(1, "fresh"), &deps, now, Some(now + chrono::Duration::hours(1)))
            .await
            .unwrap();

        assert_eq!(db.expired_cache_ids(now).await.unwrap(), BTreeSet::from([stale.id]));
        assert!(db.next_cache_expiry(now).await.unwrap().is_some());
    }
}
