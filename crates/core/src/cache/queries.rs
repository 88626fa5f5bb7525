//! Query signature rows and their source ids.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use tokio_rusqlite::params;
use tokio_rusqlite::rusqlite::{self, types::Value};

use super::connection::CacheDb;
use super::int_values;
use crate::Error;
use crate::signature::{QuerySignature, WILDCARD_SOURCE};

/// A stored query signature.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredQuery {
    pub id: i64,
    pub element_type: String,
    pub params: String,
    pub source_ids: BTreeSet<i64>,
}

/// (query id, cache id) pairs for signatures of `element_type` matching `source_ids`.
///
/// Wildcard signatures always match; only signatures linked to a cache entry
/// are returned.
fn matching_pairs(
    conn: &rusqlite::Connection, element_type: &str, source_ids: &BTreeSet<i64>,
) -> Result<Vec<(i64, i64)>, Error> {
    let mut sources = source_ids.clone();
    sources.insert(WILDCARD_SOURCE);
    let sources = int_values(&sources);

    let mut pairs = Vec::new();
    for chunk in sources.chunks(500) {
        let sql = format!(
            "SELECT DISTINCT q.id, qc.cache_id
             FROM element_queries q
             JOIN element_query_sources s ON s.query_id = q.id
             JOIN element_query_caches qc ON qc.query_id = q.id
             WHERE q.element_type = ? AND s.source_id IN ({})",
            super::placeholders(chunk.len())
        );
        let mut stmt = conn.prepare(&sql)?;
        let values = std::iter::once(Value::Text(element_type.to_string())).chain(chunk.iter().cloned());
        let rows = stmt.query_map(rusqlite::params_from_iter(values), |row| {
            Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?))
        })?;
        for row in rows {
            pairs.push(row?);
        }
    }
    Ok(pairs)
}

/// Cache ids reachable through matching query signatures, minus `ignore_cache_ids`.
pub(crate) fn query_cache_ids(
    conn: &rusqlite::Connection, element_type: &str, source_ids: &BTreeSet<i64>, ignore_cache_ids: &BTreeSet<i64>,
) -> Result<BTreeSet<i64>, Error> {
    Ok(matching_pairs(conn, element_type, source_ids)?
        .into_iter()
        .map(|(_, cache_id)| cache_id)
        .filter(|cache_id| !ignore_cache_ids.contains(cache_id))
        .collect())
}

fn load_query(conn: &rusqlite::Connection, id: i64) -> Result<Option<StoredQuery>, Error> {
    let row = conn.query_row(
        "SELECT element_type, params FROM element_queries WHERE id = ?1",
        params![id],
        |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)),
    );
    let (element_type, query_params) = match row {
        Ok(row) => row,
        Err(rusqlite::Error::QueryReturnedNoRows) => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    let mut stmt = conn.prepare("SELECT source_id FROM element_query_sources WHERE query_id = ?1")?;
    let source_ids = stmt
        .query_map(params![id], |row| row.get::<_, i64>(0))?
        .collect::<Result<BTreeSet<_>, _>>()?;

    Ok(Some(StoredQuery { id, element_type, params: query_params, source_ids }))
}

impl CacheDb {
    /// Lookup-or-insert a signature and its source rows; returns the signature id.
    ///
    /// Recording the same signature again never duplicates rows.
    pub async fn save_query_signature(&self, signature: &QuerySignature) -> Result<i64, Error> {
        let signature = signature.clone();
        self.conn
            .call(move |conn| -> Result<i64, Error> {
                let tx = conn.transaction()?;
                tx.execute(
                    "INSERT INTO element_queries (index_hash, element_type, params) VALUES (?1, ?2, ?3)
                     ON CONFLICT(index_hash) DO NOTHING",
                    params![&signature.index, &signature.element_type, &signature.params],
                )?;
                let id: i64 = tx.query_row(
                    "SELECT id FROM element_queries WHERE index_hash = ?1",
                    params![&signature.index],
                    |row| row.get(0),
                )?;
                {
                    let mut stmt = tx.prepare(
                        "INSERT OR IGNORE INTO element_query_sources (query_id, source_id) VALUES (?1, ?2)",
                    )?;
                    for source_id in &signature.source_ids {
                        stmt.execute(params![id, source_id])?;
                    }
                }
                tx.commit()?;
                Ok(id)
            })
            .await
            .map_err(Error::from)
    }

    /// Get a stored signature by id.
    pub async fn query_signature(&self, id: i64) -> Result<Option<StoredQuery>, Error> {
        self.conn
            .call(move |conn| -> Result<Option<StoredQuery>, Error> { load_query(conn, id) })
            .await
            .map_err(Error::from)
    }

    /// Signatures of `element_type` that a change to elements in `source_ids`
    /// affects, excluding those only linked to `ignore_cache_ids`.
    ///
    /// Signatures not linked to any cache entry are never returned.
    pub async fn element_type_queries(
        &self, element_type: &str, source_ids: &BTreeSet<i64>, ignore_cache_ids: &BTreeSet<i64>,
    ) -> Result<Vec<StoredQuery>, Error> {
        let element_type = element_type.to_string();
        let source_ids = source_ids.clone();
        let ignore_cache_ids = ignore_cache_ids.clone();
        self.conn
            .call(move |conn| -> Result<Vec<StoredQuery>, Error> {
                let query_ids: BTreeSet<i64> = matching_pairs(conn, &element_type, &source_ids)?
                    .into_iter()
                    .filter(|(_, cache_id)| !ignore_cache_ids.contains(cache_id))
                    .map(|(query_id, _)| query_id)
                    .collect();

                let mut queries = Vec::with_capacity(query_ids.len());
                for id in query_ids {
                    if let Some(query) = load_query(conn, id)? {
                        queries.push(query);
                    }
                }
                Ok(queries)
            })
            .await
            .map_err(Error::from)
    }

    /// Delete signatures no cache entry references any more.
    pub async fn prune_orphan_queries(&self) -> Result<usize, Error> {
        self.conn
            .call(|conn| -> Result<usize, Error> {
                Ok(conn.execute(
                    "DELETE FROM element_queries WHERE id NOT IN (SELECT query_id FROM element_query_caches)",
                    [],
                )?)
            })
            .await
            .map_err(Error::from)
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use serde_json::json;

    use super::*;
    use crate::model::{DependencySet, SiteUri};
    use crate::registry::ElementTypeRegistry;
    use crate::signature::{ElementQuery, SignatureCodec};

    async fn save_page_with_query(db: &CacheDb, uri: &str, query: &ElementQuery) -> (i64, i64) {
        let registry = ElementTypeRegistry::with_defaults();
        let signature = SignatureCodec::new(&registry).encode(query).unwrap();
        let query_id = db.save_query_signature(&signature).await.unwrap();
        let mut deps = DependencySet::default();
        deps.query_ids.insert(query_id);
        let entry = db.save_cache_entry(&SiteUri::new(1, uri), &deps, Utc::now(), None).await.unwrap();
        (query_id, entry.id)
    }

    #[tokio::test]
    async fn test_signature_lookup_or_insert() {
        let db = CacheDb::open_in_memory().await.unwrap();
        let registry = ElementTypeRegistry::with_defaults();
        let codec = SignatureCodec::new(&registry);

        let a = codec.encode(&ElementQuery::new("entry").param("sectionId", 1)).unwrap();
        let b = codec.encode(&ElementQuery::new("entry").param("sectionId", json!(["1"]))).unwrap();
        let first = db.save_query_signature(&a).await.unwrap();
        let second = db.save_query_signature(&b).await.unwrap();
        assert_eq!(first, second);

        let stored = db.query_signature(first).await.unwrap().unwrap();
        assert_eq!(stored.source_ids, BTreeSet::from([1]));

        let count: i64 = db
            .conn
            .call(|conn| conn.query_row("SELECT COUNT(*) FROM element_query_sources", [], |row| row.get(0)))
            .await
            .unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn test_element_type_queries_match_sources_and_wildcards() {
        let db = CacheDb::open_in_memory().await.unwrap();
        let (scoped, _) = save_page_with_query(&db, "news", &ElementQuery::new("entry").param("sectionId", 1)).await;
        let (wildcard, _) = save_page_with_query(&db, "all", &ElementQuery::new("entry")).await;
        save_page_with_query(&db, "other", &ElementQuery::new("entry").param("sectionId", 2)).await;
        save_page_with_query(&db, "cats", &ElementQuery::new("category")).await;

        let ids: Vec<i64> = db
            .element_type_queries("entry", &BTreeSet::from([1]), &BTreeSet::new())
            .await
            .unwrap()
            .into_iter()
            .map(|q| q.id)
            .collect();
        assert_eq!(ids.len(), 2);
        assert!(ids.contains(&scoped) && ids.contains(&wildcard));
    }

    #[tokio::test]
    async fn test_element_type_queries_skip_ignored_and_orphans() {
        let db = CacheDb::open_in_memory().await.unwrap();
        let (_, cache_id) = save_page_with_query(&db, "all", &ElementQuery::new("entry")).await;

        let ignored = db
            .element_type_queries("entry", &BTreeSet::new(), &BTreeSet::from([cache_id]))
            .await
            .unwrap();
        assert!(ignored.is_empty());

        db.delete_all_cache_entries().await.unwrap();
        let orphaned = db.element_type_queries("entry", &BTreeSet::new(), &BTreeSet::new()).await.unwrap();
        assert!(orphaned.is_empty());
        assert_eq!(db.prune_orphan_queries().await.unwrap(), 1);
    }
}
