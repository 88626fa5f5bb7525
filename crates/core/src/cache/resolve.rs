//! Resolution of a refresh batch into cache ids, and the purge that follows.
//!
//! Resolution and purge run inside one transaction on the connection thread,
//! so a render saving the same entry cannot interleave between them.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_rusqlite::rusqlite;

use super::connection::CacheDb;
use super::elements::element_cache_ids;
use super::entries::{delete_entries, existing_ids, expire_entries};
use super::int_values;
use super::queries::query_cache_ids;
use super::tags::tag_cache_ids;
use crate::Error;
use crate::model::{CacheEntry, to_db_timestamp};
use crate::refresh::RefreshBatch;

/// What happens to resolved cache entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PurgeMode {
    /// Delete entries and their stored output.
    Clear,
    /// Mark entries expired; stored output stays until regenerated.
    Expire,
}

/// Union of cache ids reachable from the batch.
pub(crate) fn resolve_batch(
    conn: &rusqlite::Connection, batch: &RefreshBatch, source_tags: &BTreeSet<String>,
) -> Result<BTreeSet<i64>, Error> {
    let mut found = existing_ids(conn, &int_values(&batch.cache_ids))?;

    for (element_type, type_batch) in &batch.elements {
        found.extend(element_cache_ids(conn, &type_batch.element_ids, &type_batch.field_changes)?);
        let via_queries = query_cache_ids(conn, element_type, &type_batch.source_ids, &found)?;
        found.extend(via_queries);
    }

    let tags: BTreeSet<String> = batch.tags.union(source_tags).cloned().collect();
    found.extend(tag_cache_ids(conn, &tags)?);

    Ok(found)
}

impl CacheDb {
    /// Resolve a batch without purging.
    pub async fn resolve(&self, batch: &RefreshBatch, source_tags: &BTreeSet<String>) -> Result<BTreeSet<i64>, Error> {
        let batch = batch.clone();
        let source_tags = source_tags.clone();
        self.conn
            .call(move |conn| -> Result<BTreeSet<i64>, Error> { resolve_batch(conn, &batch, &source_tags) })
            .await
            .map_err(Error::from)
    }

    /// Resolve a batch and purge the matched entries in one transaction.
    ///
    /// Returns the affected entries. Entries already gone are skipped, so a
    /// retried batch purges nothing twice.
    pub async fn claim(
        &self, batch: &RefreshBatch, source_tags: &BTreeSet<String>, mode: PurgeMode, now: DateTime<Utc>,
    ) -> Result<Vec<CacheEntry>, Error> {
        let batch = batch.clone();
        let source_tags = source_tags.clone();
        let now = to_db_timestamp(now);
        self.conn
            .call(move |conn| -> Result<Vec<CacheEntry>, Error> {
                let tx = conn.transaction()?;
                let cache_ids = resolve_batch(&tx, &batch, &source_tags)?;
                let ids = int_values(&cache_ids);
                let entries = match mode {
                    PurgeMode::Clear => delete_entries(&tx, &ids)?,
                    PurgeMode::Expire => expire_entries(&tx, &ids, &now)?,
                };
                tx.commit()?;
                Ok(entries)
            })
            .await
            .map_err(Error::from)
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;
    use crate::model::{DependencySet, SiteUri, TrackedFields};
    use crate::registry::ElementTypeRegistry;
    use crate::signature::{ElementQuery, SignatureCodec};

    async fn page(db: &CacheDb, uri: &str, deps: &DependencySet) -> i64 {
        db.save_cache_entry(&SiteUri::new(1, uri), deps, Utc::now(), None).await.unwrap().id
    }

    fn element_deps(element_id: i64) -> DependencySet {
        let mut deps = DependencySet::default();
        deps.elements.insert(element_id, TrackedFields::All);
        deps
    }

    fn entry_batch(element_ids: &[i64], source_ids: &[i64]) -> RefreshBatch {
        let mut batch = RefreshBatch::default();
        let type_batch = batch.elements.entry("entry".to_string()).or_default();
        for id in element_ids {
            type_batch.add_whole(*id);
        }
        type_batch.source_ids.extend(source_ids.iter().copied());
        batch
    }

    #[tokio::test]
    async fn test_resolve_direct_element() {
        let db = CacheDb::open_in_memory().await.unwrap();
        let cache_id = page(&db, "page", &element_deps(1)).await;

        let hit = db.resolve(&entry_batch(&[1], &[]), &BTreeSet::new()).await.unwrap();
        assert_eq!(hit, BTreeSet::from([cache_id]));

        let miss = db.resolve(&entry_batch(&[2], &[]), &BTreeSet::new()).await.unwrap();
        assert!(miss.is_empty());
    }

    #[tokio::test]
    async fn test_resolve_query_sources() {
        let db = CacheDb::open_in_memory().await.unwrap();
        let registry = ElementTypeRegistry::with_defaults();
        let codec = SignatureCodec::new(&registry);

        let scoped = codec.encode(&ElementQuery::new("entry").param("sectionId", 1)).unwrap();
        let mut deps = DependencySet::default();
        deps.query_ids.insert(db.save_query_signature(&scoped).await.unwrap());
        let news = page(&db, "news", &deps).await;

        let hit = db.resolve(&entry_batch(&[9], &[1]), &BTreeSet::new()).await.unwrap();
        assert_eq!(hit, BTreeSet::from([news]));

        let miss = db.resolve(&entry_batch(&[9], &[2]), &BTreeSet::new()).await.unwrap();
        assert!(miss.is_empty());
    }

    #[tokio::test]
    async fn test_resolve_source_tags() {
        let db = CacheDb::open_in_memory().await.unwrap();
        let mut deps = DependencySet::default();
        deps.tags.insert("sectionId:1".to_string());
        let cache_id = page(&db, "listing", &deps).await;

        let batch = entry_batch(&[], &[1]);
        let source_tags = batch.source_tags(&ElementTypeRegistry::with_defaults());
        assert_eq!(db.resolve(&batch, &source_tags).await.unwrap(), BTreeSet::from([cache_id]));
    }

    #[tokio::test]
    async fn test_claim_clear_is_idempotent() {
        let db = CacheDb::open_in_memory().await.unwrap();
        let cache_id = page(&db, "page", &element_deps(1)).await;
        let batch = entry_batch(&[1], &[]);

        let first = db.claim(&batch, &BTreeSet::new(), PurgeMode::Clear, Utc::now()).await.unwrap();
        assert_eq!(first.iter().map(|e| e.id).collect::<Vec<_>>(), vec![cache_id]);

        let second = db.claim(&batch, &BTreeSet::new(), PurgeMode::Clear, Utc::now()).await.unwrap();
        assert!(second.is_empty());
        assert_eq!(db.count_cache_entries().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_claim_expire_keeps_rows() {
        let db = CacheDb::open_in_memory().await.unwrap();
        page(&db, "page", &element_deps(1)).await;
        let now = Utc::now();

        let expired = db.claim(&entry_batch(&[1], &[]), &BTreeSet::new(), PurgeMode::Expire, now).await.unwrap();
        assert_eq!(expired.len(), 1);
        assert!(expired[0].expiry_date.is_some());

        assert_eq!(db.count_cache_entries().await.unwrap(), 1);
        assert_eq!(db.expired_cache_ids(now + Duration::seconds(1)).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_explicit_cache_ids_skip_missing_rows() {
        let db = CacheDb::open_in_memory().await.unwrap();
        let cache_id = page(&db, "page", &DependencySet::default()).await;
        let mut batch = RefreshBatch::default();
        batch.add_cache_ids([cache_id, cache_id + 50]);

        assert_eq!(db.resolve(&batch, &BTreeSet::new()).await.unwrap(), BTreeSet::from([cache_id]));
    }
}
