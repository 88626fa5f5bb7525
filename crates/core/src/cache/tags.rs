//! Tag index: tags to the cache entries that registered them.

use std::collections::BTreeSet;

use tokio_rusqlite::rusqlite;

use super::connection::CacheDb;
use super::{select_ids_in, text_values};
use crate::Error;

pub(crate) fn tag_cache_ids(conn: &rusqlite::Connection, tags: &BTreeSet<String>) -> Result<BTreeSet<i64>, Error> {
    select_ids_in(conn, "SELECT DISTINCT cache_id FROM cache_tags WHERE tag IN ({list})", &[], &text_values(tags))
}

impl CacheDb {
    /// Cache ids tagged with any of `tags`.
    pub async fn cache_ids_for_tags(&self, tags: &BTreeSet<String>) -> Result<BTreeSet<i64>, Error> {
        let tags = tags.clone();
        self.conn
            .call(move |conn| -> Result<BTreeSet<i64>, Error> { tag_cache_ids(conn, &tags) })
            .await
            .map_err(Error::from)
    }

    /// Every tag currently registered by at least one cache entry.
    pub async fn all_tags(&self) -> Result<BTreeSet<String>, Error> {
        self.conn
            .call(|conn| -> Result<BTreeSet<String>, Error> {
                let mut stmt = conn.prepare("SELECT DISTINCT tag FROM cache_tags")?;
                let tags = stmt
                    .query_map([], |row| row.get::<_, String>(0))?
                    .collect::<Result<BTreeSet<_>, _>>()?;
                Ok(tags)
            })
            .await
            .map_err(Error::from)
    }
}
