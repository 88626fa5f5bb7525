//! Include fragment identities.

use serde::{Deserialize, Serialize};
use tokio_rusqlite::params;
use tokio_rusqlite::rusqlite::OptionalExtension;

use super::connection::CacheDb;
use super::hash::include_index;
use crate::Error;

/// A cacheable sub-fragment embedded by a page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IncludeFragment {
    pub id: i64,
    pub index_hash: String,
    pub site_id: i64,
    pub template: String,
    pub params: String,
}

impl CacheDb {
    /// Lookup-or-insert an include; returns its id and index hash.
    pub async fn save_include(&self, site_id: i64, template: &str, params: &str) -> Result<(i64, String), Error> {
        let template = template.to_string();
        let include_params = params.to_string();
        let index = include_index(site_id, &template, &include_params);
        self.conn
            .call(move |conn| -> Result<(i64, String), Error> {
                conn.execute(
                    "INSERT INTO includes (index_hash, site_id, template, params) VALUES (?1, ?2, ?3, ?4)
                     ON CONFLICT(index_hash) DO NOTHING",
                    params![&index, site_id, &template, &include_params],
                )?;
                let id: i64 =
                    conn.query_row("SELECT id FROM includes WHERE index_hash = ?1", params![&index], |row| row.get(0))?;
                Ok((id, index))
            })
            .await
            .map_err(Error::from)
    }

    /// Get an include by id.
    pub async fn include(&self, id: i64) -> Result<Option<IncludeFragment>, Error> {
        self.conn
            .call(move |conn| -> Result<Option<IncludeFragment>, Error> {
                let fragment = conn
                    .query_row(
                        "SELECT id, index_hash, site_id, template, params FROM includes WHERE id = ?1",
                        [id],
                        |row| {
                            Ok(IncludeFragment {
                                id: row.get(0)?,
                                index_hash: row.get(1)?,
                                site_id: row.get(2)?,
                                template: row.get(3)?,
                                params: row.get(4)?,
                            })
                        },
                    )
                    .optional()?;
                Ok(fragment)
            })
            .await
            .map_err(Error::from)
    }
}
