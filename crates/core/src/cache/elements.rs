//! Element and field dependency lookups.

use std::collections::{BTreeMap, BTreeSet};

use tokio_rusqlite::rusqlite::{self, types::Value};

use super::connection::CacheDb;
use super::{int_values, select_ids_in};
use crate::Error;

/// Cache ids depending on changed elements.
///
/// `field_changes` names the elements that changed only in custom fields; they
/// match dependencies that track all fields, plus narrowed dependencies whose
/// field rows intersect the changed fields. Every other id in `element_ids`
/// matches all its dependencies.
pub(crate) fn element_cache_ids(
    conn: &rusqlite::Connection, element_ids: &BTreeSet<i64>, field_changes: &BTreeMap<i64, BTreeSet<i64>>,
) -> Result<BTreeSet<i64>, Error> {
    let whole: Vec<i64> = element_ids.iter().filter(|id| !field_changes.contains_key(id)).copied().collect();
    let mut found = select_ids_in(
        conn,
        "SELECT DISTINCT cache_id FROM element_caches WHERE element_id IN ({list})",
        &[],
        &int_values(&whole),
    )?;

    if field_changes.is_empty() {
        return Ok(found);
    }

    found.extend(select_ids_in(
        conn,
        "SELECT DISTINCT cache_id FROM element_caches WHERE track_all_fields = 1 AND element_id IN ({list})",
        &[],
        &int_values(field_changes.keys()),
    )?);

    for (element_id, field_ids) in field_changes {
        found.extend(select_ids_in(
            conn,
            "SELECT DISTINCT cache_id FROM element_field_caches WHERE element_id = ? AND field_id IN ({list})",
            &[Value::Integer(*element_id)],
            &int_values(field_ids),
        )?);
    }

    Ok(found)
}

impl CacheDb {
    /// Cache ids with a direct dependency on any of `element_ids`.
    pub async fn cache_ids_for_elements(&self, element_ids: &BTreeSet<i64>) -> Result<BTreeSet<i64>, Error> {
        let element_ids = element_ids.clone();
        self.conn
            .call(move |conn| -> Result<BTreeSet<i64>, Error> {
                element_cache_ids(conn, &element_ids, &BTreeMap::new())
            })
            .await
            .map_err(Error::from)
    }

    /// Cache ids affected by custom field changes on one element.
    pub async fn cache_ids_for_fields(
        &self, element_id: i64, field_ids: &BTreeSet<i64>,
    ) -> Result<BTreeSet<i64>, Error> {
        let field_changes = BTreeMap::from([(element_id, field_ids.clone())]);
        self.conn
            .call(move |conn| -> Result<BTreeSet<i64>, Error> {
                element_cache_ids(conn, &BTreeSet::from([element_id]), &field_changes)
            })
            .await
            .map_err(Error::from)
    }
}
