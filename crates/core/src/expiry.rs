//! Scheduled invalidation for future-dated elements.
//!
//! Elements with a future post date or expiry date change visibility without
//! being edited. The tracker keeps one row per such element and a periodic
//! sweep refreshes everything whose instant has passed, returning the next
//! instant worth waking up for.

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use crate::Error;
use crate::cache::{CacheDb, ExpiryRow};
use crate::model::Element;
use crate::refresh::{RefreshBatch, RefreshCache, RefreshOutcome};
use crate::registry::ElementTypeRegistry;

/// What one sweep did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepOutcome {
    /// Elements whose scheduled instant passed.
    pub elements: Vec<i64>,
    /// Refresh of those elements.
    pub refreshed: RefreshOutcome,
    /// Entries cleared because their own cache duration ran out.
    pub expired_entries: RefreshOutcome,
    /// Earliest remaining element or entry expiry.
    pub next_wake_up: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct ExpiryTracker {
    db: CacheDb,
    registry: ElementTypeRegistry,
}

impl ExpiryTracker {
    pub fn new(db: CacheDb, registry: ElementTypeRegistry) -> Self {
        Self { db, registry }
    }

    /// Track the element's next visibility change, or drop its row when it has none.
    pub async fn schedule(&self, element: &Element, now: DateTime<Utc>) -> Result<Option<DateTime<Utc>>, Error> {
        match element.next_visibility_change(now) {
            Some(next_at) => {
                let row = ExpiryRow {
                    element_id: element.id,
                    element_type: element.element_type.clone(),
                    source_ids: self.registry.resolve_sources(element).into_iter().collect(),
                    post_date: element.post_date,
                    expiry_date: element.expiry_date,
                    next_at,
                };
                self.db.upsert_expiry(&row).await?;
                debug!(element_id = element.id, %next_at, "scheduled element refresh");
                Ok(Some(next_at))
            }
            None => {
                self.db.delete_expiry(element.id).await?;
                Ok(None)
            }
        }
    }

    pub async fn unschedule(&self, element_id: i64) -> Result<(), Error> {
        self.db.delete_expiry(element_id).await
    }

    /// Refresh everything due at `now` through `engine`.
    ///
    /// Entries past their own expiry date are cleared first, so entries this
    /// sweep expires stay servable until the next one. Any changes already
    /// pending on `engine` are flushed with the due elements. Each swept row
    /// moves on to the element's next date, so a post date and a later
    /// expiry date both fire.
    pub async fn sweep(&self, engine: &mut RefreshCache, now: DateTime<Utc>) -> Result<SweepOutcome, Error> {
        let expired_ids = self.db.expired_cache_ids(now).await?;
        let expired_entries = if expired_ids.is_empty() {
            RefreshOutcome::default()
        } else {
            let batch = RefreshBatch { cache_ids: expired_ids, force_clear: true, ..RefreshBatch::default() };
            engine.execute(&batch).await?
        };

        let due = self.db.due_expiries(now).await?;
        let elements: Vec<i64> = due.iter().map(|row| row.element_id).collect();
        for row in &due {
            engine.add_scheduled(row);
        }
        let refreshed = engine.refresh_at(now).await?;
        self.db.advance_expiries(&due, now).await?;

        let next_wake_up = self.next_wake_up(now).await?;
        info!(
            due = elements.len(),
            purged = refreshed.purged.len(),
            expired_entries = expired_entries.purged.len(),
            next_wake_up = ?next_wake_up,
            "expiry sweep finished"
        );
        Ok(SweepOutcome { elements, refreshed, expired_entries, next_wake_up })
    }

    /// Earliest future instant at which a sweep has work to do.
    pub async fn next_wake_up(&self, now: DateTime<Utc>) -> Result<Option<DateTime<Utc>>, Error> {
        let element = self.db.next_expiry_date().await?;
        let entry = self.db.next_cache_expiry(now).await?;
        Ok(element.into_iter().chain(entry).min())
    }
}
