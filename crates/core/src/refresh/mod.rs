//! Refresh side: turn content changes into purged cache entries.
//!
//! A [`RefreshCache`] is created per triggering operation (a request, a job)
//! and owns that operation's pending [`RefreshBatch`]. In batch mode changes
//! only accumulate until [`RefreshCache::refresh`]; otherwise every accepted
//! change is resolved and purged immediately.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

pub mod accumulator;
pub mod batch;
pub mod job;

pub use accumulator::{BatchAccumulator, BatchProducer};
pub use batch::{Gate, IgnoreReason, RefreshBatch, TypeBatch};
pub use job::{ChangedElement, RefreshJob, RefreshJobPayload};

use crate::Error;
use crate::cache::{CacheDb, ExpiryRow, PurgeMode};
use crate::expiry::ExpiryTracker;
use crate::model::{CacheEntry, ElementChange, SiteUri};
use crate::queue::{Job, JobFilter, JobQueue};
use crate::registry::ElementTypeRegistry;
use crate::storage::CacheStorage;

/// How refreshes behave.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RefreshSettings {
    /// Accumulate changes until `refresh()` instead of purging per change.
    pub batch_mode: bool,
    /// Delete affected entries; when false they are expired and served stale.
    pub clear_on_refresh: bool,
    /// Queue regeneration of purged pages.
    pub generate_on_refresh: bool,
    /// Batches with more changed elements than this go to the job queue.
    pub job_threshold: usize,
    pub refresh_priority: u32,
    pub generate_priority: u32,
}

impl Default for RefreshSettings {
    fn default() -> Self {
        Self {
            batch_mode: true,
            clear_on_refresh: true,
            generate_on_refresh: false,
            job_threshold: 100,
            refresh_priority: 10,
            generate_priority: 10,
        }
    }
}

/// Result of one refresh pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RefreshOutcome {
    /// Entries cleared or expired.
    pub purged: Vec<CacheEntry>,
    /// `None` when nothing was resolved in-process.
    pub mode: Option<PurgeMode>,
    /// Queue id when the batch was offloaded to a refresh job.
    pub queued_job: Option<u64>,
    /// Queue id of the regeneration job, if one was queued.
    pub generate_job: Option<u64>,
}

impl RefreshOutcome {
    pub fn cache_ids(&self) -> BTreeSet<i64> {
        self.purged.iter().map(|entry| entry.id).collect()
    }
}

/// The invalidation engine.
pub struct RefreshCache {
    db: CacheDb,
    storage: Arc<dyn CacheStorage>,
    queue: Option<Arc<dyn JobQueue>>,
    registry: ElementTypeRegistry,
    settings: RefreshSettings,
    expiry: ExpiryTracker,
    pending: RefreshBatch,
}

impl RefreshCache {
    pub fn new(
        db: CacheDb, storage: Arc<dyn CacheStorage>, registry: ElementTypeRegistry, settings: RefreshSettings,
    ) -> Self {
        let expiry = ExpiryTracker::new(db.clone(), registry.clone());
        Self { db, storage, queue: None, registry, settings, expiry, pending: RefreshBatch::default() }
    }

    /// Offload large batches and regeneration to `queue`.
    pub fn with_queue(mut self, queue: Arc<dyn JobQueue>) -> Self {
        self.queue = Some(queue);
        self
    }

    pub fn settings(&self) -> &RefreshSettings {
        &self.settings
    }

    pub fn registry(&self) -> &ElementTypeRegistry {
        &self.registry
    }

    pub fn pending(&self) -> &RefreshBatch {
        &self.pending
    }

    /// Drop pending changes without resolving them.
    pub fn reset(&mut self) {
        self.pending = RefreshBatch::default();
    }

    /// Record a content change as of now.
    pub async fn add_element(&mut self, change: &ElementChange) -> Result<Gate, Error> {
        self.add_element_at(change, Utc::now()).await
    }

    /// Record a content change: update its expiry schedule, gate it, and in
    /// non-batch mode refresh right away.
    pub async fn add_element_at(&mut self, change: &ElementChange, now: DateTime<Utc>) -> Result<Gate, Error> {
        if change.deleted {
            self.expiry.unschedule(change.element.id).await?;
        } else {
            self.expiry.schedule(&change.element, now).await?;
        }

        let decision = self.pending.add_change(change, &self.registry, now);
        if !matches!(decision, Gate::Ignore(_)) && !self.settings.batch_mode {
            self.refresh_at(now).await?;
        }
        Ok(decision)
    }

    pub async fn add_tags<I, S>(&mut self, tags: I) -> Result<(), Error>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.pending.add_tags(tags);
        self.flush_unless_batching().await
    }

    pub async fn add_cache_ids(&mut self, cache_ids: impl IntoIterator<Item = i64>) -> Result<(), Error> {
        self.pending.add_cache_ids(cache_ids);
        self.flush_unless_batching().await
    }

    /// Merge a batch collected elsewhere, e.g. by a [`BatchAccumulator`].
    pub fn add_batch(&mut self, batch: &RefreshBatch) {
        self.pending.merge(batch);
    }

    /// Queue a scheduled visibility change; the element is not reloaded.
    pub(crate) fn add_scheduled(&mut self, row: &ExpiryRow) {
        let type_batch = self.pending.elements.entry(row.element_type.clone()).or_default();
        type_batch.add_whole(row.element_id);
        type_batch.source_ids.extend(row.source_ids.iter().copied());
    }

    /// Resolve and purge everything pending.
    pub async fn refresh(&mut self) -> Result<RefreshOutcome, Error> {
        self.refresh_at(Utc::now()).await
    }

    pub async fn refresh_at(&mut self, now: DateTime<Utc>) -> Result<RefreshOutcome, Error> {
        let batch = std::mem::take(&mut self.pending);
        if batch.is_empty() {
            return Ok(RefreshOutcome::default());
        }

        if let Some(queue) = &self.queue {
            if batch.element_count() > self.settings.job_threshold {
                let payload = RefreshJobPayload::from(&batch);
                let job_id = queue.enqueue(Job::Refresh(payload), self.settings.refresh_priority, None).await?;
                info!(job_id, elements = batch.element_count(), "queued refresh job");
                return Ok(RefreshOutcome { queued_job: Some(job_id), ..RefreshOutcome::default() });
            }
        }

        self.execute_at(&batch, now).await
    }

    /// Resolve and purge a batch in-process.
    pub async fn execute(&self, batch: &RefreshBatch) -> Result<RefreshOutcome, Error> {
        self.execute_at(batch, Utc::now()).await
    }

    async fn execute_at(&self, batch: &RefreshBatch, now: DateTime<Utc>) -> Result<RefreshOutcome, Error> {
        let clear = batch.force_clear || self.settings.clear_on_refresh;
        let mode = if clear { PurgeMode::Clear } else { PurgeMode::Expire };
        let source_tags = batch.source_tags(&self.registry);
        let purged = self.db.claim(batch, &source_tags, mode, now).await?;

        if mode == PurgeMode::Clear {
            for entry in &purged {
                if let Err(e) = self.storage.delete(&entry.site_uri).await {
                    warn!(site_uri = %entry.site_uri, error = %e, "failed to delete cached output");
                }
            }
        }

        let generate_job = self.enqueue_generate(&purged).await?;

        info!(
            purged = purged.len(),
            ?mode,
            element_types = batch.elements.len(),
            tags = batch.tags.len(),
            "refreshed cache entries"
        );
        Ok(RefreshOutcome { purged, mode: Some(mode), queued_job: None, generate_job })
    }

    /// Queue regeneration of purged pages, folding in pending generate jobs.
    async fn enqueue_generate(&self, purged: &[CacheEntry]) -> Result<Option<u64>, Error> {
        let Some(queue) = self.queue.as_ref().filter(|_| self.settings.generate_on_refresh) else {
            return Ok(None);
        };
        if purged.is_empty() {
            return Ok(None);
        }

        let mut site_uris: BTreeSet<SiteUri> = purged.iter().map(|entry| entry.site_uri.clone()).collect();
        for released in queue.release(JobFilter::Generate).await? {
            if let Job::Generate { site_uris: pending } = released {
                site_uris.extend(pending);
            }
        }

        let count = site_uris.len();
        let job = Job::Generate { site_uris: site_uris.into_iter().collect() };
        let job_id = queue.enqueue(job, self.settings.generate_priority, None).await?;
        debug!(job_id, site_uris = count, "queued generate job");
        Ok(Some(job_id))
    }

    /// Refresh every entry tagged with any of `tags`, immediately.
    pub async fn refresh_cache_tags<I, S>(&self, tags: I) -> Result<RefreshOutcome, Error>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut batch = RefreshBatch::default();
        batch.add_tags(tags);
        if batch.is_empty() {
            return Ok(RefreshOutcome::default());
        }
        self.execute(&batch).await
    }

    /// Refresh entries of a site by URI; a trailing `*` matches a prefix.
    pub async fn refresh_cached_uris(&self, site_id: i64, patterns: &[String]) -> Result<RefreshOutcome, Error> {
        let cache_ids = self.db.cache_ids_for_uris(site_id, patterns).await?;
        if cache_ids.is_empty() {
            return Ok(RefreshOutcome::default());
        }
        let batch = RefreshBatch { cache_ids, ..RefreshBatch::default() };
        self.execute(&batch).await
    }

    /// Refresh every cache entry. In clear mode the whole store is emptied and
    /// signatures left without pages are pruned.
    pub async fn refresh_all(&self) -> Result<RefreshOutcome, Error> {
        let cache_ids = self.db.all_cache_ids().await?;
        let batch = RefreshBatch { cache_ids, ..RefreshBatch::default() };
        let outcome = self.execute(&batch).await?;

        if outcome.mode != Some(PurgeMode::Expire) {
            self.storage.delete_all().await?;
            let pruned = self.db.prune_orphan_queries().await?;
            debug!(pruned, "pruned orphan query signatures");
        }
        Ok(outcome)
    }

    async fn flush_unless_batching(&mut self) -> Result<(), Error> {
        if !self.settings.batch_mode {
            self.refresh().await?;
        }
        Ok(())
    }
}
