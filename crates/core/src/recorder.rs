//! Generate side: record what a page render depends on.
//!
//! One [`DependencyRecorder`] serves one render. Elements, queries, tags and
//! includes are buffered as the page is produced; [`DependencyRecorder::save`]
//! replaces the page's cache entry and writes the whole dependency set in one
//! transaction, then stores the output.
//!
//! Caching is best-effort: failures are logged and never reach the render.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{Duration, Utc};
use tracing::{debug, info, warn};

use crate::Error;
use crate::cache::CacheDb;
use crate::model::{DependencySet, Element, SiteUri, TrackedFields};
use crate::output::{self, OutputComments};
use crate::registry::ElementTypeRegistry;
use crate::signature::{ElementQuery, SignatureCodec, SkipReason};
use crate::storage::CacheStorage;

/// Per-render recording options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerateOptions {
    pub caching_enabled: bool,
    pub track_elements: bool,
    pub track_element_queries: bool,
    /// Field set recorded for elements added without an explicit one.
    pub track_custom_fields: TrackedFields,
    pub output_comments: OutputComments,
    /// Tags added to every page saved with these options.
    pub tags: BTreeSet<String>,
    /// Lifetime of saved entries; unlimited when `None`.
    pub cache_duration: Option<Duration>,
}

impl Default for GenerateOptions {
    fn default() -> Self {
        Self {
            caching_enabled: true,
            track_elements: true,
            track_element_queries: true,
            track_custom_fields: TrackedFields::All,
            output_comments: OutputComments::default(),
            tags: BTreeSet::new(),
            cache_duration: None,
        }
    }
}

pub struct DependencyRecorder {
    db: CacheDb,
    storage: Arc<dyn CacheStorage>,
    registry: ElementTypeRegistry,
    options: GenerateOptions,
    deps: DependencySet,
    skipped: Vec<SkipReason>,
}

impl DependencyRecorder {
    pub fn new(
        db: CacheDb, storage: Arc<dyn CacheStorage>, registry: ElementTypeRegistry, options: GenerateOptions,
    ) -> Self {
        Self { db, storage, registry, options, deps: DependencySet::default(), skipped: Vec::new() }
    }

    pub fn options(&self) -> &GenerateOptions {
        &self.options
    }

    /// Adjust options mid-render, e.g. from a template tag.
    pub fn options_mut(&mut self) -> &mut GenerateOptions {
        &mut self.options
    }

    pub fn dependencies(&self) -> &DependencySet {
        &self.deps
    }

    /// Reasons for queries skipped so far in this render.
    pub fn skipped_queries(&self) -> &[SkipReason] {
        &self.skipped
    }

    /// Discard everything recorded for the current render.
    pub fn reset(&mut self) {
        self.deps = DependencySet::default();
        self.skipped.clear();
    }

    /// Record an element the page renders, with the configured field set.
    pub fn track_element(&mut self, element: &Element) {
        let fields = self.options.track_custom_fields.clone();
        self.add_element(element.id, fields);
    }

    /// Record an element dependency; a broader field set already recorded wins.
    pub fn add_element(&mut self, element_id: i64, fields: TrackedFields) {
        if !self.options.caching_enabled || !self.options.track_elements {
            return;
        }
        self.deps
            .elements
            .entry(element_id)
            .and_modify(|existing| existing.merge(&fields))
            .or_insert(fields);
    }

    /// Record a content query. Untrackable queries are skipped and counted;
    /// returns the signature id when one was recorded.
    pub async fn add_query(&mut self, query: &ElementQuery) -> Option<i64> {
        if !self.options.caching_enabled || !self.options.track_element_queries {
            return None;
        }

        let signature = match SignatureCodec::new(&self.registry).encode(query) {
            Ok(signature) => signature,
            Err(reason) => {
                debug!(element_type = %query.element_type, %reason, "skipping untrackable element query");
                self.skipped.push(reason);
                return None;
            }
        };

        match self.db.save_query_signature(&signature).await {
            Ok(id) => {
                self.deps.query_ids.insert(id);
                Some(id)
            }
            Err(e) => {
                warn!(element_type = %query.element_type, error = %e, "failed to record element query");
                None
            }
        }
    }

    pub fn add_tag(&mut self, tag: impl Into<String>) {
        let tag = tag.into();
        if self.options.caching_enabled && !tag.is_empty() {
            self.deps.tags.insert(tag);
        }
    }

    pub fn add_tags<I, S>(&mut self, tags: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for tag in tags {
            self.add_tag(tag);
        }
    }

    /// Link an include fragment to the page being rendered.
    pub fn add_include(&mut self, include_id: i64) {
        if self.options.caching_enabled {
            self.deps.include_ids.insert(include_id);
        }
    }

    /// Lookup-or-insert an include fragment; returns its id and index hash.
    pub async fn save_include(&self, site_id: i64, template: &str, params: &str) -> Result<(i64, String), Error> {
        self.db.save_include(site_id, template, params).await
    }

    /// Commit the render: replace the cache entry, write dependencies, store
    /// the output. Returns the stored output, or `None` when nothing was cached.
    pub async fn save(&mut self, output: &str, site_uri: &SiteUri) -> Option<String> {
        let mut deps = std::mem::take(&mut self.deps);
        let skipped = std::mem::take(&mut self.skipped);
        if !self.options.caching_enabled {
            return None;
        }
        deps.tags.extend(self.options.tags.iter().filter(|tag| !tag.is_empty()).cloned());

        let now = Utc::now();
        let stored = output::stored_output(output, site_uri, self.options.output_comments, now);
        let expiry_date = self.options.cache_duration.map(|duration| now + duration);

        let entry = match self.db.save_cache_entry(site_uri, &deps, now, expiry_date).await {
            Ok(entry) => entry,
            Err(e) => {
                warn!(%site_uri, error = %e, "failed to save cache entry");
                return None;
            }
        };

        if let Err(e) = self.storage.set(site_uri, &stored).await {
            warn!(%site_uri, cache_id = entry.id, error = %e, "failed to write cached output");
            return None;
        }

        info!(
            cache_id = entry.id,
            %site_uri,
            elements = deps.elements.len(),
            queries = deps.query_ids.len(),
            tags = deps.tags.len(),
            includes = deps.include_ids.len(),
            skipped_queries = skipped.len(),
            "saved cache entry"
        );
        Some(stored)
    }
}
