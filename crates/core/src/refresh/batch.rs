//! Pending refresh state and change gating.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};

use crate::model::{ElementChange, ElementStatus};
use crate::registry::ElementTypeRegistry;

/// How a content change affects the pending batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Gate {
    /// Every dependency on the element is affected.
    Whole,
    /// Only dependencies tracking these custom fields (or all fields) are affected.
    Fields(BTreeSet<i64>),
    /// A new element: it was never rendered, but its containers' queries may now match it.
    SourcesOnly,
    /// Not invalidation-worthy.
    Ignore(IgnoreReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IgnoreReason {
    /// Not live before or after the change, so never visible.
    NotLive,
    /// Live, but nothing observable changed.
    Unchanged,
}

/// Decide whether a change is invalidation-worthy.
///
/// An unknown previous status is treated as unchanged.
pub fn gate(change: &ElementChange, now: DateTime<Utc>) -> Gate {
    let live_now = change.element.status_at(now) == ElementStatus::Live;

    if change.deleted {
        return Gate::Whole;
    }
    if change.is_new {
        return if live_now { Gate::SourcesOnly } else { Gate::Ignore(IgnoreReason::NotLive) };
    }
    if change.previous_status.is_some_and(|previous| (previous == ElementStatus::Live) != live_now) {
        return Gate::Whole;
    }
    if !live_now {
        return Gate::Ignore(IgnoreReason::NotLive);
    }
    if !change.changed_attributes.is_empty() {
        return Gate::Whole;
    }
    if !change.changed_fields.is_empty() {
        return Gate::Fields(change.changed_fields.clone());
    }
    Gate::Ignore(IgnoreReason::Unchanged)
}

/// Pending changes for one element type.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TypeBatch {
    /// Every changed element id.
    pub element_ids: BTreeSet<i64>,
    /// Source ids of the changed elements.
    pub source_ids: BTreeSet<i64>,
    /// Elements that changed only in custom fields, with those field ids.
    pub field_changes: BTreeMap<i64, BTreeSet<i64>>,
}

impl TypeBatch {
    /// Record a change affecting every dependency on the element.
    pub fn add_whole(&mut self, element_id: i64) {
        self.element_ids.insert(element_id);
        self.field_changes.remove(&element_id);
    }

    /// Record a custom-field-only change; never narrows an earlier whole change.
    pub fn add_fields(&mut self, element_id: i64, field_ids: &BTreeSet<i64>) {
        if self.element_ids.contains(&element_id) && !self.field_changes.contains_key(&element_id) {
            return;
        }
        self.element_ids.insert(element_id);
        self.field_changes.entry(element_id).or_default().extend(field_ids.iter().copied());
    }

    pub fn merge(&mut self, other: &TypeBatch) {
        for element_id in &other.element_ids {
            match other.field_changes.get(element_id) {
                Some(field_ids) => self.add_fields(*element_id, field_ids),
                None => self.add_whole(*element_id),
            }
        }
        self.source_ids.extend(other.source_ids.iter().copied());
    }
}

/// One accumulated set of pending changes, resolved in a single pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RefreshBatch {
    pub cache_ids: BTreeSet<i64>,
    pub elements: BTreeMap<String, TypeBatch>,
    pub tags: BTreeSet<String>,
    /// Clear affected entries even when refreshes normally expire them.
    pub force_clear: bool,
}

impl RefreshBatch {
    /// Gate a change and merge it into the batch; returns the gate decision.
    pub fn add_change(&mut self, change: &ElementChange, registry: &ElementTypeRegistry, now: DateTime<Utc>) -> Gate {
        let decision = gate(change, now);
        let element = &change.element;
        let element_id = element.id;
        match &decision {
            Gate::Ignore(reason) => {
                tracing::debug!(element_id, element_type = %element.element_type, ?reason, "ignoring element change");
                return Gate::Ignore(*reason);
            }
            Gate::Whole => self.type_batch(&element.element_type).add_whole(element_id),
            Gate::Fields(field_ids) => self.type_batch(&element.element_type).add_fields(element_id, field_ids),
            Gate::SourcesOnly => {
                self.type_batch(&element.element_type);
            }
        }
        let sources = registry.resolve_sources(element);
        self.type_batch(&element.element_type).source_ids.extend(sources);
        decision
    }

    pub fn add_tags<I, S>(&mut self, tags: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags.extend(tags.into_iter().map(Into::into).filter(|tag: &String| !tag.is_empty()));
    }

    pub fn add_cache_ids(&mut self, cache_ids: impl IntoIterator<Item = i64>) {
        self.cache_ids.extend(cache_ids);
    }

    /// Merge another batch; sets are unioned and `force_clear` is sticky.
    pub fn merge(&mut self, other: &RefreshBatch) {
        self.cache_ids.extend(other.cache_ids.iter().copied());
        for (element_type, batch) in &other.elements {
            self.type_batch(element_type).merge(batch);
        }
        self.tags.extend(other.tags.iter().cloned());
        self.force_clear |= other.force_clear;
    }

    pub fn is_empty(&self) -> bool {
        self.cache_ids.is_empty() && self.tags.is_empty() && self.elements.is_empty()
    }

    /// Number of changed elements across all types.
    pub fn element_count(&self) -> usize {
        self.elements.values().map(|batch| batch.element_ids.len()).sum()
    }

    /// `"{source_param}:{source_id}"` tags for the batch's source ids.
    pub fn source_tags(&self, registry: &ElementTypeRegistry) -> BTreeSet<String> {
        let mut tags = BTreeSet::new();
        for (element_type, batch) in &self.elements {
            if let Some(param) = registry.source_param(element_type) {
                tags.extend(batch.source_ids.iter().map(|id| format!("{param}:{id}")));
            }
        }
        tags
    }

    fn type_batch(&mut self, element_type: &str) -> &mut TypeBatch {
        self.elements.entry(element_type.to_string()).or_default()
    }
}
