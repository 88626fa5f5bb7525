//! Serialized refresh batches for the job queue.

use serde::{Deserialize, Serialize};

use super::batch::RefreshBatch;
use super::{RefreshCache, RefreshOutcome};
use crate::Error;

/// One changed element, or a type-level source entry when `id` is absent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangedElement {
    #[serde(rename = "type")]
    pub element_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    #[serde(default)]
    pub source_ids: Vec<i64>,
    /// Changed custom fields when only fields changed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fields: Option<Vec<i64>>,
}

/// Wire form of a [`RefreshBatch`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshJobPayload {
    #[serde(default)]
    pub cache_ids: Vec<i64>,
    #[serde(default)]
    pub changed_elements: Vec<ChangedElement>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub force_clear: bool,
}

impl RefreshJobPayload {
    pub fn from_json(json: &str) -> Result<Self, Error> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn to_json(&self) -> Result<String, Error> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn to_batch(&self) -> RefreshBatch {
        let mut batch = RefreshBatch {
            cache_ids: self.cache_ids.iter().copied().collect(),
            tags: self.tags.iter().filter(|tag| !tag.is_empty()).cloned().collect(),
            force_clear: self.force_clear,
            ..RefreshBatch::default()
        };
        for changed in &self.changed_elements {
            let type_batch = batch.elements.entry(changed.element_type.clone()).or_default();
            if let Some(id) = changed.id {
                match changed.fields.as_deref() {
                    Some(fields) if !fields.is_empty() => {
                        type_batch.add_fields(id, &fields.iter().copied().collect());
                    }
                    _ => type_batch.add_whole(id),
                }
            }
            type_batch.source_ids.extend(changed.source_ids.iter().copied().filter(|id| *id > 0));
        }
        batch
    }
}

impl From<&RefreshBatch> for RefreshJobPayload {
    fn from(batch: &RefreshBatch) -> Self {
        let mut changed_elements = Vec::new();
        for (element_type, type_batch) in &batch.elements {
            for id in &type_batch.element_ids {
                changed_elements.push(ChangedElement {
                    element_type: element_type.clone(),
                    id: Some(*id),
                    source_ids: Vec::new(),
                    fields: type_batch.field_changes.get(id).map(|fields| fields.iter().copied().collect()),
                });
            }
            if !type_batch.source_ids.is_empty() || type_batch.element_ids.is_empty() {
                changed_elements.push(ChangedElement {
                    element_type: element_type.clone(),
                    id: None,
                    source_ids: type_batch.source_ids.iter().copied().collect(),
                    fields: None,
                });
            }
        }
        Self {
            cache_ids: batch.cache_ids.iter().copied().collect(),
            changed_elements,
            tags: batch.tags.iter().cloned().collect(),
            force_clear: batch.force_clear,
        }
    }
}

/// A queued refresh; safe to run more than once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefreshJob {
    pub payload: RefreshJobPayload,
}

impl RefreshJob {
    pub fn new(payload: RefreshJobPayload) -> Self {
        Self { payload }
    }

    /// Resolve and purge the payload's batch.
    ///
    /// Entries purged by an earlier attempt no longer resolve, so a retry only
    /// touches what is left.
    pub async fn execute(&self, engine: &RefreshCache) -> Result<RefreshOutcome, Error> {
        let batch = self.payload.to_batch();
        tracing::debug!(
            cache_ids = batch.cache_ids.len(),
            elements = batch.element_count(),
            tags = batch.tags.len(),
            force_clear = batch.force_clear,
            "executing refresh job"
        );
        engine.execute(&batch).await
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use serde_json::json;

    use super::*;

    fn sample_batch() -> RefreshBatch {
        let mut batch = RefreshBatch::default();
        let entries = batch.elements.entry("entry".to_string()).or_default();
        entries.add_whole(1);
        entries.add_fields(2, &BTreeSet::from([7, 8]));
        entries.source_ids.extend([3, 4]);
        batch.elements.entry("user".to_string()).or_default();
        batch.add_tags(["nav"]);
        batch.add_cache_ids([42]);
        batch.force_clear = true;
        batch
    }

    #[test]
    fn test_payload_preserves_batch() {
        let batch = sample_batch();
        let payload = RefreshJobPayload::from(&batch);
        let json = payload.to_json().unwrap();
        assert_eq!(RefreshJobPayload::from_json(&json).unwrap().to_batch(), batch);
    }

    #[test]
    fn test_payload_wire_names() {
        let payload = RefreshJobPayload::from(&sample_batch());
        let value = serde_json::to_value(&payload).unwrap();
        assert_eq!(value["forceClear"], true);
        assert_eq!(value["cacheIds"], json!([42]));
        assert_eq!(value["changedElements"][0], json!({"type": "entry", "id": 1, "sourceIds": []}));
        assert_eq!(value["changedElements"][1]["fields"], json!([7, 8]));
    }

    #[test]
    fn test_minimal_payload_parses() {
        let payload =
            RefreshJobPayload::from_json(r#"{"changedElements":[{"type":"entry","id":5,"sourceIds":[1]}]}"#).unwrap();
        let batch = payload.to_batch();
        assert_eq!(batch.elements["entry"].element_ids, BTreeSet::from([5]));
        assert_eq!(batch.elements["entry"].source_ids, BTreeSet::from([1]));
        assert!(!batch.force_clear);
    }

    #[test]
    fn test_invalid_payload_is_serialization_error() {
        let err = RefreshJobPayload::from_json("{not json").unwrap_err();
        assert!(err.to_string().starts_with("SERIALIZATION_ERROR"));
    }
}
