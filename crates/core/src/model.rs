//! Data model shared by the recording and refresh halves.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::Error;

/// Identity of a cacheable page: a site and a URI.
///
/// The URI carries its normalized query string (`blog?page=2`), so query-string
/// variants of a path are distinct entries.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SiteUri {
    pub site_id: i64,
    pub uri: String,
}

impl SiteUri {
    pub fn new(site_id: i64, uri: impl Into<String>) -> Self {
        Self { site_id, uri: uri.into() }
    }

    /// The URI without its query string.
    pub fn path(&self) -> &str {
        self.uri.split_once('?').map_or(self.uri.as_str(), |(path, _)| path)
    }

    /// The query-string variant, if any.
    pub fn query(&self) -> Option<&str> {
        self.uri.split_once('?').map(|(_, query)| query).filter(|q| !q.is_empty())
    }

    /// File extension of the last path segment, lowercased.
    pub fn extension(&self) -> Option<String> {
        let last = self.path().rsplit('/').next().unwrap_or_default();
        last.rsplit_once('.')
            .map(|(_, ext)| ext.to_ascii_lowercase())
            .filter(|ext| !ext.is_empty())
    }

    /// Whether output for this URI is HTML and may carry a marker comment.
    pub fn is_html(&self) -> bool {
        matches!(self.extension().as_deref(), None | Some("html") | Some("htm"))
    }
}

impl fmt::Display for SiteUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:/{}", self.site_id, self.uri)
    }
}

/// A stored cache entry row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub id: i64,
    pub site_uri: SiteUri,
    pub created_at: DateTime<Utc>,
    pub expiry_date: Option<DateTime<Utc>>,
}

/// Which fields of an element a render depends on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TrackedFields {
    /// Any change to the element invalidates the page.
    All,
    /// Only changes to these custom field ids (plus attribute, status and
    /// deletion changes) invalidate the page.
    Only(BTreeSet<i64>),
}

impl TrackedFields {
    /// Merge another field set into this one; `All` is never narrowed.
    pub fn merge(&mut self, other: &TrackedFields) {
        match (&mut *self, other) {
            (TrackedFields::All, _) => {}
            (this, TrackedFields::All) => *this = TrackedFields::All,
            (TrackedFields::Only(ours), TrackedFields::Only(theirs)) => ours.extend(theirs.iter().copied()),
        }
    }

    pub fn tracks_all(&self) -> bool {
        matches!(self, TrackedFields::All)
    }
}

/// Dependencies collected during one render, written with its cache entry.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DependencySet {
    pub elements: BTreeMap<i64, TrackedFields>,
    pub query_ids: BTreeSet<i64>,
    pub tags: BTreeSet<String>,
    pub include_ids: BTreeSet<i64>,
}

impl DependencySet {
    pub fn is_empty(&self) -> bool {
        self.elements.is_empty() && self.query_ids.is_empty() && self.tags.is_empty() && self.include_ids.is_empty()
    }
}

/// Visibility status of an element at a given instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ElementStatus {
    Live,
    Pending,
    Expired,
    Disabled,
}

/// A content element as seen by the cache: identity, visibility and attributes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Element {
    pub id: i64,
    pub element_type: String,
    pub site_id: i64,
    pub enabled: bool,
    pub post_date: Option<DateTime<Utc>>,
    pub expiry_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub attributes: BTreeMap<String, Value>,
}

impl Element {
    pub fn new(id: i64, element_type: impl Into<String>) -> Self {
        Self {
            id,
            element_type: element_type.into(),
            site_id: 1,
            enabled: true,
            post_date: None,
            expiry_date: None,
            attributes: BTreeMap::new(),
        }
    }

    pub fn with_attribute(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.attributes.insert(name.into(), value.into());
        self
    }

    /// Status derived from enablement and scheduling fields.
    pub fn status_at(&self, now: DateTime<Utc>) -> ElementStatus {
        if !self.enabled {
            ElementStatus::Disabled
        } else if self.post_date.is_some_and(|date| date > now) {
            ElementStatus::Pending
        } else if self.expiry_date.is_some_and(|date| date <= now) {
            ElementStatus::Expired
        } else {
            ElementStatus::Live
        }
    }

    /// Earliest scheduling instant strictly after `now`, if any.
    pub fn next_visibility_change(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        [self.post_date, self.expiry_date]
            .into_iter()
            .flatten()
            .filter(|date| *date > now)
            .min()
    }
}

/// A content-mutation event handed to the refresh side.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ElementChange {
    pub element: Element,
    /// Status before the mutation; `None` when unknown.
    pub previous_status: Option<ElementStatus>,
    /// Native attributes that changed (title, slug, ...).
    #[serde(default)]
    pub changed_attributes: BTreeSet<String>,
    /// Custom field ids that changed.
    #[serde(default)]
    pub changed_fields: BTreeSet<i64>,
    #[serde(default)]
    pub is_new: bool,
    #[serde(default)]
    pub deleted: bool,
}

impl ElementChange {
    /// A save event with no recorded changes yet.
    pub fn saved(element: Element) -> Self {
        Self {
            element,
            previous_status: None,
            changed_attributes: BTreeSet::new(),
            changed_fields: BTreeSet::new(),
            is_new: false,
            deleted: false,
        }
    }

    /// A delete event.
    pub fn deleted(element: Element) -> Self {
        Self { deleted: true, ..Self::saved(element) }
    }

    pub fn with_previous_status(mut self, status: ElementStatus) -> Self {
        self.previous_status = Some(status);
        self
    }

    pub fn with_changed_attribute(mut self, name: impl Into<String>) -> Self {
        self.changed_attributes.insert(name.into());
        self
    }

    pub fn with_changed_field(mut self, field_id: i64) -> Self {
        self.changed_fields.insert(field_id);
        self
    }
}

/// Format an instant as a fixed-width UTC string for storage.
///
/// Fixed precision keeps lexicographic order equal to chronological order.
pub fn to_db_timestamp(instant: DateTime<Utc>) -> String {
    instant.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse a stored timestamp.
pub fn from_db_timestamp(value: &str) -> Result<DateTime<Utc>, Error> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| Error::CorruptRow(format!("invalid timestamp {value:?}: {e}")))
}
