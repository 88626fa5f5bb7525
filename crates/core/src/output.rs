//! Generation marker appended to cached HTML.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::model::SiteUri;

/// Literal prefix of the marker comment.
pub const MARKER_PREFIX: &str = "<!-- Cached by pagecache on ";

/// When the marker comment is added.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputComments {
    /// In stored output, so it is also served.
    #[default]
    Always,
    Never,
    /// In stored output only; the render that produced it returns clean output.
    Cached,
    /// Added when serving from the store, never stored.
    Served,
}

pub fn marker(now: DateTime<Utc>) -> String {
    format!("{MARKER_PREFIX}{} -->", now.to_rfc3339_opts(SecondsFormat::Secs, true))
}

pub fn has_marker(output: &str) -> bool {
    output.contains(MARKER_PREFIX)
}

/// Output to write to the cache store.
pub fn stored_output(output: &str, site_uri: &SiteUri, policy: OutputComments, now: DateTime<Utc>) -> String {
    match policy {
        OutputComments::Always | OutputComments::Cached if site_uri.is_html() => append_marker(output, now),
        _ => output.to_string(),
    }
}

/// Output to send when serving a stored page.
pub fn served_output(stored: &str, site_uri: &SiteUri, policy: OutputComments, now: DateTime<Utc>) -> String {
    match policy {
        OutputComments::Served if site_uri.is_html() && !has_marker(stored) => append_marker(stored, now),
        _ => stored.to_string(),
    }
}

fn append_marker(output: &str, now: DateTime<Utc>) -> String {
    let mut decorated = String::with_capacity(output.len() + 64);
    decorated.push_str(output);
    decorated.push_str(&marker(now));
    decorated
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_marker_format() {
        let now = DateTime::parse_from_rfc3339("2024-05-01T12:00:00Z").unwrap().with_timezone(&Utc);
        assert_eq!(marker(now), "<!-- Cached by pagecache on 2024-05-01T12:00:00Z -->");
    }

    #[test]
    fn test_policies() {
        let page = SiteUri::new(1, "page");
        let now = Utc::now();

        assert!(has_marker(&stored_output("x", &page, OutputComments::Always, now)));
        assert!(has_marker(&stored_output("x", &page, OutputComments::Cached, now)));
        assert_eq!(stored_output("x", &page, OutputComments::Never, now), "x");
        assert_eq!(stored_output("x", &page, OutputComments::Served, now), "x");

        assert!(has_marker(&served_output("x", &page, OutputComments::Served, now)));
        assert_eq!(served_output("x", &page, OutputComments::Cached, now), "x");
    }

    #[test]
    fn test_non_html_never_marked() {
        let feed = SiteUri::new(1, "feed.json");
        let now = Utc::now();
        assert_eq!(stored_output("{}", &feed, OutputComments::Always, now), "{}");
        assert_eq!(served_output("{}", &feed, OutputComments::Served, now), "{}");
    }
}
