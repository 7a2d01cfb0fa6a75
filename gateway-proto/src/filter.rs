//! Nostr subscription filters: the predicate language `REQ` carries and the
//! replica adapter scans against (spec §3, §4.7).

use crate::event::NostrEvent;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A single filter from a `REQ` message.
///
/// An event matches a filter when every populated set-valued field is
/// non-empty-implies-contains-match, the time bounds hold, and every `#name`
/// tag selector matches at least one of the event's tags (spec §3).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Filter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ids: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authors: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kinds: Option<Vec<u32>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub since: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub until: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<u32>,
    /// Tag selectors, keyed by the raw `#<name>` JSON key (e.g. `"#e"`).
    #[serde(flatten)]
    pub tags: BTreeMap<String, Vec<String>>,
}

impl Filter {
    /// Returns `true` if `event` satisfies every clause of this filter.
    #[must_use]
    pub fn matches(&self, event: &NostrEvent) -> bool {
        if let Some(ids) = &self.ids {
            if !ids.is_empty() && !ids.iter().any(|id| id == &event.id) {
                return false;
            }
        }
        if let Some(authors) = &self.authors {
            if !authors.is_empty() && !authors.iter().any(|a| a == &event.pubkey) {
                return false;
            }
        }
        if let Some(kinds) = &self.kinds {
            if !kinds.is_empty() && !kinds.contains(&event.kind) {
                return false;
            }
        }
        if let Some(since) = self.since {
            if event.created_at < since {
                return false;
            }
        }
        if let Some(until) = self.until {
            if event.created_at > until {
                return false;
            }
        }
        for (key, values) in &self.tags {
            if !key.starts_with('#') || values.is_empty() {
                continue;
            }
            let name = &key[1..];
            let event_values = event.tag_values(name);
            if !values.iter().any(|v| event_values.contains(&v.as_str())) {
                return false;
            }
        }
        true
    }

    /// `true` if this filter selects events purely by id (the replica
    /// adapter's fast path, spec §4.7 step 1).
    #[must_use]
    pub fn is_id_lookup(&self) -> bool {
        self.ids.as_ref().is_some_and(|ids| !ids.is_empty())
    }
}
