//! The Nostr event shape the gateway routes and the replica indexes.
//!
//! The gateway never verifies `sig` (delegated to the worker, spec §1); it
//! only reads `id`/`pubkey`/`created_at`/`kind`/`tags` for routing and
//! filter matching. Unknown fields round-trip verbatim via `extra`.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A Nostr event as received from a client or a worker peer.
///
/// Fields beyond the ones the gateway reads are preserved in `extra` so a
/// worker-specific extension never gets silently dropped on the way
/// through the gateway.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NostrEvent {
    pub id: String,
    pub pubkey: String,
    pub created_at: i64,
    pub kind: u32,
    #[serde(default)]
    pub tags: Vec<Vec<String>>,
    pub content: String,
    pub sig: String,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl NostrEvent {
    /// Returns the set of tag values for tags whose name (first element) is `name`.
    #[must_use]
    pub fn tag_values<'a>(&'a self, name: &str) -> Vec<&'a str> {
        self.tags
            .iter()
            .filter(|t| t.first().is_some_and(|n| n == name))
            .filter_map(|t| t.get(1).map(String::as_str))
            .collect()
    }
}
