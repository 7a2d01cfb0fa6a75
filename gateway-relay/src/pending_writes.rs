//! Pending-write pusher (spec §4.8): when a locally-served write lands in
//! the replica during a peer-absent fallback, this announces it to the
//! relay's peers once they return, so they can reconcile, retrying with
//! exponential backoff until the gateway is told the remote side has caught up.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use rand::Rng;
use serde::Serialize;
use tokio::sync::RwLock;

use crate::peer_pool::PeerTransport;
use crate::registration_store::RegistrationStore;

const INITIAL_BACKOFF_SECONDS: u64 = 15;
const MAX_BACKOFF_SECONDS: u64 = 300;
const JITTER_FRACTION: f64 = 0.2;

#[derive(Debug, Serialize)]
struct PendingWritePush<'a> {
    #[serde(rename = "relayKey")]
    relay_key: &'a str,
    state: &'a str,
    metadata: &'a serde_json::Value,
}

struct PendingWriteEntry {
    metadata_snapshot: serde_json::Value,
    attempts: u32,
    pending_since: i64,
    last_push_at: Option<i64>,
    acked: bool,
}

/// One entry per `relayKey` with an outstanding local write to announce.
pub struct PendingWritesPusher {
    transport: Arc<dyn PeerTransport>,
    registration_store: Arc<RegistrationStore>,
    entries: RwLock<HashMap<String, PendingWriteEntry>>,
}

impl PendingWritesPusher {
    #[must_use]
    pub fn new(transport: Arc<dyn PeerTransport>, registration_store: Arc<RegistrationStore>) -> Self {
        Self {
            transport,
            registration_store,
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Records (or refreshes the snapshot for) a pending write against
    /// `relay_key`. Starts the backoff clock the first time this is called
    /// since the last [`notify_cleared`](Self::notify_cleared).
    pub async fn record_pending(&self, relay_key: &str, metadata_snapshot: serde_json::Value) {
        let mut entries = self.entries.write().await;
        let entry = entries.entry(relay_key.to_string()).or_insert_with(|| PendingWriteEntry {
            metadata_snapshot: serde_json::Value::Null,
            attempts: 0,
            pending_since: now_unix(),
            last_push_at: None,
            acked: false,
        });
        entry.metadata_snapshot = metadata_snapshot;
    }

    /// One tick of the retry loop: pushes every entry whose backoff window
    /// has elapsed. Intended to be called on a periodic timer (e.g. every
    /// few seconds) by the gateway server's background task set.
    pub async fn tick(&self) {
        let due: Vec<String> = {
            let entries = self.entries.read().await;
            let now = now_unix();
            entries
                .iter()
                .filter(|(_, entry)| is_due(entry, now))
                .map(|(relay_key, _)| relay_key.clone())
                .collect()
        };
        for relay_key in due {
            self.push_one(&relay_key, "pending").await;
        }
    }

    /// Sends a final `state: "cleared"` push and cancels further retries
    /// (spec §4.8 `notifyCleared`).
    pub async fn notify_cleared(&self, relay_key: &str) {
        self.push_one(relay_key, "cleared").await;
        self.entries.write().await.remove(relay_key);
    }

    async fn push_one(&self, relay_key: &str, state: &str) {
        let Some(descriptor) = self.registration_store.get_relay(relay_key).await else {
            self.entries.write().await.remove(relay_key);
            return;
        };
        let metadata = self
            .entries
            .read()
            .await
            .get(relay_key)
            .map_or(serde_json::Value::Null, |e| e.metadata_snapshot.clone());

        let body = PendingWritePush { relay_key, state, metadata: &metadata };
        let Ok(payload) = serde_json::to_vec(&body) else {
            tracing::warn!(relay_key = %relay_key, "failed to encode pending-write push body");
            return;
        };

        let mut any_ack = false;
        for peer_id in &descriptor.peers {
            match self.transport.post_request(peer_id, "/gateway/pending-writes", &payload).await {
                Ok((status, _)) if (200..300).contains(&status) => any_ack = true,
                Ok((status, _)) => {
                    tracing::warn!(peer_id = %peer_id, relay_key = %relay_key, status, "pending-write push rejected");
                }
                Err(e) => {
                    tracing::warn!(peer_id = %peer_id, relay_key = %relay_key, error = %e, "pending-write push failed");
                }
            }
        }

        let mut entries = self.entries.write().await;
        if let Some(entry) = entries.get_mut(relay_key) {
            let now = now_unix();
            if any_ack && !entry.acked {
                let ack_delay = now - entry.pending_since;
                tracing::info!(relay_key = %relay_key, ack_delay_seconds = ack_delay, "observeAckDelay");
                entry.acked = true;
            }
            entry.attempts += 1;
            entry.last_push_at = Some(now);
        }
    }

    #[cfg(test)]
    async fn attempts_for(&self, relay_key: &str) -> Option<u32> {
        self.entries.read().await.get(relay_key).map(|e| e.attempts)
    }

    #[cfg(test)]
    async fn has_entry(&self, relay_key: &str) -> bool {
        self.entries.read().await.contains_key(relay_key)
    }
}

/// The first push for an entry is always due immediately; later ones wait
/// out the backoff for the attempt count already made (spec §4.8/§8
/// scenario 6: attempts 1-3 are *spaced by* ≈15s/30s/60s, not delayed
/// before the first one).
fn is_due(entry: &PendingWriteEntry, now: i64) -> bool {
    match entry.last_push_at {
        None => true,
        Some(last) => now >= last + backoff_seconds(entry.attempts.saturating_sub(1)) as i64,
    }
}

/// `15s * 2^attempts`, capped at `300s`, with `±20%` jitter (spec §4.8).
fn backoff_seconds(attempts: u32) -> u64 {
    let base = INITIAL_BACKOFF_SECONDS.saturating_mul(1u64 << attempts.min(10));
    let capped = base.min(MAX_BACKOFF_SECONDS);
    let jitter_span = (capped as f64 * JITTER_FRACTION) as i64;
    if jitter_span == 0 {
        return capped;
    }
    let jitter = rand::thread_rng().gen_range(-jitter_span..=jitter_span);
    (capped as i64 + jitter).max(1) as u64
}

fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
