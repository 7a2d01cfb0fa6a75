//! Local read (and lease-gated write) path over an embedded ordered
//! key/value log (spec §4.7).
//!
//! Keys carry index prefixes so range scans can answer `REQ` filters
//! without a full table scan: `id:<id>`, `created_at:<10-digit>:id:<id>`,
//! `kind:<5-digit>:created_at:…:id:<id>`, `pubkey:<hex>:created_at:…:id:<id>`,
//! `tagKey:<name>:tagValue:<v>:created_at:…:id:<id>`. Each index family gets
//! its own `sled::Tree` rather than one shared keyspace, so a scan over one
//! family never has to skip past another's entries.

use std::collections::BTreeSet;

use gateway_proto::{Filter, NostrEvent};
use sled::transaction::{ConflictableTransactionError, TransactionError};
use sled::Transactional;

use crate::error::{ErrorKind, GatewayError};

const DEFAULT_MAX_INDEX_SCAN: usize = 10_000;

/// `{length, downloaded, lag}` per spec §4.7.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplicaStats {
    pub length: u64,
    pub downloaded: u64,
    pub lag: u64,
}

/// Opaque event envelope plus a client-side decryption hint (spec §9's
/// two-phase encrypted replica read): the adapter never decrypts, it only
/// carries the hint alongside the raw event JSON.
#[derive(Debug, Clone)]
pub struct DecryptHint {
    pub algorithm: String,
    pub salt: String,
}

/// Wraps the embedded replica database for the local read/write fallback
/// path (spec §4.7).
pub struct ReplicaAdapter {
    by_id: sled::Tree,
    by_created_at: sled::Tree,
    by_kind: sled::Tree,
    by_pubkey: sled::Tree,
    by_tag: sled::Tree,
    lease_active: std::sync::atomic::AtomicBool,
    downloaded: std::sync::atomic::AtomicU64,
    max_index_scan: usize,
}

impl ReplicaAdapter {
    /// Opens (or creates) a replica database rooted at `db`.
    ///
    /// # Errors
    ///
    /// Returns a `sled::Error` if any of the index trees cannot be opened.
    pub fn open(db: &sled::Db) -> Result<Self, sled::Error> {
        Ok(Self {
            by_id: db.open_tree("idx_id")?,
            by_created_at: db.open_tree("idx_created_at")?,
            by_kind: db.open_tree("idx_kind")?,
            by_pubkey: db.open_tree("idx_pubkey")?,
            by_tag: db.open_tree("idx_tag")?,
            lease_active: std::sync::atomic::AtomicBool::new(false),
            downloaded: std::sync::atomic::AtomicU64::new(0),
            max_index_scan: DEFAULT_MAX_INDEX_SCAN,
        })
    }

    /// Grants or revokes the writer lease this adapter honors for `appendEvent`.
    pub fn set_lease_active(&self, active: bool) {
        self.lease_active.store(active, std::sync::atomic::Ordering::SeqCst);
    }

    /// Answers a set of `REQ` filters (spec §4.7 `query`).
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::Internal`] if the underlying store reports a
    /// read error.
    pub fn query(&self, filters: &[Filter]) -> Result<Vec<NostrEvent>, GatewayError> {
        let mut merged: Vec<NostrEvent> = Vec::new();
        let mut seen_ids: BTreeSet<String> = BTreeSet::new();

        for filter in filters {
            let candidates = if filter.is_id_lookup() {
                self.query_by_ids(filter)?
            } else {
                self.query_by_index(filter)?
            };
            for event in candidates {
                if seen_ids.insert(event.id.clone()) {
                    merged.push(event);
                }
            }
        }

        merged.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| a.id.cmp(&b.id)));

        let limit = filters.iter().filter_map(|f| f.limit).min().map(|l| l as usize);
        if let Some(limit) = limit {
            merged.truncate(limit);
        }
        Ok(merged)
    }

    fn query_by_ids(&self, filter: &Filter) -> Result<Vec<NostrEvent>, GatewayError> {
        let Some(ids) = &filter.ids else {
            return Ok(vec![]);
        };
        let mut out = Vec::new();
        for id in ids {
            if let Some(event) = self.get_by_id(id)? {
                if filter.matches(&event) {
                    out.push(event);
                }
            }
        }
        Ok(out)
    }

    fn get_by_id(&self, id: &str) -> Result<Option<NostrEvent>, GatewayError> {
        let key = format!("id:{id}");
        let raw = self
            .by_id
            .get(key.as_bytes())
            .map_err(|e| GatewayError::new(ErrorKind::Internal, e.to_string()))?;
        self.downloaded.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        match raw {
            Some(bytes) => {
                let event: NostrEvent = serde_json::from_slice(&bytes)
                    .map_err(|e| GatewayError::new(ErrorKind::Internal, e.to_string()))?;
                Ok(Some(event))
            }
            None => Ok(None),
        }
    }

    fn query_by_index(&self, filter: &Filter) -> Result<Vec<NostrEvent>, GatewayError> {
        let scan_cap = filter
            .limit
            .map(|l| (self.max_index_scan).min(l as usize * 4))
            .unwrap_or(self.max_index_scan);

        let mut groups: Vec<BTreeSet<String>> = Vec::new();

        for (tag_key, values) in &filter.tags {
            if !tag_key.starts_with('#') || values.is_empty() {
                continue;
            }
            let name = &tag_key[1..];
            let mut group = BTreeSet::new();
            for value in values {
                let prefix = format!("tagKey:{name}:tagValue:{value}:created_at:");
                group.extend(self.scan_ids(&self.by_tag, &prefix, scan_cap)?);
            }
            groups.push(group);
        }

        if let Some(authors) = &filter.authors {
            let mut group = BTreeSet::new();
            for author in authors {
                let prefix = format!("pubkey:{author}:created_at:");
                group.extend(self.scan_ids(&self.by_pubkey, &prefix, scan_cap)?);
            }
            groups.push(group);
        }

        if let Some(kinds) = &filter.kinds {
            let mut group = BTreeSet::new();
            for kind in kinds {
                let prefix = format!("kind:{kind:05}:created_at:");
                group.extend(self.scan_ids(&self.by_kind, &prefix, scan_cap)?);
            }
            groups.push(group);
        }

        let candidate_ids: BTreeSet<String> = if groups.is_empty() {
            self.scan_ids(&self.by_created_at, "created_at:", scan_cap)?
        } else {
            let mut iter = groups.into_iter();
            let mut acc = iter.next().unwrap_or_default();
            for group in iter {
                acc = acc.intersection(&group).cloned().collect();
            }
            acc
        };

        let mut out = Vec::new();
        for id in candidate_ids {
            if let Some(event) = self.get_by_id(&id)? {
                if filter.matches(&event) {
                    out.push(event);
                }
            }
        }
        Ok(out)
    }

    fn scan_ids(&self, tree: &sled::Tree, prefix: &str, cap: usize) -> Result<Vec<String>, GatewayError> {
        let mut out = Vec::new();
        for item in tree.scan_prefix(prefix.as_bytes()).take(cap) {
            let (key, _) = item.map_err(|e| GatewayError::new(ErrorKind::Internal, e.to_string()))?;
            let key_str = String::from_utf8_lossy(&key);
            if let Some(idx) = key_str.rfind(":id:") {
                out.push(key_str[idx + 4..].to_string());
            }
        }
        Ok(out)
    }

    /// Appends `event` at its id key plus every derived index key,
    /// atomically via a batched commit (spec §4.7). Fails with
    /// [`ErrorKind::ReplicaReadonly`] unless a writer lease is held.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::ReplicaReadonly`] if no lease is active, or
    /// [`ErrorKind::AppendError`] if the commit fails.
    pub fn append_event(&self, event: &NostrEvent) -> Result<(), GatewayError> {
        if !self.lease_active.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(GatewayError::new(ErrorKind::ReplicaReadonly, "no active writer lease"));
        }

        let json = serde_json::to_vec(event).map_err(|e| GatewayError::new(ErrorKind::AppendError, e.to_string()))?;
        let created_at_key = format!("{:010}:id:{}", event.created_at.max(0), event.id);

        let id_key = format!("id:{}", event.id);
        let ca_key = format!("created_at:{created_at_key}");
        let kind_key = format!("kind:{:05}:created_at:{created_at_key}", event.kind);
        let pubkey_key = format!("pubkey:{}:created_at:{created_at_key}", event.pubkey);
        let tag_keys: Vec<String> = event
            .tags
            .iter()
            .filter_map(|tag| {
                let (Some(name), Some(value)) = (tag.first(), tag.get(1)) else {
                    return None;
                };
                Some(format!("tagKey:{name}:tagValue:{value}:created_at:{created_at_key}"))
            })
            .collect();

        (&self.by_id, &self.by_created_at, &self.by_kind, &self.by_pubkey, &self.by_tag)
            .transaction(|(by_id, by_created_at, by_kind, by_pubkey, by_tag)| {
                by_id.insert(id_key.as_bytes(), json.as_slice())?;
                by_created_at.insert(ca_key.as_bytes(), &[] as &[u8])?;
                by_kind.insert(kind_key.as_bytes(), &[] as &[u8])?;
                by_pubkey.insert(pubkey_key.as_bytes(), &[] as &[u8])?;
                for tag_key in &tag_keys {
                    by_tag.insert(tag_key.as_bytes(), &[] as &[u8])?;
                }
                Ok::<(), ConflictableTransactionError<()>>(())
            })
            .map_err(|e: TransactionError<()>| GatewayError::new(ErrorKind::AppendError, e.to_string()))?;

        Ok(())
    }

    /// Returns `{length, downloaded, lag}` (spec §4.7).
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::Internal`] if the event count cannot be read.
    pub fn get_replica_stats(&self) -> Result<ReplicaStats, GatewayError> {
        let length = self.by_id.len() as u64;
        let downloaded = self.downloaded.load(std::sync::atomic::Ordering::Relaxed);
        Ok(ReplicaStats {
            length,
            downloaded,
            lag: length.saturating_sub(downloaded),
        })
    }

    /// Builds the two-phase decrypt hint for an encrypted-replica event
    /// (spec §9): the gateway returns the opaque JSON plus this hint and
    /// never touches plaintext itself.
    #[must_use]
    pub fn decrypt_hint(&self, algorithm: &str, salt: &str) -> DecryptHint {
        DecryptHint {
            algorithm: algorithm.to_string(),
            salt: salt.to_string(),
        }
    }
}
