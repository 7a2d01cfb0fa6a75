//! Relay descriptor and token-metadata persistence (spec §4.2).
//!
//! `RegistrationStore` is an enum rather than a trait object: spec §9's
//! design notes call for "a capability interface with
//! `upsertRelay/getRelay/…` and a small set of variants; dispatch by
//! interface, not inheritance" — an enum with inherent methods is that
//! interface without the `dyn`-compatibility and allocation overhead of a
//! trait object, matching how the source's own two concrete variants are
//! described.

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

/// A registered relay's descriptor (spec §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayDescriptor {
    pub relay_key: String,
    pub identifier: String,
    pub peers: Vec<String>,
    pub metadata: gateway_proto::RelayMetadata,
    pub registered_at: i64,
    pub updated_at: i64,
}

/// Per-relay token metadata tracked alongside the descriptor (spec §4.6).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TokenMetadata {
    pub sequence: u64,
    pub current_token: Option<String>,
    pub revoked_at: Option<i64>,
    pub last_validated_at: Option<i64>,
}

#[derive(Clone)]
struct Entry<T> {
    value: T,
    expires_at: Option<i64>,
}

struct InMemoryStore {
    relays: RwLock<HashMap<String, Entry<RelayDescriptor>>>,
    tokens: RwLock<HashMap<String, Entry<TokenMetadata>>>,
    ttl_seconds: u64,
}

impl InMemoryStore {
    fn new(ttl_seconds: u64) -> Self {
        Self {
            relays: RwLock::new(HashMap::new()),
            tokens: RwLock::new(HashMap::new()),
            ttl_seconds,
        }
    }
}

/// Relay descriptor + token metadata persistence, with an in-memory and a
/// remote-cache (redis) variant (spec §4.2).
pub enum RegistrationStore {
    InMemory(InMemoryStore),
    RemoteCache {
        client: redis::Client,
        namespace: String,
        ttl_seconds: u64,
        /// Dev-only fallback (spec §4.2 failure mode): used, and a warning
        /// logged, whenever the remote cache is unreachable.
        fallback: InMemoryStore,
    },
}

impl RegistrationStore {
    #[must_use]
    pub fn in_memory(ttl_seconds: u64) -> Self {
        Self::InMemory(InMemoryStore::new(ttl_seconds))
    }

    /// Builds a remote-cache-backed store. Does not connect eagerly; the
    /// first operation establishes (and on failure, falls back from) the
    /// connection.
    ///
    /// # Errors
    ///
    /// Returns a `redis::RedisError` if `url` cannot be parsed into a client.
    pub fn remote_cache(
        url: &str,
        namespace: impl Into<String>,
        ttl_seconds: u64,
    ) -> Result<Self, redis::RedisError> {
        let client = redis::Client::open(url)?;
        Ok(Self::RemoteCache {
            client,
            namespace: namespace.into(),
            ttl_seconds,
            fallback: InMemoryStore::new(ttl_seconds),
        })
    }

    fn relay_cache_key(namespace: &str, relay_key: &str) -> String {
        format!("{namespace}:relay:{relay_key}")
    }

    fn token_cache_key(namespace: &str, relay_key: &str) -> String {
        format!("{namespace}:token:{relay_key}")
    }

    /// Inserts or replaces a relay descriptor (spec §4.2).
    pub async fn upsert_relay(&self, descriptor: RelayDescriptor) {
        match self {
            Self::InMemory(store) => Self::upsert_relay_memory(store, descriptor).await,
            Self::RemoteCache {
                client,
                namespace,
                ttl_seconds,
                fallback,
            } => {
                let key = Self::relay_cache_key(namespace, &descriptor.relay_key);
                match client.get_multiplexed_async_connection().await {
                    Ok(mut conn) => {
                        let Ok(json) = serde_json::to_string(&descriptor) else {
                            return;
                        };
                        if let Err(e) = conn
                            .set_ex::<_, _, ()>(&key, json, *ttl_seconds)
                            .await
                        {
                            tracing::warn!(error = %e, "remote cache write failed, falling back to memory");
                            Self::upsert_relay_memory(fallback, descriptor).await;
                        }
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "remote cache unreachable, falling back to memory");
                        Self::upsert_relay_memory(fallback, descriptor).await;
                    }
                }
            }
        }
    }

    async fn upsert_relay_memory(store: &InMemoryStore, descriptor: RelayDescriptor) {
        let expires_at = if store.ttl_seconds == 0 {
            None
        } else {
            Some(now_unix() + store.ttl_seconds as i64)
        };
        let mut relays = store.relays.write().await;
        relays.insert(
            descriptor.relay_key.clone(),
            Entry {
                value: descriptor,
                expires_at,
            },
        );
    }

    /// Looks up a relay descriptor; returns `None` for missing or expired entries.
    pub async fn get_relay(&self, relay_key: &str) -> Option<RelayDescriptor> {
        match self {
            Self::InMemory(store) => Self::get_relay_memory(store, relay_key).await,
            Self::RemoteCache {
                client,
                namespace,
                fallback,
                ..
            } => {
                let key = Self::relay_cache_key(namespace, relay_key);
                match client.get_multiplexed_async_connection().await {
                    Ok(mut conn) => match conn.get::<_, Option<String>>(&key).await {
                        Ok(Some(json)) => serde_json::from_str(&json).ok(),
                        Ok(None) => None,
                        Err(e) => {
                            tracing::warn!(error = %e, "remote cache read failed, falling back to memory");
                            Self::get_relay_memory(fallback, relay_key).await
                        }
                    },
                    Err(e) => {
                        tracing::warn!(error = %e, "remote cache unreachable, falling back to memory");
                        Self::get_relay_memory(fallback, relay_key).await
                    }
                }
            }
        }
    }

    async fn get_relay_memory(store: &InMemoryStore, relay_key: &str) -> Option<RelayDescriptor> {
        let relays = store.relays.read().await;
        let entry = relays.get(relay_key)?;
        if entry.expires_at.is_some_and(|exp| now_unix() >= exp) {
            return None;
        }
        Some(entry.value.clone())
    }

    /// Removes a relay descriptor, returning whether one existed.
    pub async fn remove_relay(&self, relay_key: &str) -> bool {
        match self {
            Self::InMemory(store) => {
                store.relays.write().await.remove(relay_key).is_some()
            }
            Self::RemoteCache {
                client,
                namespace,
                fallback,
                ..
            } => {
                let key = Self::relay_cache_key(namespace, relay_key);
                match client.get_multiplexed_async_connection().await {
                    Ok(mut conn) => conn.del::<_, i64>(&key).await.unwrap_or(0) > 0,
                    Err(e) => {
                        tracing::warn!(error = %e, "remote cache unreachable, falling back to memory");
                        fallback.relays.write().await.remove(relay_key).is_some()
                    }
                }
            }
        }
    }

    /// Stores token metadata for `relay_key`, idempotent on repeated writes.
    pub async fn store_token_metadata(&self, relay_key: &str, metadata: TokenMetadata) {
        match self {
            Self::InMemory(store) => {
                Self::store_token_metadata_memory(store, relay_key, metadata).await;
            }
            Self::RemoteCache {
                client,
                namespace,
                ttl_seconds,
                fallback,
            } => {
                let key = Self::token_cache_key(namespace, relay_key);
                match client.get_multiplexed_async_connection().await {
                    Ok(mut conn) => {
                        let Ok(json) = serde_json::to_string(&metadata) else {
                            return;
                        };
                        if let Err(e) = conn.set_ex::<_, _, ()>(&key, json, *ttl_seconds).await {
                            tracing::warn!(error = %e, "remote cache write failed, falling back to memory");
                            Self::store_token_metadata_memory(fallback, relay_key, metadata).await;
                        }
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "remote cache unreachable, falling back to memory");
                        Self::store_token_metadata_memory(fallback, relay_key, metadata).await;
                    }
                }
            }
        }
    }

    async fn store_token_metadata_memory(store: &InMemoryStore, relay_key: &str, metadata: TokenMetadata) {
        let expires_at = if store.ttl_seconds == 0 {
            None
        } else {
            Some(now_unix() + store.ttl_seconds as i64)
        };
        let mut tokens = store.tokens.write().await;
        tokens.insert(
            relay_key.to_string(),
            Entry {
                value: metadata,
                expires_at,
            },
        );
    }

    /// Retrieves token metadata for `relay_key`, if present and unexpired.
    pub async fn get_token_metadata(&self, relay_key: &str) -> Option<TokenMetadata> {
        match self {
            Self::InMemory(store) => Self::get_token_metadata_memory(store, relay_key).await,
            Self::RemoteCache {
                client,
                namespace,
                fallback,
                ..
            } => {
                let key = Self::token_cache_key(namespace, relay_key);
                match client.get_multiplexed_async_connection().await {
                    Ok(mut conn) => match conn.get::<_, Option<String>>(&key).await {
                        Ok(Some(json)) => serde_json::from_str(&json).ok(),
                        Ok(None) => None,
                        Err(e) => {
                            tracing::warn!(error = %e, "remote cache read failed, falling back to memory");
                            Self::get_token_metadata_memory(fallback, relay_key).await
                        }
                    },
                    Err(e) => {
                        tracing::warn!(error = %e, "remote cache unreachable, falling back to memory");
                        Self::get_token_metadata_memory(fallback, relay_key).await
                    }
                }
            }
        }
    }

    async fn get_token_metadata_memory(store: &InMemoryStore, relay_key: &str) -> Option<TokenMetadata> {
        let tokens = store.tokens.read().await;
        let entry = tokens.get(relay_key)?;
        if entry.expires_at.is_some_and(|exp| now_unix() >= exp) {
            return None;
        }
        Some(entry.value.clone())
    }

    /// Sweeps expired entries from the in-memory variant (a no-op for the
    /// remote-cache variant, whose `EX` TTL prunes itself). Idempotent.
    pub async fn prune_expired(&self) {
        let now = now_unix();
        let prune_memory = |store: &InMemoryStore| async move {
            let mut relays = store.relays.write().await;
            relays.retain(|_, entry| entry.expires_at.is_none_or(|exp| now < exp));
            drop(relays);
            let mut tokens = store.tokens.write().await;
            tokens.retain(|_, entry| entry.expires_at.is_none_or(|exp| now < exp));
        };
        match self {
            Self::InMemory(store) => prune_memory(store).await,
            Self::RemoteCache { fallback, .. } => prune_memory(fallback).await,
        }
    }

    /// Releases resources held by this store (remote-cache connections are
    /// per-call here, so this is a no-op hook kept for interface symmetry).
    pub async fn disconnect(&self) {}
}

fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
