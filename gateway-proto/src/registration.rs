//! Registration/deletion payload shapes posted to `/api/relays` (spec §6).

use serde::{Deserialize, Serialize};

/// Metadata attached to a relay registration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayMetadata {
    #[serde(default)]
    pub requires_auth: Option<bool>,
    #[serde(default)]
    pub is_replica: Option<bool>,
    #[serde(default)]
    pub gateway_path: Option<String>,
    #[serde(default)]
    pub connection_url: Option<String>,
    #[serde(default)]
    pub lease_active: Option<bool>,
}

/// The body of a signed registration (`POST /api/relays`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistrationPayload {
    pub relay_key: String,
    pub identifier: String,
    #[serde(default)]
    pub peers: Vec<String>,
    #[serde(default)]
    pub metadata: RelayMetadata,
}

/// Generic signed envelope: `{ registration: T, signature: <hex hmac> }`
/// on the wire (spec §6), regardless of which payload `T` actually is —
/// the field keeps the spec's wire name via `serde(rename)` while the Rust
/// field reads as what it holds.
///
/// `POST /api/relays` wraps a [`RegistrationPayload`] this way; the token
/// endpoints (spec §4.6) reuse the same envelope shape for their own
/// bodies. `DELETE /api/relays/:relayKey` instead carries its signature in
/// an `X-Signature` header over the raw path bytes — see
/// `gateway_relay::gateway_server` for that variant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Signed<T> {
    #[serde(rename = "registration")]
    pub payload: T,
    pub signature: String,
}

impl<T: Serialize> Signed<T> {
    /// Serializes the inner payload to the canonical bytes the signature
    /// was computed over (the struct's own field order, per
    /// `SPEC_FULL.md` §6's deterministic-serialization note).
    ///
    /// # Errors
    ///
    /// Returns a `serde_json` error if `T` cannot be serialized.
    pub fn canonical_payload_bytes(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(&self.payload)
    }
}
