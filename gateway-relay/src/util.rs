//! Small cross-cutting helpers: identifier normalization and connection keys.

use rand::RngCore;

/// Splits a gateway path of the form `/<prefix>/<tail>` into its
/// `relayKey = "<prefix>:<tail>"` form, and the reverse.
///
/// The source's `#toColonIdentifier`/`#toGatewayPath` conversions were
/// ambiguous when the tail itself contained a separator; this fixes a
/// single rule (spec §9 open question 1): only the *first* `/` or `:`
/// is treated as the separator, everything after it is the tail verbatim.
pub struct Identifier;

impl Identifier {
    /// `"<prefix>/<tail...>"` (no leading slash) → `"<prefix>:<tail...>"`.
    #[must_use]
    pub fn path_to_relay_key(path: &str) -> Option<String> {
        let path = path.trim_start_matches('/');
        let (prefix, tail) = path.split_once('/')?;
        if prefix.is_empty() || tail.is_empty() {
            return None;
        }
        Some(format!("{prefix}:{tail}"))
    }

    /// `"<prefix>:<tail...>"` → `"<prefix>/<tail...>"`.
    #[must_use]
    pub fn relay_key_to_path(relay_key: &str) -> Option<String> {
        let (prefix, tail) = relay_key.split_once(':')?;
        if prefix.is_empty() || tail.is_empty() {
            return None;
        }
        Some(format!("{prefix}/{tail}"))
    }

    /// Accepts a `/drive/<identifier>/<file>` identifier segment using either
    /// separator and resolves it to the canonical `relayKey`.
    #[must_use]
    pub fn drive_identifier_to_relay_key(identifier: &str) -> Option<String> {
        if let Some((prefix, tail)) = identifier.split_once(':') {
            if prefix.is_empty() || tail.is_empty() {
                return None;
            }
            return Some(format!("{prefix}:{tail}"));
        }
        Self::path_to_relay_key(&format!("/{identifier}"))
    }
}

/// Generates a 16-random-byte hex `connectionKey` (spec §4.4 step 5).
#[must_use]
pub fn generate_connection_key() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    let mut out = String::with_capacity(32);
    for byte in bytes {
        use std::fmt::Write;
        let _ = write!(out, "{byte:02x}");
    }
    out
}
