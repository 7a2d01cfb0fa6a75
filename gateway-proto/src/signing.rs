//! Canonical HMAC-SHA256 signing for registration and deletion payloads.
//!
//! Registration/deletion signatures travel as hex (`X-Signature` header or
//! a `signature` envelope field); see [`crate::token`] for the token
//! envelope's own base64-based encoding, which the source treats as a
//! distinct format.

use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Errors from signing or verifying a canonical payload.
#[derive(Debug, thiserror::Error)]
pub enum SigningError {
    /// The shared secret could not key an HMAC instance.
    #[error("invalid secret key")]
    InvalidKey,
    /// The presented signature was not valid hex.
    #[error("signature is not valid hex")]
    InvalidHex,
    /// The signature did not match the payload under the secret.
    #[error("signature mismatch")]
    Mismatch,
}

/// Signs `payload` with `secret`, returning the HMAC-SHA256 digest as lowercase hex.
///
/// # Errors
///
/// Returns [`SigningError::InvalidKey`] if `secret` cannot key an HMAC
/// instance (HMAC-SHA256 accepts any key length, so this is effectively
/// infallible, but the API stays fallible to mirror `verify_hex`).
pub fn sign_hex(payload: &[u8], secret: &[u8]) -> Result<String, SigningError> {
    let mut mac = HmacSha256::new_from_slice(secret).map_err(|_| SigningError::InvalidKey)?;
    mac.update(payload);
    Ok(hex_encode(&mac.finalize().into_bytes()))
}

/// Verifies that `signature_hex` is the HMAC-SHA256 of `payload` under `secret`.
///
/// Uses constant-time comparison via [`Mac::verify_slice`].
///
/// # Errors
///
/// Returns [`SigningError::InvalidKey`], [`SigningError::InvalidHex`], or
/// [`SigningError::Mismatch`] depending on which check fails.
pub fn verify_hex(payload: &[u8], signature_hex: &str, secret: &[u8]) -> Result<(), SigningError> {
    let mut mac = HmacSha256::new_from_slice(secret).map_err(|_| SigningError::InvalidKey)?;
    mac.update(payload);
    let expected = hex_decode(signature_hex).ok_or(SigningError::InvalidHex)?;
    mac.verify_slice(&expected)
        .map_err(|_| SigningError::Mismatch)
}

fn hex_encode(bytes: &[u8]) -> String {
    use std::fmt::Write;
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        let _ = write!(out, "{byte:02x}");
    }
    out
}

fn hex_decode(s: &str) -> Option<Vec<u8>> {
    if s.len() % 2 != 0 {
        return None;
    }
    (0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(s.get(i..i + 2)?, 16).ok())
        .collect()
}
