//! The opaque bearer token envelope (spec §4.6, §6):
//! `base64(JSON payload).base64(HMAC)`.
//!
//! This is deliberately distinct from [`crate::signing`]'s hex encoding —
//! the spec treats registration signatures and the token envelope as two
//! separately-specified formats, and this crate keeps them in separate
//! modules so a future change to one doesn't silently couple to the other.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// The signed, opaque-to-clients payload inside a token envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenPayload {
    pub relay_key: String,
    pub relay_auth_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pubkey: Option<String>,
    pub scope: String,
    pub expires_at: i64,
    pub sequence: u64,
}

/// Errors encoding or decoding a token envelope.
#[derive(Debug, thiserror::Error)]
pub enum TokenCodecError {
    #[error("payload serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("malformed token envelope: expected exactly one '.' separator")]
    MalformedEnvelope,
    #[error("token payload is not valid base64")]
    InvalidBase64,
    #[error("token signature is not valid base64")]
    InvalidSignatureBase64,
    #[error("invalid secret key")]
    InvalidKey,
    #[error("token signature mismatch")]
    SignatureMismatch,
}

/// Encodes and decodes [`TokenPayload`]s into the opaque bearer string.
pub struct TokenEnvelope;

impl TokenEnvelope {
    /// Encodes `payload` into `base64(json).base64(hmac)`, signed with `secret`.
    ///
    /// # Errors
    ///
    /// Returns [`TokenCodecError::Serialize`] if `payload` cannot be
    /// serialized, or [`TokenCodecError::InvalidKey`] if `secret` cannot key
    /// an HMAC instance.
    pub fn encode(payload: &TokenPayload, secret: &[u8]) -> Result<String, TokenCodecError> {
        let payload_json = serde_json::to_vec(payload)?;
        let mut mac =
            HmacSha256::new_from_slice(secret).map_err(|_| TokenCodecError::InvalidKey)?;
        mac.update(&payload_json);
        let digest = mac.finalize().into_bytes();
        Ok(format!(
            "{}.{}",
            BASE64.encode(payload_json),
            BASE64.encode(digest)
        ))
    }

    /// Decodes `token` into its payload without verifying the signature.
    ///
    /// Callers that need an authenticated payload should use [`Self::decode_and_verify`].
    ///
    /// # Errors
    ///
    /// Returns [`TokenCodecError`] if the envelope is malformed.
    pub fn decode(token: &str) -> Result<TokenPayload, TokenCodecError> {
        let (payload_b64, _sig_b64) = split_envelope(token)?;
        let payload_json = BASE64
            .decode(payload_b64)
            .map_err(|_| TokenCodecError::InvalidBase64)?;
        Ok(serde_json::from_slice(&payload_json)?)
    }

    /// Decodes `token` and verifies its HMAC signature under `secret`.
    ///
    /// # Errors
    ///
    /// Returns [`TokenCodecError::SignatureMismatch`] if the signature does
    /// not match, or another [`TokenCodecError`] variant if the envelope is
    /// malformed.
    pub fn decode_and_verify(token: &str, secret: &[u8]) -> Result<TokenPayload, TokenCodecError> {
        let (payload_b64, sig_b64) = split_envelope(token)?;
        let payload_json = BASE64
            .decode(payload_b64)
            .map_err(|_| TokenCodecError::InvalidBase64)?;
        let signature = BASE64
            .decode(sig_b64)
            .map_err(|_| TokenCodecError::InvalidSignatureBase64)?;

        let mut mac =
            HmacSha256::new_from_slice(secret).map_err(|_| TokenCodecError::InvalidKey)?;
        mac.update(&payload_json);
        mac.verify_slice(&signature)
            .map_err(|_| TokenCodecError::SignatureMismatch)?;

        Ok(serde_json::from_slice(&payload_json)?)
    }
}

fn split_envelope(token: &str) -> Result<(&str, &str), TokenCodecError> {
    let mut parts = token.splitn(2, '.');
    let payload = parts.next().ok_or(TokenCodecError::MalformedEnvelope)?;
    let sig = parts.next().ok_or(TokenCodecError::MalformedEnvelope)?;
    if payload.is_empty() || sig.is_empty() {
        return Err(TokenCodecError::MalformedEnvelope);
    }
    Ok((payload, sig))
}
