//! Issues, refreshes, verifies, and revokes per-relay bearer tokens (spec §4.6).
//!
//! Sequence monotonicity (spec §5, testable property 1) is enforced here and
//! nowhere else: every mutation goes through [`TokenService`], which reads
//! the stored [`TokenMetadata`] from the [`RegistrationStore`], computes the
//! next sequence, and writes it back before returning the new envelope.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use gateway_proto::{TokenEnvelope, TokenPayload};

use crate::error::{ErrorKind, GatewayError};
use crate::registration_store::{RegistrationStore, TokenMetadata};

/// Parameters for issuing or refreshing a token.
pub struct IssueRequest {
    pub relay_auth_token: String,
    pub pubkey: Option<String>,
    pub scope: String,
    pub ttl_seconds: u64,
}

/// The result of a successful issue/refresh: opaque bearer token plus the
/// record the gateway retains.
#[derive(Debug, Clone)]
pub struct IssuedToken {
    pub token: String,
    pub sequence: u64,
    pub issued_at: i64,
    pub expires_at: i64,
    pub refresh_after: i64,
}

/// Issues/refreshes/verifies/revokes relay bearer tokens against a shared
/// secret and a [`RegistrationStore`] for durable sequence/metadata state.
pub struct TokenService {
    store: Arc<RegistrationStore>,
    shared_secret: Vec<u8>,
    refresh_window_seconds: u64,
}

impl TokenService {
    #[must_use]
    pub fn new(store: Arc<RegistrationStore>, shared_secret: Vec<u8>, refresh_window_seconds: u64) -> Self {
        Self {
            store,
            shared_secret,
            refresh_window_seconds,
        }
    }

    /// Issues a new token for `relay_key` (spec §4.6).
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::RelayNotRegistered`] if no descriptor exists for
    /// `relay_key`, or [`ErrorKind::Internal`] if the envelope cannot be encoded.
    pub async fn issue_token(&self, relay_key: &str, request: IssueRequest) -> Result<IssuedToken, GatewayError> {
        if self.store.get_relay(relay_key).await.is_none() {
            return Err(GatewayError::new(
                ErrorKind::RelayNotRegistered,
                format!("relay {relay_key} is not registered"),
            ));
        }
        let existing = self.store.get_token_metadata(relay_key).await.unwrap_or_default();
        let sequence = existing.sequence + 1;
        self.issue_with_sequence(relay_key, request, sequence).await
    }

    /// Refreshes a presented token (spec §4.6): verifies it matches the
    /// stored token, then reissues with an advanced sequence.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::NoActiveToken`] if no token is on record,
    /// [`ErrorKind::TokenMismatch`] if `presented_token` doesn't match it, or
    /// [`ErrorKind::RelayNotRegistered`] if the relay is gone.
    pub async fn refresh_token(
        &self,
        relay_key: &str,
        presented_token: &str,
        ttl_seconds: u64,
    ) -> Result<IssuedToken, GatewayError> {
        if self.store.get_relay(relay_key).await.is_none() {
            return Err(GatewayError::new(
                ErrorKind::RelayNotRegistered,
                format!("relay {relay_key} is not registered"),
            ));
        }
        let existing = self.store.get_token_metadata(relay_key).await.unwrap_or_default();
        let Some(current) = &existing.current_token else {
            return Err(GatewayError::new(ErrorKind::NoActiveToken, "no active token to refresh"));
        };
        if current != presented_token {
            return Err(GatewayError::new(ErrorKind::TokenMismatch, "presented token does not match stored token"));
        }
        let payload = TokenEnvelope::decode(current)
            .map_err(|e| GatewayError::new(ErrorKind::TokenInvalid, e.to_string()))?;
        let request = IssueRequest {
            relay_auth_token: payload.relay_auth_token,
            pubkey: payload.pubkey,
            scope: payload.scope,
            ttl_seconds,
        };
        self.issue_with_sequence(relay_key, request, existing.sequence + 1).await
    }

    async fn issue_with_sequence(
        &self,
        relay_key: &str,
        request: IssueRequest,
        sequence: u64,
    ) -> Result<IssuedToken, GatewayError> {
        let issued_at = now_unix();
        let expires_at = issued_at + request.ttl_seconds as i64;
        let refresh_after = expires_at - self.refresh_window_seconds as i64;

        let payload = TokenPayload {
            relay_key: relay_key.to_string(),
            relay_auth_token: request.relay_auth_token,
            pubkey: request.pubkey,
            scope: request.scope,
            expires_at,
            sequence,
        };
        let token = TokenEnvelope::encode(&payload, &self.shared_secret)
            .map_err(|e| GatewayError::new(ErrorKind::Internal, e.to_string()))?;

        self.store
            .store_token_metadata(
                relay_key,
                TokenMetadata {
                    sequence,
                    current_token: Some(token.clone()),
                    revoked_at: None,
                    last_validated_at: None,
                },
            )
            .await;

        Ok(IssuedToken {
            token,
            sequence,
            issued_at,
            expires_at,
            refresh_after,
        })
    }

    /// Revokes the active token for `relay_key` (spec §4.6). Returns the new
    /// sequence so the gateway server can broadcast `TOKEN REVOKED`.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::RelayNotRegistered`] if the relay is unknown.
    pub async fn revoke_token(&self, relay_key: &str) -> Result<u64, GatewayError> {
        if self.store.get_relay(relay_key).await.is_none() {
            return Err(GatewayError::new(
                ErrorKind::RelayNotRegistered,
                format!("relay {relay_key} is not registered"),
            ));
        }
        let existing = self.store.get_token_metadata(relay_key).await.unwrap_or_default();
        let sequence = existing.sequence + 1;
        self.store
            .store_token_metadata(
                relay_key,
                TokenMetadata {
                    sequence,
                    current_token: None,
                    revoked_at: Some(now_unix()),
                    last_validated_at: existing.last_validated_at,
                },
            )
            .await;
        Ok(sequence)
    }

    /// Verifies a presented token for `relay_key` (spec §4.6): signature,
    /// expiry, relay match, revocation, and sequence staleness.
    ///
    /// # Errors
    ///
    /// Returns the specific stable [`ErrorKind`] describing the first check
    /// that failed.
    pub async fn verify_token(&self, token: &str, relay_key: &str) -> Result<TokenPayload, GatewayError> {
        let payload = TokenEnvelope::decode_and_verify(token, &self.shared_secret)
            .map_err(|_| GatewayError::new(ErrorKind::TokenInvalid, "token signature invalid"))?;

        if payload.relay_key != relay_key {
            return Err(GatewayError::new(ErrorKind::RelayMismatch, "token was issued for a different relay"));
        }
        if payload.expires_at <= now_unix() {
            return Err(GatewayError::new(ErrorKind::TokenExpired, "token has expired"));
        }

        let metadata = self.store.get_token_metadata(relay_key).await.unwrap_or_default();
        if metadata.revoked_at.is_some() && metadata.current_token.is_none() {
            return Err(GatewayError::new(ErrorKind::TokenRevoked, "token has been revoked"));
        }
        if payload.sequence < metadata.sequence {
            return Err(GatewayError::new(ErrorKind::TokenStale, "token sequence is stale"));
        }

        let mut updated = metadata;
        updated.last_validated_at = Some(now_unix());
        self.store.store_token_metadata(relay_key, updated).await;

        Ok(payload)
    }
}

fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
