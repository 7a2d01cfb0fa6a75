//! The central error funnel (spec §7): every subsystem raises a typed
//! error here, and the session manager / gateway server are the only
//! places that decide the user-visible outcome (HTTP status or WS close
//! code).

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

/// Stable error-kind labels (spec §7), used both for logging and as metric
/// label values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    ConfigMissing,
    RegistrationMissing,
    SignatureInvalid,
    TokenRequired,
    TokenInvalid,
    RelayMismatch,
    TokenExpired,
    TokenRevoked,
    TokenStale,
    NoActiveToken,
    TokenMismatch,
    RelayNotRegistered,
    PeerUnreachable,
    PeerTimeout,
    NoPeers,
    ReplicaUnavailable,
    ReplicaReadonly,
    DispatcherRejected,
    AppendError,
    FrameMalformed,
    Internal,
}

impl ErrorKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ConfigMissing => "config-missing",
            Self::RegistrationMissing => "registration-missing",
            Self::SignatureInvalid => "signature-invalid",
            Self::TokenRequired => "token-required",
            Self::TokenInvalid => "token-invalid",
            Self::RelayMismatch => "relay-mismatch",
            Self::TokenExpired => "token-expired",
            Self::TokenRevoked => "token-revoked",
            Self::TokenStale => "token-stale",
            Self::NoActiveToken => "no-active-token",
            Self::TokenMismatch => "token-mismatch",
            Self::RelayNotRegistered => "relay-not-registered",
            Self::PeerUnreachable => "peer-unreachable",
            Self::PeerTimeout => "peer-timeout",
            Self::NoPeers => "no-peers",
            Self::ReplicaUnavailable => "replica-unavailable",
            Self::ReplicaReadonly => "replica-readonly",
            Self::DispatcherRejected => "dispatcher-rejected",
            Self::AppendError => "append-error",
            Self::FrameMalformed => "frame-malformed",
            Self::Internal => "internal",
        }
    }

    /// Maps this error kind to its HTTP status per spec §7's propagation policy.
    #[must_use]
    pub fn http_status(self) -> StatusCode {
        match self {
            Self::RegistrationMissing | Self::RelayNotRegistered => StatusCode::NOT_FOUND,
            Self::SignatureInvalid
            | Self::TokenRequired
            | Self::TokenInvalid
            | Self::TokenExpired
            | Self::TokenRevoked
            | Self::TokenStale
            | Self::TokenMismatch
            | Self::RelayMismatch => StatusCode::UNAUTHORIZED,
            Self::ConfigMissing | Self::ReplicaUnavailable | Self::NoPeers => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            Self::FrameMalformed | Self::DispatcherRejected | Self::ReplicaReadonly => {
                StatusCode::BAD_REQUEST
            }
            Self::PeerUnreachable | Self::PeerTimeout | Self::AppendError | Self::NoActiveToken => {
                StatusCode::BAD_GATEWAY
            }
            Self::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// A typed gateway error carrying a stable kind label and a human message.
#[derive(Debug, thiserror::Error)]
#[error("{kind:?}: {message}")]
pub struct GatewayError {
    pub kind: ErrorKind,
    pub message: String,
}

impl GatewayError {
    #[must_use]
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        tracing::warn!(kind = self.kind.as_str(), message = %self.message, "request failed");
        let status = self.kind.http_status();
        let body = ErrorBody {
            error: self.message,
        };
        (status, axum::Json(body)).into_response()
    }
}

/// WebSocket application-level close codes (spec §4.9).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseCode {
    Internal = 1011,
    NoPeersAvailable = 1013,
    TokenRejected = 4403,
    RelayNotFound = 4404,
}

impl CloseCode {
    #[must_use]
    pub fn code(self) -> u16 {
        self as u16
    }
}
