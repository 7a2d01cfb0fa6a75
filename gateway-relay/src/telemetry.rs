//! Peer health telemetry (spec §3, §9): a schema-validated struct the peer
//! pool ingests from workers and the dispatcher scores against. Unknown
//! fields in the wire payload are discarded rather than propagated, per
//! spec §9's guidance on duck-typed telemetry payloads.

use serde::Deserialize;

/// Rolling health snapshot for one peer.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct PeerTelemetry {
    pub latency_ms: f64,
    pub in_flight_jobs: u32,
    /// Exponential moving average of recent failures, in `[0.0, 1.0]`.
    pub failure_rate: f64,
    pub replica_lag: u64,
    pub replica_version: u64,
    pub queue_depth: u32,
    pub reported_at: i64,
    pub token_expires_at: Option<i64>,
    pub circuit_breaker_open_until: Option<i64>,
}

impl Default for PeerTelemetry {
    fn default() -> Self {
        Self {
            latency_ms: 0.0,
            in_flight_jobs: 0,
            failure_rate: 0.0,
            replica_lag: 0,
            replica_version: 0,
            queue_depth: 0,
            reported_at: 0,
            token_expires_at: None,
            circuit_breaker_open_until: None,
        }
    }
}

impl PeerTelemetry {
    /// Merges an incoming report into this snapshot, honoring the spec §5
    /// monotonic-`reportedAt` ordering guarantee: an out-of-order (older)
    /// report is ignored.
    pub fn merge(&mut self, incoming: PeerTelemetry) {
        if incoming.reported_at < self.reported_at {
            return;
        }
        *self = incoming;
    }

    /// `true` if a circuit breaker opened against this peer is still active
    /// at `now` (unix millis).
    #[must_use]
    pub fn is_circuit_open(&self, now_ms: i64) -> bool {
        self.circuit_breaker_open_until.is_some_and(|until| now_ms < until)
    }
}
