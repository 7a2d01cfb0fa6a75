//! Outbound peer transport pool (spec §4.3): at most one live connection
//! per `PeerId`, serialized dials, periodic health sweeps, and a telemetry
//! sink feeding the dispatcher.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use gateway_proto::ClientFrame;
use tokio::sync::{Mutex, RwLock};

use crate::dispatcher::RelayDispatcher;
use crate::error::{ErrorKind, GatewayError};
use crate::telemetry::PeerTelemetry;

/// A server-side-received frame, ready to render back to the client.
pub type ResponseFrame = String;

/// The abstract transport to a worker peer (spec §6's "Peer RPC calls").
/// The concrete implementation (the peer mesh's wire protocol) is external
/// to this core; this trait is the seam the session manager, dispatcher,
/// and peer pool code against.
#[async_trait]
pub trait PeerTransport: Send + Sync {
    /// Dials `peer_id` and performs a handshake, if not already connected.
    async fn dial(&self, peer_id: &str) -> Result<(), GatewayError>;

    /// Sends a protocol ping; used by the health sweep.
    async fn ping(&self, peer_id: &str) -> Result<(), GatewayError>;

    /// Forwards a client frame to `peer_id` for `relay_key` and returns
    /// whatever response frames the peer produced synchronously.
    async fn forward(
        &self,
        peer_id: &str,
        relay_key: &str,
        frame: &ClientFrame,
        connection_key: &str,
        relay_auth_token: &str,
    ) -> Result<Vec<ResponseFrame>, GatewayError>;

    /// Polls queued events the peer has accumulated for this session since
    /// the last poll.
    async fn poll_events(
        &self,
        peer_id: &str,
        relay_key: &str,
        connection_key: &str,
        relay_auth_token: &str,
    ) -> Result<Vec<ResponseFrame>, GatewayError>;

    /// Fetches a content-addressed blob for the `/drive` read-through route.
    async fn fetch_blob(
        &self,
        peer_id: &str,
        drive_identifier: &str,
        file_hash: &str,
    ) -> Result<(u16, Vec<u8>), GatewayError>;

    /// Issues a generic HTTP-shaped request over the peer transport (used
    /// by the pending-write pusher).
    async fn post_request(
        &self,
        peer_id: &str,
        path: &str,
        body: &[u8],
    ) -> Result<(u16, Vec<u8>), GatewayError>;

    /// Closes the underlying transport connection to `peer_id`.
    async fn close(&self, peer_id: &str);
}

/// Wrapper around one outbound transport link (spec §3).
#[derive(Debug, Clone)]
pub struct PeerConnection {
    pub public_key: String,
    pub connected: bool,
    pub last_handshake_at: i64,
    pub last_activity_at: i64,
    pub failure_streak: u32,
}

impl PeerConnection {
    fn fresh(public_key: String) -> Self {
        let now = now_unix();
        Self {
            public_key,
            connected: true,
            last_handshake_at: now,
            last_activity_at: now,
            failure_streak: 0,
        }
    }
}

const HEALTH_SWEEP_FAILURE_LIMIT: u32 = 3;

/// Maintains at most one live [`PeerConnection`] per `PeerId`, serializing
/// concurrent dials to the same peer (spec §5).
pub struct PeerPool {
    transport: Arc<dyn PeerTransport>,
    wrappers: RwLock<HashMap<String, PeerConnection>>,
    /// Per-peer dial locks: held only while actually dialing, so two
    /// sessions racing to connect to the same peer serialize on this
    /// rather than on `wrappers`.
    dial_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl PeerPool {
    #[must_use]
    pub fn new(transport: Arc<dyn PeerTransport>) -> Self {
        Self {
            transport,
            wrappers: RwLock::new(HashMap::new()),
            dial_locks: Mutex::new(HashMap::new()),
        }
    }

    async fn dial_lock_for(&self, peer_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.dial_locks.lock().await;
        locks
            .entry(peer_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Returns an existing live wrapper, or dials and awaits a handshake.
    /// Concurrent callers for the same `peer_id` serialize on the per-peer
    /// dial lock rather than each issuing a redundant dial.
    ///
    /// # Errors
    ///
    /// Propagates the transport's dial error as [`ErrorKind::PeerUnreachable`].
    pub async fn get_connection(&self, peer_id: &str) -> Result<PeerConnection, GatewayError> {
        {
            let wrappers = self.wrappers.read().await;
            if let Some(wrapper) = wrappers.get(peer_id) {
                if wrapper.connected {
                    return Ok(wrapper.clone());
                }
            }
        }

        let lock = self.dial_lock_for(peer_id).await;
        let _guard = lock.lock().await;

        // Re-check after acquiring the lock: another task may have just dialed.
        {
            let wrappers = self.wrappers.read().await;
            if let Some(wrapper) = wrappers.get(peer_id) {
                if wrapper.connected {
                    return Ok(wrapper.clone());
                }
            }
        }

        self.transport
            .dial(peer_id)
            .await
            .map_err(|e| GatewayError::new(ErrorKind::PeerUnreachable, e.message))?;

        let wrapper = PeerConnection::fresh(peer_id.to_string());
        let mut wrappers = self.wrappers.write().await;
        wrappers.insert(peer_id.to_string(), wrapper.clone());
        Ok(wrapper)
    }

    /// Accepts an inbound connection attempt for a `PeerId` (spec §4.3):
    /// tears down the inbound if a healthy wrapper already exists,
    /// otherwise swaps it in.
    pub async fn on_inbound_connection(&self, peer_id: &str) -> bool {
        let mut wrappers = self.wrappers.write().await;
        match wrappers.get(peer_id) {
            Some(existing) if existing.connected => false,
            _ => {
                wrappers.insert(peer_id.to_string(), PeerConnection::fresh(peer_id.to_string()));
                true
            }
        }
    }

    /// Marks `peer_id` disconnected and drops it from the pool, releasing
    /// its per-peer lock (spec §4.3 failure semantics).
    pub async fn mark_failed(&self, peer_id: &str) {
        let mut wrappers = self.wrappers.write().await;
        if let Some(wrapper) = wrappers.get_mut(peer_id) {
            wrapper.connected = false;
            wrapper.failure_streak += 1;
        }
        wrappers.remove(peer_id);
    }

    /// Periodic health check: pings every known wrapper; failures mark it
    /// unhealthy and schedule removal (spec §4.3).
    pub async fn health_sweep(&self) {
        let peer_ids: Vec<String> = self.wrappers.read().await.keys().cloned().collect();
        for peer_id in peer_ids {
            match self.transport.ping(&peer_id).await {
                Ok(()) => {
                    let mut wrappers = self.wrappers.write().await;
                    if let Some(wrapper) = wrappers.get_mut(&peer_id) {
                        wrapper.last_activity_at = now_unix();
                        wrapper.failure_streak = 0;
                    }
                }
                Err(e) => {
                    tracing::warn!(peer_id = %peer_id, error = %e, "health sweep ping failed");
                    let mut wrappers = self.wrappers.write().await;
                    if let Some(wrapper) = wrappers.get_mut(&peer_id) {
                        wrapper.failure_streak += 1;
                        if wrapper.failure_streak >= HEALTH_SWEEP_FAILURE_LIMIT {
                            wrapper.connected = false;
                        }
                    }
                    wrappers.retain(|_, w| w.connected);
                }
            }
        }
    }

    /// Forwards an inbound telemetry payload to the dispatcher (spec §4.3).
    pub async fn telemetry_sink(&self, dispatcher: &RelayDispatcher, peer_id: &str, payload: PeerTelemetry) {
        dispatcher.report_peer_metrics(peer_id, payload).await;
    }

    /// Forwards a client frame through the pool's transport.
    ///
    /// # Errors
    ///
    /// Propagates the transport's forwarding error.
    pub async fn forward(
        &self,
        peer_id: &str,
        relay_key: &str,
        frame: &ClientFrame,
        connection_key: &str,
        relay_auth_token: &str,
    ) -> Result<Vec<ResponseFrame>, GatewayError> {
        self.transport
            .forward(peer_id, relay_key, frame, connection_key, relay_auth_token)
            .await
    }

    /// Polls queued events from `peer_id` for the given session.
    ///
    /// # Errors
    ///
    /// Propagates the transport's polling error.
    pub async fn poll_events(
        &self,
        peer_id: &str,
        relay_key: &str,
        connection_key: &str,
        relay_auth_token: &str,
    ) -> Result<Vec<ResponseFrame>, GatewayError> {
        self.transport
            .poll_events(peer_id, relay_key, connection_key, relay_auth_token)
            .await
    }

    /// Closes every wrapper (spec §4.3 `destroy`).
    pub async fn destroy(&self) {
        let peer_ids: Vec<String> = self.wrappers.read().await.keys().cloned().collect();
        for peer_id in &peer_ids {
            self.transport.close(peer_id).await;
        }
        self.wrappers.write().await.clear();
    }

    /// `true` if the pool currently considers `peer_id` live.
    pub async fn is_connected(&self, peer_id: &str) -> bool {
        self.wrappers
            .read()
            .await
            .get(peer_id)
            .is_some_and(|w| w.connected)
    }
}

fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
