//! Per-connection session state and message processing (spec §4.4).
//!
//! A [`Session`] is admitted once (relay lookup, token verification, peer
//! assignment) and then drained frame-by-frame by the gateway server's
//! reader loop, which calls [`process_frame`] for each inbound WebSocket
//! message in arrival order and a background tick calls [`poll_once`]
//! roughly once a second. Everything here is synchronous with respect to a
//! single session: no two frames for the same connection are ever
//! processed concurrently, so `&mut Session` is never contested.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use gateway_proto::{ClientFrame, Filter, ServerFrame};
use tokio::sync::{mpsc, RwLock};

use crate::dispatcher::{RelayDispatcher, ScheduleDecision};
use crate::error::{CloseCode, ErrorKind, GatewayError};
use crate::peer_pool::PeerPool;
use crate::registration_store::RegistrationStore;
use crate::replica::ReplicaAdapter;
use crate::token_service::TokenService;
use crate::util;

/// A message the session-processing code wants the writer task to push out
/// over the socket: either a typed frame it built itself, a raw frame a peer
/// already rendered, or a request to close the connection.
#[derive(Debug, Clone)]
pub enum Outbound {
    Frame(ServerFrame),
    Raw(String),
    Close(CloseCode),
}

/// The state a gateway server needs for every subsystem a session touches.
/// One instance is shared (via `Arc`) across every session on the server.
pub struct SessionServices {
    pub registration_store: Arc<RegistrationStore>,
    pub token_service: Arc<TokenService>,
    pub peer_pool: Arc<PeerPool>,
    pub dispatcher: Arc<RelayDispatcher>,
    pub replica: Option<Arc<ReplicaAdapter>>,
    pub peer_rotation: Arc<PeerRotationCounters>,
    pub dispatcher_enabled: bool,
    pub token_enforcement_enabled: bool,
}

/// Per-subscription replica cursor: the raw filters as last `REQ`'d, and the
/// highest `created_at` already emitted. Only `created_at` strictly greater
/// than this is ever re-emitted (testable property 4).
#[derive(Debug, Clone)]
pub struct SubscriptionState {
    pub filters: Vec<Filter>,
    pub last_returned_at: i64,
}

/// One admitted WebSocket connection's state (spec §4.4).
pub struct Session {
    pub connection_key: String,
    pub relay_key: String,
    pub client_pubkey: Option<String>,
    pub scope: String,
    pub relay_auth_token: String,
    pub peers: Vec<String>,
    pub peer_index: usize,
    pub local_only: bool,
    pub lease_active: bool,
    /// `true` when `REQ`/`EVENT` are answered from the local replica rather
    /// than forwarded to a peer (no peers assigned, or the descriptor marks
    /// this relay as replica-served).
    pub serve_locally: bool,
    pub subscriptions: HashMap<String, SubscriptionState>,
    pub subscription_peers: HashMap<String, String>,
    pub opened_at: i64,
}

impl Session {
    /// Current `peers[peer_index]`, or `None` for a local-only session.
    #[must_use]
    pub fn current_peer(&self) -> Option<&str> {
        self.peers.get(self.peer_index).map(String::as_str)
    }
}

/// Outcome of processing one inbound frame.
#[derive(Debug, Clone)]
pub enum ProcessOutcome {
    Continue,
    Close(CloseCode),
}

/// Tracks a round-robin cursor per `relayKey` so successive session
/// admissions spread their initial peer assignment across the descriptor's
/// peer list instead of all starting at index 0 (spec §4.4 step 4).
pub struct PeerRotationCounters {
    counters: RwLock<HashMap<String, usize>>,
}

impl PeerRotationCounters {
    #[must_use]
    pub fn new() -> Self {
        Self {
            counters: RwLock::new(HashMap::new()),
        }
    }

    /// Returns the next starting index for `relay_key` and advances the
    /// cursor. Always `0` for an empty peer list.
    pub async fn next_index(&self, relay_key: &str, peer_count: usize) -> usize {
        if peer_count == 0 {
            return 0;
        }
        let mut counters = self.counters.write().await;
        let counter = counters.entry(relay_key.to_string()).or_insert(0);
        let idx = *counter % peer_count;
        *counter = counter.wrapping_add(1);
        idx
    }
}

impl Default for PeerRotationCounters {
    fn default() -> Self {
        Self::new()
    }
}

/// Maps an admission-time error to its application close code (spec §4.9).
#[must_use]
pub fn close_code_for(kind: ErrorKind) -> CloseCode {
    match kind {
        ErrorKind::TokenRequired
        | ErrorKind::TokenInvalid
        | ErrorKind::TokenExpired
        | ErrorKind::TokenRevoked
        | ErrorKind::TokenStale
        | ErrorKind::TokenMismatch
        | ErrorKind::RelayMismatch
        | ErrorKind::SignatureInvalid
        | ErrorKind::NoActiveToken => CloseCode::TokenRejected,
        ErrorKind::RelayNotRegistered | ErrorKind::RegistrationMissing => CloseCode::RelayNotFound,
        ErrorKind::NoPeers => CloseCode::NoPeersAvailable,
        _ => CloseCode::Internal,
    }
}

/// Admits a new session against `relay_key` (spec §4.4 steps 1-5): looks up
/// the descriptor, verifies the presented token if the relay requires auth,
/// and assigns a starting peer (or local-only serving).
///
/// # Errors
///
/// Returns [`ErrorKind::RelayNotRegistered`] if no descriptor exists,
/// [`ErrorKind::TokenRequired`]/token-verification errors if auth fails, or
/// [`ErrorKind::NoPeers`] if the relay has neither peers nor a local replica.
pub async fn admit_session(
    relay_key: &str,
    presented_token: Option<&str>,
    services: &SessionServices,
) -> Result<Session, GatewayError> {
    let descriptor = services
        .registration_store
        .get_relay(relay_key)
        .await
        .ok_or_else(|| GatewayError::new(ErrorKind::RelayNotRegistered, format!("relay {relay_key} is not registered")))?;

    let requires_auth = services.token_enforcement_enabled && descriptor.metadata.requires_auth.unwrap_or(true);

    let (client_pubkey, scope, relay_auth_token) = if requires_auth {
        let token = presented_token
            .ok_or_else(|| GatewayError::new(ErrorKind::TokenRequired, "a token is required for this relay"))?;
        let payload = services.token_service.verify_token(token, relay_key).await?;
        (payload.pubkey, payload.scope, payload.relay_auth_token)
    } else {
        (None, "default".to_string(), String::new())
    };

    let peers = descriptor.peers.clone();
    let local_only = peers.is_empty();

    if local_only && services.replica.is_none() {
        return Err(GatewayError::new(ErrorKind::NoPeers, "relay has no peers and no local replica"));
    }

    let lease_active = descriptor.metadata.lease_active.unwrap_or(false);
    let serve_locally = services.replica.is_some() && (local_only || descriptor.metadata.is_replica.unwrap_or(false));
    let peer_index = services.peer_rotation.next_index(relay_key, peers.len()).await;

    Ok(Session {
        connection_key: util::generate_connection_key(),
        relay_key: relay_key.to_string(),
        client_pubkey,
        scope,
        relay_auth_token,
        peers,
        peer_index,
        local_only,
        lease_active,
        serve_locally,
        subscriptions: HashMap::new(),
        subscription_peers: HashMap::new(),
        opened_at: now_unix(),
    })
}

/// Forwards `frame` to the session's current peer, rotating through the
/// remaining assigned peers on failure (spec §4.4 peer-rotation fallback,
/// testable via scenario S2). Gives up after trying every assigned peer once.
///
/// # Errors
///
/// Returns [`ErrorKind::NoPeers`] if the session has no peers, or the last
/// peer's error if every peer failed.
async fn forward_with_rotation(
    session: &mut Session,
    services: &SessionServices,
    frame: &ClientFrame,
) -> Result<Vec<String>, GatewayError> {
    if session.peers.is_empty() {
        return Err(GatewayError::new(ErrorKind::NoPeers, "no peers assigned to this session"));
    }
    let attempts = session.peers.len();
    let mut last_err = None;
    for _ in 0..attempts {
        let peer_id = session.peers[session.peer_index].clone();
        match services
            .peer_pool
            .forward(&peer_id, &session.relay_key, frame, &session.connection_key, &session.relay_auth_token)
            .await
        {
            Ok(frames) => return Ok(frames),
            Err(e) => {
                tracing::warn!(peer_id = %peer_id, error = %e, "peer forward failed, rotating");
                services.peer_pool.mark_failed(&peer_id).await;
                session.peer_index = (session.peer_index + 1) % session.peers.len();
                last_err = Some(e);
            }
        }
    }
    Err(last_err.unwrap_or_else(|| GatewayError::new(ErrorKind::NoPeers, "no peers available")))
}

/// Processes one inbound client frame against `session`, pushing any
/// resulting outbound messages onto `out` (spec §4.4 per-message handling).
pub async fn process_frame(
    session: &mut Session,
    frame: ClientFrame,
    services: &SessionServices,
    out: &mpsc::UnboundedSender<Outbound>,
) -> ProcessOutcome {
    match frame {
        ClientFrame::Event(event) => {
            let event_id = event.id.clone();
            if session.local_only {
                let accepted_result = match &services.replica {
                    Some(replica) if session.lease_active => replica.append_event(&event),
                    _ => Err(GatewayError::new(ErrorKind::ReplicaReadonly, "replica is read-only for this relay")),
                };
                match accepted_result {
                    Ok(()) => {
                        let _ = out.send(Outbound::Frame(ServerFrame::Ok { event_id, accepted: true, message: String::new() }));
                    }
                    Err(e) => {
                        let _ = out.send(Outbound::Frame(ServerFrame::Ok { event_id, accepted: false, message: e.message }));
                    }
                }
            } else {
                match forward_with_rotation(session, services, &ClientFrame::Event(event)).await {
                    Ok(frames) => {
                        for raw in frames {
                            let _ = out.send(Outbound::Raw(raw));
                        }
                    }
                    Err(e) => {
                        let _ = out.send(Outbound::Frame(ServerFrame::Ok { event_id, accepted: false, message: e.message }));
                    }
                }
            }
            ProcessOutcome::Continue
        }

        ClientFrame::Req { sub_id, filters } => {
            if session.serve_locally {
                process_local_req(session, &sub_id, filters, services, out);
            } else {
                process_dispatched_req(session, sub_id, filters, services, out).await;
            }
            ProcessOutcome::Continue
        }

        ClientFrame::Close { sub_id } => {
            if let Some(peer_id) = session.subscription_peers.remove(&sub_id) {
                let close_frame = ClientFrame::Close { sub_id: sub_id.clone() };
                let _ = services
                    .peer_pool
                    .forward(&peer_id, &session.relay_key, &close_frame, &session.connection_key, &session.relay_auth_token)
                    .await;
                if services.dispatcher_enabled {
                    services.dispatcher.acknowledge(&sub_id).await;
                }
            }
            session.subscriptions.remove(&sub_id);
            ProcessOutcome::Continue
        }

        ClientFrame::Ping(_) => ProcessOutcome::Continue,

        ClientFrame::Auth(value) => {
            if let Some(peer_id) = session.current_peer().map(str::to_string) {
                let auth_frame = ClientFrame::Auth(value);
                let _ = services
                    .peer_pool
                    .forward(&peer_id, &session.relay_key, &auth_frame, &session.connection_key, &session.relay_auth_token)
                    .await;
            }
            ProcessOutcome::Continue
        }
    }
}

fn process_local_req(
    session: &mut Session,
    sub_id: &str,
    filters: Vec<Filter>,
    services: &SessionServices,
    out: &mpsc::UnboundedSender<Outbound>,
) {
    let Some(replica) = services.replica.as_ref() else {
        let _ = out.send(Outbound::Frame(ServerFrame::Notice { text: "replica adapter unavailable".to_string() }));
        return;
    };

    let last_returned_at = session.subscriptions.get(sub_id).map_or(0, |s| s.last_returned_at);
    let query_filters = bump_since(&filters, last_returned_at);

    match replica.query(&query_filters) {
        Ok(events) => {
            let mut max_created_at = last_returned_at;
            for event in &events {
                max_created_at = max_created_at.max(event.created_at);
                let _ = out.send(Outbound::Frame(ServerFrame::Event { sub_id: sub_id.to_string(), event: event.clone() }));
            }
            let _ = out.send(Outbound::Frame(ServerFrame::Eose { sub_id: sub_id.to_string() }));
            session
                .subscriptions
                .insert(sub_id.to_string(), SubscriptionState { filters, last_returned_at: max_created_at });
        }
        Err(e) => {
            let _ = out.send(Outbound::Frame(ServerFrame::Notice { text: e.message }));
        }
    }
}

async fn process_dispatched_req(
    session: &mut Session,
    sub_id: String,
    filters: Vec<Filter>,
    services: &SessionServices,
    out: &mpsc::UnboundedSender<Outbound>,
) {
    let assigned_peer = if services.dispatcher_enabled {
        match services.dispatcher.schedule(&sub_id, &session.peers).await {
            ScheduleDecision::Assigned { peer_id, degraded } => {
                if degraded {
                    tracing::warn!(relay_key = %session.relay_key, sub_id = %sub_id, "degraded subscription assignment");
                }
                Some(peer_id)
            }
            ScheduleDecision::Rejected { reason } => {
                let _ = out.send(Outbound::Frame(ServerFrame::Notice { text: format!("subscription rejected: {reason}") }));
                None
            }
        }
    } else {
        None
    };

    if services.dispatcher_enabled && assigned_peer.is_none() {
        return;
    }

    session
        .subscriptions
        .insert(sub_id.clone(), SubscriptionState { filters: filters.clone(), last_returned_at: 0 });
    let req_frame = ClientFrame::Req { sub_id: sub_id.clone(), filters };

    // Dispatcher-enabled case (spec §4.4 (b)): try the assigned peer first;
    // on failure, mark the job failed and fall back to plain forwarding
    // across the session's remaining peers, same as the non-dispatcher path.
    if let Some(peer_id) = assigned_peer {
        session.subscription_peers.insert(sub_id.clone(), peer_id.clone());
        match services
            .peer_pool
            .forward(&peer_id, &session.relay_key, &req_frame, &session.connection_key, &session.relay_auth_token)
            .await
        {
            Ok(frames) => {
                services.dispatcher.acknowledge(&sub_id).await;
                for raw in frames {
                    let _ = out.send(Outbound::Raw(raw));
                }
                return;
            }
            Err(e) => {
                tracing::warn!(peer_id = %peer_id, error = %e, "dispatched REQ forward failed, falling back to plain forwarding");
                services.dispatcher.fail(&sub_id, &e.message).await;
                services.peer_pool.mark_failed(&peer_id).await;
            }
        }
    }

    // Dispatcher-disabled case (spec §4.4 (c)), and the fallback leg of (b):
    // forward to the current peer, rotating through the rest on failure.
    match forward_with_rotation(session, services, &req_frame).await {
        Ok(frames) => {
            if let Some(peer_id) = session.current_peer() {
                session.subscription_peers.insert(sub_id.clone(), peer_id.to_string());
            }
            for raw in frames {
                let _ = out.send(Outbound::Raw(raw));
            }
        }
        Err(e) => {
            let _ = out.send(Outbound::Frame(ServerFrame::Notice { text: format!("subscription {sub_id} failed: {}", e.message) }));
        }
    }
}

/// One tick of the ~1s background poll (spec §4.4 step 6): for a
/// locally-served session, pulls new replica events per active subscription;
/// otherwise polls the current peer once for the whole connection.
pub async fn poll_once(session: &mut Session, services: &SessionServices, out: &mpsc::UnboundedSender<Outbound>) {
    if session.serve_locally {
        poll_replica_subscriptions(session, services, out);
        return;
    }

    if session.peers.is_empty() {
        return;
    }
    let peer_id = session.peers[session.peer_index].clone();
    match services
        .peer_pool
        .poll_events(&peer_id, &session.relay_key, &session.connection_key, &session.relay_auth_token)
        .await
    {
        Ok(frames) => {
            for raw in frames {
                let _ = out.send(Outbound::Raw(raw));
            }
        }
        Err(e) => {
            tracing::warn!(peer_id = %peer_id, error = %e, "peer poll failed, rotating");
            services.peer_pool.mark_failed(&peer_id).await;
            if !session.peers.is_empty() {
                session.peer_index = (session.peer_index + 1) % session.peers.len();
            }
        }
    }
}

fn poll_replica_subscriptions(session: &mut Session, services: &SessionServices, out: &mpsc::UnboundedSender<Outbound>) {
    let Some(replica) = services.replica.as_ref() else {
        return;
    };
    let sub_ids: Vec<String> = session.subscriptions.keys().cloned().collect();
    for sub_id in sub_ids {
        let Some(state) = session.subscriptions.get(&sub_id) else {
            continue;
        };
        let last_returned_at = state.last_returned_at;
        let query_filters = bump_since(&state.filters, last_returned_at);

        match replica.query(&query_filters) {
            Ok(events) if !events.is_empty() => {
                let mut max_created_at = last_returned_at;
                for event in &events {
                    max_created_at = max_created_at.max(event.created_at);
                    let _ = out.send(Outbound::Frame(ServerFrame::Event { sub_id: sub_id.clone(), event: event.clone() }));
                }
                if let Some(state) = session.subscriptions.get_mut(&sub_id) {
                    state.last_returned_at = max_created_at;
                }
            }
            Ok(_) => {}
            Err(e) => tracing::warn!(error = %e, sub_id = %sub_id, "replica poll failed"),
        }
    }
}

/// Clamps every filter's `since` to be strictly greater than `cursor`,
/// preserving a tighter caller-supplied `since` (testable property 4).
fn bump_since(filters: &[Filter], cursor: i64) -> Vec<Filter> {
    let floor = cursor.saturating_add(1);
    filters
        .iter()
        .cloned()
        .map(|mut f| {
            f.since = Some(f.since.map_or(floor, |s| s.max(floor)));
            f
        })
        .collect()
}

/// Tracks every open session so a token revocation can be broadcast to the
/// right ones and so session counts can be reported as a gauge (spec §4.6,
/// §4.9).
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, SessionHandle>>,
}

struct SessionHandle {
    relay_key: String,
    outbound: mpsc::UnboundedSender<Outbound>,
}

impl SessionRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
        }
    }

    pub async fn register(&self, connection_key: String, relay_key: String, outbound: mpsc::UnboundedSender<Outbound>) {
        self.sessions.write().await.insert(connection_key, SessionHandle { relay_key, outbound });
    }

    pub async fn remove(&self, connection_key: &str) {
        self.sessions.write().await.remove(connection_key);
    }

    /// Sends `TOKEN REVOKED` followed by a close request to every open
    /// session for `relay_key` (spec §4.6).
    pub async fn broadcast_revocation(&self, relay_key: &str, reason: Option<String>, sequence: u64) {
        let sessions = self.sessions.read().await;
        for handle in sessions.values().filter(|h| h.relay_key == relay_key) {
            let _ = handle.outbound.send(Outbound::Frame(ServerFrame::TokenRevoked { reason: reason.clone(), sequence }));
            let _ = handle.outbound.send(Outbound::Close(CloseCode::TokenRejected));
        }
    }

    #[must_use = "call this to observe the gauge, not just to hold the lock"]
    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn session_count_for_relay(&self, relay_key: &str) -> usize {
        self.sessions.read().await.values().filter(|h| h.relay_key == relay_key).count()
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
