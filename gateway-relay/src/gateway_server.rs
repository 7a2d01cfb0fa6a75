//! HTTP/WebSocket front-end (spec §4.1, §4.9): registration and token
//! endpoints, the `/drive` read-through route, and the WebSocket upgrade
//! that hands each connection to [`crate::session`]. `/health` and
//! `/metrics` are external-collaborator surface (spec §1) and are not
//! routed here.
//!
//! Lifecycle is `init → start → stop`: [`GatewayServerState::new`]
//! constructs every subsystem (`init`), [`start_server`] binds and spawns
//! the background timers (`start`), and [`GatewayServerHandle::shutdown`]
//! quiesces new sessions, closes sockets, drains timers, then disconnects
//! the pool and the store (`stop`), in that order.

use std::net::{IpAddr, SocketAddr};
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use futures_util::{SinkExt, StreamExt};
use governor::clock::DefaultClock;
use governor::state::keyed::DefaultKeyedStateStore;
use governor::{Quota, RateLimiter};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;

use gateway_proto::{ClientFrame, RegistrationPayload, Signed};

use crate::config::GatewayConfig;
use crate::error::{ErrorKind, GatewayError};
use crate::peer_pool::PeerTransport;
use crate::pending_writes::PendingWritesPusher;
use crate::registration_store::RelayDescriptor;
use crate::session::{self, Outbound, ProcessOutcome, SessionRegistry, SessionServices};
use crate::util::Identifier;

type IpRateLimiter = RateLimiter<IpAddr, DefaultKeyedStateStore<IpAddr>, DefaultClock>;

/// Everything a running gateway server shares across requests and
/// connections. One instance is built at `init` and handed to every route
/// via axum's [`State`] extractor.
pub struct GatewayServerState {
    pub services: Arc<SessionServices>,
    pub session_registry: Arc<SessionRegistry>,
    pub pending_writes: Arc<PendingWritesPusher>,
    /// Direct handle to the peer transport for the `/drive` read-through
    /// route, which has no need for [`crate::peer_pool::PeerPool`]'s
    /// connection bookkeeping — a blob fetch is one-shot, not a session.
    pub transport: Arc<dyn PeerTransport>,
    pub config: GatewayConfig,
    limiter: IpRateLimiter,
}

impl GatewayServerState {
    #[must_use]
    pub fn new(
        services: Arc<SessionServices>,
        session_registry: Arc<SessionRegistry>,
        pending_writes: Arc<PendingWritesPusher>,
        transport: Arc<dyn PeerTransport>,
        config: GatewayConfig,
    ) -> Self {
        let per_second = NonZeroU32::new(config.rate_limit_per_second.max(1))
            .unwrap_or(NonZeroU32::MIN);
        let burst = NonZeroU32::new(config.rate_limit_burst.max(1)).unwrap_or(NonZeroU32::MIN);
        let quota = Quota::per_second(per_second).allow_burst(burst);
        Self {
            services,
            session_registry,
            pending_writes,
            transport,
            config,
            limiter: RateLimiter::keyed(quota),
        }
    }

    fn check_rate_limit(&self, addr: IpAddr) -> Result<(), StatusCode> {
        self.limiter.check_key(&addr).map_err(|_| StatusCode::TOO_MANY_REQUESTS)
    }

    fn require_secret(&self) -> Result<&[u8], GatewayError> {
        self.config
            .shared_secret
            .as_deref()
            .map(str::as_bytes)
            .ok_or_else(|| GatewayError::new(ErrorKind::ConfigMissing, "no shared secret configured"))
    }
}

// ---------------------------------------------------------------------------
// Router construction and lifecycle
// ---------------------------------------------------------------------------

fn now_unix() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

fn build_router(state: Arc<GatewayServerState>) -> Router {
    Router::new()
        .route("/api/relays", post(register_relay))
        .route("/api/relays/{relay_key}", delete(delete_relay))
        .route("/api/relay-tokens/issue", post(issue_token))
        .route("/api/relay-tokens/refresh", post(refresh_token))
        .route("/api/relay-tokens/revoke", post(revoke_token))
        .route("/drive/{*rest}", get(fetch_drive_blob))
        .route("/{prefix}/{*tail}", get(ws_upgrade))
        .with_state(state)
}

/// A running server: its bound address plus everything needed to drive a
/// graceful `stop` (spec §4.1 lifecycle).
pub struct GatewayServerHandle {
    pub addr: SocketAddr,
    serve_handle: JoinHandle<()>,
    background: Vec<JoinHandle<()>>,
    shutdown: Arc<Notify>,
    state: Arc<GatewayServerState>,
}

impl GatewayServerHandle {
    /// Runs the `stop` phase of the lifecycle: quiesces background timers,
    /// stops accepting new connections, then disconnects the peer pool and
    /// the registration store.
    pub async fn shutdown(self) {
        self.shutdown.notify_waiters();
        for task in self.background {
            task.abort();
        }
        self.serve_handle.abort();
        self.state.services.peer_pool.destroy().await;
        self.state.services.registration_store.disconnect().await;
    }
}

/// Starts the gateway server bound to `bind_addr` (spec §4.1 `start`),
/// spawning its background timers (health sweep, pending-write retries,
/// registration pruning).
///
/// # Errors
///
/// Returns an I/O error if the listener cannot bind to `bind_addr`.
pub async fn start_server(bind_addr: &str, state: Arc<GatewayServerState>) -> std::io::Result<GatewayServerHandle> {
    let app = build_router(Arc::clone(&state));
    let listener = TcpListener::bind(bind_addr).await?;
    let addr = listener.local_addr()?;

    let shutdown = Arc::new(Notify::new());
    let serve_shutdown = Arc::clone(&shutdown);
    let serve_handle = tokio::spawn(async move {
        let make_service = app.into_make_service_with_connect_info::<SocketAddr>();
        let result = axum::serve(listener, make_service).with_graceful_shutdown(async move {
            serve_shutdown.notified().await;
        });
        if let Err(e) = result.await {
            tracing::error!(error = %e, "gateway server error");
        }
    });

    let background = spawn_background_tasks(Arc::clone(&state), Arc::clone(&shutdown));

    Ok(GatewayServerHandle {
        addr,
        serve_handle,
        background,
        shutdown,
        state,
    })
}

/// Starts the gateway server in-process for tests: binds `127.0.0.1:0` and
/// returns the bound address alongside the handle.
///
/// # Errors
///
/// Returns an I/O error if the listener cannot bind.
pub async fn start_test_server(state: Arc<GatewayServerState>) -> std::io::Result<GatewayServerHandle> {
    start_server("127.0.0.1:0", state).await
}

fn spawn_background_tasks(state: Arc<GatewayServerState>, shutdown: Arc<Notify>) -> Vec<JoinHandle<()>> {
    let health_state = Arc::clone(&state);
    let health_shutdown = Arc::clone(&shutdown);
    let health_sweep = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(30));
        loop {
            tokio::select! {
                _ = ticker.tick() => health_state.services.peer_pool.health_sweep().await,
                () = health_shutdown.notified() => break,
            }
        }
    });

    let pending_state = Arc::clone(&state);
    let pending_shutdown = Arc::clone(&shutdown);
    let pending_writes = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(5));
        loop {
            tokio::select! {
                _ = ticker.tick() => pending_state.pending_writes.tick().await,
                () = pending_shutdown.notified() => break,
            }
        }
    });

    let prune_state = Arc::clone(&state);
    let prune_shutdown = Arc::clone(&shutdown);
    let prune_expired = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(60));
        loop {
            tokio::select! {
                _ = ticker.tick() => prune_state.services.registration_store.prune_expired().await,
                () = prune_shutdown.notified() => break,
            }
        }
    });

    vec![health_sweep, pending_writes, prune_expired]
}

// ---------------------------------------------------------------------------
// Registration endpoints (spec §4.1, §6)
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RegisterRelayResponse {
    relay_key: String,
    identifier: String,
    replica_enabled: bool,
}

async fn register_relay(
    State(state): State<Arc<GatewayServerState>>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    Json(envelope): Json<Signed<RegistrationPayload>>,
) -> axum::response::Response {
    if state.check_rate_limit(remote.ip()).is_err() {
        return StatusCode::TOO_MANY_REQUESTS.into_response();
    }
    match register_relay_inner(&state, envelope).await {
        Ok(body) => (StatusCode::OK, Json(body)).into_response(),
        Err(e) => e.into_response(),
    }
}

async fn register_relay_inner(
    state: &GatewayServerState,
    envelope: Signed<RegistrationPayload>,
) -> Result<RegisterRelayResponse, GatewayError> {
    let secret = state.require_secret()?;
    let canonical = envelope
        .canonical_payload_bytes()
        .map_err(|e| GatewayError::new(ErrorKind::FrameMalformed, e.to_string()))?;
    gateway_proto::signing::verify_hex(&canonical, &envelope.signature, secret)
        .map_err(|e| GatewayError::new(ErrorKind::SignatureInvalid, e.to_string()))?;

    let payload = envelope.payload;
    let now = now_unix();
    let metadata = payload.metadata;
    let descriptor = RelayDescriptor {
        relay_key: payload.relay_key.clone(),
        identifier: payload.identifier.clone(),
        peers: payload.peers,
        metadata: metadata.clone(),
        registered_at: now,
        updated_at: now,
    };
    state.services.registration_store.upsert_relay(descriptor).await;

    Ok(RegisterRelayResponse {
        relay_key: payload.relay_key,
        identifier: payload.identifier,
        replica_enabled: metadata.is_replica.unwrap_or(false),
    })
}

async fn delete_relay(
    State(state): State<Arc<GatewayServerState>>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    Path(relay_key): Path<String>,
    headers: HeaderMap,
) -> axum::response::Response {
    if state.check_rate_limit(remote.ip()).is_err() {
        return StatusCode::TOO_MANY_REQUESTS.into_response();
    }
    match delete_relay_inner(&state, &relay_key, &headers).await {
        Ok(true) => StatusCode::NO_CONTENT.into_response(),
        Ok(false) => GatewayError::new(ErrorKind::RelayNotRegistered, format!("relay {relay_key} is not registered")).into_response(),
        Err(e) => e.into_response(),
    }
}

async fn delete_relay_inner(state: &GatewayServerState, relay_key: &str, headers: &HeaderMap) -> Result<bool, GatewayError> {
    let secret = state.require_secret()?;
    let signature = headers
        .get("x-signature")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| GatewayError::new(ErrorKind::SignatureInvalid, "missing X-Signature header"))?;
    gateway_proto::signing::verify_hex(relay_key.as_bytes(), signature, secret)
        .map_err(|e| GatewayError::new(ErrorKind::SignatureInvalid, e.to_string()))?;

    Ok(state.services.registration_store.remove_relay(relay_key).await)
}

// ---------------------------------------------------------------------------
// Token endpoints (spec §4.6)
// ---------------------------------------------------------------------------

/// Wire body for `POST /api/relay-tokens/issue`, carried inside a
/// `Signed<IssueTokenBody>` envelope. Public so callers (and tests) can
/// build and sign the exact bytes the server will re-serialize to verify.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IssueTokenBody {
    pub relay_key: String,
    pub relay_auth_token: String,
    #[serde(default)]
    pub pubkey: Option<String>,
    pub scope: String,
    pub ttl_seconds: u64,
}

/// Wire body for `POST /api/relay-tokens/refresh`.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshTokenBody {
    pub relay_key: String,
    pub token: String,
    pub ttl_seconds: u64,
}

/// Wire body for `POST /api/relay-tokens/revoke`.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RevokeTokenBody {
    pub relay_key: String,
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct IssuedTokenResponse {
    token: String,
    sequence: u64,
    issued_at: i64,
    expires_at: i64,
    refresh_after: i64,
}

impl From<crate::token_service::IssuedToken> for IssuedTokenResponse {
    fn from(t: crate::token_service::IssuedToken) -> Self {
        Self {
            token: t.token,
            sequence: t.sequence,
            issued_at: t.issued_at,
            expires_at: t.expires_at,
            refresh_after: t.refresh_after,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RevokeTokenResponse {
    sequence: u64,
}

async fn issue_token(
    State(state): State<Arc<GatewayServerState>>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    Json(envelope): Json<Signed<IssueTokenBody>>,
) -> axum::response::Response {
    if state.check_rate_limit(remote.ip()).is_err() {
        return StatusCode::TOO_MANY_REQUESTS.into_response();
    }
    let result = verify_signed_body(&state, &envelope).map(|()| envelope.payload);
    let body = match result {
        Ok(body) => body,
        Err(e) => return e.into_response(),
    };

    let request = crate::token_service::IssueRequest {
        relay_auth_token: body.relay_auth_token,
        pubkey: body.pubkey,
        scope: body.scope,
        ttl_seconds: body.ttl_seconds,
    };
    match state.services.token_service.issue_token(&body.relay_key, request).await {
        Ok(issued) => (StatusCode::OK, Json(IssuedTokenResponse::from(issued))).into_response(),
        Err(e) => e.into_response(),
    }
}

async fn refresh_token(
    State(state): State<Arc<GatewayServerState>>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    Json(envelope): Json<Signed<RefreshTokenBody>>,
) -> axum::response::Response {
    if state.check_rate_limit(remote.ip()).is_err() {
        return StatusCode::TOO_MANY_REQUESTS.into_response();
    }
    let body = match verify_signed_body(&state, &envelope).map(|()| envelope.payload) {
        Ok(body) => body,
        Err(e) => return e.into_response(),
    };

    match state
        .services
        .token_service
        .refresh_token(&body.relay_key, &body.token, body.ttl_seconds)
        .await
    {
        Ok(issued) => (StatusCode::OK, Json(IssuedTokenResponse::from(issued))).into_response(),
        Err(e) => e.into_response(),
    }
}

async fn revoke_token(
    State(state): State<Arc<GatewayServerState>>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    Json(envelope): Json<Signed<RevokeTokenBody>>,
) -> axum::response::Response {
    if state.check_rate_limit(remote.ip()).is_err() {
        return StatusCode::TOO_MANY_REQUESTS.into_response();
    }
    let body = match verify_signed_body(&state, &envelope).map(|()| envelope.payload) {
        Ok(body) => body,
        Err(e) => return e.into_response(),
    };

    match state.services.token_service.revoke_token(&body.relay_key).await {
        Ok(sequence) => {
            state
                .session_registry
                .broadcast_revocation(&body.relay_key, body.reason, sequence)
                .await;
            (StatusCode::OK, Json(RevokeTokenResponse { sequence })).into_response()
        }
        Err(e) => e.into_response(),
    }
}

fn verify_signed_body<T: Serialize>(state: &GatewayServerState, envelope: &Signed<T>) -> Result<(), GatewayError> {
    let secret = state.require_secret()?;
    let canonical = envelope
        .canonical_payload_bytes()
        .map_err(|e| GatewayError::new(ErrorKind::FrameMalformed, e.to_string()))?;
    gateway_proto::signing::verify_hex(&canonical, &envelope.signature, secret)
        .map_err(|e| GatewayError::new(ErrorKind::SignatureInvalid, e.to_string()))
}

// ---------------------------------------------------------------------------
// `/drive` read-through (spec §4.1, §6)
// ---------------------------------------------------------------------------

async fn fetch_drive_blob(
    State(state): State<Arc<GatewayServerState>>,
    Path(rest): Path<String>,
) -> axum::response::Response {
    let Some((identifier, file)) = rest.rsplit_once('/') else {
        return GatewayError::new(ErrorKind::FrameMalformed, "missing drive file segment").into_response();
    };
    let Some(relay_key) = Identifier::drive_identifier_to_relay_key(identifier) else {
        return GatewayError::new(ErrorKind::FrameMalformed, "invalid drive identifier").into_response();
    };
    let Some(descriptor) = state.services.registration_store.get_relay(&relay_key).await else {
        return GatewayError::new(ErrorKind::RelayNotRegistered, format!("relay {relay_key} is not registered")).into_response();
    };
    if descriptor.peers.is_empty() {
        return GatewayError::new(ErrorKind::NoPeers, "relay has no peers to read through").into_response();
    }

    let start = state.services.peer_rotation.next_index(&relay_key, descriptor.peers.len()).await;
    let mut last_err = None;
    for offset in 0..descriptor.peers.len() {
        let peer_id = &descriptor.peers[(start + offset) % descriptor.peers.len()];
        match state.transport.fetch_blob(peer_id, identifier, file).await {
            Ok((status, body)) if (200..300).contains(&status) => {
                return (StatusCode::OK, body).into_response();
            }
            Ok((status, _)) => {
                last_err = Some(GatewayError::new(ErrorKind::PeerUnreachable, format!("peer {peer_id} returned status {status}")));
            }
            Err(e) => last_err = Some(e),
        }
    }

    last_err
        .unwrap_or_else(|| GatewayError::new(ErrorKind::PeerUnreachable, "no peer served this blob"))
        .into_response()
}

// ---------------------------------------------------------------------------
// WebSocket upgrade and per-connection loop (spec §4.4, §4.9)
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct WsQuery {
    token: Option<String>,
}

async fn ws_upgrade(
    State(state): State<Arc<GatewayServerState>>,
    Path((prefix, tail)): Path<(String, String)>,
    Query(query): Query<WsQuery>,
    ws: WebSocketUpgrade,
) -> axum::response::Response {
    let relay_key = format!("{prefix}:{tail}");
    ws.on_upgrade(move |socket| handle_socket(socket, relay_key, query.token, state))
}

async fn handle_socket(socket: WebSocket, relay_key: String, token: Option<String>, state: Arc<GatewayServerState>) {
    let mut session = match session::admit_session(&relay_key, token.as_deref(), &state.services).await {
        Ok(session) => session,
        Err(e) => {
            tracing::warn!(relay_key = %relay_key, error = %e, "session admission failed");
            reject_upgrade(socket, session::close_code_for(e.kind)).await;
            return;
        }
    };

    let connection_key = session.connection_key.clone();
    let (out_tx, out_rx) = mpsc::unbounded_channel::<Outbound>();
    state
        .session_registry
        .register(connection_key.clone(), relay_key.clone(), out_tx.clone())
        .await;

    let (ws_sender, ws_receiver) = socket.split();

    let writer = tokio::spawn(run_writer(ws_sender, out_rx));
    let services = Arc::clone(&state.services);
    let processor = tokio::spawn(async move {
        run_session(&mut session, ws_receiver, &services, &out_tx).await;
    });

    tokio::select! {
        _ = writer => {}
        _ = processor => {}
    }

    state.session_registry.remove(&connection_key).await;
    tracing::info!(relay_key = %relay_key, connection_key = %connection_key, "session closed");
}

/// Sends a close frame on a socket that never completed admission, without
/// spawning any of the per-session machinery.
async fn reject_upgrade(socket: WebSocket, code: crate::error::CloseCode) {
    let (mut sender, _receiver) = socket.split();
    let frame = CloseFrame {
        code: code.code(),
        reason: String::new().into(),
    };
    let _ = sender.send(Message::Close(Some(frame))).await;
}

async fn run_writer(
    mut sender: futures_util::stream::SplitSink<WebSocket, Message>,
    mut out_rx: mpsc::UnboundedReceiver<Outbound>,
) {
    while let Some(outbound) = out_rx.recv().await {
        let message = match outbound {
            Outbound::Frame(frame) => Message::Text(frame.to_text().into()),
            Outbound::Raw(text) => Message::Text(text.into()),
            Outbound::Close(code) => {
                let frame = CloseFrame {
                    code: code.code(),
                    reason: String::new().into(),
                };
                let _ = sender.send(Message::Close(Some(frame))).await;
                break;
            }
        };
        if sender.send(message).await.is_err() {
            break;
        }
    }
}

/// Drains inbound frames and ~1s poll ticks for one session (spec §4.4
/// steps 6-7), single-consumer so frame order and poll interleaving are
/// deterministic for a given connection.
async fn run_session(
    session: &mut session::Session,
    mut receiver: futures_util::stream::SplitStream<WebSocket>,
    services: &SessionServices,
    out: &mpsc::UnboundedSender<Outbound>,
) {
    let mut ticker = tokio::time::interval(Duration::from_secs(1));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            message = receiver.next() => {
                let Some(message) = message else { break };
                match message {
                    Ok(Message::Text(text)) => {
                        match ClientFrame::parse(&text) {
                            Ok(frame) => {
                                if let ProcessOutcome::Close(code) = session::process_frame(session, frame, services, out).await {
                                    let _ = out.send(Outbound::Close(code));
                                    break;
                                }
                            }
                            Err(e) => {
                                let _ = out.send(Outbound::Frame(gateway_proto::ServerFrame::Notice {
                                    text: format!("malformed frame: {e}"),
                                }));
                            }
                        }
                    }
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(e) => {
                        tracing::warn!(error = %e, "websocket read error");
                        break;
                    }
                }
            }
            _ = ticker.tick() => {
                session::poll_once(session, services, out).await;
            }
        }
    }
}
