//! A session whose first assigned peer fails an EVENT forward rotates to
//! the next assigned peer without surfacing an error to the client, and a
//! subsequent REQ favors the peer that actually worked.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message as WsMessage;

use gateway_proto::{ClientFrame, Filter, NostrEvent, RegistrationPayload, RelayMetadata, ServerFrame, Signed};
use gateway_relay::config::{DispatcherPolicy, GatewayConfig};
use gateway_relay::dispatcher::RelayDispatcher;
use gateway_relay::error::{ErrorKind, GatewayError};
use gateway_relay::gateway_server::{self, GatewayServerState};
use gateway_relay::peer_pool::{PeerPool, PeerTransport};
use gateway_relay::pending_writes::PendingWritesPusher;
use gateway_relay::registration_store::RegistrationStore;
use gateway_relay::session::{PeerRotationCounters, SessionRegistry, SessionServices};
use gateway_relay::token_service::TokenService;

const SHARED_SECRET: &[u8] = b"integration-test-secret";

/// `dial`/`ping` always succeed; `forward` fails for `p1` and succeeds for
/// `p2`, so the session's peer-rotation fallback is what makes the call work.
struct FlakyFirstPeer {
    calls_by_peer: std::sync::Mutex<BTreeMap<String, u32>>,
}

impl FlakyFirstPeer {
    fn new() -> Self {
        Self { calls_by_peer: std::sync::Mutex::new(BTreeMap::new()) }
    }

    fn calls_for(&self, peer_id: &str) -> u32 {
        self.calls_by_peer.lock().unwrap().get(peer_id).copied().unwrap_or(0)
    }
}

#[async_trait]
impl PeerTransport for FlakyFirstPeer {
    async fn dial(&self, _peer_id: &str) -> Result<(), GatewayError> {
        Ok(())
    }
    async fn ping(&self, _peer_id: &str) -> Result<(), GatewayError> {
        Ok(())
    }
    async fn forward(
        &self,
        peer_id: &str,
        _relay_key: &str,
        frame: &ClientFrame,
        _connection_key: &str,
        _relay_auth_token: &str,
    ) -> Result<Vec<String>, GatewayError> {
        *self.calls_by_peer.lock().unwrap().entry(peer_id.to_string()).or_insert(0) += 1;
        if peer_id == "p1" {
            return Err(GatewayError::new(ErrorKind::PeerUnreachable, "p1 is down"));
        }
        match frame {
            ClientFrame::Event(event) => {
                Ok(vec![ServerFrame::Ok { event_id: event.id.clone(), accepted: true, message: String::new() }.to_text()])
            }
            ClientFrame::Req { sub_id, .. } => Ok(vec![
                ServerFrame::Event { sub_id: sub_id.clone(), event: sample_event(sub_id) }.to_text(),
                ServerFrame::Eose { sub_id: sub_id.clone() }.to_text(),
            ]),
            _ => Ok(vec![]),
        }
    }
    async fn poll_events(
        &self,
        _peer_id: &str,
        _relay_key: &str,
        _connection_key: &str,
        _relay_auth_token: &str,
    ) -> Result<Vec<String>, GatewayError> {
        Ok(vec![])
    }
    async fn fetch_blob(&self, _peer_id: &str, _drive_identifier: &str, _file_hash: &str) -> Result<(u16, Vec<u8>), GatewayError> {
        Ok((200, vec![]))
    }
    async fn post_request(&self, _peer_id: &str, _path: &str, _body: &[u8]) -> Result<(u16, Vec<u8>), GatewayError> {
        Ok((200, vec![]))
    }
    async fn close(&self, _peer_id: &str) {}
}

fn sample_event(sub_id: &str) -> NostrEvent {
    NostrEvent {
        id: format!("event-{sub_id}"),
        pubkey: "pk-bob".into(),
        created_at: 2_000,
        kind: 1,
        tags: vec![],
        content: "hi".into(),
        sig: "sig".into(),
        extra: BTreeMap::new(),
    }
}

fn sign<T: Serialize>(payload: T, secret: &[u8]) -> Signed<T> {
    let bytes = serde_json::to_vec(&payload).expect("serialize payload");
    let signature = gateway_proto::signing::sign_hex(&bytes, secret).expect("sign payload");
    Signed { payload, signature }
}

#[tokio::test]
async fn forward_failure_rotates_to_next_peer_without_surfacing_an_error() {
    let transport = Arc::new(FlakyFirstPeer::new());
    let store = Arc::new(RegistrationStore::in_memory(3600));
    let token_service = Arc::new(TokenService::new(store.clone(), SHARED_SECRET.to_vec(), 300));
    let peer_pool = Arc::new(PeerPool::new(transport.clone()));
    let dispatcher = Arc::new(RelayDispatcher::new(DispatcherPolicy::default()));
    let pending_writes = Arc::new(PendingWritesPusher::new(transport.clone(), store.clone()));
    let services = Arc::new(SessionServices {
        registration_store: store.clone(),
        token_service,
        peer_pool,
        dispatcher,
        replica: None,
        peer_rotation: Arc::new(PeerRotationCounters::new()),
        // Disabled so the follow-up REQ goes to `session.current_peer()`,
        // proving the session's own rotated index stuck, not a dispatcher
        // reassignment.
        dispatcher_enabled: false,
        token_enforcement_enabled: false,
    });
    let session_registry = Arc::new(SessionRegistry::new());

    let config = GatewayConfig {
        shared_secret: Some(String::from_utf8(SHARED_SECRET.to_vec()).unwrap()),
        ..GatewayConfig::default()
    };
    let state = Arc::new(GatewayServerState::new(services, session_registry, pending_writes, transport.clone(), config));
    let handle = gateway_server::start_test_server(state).await.expect("server should bind");

    let http = reqwest::Client::new();
    let base = format!("http://{}", handle.addr);
    let registration = sign(
        RegistrationPayload {
            relay_key: "chan:one".into(),
            identifier: "chan/one".into(),
            peers: vec!["p1".into(), "p2".into()],
            metadata: RelayMetadata { requires_auth: Some(false), ..Default::default() },
        },
        SHARED_SECRET,
    );
    let status = http.post(format!("{base}/api/relays")).json(&registration).send().await.unwrap().status();
    assert!(status.is_success());

    let ws_url = format!("ws://{}/chan/one", handle.addr);
    let (ws_stream, _response) = connect_async(ws_url).await.expect("websocket upgrade should succeed");
    let (mut sink, mut stream) = ws_stream.split();

    let event = NostrEvent {
        id: "e1".into(),
        pubkey: "pk-alice".into(),
        created_at: 1,
        kind: 1,
        tags: vec![],
        content: "hello".into(),
        sig: "sig".into(),
        extra: BTreeMap::new(),
    };
    sink.send(WsMessage::Text(ClientFrame::Event(event.clone()).to_text().into())).await.unwrap();

    let message = tokio::time::timeout(Duration::from_secs(5), stream.next()).await.expect("frame timeout").unwrap().unwrap();
    let WsMessage::Text(text) = message else { panic!("expected a text frame") };
    let parsed: serde_json::Value = serde_json::from_str(&text).unwrap();
    assert_eq!(parsed[0], "OK");
    assert_eq!(parsed[1], "e1");
    assert_eq!(parsed[2], true, "rotating onto p2 should report the event as accepted, not surface the p1 failure");

    // A subsequent REQ should favor p2: the session's peer_index already
    // rotated off p1 during the event forward above.
    let req_frame = ClientFrame::Req { sub_id: "s1".into(), filters: vec![Filter::default()] }.to_text();
    sink.send(WsMessage::Text(req_frame.into())).await.unwrap();
    for _ in 0..2 {
        let _ = tokio::time::timeout(Duration::from_secs(5), stream.next()).await.expect("frame timeout").unwrap().unwrap();
    }

    assert_eq!(transport.calls_for("p1"), 1, "p1 should only be tried once before rotating away");
    assert!(transport.calls_for("p2") >= 2, "subsequent requests should favor p2 after rotation");

    handle.shutdown().await;
}

/// A fresh session's very first frame is a `REQ` that lands on the
/// dispatcher-assigned peer, `p1`, which fails. This exercises the
/// dispatched-REQ fallback path directly (no prior `EVENT` rotation to
/// piggyback on), for both dispatcher states.
async fn req_forward_failure_falls_back_to_next_peer(dispatcher_enabled: bool) {
    let transport = Arc::new(FlakyFirstPeer::new());
    let store = Arc::new(RegistrationStore::in_memory(3600));
    let token_service = Arc::new(TokenService::new(store.clone(), SHARED_SECRET.to_vec(), 300));
    let peer_pool = Arc::new(PeerPool::new(transport.clone()));
    let dispatcher = Arc::new(RelayDispatcher::new(DispatcherPolicy::default()));
    let pending_writes = Arc::new(PendingWritesPusher::new(transport.clone(), store.clone()));
    let services = Arc::new(SessionServices {
        registration_store: store.clone(),
        token_service,
        peer_pool,
        dispatcher,
        replica: None,
        peer_rotation: Arc::new(PeerRotationCounters::new()),
        dispatcher_enabled,
        token_enforcement_enabled: false,
    });
    let session_registry = Arc::new(SessionRegistry::new());

    let config = GatewayConfig {
        shared_secret: Some(String::from_utf8(SHARED_SECRET.to_vec()).unwrap()),
        ..GatewayConfig::default()
    };
    let state = Arc::new(GatewayServerState::new(services, session_registry, pending_writes, transport.clone(), config));
    let handle = gateway_server::start_test_server(state).await.expect("server should bind");

    let http = reqwest::Client::new();
    let base = format!("http://{}", handle.addr);
    let registration = sign(
        RegistrationPayload {
            relay_key: "chan:two".into(),
            identifier: "chan/two".into(),
            peers: vec!["p1".into(), "p2".into()],
            metadata: RelayMetadata { requires_auth: Some(false), ..Default::default() },
        },
        SHARED_SECRET,
    );
    let status = http.post(format!("{base}/api/relays")).json(&registration).send().await.unwrap().status();
    assert!(status.is_success());

    let ws_url = format!("ws://{}/chan/two", handle.addr);
    let (ws_stream, _response) = connect_async(ws_url).await.expect("websocket upgrade should succeed");
    let (mut sink, mut stream) = ws_stream.split();

    // First frame on this session is the REQ itself: p1 is still current
    // (and, when the dispatcher is enabled, still the assigned peer).
    let req_frame = ClientFrame::Req { sub_id: "s1".into(), filters: vec![Filter::default()] }.to_text();
    sink.send(WsMessage::Text(req_frame.into())).await.unwrap();

    for _ in 0..2 {
        let message = tokio::time::timeout(Duration::from_secs(5), stream.next()).await.expect("frame timeout").unwrap().unwrap();
        let WsMessage::Text(text) = message else { panic!("expected a text frame") };
        let parsed: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_ne!(parsed[0], "NOTICE", "a failure on p1 should be masked by falling back to p2, not surfaced to the client");
    }

    assert!(transport.calls_for("p1") >= 1, "p1 should have been tried before falling back");
    assert!(transport.calls_for("p2") >= 1, "p2 should have served the REQ once the session fell back to it");

    handle.shutdown().await;
}

#[tokio::test]
async fn req_forward_failure_falls_back_to_next_peer_with_dispatcher_enabled() {
    req_forward_failure_falls_back_to_next_peer(true).await;
}

#[tokio::test]
async fn req_forward_failure_falls_back_to_next_peer_with_dispatcher_disabled() {
    req_forward_failure_falls_back_to_next_peer(false).await;
}
