//! A relay with no assigned peers and a local replica is served straight out
//! of the embedded store: the first `REQ` returns every matching event
//! newest-first, and a later `REQ` on the same subscription only returns
//! events strictly newer than what was already sent.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message as WsMessage;

use gateway_proto::{ClientFrame, Filter, NostrEvent, RegistrationPayload, RelayMetadata, Signed};
use gateway_relay::config::{DispatcherPolicy, GatewayConfig};
use gateway_relay::dispatcher::RelayDispatcher;
use gateway_relay::error::GatewayError;
use gateway_relay::gateway_server::{self, GatewayServerState};
use gateway_relay::peer_pool::{PeerPool, PeerTransport};
use gateway_relay::pending_writes::PendingWritesPusher;
use gateway_relay::registration_store::RegistrationStore;
use gateway_relay::replica::ReplicaAdapter;
use gateway_relay::session::{PeerRotationCounters, SessionRegistry, SessionServices};
use gateway_relay::token_service::TokenService;

const SHARED_SECRET: &[u8] = b"integration-test-secret";

/// Never actually dialed: the relay has no peers, so every request is
/// answered from the replica instead.
struct UnreachablePeer;

#[async_trait]
impl PeerTransport for UnreachablePeer {
    async fn dial(&self, _peer_id: &str) -> Result<(), GatewayError> {
        Ok(())
    }
    async fn ping(&self, _peer_id: &str) -> Result<(), GatewayError> {
        Ok(())
    }
    async fn forward(
        &self,
        _peer_id: &str,
        _relay_key: &str,
        _frame: &ClientFrame,
        _connection_key: &str,
        _relay_auth_token: &str,
    ) -> Result<Vec<String>, GatewayError> {
        panic!("a locally-served session should never forward to a peer")
    }
    async fn poll_events(
        &self,
        _peer_id: &str,
        _relay_key: &str,
        _connection_key: &str,
        _relay_auth_token: &str,
    ) -> Result<Vec<String>, GatewayError> {
        panic!("a locally-served session should never poll a peer")
    }
    async fn fetch_blob(&self, _peer_id: &str, _drive_identifier: &str, _file_hash: &str) -> Result<(u16, Vec<u8>), GatewayError> {
        Ok((200, vec![]))
    }
    async fn post_request(&self, _peer_id: &str, _path: &str, _body: &[u8]) -> Result<(u16, Vec<u8>), GatewayError> {
        Ok((200, vec![]))
    }
    async fn close(&self, _peer_id: &str) {}
}

fn event(id: &str, created_at: i64) -> NostrEvent {
    NostrEvent {
        id: id.into(),
        pubkey: "pk1".into(),
        created_at,
        kind: 1,
        tags: vec![],
        content: String::new(),
        sig: String::new(),
        extra: BTreeMap::new(),
    }
}

fn sign<T: Serialize>(payload: T, secret: &[u8]) -> Signed<T> {
    let bytes = serde_json::to_vec(&payload).expect("serialize payload");
    let signature = gateway_proto::signing::sign_hex(&bytes, secret).expect("sign payload");
    Signed { payload, signature }
}

#[tokio::test]
async fn local_replica_answers_req_and_later_only_returns_strictly_newer_events() {
    let transport = Arc::new(UnreachablePeer);
    let store = Arc::new(RegistrationStore::in_memory(3600));
    let token_service = Arc::new(TokenService::new(store.clone(), SHARED_SECRET.to_vec(), 300));
    let peer_pool = Arc::new(PeerPool::new(transport.clone()));
    let dispatcher = Arc::new(RelayDispatcher::new(DispatcherPolicy::default()));
    let pending_writes = Arc::new(PendingWritesPusher::new(transport.clone(), store.clone()));

    let db = sled::Config::new().temporary(true).open().expect("open temp replica db");
    let replica = Arc::new(ReplicaAdapter::open(&db).expect("open replica adapter"));
    replica.set_lease_active(true);
    replica.append_event(&event("e1", 100)).unwrap();
    replica.append_event(&event("e2", 200)).unwrap();

    let services = Arc::new(SessionServices {
        registration_store: store.clone(),
        token_service,
        peer_pool,
        dispatcher,
        replica: Some(replica.clone()),
        peer_rotation: Arc::new(PeerRotationCounters::new()),
        dispatcher_enabled: true,
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
            relay_key: "abc:def".into(),
            identifier: "abc/def".into(),
            peers: vec![],
            metadata: RelayMetadata { requires_auth: Some(false), is_replica: Some(true), ..Default::default() },
        },
        SHARED_SECRET,
    );
    let register_status = http.post(format!("{base}/api/relays")).json(&registration).send().await.unwrap().status();
    assert!(register_status.is_success(), "registration failed: {register_status}");

    let ws_url = format!("ws://{}/abc/def", handle.addr);
    let (ws_stream, _response) = connect_async(ws_url).await.expect("websocket upgrade should succeed");
    let (mut sink, mut stream) = ws_stream.split();

    let req_frame = ClientFrame::Req { sub_id: "s1".into(), filters: vec![Filter { kinds: Some(vec![1]), ..Default::default() }] }.to_text();
    sink.send(WsMessage::Text(req_frame.into())).await.unwrap();

    let mut received_ids = Vec::new();
    loop {
        let message = tokio::time::timeout(Duration::from_secs(5), stream.next()).await.expect("frame timeout").unwrap().unwrap();
        let WsMessage::Text(text) = message else { panic!("expected a text frame") };
        let parsed: serde_json::Value = serde_json::from_str(&text).unwrap();
        match parsed[0].as_str().unwrap() {
            "EVENT" => received_ids.push(parsed[2]["id"].as_str().unwrap().to_string()),
            "EOSE" => break,
            other => panic!("unexpected frame kind {other}"),
        }
    }
    assert_eq!(received_ids, vec!["e2".to_string(), "e1".to_string()], "events must come back newest-first");

    // A third event lands after the initial REQ. The next poll tick for the
    // same subscription must surface only e3, not e1/e2 again.
    replica.append_event(&event("e3", 300)).unwrap();

    let next = tokio::time::timeout(Duration::from_secs(3), stream.next()).await.expect("timed out waiting for the poll tick").unwrap().unwrap();
    let WsMessage::Text(text) = next else { panic!("expected a text frame") };
    let parsed: serde_json::Value = serde_json::from_str(&text).unwrap();
    assert_eq!(parsed[0], "EVENT");
    assert_eq!(parsed[1], "s1");
    assert_eq!(parsed[2]["id"], "e3", "the poll tick must only surface the strictly-newer event");

    handle.shutdown().await;
}
