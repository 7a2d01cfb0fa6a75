//! A registered relay with one peer answers a REQ through that peer, and
//! closing the subscription leaves the dispatcher's in-flight count back
//! where it started.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
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
use gateway_relay::error::GatewayError;
use gateway_relay::gateway_server::{self, GatewayServerState};
use gateway_relay::peer_pool::{PeerPool, PeerTransport};
use gateway_relay::pending_writes::PendingWritesPusher;
use gateway_relay::registration_store::RegistrationStore;
use gateway_relay::session::{PeerRotationCounters, SessionRegistry, SessionServices};
use gateway_relay::token_service::TokenService;

const SHARED_SECRET: &[u8] = b"integration-test-secret";

struct FakePeer {
    forward_calls: AtomicU32,
}

#[async_trait]
impl PeerTransport for FakePeer {
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
        frame: &ClientFrame,
        _connection_key: &str,
        _relay_auth_token: &str,
    ) -> Result<Vec<String>, GatewayError> {
        self.forward_calls.fetch_add(1, Ordering::SeqCst);
        match frame {
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
        pubkey: "pk-alice".into(),
        created_at: 1_000,
        kind: 1,
        tags: vec![],
        content: "hello".into(),
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
async fn happy_path_req_forwards_through_assigned_peer_and_releases_in_flight_slot() {
    let transport = Arc::new(FakePeer { forward_calls: AtomicU32::new(0) });
    let store = Arc::new(RegistrationStore::in_memory(3600));
    let token_service = Arc::new(TokenService::new(store.clone(), SHARED_SECRET.to_vec(), 300));
    let peer_pool = Arc::new(PeerPool::new(transport.clone()));
    let dispatcher = Arc::new(RelayDispatcher::new(DispatcherPolicy::default()));
    let pending_writes = Arc::new(PendingWritesPusher::new(transport.clone(), store.clone()));
    let services = Arc::new(SessionServices {
        registration_store: store.clone(),
        token_service,
        peer_pool,
        dispatcher: dispatcher.clone(),
        replica: None,
        peer_rotation: Arc::new(PeerRotationCounters::new()),
        dispatcher_enabled: true,
        token_enforcement_enabled: true,
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
            peers: vec!["p1".into()],
            metadata: RelayMetadata { requires_auth: Some(true), ..Default::default() },
        },
        SHARED_SECRET,
    );
    let register_status = http.post(format!("{base}/api/relays")).json(&registration).send().await.unwrap().status();
    assert!(register_status.is_success(), "registration failed: {register_status}");

    let issue_body = sign(
        serde_json::json!({
            "relayKey": "abc:def",
            "relayAuthToken": "worker-token",
            "pubkey": "PK",
            "scope": "read",
            "ttlSeconds": 3600,
        }),
        SHARED_SECRET,
    );
    let issued: serde_json::Value = http
        .post(format!("{base}/api/relay-tokens/issue"))
        .json(&issue_body)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let token = issued["token"].as_str().expect("token field").to_string();

    let ws_url = format!("ws://{}/abc/def?token={token}", handle.addr);
    let (ws_stream, _response) = connect_async(ws_url).await.expect("websocket upgrade should succeed");
    let (mut sink, mut stream) = ws_stream.split();

    let req_frame = ClientFrame::Req { sub_id: "s1".into(), filters: vec![Filter { kinds: Some(vec![1]), limit: Some(10), ..Default::default() }] }.to_text();
    sink.send(WsMessage::Text(req_frame.into())).await.unwrap();

    let mut saw_event = false;
    let mut saw_eose = false;
    for _ in 0..2 {
        let message = tokio::time::timeout(Duration::from_secs(5), stream.next()).await.expect("frame timeout").unwrap().unwrap();
        if let WsMessage::Text(text) = message {
            if text.starts_with(r#"["EVENT","s1","#) {
                saw_event = true;
            } else if text == r#"["EOSE","s1"]"# {
                saw_eose = true;
            }
        }
    }
    assert!(saw_event, "expected an EVENT frame tagged s1");
    assert!(saw_eose, "expected an EOSE frame tagged s1");

    let close_frame = ClientFrame::Close { sub_id: "s1".into() }.to_text();
    sink.send(WsMessage::Text(close_frame.into())).await.unwrap();

    let mut settled = false;
    for _ in 0..50 {
        if dispatcher.in_flight_jobs("p1").await == 0 {
            settled = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(settled, "dispatcher in-flight count for p1 did not return to its prior value");
    assert!(transport.forward_calls.load(Ordering::SeqCst) >= 1);

    handle.shutdown().await;
}
