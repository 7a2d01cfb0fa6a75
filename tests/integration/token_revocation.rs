//! Revoking a relay's token while a session is open pushes a `TOKEN
//! REVOKED` frame followed by a 4403 close, and the revoked token can no
//! longer open a new connection.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message as WsMessage;

use gateway_proto::{ClientFrame, RegistrationPayload, RelayMetadata, Signed};
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

struct NoopPeer;

#[async_trait]
impl PeerTransport for NoopPeer {
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
        Ok(vec![])
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

fn sign<T: Serialize>(payload: T, secret: &[u8]) -> Signed<T> {
    let bytes = serde_json::to_vec(&payload).expect("serialize payload");
    let signature = gateway_proto::signing::sign_hex(&bytes, secret).expect("sign payload");
    Signed { payload, signature }
}

#[tokio::test]
async fn revoking_a_token_closes_the_open_session_and_rejects_reconnect() {
    let transport = Arc::new(NoopPeer);
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
    assert!(http.post(format!("{base}/api/relays")).json(&registration).send().await.unwrap().status().is_success());

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
    let token = issued["token"].as_str().unwrap().to_string();

    let ws_url = format!("ws://{}/abc/def?token={token}", handle.addr);
    let (ws_stream, _response) = connect_async(&ws_url).await.expect("token should admit the session");
    let (_sink, mut stream) = ws_stream.split();

    let revoke_body = sign(serde_json::json!({ "relayKey": "abc:def", "reason": serde_json::Value::Null }), SHARED_SECRET);
    let revoke_response: serde_json::Value = http
        .post(format!("{base}/api/relay-tokens/revoke"))
        .json(&revoke_body)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let new_sequence = revoke_response["sequence"].as_u64().unwrap();

    let revoked_frame = tokio::time::timeout(Duration::from_secs(5), stream.next()).await.expect("timed out waiting for TOKEN REVOKED").unwrap().unwrap();
    let WsMessage::Text(text) = revoked_frame else { panic!("expected a text frame") };
    let parsed: serde_json::Value = serde_json::from_str(&text).unwrap();
    assert_eq!(parsed[0], "TOKEN");
    assert_eq!(parsed[1], "REVOKED");
    assert_eq!(parsed[2]["sequence"], new_sequence);

    let close_frame = tokio::time::timeout(Duration::from_secs(5), stream.next()).await.expect("timed out waiting for close").unwrap().unwrap();
    match close_frame {
        WsMessage::Close(Some(frame)) => assert_eq!(u16::from(frame.code), 4403),
        other => panic!("expected a close frame with code 4403, got {other:?}"),
    }

    // The HTTP upgrade itself always succeeds; admission is checked inside
    // the socket, so a rejected reconnect shows up as an immediate close
    // frame rather than a failed handshake.
    let (reconnect_stream, _response) = connect_async(&ws_url).await.expect("upgrade succeeds even though admission will be rejected");
    let (_sink, mut reconnect_rx) = reconnect_stream.split();
    let rejection = tokio::time::timeout(Duration::from_secs(5), reconnect_rx.next()).await.expect("timed out waiting for rejection").unwrap().unwrap();
    match rejection {
        WsMessage::Close(Some(frame)) => assert_eq!(u16::from(frame.code), 4403, "a revoked token must not admit a new session"),
        other => panic!("expected the revoked token to be rejected with a close frame, got {other:?}"),
    }

    handle.shutdown().await;
}
