//! `/drive` read-through accepts both separator forms of its identifier
//! (spec.md §6: "identifier may use `:` or `/` separator; both resolve to
//! the same descriptor") and drives the request over real HTTP rather than
//! just unit-testing the identifier helper in isolation.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;

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
const BLOB_BODY: &[u8] = b"blob-bytes";

struct FakePeer {
    forward_calls: AtomicU32,
    last_drive_call: Mutex<Option<(String, String)>>,
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
        _frame: &ClientFrame,
        _connection_key: &str,
        _relay_auth_token: &str,
    ) -> Result<Vec<String>, GatewayError> {
        self.forward_calls.fetch_add(1, Ordering::SeqCst);
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
    async fn fetch_blob(&self, _peer_id: &str, drive_identifier: &str, file_hash: &str) -> Result<(u16, Vec<u8>), GatewayError> {
        *self.last_drive_call.lock().unwrap() = Some((drive_identifier.to_string(), file_hash.to_string()));
        Ok((200, BLOB_BODY.to_vec()))
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

async fn start() -> (Arc<FakePeer>, gateway_server::GatewayServerHandle) {
    let transport = Arc::new(FakePeer { forward_calls: AtomicU32::new(0), last_drive_call: Mutex::new(None) });
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
    (transport, handle)
}

async fn register(base: &str) {
    let http = reqwest::Client::new();
    let registration = sign(
        RegistrationPayload {
            relay_key: "abc:def".into(),
            identifier: "abc/def".into(),
            peers: vec!["p1".into()],
            metadata: RelayMetadata { requires_auth: Some(true), ..Default::default() },
        },
        SHARED_SECRET,
    );
    let status = http.post(format!("{base}/api/relays")).json(&registration).send().await.unwrap().status();
    assert!(status.is_success(), "registration failed: {status}");
}

#[tokio::test]
async fn drive_route_resolves_slash_separated_identifier() {
    let (transport, handle) = start().await;
    let base = format!("http://{}", handle.addr);
    register(&base).await;

    let http = reqwest::Client::new();
    let response = http.get(format!("{base}/drive/abc/def/filehash")).send().await.unwrap();
    assert!(response.status().is_success(), "drive fetch failed: {}", response.status());
    let body = response.bytes().await.unwrap();
    assert_eq!(body.as_ref(), BLOB_BODY);

    let (identifier, file) = transport.last_drive_call.lock().unwrap().clone().expect("fetch_blob should have been called");
    assert_eq!(identifier, "abc/def");
    assert_eq!(file, "filehash");

    handle.shutdown().await;
}

#[tokio::test]
async fn drive_route_resolves_colon_separated_identifier() {
    let (transport, handle) = start().await;
    let base = format!("http://{}", handle.addr);
    register(&base).await;

    let http = reqwest::Client::new();
    let response = http.get(format!("{base}/drive/abc:def/filehash")).send().await.unwrap();
    assert!(response.status().is_success(), "drive fetch failed: {}", response.status());
    let body = response.bytes().await.unwrap();
    assert_eq!(body.as_ref(), BLOB_BODY);

    let (identifier, file) = transport.last_drive_call.lock().unwrap().clone().expect("fetch_blob should have been called");
    assert_eq!(identifier, "abc:def");
    assert_eq!(file, "filehash");

    handle.shutdown().await;
}
