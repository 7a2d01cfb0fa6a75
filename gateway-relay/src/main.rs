//! Gateway relay server -- public relay gateway fronting a peer-to-peer
//! mesh of Nostr worker relays.
//!
//! Wires together every subsystem (registration store, token service, peer
//! pool, dispatcher, replica adapter, pending-write pusher) behind the
//! axum HTTP/WebSocket front-end and runs until a shutdown signal arrives.
//!
//! # Usage
//!
//! ```bash
//! GATEWAY_SHARED_SECRET=s3cr3t cargo run --bin gateway-relay -- --bind 0.0.0.0:8080
//! ```

use std::sync::Arc;

use clap::Parser;

use gateway_relay::config::{GatewayCliArgs, GatewayConfig};
use gateway_relay::dispatcher::RelayDispatcher;
use gateway_relay::gateway_server::{self, GatewayServerState};
use gateway_relay::mesh_transport::WsMeshTransport;
use gateway_relay::peer_pool::{PeerPool, PeerTransport};
use gateway_relay::pending_writes::PendingWritesPusher;
use gateway_relay::registration_store::RegistrationStore;
use gateway_relay::replica::ReplicaAdapter;
use gateway_relay::session::{PeerRotationCounters, SessionRegistry, SessionServices};

#[tokio::main]
async fn main() {
    let cli = GatewayCliArgs::parse();

    let config = match GatewayConfig::load(&cli) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("invalid configuration: {e}");
            std::process::exit(1);
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(config.log_level.clone()))
        .init();
    tracing::info!(bind_addr = %config.bind_addr, "starting gateway relay");

    let registration_store = Arc::new(match &config.cache_url {
        Some(url) => match RegistrationStore::remote_cache(url, config.cache_namespace.clone(), config.cache_ttl_seconds) {
            Ok(store) => store,
            Err(e) => {
                tracing::warn!(error = %e, "failed to build remote-cache registration store, falling back to in-memory");
                RegistrationStore::in_memory(config.cache_ttl_seconds)
            }
        },
        None => RegistrationStore::in_memory(config.cache_ttl_seconds),
    });

    let shared_secret = config.shared_secret.clone().unwrap_or_default().into_bytes();
    let token_service = Arc::new(gateway_relay::token_service::TokenService::new(
        Arc::clone(&registration_store),
        shared_secret,
        config.token_refresh_window_seconds,
    ));

    let transport: Arc<dyn PeerTransport> = Arc::new(WsMeshTransport::new());
    let peer_pool = Arc::new(PeerPool::new(Arc::clone(&transport)));
    let dispatcher = Arc::new(RelayDispatcher::new(config.dispatcher));

    let replica = if config.relay_hyperbee_enabled {
        match open_replica_db() {
            Ok(db) => match ReplicaAdapter::open(&db) {
                Ok(adapter) => Some(Arc::new(adapter)),
                Err(e) => {
                    tracing::error!(error = %e, "failed to open replica database, running without local fallback");
                    None
                }
            },
            Err(e) => {
                tracing::error!(error = %e, "failed to open replica data directory, running without local fallback");
                None
            }
        }
    } else {
        None
    };

    let services = Arc::new(SessionServices {
        registration_store: Arc::clone(&registration_store),
        token_service,
        peer_pool: Arc::clone(&peer_pool),
        dispatcher,
        replica,
        peer_rotation: Arc::new(PeerRotationCounters::new()),
        dispatcher_enabled: config.dispatcher_enabled,
        token_enforcement_enabled: config.token_enforcement_enabled,
    });

    let session_registry = Arc::new(SessionRegistry::new());
    let pending_writes = Arc::new(PendingWritesPusher::new(Arc::clone(&transport), Arc::clone(&registration_store)));

    let state = Arc::new(GatewayServerState::new(
        services,
        session_registry,
        pending_writes,
        transport,
        config.clone(),
    ));

    let handle = match gateway_server::start_server(&config.bind_addr, state).await {
        Ok(handle) => handle,
        Err(e) => {
            tracing::error!(error = %e, "failed to bind gateway server");
            std::process::exit(1);
        }
    };

    tracing::info!(addr = %handle.addr, "gateway relay listening");

    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
    }

    tracing::info!("shutdown signal received, draining");
    handle.shutdown().await;
}

/// Opens the embedded replica database under the platform data directory
/// (`gateway-relay/replica` under [`dirs::data_dir`], falling back to the
/// current directory if unavailable).
fn open_replica_db() -> Result<sled::Db, sled::Error> {
    let path = dirs::data_dir()
        .map(|dir| dir.join("gateway-relay").join("replica"))
        .unwrap_or_else(|| std::path::PathBuf::from("gateway-relay-replica"));
    sled::open(path)
}
