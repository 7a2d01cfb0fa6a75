//! Public relay gateway: session routing and dispatch engine fronting a
//! peer-to-peer mesh of Nostr worker relays.
//!
//! Exposes every subsystem so integration tests can assemble their own
//! [`gateway_server::GatewayServerState`] against fake peer transports
//! without going through `main`.

pub mod config;
pub mod dispatcher;
pub mod error;
pub mod gateway_server;
pub mod mesh_transport;
pub mod peer_pool;
pub mod pending_writes;
pub mod registration_store;
pub mod replica;
pub mod session;
pub mod telemetry;
pub mod token_service;
pub mod util;
