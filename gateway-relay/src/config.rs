//! Configuration system for the gateway relay.
//!
//! Layered configuration with the following priority (highest first):
//! 1. CLI arguments
//! 2. Environment variables (via clap `env` attribute)
//! 3. TOML config file (`~/.config/gateway-relay/config.toml`)
//! 4. Compiled defaults

use std::path::PathBuf;

/// Errors that can occur when loading gateway configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read the configuration file.
    #[error("failed to read config file {path}: {source}")]
    ReadFile {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Failed to parse the TOML configuration.
    #[error("failed to parse config file: {0}")]
    ParseToml(#[from] toml::de::Error),

    /// Token enforcement is on but no shared secret was supplied anywhere.
    #[error("token-enforcement-enabled requires a shared secret (--shared-secret or GATEWAY_SHARED_SECRET)")]
    MissingSharedSecret,

    /// Only one of `tls_cert_path`/`tls_key_path` was given.
    #[error("TLS requires both --tls-cert and --tls-key to be set")]
    IncompleteTlsConfig,

    /// A configured TLS path does not exist.
    #[error("TLS material unreadable: {0}")]
    TlsMaterialUnreadable(PathBuf),
}

// ---------------------------------------------------------------------------
// TOML file structs (all fields Option for partial overrides)
// ---------------------------------------------------------------------------

#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct GatewayConfigFile {
    server: ServerFileConfig,
    cache: CacheFileConfig,
    dispatcher: DispatcherFileConfig,
    features: FeaturesFileConfig,
}

#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ServerFileConfig {
    bind_addr: Option<String>,
    public_base_url: Option<String>,
    default_token_ttl_seconds: Option<u64>,
    token_refresh_window_seconds: Option<u64>,
    rate_limit_per_second: Option<u32>,
    rate_limit_burst: Option<u32>,
    tls_cert_path: Option<PathBuf>,
    tls_key_path: Option<PathBuf>,
}

#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct CacheFileConfig {
    url: Option<String>,
    namespace: Option<String>,
    ttl_seconds: Option<u64>,
}

#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct DispatcherFileConfig {
    max_concurrent_jobs_per_peer: Option<u32>,
    in_flight_weight: Option<f64>,
    latency_weight: Option<f64>,
    failure_weight: Option<f64>,
    reassign_on_lag_blocks: Option<u64>,
    lag_penalty: Option<f64>,
    circuit_breaker_threshold: Option<u32>,
    circuit_breaker_duration_ms: Option<u64>,
}

#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct FeaturesFileConfig {
    relay_hyperbee_enabled: Option<bool>,
    dispatcher_enabled: Option<bool>,
    token_enforcement_enabled: Option<bool>,
    discovery_enabled: Option<bool>,
}

// ---------------------------------------------------------------------------
// CLI arguments
// ---------------------------------------------------------------------------

/// CLI arguments for the gateway relay.
#[derive(clap::Parser, Debug, Default)]
#[command(version, about = "Nostr worker-relay gateway")]
pub struct GatewayCliArgs {
    /// Address to bind the gateway server to.
    #[arg(short, long, env = "GATEWAY_ADDR")]
    pub bind: Option<String>,

    /// Path to config file (default: `~/.config/gateway-relay/config.toml`).
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Shared HMAC secret for signed registration/token operations.
    #[arg(long, env = "GATEWAY_SHARED_SECRET")]
    pub shared_secret: Option<String>,

    /// Redis URL for the remote-cache registration store variant.
    #[arg(long, env = "GATEWAY_CACHE_URL")]
    pub cache_url: Option<String>,

    /// Log level filter (trace, debug, info, warn, error).
    #[arg(long, default_value = "info", env = "GATEWAY_LOG")]
    pub log_level: String,

    /// Disable the dispatcher (every REQ forwards to the current peer directly).
    #[arg(long)]
    pub no_dispatcher: bool,

    /// Disable token enforcement (every relay behaves as `requiresAuth: false`).
    #[arg(long)]
    pub no_token_enforcement: bool,

    /// Path to a TLS certificate. Requires `tls_key_path` to also be set.
    #[arg(long = "tls-cert", env = "GATEWAY_TLS_CERT")]
    pub tls_cert_path: Option<PathBuf>,

    /// Path to a TLS private key. Requires `tls_cert_path` to also be set.
    #[arg(long = "tls-key", env = "GATEWAY_TLS_KEY")]
    pub tls_key_path: Option<PathBuf>,
}

// ---------------------------------------------------------------------------
// Resolved configuration
// ---------------------------------------------------------------------------

/// Dispatcher scoring/breaker policy (spec §4.5), hot-swappable at runtime
/// via `RelayDispatcher::apply_policy_update`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DispatcherPolicy {
    pub max_concurrent_jobs_per_peer: u32,
    pub in_flight_weight: f64,
    pub latency_weight: f64,
    pub failure_weight: f64,
    pub reassign_on_lag_blocks: u64,
    /// Score penalty added when a peer's `replicaLag` exceeds
    /// `reassign_on_lag_blocks` (spec §4.5).
    pub lag_penalty: f64,
    pub circuit_breaker_threshold: u32,
    pub circuit_breaker_duration_ms: u64,
}

impl Default for DispatcherPolicy {
    fn default() -> Self {
        Self {
            max_concurrent_jobs_per_peer: 32,
            in_flight_weight: 1.0,
            latency_weight: 0.01,
            failure_weight: 5.0,
            reassign_on_lag_blocks: 50,
            lag_penalty: 1000.0,
            circuit_breaker_threshold: 5,
            circuit_breaker_duration_ms: 30_000,
        }
    }
}

/// Fully resolved gateway configuration.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub bind_addr: String,
    pub public_base_url: String,
    pub shared_secret: Option<String>,
    pub cache_url: Option<String>,
    pub cache_namespace: String,
    pub cache_ttl_seconds: u64,
    pub default_token_ttl_seconds: u64,
    pub token_refresh_window_seconds: u64,
    pub rate_limit_per_second: u32,
    pub rate_limit_burst: u32,
    pub discovery_enabled: bool,
    pub dispatcher: DispatcherPolicy,
    pub relay_hyperbee_enabled: bool,
    pub dispatcher_enabled: bool,
    pub token_enforcement_enabled: bool,
    pub log_level: String,
    pub tls_cert_path: Option<PathBuf>,
    pub tls_key_path: Option<PathBuf>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8080".to_string(),
            public_base_url: "http://localhost:8080".to_string(),
            shared_secret: None,
            cache_url: None,
            cache_namespace: "gw".to_string(),
            cache_ttl_seconds: 3600,
            default_token_ttl_seconds: 3600,
            token_refresh_window_seconds: 300,
            rate_limit_per_second: 20,
            rate_limit_burst: 40,
            discovery_enabled: true,
            dispatcher: DispatcherPolicy::default(),
            relay_hyperbee_enabled: true,
            dispatcher_enabled: true,
            token_enforcement_enabled: true,
            log_level: "info".to_string(),
            tls_cert_path: None,
            tls_key_path: None,
        }
    }
}

impl GatewayConfig {
    /// Loads configuration by merging CLI args, env vars, and a TOML file,
    /// then validates the fail-closed invariants from spec §6/§7.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the config file cannot be read/parsed, or
    /// if token enforcement is enabled without a shared secret.
    pub fn load(cli: &GatewayCliArgs) -> Result<Self, ConfigError> {
        let file = load_config_file(cli.config.as_deref())?;
        let resolved = Self::resolve(cli, &file);
        resolved.validate()?;
        Ok(resolved)
    }

    #[must_use]
    fn resolve(cli: &GatewayCliArgs, file: &GatewayConfigFile) -> Self {
        let defaults = Self::default();

        let dispatcher = DispatcherPolicy {
            max_concurrent_jobs_per_peer: file
                .dispatcher
                .max_concurrent_jobs_per_peer
                .unwrap_or(defaults.dispatcher.max_concurrent_jobs_per_peer),
            in_flight_weight: file
                .dispatcher
                .in_flight_weight
                .unwrap_or(defaults.dispatcher.in_flight_weight),
            latency_weight: file
                .dispatcher
                .latency_weight
                .unwrap_or(defaults.dispatcher.latency_weight),
            failure_weight: file
                .dispatcher
                .failure_weight
                .unwrap_or(defaults.dispatcher.failure_weight),
            reassign_on_lag_blocks: file
                .dispatcher
                .reassign_on_lag_blocks
                .unwrap_or(defaults.dispatcher.reassign_on_lag_blocks),
            lag_penalty: file.dispatcher.lag_penalty.unwrap_or(defaults.dispatcher.lag_penalty),
            circuit_breaker_threshold: file
                .dispatcher
                .circuit_breaker_threshold
                .unwrap_or(defaults.dispatcher.circuit_breaker_threshold),
            circuit_breaker_duration_ms: file
                .dispatcher
                .circuit_breaker_duration_ms
                .unwrap_or(defaults.dispatcher.circuit_breaker_duration_ms),
        };

        Self {
            bind_addr: cli
                .bind
                .clone()
                .or_else(|| file.server.bind_addr.clone())
                .unwrap_or(defaults.bind_addr),
            public_base_url: file
                .server
                .public_base_url
                .clone()
                .unwrap_or(defaults.public_base_url),
            shared_secret: cli.shared_secret.clone(),
            cache_url: cli.cache_url.clone().or(file.cache.url.clone()),
            cache_namespace: file.cache.namespace.clone().unwrap_or(defaults.cache_namespace),
            cache_ttl_seconds: file.cache.ttl_seconds.unwrap_or(defaults.cache_ttl_seconds),
            default_token_ttl_seconds: file
                .server
                .default_token_ttl_seconds
                .unwrap_or(defaults.default_token_ttl_seconds),
            token_refresh_window_seconds: file
                .server
                .token_refresh_window_seconds
                .unwrap_or(defaults.token_refresh_window_seconds),
            rate_limit_per_second: file
                .server
                .rate_limit_per_second
                .unwrap_or(defaults.rate_limit_per_second),
            rate_limit_burst: file.server.rate_limit_burst.unwrap_or(defaults.rate_limit_burst),
            discovery_enabled: file.features.discovery_enabled.unwrap_or(defaults.discovery_enabled),
            dispatcher,
            relay_hyperbee_enabled: file
                .features
                .relay_hyperbee_enabled
                .unwrap_or(defaults.relay_hyperbee_enabled),
            dispatcher_enabled: !cli.no_dispatcher
                && file.features.dispatcher_enabled.unwrap_or(defaults.dispatcher_enabled),
            token_enforcement_enabled: !cli.no_token_enforcement
                && file
                    .features
                    .token_enforcement_enabled
                    .unwrap_or(defaults.token_enforcement_enabled),
            log_level: cli.log_level.clone(),
            tls_cert_path: cli.tls_cert_path.clone().or_else(|| file.server.tls_cert_path.clone()),
            tls_key_path: cli.tls_key_path.clone().or_else(|| file.server.tls_key_path.clone()),
        }
    }

    /// Fails closed on the conditions spec §6 requires a non-zero exit for:
    /// token enforcement without a shared secret, or TLS configured
    /// incompletely or pointing at a file that doesn't exist.
    fn validate(&self) -> Result<(), ConfigError> {
        if self.token_enforcement_enabled && self.shared_secret.is_none() {
            return Err(ConfigError::MissingSharedSecret);
        }
        match (&self.tls_cert_path, &self.tls_key_path) {
            (Some(cert), Some(key)) => {
                if !cert.is_file() {
                    return Err(ConfigError::TlsMaterialUnreadable(cert.clone()));
                }
                if !key.is_file() {
                    return Err(ConfigError::TlsMaterialUnreadable(key.clone()));
                }
            }
            (None, None) => {}
            _ => return Err(ConfigError::IncompleteTlsConfig),
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Internal helpers
// ---------------------------------------------------------------------------

fn load_config_file(explicit_path: Option<&std::path::Path>) -> Result<GatewayConfigFile, ConfigError> {
    let path = if let Some(p) = explicit_path {
        let contents = std::fs::read_to_string(p).map_err(|e| ConfigError::ReadFile {
            path: p.to_path_buf(),
            source: e,
        })?;
        return Ok(toml::from_str(&contents)?);
    } else {
        let Some(config_dir) = dirs::config_dir() else {
            return Ok(GatewayConfigFile::default());
        };
        config_dir.join("gateway-relay").join("config.toml")
    };

    match std::fs::read_to_string(&path) {
        Ok(contents) => Ok(toml::from_str(&contents)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(GatewayConfigFile::default()),
        Err(e) => Err(ConfigError::ReadFile { path, source: e }),
    }
}
