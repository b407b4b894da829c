use std::collections::HashSet;
use std::net::SocketAddr;
use std::time::Duration;

use parley_common::helpers::{env_bool, env_u64, env_usize};

const DEFAULT_BIND_ADDR: &str = "127.0.0.1:5050";

const DEFAULT_ALLOWED_ORIGINS: [&str; 4] = [
    "http://localhost:5173",
    "http://127.0.0.1:5173",
    "http://localhost:5050",
    "http://127.0.0.1:5050",
];

/// Gateway runtime settings, read from `PARLEY_*` environment variables.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub bind_addr: SocketAddr,
    pub allow_public_bind: bool,
    /// TTL applied when a client registers a session without asking for one.
    pub session_ttl: Duration,
    pub session_max_ttl: Duration,
    /// Idle lifetime of a half-finished signaling exchange.
    pub signal_ttl: Duration,
    pub sweep_interval: Duration,
    pub max_connections: usize,
    pub max_connections_per_ip: usize,
    pub max_upgrades_per_minute: u32,
    pub max_messages_per_minute: u32,
    pub max_frame_bytes: usize,
    pub outbox_capacity: usize,
    pub allowed_origins: HashSet<String>,
    pub allow_missing_origin: bool,
    pub cors_allow_any: bool,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 5050)),
            allow_public_bind: false,
            session_ttl: Duration::from_secs(3600),
            session_max_ttl: Duration::from_secs(24 * 3600),
            signal_ttl: Duration::from_secs(120),
            sweep_interval: Duration::from_secs(30),
            max_connections: 4096,
            max_connections_per_ip: 16,
            max_upgrades_per_minute: 60,
            max_messages_per_minute: 600,
            max_frame_bytes: 64 * 1024,
            outbox_capacity: 128,
            allowed_origins: default_origins(),
            allow_missing_origin: true,
            cors_allow_any: false,
        }
    }
}

impl GatewayConfig {
    pub fn from_env() -> parley_common::Result<Self> {
        let defaults = Self::default();

        let bind_raw =
            std::env::var("PARLEY_BIND_ADDR").unwrap_or_else(|_| DEFAULT_BIND_ADDR.to_string());
        let bind_addr: SocketAddr = bind_raw.trim().parse().map_err(|err| {
            parley_common::Error::config(format!("invalid PARLEY_BIND_ADDR {bind_raw:?}: {err}"))
        })?;

        let session_ttl = secs("PARLEY_SESSION_TTL_SECS", defaults.session_ttl);
        let session_max_ttl = secs("PARLEY_SESSION_MAX_TTL_SECS", defaults.session_max_ttl);
        if session_ttl > session_max_ttl {
            return Err(parley_common::Error::config(
                "PARLEY_SESSION_TTL_SECS must not exceed PARLEY_SESSION_MAX_TTL_SECS",
            ));
        }

        Ok(Self {
            bind_addr,
            allow_public_bind: env_bool("PARLEY_ALLOW_PUBLIC_BIND", defaults.allow_public_bind),
            session_ttl,
            session_max_ttl,
            signal_ttl: secs("PARLEY_SIGNAL_TTL_SECS", defaults.signal_ttl),
            sweep_interval: secs("PARLEY_SWEEP_INTERVAL_SECS", defaults.sweep_interval),
            max_connections: env_usize("PARLEY_WS_MAX_CONNECTIONS", defaults.max_connections),
            max_connections_per_ip: env_usize(
                "PARLEY_WS_MAX_PER_IP",
                defaults.max_connections_per_ip,
            ),
            max_upgrades_per_minute: env_u64(
                "PARLEY_WS_UPGRADES_PER_MINUTE",
                defaults.max_upgrades_per_minute as u64,
            )
            .min(u32::MAX as u64) as u32,
            max_messages_per_minute: env_u64(
                "PARLEY_WS_MAX_MESSAGES_PER_MINUTE",
                defaults.max_messages_per_minute as u64,
            )
            .min(u32::MAX as u64) as u32,
            max_frame_bytes: env_usize("PARLEY_WS_MAX_FRAME_BYTES", defaults.max_frame_bytes),
            outbox_capacity: env_usize("PARLEY_WS_OUTBOX_CAPACITY", defaults.outbox_capacity)
                .max(1),
            allowed_origins: load_allowed_origins(),
            allow_missing_origin: env_bool(
                "PARLEY_WS_ALLOW_MISSING_ORIGIN",
                defaults.allow_missing_origin,
            ),
            cors_allow_any: env_bool("PARLEY_CORS_ALLOW_ANY", defaults.cors_allow_any),
        })
    }

    /// Resolve a client-requested TTL; zero means "server default".
    pub fn session_ttl_for(&self, requested_secs: u64) -> Duration {
        if requested_secs == 0 {
            return self.session_ttl;
        }
        Duration::from_secs(requested_secs).min(self.session_max_ttl)
    }

    pub fn check_public_bind_allowed(&self, addr: SocketAddr) -> anyhow::Result<()> {
        if addr.ip().is_loopback() || self.allow_public_bind {
            return Ok(());
        }
        Err(anyhow::anyhow!(
            "refusing non-loopback bind without PARLEY_ALLOW_PUBLIC_BIND=1"
        ))
    }
}

fn secs(name: &str, default: Duration) -> Duration {
    Duration::from_secs(env_u64(name, default.as_secs()).max(1))
}

pub fn normalize_origin(origin: &str) -> String {
    origin.trim().trim_end_matches('/').to_ascii_lowercase()
}

fn default_origins() -> HashSet<String> {
    DEFAULT_ALLOWED_ORIGINS
        .iter()
        .map(|origin| normalize_origin(origin))
        .collect()
}

fn load_allowed_origins() -> HashSet<String> {
    let configured = std::env::var("PARLEY_ALLOWED_ORIGINS").unwrap_or_default();
    let set: HashSet<String> = configured
        .split(',')
        .map(normalize_origin)
        .filter(|origin| !origin.is_empty())
        .collect();

    if set.is_empty() {
        default_origins()
    } else {
        set
    }
}
