use std::env;
use std::time::Duration;

/// Drift client configuration.
///
/// Everything is overridable from the environment; the binary additionally
/// layers CLI flags on top.
#[derive(Debug, Clone)]
pub struct Config {
    /// Rendezvous server base URL (ws:// or wss://), without the
    /// per-mode `/ws/<mode>` suffix.
    pub server_url: String,
    /// Cooldown applied to next/cancel intents to avoid hammering the
    /// matchmaking server with rapid re-search requests.
    pub intent_cooldown: Duration,
    /// Interval for both the transport ping and the peer liveness payload.
    pub keepalive_interval: Duration,
    /// First reconnect delay after an unexpected transport disconnect.
    pub reconnect_initial: Duration,
    /// Cap on the reconnect backoff.
    pub reconnect_max: Duration,
    /// Capacity of the signal dedup set before oldest digests are evicted.
    pub dedup_capacity: usize,
    /// ICE server URLs handed to the peer connection.
    pub ice_servers: Vec<String>,
}

impl Config {
    /// Load configuration from `DRIFT_*` environment variables, falling back
    /// to defaults for anything unset or unparseable.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            server_url: env::var("DRIFT_SERVER_URL").unwrap_or(defaults.server_url),
            intent_cooldown: env_u64("DRIFT_INTENT_COOLDOWN_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.intent_cooldown),
            keepalive_interval: env_u64("DRIFT_KEEPALIVE_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.keepalive_interval),
            reconnect_initial: env_u64("DRIFT_RECONNECT_INITIAL_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.reconnect_initial),
            reconnect_max: env_u64("DRIFT_RECONNECT_MAX_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.reconnect_max),
            dedup_capacity: env_u64("DRIFT_DEDUP_CAPACITY")
                .map(|v| v as usize)
                .unwrap_or(defaults.dedup_capacity),
            ice_servers: env::var("DRIFT_ICE_SERVERS")
                .map(|v| v.split(',').map(|s| s.trim().to_string()).collect())
                .unwrap_or(defaults.ice_servers),
        }
    }
}

fn env_u64(var: &str) -> Option<u64> {
    env::var(var).ok()?.parse().ok()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server_url: "ws://127.0.0.1:8080".to_string(),
            intent_cooldown: Duration::from_secs(2),
            keepalive_interval: Duration::from_secs(30),
            reconnect_initial: Duration::from_secs(1),
            reconnect_max: Duration::from_secs(30),
            dedup_capacity: 256,
            ice_servers: vec![
                "stun:stun.l.google.com:19302".to_string(),
                "stun:stun1.l.google.com:19302".to_string(),
            ],
        }
    }
}
