use std::time::Duration;

/// Well-known public STUN servers, good enough for the large majority of
/// direct connections. Deployments with their own infrastructure override
/// this via `CallConfig` or the environment.
pub fn default_stun_servers() -> Vec<String> {
    vec![
        "stun:stun.l.google.com:19302".to_string(),
        "stun:stun1.l.google.com:19302".to_string(),
    ]
}

/// Tunables for one consultation session.
#[derive(Debug, Clone)]
pub struct CallConfig {
    /// WebSocket URL of the rendezvous relay, e.g. `ws://host:9870/ws`.
    pub relay_url: String,
    /// Connectivity-assist servers handed to the negotiation transport.
    pub stun_servers: Vec<String>,
    /// Whether the session should try to open the camera.
    pub want_video: bool,
    /// How long negotiation may run without a live connection before the
    /// session is failed instead of hanging.
    pub negotiating_timeout: Duration,
    /// How long to wait for a departed peer to re-register before closing.
    pub peer_left_grace: Duration,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            relay_url: "ws://127.0.0.1:9870/ws".to_string(),
            stun_servers: default_stun_servers(),
            want_video: true,
            negotiating_timeout: Duration::from_secs(30),
            peer_left_grace: Duration::from_secs(10),
        }
    }
}

impl CallConfig {
    /// Default configuration with overrides taken from the environment:
    /// `TELEVISIT_RELAY_URL`, `TELEVISIT_STUN_SERVERS` (comma separated),
    /// `TELEVISIT_NEGOTIATING_TIMEOUT_SECS`, `TELEVISIT_PEER_LEFT_GRACE_SECS`.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(url) = std::env::var("TELEVISIT_RELAY_URL") {
            config.relay_url = url;
        }
        if let Ok(servers) = std::env::var("TELEVISIT_STUN_SERVERS") {
            let parsed: Vec<String> = servers
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
            if !parsed.is_empty() {
                config.stun_servers = parsed;
            }
        }
        if let Some(secs) = env_secs("TELEVISIT_NEGOTIATING_TIMEOUT_SECS") {
            config.negotiating_timeout = secs;
        }
        if let Some(secs) = env_secs("TELEVISIT_PEER_LEFT_GRACE_SECS") {
            config.peer_left_grace = secs;
        }
        config
    }
}

fn env_secs(name: &str) -> Option<Duration> {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_secs)
}
