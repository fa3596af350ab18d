/// Configuration management
use std::time::Duration;

/// Session configuration
///
/// The dedup windows and reconnect pacing are tunables, not protocol
/// constants. Defaults match the backend's broker settings.
#[derive(Debug, Clone)]
pub struct ChatConfig {
    /// HTTP base of the backend, e.g. "http://localhost:8081"
    pub base_url: String,

    /// Explicit bus endpoint; when unset the socket URL is derived
    /// from `base_url` (http -> ws) with the `/ws` path appended
    pub ws_url: Option<String>,

    /// Delay between reconnect attempts
    pub reconnect_delay: Duration,

    /// Heart-beat interval, both directions
    pub heartbeat_interval: Duration,

    /// Timeout for socket connect plus broker handshake
    pub connect_timeout: Duration,

    /// Timeout for REST requests
    pub request_timeout: Duration,

    /// Window in which two identifier-less messages with the same
    /// sender and content collapse into one
    pub signature_window: Duration,

    /// Window in which a server echo of a locally sent message counts
    /// as a delivery confirmation
    pub echo_window: Duration,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8081".to_string(),
            ws_url: None,
            reconnect_delay: Duration::from_secs(3),
            heartbeat_interval: Duration::from_secs(4),
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(15),
            signature_window: Duration::from_millis(1200),
            echo_window: Duration::from_millis(6000),
        }
    }
}

impl ChatConfig {
    /// Config pointed at a specific backend
    pub fn with_base_url(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            ..Default::default()
        }
    }

    /// Defaults with `ROOMLINK_*` environment overrides applied
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(base) = std::env::var("ROOMLINK_BASE_URL") {
            if !base.trim().is_empty() {
                config.base_url = base;
            }
        }
        if let Ok(ws) = std::env::var("ROOMLINK_WS_URL") {
            if !ws.trim().is_empty() {
                config.ws_url = Some(ws);
            }
        }
        if let Some(ms) = env_millis("ROOMLINK_RECONNECT_MS") {
            config.reconnect_delay = ms;
        }
        if let Some(ms) = env_millis("ROOMLINK_SIGNATURE_WINDOW_MS") {
            config.signature_window = ms;
        }
        if let Some(ms) = env_millis("ROOMLINK_ECHO_WINDOW_MS") {
            config.echo_window = ms;
        }
        config
    }

    /// HTTP base with any trailing slashes removed
    pub fn rest_base(&self) -> &str {
        self.base_url.trim_end_matches('/')
    }

    /// WebSocket endpoint of the message bus
    ///
    /// `http://host/` becomes `ws://host/ws`, `https` becomes `wss`.
    pub fn ws_endpoint(&self) -> String {
        if let Some(ws) = &self.ws_url {
            return ws.trim_end_matches('/').to_string();
        }
        let base = self.rest_base();
        let socket_base = if let Some(rest) = base.strip_prefix("https://") {
            format!("wss://{}", rest)
        } else if let Some(rest) = base.strip_prefix("http://") {
            format!("ws://{}", rest)
        } else {
            base.to_string()
        };
        format!("{}/ws", socket_base)
    }
}

fn env_millis(key: &str) -> Option<Duration> {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse::<u64>().ok())
        .map(Duration::from_millis)
}
