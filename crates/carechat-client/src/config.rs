//! Client configuration loaded from environment variables.
//!
//! Every setting has a default suitable for a locally running server.

use std::time::Duration;

use carechat_net::ReconnectPolicy;
use carechat_shared::constants::{
    DEFAULT_CONNECT_TIMEOUT_MS, DEFAULT_HISTORY_PAGE, DEFAULT_HTTP_PORT,
    DEFAULT_REQUEST_TIMEOUT_MS, MAX_CONTENT_LEN, MAX_HISTORY_PAGE, WS_PATH,
};

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Base URL of the persistence API (without the `/api/chat` prefix).
    /// Env: `CARECHAT_API_URL`
    pub api_url: String,

    /// Live transport endpoint.
    /// Env: `CARECHAT_WS_URL`
    pub ws_url: String,

    /// Bound on every send / history request.
    /// Env: `CARECHAT_REQUEST_TIMEOUT_MS`
    pub request_timeout: Duration,

    /// Bound on the live handshake.
    /// Env: `CARECHAT_CONNECT_TIMEOUT_MS`
    pub connect_timeout: Duration,

    /// Messages requested per history load.
    /// Env: `CARECHAT_HISTORY_PAGE`
    pub history_page: u32,

    /// Longest content accepted before a send is rejected locally.
    pub max_content_len: usize,

    /// Env: `CARECHAT_RECONNECT_INITIAL_MS`, `CARECHAT_RECONNECT_MAX_MS`,
    /// `CARECHAT_RECONNECT_JITTER`
    pub reconnect: ReconnectPolicy,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            api_url: format!("http://127.0.0.1:{DEFAULT_HTTP_PORT}"),
            ws_url: format!("ws://127.0.0.1:{DEFAULT_HTTP_PORT}{WS_PATH}"),
            request_timeout: Duration::from_millis(DEFAULT_REQUEST_TIMEOUT_MS),
            connect_timeout: Duration::from_millis(DEFAULT_CONNECT_TIMEOUT_MS),
            history_page: DEFAULT_HISTORY_PAGE,
            max_content_len: MAX_CONTENT_LEN,
            reconnect: ReconnectPolicy::default(),
        }
    }
}

impl ClientConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(url) = get("CARECHAT_API_URL") {
            config.api_url = url.trim_end_matches('/').to_string();
        }
        if let Some(url) = get("CARECHAT_WS_URL") {
            config.ws_url = url;
        }

        if let Some(ms) = parse_var::<u64>(&get, "CARECHAT_REQUEST_TIMEOUT_MS") {
            config.request_timeout = Duration::from_millis(ms.max(1));
        }
        if let Some(ms) = parse_var::<u64>(&get, "CARECHAT_CONNECT_TIMEOUT_MS") {
            config.connect_timeout = Duration::from_millis(ms.max(1));
        }
        if let Some(page) = parse_var::<u32>(&get, "CARECHAT_HISTORY_PAGE") {
            config.history_page = page.clamp(1, MAX_HISTORY_PAGE);
        }

        if let Some(ms) = parse_var::<u64>(&get, "CARECHAT_RECONNECT_INITIAL_MS") {
            config.reconnect.initial_delay = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_var::<u64>(&get, "CARECHAT_RECONNECT_MAX_MS") {
            config.reconnect.max_delay = Duration::from_millis(ms);
        }
        if let Some(jitter) = parse_var::<f64>(&get, "CARECHAT_RECONNECT_JITTER") {
            if (0.0..=1.0).contains(&jitter) {
                config.reconnect.jitter = jitter;
            } else {
                tracing::warn!(value = jitter, "CARECHAT_RECONNECT_JITTER out of range, using default");
            }
        }
        if config.reconnect.max_delay < config.reconnect.initial_delay {
            tracing::warn!("Reconnect max delay below initial delay, raising it");
            config.reconnect.max_delay = config.reconnect.initial_delay;
        }

        config
    }
}

fn parse_var<T: std::str::FromStr>(get: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = get(key)?;
    match raw.trim().parse::<T>() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(key, value = %raw, "Invalid value, using default");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_point_at_local_server() {
        let config = ClientConfig::default();
        assert_eq!(config.api_url, "http://127.0.0.1:5000");
        assert_eq!(config.ws_url, "ws://127.0.0.1:5000/ws");
        assert_eq!(config.request_timeout, Duration::from_secs(10));
    }

    #[test]
    fn overrides_and_invalid_values() {
        let config = ClientConfig::from_lookup(lookup(&[
            ("CARECHAT_API_URL", "https://chat.example.org/"),
            ("CARECHAT_REQUEST_TIMEOUT_MS", "2500"),
            ("CARECHAT_HISTORY_PAGE", "100000"),
            ("CARECHAT_CONNECT_TIMEOUT_MS", "soon"),
            ("CARECHAT_RECONNECT_JITTER", "3.0"),
        ]));
        assert_eq!(config.api_url, "https://chat.example.org");
        assert_eq!(config.request_timeout, Duration::from_millis(2500));
        assert_eq!(config.history_page, MAX_HISTORY_PAGE);
        assert_eq!(
            config.connect_timeout,
            Duration::from_millis(DEFAULT_CONNECT_TIMEOUT_MS)
        );
        assert_eq!(config.reconnect.jitter, ReconnectPolicy::default().jitter);
    }
}
