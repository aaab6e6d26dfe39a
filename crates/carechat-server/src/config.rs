//! Server configuration loaded from environment variables.
//!
//! All settings have sensible defaults so the server can start with zero
//! configuration for local development.

use std::net::SocketAddr;
use std::path::PathBuf;

use carechat_shared::constants::{DEFAULT_HTTP_PORT, MAX_CONTENT_LEN, MAX_HISTORY_PAGE};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Socket address for the HTTP + WebSocket server.
    /// Env: `HTTP_ADDR`
    /// Default: `0.0.0.0:5000`
    pub http_addr: SocketAddr,

    /// SQLite database file.
    /// Env: `DATABASE_PATH`
    /// Default: platform data directory.
    pub database_path: Option<PathBuf>,

    /// JSON file of users (and their bearer tokens) upserted at startup.
    /// Env: `USERS_FILE`
    pub users_file: Option<PathBuf>,

    /// Sustained sends per second allowed for one user.
    /// Env: `MESSAGE_RATE`
    /// Default: `5`
    pub message_rate: f64,

    /// Burst of sends allowed for one user.
    /// Env: `MESSAGE_BURST`
    /// Default: `20`
    pub message_burst: f64,

    /// Largest history page served.
    /// Env: `HISTORY_MAX_PAGE`
    /// Default: `200`
    pub history_max_page: u32,

    /// Longest message content accepted, in characters.
    /// Env: `MAX_CONTENT_LEN`
    pub max_content_len: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: ([0, 0, 0, 0], DEFAULT_HTTP_PORT).into(),
            database_path: None,
            users_file: None,
            message_rate: 5.0,
            message_burst: 20.0,
            history_max_page: MAX_HISTORY_PAGE,
            max_content_len: MAX_CONTENT_LEN,
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(addr) = std::env::var("HTTP_ADDR") {
            if let Ok(parsed) = addr.parse::<SocketAddr>() {
                config.http_addr = parsed;
            } else {
                tracing::warn!(value = %addr, "Invalid HTTP_ADDR, using default");
            }
        }

        if let Ok(path) = std::env::var("DATABASE_PATH") {
            if !path.is_empty() {
                config.database_path = Some(PathBuf::from(path));
            }
        }

        if let Ok(path) = std::env::var("USERS_FILE") {
            if !path.is_empty() {
                config.users_file = Some(PathBuf::from(path));
            }
        }

        if let Ok(val) = std::env::var("MESSAGE_RATE") {
            match val.parse::<f64>() {
                Ok(rate) if rate > 0.0 => config.message_rate = rate,
                _ => tracing::warn!(value = %val, "Invalid MESSAGE_RATE, using default"),
            }
        }

        if let Ok(val) = std::env::var("MESSAGE_BURST") {
            match val.parse::<f64>() {
                Ok(burst) if burst >= 1.0 => config.message_burst = burst,
                _ => tracing::warn!(value = %val, "Invalid MESSAGE_BURST, using default"),
            }
        }

        if let Ok(val) = std::env::var("HISTORY_MAX_PAGE") {
            match val.parse::<u32>() {
                Ok(n) if n > 0 => config.history_max_page = n,
                _ => tracing::warn!(value = %val, "Invalid HISTORY_MAX_PAGE, using default"),
            }
        }

        if let Ok(val) = std::env::var("MAX_CONTENT_LEN") {
            match val.parse::<usize>() {
                Ok(n) if n > 0 => config.max_content_len = n,
                _ => tracing::warn!(value = %val, "Invalid MAX_CONTENT_LEN, using default"),
            }
        }

        // RUST_LOG is handled directly by tracing-subscriber's EnvFilter.

        config
    }
}
