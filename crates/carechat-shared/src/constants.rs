/// Application name
pub const APP_NAME: &str = "CareChat";

/// Prefix of every chat REST route
pub const API_PREFIX: &str = "/api/chat";

/// Path of the live WebSocket endpoint
pub const WS_PATH: &str = "/ws";

/// Default HTTP port of the chat server
pub const DEFAULT_HTTP_PORT: u16 = 5000;

/// Maximum message content length in characters
pub const MAX_CONTENT_LEN: usize = 5_000;

/// Default number of messages fetched per history request
pub const DEFAULT_HISTORY_PAGE: u32 = 50;

/// Upper bound the server accepts for a history page
pub const MAX_HISTORY_PAGE: u32 = 200;

/// Bounded timeout for persistence and history requests (milliseconds)
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 10_000;

/// Live transport handshake timeout (milliseconds)
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 5_000;

/// Reconnect backoff defaults (milliseconds)
pub const DEFAULT_RECONNECT_INITIAL_MS: u64 = 500;
pub const DEFAULT_RECONNECT_MAX_MS: u64 = 30_000;

/// Fraction of each reconnect delay that is randomised
pub const DEFAULT_RECONNECT_JITTER: f64 = 0.2;

/// Placeholder shown when a reply target is not loaded locally
pub const REPLY_STUB_TEXT: &str = "Original message unavailable";

/// Length of the reply preview excerpt in characters
pub const REPLY_EXCERPT_LEN: usize = 80;
