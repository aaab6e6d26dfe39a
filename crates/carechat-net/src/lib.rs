// Live connection layer: one authenticated WebSocket per session, with
// automatic reconnection and a lifecycle event stream.

pub mod backoff;
pub mod manager;
pub mod memory;
pub mod transport;
pub mod ws;

pub use backoff::ReconnectPolicy;
pub use manager::{ConnectionManager, DisconnectReason, LifecycleEvent};
pub use memory::{MemoryPeer, MemoryTransport};
pub use transport::{LiveLink, LiveTransport};
pub use ws::WsTransport;
