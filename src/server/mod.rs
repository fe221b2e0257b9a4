//! WebSocket server module
//!
//! Accepts WebSocket connections and runs the Echo or Handshake + Heartbeat
//! protocol on each of them.

mod events;
mod handler;
mod protocol;
mod websocket;

pub use events::*;
pub use handler::*;
pub use protocol::*;
pub use websocket::*;
