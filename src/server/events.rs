//! Server event stream
//!
//! Lifecycle and traffic notifications for external observers (status
//! displays, log sinks, tests). Emitting never blocks and never fails; events
//! are dropped when nobody is subscribed.

use std::net::SocketAddr;

use serde::Serialize;
use tokio::sync::broadcast;
use uuid::Uuid;

use super::protocol::Mode;

/// Default capacity of the event channel
pub const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Event types broadcast by the server and its connection handlers
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ServerEvent {
    /// The accept loop started on this address
    Listening { addr: SocketAddr, mode: Mode },
    /// A WebSocket upgrade succeeded
    Connected { conn_id: Uuid, peer: SocketAddr },
    /// A non-upgrade request was answered with 400
    Rejected { peer: SocketAddr, reason: String },
    /// A text message arrived
    MessageReceived { conn_id: Uuid, text: String },
    /// A text message was sent
    MessageSent { conn_id: Uuid, text: String },
    /// The client acknowledged the application handshake
    HandshakeCompleted { conn_id: Uuid },
    /// A connection handler finished
    Closed { conn_id: Uuid },
    /// A connection or handshake failed
    Error {
        #[serde(skip_serializing_if = "Option::is_none")]
        conn_id: Option<Uuid>,
        message: String,
    },
}

/// Cloneable sender half of the event stream
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<ServerEvent>,
}

impl EventBus {
    /// Create a new event bus with the given channel capacity
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Subscribe to all future events
    pub fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
        self.tx.subscribe()
    }

    /// Publish an event to current subscribers
    pub fn emit(&self, event: ServerEvent) {
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(EVENT_CHANNEL_CAPACITY)
    }
}
