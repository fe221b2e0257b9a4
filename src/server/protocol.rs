//! Protocol definitions
//!
//! Wire literals and message classification for the two connection variants:
//! Echo, and Handshake + Heartbeat. All protocol messages are plain
//! WebSocket text frames.

use serde::{Deserialize, Serialize};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;

/// Greeting sent by the Echo variant right after the upgrade
pub const CONNECTED: &str = "Connected";

/// Prefix of every echoed reply
pub const ECHO_PREFIX: &str = "Echo: ";

/// Handshake offer sent by the Heartbeat variant
pub const HANDSHAKE_OFFER: &str = "HSK";

/// Handshake acknowledgement expected from the client
pub const HANDSHAKE_ACK: &str = "HSK_DONE";

/// Liveness probe
pub const PING: &str = "PING";

/// Expected liveness reply
pub const PONG: &str = "PONG";

/// Close reasons
pub const HANDSHAKE_FAILED: &str = "Handshake failed";
pub const HANDSHAKE_TIMED_OUT: &str = "Handshake timed out";
pub const HEARTBEAT_TIMED_OUT: &str = "Heartbeat timed out";
pub const IDLE_TIMED_OUT: &str = "Idle timeout";
pub const INVALID_UTF8: &str = "Invalid UTF-8";
pub const SHUTTING_DOWN: &str = "Server shutting down";

/// Which protocol a connection handler runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Greet with "Connected" and reply to every text message
    #[default]
    Echo,
    /// "HSK"/"HSK_DONE" handshake followed by periodic "PING"/"PONG"
    Heartbeat,
}

/// How the Echo variant answers a text message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum EchoReply {
    /// Reply with "Echo: " followed by the received text
    #[default]
    Echo,
    /// Reply with the fixed "Connected" literal regardless of input
    Fixed,
}

impl EchoReply {
    /// Build the reply for a received text message
    pub fn reply_to(self, text: &str) -> String {
        match self {
            EchoReply::Echo => format!("{ECHO_PREFIX}{text}"),
            EchoReply::Fixed => CONNECTED.to_string(),
        }
    }
}

/// Phase of a Heartbeat session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionPhase {
    AwaitingHandshakeAck,
    HeartbeatLoop,
}

/// A message as seen by a connection handler
///
/// Transport control frames (ping/pong) are answered by the transport and
/// never reach the protocol layer.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Text(String),
    Binary(Vec<u8>),
    Close(Option<CloseFrame<'static>>),
    /// The peer went away without a close frame
    Ended,
}

impl Inbound {
    /// Classify a transport message, returning `None` for control frames
    pub fn from_message(message: Message) -> Option<Self> {
        match message {
            Message::Text(text) => Some(Inbound::Text(text)),
            Message::Binary(data) => Some(Inbound::Binary(data)),
            Message::Close(frame) => Some(Inbound::Close(frame)),
            Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => None,
        }
    }
}

/// Build a close frame with a static reason
pub fn close_frame(code: CloseCode, reason: &'static str) -> CloseFrame<'static> {
    CloseFrame {
        code,
        reason: reason.into(),
    }
}
