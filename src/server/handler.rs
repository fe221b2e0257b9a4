//! WebSocket connection handler
//!
//! Owns one upgraded connection and runs the configured protocol variant to
//! completion. Each step is either send-then-receive or receive-then-send;
//! the stream is never split.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::broadcast;
use tokio::time::{sleep_until, timeout, Instant};
use tokio_tungstenite::tungstenite::error::ProtocolError as WsProtocolError;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::events::{EventBus, ServerEvent};
use super::protocol::{
    close_frame, EchoReply, Inbound, Mode, SessionPhase, CONNECTED, HANDSHAKE_ACK,
    HANDSHAKE_FAILED, HANDSHAKE_OFFER, HANDSHAKE_TIMED_OUT, HEARTBEAT_TIMED_OUT,
    IDLE_TIMED_OUT, INVALID_UTF8, PING, PONG, SHUTTING_DOWN,
};

/// How long to wait for the peer to acknowledge a close we initiated
const CLOSE_GRACE: Duration = Duration::from_secs(2);

/// Handler errors
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("WebSocket transport error: {0}")]
    Transport(#[from] WsError),

    #[error("Handshake failed: expected {HANDSHAKE_ACK:?}, got {0:?}")]
    HandshakeMismatch(String),

    #[error("Timed out waiting for {0}")]
    Timeout(&'static str),
}

/// Result type for handler operations
pub type HandlerResult<T> = Result<T, HandlerError>;

/// Per-connection protocol settings, shared by all handlers of a server
#[derive(Debug, Clone, PartialEq)]
pub struct HandlerSettings {
    pub mode: Mode,
    pub reply: EchoReply,
    /// Delay between a PONG (or its deadline) and the next PING
    pub heartbeat_interval: Duration,
    /// Deadline for the "HSK_DONE" reply
    pub handshake_timeout: Duration,
    /// Deadline for the reply to each "PING"
    pub pong_timeout: Duration,
    /// Deadline for each receive in the Echo variant
    pub idle_timeout: Duration,
}

impl Default for HandlerSettings {
    fn default() -> Self {
        Self {
            mode: Mode::Echo,
            reply: EchoReply::Echo,
            heartbeat_interval: Duration::from_secs(5),
            handshake_timeout: Duration::from_secs(10),
            pong_timeout: Duration::from_secs(10),
            idle_timeout: Duration::from_secs(300),
        }
    }
}

/// Outcome of waiting on the connection
#[derive(Debug)]
enum Step {
    Message(Inbound),
    TimedOut,
    Shutdown,
}

/// Handles a single WebSocket connection
pub struct ConnectionHandler<S> {
    id: Uuid,
    ws: WebSocketStream<S>,
    settings: Arc<HandlerSettings>,
    events: EventBus,
    shutdown_rx: broadcast::Receiver<()>,
    phase: Option<SessionPhase>,
    pongs: u64,
}

impl<S> ConnectionHandler<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Create a new connection handler
    pub fn new(
        id: Uuid,
        ws: WebSocketStream<S>,
        settings: Arc<HandlerSettings>,
        events: EventBus,
        shutdown_rx: broadcast::Receiver<()>,
    ) -> Self {
        Self {
            id,
            ws,
            settings,
            events,
            shutdown_rx,
            phase: None,
            pongs: 0,
        }
    }

    /// Run the configured protocol until the connection ends
    pub async fn run(mut self) -> HandlerResult<()> {
        let result = match self.settings.mode {
            Mode::Echo => self.run_echo().await,
            Mode::Heartbeat => self.run_heartbeat().await,
        };

        debug!("[{}] Handler finished (phase: {:?})", self.id, self.phase);
        if let Err(e) = &result {
            self.events.emit(ServerEvent::Error {
                conn_id: Some(self.id),
                message: e.to_string(),
            });
        }
        self.events.emit(ServerEvent::Closed { conn_id: self.id });
        result
    }

    async fn run_echo(&mut self) -> HandlerResult<()> {
        self.send_text(CONNECTED.to_string()).await?;

        loop {
            match self.recv(self.settings.idle_timeout).await? {
                Step::Message(Inbound::Text(text)) => {
                    self.record_received(&text);
                    let reply = self.settings.reply.reply_to(&text);
                    self.send_text(reply).await?;
                }
                Step::Message(Inbound::Binary(data)) => {
                    warn!("[{}] Ignoring binary message ({} bytes)", self.id, data.len());
                }
                Step::Message(Inbound::Close(frame)) => {
                    info!("[{}] Client requested close: {:?}", self.id, frame);
                    self.finish_peer_close().await;
                    return Ok(());
                }
                Step::Message(Inbound::Ended) => {
                    info!("[{}] Connection dropped by client", self.id);
                    return Ok(());
                }
                Step::TimedOut => {
                    self.close(CloseCode::Policy, IDLE_TIMED_OUT).await;
                    return Err(HandlerError::Timeout("a message"));
                }
                Step::Shutdown => {
                    self.close(CloseCode::Away, SHUTTING_DOWN).await;
                    return Ok(());
                }
            }
        }
    }

    async fn run_heartbeat(&mut self) -> HandlerResult<()> {
        self.phase = Some(SessionPhase::AwaitingHandshakeAck);
        self.send_text(HANDSHAKE_OFFER.to_string()).await?;

        if !self.await_handshake().await? {
            return Ok(());
        }

        self.phase = Some(SessionPhase::HeartbeatLoop);
        info!("[{}] Handshake complete, starting ping-pong", self.id);
        self.events.emit(ServerEvent::HandshakeCompleted { conn_id: self.id });

        let result = self.heartbeat_loop().await;
        info!("[{}] Heartbeat ended after {} pongs", self.id, self.pongs);
        result
    }

    /// Wait for "HSK_DONE"; `Ok(false)` means the connection ended cleanly first
    async fn await_handshake(&mut self) -> HandlerResult<bool> {
        match self.recv(self.settings.handshake_timeout).await? {
            Step::Message(Inbound::Text(text)) => {
                self.record_received(&text);
                if text == HANDSHAKE_ACK {
                    Ok(true)
                } else {
                    warn!("[{}] Unexpected handshake reply: {:?}", self.id, text);
                    self.close(CloseCode::Protocol, HANDSHAKE_FAILED).await;
                    Err(HandlerError::HandshakeMismatch(text))
                }
            }
            Step::Message(Inbound::Binary(data)) => {
                warn!("[{}] Binary handshake reply ({} bytes)", self.id, data.len());
                self.close(CloseCode::Protocol, HANDSHAKE_FAILED).await;
                Err(HandlerError::HandshakeMismatch(format!(
                    "<{} binary bytes>",
                    data.len()
                )))
            }
            Step::Message(Inbound::Close(_)) => {
                info!("[{}] Client closed during handshake", self.id);
                self.finish_peer_close().await;
                Ok(false)
            }
            Step::Message(Inbound::Ended) => Ok(false),
            Step::TimedOut => {
                self.close(CloseCode::Policy, HANDSHAKE_TIMED_OUT).await;
                Err(HandlerError::Timeout("handshake acknowledgement"))
            }
            Step::Shutdown => {
                self.close(CloseCode::Away, SHUTTING_DOWN).await;
                Ok(false)
            }
        }
    }

    async fn heartbeat_loop(&mut self) -> HandlerResult<()> {
        loop {
            self.send_text(PING.to_string()).await?;

            match self.recv(self.settings.pong_timeout).await? {
                Step::Message(Inbound::Text(text)) => {
                    self.record_received(&text);
                    if text == PONG {
                        self.pongs += 1;
                        info!("[{}] Received: PONG", self.id);
                    } else {
                        debug!("[{}] Ignoring unexpected heartbeat reply", self.id);
                    }
                }
                Step::Message(Inbound::Binary(_)) => {
                    debug!("[{}] Ignoring binary heartbeat reply", self.id);
                }
                Step::Message(Inbound::Close(_)) => {
                    self.finish_peer_close().await;
                    return Ok(());
                }
                Step::Message(Inbound::Ended) => return Ok(()),
                Step::TimedOut => {
                    self.close(CloseCode::Policy, HEARTBEAT_TIMED_OUT).await;
                    return Err(HandlerError::Timeout(PONG));
                }
                Step::Shutdown => {
                    self.close(CloseCode::Away, SHUTTING_DOWN).await;
                    return Ok(());
                }
            }

            if !self.pause(self.settings.heartbeat_interval).await? {
                return Ok(());
            }
        }
    }

    /// Sleep between heartbeats while still watching the connection.
    /// Returns `false` if the connection ended during the wait.
    async fn pause(&mut self, interval: Duration) -> HandlerResult<bool> {
        let deadline = Instant::now() + interval;
        loop {
            match self.recv_until(deadline).await? {
                Step::TimedOut => return Ok(true),
                Step::Message(Inbound::Text(text)) => {
                    self.record_received(&text);
                    debug!("[{}] Ignoring message between heartbeats", self.id);
                }
                Step::Message(Inbound::Binary(_)) => {}
                Step::Message(Inbound::Close(_)) => {
                    self.finish_peer_close().await;
                    return Ok(false);
                }
                Step::Message(Inbound::Ended) => return Ok(false),
                Step::Shutdown => {
                    self.close(CloseCode::Away, SHUTTING_DOWN).await;
                    return Ok(false);
                }
            }
        }
    }

    async fn recv(&mut self, wait: Duration) -> HandlerResult<Step> {
        self.recv_until(Instant::now() + wait).await
    }

    /// Wait for the next data or close message, the deadline, or shutdown
    async fn recv_until(&mut self, deadline: Instant) -> HandlerResult<Step> {
        let expired = sleep_until(deadline);
        tokio::pin!(expired);

        loop {
            let msg = tokio::select! {
                msg = self.ws.next() => msg,
                _ = &mut expired => return Ok(Step::TimedOut),
                _ = self.shutdown_rx.recv() => return Ok(Step::Shutdown),
            };

            match msg {
                Some(Ok(message)) => {
                    if let Some(inbound) = Inbound::from_message(message) {
                        return Ok(Step::Message(inbound));
                    }
                }
                Some(Err(e)) if is_disconnect(&e) => return Ok(Step::Message(Inbound::Ended)),
                Some(Err(WsError::Utf8)) => {
                    warn!("[{}] Text message is not valid UTF-8", self.id);
                    self.close(CloseCode::Invalid, INVALID_UTF8).await;
                    return Err(WsError::Utf8.into());
                }
                Some(Err(e)) => return Err(e.into()),
                None => return Ok(Step::Message(Inbound::Ended)),
            }
        }
    }

    async fn send_text(&mut self, text: String) -> HandlerResult<()> {
        self.ws.send(Message::Text(text.clone())).await?;
        debug!("[{}] Sent: {}", self.id, text);
        self.events.emit(ServerEvent::MessageSent {
            conn_id: self.id,
            text,
        });
        Ok(())
    }

    fn record_received(&self, text: &str) {
        debug!("[{}] Received message: {}", self.id, text);
        self.events.emit(ServerEvent::MessageReceived {
            conn_id: self.id,
            text: text.to_string(),
        });
    }

    /// Flush the close reply the transport queued when the peer's close
    /// frame was read. The reply carries the peer's own status code.
    async fn finish_peer_close(&mut self) {
        match SinkExt::flush(&mut self.ws).await {
            Ok(()) => {}
            Err(e) if is_disconnect(&e) => {}
            Err(e) => debug!("[{}] Failed to flush close reply: {}", self.id, e),
        }
    }

    /// Start a close handshake and give the peer a moment to acknowledge it
    async fn close(&mut self, code: CloseCode, reason: &'static str) {
        match self.ws.close(Some(close_frame(code, reason))).await {
            Ok(()) => {}
            Err(e) if is_disconnect(&e) => return,
            Err(e) => {
                debug!("[{}] Failed to send close frame: {}", self.id, e);
                return;
            }
        }

        let _ = timeout(CLOSE_GRACE, async {
            while let Some(Ok(_)) = self.ws.next().await {}
        })
        .await;
    }
}

fn is_disconnect(e: &WsError) -> bool {
    matches!(
        e,
        WsError::ConnectionClosed
            | WsError::AlreadyClosed
            | WsError::Protocol(WsProtocolError::ResetWithoutClosingHandshake)
    )
}
