//! WebSocket server implementation
//!
//! Binds a configurable address, upgrades incoming HTTP requests to
//! WebSocket and hands each connection to a [`ConnectionHandler`] running in
//! its own task. Requests that are not WebSocket upgrades get a bare 400.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tokio::time::timeout;
use tokio_tungstenite::accept_async_with_config;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::Error as WsError;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::events::{EventBus, ServerEvent};
use super::handler::{ConnectionHandler, HandlerSettings};

/// Response written to requests that are not WebSocket upgrades
const BAD_REQUEST_RESPONSE: &[u8] =
    b"HTTP/1.1 400 Bad Request\r\nContent-Length: 0\r\nConnection: close\r\n\r\n";

/// Default maximum size of an incoming message
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 64 * 1024;

/// Errors raised by the listener
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to accept connection: {0}")]
    Accept(#[source] std::io::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for server operations
pub type ServerResult<T> = Result<T, ServerError>;

/// Configuration for the WebSocket listener
#[derive(Debug, Clone, PartialEq)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind: String,
    /// Port to listen on (0 picks a free port)
    pub port: u16,
    /// Largest message accepted from a client
    pub max_message_size: usize,
    /// Deadline for the HTTP upgrade request to arrive
    pub upgrade_timeout: Duration,
    /// How long `run` waits for open connections after shutdown
    pub shutdown_grace: Duration,
}

impl ServerConfig {
    /// Create a new server configuration
    pub fn new(bind: String, port: u16) -> Self {
        Self {
            bind,
            port,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            upgrade_timeout: Duration::from_secs(10),
            shutdown_grace: Duration::from_secs(5),
        }
    }

    /// Set the maximum accepted message size
    pub fn with_max_message_size(mut self, max_message_size: usize) -> Self {
        self.max_message_size = max_message_size;
        self
    }

    /// Set the upgrade deadline
    pub fn with_upgrade_timeout(mut self, upgrade_timeout: Duration) -> Self {
        self.upgrade_timeout = upgrade_timeout;
        self
    }

    /// Set how long shutdown waits for open connections
    pub fn with_shutdown_grace(mut self, shutdown_grace: Duration) -> Self {
        self.shutdown_grace = shutdown_grace;
        self
    }

    /// Get the socket address to bind to
    pub fn socket_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }

    fn websocket_config(&self) -> WebSocketConfig {
        let mut config = WebSocketConfig::default();
        config.max_message_size = Some(self.max_message_size);
        config.max_frame_size = Some(self.max_message_size);
        config
    }
}

/// Server context: bind address, bound listener and shared handler state
pub struct WebSocketServer {
    config: ServerConfig,
    listener: TcpListener,
    local_addr: SocketAddr,
    settings: Arc<HandlerSettings>,
    events: EventBus,
    shutdown_tx: broadcast::Sender<()>,
    active: Arc<AtomicUsize>,
}

impl WebSocketServer {
    /// Bind the listener. Failure here is fatal and not retried.
    pub async fn bind(config: ServerConfig, settings: HandlerSettings) -> ServerResult<Self> {
        let addr = config.socket_addr();
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|source| ServerError::Bind {
                addr: addr.clone(),
                source,
            })?;
        let local_addr = listener.local_addr()?;
        let (shutdown_tx, _) = broadcast::channel(1);

        Ok(Self {
            config,
            listener,
            local_addr,
            settings: Arc::new(settings),
            events: EventBus::default(),
            shutdown_tx,
            active: Arc::new(AtomicUsize::new(0)),
        })
    }

    /// The address the listener is actually bound to
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Subscribe to server and connection events
    pub fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
        self.events.subscribe()
    }

    /// Number of connections currently being handled
    pub fn active_connections(&self) -> usize {
        self.active.load(Ordering::Relaxed)
    }

    /// Trigger server shutdown
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Run the accept loop until shutdown.
    ///
    /// Connections are accepted in arrival order and each one is served by
    /// its own task. After shutdown, open connections get `shutdown_grace`
    /// to send their close frames before they are aborted.
    pub async fn run(&self) -> ServerResult<()> {
        info!("WebSocket server listening on ws://{}", self.local_addr);
        self.events.emit(ServerEvent::Listening {
            addr: self.local_addr,
            mode: self.settings.mode,
        });

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let mut connections = JoinSet::new();

        loop {
            tokio::select! {
                result = self.listener.accept() => {
                    match result {
                        Ok((stream, peer_addr)) => {
                            let connection = PendingConnection {
                                peer_addr,
                                config: self.config.clone(),
                                settings: Arc::clone(&self.settings),
                                events: self.events.clone(),
                                shutdown_rx: self.shutdown_tx.subscribe(),
                                active: Arc::clone(&self.active),
                            };
                            connections.spawn(connection.serve(stream));
                        }
                        Err(e) => self.accept_failed(ServerError::Accept(e)),
                    }
                }
                Some(finished) = connections.join_next(), if !connections.is_empty() => {
                    if let Err(e) = finished {
                        error!("Connection task failed: {}", e);
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("Shutdown signal received, stopping server");
                    break;
                }
            }
        }

        if !connections.is_empty() {
            info!("Waiting for {} connections to close...", connections.len());
            let drained = timeout(self.config.shutdown_grace, async {
                while connections.join_next().await.is_some() {}
            })
            .await;
            if drained.is_err() {
                warn!("Aborting {} connections after shutdown grace", connections.len());
                connections.shutdown().await;
            }
        }

        Ok(())
    }

    /// Accept failures affect only the failed connection; the loop keeps going
    fn accept_failed(&self, err: ServerError) {
        error!("{}", err);
        self.events.emit(ServerEvent::Error {
            conn_id: None,
            message: err.to_string(),
        });
    }
}

/// Everything a spawned connection task needs
struct PendingConnection {
    peer_addr: SocketAddr,
    config: ServerConfig,
    settings: Arc<HandlerSettings>,
    events: EventBus,
    shutdown_rx: broadcast::Receiver<()>,
    active: Arc<AtomicUsize>,
}

impl PendingConnection {
    async fn serve(self, mut stream: TcpStream) {
        let peer_addr = self.peer_addr;
        let events = self.events.clone();
        debug!("New TCP connection from {}", peer_addr);

        let result = self.upgrade_and_handle(&mut stream).await;
        match result {
            Ok(()) => {}
            Err(reason @ (WsError::Protocol(_) | WsError::Capacity(_))) => {
                warn!(
                    "Invalid connection attempt from {} (400 Bad Request): {}",
                    peer_addr, reason
                );
                events.emit(ServerEvent::Rejected {
                    peer: peer_addr,
                    reason: reason.to_string(),
                });
                if let Err(e) = reject(&mut stream).await {
                    debug!("Failed to send 400 to {}: {}", peer_addr, e);
                }
            }
            Err(e) => {
                error!("WebSocket upgrade with {} failed: {}", peer_addr, e);
                events.emit(ServerEvent::Error {
                    conn_id: None,
                    message: e.to_string(),
                });
            }
        }
    }

    /// Upgrade the stream and run the handler to completion.
    /// Only upgrade failures are returned; handler errors are logged here.
    async fn upgrade_and_handle(self, stream: &mut TcpStream) -> Result<(), WsError> {
        let upgrade = accept_async_with_config(stream, Some(self.config.websocket_config()));
        let ws = match timeout(self.config.upgrade_timeout, upgrade).await {
            Ok(result) => result?,
            Err(_) => {
                warn!("No upgrade request from {} before deadline", self.peer_addr);
                return Ok(());
            }
        };

        let conn_id = Uuid::new_v4();
        let _active = ActiveGuard::new(&self.active);
        info!("Client {} connected as {}", self.peer_addr, conn_id);
        self.events.emit(ServerEvent::Connected {
            conn_id,
            peer: self.peer_addr,
        });

        let handler = ConnectionHandler::new(
            conn_id,
            ws,
            self.settings,
            self.events.clone(),
            self.shutdown_rx,
        );
        match handler.run().await {
            Ok(()) => info!("Connection {} from {} closed", conn_id, self.peer_addr),
            Err(e) => warn!("Connection {} from {} ended: {}", conn_id, self.peer_addr, e),
        }
        Ok(())
    }
}

async fn reject(stream: &mut TcpStream) -> std::io::Result<()> {
    stream.write_all(BAD_REQUEST_RESPONSE).await?;
    stream.shutdown().await
}

/// Keeps the active connection count accurate however the handler exits
struct ActiveGuard {
    active: Arc<AtomicUsize>,
}

impl ActiveGuard {
    fn new(active: &Arc<AtomicUsize>) -> Self {
        active.fetch_add(1, Ordering::Relaxed);
        Self {
            active: Arc::clone(active),
        }
    }
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::protocol::{EchoReply, Mode};
    use futures_util::{SinkExt, StreamExt};
    use tokio::io::AsyncReadExt;
    use tokio_tungstenite::connect_async;
    use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
    use tokio_tungstenite::tungstenite::Message;

    async fn start_server(settings: HandlerSettings) -> Arc<WebSocketServer> {
        let config = ServerConfig::new("127.0.0.1".to_string(), 0);
        let server = Arc::new(WebSocketServer::bind(config, settings).await.unwrap());
        let runner = Arc::clone(&server);
        tokio::spawn(async move { runner.run().await });
        server
    }

    async fn next_text<S>(ws: &mut S) -> String
    where
        S: StreamExt<Item = Result<Message, WsError>> + Unpin,
    {
        let msg = timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("timed out waiting for message");
        match msg {
            Some(Ok(Message::Text(text))) => text,
            other => panic!("Expected text message, got {:?}", other),
        }
    }

    #[test]
    fn test_server_config() {
        let config = ServerConfig::new("127.0.0.1".to_string(), 9000);
        assert_eq!(config.socket_addr(), "127.0.0.1:9000");
        assert_eq!(config.max_message_size, DEFAULT_MAX_MESSAGE_SIZE);
    }

    #[test]
    fn test_server_config_builders() {
        let config = ServerConfig::new("0.0.0.0".to_string(), 8080)
            .with_max_message_size(1024)
            .with_upgrade_timeout(Duration::from_secs(3))
            .with_shutdown_grace(Duration::from_secs(1));
        assert_eq!(config.max_message_size, 1024);
        assert_eq!(config.shutdown_grace, Duration::from_secs(1));
        assert_eq!(config.upgrade_timeout, Duration::from_secs(3));
        assert_eq!(config.websocket_config().max_message_size, Some(1024));
    }

    #[tokio::test]
    async fn test_bind_reports_os_assigned_port() {
        let server = WebSocketServer::bind(
            ServerConfig::new("127.0.0.1".to_string(), 0),
            HandlerSettings::default(),
        )
        .await
        .unwrap();
        assert_ne!(server.local_addr().port(), 0);
    }

    #[tokio::test]
    async fn test_bind_conflict_is_fatal() {
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = taken.local_addr().unwrap().port();

        let result = WebSocketServer::bind(
            ServerConfig::new("127.0.0.1".to_string(), port),
            HandlerSettings::default(),
        )
        .await;
        assert!(matches!(result, Err(ServerError::Bind { .. })));
    }

    #[tokio::test]
    async fn test_echo_over_tcp() {
        let server = start_server(HandlerSettings::default()).await;
        let url = format!("ws://{}", server.local_addr());

        let (mut ws, _) = connect_async(&url).await.unwrap();
        assert_eq!(next_text(&mut ws).await, "Connected");

        ws.send(Message::Text("hello".into())).await.unwrap();
        assert_eq!(next_text(&mut ws).await, "Echo: hello");

        ws.close(None).await.unwrap();
        let reply = timeout(Duration::from_secs(5), ws.next()).await.unwrap();
        assert!(matches!(reply, Some(Ok(Message::Close(_)))));
    }

    #[tokio::test]
    async fn test_sequential_cycles_are_independent() {
        let server = start_server(HandlerSettings::default()).await;
        let url = format!("ws://{}", server.local_addr());

        for i in 0..5 {
            let (mut ws, _) = connect_async(&url).await.unwrap();
            assert_eq!(next_text(&mut ws).await, "Connected");

            let text = format!("message {i}");
            ws.send(Message::Text(text.clone())).await.unwrap();
            assert_eq!(next_text(&mut ws).await, format!("Echo: {text}"));
            ws.close(None).await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_concurrent_connections_do_not_block_each_other() {
        let server = start_server(HandlerSettings::default()).await;
        let url = format!("ws://{}", server.local_addr());

        let (mut stalled, _) = connect_async(&url).await.unwrap();
        assert_eq!(next_text(&mut stalled).await, "Connected");

        let (mut active, _) = connect_async(&url).await.unwrap();
        assert_eq!(next_text(&mut active).await, "Connected");
        active.send(Message::Text("still served".into())).await.unwrap();
        assert_eq!(next_text(&mut active).await, "Echo: still served");
        assert_eq!(server.active_connections(), 2);
    }

    #[tokio::test]
    async fn test_plain_http_gets_400() {
        let server = start_server(HandlerSettings::default()).await;
        let mut events = server.subscribe();

        let mut stream = TcpStream::connect(server.local_addr()).await.unwrap();
        stream
            .write_all(b"GET / HTTP/1.1\r\nHost: localhost\r\n\r\n")
            .await
            .unwrap();

        let mut response = Vec::new();
        timeout(Duration::from_secs(5), stream.read_to_end(&mut response))
            .await
            .unwrap()
            .unwrap();
        let response = String::from_utf8(response).unwrap();

        assert!(response.starts_with("HTTP/1.1 400 Bad Request\r\n"));
        let (_, body) = response.split_once("\r\n\r\n").unwrap();
        assert!(body.is_empty());

        loop {
            let event = timeout(Duration::from_secs(5), events.recv())
                .await
                .unwrap()
                .unwrap();
            if let ServerEvent::Rejected { .. } = event {
                break;
            }
        }
    }

    #[tokio::test]
    async fn test_server_keeps_serving_after_rejection() {
        let server = start_server(HandlerSettings::default()).await;

        let mut stream = TcpStream::connect(server.local_addr()).await.unwrap();
        stream
            .write_all(b"POST /submit HTTP/1.1\r\nHost: localhost\r\n\r\n")
            .await
            .unwrap();
        let mut response = Vec::new();
        stream.read_to_end(&mut response).await.unwrap();
        assert!(response.starts_with(b"HTTP/1.1 400"));

        let (mut ws, _) = connect_async(format!("ws://{}", server.local_addr()))
            .await
            .unwrap();
        assert_eq!(next_text(&mut ws).await, "Connected");
    }

    #[tokio::test]
    async fn test_heartbeat_over_tcp() {
        let settings = HandlerSettings {
            mode: Mode::Heartbeat,
            heartbeat_interval: Duration::from_millis(100),
            ..HandlerSettings::default()
        };
        let server = start_server(settings).await;

        let (mut ws, _) = connect_async(format!("ws://{}", server.local_addr()))
            .await
            .unwrap();
        assert_eq!(next_text(&mut ws).await, "HSK");
        ws.send(Message::Text("HSK_DONE".into())).await.unwrap();
        assert_eq!(next_text(&mut ws).await, "PING");
        ws.send(Message::Text("PONG".into())).await.unwrap();
        assert_eq!(next_text(&mut ws).await, "PING");
    }

    #[tokio::test]
    async fn test_fixed_reply_over_tcp() {
        let settings = HandlerSettings {
            reply: EchoReply::Fixed,
            ..HandlerSettings::default()
        };
        let server = start_server(settings).await;

        let (mut ws, _) = connect_async(format!("ws://{}", server.local_addr()))
            .await
            .unwrap();
        assert_eq!(next_text(&mut ws).await, "Connected");
        ws.send(Message::Text("hi".into())).await.unwrap();
        assert_eq!(next_text(&mut ws).await, "Connected");
    }

    #[tokio::test]
    async fn test_events_report_listening_and_connected() {
        let config = ServerConfig::new("127.0.0.1".to_string(), 0);
        let server = Arc::new(
            WebSocketServer::bind(config, HandlerSettings::default())
                .await
                .unwrap(),
        );
        let mut events = server.subscribe();
        let runner = Arc::clone(&server);
        tokio::spawn(async move { runner.run().await });

        let first = timeout(Duration::from_secs(5), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            first,
            ServerEvent::Listening {
                addr: server.local_addr(),
                mode: Mode::Echo,
            }
        );

        let (_ws, _) = connect_async(format!("ws://{}", server.local_addr()))
            .await
            .unwrap();
        let connected = timeout(Duration::from_secs(5), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(connected, ServerEvent::Connected { .. }));
    }

    #[tokio::test]
    async fn test_shutdown_closes_open_connections() {
        let server = start_server(HandlerSettings::default()).await;

        let (mut ws, _) = connect_async(format!("ws://{}", server.local_addr()))
            .await
            .unwrap();
        assert_eq!(next_text(&mut ws).await, "Connected");

        server.shutdown();
        let msg = timeout(Duration::from_secs(5), ws.next()).await.unwrap();
        match msg {
            Some(Ok(Message::Close(Some(frame)))) => assert_eq!(frame.code, CloseCode::Away),
            other => panic!("Expected close frame, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_run_waits_for_connections_on_shutdown() {
        let server = Arc::new(
            WebSocketServer::bind(
                ServerConfig::new("127.0.0.1".to_string(), 0),
                HandlerSettings::default(),
            )
            .await
            .unwrap(),
        );
        let runner = Arc::clone(&server);
        let run = tokio::spawn(async move { runner.run().await });

        let (mut ws, _) = connect_async(format!("ws://{}", server.local_addr()))
            .await
            .unwrap();
        assert_eq!(next_text(&mut ws).await, "Connected");
        assert_eq!(server.active_connections(), 1);

        server.shutdown();
        let msg = timeout(Duration::from_secs(5), ws.next()).await.unwrap();
        assert!(matches!(msg, Some(Ok(Message::Close(_)))));
        // Reading the close queues our reply; the next read flushes it
        let _ = timeout(Duration::from_secs(5), ws.next()).await;

        timeout(Duration::from_secs(5), run)
            .await
            .expect("run returns within the shutdown grace")
            .unwrap()
            .unwrap();
        assert_eq!(server.active_connections(), 0);
    }

    #[tokio::test]
    async fn test_too_many_headers_gets_400() {
        let server = start_server(HandlerSettings::default()).await;

        let mut request = String::from("GET / HTTP/1.1\r\nHost: localhost\r\n");
        for i in 0..200 {
            request.push_str(&format!("X-{i}: v\r\n"));
        }
        request.push_str("\r\n");

        let mut stream = TcpStream::connect(server.local_addr()).await.unwrap();
        stream.write_all(request.as_bytes()).await.unwrap();

        let mut response = Vec::new();
        let _ = timeout(Duration::from_secs(5), stream.read_to_end(&mut response))
            .await
            .unwrap();
        assert!(response.starts_with(b"HTTP/1.1 400 Bad Request\r\n"));
    }

    #[test]
    fn test_accept_error_message() {
        let err = ServerError::Accept(std::io::Error::new(
            std::io::ErrorKind::Other,
            "too many open files",
        ));
        assert_eq!(
            err.to_string(),
            "Failed to accept connection: too many open files"
        );
    }
}
