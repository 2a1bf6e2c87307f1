//! WebSocket server implementation
//!
//! Accepts connections, admits them into the registry and drives each one
//! through its close coordinator until the transport is gone.

use std::borrow::Cow;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, watch};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::{accept_async, tungstenite::Message, WebSocketStream};
use tracing::{debug, error, info, warn};

use super::protocol::{ClientMessage, ServerMessage};
use crate::close::{CloseCoordinator, CloseStatus, CloseTransport, ClosingTimeout};
use crate::config::BridgeConfig;
use crate::registry::{ConnectionId, ConnectionRegistry, RegistryEvent};

/// Extra time allowed for connections to drain on shutdown
const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

/// Configuration for the WebSocket server
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind: String,
    /// Port to listen on
    pub port: u16,
    /// Maximum number of simultaneous connections
    pub max_connections: usize,
    /// Closing timeout applied to every connection
    pub closing_timeout: ClosingTimeout,
}

impl ServerConfig {
    /// Create a new server configuration
    pub fn new(bind: String, port: u16) -> Self {
        Self {
            bind,
            port,
            max_connections: 1024,
            closing_timeout: ClosingTimeout::default(),
        }
    }

    /// Set the connection limit
    pub fn with_max_connections(mut self, max_connections: usize) -> Self {
        self.max_connections = max_connections;
        self
    }

    /// Set the closing timeout
    pub fn with_closing_timeout(mut self, closing_timeout: ClosingTimeout) -> Self {
        self.closing_timeout = closing_timeout;
        self
    }

    /// Get the socket address to bind to
    pub fn socket_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }
}

impl From<&BridgeConfig> for ServerConfig {
    fn from(config: &BridgeConfig) -> Self {
        Self::new(config.server.bind.clone(), config.server.port)
            .with_max_connections(config.server.max_connections)
            .with_closing_timeout(config.closing_timeout())
    }
}

/// WebSocket server with close-handshake coordination per connection
pub struct WebSocketServer {
    config: ServerConfig,
    registry: ConnectionRegistry,
    shutdown_tx: broadcast::Sender<()>,
}

impl WebSocketServer {
    /// Create a new WebSocket server
    pub fn new(config: ServerConfig) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        let registry = ConnectionRegistry::new(config.max_connections);
        Self {
            config,
            registry,
            shutdown_tx,
        }
    }

    /// Trigger server shutdown
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Bind the configured address and run the WebSocket server
    pub async fn run(&self) -> anyhow::Result<()> {
        let addr = self.config.socket_addr();
        let listener = TcpListener::bind(&addr).await?;
        info!("WebSocket server listening on ws://{}", addr);
        self.serve(listener).await
    }

    /// Accept connections from `listener` until shutdown
    ///
    /// On shutdown every connection starts a close handshake with 1001
    /// (going away); the server then waits for the registry to drain for at
    /// most the closing timeout plus a short grace period.
    pub async fn serve(&self, listener: TcpListener) -> anyhow::Result<()> {
        info!(
            "Closing timeout {}, max {} connections",
            self.config.closing_timeout,
            self.registry.capacity()
        );

        let mut shutdown_rx = self.shutdown_tx.subscribe();

        loop {
            tokio::select! {
                // Accept new connections
                result = listener.accept() => {
                    match result {
                        Ok((stream, peer_addr)) => {
                            let registry = self.registry.clone();
                            let shutdown_rx = self.shutdown_tx.subscribe();
                            let closing_timeout = self.config.closing_timeout;

                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, peer_addr, registry, closing_timeout, shutdown_rx).await {
                                    error!("Connection error from {}: {}", peer_addr, e);
                                }
                            });
                        }
                        Err(e) => {
                            error!("Failed to accept connection: {}", e);
                        }
                    }
                }
                // Handle shutdown signal
                _ = shutdown_rx.recv() => {
                    info!("Shutdown signal received, stopping server");
                    break;
                }
            }
        }

        self.drain().await;
        Ok(())
    }

    /// Wait for live connections to be evicted
    async fn drain(&self) {
        let remaining = self.registry.len();
        if remaining == 0 {
            return;
        }

        let limit = match self.config.closing_timeout {
            ClosingTimeout::After(delay) => delay + SHUTDOWN_GRACE,
            ClosingTimeout::Immediate => SHUTDOWN_GRACE,
            ClosingTimeout::Disabled => {
                info!("Closing timeout disabled, not waiting for {} connections", remaining);
                return;
            }
        };

        info!("Waiting for {} active connections to close...", remaining);

        let mut events = self.registry.subscribe();
        let drained = tokio::time::timeout(limit, async {
            while !self.registry.is_empty() {
                match events.recv().await {
                    Ok(RegistryEvent::Evicted { connection_id }) => {
                        debug!(
                            "Connection {} drained, {} remaining",
                            connection_id,
                            self.registry.len()
                        );
                    }
                    Ok(RegistryEvent::Admitted {
                        connection_id,
                        peer_addr,
                    }) => {
                        debug!(
                            "Connection {} from {} admitted while draining",
                            connection_id, peer_addr
                        );
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!("Missed {} registry events while draining", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
        .await;

        if drained.is_err() {
            warn!(
                "{} connections still open after {:?}",
                self.registry.len(),
                limit
            );
        }
    }
}

/// Transport handle the coordinator uses to force a connection down
///
/// The connection task watches the flag and drops the socket once it is set.
struct ChannelCloser {
    force_tx: watch::Sender<bool>,
}

impl CloseTransport for ChannelCloser {
    fn close_channel_now(&self) {
        self.force_tx.send_replace(true);
    }
}

/// Handle a single WebSocket connection
async fn handle_connection(
    stream: TcpStream,
    peer_addr: SocketAddr,
    registry: ConnectionRegistry,
    closing_timeout: ClosingTimeout,
    shutdown_rx: broadcast::Receiver<()>,
) -> anyhow::Result<()> {
    info!("New connection from {}", peer_addr);

    // Upgrade to WebSocket
    let mut ws_stream = accept_async(stream).await?;

    let connection_id = match registry.admit(peer_addr) {
        Ok(id) => id,
        Err(e) => {
            warn!("Rejecting {}: {}", peer_addr, e);
            let frame = close_frame(&CloseStatus::try_again_later());
            let _ = ws_stream.send(Message::Close(Some(frame))).await;
            return Ok(());
        }
    };

    let (force_tx, force_rx) = watch::channel(false);
    let coordinator =
        match CloseCoordinator::new(closing_timeout, Arc::new(ChannelCloser { force_tx })) {
            Ok(coordinator) => coordinator,
            Err(e) => {
                registry.evict(connection_id);
                return Err(e.into());
            }
        };
    coordinator.set_eviction_callback(registry.eviction_callback(connection_id));

    let result = drive_connection(
        ws_stream,
        peer_addr,
        connection_id,
        &coordinator,
        force_rx,
        shutdown_rx,
    )
    .await;

    // The socket was dropped inside drive_connection, whatever the outcome
    coordinator.on_connection_closed();

    let outcome = coordinator.closed().await;
    match outcome.peer_status {
        Some(status) => info!(
            "Connection from {} closed: {}, peer status {}",
            peer_addr, outcome.cause, status
        ),
        None => info!("Connection from {} closed: {}", peer_addr, outcome.cause),
    }

    result
}

/// Run the message loop until the transport closes or is forced down
async fn drive_connection(
    ws_stream: WebSocketStream<TcpStream>,
    peer_addr: SocketAddr,
    connection_id: ConnectionId,
    coordinator: &CloseCoordinator,
    mut force_rx: watch::Receiver<bool>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> anyhow::Result<()> {
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    // Send welcome message
    let welcome = ServerMessage::welcome(connection_id, coordinator.timeout().as_millis());
    ws_sender.send(Message::Text(welcome.to_json()?)).await?;
    debug!("Sent welcome message to {}", peer_addr);

    // Message handling loop
    loop {
        tokio::select! {
            // Receive messages from client
            msg = ws_receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        if coordinator.is_closing() {
                            debug!("Ignoring message from {} while closing", peer_addr);
                            continue;
                        }
                        debug!("Received message from {}: {}", peer_addr, text);

                        match handle_message(&text) {
                            Action::Reply(response) => {
                                ws_sender.send(Message::Text(response.to_json()?)).await?;
                            }
                            Action::Close(status) => {
                                info!("Client {} asked to close with {}", peer_addr, status);
                                ws_sender.send(Message::Close(Some(close_frame(&status)))).await?;
                                coordinator.on_local_close_requested();
                            }
                        }
                    }
                    Some(Ok(Message::Binary(data))) => {
                        warn!("Received binary message from {} ({} bytes), ignoring", peer_addr, data.len());
                    }
                    Some(Ok(Message::Close(frame))) => {
                        let status = frame.map(|f| CloseStatus::from_peer(u16::from(f.code), f.reason.into_owned()));
                        info!("Client {} sent close frame", peer_addr);
                        // tungstenite queues the echo; the stream ends once it is flushed
                        coordinator.on_peer_close_received(status);
                    }
                    Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => {
                        // tungstenite answers pings itself
                    }
                    Some(Ok(Message::Frame(_))) => {
                        // Raw frame, ignore
                    }
                    Some(Err(e)) => {
                        debug!("WebSocket error from {}: {}", peer_addr, e);
                        break;
                    }
                    None => {
                        debug!("Transport closed by {}", peer_addr);
                        break;
                    }
                }
            }
            // Forced closure from the coordinator
            Ok(()) = force_rx.changed() => {
                if *force_rx.borrow() {
                    debug!("Forcing connection to {} closed", peer_addr);
                    break;
                }
            }
            // Handle shutdown signal
            _ = shutdown_rx.recv(), if !coordinator.is_closing() => {
                info!("Shutdown signal received, closing connection to {}", peer_addr);
                if let Err(e) = ws_sender.send(Message::Close(Some(close_frame(&CloseStatus::going_away())))).await {
                    debug!("Failed to send close frame to {}: {}", peer_addr, e);
                    break;
                }
                coordinator.on_local_close_requested();
            }
        }
    }

    Ok(())
}

/// What to do in response to a client message
#[derive(Debug, PartialEq)]
enum Action {
    /// Send a message back
    Reply(ServerMessage),
    /// Start the close handshake with this status
    Close(CloseStatus),
}

/// Handle a client message
fn handle_message(text: &str) -> Action {
    let message = match ClientMessage::parse(text) {
        Ok(message) => message,
        Err(e) => return Action::Reply(e.into()),
    };

    match message {
        ClientMessage::Ping { seq } => {
            debug!("Received ping with seq {}", seq);
            Action::Reply(ServerMessage::pong(seq))
        }
        ClientMessage::Close { .. } => match message.close_status() {
            Ok(Some(status)) => Action::Close(status),
            Ok(None) => Action::Close(CloseStatus::normal()),
            Err(e) => Action::Reply(e.into()),
        },
    }
}

fn close_frame(status: &CloseStatus) -> CloseFrame<'static> {
    CloseFrame {
        code: CloseCode::from(status.code()),
        reason: Cow::Owned(status.reason().to_string()),
    }
}
