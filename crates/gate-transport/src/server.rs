//! WebSocket + HTTP transport server using Axum.
//!
//! [`Gateway`] is the shared state and socket-event dispatch table (upgrade,
//! open, message, close); [`TransportServer`] owns the listener lifecycle
//! (`listen` / `shutdown`) over TCP, TLS or a Unix socket.

use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use axum::{
    Router,
    extract::{
        ConnectInfo, State, WebSocketUpgrade,
        ws::{CloseFrame, Message, WebSocket, rejection::WebSocketUpgradeRejection},
    },
    http::{HeaderMap, StatusCode, Uri},
    response::{IntoResponse, Json, Response},
    routing::get,
};
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt, stream::SplitSink};
use gate_protocol::CloseCode;
use serde_json::json;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::client::{
    ClientConnection, ClientOptions, ConnectionId, ConnectionState, Outbound, OutboundFrame,
};
use crate::context::{RemoteAddr, UpgradeContext};
use crate::join;
use crate::matchmake;
use crate::matchmaker::Matchmaker;
use crate::registry::ClientRegistry;

/// Listen backlog used when none is given.
pub const DEFAULT_BACKLOG: u32 = 511;

/// tungstenite's default write buffer; shrunk when the ceiling is lower.
const WRITE_BUFFER_SIZE: usize = 128 * 1024;

/// How long a closing socket waits for the peer's close frame.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Transport server configuration.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Maximum bytes buffered for writing to one socket before writes fail
    pub max_backpressure: usize,
    /// Maximum inbound message size; also the matchmaking body limit
    pub max_payload_length: usize,
    /// permessage-deflate (not negotiated by this transport; see `listen`)
    pub compression: bool,
    /// Interval between server pings (None to disable heartbeats)
    pub ping_interval: Option<Duration>,
    /// Unanswered pings tolerated before a connection is terminated
    pub ping_max_retries: u32,
    /// Delay every outbound data frame by this much (testing aid)
    pub simulate_latency: Option<Duration>,
    /// Capacity of each connection's event channel
    pub event_buffer: usize,
    /// Maximum concurrent connections
    pub max_connections: Option<usize>,
    /// Serve over TLS with these PEM files
    pub tls: Option<TlsConfig>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            max_backpressure: 1024 * 1024,
            max_payload_length: 1024 * 1024,
            compression: false,
            ping_interval: None,
            ping_max_retries: 2,
            simulate_latency: None,
            event_buffer: 256,
            max_connections: None,
            tls: None,
        }
    }
}

impl TransportConfig {
    /// Reject settings no socket could be opened with.
    pub fn validate(&self) -> Result<(), TransportError> {
        if self.max_backpressure == 0 {
            return Err(TransportError::InvalidConfig(
                "max_backpressure must be at least 1 byte".into(),
            ));
        }
        if self.max_payload_length == 0 {
            return Err(TransportError::InvalidConfig(
                "max_payload_length must be at least 1 byte".into(),
            ));
        }
        Ok(())
    }

    /// Socket write buffer, kept below `max_backpressure` as tungstenite
    /// requires.
    pub fn write_buffer_size(&self) -> usize {
        WRITE_BUFFER_SIZE.min(self.max_backpressure / 2)
    }
}

impl From<&TransportConfig> for ClientOptions {
    fn from(config: &TransportConfig) -> Self {
        Self {
            simulate_latency: config.simulate_latency,
            event_buffer: config.event_buffer,
            max_backpressure: config.max_backpressure,
        }
    }
}

/// TLS certificate and key (PEM).
#[derive(Debug, Clone)]
pub struct TlsConfig {
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
}

/// Where to listen.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenEndpoint {
    Tcp { hostname: String, port: u16 },
    Unix(PathBuf),
}

impl ListenEndpoint {
    /// A numeric `port_or_path` is a TCP port, anything else a socket path.
    pub fn parse(port_or_path: &str, hostname: Option<&str>) -> Self {
        match port_or_path.parse::<u16>() {
            Ok(port) => Self::Tcp {
                hostname: hostname.unwrap_or("0.0.0.0").to_string(),
                port,
            },
            Err(_) => Self::Unix(PathBuf::from(port_or_path)),
        }
    }
}

/// Address the transport actually bound.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BoundAddress {
    Tcp(SocketAddr),
    Unix(PathBuf),
}

impl fmt::Display for BoundAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp(addr) => write!(f, "{addr}"),
            Self::Unix(path) => write!(f, "unix:{}", path.display()),
        }
    }
}

/// Lifecycle notifications.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Listening(BoundAddress),
    Closed,
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("transport is already listening on {0}")]
    AlreadyListening(BoundAddress),
    #[error("invalid listen address: {0}")]
    InvalidAddress(String),
    #[error("invalid transport configuration: {0}")]
    InvalidConfig(String),
    #[error("failed to bind {endpoint}: {source}")]
    Bind {
        endpoint: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to load TLS certificate: {0}")]
    Tls(#[source] std::io::Error),
    #[error("TLS is not supported on Unix socket endpoints")]
    TlsOverUnix,
}

// ─────────────────────────────────────────────────────────────────────────────
// Gateway: shared state + socket event dispatch
// ─────────────────────────────────────────────────────────────────────────────

/// A connection that has just been opened and registered.
pub struct OpenedConnection {
    pub client: Arc<ClientConnection>,
    /// Frames queued by the room; drained by the socket writer
    pub outbound: mpsc::UnboundedReceiver<Outbound>,
    /// The join sequence, resolving to `Joined` or `Rejected`
    pub join: JoinHandle<ConnectionState>,
}

/// Shared state for the transport: configuration, matchmaker, registry.
pub struct Gateway<M: Matchmaker> {
    config: TransportConfig,
    matchmaker: Arc<M>,
    registry: ClientRegistry,
    next_id: AtomicU64,
}

impl<M: Matchmaker> Gateway<M> {
    pub fn new(config: TransportConfig, matchmaker: Arc<M>) -> Arc<Self> {
        Arc::new(Self {
            config,
            matchmaker,
            registry: ClientRegistry::new(),
            next_id: AtomicU64::new(1),
        })
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    pub fn matchmaker(&self) -> &Arc<M> {
        &self.matchmaker
    }

    pub fn registry(&self) -> &ClientRegistry {
        &self.registry
    }

    /// HTTP surface: `/health`, `/matchmake/*`, and WebSocket upgrades on
    /// every other path.
    pub fn router(self: &Arc<Self>) -> Router {
        Router::new()
            .route("/health", get(health_handler::<M>))
            .merge(matchmake::routes::<M>())
            .fallback(ws_upgrade_handler::<M>)
            .with_state(self.clone())
    }

    /// Open: build the wrapper, register it, then start the join sequence.
    ///
    /// Registration happens before this returns, so no message for the
    /// connection can be dispatched against an empty registry.
    pub fn open(&self, context: Arc<UpgradeContext>) -> OpenedConnection {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let options = ClientOptions::from(&self.config);
        let (client, outbound) = ClientConnection::new(id, context, options);
        self.registry.register(client.clone());
        debug!(
            "Connection {id} opened from {} ({})",
            client.remote_address(),
            client.context().url
        );

        let join = tokio::spawn(join::run_join(self.matchmaker.clone(), client.clone()));
        OpenedConnection {
            client,
            outbound,
            join,
        }
    }

    /// Message: forward to the wrapper if the connection is registered.
    pub fn dispatch_message(&self, id: ConnectionId, payload: Bytes) -> bool {
        match self.registry.lookup(id) {
            Some(client) => client.emit_message(payload),
            None => false,
        }
    }

    /// Close: prune the live list and fire the wrapper's close event once.
    pub fn dispatch_close(&self, id: ConnectionId, code: u16) -> Option<Arc<ClientConnection>> {
        let client = self.registry.unregister(id, code);
        debug!(
            "Connection {id} closed with code {code} (live: {})",
            self.registry.len()
        );
        client
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Transport server: listener lifecycle
// ─────────────────────────────────────────────────────────────────────────────

enum ShutdownHandle {
    Plain(oneshot::Sender<()>),
    Tls(axum_server::Handle),
}

struct Running {
    bound: BoundAddress,
    shutdown: ShutdownHandle,
    handle: JoinHandle<()>,
}

/// The transport server: binds a listener and serves the gateway router.
pub struct TransportServer<M: Matchmaker> {
    gateway: Arc<Gateway<M>>,
    events: broadcast::Sender<TransportEvent>,
    running: Option<Running>,
}

impl<M: Matchmaker> TransportServer<M> {
    pub fn new(config: TransportConfig, matchmaker: M) -> Self {
        Self::with_matchmaker(config, Arc::new(matchmaker))
    }

    /// Accepts `Arc<M>` so the matchmaker can be shared with the caller
    /// (e.g. to flip its graceful-shutdown flag).
    pub fn with_matchmaker(config: TransportConfig, matchmaker: Arc<M>) -> Self {
        let (events, _) = broadcast::channel(16);
        Self {
            gateway: Gateway::new(config, matchmaker),
            events,
            running: None,
        }
    }

    pub fn gateway(&self) -> &Arc<Gateway<M>> {
        &self.gateway
    }

    /// Subscribe to `Listening` / `Closed` notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.events.subscribe()
    }

    pub fn local_addr(&self) -> Option<&BoundAddress> {
        self.running.as_ref().map(|r| &r.bound)
    }

    /// Bound TCP port, if listening on TCP.
    pub fn port(&self) -> Option<u16> {
        match self.local_addr()? {
            BoundAddress::Tcp(addr) => Some(addr.port()),
            BoundAddress::Unix(_) => None,
        }
    }

    pub fn is_tls(&self) -> bool {
        self.gateway.config.tls.is_some()
    }

    /// Bind `endpoint` and start serving. Emits `TransportEvent::Listening`.
    pub async fn listen(
        &mut self,
        endpoint: ListenEndpoint,
        backlog: Option<u32>,
    ) -> Result<BoundAddress, TransportError> {
        if let Some(running) = &self.running {
            return Err(TransportError::AlreadyListening(running.bound.clone()));
        }
        self.gateway.config.validate()?;
        if self.gateway.config.compression {
            warn!("permessage-deflate is not negotiated by this transport; compression is ignored");
        }

        let app = self.gateway.router();
        let backlog = backlog.unwrap_or(DEFAULT_BACKLOG);

        let running = match endpoint {
            ListenEndpoint::Tcp { hostname, port } => {
                let listener = bind_tcp(&hostname, port, backlog).await?;
                let local = listener.local_addr().map_err(|source| TransportError::Bind {
                    endpoint: format!("{hostname}:{port}"),
                    source,
                })?;
                match &self.gateway.config.tls {
                    None => serve_plain(listener, app, BoundAddress::Tcp(local)),
                    Some(tls) => serve_tls(listener, tls, app, local).await?,
                }
            }
            ListenEndpoint::Unix(path) => {
                if self.gateway.config.tls.is_some() {
                    return Err(TransportError::TlsOverUnix);
                }
                bind_unix(path, app)?
            }
        };

        let bound = running.bound.clone();
        let scheme = if self.is_tls() { "wss" } else { "ws" };
        info!("Room gateway listening on {scheme}://{bound}");
        self.running = Some(running);
        let _ = self.events.send(TransportEvent::Listening(bound.clone()));
        Ok(bound)
    }

    /// Close live sockets with `SERVER_SHUTDOWN` and stop accepting
    /// connections. Emits `TransportEvent::Closed`.
    pub async fn shutdown(&mut self) {
        let Some(running) = self.running.take() else {
            return;
        };

        let live = self.gateway.registry.live_connections();
        if !live.is_empty() {
            info!("Closing {} live connections", live.len());
        }
        for id in live {
            if let Some(client) = self.gateway.registry.lookup(id) {
                client.close(CloseCode::SERVER_SHUTDOWN, "server shutting down");
            }
        }

        match running.shutdown {
            ShutdownHandle::Plain(tx) => {
                let _ = tx.send(());
            }
            ShutdownHandle::Tls(handle) => handle.graceful_shutdown(Some(Duration::from_secs(10))),
        }
        let _ = running.handle.await;

        if let BoundAddress::Unix(path) = &running.bound {
            let _ = std::fs::remove_file(path);
        }
        info!("Room gateway stopped ({})", running.bound);
        let _ = self.events.send(TransportEvent::Closed);
    }
}

async fn bind_tcp(
    hostname: &str,
    port: u16,
    backlog: u32,
) -> Result<tokio::net::TcpListener, TransportError> {
    let endpoint = format!("{hostname}:{port}");
    let bind_err = |source| TransportError::Bind {
        endpoint: endpoint.clone(),
        source,
    };

    let addr = tokio::net::lookup_host((hostname, port))
        .await
        .map_err(bind_err)?
        .next()
        .ok_or_else(|| TransportError::InvalidAddress(endpoint.clone()))?;

    let socket = if addr.is_ipv4() {
        tokio::net::TcpSocket::new_v4()
    } else {
        tokio::net::TcpSocket::new_v6()
    }
    .map_err(bind_err)?;
    socket.set_reuseaddr(true).map_err(bind_err)?;
    socket.bind(addr).map_err(bind_err)?;
    socket.listen(backlog).map_err(bind_err)
}

fn serve_plain(listener: tokio::net::TcpListener, app: Router, bound: BoundAddress) -> Running {
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let handle = tokio::spawn(async move {
        let service = app.into_make_service_with_connect_info::<RemoteAddr>();
        if let Err(e) = axum::serve(listener, service)
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.await;
            })
            .await
        {
            error!("Transport server error: {e}");
        }
    });
    Running {
        bound,
        shutdown: ShutdownHandle::Plain(shutdown_tx),
        handle,
    }
}

async fn serve_tls(
    listener: tokio::net::TcpListener,
    tls: &TlsConfig,
    app: Router,
    local: SocketAddr,
) -> Result<Running, TransportError> {
    let rustls = axum_server::tls_rustls::RustlsConfig::from_pem_file(&tls.cert_path, &tls.key_path)
        .await
        .map_err(TransportError::Tls)?;
    let std_listener = listener.into_std().map_err(|source| TransportError::Bind {
        endpoint: local.to_string(),
        source,
    })?;

    let shutdown = axum_server::Handle::new();
    let server = axum_server::from_tcp_rustls(std_listener, rustls).handle(shutdown.clone());
    let handle = tokio::spawn(async move {
        let service = app.into_make_service_with_connect_info::<RemoteAddr>();
        if let Err(e) = server.serve(service).await {
            error!("Transport server error: {e}");
        }
    });
    Ok(Running {
        bound: BoundAddress::Tcp(local),
        shutdown: ShutdownHandle::Tls(shutdown),
        handle,
    })
}

#[cfg(unix)]
fn bind_unix(path: PathBuf, app: Router) -> Result<Running, TransportError> {
    let listener = tokio::net::UnixListener::bind(&path).map_err(|source| TransportError::Bind {
        endpoint: path.display().to_string(),
        source,
    })?;
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let handle = tokio::spawn(async move {
        let service = app.into_make_service_with_connect_info::<RemoteAddr>();
        if let Err(e) = axum::serve(listener, service)
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.await;
            })
            .await
        {
            error!("Transport server error: {e}");
        }
    });
    Ok(Running {
        bound: BoundAddress::Unix(path),
        shutdown: ShutdownHandle::Plain(shutdown_tx),
        handle,
    })
}

#[cfg(not(unix))]
fn bind_unix(path: PathBuf, _app: Router) -> Result<Running, TransportError> {
    Err(TransportError::InvalidAddress(path.display().to_string()))
}

// ─────────────────────────────────────────────────────────────────────────────
// HTTP Handlers
// ─────────────────────────────────────────────────────────────────────────────

async fn health_handler<M: Matchmaker>(
    State(gateway): State<Arc<Gateway<M>>>,
) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "clients": gateway.registry.len(),
    }))
}

/// Upgrade: capture the request, then hand it to the WebSocket acceptor.
async fn ws_upgrade_handler<M: Matchmaker>(
    State(gateway): State<Arc<Gateway<M>>>,
    ConnectInfo(remote): ConnectInfo<RemoteAddr>,
    uri: Uri,
    headers: HeaderMap,
    upgrade: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let Ok(ws) = upgrade else {
        return StatusCode::NOT_FOUND.into_response();
    };

    if let Some(max) = gateway.config.max_connections {
        if gateway.registry.len() >= max {
            warn!("Connection rejected: max connections reached ({max})");
            return StatusCode::SERVICE_UNAVAILABLE.into_response();
        }
    }

    // Everything needed later is copied out here; the request is not
    // touched again after the hand-off below.
    let context = Arc::new(UpgradeContext::from_request(&uri, &headers, &remote));
    let handshake = context.handshake();
    if let Some(extensions) = &handshake.extensions {
        debug!("Client offered extensions: {extensions}");
    }

    let max_payload = gateway.config.max_payload_length;
    let max_backpressure = gateway.config.max_backpressure.max(1);
    let write_buffer_size = gateway.config.write_buffer_size();
    ws.max_message_size(max_payload)
        .max_frame_size(max_payload)
        .write_buffer_size(write_buffer_size)
        .max_write_buffer_size(max_backpressure)
        .protocols(handshake.protocols())
        .on_failed_upgrade(|e| warn!("WebSocket upgrade failed: {e}"))
        .on_upgrade(move |socket| handle_socket(socket, gateway, context))
}

// ─────────────────────────────────────────────────────────────────────────────
// WebSocket Connection Handler
// ─────────────────────────────────────────────────────────────────────────────

async fn handle_socket<M: Matchmaker>(
    socket: WebSocket,
    gateway: Arc<Gateway<M>>,
    context: Arc<UpgradeContext>,
) {
    let (ws_tx, mut ws_rx) = socket.split();

    let OpenedConnection {
        client, outbound, ..
    } = gateway.open(context);
    let id = client.id();
    let writer = tokio::spawn(write_outbound(ws_tx, outbound, client.clone()));

    let mut heartbeat = gateway.config.ping_interval.map(|period| {
        tokio::time::interval_at(tokio::time::Instant::now() + period, period)
    });
    let max_retries = gateway.config.ping_max_retries;
    let mut unanswered = 0u32;

    let code = loop {
        let tick = async {
            match heartbeat.as_mut() {
                Some(interval) => {
                    interval.tick().await;
                }
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(Message::Binary(data))) => {
                        unanswered = 0;
                        gateway.dispatch_message(id, data);
                    }
                    Some(Ok(Message::Text(text))) => {
                        unanswered = 0;
                        let payload = Bytes::copy_from_slice(text.as_str().as_bytes());
                        gateway.dispatch_message(id, payload);
                    }
                    Some(Ok(Message::Ping(_) | Message::Pong(_))) => {
                        unanswered = 0;
                    }
                    Some(Ok(Message::Close(frame))) => {
                        break frame.map_or(CloseCode::NO_STATUS_RECEIVED, |f| f.code);
                    }
                    Some(Err(e)) => {
                        warn!("WebSocket error for connection {id}: {e}");
                        break CloseCode::ABNORMAL_CLOSURE;
                    }
                    None => {
                        break client.requested_close_code().unwrap_or(CloseCode::ABNORMAL_CLOSURE);
                    }
                }
            }

            _ = client.wait_terminated() => {
                break client.requested_close_code().unwrap_or(CloseCode::ABNORMAL_CLOSURE);
            }

            _ = tick => {
                if unanswered >= max_retries {
                    warn!("Connection {id} missed {unanswered} pings, terminating");
                    break CloseCode::ABNORMAL_CLOSURE;
                }
                unanswered += 1;
                client.ping();
            }
        }
    };

    gateway.dispatch_close(id, code);
    writer.abort();
}

/// Drain the wrapper's outbound queue into the socket.
async fn write_outbound(
    mut ws_tx: SplitSink<WebSocket, Message>,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
    client: Arc<ClientConnection>,
) {
    while let Some(Outbound { frame, not_before }) = outbound.recv().await {
        if let Some(deadline) = not_before {
            tokio::time::sleep_until(deadline).await;
        }
        let size = frame.data_len();

        let message = match frame {
            OutboundFrame::Binary(data) => Message::Binary(data),
            OutboundFrame::Text(text) => Message::Text(text.into()),
            OutboundFrame::Ping => Message::Ping(Bytes::new()),
            OutboundFrame::Close { code, reason } => {
                let frame = CloseFrame {
                    code,
                    reason: reason.into(),
                };
                if let Err(e) = ws_tx.send(Message::Close(Some(frame))).await {
                    debug!("Failed to send close frame to connection {}: {e}", client.id());
                    break;
                }
                // The reader normally finishes first, when the peer answers.
                tokio::time::sleep(CLOSE_TIMEOUT).await;
                debug!("Connection {} did not answer close, dropping", client.id());
                break;
            }
            OutboundFrame::Terminate => break,
        };

        let written = ws_tx.send(message).await;
        client.release_backpressure(size);
        if let Err(e) = written {
            warn!("Failed to write to connection {}: {e}", client.id());
            break;
        }
    }
    client.mark_terminated();
}
