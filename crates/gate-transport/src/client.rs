//! Client connection wrapper.
//!
//! A [`ClientConnection`] is created when a socket opens and lives exactly as
//! long as that socket. Rooms talk to the socket through it: outbound frames
//! go into a queue drained by the connection's writer task, and inbound
//! traffic comes back as [`ClientEvent`]s on a bounded channel that exactly
//! one consumer takes with [`ClientConnection::take_events`].
//!
//! Outbound data is accounted in bytes from `send` until the writer has
//! flushed it. A write that would take the backlog past `max_backpressure`
//! fails and terminates the connection with `POLICY_VIOLATION`.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use bytes::Bytes;
use gate_protocol::{CloseCode, encode_error_frame};
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::context::UpgradeContext;

/// Stable identifier assigned to a connection when it opens.
pub type ConnectionId = u64;

/// Event delivered to whoever consumes a connection's events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    /// Payload received from the client (owned, independent of the socket buffer)
    Message(Bytes),
    /// The socket closed with this code. Always the last event.
    Close(u16),
}

/// Frame queued for the writer task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundFrame {
    Binary(Bytes),
    Text(String),
    Ping,
    /// Graceful close: a close frame is sent and the peer is expected to answer
    Close { code: u16, reason: String },
    /// Forced close: the socket is dropped without a close handshake
    Terminate,
}

impl OutboundFrame {
    fn is_data(&self) -> bool {
        matches!(self, Self::Binary(_) | Self::Text(_))
    }

    /// Bytes counted against the backpressure ceiling.
    pub fn data_len(&self) -> usize {
        match self {
            Self::Binary(data) => data.len(),
            Self::Text(text) => text.len(),
            _ => 0,
        }
    }
}

/// A queued frame plus the earliest instant it may be written.
#[derive(Debug)]
pub struct Outbound {
    pub frame: OutboundFrame,
    pub not_before: Option<Instant>,
}

/// Lifecycle of a connection after the upgrade completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Open,
    Joining,
    Joined,
    Rejected,
    Closed,
}

/// Per-connection settings taken from the transport configuration.
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Delay applied to every data frame before it is written
    pub simulate_latency: Option<Duration>,
    /// Capacity of the inbound event channel
    pub event_buffer: usize,
    /// Outbound bytes allowed to wait for the writer
    pub max_backpressure: usize,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            simulate_latency: None,
            event_buffer: 256,
            max_backpressure: 1024 * 1024,
        }
    }
}

/// Gateway-owned adapter around one socket.
#[derive(Debug)]
pub struct ClientConnection {
    id: ConnectionId,
    context: Arc<UpgradeContext>,
    outbound: mpsc::UnboundedSender<Outbound>,
    events_tx: mpsc::Sender<ClientEvent>,
    events_rx: Mutex<Option<mpsc::Receiver<ClientEvent>>>,
    state: Mutex<ConnectionState>,
    /// Close code requested by the server side (close or terminate)
    close_code: Mutex<Option<u16>>,
    close_emitted: AtomicBool,
    terminated: watch::Sender<bool>,
    simulate_latency: Option<Duration>,
    /// Data bytes queued but not yet written
    buffered: AtomicUsize,
    max_backpressure: usize,
}

impl ClientConnection {
    /// Create a wrapper and the receiving end of its outbound queue.
    pub fn new(
        id: ConnectionId,
        context: Arc<UpgradeContext>,
        options: ClientOptions,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<Outbound>) {
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::channel(options.event_buffer.max(1));
        let (terminated, _) = watch::channel(false);

        let client = Arc::new(Self {
            id,
            context,
            outbound,
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            state: Mutex::new(ConnectionState::Open),
            close_code: Mutex::new(None),
            close_emitted: AtomicBool::new(false),
            terminated,
            simulate_latency: options.simulate_latency,
            buffered: AtomicUsize::new(0),
            max_backpressure: options.max_backpressure,
        });
        (client, outbound_rx)
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Upgrade-time metadata (url, query, headers, remote address).
    pub fn context(&self) -> &UpgradeContext {
        &self.context
    }

    pub fn context_arc(&self) -> Arc<UpgradeContext> {
        self.context.clone()
    }

    /// The `sessionId` query parameter the client connected with.
    pub fn session_id(&self) -> Option<&str> {
        self.context.query_param("sessionId")
    }

    pub fn remote_address(&self) -> &str {
        &self.context.remote_address
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.lock()
    }

    /// Move to `next` unless the connection already closed.
    pub(crate) fn set_state(&self, next: ConnectionState) {
        let mut state = self.state.lock();
        if *state != ConnectionState::Closed {
            *state = next;
        }
    }

    pub fn is_closed(&self) -> bool {
        self.close_emitted.load(Ordering::Acquire)
    }

    // ── Outbound ──────────────────────────────────────────────────────────

    /// Queue a binary frame. Returns `false` once the connection is gone.
    pub fn send(&self, payload: impl Into<Bytes>) -> bool {
        self.enqueue(OutboundFrame::Binary(payload.into()))
    }

    pub fn send_text(&self, text: impl Into<String>) -> bool {
        self.enqueue(OutboundFrame::Text(text.into()))
    }

    /// Queue an error frame carrying `{code, message}`.
    pub fn error(&self, code: i32, message: &str) -> bool {
        self.enqueue(OutboundFrame::Binary(encode_error_frame(code, message).into()))
    }

    /// Start a graceful close with the given code.
    pub fn close(&self, code: u16, reason: impl Into<String>) -> bool {
        self.close_code.lock().get_or_insert(code);
        self.enqueue(OutboundFrame::Close {
            code,
            reason: reason.into(),
        })
    }

    /// Drop the socket once everything queued before this call is written.
    pub fn terminate(&self, code: u16) -> bool {
        self.close_code.lock().get_or_insert(code);
        self.enqueue(OutboundFrame::Terminate)
    }

    pub(crate) fn ping(&self) -> bool {
        self.enqueue(OutboundFrame::Ping)
    }

    fn enqueue(&self, frame: OutboundFrame) -> bool {
        if self.is_closed() {
            return false;
        }
        let size = frame.data_len();
        let not_before = if frame.is_data() {
            if !self.reserve_backpressure(size) {
                return false;
            }
            self.simulate_latency.map(|latency| Instant::now() + latency)
        } else {
            None
        };
        if self.outbound.send(Outbound { frame, not_before }).is_ok() {
            return true;
        }
        self.release_backpressure(size);
        false
    }

    fn reserve_backpressure(&self, size: usize) -> bool {
        let reserved = self
            .buffered
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |buffered| {
                buffered
                    .checked_add(size)
                    .filter(|total| *total <= self.max_backpressure)
            });
        if reserved.is_err() {
            warn!(
                "Outbound backlog for connection {} over {} bytes, terminating",
                self.id, self.max_backpressure
            );
            self.close_code.lock().get_or_insert(CloseCode::POLICY_VIOLATION);
            self.mark_terminated();
            return false;
        }
        true
    }

    /// Called by the writer once `size` data bytes left the queue.
    pub(crate) fn release_backpressure(&self, size: usize) {
        let _ = self
            .buffered
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |buffered| {
                Some(buffered.saturating_sub(size))
            });
    }

    /// Data bytes queued for the socket but not yet written.
    pub fn buffered_amount(&self) -> usize {
        self.buffered.load(Ordering::Acquire)
    }

    /// Close code requested via `close` or `terminate`, if any.
    pub fn requested_close_code(&self) -> Option<u16> {
        *self.close_code.lock()
    }

    // ── Termination signal (writer → reader) ──────────────────────────────

    pub(crate) fn mark_terminated(&self) {
        self.terminated.send_replace(true);
    }

    /// Resolves once the writer has dropped its half of the socket.
    pub(crate) async fn wait_terminated(&self) {
        let mut rx = self.terminated.subscribe();
        let _ = rx.wait_for(|terminated| *terminated).await;
    }

    // ── Events ────────────────────────────────────────────────────────────

    /// Take the event receiver. Only the first caller gets it.
    pub fn take_events(&self) -> Option<mpsc::Receiver<ClientEvent>> {
        self.events_rx.lock().take()
    }

    /// Deliver an inbound payload. A consumer that falls `event_buffer`
    /// messages behind gets the connection terminated.
    pub(crate) fn emit_message(&self, payload: Bytes) -> bool {
        if self.is_closed() {
            return false;
        }
        match self.events_tx.try_send(ClientEvent::Message(payload)) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!("Event buffer full for connection {}, terminating", self.id);
                self.terminate(CloseCode::POLICY_VIOLATION);
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /// Fire the close event. Returns `false` if it already fired.
    pub(crate) fn emit_close(&self, code: u16) -> bool {
        if self.close_emitted.swap(true, Ordering::AcqRel) {
            return false;
        }
        *self.state.lock() = ConnectionState::Closed;
        debug!("Connection {} closed (code {code})", self.id);

        match self.events_tx.try_send(ClientEvent::Close(code)) {
            Ok(()) | Err(mpsc::error::TrySendError::Closed(_)) => {}
            Err(mpsc::error::TrySendError::Full(event)) => {
                let events_tx = self.events_tx.clone();
                tokio::spawn(async move {
                    let _ = events_tx.send(event).await;
                });
            }
        }
        true
    }
}
