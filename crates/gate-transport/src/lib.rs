//! Room Gateway - Transport Layer
//!
//! WebSocket and HTTP front door of the room gateway. The transport handles:
//! - Connection lifecycle (upgrade, open, message, close)
//! - Seat-reservation checks and handing joined clients to their room
//! - HTTP matchmaking routes with CORS and abort-safe responses
//! - Heartbeat / stale connection detection
//!
//! Placement decisions are made elsewhere, behind the `Matchmaker` and
//! `Room` traits.

pub mod body;
pub mod client;
pub mod context;
pub mod join;
pub mod matchmake;
pub mod matchmaker;
pub mod path;
pub mod registry;
pub mod server;

pub use client::{ClientConnection, ClientEvent, ConnectionId, ConnectionState};
pub use context::{JoinRequest, RemoteAddr, UpgradeContext};
pub use matchmaker::{Matchmaker, Room, default_cors_headers};
pub use registry::ClientRegistry;
pub use server::{
    BoundAddress, Gateway, ListenEndpoint, TlsConfig, TransportConfig, TransportError,
    TransportEvent, TransportServer,
};
