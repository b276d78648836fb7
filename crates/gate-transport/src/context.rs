//! Upgrade-time connection context.
//!
//! Everything the gateway needs from the HTTP upgrade request is copied into
//! an [`UpgradeContext`] inside the upgrade handler, before the request is
//! handed to the WebSocket acceptor. The context then travels with the
//! connection (behind an `Arc`) through open, join, message and close.

use std::collections::HashMap;
use std::net::SocketAddr;

use axum::extract::Query;
use axum::extract::connect_info::Connected;
use axum::http::{HeaderMap, Uri};
use axum::serve::IncomingStream;

/// Metadata captured from the upgrade request.
#[derive(Debug, Clone, Default)]
pub struct UpgradeContext {
    /// Request path used to upgrade (without the query string)
    pub url: String,
    /// Raw query string (without the leading `?`)
    pub query: String,
    /// Header name/value pairs in arrival order
    pub headers: Vec<(String, String)>,
    pub remote_address: String,
    query_params: HashMap<String, String>,
}

impl UpgradeContext {
    pub fn new(
        url: impl Into<String>,
        query: impl Into<String>,
        headers: Vec<(String, String)>,
        remote_address: impl Into<String>,
    ) -> Self {
        let query = query.into();
        let query_params = parse_query(&query);
        Self {
            url: url.into(),
            query,
            headers,
            remote_address: remote_address.into(),
            query_params,
        }
    }

    pub fn from_request(uri: &Uri, headers: &HeaderMap, remote: &RemoteAddr) -> Self {
        let headers = headers
            .iter()
            .map(|(name, value)| {
                (
                    name.as_str().to_string(),
                    String::from_utf8_lossy(value.as_bytes()).into_owned(),
                )
            })
            .collect();
        Self::new(
            uri.path(),
            uri.query().unwrap_or_default(),
            headers,
            remote.0.clone(),
        )
    }

    /// First header with this name (case-insensitive).
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn query_param(&self, name: &str) -> Option<&str> {
        self.query_params.get(name).map(String::as_str)
    }

    pub fn query_params(&self) -> &HashMap<String, String> {
        &self.query_params
    }

    /// The three headers forwarded to the WebSocket acceptor.
    pub fn handshake(&self) -> HandshakeHeaders {
        HandshakeHeaders {
            key: self.header("sec-websocket-key").map(str::to_string),
            protocol: self.header("sec-websocket-protocol").map(str::to_string),
            extensions: self.header("sec-websocket-extensions").map(str::to_string),
        }
    }
}

fn parse_query(query: &str) -> HashMap<String, String> {
    if query.is_empty() {
        return HashMap::new();
    }
    format!("/?{query}")
        .parse::<Uri>()
        .ok()
        .and_then(|uri| Query::<HashMap<String, String>>::try_from_uri(&uri).ok())
        .map(|Query(params)| params)
        .unwrap_or_default()
}

/// `sec-websocket-*` handshake headers of an upgrade request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HandshakeHeaders {
    pub key: Option<String>,
    pub protocol: Option<String>,
    pub extensions: Option<String>,
}

impl HandshakeHeaders {
    /// Subprotocols offered by the client, in preference order.
    pub fn protocols(&self) -> Vec<String> {
        self.protocol
            .as_deref()
            .map(|header| {
                header
                    .split(',')
                    .map(str::trim)
                    .filter(|p| !p.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Routing parameters of a join attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinRequest {
    pub session_id: String,
    pub room_id: String,
    pub reconnection_token: Option<String>,
}

impl JoinRequest {
    /// `None` when the session id or the room id is missing.
    pub fn from_context(context: &UpgradeContext) -> Option<Self> {
        let session_id = context.query_param("sessionId")?.to_string();
        let room_id = crate::path::trailing_identifier(&context.url)?.to_string();
        let reconnection_token = context
            .query_param("reconnectionToken")
            .filter(|token| !token.is_empty())
            .map(str::to_string);
        Some(Self {
            session_id,
            room_id,
            reconnection_token,
        })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Remote address
// ─────────────────────────────────────────────────────────────────────────────

/// Peer address as text, for TCP, TLS and Unix socket listeners alike.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteAddr(pub String);

impl Connected<IncomingStream<'_, tokio::net::TcpListener>> for RemoteAddr {
    fn connect_info(stream: IncomingStream<'_, tokio::net::TcpListener>) -> Self {
        Self(stream.remote_addr().ip().to_string())
    }
}

#[cfg(unix)]
impl Connected<IncomingStream<'_, tokio::net::UnixListener>> for RemoteAddr {
    fn connect_info(stream: IncomingStream<'_, tokio::net::UnixListener>) -> Self {
        let addr = stream
            .remote_addr()
            .as_pathname()
            .map(|path| path.display().to_string())
            .unwrap_or_else(|| "unix".into());
        Self(addr)
    }
}

/// Used by the TLS listener, which reports peers as plain socket addresses.
impl Connected<SocketAddr> for RemoteAddr {
    fn connect_info(addr: SocketAddr) -> Self {
        Self(addr.ip().to_string())
    }
}
