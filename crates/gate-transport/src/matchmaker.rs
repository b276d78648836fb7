//! Collaborator traits: the matchmaker and its rooms.
//!
//! The transport never decides placement. It asks the [`Matchmaker`] for
//! rooms, seat reservations and HTTP matchmaking results, and hands joined
//! clients to a [`Room`].

use std::future::Future;
use std::sync::Arc;

use axum::http::{HeaderMap, HeaderValue, header};
use gate_protocol::MatchmakeResult;
use serde_json::Value;

use crate::client::ClientConnection;
use crate::context::UpgradeContext;

/// A room that accepts clients holding a seat reservation.
pub trait Room: Send + Sync + 'static {
    fn room_id(&self) -> &str;

    /// Whether `session_id` holds an unexpired seat in this room.
    fn has_reserved_seat(
        &self,
        session_id: &str,
        reconnection_token: Option<&str>,
    ) -> impl Future<Output = bool> + Send;

    /// Admit a client whose seat has been validated.
    fn on_join(
        &self,
        client: Arc<ClientConnection>,
        request: Arc<UpgradeContext>,
    ) -> impl Future<Output = MatchmakeResult<()>> + Send;
}

/// Room registry and matchmaking controller consumed by the transport.
pub trait Matchmaker: Send + Sync + 'static {
    type Room: Room;

    fn get_room_by_id(&self, room_id: &str)
    -> impl Future<Output = Option<Arc<Self::Room>>> + Send;

    /// Run a matchmaking method (`POST /matchmake/<method>/<roomName>`).
    fn invoke_method(
        &self,
        method: &str,
        room_name: &str,
        body: Value,
    ) -> impl Future<Output = MatchmakeResult> + Send;

    /// List rooms available for `room_name` (`""` for every room).
    fn get_available_rooms(&self, room_name: &str) -> impl Future<Output = MatchmakeResult> + Send;

    /// Base CORS headers for every `/matchmake` response.
    fn default_cors_headers(&self) -> HeaderMap {
        default_cors_headers()
    }

    /// Per-request CORS headers; override the defaults header by header.
    fn cors_headers(&self, request: &HeaderMap) -> HeaderMap {
        let mut headers = HeaderMap::new();
        let origin = request
            .get(header::ORIGIN)
            .cloned()
            .unwrap_or_else(|| HeaderValue::from_static("*"));
        headers.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, origin);
        headers
    }

    fn is_gracefully_shutting_down(&self) -> bool;
}

pub fn default_cors_headers() -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, HeaderValue::from_static("*"));
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static("OPTIONS, POST, GET"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_HEADERS,
        HeaderValue::from_static("Authorization, Content-Type"),
    );
    headers.insert(header::ACCESS_CONTROL_MAX_AGE, HeaderValue::from_static("2592000"));
    headers
}

/// Defaults first, then the per-request set; later values win per header name.
pub(crate) fn merged_cors_headers<M: Matchmaker>(matchmaker: &M, request: &HeaderMap) -> HeaderMap {
    let mut headers = matchmaker.default_cors_headers();
    let overrides = matchmaker.cors_headers(request);
    for name in overrides.keys() {
        headers.remove(name);
    }
    for (name, value) in overrides.iter() {
        headers.append(name.clone(), value.clone());
    }
    headers
}
