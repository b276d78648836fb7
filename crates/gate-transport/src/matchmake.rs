//! HTTP matchmaking routes under `/matchmake`.
//!
//! - `OPTIONS /matchmake/*` → 204 with CORS headers
//! - `POST /matchmake/<method>/<roomName>` → `invoke_method` with the JSON body
//! - `GET /matchmake/<roomName>` → `get_available_rooms`
//!
//! Results are `200` + JSON; failures are `406` + `{code, error}`.
//!
//! The matchmaking work runs in a detached task that writes through a
//! [`Responder`]. When the peer goes away hyper drops the handler future,
//! which flips the request's [`AbortFlag`]; every later write sees the flag
//! and is silently skipped.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use axum::{
    Router,
    body::Body,
    extract::State,
    http::{HeaderMap, HeaderValue, StatusCode, Uri, header},
    response::{IntoResponse, Response},
    routing::{MethodRouter, options},
};
use gate_protocol::MatchmakeError;
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::body::{BodyError, read_json_body};
use crate::matchmaker::{Matchmaker, merged_cors_headers};
use crate::path::identifier_segments;
use crate::server::Gateway;

/// Path segment every matchmaking route starts with.
pub const MATCHMAKE_ROUTE: &str = "matchmake";

pub(crate) fn routes<M: Matchmaker>() -> Router<Arc<Gateway<M>>> {
    Router::new()
        .route("/matchmake", matchmake_methods::<M>())
        .route("/matchmake/", matchmake_methods::<M>())
        .route("/matchmake/{*rest}", matchmake_methods::<M>())
}

fn matchmake_methods<M: Matchmaker>() -> MethodRouter<Arc<Gateway<M>>> {
    options(preflight::<M>)
        .get(list_rooms::<M>)
        .post(invoke_method::<M>)
}

// ─────────────────────────────────────────────────────────────────────────────
// Path parsing
// ─────────────────────────────────────────────────────────────────────────────

/// Identifier segments of a matchmaking request path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchmakeRoute {
    segments: Vec<String>,
}

impl MatchmakeRoute {
    pub fn parse(path: &str) -> Self {
        Self {
            segments: identifier_segments(path).into_iter().map(str::to_string).collect(),
        }
    }

    fn segment(&self, index: usize) -> &str {
        self.segments.get(index).map_or("", String::as_str)
    }

    fn prefix_index(&self) -> Option<usize> {
        self.segments.iter().position(|s| s == MATCHMAKE_ROUTE)
    }

    /// Segment right after `matchmake`.
    pub fn method(&self) -> &str {
        self.segment(self.prefix_index().map_or(0, |i| i + 1))
    }

    /// Segment after the method, or `""`.
    pub fn room_name(&self) -> &str {
        self.segment(self.prefix_index().map_or(1, |i| i + 2))
    }

    /// Room name for listings: the last segment, or `""` if there is only one.
    pub fn listing_room_name(&self) -> &str {
        if self.segments.len() > 1 {
            self.segments.last().map_or("", String::as_str)
        } else {
            ""
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Abort handling
// ─────────────────────────────────────────────────────────────────────────────

/// Per-request aborted flag. Once set it stays set.
#[derive(Debug, Clone, Default)]
pub struct AbortFlag(Arc<AtomicBool>);

impl AbortFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn abort(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_aborted(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Armed on entry to every route; marks the request aborted if the handler
/// future is dropped before a response was produced.
#[derive(Debug)]
pub struct AbortGuard {
    flag: AbortFlag,
    armed: bool,
}

impl AbortGuard {
    pub fn arm() -> Self {
        Self {
            flag: AbortFlag::new(),
            armed: true,
        }
    }

    pub fn flag(&self) -> &AbortFlag {
        &self.flag
    }

    /// Run `work` detached and wait for the response it writes.
    pub async fn respond<F, Fut>(mut self, headers: HeaderMap, work: F) -> Response
    where
        F: FnOnce(Responder) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (responder, written) = Responder::new(self.flag.clone(), headers);
        tokio::spawn(work(responder));

        // An unwritten response means the body stream failed under us.
        let response = written
            .await
            .unwrap_or_else(|_| StatusCode::BAD_REQUEST.into_response());
        self.armed = false;
        response
    }
}

impl Drop for AbortGuard {
    fn drop(&mut self) {
        if self.armed {
            self.flag.abort();
        }
    }
}

/// Write side of one matchmaking response. Every write checks the aborted
/// flag first; at most one response is ever delivered.
#[derive(Debug)]
pub struct Responder {
    aborted: AbortFlag,
    headers: HeaderMap,
    tx: Option<oneshot::Sender<Response>>,
}

impl Responder {
    pub fn new(aborted: AbortFlag, headers: HeaderMap) -> (Self, oneshot::Receiver<Response>) {
        let (tx, rx) = oneshot::channel();
        let responder = Self {
            aborted,
            headers,
            tx: Some(tx),
        };
        (responder, rx)
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted.is_aborted()
    }

    pub fn abort(&self) {
        self.aborted.abort();
    }

    /// Returns `false` when the write was skipped.
    pub fn write(&mut self, status: StatusCode, body: Body) -> bool {
        if self.aborted.is_aborted() {
            debug!("Skipping write to aborted matchmake request ({status})");
            return false;
        }
        let Some(tx) = self.tx.take() else {
            return false;
        };

        let mut response = Response::new(body);
        *response.status_mut() = status;
        response.headers_mut().extend(self.headers.clone());
        tx.send(response).is_ok()
    }

    pub fn write_json(&mut self, value: &Value) -> bool {
        match serde_json::to_vec(value) {
            Ok(bytes) => self.write(StatusCode::OK, Body::from(bytes)),
            Err(e) => self.write_error(&MatchmakeError::unhandled(e.to_string())),
        }
    }

    pub fn write_error(&mut self, err: &MatchmakeError) -> bool {
        let body = serde_json::to_vec(&err.envelope()).unwrap_or_default();
        self.write(StatusCode::NOT_ACCEPTABLE, Body::from(body))
    }

    /// Bodiless rejection that makes hyper close the connection.
    pub fn close_connection(&mut self) -> bool {
        self.headers.clear();
        self.headers
            .insert(header::CONNECTION, HeaderValue::from_static("close"));
        self.write(StatusCode::SERVICE_UNAVAILABLE, Body::empty())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Handlers
// ─────────────────────────────────────────────────────────────────────────────

async fn preflight<M: Matchmaker>(
    State(gateway): State<Arc<Gateway<M>>>,
    headers: HeaderMap,
) -> Response {
    let guard = AbortGuard::arm();
    let cors = merged_cors_headers(gateway.matchmaker().as_ref(), &headers);
    guard
        .respond(cors, |mut responder| async move {
            responder.write(StatusCode::NO_CONTENT, Body::empty());
        })
        .await
}

async fn invoke_method<M: Matchmaker>(
    State(gateway): State<Arc<Gateway<M>>>,
    uri: Uri,
    headers: HeaderMap,
    body: Body,
) -> Response {
    let guard = AbortGuard::arm();
    let matchmaker = gateway.matchmaker().clone();

    if matchmaker.is_gracefully_shutting_down() {
        debug!("Rejecting POST {} during graceful shutdown", uri.path());
        return guard
            .respond(HeaderMap::new(), |mut responder| async move {
                responder.close_connection();
            })
            .await;
    }

    let response_headers = json_headers(matchmaker.as_ref(), &headers);
    let route = MatchmakeRoute::parse(uri.path());
    let limit = gateway.config().max_payload_length;

    guard
        .respond(response_headers, move |mut responder| async move {
            let body = match read_json_body(body, limit).await {
                Ok(Some(body)) => body,
                Ok(None) => {
                    let err = MatchmakeError::invalid_json();
                    warn!("POST /matchmake/{}: {err}", route.method());
                    responder.write_error(&err);
                    return;
                }
                Err(BodyError::Stream(e)) => {
                    debug!("Matchmake request body aborted: {e}");
                    responder.abort();
                    return;
                }
                Err(e @ BodyError::TooLarge { .. }) => {
                    let err = MatchmakeError::unhandled(e.to_string());
                    warn!("POST /matchmake/{}: {err}", route.method());
                    responder.write_error(&err);
                    return;
                }
            };

            match matchmaker
                .invoke_method(route.method(), route.room_name(), body)
                .await
            {
                Ok(result) => {
                    responder.write_json(&result);
                }
                Err(err) => {
                    warn!("Matchmake method \"{}\" failed: {err}", route.method());
                    responder.write_error(&err);
                }
            }
        })
        .await
}

async fn list_rooms<M: Matchmaker>(
    State(gateway): State<Arc<Gateway<M>>>,
    uri: Uri,
    headers: HeaderMap,
) -> Response {
    let guard = AbortGuard::arm();
    let matchmaker = gateway.matchmaker().clone();
    let response_headers = json_headers(matchmaker.as_ref(), &headers);
    let route = MatchmakeRoute::parse(uri.path());

    guard
        .respond(response_headers, move |mut responder| async move {
            match matchmaker
                .get_available_rooms(route.listing_room_name())
                .await
            {
                Ok(rooms) => {
                    responder.write_json(&rooms);
                }
                Err(err) => {
                    warn!("Listing rooms for \"{}\" failed: {err}", route.listing_room_name());
                    responder.write_error(&err);
                }
            }
        })
        .await
}

fn json_headers<M: Matchmaker>(matchmaker: &M, request: &HeaderMap) -> HeaderMap {
    let mut headers = merged_cors_headers(matchmaker, request);
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/json"),
    );
    headers
}
