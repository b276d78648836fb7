//! Relay rooms.
//!
//! A [`LocalRoom`] holds seat reservations and joined clients. Each joined
//! client gets a relay task that forwards its messages to every other client
//! in the room. The room removes itself from the matchmaker once it has no
//! clients and no pending reservations.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use gate_protocol::{CloseCode, MatchmakeError, MatchmakeResult, encode_join_frame};
use gate_transport::{ClientConnection, ClientEvent, Room, UpgradeContext};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info};

pub(crate) type RoomMap = DashMap<String, Arc<LocalRoom>>;

/// Public description of a room, as returned by matchmaking calls.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomListing {
    pub room_id: String,
    pub name: String,
    pub clients: usize,
    pub max_clients: usize,
    pub locked: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Default)]
struct RoomInner {
    /// session id -> reservation deadline
    reservations: HashMap<String, Instant>,
    /// session id -> joined client
    clients: HashMap<String, Arc<ClientConnection>>,
    disposed: bool,
}

impl RoomInner {
    fn seats_taken(&self) -> usize {
        self.reservations.len() + self.clients.len()
    }

    fn is_empty(&self) -> bool {
        self.seats_taken() == 0
    }
}

pub struct LocalRoom {
    room_id: String,
    name: String,
    max_clients: usize,
    seat_reservation_time: Duration,
    created_at: DateTime<Utc>,
    inner: Mutex<RoomInner>,
    registry: Weak<RoomMap>,
    me: Weak<LocalRoom>,
}

impl LocalRoom {
    pub(crate) fn new(
        room_id: String,
        name: &str,
        max_clients: usize,
        seat_reservation_time: Duration,
        registry: Weak<RoomMap>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            room_id,
            name: name.to_string(),
            max_clients,
            seat_reservation_time,
            created_at: Utc::now(),
            inner: Mutex::new(RoomInner::default()),
            registry,
            me: me.clone(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn max_clients(&self) -> usize {
        self.max_clients
    }

    pub fn client_count(&self) -> usize {
        self.inner.lock().clients.len()
    }

    pub fn reservation_count(&self) -> usize {
        self.inner.lock().reservations.len()
    }

    /// Full rooms are locked and hidden from listings.
    pub fn is_locked(&self) -> bool {
        self.inner.lock().seats_taken() >= self.max_clients
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.lock().disposed
    }

    pub fn listing(&self) -> RoomListing {
        let inner = self.inner.lock();
        RoomListing {
            room_id: self.room_id.clone(),
            name: self.name.clone(),
            clients: inner.clients.len(),
            max_clients: self.max_clients,
            locked: inner.seats_taken() >= self.max_clients,
            created_at: self.created_at,
        }
    }

    /// Hold a seat for `session_id` until the reservation time runs out.
    /// Returns `false` when the room is full or already disposed.
    pub fn reserve_seat(&self, session_id: &str) -> bool {
        {
            let mut inner = self.inner.lock();
            if inner.disposed || inner.seats_taken() >= self.max_clients {
                return false;
            }
            let deadline = Instant::now() + self.seat_reservation_time;
            inner.reservations.insert(session_id.to_string(), deadline);
        }
        debug!("Reserved seat in room {} for session {session_id}", self.room_id);

        if let Some(room) = self.me.upgrade() {
            let session_id = session_id.to_string();
            tokio::spawn(async move {
                tokio::time::sleep(room.seat_reservation_time).await;
                room.expire_seat(&session_id);
            });
        }
        true
    }

    fn expire_seat(&self, session_id: &str) {
        let dispose = {
            let mut inner = self.inner.lock();
            if inner.reservations.remove(session_id).is_none() {
                return;
            }
            inner.is_empty()
        };
        debug!("Seat reservation for session {session_id} in room {} expired", self.room_id);
        if dispose {
            self.dispose();
        }
    }

    fn leave(&self, session_id: &str, client: &Arc<ClientConnection>) {
        let dispose = {
            let mut inner = self.inner.lock();
            let same_connection = inner
                .clients
                .get(session_id)
                .is_some_and(|joined| joined.id() == client.id());
            if same_connection {
                inner.clients.remove(session_id);
            }
            inner.is_empty()
        };
        debug!("Session {session_id} left room {}", self.room_id);
        if dispose {
            self.dispose();
        }
    }

    fn dispose(&self) {
        {
            let mut inner = self.inner.lock();
            if inner.disposed || !inner.is_empty() {
                return;
            }
            inner.disposed = true;
        }
        if let Some(registry) = self.registry.upgrade() {
            registry.remove(&self.room_id);
        }
        info!("Room {} ({}) disposed", self.room_id, self.name);
    }

    /// Forward `payload` to every joined client except `sender`.
    fn broadcast_except(&self, sender: &str, payload: &bytes::Bytes) {
        let recipients: Vec<_> = {
            let inner = self.inner.lock();
            inner
                .clients
                .iter()
                .filter(|(session, _)| session.as_str() != sender)
                .map(|(_, client)| client.clone())
                .collect()
        };
        for client in recipients {
            client.send(payload.clone());
        }
    }

    async fn relay(
        self: Arc<Self>,
        session_id: String,
        client: Arc<ClientConnection>,
        mut events: mpsc::Receiver<ClientEvent>,
    ) {
        while let Some(event) = events.recv().await {
            match event {
                ClientEvent::Message(payload) => self.broadcast_except(&session_id, &payload),
                ClientEvent::Close(code) => {
                    if CloseCode::is_consented(code) {
                        debug!("Connection {} left room {}", client.id(), self.room_id);
                    } else {
                        debug!(
                            "Connection {} dropped from room {} ({code})",
                            client.id(),
                            self.room_id
                        );
                    }
                    break;
                }
            }
        }
        self.leave(&session_id, &client);
    }
}

impl Room for LocalRoom {
    fn room_id(&self) -> &str {
        &self.room_id
    }

    async fn has_reserved_seat(&self, session_id: &str, _reconnection_token: Option<&str>) -> bool {
        let inner = self.inner.lock();
        !inner.disposed
            && inner
                .reservations
                .get(session_id)
                .is_some_and(|deadline| *deadline > Instant::now())
    }

    async fn on_join(
        &self,
        client: Arc<ClientConnection>,
        _request: Arc<UpgradeContext>,
    ) -> MatchmakeResult<()> {
        let session_id = client
            .session_id()
            .ok_or_else(MatchmakeError::seat_expired)?
            .to_string();
        let room = self
            .me
            .upgrade()
            .ok_or_else(|| MatchmakeError::unhandled("room is gone"))?;

        {
            let mut inner = self.inner.lock();
            if inner.disposed || inner.reservations.remove(&session_id).is_none() {
                return Err(MatchmakeError::seat_expired());
            }
            inner.clients.insert(session_id.clone(), client.clone());
        }

        let Some(events) = client.take_events() else {
            self.leave(&session_id, &client);
            return Err(MatchmakeError::unhandled("connection events already consumed"));
        };

        client.send(encode_join_frame(&self.room_id));
        info!(
            "Session {session_id} joined room {} ({}/{})",
            self.room_id,
            self.client_count(),
            self.max_clients
        );
        tokio::spawn(room.relay(session_id, client, events));
        Ok(())
    }
}
