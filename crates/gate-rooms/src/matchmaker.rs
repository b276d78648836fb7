//! In-memory matchmaker.
//!
//! Rooms are created on demand from named [`RoomDefinition`]s. Every
//! successful matchmaking call reserves a seat and answers with
//! `{"room": <listing>, "sessionId": <id>}`; the client then connects to
//! `/<roomId>?sessionId=<id>` before the reservation expires.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use gate_protocol::{ErrorCode, MatchmakeError, MatchmakeResult};
use gate_transport::Matchmaker;
use rand::Rng;
use rand::distr::Alphanumeric;
use serde_json::{Value, json};
use tracing::{debug, info};

use crate::room::{LocalRoom, RoomListing, RoomMap};

const ROOM_ID_LENGTH: usize = 9;

#[derive(Debug, Clone)]
pub struct LocalMatchmakerConfig {
    /// How long a reserved seat stays valid without a connection
    pub seat_reservation_time: Duration,
}

impl Default for LocalMatchmakerConfig {
    fn default() -> Self {
        Self {
            seat_reservation_time: Duration::from_secs(15),
        }
    }
}

/// A room type clients can matchmake into.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomDefinition {
    pub name: String,
    pub max_clients: usize,
}

impl RoomDefinition {
    /// Parse `name` or `name:max_clients`.
    pub fn parse(value: &str) -> Option<Self> {
        let (name, max_clients) = match value.split_once(':') {
            Some((name, max)) => (name, max.parse().ok()?),
            None => (value, usize::MAX),
        };
        if name.is_empty() || max_clients == 0 {
            return None;
        }
        Some(Self {
            name: name.to_string(),
            max_clients,
        })
    }
}

pub struct LocalMatchmaker {
    config: LocalMatchmakerConfig,
    definitions: DashMap<String, RoomDefinition>,
    rooms: Arc<RoomMap>,
    shutting_down: AtomicBool,
}

impl LocalMatchmaker {
    pub fn new(config: LocalMatchmakerConfig) -> Self {
        Self {
            config,
            definitions: DashMap::new(),
            rooms: Arc::new(DashMap::new()),
            shutting_down: AtomicBool::new(false),
        }
    }

    /// Register (or replace) a room type.
    pub fn define(&self, name: &str, max_clients: usize) -> &Self {
        info!("Defined room \"{name}\" (max clients: {max_clients})");
        self.definitions.insert(
            name.to_string(),
            RoomDefinition {
                name: name.to_string(),
                max_clients: max_clients.max(1),
            },
        );
        self
    }

    pub fn room(&self, room_id: &str) -> Option<Arc<LocalRoom>> {
        self.rooms.get(room_id).map(|room| room.value().clone())
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    /// Stop taking matchmaking requests; existing rooms keep running.
    pub fn begin_graceful_shutdown(&self) {
        if !self.shutting_down.swap(true, Ordering::SeqCst) {
            info!("Matchmaker entering graceful shutdown ({} rooms)", self.rooms.len());
        }
    }

    /// Rooms of `name` (all rooms for `""`), oldest first.
    fn rooms_named(&self, name: &str) -> Vec<Arc<LocalRoom>> {
        let mut rooms: Vec<_> = self
            .rooms
            .iter()
            .filter(|entry| name.is_empty() || entry.value().name() == name)
            .map(|entry| entry.value().clone())
            .collect();
        rooms.sort_by_key(|room| room.listing().created_at);
        rooms
    }

    fn definition(&self, name: &str) -> MatchmakeResult<RoomDefinition> {
        self.definitions
            .get(name)
            .map(|definition| definition.value().clone())
            .ok_or_else(|| MatchmakeError::no_handler(name))
    }

    fn create_room(&self, definition: &RoomDefinition) -> Arc<LocalRoom> {
        let room_id = loop {
            let candidate = generate_room_id();
            if !self.rooms.contains_key(&candidate) {
                break candidate;
            }
        };
        let room = LocalRoom::new(
            room_id.clone(),
            &definition.name,
            definition.max_clients,
            self.config.seat_reservation_time,
            Arc::downgrade(&self.rooms),
        );
        self.rooms.insert(room_id.clone(), room.clone());
        info!("Created room {room_id} ({})", definition.name);
        room
    }

    fn reserve(&self, room: &LocalRoom) -> Option<Value> {
        let session_id = uuid::Uuid::new_v4().simple().to_string();
        if !room.reserve_seat(&session_id) {
            return None;
        }
        Some(reservation(room.listing(), &session_id))
    }

    /// Reserve in the first open room named `name`.
    fn join_existing(&self, name: &str) -> Option<Value> {
        self.rooms_named(name)
            .into_iter()
            .filter(|room| !room.is_locked())
            .find_map(|room| self.reserve(&room))
    }

    fn create(&self, name: &str) -> MatchmakeResult {
        let definition = self.definition(name)?;
        let room = self.create_room(&definition);
        self.reserve(&room).ok_or_else(|| {
            MatchmakeError::unhandled(format!("could not reserve a seat in new room \"{name}\""))
        })
    }

    fn join(&self, name: &str) -> MatchmakeResult {
        self.definition(name)?;
        self.join_existing(name).ok_or_else(|| {
            MatchmakeError::invalid_criteria("no rooms found with provided criteria")
        })
    }

    fn join_or_create(&self, name: &str) -> MatchmakeResult {
        self.definition(name)?;
        match self.join_existing(name) {
            Some(reservation) => Ok(reservation),
            None => self.create(name),
        }
    }

    fn join_by_id(&self, room_id: &str) -> MatchmakeResult {
        let room = self
            .room(room_id)
            .ok_or_else(|| MatchmakeError::invalid_room_id(room_id))?;
        self.reserve(&room).ok_or_else(|| {
            MatchmakeError::new(
                ErrorCode::MatchmakeInvalidCriteria,
                format!("room \"{room_id}\" is locked"),
            )
        })
    }
}

impl Default for LocalMatchmaker {
    fn default() -> Self {
        Self::new(LocalMatchmakerConfig::default())
    }
}

impl Matchmaker for LocalMatchmaker {
    type Room = LocalRoom;

    async fn get_room_by_id(&self, room_id: &str) -> Option<Arc<LocalRoom>> {
        self.room(room_id)
    }

    async fn invoke_method(&self, method: &str, room_name: &str, _body: Value) -> MatchmakeResult {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(MatchmakeError::unhandled("server is shutting down"));
        }
        debug!("Matchmake {method} \"{room_name}\"");

        match method {
            "create" => self.create(room_name),
            "join" => self.join(room_name),
            "joinOrCreate" => self.join_or_create(room_name),
            "joinById" => self.join_by_id(room_name),
            _ => Err(MatchmakeError::no_handler(method)),
        }
    }

    async fn get_available_rooms(&self, room_name: &str) -> MatchmakeResult {
        let listings: Vec<RoomListing> = self
            .rooms_named(room_name)
            .iter()
            .map(|room| room.listing())
            .filter(|listing| !listing.locked)
            .collect();
        serde_json::to_value(listings).map_err(|e| MatchmakeError::unhandled(e.to_string()))
    }

    fn is_gracefully_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }
}

fn reservation(room: RoomListing, session_id: &str) -> Value {
    json!({
        "room": room,
        "sessionId": session_id,
    })
}

fn generate_room_id() -> String {
    rand::rng()
        .sample_iter(&Alphanumeric)
        .take(ROOM_ID_LENGTH)
        .map(char::from)
        .collect()
}
