//! Room Gateway - Local Rooms
//!
//! A single-process [`LocalMatchmaker`] for the gateway: named room
//! definitions, seat reservations that expire, and relay rooms that forward
//! every client's messages to the other clients in the room.

pub mod matchmaker;
pub mod room;

pub use matchmaker::{LocalMatchmaker, LocalMatchmakerConfig, RoomDefinition};
pub use room::{LocalRoom, RoomListing};
