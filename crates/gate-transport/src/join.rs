//! Join controller.
//!
//! Runs once per opened connection: validates the seat reservation named by
//! the upgrade URL and hands the client to its room. Any failure is logged,
//! reported to the client as an error frame, and ends with the socket being
//! terminated.

use std::sync::Arc;

use gate_protocol::{CloseCode, MatchmakeError, MatchmakeResult};
use tracing::{debug, error};

use crate::client::{ClientConnection, ConnectionState};
use crate::context::JoinRequest;
use crate::matchmaker::{Matchmaker, Room};

/// Validate the reservation and call the room's `on_join`.
pub async fn join_room<M: Matchmaker>(
    matchmaker: &M,
    client: &Arc<ClientConnection>,
) -> MatchmakeResult<()> {
    let request =
        JoinRequest::from_context(client.context()).ok_or_else(MatchmakeError::seat_expired)?;

    let room = matchmaker
        .get_room_by_id(&request.room_id)
        .await
        .ok_or_else(MatchmakeError::seat_expired)?;

    let reserved = room
        .has_reserved_seat(&request.session_id, request.reconnection_token.as_deref())
        .await;
    if !reserved {
        return Err(MatchmakeError::seat_expired());
    }

    debug!(
        "Connection {} joining room {} (session {})",
        client.id(),
        room.room_id(),
        request.session_id
    );
    room.on_join(client.clone(), client.context_arc()).await
}

/// Drive the join sequence for a freshly opened connection.
pub async fn run_join<M: Matchmaker>(
    matchmaker: Arc<M>,
    client: Arc<ClientConnection>,
) -> ConnectionState {
    client.set_state(ConnectionState::Joining);

    match join_room(matchmaker.as_ref(), &client).await {
        Ok(()) => {
            client.set_state(ConnectionState::Joined);
        }
        Err(e) => {
            error!(
                "Join rejected for connection {} ({}): {e}",
                client.id(),
                client.context().url
            );
            client.error(e.code(), &e.message);
            client.terminate(CloseCode::WITH_ERROR);
            client.set_state(ConnectionState::Rejected);
        }
    }
    client.state()
}
