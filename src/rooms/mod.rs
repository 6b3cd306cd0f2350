mod msg;
mod peer;
mod registry;
mod room;
mod ws;

use axum::{Router, routing::get};

use crate::AppState;

pub use msg::{Clock, LocalClock, MessageRecord, format_timestamp};
pub use peer::{Peer, PeerId};
pub use registry::{Registry, RoomSettings};
pub use room::{Room, RoomHandle};
pub use ws::ConnectionState;

/// `GET /{endpoint}?username=..` upgrades into that endpoint's room.
/// `GET /` is the room with the empty name.
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(ws::root_ws))
        .route("/{*endpoint}", get(ws::endpoint_ws))
}
