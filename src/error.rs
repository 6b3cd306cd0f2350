use axum::http::StatusCode;

use crate::rooms::PeerId;

pub type RelayResult<T> = Result<T, RelayError>;

#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("peer {0} is already in the room")]
    AlreadyJoined(PeerId),

    /// The peer's outbox is full; the frame was dropped.
    #[error("peer {0} is not keeping up, frame dropped")]
    PeerBacklogged(PeerId),

    #[error("peer {0} has disconnected")]
    PeerGone(PeerId),

    #[error("room {0:?} is closed")]
    RoomClosed(String),

    #[error("joining room {0:?} timed out")]
    JoinTimedOut(String),

    #[error("websocket handshake failed: {0}")]
    Handshake(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("could not encode message: {0}")]
    Encode(#[from] serde_json::Error),
}

impl RelayError {
    pub fn status(&self) -> StatusCode {
        match self {
            RelayError::Handshake(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}
