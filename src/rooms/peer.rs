use std::{collections::VecDeque, fmt};

use tokio::sync::mpsc::{self, error::TrySendError};
use uuid::Uuid;

use crate::{RelayError, RelayResult};

use super::msg;

/// Identifies one live connection. Never reused: a reconnect gets a new id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PeerId(Uuid);

impl PeerId {
    /// v7 ids sort by creation time, so rooms iterate peers in join order.
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for PeerId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}

/// A connected session: who it is, where its frames go, and what it has said.
#[derive(Debug, Clone)]
pub struct Peer {
    pub(crate) id: PeerId,
    pub(crate) username: String,
    outbox: mpsc::Sender<String>,
    history: VecDeque<String>,
}

impl Peer {
    pub fn new(id: PeerId, username: impl Into<String>, outbox: mpsc::Sender<String>) -> Self {
        Self {
            id,
            username: username.into(),
            outbox,
            history: VecDeque::new(),
        }
    }

    pub fn id(&self) -> PeerId {
        self.id
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    /// False once the connection's writer has gone away.
    pub fn is_open(&self) -> bool {
        !self.outbox.is_closed()
    }

    /// Queues a frame without waiting.
    pub fn deliver(&self, frame: String) -> RelayResult<()> {
        self.outbox.try_send(frame).map_err(|e| match e {
            TrySendError::Full(_) => RelayError::PeerBacklogged(self.id),
            TrySendError::Closed(_) => RelayError::PeerGone(self.id),
        })
    }

    /// Appends an encoded record this peer sent, dropping the oldest past `limit`.
    pub fn remember(&mut self, record: String, limit: Option<usize>) {
        self.history.push_back(record);
        if let Some(limit) = limit {
            while self.history.len() > limit {
                self.history.pop_front();
            }
        }
    }

    pub fn history(&self) -> impl ExactSizeIterator<Item = &String> {
        self.history.iter()
    }

    /// The frame a newcomer receives for this peer. `[]` if it has said nothing.
    pub fn replay_frame(&self) -> String {
        msg::replay_frame(&self.history)
    }
}
