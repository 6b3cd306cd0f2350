use std::{collections::BTreeMap, sync::Arc};

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, trace, warn};

use crate::{RelayError, RelayResult};

use super::{
    msg::{Clock, MessageRecord},
    peer::{Peer, PeerId},
};

const MAILBOX: usize = 1024;

/// Everyone connected to one endpoint.
///
/// Owned by a single task (see [`RoomHandle`]); nothing here locks.
pub struct Room {
    endpoint: String,
    peers: BTreeMap<PeerId, Peer>,
    clock: Arc<dyn Clock>,
    history_limit: Option<usize>,
}

impl Room {
    pub fn new(endpoint: impl Into<String>, clock: Arc<dyn Clock>, history_limit: Option<usize>) -> Self {
        Self {
            endpoint: endpoint.into(),
            peers: BTreeMap::new(),
            clock,
            history_limit,
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn peer(&self, id: PeerId) -> Option<&Peer> {
        self.peers.get(&id)
    }

    /// Drops peers whose connection went away without leaving, such as a
    /// join that completed after its connection gave up waiting.
    pub fn evict_closed(&mut self) -> usize {
        let before = self.peers.len();
        self.peers.retain(|id, peer| {
            let open = peer.is_open();
            if !open {
                debug!(endpoint = %self.endpoint, peer = %id, "evicting closed peer");
            }
            open
        });
        before - self.peers.len()
    }

    /// Replays every other open peer's history to the newcomer, one frame per
    /// peer (`[]` for peers that have said nothing), then registers it.
    pub fn join(&mut self, peer: Peer) -> RelayResult<()> {
        if self.peers.contains_key(&peer.id) {
            return Err(RelayError::AlreadyJoined(peer.id));
        }
        self.evict_closed();

        let mut replayed = 0;
        for other in self.peers.values() {
            match peer.deliver(other.replay_frame()) {
                Ok(()) => replayed += 1,
                Err(error) => warn!(
                    endpoint = %self.endpoint, peer = %peer.id, from = %other.id, %error,
                    "replay frame dropped"
                ),
            }
        }

        info!(
            endpoint = %self.endpoint, peer = %peer.id, username = %peer.username,
            replayed, present = self.peers.len(), "peer joined"
        );
        self.peers.insert(peer.id, peer);
        Ok(())
    }

    /// Sends `content` from `from` to every other open peer, then files it in
    /// the sender's history. Returns how many peers it was queued for.
    pub fn broadcast(&mut self, from: PeerId, content: String) -> RelayResult<usize> {
        let Some(sender) = self.peers.get(&from) else {
            debug!(endpoint = %self.endpoint, peer = %from, "broadcast from a peer that already left");
            return Ok(0);
        };

        let frame = MessageRecord::new(sender.username.as_str(), self.clock.now(), content).encode()?;

        let mut delivered = 0;
        for (id, peer) in &self.peers {
            if *id == from || !peer.is_open() {
                continue;
            }
            match peer.deliver(frame.clone()) {
                Ok(()) => delivered += 1,
                Err(error) => warn!(endpoint = %self.endpoint, peer = %id, %error, "delivery failed"),
            }
        }
        trace!(endpoint = %self.endpoint, peer = %from, delivered, "broadcast");

        if let Some(sender) = self.peers.get_mut(&from) {
            sender.remember(frame, self.history_limit);
        }
        Ok(delivered)
    }

    /// Removes the peer and drops its history. Returns whether it was present.
    pub fn leave(&mut self, id: PeerId) -> bool {
        let removed = self.peers.remove(&id);
        self.evict_closed();
        let Some(peer) = removed else {
            return false;
        };
        info!(
            endpoint = %self.endpoint, peer = %id, username = %peer.username,
            remaining = self.peers.len(), "peer left"
        );
        true
    }
}

enum Command {
    Join {
        peer: Peer,
        reply: oneshot::Sender<RelayResult<()>>,
    },
    Broadcast {
        from: PeerId,
        content: String,
    },
    Leave {
        id: PeerId,
        reply: oneshot::Sender<usize>,
    },
    Len {
        reply: oneshot::Sender<usize>,
    },
    CloseIfEmpty {
        reply: oneshot::Sender<bool>,
    },
    Close,
}

/// Cheap, cloneable address of a running [`Room`].
#[derive(Debug, Clone)]
pub struct RoomHandle {
    endpoint: Arc<str>,
    tx: mpsc::Sender<Command>,
}

impl RoomHandle {
    /// Moves the room onto its own task. The task ends on [`RoomHandle::close`]
    /// or once every handle is dropped.
    pub fn spawn(room: Room) -> Self {
        let (tx, rx) = mpsc::channel(MAILBOX);
        let handle = Self {
            endpoint: Arc::from(room.endpoint()),
            tx,
        };
        tokio::spawn(run(room, rx));
        handle
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn same_room(&self, other: &RoomHandle) -> bool {
        self.tx.same_channel(&other.tx)
    }

    pub async fn join(&self, peer: Peer) -> RelayResult<()> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Join { peer, reply }).await?;
        rx.await.map_err(|_| self.closed())?
    }

    /// Queued behind earlier commands, so one connection's messages keep their order.
    pub async fn broadcast(&self, from: PeerId, content: String) -> RelayResult<()> {
        self.send(Command::Broadcast { from, content }).await
    }

    /// Returns how many peers remain.
    pub async fn leave(&self, id: PeerId) -> RelayResult<usize> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Leave { id, reply }).await?;
        rx.await.map_err(|_| self.closed())
    }

    pub async fn len(&self) -> RelayResult<usize> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Len { reply }).await?;
        rx.await.map_err(|_| self.closed())
    }

    /// Stops the room only if nobody is in it. Commands queued behind this one
    /// fail with [`RelayError::RoomClosed`] when it returns `true`.
    pub async fn close_if_empty(&self) -> bool {
        let (reply, rx) = oneshot::channel();
        if self.send(Command::CloseIfEmpty { reply }).await.is_err() {
            return false;
        }
        rx.await.unwrap_or(false)
    }

    /// Stops the room, dropping every peer still in it.
    pub async fn close(&self) {
        let _ = self.tx.send(Command::Close).await;
    }

    async fn send(&self, command: Command) -> RelayResult<()> {
        self.tx.send(command).await.map_err(|_| self.closed())
    }

    fn closed(&self) -> RelayError {
        RelayError::RoomClosed(self.endpoint.to_string())
    }
}

async fn run(mut room: Room, mut rx: mpsc::Receiver<Command>) {
    debug!(endpoint = %room.endpoint, "room opened");

    while let Some(command) = rx.recv().await {
        match command {
            Command::Join { peer, reply } => {
                let _ = reply.send(room.join(peer));
            }
            Command::Broadcast { from, content } => {
                if let Err(error) = room.broadcast(from, content) {
                    warn!(endpoint = %room.endpoint, peer = %from, %error, "broadcast failed");
                }
            }
            Command::Leave { id, reply } => {
                room.leave(id);
                let _ = reply.send(room.len());
            }
            Command::Len { reply } => {
                room.evict_closed();
                let _ = reply.send(room.len());
            }
            Command::CloseIfEmpty { reply } => {
                room.evict_closed();
                let empty = room.is_empty();
                let _ = reply.send(empty);
                if empty {
                    break;
                }
            }
            Command::Close => break,
        }
    }

    debug!(endpoint = %room.endpoint, peers = room.len(), "room closed");
}
