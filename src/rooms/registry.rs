use std::{collections::HashMap, sync::Arc, time::Duration};

use tokio::{sync::Mutex, time::timeout};
use tracing::{debug, info, warn};

use crate::{RelayError, RelayResult};

use super::{
    msg::Clock,
    peer::{Peer, PeerId},
    room::{Room, RoomHandle},
};

/// Settings every room in a registry is built with.
#[derive(Clone)]
pub struct RoomSettings {
    pub clock: Arc<dyn Clock>,
    pub history_limit: Option<usize>,
    pub prune_empty_rooms: bool,
}

/// Maps endpoint names to their rooms.
///
/// The lock only covers the map. Rooms decide for themselves whether they are
/// empty enough to close, and a join that reaches a closed room retries
/// against a fresh one.
pub struct Registry {
    rooms: Mutex<HashMap<String, RoomHandle>>,
    settings: RoomSettings,
}

impl Registry {
    pub fn new(settings: RoomSettings) -> Self {
        Self {
            rooms: Mutex::new(HashMap::new()),
            settings,
        }
    }

    pub async fn get_or_create(&self, endpoint: &str) -> RoomHandle {
        let mut rooms = self.rooms.lock().await;
        self.get_or_create_locked(&mut rooms, endpoint)
    }

    fn get_or_create_locked(&self, rooms: &mut HashMap<String, RoomHandle>, endpoint: &str) -> RoomHandle {
        if let Some(room) = rooms.get(endpoint) {
            return room.clone();
        }

        debug!(endpoint, "creating room");
        let room = RoomHandle::spawn(Room::new(
            endpoint,
            self.settings.clock.clone(),
            self.settings.history_limit,
        ));
        rooms.insert(endpoint.to_owned(), room.clone());
        room
    }

    /// Finds or creates the endpoint's room and joins `peer` to it.
    pub async fn join(&self, endpoint: &str, peer: Peer) -> RelayResult<RoomHandle> {
        loop {
            let room = self.get_or_create(endpoint).await;
            match room.join(peer.clone()).await {
                Ok(()) => return Ok(room),
                Err(RelayError::RoomClosed(_)) => {
                    debug!(endpoint, peer = %peer.id, "room closed under join, retrying");
                    self.discard(&room).await;
                }
                Err(error) => return Err(error),
            }
        }
    }

    /// [`Registry::join`], giving up after `limit`. A join still queued in the
    /// room when time runs out is taken back out again.
    pub async fn join_within(&self, endpoint: &str, peer: Peer, limit: Duration) -> RelayResult<RoomHandle> {
        let id = peer.id;
        match timeout(limit, self.join(endpoint, peer)).await {
            Ok(result) => result,
            Err(_) => {
                warn!(endpoint, peer = %id, ?limit, "join timed out");
                if let Err(error) = self.forget(endpoint, id).await {
                    debug!(endpoint, peer = %id, %error, "cleanup after join timeout");
                }
                Err(RelayError::JoinTimedOut(endpoint.to_owned()))
            }
        }
    }

    /// Removes the peer, and the room with it if nobody is left.
    pub async fn leave(&self, room: &RoomHandle, id: PeerId) -> RelayResult<()> {
        let remaining = room.leave(id).await?;
        if remaining > 0 || !self.settings.prune_empty_rooms {
            return Ok(());
        }

        // a join may have slipped in since the leave
        if room.close_if_empty().await {
            self.discard(room).await;
            debug!(endpoint = room.endpoint(), "pruned empty room");
        }
        Ok(())
    }

    /// [`Registry::leave`] by endpoint name, for peers with no handle to their room.
    pub async fn forget(&self, endpoint: &str, id: PeerId) -> RelayResult<()> {
        let Some(room) = self.rooms.lock().await.get(endpoint).cloned() else {
            return Ok(());
        };
        self.leave(&room, id).await
    }

    /// Drops `room` from the map unless a newer room already took its name.
    async fn discard(&self, room: &RoomHandle) {
        let mut rooms = self.rooms.lock().await;
        if rooms.get(room.endpoint()).is_some_and(|current| current.same_room(room)) {
            rooms.remove(room.endpoint());
        }
    }

    pub async fn peer_count(&self, endpoint: &str) -> Option<usize> {
        let room = self.rooms.lock().await.get(endpoint).cloned()?;
        room.len().await.ok()
    }

    pub async fn endpoints(&self) -> Vec<String> {
        let mut endpoints: Vec<_> = self.rooms.lock().await.keys().cloned().collect();
        endpoints.sort();
        endpoints
    }

    /// Closes every room, disconnecting all peers.
    pub async fn clear(&self) {
        let rooms: Vec<_> = self.rooms.lock().await.drain().collect();
        info!(rooms = rooms.len(), "closing all rooms");
        for (_, room) in rooms {
            room.close().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use futures_util::FutureExt;
    use tokio::sync::mpsc;

    use super::*;
    use crate::rooms::msg::LocalClock;

    fn registry(prune_empty_rooms: bool) -> Registry {
        Registry::new(RoomSettings {
            clock: Arc::new(LocalClock::utc()),
            history_limit: None,
            prune_empty_rooms,
        })
    }

    fn peer(username: &str) -> (Peer, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(16);
        (Peer::new(PeerId::new(), username, tx), rx)
    }

    #[tokio::test]
    async fn same_name_same_room() {
        let registry = registry(true);
        let a = registry.get_or_create("lobby").await;
        let b = registry.get_or_create("lobby").await;
        let c = registry.get_or_create("other").await;

        assert!(a.same_room(&b));
        assert!(!a.same_room(&c));
        assert_eq!(registry.endpoints().await, ["lobby", "other"]);
    }

    #[tokio::test]
    async fn endpoints_are_isolated() {
        let registry = registry(true);
        let (a1, _rx_a1) = peer("A1");
        let (a2, mut rx_a2) = peer("A2");
        let (b1, mut rx_b1) = peer("B1");
        let id_a1 = a1.id();

        let room_a = registry.join("a", a1).await.unwrap();
        registry.join("a", a2).await.unwrap();
        registry.join("b", b1).await.unwrap();

        assert_eq!(rx_a2.try_recv().unwrap(), "[]");

        room_a.broadcast(id_a1, "only for a".to_owned()).await.unwrap();
        assert_eq!(registry.peer_count("a").await, Some(2));

        assert!(rx_a2.try_recv().unwrap().contains("only for a"));
        assert!(rx_b1.try_recv().is_err());

        let (b2, mut rx_b2) = peer("B2");
        registry.join("b", b2).await.unwrap();
        assert_eq!(registry.peer_count("b").await, Some(2));
        assert_eq!(rx_b2.try_recv().unwrap(), "[]");
        assert!(rx_b2.try_recv().is_err());
    }

    #[tokio::test]
    async fn empty_rooms_are_pruned() {
        let registry = registry(true);
        let (u1, _rx1) = peer("U1");
        let (u2, _rx2) = peer("U2");
        let (id1, id2) = (u1.id(), u2.id());

        let room = registry.join("lobby", u1).await.unwrap();
        registry.join("lobby", u2).await.unwrap();

        registry.leave(&room, id1).await.unwrap();
        assert_eq!(registry.peer_count("lobby").await, Some(1));

        registry.leave(&room, id2).await.unwrap();
        assert_eq!(registry.peer_count("lobby").await, None);
        assert!(registry.endpoints().await.is_empty());
        assert!(matches!(room.len().await, Err(RelayError::RoomClosed(_))));

        let fresh = registry.get_or_create("lobby").await;
        assert!(!fresh.same_room(&room));
    }

    #[tokio::test]
    async fn empty_rooms_can_be_kept() {
        let registry = registry(false);
        let (u1, _rx1) = peer("U1");
        let id1 = u1.id();

        let room = registry.join("lobby", u1).await.unwrap();
        registry.leave(&room, id1).await.unwrap();

        assert_eq!(registry.peer_count("lobby").await, Some(0));
        assert!(registry.get_or_create("lobby").await.same_room(&room));
    }

    #[tokio::test]
    async fn clear_disconnects_everyone() {
        let registry = registry(true);
        let (u1, mut rx1) = peer("U1");
        let (u2, mut rx2) = peer("U2");
        registry.join("a", u1).await.unwrap();
        registry.join("b", u2).await.unwrap();

        registry.clear().await;

        assert!(registry.endpoints().await.is_empty());
        assert_eq!(rx1.recv().await, None);
        assert_eq!(rx2.recv().await, None);
    }

    #[tokio::test]
    async fn duplicate_join_leaves_room_untouched() {
        let registry = registry(true);
        let (tx, _rx) = mpsc::channel(4);
        let id = PeerId::new();

        registry.join("lobby", Peer::new(id, "U1", tx.clone())).await.unwrap();
        let err = registry.join("lobby", Peer::new(id, "U1", tx)).await.unwrap_err();
        assert!(matches!(err, RelayError::AlreadyJoined(dup) if dup == id));
        assert_eq!(registry.peer_count("lobby").await, Some(1));
    }

    #[tokio::test]
    async fn abandoned_join_is_taken_back_out() {
        let registry = registry(true);
        let (ghost, _rx_ghost) = peer("ghost");
        let id = ghost.id();

        // queued in the room, but nobody waits for the reply
        assert!(registry.join("lobby", ghost).now_or_never().is_none());

        registry.forget("lobby", id).await.unwrap();
        assert_eq!(registry.peer_count("lobby").await, None);
        assert!(registry.endpoints().await.is_empty());
    }

    #[tokio::test]
    async fn abandoned_join_does_not_keep_the_room_alive() {
        let registry = registry(true);
        let (ghost, rx_ghost) = peer("ghost");
        assert!(registry.join("lobby", ghost).now_or_never().is_none());
        drop(rx_ghost);

        let (u1, _rx1) = peer("U1");
        let id1 = u1.id();
        let room = registry.join("lobby", u1).await.unwrap();
        assert_eq!(registry.peer_count("lobby").await, Some(1));

        registry.leave(&room, id1).await.unwrap();
        assert_eq!(registry.peer_count("lobby").await, None);
        assert!(registry.endpoints().await.is_empty());
    }

    #[tokio::test]
    async fn join_within_gives_up_and_cleans_up() {
        let registry = Arc::new(registry(true));
        let (ghost, _rx_ghost) = peer("ghost");

        let stalled = registry.rooms.lock().await;
        let join = tokio::spawn({
            let registry = registry.clone();
            async move {
                registry
                    .join_within("lobby", ghost, Duration::from_millis(20))
                    .await
            }
        });
        tokio::time::sleep(Duration::from_millis(100)).await;
        drop(stalled);

        let err = join.await.unwrap().unwrap_err();
        assert!(matches!(err, RelayError::JoinTimedOut(endpoint) if endpoint == "lobby"));
        assert!(registry.endpoints().await.is_empty());

        let (u1, _rx1) = peer("U1");
        registry
            .join_within("lobby", u1, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(registry.peer_count("lobby").await, Some(1));
    }

    #[tokio::test]
    async fn join_replaces_a_room_that_closed_under_it() {
        let registry = registry(true);
        let (u1, _rx1) = peer("U1");
        let id1 = u1.id();

        let stale = registry.join("lobby", u1).await.unwrap();
        assert_eq!(stale.leave(id1).await.unwrap(), 0);
        assert!(stale.close_if_empty().await);
        // the map still points at the closed room

        let (u2, _rx2) = peer("U2");
        let fresh = registry.join("lobby", u2).await.unwrap();
        assert!(!fresh.same_room(&stale));
        assert_eq!(registry.peer_count("lobby").await, Some(1));
        assert_eq!(registry.endpoints().await, ["lobby"]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn churn_leaves_no_rooms_behind() {
        let registry = Arc::new(registry(true));

        let tasks: Vec<_> = (0..64)
            .map(|i| {
                let registry = registry.clone();
                tokio::spawn(async move {
                    let (peer, _rx) = peer(&format!("U{i}"));
                    let id = peer.id();
                    let room = registry.join("busy", peer).await.unwrap();
                    room.broadcast(id, "hello".to_owned()).await.unwrap();
                    registry.leave(&room, id).await.unwrap();
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(registry.peer_count("busy").await, None);
        assert!(registry.endpoints().await.is_empty());
    }
}
