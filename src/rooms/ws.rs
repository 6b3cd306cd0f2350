use std::{net::SocketAddr, sync::Arc, time::Duration};

use axum::{
    debug_handler,
    extract::{
        ConnectInfo, Path, Query, State, WebSocketUpgrade,
        ws::{Message, WebSocket, rejection::WebSocketUpgradeRejection},
    },
    response::Response,
};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::{sync::mpsc, time::timeout};
use tracing::{debug, info, trace, warn};

use crate::{AppResult, RelayConfig, RelayError};

use super::{
    peer::{Peer, PeerId},
    registry::Registry,
};

const ANONYMOUS: &str = "Anonymous";

#[derive(Debug, Deserialize)]
pub(crate) struct JoinQuery {
    username: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Connected,
    Disconnected,
}

impl ConnectionState {
    pub fn can_become(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (self, next),
            (Connecting, Connected) | (Connecting, Disconnected) | (Connected, Disconnected)
        )
    }

    fn advance(&mut self, next: ConnectionState, peer: PeerId) {
        debug_assert!(self.can_become(next), "{self:?} -> {next:?}");
        trace!(%peer, from = ?*self, to = ?next, "connection state");
        *self = next;
    }
}

#[debug_handler(state = crate::AppState)]
pub(crate) async fn root_ws(
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    State(registry): State<Arc<Registry>>,
    State(config): State<Arc<RelayConfig>>,
    Query(query): Query<JoinQuery>,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> AppResult<Response> {
    upgrade(String::new(), remote, query, registry, config, ws)
}

#[debug_handler(state = crate::AppState)]
pub(crate) async fn endpoint_ws(
    Path(endpoint): Path<String>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    State(registry): State<Arc<Registry>>,
    State(config): State<Arc<RelayConfig>>,
    Query(query): Query<JoinQuery>,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> AppResult<Response> {
    upgrade(endpoint, remote, query, registry, config, ws)
}

fn upgrade(
    endpoint: String,
    remote: SocketAddr,
    JoinQuery { username }: JoinQuery,
    registry: Arc<Registry>,
    config: Arc<RelayConfig>,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> AppResult<Response> {
    let ws = ws.map_err(|rejection| {
        warn!(%endpoint, %remote, error = %rejection.body_text(), "rejected upgrade");
        RelayError::Handshake(rejection.body_text())
    })?;

    let username = username
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| ANONYMOUS.to_owned());

    Ok(ws
        .on_failed_upgrade(move |error| warn!(%remote, %error, "websocket upgrade failed"))
        .on_upgrade(move |socket| serve(socket, endpoint, remote, username, registry, config)))
}

/// Drives one connection from join to leave.
pub async fn serve(
    socket: WebSocket,
    endpoint: String,
    remote: SocketAddr,
    username: String,
    registry: Arc<Registry>,
    config: Arc<RelayConfig>,
) {
    let id = PeerId::new();
    let mut state = ConnectionState::Connecting;
    info!(%endpoint, peer = %id, %remote, %username, "connection accepted");

    let (sink, mut stream) = socket.split();
    let (outbox, rx) = mpsc::channel(config.outbox_capacity);
    let peer = Peer::new(id, username.as_str(), outbox);

    let room = match registry
        .join_within(&endpoint, peer, config.handshake_timeout)
        .await
    {
        Ok(room) => room,
        Err(error) => {
            warn!(%endpoint, peer = %id, %remote, %error, "join failed");
            state.advance(ConnectionState::Disconnected, id);
            return;
        }
    };
    state.advance(ConnectionState::Connected, id);

    let mut writer = tokio::spawn(write_frames(sink, rx, config.send_timeout, id));

    loop {
        tokio::select! {
            frame = stream.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    if let Err(error) = room.broadcast(id, text.as_str().to_owned()).await {
                        warn!(%endpoint, peer = %id, %error, "room unavailable");
                        break;
                    }
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => trace!(peer = %id, "ignoring non-text frame"),
                Some(Err(error)) => {
                    debug!(peer = %id, %error, "read failed");
                    break;
                }
            },
            _ = &mut writer => break,
        }
    }

    if let Err(error) = registry.leave(&room, id).await {
        debug!(%endpoint, peer = %id, %error, "leave after room closed");
    }
    writer.abort();

    state.advance(ConnectionState::Disconnected, id);
    info!(%endpoint, peer = %id, %remote, %username, "disconnected");
}

async fn write_frames(
    mut sink: futures_util::stream::SplitSink<WebSocket, Message>,
    mut rx: mpsc::Receiver<String>,
    send_timeout: Duration,
    id: PeerId,
) {
    while let Some(frame) = rx.recv().await {
        match timeout(send_timeout, sink.send(Message::Text(frame.into()))).await {
            Ok(Ok(())) => {}
            Ok(Err(error)) => {
                debug!(peer = %id, %error, "write failed");
                return;
            }
            Err(_) => {
                warn!(peer = %id, ?send_timeout, "write timed out, dropping connection");
                return;
            }
        }
    }

    // room dropped us
    let _ = sink.close().await;
}

#[cfg(test)]
mod tests {
    use super::ConnectionState::*;

    #[test]
    fn lifecycle_only_moves_forward() {
        assert!(Connecting.can_become(Connected));
        assert!(Connecting.can_become(Disconnected));
        assert!(Connected.can_become(Disconnected));

        assert!(!Connected.can_become(Connecting));
        assert!(!Disconnected.can_become(Connected));
        assert!(!Disconnected.can_become(Connecting));
        assert!(!Connected.can_become(Connected));
    }
}
