pub mod appresult;
pub mod config;
pub mod error;
pub mod rooms;

use std::{sync::Arc, time::Duration};

use axum::{Router, extract::FromRef, http::StatusCode};
use tower_http::{timeout::TimeoutLayer, trace::TraceLayer};

pub use appresult::{AppError, AppResult};
pub use config::RelayConfig;
pub use error::{RelayError, RelayResult};

use rooms::{Clock, Registry, RoomSettings};

#[derive(Clone, FromRef)]
pub struct AppState {
    pub registry: Arc<Registry>,
    pub config: Arc<RelayConfig>,
}

impl AppState {
    pub fn new(config: RelayConfig, clock: Arc<dyn Clock>) -> Self {
        let registry = Registry::new(RoomSettings {
            clock,
            history_limit: config.history_limit,
            prune_empty_rooms: config.prune_empty_rooms,
        });

        Self {
            registry: Arc::new(registry),
            config: Arc::new(config),
        }
    }
}

pub fn app(state: AppState) -> Router {
    let handshake_timeout = state.config.handshake_timeout;

    Router::new()
        .merge(rooms::router())
        .with_state(state)
        .layer(handshake_timeout_layer(handshake_timeout))
        .layer(TraceLayer::new_for_http())
}

/// Requests that outlive `limit` are answered `408 Request Timeout`.
pub fn handshake_timeout_layer(limit: Duration) -> TimeoutLayer {
    TimeoutLayer::with_status_code(StatusCode::REQUEST_TIMEOUT, limit)
}
