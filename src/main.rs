use std::{net::SocketAddr, sync::Arc};

use roomrelay::{AppState, RelayConfig, app, rooms::LocalClock};
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() -> anyhow::Result<()> {
    let config = RelayConfig::from_env()?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("roomrelay=info,tower_http=info")),
        )
        .init();

    // must run before the runtime starts its worker threads
    let clock = LocalClock::detect();

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(run(config, clock))
}

async fn run(config: RelayConfig, clock: LocalClock) -> anyhow::Result<()> {
    let state = AppState::new(config, Arc::new(clock));
    let registry = state.registry.clone();

    let listener = TcpListener::bind(state.config.bind_addr).await?;
    info!(addr = %listener.local_addr()?, offset = %clock.offset(), "relay listening");

    axum::serve(
        listener,
        app(state).into_make_service_with_connect_info::<SocketAddr>(),
    )
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutting down");
        })
        .await?;

    registry.clear().await;
    Ok(())
}
