//! World Sync Server entry point
//!
//! Loads configuration, starts the world tick loop, and serves:
//! - WebSocket sessions and replication diagnostics over HTTP
//! - Optionally, raw TCP sessions speaking line-delimited JSON

use std::net::SocketAddr;

use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use world_sync_server::app::{run_session, AppState};
use world_sync_server::config::Config;
use world_sync_server::http::build_router;
use world_sync_server::net::tcp;
use world_sync_server::util::time::init_server_time;
use world_sync_server::world::{SandboxWorld, WorldHost};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    // Load configuration
    let config = Config::from_env()?;

    // Initialize tracing
    init_tracing(&config.log_level);

    // Initialize server time tracking
    init_server_time();

    info!("Starting World Sync Server");
    info!(
        tick_rate = config.tick_rate,
        max_connections = config.max_connections,
        seed = config.world_seed,
        "Server address: {}",
        config.server_addr
    );

    // Create application state
    let (state, world_rx) = AppState::new(config.clone());

    // Spawn the world tick loop
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let host = WorldHost::new(
        SandboxWorld::new(config.world_seed),
        state.services.clone(),
        state.pool.clone(),
        world_rx,
        config.baseline_history,
    );
    let world = tokio::spawn(host.run(shutdown_rx));

    // Raw TCP listener, if configured
    if let Some(tcp_addr) = config.tcp_addr {
        let listener = TcpListener::bind(tcp_addr).await?;
        info!("Raw TCP listening on {}", tcp_addr);

        let tcp_state = state.clone();
        tokio::spawn(tcp::serve(listener, move |transport, events, _peer| {
            let state = tcp_state.clone();
            tokio::spawn(run_session(state, transport, events));
        }));
    }

    // Build router
    let router = build_router(state);

    // Start server
    let addr: SocketAddr = config.server_addr;
    let listener = TcpListener::bind(addr).await?;

    info!("Server listening on {}", addr);
    info!("Health check: http://{}/health", addr);
    info!("WebSocket endpoint: ws://{}/ws", addr);

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Stop the tick loop once HTTP has drained
    let _ = shutdown_tx.send(true);
    world.await?;

    info!("Server shutdown complete");
    Ok(())
}

/// Initialize tracing/logging
fn init_tracing(log_level: &str) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .init();
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, starting graceful shutdown");
        }
        _ = terminate => {
            info!("Received terminate signal, starting graceful shutdown");
        }
    }
}
