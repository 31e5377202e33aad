//! # roomcast-server
//!
//! HTTP and WebSocket front end for roomcast.
//!
//! The REST API under `/api` manages rooms and invites; the WebSocket
//! endpoint carries live room traffic. Shared state lives in Redis and
//! Postgres when configured, so any number of processes can serve the same
//! rooms.

pub mod api;
pub mod auth;
pub mod backends;
pub mod config;
pub mod handlers;
pub mod metrics;
pub mod middleware;
pub mod redis;
pub mod repositories;
pub mod routes;

use anyhow::{Context, Result};
use roomcast_core::Hub;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

pub use config::Config;
pub use routes::{build_routes, AppState};

/// Run the server until a shutdown signal arrives.
///
/// # Errors
///
/// Returns an error if a backend cannot be reached or the listener fails to
/// bind.
pub async fn run(config: Config) -> Result<()> {
    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            error!(error = %e, "Failed to start metrics server");
        }
    }

    let connected = backends::connect(&config).await?;
    let hub = Arc::new(Hub::build(connected.backends, config.hub_settings()));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut bus_task = hub
        .start(shutdown_rx.clone())
        .await
        .context("Failed to subscribe to the room broker")?;
    let mut sweep_task = spawn_sweeper(
        hub.clone(),
        connected.housekeeping,
        Duration::from_secs(config.connections.sweep_interval_secs.max(1)),
        shutdown_rx.clone(),
    );

    let addr = config.bind_addr()?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;

    info!(%addr, node = %hub.stats().node_id, "roomcast listening");
    info!("WebSocket endpoint: ws://{}{}", addr, config.transport.websocket_path);

    let grace = Duration::from_millis(config.shutdown.grace_period_ms);
    let state = Arc::new(AppState::new(hub.clone(), config, shutdown_rx.clone()));
    let app = build_routes(state);

    let mut server_shutdown = shutdown_rx;
    let mut server = tokio::spawn(async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move {
            let _ = server_shutdown.wait_for(|stopping| *stopping).await;
        })
        .await
    });

    shutdown_signal().await;
    info!("Shutting down");
    shutdown_tx.send_replace(true);

    let drain = async {
        let closed = hub.shutdown().await;
        debug!(connections = closed, "Notified connections");

        match (&mut server).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!(error = %e, "Server error"),
            Err(e) => error!(error = %e, "Server task failed"),
        }
        join_quietly(&mut bus_task).await;
        join_quietly(&mut sweep_task).await;
    };

    if tokio::time::timeout(grace, drain).await.is_err() {
        warn!(grace_ms = grace.as_millis() as u64, "Shutdown grace period elapsed, forcing close");
        server.abort();
        bus_task.abort();
        sweep_task.abort();
    }

    info!("Shutdown complete");
    Ok(())
}

async fn join_quietly(task: &mut JoinHandle<()>) {
    if let Err(e) = task.await {
        warn!(error = %e, "Background task failed");
    }
}

/// Periodically reclaim idle connections and prune in-process stores.
fn spawn_sweeper(
    hub: Arc<Hub>,
    housekeeping: backends::Housekeeping,
    every: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick fires immediately.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let reclaimed = hub.reclaim_idle().await;
                    let purged = housekeeping.run();
                    if reclaimed > 0 || purged > 0 {
                        debug!(reclaimed, purged, "Sweep finished");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    })
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}
