use anyhow::Context;
use axum::{routing::get, Router};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::info;

use super::routes;
use super::state::DashboardState;
use super::websocket;
use crate::session::SessionRegistry;

pub fn router(state: Arc<DashboardState>) -> Router {
    Router::new()
        // App page and browser runtime
        .route("/", get(routes::index))
        .route("/numerous.js", get(routes::client_runtime))
        // JSON API endpoints
        .route("/api/widgets", get(routes::get_widgets))
        .route("/api/sessions", get(routes::get_sessions))
        .route("/api/describe", get(routes::describe))
        .route(
            "/api/widgets/:widget_id/traits/:trait_name",
            get(routes::get_trait).put(routes::put_trait),
        )
        // WebSocket relay
        .route("/ws/:client_id/:session_id", get(websocket::ws_handler))
        .with_state(state)
}

/// Serve the app on `addr` until Ctrl-C, then stop every session.
pub async fn start_dashboard(state: Arc<DashboardState>, addr: &str) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;
    info!("serving on http://{}", listener.local_addr()?);

    let reaper = spawn_reaper(Arc::clone(&state.registry), state.idle_timeout);
    let registry = Arc::clone(&state.registry);

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutting down");
            // Stopping the sessions closes their websockets.
            registry.shutdown_all().await;
        })
        .await
        .context("Server error")?;

    if let Some(reaper) = reaper {
        reaper.abort();
    }
    Ok(())
}

/// Periodically tear down sessions nobody connected to. Disabled when
/// `max_idle` is zero.
fn spawn_reaper(registry: Arc<SessionRegistry>, max_idle: Duration) -> Option<JoinHandle<()>> {
    if max_idle.is_zero() {
        return None;
    }
    let period = (max_idle / 4).max(Duration::from_secs(1));
    Some(tokio::spawn(async move {
        let mut tick = tokio::time::interval(period);
        loop {
            tick.tick().await;
            let reaped = registry.reap_idle(max_idle).await;
            if reaped > 0 {
                info!(reaped, "reaped idle sessions");
            }
        }
    }))
}
