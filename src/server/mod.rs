//! REST surface over the orchestrator.

pub mod error;
pub mod routes;

use crate::core::orchestrator::DownloadOrchestrator;
use anyhow::Context;
use axum::routing::{delete, get, post};
use axum::Router;
use std::future::Future;
use tokio::net::TcpListener;
use tracing::{debug, info};

pub const APP_NAME: &str = "vidgrab";

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: DownloadOrchestrator,
    pub app_name: &'static str,
    pub version: &'static str,
}

impl AppState {
    pub fn new(orchestrator: DownloadOrchestrator) -> Self {
        Self { orchestrator, app_name: APP_NAME, version: env!("CARGO_PKG_VERSION") }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(routes::health))
        .route("/api/download", post(routes::submit))
        .route("/api/download/:id/cancel", post(routes::cancel))
        .route("/api/download/:id/pause", post(routes::pause))
        .route("/api/download/:id/resume", post(routes::resume))
        .route("/api/download/:id/priority", post(routes::priority))
        .route("/api/status", get(routes::status_all).delete(routes::clear_bulk))
        .route("/api/status/:id", get(routes::status_one).delete(routes::clear_one))
        .route("/api/queue", get(routes::queue_list))
        .route("/api/queue/reorder", post(routes::queue_reorder))
        .route("/api/queue/:id/remove", post(routes::queue_remove))
        .route("/api/history", get(routes::history))
        .with_state(state)
}

/// Binds the first free port in `start..=end`.
pub async fn bind_first_available(host: &str, start: u16, end: u16) -> anyhow::Result<TcpListener> {
    anyhow::ensure!(start <= end, "empty port range {}-{}", start, end);
    for port in start..=end {
        match TcpListener::bind((host, port)).await {
            Ok(listener) => return Ok(listener),
            Err(e) => debug!(port, error = %e, "port unavailable"),
        }
    }
    anyhow::bail!("no free port in {}-{} on {}", start, end, host)
}

pub async fn serve(
    listener: TcpListener,
    state: AppState,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let addr = listener.local_addr().context("local_addr")?;
    info!(%addr, port = addr.port(), "server listening");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await
        .context("server error")?;
    info!("server stopped");
    Ok(())
}
