//! HTTP server wiring for remedyd.

use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::config_watch::SharedConfig;
use crate::intake::FaultIntake;
use crate::orchestrator::Engine;
use crate::routes;

/// Shared state handed to every route handler.
pub struct AppState {
    pub engine: Arc<Engine>,
    pub config: SharedConfig,
    pub intake: FaultIntake,
    pub started_at: Instant,
}

/// Serve the API until the process shuts down.
pub async fn serve(state: Arc<AppState>, listen: &str) -> Result<()> {
    let app = routes::router(state).layer(TraceLayer::new_for_http());

    let listener = TcpListener::bind(listen)
        .await
        .with_context(|| format!("Failed to bind {}", listen))?;
    info!("API listening on {}", listen);

    axum::serve(listener, app)
        .await
        .context("API server terminated")?;
    Ok(())
}
