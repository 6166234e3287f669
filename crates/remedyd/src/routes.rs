//! API routes for remedyd.
//!
//! Inbound collaborator surface (report/resolved), the operator surface
//! (faults, manual heal, reset, stats), and admin config endpoints. Policy
//! violations are the only errors surfaced synchronously; everything else
//! is recorded in the attempt history and emitted via the notifier.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use remedy_common::{
    Config, Fault, FaultCategory, FaultDetail, FaultKey, HealingStats, HealthResponse,
    ManualHealResponse, ReportRequest, ReportResponse, ResolveRequest, VERSION,
};
use serde::Deserialize;
use tracing::{error, info};

use crate::config_watch;
use crate::server::AppState;

type AppStateArc = Arc<AppState>;

pub fn router(state: AppStateArc) -> Router {
    Router::new()
        .route("/v1/health", get(health))
        .route("/v1/fault/report", post(report_fault))
        .route("/v1/fault/resolved", post(report_resolved))
        .route("/v1/faults", get(list_faults))
        .route("/v1/fault/:category/:resource", get(fault_detail))
        .route("/v1/fault/:category/:resource/heal", post(manual_heal))
        .route("/v1/fault/:category/:resource/reset", post(reset_fault))
        .route(
            "/v1/fault/:category/:resource/suppress",
            post(suppress_fault),
        )
        .route("/v1/stats", get(stats))
        .route("/v1/config", get(get_config).post(put_config))
        .route("/v1/config/reload", post(reload_config))
        .with_state(state)
}

fn parse_key(category: &str, resource: &str) -> Result<FaultKey, (StatusCode, String)> {
    let category = FaultCategory::parse(category).ok_or_else(|| {
        (
            StatusCode::BAD_REQUEST,
            format!("unknown fault category '{}'", category),
        )
    })?;
    Ok(FaultKey::new(category, resource))
}

async fn health(State(state): State<AppStateArc>) -> Json<HealthResponse> {
    let cfg = config_watch::snapshot(&state.config).await;
    Json(HealthResponse {
        version: VERSION.to_string(),
        uptime_seconds: state.started_at.elapsed().as_secs(),
        enabled: cfg.healing.enabled,
        auto_execute: cfg.healing.auto_execute,
        open_faults: state.engine.open_fault_count().await,
        timestamp: Utc::now(),
    })
}

async fn report_fault(
    State(state): State<AppStateArc>,
    Json(req): Json<ReportRequest>,
) -> Result<Json<ReportResponse>, (StatusCode, String)> {
    if req.resource.trim().is_empty() {
        return Err((StatusCode::BAD_REQUEST, "resource must not be empty".into()));
    }
    let key = state
        .intake
        .report(req.category, req.resource, req.severity, req.evidence);
    Ok(Json(ReportResponse {
        fault_id: key.to_string(),
    }))
}

async fn report_resolved(
    State(state): State<AppStateArc>,
    Json(req): Json<ResolveRequest>,
) -> Json<ReportResponse> {
    let key = state.intake.report_resolved(req.category, req.resource);
    Json(ReportResponse {
        fault_id: key.to_string(),
    })
}

async fn list_faults(State(state): State<AppStateArc>) -> Json<Vec<Fault>> {
    Json(state.engine.list_active().await)
}

async fn fault_detail(
    State(state): State<AppStateArc>,
    Path((category, resource)): Path<(String, String)>,
) -> Result<Json<FaultDetail>, (StatusCode, String)> {
    let key = parse_key(&category, &resource)?;
    let fault = state
        .engine
        .get_fault(&key)
        .await
        .ok_or_else(|| (StatusCode::NOT_FOUND, format!("unknown fault {}", key)))?;
    let attempts = state
        .engine
        .history()
        .list_by_fault(&key)
        .await
        .map_err(|e| {
            error!("Failed to load attempts for {}: {}", key, e);
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        })?;
    Ok(Json(FaultDetail { fault, attempts }))
}

async fn manual_heal(
    State(state): State<AppStateArc>,
    Path((category, resource)): Path<(String, String)>,
) -> Result<(StatusCode, Json<ManualHealResponse>), (StatusCode, String)> {
    let key = parse_key(&category, &resource)?;
    match state.engine.trigger_manual_heal(&key).await {
        Ok(_handle) => Ok((
            StatusCode::ACCEPTED,
            Json(ManualHealResponse {
                accepted: true,
                reason: None,
            }),
        )),
        Err(reason) => Ok((
            StatusCode::CONFLICT,
            Json(ManualHealResponse {
                accepted: false,
                reason: Some(reason),
            }),
        )),
    }
}

async fn reset_fault(
    State(state): State<AppStateArc>,
    Path((category, resource)): Path<(String, String)>,
) -> Result<StatusCode, (StatusCode, String)> {
    let key = parse_key(&category, &resource)?;
    state
        .engine
        .reset_fault(&key)
        .await
        .map_err(|reason| (StatusCode::CONFLICT, reason))?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Deserialize)]
struct SuppressQuery {
    #[serde(default = "default_suppressed")]
    suppressed: bool,
}

fn default_suppressed() -> bool {
    true
}

async fn suppress_fault(
    State(state): State<AppStateArc>,
    Path((category, resource)): Path<(String, String)>,
    Query(query): Query<SuppressQuery>,
) -> Result<StatusCode, (StatusCode, String)> {
    let key = parse_key(&category, &resource)?;
    state
        .engine
        .set_suppressed(&key, query.suppressed)
        .await
        .map_err(|reason| (StatusCode::CONFLICT, reason))?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Deserialize)]
struct StatsQuery {
    #[serde(default = "default_window")]
    window_secs: u64,
}

fn default_window() -> u64 {
    86_400
}

async fn stats(
    State(state): State<AppStateArc>,
    Query(query): Query<StatsQuery>,
) -> Result<Json<HealingStats>, (StatusCode, String)> {
    let window = chrono::Duration::seconds(query.window_secs.min(i64::MAX as u64) as i64);
    state
        .engine
        .history()
        .stats(window)
        .await
        .map(Json)
        .map_err(|e| {
            error!("Failed to compute stats: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        })
}

async fn get_config(State(state): State<AppStateArc>) -> Json<Config> {
    Json(config_watch::snapshot(&state.config).await)
}

/// Admin snapshot replacement; the next retry decision sees it.
async fn put_config(
    State(state): State<AppStateArc>,
    Json(next): Json<Config>,
) -> StatusCode {
    info!("Configuration updated via admin API");
    config_watch::replace(&state.config, next).await;
    StatusCode::NO_CONTENT
}

/// Re-read the config file on demand. A parse failure keeps the current
/// snapshot.
async fn reload_config(
    State(state): State<AppStateArc>,
) -> Result<StatusCode, (StatusCode, String)> {
    match Config::load_from_path(remedy_common::config::CONFIG_PATH) {
        Ok(next) => {
            config_watch::replace(&state.config, next).await;
            Ok(StatusCode::NO_CONTENT)
        }
        Err(e) => {
            error!("Config reload via admin API failed: {:#}", e);
            Err((
                StatusCode::UNPROCESSABLE_ENTITY,
                format!("config reload failed, previous snapshot kept: {}", e),
            ))
        }
    }
}
