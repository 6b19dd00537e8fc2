//! Operator endpoints: health, status, metrics and the resource registry

use crate::backend::system::{parse_max_age, CheckResult, ContainerBrief, StatusResponse};
use crate::backend::ResourceEntry;
use crate::daemon::error::ApiResult;
use crate::daemon::extract::Params;
use crate::daemon::metrics::MetricsSnapshot;
use crate::daemon::AppState;
use axum::extract::State;
use axum::Json;
use serde_json::{json, Value};

pub async fn healthz(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "component": "backend",
        "uptime_seconds": state.backend.uptime_secs(),
    }))
}

pub async fn status(State(state): State<AppState>) -> Json<StatusResponse> {
    Json(state.backend.status())
}

pub async fn containers_summary(State(state): State<AppState>) -> Json<Vec<ContainerBrief>> {
    Json(state.backend.containers_summary())
}

pub async fn metrics(State(state): State<AppState>) -> Json<MetricsSnapshot> {
    let status = state.backend.status();
    Json(MetricsSnapshot {
        uptime_seconds: status.uptime_seconds,
        containers: status.containers,
        active_resources: status.active_resources,
        ..state.metrics.snapshot()
    })
}

pub async fn check(State(state): State<AppState>) -> Json<Value> {
    let checks: Vec<CheckResult> = state.backend.checks();
    Json(json!({ "checks": checks }))
}

pub async fn reload(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    let changed = state.backend.reload_context()?;
    Ok(Json(json!({ "status": "ok", "changed": changed })))
}

/// All entries, or only active ones with `active=true`
pub async fn resources(State(state): State<AppState>, params: Params) -> Json<Vec<ResourceEntry>> {
    Json(state.backend.list_resources(params.flag("active")))
}

pub async fn orphaned(
    State(state): State<AppState>,
    params: Params,
) -> ApiResult<Json<Vec<ResourceEntry>>> {
    let max_age = parse_max_age(params.get("max_age"))?;
    Ok(Json(state.backend.orphaned_resources(max_age)))
}

pub async fn cleanup(State(state): State<AppState>, params: Params) -> ApiResult<Json<Value>> {
    let max_age = parse_max_age(params.get("max_age"))?;
    let cleaned = state.backend.cleanup_orphaned(max_age);
    Ok(Json(json!({ "cleaned": cleaned })))
}
