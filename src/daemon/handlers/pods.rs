//! Libpod-style pod routes

use crate::backend::pods::{PodActionResponse, PodCreateRequest, PodInspectResponse, PodListEntry};
use crate::daemon::error::ApiResult;
use crate::daemon::extract::{JsonBody, Params};
use crate::daemon::AppState;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use serde_json::{json, Value};

pub async fn create(
    State(state): State<AppState>,
    JsonBody(req): JsonBody<PodCreateRequest>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    let id = state.backend.create_pod(req)?;
    Ok((StatusCode::CREATED, Json(json!({ "Id": id }))))
}

pub async fn list(State(state): State<AppState>) -> Json<Vec<PodListEntry>> {
    Json(state.backend.list_pods())
}

pub async fn inspect(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<Json<PodInspectResponse>> {
    Ok(Json(state.backend.inspect_pod(&name)?))
}

pub async fn exists(State(state): State<AppState>, Path(name): Path<String>) -> ApiResult<StatusCode> {
    state.backend.pod_exists(&name)?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn start(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<Json<PodActionResponse>> {
    Ok(Json(state.backend.start_pod(&name).await?))
}

pub async fn stop(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<Json<PodActionResponse>> {
    Ok(Json(state.backend.stop_pod(&name).await?))
}

pub async fn kill(
    State(state): State<AppState>,
    Path(name): Path<String>,
    params: Params,
) -> ApiResult<Json<PodActionResponse>> {
    Ok(Json(state.backend.kill_pod(&name, params.get("signal")).await?))
}

pub async fn remove(
    State(state): State<AppState>,
    Path(name): Path<String>,
    params: Params,
) -> ApiResult<StatusCode> {
    state.backend.remove_pod(&name, params.flag("force")).await?;
    Ok(StatusCode::NO_CONTENT)
}
