use crate::api::types::{Volume, VolumeCreateRequest, VolumeListResponse, VolumePruneResponse};
use crate::daemon::error::ApiResult;
use crate::daemon::extract::{JsonBody, Params};
use crate::daemon::AppState;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;

pub async fn create(
    State(state): State<AppState>,
    JsonBody(req): JsonBody<VolumeCreateRequest>,
) -> (StatusCode, Json<Volume>) {
    (StatusCode::CREATED, Json(state.backend.create_volume(&req)))
}

pub async fn list(State(state): State<AppState>, params: Params) -> Json<VolumeListResponse> {
    Json(state.backend.list_volumes(&params.filters()))
}

pub async fn inspect(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<Json<Volume>> {
    Ok(Json(state.backend.inspect_volume(&name)?))
}

pub async fn remove(
    State(state): State<AppState>,
    Path(name): Path<String>,
    params: Params,
) -> ApiResult<StatusCode> {
    state.backend.remove_volume(&name, params.flag("force"))?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn prune(State(state): State<AppState>, params: Params) -> Json<VolumePruneResponse> {
    Json(state.backend.prune_volumes(&params.filters()))
}
