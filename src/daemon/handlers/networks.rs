//! Network routes

use crate::api::types::{
    Network, NetworkConnectRequest, NetworkCreateRequest, NetworkCreateResponse,
    NetworkDisconnectRequest, NetworkPruneResponse,
};
use crate::daemon::error::ApiResult;
use crate::daemon::extract::{JsonBody, Params};
use crate::daemon::AppState;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;

pub async fn create(
    State(state): State<AppState>,
    JsonBody(req): JsonBody<NetworkCreateRequest>,
) -> ApiResult<(StatusCode, Json<NetworkCreateResponse>)> {
    let resp = state.backend.create_network(&req).await?;
    Ok((StatusCode::CREATED, Json(resp)))
}

pub async fn list(State(state): State<AppState>, params: Params) -> ApiResult<Json<Vec<Network>>> {
    Ok(Json(state.backend.list_networks(&params.filters()).await?))
}

pub async fn inspect(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Network>> {
    Ok(Json(state.backend.inspect_network(&id).await?))
}

pub async fn remove(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<StatusCode> {
    state.backend.remove_network(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn connect(
    State(state): State<AppState>,
    Path(id): Path<String>,
    JsonBody(req): JsonBody<NetworkConnectRequest>,
) -> ApiResult<StatusCode> {
    state
        .backend
        .connect_network(&id, &req.container, req.endpoint_config.as_ref())
        .await?;
    Ok(StatusCode::OK)
}

pub async fn disconnect(
    State(state): State<AppState>,
    Path(id): Path<String>,
    JsonBody(req): JsonBody<NetworkDisconnectRequest>,
) -> ApiResult<StatusCode> {
    state.backend.disconnect_network(&id, &req.container).await?;
    Ok(StatusCode::OK)
}

pub async fn prune(
    State(state): State<AppState>,
    params: Params,
) -> ApiResult<Json<NetworkPruneResponse>> {
    Ok(Json(state.backend.prune_networks(&params.filters()).await?))
}
