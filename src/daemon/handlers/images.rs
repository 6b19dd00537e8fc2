//! Image and registry auth routes

use super::json_lines;
use crate::api::types::{
    AuthRequest, AuthResponse, Image, ImageDeleteResponse, ImageHistoryEntry, ImagePruneResponse,
    ImagePullRequest, ImageSummary,
};
use crate::daemon::error::{ApiError, ApiResult};
use crate::daemon::extract::{JsonBody, Params};
use crate::daemon::AppState;
use crate::image::BuildRequest;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::Response;
use axum::Json;
use bytes::Bytes;
use serde_json::Value;
use std::collections::HashMap;

const REGISTRY_AUTH_HEADER: &str = "x-registry-auth";

/// Stream pull progress as JSON lines; the body auth wins over the header
pub async fn pull(
    State(state): State<AppState>,
    headers: HeaderMap,
    JsonBody(req): JsonBody<ImagePullRequest>,
) -> ApiResult<Response> {
    if req.reference.is_empty() {
        return Err(ApiError::invalid("image reference is required"));
    }
    let auth = if req.auth.is_empty() {
        headers
            .get(REGISTRY_AUTH_HEADER)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string()
    } else {
        req.auth
    };
    let messages = state.backend.pull_image(&req.reference, &auth).await?;
    Ok(json_lines(&messages))
}

pub async fn inspect(State(state): State<AppState>, params: Params) -> ApiResult<Json<Image>> {
    Ok(Json(state.backend.inspect_image(params.get("name"))?))
}

pub async fn load(State(state): State<AppState>, body: Bytes) -> Json<Value> {
    Json(state.backend.load_image(&body))
}

pub async fn tag(State(state): State<AppState>, params: Params) -> ApiResult<StatusCode> {
    state
        .backend
        .tag_image(params.get("name"), params.get("repo"), params.get("tag"))?;
    Ok(StatusCode::CREATED)
}

pub async fn list(State(state): State<AppState>, params: Params) -> Json<Vec<ImageSummary>> {
    Json(state.backend.list_images(&params.filters()))
}

pub async fn remove(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<Json<Vec<ImageDeleteResponse>>> {
    Ok(Json(state.backend.remove_image(&name)?))
}

pub async fn history(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<Json<Vec<ImageHistoryEntry>>> {
    Ok(Json(state.backend.image_history(&name)?))
}

pub async fn prune(State(state): State<AppState>, params: Params) -> Json<ImagePruneResponse> {
    Json(state.backend.prune_images(&params.filters()))
}

pub async fn auth(
    State(state): State<AppState>,
    JsonBody(req): JsonBody<AuthRequest>,
) -> Json<AuthResponse> {
    Json(state.backend.login(req))
}

/// Build from a tar context; progress comes back as JSON lines
pub async fn build(
    State(state): State<AppState>,
    params: Params,
    body: Bytes,
) -> ApiResult<Response> {
    let build_args: HashMap<String, String> = match params.get("buildargs") {
        "" => HashMap::new(),
        raw => serde_json::from_str(raw)
            .map_err(|e| ApiError::invalid(format!("invalid buildargs: {}", e)))?,
    };
    let out = state
        .backend
        .build(BuildRequest {
            tag: params.get("t").to_string(),
            dockerfile: params.get("dockerfile").to_string(),
            build_args,
            context: body.to_vec(),
        })
        .await?;
    Ok(json_lines(&out.messages))
}
