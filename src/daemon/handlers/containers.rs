//! Container routes

use super::streaming;
use crate::api::types::{
    Container, ContainerChangeItem, ContainerCommitResponse, ContainerConfig,
    ContainerCreateRequest, ContainerCreateResponse, ContainerPruneResponse, ContainerSummary,
    ContainerTopResponse, ContainerUpdateRequest, ContainerUpdateResponse, ContainerWaitResponse,
};
use crate::backend::containers::{CommitOptions, ListOptions, LogOptions};
use crate::backend::Backend;
use crate::daemon::error::{ApiError, ApiResult};
use crate::daemon::extract::{JsonBody, Params};
use crate::daemon::hijack::{self, stream_content_type};
use crate::daemon::AppState;
use crate::error::SockerlessError;
use crate::storage::archive::{PathStat, PATH_STAT_HEADER};
use axum::body::Body;
use axum::extract::{Path, Request, State};
use axum::http::{header, HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use bytes::Bytes;
use futures_util::stream::{self, Stream, StreamExt};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Interval between streamed stats entries
const STATS_INTERVAL: Duration = Duration::from_secs(1);

/// Largest accepted archive or import body
pub(crate) const MAX_UPLOAD: usize = 1 << 30;

pub async fn create(
    State(state): State<AppState>,
    params: Params,
    JsonBody(req): JsonBody<ContainerCreateRequest>,
) -> ApiResult<(StatusCode, Json<ContainerCreateResponse>)> {
    let resp = state
        .backend
        .create_container(params.get("name"), params.get("pod"), req)
        .await?;
    Ok((StatusCode::CREATED, Json(resp)))
}

pub async fn list(State(state): State<AppState>, params: Params) -> Json<Vec<ContainerSummary>> {
    let opts = ListOptions {
        all: params.flag("all"),
        limit: params.get("limit").parse().unwrap_or(0),
        filters: params.filters(),
    };
    Json(state.backend.list_containers(&opts))
}

pub async fn inspect(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Container>> {
    Ok(Json(state.backend.inspect_container(&id)?))
}

pub async fn start(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<StatusCode> {
    state.backend.start_container(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn stop(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<StatusCode> {
    state.backend.stop_container(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn kill(
    State(state): State<AppState>,
    Path(id): Path<String>,
    params: Params,
) -> ApiResult<StatusCode> {
    state.backend.kill_container(&id, params.get("signal")).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn restart(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    state.backend.restart_container(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn remove(
    State(state): State<AppState>,
    Path(id): Path<String>,
    params: Params,
) -> ApiResult<StatusCode> {
    state.backend.remove_container(&id, params.flag("force")).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn wait(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<ContainerWaitResponse>> {
    Ok(Json(state.backend.wait_container(&id).await?))
}

pub async fn logs(
    State(state): State<AppState>,
    Path(id): Path<String>,
    params: Params,
) -> ApiResult<Response> {
    let opts = LogOptions {
        follow: params.flag("follow"),
        timestamps: params.flag("timestamps"),
        tail: params.get("tail").to_string(),
        since: params.get("since").to_string(),
        until: params.get("until").to_string(),
    };
    let logs = state.backend.container_logs(&id, &opts)?;
    Ok(streaming(stream_content_type(logs.tty), logs.into_stream()))
}

pub async fn attach(
    State(state): State<AppState>,
    Path(id): Path<String>,
    mut req: Request,
) -> ApiResult<Response> {
    let c = state.backend.resolve_container(&id)?;
    let on_upgrade = hyper::upgrade::on(&mut req);
    let backend = state.backend.clone();
    Ok(hijack::upgrade(on_upgrade, c.config.tty, "attach", move |conn| async move {
        if let Err(e) = backend.attach_container(&c.id, conn).await {
            debug!("Attach to {} ended: {}", c.short_id(), e);
        }
    }))
}

fn stats_line(entry: &Value) -> std::io::Result<Bytes> {
    let mut line = serde_json::to_vec(entry).map_err(std::io::Error::other)?;
    line.push(b'\n');
    Ok(Bytes::from(line))
}

fn read_of(entry: &Value) -> String {
    entry["read"].as_str().unwrap_or_default().to_string()
}

/// `first` now, then a fresh entry every interval until the container stops
fn stats_stream(
    backend: Arc<Backend>,
    id: String,
    first: Value,
) -> impl Stream<Item = std::io::Result<Bytes>> + Send {
    let preread = read_of(&first);
    let rest = stream::unfold(Some(preread), move |preread| {
        let backend = backend.clone();
        let id = id.clone();
        async move {
            let preread = preread?;
            tokio::time::sleep(STATS_INTERVAL).await;
            let entry = backend.container_stats(&id, &preread).ok()?;
            Some((stats_line(&entry), Some(read_of(&entry))))
        }
    });
    stream::once(std::future::ready(stats_line(&first))).chain(rest)
}

/// One snapshot, or JSON lines every second while the container runs
pub async fn stats(
    State(state): State<AppState>,
    Path(id): Path<String>,
    params: Params,
) -> ApiResult<Response> {
    let first = state.backend.container_stats(&id, "")?;
    if !params.flag_or("stream", true) {
        return Ok(Json(first).into_response());
    }
    Ok(streaming(
        "application/json",
        stats_stream(state.backend.clone(), id, first),
    ))
}

fn archive_path(params: &Params) -> &str {
    match params.get("path") {
        "" => "/",
        p => p,
    }
}

pub async fn put_archive(
    State(state): State<AppState>,
    Path(id): Path<String>,
    params: Params,
    body: Bytes,
) -> ApiResult<StatusCode> {
    state
        .backend
        .put_archive(&id, archive_path(&params), body.to_vec())
        .await?;
    Ok(StatusCode::OK)
}

fn stat_header(stat: &PathStat) -> ApiResult<(HeaderName, HeaderValue)> {
    let value = HeaderValue::from_str(&stat.header_value())
        .map_err(|e| ApiError(SockerlessError::Server(e.to_string())))?;
    Ok((HeaderName::from_static(PATH_STAT_HEADER), value))
}

pub async fn head_archive(
    State(state): State<AppState>,
    Path(id): Path<String>,
    params: Params,
) -> ApiResult<Response> {
    let stat = state.backend.stat_archive_path(&id, archive_path(&params))?;
    Ok(([stat_header(&stat)?], StatusCode::OK).into_response())
}

pub async fn get_archive(
    State(state): State<AppState>,
    Path(id): Path<String>,
    params: Params,
) -> ApiResult<Response> {
    let out = state.backend.get_archive(&id, archive_path(&params)).await?;
    Ok((
        [
            stat_header(&out.stat)?,
            (header::CONTENT_TYPE, HeaderValue::from_static("application/x-tar")),
        ],
        Body::from(out.tar),
    )
        .into_response())
}

pub async fn export(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<Response> {
    let tar = state.backend.export_container(&id).await?;
    Ok((
        [(header::CONTENT_TYPE, HeaderValue::from_static("application/x-tar"))],
        Body::from(tar),
    )
        .into_response())
}

pub async fn top(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<ContainerTopResponse>> {
    Ok(Json(state.backend.top_container(&id)?))
}

pub async fn prune(State(state): State<AppState>, params: Params) -> Json<ContainerPruneResponse> {
    Json(state.backend.prune_containers(&params.filters()).await)
}

pub async fn rename(
    State(state): State<AppState>,
    Path(id): Path<String>,
    params: Params,
) -> ApiResult<StatusCode> {
    state.backend.rename_container(&id, params.get("name"))?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn pause(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<StatusCode> {
    state.backend.pause_container(&id)?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn unpause(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    state.backend.unpause_container(&id)?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn update(
    State(state): State<AppState>,
    Path(id): Path<String>,
    JsonBody(req): JsonBody<Option<ContainerUpdateRequest>>,
) -> ApiResult<Json<ContainerUpdateResponse>> {
    Ok(Json(state.backend.update_container(&id, req)?))
}

pub async fn changes(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Vec<ContainerChangeItem>>> {
    Ok(Json(state.backend.container_changes(&id)?))
}

pub async fn commit(
    State(state): State<AppState>,
    params: Params,
    JsonBody(overrides): JsonBody<Option<ContainerConfig>>,
) -> ApiResult<(StatusCode, Json<ContainerCommitResponse>)> {
    let opts = CommitOptions {
        container: params.get("container").to_string(),
        repo: params.get("repo").to_string(),
        tag: params.get("tag").to_string(),
        comment: params.get("comment").to_string(),
        author: params.get("author").to_string(),
    };
    let resp = state.backend.commit_container(&opts, overrides)?;
    Ok((StatusCode::CREATED, Json(resp)))
}
