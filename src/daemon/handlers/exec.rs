//! Exec routes

use crate::api::types::{ExecCreateRequest, ExecInstance, ExecStartRequest, IdResponse};
use crate::daemon::error::{ApiError, ApiResult};
use crate::daemon::extract::JsonBody;
use crate::daemon::hijack;
use crate::daemon::AppState;
use axum::extract::{Path, Request, State};
use axum::http::StatusCode;
use axum::response::Response;
use axum::Json;

/// Largest accepted exec start body
const MAX_START_BODY: usize = 64 * 1024;

pub async fn create(
    State(state): State<AppState>,
    Path(id): Path<String>,
    JsonBody(req): JsonBody<ExecCreateRequest>,
) -> ApiResult<(StatusCode, Json<IdResponse>)> {
    let resp = state.backend.create_exec(&id, req)?;
    Ok((StatusCode::CREATED, Json(resp)))
}

pub async fn inspect(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<ExecInstance>> {
    Ok(Json(state.backend.inspect_exec(&id)?))
}

/// Hijack the connection and run the exec over it
pub async fn start(
    State(state): State<AppState>,
    Path(id): Path<String>,
    mut req: Request,
) -> ApiResult<Response> {
    let on_upgrade = hyper::upgrade::on(&mut req);
    let body = axum::body::to_bytes(req.into_body(), MAX_START_BODY)
        .await
        .map_err(|e| ApiError::invalid(e.to_string()))?;
    let start: ExecStartRequest = if body.iter().all(u8::is_ascii_whitespace) {
        ExecStartRequest::default()
    } else {
        serde_json::from_slice(&body).map_err(|e| ApiError::invalid(e.to_string()))?
    };

    let session = state.backend.begin_exec(&id, &start)?;
    let backend = state.backend.clone();
    Ok(hijack::upgrade(on_upgrade, session.tty(), "exec", move |conn| async move {
        backend.run_exec(session, conn).await;
    }))
}
