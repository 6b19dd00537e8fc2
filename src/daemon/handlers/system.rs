//! Info, disk usage and the event stream

use super::streaming;
use crate::api::types::{BackendInfo, DiskUsageResponse};
use crate::backend::system::EventFilter;
use crate::daemon::error::ApiResult;
use crate::daemon::extract::Params;
use crate::daemon::AppState;
use axum::extract::State;
use axum::response::Response;
use axum::Json;

pub async fn info(State(state): State<AppState>) -> Json<BackendInfo> {
    Json(state.backend.info())
}

pub async fn disk_usage(State(state): State<AppState>) -> Json<DiskUsageResponse> {
    Json(state.backend.disk_usage())
}

/// Event JSON lines until the client goes away or `until` passes
pub async fn events(State(state): State<AppState>, params: Params) -> ApiResult<Response> {
    let filter = EventFilter::from_query(&params.filters(), params.get("since"), params.get("until"))?;
    let sub = state.backend.subscribe_events(filter);
    Ok(streaming("application/json", sub.into_stream()))
}
