//! Route table for the internal API

use super::handlers::{
    agent, containers, exec, images, management, networks, pods, system, volumes,
};
use super::metrics::{track, Metrics};
use crate::backend::Backend;
use axum::extract::DefaultBodyLimit;
use axum::middleware;
use axum::routing::{get, post, put};
use axum::Router;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

/// Path every route is nested under
pub const API_PREFIX: &str = "/internal/v1";

/// Shared handler state
#[derive(Clone)]
pub struct AppState {
    pub backend: Arc<Backend>,
    pub metrics: Arc<Metrics>,
}

impl AppState {
    pub fn new(backend: Arc<Backend>) -> Self {
        Self {
            backend,
            metrics: Arc::new(Metrics::new()),
        }
    }
}

fn management_routes() -> Router<AppState> {
    Router::new()
        .route("/healthz", get(management::healthz))
        .route("/status", get(management::status))
        .route("/containers/summary", get(management::containers_summary))
        .route("/metrics", get(management::metrics))
        .route("/check", get(management::check))
        .route("/reload", post(management::reload))
        .route("/resources", get(management::resources))
        .route("/resources/orphaned", get(management::orphaned))
        .route("/resources/cleanup", post(management::cleanup))
}

fn container_routes() -> Router<AppState> {
    Router::new()
        .route("/containers", post(containers::create).get(containers::list))
        .route("/containers/prune", post(containers::prune))
        .route(
            "/containers/:id",
            get(containers::inspect).delete(containers::remove),
        )
        .route("/containers/:id/json", get(containers::inspect))
        .route("/containers/:id/start", post(containers::start))
        .route("/containers/:id/stop", post(containers::stop))
        .route("/containers/:id/kill", post(containers::kill))
        .route("/containers/:id/restart", post(containers::restart))
        .route("/containers/:id/wait", post(containers::wait))
        .route("/containers/:id/logs", get(containers::logs))
        .route("/containers/:id/attach", post(containers::attach))
        .route("/containers/:id/exec", post(exec::create))
        .route(
            "/containers/:id/archive",
            put(containers::put_archive)
                .head(containers::head_archive)
                .get(containers::get_archive),
        )
        .route("/containers/:id/top", get(containers::top))
        .route("/containers/:id/stats", get(containers::stats))
        .route("/containers/:id/rename", post(containers::rename))
        .route("/containers/:id/pause", post(containers::pause))
        .route("/containers/:id/unpause", post(containers::unpause))
        .route("/containers/:id/update", post(containers::update))
        .route("/containers/:id/changes", get(containers::changes))
        .route("/containers/:id/export", get(containers::export))
        .route("/commit", post(containers::commit))
        .route("/exec/:id", get(exec::inspect))
        .route("/exec/:id/json", get(exec::inspect))
        .route("/exec/:id/start", post(exec::start))
}

fn image_routes() -> Router<AppState> {
    Router::new()
        .route("/images", get(images::list))
        .route("/images/pull", post(images::pull))
        .route("/images/inspect", get(images::inspect))
        .route("/images/load", post(images::load))
        .route("/images/tag", post(images::tag))
        .route("/images/build", post(images::build))
        .route("/images/prune", post(images::prune))
        .route("/images/:name", axum::routing::delete(images::remove))
        .route("/images/:name/history", get(images::history))
        .route("/auth", post(images::auth))
}

fn network_routes() -> Router<AppState> {
    Router::new()
        .route("/networks", post(networks::create).get(networks::list))
        .route("/networks/prune", post(networks::prune))
        .route(
            "/networks/:id",
            get(networks::inspect).delete(networks::remove),
        )
        .route("/networks/:id/connect", post(networks::connect))
        .route("/networks/:id/disconnect", post(networks::disconnect))
        .route("/volumes", post(volumes::create).get(volumes::list))
        .route("/volumes/prune", post(volumes::prune))
        .route(
            "/volumes/:name",
            get(volumes::inspect).delete(volumes::remove),
        )
}

fn pod_routes() -> Router<AppState> {
    Router::new()
        .route("/libpod/pods/create", post(pods::create))
        .route("/libpod/pods/json", get(pods::list))
        .route("/libpod/pods/:name", axum::routing::delete(pods::remove))
        .route("/libpod/pods/:name/json", get(pods::inspect))
        .route("/libpod/pods/:name/exists", get(pods::exists))
        .route("/libpod/pods/:name/start", post(pods::start))
        .route("/libpod/pods/:name/stop", post(pods::stop))
        .route("/libpod/pods/:name/kill", post(pods::kill))
}

/// The full API with request tracing and metrics
pub fn router(backend: Arc<Backend>) -> Router {
    let state = AppState::new(backend);
    let api = Router::new()
        .route("/info", get(system::info))
        .route("/system/df", get(system::disk_usage))
        .route("/events", get(system::events))
        .route("/agent/connect", get(agent::connect))
        .merge(management_routes())
        .merge(container_routes())
        .merge(image_routes())
        .merge(network_routes())
        .merge(pod_routes());

    Router::new()
        .nest(API_PREFIX, api)
        .layer(DefaultBodyLimit::max(containers::MAX_UPLOAD))
        .layer(middleware::from_fn_with_state(state.metrics.clone(), track))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
