//! Connection hijacking for attach and exec
//!
//! The handler answers `101 UPGRADED` and the session runs on the raw
//! connection once hyper hands it over.

use crate::driver::BoxedConn;
use axum::body::Body;
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::Response;
use hyper::upgrade::OnUpgrade;
use hyper_util::rt::TokioIo;
use std::future::Future;
use tracing::debug;

pub const RAW_STREAM: &str = "application/vnd.docker.raw-stream";
pub const MULTIPLEXED_STREAM: &str = "application/vnd.docker.multiplexed-stream";

/// Stream content type for a tty or framed session
pub fn stream_content_type(tty: bool) -> &'static str {
    if tty {
        RAW_STREAM
    } else {
        MULTIPLEXED_STREAM
    }
}

/// Build the 101 response and run `session` on the upgraded connection
pub fn upgrade<F, Fut>(on_upgrade: OnUpgrade, tty: bool, what: &'static str, session: F) -> Response
where
    F: FnOnce(BoxedConn) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        match on_upgrade.await {
            Ok(upgraded) => session(Box::new(TokioIo::new(upgraded))).await,
            Err(e) => debug!("{} upgrade failed: {}", what, e),
        }
    });

    let mut resp = Response::new(Body::empty());
    *resp.status_mut() = StatusCode::SWITCHING_PROTOCOLS;
    let headers = resp.headers_mut();
    headers.insert(header::CONNECTION, HeaderValue::from_static("Upgrade"));
    headers.insert(header::UPGRADE, HeaderValue::from_static("tcp"));
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static(stream_content_type(tty)),
    );
    resp
}
