//! Route handlers, one module per resource

pub mod agent;
pub mod containers;
pub mod exec;
pub mod images;
pub mod management;
pub mod networks;
pub mod pods;
pub mod system;
pub mod volumes;

use axum::body::Body;
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use futures_util::Stream;
use serde_json::Value;

/// A 200 response whose body is produced by `stream`
pub(crate) fn streaming<S>(content_type: &'static str, stream: S) -> Response
where
    S: Stream<Item = std::io::Result<Bytes>> + Send + 'static,
{
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, HeaderValue::from_static(content_type))],
        Body::from_stream(stream),
    )
        .into_response()
}

/// Newline-delimited JSON progress messages
pub(crate) fn json_lines(messages: &[Value]) -> Response {
    let mut body = Vec::new();
    for msg in messages {
        body.extend_from_slice(msg.to_string().as_bytes());
        body.push(b'\n');
    }
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, HeaderValue::from_static("application/json"))],
        body,
    )
        .into_response()
}
