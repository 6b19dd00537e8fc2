//! HTTP error responses

use crate::error::SockerlessError;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

/// Result type of HTTP handlers
pub type ApiResult<T> = std::result::Result<T, ApiError>;

/// A backend error rendered as `{"message": ...}` with its mapped status.
///
/// `NotModified` is a bare 304.
#[derive(Debug)]
pub struct ApiError(pub SockerlessError);

impl From<SockerlessError> for ApiError {
    fn from(err: SockerlessError) -> Self {
        Self(err)
    }
}

impl ApiError {
    pub fn invalid(message: impl Into<String>) -> Self {
        Self(SockerlessError::InvalidParameter(message.into()))
    }

    pub fn status(&self) -> StatusCode {
        StatusCode::from_u16(self.0.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status == StatusCode::NOT_MODIFIED {
            return status.into_response();
        }
        if status.is_server_error() {
            tracing::warn!("Request failed: {}", self.0);
        }
        (status, Json(json!({ "message": self.0.to_string() }))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn body_of(resp: Response) -> Vec<u8> {
        axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap()
            .to_vec()
    }

    #[tokio::test]
    async fn test_not_found_body() {
        let resp = ApiError::from(SockerlessError::not_found("container", "abc")).into_response();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        let body: serde_json::Value = serde_json::from_slice(&body_of(resp).await).unwrap();
        assert_eq!(body, json!({"message": "No such container: abc"}));
    }

    #[tokio::test]
    async fn test_not_modified_has_no_body() {
        let resp = ApiError(SockerlessError::NotModified).into_response();
        assert_eq!(resp.status(), StatusCode::NOT_MODIFIED);
        assert!(body_of(resp).await.is_empty());
    }

    #[test]
    fn test_invalid_is_bad_request() {
        assert_eq!(ApiError::invalid("bad").status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            ApiError(SockerlessError::Timeout("slow".into())).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
