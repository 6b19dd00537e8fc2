//! Request extractors

use super::error::ApiError;
use axum::async_trait;
use axum::body::Bytes;
use axum::extract::{FromRequest, FromRequestParts, Query, Request};
use axum::http::request::Parts;
use serde::de::DeserializeOwned;
use std::collections::HashMap;

/// JSON body where an empty body decodes to `T::default()`.
///
/// Decoding failures are 400s.
pub struct JsonBody<T>(pub T);

#[async_trait]
impl<S, T> FromRequest<S> for JsonBody<T>
where
    S: Send + Sync,
    T: DeserializeOwned + Default,
{
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let body = Bytes::from_request(req, state)
            .await
            .map_err(|e| ApiError::invalid(e.body_text()))?;
        if body.iter().all(u8::is_ascii_whitespace) {
            return Ok(Self(T::default()));
        }
        serde_json::from_slice(&body)
            .map(Self)
            .map_err(|e| ApiError::invalid(e.to_string()))
    }
}

/// Raw query parameters
#[derive(Debug, Default)]
pub struct Params(pub HashMap<String, String>);

#[async_trait]
impl<S: Send + Sync> FromRequestParts<S> for Params {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let Query(map) = Query::<HashMap<String, String>>::from_request_parts(parts, state)
            .await
            .map_err(|e| ApiError::invalid(e.body_text()))?;
        Ok(Self(map))
    }
}

impl Params {
    pub fn get(&self, key: &str) -> &str {
        self.0.get(key).map(String::as_str).unwrap_or("")
    }

    /// `1` or `true`
    pub fn flag(&self, key: &str) -> bool {
        matches!(self.get(key), "1" | "true")
    }

    /// Like [`Params::flag`] but `default` when absent
    pub fn flag_or(&self, key: &str, default: bool) -> bool {
        match self.get(key) {
            "" => default,
            v => matches!(v, "1" | "true"),
        }
    }

    pub fn filters(&self) -> crate::store::filters::Filters {
        crate::store::filters::parse_filters(self.get("filters"))
    }
}
