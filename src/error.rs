//! Error types for Sockerless

use thiserror::Error;

/// Result type for Sockerless operations
pub type Result<T> = std::result::Result<T, SockerlessError>;

/// Sockerless error types
#[derive(Error, Debug)]
pub enum SockerlessError {
    #[error("No such {resource}: {id}")]
    NotFound { resource: String, id: String },

    #[error("{0}")]
    Conflict(String),

    #[error("{0}")]
    InvalidParameter(String),

    #[error("not modified")]
    NotModified,

    #[error("{0}")]
    Unauthorized(String),

    #[error("not implemented: {0}")]
    NotImplemented(String),

    #[error("{0}")]
    Server(String),

    #[error("Registry error: {0}")]
    Registry(String),

    #[error("Dockerfile parse error at line {line}: {message}")]
    DockerfileParse { line: usize, message: String },

    #[error("Agent error: {0}")]
    Agent(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl SockerlessError {
    /// Shorthand for a NotFound error
    pub fn not_found(resource: &str, id: &str) -> Self {
        SockerlessError::NotFound {
            resource: resource.to_string(),
            id: id.to_string(),
        }
    }

    /// HTTP status code this error surfaces as on the internal API
    pub fn status_code(&self) -> u16 {
        match self {
            SockerlessError::NotFound { .. } => 404,
            SockerlessError::Conflict(_) => 409,
            SockerlessError::InvalidParameter(_) | SockerlessError::Json(_) => 400,
            SockerlessError::NotModified => 304,
            SockerlessError::Unauthorized(_) => 401,
            SockerlessError::NotImplemented(_) => 501,
            _ => 500,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_message() {
        let err = SockerlessError::not_found("container", "abc123");
        assert_eq!(err.to_string(), "No such container: abc123");
        assert_eq!(err.status_code(), 404);
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(SockerlessError::Conflict("x".into()).status_code(), 409);
        assert_eq!(SockerlessError::InvalidParameter("x".into()).status_code(), 400);
        assert_eq!(SockerlessError::NotModified.status_code(), 304);
        assert_eq!(SockerlessError::Unauthorized("x".into()).status_code(), 401);
        assert_eq!(SockerlessError::NotImplemented("x".into()).status_code(), 501);
        assert_eq!(SockerlessError::Server("x".into()).status_code(), 500);
        assert_eq!(SockerlessError::Timeout("x".into()).status_code(), 500);
    }
}
