//! Error types for Continuebee

use hyper::StatusCode;

/// Main error type for Continuebee operations
#[derive(Debug, thiserror::Error)]
pub enum ContinuebeeError {
    /// Freshness or signature failure. Deliberately carries no detail so the
    /// caller cannot tell a stale timestamp from a bad signature.
    #[error("Auth error")]
    Auth,

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Missing required fields: {0}")]
    Validation(String),

    /// Body or query that could not be decoded at all
    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Not acceptable: hash mismatch")]
    HashMismatch,

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Upstream error: {0}")]
    Upstream(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ContinuebeeError {
    /// Build a validation error from the list of missing field names
    pub fn missing_fields(fields: &[&str]) -> Self {
        Self::Validation(fields.join(", "))
    }

    /// Convert error to HTTP status code
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Auth => StatusCode::FORBIDDEN,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::HashMismatch => StatusCode::NOT_ACCEPTABLE,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::Storage(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Upstream(_) => StatusCode::BAD_GATEWAY,
            Self::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Convert to status code and body tuple for HTTP response
    pub fn into_status_code_and_body(self) -> (StatusCode, String) {
        let status = self.status_code();
        let body = serde_json::json!({ "error": self.to_string() }).to_string();
        (status, body)
    }
}

impl From<std::io::Error> for ContinuebeeError {
    fn from(err: std::io::Error) -> Self {
        Self::Storage(err.to_string())
    }
}

impl From<serde_json::Error> for ContinuebeeError {
    fn from(err: serde_json::Error) -> Self {
        Self::Internal(format!("JSON error: {}", err))
    }
}

impl From<sled::Error> for ContinuebeeError {
    fn from(err: sled::Error) -> Self {
        Self::Storage(format!("sled: {}", err))
    }
}

impl From<rusqlite::Error> for ContinuebeeError {
    fn from(err: rusqlite::Error) -> Self {
        Self::Storage(format!("sqlite: {}", err))
    }
}

impl From<reqwest::Error> for ContinuebeeError {
    fn from(err: reqwest::Error) -> Self {
        Self::Upstream(err.to_string())
    }
}

/// Result type alias for Continuebee operations
pub type Result<T> = std::result::Result<T, ContinuebeeError>;
