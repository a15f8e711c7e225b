use thiserror::Error;

use crate::auth::error::ServerMessage;
use crate::auth::AuthError;

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("Access denied: {0}")]
    AccessDenied(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Rate limited - please wait before retrying")]
    RateLimited,

    #[error("Server error: {0}")]
    ServerError(String),

    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(#[from] serde_json::Error),
}

impl ApiError {
    pub fn from_status(status: reqwest::StatusCode, body: &str) -> Self {
        let reason = ServerMessage::parse(body)
            .summary()
            .unwrap_or_else(|| status.to_string());
        match status.as_u16() {
            400 => ApiError::BadRequest(reason),
            401 => ApiError::Auth(AuthError::Unauthorized(reason)),
            403 => ApiError::AccessDenied(reason),
            404 => ApiError::NotFound(reason),
            429 => ApiError::RateLimited,
            500..=599 => ApiError::ServerError(reason),
            _ => ApiError::InvalidResponse(format!("Status {}: {}", status, reason)),
        }
    }

    /// True when the user has to log in again before retrying.
    pub fn requires_login(&self) -> bool {
        matches!(
            self,
            ApiError::Auth(AuthError::SessionExpired | AuthError::Unauthorized(_))
        )
    }
}

// ============================================================================
// Tests
// ============================================================================
