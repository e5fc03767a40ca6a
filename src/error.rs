use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

/// Application-wide error type
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Authentication failed: {0}")]
    AuthError(String),

    #[error("Not authenticated")]
    Unauthorized,

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Could not access camera or microphone: {0}")]
    MediaAcquisition(String),

    #[error("Camera and microphone did not become available within {0} seconds")]
    MediaTimeout(u64),

    #[error("Could not connect to the classroom server: {0}")]
    Handshake(String),

    #[error("Negotiation with {peer} failed: {reason}")]
    Negotiation { peer: String, reason: String },

    #[error("You have been removed from this session: {0}")]
    Blocked(String),

    #[error("WebRTC error: {0}")]
    WebRtcError(String),

    #[error("Telemetry error: {0}")]
    Telemetry(String),
}

impl AppError {
    /// Whether the user should be offered a retry for this failure.
    ///
    /// Join-phase transport faults are transient; moderation blocks and a
    /// missing microphone are not.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AppError::Handshake(_) | AppError::MediaTimeout(_) | AppError::Io(_)
        )
    }
}

/// Error response body (unified success format)
#[derive(Serialize)]
pub struct ErrorResponse {
    pub success: bool,
    pub message: String,
}

impl AppError {
    fn status_code(&self) -> StatusCode {
        match self {
            AppError::Unauthorized | AppError::AuthError(_) => StatusCode::UNAUTHORIZED,
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = ErrorResponse {
            success: false,
            message: self.to_string(),
        };

        tracing::error!(
            error_type = std::any::type_name_of_val(&self),
            error_message = %body.message,
            "Request failed"
        );

        (status, Json(body)).into_response()
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, AppError>;
