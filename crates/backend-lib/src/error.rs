// crates/backend-lib/src/error.rs

//! Central error type + Axum integration.
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use thiserror::Error;

/// Application error types with error codes and context
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Authentication error: {0}")]
    Auth(String),

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Session is closed")]
    SessionClosed,

    #[error("Session is at capacity")]
    CapacityExceeded,

    #[error("Target participant not found: {0}")]
    TargetNotFound(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Not a participant of session {0}")]
    NotAParticipant(String),

    #[error("Chat content exceeds maximum length of {0}")]
    ContentTooLong(usize),

    #[error("Durable store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl AppError {
    /// Get the HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            AppError::Auth(_) => StatusCode::UNAUTHORIZED,
            AppError::Forbidden(_) | AppError::NotAParticipant(_) => StatusCode::FORBIDDEN,
            AppError::SessionNotFound(_) | AppError::TargetNotFound(_) => StatusCode::NOT_FOUND,
            AppError::SessionClosed => StatusCode::GONE,
            AppError::CapacityExceeded => StatusCode::CONFLICT,
            AppError::ContentTooLong(_) | AppError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            AppError::StoreUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get the error code for this error
    pub fn error_code(&self) -> &'static str {
        match self {
            AppError::Auth(_) => "AUTH_FAILED",
            AppError::SessionNotFound(_) => "SESSION_NOT_FOUND",
            AppError::SessionClosed => "SESSION_CLOSED",
            AppError::CapacityExceeded => "CAPACITY_EXCEEDED",
            AppError::TargetNotFound(_) => "TARGET_NOT_FOUND",
            AppError::Forbidden(_) => "FORBIDDEN",
            AppError::NotAParticipant(_) => "NOT_A_PARTICIPANT",
            AppError::ContentTooLong(_) => "CONTENT_TOO_LONG",
            AppError::StoreUnavailable(_) => "STORE_UNAVAILABLE",
            AppError::InvalidInput(_) => "INVALID_INPUT",
            AppError::Internal(_) => "INTERNAL",
            AppError::Io(_) => "IO",
            AppError::Json(_) => "JSON",
        }
    }

    /// Whether the caller may retry the operation as-is.
    pub fn is_retryable(&self) -> bool {
        matches!(self, AppError::StoreUnavailable(_))
    }

    /// Get a sanitized message suitable for production use
    pub fn sanitized_message(&self) -> String {
        match self {
            AppError::Auth(_) => "Authentication failed".to_string(),
            AppError::SessionNotFound(_) => "Session not found".to_string(),
            AppError::SessionClosed => "Session is closed".to_string(),
            AppError::CapacityExceeded => "Session is at capacity".to_string(),
            AppError::TargetNotFound(_) => "Target participant not found".to_string(),
            AppError::Forbidden(_) => "Operation not permitted".to_string(),
            AppError::NotAParticipant(_) => "Not a participant of this session".to_string(),
            AppError::ContentTooLong(max) => {
                format!("Message exceeds maximum length of {max}")
            },
            AppError::StoreUnavailable(_) => {
                "Storage temporarily unavailable, please retry".to_string()
            },
            AppError::InvalidInput(_) => "Invalid input provided".to_string(),
            AppError::Json(_) => "Invalid request format".to_string(),
            AppError::Internal(_) | AppError::Io(_) => {
                "An internal server error occurred".to_string()
            },
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let error_code = self.error_code();

        // Use detailed messages in development, sanitized in production
        let message = if cfg!(debug_assertions) {
            self.to_string()
        } else {
            self.sanitized_message()
        };

        let body = serde_json::json!({
            "error": {
                "code": error_code,
                "message": message,
            }
        });

        (status, axum::Json(body)).into_response()
    }
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for AppError {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        AppError::Internal("Failed to send message".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::StatusCode;
    use axum::response::IntoResponse;

    #[test]
    fn test_app_error_display() {
        let auth_error = AppError::Auth("Invalid token".to_string());
        assert_eq!(
            auth_error.to_string(),
            "Authentication error: Invalid token"
        );

        let capacity_error = AppError::CapacityExceeded;
        assert_eq!(capacity_error.to_string(), "Session is at capacity");

        let content_error = AppError::ContentTooLong(2000);
        assert!(content_error.to_string().contains("2000"));
    }

    #[test]
    fn test_app_error_status_codes() {
        assert_eq!(
            AppError::Auth("bad token".to_string()).status_code(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            AppError::Forbidden("not host".to_string()).status_code(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(AppError::SessionClosed.status_code(), StatusCode::GONE);
        assert_eq!(
            AppError::CapacityExceeded.status_code(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            AppError::StoreUnavailable("down".to_string()).status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[test]
    fn test_app_error_error_codes() {
        assert_eq!(AppError::SessionClosed.error_code(), "SESSION_CLOSED");
        assert_eq!(
            AppError::TargetNotFound("p2".to_string()).error_code(),
            "TARGET_NOT_FOUND"
        );
        assert_eq!(
            AppError::NotAParticipant("s1".to_string()).error_code(),
            "NOT_A_PARTICIPANT"
        );
        assert_eq!(AppError::ContentTooLong(10).error_code(), "CONTENT_TOO_LONG");
    }

    #[test]
    fn test_retryable() {
        assert!(AppError::StoreUnavailable("down".to_string()).is_retryable());
        assert!(!AppError::CapacityExceeded.is_retryable());
        assert!(!AppError::SessionClosed.is_retryable());
    }

    #[test]
    fn test_app_error_into_response() {
        let error = AppError::SessionNotFound("missing".to_string());
        let response = error.into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
