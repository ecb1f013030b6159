// ============================
// crates/backend-lib/src/validation.rs
// ============================
//! Input validation for identifiers and chat content.

use std::sync::LazyLock;

use regex::Regex;
use thiserror::Error;

// Common validation constants
const MIN_SESSION_ID_LENGTH: usize = 3;
const MAX_SESSION_ID_LENGTH: usize = 64;
const MAX_PARTICIPANT_ID_LENGTH: usize = 64;
const MAX_DISPLAY_NAME_LENGTH: usize = 100;

// Regex patterns for validation
static ID_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-zA-Z0-9_-]+$").unwrap());
static DISPLAY_NAME_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[^<>/\\{}()\[\];]*$").unwrap());

/// Possible validation errors
#[derive(Error, Debug)]
pub enum ValidationError {
    #[error("Invalid session ID: {0}")]
    InvalidSessionId(String),

    #[error("Invalid participant ID: {0}")]
    InvalidParticipantId(String),

    #[error("Invalid display name: {0}")]
    InvalidDisplayName(String),
}

/// Result type for validation operations
pub type ValidationResult<T> = Result<T, ValidationError>;

/// Validate a session ID
pub fn validate_session_id(session_id: &str) -> ValidationResult<&str> {
    if session_id.len() < MIN_SESSION_ID_LENGTH || session_id.len() > MAX_SESSION_ID_LENGTH {
        return Err(ValidationError::InvalidSessionId(format!(
            "length must be between {MIN_SESSION_ID_LENGTH} and {MAX_SESSION_ID_LENGTH}"
        )));
    }
    if !ID_REGEX.is_match(session_id) {
        return Err(ValidationError::InvalidSessionId(
            "only alphanumerics, hyphens and underscores are allowed".to_string(),
        ));
    }
    Ok(session_id)
}

/// Validate a participant ID
pub fn validate_participant_id(participant_id: &str) -> ValidationResult<&str> {
    if participant_id.is_empty() || participant_id.len() > MAX_PARTICIPANT_ID_LENGTH {
        return Err(ValidationError::InvalidParticipantId(format!(
            "length must be between 1 and {MAX_PARTICIPANT_ID_LENGTH}"
        )));
    }
    if !ID_REGEX.is_match(participant_id) {
        return Err(ValidationError::InvalidParticipantId(
            "only alphanumerics, hyphens and underscores are allowed".to_string(),
        ));
    }
    Ok(participant_id)
}

/// Validate a display name
pub fn validate_display_name(display_name: &str) -> ValidationResult<&str> {
    let trimmed = display_name.trim();
    if trimmed.is_empty() {
        return Err(ValidationError::InvalidDisplayName(
            "display name cannot be empty".to_string(),
        ));
    }
    if trimmed.len() > MAX_DISPLAY_NAME_LENGTH {
        return Err(ValidationError::InvalidDisplayName(format!(
            "display name cannot exceed {MAX_DISPLAY_NAME_LENGTH} characters"
        )));
    }
    if !DISPLAY_NAME_REGEX.is_match(trimmed) {
        return Err(ValidationError::InvalidDisplayName(
            "display name contains forbidden characters".to_string(),
        ));
    }
    Ok(trimmed)
}
