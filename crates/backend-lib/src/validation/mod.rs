// ============================
// crates/backend-lib/src/validation/mod.rs
// ============================
//! Message validation module.
//!
//! Everything here runs before a command reaches a session, so a rejected
//! command never mutates state.

use crate::code_gen::CODE_ALPHABET;
use crowdpulse_common::ClientMessage;
use regex::Regex;
use serde_json::Value;
use std::sync::LazyLock;
use thiserror::Error;

// Common validation constants
pub const MIN_CODE_LENGTH: usize = 4;
pub const MAX_CODE_LENGTH: usize = 12;
pub const MAX_DISPLAY_NAME_LENGTH: usize = 50;
pub const DEFAULT_DISPLAY_NAME: &str = "Anonymous";
const MAX_PRESENTATION_ID_LENGTH: usize = 64;
const MAX_TITLE_LENGTH: usize = 200;
const MAX_DESCRIPTION_LENGTH: usize = 2000;

static PRESENTATION_ID_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_-]+$").unwrap());
static SESSION_ID_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9-]{1,64}$").unwrap());
static NAME_STRIP_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[<>/\\{}\[\];`]|\p{Cc}").unwrap());

/// Possible validation errors
#[derive(Error, Debug)]
pub enum ValidationError {
    #[error("Invalid join code: {0}")]
    InvalidCode(String),

    #[error("Invalid session id: {0}")]
    InvalidSessionId(String),

    #[error("Invalid presentation id: {0}")]
    InvalidPresentationId(String),

    #[error("Invalid title: {0}")]
    InvalidTitle(String),

    #[error("Invalid activity: {0}")]
    InvalidActivity(String),

    #[error("Missing session reference: {0}")]
    MissingSessionRef(String),
}

/// Result type for validation operations
pub type ValidationResult<T> = Result<T, ValidationError>;

/// Validate and normalize a join code (upper-cased, alphabet-checked)
pub fn validate_session_code(code: &str) -> ValidationResult<String> {
    let code = code.trim().to_ascii_uppercase();

    if code.len() < MIN_CODE_LENGTH || code.len() > MAX_CODE_LENGTH {
        return Err(ValidationError::InvalidCode(format!(
            "Code must be between {MIN_CODE_LENGTH} and {MAX_CODE_LENGTH} characters"
        )));
    }

    if !code.bytes().all(|b| CODE_ALPHABET.contains(&b)) {
        return Err(ValidationError::InvalidCode(
            "Code contains characters outside the join-code alphabet".to_string(),
        ));
    }

    Ok(code)
}

/// Validate a session id
pub fn validate_session_id(session_id: &str) -> ValidationResult<&str> {
    if !SESSION_ID_REGEX.is_match(session_id) {
        return Err(ValidationError::InvalidSessionId(
            "Session id must be 1-64 alphanumeric characters or hyphens".to_string(),
        ));
    }
    Ok(session_id)
}

/// Validate a presentation id. Used as a file name by the flat-file store.
pub fn validate_presentation_id(presentation_id: &str) -> ValidationResult<&str> {
    if presentation_id.is_empty() || presentation_id.len() > MAX_PRESENTATION_ID_LENGTH {
        return Err(ValidationError::InvalidPresentationId(format!(
            "Presentation id must be between 1 and {MAX_PRESENTATION_ID_LENGTH} characters"
        )));
    }

    if !PRESENTATION_ID_REGEX.is_match(presentation_id) {
        return Err(ValidationError::InvalidPresentationId(
            "Presentation id contains invalid characters".to_string(),
        ));
    }

    Ok(presentation_id)
}

/// Validate optional title/description text
pub fn validate_title(title: Option<&str>, description: Option<&str>) -> ValidationResult<()> {
    if title.is_some_and(|t| t.chars().count() > MAX_TITLE_LENGTH) {
        return Err(ValidationError::InvalidTitle(format!(
            "Title cannot exceed {MAX_TITLE_LENGTH} characters"
        )));
    }
    if description.is_some_and(|d| d.chars().count() > MAX_DESCRIPTION_LENGTH) {
        return Err(ValidationError::InvalidTitle(format!(
            "Description cannot exceed {MAX_DESCRIPTION_LENGTH} characters"
        )));
    }
    Ok(())
}

/// Sanitize a display name: strip markup and control characters, trim,
/// cap at 50 characters, default to "Anonymous".
pub fn sanitize_display_name(name: Option<&str>) -> String {
    let Some(name) = name else {
        return DEFAULT_DISPLAY_NAME.to_string();
    };

    let stripped = NAME_STRIP_REGEX.replace_all(name, "");
    let trimmed: String = stripped
        .trim()
        .chars()
        .take(MAX_DISPLAY_NAME_LENGTH)
        .collect();
    let trimmed = trimmed.trim_end();

    if trimmed.is_empty() {
        DEFAULT_DISPLAY_NAME.to_string()
    } else {
        trimmed.to_string()
    }
}

/// Validate a raw activity payload (must be a JSON object)
pub fn validate_activity_payload(activity: &Value) -> ValidationResult<()> {
    let Some(obj) = activity.as_object() else {
        return Err(ValidationError::InvalidActivity(
            "Activity must be a JSON object".to_string(),
        ));
    };

    if let Some(options) = obj.get("options") {
        if !options.is_array() && !options.is_null() {
            return Err(ValidationError::InvalidActivity(
                "Activity options must be an array".to_string(),
            ));
        }
    }

    Ok(())
}

fn require_session_ref(
    session_id: Option<&String>,
    code: Option<&String>,
) -> ValidationResult<()> {
    match (session_id, code) {
        (None, None) => Err(ValidationError::MissingSessionRef(
            "Either sessionId or code is required".to_string(),
        )),
        (Some(id), _) => validate_session_id(id).map(|_| ()),
        (None, Some(code)) => validate_session_code(code).map(|_| ()),
    }
}

/// Validate a client message before any state is touched
pub fn validate_client_message(msg: &ClientMessage) -> ValidationResult<()> {
    match msg {
        ClientMessage::CreateSession {
            presentation_id,
            title,
            description,
            code,
            ..
        } => {
            validate_presentation_id(presentation_id)?;
            validate_title(title.as_deref(), description.as_deref())?;
            if let Some(code) = code {
                validate_session_code(code)?;
            }
            Ok(())
        },
        ClientMessage::JoinSession { code, .. } | ClientMessage::RejoinSession { code, .. } => {
            validate_session_code(code).map(|_| ())
        },
        ClientMessage::StartActivity {
            session_id,
            code,
            activity,
        } => {
            require_session_ref(session_id.as_ref(), code.as_ref())?;
            validate_activity_payload(activity)
        },
        ClientMessage::EndActivity { session_id, .. } | ClientMessage::EndSession { session_id } => {
            validate_session_id(session_id).map(|_| ())
        },
        ClientMessage::SubmitResponse {
            session_id, code, ..
        }
        | ClientMessage::Heartbeat { session_id, code } => {
            require_session_ref(session_id.as_ref(), code.as_ref())
        },
    }
}
