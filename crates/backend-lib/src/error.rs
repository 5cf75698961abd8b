// crates/backend-lib/src/error.rs

//! Central error type + Axum integration.
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use crowdpulse_common::ServerMessage;
use thiserror::Error;

use crate::validation::ValidationError;

/// Application error types with error codes and context
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Session not found")]
    SessionNotFound,

    #[error("Rate limit exceeded for {category}, retry in {retry_after_ms} ms")]
    RateLimited {
        category: &'static str,
        retry_after_ms: u64,
    },

    #[error("Invalid join code: {0}")]
    InvalidCode(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Invalid activity payload: {0}")]
    InvalidPayload(String),

    #[error("Command not allowed for role {0}")]
    InvalidRole(String),

    #[error("Connection has not joined this session")]
    NotInSession,

    #[error("Join code already in use: {0}")]
    CodeInUse(String),

    #[error("Could not allocate a unique join code")]
    CodeGenerationFailed,

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// Get the HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            AppError::SessionNotFound => StatusCode::NOT_FOUND,
            AppError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            AppError::InvalidCode(_)
            | AppError::InvalidInput(_)
            | AppError::InvalidPayload(_) => StatusCode::BAD_REQUEST,
            AppError::InvalidRole(_) | AppError::NotInSession => StatusCode::FORBIDDEN,
            AppError::CodeInUse(_) => StatusCode::CONFLICT,
            AppError::CodeGenerationFailed => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get the stable wire code for this error
    pub fn error_code(&self) -> &'static str {
        match self {
            AppError::SessionNotFound => "SESSION_NOT_FOUND",
            AppError::RateLimited { .. } => "RATE_LIMITED",
            AppError::InvalidCode(_) => "INVALID_CODE",
            AppError::InvalidInput(_) => "INVALID_INPUT",
            AppError::InvalidPayload(_) => "INVALID_PAYLOAD",
            AppError::InvalidRole(_) => "INVALID_ROLE",
            AppError::NotInSession => "NOT_IN_SESSION",
            AppError::CodeInUse(_) => "CODE_IN_USE",
            AppError::CodeGenerationFailed => "CODE_GENERATION_FAILED",
            AppError::Storage(_) => "STORAGE_ERROR",
            AppError::Io(_) | AppError::Json(_) | AppError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// Get a sanitized message suitable for participants
    pub fn sanitized_message(&self) -> String {
        match self {
            AppError::SessionNotFound => "Session not found".to_string(),
            AppError::RateLimited { .. } => {
                "Too many requests, please try again later".to_string()
            },
            AppError::InvalidCode(_) => "Invalid session code".to_string(),
            AppError::InvalidInput(_) | AppError::InvalidPayload(_) => {
                "Invalid request".to_string()
            },
            AppError::InvalidRole(_) | AppError::NotInSession => {
                "Not allowed in this session".to_string()
            },
            AppError::CodeInUse(_) => "Session code already in use".to_string(),
            AppError::CodeGenerationFailed => {
                "Could not create a session, please try again".to_string()
            },
            AppError::Storage(_) | AppError::Io(_) | AppError::Json(_) | AppError::Internal(_) => {
                "An internal server error occurred".to_string()
            },
        }
    }

    /// Convert into the `session-error` event. Presenters get the detailed
    /// message, everyone else the sanitized one.
    pub fn to_server_message(&self, detailed: bool) -> ServerMessage {
        let message = if detailed {
            self.to_string()
        } else {
            self.sanitized_message()
        };
        ServerMessage::SessionError {
            code: self.error_code().to_string(),
            message,
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

impl From<ValidationError> for AppError {
    fn from(err: ValidationError) -> Self {
        match err {
            ValidationError::InvalidCode(msg) => AppError::InvalidCode(msg),
            ValidationError::InvalidActivity(msg) => AppError::InvalidPayload(msg),
            other => AppError::InvalidInput(other.to_string()),
        }
    }
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for AppError {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        AppError::SessionNotFound
    }
}

impl From<tokio::sync::oneshot::error::RecvError> for AppError {
    fn from(_: tokio::sync::oneshot::error::RecvError) -> Self {
        AppError::SessionNotFound
    }
}
