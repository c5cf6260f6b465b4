use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error type shared by the validator, binder, executor and dispatch layer.
#[derive(Debug, Error)]
pub enum AppError {
    /// Script text (or another record field) failed validation at save time.
    #[error("Validation failed: {message}")]
    Validation { message: String },

    /// Entry point invoked against the wrong script type, or unknown record.
    #[error("Not found: {message}")]
    NotFound { message: String },

    #[error("Permission denied: {message}")]
    Permission { message: String },

    /// Uncaught error raised by the running script.
    #[error("Script '{script}' failed: {message}")]
    Execution { script: String, message: String },

    #[error("Script '{script}' interrupted after {timeout_ms}ms")]
    Timeout { script: String, timeout_ms: u64 },

    #[error("Document store error: {message}")]
    Store { message: String },

    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

pub type AppResult<T> = Result<T, AppError>;

impl AppError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound {
            message: message.into(),
        }
    }

    pub fn permission(message: impl Into<String>) -> Self {
        Self::Permission {
            message: message.into(),
        }
    }

    pub fn execution(script: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Execution {
            script: script.into(),
            message: message.into(),
        }
    }

    pub fn store(message: impl Into<String>) -> Self {
        Self::Store {
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    pub fn code(&self) -> ErrorCode {
        match self {
            AppError::Validation { .. } => ErrorCode::ValidationError,
            AppError::NotFound { .. } => ErrorCode::NotFound,
            AppError::Permission { .. } => ErrorCode::Forbidden,
            AppError::Execution { .. } => ErrorCode::ScriptExecutionFailed,
            AppError::Timeout { .. } => ErrorCode::ScriptTimeout,
            AppError::Store { .. } => ErrorCode::DatabaseError,
            AppError::Config { .. } => ErrorCode::ConfigurationError,
            AppError::Internal { .. } => ErrorCode::InternalServerError,
        }
    }

    /// Convert to HTTP status code
    pub fn status_code(&self) -> u16 {
        self.code().status()
    }

    pub fn to_error_response(&self) -> ErrorResponse {
        let code = self.code();
        ErrorResponse {
            status: code.status(),
            error: ErrorDetails {
                code,
                message: self.to_string(),
                timestamp: chrono::Utc::now().to_rfc3339(),
            },
        }
    }
}

/// Error classification surfaced to HTTP callers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    NotFound,
    Forbidden,
    ValidationError,
    ScriptExecutionFailed,
    ScriptTimeout,
    DatabaseError,
    ConfigurationError,
    InternalServerError,
}

impl ErrorCode {
    pub fn status(self) -> u16 {
        match self {
            ErrorCode::NotFound => 404,
            ErrorCode::Forbidden => 403,
            ErrorCode::ValidationError => 400,
            ErrorCode::ScriptExecutionFailed => 500,
            ErrorCode::ScriptTimeout => 504,
            ErrorCode::DatabaseError => 500,
            ErrorCode::ConfigurationError => 500,
            ErrorCode::InternalServerError => 500,
        }
    }
}

/// Structured error response format
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: ErrorDetails,
    pub status: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorDetails {
    pub code: ErrorCode,
    pub message: String,
    pub timestamp: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_serialization() {
        let serialized = serde_json::to_string(&ErrorCode::ScriptExecutionFailed).unwrap();
        assert_eq!(serialized, "\"SCRIPT_EXECUTION_FAILED\"");
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(AppError::validation("bad").status_code(), 400);
        assert_eq!(AppError::not_found("x").status_code(), 404);
        assert_eq!(AppError::permission("guest").status_code(), 403);
        assert_eq!(AppError::execution("s", "boom").status_code(), 500);
        assert_eq!(
            AppError::Timeout {
                script: "s".into(),
                timeout_ms: 10
            }
            .status_code(),
            504
        );
    }

    #[test]
    fn test_error_response_carries_message() {
        let response = AppError::execution("nightly", "ReferenceError: x").to_error_response();

        assert_eq!(response.status, 500);
        assert_eq!(response.error.code, ErrorCode::ScriptExecutionFailed);
        assert!(response.error.message.contains("nightly"));
        assert!(response.error.message.contains("ReferenceError"));
    }
}
