//! Application error model with MCP error mapping
//!
//! Defines a typed error hierarchy using `thiserror` for internal error handling,
//! and maps each variant to the appropriate MCP `ErrorData` type for protocol
//! compliance.

use rmcp::model::ErrorData;
use serde_json::json;
use thiserror::Error;

use crate::compose::ComposeError;
use crate::mailbox::MailboxError;

/// Application error type
///
/// Covers all error cases a tool call may surface. Batch and rule-run failures
/// are accumulated into result payloads instead and never reach this type
/// unless the whole operation cannot start.
#[derive(Debug, Error)]
pub enum AppError {
    /// Missing or malformed tool argument (caller error, never retried)
    #[error("invalid input: {0}")]
    InvalidInput(String),
    /// Semantically invalid given current state (rule index out of range,
    /// unknown label name, rule without search criteria)
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    /// Remote resource not found (message, label)
    #[error("not found: {0}")]
    NotFound(String),
    /// Missing or rejected OAuth credentials
    #[error("authentication failed: {0}")]
    AuthFailed(String),
    /// Remote call exceeded the configured request timeout
    #[error("operation timed out: {0}")]
    Timeout(String),
    /// Internal error (unexpected failure from the mailbox or filesystem)
    #[error("internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// Convenience constructor for `InvalidInput`
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }

    /// Convenience constructor for `InvalidRequest`
    pub fn request(msg: impl Into<String>) -> Self {
        Self::InvalidRequest(msg.into())
    }

    /// Convert to MCP `ErrorData`
    ///
    /// # Mappings
    ///
    /// - `InvalidInput` → `invalid_params`
    /// - `InvalidRequest` → `invalid_request`
    /// - `NotFound` → `resource_not_found`
    /// - `AuthFailed` → `invalid_request`
    /// - `Timeout` → `internal_error`
    /// - `Internal` → `internal_error`
    pub fn to_error_data(&self) -> ErrorData {
        match self {
            Self::InvalidInput(msg) => {
                ErrorData::invalid_params(msg.clone(), Some(json!({ "code": "invalid_input" })))
            }
            Self::InvalidRequest(msg) => {
                ErrorData::invalid_request(msg.clone(), Some(json!({ "code": "invalid_request" })))
            }
            Self::NotFound(msg) => {
                ErrorData::resource_not_found(msg.clone(), Some(json!({ "code": "not_found" })))
            }
            Self::AuthFailed(msg) => {
                ErrorData::invalid_request(msg.clone(), Some(json!({ "code": "auth_failed" })))
            }
            Self::Timeout(msg) => {
                ErrorData::internal_error(msg.clone(), Some(json!({ "code": "timeout" })))
            }
            Self::Internal(msg) => {
                ErrorData::internal_error(msg.clone(), Some(json!({ "code": "internal" })))
            }
        }
    }
}

impl From<MailboxError> for AppError {
    fn from(err: MailboxError) -> Self {
        match err {
            MailboxError::Api { status: 404, message } => Self::NotFound(message),
            MailboxError::Api {
                status: 400,
                message,
            } => Self::InvalidRequest(message),
            MailboxError::Unauthorized | MailboxError::Auth(_) => Self::AuthFailed(err.to_string()),
            MailboxError::Timeout(msg) => Self::Timeout(msg),
            other => Self::Internal(other.to_string()),
        }
    }
}

impl From<ComposeError> for AppError {
    fn from(err: ComposeError) -> Self {
        match err {
            ComposeError::MissingRecipients => Self::InvalidInput(err.to_string()),
            ComposeError::Io(_) => Self::Internal(err.to_string()),
        }
    }
}

/// Type alias for fallible return values
pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::AppError;
    use crate::compose::ComposeError;
use crate::mailbox::MailboxError;

    #[test]
    fn maps_remote_not_found_to_not_found() {
        let err: AppError = MailboxError::Api {
            status: 404,
            message: "Requested entity was not found.".to_owned(),
        }
        .into();
        assert!(matches!(err, AppError::NotFound(_)));
    }

    #[test]
    fn maps_unexpected_remote_status_to_internal() {
        let err: AppError = MailboxError::Api {
            status: 503,
            message: "backend unavailable".to_owned(),
        }
        .into();
        assert!(matches!(err, AppError::Internal(_)));
        assert!(err.to_string().contains("503"));
    }

    #[test]
    fn compose_errors_split_caller_and_internal() {
        let err: AppError = ComposeError::MissingRecipients.into();
        assert!(matches!(err, AppError::InvalidInput(_)));
        let err: AppError = ComposeError::Io(std::io::Error::other("sink closed")).into();
        assert!(matches!(err, AppError::Internal(_)));
    }

    #[test]
    fn invalid_input_maps_to_invalid_params_code() {
        let data = AppError::invalid("label_name is required").to_error_data();
        assert_eq!(data.message, "label_name is required");
    }
}
