//! Hub error type.
//!
//! Every variant maps to a stable wire code so session dispatch can turn any
//! failure into an `error` message without losing information.

use kubechat_protocol::ErrorCode;
use thiserror::Error;

/// Errors produced by the hub, the command engine and session dispatch.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HubError {
    #[error("Authentication required")]
    AuthRequired,

    #[error("Authentication failed: {0}")]
    AuthFailed(String),

    #[error("Session is already authenticated")]
    AlreadyAuthenticated,

    #[error("Command or query is required")]
    InvalidCommand,

    #[error("Maximum concurrent commands exceeded (limit {limit})")]
    TooManyCommands { limit: usize },

    #[error("No valid topics provided")]
    InvalidTopics,

    #[error("Only {0} commands are allowed")]
    UnsafeCommand(String),

    #[error("Command is empty")]
    EmptyCommand,

    #[error("Command not found: {0}")]
    CommandNotFound(String),

    #[error("Command generation service not available")]
    NlpUnavailable,

    #[error("Failed to process query: {0}")]
    NlpFailed(String),

    #[error("Execution error: {0}")]
    Execution(String),

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Maximum sessions reached (limit {limit})")]
    CapacityExceeded { limit: usize },

    #[error("Hub is not running")]
    HubClosed,
}

impl HubError {
    /// Wire code carried in the `error` payload.
    pub fn code(&self) -> ErrorCode {
        match self {
            HubError::AuthRequired => ErrorCode::AuthRequired,
            HubError::AuthFailed(_) => ErrorCode::AuthFailed,
            HubError::AlreadyAuthenticated => ErrorCode::AlreadyAuthenticated,
            HubError::InvalidCommand => ErrorCode::InvalidCommand,
            HubError::TooManyCommands { .. } => ErrorCode::TooManyCommands,
            HubError::InvalidTopics => ErrorCode::InvalidTopics,
            HubError::UnsafeCommand(_) => ErrorCode::UnsafeCommand,
            HubError::EmptyCommand => ErrorCode::EmptyCommand,
            HubError::CommandNotFound(_) => ErrorCode::CommandNotFound,
            HubError::NlpUnavailable => ErrorCode::NlpServiceUnavailable,
            HubError::NlpFailed(_) => ErrorCode::NlpProcessingError,
            HubError::Execution(_) => ErrorCode::ExecutionError,
            HubError::SessionNotFound(_) | HubError::CapacityExceeded { .. } | HubError::HubClosed => {
                ErrorCode::MessageHandlingError
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes() {
        assert_eq!(
            HubError::TooManyCommands { limit: 10 }.code(),
            ErrorCode::TooManyCommands
        );
        assert_eq!(
            HubError::CommandNotFound("x".into()).code(),
            ErrorCode::CommandNotFound
        );
        assert_eq!(HubError::NlpUnavailable.code(), ErrorCode::NlpServiceUnavailable);
        assert_eq!(HubError::HubClosed.code(), ErrorCode::MessageHandlingError);
    }

    #[test]
    fn test_display() {
        assert_eq!(
            HubError::UnsafeCommand("kubectl".into()).to_string(),
            "Only kubectl commands are allowed"
        );
    }
}
