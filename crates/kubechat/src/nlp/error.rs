//! Command generation client error types.

use thiserror::Error;

/// Result type for command generation.
pub type GenerationResult<T> = Result<T, GenerationError>;

/// Errors that can occur while turning a query into a command.
#[derive(Debug, Error)]
pub enum GenerationError {
    /// HTTP request failed.
    #[error("HTTP request failed: {0}")]
    RequestFailed(#[from] reqwest::Error),

    /// The service answered with an error.
    #[error("generation service error: {message} (status: {status})")]
    ApiError { status: u16, message: String },

    /// The service produced no command.
    #[error("generation service returned an empty command")]
    EmptyCommand,

    /// Failed to parse response.
    #[error("Failed to parse response: {0}")]
    ParseError(String),

    /// Connection failed.
    #[error("Failed to connect to generation service at {url}: {message}")]
    ConnectionFailed { url: String, message: String },
}
