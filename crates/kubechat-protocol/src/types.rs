//! Shared enums used by both directions of the protocol.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Risk label attached to a command before it runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SafetyLevel {
    Safe,
    Warning,
    Dangerous,
}

impl SafetyLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            SafetyLevel::Safe => "safe",
            SafetyLevel::Warning => "warning",
            SafetyLevel::Dangerous => "dangerous",
        }
    }
}

impl fmt::Display for SafetyLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SafetyLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "safe" => Ok(SafetyLevel::Safe),
            "warning" => Ok(SafetyLevel::Warning),
            "dangerous" => Ok(SafetyLevel::Dangerous),
            _ => Err(format!("unknown safety level: {}", s)),
        }
    }
}

/// Lifecycle state of a command execution.
///
/// `Queued -> Running -> {Completed | Failed | Cancelled}`. A queued command may
/// also be cancelled or failed before it ever starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl CommandStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            CommandStatus::Completed | CommandStatus::Failed | CommandStatus::Cancelled
        )
    }

    /// Whether the state machine permits moving from `self` to `next`.
    pub fn can_transition_to(&self, next: CommandStatus) -> bool {
        match (self, next) {
            (CommandStatus::Queued, CommandStatus::Running) => true,
            (CommandStatus::Queued, CommandStatus::Failed | CommandStatus::Cancelled) => true,
            (
                CommandStatus::Running,
                CommandStatus::Completed | CommandStatus::Failed | CommandStatus::Cancelled,
            ) => true,
            _ => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CommandStatus::Queued => "queued",
            CommandStatus::Running => "running",
            CommandStatus::Completed => "completed",
            CommandStatus::Failed => "failed",
            CommandStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for CommandStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Notification channels a session may subscribe to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Topic {
    Commands,
    System,
    UserActivity,
    Alerts,
    Metrics,
}

impl Topic {
    pub const ALL: [Topic; 5] = [
        Topic::Commands,
        Topic::System,
        Topic::UserActivity,
        Topic::Alerts,
        Topic::Metrics,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Topic::Commands => "commands",
            Topic::System => "system",
            Topic::UserActivity => "user_activity",
            Topic::Alerts => "alerts",
            Topic::Metrics => "metrics",
        }
    }

    /// Look up a topic by its wire name. Unknown names yield `None`.
    pub fn parse(name: &str) -> Option<Topic> {
        Topic::ALL.into_iter().find(|t| t.as_str() == name)
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which pipe an output chunk was read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputStream {
    Stdout,
    Stderr,
}

impl OutputStream {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutputStream::Stdout => "stdout",
            OutputStream::Stderr => "stderr",
        }
    }
}

impl fmt::Display for OutputStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stable error codes carried in `error` payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    InvalidMessage,
    InvalidMessageType,
    AuthRequired,
    AuthFailed,
    AlreadyAuthenticated,
    InvalidCommand,
    TooManyCommands,
    InvalidTopics,
    UnsafeCommand,
    EmptyCommand,
    CommandNotFound,
    NlpServiceUnavailable,
    NlpProcessingError,
    ExecutionError,
    MessageHandlingError,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::InvalidMessage => "INVALID_MESSAGE",
            ErrorCode::InvalidMessageType => "INVALID_MESSAGE_TYPE",
            ErrorCode::AuthRequired => "AUTH_REQUIRED",
            ErrorCode::AuthFailed => "AUTH_FAILED",
            ErrorCode::AlreadyAuthenticated => "ALREADY_AUTHENTICATED",
            ErrorCode::InvalidCommand => "INVALID_COMMAND",
            ErrorCode::TooManyCommands => "TOO_MANY_COMMANDS",
            ErrorCode::InvalidTopics => "INVALID_TOPICS",
            ErrorCode::UnsafeCommand => "UNSAFE_COMMAND",
            ErrorCode::EmptyCommand => "EMPTY_COMMAND",
            ErrorCode::CommandNotFound => "COMMAND_NOT_FOUND",
            ErrorCode::NlpServiceUnavailable => "NLP_SERVICE_UNAVAILABLE",
            ErrorCode::NlpProcessingError => "NLP_PROCESSING_ERROR",
            ErrorCode::ExecutionError => "EXECUTION_ERROR",
            ErrorCode::MessageHandlingError => "MESSAGE_HANDLING_ERROR",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
