//! Lifecycle record for one submitted command.

use chrono::{DateTime, Utc};
use kubechat_protocol::{CommandStatus, ResultPayload, SafetyLevel};
use log::warn;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::audit::ExecutionSummary;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CommandExecution {
    pub id: String,
    pub session_id: String,
    pub user_id: Option<String>,
    pub session_scope_id: Option<String>,
    pub command: String,
    /// Natural-language query the command was generated from, if any.
    pub query: String,
    pub safety_level: SafetyLevel,
    pub status: CommandStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub exit_code: Option<i32>,
    pub output: String,
    pub error: Option<String>,
    pub stream_output: bool,
}

impl CommandExecution {
    pub fn new(
        session_id: impl Into<String>,
        command: impl Into<String>,
        safety_level: SafetyLevel,
        stream_output: bool,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            session_id: session_id.into(),
            user_id: None,
            session_scope_id: None,
            command: command.into(),
            query: String::new(),
            safety_level,
            status: CommandStatus::Queued,
            started_at: Utc::now(),
            completed_at: None,
            exit_code: None,
            output: String::new(),
            error: None,
            stream_output,
        }
    }

    /// Move along the state machine. Returns `false` and leaves the record
    /// untouched if the transition is not permitted.
    pub fn transition(&mut self, next: CommandStatus) -> bool {
        if !self.status.can_transition_to(next) {
            if self.status != next {
                warn!(
                    "command {}: refused transition {} -> {}",
                    self.id, self.status, next
                );
            }
            return false;
        }
        self.status = next;
        if next.is_terminal() {
            self.completed_at = Some(Utc::now());
        }
        true
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn duration_ms(&self) -> u64 {
        let end = self.completed_at.unwrap_or_else(Utc::now);
        (end - self.started_at).num_milliseconds().max(0) as u64
    }

    pub fn to_result(&self) -> ResultPayload {
        ResultPayload {
            command_id: self.id.clone(),
            success: self.status == CommandStatus::Completed,
            status: self.status,
            exit_code: self.exit_code,
            output: self.output.clone(),
            error: self.error.clone(),
            duration_ms: self.duration_ms(),
            safety_level: self.safety_level,
            stream_output: self.stream_output,
            timestamp: Utc::now(),
        }
    }

    pub fn summary(&self) -> ExecutionSummary {
        ExecutionSummary {
            command_id: self.id.clone(),
            session_id: self.session_id.clone(),
            user_id: self.user_id.clone(),
            session_scope_id: self.session_scope_id.clone(),
            query: self.query.clone(),
            command: self.command.clone(),
            safety_level: self.safety_level,
            status: self.status,
            exit_code: self.exit_code,
            duration_ms: self.duration_ms(),
            stream_output: self.stream_output,
            error: self.error.clone(),
            started_at: self.started_at,
            completed_at: self.completed_at,
        }
    }
}

/// Shared view of an in-flight command: the record plus its cancellation token.
///
/// The hub keeps one per in-flight command; the execution task keeps another.
/// Cancelling the token is the single way a running process gets torn down.
#[derive(Debug, Clone)]
pub struct CommandHandle {
    pub id: String,
    pub record: Arc<Mutex<CommandExecution>>,
    pub token: CancellationToken,
}

impl CommandHandle {
    pub fn new(execution: CommandExecution) -> Self {
        Self {
            id: execution.id.clone(),
            record: Arc::new(Mutex::new(execution)),
            token: CancellationToken::new(),
        }
    }

    pub async fn snapshot(&self) -> CommandExecution {
        self.record.lock().await.clone()
    }

    pub async fn status(&self) -> CommandStatus {
        self.record.lock().await.status
    }

    /// Mark the command cancelled and fire its token.
    ///
    /// Returns `false` if the command had already reached a terminal state.
    pub async fn cancel(&self) -> bool {
        let cancelled = {
            let mut record = self.record.lock().await;
            record.transition(CommandStatus::Cancelled)
        };
        if cancelled {
            self.token.cancel();
        }
        cancelled
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_states_are_final() {
        let mut exec = CommandExecution::new("s1", "kubectl get pods", SafetyLevel::Safe, false);
        assert_eq!(exec.status, CommandStatus::Queued);
        assert!(!exec.transition(CommandStatus::Completed));
        assert!(exec.transition(CommandStatus::Running));
        assert!(exec.completed_at.is_none());
        assert!(exec.transition(CommandStatus::Completed));
        assert!(exec.completed_at.is_some());
        assert!(!exec.transition(CommandStatus::Cancelled));
        assert!(!exec.transition(CommandStatus::Running));
        assert_eq!(exec.status, CommandStatus::Completed);
    }

    #[test]
    fn test_queued_can_be_cancelled() {
        let mut exec = CommandExecution::new("s1", "kubectl get pods", SafetyLevel::Safe, true);
        assert!(exec.transition(CommandStatus::Cancelled));
        assert!(exec.is_terminal());
        let result = exec.to_result();
        assert!(!result.success);
        assert_eq!(result.status, CommandStatus::Cancelled);
        assert!(result.stream_output);
    }

    #[tokio::test]
    async fn test_handle_cancel_only_once() {
        let handle = CommandHandle::new(CommandExecution::new(
            "s1",
            "kubectl get pods",
            SafetyLevel::Safe,
            false,
        ));
        assert!(handle.cancel().await);
        assert!(handle.token.is_cancelled());
        assert!(!handle.cancel().await);
        assert_eq!(handle.status().await, CommandStatus::Cancelled);
        assert!(handle.snapshot().await.completed_at.is_some());
    }
}
