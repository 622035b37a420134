//! Command submission, execution and cancellation.

use chrono::Utc;
use kubechat_protocol::{
    CommandStatus, ExecutePayload, ExecutingPayload, OutputPayload, ProgressPayload,
    SafetyLevel, ServerMessage, StatusPayload, Topic,
};
use log::{debug, info, warn};
use std::sync::Arc;

use super::execution::{CommandExecution, CommandHandle};
use super::process::{self, ChunkSink, ProcessOutcome, ProcessOutput, RunOptions};
use super::safety;
use crate::audit::{self, AuditRecord, AuditSink};
use crate::auth::Identity;
use crate::config::HubConfig;
use crate::error::HubError;
use crate::nlp::{CommandGenerator, GenerationRequest};
use crate::ws::hub::HubHandle;
use crate::ws::SessionSender;
use crate::ws::topics;

/// Turns execute requests into running processes.
///
/// The engine itself holds no per-session state: the in-flight set lives in
/// the hub, and each admitted command runs on its own task.
#[derive(Clone)]
pub struct CommandEngine {
    config: Arc<HubConfig>,
    hub: HubHandle,
    generator: Option<Arc<dyn CommandGenerator>>,
    audit: Option<Arc<dyn AuditSink>>,
}

impl CommandEngine {
    pub fn new(
        config: Arc<HubConfig>,
        hub: HubHandle,
        generator: Option<Arc<dyn CommandGenerator>>,
        audit: Option<Arc<dyn AuditSink>>,
    ) -> Self {
        Self {
            config,
            hub,
            generator,
            audit,
        }
    }

    pub fn generator(&self) -> Option<&Arc<dyn CommandGenerator>> {
        self.generator.as_ref()
    }

    /// Validate, materialise and admit a command, then start it in the
    /// background. Returns the new command id.
    ///
    /// Nothing is registered unless every check passes.
    pub async fn submit(
        &self,
        outbound: &SessionSender,
        identity: Option<&Identity>,
        request: ExecutePayload,
        correlation_id: Option<&str>,
    ) -> Result<String, HubError> {
        let session_id = outbound.session_id();
        let literal = request.command.trim().to_string();
        let query = request.query.trim().to_string();

        if literal.is_empty() && query.is_empty() {
            return Err(HubError::InvalidCommand);
        }

        let (command, safety_level) = if literal.is_empty() {
            // Reject before spending a generation call
            let in_flight = self.hub.in_flight(session_id).await?;
            if in_flight.len() >= self.config.max_concurrent_commands {
                return Err(HubError::TooManyCommands {
                    limit: self.config.max_concurrent_commands,
                });
            }
            self.generate(&request, &query, identity).await?
        } else {
            let level = safety::classify(&literal);
            (literal, level)
        };

        let argv: Vec<String> = safety::check_allowed(&command, &self.config.allowed_executable)?
            .into_iter()
            .map(str::to_string)
            .collect();

        let mut execution =
            CommandExecution::new(session_id, &command, safety_level, request.stream_output);
        execution.query = query;
        if let Some(identity) = identity {
            execution.user_id = Some(identity.user_id.clone());
            execution.session_scope_id = Some(identity.session_scope_id.clone());
        }
        let started_at = execution.started_at;

        let handle = self.hub.register_command(session_id, execution).await?;
        let command_id = handle.id.clone();
        info!(
            "Session {}: command {} admitted ({}, {}, stream={})",
            session_id, command_id, command, safety_level, request.stream_output
        );

        outbound.send_correlated(
            ServerMessage::Executing(ExecutingPayload {
                command_id: command_id.clone(),
                command,
                safety_level,
                estimated_time: None,
                started_at,
            }),
            correlation_id,
        );

        let task = ExecutionTask {
            handle,
            argv,
            outbound: outbound.clone(),
            hub: self.hub.clone(),
            config: Arc::clone(&self.config),
            audit: self.audit.clone(),
            correlation_id: correlation_id.map(str::to_string),
        };
        task.progress(0.0, "admitted", None);
        tokio::spawn(task.run());

        Ok(command_id)
    }

    async fn generate(
        &self,
        request: &ExecutePayload,
        query: &str,
        identity: Option<&Identity>,
    ) -> Result<(String, SafetyLevel), HubError> {
        let generator = self.generator.as_ref().ok_or(HubError::NlpUnavailable)?;
        let generation = GenerationRequest {
            query: query.to_string(),
            context: request.context.clone(),
            cluster_info: request.cluster_info.clone(),
            namespace: request.namespace.clone(),
            provider: request.provider.clone(),
            user_id: identity.map(|i| i.user_id.clone()),
            session_scope_id: identity.map(|i| i.session_scope_id.clone()),
        };

        let generated = match tokio::time::timeout(
            self.config.nlp_timeout,
            generator.generate(generation),
        )
        .await
        {
            Ok(Ok(generated)) => generated,
            Ok(Err(e)) => {
                warn!("Command generation failed for {:?}: {}", query, e);
                return Err(HubError::NlpFailed(e.to_string()));
            }
            Err(_) => {
                warn!(
                    "Command generation timed out after {:?} for {:?}",
                    self.config.nlp_timeout, query
                );
                return Err(HubError::NlpFailed(format!(
                    "timed out after {}s",
                    self.config.nlp_timeout.as_secs()
                )));
            }
        };

        let command = generated.command.trim().to_string();
        // The provider may understate risk; never report less than the local view
        let level = generated.safety_level.max(safety::classify(&command));
        debug!("Generated {:?} from query {:?} ({})", command, query, level);
        Ok((command, level))
    }

    /// Cancel an in-flight command and confirm to the requesting session.
    pub async fn cancel(
        &self,
        outbound: &SessionSender,
        command_id: &str,
        reason: Option<&str>,
        correlation_id: Option<&str>,
    ) -> Result<CommandExecution, HubError> {
        let cancelled = self
            .hub
            .cancel_command(outbound.session_id(), command_id)
            .await?;
        let reason = reason.unwrap_or("cancelled by user");
        info!(
            "Session {}: command {} cancelled ({})",
            outbound.session_id(),
            command_id,
            reason
        );

        outbound.send_correlated(
            ServerMessage::Status(
                StatusPayload::new("command", "cancelled", "Command cancelled")
                    .with_metadata("command_id", command_id)
                    .with_metadata("reason", reason),
            ),
            correlation_id,
        );
        Ok(cancelled)
    }
}

/// One admitted command, run to completion on its own task.
struct ExecutionTask {
    handle: CommandHandle,
    argv: Vec<String>,
    outbound: SessionSender,
    hub: HubHandle,
    config: Arc<HubConfig>,
    audit: Option<Arc<dyn AuditSink>>,
    correlation_id: Option<String>,
}

impl ExecutionTask {
    fn progress(&self, percentage: f64, stage: &str, description: Option<&str>) {
        self.outbound.send(ServerMessage::Progress(ProgressPayload {
            command_id: self.handle.id.clone(),
            percentage,
            stage: stage.to_string(),
            description: description.map(str::to_string),
            timestamp: Utc::now(),
        }));
    }

    async fn run(self) {
        let (started, stream) = {
            let mut record = self.handle.record.lock().await;
            (record.transition(CommandStatus::Running), record.stream_output)
        };

        let mut ran = false;
        if started {
            self.progress(10.0, "preparing", Some("Preparing command"));
            self.progress(30.0, "executing", Some("Running command"));
            ran = self.execute(stream).await;
        } else {
            debug!("command {} cancelled before start", self.handle.id);
        }

        let execution = self.handle.snapshot().await;
        if ran && matches!(execution.status, CommandStatus::Completed | CommandStatus::Failed) {
            self.progress(100.0, "completed", None);
        }
        self.outbound.send_correlated(
            ServerMessage::Result(execution.to_result()),
            self.correlation_id.as_deref(),
        );

        info!(
            "Command {} ({}) finished: {} in {}ms",
            execution.id,
            execution.command,
            execution.status,
            execution.duration_ms()
        );

        self.hub
            .command_finished(&execution.session_id, &execution.id, execution.status)
            .await;
        self.hub
            .publish_detached(
                vec![Topic::Commands],
                topics::command_notification(&execution),
            )
            .await;
        audit::dispatch(
            self.audit.as_ref(),
            AuditRecord::CommandExecution(execution.summary()),
        );
    }

    /// Run the process and record the outcome. Returns `false` if it never started.
    async fn execute(&self, stream: bool) -> bool {
        let sink = stream.then(|| self.output_sink());
        let options = RunOptions {
            timeout: self.config.command_timeout,
            chunk_size: self.config.output_chunk_size,
            sink,
        };
        let argv: Vec<&str> = self.argv.iter().map(String::as_str).collect();

        match process::run(&argv, options, &self.handle.token).await {
            Ok(output) => {
                let mut record = self.handle.record.lock().await;
                // A cancel may already have closed the record
                if !record.is_terminal() {
                    self.record_output(&mut record, &output, stream);
                }
                true
            }
            Err(e) => {
                warn!("Command {} failed to start: {}", self.handle.id, e);
                let message = format!("failed to start {}: {}", self.config.allowed_executable, e);
                {
                    let mut record = self.handle.record.lock().await;
                    if record.transition(CommandStatus::Failed) {
                        record.error = Some(message.clone());
                    }
                }
                self.outbound.send_error(
                    &HubError::Execution(message),
                    Some(&self.handle.id),
                    self.correlation_id.as_deref(),
                );
                false
            }
        }
    }

    fn record_output(&self, record: &mut CommandExecution, output: &ProcessOutput, stream: bool) {
        match output.outcome {
            ProcessOutcome::Exited { code } => {
                record.exit_code = code;
                record.output = captured_output(output, stream);
                if code == Some(0) {
                    record.transition(CommandStatus::Completed);
                    return;
                }
                record.transition(CommandStatus::Failed);
                let status = match code {
                    Some(code) => format!("exit status {}", code),
                    None => "terminated by signal".to_string(),
                };
                let stderr = output.stderr_lossy();
                record.error = if stream && !stderr.trim().is_empty() {
                    Some(stderr)
                } else {
                    Some(status)
                };
            }
            ProcessOutcome::TimedOut => {
                record.output = captured_output(output, stream);
                record.transition(CommandStatus::Failed);
                record.error = Some(format!(
                    "command timed out after {}s",
                    self.config.command_timeout.as_secs()
                ));
            }
            ProcessOutcome::Cancelled => {
                record.transition(CommandStatus::Cancelled);
            }
        }
    }

    fn output_sink(&self) -> ChunkSink {
        let outbound = self.outbound.clone();
        let command_id = self.handle.id.clone();
        Arc::new(move |stream, text| {
            outbound.send(ServerMessage::Output(OutputPayload {
                command_id: command_id.clone(),
                content: text.to_string(),
                stream,
                timestamp: Utc::now(),
            }));
        })
    }
}

/// Output kept on the record: stdout alone when streaming (stderr was already
/// sent as its own chunks), both streams otherwise.
fn captured_output(output: &ProcessOutput, stream: bool) -> String {
    if stream {
        output.stdout_lossy()
    } else {
        output.combined_lossy()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn output(outcome: ProcessOutcome) -> ProcessOutput {
        ProcessOutput {
            outcome,
            stdout: b"partial\n".to_vec(),
            stderr: b"warning\n".to_vec(),
        }
    }

    #[test]
    fn test_streamed_output_is_stdout_on_every_outcome() {
        for outcome in [
            ProcessOutcome::Exited { code: Some(1) },
            ProcessOutcome::TimedOut,
        ] {
            assert_eq!(captured_output(&output(outcome), true), "partial\n");
            assert_eq!(
                captured_output(&output(outcome), false),
                "partial\nwarning\n"
            );
        }
    }
}
