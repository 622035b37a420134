//! Audit records for command executions and session authentication.
//!
//! Records are handed to an [`AuditSink`] from a detached task so a slow or
//! failing sink never delays a command result.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use kubechat_protocol::{CommandStatus, SafetyLevel};
use log::warn;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

/// One finished command, as reported to the audit sink.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutionSummary {
    pub command_id: String,
    pub session_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_scope_id: Option<String>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub query: String,
    pub command: String,
    pub safety_level: SafetyLevel,
    pub status: CommandStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    pub duration_ms: u64,
    pub stream_output: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum AuditRecord {
    CommandExecution(ExecutionSummary),
    SessionAuthenticated {
        session_id: String,
        user_id: String,
        username: String,
        session_scope_id: String,
    },
}

impl AuditRecord {
    pub fn event_name(&self) -> &'static str {
        match self {
            AuditRecord::CommandExecution(_) => "command_execution",
            AuditRecord::SessionAuthenticated { .. } => "session_authenticated",
        }
    }
}

#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn record(&self, record: AuditRecord) -> Result<()>;

    /// Whether the sink is currently able to persist records.
    async fn is_available(&self) -> bool {
        true
    }
}

/// Hand a record to the sink without waiting for it.
pub fn dispatch(sink: Option<&Arc<dyn AuditSink>>, record: AuditRecord) {
    let Some(sink) = sink else {
        return;
    };
    let sink = Arc::clone(sink);
    tokio::spawn(async move {
        let event = record.event_name();
        if let Err(e) = sink.record(record).await {
            warn!("Failed to write {} audit record: {:?}", event, e);
        }
    });
}

/// `[audit]` configuration section.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditConfig {
    pub enabled: bool,
    /// JSON-lines file. Defaults to `<state_dir>/audit.jsonl`.
    pub path: Option<String>,
}

#[derive(Serialize)]
struct AuditLine<'a> {
    timestamp: String,
    #[serde(flatten)]
    record: &'a AuditRecord,
}

/// Appends one JSON object per line to a local file.
#[derive(Clone)]
pub struct JsonlAuditSink {
    file: Arc<Mutex<File>>,
    path: PathBuf,
    healthy: Arc<AtomicBool>,
}

impl JsonlAuditSink {
    pub async fn new(path: PathBuf) -> Result<Self> {
        ensure_parent_dir(&path)?;
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .with_context(|| format!("opening audit log file {}", path.display()))?;
        Ok(Self {
            file: Arc::new(Mutex::new(file)),
            path,
            healthy: Arc::new(AtomicBool::new(true)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn write_line(&self, line: &str) -> Result<()> {
        let mut file = self.file.lock().await;
        file.write_all(line.as_bytes()).await?;
        file.write_all(b"\n").await?;
        file.flush().await?;
        Ok(())
    }
}

#[async_trait]
impl AuditSink for JsonlAuditSink {
    async fn record(&self, record: AuditRecord) -> Result<()> {
        let line = serde_json::to_string(&AuditLine {
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            record: &record,
        })
        .context("serializing audit record")?;

        let result = self
            .write_line(&line)
            .await
            .with_context(|| format!("appending to {}", self.path.display()));
        self.healthy.store(result.is_ok(), Ordering::Relaxed);
        result
    }

    async fn is_available(&self) -> bool {
        self.healthy.load(Ordering::Relaxed)
    }
}

fn ensure_parent_dir(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating audit log directory {}", parent.display()))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn summary() -> ExecutionSummary {
        ExecutionSummary {
            command_id: "cmd-1".to_string(),
            session_id: "sess-1".to_string(),
            user_id: Some("u-1".to_string()),
            session_scope_id: None,
            query: String::new(),
            command: "kubectl get pods".to_string(),
            safety_level: SafetyLevel::Safe,
            status: CommandStatus::Completed,
            exit_code: Some(0),
            duration_ms: 12,
            stream_output: false,
            error: None,
            started_at: Utc::now(),
            completed_at: Some(Utc::now()),
        }
    }

    #[tokio::test]
    async fn test_jsonl_sink_appends_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("audit.jsonl");
        let sink = JsonlAuditSink::new(path.clone()).await.unwrap();

        sink.record(AuditRecord::CommandExecution(summary()))
            .await
            .unwrap();
        sink.record(AuditRecord::SessionAuthenticated {
            session_id: "sess-1".to_string(),
            user_id: "u-1".to_string(),
            username: "alice".to_string(),
            session_scope_id: "scope".to_string(),
        })
        .await
        .unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<serde_json::Value> = contents
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["event"], "command_execution");
        assert_eq!(lines[0]["status"], "completed");
        assert_eq!(lines[0]["exit_code"], 0);
        assert!(lines[0]["timestamp"].is_string());
        assert_eq!(lines[1]["event"], "session_authenticated");
        assert!(sink.is_available().await);
    }
}
