//! Test utilities and common setup.
#![allow(dead_code)]

use anyhow::Result;
use async_trait::async_trait;
use kubechat::audit::{AuditRecord, AuditSink};
use kubechat::auth::{AuthConfig, DevUser, IdentityVerifier, JwtIdentityVerifier, Role};
use kubechat::nlp::{CommandGenerator, GeneratedCommand, GenerationError, GenerationRequest, GenerationResult};
use kubechat::ws::{Session, SessionConnection};
use kubechat::{HubConfig, KubeChat};
use kubechat_protocol::{OutboundMessage, SafetyLevel, ServerMessage};
use serde_json::{Value, json};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

pub const WAIT: Duration = Duration::from_secs(10);

fn test_auth_config() -> AuthConfig {
    AuthConfig {
        dev_mode: true,
        jwt_secret: Some("test-secret-for-integration-tests-minimum-32-chars".to_string()),
        dev_users: vec![
            DevUser {
                id: "alice".to_string(),
                name: "Alice".to_string(),
                role: Role::Admin,
            },
            DevUser {
                id: "bob".to_string(),
                name: "Bob".to_string(),
                role: Role::User,
            },
        ],
    }
}

pub fn verifier() -> Arc<dyn IdentityVerifier> {
    Arc::new(JwtIdentityVerifier::new(test_auth_config()))
}

/// Hub settings for tests: commands run `executable` instead of kubectl and
/// the background sweep is effectively disabled.
pub fn hub_config(executable: &str) -> HubConfig {
    HubConfig {
        allowed_executable: executable.to_string(),
        heartbeat_interval: Duration::from_secs(3600),
        command_timeout: Duration::from_secs(30),
        ..HubConfig::default()
    }
}

pub fn start(config: HubConfig) -> KubeChat {
    KubeChat::builder(config).verifier(verifier()).start()
}

/// Records every audit record in memory.
#[derive(Default)]
pub struct MemoryAuditSink {
    pub records: Mutex<Vec<AuditRecord>>,
}

impl MemoryAuditSink {
    pub fn snapshot(&self) -> Vec<AuditRecord> {
        self.records.lock().unwrap().clone()
    }
}

#[async_trait]
impl AuditSink for MemoryAuditSink {
    async fn record(&self, record: AuditRecord) -> Result<()> {
        self.records.lock().unwrap().push(record);
        Ok(())
    }
}

/// Answers every query with a fixed command, or fails.
pub struct StaticGenerator {
    pub command: Option<String>,
    pub safety_level: SafetyLevel,
    pub delay: Duration,
}

impl StaticGenerator {
    pub fn answering(command: &str, safety_level: SafetyLevel) -> Self {
        Self {
            command: Some(command.to_string()),
            safety_level,
            delay: Duration::ZERO,
        }
    }

    pub fn failing() -> Self {
        Self {
            command: None,
            safety_level: SafetyLevel::Safe,
            delay: Duration::ZERO,
        }
    }
}

#[async_trait]
impl CommandGenerator for StaticGenerator {
    async fn generate(&self, _request: GenerationRequest) -> GenerationResult<GeneratedCommand> {
        tokio::time::sleep(self.delay).await;
        match &self.command {
            Some(command) => Ok(GeneratedCommand {
                command: command.clone(),
                safety_level: self.safety_level,
                explanation: None,
            }),
            None => Err(GenerationError::ApiError {
                status: 502,
                message: "model offline".to_string(),
            }),
        }
    }
}

/// A connected test client: the session plus its outbound queue.
pub struct Client {
    pub session: Session,
    pub rx: mpsc::Receiver<OutboundMessage>,
    pub closed: tokio_util::sync::CancellationToken,
}

impl Client {
    pub async fn connect(kubechat: &KubeChat) -> Self {
        let SessionConnection {
            session,
            outbound,
            closed,
        } = kubechat.connect().await.unwrap();
        let mut client = Self {
            session,
            rx: outbound,
            closed,
        };
        let ack = client.next().await;
        assert_eq!(ack.kind(), "status");
        client
    }

    pub async fn send(&mut self, kind: &str, payload: Value) {
        let frame = json!({ "type": kind, "payload": payload }).to_string();
        self.session.handle_text(&frame).await;
    }

    pub async fn send_correlated(&mut self, kind: &str, payload: Value, correlation_id: &str) {
        let frame =
            json!({ "type": kind, "payload": payload, "correlation_id": correlation_id }).to_string();
        self.session.handle_text(&frame).await;
    }

    pub async fn next(&mut self) -> OutboundMessage {
        tokio::time::timeout(WAIT, self.rx.recv())
            .await
            .expect("timed out waiting for a message")
            .expect("outbound queue closed")
    }

    /// Collect messages up to and including the first one matching `done`.
    pub async fn until(&mut self, done: impl Fn(&OutboundMessage) -> bool) -> Vec<OutboundMessage> {
        let mut seen = Vec::new();
        loop {
            let message = self.next().await;
            let finished = done(&message);
            seen.push(message);
            if finished {
                return seen;
            }
        }
    }

    /// Wait for the result of a command, returning everything seen on the way.
    pub async fn until_result(&mut self, command_id: &str) -> Vec<OutboundMessage> {
        let id = command_id.to_string();
        self.until(move |m| matches!(&m.message, ServerMessage::Result(r) if r.command_id == id))
            .await
    }

    pub async fn authenticate(&mut self, user: &str) {
        self.send("auth", json!({ "token": format!("dev:{}", user) })).await;
        match self.next().await.message {
            ServerMessage::AuthResult(result) => assert!(result.success, "auth failed for {}", user),
            other => panic!("expected auth_result, got {:?}", other),
        }
    }

    /// Submit a command and return its id from the `executing` reply.
    pub async fn execute(&mut self, command: &str, stream: bool) -> String {
        self.send(
            "execute",
            json!({ "command": command, "stream_output": stream }),
        )
        .await;
        let reply = self
            .until(|m| matches!(m.message, ServerMessage::Executing(_) | ServerMessage::Error(_)))
            .await;
        match reply.last().map(|m| &m.message) {
            Some(ServerMessage::Executing(executing)) => executing.command_id.clone(),
            other => panic!("expected executing, got {:?}", other),
        }
    }

    /// Submit a command that is expected to be refused and return the error code.
    pub async fn execute_rejected(&mut self, payload: Value) -> kubechat_protocol::ErrorCode {
        self.send("execute", payload).await;
        let reply = self
            .until(|m| matches!(m.message, ServerMessage::Executing(_) | ServerMessage::Error(_)))
            .await;
        reply
            .last()
            .and_then(error_code)
            .expect("expected an error reply")
    }
}

pub fn result_of(messages: &[OutboundMessage]) -> kubechat_protocol::ResultPayload {
    messages
        .iter()
        .find_map(|m| match &m.message {
            ServerMessage::Result(result) => Some(result.clone()),
            _ => None,
        })
        .expect("no result message")
}

pub fn error_code(message: &OutboundMessage) -> Option<kubechat_protocol::ErrorCode> {
    match &message.message {
        ServerMessage::Error(err) => Some(err.code),
        _ => None,
    }
}

pub const ADMIN_TOKEN: &str = "admin-test-token";

/// Router over a running hub, with the admin API enabled.
pub fn test_app(kubechat: KubeChat) -> axum::Router {
    kubechat::api::create_router(kubechat::api::AppState::new(
        kubechat,
        Some(ADMIN_TOKEN.to_string()),
    ))
}
