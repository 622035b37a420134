//! The hub as seen by the rest of the process.
//!
//! [`KubeChat`] wires the control loop, the command engine and the external
//! collaborators together, hands out [`Session`]s to the transport and exposes
//! the operations other subsystems use to drive the hub.

use chrono::{DateTime, Utc};
use kubechat_protocol::{OutboundMessage, Priority, ServerMessage, Topic};
use log::{info, warn};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::hub::{DeliveryReport, Hub, HubHandle, HubMetrics, RemovalReason, SessionDescriptor};
use super::outbound::SessionSender;
use super::session::Session;
use super::topics;
use crate::audit::AuditSink;
use crate::auth::IdentityVerifier;
use crate::commands::CommandEngine;
use crate::config::HubConfig;
use crate::error::HubError;
use crate::nlp::CommandGenerator;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    /// Running, but an optional collaborator is missing or unreachable.
    Degraded,
    Unhealthy,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub hub_running: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connected_sessions: Option<usize>,
    pub nlp_available: bool,
    pub audit_available: bool,
    pub checked_at: DateTime<Utc>,
}

/// A freshly admitted session and the ends the transport needs.
pub struct SessionConnection {
    pub session: Session,
    /// Frames to write to the client, in order.
    pub outbound: mpsc::Receiver<OutboundMessage>,
    /// Fired when the hub removes the session.
    pub closed: CancellationToken,
}

struct Inner {
    config: Arc<HubConfig>,
    hub: HubHandle,
    engine: CommandEngine,
    verifier: Option<Arc<dyn IdentityVerifier>>,
    generator: Option<Arc<dyn CommandGenerator>>,
    audit: Option<Arc<dyn AuditSink>>,
    control_loop: Mutex<Option<JoinHandle<()>>>,
}

#[derive(Clone)]
pub struct KubeChat {
    inner: Arc<Inner>,
}

pub struct KubeChatBuilder {
    config: HubConfig,
    verifier: Option<Arc<dyn IdentityVerifier>>,
    generator: Option<Arc<dyn CommandGenerator>>,
    audit: Option<Arc<dyn AuditSink>>,
}

impl KubeChatBuilder {
    pub fn verifier(mut self, verifier: Arc<dyn IdentityVerifier>) -> Self {
        self.verifier = Some(verifier);
        self
    }

    pub fn generator(mut self, generator: Arc<dyn CommandGenerator>) -> Self {
        self.generator = Some(generator);
        self
    }

    pub fn audit(mut self, audit: Arc<dyn AuditSink>) -> Self {
        self.audit = Some(audit);
        self
    }

    /// Spawn the control loop. Must be called inside a Tokio runtime.
    pub fn start(self) -> KubeChat {
        let config = Arc::new(self.config);
        let (hub, control_loop) = Hub::spawn(Arc::clone(&config));
        let engine = CommandEngine::new(
            Arc::clone(&config),
            hub.clone(),
            self.generator.clone(),
            self.audit.clone(),
        );
        info!(
            "KubeChat hub started (require_auth={}, max_sessions={}, executable={})",
            config.require_auth, config.max_sessions, config.allowed_executable
        );
        KubeChat {
            inner: Arc::new(Inner {
                config,
                hub,
                engine,
                verifier: self.verifier,
                generator: self.generator,
                audit: self.audit,
                control_loop: Mutex::new(Some(control_loop)),
            }),
        }
    }
}

impl KubeChat {
    pub fn builder(config: HubConfig) -> KubeChatBuilder {
        KubeChatBuilder {
            config,
            verifier: None,
            generator: None,
            audit: None,
        }
    }

    pub fn config(&self) -> &HubConfig {
        &self.inner.config
    }

    pub fn hub(&self) -> &HubHandle {
        &self.inner.hub
    }

    /// Admit a new connection.
    pub async fn connect(&self) -> Result<SessionConnection, HubError> {
        let inner = &self.inner;
        let limit = inner.config.max_sessions;
        if inner.hub.session_count().await? >= limit {
            warn!("Rejecting connection: {} sessions connected", limit);
            return Err(HubError::CapacityExceeded { limit });
        }

        let (tx, rx) = mpsc::channel(inner.config.outbound_queue_size);
        let closed = CancellationToken::new();
        let session_id = uuid::Uuid::new_v4().to_string();
        inner.hub.admit(&session_id, tx.clone(), closed.clone()).await?;

        let outbound = SessionSender::new(session_id, tx, closed.clone(), inner.hub.clone());
        let session = Session::new(
            outbound,
            inner.hub.clone(),
            inner.engine.clone(),
            inner.verifier.clone(),
            inner.audit.clone(),
            Arc::clone(&inner.config),
        );
        Ok(SessionConnection {
            session,
            outbound: rx,
            closed,
        })
    }

    pub async fn send_to_user(
        &self,
        user_id: &str,
        message: ServerMessage,
    ) -> Result<DeliveryReport, HubError> {
        self.inner.hub.send_to_user(user_id, message).await
    }

    pub async fn broadcast(&self, message: ServerMessage) -> Result<DeliveryReport, HubError> {
        self.inner.hub.broadcast(message).await
    }

    pub async fn publish(
        &self,
        topics: Vec<Topic>,
        message: ServerMessage,
    ) -> Result<DeliveryReport, HubError> {
        self.inner.hub.publish(topics, message).await
    }

    pub async fn session_count(&self) -> Result<usize, HubError> {
        self.inner.hub.session_count().await
    }

    /// Force a session off the hub. Returns `false` if it was not connected.
    pub async fn disconnect(&self, session_id: &str) -> Result<bool, HubError> {
        self.inner.hub.remove(session_id, RemovalReason::Forced).await
    }

    pub async fn metrics(&self) -> Result<HubMetrics, HubError> {
        self.inner.hub.metrics().await
    }

    pub async fn sessions(&self) -> Result<Vec<SessionDescriptor>, HubError> {
        self.inner.hub.sessions().await
    }

    /// Notice on the `system` topic.
    pub async fn system_notice(
        &self,
        title: &str,
        message: &str,
    ) -> Result<DeliveryReport, HubError> {
        let notice = topics::notice("system", title, message, Priority::Normal);
        self.publish(vec![Topic::System], notice).await
    }

    /// Notice on the `alerts` topic.
    pub async fn alert(
        &self,
        title: &str,
        message: &str,
        priority: Priority,
    ) -> Result<DeliveryReport, HubError> {
        let notice = topics::notice("alert", title, message, priority);
        self.publish(vec![Topic::Alerts], notice).await
    }

    /// Publish the current metrics snapshot on the `metrics` topic.
    pub async fn publish_metrics(&self) -> Result<DeliveryReport, HubError> {
        let metrics = self.metrics().await?;
        let mut notice = topics::notice("metrics", "Hub metrics", "Metrics snapshot", Priority::Low);
        if let ServerMessage::Notification(payload) = &mut notice {
            if let Ok(serde_json::Value::Object(data)) = serde_json::to_value(&metrics) {
                payload.data = data;
            }
        }
        self.publish(vec![Topic::Metrics], notice).await
    }

    /// Liveness probe. Optional collaborators only degrade the result.
    pub async fn health(&self) -> HealthReport {
        let inner = &self.inner;
        let connected_sessions = inner.hub.session_count().await.ok();
        let hub_running = inner.hub.is_running() && connected_sessions.is_some();

        let nlp_available = match &inner.generator {
            Some(generator) => generator.is_available().await,
            None => false,
        };
        let audit_available = match &inner.audit {
            Some(audit) => audit.is_available().await,
            None => false,
        };

        let status = if !hub_running {
            HealthStatus::Unhealthy
        } else if nlp_available && audit_available {
            HealthStatus::Healthy
        } else {
            HealthStatus::Degraded
        };

        HealthReport {
            status,
            hub_running,
            connected_sessions,
            nlp_available,
            audit_available,
            checked_at: Utc::now(),
        }
    }

    /// Stop the control loop after cancelling every command and closing every
    /// session. Later calls are no-ops.
    pub async fn shutdown(&self) {
        let Some(control_loop) = self.inner.control_loop.lock().await.take() else {
            return;
        };
        if let Err(e) = self.inner.hub.shutdown().await {
            warn!("Hub shutdown request failed: {}", e);
        }
        if let Err(e) = control_loop.await {
            warn!("Hub control loop ended abnormally: {}", e);
        }
        info!("KubeChat hub stopped");
    }
}

