//! Per-connection message dispatch.

use kubechat_protocol::{
    AuthPayload, AuthResultPayload, CancelPayload, ClientMessage, ExecutePayload,
    InboundMessage, ServerMessage, StatusPayload, SubscribePayload,
};
use log::{debug, info, warn};
use std::sync::Arc;

use super::hub::{HubHandle, RemovalReason};
use super::outbound::SessionSender;
use super::registry::SessionId;
use super::topics;
use crate::audit::{self, AuditRecord, AuditSink};
use crate::auth::{Identity, IdentityVerifier};
use crate::commands::CommandEngine;
use crate::config::HubConfig;
use crate::error::HubError;

/// One connected client, driven by its reader task.
///
/// A session starts unauthenticated and may authenticate exactly once.
pub struct Session {
    id: SessionId,
    identity: Option<Identity>,
    outbound: SessionSender,
    hub: HubHandle,
    engine: CommandEngine,
    verifier: Option<Arc<dyn IdentityVerifier>>,
    audit: Option<Arc<dyn AuditSink>>,
    config: Arc<HubConfig>,
}

impl Session {
    pub(crate) fn new(
        outbound: SessionSender,
        hub: HubHandle,
        engine: CommandEngine,
        verifier: Option<Arc<dyn IdentityVerifier>>,
        audit: Option<Arc<dyn AuditSink>>,
        config: Arc<HubConfig>,
    ) -> Self {
        Self {
            id: outbound.session_id().to_string(),
            identity: None,
            outbound,
            hub,
            engine,
            verifier,
            audit,
            config,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn identity(&self) -> Option<&Identity> {
        self.identity.as_ref()
    }

    pub fn is_authenticated(&self) -> bool {
        self.identity.is_some()
    }

    pub fn is_closed(&self) -> bool {
        self.outbound.is_closed()
    }

    /// Handle one inbound text frame. Failures are reported to the client;
    /// nothing here closes the connection.
    pub async fn handle_text(&mut self, text: &str) {
        let inbound = match InboundMessage::parse(text) {
            Ok(inbound) => inbound,
            Err(e) => {
                warn!("Session {}: rejected frame: {}", self.id, e);
                self.outbound.send_correlated(
                    ServerMessage::error(e.code(), e.to_string()),
                    e.correlation_id(),
                );
                return;
            }
        };

        self.hub
            .message_received(&self.id, inbound.message.is_liveness())
            .await;

        let InboundMessage {
            message,
            correlation_id,
        } = inbound;
        let correlation_id = correlation_id.as_deref();

        if message.requires_identity() && self.config.require_auth && self.identity.is_none() {
            debug!(
                "Session {}: {} before authentication",
                self.id,
                message.kind()
            );
            self.outbound
                .send_error(&HubError::AuthRequired, None, correlation_id);
            return;
        }

        match message {
            ClientMessage::Auth(payload) => self.authenticate(payload, correlation_id).await,
            ClientMessage::Execute(payload) => self.execute(payload, correlation_id).await,
            ClientMessage::Cancel(payload) => self.cancel(payload, correlation_id).await,
            ClientMessage::Subscribe(payload) => self.subscribe(payload, correlation_id).await,
            ClientMessage::Unsubscribe(payload) => self.unsubscribe(payload, correlation_id).await,
            ClientMessage::Heartbeat(_) => {
                self.outbound.send_correlated(
                    ServerMessage::Status(StatusPayload::new(
                        "heartbeat",
                        "ok",
                        "Heartbeat received",
                    )),
                    correlation_id,
                );
            }
            ClientMessage::Pong(_) => {}
        }
    }

    async fn authenticate(&mut self, payload: AuthPayload, correlation_id: Option<&str>) {
        if self.identity.is_some() {
            self.outbound
                .send_error(&HubError::AlreadyAuthenticated, None, correlation_id);
            return;
        }
        let Some(verifier) = self.verifier.as_ref() else {
            self.outbound.send_error(
                &HubError::AuthFailed("no identity verifier configured".to_string()),
                None,
                correlation_id,
            );
            return;
        };

        let identity = match verifier.validate(&payload.token).await {
            Ok(identity) => identity,
            Err(e) => {
                warn!("Session {}: authentication failed: {}", self.id, e);
                self.outbound.send_correlated(
                    ServerMessage::AuthResult(AuthResultPayload {
                        success: false,
                        user_id: None,
                        username: None,
                        role: None,
                        session_id: None,
                        error: Some("Invalid token".to_string()),
                    }),
                    correlation_id,
                );
                return;
            }
        };

        if let Err(e) = self.hub.authenticate(&self.id, identity.clone()).await {
            self.outbound.send_error(&e, None, correlation_id);
            return;
        }

        info!(
            "Session {} authenticated as {} ({})",
            self.id, identity.user_id, identity.role
        );
        self.outbound.send_correlated(
            ServerMessage::AuthResult(AuthResultPayload {
                success: true,
                user_id: Some(identity.user_id.clone()),
                username: Some(identity.username.clone()),
                role: Some(identity.role.to_string()),
                session_id: Some(self.id.clone()),
                error: None,
            }),
            correlation_id,
        );
        audit::dispatch(
            self.audit.as_ref(),
            AuditRecord::SessionAuthenticated {
                session_id: self.id.clone(),
                user_id: identity.user_id.clone(),
                username: identity.username.clone(),
                session_scope_id: identity.session_scope_id.clone(),
            },
        );
        self.identity = Some(identity);
    }

    async fn execute(&mut self, payload: ExecutePayload, correlation_id: Option<&str>) {
        let result = self
            .engine
            .submit(&self.outbound, self.identity.as_ref(), payload, correlation_id)
            .await;
        if let Err(e) = result {
            debug!("Session {}: execute rejected: {}", self.id, e);
            self.outbound.send_error(&e, None, correlation_id);
        }
    }

    async fn cancel(&mut self, payload: CancelPayload, correlation_id: Option<&str>) {
        let result = self
            .engine
            .cancel(
                &self.outbound,
                &payload.command_id,
                payload.reason.as_deref(),
                correlation_id,
            )
            .await;
        if let Err(e) = result {
            debug!(
                "Session {}: cancel {} rejected: {}",
                self.id, payload.command_id, e
            );
            self.outbound
                .send_error(&e, Some(&payload.command_id), correlation_id);
        }
    }

    async fn subscribe(&mut self, payload: SubscribePayload, correlation_id: Option<&str>) {
        let requested = topics::resolve_topics(&self.id, &payload.topics);
        if requested.is_empty() {
            self.outbound
                .send_error(&HubError::InvalidTopics, None, correlation_id);
            return;
        }
        match self.hub.subscribe(&self.id, requested.clone()).await {
            Ok(()) => {
                self.outbound.send_correlated(
                    topics::subscription_status("subscribed", &requested),
                    correlation_id,
                );
            }
            Err(e) => {
                self.outbound.send_error(&e, None, correlation_id);
            }
        }
    }

    async fn unsubscribe(&mut self, payload: SubscribePayload, correlation_id: Option<&str>) {
        let requested = topics::resolve_topics(&self.id, &payload.topics);
        if requested.is_empty() {
            self.outbound
                .send_error(&HubError::InvalidTopics, None, correlation_id);
            return;
        }
        match self.hub.unsubscribe(&self.id, requested.clone()).await {
            Ok(()) => {
                self.outbound.send_correlated(
                    topics::subscription_status("unsubscribed", &requested),
                    correlation_id,
                );
            }
            Err(e) => {
                self.outbound.send_error(&e, None, correlation_id);
            }
        }
    }

    /// Transport-level liveness (WebSocket pong frames).
    pub async fn touch(&self) {
        self.hub.touch(&self.id).await;
    }

    /// Leave the hub. Safe to call more than once.
    pub async fn close(&self) {
        if let Err(e) = self.hub.remove(&self.id, RemovalReason::Disconnected).await {
            debug!("Session {}: close after hub stopped: {}", self.id, e);
        }
    }
}
