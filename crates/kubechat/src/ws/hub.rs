//! Hub control loop.
//!
//! The hub is a single task that owns the session registry, the per-user and
//! per-topic indices, every session's in-flight command set and the metrics
//! counters. Everything else talks to it through a [`HubHandle`], which posts
//! [`HubEvent`]s to a bounded mailbox and (for queries) awaits a oneshot reply.
//!
//! Delivery is best-effort: a recipient whose outbound queue is full loses the
//! message and is removed. The loop never awaits a session queue.

use chrono::{DateTime, Utc};
use kubechat_protocol::{
    CommandStatus, OutboundMessage, ServerMessage, StatusPayload, Topic,
};
use log::{debug, info, warn};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use super::registry::{Registry, SessionEntry, SessionId};
use super::topics;
use crate::auth::Identity;
use crate::commands::{CommandExecution, CommandHandle};
use crate::config::HubConfig;
use crate::error::HubError;

/// Why a session left the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RemovalReason {
    Disconnected,
    /// Outbound queue was full.
    Backpressure,
    /// No liveness signal within the client timeout.
    Stale,
    /// Liveness probe could not be queued.
    Unresponsive,
    Forced,
    Shutdown,
}

impl RemovalReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RemovalReason::Disconnected => "disconnected",
            RemovalReason::Backpressure => "backpressure",
            RemovalReason::Stale => "stale",
            RemovalReason::Unresponsive => "unresponsive",
            RemovalReason::Forced => "forced",
            RemovalReason::Shutdown => "shutdown",
        }
    }
}

/// Outcome of a fan-out. Zero recipients is a normal result, not an error.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DeliveryReport {
    pub recipients: usize,
    pub delivered: usize,
    pub dropped: usize,
}

impl DeliveryReport {
    pub fn no_recipients(&self) -> bool {
        self.recipients == 0
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub probed: usize,
    pub stale: Vec<SessionId>,
    pub unresponsive: Vec<SessionId>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HubMetrics {
    pub connected_sessions: usize,
    pub total_connections: u64,
    pub messages_sent: u64,
    pub messages_received: u64,
    pub messages_dropped: u64,
    pub active_commands: u64,
    pub completed_commands: u64,
    pub failed_commands: u64,
    pub cancelled_commands: u64,
    pub started_at: DateTime<Utc>,
    pub uptime_secs: i64,
}

/// Read-only view of a connected session.
#[derive(Debug, Clone, Serialize)]
pub struct SessionDescriptor {
    pub session_id: SessionId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    pub authenticated: bool,
    pub connected_at: DateTime<Utc>,
    pub idle_secs: u64,
    pub subscriptions: Vec<Topic>,
    pub in_flight_commands: Vec<String>,
}

type Reply<T> = oneshot::Sender<T>;

pub(crate) enum HubEvent {
    Admit {
        session_id: SessionId,
        sender: mpsc::Sender<OutboundMessage>,
        closed: CancellationToken,
        reply: Reply<()>,
    },
    Remove {
        session_id: SessionId,
        reason: RemovalReason,
        reply: Option<Reply<bool>>,
    },
    Authenticate {
        session_id: SessionId,
        identity: Identity,
        reply: Reply<Result<(), HubError>>,
    },
    Subscribe {
        session_id: SessionId,
        topics: Vec<Topic>,
        reply: Reply<Result<(), HubError>>,
    },
    Unsubscribe {
        session_id: SessionId,
        topics: Vec<Topic>,
        reply: Reply<Result<(), HubError>>,
    },
    MessageReceived {
        session_id: SessionId,
        liveness: bool,
    },
    Touch {
        session_id: SessionId,
    },
    RegisterCommand {
        session_id: SessionId,
        execution: Box<CommandExecution>,
        reply: Reply<Result<CommandHandle, HubError>>,
    },
    CancelCommand {
        session_id: SessionId,
        command_id: String,
        reply: Reply<Result<CommandExecution, HubError>>,
    },
    CommandFinished {
        session_id: SessionId,
        command_id: String,
        status: CommandStatus,
    },
    InFlight {
        session_id: SessionId,
        reply: Reply<Result<Vec<String>, HubError>>,
    },
    Broadcast {
        message: OutboundMessage,
        reply: Option<Reply<DeliveryReport>>,
    },
    SendToUser {
        user_id: String,
        message: OutboundMessage,
        reply: Option<Reply<DeliveryReport>>,
    },
    SendToSession {
        session_id: SessionId,
        message: OutboundMessage,
        reply: Option<Reply<DeliveryReport>>,
    },
    Publish {
        topics: Vec<Topic>,
        message: OutboundMessage,
        reply: Option<Reply<DeliveryReport>>,
    },
    Sweep {
        reply: Reply<SweepReport>,
    },
    Metrics {
        reply: Reply<HubMetrics>,
    },
    Sessions {
        reply: Reply<Vec<SessionDescriptor>>,
    },
    Session {
        session_id: SessionId,
        reply: Reply<Option<SessionDescriptor>>,
    },
    Subscribers {
        topic: Topic,
        reply: Reply<Vec<SessionId>>,
    },
    UserSessions {
        user_id: String,
        reply: Reply<Vec<SessionId>>,
    },
    VerifyIndices {
        reply: Reply<Result<(), String>>,
    },
    Shutdown {
        reply: Reply<()>,
    },
}

#[derive(Debug, Default)]
struct Counters {
    total_connections: u64,
    messages_sent: u64,
    messages_received: u64,
    messages_dropped: u64,
    active_commands: u64,
    completed_commands: u64,
    failed_commands: u64,
    cancelled_commands: u64,
}

impl Counters {
    fn command_finished(&mut self, status: CommandStatus) {
        self.active_commands = self.active_commands.saturating_sub(1);
        match status {
            CommandStatus::Completed => self.completed_commands += 1,
            CommandStatus::Cancelled => self.cancelled_commands += 1,
            _ => self.failed_commands += 1,
        }
    }
}

enum Delivery {
    Delivered,
    Dropped,
    Missing,
}

pub struct Hub {
    config: Arc<HubConfig>,
    registry: Registry,
    counters: Counters,
    started_at: DateTime<Utc>,
    rx: mpsc::Receiver<HubEvent>,
    /// Sessions to remove once the current event is handled.
    pending_removals: Vec<(SessionId, RemovalReason)>,
}

impl Hub {
    /// Start the control loop. The returned handle is the only way in.
    pub fn spawn(config: Arc<HubConfig>) -> (HubHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(config.mailbox_size);
        let hub = Hub {
            config,
            registry: Registry::default(),
            counters: Counters::default(),
            started_at: Utc::now(),
            rx,
            pending_removals: Vec::new(),
        };
        let task = tokio::spawn(hub.run());
        (HubHandle { tx }, task)
    }

    async fn run(mut self) {
        let period = self.config.heartbeat_interval;
        let mut heartbeat = tokio::time::interval_at(Instant::now() + period, period);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!("Hub control loop started");

        loop {
            tokio::select! {
                event = self.rx.recv() => {
                    let Some(event) = event else {
                        break;
                    };
                    if !self.handle(event).await {
                        info!("Hub control loop stopped");
                        return;
                    }
                }
                _ = heartbeat.tick() => {
                    let report = self.sweep();
                    if !report.stale.is_empty() || !report.unresponsive.is_empty() {
                        info!(
                            "liveness sweep: {} probed, {} stale, {} unresponsive",
                            report.probed,
                            report.stale.len(),
                            report.unresponsive.len()
                        );
                    }
                }
            }
            self.drain_removals().await;
        }

        // Every handle was dropped without a shutdown
        self.close_all().await;
        info!("Hub control loop stopped");
    }

    /// Handle one event. Returns `false` when the loop should exit.
    async fn handle(&mut self, event: HubEvent) -> bool {
        match event {
            HubEvent::Admit {
                session_id,
                sender,
                closed,
                reply,
            } => {
                self.admit(session_id, sender, closed).await;
                let _ = reply.send(());
            }
            HubEvent::Remove {
                session_id,
                reason,
                reply,
            } => {
                let removed = self.remove_session(&session_id, reason).await;
                self.drain_removals().await;
                if let Some(reply) = reply {
                    let _ = reply.send(removed);
                }
            }
            HubEvent::Authenticate {
                session_id,
                identity,
                reply,
            } => {
                let result = self.authenticate(&session_id, identity);
                self.drain_removals().await;
                let _ = reply.send(result);
            }
            HubEvent::Subscribe {
                session_id,
                topics,
                reply,
            } => {
                let result = if self.registry.subscribe(&session_id, &topics) {
                    debug!("session {} subscribed to {:?}", session_id, topics);
                    Ok(())
                } else {
                    Err(HubError::SessionNotFound(session_id))
                };
                let _ = reply.send(result);
            }
            HubEvent::Unsubscribe {
                session_id,
                topics,
                reply,
            } => {
                let result = if self.registry.unsubscribe(&session_id, &topics) {
                    debug!("session {} unsubscribed from {:?}", session_id, topics);
                    Ok(())
                } else {
                    Err(HubError::SessionNotFound(session_id))
                };
                let _ = reply.send(result);
            }
            HubEvent::MessageReceived {
                session_id,
                liveness,
            } => {
                self.counters.messages_received += 1;
                if liveness {
                    self.touch(&session_id);
                }
            }
            HubEvent::Touch { session_id } => self.touch(&session_id),
            HubEvent::RegisterCommand {
                session_id,
                execution,
                reply,
            } => {
                let _ = reply.send(self.register_command(&session_id, *execution));
            }
            HubEvent::CancelCommand {
                session_id,
                command_id,
                reply,
            } => {
                let result = self.cancel_command(&session_id, &command_id).await;
                let _ = reply.send(result);
            }
            HubEvent::CommandFinished {
                session_id,
                command_id,
                status,
            } => self.command_finished(&session_id, &command_id, status),
            HubEvent::InFlight { session_id, reply } => {
                let result = self
                    .registry
                    .get(&session_id)
                    .map(|entry| entry.commands.keys().cloned().collect())
                    .ok_or(HubError::SessionNotFound(session_id));
                let _ = reply.send(result);
            }
            HubEvent::Broadcast { message, reply } => {
                let ids = self.registry.ids();
                let report = self.fan_out(&ids, &message);
                self.finish_fan_out(report, reply).await;
            }
            HubEvent::SendToUser {
                user_id,
                message,
                reply,
            } => {
                let ids = self.registry.user_sessions(&user_id);
                let report = self.fan_out(&ids, &message);
                self.finish_fan_out(report, reply).await;
            }
            HubEvent::SendToSession {
                session_id,
                message,
                reply,
            } => {
                let report = self.fan_out(&[session_id], &message);
                self.finish_fan_out(report, reply).await;
            }
            HubEvent::Publish {
                topics,
                message,
                reply,
            } => {
                let ids = self.registry.topics_sessions(&topics);
                let report = self.fan_out(&ids, &message);
                self.finish_fan_out(report, reply).await;
            }
            HubEvent::Sweep { reply } => {
                let report = self.sweep();
                self.drain_removals().await;
                let _ = reply.send(report);
            }
            HubEvent::Metrics { reply } => {
                let _ = reply.send(self.metrics());
            }
            HubEvent::Sessions { reply } => {
                let now = Instant::now();
                let sessions = self
                    .registry
                    .entries()
                    .map(|entry| describe(entry, now))
                    .collect();
                let _ = reply.send(sessions);
            }
            HubEvent::Session { session_id, reply } => {
                let now = Instant::now();
                let _ = reply.send(self.registry.get(&session_id).map(|e| describe(e, now)));
            }
            HubEvent::Subscribers { topic, reply } => {
                let _ = reply.send(self.registry.topic_sessions(topic));
            }
            HubEvent::UserSessions { user_id, reply } => {
                let _ = reply.send(self.registry.user_sessions(&user_id));
            }
            HubEvent::VerifyIndices { reply } => {
                let _ = reply.send(self.registry.verify_indices());
            }
            HubEvent::Shutdown { reply } => {
                info!(
                    "Hub shutting down, closing {} session(s)",
                    self.registry.len()
                );
                self.close_all().await;
                // Handles observe the hub as stopped from here on
                self.rx.close();
                let _ = reply.send(());
                return false;
            }
        }
        true
    }

    async fn admit(
        &mut self,
        session_id: SessionId,
        sender: mpsc::Sender<OutboundMessage>,
        closed: CancellationToken,
    ) {
        let entry = SessionEntry::new(session_id.clone(), sender, closed);
        if let Some(previous) = self.registry.insert(entry) {
            warn!("session id {} reused, evicting previous entry", session_id);
            self.release(previous, RemovalReason::Forced).await;
        }
        self.counters.total_connections += 1;
        info!(
            "Session {} connected ({} active)",
            session_id,
            self.registry.len()
        );

        let ack = ServerMessage::Status(
            StatusPayload::new("connection", "connected", "Connected to KubeChat")
                .with_metadata("session_id", session_id.clone())
                .with_metadata("require_auth", self.config.require_auth),
        );
        self.fan_out(&[session_id], &OutboundMessage::new(ack));
    }

    fn authenticate(&mut self, session_id: &str, identity: Identity) -> Result<(), HubError> {
        let entry = self
            .registry
            .get(session_id)
            .ok_or_else(|| HubError::SessionNotFound(session_id.to_string()))?;
        if entry.identity.is_some() {
            return Err(HubError::AlreadyAuthenticated);
        }

        let notice = topics::user_activity_notification(
            "user_connected",
            &identity.user_id,
            &identity.username,
            session_id,
        );
        self.registry.set_identity(session_id, identity);
        let ids = self.registry.topic_sessions(Topic::UserActivity);
        self.fan_out(&ids, &OutboundMessage::new(notice));
        Ok(())
    }

    fn touch(&mut self, session_id: &str) {
        if let Some(entry) = self.registry.get_mut(session_id) {
            entry.last_seen = Instant::now();
        }
    }

    fn register_command(
        &mut self,
        session_id: &str,
        execution: CommandExecution,
    ) -> Result<CommandHandle, HubError> {
        let limit = self.config.max_concurrent_commands;
        let entry = self
            .registry
            .get_mut(session_id)
            .ok_or_else(|| HubError::SessionNotFound(session_id.to_string()))?;
        if entry.commands.len() >= limit {
            return Err(HubError::TooManyCommands { limit });
        }
        let handle = CommandHandle::new(execution);
        entry.commands.insert(handle.id.clone(), handle.clone());
        self.counters.active_commands += 1;
        debug!(
            "session {}: command {} queued ({} in flight)",
            session_id,
            handle.id,
            entry.commands.len()
        );
        Ok(handle)
    }

    async fn cancel_command(
        &mut self,
        session_id: &str,
        command_id: &str,
    ) -> Result<CommandExecution, HubError> {
        let handle = self
            .registry
            .get(session_id)
            .ok_or_else(|| HubError::SessionNotFound(session_id.to_string()))?
            .commands
            .get(command_id)
            .cloned()
            .ok_or_else(|| HubError::CommandNotFound(command_id.to_string()))?;

        // Already terminal: the execution task will report it
        if !handle.cancel().await {
            return Err(HubError::CommandNotFound(command_id.to_string()));
        }

        if let Some(entry) = self.registry.get_mut(session_id) {
            entry.commands.remove(command_id);
        }
        self.counters.command_finished(CommandStatus::Cancelled);
        Ok(handle.snapshot().await)
    }

    fn command_finished(&mut self, session_id: &str, command_id: &str, status: CommandStatus) {
        let removed = self
            .registry
            .get_mut(session_id)
            .and_then(|entry| entry.commands.remove(command_id))
            .is_some();
        if removed {
            self.counters.command_finished(status);
        }
    }

    /// Try-send to each session. Full or closed queues schedule removal.
    fn fan_out(&mut self, ids: &[SessionId], message: &OutboundMessage) -> DeliveryReport {
        let mut report = DeliveryReport::default();
        for id in ids {
            match self.deliver(id, message) {
                Delivery::Delivered => {
                    report.recipients += 1;
                    report.delivered += 1;
                }
                Delivery::Dropped => {
                    report.recipients += 1;
                    report.dropped += 1;
                }
                Delivery::Missing => {}
            }
        }
        report
    }

    fn deliver(&mut self, id: &str, message: &OutboundMessage) -> Delivery {
        let Some(entry) = self.registry.get(id) else {
            return Delivery::Missing;
        };
        let result = entry.sender.try_send(message.clone());
        match result {
            Ok(()) => {
                self.counters.messages_sent += 1;
                Delivery::Delivered
            }
            Err(TrySendError::Full(_)) => {
                warn!(
                    "Session {} outbound queue full, dropping {} and disconnecting",
                    id,
                    message.kind()
                );
                self.counters.messages_dropped += 1;
                self.schedule_removal(id, RemovalReason::Backpressure);
                Delivery::Dropped
            }
            Err(TrySendError::Closed(_)) => {
                self.counters.messages_dropped += 1;
                self.schedule_removal(id, RemovalReason::Disconnected);
                Delivery::Dropped
            }
        }
    }

    async fn finish_fan_out(&mut self, report: DeliveryReport, reply: Option<Reply<DeliveryReport>>) {
        self.drain_removals().await;
        if let Some(reply) = reply {
            let _ = reply.send(report);
        }
    }

    fn schedule_removal(&mut self, id: &str, reason: RemovalReason) {
        if !self.pending_removals.iter().any(|(pending, _)| pending == id) {
            self.pending_removals.push((id.to_string(), reason));
        }
    }

    async fn drain_removals(&mut self) {
        while let Some((id, reason)) = self.pending_removals.pop() {
            self.remove_session(&id, reason).await;
        }
    }

    fn sweep(&mut self) -> SweepReport {
        let now = Instant::now();
        let timeout = self.config.client_timeout;
        let mut report = SweepReport::default();

        for id in self.registry.ids() {
            let Some(entry) = self.registry.get(&id) else {
                continue;
            };
            if now.duration_since(entry.last_seen) > timeout {
                info!("Session {} stale, removing", id);
                self.schedule_removal(&id, RemovalReason::Stale);
                report.stale.push(id);
                continue;
            }
            let probe = OutboundMessage::new(ServerMessage::ping());
            match self.deliver(&id, &probe) {
                Delivery::Delivered => report.probed += 1,
                _ => report.unresponsive.push(id),
            }
        }
        report
    }

    /// Remove a session from every index and release its resources.
    ///
    /// Returns `false` if the session was not registered.
    async fn remove_session(&mut self, id: &str, reason: RemovalReason) -> bool {
        let Some(entry) = self.registry.remove(id) else {
            debug!("remove {}: not registered", id);
            return false;
        };
        self.release(entry, reason).await;
        true
    }

    async fn release(&mut self, entry: SessionEntry, reason: RemovalReason) {
        let in_flight = entry.commands.len();
        for handle in entry.commands.into_values() {
            if !handle.cancel().await {
                handle.token.cancel();
            }
            let status = handle.status().await;
            self.counters.command_finished(status);
        }
        entry.closed.cancel();

        info!(
            "Session {} removed ({}), cancelled {} command(s), {} active",
            entry.id,
            reason.as_str(),
            in_flight,
            self.registry.len()
        );

        if reason != RemovalReason::Shutdown
            && let Some(identity) = &entry.identity
        {
            let notice = topics::user_activity_notification(
                "user_disconnected",
                &identity.user_id,
                &identity.username,
                &entry.id,
            );
            let ids = self.registry.topic_sessions(Topic::UserActivity);
            self.fan_out(&ids, &OutboundMessage::new(notice));
        }
    }

    async fn close_all(&mut self) {
        for id in self.registry.ids() {
            self.remove_session(&id, RemovalReason::Shutdown).await;
        }
        self.pending_removals.clear();
    }

    fn metrics(&self) -> HubMetrics {
        let c = &self.counters;
        HubMetrics {
            connected_sessions: self.registry.len(),
            total_connections: c.total_connections,
            messages_sent: c.messages_sent,
            messages_received: c.messages_received,
            messages_dropped: c.messages_dropped,
            active_commands: c.active_commands,
            completed_commands: c.completed_commands,
            failed_commands: c.failed_commands,
            cancelled_commands: c.cancelled_commands,
            started_at: self.started_at,
            uptime_secs: (Utc::now() - self.started_at).num_seconds(),
        }
    }
}

fn describe(entry: &SessionEntry, now: Instant) -> SessionDescriptor {
    let identity = entry.identity.as_ref();
    SessionDescriptor {
        session_id: entry.id.clone(),
        user_id: identity.map(|i| i.user_id.clone()),
        username: identity.map(|i| i.username.clone()),
        role: identity.map(|i| i.role.to_string()),
        authenticated: identity.is_some(),
        connected_at: entry.connected_at,
        idle_secs: now.duration_since(entry.last_seen).as_secs(),
        subscriptions: entry.subscriptions.iter().copied().collect(),
        in_flight_commands: entry.commands.keys().cloned().collect(),
    }
}

/// Cloneable entry point to the hub control loop.
#[derive(Clone)]
pub struct HubHandle {
    tx: mpsc::Sender<HubEvent>,
}

impl HubHandle {
    async fn call<T>(&self, make: impl FnOnce(Reply<T>) -> HubEvent) -> Result<T, HubError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(make(reply))
            .await
            .map_err(|_| HubError::HubClosed)?;
        rx.await.map_err(|_| HubError::HubClosed)
    }

    async fn post(&self, event: HubEvent) {
        if self.tx.send(event).await.is_err() {
            debug!("hub closed, dropping event");
        }
    }

    /// Whether the control loop is still accepting events.
    pub fn is_running(&self) -> bool {
        !self.tx.is_closed()
    }

    /// Register a session and queue its connection acknowledgement.
    pub async fn admit(
        &self,
        session_id: &str,
        sender: mpsc::Sender<OutboundMessage>,
        closed: CancellationToken,
    ) -> Result<(), HubError> {
        self.call(|reply| HubEvent::Admit {
            session_id: session_id.to_string(),
            sender,
            closed,
            reply,
        })
        .await
    }

    /// Remove a session. Returns `false` if it was already gone.
    pub async fn remove(&self, session_id: &str, reason: RemovalReason) -> Result<bool, HubError> {
        self.call(|reply| HubEvent::Remove {
            session_id: session_id.to_string(),
            reason,
            reply: Some(reply),
        })
        .await
    }

    /// Schedule a removal without waiting. Safe to call from sync code.
    pub fn request_removal(&self, session_id: &str, reason: RemovalReason) {
        let event = HubEvent::Remove {
            session_id: session_id.to_string(),
            reason,
            reply: None,
        };
        match self.tx.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => {
                let tx = self.tx.clone();
                tokio::spawn(async move {
                    let _ = tx.send(event).await;
                });
            }
            Err(TrySendError::Closed(_)) => {}
        }
    }

    pub async fn authenticate(&self, session_id: &str, identity: Identity) -> Result<(), HubError> {
        self.call(|reply| HubEvent::Authenticate {
            session_id: session_id.to_string(),
            identity,
            reply,
        })
        .await?
    }

    pub async fn subscribe(&self, session_id: &str, topics: Vec<Topic>) -> Result<(), HubError> {
        self.call(|reply| HubEvent::Subscribe {
            session_id: session_id.to_string(),
            topics,
            reply,
        })
        .await?
    }

    pub async fn unsubscribe(&self, session_id: &str, topics: Vec<Topic>) -> Result<(), HubError> {
        self.call(|reply| HubEvent::Unsubscribe {
            session_id: session_id.to_string(),
            topics,
            reply,
        })
        .await?
    }

    pub async fn message_received(&self, session_id: &str, liveness: bool) {
        self.post(HubEvent::MessageReceived {
            session_id: session_id.to_string(),
            liveness,
        })
        .await;
    }

    /// Refresh a session's liveness timestamp.
    pub async fn touch(&self, session_id: &str) {
        self.post(HubEvent::Touch {
            session_id: session_id.to_string(),
        })
        .await;
    }

    /// Admit a command into the session's in-flight set, enforcing the
    /// per-session limit atomically.
    pub async fn register_command(
        &self,
        session_id: &str,
        execution: CommandExecution,
    ) -> Result<CommandHandle, HubError> {
        self.call(|reply| HubEvent::RegisterCommand {
            session_id: session_id.to_string(),
            execution: Box::new(execution),
            reply,
        })
        .await?
    }

    /// Cancel a non-terminal in-flight command. Unknown or finished ids yield
    /// `CommandNotFound`.
    pub async fn cancel_command(
        &self,
        session_id: &str,
        command_id: &str,
    ) -> Result<CommandExecution, HubError> {
        self.call(|reply| HubEvent::CancelCommand {
            session_id: session_id.to_string(),
            command_id: command_id.to_string(),
            reply,
        })
        .await?
    }

    pub async fn command_finished(&self, session_id: &str, command_id: &str, status: CommandStatus) {
        self.post(HubEvent::CommandFinished {
            session_id: session_id.to_string(),
            command_id: command_id.to_string(),
            status,
        })
        .await;
    }

    pub async fn in_flight(&self, session_id: &str) -> Result<Vec<String>, HubError> {
        self.call(|reply| HubEvent::InFlight {
            session_id: session_id.to_string(),
            reply,
        })
        .await?
    }

    pub async fn broadcast(&self, message: impl Into<OutboundMessage>) -> Result<DeliveryReport, HubError> {
        let message = message.into();
        self.call(|reply| HubEvent::Broadcast {
            message,
            reply: Some(reply),
        })
        .await
    }

    pub async fn send_to_user(
        &self,
        user_id: &str,
        message: impl Into<OutboundMessage>,
    ) -> Result<DeliveryReport, HubError> {
        let message = message.into();
        self.call(|reply| HubEvent::SendToUser {
            user_id: user_id.to_string(),
            message,
            reply: Some(reply),
        })
        .await
    }

    pub async fn send_to_session(
        &self,
        session_id: &str,
        message: impl Into<OutboundMessage>,
    ) -> Result<DeliveryReport, HubError> {
        let message = message.into();
        self.call(|reply| HubEvent::SendToSession {
            session_id: session_id.to_string(),
            message,
            reply: Some(reply),
        })
        .await
    }

    pub async fn publish(
        &self,
        topics: Vec<Topic>,
        message: impl Into<OutboundMessage>,
    ) -> Result<DeliveryReport, HubError> {
        let message = message.into();
        self.call(|reply| HubEvent::Publish {
            topics,
            message,
            reply: Some(reply),
        })
        .await
    }

    /// Publish without waiting for the delivery report.
    pub async fn publish_detached(&self, topics: Vec<Topic>, message: impl Into<OutboundMessage>) {
        self.post(HubEvent::Publish {
            topics,
            message: message.into(),
            reply: None,
        })
        .await;
    }

    /// Run a liveness sweep now instead of waiting for the next tick.
    pub async fn sweep(&self) -> Result<SweepReport, HubError> {
        self.call(|reply| HubEvent::Sweep { reply }).await
    }

    pub async fn metrics(&self) -> Result<HubMetrics, HubError> {
        self.call(|reply| HubEvent::Metrics { reply }).await
    }

    pub async fn session_count(&self) -> Result<usize, HubError> {
        Ok(self.metrics().await?.connected_sessions)
    }

    pub async fn sessions(&self) -> Result<Vec<SessionDescriptor>, HubError> {
        self.call(|reply| HubEvent::Sessions { reply }).await
    }

    pub async fn session(&self, session_id: &str) -> Result<Option<SessionDescriptor>, HubError> {
        self.call(|reply| HubEvent::Session {
            session_id: session_id.to_string(),
            reply,
        })
        .await
    }

    /// Topics a session is subscribed to, or `None` if it is not connected.
    pub async fn session_subscriptions(&self, session_id: &str) -> Result<Option<Vec<Topic>>, HubError> {
        Ok(self.session(session_id).await?.map(|s| s.subscriptions))
    }

    pub async fn subscribers(&self, topic: Topic) -> Result<Vec<SessionId>, HubError> {
        self.call(|reply| HubEvent::Subscribers { topic, reply }).await
    }

    pub async fn user_sessions(&self, user_id: &str) -> Result<Vec<SessionId>, HubError> {
        self.call(|reply| HubEvent::UserSessions {
            user_id: user_id.to_string(),
            reply,
        })
        .await
    }

    /// Cross-check the registry indices. Diagnostics only.
    pub async fn verify_indices(&self) -> Result<Result<(), String>, HubError> {
        self.call(|reply| HubEvent::VerifyIndices { reply }).await
    }

    /// Cancel every in-flight command, close every session and stop the loop.
    pub async fn shutdown(&self) -> Result<(), HubError> {
        self.call(|reply| HubEvent::Shutdown { reply }).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::Role;
    use kubechat_protocol::SafetyLevel;
    use std::time::Duration;

    fn test_config(queue_size: usize) -> HubConfig {
        HubConfig {
            heartbeat_interval: Duration::from_secs(3600),
            outbound_queue_size: queue_size,
            ..HubConfig::default()
        }
    }

    async fn connect(hub: &HubHandle, id: &str, queue: usize) -> (mpsc::Receiver<OutboundMessage>, CancellationToken) {
        let (tx, rx) = mpsc::channel(queue);
        let closed = CancellationToken::new();
        hub.admit(id, tx, closed.clone()).await.unwrap();
        (rx, closed)
    }

    fn identity(user: &str) -> Identity {
        Identity {
            user_id: user.to_string(),
            username: user.to_string(),
            role: Role::User,
            session_scope_id: "scope".to_string(),
        }
    }

    #[tokio::test]
    async fn test_admit_sends_ack() {
        let (hub, _task) = Hub::spawn(Arc::new(test_config(8)));
        let (mut rx, _closed) = connect(&hub, "s1", 8).await;
        let ack = rx.recv().await.unwrap();
        match ack.message {
            ServerMessage::Status(status) => {
                assert_eq!(status.kind, "connection");
                assert_eq!(status.metadata["session_id"], "s1");
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(hub.session_count().await.unwrap(), 1);
        assert_eq!(hub.metrics().await.unwrap().total_connections, 1);
    }

    #[tokio::test]
    async fn test_remove_is_idempotent_and_cancels_commands() {
        let (hub, _task) = Hub::spawn(Arc::new(test_config(8)));
        let (_rx, closed) = connect(&hub, "s1", 8).await;
        hub.authenticate("s1", identity("alice")).await.unwrap();
        hub.subscribe("s1", vec![Topic::Commands]).await.unwrap();
        let handle = hub
            .register_command(
                "s1",
                CommandExecution::new("s1", "kubectl get pods", SafetyLevel::Safe, false),
            )
            .await
            .unwrap();

        assert!(hub.remove("s1", RemovalReason::Disconnected).await.unwrap());
        assert!(!hub.remove("s1", RemovalReason::Disconnected).await.unwrap());

        assert!(closed.is_cancelled());
        assert!(handle.token.is_cancelled());
        assert_eq!(handle.status().await, CommandStatus::Cancelled);
        assert!(hub.subscribers(Topic::Commands).await.unwrap().is_empty());
        assert!(hub.user_sessions("alice").await.unwrap().is_empty());
        assert_eq!(hub.verify_indices().await.unwrap(), Ok(()));

        let metrics = hub.metrics().await.unwrap();
        assert_eq!(metrics.connected_sessions, 0);
        assert_eq!(metrics.active_commands, 0);
        assert_eq!(metrics.cancelled_commands, 1);
    }

    #[tokio::test]
    async fn test_second_authentication_rejected() {
        let (hub, _task) = Hub::spawn(Arc::new(test_config(8)));
        let (_rx, _closed) = connect(&hub, "s1", 8).await;
        hub.authenticate("s1", identity("alice")).await.unwrap();
        assert_eq!(
            hub.authenticate("s1", identity("bob")).await,
            Err(HubError::AlreadyAuthenticated)
        );
        assert_eq!(hub.user_sessions("alice").await.unwrap(), vec!["s1".to_string()]);
    }

    #[tokio::test]
    async fn test_register_limit_is_hard_cap() {
        let config = HubConfig {
            max_concurrent_commands: 2,
            ..test_config(8)
        };
        let (hub, _task) = Hub::spawn(Arc::new(config));
        let (_rx, _closed) = connect(&hub, "s1", 8).await;
        let exec = || CommandExecution::new("s1", "kubectl get pods", SafetyLevel::Safe, false);

        let first = hub.register_command("s1", exec()).await.unwrap();
        hub.register_command("s1", exec()).await.unwrap();
        assert_eq!(
            hub.register_command("s1", exec()).await.unwrap_err(),
            HubError::TooManyCommands { limit: 2 }
        );

        hub.command_finished("s1", &first.id, CommandStatus::Completed).await;
        hub.register_command("s1", exec()).await.unwrap();
        assert_eq!(hub.in_flight("s1").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_cancel_twice() {
        let (hub, _task) = Hub::spawn(Arc::new(test_config(8)));
        let (_rx, _closed) = connect(&hub, "s1", 8).await;
        let handle = hub
            .register_command(
                "s1",
                CommandExecution::new("s1", "kubectl get pods", SafetyLevel::Safe, false),
            )
            .await
            .unwrap();

        let cancelled = hub.cancel_command("s1", &handle.id).await.unwrap();
        assert_eq!(cancelled.status, CommandStatus::Cancelled);
        assert!(cancelled.completed_at.is_some());
        assert_eq!(
            hub.cancel_command("s1", &handle.id).await.unwrap_err(),
            HubError::CommandNotFound(handle.id.clone())
        );
        assert_eq!(
            hub.cancel_command("s1", "nope").await.unwrap_err().code(),
            kubechat_protocol::ErrorCode::CommandNotFound
        );

        // Late finish report does not double count
        hub.command_finished("s1", &handle.id, CommandStatus::Cancelled).await;
        let metrics = hub.metrics().await.unwrap();
        assert_eq!(metrics.cancelled_commands, 1);
        assert_eq!(metrics.active_commands, 0);
    }

    #[tokio::test]
    async fn test_publish_with_no_subscribers() {
        let (hub, _task) = Hub::spawn(Arc::new(test_config(8)));
        let report = hub
            .publish(vec![Topic::Alerts], ServerMessage::ping())
            .await
            .unwrap();
        assert!(report.no_recipients());
        let report = hub.send_to_user("nobody", ServerMessage::ping()).await.unwrap();
        assert!(report.no_recipients());
    }

    #[tokio::test]
    async fn test_sweep_removes_stale_and_probes_live() {
        let config = HubConfig {
            client_timeout: Duration::from_millis(50),
            ..test_config(8)
        };
        let (hub, _task) = Hub::spawn(Arc::new(config));
        let (_stale_rx, stale_closed) = connect(&hub, "stale", 8).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        let (mut live_rx, _live_closed) = connect(&hub, "live", 8).await;

        let report = hub.sweep().await.unwrap();
        assert_eq!(report.stale, vec!["stale".to_string()]);
        assert_eq!(report.probed, 1);
        assert!(stale_closed.is_cancelled());

        let _ack = live_rx.recv().await.unwrap();
        let probe = live_rx.recv().await.unwrap();
        assert_eq!(probe.kind(), "ping");
    }

    #[tokio::test]
    async fn test_shutdown_stops_loop() {
        let (hub, task) = Hub::spawn(Arc::new(test_config(8)));
        let (_rx, closed) = connect(&hub, "s1", 8).await;
        hub.shutdown().await.unwrap();
        task.await.unwrap();
        assert!(closed.is_cancelled());
        assert!(!hub.is_running());
        assert_eq!(hub.metrics().await.unwrap_err(), HubError::HubClosed);
    }
}
