//! Direct sends from a session's own task to its outbound queue.

use kubechat_protocol::{ErrorPayload, OutboundMessage, ServerMessage};
use log::warn;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;

use super::hub::{HubHandle, RemovalReason};
use super::registry::SessionId;
use crate::error::HubError;

/// Replies to one session without going through the hub mailbox.
///
/// Follows the same rule as hub fan-out: a full queue drops the message and
/// asks the hub to remove the session.
#[derive(Clone)]
pub struct SessionSender {
    session_id: SessionId,
    tx: mpsc::Sender<OutboundMessage>,
    closed: CancellationToken,
    hub: HubHandle,
}

impl SessionSender {
    pub fn new(
        session_id: SessionId,
        tx: mpsc::Sender<OutboundMessage>,
        closed: CancellationToken,
        hub: HubHandle,
    ) -> Self {
        Self {
            session_id,
            tx,
            closed,
            hub,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Queue a message. Returns `false` if it was not queued.
    pub fn deliver(&self, message: OutboundMessage) -> bool {
        if self.closed.is_cancelled() {
            return false;
        }
        match self.tx.try_send(message) {
            Ok(()) => true,
            Err(TrySendError::Full(message)) => {
                warn!(
                    "Session {} outbound queue full, dropping {} and disconnecting",
                    self.session_id,
                    message.kind()
                );
                self.hub
                    .request_removal(&self.session_id, RemovalReason::Backpressure);
                false
            }
            Err(TrySendError::Closed(_)) => {
                self.hub
                    .request_removal(&self.session_id, RemovalReason::Disconnected);
                false
            }
        }
    }

    pub fn send(&self, message: ServerMessage) -> bool {
        self.deliver(OutboundMessage::new(message))
    }

    pub fn send_correlated(&self, message: ServerMessage, correlation_id: Option<&str>) -> bool {
        self.deliver(OutboundMessage::correlated(
            message,
            correlation_id.map(str::to_string),
        ))
    }

    /// Report a failure, tagged with the command it concerns when known.
    pub fn send_error(
        &self,
        err: &HubError,
        command_id: Option<&str>,
        correlation_id: Option<&str>,
    ) -> bool {
        let mut payload = ErrorPayload::new(err.code(), err.to_string());
        if let Some(command_id) = command_id {
            payload = payload.for_command(command_id);
        }
        self.send_correlated(ServerMessage::Error(payload), correlation_id)
    }
}
