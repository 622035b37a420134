//! The `{type, payload}` envelope and the closed sets of message kinds.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use crate::payloads::*;
use crate::types::ErrorCode;

// ============================================================================
// Inbound (Client -> Server)
// ============================================================================

/// Messages a client may send.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage {
    Auth(AuthPayload),
    Execute(ExecutePayload),
    Cancel(CancelPayload),
    Subscribe(SubscribePayload),
    Unsubscribe(SubscribePayload),
    Pong(LivenessPayload),
    Heartbeat(LivenessPayload),
}

impl ClientMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            ClientMessage::Auth(_) => "auth",
            ClientMessage::Execute(_) => "execute",
            ClientMessage::Cancel(_) => "cancel",
            ClientMessage::Subscribe(_) => "subscribe",
            ClientMessage::Unsubscribe(_) => "unsubscribe",
            ClientMessage::Pong(_) => "pong",
            ClientMessage::Heartbeat(_) => "heartbeat",
        }
    }

    /// Messages that act on behalf of a user and need an authenticated session.
    pub fn requires_identity(&self) -> bool {
        matches!(
            self,
            ClientMessage::Execute(_)
                | ClientMessage::Cancel(_)
                | ClientMessage::Subscribe(_)
                | ClientMessage::Unsubscribe(_)
        )
    }

    /// Liveness messages refresh the session's last-seen timestamp.
    pub fn is_liveness(&self) -> bool {
        matches!(self, ClientMessage::Pong(_) | ClientMessage::Heartbeat(_))
    }
}

/// A parsed inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    pub message: ClientMessage,
    pub correlation_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawEnvelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    payload: Value,
    #[serde(default, alias = "correlationId")]
    correlation_id: Option<String>,
}

/// Why an inbound frame could not be turned into a [`ClientMessage`].
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ProtocolError {
    #[error("malformed message: {0}")]
    Malformed(String),

    #[error("invalid message type: {kind}")]
    UnknownType {
        kind: String,
        correlation_id: Option<String>,
    },

    #[error("invalid {kind} payload: {message}")]
    InvalidPayload {
        kind: String,
        message: String,
        correlation_id: Option<String>,
    },
}

impl ProtocolError {
    pub fn code(&self) -> ErrorCode {
        match self {
            ProtocolError::UnknownType { .. } => ErrorCode::InvalidMessageType,
            ProtocolError::Malformed(_) | ProtocolError::InvalidPayload { .. } => {
                ErrorCode::InvalidMessage
            }
        }
    }

    pub fn correlation_id(&self) -> Option<&str> {
        match self {
            ProtocolError::Malformed(_) => None,
            ProtocolError::UnknownType { correlation_id, .. }
            | ProtocolError::InvalidPayload { correlation_id, .. } => correlation_id.as_deref(),
        }
    }
}

impl InboundMessage {
    /// Parse a text frame into a typed message.
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        let raw: RawEnvelope =
            serde_json::from_str(text).map_err(|e| ProtocolError::Malformed(e.to_string()))?;
        let RawEnvelope {
            kind,
            payload,
            correlation_id,
        } = raw;

        let decoded = match kind.as_str() {
            "auth" => decode(&kind, payload).map(ClientMessage::Auth),
            "execute" => decode(&kind, payload).map(ClientMessage::Execute),
            "cancel" => decode(&kind, payload).map(ClientMessage::Cancel),
            "subscribe" => decode(&kind, payload).map(ClientMessage::Subscribe),
            "unsubscribe" => decode(&kind, payload).map(ClientMessage::Unsubscribe),
            "pong" => decode_or_default(&kind, payload).map(ClientMessage::Pong),
            "heartbeat" => decode_or_default(&kind, payload).map(ClientMessage::Heartbeat),
            _ => {
                return Err(ProtocolError::UnknownType {
                    kind,
                    correlation_id,
                });
            }
        };

        match decoded {
            Ok(message) => Ok(Self {
                message,
                correlation_id,
            }),
            Err(message) => Err(ProtocolError::InvalidPayload {
                kind,
                message,
                correlation_id,
            }),
        }
    }
}

fn decode<T: DeserializeOwned>(kind: &str, payload: Value) -> Result<T, String> {
    if payload.is_null() {
        return Err(format!("{kind} requires a payload"));
    }
    serde_json::from_value(payload).map_err(|e| e.to_string())
}

fn decode_or_default<T: DeserializeOwned + Default>(kind: &str, payload: Value) -> Result<T, String> {
    if payload.is_null() {
        return Ok(T::default());
    }
    decode(kind, payload)
}

// ============================================================================
// Outbound (Server -> Client)
// ============================================================================

/// Messages the server sends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ServerMessage {
    AuthResult(AuthResultPayload),
    Status(StatusPayload),
    Executing(ExecutingPayload),
    Progress(ProgressPayload),
    Output(OutputPayload),
    Result(ResultPayload),
    Error(ErrorPayload),
    Notification(NotificationPayload),
    Ping(PingPayload),
}

impl ServerMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            ServerMessage::AuthResult(_) => "auth_result",
            ServerMessage::Status(_) => "status",
            ServerMessage::Executing(_) => "executing",
            ServerMessage::Progress(_) => "progress",
            ServerMessage::Output(_) => "output",
            ServerMessage::Result(_) => "result",
            ServerMessage::Error(_) => "error",
            ServerMessage::Notification(_) => "notification",
            ServerMessage::Ping(_) => "ping",
        }
    }

    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        ServerMessage::Error(ErrorPayload::new(code, message))
    }

    pub fn ping() -> Self {
        ServerMessage::Ping(PingPayload {
            timestamp: Utc::now(),
        })
    }
}

/// An outbound frame: a server message plus envelope metadata.
///
/// Immutable once built; the same value may be cloned into many session queues.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OutboundMessage {
    pub id: String,
    #[serde(flatten)]
    pub message: ServerMessage,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl OutboundMessage {
    pub fn new(message: ServerMessage) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            message,
            correlation_id: None,
            timestamp: Utc::now(),
        }
    }

    pub fn correlated(message: ServerMessage, correlation_id: Option<String>) -> Self {
        Self {
            correlation_id,
            ..Self::new(message)
        }
    }

    pub fn kind(&self) -> &'static str {
        self.message.kind()
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

impl From<ServerMessage> for OutboundMessage {
    fn from(message: ServerMessage) -> Self {
        OutboundMessage::new(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SafetyLevel;
    use serde_json::json;

    #[test]
    fn test_parse_execute() {
        let text = json!({
            "type": "execute",
            "payload": { "command": "kubectl get pods", "stream_output": true },
            "correlationId": "abc"
        })
        .to_string();
        let parsed = InboundMessage::parse(&text).unwrap();
        assert_eq!(parsed.correlation_id.as_deref(), Some("abc"));
        match parsed.message {
            ClientMessage::Execute(p) => {
                assert_eq!(p.command, "kubectl get pods");
                assert!(p.stream_output);
                assert!(p.query.is_empty());
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn test_parse_pong_without_payload() {
        let parsed = InboundMessage::parse(r#"{"type":"pong"}"#).unwrap();
        assert_eq!(parsed.message, ClientMessage::Pong(LivenessPayload::default()));
        assert!(parsed.message.is_liveness());
        assert!(!parsed.message.requires_identity());
    }

    #[test]
    fn test_unknown_type_is_invalid_message_type() {
        let err = InboundMessage::parse(r#"{"type":"reboot","payload":{},"correlation_id":"c1"}"#)
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidMessageType);
        assert_eq!(err.correlation_id(), Some("c1"));
    }

    #[test]
    fn test_outbound_kinds_are_not_accepted_inbound() {
        let err = InboundMessage::parse(r#"{"type":"result","payload":{}}"#).unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidMessageType);
    }

    #[test]
    fn test_malformed_json_is_invalid_message() {
        let err = InboundMessage::parse("{not json").unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidMessage);
        let err = InboundMessage::parse(r#"{"payload":{}}"#).unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidMessage);
    }

    #[test]
    fn test_bad_payload_is_invalid_message() {
        let err = InboundMessage::parse(r#"{"type":"cancel","payload":{"reason":"x"}}"#).unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidPayload { .. }));
        assert_eq!(err.code(), ErrorCode::InvalidMessage);
        let err = InboundMessage::parse(r#"{"type":"auth"}"#).unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidMessage);
    }

    #[test]
    fn test_outbound_envelope_shape() {
        let msg = OutboundMessage::correlated(
            ServerMessage::Executing(ExecutingPayload {
                command_id: "cmd-1".to_string(),
                command: "kubectl get pods".to_string(),
                safety_level: SafetyLevel::Safe,
                estimated_time: None,
                started_at: Utc::now(),
            }),
            Some("corr".to_string()),
        );
        let value: Value = serde_json::from_str(&msg.to_json().unwrap()).unwrap();
        assert_eq!(value["type"], "executing");
        assert_eq!(value["payload"]["command_id"], "cmd-1");
        assert_eq!(value["payload"]["safety_level"], "safe");
        assert_eq!(value["correlation_id"], "corr");
        assert!(value["id"].is_string());
    }

    #[test]
    fn test_error_message_shape() {
        let msg = OutboundMessage::new(ServerMessage::error(
            ErrorCode::AuthRequired,
            "Authentication required",
        ));
        let value: Value = serde_json::from_str(&msg.to_json().unwrap()).unwrap();
        assert_eq!(value["type"], "error");
        assert_eq!(value["payload"]["code"], "AUTH_REQUIRED");
        assert!(value.get("correlation_id").is_none());
    }
}
