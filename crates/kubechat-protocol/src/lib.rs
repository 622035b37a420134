//! Wire protocol for the KubeChat real-time hub.
//!
//! Every frame on the connection is a JSON envelope:
//!
//! ```text
//! { "type": "<kind>", "payload": { ... }, "correlation_id": "optional" }
//! ```
//!
//! Inbound kinds form a closed set (`auth`, `execute`, `cancel`, `subscribe`,
//! `unsubscribe`, `pong`, `heartbeat`); anything else is rejected with
//! `INVALID_MESSAGE_TYPE` without closing the connection. Outbound frames carry
//! an `id` and `timestamp` in addition to the envelope fields.

pub mod messages;
pub mod payloads;
pub mod types;

pub use messages::{ClientMessage, InboundMessage, OutboundMessage, ProtocolError, ServerMessage};
pub use payloads::*;
pub use types::{CommandStatus, ErrorCode, OutputStream, SafetyLevel, Topic};
