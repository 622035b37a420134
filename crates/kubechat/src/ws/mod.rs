//! Real-time session hub.
//!
//! One control loop ([`hub`]) owns every session, subscription and in-flight
//! command. Connections talk to it through a [`Session`], which parses inbound
//! frames and replies on the session's own bounded outbound queue.

pub mod handler;
pub mod hub;
mod outbound;
mod registry;
mod service;
mod session;
pub mod topics;

pub use hub::{
    DeliveryReport, HubHandle, HubMetrics, RemovalReason, SessionDescriptor, SweepReport,
};
pub use outbound::SessionSender;
pub use registry::SessionId;
pub use service::{HealthReport, HealthStatus, KubeChat, KubeChatBuilder, SessionConnection};
pub use session::Session;
