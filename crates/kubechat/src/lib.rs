//! KubeChat: a real-time hub for conversational Kubernetes operations.
//!
//! Clients connect over WebSocket, authenticate once, and submit either a
//! literal `kubectl` command or a natural-language query. Commands run as
//! external processes with a per-session concurrency cap and a wall-clock
//! timeout; results, streamed output and topic notifications flow back over
//! the same connection.

pub mod api;
pub mod audit;
pub mod auth;
pub mod commands;
pub mod config;
pub mod error;
pub mod nlp;
pub mod ws;

pub use config::{AppConfig, HubConfig};
pub use error::HubError;
pub use ws::{KubeChat, KubeChatBuilder};
