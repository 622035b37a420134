//! Natural-language command generation.
//!
//! The hub never generates commands itself; it hands the query to a
//! [`CommandGenerator`] and treats the answer like any literal command.

mod client;
mod error;

use async_trait::async_trait;
use kubechat_protocol::SafetyLevel;
use serde::{Deserialize, Serialize};

pub use client::HttpCommandGenerator;
pub use error::{GenerationError, GenerationResult};

/// Input handed to the generation service.
#[derive(Debug, Clone, Default, Serialize)]
pub struct GenerationRequest {
    pub query: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cluster_info: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    pub user_id: Option<String>,
    pub session_scope_id: Option<String>,
}

/// A generated command and the provider's view of its risk.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct GeneratedCommand {
    pub command: String,
    pub safety_level: SafetyLevel,
    #[serde(default)]
    pub explanation: Option<String>,
}

#[async_trait]
pub trait CommandGenerator: Send + Sync {
    async fn generate(&self, request: GenerationRequest) -> GenerationResult<GeneratedCommand>;

    /// Reachability probe used by the health check.
    async fn is_available(&self) -> bool {
        true
    }
}

/// `[nlp]` configuration section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NlpConfig {
    pub enabled: bool,
    pub base_url: String,
    /// Per-request budget, enforced by the command engine.
    pub timeout_secs: u64,
}

impl Default for NlpConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            base_url: "http://localhost:8090".to_string(),
            timeout_secs: 30,
        }
    }
}
