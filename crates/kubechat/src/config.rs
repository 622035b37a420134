//! Application and hub configuration.
//!
//! [`AppConfig`] is what gets deserialized from the TOML file and environment;
//! [`HubConfig`] is the resolved runtime view handed to the hub, the command
//! engine and the transport.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::audit::AuditConfig;
use crate::auth::AuthConfig;
use crate::nlp::NlpConfig;

/// Top-level configuration file layout.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub logging: LoggingConfig,
    pub server: ServerConfig,
    /// Connection lifecycle and command execution limits.
    pub websocket: WebSocketSettings,
    pub auth: AuthConfig,
    /// Natural-language command generation service.
    pub nlp: NlpConfig,
    pub audit: AuditConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Bearer token for the `/api/ws/*` admin endpoints. Supports `env:VAR`.
    /// Admin endpoints are disabled when unset.
    pub admin_token: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            admin_token: None,
        }
    }
}

impl ServerConfig {
    /// Resolve the admin token, expanding `env:VAR_NAME` syntax.
    pub fn resolve_admin_token(&self) -> Option<String> {
        let value = self.admin_token.as_ref()?;
        match value.strip_prefix("env:") {
            Some(var) => std::env::var(var).ok().filter(|v| !v.is_empty()),
            None => Some(value.clone()),
        }
    }
}

/// `[websocket]` section, durations in whole seconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebSocketSettings {
    pub read_timeout_secs: u64,
    pub write_timeout_secs: u64,
    pub ping_period_secs: u64,
    pub heartbeat_interval_secs: u64,
    pub client_timeout_secs: u64,
    pub max_message_size: usize,
    pub max_sessions: usize,
    pub max_concurrent_commands: usize,
    pub command_timeout_secs: u64,
    pub allowed_origins: Vec<String>,
    pub require_auth: bool,
    pub outbound_queue_size: usize,
    pub mailbox_size: usize,
    /// The only executable commands may invoke.
    pub allowed_executable: String,
    pub output_chunk_size: usize,
}

impl Default for WebSocketSettings {
    fn default() -> Self {
        Self {
            read_timeout_secs: 60,
            write_timeout_secs: 10,
            ping_period_secs: 54,
            heartbeat_interval_secs: 30,
            client_timeout_secs: 300,
            max_message_size: 1024 * 1024,
            max_sessions: 1000,
            max_concurrent_commands: 10,
            command_timeout_secs: 300,
            allowed_origins: vec!["*".to_string()],
            require_auth: true,
            outbound_queue_size: 256,
            mailbox_size: 1024,
            allowed_executable: "kubectl".to_string(),
            output_chunk_size: 1024,
        }
    }
}

/// Resolved hub configuration.
#[derive(Debug, Clone)]
pub struct HubConfig {
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    pub ping_period: Duration,
    pub heartbeat_interval: Duration,
    /// A session with no liveness signal for longer than this is removed.
    pub client_timeout: Duration,
    pub max_message_size: usize,
    pub max_sessions: usize,
    pub max_concurrent_commands: usize,
    pub command_timeout: Duration,
    pub allowed_origins: Vec<String>,
    pub require_auth: bool,
    pub outbound_queue_size: usize,
    pub mailbox_size: usize,
    pub allowed_executable: String,
    pub output_chunk_size: usize,
    pub nlp_timeout: Duration,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self::from_settings(&WebSocketSettings::default(), &NlpConfig::default())
    }
}

impl HubConfig {
    pub fn from_settings(ws: &WebSocketSettings, nlp: &NlpConfig) -> Self {
        Self {
            read_timeout: Duration::from_secs(ws.read_timeout_secs),
            write_timeout: Duration::from_secs(ws.write_timeout_secs),
            ping_period: Duration::from_secs(ws.ping_period_secs.max(1)),
            heartbeat_interval: Duration::from_secs(ws.heartbeat_interval_secs.max(1)),
            client_timeout: Duration::from_secs(ws.client_timeout_secs),
            max_message_size: ws.max_message_size,
            max_sessions: ws.max_sessions,
            max_concurrent_commands: ws.max_concurrent_commands,
            command_timeout: Duration::from_secs(ws.command_timeout_secs),
            allowed_origins: ws.allowed_origins.clone(),
            require_auth: ws.require_auth,
            outbound_queue_size: ws.outbound_queue_size.max(1),
            mailbox_size: ws.mailbox_size.max(1),
            allowed_executable: ws.allowed_executable.clone(),
            output_chunk_size: ws.output_chunk_size.max(1),
            nlp_timeout: Duration::from_secs(nlp.timeout_secs),
        }
    }

    /// Check an upgrade request's `Origin` header against the allow-list.
    ///
    /// Requests without an origin (non-browser clients) are accepted.
    pub fn origin_allowed(&self, origin: Option<&str>) -> bool {
        let Some(origin) = origin else {
            return true;
        };
        self.allowed_origins
            .iter()
            .any(|allowed| allowed == "*" || allowed.eq_ignore_ascii_case(origin))
    }
}

impl From<&AppConfig> for HubConfig {
    fn from(config: &AppConfig) -> Self {
        HubConfig::from_settings(&config.websocket, &config.nlp)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = HubConfig::default();
        assert_eq!(config.read_timeout, Duration::from_secs(60));
        assert_eq!(config.write_timeout, Duration::from_secs(10));
        assert_eq!(config.ping_period, Duration::from_secs(54));
        assert_eq!(config.client_timeout, Duration::from_secs(300));
        assert_eq!(config.max_message_size, 1024 * 1024);
        assert_eq!(config.max_sessions, 1000);
        assert_eq!(config.max_concurrent_commands, 10);
        assert_eq!(config.command_timeout, Duration::from_secs(300));
        assert_eq!(config.outbound_queue_size, 256);
        assert_eq!(config.allowed_executable, "kubectl");
        assert_eq!(config.nlp_timeout, Duration::from_secs(30));
        assert!(config.require_auth);
    }

    #[test]
    fn test_origin_allow_list() {
        let mut config = HubConfig::default();
        assert!(config.origin_allowed(Some("https://anything.example")));

        config.allowed_origins = vec!["https://console.example".to_string()];
        assert!(config.origin_allowed(Some("https://console.example")));
        assert!(!config.origin_allowed(Some("https://evil.example")));
        assert!(config.origin_allowed(None));
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config: AppConfig = toml::from_str(
            r#"
            [websocket]
            max_concurrent_commands = 3
            allowed_executable = "seq"
            "#,
        )
        .unwrap();
        let hub = HubConfig::from(&config);
        assert_eq!(hub.max_concurrent_commands, 3);
        assert_eq!(hub.allowed_executable, "seq");
        assert_eq!(hub.heartbeat_interval, Duration::from_secs(30));
    }
}
