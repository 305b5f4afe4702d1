//! Typed configuration with YAML file loading and environment overlay.
//!
//! Configuration loads from a YAML file when one is present, then
//! `CHAINFLOW_`-prefixed environment variables overlay individual keys
//! (e.g. `CHAINFLOW_SERVER_PORT`, `CHAINFLOW_OPENAI_API_KEY`).

use crate::error::{OrchestratorError, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::Path;

/// Bind address for the HTTP collaborator.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Listen host.
    pub host: String,
    /// Listen port.
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8000,
        }
    }
}

/// Backing store location for the persistence collaborator.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Connection URL.
    pub url: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "sqlite://chainflow.db".to_string(),
        }
    }
}

/// Deployment-host registration and event-bus endpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AlexOsConfig {
    /// Agent registry base URL.
    pub module_registry_url: String,
    /// Event bus URL announced in the registration envelope.
    pub event_bus_url: String,
    /// Webhook base URL for lifecycle events.
    pub webhook_url: String,
    /// Seconds between health envelopes.
    pub health_check_interval: u64,
    /// Seconds between registration retries.
    pub registration_retry_interval: u64,
    /// Registration attempt cap.
    pub max_registration_attempts: u32,
}

impl Default for AlexOsConfig {
    fn default() -> Self {
        Self {
            module_registry_url: "http://localhost:8000".to_string(),
            event_bus_url: "ws://localhost:8000/ws/events".to_string(),
            webhook_url: "http://localhost:9000/api/webhooks/chainflow".to_string(),
            health_check_interval: 60,
            registration_retry_interval: 30,
            max_registration_attempts: 10,
        }
    }
}

/// Remote LLM provider settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OpenAiConfig {
    /// API key; empty leaves the remote provider unconfigured.
    pub api_key: String,
    /// API base URL.
    pub base_url: String,
    /// Default model.
    pub model: String,
    /// Default token budget.
    pub max_tokens: usize,
    /// Default sampling temperature.
    pub temperature: f32,
    /// Request timeout in seconds.
    pub timeout: u64,
}

impl Default for OpenAiConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            base_url: "https://api.openai.com/v1".to_string(),
            model: "gpt-4o".to_string(),
            max_tokens: 4000,
            temperature: 0.7,
            timeout: 30,
        }
    }
}

/// Local LLM bridge settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MaclinkConfig {
    /// Bridge base URL.
    pub base_url: String,
    /// Bridge API key, when required.
    pub api_key: String,
    /// Request timeout in seconds.
    pub timeout: u64,
    /// Whether the local provider is enabled.
    pub enabled: bool,
}

impl Default for MaclinkConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:11434".to_string(),
            api_key: String::new(),
            timeout: 60,
            enabled: true,
        }
    }
}

/// Realtime connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebsocketConfig {
    /// Connection cap.
    pub max_connections: usize,
    /// Seconds between heartbeats.
    pub heartbeat_interval: u64,
    /// Idle threshold in seconds before the reaper disconnects.
    pub connection_timeout: u64,
    /// Maximum inbound frame size in bytes.
    pub message_size_limit: usize,
}

impl Default for WebsocketConfig {
    fn default() -> Self {
        Self {
            max_connections: 100,
            heartbeat_interval: 30,
            connection_timeout: 30 * 60,
            message_size_limit: 1_048_576,
        }
    }
}

/// Security settings consumed by the HTTP collaborator.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    /// Token signing key.
    pub secret_key: String,
    /// Signing algorithm.
    pub algorithm: String,
    /// Access token lifetime in minutes.
    pub access_token_expire_minutes: u64,
    /// Allowed CORS origins.
    pub cors_origins: Vec<String>,
    /// Request ceiling per rate window.
    pub rate_limit_requests: u32,
    /// Rate window in seconds.
    pub rate_limit_window: u64,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            secret_key: String::new(),
            algorithm: "HS256".to_string(),
            access_token_expire_minutes: 30,
            cors_origins: vec!["*".to_string()],
            rate_limit_requests: 100,
            rate_limit_window: 60,
        }
    }
}

/// Workflow engine settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkflowConfig {
    /// Cap on simultaneously live executions.
    pub max_concurrent_workflows: usize,
    /// Default execution deadline in seconds.
    pub workflow_timeout: u64,
    /// Whether failed steps retry automatically when no policy is set.
    pub auto_retry_failed: bool,
    /// Default retry budget.
    pub max_retry_attempts: u32,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            max_concurrent_workflows: 10,
            workflow_timeout: 3600,
            auto_retry_failed: false,
            max_retry_attempts: 3,
        }
    }
}

/// Agent layer settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Cap on live agents.
    pub max_concurrent_agents: usize,
    /// Per-message timeout in seconds.
    pub agent_timeout: u64,
    /// Agent type used by `/spawn` without an argument.
    pub default_agent_type: String,
    /// Seconds between agent heartbeats.
    pub agent_heartbeat_interval: u64,
    /// Bound on stored conversation turns per agent.
    pub conversation_window: usize,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_concurrent_agents: 20,
            agent_timeout: 300,
            default_agent_type: "general_assistant".to_string(),
            agent_heartbeat_interval: 30,
            conversation_window: 20,
        }
    }
}

/// Audit sink settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditConfig {
    /// Whether events are recorded at all.
    pub enabled: bool,
    /// Record routine actions, not only security-relevant ones.
    pub log_all_actions: bool,
    /// Days records are kept by the persistence collaborator.
    pub retention_days: u32,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            log_all_actions: true,
            retention_days: 90,
        }
    }
}

/// Full process configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Bind address.
    pub server: ServerConfig,
    /// Backing store.
    pub database: DatabaseConfig,
    /// Deployment-host integration.
    pub alex_os: AlexOsConfig,
    /// Remote LLM provider.
    pub openai: OpenAiConfig,
    /// Local LLM bridge.
    pub maclink: MaclinkConfig,
    /// Realtime connections.
    pub websocket: WebsocketConfig,
    /// HTTP security.
    pub security: SecurityConfig,
    /// Workflow engine.
    pub workflow: WorkflowConfig,
    /// Agent layer.
    pub agent: AgentConfig,
    /// Audit sink.
    pub audit: AuditConfig,
}

impl Config {
    /// Load configuration: YAML file if present, then environment overlay.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) if path.exists() => {
                let content = std::fs::read_to_string(path).map_err(|e| {
                    OrchestratorError::Config(format!("failed to read {path:?}: {e}"))
                })?;
                serde_yaml::from_str(&content).map_err(|e| {
                    OrchestratorError::Config(format!("failed to parse {path:?}: {e}"))
                })?
            }
            _ => Config::default(),
        };
        config.apply_env_overlay();
        Ok(config)
    }

    /// Overlay `CHAINFLOW_*` environment variables onto the loaded values.
    pub fn apply_env_overlay(&mut self) {
        overlay_string(&mut self.server.host, "CHAINFLOW_SERVER_HOST");
        overlay_parsed(&mut self.server.port, "CHAINFLOW_SERVER_PORT");

        overlay_string(&mut self.database.url, "CHAINFLOW_DATABASE_URL");

        overlay_string(
            &mut self.alex_os.module_registry_url,
            "CHAINFLOW_ALEX_OS_MODULE_REGISTRY_URL",
        );
        overlay_string(&mut self.alex_os.event_bus_url, "CHAINFLOW_ALEX_OS_EVENT_BUS_URL");
        overlay_string(&mut self.alex_os.webhook_url, "CHAINFLOW_ALEX_OS_WEBHOOK_URL");
        overlay_parsed(
            &mut self.alex_os.health_check_interval,
            "CHAINFLOW_ALEX_OS_HEALTH_CHECK_INTERVAL",
        );
        overlay_parsed(
            &mut self.alex_os.registration_retry_interval,
            "CHAINFLOW_ALEX_OS_REGISTRATION_RETRY_INTERVAL",
        );
        overlay_parsed(
            &mut self.alex_os.max_registration_attempts,
            "CHAINFLOW_ALEX_OS_MAX_REGISTRATION_ATTEMPTS",
        );

        overlay_string(&mut self.openai.api_key, "CHAINFLOW_OPENAI_API_KEY");
        overlay_string(&mut self.openai.base_url, "CHAINFLOW_OPENAI_BASE_URL");
        overlay_string(&mut self.openai.model, "CHAINFLOW_OPENAI_MODEL");
        overlay_parsed(&mut self.openai.max_tokens, "CHAINFLOW_OPENAI_MAX_TOKENS");
        overlay_parsed(&mut self.openai.temperature, "CHAINFLOW_OPENAI_TEMPERATURE");
        overlay_parsed(&mut self.openai.timeout, "CHAINFLOW_OPENAI_TIMEOUT");

        overlay_string(&mut self.maclink.base_url, "CHAINFLOW_MACLINK_BASE_URL");
        overlay_string(&mut self.maclink.api_key, "CHAINFLOW_MACLINK_API_KEY");
        overlay_parsed(&mut self.maclink.timeout, "CHAINFLOW_MACLINK_TIMEOUT");
        overlay_parsed(&mut self.maclink.enabled, "CHAINFLOW_MACLINK_ENABLED");

        overlay_parsed(
            &mut self.websocket.max_connections,
            "CHAINFLOW_WEBSOCKET_MAX_CONNECTIONS",
        );
        overlay_parsed(
            &mut self.websocket.heartbeat_interval,
            "CHAINFLOW_WEBSOCKET_HEARTBEAT_INTERVAL",
        );
        overlay_parsed(
            &mut self.websocket.connection_timeout,
            "CHAINFLOW_WEBSOCKET_CONNECTION_TIMEOUT",
        );
        overlay_parsed(
            &mut self.websocket.message_size_limit,
            "CHAINFLOW_WEBSOCKET_MESSAGE_SIZE_LIMIT",
        );

        overlay_string(&mut self.security.secret_key, "CHAINFLOW_SECURITY_SECRET_KEY");
        overlay_string(&mut self.security.algorithm, "CHAINFLOW_SECURITY_ALGORITHM");
        overlay_parsed(
            &mut self.security.access_token_expire_minutes,
            "CHAINFLOW_SECURITY_ACCESS_TOKEN_EXPIRE_MINUTES",
        );
        overlay_parsed(
            &mut self.security.rate_limit_requests,
            "CHAINFLOW_SECURITY_RATE_LIMIT_REQUESTS",
        );
        overlay_parsed(
            &mut self.security.rate_limit_window,
            "CHAINFLOW_SECURITY_RATE_LIMIT_WINDOW",
        );

        overlay_parsed(
            &mut self.workflow.max_concurrent_workflows,
            "CHAINFLOW_WORKFLOW_MAX_CONCURRENT_WORKFLOWS",
        );
        overlay_parsed(
            &mut self.workflow.workflow_timeout,
            "CHAINFLOW_WORKFLOW_WORKFLOW_TIMEOUT",
        );
        overlay_parsed(
            &mut self.workflow.auto_retry_failed,
            "CHAINFLOW_WORKFLOW_AUTO_RETRY_FAILED",
        );
        overlay_parsed(
            &mut self.workflow.max_retry_attempts,
            "CHAINFLOW_WORKFLOW_MAX_RETRY_ATTEMPTS",
        );

        overlay_parsed(
            &mut self.agent.max_concurrent_agents,
            "CHAINFLOW_AGENT_MAX_CONCURRENT_AGENTS",
        );
        overlay_parsed(&mut self.agent.agent_timeout, "CHAINFLOW_AGENT_AGENT_TIMEOUT");
        overlay_string(
            &mut self.agent.default_agent_type,
            "CHAINFLOW_AGENT_DEFAULT_AGENT_TYPE",
        );
        overlay_parsed(
            &mut self.agent.agent_heartbeat_interval,
            "CHAINFLOW_AGENT_AGENT_HEARTBEAT_INTERVAL",
        );
        overlay_parsed(
            &mut self.agent.conversation_window,
            "CHAINFLOW_AGENT_CONVERSATION_WINDOW",
        );

        overlay_parsed(&mut self.audit.enabled, "CHAINFLOW_AUDIT_ENABLED");
        overlay_parsed(&mut self.audit.log_all_actions, "CHAINFLOW_AUDIT_LOG_ALL_ACTIONS");
        overlay_parsed(&mut self.audit.retention_days, "CHAINFLOW_AUDIT_RETENTION_DAYS");
    }

    /// Debug rendering with secrets blanked.
    pub fn redacted(&self) -> serde_json::Value {
        let mut value = serde_json::to_value(self).unwrap_or_default();
        for path in [
            ["openai", "api_key"],
            ["maclink", "api_key"],
            ["security", "secret_key"],
        ] {
            if let Some(field) = value.get_mut(path[0]).and_then(|s| s.get_mut(path[1])) {
                *field = serde_json::Value::String("[REDACTED]".to_string());
            }
        }
        value
    }
}

fn overlay_string(target: &mut String, key: &str) {
    if let Ok(value) = env::var(key) {
        *target = value;
    }
}

fn overlay_parsed<T: std::str::FromStr>(target: &mut T, key: &str) {
    if let Ok(value) = env::var(key) {
        if let Ok(parsed) = value.parse::<T>() {
            *target = parsed;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.server.port, 8000);
        assert_eq!(config.alex_os.health_check_interval, 60);
        assert_eq!(config.websocket.connection_timeout, 30 * 60);
        assert_eq!(config.agent.conversation_window, 20);
        assert!(config.audit.enabled);
    }

    #[test]
    fn test_load_yaml() {
        let mut file = NamedTempFile::new().unwrap();
        write!(
            file,
            "server:\n  port: 9100\nopenai:\n  model: gpt-4o-mini\nworkflow:\n  max_concurrent_workflows: 3\n"
        )
        .unwrap();

        let config = Config::load(Some(file.path())).unwrap();
        assert_eq!(config.server.port, 9100);
        assert_eq!(config.openai.model, "gpt-4o-mini");
        assert_eq!(config.workflow.max_concurrent_workflows, 3);
        // Untouched sections keep their defaults.
        assert_eq!(config.agent.max_concurrent_agents, 20);
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let config = Config::load(Some(Path::new("/nonexistent/chainflow.yaml"))).unwrap();
        assert_eq!(config.server.port, 8000);
    }

    #[test]
    fn test_env_overlay() {
        // Keys chosen to not collide with the YAML-loading test, which runs
        // in the same process.
        env::set_var("CHAINFLOW_DATABASE_URL", "postgres://test");
        env::set_var("CHAINFLOW_OPENAI_API_KEY", "sk-test");
        env::set_var("CHAINFLOW_MACLINK_ENABLED", "false");

        let mut config = Config::default();
        config.apply_env_overlay();
        assert_eq!(config.database.url, "postgres://test");
        assert_eq!(config.openai.api_key, "sk-test");
        assert!(!config.maclink.enabled);

        env::remove_var("CHAINFLOW_DATABASE_URL");
        env::remove_var("CHAINFLOW_OPENAI_API_KEY");
        env::remove_var("CHAINFLOW_MACLINK_ENABLED");
    }

    #[test]
    fn test_redacted_rendering() {
        let mut config = Config::default();
        config.openai.api_key = "sk-secret".to_string();
        config.security.secret_key = "signing".to_string();

        let rendered = config.redacted();
        assert_eq!(rendered["openai"]["api_key"], "[REDACTED]");
        assert_eq!(rendered["security"]["secret_key"], "[REDACTED]");
        assert_eq!(rendered["server"]["port"], 8000);
    }
}
