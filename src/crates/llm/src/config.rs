//! Configuration structures for the provider clients.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// One API credential for the remote provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Credential {
    /// Caller-chosen identifier for rotation and accounting.
    pub id: String,
    /// Bearer token.
    pub api_key: String,
    /// Organization header value, for providers that support it.
    pub organization: Option<String>,
}

impl Credential {
    /// Create a credential without an organization.
    pub fn new(id: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            api_key: api_key.into(),
            organization: None,
        }
    }
}

/// Configuration for the remote LLM adapter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteLlmConfig {
    /// Base URL for the API, e.g. "https://api.openai.com/v1".
    pub base_url: String,

    /// Credentials in rotation order. Must not be empty.
    pub credentials: Vec<Credential>,

    /// Model used when a request leaves the model empty.
    pub default_model: String,

    /// Request timeout.
    #[serde(default = "default_remote_timeout")]
    pub timeout: Duration,

    /// Maximum attempts for retryable failures.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Request ceiling per credential within one rate window.
    #[serde(default = "default_rate_limit_requests")]
    pub rate_limit_requests: u32,

    /// Sliding rate-accounting window.
    #[serde(default = "default_rate_window")]
    pub rate_window: Duration,

    /// Per-model max-token caps; requests above the cap are clamped.
    #[serde(default = "default_model_token_caps")]
    pub model_token_caps: HashMap<String, usize>,
}

impl RemoteLlmConfig {
    /// Create a remote configuration with a single credential.
    pub fn new(api_key: impl Into<String>, base_url: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            credentials: vec![Credential::new("default", api_key)],
            default_model: model.into(),
            timeout: default_remote_timeout(),
            max_attempts: default_max_attempts(),
            rate_limit_requests: default_rate_limit_requests(),
            rate_window: default_rate_window(),
            model_token_caps: default_model_token_caps(),
        }
    }

    /// Add another credential to the rotation.
    pub fn with_credential(mut self, credential: Credential) -> Self {
        self.credentials.push(credential);
        self
    }

    /// Set the request timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the per-credential request ceiling.
    pub fn with_rate_limit(mut self, requests: u32) -> Self {
        self.rate_limit_requests = requests;
        self
    }
}

/// Local runtime families probed during discovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuntimeKind {
    /// Ollama server.
    Ollama,
    /// llama.cpp server (OpenAI-compatible surface).
    LlamaCpp,
    /// LM Studio (OpenAI-compatible surface).
    LmStudio,
}

impl RuntimeKind {
    /// Stable name for logs and metadata.
    pub fn as_str(&self) -> &'static str {
        match self {
            RuntimeKind::Ollama => "ollama",
            RuntimeKind::LlamaCpp => "llama_cpp",
            RuntimeKind::LmStudio => "lm_studio",
        }
    }
}

impl std::fmt::Display for RuntimeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One discovery candidate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeEndpoint {
    /// Runtime family served at the endpoint.
    pub kind: RuntimeKind,
    /// Base URL, e.g. "http://localhost:11434".
    pub base_url: String,
}

impl RuntimeEndpoint {
    /// Create an endpoint entry.
    pub fn new(kind: RuntimeKind, base_url: impl Into<String>) -> Self {
        Self {
            kind,
            base_url: base_url.into(),
        }
    }
}

/// Configuration for the local LLM adapter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalLlmConfig {
    /// Candidate endpoints probed during discovery.
    #[serde(default = "default_endpoints")]
    pub endpoints: Vec<RuntimeEndpoint>,

    /// Request timeout. Local inference is slower than remote APIs.
    #[serde(default = "default_local_timeout")]
    pub timeout: Duration,

    /// Interval between health re-probes.
    #[serde(default = "default_health_interval")]
    pub health_interval: Duration,
}

impl LocalLlmConfig {
    /// Configuration probing the standard localhost ports.
    pub fn new() -> Self {
        Self {
            endpoints: default_endpoints(),
            timeout: default_local_timeout(),
            health_interval: default_health_interval(),
        }
    }

    /// Replace the candidate endpoint set.
    pub fn with_endpoints(mut self, endpoints: Vec<RuntimeEndpoint>) -> Self {
        self.endpoints = endpoints;
        self
    }

    /// Set the health re-probe interval.
    pub fn with_health_interval(mut self, interval: Duration) -> Self {
        self.health_interval = interval;
        self
    }
}

impl Default for LocalLlmConfig {
    fn default() -> Self {
        Self::new()
    }
}

fn default_remote_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_local_timeout() -> Duration {
    Duration::from_secs(60)
}

fn default_max_attempts() -> u32 {
    3
}

fn default_rate_limit_requests() -> u32 {
    60
}

fn default_rate_window() -> Duration {
    Duration::from_secs(60)
}

fn default_health_interval() -> Duration {
    Duration::from_secs(30)
}

fn default_endpoints() -> Vec<RuntimeEndpoint> {
    vec![
        RuntimeEndpoint::new(RuntimeKind::Ollama, "http://localhost:11434"),
        RuntimeEndpoint::new(RuntimeKind::LlamaCpp, "http://localhost:8080"),
        RuntimeEndpoint::new(RuntimeKind::LmStudio, "http://localhost:1234"),
    ]
}

fn default_model_token_caps() -> HashMap<String, usize> {
    let mut caps = HashMap::new();
    caps.insert("gpt-4".to_string(), 8192);
    caps.insert("gpt-4-turbo-preview".to_string(), 128_000);
    caps.insert("gpt-4o".to_string(), 128_000);
    caps.insert("gpt-4o-mini".to_string(), 128_000);
    caps.insert("gpt-3.5-turbo".to_string(), 4096);
    caps.insert("gpt-3.5-turbo-16k".to_string(), 16_384);
    caps
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remote_config_builder() {
        let config = RemoteLlmConfig::new("key", "https://api.openai.com/v1", "gpt-4o")
            .with_credential(Credential::new("backup", "key2"))
            .with_timeout(Duration::from_secs(10))
            .with_rate_limit(5);

        assert_eq!(config.credentials.len(), 2);
        assert_eq!(config.credentials[0].id, "default");
        assert_eq!(config.credentials[1].id, "backup");
        assert_eq!(config.timeout, Duration::from_secs(10));
        assert_eq!(config.rate_limit_requests, 5);
    }

    #[test]
    fn test_local_config_defaults() {
        let config = LocalLlmConfig::new();
        assert_eq!(config.endpoints.len(), 3);
        assert_eq!(config.endpoints[0].kind, RuntimeKind::Ollama);
        assert_eq!(config.timeout, Duration::from_secs(60));
        assert_eq!(config.health_interval, Duration::from_secs(30));
    }

    #[test]
    fn test_default_token_caps() {
        let caps = default_model_token_caps();
        assert_eq!(caps.get("gpt-4"), Some(&8192));
        assert_eq!(caps.get("gpt-4o"), Some(&128_000));
    }
}
