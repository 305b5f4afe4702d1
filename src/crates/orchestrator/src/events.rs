//! Outbound event-bus protocol to the deployment host.
//!
//! On startup the process registers itself with the host's agent registry,
//! then reports health on a fixed interval and POSTs lifecycle events to
//! webhook sub-paths. Registration retries at a fixed interval up to the
//! configured attempt cap.

use crate::config::AlexOsConfig;
use crate::error::{OrchestratorError, Result};
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use reqwest::Client;
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Registration envelope POSTed to the registry at startup.
#[derive(Debug, Clone, Serialize)]
pub struct RegistrationEnvelope {
    /// Module name.
    pub agent_name: String,
    /// Module version.
    pub agent_version: String,
    /// Declared role.
    pub role: String,
    /// Capability tags.
    pub capabilities: Vec<String>,
    /// UI surfaces exposed by the module.
    pub ui_features: Vec<String>,
    /// Public endpoints.
    pub endpoints: Vec<String>,
    /// Listen port.
    pub port: u16,
    /// Health endpoint path.
    pub health_endpoint: String,
    /// Event bus URL.
    pub event_bus_url: String,
    /// Webhook base URL.
    pub webhook_url: String,
    /// ISO-8601 registration time.
    pub registration_time: String,
}

/// Health envelope POSTed on the reporting interval.
#[derive(Debug, Clone, Serialize)]
pub struct HealthEnvelope {
    /// Module name.
    pub agent_name: String,
    /// Module version.
    pub agent_version: String,
    /// ISO-8601 report time.
    pub timestamp: String,
    /// Stable id of this process instance.
    pub status_id: String,
    /// "running" when any execution is live, else "idle".
    pub workflow_state: String,
    /// Live execution count.
    pub active_workflows: usize,
    /// Current workflow blockers.
    pub workflow_blockers: Vec<String>,
    /// Recent log lines.
    pub log_excerpt: String,
    /// Whether an operator should look at this module.
    pub requires_attention: bool,
    /// Why attention is required.
    pub attention_reason: Option<String>,
    /// Active realtime connections.
    pub websocket_connections: usize,
    /// Active agents.
    pub active_agents: usize,
}

#[derive(Default)]
struct HealthState {
    active_workflows: usize,
    workflow_blockers: Vec<String>,
    websocket_connections: usize,
    active_agents: usize,
    requires_attention: bool,
    attention_reason: Option<String>,
    log_excerpt: String,
}

struct RegistrationState {
    registered: bool,
    attempts: u32,
}

/// Client for the deployment host's registry, health, and webhook surface.
pub struct EventBus {
    config: AlexOsConfig,
    agent_name: String,
    agent_version: String,
    port: u16,
    status_id: String,
    http: Client,
    registration: RwLock<RegistrationState>,
    health: RwLock<HealthState>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl EventBus {
    /// Create an event bus client.
    pub fn new(config: AlexOsConfig, agent_name: impl Into<String>, port: u16) -> Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| OrchestratorError::Config(e.to_string()))?;

        Ok(Self {
            config,
            agent_name: agent_name.into(),
            agent_version: env!("CARGO_PKG_VERSION").to_string(),
            port,
            status_id: uuid::Uuid::new_v4().to_string(),
            http,
            registration: RwLock::new(RegistrationState {
                registered: false,
                attempts: 0,
            }),
            health: RwLock::new(HealthState::default()),
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Attempt one registration. Returns whether the registry accepted it.
    pub async fn register(&self) -> bool {
        if self.registration.read().registered {
            return true;
        }
        self.registration.write().attempts += 1;

        let envelope = RegistrationEnvelope {
            agent_name: self.agent_name.clone(),
            agent_version: self.agent_version.clone(),
            role: "workflow_orchestrator".to_string(),
            capabilities: vec![
                "workflow_execution".to_string(),
                "agent_management".to_string(),
                "entanglement".to_string(),
                "realtime_updates".to_string(),
            ],
            ui_features: vec![
                "agent_map".to_string(),
                "workflow_builder".to_string(),
                "watchtower".to_string(),
            ],
            endpoints: vec!["/api/workflows".to_string(), "/api/agents".to_string()],
            port: self.port,
            health_endpoint: "/health".to_string(),
            event_bus_url: self.config.event_bus_url.clone(),
            webhook_url: self.config.webhook_url.clone(),
            registration_time: Utc::now().to_rfc3339(),
        };

        let url = format!("{}/api/agents/register", self.config.module_registry_url);
        match self.http.post(&url).json(&envelope).send().await {
            Ok(response) if response.status().is_success() => {
                self.registration.write().registered = true;
                info!(agent = %self.agent_name, "registered with module registry");
                true
            }
            Ok(response) => {
                warn!(status = %response.status(), "registration rejected");
                false
            }
            Err(err) => {
                warn!(error = %err, "registration attempt failed");
                false
            }
        }
    }

    /// Register with fixed-interval retries up to the attempt cap, then
    /// start the periodic health reporter. Idempotent.
    pub fn start(self: Arc<Self>) {
        let mut tasks = self.tasks.lock();
        if !tasks.is_empty() {
            return;
        }

        let bus = Arc::clone(&self);
        tasks.push(tokio::spawn(async move {
            loop {
                if bus.register().await {
                    break;
                }
                if bus.registration.read().attempts >= bus.config.max_registration_attempts {
                    warn!(
                        attempts = bus.registration.read().attempts,
                        "giving up on registration"
                    );
                    break;
                }
                tokio::time::sleep(Duration::from_secs(bus.config.registration_retry_interval))
                    .await;
            }
        }));

        let bus = Arc::clone(&self);
        tasks.push(tokio::spawn(async move {
            let interval = Duration::from_secs(bus.config.health_check_interval.max(1));
            loop {
                tokio::time::sleep(interval).await;
                if let Err(err) = bus.send_health_report().await {
                    debug!(error = %err, "health report failed");
                }
            }
        }));
    }

    /// Stop background tasks. Idempotent.
    pub fn stop(&self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }

    /// Compose and POST one health envelope.
    pub async fn send_health_report(&self) -> Result<()> {
        let envelope = self.health_envelope();
        let url = format!("{}/api/agents/health", self.config.module_registry_url);
        self.http
            .post(&url)
            .json(&envelope)
            .send()
            .await
            .map_err(|e| OrchestratorError::Internal(format!("health POST failed: {e}")))?;
        Ok(())
    }

    /// Current health envelope, for inspection and tests.
    pub fn health_envelope(&self) -> HealthEnvelope {
        let health = self.health.read();
        HealthEnvelope {
            agent_name: self.agent_name.clone(),
            agent_version: self.agent_version.clone(),
            timestamp: Utc::now().to_rfc3339(),
            status_id: self.status_id.clone(),
            workflow_state: if health.active_workflows > 0 {
                "running".to_string()
            } else {
                "idle".to_string()
            },
            active_workflows: health.active_workflows,
            workflow_blockers: health.workflow_blockers.clone(),
            log_excerpt: health.log_excerpt.clone(),
            requires_attention: health.requires_attention,
            attention_reason: health.attention_reason.clone(),
            websocket_connections: health.websocket_connections,
            active_agents: health.active_agents,
        }
    }

    /// POST a lifecycle event to its webhook sub-path.
    pub async fn emit(&self, event_type: &str, data: serde_json::Value) -> Result<()> {
        let url = format!("{}/{event_type}", self.config.webhook_url);
        let envelope = json!({
            "event_type": event_type,
            "timestamp": Utc::now().to_rfc3339(),
            "source": self.agent_name,
            "data": data,
        });
        self.http
            .post(&url)
            .json(&envelope)
            .send()
            .await
            .map_err(|e| OrchestratorError::Internal(format!("webhook POST failed: {e}")))?;
        debug!(event = event_type, "lifecycle event emitted");
        Ok(())
    }

    /// Update the workflow figures reported in health envelopes.
    pub fn update_workflow_state(&self, active_workflows: usize, blockers: Vec<String>) {
        let mut health = self.health.write();
        health.active_workflows = active_workflows;
        health.workflow_blockers = blockers;
    }

    /// Update the agent count reported in health envelopes.
    pub fn update_agent_state(&self, active_agents: usize) {
        self.health.write().active_agents = active_agents;
    }

    /// Update the connection count reported in health envelopes.
    pub fn update_websocket_state(&self, connections: usize) {
        self.health.write().websocket_connections = connections;
    }

    /// Flag (or clear) the attention marker.
    pub fn set_attention_required(&self, required: bool, reason: Option<String>) {
        let mut health = self.health.write();
        health.requires_attention = required;
        health.attention_reason = reason;
    }

    /// Replace the log excerpt included in health envelopes.
    pub fn set_log_excerpt(&self, excerpt: impl Into<String>) {
        self.health.write().log_excerpt = excerpt.into();
    }

    /// Registration status snapshot.
    pub fn registration_status(&self) -> (bool, u32) {
        let state = self.registration.read();
        (state.registered, state.attempts)
    }
}
