//! Agent lifecycle and message routing.

use crate::brain::{AgentBrain, BrainRequest};
use crate::error::{AgentError, Result};
use crate::persona::Persona;
use audit::AuditSink;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use llm::ProviderKind;
use realtime::{BusMessage, FanoutBus, MessageType, WindowType};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{error, info};
use uuid::Uuid;

/// Supported agent variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentType {
    /// Plain conversational agent on the remote provider.
    Chatgpt,
    /// Remote agent carrying user-supplied instructions.
    CustomGpt,
    /// Host-platform integration agent.
    PlatformAgent,
    /// Agent driving workflow steps.
    WorkflowAgent,
    /// Agent observing and supervising other agents.
    SupervisorAgent,
}

impl AgentType {
    /// Stable wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentType::Chatgpt => "chatgpt",
            AgentType::CustomGpt => "custom_gpt",
            AgentType::PlatformAgent => "platform_agent",
            AgentType::WorkflowAgent => "workflow_agent",
            AgentType::SupervisorAgent => "supervisor_agent",
        }
    }

    /// Parse a wire name.
    pub fn parse(tag: &str) -> Option<Self> {
        match tag {
            "chatgpt" => Some(AgentType::Chatgpt),
            "custom_gpt" => Some(AgentType::CustomGpt),
            "platform_agent" => Some(AgentType::PlatformAgent),
            "workflow_agent" => Some(AgentType::WorkflowAgent),
            "supervisor_agent" => Some(AgentType::SupervisorAgent),
            _ => None,
        }
    }
}

impl std::fmt::Display for AgentType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Agent status states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    /// Ready for work.
    Idle,
    /// Performing non-LLM work.
    Busy,
    /// Waiting on a completion.
    Thinking,
    /// Exchanging messages with another agent.
    Communicating,
    /// Failed; requires explicit recovery.
    Error,
    /// Terminated; removed from routing.
    Offline,
}

impl AgentStatus {
    /// Stable wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentStatus::Idle => "idle",
            AgentStatus::Busy => "busy",
            AgentStatus::Thinking => "thinking",
            AgentStatus::Communicating => "communicating",
            AgentStatus::Error => "error",
            AgentStatus::Offline => "offline",
        }
    }

    // offline is terminal; error only leaves through recovery or termination.
    fn can_transition(self, to: AgentStatus) -> bool {
        if self == to {
            return true;
        }
        match self {
            AgentStatus::Offline => false,
            AgentStatus::Error => matches!(to, AgentStatus::Idle | AgentStatus::Offline),
            _ => true,
        }
    }
}

impl std::fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One capability advertised by an agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capability {
    /// Capability tag.
    pub name: String,
    /// Human-readable summary.
    pub description: String,
}

impl Capability {
    fn new(name: &str, description: &str) -> Self {
        Self {
            name: name.to_string(),
            description: description.to_string(),
        }
    }
}

/// A managed agent. Cheap to clone; snapshots are handed to handlers.
#[derive(Debug, Clone, Serialize)]
pub struct Agent {
    /// Process-wide unique id.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Variant tag.
    pub agent_type: AgentType,
    /// Type-specific configuration.
    pub config: serde_json::Value,
    /// Current status.
    pub status: AgentStatus,
    /// Capabilities derived from type and config at creation.
    pub capabilities: Vec<Capability>,
    /// Last observed activity.
    pub last_activity: DateTime<Utc>,
}

/// Result of sending one message to an agent.
#[derive(Debug, Clone, Serialize)]
pub struct SendOutcome {
    /// Agent that answered.
    pub agent_id: String,
    /// Response text.
    pub response: String,
    /// Provider that served the completion.
    pub provider: ProviderKind,
    /// Model that served the completion.
    pub model: String,
    /// Tokens consumed.
    pub tokens_used: usize,
    /// Wall-clock seconds spent.
    pub processing_time: f64,
    /// Advisory confidence.
    pub confidence: f64,
    /// Completion metadata.
    pub metadata: HashMap<String, serde_json::Value>,
}

/// One hop of a chain route.
#[derive(Debug, Clone, Serialize)]
pub struct ChainHop {
    /// Agent the message passed through.
    pub agent_id: String,
    /// Agent display name.
    pub agent_name: String,
    /// Prompt the agent received.
    pub input: String,
    /// Response the agent produced.
    pub output: String,
    /// When the hop completed.
    pub timestamp: DateTime<Utc>,
}

/// Result of routing a message through an ordered agent chain.
#[derive(Debug, Clone, Serialize)]
pub struct ChainResult {
    /// Workflow the chain ran under.
    pub workflow_id: String,
    /// Per-agent outcomes in chain order.
    pub responses: Vec<SendOutcome>,
    /// Full trace of prompts and responses.
    pub trace: Vec<ChainHop>,
}

/// Agent lifecycle manager: creation, routing, termination.
pub struct AgentManager {
    brain: Arc<AgentBrain>,
    bus: Arc<FanoutBus>,
    audit: Arc<AuditSink>,
    agents: DashMap<String, Agent>,
}

impl AgentManager {
    /// Create a manager over the given brain, bus and audit sink.
    pub fn new(brain: Arc<AgentBrain>, bus: Arc<FanoutBus>, audit: Arc<AuditSink>) -> Self {
        Self {
            brain,
            bus,
            audit,
            agents: DashMap::new(),
        }
    }

    /// Create an agent. Validates the config for its type, derives the
    /// capability set, audits and broadcasts the spawn.
    pub async fn create_agent(
        &self,
        agent_type: AgentType,
        name: impl Into<String>,
        config: serde_json::Value,
        owner_id: &str,
    ) -> Result<String> {
        let name = name.into();
        validate_config(agent_type, &config)?;

        let agent = Agent {
            id: Uuid::new_v4().to_string(),
            name: name.clone(),
            agent_type,
            capabilities: capabilities_for(agent_type, &config),
            config,
            status: AgentStatus::Idle,
            last_activity: Utc::now(),
        };
        let agent_id = agent.id.clone();
        self.agents.insert(agent_id.clone(), agent);

        info!(agent = %agent_id, %agent_type, "agent created");
        self.audit
            .log_agent_event(
                &agent_id,
                "spawned",
                owner_id,
                json!({"agent_type": agent_type.as_str(), "name": name}),
            )
            .await;
        self.bus
            .broadcast_to_window(
                WindowType::AgentMap,
                &BusMessage::new(
                    MessageType::AgentSpawn,
                    WindowType::AgentMap,
                    json!({
                        "agent_id": agent_id,
                        "name": name,
                        "type": agent_type.as_str(),
                        "status": AgentStatus::Idle.as_str(),
                    }),
                ),
            )
            .await;

        Ok(agent_id)
    }

    /// Send a message to an agent and return its response.
    pub async fn send_message(
        &self,
        agent_id: &str,
        message: &str,
        context: serde_json::Value,
    ) -> Result<SendOutcome> {
        let agent = self
            .agent(agent_id)
            .filter(|a| a.status != AgentStatus::Offline)
            .ok_or_else(|| AgentError::AgentNotFound(agent_id.to_string()))?;

        self.set_status(agent_id, AgentStatus::Thinking).await?;

        let persona = self.persona_for(agent.agent_type, &agent.config);
        let request = BrainRequest {
            prompt: message.to_string(),
            agent_id: agent_id.to_string(),
            persona: Some(persona),
            provider: None,
            model: None,
            conversation_history: Vec::new(),
            context_data: context,
        };

        match self.brain.generate_completion(request).await {
            Ok(response) => {
                self.set_status(agent_id, AgentStatus::Idle).await?;

                self.audit
                    .log_agent_event(
                        agent_id,
                        "message_processed",
                        agent_id,
                        json!({
                            "message_length": message.len(),
                            "response_length": response.content.len(),
                            "provider": response.provider.to_string(),
                            "model": response.model,
                            "tokens_used": response.tokens_used,
                            "processing_time": response.processing_time,
                            "confidence": response.confidence,
                        }),
                    )
                    .await;

                self.bus
                    .broadcast_to_window(
                        WindowType::AgentMap,
                        &BusMessage::new(
                            MessageType::AgentResponse,
                            WindowType::AgentMap,
                            json!({
                                "agent_id": agent_id,
                                "message": response.content,
                                "provider": response.provider.to_string(),
                                "model": response.model,
                            }),
                        ),
                    )
                    .await;

                Ok(SendOutcome {
                    agent_id: agent_id.to_string(),
                    response: response.content,
                    provider: response.provider,
                    model: response.model,
                    tokens_used: response.tokens_used,
                    processing_time: response.processing_time,
                    confidence: response.confidence,
                    metadata: response.metadata,
                })
            }
            Err(err) => {
                error!(agent = %agent_id, error = %err, "message processing failed");
                // Best effort; the transition to error is always legal here.
                let _ = self.set_status(agent_id, AgentStatus::Error).await;
                self.audit
                    .log_agent_event(
                        agent_id,
                        "message_failed",
                        agent_id,
                        json!({"error": err.to_string()}),
                    )
                    .await;
                Err(err)
            }
        }
    }

    /// Route a message through an ordered agent chain, piping each response
    /// into the next agent's prompt.
    pub async fn route_through_chain(
        &self,
        workflow_id: &str,
        agent_ids: &[String],
        initial_message: &str,
    ) -> Result<ChainResult> {
        for agent_id in agent_ids {
            if self.agent(agent_id).is_none() {
                return Err(AgentError::AgentNotFound(agent_id.clone()));
            }
        }

        let mut responses = Vec::with_capacity(agent_ids.len());
        let mut trace = Vec::with_capacity(agent_ids.len());
        let mut current = initial_message.to_string();

        for agent_id in agent_ids {
            let agent_name = self
                .agent(agent_id)
                .map(|a| a.name)
                .unwrap_or_else(|| agent_id.clone());
            let outcome = self
                .send_message(
                    agent_id,
                    &current,
                    json!({"workflow_id": workflow_id, "chain_position": responses.len()}),
                )
                .await?;

            trace.push(ChainHop {
                agent_id: agent_id.clone(),
                agent_name,
                input: current.clone(),
                output: outcome.response.clone(),
                timestamp: Utc::now(),
            });
            current = outcome.response.clone();
            responses.push(outcome);
        }

        self.audit
            .log_workflow_event(
                workflow_id,
                "chain_routed",
                "system",
                json!({"agents": agent_ids, "hops": trace.len()}),
            )
            .await;

        Ok(ChainResult {
            workflow_id: workflow_id.to_string(),
            responses,
            trace,
        })
    }

    /// Terminate an agent: status goes offline and it leaves routing.
    pub async fn terminate(&self, agent_id: &str) -> Result<()> {
        self.set_status(agent_id, AgentStatus::Offline).await?;
        self.audit
            .log_agent_event(agent_id, "terminated", "system", serde_json::Value::Null)
            .await;
        self.bus
            .broadcast_to_window(
                WindowType::AgentMap,
                &BusMessage::new(
                    MessageType::AgentKill,
                    WindowType::AgentMap,
                    json!({"agent_id": agent_id}),
                ),
            )
            .await;
        Ok(())
    }

    /// Explicitly recover an agent from `error` back to `idle`.
    pub async fn recover(&self, agent_id: &str) -> Result<()> {
        let agent = self
            .agent(agent_id)
            .ok_or_else(|| AgentError::AgentNotFound(agent_id.to_string()))?;
        if agent.status != AgentStatus::Error {
            return Err(AgentError::IllegalTransition {
                from: agent.status.to_string(),
                to: AgentStatus::Idle.to_string(),
            });
        }
        self.set_status(agent_id, AgentStatus::Idle).await
    }

    /// Change an agent's status, enforcing the state machine, and broadcast
    /// the update.
    pub async fn set_status(&self, agent_id: &str, status: AgentStatus) -> Result<()> {
        {
            let mut entry = self
                .agents
                .get_mut(agent_id)
                .ok_or_else(|| AgentError::AgentNotFound(agent_id.to_string()))?;
            if !entry.status.can_transition(status) {
                return Err(AgentError::IllegalTransition {
                    from: entry.status.to_string(),
                    to: status.to_string(),
                });
            }
            entry.status = status;
            entry.last_activity = Utc::now();
        }

        self.bus
            .broadcast_to_window(
                WindowType::AgentMap,
                &BusMessage::new(
                    MessageType::AgentStatusUpdate,
                    WindowType::AgentMap,
                    json!({"agent_id": agent_id, "status": status.as_str()}),
                ),
            )
            .await;
        Ok(())
    }

    /// Snapshot of one agent.
    pub fn agent(&self, agent_id: &str) -> Option<Agent> {
        self.agents.get(agent_id).map(|entry| entry.clone())
    }

    /// Snapshots of all agents, including offline ones.
    pub fn list_agents(&self) -> Vec<Agent> {
        self.agents.iter().map(|entry| entry.clone()).collect()
    }

    /// Current status of an agent.
    pub fn agent_status(&self, agent_id: &str) -> Option<AgentStatus> {
        self.agents.get(agent_id).map(|entry| entry.status)
    }

    /// Capability set of an agent.
    pub fn agent_capabilities(&self, agent_id: &str) -> Option<Vec<Capability>> {
        self.agents
            .get(agent_id)
            .map(|entry| entry.capabilities.clone())
    }

    // Persona selection is a pure function of (type, config).
    fn persona_for(&self, agent_type: AgentType, config: &serde_json::Value) -> Persona {
        let named = |name: &str| {
            self.brain
                .persona(name)
                .unwrap_or_else(|| Persona::new(name, "", ProviderKind::Remote, "gpt-4o"))
        };
        match agent_type {
            AgentType::Chatgpt | AgentType::PlatformAgent => named("general_assistant"),
            AgentType::WorkflowAgent => named("analyst"),
            AgentType::SupervisorAgent => named("code_assistant"),
            AgentType::CustomGpt => {
                let gpt_id = config.get("gpt_id").and_then(|v| v.as_str()).unwrap_or("");
                let instructions = config
                    .get("instructions")
                    .and_then(|v| v.as_str())
                    .unwrap_or("");
                Persona::new(
                    format!("custom_gpt:{gpt_id}"),
                    instructions,
                    ProviderKind::Remote,
                    "gpt-4o",
                )
            }
        }
    }
}

fn validate_config(agent_type: AgentType, config: &serde_json::Value) -> Result<()> {
    let has_str = |key: &str| config.get(key).and_then(|v| v.as_str()).is_some();
    match agent_type {
        AgentType::CustomGpt => {
            if !has_str("gpt_id") || !has_str("instructions") {
                return Err(AgentError::InvalidConfig(
                    "custom_gpt requires gpt_id and instructions".to_string(),
                ));
            }
        }
        AgentType::PlatformAgent => {
            if !has_str("agent_type") || config.get("capabilities").and_then(|v| v.as_array()).is_none() {
                return Err(AgentError::InvalidConfig(
                    "platform_agent requires agent_type and capabilities".to_string(),
                ));
            }
        }
        _ => {}
    }
    Ok(())
}

fn capabilities_for(agent_type: AgentType, config: &serde_json::Value) -> Vec<Capability> {
    match agent_type {
        AgentType::Chatgpt => vec![
            Capability::new("conversation", "Natural language conversation"),
            Capability::new("text_generation", "Free-form text generation"),
            Capability::new("code_assistance", "Code explanation and generation"),
        ],
        AgentType::CustomGpt => vec![
            Capability::new("custom_instructions", "Behavior fixed by user instructions"),
            Capability::new("conversation", "Natural language conversation"),
        ],
        AgentType::PlatformAgent => config
            .get("capabilities")
            .and_then(|v| v.as_array())
            .map(|items| {
                items
                    .iter()
                    .filter_map(|v| v.as_str())
                    .map(|name| Capability::new(name, "Declared by platform configuration"))
                    .collect()
            })
            .unwrap_or_default(),
        AgentType::WorkflowAgent => vec![
            Capability::new("workflow_execution", "Drives workflow steps"),
            Capability::new("task_automation", "Automates recurring tasks"),
        ],
        AgentType::SupervisorAgent => vec![
            Capability::new("agent_supervision", "Observes other agents"),
            Capability::new("workflow_monitoring", "Tracks workflow progress"),
        ],
    }
}
