//! Explicit component wiring.
//!
//! `Core` replaces module-level singletons: every component is constructed
//! here in dependency order and handed to its dependents by reference.
//! Background tasks (idle reaper, local-model health loop, registration and
//! health reporting) start last and stop first; `stop` is idempotent.

use crate::config::Config;
use crate::engine::{EngineSettings, WorkflowEngine};
use crate::error::Result;
use crate::events::EventBus;
use crate::handlers::HandlerRegistry;
use agents::{AgentBrain, AgentManager, AgentType, EntanglementManager};
use async_trait::async_trait;
use audit::AuditSink;
use llm::{LocalClient, LocalLlmConfig, Provider, RemoteClient, RemoteLlmConfig, RuntimeEndpoint, RuntimeKind};
use realtime::{CommandSink, FanoutBus};
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

/// The assembled system.
pub struct Core {
    /// Loaded configuration.
    pub config: Config,
    /// Realtime fanout bus.
    pub bus: Arc<FanoutBus>,
    /// Audit sink.
    pub audit: Arc<AuditSink>,
    /// Local LLM adapter, when enabled.
    pub local: Option<Arc<LocalClient>>,
    /// Remote LLM adapter, when configured.
    pub remote: Option<Arc<RemoteClient>>,
    /// Agent brain.
    pub brain: Arc<AgentBrain>,
    /// Agent manager.
    pub agents: Arc<AgentManager>,
    /// Entanglement manager.
    pub entanglements: Arc<EntanglementManager>,
    /// Workflow engine.
    pub engine: Arc<WorkflowEngine>,
    /// Outbound event bus.
    pub events: Arc<EventBus>,
    started: AtomicBool,
    stopped: AtomicBool,
}

impl Core {
    /// Construct every component in dependency order. No background task
    /// runs until [`Core::start`].
    pub fn new(config: Config) -> Result<Arc<Self>> {
        let bus = Arc::new(FanoutBus::with_idle_threshold(Duration::from_secs(
            config.websocket.connection_timeout,
        )));
        let audit = Arc::new(AuditSink::with_bus(config.audit.enabled, Arc::clone(&bus)));

        let remote = if config.openai.api_key.is_empty() {
            None
        } else {
            let remote_config = RemoteLlmConfig::new(
                config.openai.api_key.clone(),
                config.openai.base_url.clone(),
                config.openai.model.clone(),
            )
            .with_timeout(Duration::from_secs(config.openai.timeout));
            Some(Arc::new(RemoteClient::new(remote_config)?))
        };

        let local = if config.maclink.enabled {
            let local_config = LocalLlmConfig::new()
                .with_endpoints(vec![
                    RuntimeEndpoint::new(RuntimeKind::Ollama, config.maclink.base_url.clone()),
                    RuntimeEndpoint::new(RuntimeKind::LlamaCpp, "http://localhost:8080"),
                    RuntimeEndpoint::new(RuntimeKind::LmStudio, "http://localhost:1234"),
                ]);
            Some(Arc::new(LocalClient::new(local_config)?))
        } else {
            None
        };

        let brain = Arc::new(
            AgentBrain::new(
                remote.clone().map(|c| c as Arc<dyn Provider>),
                local.clone().map(|c| c as Arc<dyn Provider>),
            )
            .with_window(config.agent.conversation_window),
        );

        let agents = Arc::new(AgentManager::new(
            Arc::clone(&brain),
            Arc::clone(&bus),
            Arc::clone(&audit),
        ));
        let entanglements = Arc::new(EntanglementManager::new(
            Arc::clone(&agents),
            Arc::clone(&bus),
            Arc::clone(&audit),
        ));

        let registry = Arc::new(HandlerRegistry::with_defaults());
        let engine = WorkflowEngine::with_settings(
            registry,
            Arc::clone(&agents),
            Arc::clone(&bus),
            Arc::clone(&audit),
            EngineSettings {
                max_concurrent_workflows: config.workflow.max_concurrent_workflows,
                default_timeout: Some(Duration::from_secs(config.workflow.workflow_timeout)),
                retention: Duration::from_secs(300),
            },
        );

        let events = Arc::new(EventBus::new(
            config.alex_os.clone(),
            "chainflow",
            config.server.port,
        )?);
        engine.set_event_bus(Arc::clone(&events));

        let core = Arc::new(Self {
            config,
            bus,
            audit,
            local,
            remote,
            brain,
            agents,
            entanglements,
            engine,
            events,
            started: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
        });

        core.bus.set_command_sink(Arc::new(CoreCommandSink {
            engine: Arc::clone(&core.engine),
            agents: Arc::clone(&core.agents),
            default_agent_type: core.config.agent.default_agent_type.clone(),
        }));

        Ok(core)
    }

    /// Start background tasks: model discovery and health loop, idle
    /// reaper, registration and health reporting. Idempotent.
    pub async fn start(self: &Arc<Self>) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("starting chainflow core");

        if let Some(local) = &self.local {
            local.discover().await;
            Arc::clone(local).start_health_loop();
        }
        Arc::clone(&self.bus).start_reaper(Duration::from_secs(
            self.config.websocket.heartbeat_interval.max(1),
        ));
        Arc::clone(&self.events).start();

        self.audit
            .log_event(
                audit::AuditEvent::new("system.started", "system", "system", "0")
                    .with_metadata(self.config.redacted()),
            )
            .await;
    }

    /// Shut down in reverse dependency order. Idempotent.
    pub async fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("stopping chainflow core");

        self.events.stop();
        self.engine.stop();
        self.bus.stop();
        if let Some(local) = &self.local {
            local.stop();
        }
    }

    /// Create an agent and emit the lifecycle webhook.
    pub async fn spawn_agent(
        &self,
        agent_type: AgentType,
        name: &str,
        config: serde_json::Value,
        owner_id: &str,
    ) -> Result<String> {
        let agent_id = self
            .agents
            .create_agent(agent_type, name, config, owner_id)
            .await?;
        self.emit_lifecycle("agent_spawned", json!({"agent_id": agent_id, "name": name}));
        self.events.update_agent_state(self.active_agent_count());
        Ok(agent_id)
    }

    /// Terminate an agent and emit the lifecycle webhook.
    pub async fn terminate_agent(&self, agent_id: &str) -> Result<()> {
        self.agents.terminate(agent_id).await?;
        self.emit_lifecycle("agent_terminated", json!({"agent_id": agent_id}));
        self.events.update_agent_state(self.active_agent_count());
        Ok(())
    }

    /// Create an entanglement and emit the lifecycle webhook.
    pub async fn create_entanglement(
        &self,
        name: &str,
        description: &str,
        owner_id: &str,
    ) -> String {
        let entanglement_id = self.entanglements.create(name, description, owner_id).await;
        self.emit_lifecycle(
            "entanglement_created",
            json!({"entanglement_id": entanglement_id, "name": name}),
        );
        entanglement_id
    }

    /// Destroy an entanglement and emit the lifecycle webhook.
    pub async fn destroy_entanglement(&self, entanglement_id: &str, actor_id: &str) -> Result<()> {
        self.entanglements.cleanup(entanglement_id, actor_id).await?;
        self.emit_lifecycle(
            "entanglement_destroyed",
            json!({"entanglement_id": entanglement_id}),
        );
        Ok(())
    }

    fn active_agent_count(&self) -> usize {
        self.agents
            .list_agents()
            .iter()
            .filter(|agent| agent.status != agents::AgentStatus::Offline)
            .count()
    }

    fn emit_lifecycle(&self, event_type: &'static str, data: serde_json::Value) {
        let events = Arc::clone(&self.events);
        tokio::spawn(async move {
            if let Err(err) = events.emit(event_type, data).await {
                error!(event = event_type, error = %err, "lifecycle webhook failed");
            }
        });
    }
}

// Bridges client slash commands onto the engine and agent manager.
struct CoreCommandSink {
    engine: Arc<WorkflowEngine>,
    agents: Arc<AgentManager>,
    default_agent_type: String,
}

#[async_trait]
impl CommandSink for CoreCommandSink {
    async fn run_workflow(&self, workflow: &str, user_id: Option<&str>) {
        let Some(definition) = self.engine.find_workflow_by_name(workflow) else {
            warn!(%workflow, "slash command for unknown workflow");
            return;
        };
        let user = user_id.unwrap_or("anonymous");
        match self
            .engine
            .execute_workflow(&definition.id, user, serde_json::Value::Null)
        {
            Ok(execution_id) => info!(%workflow, %execution_id, "workflow started via slash command"),
            Err(err) => warn!(%workflow, error = %err, "slash command execution failed"),
        }
    }

    async fn spawn_agent(&self, agent_type: &str, user_id: Option<&str>) {
        let parsed = AgentType::parse(agent_type).unwrap_or(AgentType::Chatgpt);
        let user = user_id.unwrap_or("anonymous");
        let name = if agent_type.is_empty() {
            self.default_agent_type.clone()
        } else {
            agent_type.to_string()
        };
        if let Err(err) = self
            .agents
            .create_agent(parsed, name, serde_json::json!({}), user)
            .await
        {
            warn!(%agent_type, error = %err, "slash command spawn failed");
        }
    }

    async fn kill_agent(&self, agent_id: &str, _user_id: Option<&str>) {
        if let Err(err) = self.agents.terminate(agent_id).await {
            warn!(%agent_id, error = %err, "slash command kill failed");
        }
    }
}
