//! Entanglements: named agent groups with a shared message bus.

use crate::error::{AgentError, Result};
use crate::manager::AgentManager;
use audit::AuditSink;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::future::join_all;
use realtime::{BusMessage, FanoutBus, MessageType, WindowType};
use serde::Serialize;
use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

/// A message exchanged inside an entanglement.
#[derive(Debug, Clone, Serialize)]
pub struct GroupMessage {
    /// Message id.
    pub id: String,
    /// Sending agent ("system" for coordination).
    pub sender_id: String,
    /// Receiving agent.
    pub receiver_id: String,
    /// Message text.
    pub content: String,
    /// Free-form type tag, e.g. "text" or "coordination".
    pub message_type: String,
    /// Extra payload.
    pub metadata: serde_json::Value,
    /// When the message was logged.
    pub timestamp: DateTime<Utc>,
}

/// A named group of agents sharing a message log.
#[derive(Debug, Clone, Serialize)]
pub struct Entanglement {
    /// Group id.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Description.
    pub description: String,
    /// Member agent ids.
    pub members: HashSet<String>,
    /// When the group was created.
    pub created_at: DateTime<Utc>,
    /// Ordered message log.
    pub message_log: Vec<GroupMessage>,
}

/// Summary view of one entanglement.
#[derive(Debug, Clone, Serialize)]
pub struct EntanglementStatus {
    /// Group id.
    pub entanglement_id: String,
    /// Display name.
    pub name: String,
    /// Description.
    pub description: String,
    /// Member agent ids.
    pub agents: Vec<String>,
    /// Member count.
    pub agent_count: usize,
    /// Logged message count.
    pub message_count: usize,
    /// When the group was created.
    pub created_at: DateTime<Utc>,
}

/// Result of coordinating a task across a group.
#[derive(Debug, Clone, Serialize)]
pub struct CoordinationResult {
    /// Group id.
    pub entanglement_id: String,
    /// The coordinated task.
    pub task: String,
    /// Agents the task was fanned out to.
    pub agents: Vec<String>,
    /// Per-agent outcome: the response payload, or an error object.
    pub results: HashMap<String, serde_json::Value>,
}

/// Owner of all entanglements and their coordinator.
pub struct EntanglementManager {
    agents: Arc<AgentManager>,
    bus: Arc<FanoutBus>,
    audit: Arc<AuditSink>,
    entanglements: DashMap<String, Entanglement>,
}

impl EntanglementManager {
    /// Create a manager.
    pub fn new(agents: Arc<AgentManager>, bus: Arc<FanoutBus>, audit: Arc<AuditSink>) -> Self {
        Self {
            agents,
            bus,
            audit,
            entanglements: DashMap::new(),
        }
    }

    /// Create an entanglement; returns its id.
    pub async fn create(
        &self,
        name: impl Into<String>,
        description: impl Into<String>,
        owner_id: &str,
    ) -> String {
        let entanglement = Entanglement {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            description: description.into(),
            members: HashSet::new(),
            created_at: Utc::now(),
            message_log: Vec::new(),
        };
        let id = entanglement.id.clone();
        let name = entanglement.name.clone();
        self.entanglements.insert(id.clone(), entanglement);

        info!(entanglement = %id, "entanglement created");
        self.audit
            .log_entanglement_event(&id, "created", owner_id, json!({"name": name}))
            .await;
        id
    }

    /// Add an agent to a group.
    pub async fn add_agent(&self, entanglement_id: &str, agent_id: &str, actor_id: &str) -> Result<()> {
        let agent = self
            .agents
            .agent(agent_id)
            .ok_or_else(|| AgentError::AgentNotFound(agent_id.to_string()))?;
        {
            let mut entry = self
                .entanglements
                .get_mut(entanglement_id)
                .ok_or_else(|| AgentError::EntanglementNotFound(entanglement_id.to_string()))?;
            entry.members.insert(agent_id.to_string());
        }

        self.audit
            .log_entanglement_event(
                entanglement_id,
                "agent_added",
                actor_id,
                json!({"agent_id": agent_id, "agent_name": agent.name}),
            )
            .await;
        self.broadcast_event(
            "agent_added",
            json!({"entanglement_id": entanglement_id, "agent_id": agent_id}),
        )
        .await;
        Ok(())
    }

    /// Remove an agent from a group.
    pub async fn remove_agent(
        &self,
        entanglement_id: &str,
        agent_id: &str,
        actor_id: &str,
    ) -> Result<()> {
        let removed = {
            let mut entry = self
                .entanglements
                .get_mut(entanglement_id)
                .ok_or_else(|| AgentError::EntanglementNotFound(entanglement_id.to_string()))?;
            entry.members.remove(agent_id)
        };
        if !removed {
            return Err(AgentError::AgentNotFound(agent_id.to_string()));
        }

        self.audit
            .log_entanglement_event(
                entanglement_id,
                "agent_removed",
                actor_id,
                json!({"agent_id": agent_id}),
            )
            .await;
        self.broadcast_event(
            "agent_removed",
            json!({"entanglement_id": entanglement_id, "agent_id": agent_id}),
        )
        .await;
        Ok(())
    }

    /// Send a message between two agents. Both must share an entanglement.
    pub async fn send(
        &self,
        sender_id: &str,
        receiver_id: &str,
        content: &str,
        message_type: &str,
        metadata: serde_json::Value,
    ) -> Result<GroupMessage> {
        let entanglement_id = self
            .shared_entanglement(sender_id, receiver_id)
            .ok_or_else(|| AgentError::NotEntangled {
                sender: sender_id.to_string(),
                receiver: receiver_id.to_string(),
            })?;

        let message = GroupMessage {
            id: Uuid::new_v4().to_string(),
            sender_id: sender_id.to_string(),
            receiver_id: receiver_id.to_string(),
            content: content.to_string(),
            message_type: message_type.to_string(),
            metadata,
            timestamp: Utc::now(),
        };

        if let Some(mut entry) = self.entanglements.get_mut(&entanglement_id) {
            entry.message_log.push(message.clone());
        }

        self.audit
            .log_entanglement_event(
                &entanglement_id,
                "message_sent",
                sender_id,
                json!({"receiver_id": receiver_id, "message_type": message_type}),
            )
            .await;
        self.broadcast_event(
            "message_sent",
            json!({
                "entanglement_id": entanglement_id,
                "message": {
                    "id": message.id,
                    "sender_id": message.sender_id,
                    "receiver_id": message.receiver_id,
                    "content": message.content,
                    "message_type": message.message_type,
                },
            }),
        )
        .await;

        Ok(message)
    }

    /// Fan a message out from one member to every other member.
    pub async fn broadcast(
        &self,
        sender_id: &str,
        entanglement_id: &str,
        content: &str,
        message_type: &str,
        metadata: serde_json::Value,
    ) -> Result<Vec<GroupMessage>> {
        let members = self.members(entanglement_id)?;
        let mut messages = Vec::new();
        for receiver_id in members {
            if receiver_id == sender_id {
                continue;
            }
            let message = GroupMessage {
                id: Uuid::new_v4().to_string(),
                sender_id: sender_id.to_string(),
                receiver_id: receiver_id.clone(),
                content: content.to_string(),
                message_type: message_type.to_string(),
                metadata: metadata.clone(),
                timestamp: Utc::now(),
            };
            if let Some(mut entry) = self.entanglements.get_mut(entanglement_id) {
                entry.message_log.push(message.clone());
            }
            messages.push(message);
        }

        self.broadcast_event(
            "broadcast",
            json!({
                "entanglement_id": entanglement_id,
                "sender_id": sender_id,
                "recipients": messages.len(),
            }),
        )
        .await;
        Ok(messages)
    }

    /// Coordinate a task across the whole group: broadcast it, then run it
    /// on every member concurrently and collect the results.
    pub async fn coordinate(
        &self,
        entanglement_id: &str,
        task: &str,
        context: serde_json::Value,
    ) -> Result<CoordinationResult> {
        let members = self.members(entanglement_id)?;
        if members.len() < 2 {
            return Err(AgentError::TooFewAgents);
        }

        self.broadcast(
            "system",
            entanglement_id,
            task,
            "coordination",
            context.clone(),
        )
        .await?;

        let calls = members.iter().map(|agent_id| {
            let agents = Arc::clone(&self.agents);
            let agent_id = agent_id.clone();
            let context = context.clone();
            let task = task.to_string();
            async move {
                let outcome = agents.send_message(&agent_id, &task, context).await;
                (agent_id, outcome)
            }
        });

        let mut results = HashMap::new();
        for (agent_id, outcome) in join_all(calls).await {
            let value = match outcome {
                Ok(outcome) => json!({
                    "response": outcome.response,
                    "provider": outcome.provider.to_string(),
                    "tokens_used": outcome.tokens_used,
                    "confidence": outcome.confidence,
                }),
                Err(err) => json!({"error": err.to_string()}),
            };
            results.insert(agent_id, value);
        }

        self.audit
            .log_entanglement_event(
                entanglement_id,
                "coordinated",
                "system",
                json!({"task": task, "agents": members}),
            )
            .await;

        Ok(CoordinationResult {
            entanglement_id: entanglement_id.to_string(),
            task: task.to_string(),
            agents: members,
            results,
        })
    }

    /// Messages involving one agent, newest first, capped at `limit`.
    pub fn messages_for(
        &self,
        entanglement_id: &str,
        agent_id: &str,
        limit: usize,
    ) -> Result<Vec<GroupMessage>> {
        let entry = self
            .entanglements
            .get(entanglement_id)
            .ok_or_else(|| AgentError::EntanglementNotFound(entanglement_id.to_string()))?;
        Ok(entry
            .message_log
            .iter()
            .rev()
            .filter(|m| m.sender_id == agent_id || m.receiver_id == agent_id)
            .take(limit)
            .cloned()
            .collect())
    }

    /// Summary of one entanglement.
    pub fn status(&self, entanglement_id: &str) -> Option<EntanglementStatus> {
        self.entanglements.get(entanglement_id).map(|entry| {
            let mut agents: Vec<String> = entry.members.iter().cloned().collect();
            agents.sort();
            EntanglementStatus {
                entanglement_id: entry.id.clone(),
                name: entry.name.clone(),
                description: entry.description.clone(),
                agent_count: agents.len(),
                agents,
                message_count: entry.message_log.len(),
                created_at: entry.created_at,
            }
        })
    }

    /// Summaries of all entanglements.
    pub fn list(&self) -> Vec<EntanglementStatus> {
        // Collect ids first; status() re-enters the map.
        let ids: Vec<String> = self
            .entanglements
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        ids.iter().filter_map(|id| self.status(id)).collect()
    }

    /// Remove all members, drop the log, and delete the group.
    pub async fn cleanup(&self, entanglement_id: &str, actor_id: &str) -> Result<()> {
        let removed = self
            .entanglements
            .remove(entanglement_id)
            .ok_or_else(|| AgentError::EntanglementNotFound(entanglement_id.to_string()))?;

        self.audit
            .log_entanglement_event(
                entanglement_id,
                "cleaned_up",
                actor_id,
                json!({"members": removed.1.members.len()}),
            )
            .await;
        self.broadcast_event(
            "cleaned_up",
            json!({"entanglement_id": entanglement_id}),
        )
        .await;
        Ok(())
    }

    fn members(&self, entanglement_id: &str) -> Result<Vec<String>> {
        let entry = self
            .entanglements
            .get(entanglement_id)
            .ok_or_else(|| AgentError::EntanglementNotFound(entanglement_id.to_string()))?;
        let mut members: Vec<String> = entry.members.iter().cloned().collect();
        members.sort();
        Ok(members)
    }

    fn shared_entanglement(&self, a: &str, b: &str) -> Option<String> {
        self.entanglements
            .iter()
            .find(|entry| entry.members.contains(a) && entry.members.contains(b))
            .map(|entry| entry.id.clone())
    }

    async fn broadcast_event(&self, event: &str, data: serde_json::Value) {
        let message = BusMessage::new(
            MessageType::AgentMapUpdate,
            WindowType::AgentMap,
            json!({"event": format!("entanglement_{event}"), "data": data}),
        );
        self.bus
            .broadcast_to_window(WindowType::AgentMap, &message)
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::brain::AgentBrain;
    use crate::manager::AgentType;
    use async_trait::async_trait;
    use llm::{CompletionRequest, CompletionResponse, Provider, ProviderKind};

    struct EchoProvider;

    #[async_trait]
    impl Provider for EchoProvider {
        fn kind(&self) -> ProviderKind {
            ProviderKind::Remote
        }

        async fn generate(&self, request: CompletionRequest) -> llm::Result<CompletionResponse> {
            Ok(CompletionResponse {
                content: format!("ack: {}", request.prompt),
                model: request.model,
                tokens_used: 1,
                finish_reason: "stop".to_string(),
                processing_time: 0.0,
                metadata: HashMap::new(),
            })
        }

        async fn is_available(&self) -> bool {
            true
        }
    }

    async fn setup() -> (Arc<EntanglementManager>, Arc<AgentManager>, String, String) {
        let brain = Arc::new(AgentBrain::new(Some(Arc::new(EchoProvider)), None));
        let bus = Arc::new(FanoutBus::new());
        let audit = Arc::new(AuditSink::new(true));
        let agents = Arc::new(AgentManager::new(brain, Arc::clone(&bus), Arc::clone(&audit)));
        let manager = Arc::new(EntanglementManager::new(
            Arc::clone(&agents),
            bus,
            audit,
        ));

        let a = agents
            .create_agent(AgentType::Chatgpt, "a", json!({}), "u1")
            .await
            .unwrap();
        let b = agents
            .create_agent(AgentType::Chatgpt, "b", json!({}), "u1")
            .await
            .unwrap();
        (manager, agents, a, b)
    }

    #[tokio::test]
    async fn test_send_requires_shared_entanglement() {
        let (manager, _, a, b) = setup().await;

        let err = manager
            .send(&a, &b, "hi", "text", serde_json::Value::Null)
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::NotEntangled { .. }));

        let eid = manager.create("pair", "", "u1").await;
        manager.add_agent(&eid, &a, "u1").await.unwrap();
        manager.add_agent(&eid, &b, "u1").await.unwrap();

        let message = manager
            .send(&a, &b, "hi", "text", serde_json::Value::Null)
            .await
            .unwrap();
        assert_eq!(message.content, "hi");
        assert_eq!(manager.status(&eid).unwrap().message_count, 1);
    }

    #[tokio::test]
    async fn test_broadcast_skips_sender() {
        let (manager, agents, a, b) = setup().await;
        let c = agents
            .create_agent(AgentType::Chatgpt, "c", json!({}), "u1")
            .await
            .unwrap();

        let eid = manager.create("trio", "", "u1").await;
        for id in [&a, &b, &c] {
            manager.add_agent(&eid, id, "u1").await.unwrap();
        }

        let messages = manager
            .broadcast(&a, &eid, "news", "text", serde_json::Value::Null)
            .await
            .unwrap();
        assert_eq!(messages.len(), 2);
        assert!(messages.iter().all(|m| m.receiver_id != a));
    }

    #[tokio::test]
    async fn test_coordinate_requires_two_agents() {
        let (manager, _, a, _) = setup().await;
        let eid = manager.create("solo", "", "u1").await;
        manager.add_agent(&eid, &a, "u1").await.unwrap();

        let err = manager
            .coordinate(&eid, "do it", serde_json::Value::Null)
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::TooFewAgents));
    }

    #[tokio::test]
    async fn test_coordinate_collects_all_results() {
        let (manager, _, a, b) = setup().await;
        let eid = manager.create("pair", "", "u1").await;
        manager.add_agent(&eid, &a, "u1").await.unwrap();
        manager.add_agent(&eid, &b, "u1").await.unwrap();

        let result = manager
            .coordinate(&eid, "summarize", serde_json::Value::Null)
            .await
            .unwrap();

        assert_eq!(result.agents.len(), 2);
        assert_eq!(result.results.len(), 2);
        for agent_id in [&a, &b] {
            assert_eq!(result.results[agent_id]["response"], "ack: summarize");
        }
    }

    #[tokio::test]
    async fn test_messages_for_filters_by_agent() {
        let (manager, agents, a, b) = setup().await;
        let c = agents
            .create_agent(AgentType::Chatgpt, "c", json!({}), "u1")
            .await
            .unwrap();
        let eid = manager.create("trio", "", "u1").await;
        for id in [&a, &b, &c] {
            manager.add_agent(&eid, id, "u1").await.unwrap();
        }

        manager.send(&a, &b, "one", "text", serde_json::Value::Null).await.unwrap();
        manager.send(&b, &c, "two", "text", serde_json::Value::Null).await.unwrap();

        let for_a = manager.messages_for(&eid, &a, 10).unwrap();
        assert_eq!(for_a.len(), 1);
        assert_eq!(for_a[0].content, "one");
    }

    #[tokio::test]
    async fn test_cleanup_drops_group() {
        let (manager, _, a, b) = setup().await;
        let eid = manager.create("pair", "", "u1").await;
        manager.add_agent(&eid, &a, "u1").await.unwrap();
        manager.add_agent(&eid, &b, "u1").await.unwrap();

        manager.cleanup(&eid, "u1").await.unwrap();
        assert!(manager.status(&eid).is_none());
        assert!(matches!(
            manager.cleanup(&eid, "u1").await,
            Err(AgentError::EntanglementNotFound(_))
        ));
    }
}
