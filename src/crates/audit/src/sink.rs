//! Append-only audit recorder.

use crate::redact::redact;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use realtime::{BusMessage, FanoutBus, MessageType, WindowType};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tracing::{error, info, warn};

/// Severity of an audit event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Routine activity.
    Info,
    /// Something degraded but recoverable.
    Warning,
    /// An operation failed.
    Error,
    /// Security-relevant; republished to the watchtower window.
    Security,
}

/// One immutable audit record. Never mutated after append.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    /// Action performed, e.g. "workflow.execution_started".
    pub action: String,
    /// Who performed it.
    pub actor_id: String,
    /// Kind of resource acted upon.
    pub target_type: String,
    /// Id of the resource acted upon.
    pub target_id: String,
    /// When the event was recorded.
    pub timestamp: DateTime<Utc>,
    /// Associated session, when any.
    pub session_id: Option<String>,
    /// Associated agent, when any.
    pub agent_id: Option<String>,
    /// Associated workflow, when any.
    pub workflow_id: Option<String>,
    /// Associated entanglement, when any.
    pub entanglement_id: Option<String>,
    /// Redacted free-form metadata.
    pub metadata: serde_json::Value,
    /// Event severity.
    pub severity: Severity,
}

/// Builder-style description of an event to record.
#[derive(Debug, Clone)]
pub struct AuditEvent {
    action: String,
    actor_id: String,
    target_type: String,
    target_id: String,
    session_id: Option<String>,
    agent_id: Option<String>,
    workflow_id: Option<String>,
    entanglement_id: Option<String>,
    metadata: serde_json::Value,
    severity: Severity,
}

impl AuditEvent {
    /// Describe an event.
    pub fn new(
        action: impl Into<String>,
        actor_id: impl Into<String>,
        target_type: impl Into<String>,
        target_id: impl Into<String>,
    ) -> Self {
        Self {
            action: action.into(),
            actor_id: actor_id.into(),
            target_type: target_type.into(),
            target_id: target_id.into(),
            session_id: None,
            agent_id: None,
            workflow_id: None,
            entanglement_id: None,
            metadata: serde_json::Value::Null,
            severity: Severity::Info,
        }
    }

    /// Attach free-form metadata; it is redacted before persisting.
    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }

    /// Set the severity.
    pub fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }

    /// Associate a session.
    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    /// Associate an agent.
    pub fn with_agent(mut self, agent_id: impl Into<String>) -> Self {
        self.agent_id = Some(agent_id.into());
        self
    }

    /// Associate a workflow.
    pub fn with_workflow(mut self, workflow_id: impl Into<String>) -> Self {
        self.workflow_id = Some(workflow_id.into());
        self
    }

    /// Associate an entanglement.
    pub fn with_entanglement(mut self, entanglement_id: impl Into<String>) -> Self {
        self.entanglement_id = Some(entanglement_id.into());
        self
    }
}

/// Query filter for stored records. Unset fields match everything.
#[derive(Debug, Clone, Default)]
pub struct AuditQuery {
    /// Filter by actor.
    pub actor_id: Option<String>,
    /// Filter by target type.
    pub target_type: Option<String>,
    /// Filter by target id.
    pub target_id: Option<String>,
    /// Filter by action.
    pub action: Option<String>,
    /// Records at or after this instant.
    pub since: Option<DateTime<Utc>>,
    /// Records at or before this instant.
    pub until: Option<DateTime<Utc>>,
    /// Maximum records returned.
    pub limit: usize,
}

impl AuditQuery {
    /// Query returning at most `limit` records.
    pub fn with_limit(limit: usize) -> Self {
        Self {
            limit,
            ..Default::default()
        }
    }

    fn matches(&self, record: &AuditRecord) -> bool {
        if let Some(actor) = &self.actor_id {
            if &record.actor_id != actor {
                return false;
            }
        }
        if let Some(target_type) = &self.target_type {
            if &record.target_type != target_type {
                return false;
            }
        }
        if let Some(target_id) = &self.target_id {
            if &record.target_id != target_id {
                return false;
            }
        }
        if let Some(action) = &self.action {
            if &record.action != action {
                return false;
            }
        }
        if let Some(since) = self.since {
            if record.timestamp < since {
                return false;
            }
        }
        if let Some(until) = self.until {
            if record.timestamp > until {
                return false;
            }
        }
        true
    }
}

/// Redacted, append-only audit recorder. Best-effort from the caller's
/// perspective: recording never fails the originating operation.
pub struct AuditSink {
    enabled: bool,
    records: RwLock<Vec<AuditRecord>>,
    bus: Option<Arc<FanoutBus>>,
}

impl AuditSink {
    /// Sink without a realtime bus (security events are only logged).
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            records: RwLock::new(Vec::new()),
            bus: None,
        }
    }

    /// Sink that republishes security events on the watchtower window.
    pub fn with_bus(enabled: bool, bus: Arc<FanoutBus>) -> Self {
        Self {
            enabled,
            records: RwLock::new(Vec::new()),
            bus: Some(bus),
        }
    }

    /// Record one event. Returns whether the event was stored.
    pub async fn log_event(&self, event: AuditEvent) -> bool {
        if !self.enabled {
            return true;
        }

        let record = AuditRecord {
            action: event.action,
            actor_id: event.actor_id,
            target_type: event.target_type,
            target_id: event.target_id,
            timestamp: Utc::now(),
            session_id: event.session_id,
            agent_id: event.agent_id,
            workflow_id: event.workflow_id,
            entanglement_id: event.entanglement_id,
            metadata: redact(&event.metadata),
            severity: event.severity,
        };

        let line = format!(
            "AUDIT: {} by {} on {}:{}",
            record.action, record.actor_id, record.target_type, record.target_id
        );
        match record.severity {
            Severity::Error => error!("{line}"),
            Severity::Warning | Severity::Security => warn!("{line}"),
            Severity::Info => info!("{line}"),
        }

        if record.severity == Severity::Security {
            if let Some(bus) = &self.bus {
                let alert = BusMessage::new(
                    MessageType::Alert,
                    WindowType::Watchtower,
                    json!({
                        "action": record.action,
                        "actor_id": record.actor_id,
                        "target_type": record.target_type,
                        "target_id": record.target_id,
                        "metadata": record.metadata,
                    }),
                );
                bus.broadcast_to_window(WindowType::Watchtower, &alert).await;
            }
        }

        self.records.write().push(record);
        true
    }

    /// Records matching the filter, newest first, capped at `query.limit`.
    pub fn query(&self, query: &AuditQuery) -> Vec<AuditRecord> {
        let records = self.records.read();
        records
            .iter()
            .rev()
            .filter(|record| query.matches(record))
            .take(query.limit)
            .cloned()
            .collect()
    }

    /// Total records stored.
    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    /// Whether the sink is empty.
    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }

    /// Record a workflow lifecycle event.
    pub async fn log_workflow_event(
        &self,
        workflow_id: &str,
        action: &str,
        actor_id: &str,
        metadata: serde_json::Value,
    ) -> bool {
        self.log_event(
            AuditEvent::new(format!("workflow.{action}"), actor_id, "workflow", workflow_id)
                .with_workflow(workflow_id)
                .with_metadata(metadata),
        )
        .await
    }

    /// Record an agent lifecycle event.
    pub async fn log_agent_event(
        &self,
        agent_id: &str,
        action: &str,
        actor_id: &str,
        metadata: serde_json::Value,
    ) -> bool {
        self.log_event(
            AuditEvent::new(format!("agent.{action}"), actor_id, "agent", agent_id)
                .with_agent(agent_id)
                .with_metadata(metadata),
        )
        .await
    }

    /// Record an entanglement event.
    pub async fn log_entanglement_event(
        &self,
        entanglement_id: &str,
        action: &str,
        actor_id: &str,
        metadata: serde_json::Value,
    ) -> bool {
        self.log_event(
            AuditEvent::new(
                format!("entanglement.{action}"),
                actor_id,
                "entanglement",
                entanglement_id,
            )
            .with_entanglement(entanglement_id)
            .with_metadata(metadata),
        )
        .await
    }

    /// Record a security event; also broadcast to the watchtower window.
    pub async fn log_security_event(
        &self,
        event_type: &str,
        actor_id: &str,
        details: serde_json::Value,
    ) -> bool {
        self.log_event(
            AuditEvent::new(format!("security.{event_type}"), actor_id, "security", "0")
                .with_metadata(details)
                .with_severity(Severity::Security),
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::redact::REDACTION_SENTINEL;
    use serde_json::json;

    #[tokio::test]
    async fn test_metadata_redacted_before_store() {
        let sink = AuditSink::new(true);
        sink.log_event(
            AuditEvent::new("agent.created", "u1", "agent", "a1")
                .with_metadata(json!({"api_key": "sk-xyz", "nested": {"password": "p"}, "note": "ok"})),
        )
        .await;

        let stored = &sink.query(&AuditQuery::with_limit(1))[0];
        assert_eq!(stored.metadata["api_key"], REDACTION_SENTINEL);
        assert_eq!(stored.metadata["nested"]["password"], REDACTION_SENTINEL);
        assert_eq!(stored.metadata["note"], "ok");
    }

    #[tokio::test]
    async fn test_query_filters_and_order() {
        let sink = AuditSink::new(true);
        for i in 0..5 {
            sink.log_event(AuditEvent::new(
                "workflow.step_completed",
                "u1",
                "workflow",
                format!("w{i}"),
            ))
            .await;
        }
        sink.log_event(AuditEvent::new("agent.created", "u2", "agent", "a1"))
            .await;

        let mut query = AuditQuery::with_limit(3);
        query.target_type = Some("workflow".to_string());
        let records = sink.query(&query);

        assert_eq!(records.len(), 3);
        // Newest first.
        assert_eq!(records[0].target_id, "w4");
        assert_eq!(records[2].target_id, "w2");

        let mut by_actor = AuditQuery::with_limit(10);
        by_actor.actor_id = Some("u2".to_string());
        assert_eq!(sink.query(&by_actor).len(), 1);
    }

    #[tokio::test]
    async fn test_disabled_sink_stores_nothing() {
        let sink = AuditSink::new(false);
        assert!(sink.log_event(AuditEvent::new("a", "u", "t", "1")).await);
        assert!(sink.is_empty());
    }

    #[tokio::test]
    async fn test_security_event_broadcast_to_watchtower() {
        let bus = Arc::new(FanoutBus::new());
        let (transport, mut rx) = realtime::ChannelTransport::new(8);
        bus.connect(Arc::new(transport), WindowType::Watchtower, None, None)
            .await
            .unwrap();
        rx.recv().await.unwrap(); // welcome

        let sink = AuditSink::with_bus(true, bus);
        sink.log_security_event("login_failed", "u1", json!({"token": "t"}))
            .await;

        let alert: serde_json::Value = serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(alert["type"], "alert");
        assert_eq!(alert["window_type"], "watchtower");
        assert_eq!(alert["data"]["action"], "security.login_failed");
        assert_eq!(alert["data"]["metadata"]["token"], REDACTION_SENTINEL);
    }

    #[tokio::test]
    async fn test_info_event_not_broadcast() {
        let bus = Arc::new(FanoutBus::new());
        let (transport, mut rx) = realtime::ChannelTransport::new(8);
        bus.connect(Arc::new(transport), WindowType::Watchtower, None, None)
            .await
            .unwrap();
        rx.recv().await.unwrap();

        let sink = AuditSink::with_bus(true, bus);
        sink.log_event(AuditEvent::new("agent.created", "u1", "agent", "a1"))
            .await;

        assert!(rx.try_recv().is_err());
    }
}
