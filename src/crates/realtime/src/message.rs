//! Typed message and window taxonomy for the fanout bus.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Client window tags. Every connection is scoped to exactly one window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WindowType {
    /// Agent topology and lifecycle view.
    AgentMap,
    /// Collaborative code view.
    CodeAgent,
    /// Conversation view.
    Chat,
    /// Monitoring and incident view.
    Watchtower,
    /// Workflow design and execution view.
    WorkflowBuilder,
    /// Bulk data ingestion view.
    DataImporter,
}

impl WindowType {
    /// All window tags, for registry initialization.
    pub fn all() -> [WindowType; 6] {
        [
            WindowType::AgentMap,
            WindowType::CodeAgent,
            WindowType::Chat,
            WindowType::Watchtower,
            WindowType::WorkflowBuilder,
            WindowType::DataImporter,
        ]
    }

    /// Capability set announced to a freshly connected client.
    pub fn capabilities(&self) -> &'static [&'static str] {
        match self {
            WindowType::AgentMap => &[
                "agent_spawn",
                "agent_kill",
                "agent_status",
                "agent_config",
                "dependency_view",
                "real_time_updates",
            ],
            WindowType::CodeAgent => &[
                "code_edit",
                "code_diff",
                "syntax_highlighting",
                "auto_complete",
            ],
            WindowType::Chat => &[
                "multi_agent_chat",
                "markdown_support",
                "slash_commands",
                "context_recall",
            ],
            WindowType::Watchtower => &[
                "log_streaming",
                "system_stats",
                "alert_management",
                "incident_timeline",
            ],
            WindowType::WorkflowBuilder => &[
                "workflow_creation",
                "workflow_execution",
                "real_time_monitoring",
                "error_handling",
            ],
            WindowType::DataImporter => &[
                "file_upload",
                "data_parsing",
                "context_assignment",
                "search_filtering",
            ],
        }
    }
}

impl WindowType {
    /// Stable wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            WindowType::AgentMap => "agent_map",
            WindowType::CodeAgent => "code_agent",
            WindowType::Chat => "chat",
            WindowType::Watchtower => "watchtower",
            WindowType::WorkflowBuilder => "workflow_builder",
            WindowType::DataImporter => "data_importer",
        }
    }
}

impl std::fmt::Display for WindowType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Message type tags. Closed enumeration shared with clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    // Agent lifecycle
    AgentStatusUpdate,
    AgentSpawn,
    AgentKill,
    AgentMapUpdate,

    // Code / chat
    CodeChange,
    ChatMessage,
    AgentResponse,
    SlashCommand,

    // Monitoring
    LogUpdate,
    SystemStats,
    Alert,
    Incident,

    // Workflow
    WorkflowUpdate,
    WorkflowStart,
    WorkflowComplete,
    WorkflowError,

    // System
    WindowOpen,
    WindowClose,
    WindowFocus,
    HotSwap,
    HealthCheck,
    Notification,
}

impl MessageType {
    /// Stable wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::AgentStatusUpdate => "agent_status_update",
            MessageType::AgentSpawn => "agent_spawn",
            MessageType::AgentKill => "agent_kill",
            MessageType::AgentMapUpdate => "agent_map_update",
            MessageType::CodeChange => "code_change",
            MessageType::ChatMessage => "chat_message",
            MessageType::AgentResponse => "agent_response",
            MessageType::SlashCommand => "slash_command",
            MessageType::LogUpdate => "log_update",
            MessageType::SystemStats => "system_stats",
            MessageType::Alert => "alert",
            MessageType::Incident => "incident",
            MessageType::WorkflowUpdate => "workflow_update",
            MessageType::WorkflowStart => "workflow_start",
            MessageType::WorkflowComplete => "workflow_complete",
            MessageType::WorkflowError => "workflow_error",
            MessageType::WindowOpen => "window_open",
            MessageType::WindowClose => "window_close",
            MessageType::WindowFocus => "window_focus",
            MessageType::HotSwap => "hot_swap",
            MessageType::HealthCheck => "health_check",
            MessageType::Notification => "notification",
        }
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One bus message. Serialized to clients as
/// `{type, window_type, timestamp, data}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusMessage {
    /// Message type tag.
    #[serde(rename = "type")]
    pub message_type: MessageType,
    /// Window the message is scoped to.
    pub window_type: WindowType,
    /// When the message was composed.
    pub timestamp: DateTime<Utc>,
    /// Free-form payload.
    pub data: serde_json::Value,
    /// Originating or targeted user.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    /// Originating session.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

impl BusMessage {
    /// Create a message stamped with the current time.
    pub fn new(message_type: MessageType, window_type: WindowType, data: serde_json::Value) -> Self {
        Self {
            message_type,
            window_type,
            timestamp: Utc::now(),
            data,
            user_id: None,
            session_id: None,
        }
    }

    /// Attach a user id.
    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    /// Attach a session id.
    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    /// Serialize for the wire.
    pub fn to_wire(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }

    /// Parse an inbound client frame.
    pub fn from_wire(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_wire_shape() {
        let message = BusMessage::new(
            MessageType::WorkflowUpdate,
            WindowType::WorkflowBuilder,
            json!({"execution_id": "e1"}),
        );
        let wire: serde_json::Value = serde_json::from_str(&message.to_wire()).unwrap();

        assert_eq!(wire["type"], "workflow_update");
        assert_eq!(wire["window_type"], "workflow_builder");
        assert_eq!(wire["data"]["execution_id"], "e1");
        assert!(wire.get("timestamp").is_some());
    }

    #[test]
    fn test_round_trip() {
        let message = BusMessage::new(
            MessageType::SlashCommand,
            WindowType::Chat,
            json!({"command": "/run build"}),
        )
        .with_user("u1");

        let parsed = BusMessage::from_wire(&message.to_wire()).unwrap();
        assert_eq!(parsed.message_type, MessageType::SlashCommand);
        assert_eq!(parsed.window_type, WindowType::Chat);
        assert_eq!(parsed.user_id.as_deref(), Some("u1"));
    }

    #[test]
    fn test_unknown_type_rejected() {
        let raw = r#"{"type":"mystery","window_type":"chat","timestamp":"2026-01-01T00:00:00Z","data":{}}"#;
        assert!(BusMessage::from_wire(raw).is_err());
    }

    #[test]
    fn test_every_window_has_capabilities() {
        for window in WindowType::all() {
            assert!(!window.capabilities().is_empty());
        }
    }

    #[test]
    fn test_display_matches_wire_name() {
        assert_eq!(MessageType::AgentStatusUpdate.to_string(), "agent_status_update");
        assert_eq!(WindowType::AgentMap.to_string(), "agent_map");
    }
}
