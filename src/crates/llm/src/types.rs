//! Shared request/response types for all providers.
//!
//! Both the remote and local adapters expose the same `generate` shape so the
//! agent brain can multiplex over them without caring which backend serves a
//! completion.

use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Role of a single conversation turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// End-user input.
    User,
    /// Model output.
    Assistant,
    /// Persona / instruction text.
    System,
}

impl Role {
    /// Wire name used by chat-completion APIs.
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
        }
    }
}

/// One turn of conversation history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatTurn {
    /// Who produced the turn.
    pub role: Role,
    /// Turn text.
    pub content: String,
}

impl ChatTurn {
    /// Create a user turn.
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    /// Create an assistant turn.
    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }

    /// Create a system turn.
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }
}

/// A completion request, identical for every provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionRequest {
    /// The prompt to complete.
    pub prompt: String,
    /// Model identifier; empty selects the provider default.
    pub model: String,
    /// Upper bound on generated tokens.
    pub max_tokens: usize,
    /// Sampling temperature.
    pub temperature: f32,
    /// Nucleus sampling parameter.
    pub top_p: f32,
    /// Sequences that stop generation.
    pub stop_sequences: Vec<String>,
    /// Optional system message prepended to the conversation.
    pub system_message: Option<String>,
    /// Prior turns, oldest first.
    pub conversation_history: Vec<ChatTurn>,
}

impl CompletionRequest {
    /// Create a request with defaults for the sampling parameters.
    pub fn new(prompt: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            model: model.into(),
            max_tokens: 2048,
            temperature: 0.7,
            top_p: 0.9,
            stop_sequences: Vec::new(),
            system_message: None,
            conversation_history: Vec::new(),
        }
    }

    /// Set the token budget.
    pub fn with_max_tokens(mut self, max_tokens: usize) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    /// Set the sampling temperature.
    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    /// Set the system message.
    pub fn with_system_message(mut self, system_message: impl Into<String>) -> Self {
        self.system_message = Some(system_message.into());
        self
    }

    /// Set the conversation history.
    pub fn with_history(mut self, history: Vec<ChatTurn>) -> Self {
        self.conversation_history = history;
        self
    }

    /// Full message list in wire order: system, history, prompt.
    pub fn messages(&self) -> Vec<ChatTurn> {
        let mut messages = Vec::with_capacity(self.conversation_history.len() + 2);
        if let Some(system) = &self.system_message {
            messages.push(ChatTurn::system(system.clone()));
        }
        messages.extend(self.conversation_history.iter().cloned());
        messages.push(ChatTurn::user(self.prompt.clone()));
        messages
    }
}

/// A completion response, identical for every provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionResponse {
    /// Generated text.
    pub content: String,
    /// Model that actually served the request.
    pub model: String,
    /// Total tokens consumed.
    pub tokens_used: usize,
    /// Why generation stopped.
    pub finish_reason: String,
    /// Wall-clock seconds spent on the call.
    pub processing_time: f64,
    /// Provider-specific extras.
    pub metadata: HashMap<String, serde_json::Value>,
}

/// Which family of backend a provider belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    /// Cloud-hosted API.
    Remote,
    /// Locally running runtime.
    Local,
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProviderKind::Remote => write!(f, "remote"),
            ProviderKind::Local => write!(f, "local"),
        }
    }
}

/// Common interface over the remote and local adapters.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Which backend family this provider belongs to.
    fn kind(&self) -> ProviderKind;

    /// Generate a completion.
    async fn generate(&self, request: CompletionRequest) -> Result<CompletionResponse>;

    /// Whether the provider can currently serve requests.
    async fn is_available(&self) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_builder() {
        let request = CompletionRequest::new("hello", "gpt-4o")
            .with_max_tokens(512)
            .with_temperature(0.2)
            .with_system_message("be terse");

        assert_eq!(request.prompt, "hello");
        assert_eq!(request.model, "gpt-4o");
        assert_eq!(request.max_tokens, 512);
        assert_eq!(request.system_message.as_deref(), Some("be terse"));
    }

    #[test]
    fn test_message_order() {
        let request = CompletionRequest::new("question", "m")
            .with_system_message("sys")
            .with_history(vec![ChatTurn::user("a"), ChatTurn::assistant("b")]);

        let messages = request.messages();
        assert_eq!(messages.len(), 4);
        assert_eq!(messages[0].role, Role::System);
        assert_eq!(messages[1].content, "a");
        assert_eq!(messages[2].content, "b");
        assert_eq!(messages[3].role, Role::User);
        assert_eq!(messages[3].content, "question");
    }
}
