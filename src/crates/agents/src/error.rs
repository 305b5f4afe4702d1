//! Error types for agent services.

use llm::{LlmError, ProviderKind};
use thiserror::Error;

/// Result type for agent operations.
pub type Result<T> = std::result::Result<T, AgentError>;

/// Errors that can occur in the brain, manager, or entanglement layers.
#[derive(Debug, Error)]
pub enum AgentError {
    /// No agent registered under the given id.
    #[error("Agent not found: {0}")]
    AgentNotFound(String),

    /// No persona registered under the given name.
    #[error("Persona not found: {0}")]
    PersonaNotFound(String),

    /// No entanglement registered under the given id.
    #[error("Entanglement not found: {0}")]
    EntanglementNotFound(String),

    /// Two agents do not share an entanglement.
    #[error("Agents {sender} and {receiver} are not entangled")]
    NotEntangled {
        /// Sending agent.
        sender: String,
        /// Receiving agent.
        receiver: String,
    },

    /// Agent configuration failed validation for its type.
    #[error("Invalid agent config: {0}")]
    InvalidConfig(String),

    /// Requested status change violates the agent state machine.
    #[error("Illegal transition from {from} to {to}")]
    IllegalTransition {
        /// Current status.
        from: String,
        /// Requested status.
        to: String,
    },

    /// Neither provider is configured.
    #[error("No completion providers available")]
    NoProvider,

    /// Coordination needs at least two entangled agents.
    #[error("Coordination requires at least two agents")]
    TooFewAgents,

    /// A provider call failed. The brain never substitutes providers after
    /// a returned failure; the caller sees it.
    #[error("{provider} provider error: {source}")]
    Brain {
        /// Provider that failed.
        provider: ProviderKind,
        /// Underlying provider error.
        #[source]
        source: LlmError,
    },
}
