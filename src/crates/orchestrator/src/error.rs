//! Error types for the orchestration engine.

use thiserror::Error;

/// Result type for orchestrator operations.
pub type Result<T> = std::result::Result<T, OrchestratorError>;

/// Errors surfaced by the public orchestrator operations.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// Definition rejected at creation: cycle, unknown step type, or
    /// missing required configuration.
    #[error("Invalid workflow: {0}")]
    InvalidWorkflow(String),

    /// Caller input rejected: missing field or type mismatch.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// No workflow registered under the given id.
    #[error("Workflow not found: {0}")]
    WorkflowNotFound(String),

    /// No live execution under the given id.
    #[error("Execution not found: {0}")]
    ExecutionNotFound(String),

    /// Requested status change violates the execution state machine.
    #[error("Illegal transition from {from} to {to}")]
    IllegalTransition {
        /// Current status.
        from: String,
        /// Requested status.
        to: String,
    },

    /// Execution stopped by cancellation.
    #[error("Execution cancelled")]
    Cancelled,

    /// Too many live executions; try again shortly.
    #[error("Rate limited, retry after {retry_after}s")]
    RateLimited {
        /// Seconds before capacity is expected to free up.
        retry_after: u64,
    },

    /// Execution exceeded its deadline.
    #[error("Execution timed out after {seconds}s")]
    Timeout {
        /// Configured deadline.
        seconds: u64,
    },

    /// Configuration could not be loaded or parsed.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Error bubbled up from the agent layer.
    #[error("Agent error: {0}")]
    Agent(#[from] agents::AgentError),

    /// Error bubbled up from the LLM client layer.
    #[error("LLM error: {0}")]
    Llm(#[from] llm::LlmError),

    /// Serialization failure.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Unexpected internal failure; always logged with context.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type for step handlers.
pub type StepResult<T> = std::result::Result<T, StepError>;

/// Failure of a single step handler.
#[derive(Debug, Clone, Error)]
pub enum StepError {
    /// Handler failed with a reason; the driver applies the failure policy.
    #[error("{0}")]
    Failed(String),

    /// Handler interrupted by cancellation; maps to a cancelled step, not a
    /// failed one.
    #[error("cancelled")]
    Cancelled,
}

impl StepError {
    /// Convenience constructor.
    pub fn failed(reason: impl Into<String>) -> Self {
        StepError::Failed(reason.into())
    }
}
