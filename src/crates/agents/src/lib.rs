//! Agent brain, lifecycle management and entanglements for chainflow.
//!
//! Three layers build on the `llm` provider clients:
//!
//! - [`brain::AgentBrain`] - unified completion router with persona
//!   templates, bounded per-agent conversation memory, and
//!   availability-based provider fallback.
//! - [`manager::AgentManager`] - agent lifecycle (create / message /
//!   terminate), per-type capability sets, and chain routing.
//! - [`entanglement::EntanglementManager`] - named agent groups with a
//!   shared message log and a coordinator that fans a task out to every
//!   member.

pub mod brain;
pub mod entanglement;
pub mod error;
pub mod manager;
pub mod persona;

pub use brain::{AgentBrain, BrainRequest, BrainResponse, ProviderStats, DEFAULT_CONVERSATION_WINDOW};
pub use entanglement::{
    CoordinationResult, Entanglement, EntanglementManager, EntanglementStatus, GroupMessage,
};
pub use error::{AgentError, Result};
pub use manager::{
    Agent, AgentManager, AgentStatus, AgentType, Capability, ChainHop, ChainResult, SendOutcome,
};
pub use persona::{default_personas, Persona};
