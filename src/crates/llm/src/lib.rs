//! LLM provider clients for chainflow.
//!
//! Two adapters expose an identical `generate` surface so callers can
//! multiplex over them:
//!
//! - **Remote** - a cloud chat-completion API with credential rotation,
//!   per-credential sliding-window rate accounting, per-model token caps,
//!   and bounded retry with exponential backoff.
//! - **Local** - locally running runtimes (Ollama, llama.cpp, LM Studio)
//!   found by endpoint discovery and kept fresh by a background health loop.
//!
//! # Example
//!
//! ```rust,ignore
//! use llm::{CompletionRequest, LocalClient, LocalLlmConfig, Provider};
//!
//! #[tokio::main]
//! async fn main() -> llm::Result<()> {
//!     let client = LocalClient::new(LocalLlmConfig::new())?;
//!     client.discover().await;
//!
//!     let response = client
//!         .generate(CompletionRequest::new("What is Rust?", "llama3"))
//!         .await?;
//!     println!("{}", response.content);
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod local;
pub mod remote;
pub mod types;

pub use config::{Credential, LocalLlmConfig, RemoteLlmConfig, RuntimeEndpoint, RuntimeKind};
pub use error::{LlmError, Result};
pub use local::{LocalClient, ModelEntry, ModelStatus};
pub use remote::{CredentialStatus, RemoteClient};
pub use types::{
    ChatTurn, CompletionRequest, CompletionResponse, Provider, ProviderKind, Role,
};
