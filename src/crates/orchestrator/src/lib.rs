//! Workflow orchestration engine for chainflow.
//!
//! This crate ties the system together: the closed expression grammar, the
//! step handler registry, the execution engine with its scheduling
//! disciplines (sequential, parallel, conditional, visual), typed
//! configuration, the outbound event-bus protocol, and the explicit `Core`
//! wiring that replaces global singletons.

pub mod config;
pub mod core;
pub mod engine;
pub mod error;
pub mod events;
pub mod expr;
pub mod handlers;
pub mod model;

pub use config::Config;
pub use core::Core;
pub use engine::{EngineSettings, WorkflowEngine};
pub use error::{OrchestratorError, Result, StepError, StepResult};
pub use events::{EventBus, HealthEnvelope, RegistrationEnvelope};
pub use handlers::{HandlerEnv, HandlerRegistry, StepHandler};
pub use model::{
    Edge, ExecutionContext, ExecutionStatus, FailureAction, InputSource, Node, OnFailure, Step,
    StepContext, StepStatus, Workflow, WorkflowKind,
};
