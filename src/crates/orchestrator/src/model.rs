//! Workflow definitions and execution state.

use crate::error::{OrchestratorError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::time::Duration;

/// Workflow scheduling discipline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowKind {
    /// Steps run one after another in definition order.
    Sequential,
    /// Steps run in dependency groups with a concurrency cap.
    Parallel,
    /// Sequential execution with per-step condition gating.
    Conditional,
    /// Node/edge graph executed in topological waves.
    Visual,
}

/// What to do when a step fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureAction {
    /// Re-run the step up to `max_retries` times.
    Retry,
    /// Record the failure and keep going.
    Continue,
    /// Fail the execution.
    Fail,
}

/// Per-step failure policy.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct OnFailure {
    /// Action applied when the step fails.
    pub action: FailureAction,
    /// Retry budget; only meaningful with [`FailureAction::Retry`].
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

fn default_max_retries() -> u32 {
    3
}

/// One unit of work in a flat workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    /// Identifier, unique within the workflow.
    pub id: String,
    /// Handler selector.
    #[serde(rename = "type")]
    pub step_type: String,
    /// Handler-specific configuration.
    #[serde(default)]
    pub config: serde_json::Value,
    /// Failure policy; the default is to fail the execution.
    #[serde(default)]
    pub on_failure: Option<OnFailure>,
    /// Gate expression; a false result skips the step.
    #[serde(default)]
    pub condition: Option<String>,
    /// Variable name the step's result is written to.
    #[serde(default)]
    pub output_variable: Option<String>,
}

/// Upstream wiring for a visual node input.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InputSource {
    /// Node the input is pulled from.
    pub node_id: String,
    /// Key the input is bound to; defaults to the node id.
    #[serde(default)]
    pub key: Option<String>,
}

/// One unit of work in a visual workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    /// Identifier, unique within the workflow.
    pub id: String,
    /// Node type selector.
    #[serde(rename = "type")]
    pub node_type: String,
    /// Node-specific configuration.
    #[serde(default)]
    pub config: serde_json::Value,
    /// Inputs pulled from named upstream nodes.
    #[serde(default)]
    pub input_sources: Vec<InputSource>,
}

/// A directed edge between two visual nodes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Edge {
    /// Upstream node.
    pub source: String,
    /// Downstream node.
    pub target: String,
}

/// A workflow definition. Immutable once created.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    /// Identifier.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Optional description.
    #[serde(default)]
    pub description: Option<String>,
    /// Scheduling discipline.
    pub kind: WorkflowKind,
    /// Steps for flat kinds.
    #[serde(default)]
    pub steps: Vec<Step>,
    /// Nodes for the visual kind.
    #[serde(default)]
    pub nodes: Vec<Node>,
    /// Edges for the visual kind.
    #[serde(default)]
    pub edges: Vec<Edge>,
    /// Execution deadline in seconds.
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
    /// Concurrency cap for parallel groups.
    #[serde(default = "default_max_parallel")]
    pub max_parallel_steps: usize,
}

fn default_max_parallel() -> usize {
    5
}

/// Node types accepted in visual workflows.
pub const VISUAL_NODE_TYPES: [&str; 6] = [
    "ai_agent",
    "condition",
    "transform",
    "api_call",
    "user_input",
    "output",
];

impl Workflow {
    /// Validate the definition against the set of registered step types.
    /// Rejects unknown types, duplicate ids, dangling edges, and cycles.
    pub fn validate(&self, known_step_types: &HashSet<String>) -> Result<()> {
        match self.kind {
            WorkflowKind::Visual => self.validate_visual(),
            _ => self.validate_flat(known_step_types),
        }
    }

    fn validate_flat(&self, known_step_types: &HashSet<String>) -> Result<()> {
        let mut seen = HashSet::new();
        for step in &self.steps {
            validate_step(step, known_step_types)?;
            if !seen.insert(step.id.as_str()) {
                return Err(OrchestratorError::InvalidWorkflow(format!(
                    "duplicate step id '{}'",
                    step.id
                )));
            }
        }
        Ok(())
    }

    fn validate_visual(&self) -> Result<()> {
        let mut ids = HashSet::new();
        for node in &self.nodes {
            if !VISUAL_NODE_TYPES.contains(&node.node_type.as_str()) {
                return Err(OrchestratorError::InvalidWorkflow(format!(
                    "unknown node type '{}'",
                    node.node_type
                )));
            }
            if !ids.insert(node.id.as_str()) {
                return Err(OrchestratorError::InvalidWorkflow(format!(
                    "duplicate node id '{}'",
                    node.id
                )));
            }
        }
        for edge in &self.edges {
            if !ids.contains(edge.source.as_str()) || !ids.contains(edge.target.as_str()) {
                return Err(OrchestratorError::InvalidWorkflow(format!(
                    "edge {} -> {} references an unknown node",
                    edge.source, edge.target
                )));
            }
        }
        if has_cycle(&self.nodes, &self.edges) {
            return Err(OrchestratorError::InvalidWorkflow(
                "workflow graph contains a cycle".to_string(),
            ));
        }
        Ok(())
    }

    /// Execution deadline, when configured.
    pub fn deadline(&self) -> Option<Duration> {
        self.timeout_seconds.map(Duration::from_secs)
    }
}

fn validate_step(step: &Step, known_step_types: &HashSet<String>) -> Result<()> {
    if !known_step_types.contains(&step.step_type) {
        return Err(OrchestratorError::InvalidWorkflow(format!(
            "unknown step type '{}'",
            step.step_type
        )));
    }
    // Nested steps of loop/parallel are dispatched through the same registry.
    if let Some(nested) = step.config.get("steps").and_then(|v| v.as_array()) {
        for raw in nested {
            let nested_step: Step = serde_json::from_value(raw.clone()).map_err(|e| {
                OrchestratorError::InvalidWorkflow(format!(
                    "invalid nested step in '{}': {e}",
                    step.id
                ))
            })?;
            validate_step(&nested_step, known_step_types)?;
        }
    }
    Ok(())
}

/// Cycle detection: iterative DFS with a visited set and a recursion stack.
/// Any back-edge (a neighbor currently on the stack) is a cycle.
pub fn has_cycle(nodes: &[Node], edges: &[Edge]) -> bool {
    let mut adjacency: HashMap<&str, Vec<&str>> = HashMap::new();
    for node in nodes {
        adjacency.entry(node.id.as_str()).or_default();
    }
    for edge in edges {
        adjacency.entry(edge.target.as_str()).or_default();
        adjacency
            .entry(edge.source.as_str())
            .or_default()
            .push(edge.target.as_str());
    }

    #[derive(Clone, Copy, PartialEq)]
    enum State {
        Unvisited,
        OnStack,
        Done,
    }
    let mut state: HashMap<&str, State> = adjacency
        .keys()
        .map(|&id| (id, State::Unvisited))
        .collect();

    for &start in adjacency.keys() {
        if state[start] != State::Unvisited {
            continue;
        }
        // (node, next child index) frames replace recursion.
        let mut stack: Vec<(&str, usize)> = vec![(start, 0)];
        state.insert(start, State::OnStack);

        while let Some(&(node, index)) = stack.last() {
            let neighbors = &adjacency[node];
            if index < neighbors.len() {
                stack.last_mut().expect("frame present").1 += 1;
                let next = neighbors[index];
                match state[next] {
                    State::OnStack => return true,
                    State::Unvisited => {
                        state.insert(next, State::OnStack);
                        stack.push((next, 0));
                    }
                    State::Done => {}
                }
            } else {
                state.insert(node, State::Done);
                stack.pop();
            }
        }
    }
    false
}

/// Step execution status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    /// Not started.
    Pending,
    /// Handler in flight.
    Running,
    /// Finished successfully.
    Completed,
    /// Finished with an error.
    Failed,
    /// Gated out by its condition.
    Skipped,
    /// Stopped by cancellation.
    Cancelled,
}

impl StepStatus {
    /// Stable wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            StepStatus::Pending => "pending",
            StepStatus::Running => "running",
            StepStatus::Completed => "completed",
            StepStatus::Failed => "failed",
            StepStatus::Skipped => "skipped",
            StepStatus::Cancelled => "cancelled",
        }
    }
}

/// Execution status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    /// Created, driver not yet running.
    Pending,
    /// Driver active.
    Running,
    /// Finished successfully.
    Completed,
    /// Finished with an error.
    Failed,
    /// Stopped by cancellation.
    Cancelled,
    /// Driver alive but not starting new steps.
    Paused,
}

impl ExecutionStatus {
    /// Whether this status ends the execution.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionStatus::Completed | ExecutionStatus::Failed | ExecutionStatus::Cancelled
        )
    }

    /// Stable wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Pending => "pending",
            ExecutionStatus::Running => "running",
            ExecutionStatus::Completed => "completed",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::Cancelled => "cancelled",
            ExecutionStatus::Paused => "paused",
        }
    }
}

/// Per-step execution state.
#[derive(Debug, Clone, Serialize)]
pub struct StepContext {
    /// Step this context tracks.
    pub step_id: String,
    /// Current status.
    pub status: StepStatus,
    /// Result value once completed.
    pub result: Option<serde_json::Value>,
    /// Error message once failed.
    pub error: Option<String>,
    /// Retries consumed so far. Never exceeds `max_retries`.
    pub retry_count: u32,
    /// Retry budget from the failure policy.
    pub max_retries: u32,
    /// When the handler first started.
    pub started_at: Option<DateTime<Utc>>,
    /// When the step reached a terminal status.
    pub ended_at: Option<DateTime<Utc>>,
}

impl StepContext {
    /// Fresh pending context for a step.
    pub fn new(step_id: impl Into<String>, max_retries: u32) -> Self {
        Self {
            step_id: step_id.into(),
            status: StepStatus::Pending,
            result: None,
            error: None,
            retry_count: 0,
            max_retries,
            started_at: None,
            ended_at: None,
        }
    }
}

/// Mutable state of one execution. Owned by its driver; observers read
/// snapshots through the executions map.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionContext {
    /// Execution id.
    pub execution_id: String,
    /// Workflow id.
    pub workflow_id: String,
    /// Snapshot of the definition at submission time.
    pub workflow: Workflow,
    /// Submitting user.
    pub user_id: String,
    /// Variable scope, seeded from caller input.
    pub variables: serde_json::Map<String, serde_json::Value>,
    /// Step results keyed by step or node id.
    pub results: HashMap<String, serde_json::Value>,
    /// Current status.
    pub status: ExecutionStatus,
    /// Step currently being driven.
    pub current_step: Option<String>,
    /// Steps that completed.
    pub completed_steps: Vec<String>,
    /// Steps that failed.
    pub failed_steps: Vec<String>,
    /// Per-step state.
    pub step_contexts: HashMap<String, StepContext>,
    /// When the execution was submitted.
    pub started_at: DateTime<Utc>,
    /// When the execution reached a terminal status.
    pub ended_at: Option<DateTime<Utc>>,
    /// Last error, when failed.
    pub error: Option<String>,
    /// Concurrency cap for parallel groups.
    pub max_parallel_steps: usize,
}

impl ExecutionContext {
    /// Create a pending context for a workflow snapshot.
    pub fn new(
        execution_id: impl Into<String>,
        workflow: Workflow,
        user_id: impl Into<String>,
        input: serde_json::Map<String, serde_json::Value>,
    ) -> Self {
        let mut step_contexts = HashMap::new();
        for step in &workflow.steps {
            let max_retries = step.on_failure.map(|p| p.max_retries).unwrap_or(0);
            step_contexts.insert(step.id.clone(), StepContext::new(&step.id, max_retries));
        }
        for node in &workflow.nodes {
            step_contexts.insert(node.id.clone(), StepContext::new(&node.id, 0));
        }

        Self {
            execution_id: execution_id.into(),
            workflow_id: workflow.id.clone(),
            max_parallel_steps: workflow.max_parallel_steps,
            workflow,
            user_id: user_id.into(),
            variables: input,
            results: HashMap::new(),
            status: ExecutionStatus::Pending,
            current_step: None,
            completed_steps: Vec::new(),
            failed_steps: Vec::new(),
            step_contexts,
            started_at: Utc::now(),
            ended_at: None,
            error: None,
        }
    }
}
