//! Workflow execution engine.
//!
//! Owns workflow definitions and live executions, drives each execution on
//! its own task, and applies the per-step failure policy. Status
//! transitions are broadcast on the workflow_builder window and recorded in
//! the audit sink; terminal contexts stay queryable for a grace period
//! before they are dropped.

use crate::error::{OrchestratorError, Result, StepError};
use crate::events::EventBus;
use crate::expr::evaluate;
use crate::handlers::{
    await_cancelled, gather_node_inputs, run_visual_node, HandlerEnv, HandlerRegistry,
};
use crate::model::{
    ExecutionContext, ExecutionStatus, FailureAction, Node, OnFailure, Step, StepStatus, Workflow,
};
use agents::AgentManager;
use audit::AuditSink;
use chrono::Utc;
use dashmap::DashMap;
use futures::future::join_all;
use parking_lot::RwLock;
use realtime::{BusMessage, FanoutBus, MessageType, WindowType};
use serde_json::{json, Map, Value};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Engine tuning knobs, sourced from the workflow configuration section.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// Cap on simultaneously live executions.
    pub max_concurrent_workflows: usize,
    /// Deadline applied when a workflow does not set its own.
    pub default_timeout: Option<Duration>,
    /// How long terminal contexts stay queryable before removal.
    pub retention: Duration,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            max_concurrent_workflows: 10,
            default_timeout: Some(Duration::from_secs(3600)),
            retention: Duration::from_secs(300),
        }
    }
}

struct ExecutionControls {
    cancel: watch::Sender<bool>,
    pause: watch::Sender<bool>,
}

enum DriveError {
    Failed(String),
    Cancelled,
    Timeout(u64),
}

enum StepDisposition {
    Completed,
    ContinuedAfterFailure,
    ExecutionFailed(String),
    Cancelled,
}

/// The workflow orchestrator.
pub struct WorkflowEngine {
    registry: Arc<HandlerRegistry>,
    agents: Arc<AgentManager>,
    bus: Arc<FanoutBus>,
    audit: Arc<AuditSink>,
    events: RwLock<Option<Arc<EventBus>>>,
    http: reqwest::Client,
    workflows: DashMap<String, Workflow>,
    executions: DashMap<String, Arc<RwLock<ExecutionContext>>>,
    driver_tasks: DashMap<String, JoinHandle<()>>,
    controls: DashMap<String, ExecutionControls>,
    settings: EngineSettings,
    // Handle to this engine for spawning driver tasks.
    weak: Weak<WorkflowEngine>,
}

impl WorkflowEngine {
    /// Create an engine with default settings.
    pub fn new(
        registry: Arc<HandlerRegistry>,
        agents: Arc<AgentManager>,
        bus: Arc<FanoutBus>,
        audit: Arc<AuditSink>,
    ) -> Arc<Self> {
        Self::with_settings(registry, agents, bus, audit, EngineSettings::default())
    }

    /// Create an engine with explicit settings.
    pub fn with_settings(
        registry: Arc<HandlerRegistry>,
        agents: Arc<AgentManager>,
        bus: Arc<FanoutBus>,
        audit: Arc<AuditSink>,
        settings: EngineSettings,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            registry,
            agents,
            bus,
            audit,
            events: RwLock::new(None),
            http: reqwest::Client::new(),
            workflows: DashMap::new(),
            executions: DashMap::new(),
            driver_tasks: DashMap::new(),
            controls: DashMap::new(),
            settings,
            weak: weak.clone(),
        })
    }

    /// Wire the outbound event bus for lifecycle webhooks.
    pub fn set_event_bus(&self, events: Arc<EventBus>) {
        *self.events.write() = Some(events);
    }

    /// Register a workflow definition after validating it. Returns its id.
    pub fn create_workflow(&self, mut workflow: Workflow) -> Result<String> {
        if workflow.id.is_empty() {
            workflow.id = Uuid::new_v4().to_string();
        }
        workflow.validate(&self.registry.known_types())?;
        let id = workflow.id.clone();
        info!(workflow = %id, name = %workflow.name, "workflow registered");
        self.workflows.insert(id.clone(), workflow);
        Ok(id)
    }

    /// Look up a workflow definition.
    pub fn workflow(&self, workflow_id: &str) -> Option<Workflow> {
        self.workflows.get(workflow_id).map(|entry| entry.clone())
    }

    /// Look up a workflow by display name.
    pub fn find_workflow_by_name(&self, name: &str) -> Option<Workflow> {
        self.workflows
            .iter()
            .find(|entry| entry.name == name)
            .map(|entry| entry.clone())
    }

    /// Start an execution. Returns the execution id immediately; the driver
    /// runs on its own task.
    pub fn execute_workflow(
        &self,
        workflow_id: &str,
        user_id: &str,
        input: Value,
    ) -> Result<String> {
        let workflow = self
            .workflow(workflow_id)
            .ok_or_else(|| OrchestratorError::WorkflowNotFound(workflow_id.to_string()))?;

        let input = match input {
            Value::Null => Map::new(),
            Value::Object(map) => map,
            other => {
                return Err(OrchestratorError::InvalidInput(format!(
                    "input must be an object, got {other}"
                )))
            }
        };

        let live = self
            .executions
            .iter()
            .filter(|entry| !entry.read().status.is_terminal())
            .count();
        if live >= self.settings.max_concurrent_workflows {
            return Err(OrchestratorError::RateLimited { retry_after: 1 });
        }

        let execution_id = Uuid::new_v4().to_string();
        let ctx = ExecutionContext::new(&execution_id, workflow, user_id, input);
        let ctx_arc = Arc::new(RwLock::new(ctx));
        self.executions.insert(execution_id.clone(), ctx_arc);

        let (cancel_tx, cancel_rx) = watch::channel(false);
        let (pause_tx, pause_rx) = watch::channel(false);
        self.controls.insert(
            execution_id.clone(),
            ExecutionControls {
                cancel: cancel_tx,
                pause: pause_tx,
            },
        );

        let engine = self
            .weak
            .upgrade()
            .ok_or_else(|| OrchestratorError::Internal("engine is shutting down".to_string()))?;
        let driver_execution_id = execution_id.clone();
        let task = tokio::spawn(async move {
            engine.drive_execution(driver_execution_id, cancel_rx, pause_rx).await;
        });
        self.driver_tasks.insert(execution_id.clone(), task);

        Ok(execution_id)
    }

    /// Cancel an execution. Cooperative and idempotent.
    pub async fn cancel_execution(&self, execution_id: &str, user_id: &str) -> bool {
        let Some(ctx_arc) = self.context(execution_id) else {
            return false;
        };
        if ctx_arc.read().status.is_terminal() {
            return true;
        }

        if let Some(controls) = self.controls.get(execution_id) {
            let _ = controls.cancel.send(true);
        }
        self.audit
            .log_workflow_event(
                &ctx_arc.read().workflow_id,
                "execution_cancelled",
                user_id,
                json!({"execution_id": execution_id}),
            )
            .await;
        true
    }

    /// Pause a running execution. Running steps finish; no new step starts.
    pub async fn pause_execution(&self, execution_id: &str, user_id: &str) -> Result<()> {
        let ctx_arc = self
            .context(execution_id)
            .ok_or_else(|| OrchestratorError::ExecutionNotFound(execution_id.to_string()))?;
        {
            let mut ctx = ctx_arc.write();
            if ctx.status != ExecutionStatus::Running {
                return Err(OrchestratorError::IllegalTransition {
                    from: ctx.status.as_str().to_string(),
                    to: ExecutionStatus::Paused.as_str().to_string(),
                });
            }
            ctx.status = ExecutionStatus::Paused;
        }
        if let Some(controls) = self.controls.get(execution_id) {
            let _ = controls.pause.send(true);
        }

        let snapshot = ctx_arc.read().clone();
        self.broadcast_execution(&snapshot, MessageType::WorkflowUpdate).await;
        self.audit
            .log_workflow_event(
                &snapshot.workflow_id,
                "execution_paused",
                user_id,
                json!({"execution_id": execution_id}),
            )
            .await;
        Ok(())
    }

    /// Resume a paused execution.
    pub async fn resume_execution(&self, execution_id: &str, user_id: &str) -> Result<()> {
        let ctx_arc = self
            .context(execution_id)
            .ok_or_else(|| OrchestratorError::ExecutionNotFound(execution_id.to_string()))?;
        {
            let mut ctx = ctx_arc.write();
            if ctx.status != ExecutionStatus::Paused {
                return Err(OrchestratorError::IllegalTransition {
                    from: ctx.status.as_str().to_string(),
                    to: ExecutionStatus::Running.as_str().to_string(),
                });
            }
            ctx.status = ExecutionStatus::Running;
        }
        if let Some(controls) = self.controls.get(execution_id) {
            let _ = controls.pause.send(false);
        }

        let snapshot = ctx_arc.read().clone();
        self.broadcast_execution(&snapshot, MessageType::WorkflowUpdate).await;
        self.audit
            .log_workflow_event(
                &snapshot.workflow_id,
                "execution_resumed",
                user_id,
                json!({"execution_id": execution_id}),
            )
            .await;
        Ok(())
    }

    /// Snapshot of one execution, if it is still retained.
    pub fn get_execution_status(&self, execution_id: &str) -> Option<ExecutionContext> {
        self.context(execution_id).map(|ctx| ctx.read().clone())
    }

    /// Snapshots of every retained execution.
    pub fn get_all_executions(&self) -> Vec<ExecutionContext> {
        self.executions
            .iter()
            .map(|entry| entry.read().clone())
            .collect()
    }

    /// Stop all drivers. Idempotent.
    pub fn stop(&self) {
        for entry in self.controls.iter() {
            let _ = entry.cancel.send(true);
        }
        for entry in self.driver_tasks.iter() {
            entry.abort();
        }
        self.driver_tasks.clear();
    }

    fn context(&self, execution_id: &str) -> Option<Arc<RwLock<ExecutionContext>>> {
        self.executions
            .get(execution_id)
            .map(|entry| Arc::clone(entry.value()))
    }

    fn handler_env(&self, ctx: &ExecutionContext, cancel: watch::Receiver<bool>) -> HandlerEnv {
        HandlerEnv {
            agents: Arc::clone(&self.agents),
            bus: Arc::clone(&self.bus),
            http: self.http.clone(),
            execution_id: ctx.execution_id.clone(),
            workflow_id: ctx.workflow_id.clone(),
            user_id: ctx.user_id.clone(),
            max_parallel: ctx.max_parallel_steps,
            cancel,
        }
    }

    async fn drive_execution(
        self: Arc<Self>,
        execution_id: String,
        cancel_rx: watch::Receiver<bool>,
        pause_rx: watch::Receiver<bool>,
    ) {
        let Some(ctx_arc) = self.context(&execution_id) else {
            return;
        };

        let (env, deadline, workflow_id, user_id) = {
            let mut ctx = ctx_arc.write();
            ctx.status = ExecutionStatus::Running;
            (
                self.handler_env(&ctx, cancel_rx.clone()),
                ctx.workflow.deadline().or(self.settings.default_timeout),
                ctx.workflow_id.clone(),
                ctx.user_id.clone(),
            )
        };

        let started_snapshot = ctx_arc.read().clone();
        self.broadcast_execution(&started_snapshot, MessageType::WorkflowStart).await;
        self.audit
            .log_workflow_event(
                &workflow_id,
                "execution_started",
                &user_id,
                json!({"execution_id": execution_id}),
            )
            .await;
        self.emit_event(
            "workflow_started",
            json!({"execution_id": execution_id, "workflow_id": workflow_id}),
        );

        // Cancellation is cooperative: handlers race their I/O against the
        // signal and the drivers check it at every step boundary.
        let drive = self.drive_graph(&ctx_arc, &env, pause_rx, cancel_rx);

        let outcome = match deadline {
            Some(limit) => match tokio::time::timeout(limit, drive).await {
                Ok(result) => result,
                Err(_) => Err(DriveError::Timeout(limit.as_secs())),
            },
            None => drive.await,
        };

        let final_snapshot = {
            let mut ctx = ctx_arc.write();
            match outcome {
                Ok(()) => {
                    if !ctx.status.is_terminal() {
                        ctx.status = ExecutionStatus::Completed;
                    }
                }
                Err(DriveError::Failed(reason)) => {
                    ctx.status = ExecutionStatus::Failed;
                    if ctx.error.is_none() {
                        ctx.error = Some(reason);
                    }
                }
                Err(DriveError::Cancelled) => {
                    ctx.status = ExecutionStatus::Cancelled;
                }
                Err(DriveError::Timeout(seconds)) => {
                    ctx.status = ExecutionStatus::Failed;
                    ctx.error = Some(format!("execution timed out after {seconds}s"));
                }
            }
            ctx.ended_at = Some(Utc::now());

            // Steps interrupted mid-flight become cancelled; never-started
            // steps become skipped in the final snapshot.
            if ctx.status != ExecutionStatus::Completed {
                for step in ctx.step_contexts.values_mut() {
                    match step.status {
                        StepStatus::Running => {
                            step.status = StepStatus::Cancelled;
                            step.ended_at = Some(Utc::now());
                        }
                        StepStatus::Pending => {
                            step.status = StepStatus::Skipped;
                            step.ended_at = Some(Utc::now());
                        }
                        _ => {}
                    }
                }
            }
            ctx.clone()
        };

        let (message_type, event) = match final_snapshot.status {
            ExecutionStatus::Completed => (MessageType::WorkflowComplete, "workflow_completed"),
            ExecutionStatus::Failed => (MessageType::WorkflowError, "workflow_failed"),
            _ => (MessageType::WorkflowUpdate, "workflow_cancelled"),
        };
        self.broadcast_execution(&final_snapshot, message_type).await;
        self.audit
            .log_workflow_event(
                &workflow_id,
                &format!("execution_{}", final_snapshot.status.as_str()),
                &user_id,
                json!({"execution_id": execution_id, "error": final_snapshot.error}),
            )
            .await;
        if event != "workflow_cancelled" {
            self.emit_event(
                event,
                json!({
                    "execution_id": execution_id,
                    "workflow_id": workflow_id,
                    "error": final_snapshot.error,
                }),
            );
        }

        self.driver_tasks.remove(&execution_id);
        self.controls.remove(&execution_id);

        // Terminal contexts stay queryable for the retention window.
        let engine = Arc::clone(&self);
        let retained = execution_id.clone();
        tokio::spawn(async move {
            tokio::time::sleep(engine.settings.retention).await;
            engine.executions.remove(&retained);
        });
    }

    async fn drive_graph(
        &self,
        ctx_arc: &Arc<RwLock<ExecutionContext>>,
        env: &HandlerEnv,
        pause_rx: watch::Receiver<bool>,
        cancel_rx: watch::Receiver<bool>,
    ) -> std::result::Result<(), DriveError> {
        let kind = ctx_arc.read().workflow.kind;
        match kind {
            crate::model::WorkflowKind::Sequential | crate::model::WorkflowKind::Conditional => {
                self.drive_sequential(ctx_arc, env, pause_rx, cancel_rx).await
            }
            crate::model::WorkflowKind::Parallel => {
                self.drive_parallel(ctx_arc, env, pause_rx, cancel_rx).await
            }
            crate::model::WorkflowKind::Visual => {
                self.drive_visual(ctx_arc, env, pause_rx, cancel_rx).await
            }
        }
    }

    async fn drive_sequential(
        &self,
        ctx_arc: &Arc<RwLock<ExecutionContext>>,
        env: &HandlerEnv,
        mut pause_rx: watch::Receiver<bool>,
        cancel_rx: watch::Receiver<bool>,
    ) -> std::result::Result<(), DriveError> {
        let steps = ctx_arc.read().workflow.steps.clone();
        let mut scope = ctx_arc.read().variables.clone();

        for step in &steps {
            gate(&mut pause_rx, &cancel_rx).await?;
            if ctx_arc.read().status.is_terminal() {
                break;
            }
            ctx_arc.write().current_step = Some(step.id.clone());

            if let Some(condition) = &step.condition {
                if !evaluate(condition, &scope) {
                    self.mark_step_skipped(ctx_arc, &step.id).await;
                    continue;
                }
            }

            match self.execute_step(ctx_arc, env, step, &mut scope).await {
                StepDisposition::Completed | StepDisposition::ContinuedAfterFailure => {}
                StepDisposition::ExecutionFailed(reason) => return Err(DriveError::Failed(reason)),
                StepDisposition::Cancelled => return Err(DriveError::Cancelled),
            }
            ctx_arc.write().variables = scope.clone();
        }
        Ok(())
    }

    async fn drive_parallel(
        &self,
        ctx_arc: &Arc<RwLock<ExecutionContext>>,
        env: &HandlerEnv,
        mut pause_rx: watch::Receiver<bool>,
        cancel_rx: watch::Receiver<bool>,
    ) -> std::result::Result<(), DriveError> {
        let steps = ctx_arc.read().workflow.steps.clone();
        let groups = group_steps_by_dependencies(steps);
        let max_parallel = ctx_arc.read().max_parallel_steps.max(1);

        for group in groups {
            gate(&mut pause_rx, &cancel_rx).await?;
            if ctx_arc.read().status.is_terminal() {
                break;
            }

            let semaphore = Arc::new(Semaphore::new(max_parallel));
            let futures = group.iter().map(|step| {
                let semaphore = Arc::clone(&semaphore);
                async move {
                    let _permit = semaphore.acquire().await;
                    // Scope snapshot taken once the slot is held, so a cap
                    // of one sees earlier output_variable writes.
                    let mut scope = ctx_arc.read().variables.clone();
                    self.execute_step(ctx_arc, env, step, &mut scope).await
                }
            });

            for disposition in join_all(futures).await {
                match disposition {
                    StepDisposition::ExecutionFailed(reason) => {
                        return Err(DriveError::Failed(reason))
                    }
                    StepDisposition::Cancelled => return Err(DriveError::Cancelled),
                    _ => {}
                }
            }
        }
        Ok(())
    }

    async fn drive_visual(
        &self,
        ctx_arc: &Arc<RwLock<ExecutionContext>>,
        env: &HandlerEnv,
        mut pause_rx: watch::Receiver<bool>,
        cancel_rx: watch::Receiver<bool>,
    ) -> std::result::Result<(), DriveError> {
        let (nodes, edges) = {
            let ctx = ctx_arc.read();
            (ctx.workflow.nodes.clone(), ctx.workflow.edges.clone())
        };
        let mut dependencies: HashMap<&str, Vec<&str>> = HashMap::new();
        for node in &nodes {
            dependencies.entry(node.id.as_str()).or_default();
        }
        for edge in &edges {
            dependencies
                .entry(edge.target.as_str())
                .or_default()
                .push(edge.source.as_str());
        }

        let max_parallel = ctx_arc.read().max_parallel_steps.max(1);
        let mut executed: HashSet<String> = HashSet::new();

        loop {
            gate(&mut pause_rx, &cancel_rx).await?;
            if ctx_arc.read().status.is_terminal() {
                break;
            }

            let ready: Vec<&Node> = nodes
                .iter()
                .filter(|node| {
                    !executed.contains(&node.id)
                        && dependencies[node.id.as_str()]
                            .iter()
                            .all(|dep| executed.contains(*dep))
                })
                .collect();
            if ready.is_empty() {
                break;
            }

            let semaphore = Arc::new(Semaphore::new(max_parallel));
            let futures = ready.iter().map(|node| {
                let semaphore = Arc::clone(&semaphore);
                async move {
                    let _permit = semaphore.acquire().await;
                    self.execute_visual_node(ctx_arc, env, node).await
                }
            });
            let cancelled = join_all(futures).await.into_iter().any(|cancelled| cancelled);
            if cancelled {
                return Err(DriveError::Cancelled);
            }

            for node in &ready {
                executed.insert(node.id.clone());
            }
        }
        Ok(())
    }

    // Returns true when the node was interrupted by cancellation.
    async fn execute_visual_node(
        &self,
        ctx_arc: &Arc<RwLock<ExecutionContext>>,
        env: &HandlerEnv,
        node: &Node,
    ) -> bool {
        {
            let mut ctx = ctx_arc.write();
            if let Some(step) = ctx.step_contexts.get_mut(&node.id) {
                step.status = StepStatus::Running;
                step.started_at = Some(Utc::now());
            }
            ctx.current_step = Some(node.id.clone());
        }
        self.broadcast_step(ctx_arc, &node.id).await;

        let (inputs, variables) = {
            let ctx = ctx_arc.read();
            (gather_node_inputs(node, &ctx.results), ctx.variables.clone())
        };
        let value = tokio::select! {
            value = run_visual_node(env, node, &inputs, &variables) => value,
            _ = await_cancelled(&env.cancel) => {
                mark_node_cancelled(ctx_arc, &node.id);
                self.broadcast_step(ctx_arc, &node.id).await;
                return true;
            }
        };
        let succeeded = value.get("success").and_then(|v| v.as_bool()).unwrap_or(true);

        {
            let mut ctx = ctx_arc.write();
            ctx.results.insert(node.id.clone(), value.clone());
            if succeeded {
                ctx.completed_steps.push(node.id.clone());
            } else {
                ctx.failed_steps.push(node.id.clone());
            }
            if let Some(step) = ctx.step_contexts.get_mut(&node.id) {
                step.status = if succeeded {
                    StepStatus::Completed
                } else {
                    StepStatus::Failed
                };
                step.result = Some(value);
                step.ended_at = Some(Utc::now());
            }
        }
        self.broadcast_step(ctx_arc, &node.id).await;
        false
    }

    async fn execute_step(
        &self,
        ctx_arc: &Arc<RwLock<ExecutionContext>>,
        env: &HandlerEnv,
        step: &Step,
        scope: &mut Map<String, Value>,
    ) -> StepDisposition {
        loop {
            {
                let mut ctx = ctx_arc.write();
                if let Some(sc) = ctx.step_contexts.get_mut(&step.id) {
                    sc.status = StepStatus::Running;
                    if sc.started_at.is_none() {
                        sc.started_at = Some(Utc::now());
                    }
                }
            }
            self.broadcast_step(ctx_arc, &step.id).await;

            match self.registry.run(env, scope, step).await {
                Ok(value) => {
                    {
                        let mut ctx = ctx_arc.write();
                        if let Some(sc) = ctx.step_contexts.get_mut(&step.id) {
                            sc.status = StepStatus::Completed;
                            sc.result = Some(value.clone());
                            sc.ended_at = Some(Utc::now());
                        }
                        ctx.results.insert(step.id.clone(), value.clone());
                        ctx.completed_steps.push(step.id.clone());
                        if let Some(name) = &step.output_variable {
                            ctx.variables.insert(name.clone(), value.clone());
                        }
                    }
                    if let Some(name) = &step.output_variable {
                        scope.insert(name.clone(), value);
                    }
                    self.broadcast_step(ctx_arc, &step.id).await;
                    return StepDisposition::Completed;
                }
                Err(StepError::Cancelled) => {
                    {
                        let mut ctx = ctx_arc.write();
                        if let Some(sc) = ctx.step_contexts.get_mut(&step.id) {
                            sc.status = StepStatus::Cancelled;
                            sc.ended_at = Some(Utc::now());
                        }
                    }
                    self.broadcast_step(ctx_arc, &step.id).await;
                    return StepDisposition::Cancelled;
                }
                Err(StepError::Failed(reason)) => {
                    {
                        let mut ctx = ctx_arc.write();
                        if let Some(sc) = ctx.step_contexts.get_mut(&step.id) {
                            sc.status = StepStatus::Failed;
                            sc.error = Some(reason.clone());
                            sc.ended_at = Some(Utc::now());
                        }
                    }
                    self.broadcast_step(ctx_arc, &step.id).await;
                    warn!(step = %step.id, %reason, "step failed");

                    let policy = step.on_failure.unwrap_or(OnFailure {
                        action: FailureAction::Fail,
                        max_retries: 0,
                    });
                    match policy.action {
                        FailureAction::Retry => {
                            let can_retry = {
                                let mut ctx = ctx_arc.write();
                                let sc = ctx
                                    .step_contexts
                                    .get_mut(&step.id)
                                    .expect("step context present");
                                if sc.retry_count < policy.max_retries {
                                    sc.retry_count += 1;
                                    // Retry entry resets the step and clears
                                    // its recorded error.
                                    sc.status = StepStatus::Pending;
                                    sc.error = None;
                                    sc.ended_at = None;
                                    true
                                } else {
                                    false
                                }
                            };
                            if can_retry {
                                continue;
                            }
                            let mut ctx = ctx_arc.write();
                            ctx.failed_steps.push(step.id.clone());
                            ctx.status = ExecutionStatus::Failed;
                            ctx.error = Some(reason.clone());
                            return StepDisposition::ExecutionFailed(reason);
                        }
                        FailureAction::Continue => {
                            ctx_arc.write().failed_steps.push(step.id.clone());
                            return StepDisposition::ContinuedAfterFailure;
                        }
                        FailureAction::Fail => {
                            let mut ctx = ctx_arc.write();
                            ctx.failed_steps.push(step.id.clone());
                            ctx.status = ExecutionStatus::Failed;
                            ctx.error = Some(reason.clone());
                            return StepDisposition::ExecutionFailed(reason);
                        }
                    }
                }
            }
        }
    }

    async fn mark_step_skipped(&self, ctx_arc: &Arc<RwLock<ExecutionContext>>, step_id: &str) {
        {
            let mut ctx = ctx_arc.write();
            if let Some(sc) = ctx.step_contexts.get_mut(step_id) {
                sc.status = StepStatus::Skipped;
                sc.ended_at = Some(Utc::now());
            }
        }
        self.broadcast_step(ctx_arc, step_id).await;
    }

    async fn broadcast_execution(&self, ctx: &ExecutionContext, message_type: MessageType) {
        let message = BusMessage::new(
            message_type,
            WindowType::WorkflowBuilder,
            json!({
                "execution_id": ctx.execution_id,
                "workflow_id": ctx.workflow_id,
                "status": ctx.status.as_str(),
                "current_step": ctx.current_step,
                "completed_steps": ctx.completed_steps,
                "failed_steps": ctx.failed_steps,
                "error": ctx.error,
            }),
        )
        .with_user(ctx.user_id.clone());
        self.bus
            .broadcast_to_window(WindowType::WorkflowBuilder, &message)
            .await;
    }

    async fn broadcast_step(&self, ctx_arc: &Arc<RwLock<ExecutionContext>>, step_id: &str) {
        let payload = {
            let ctx = ctx_arc.read();
            let Some(sc) = ctx.step_contexts.get(step_id) else {
                return;
            };
            json!({
                "execution_id": ctx.execution_id,
                "step_id": step_id,
                "status": sc.status.as_str(),
                "result": sc.result,
                "error": sc.error,
                "start_time": sc.started_at,
                "end_time": sc.ended_at,
            })
        };
        let message = BusMessage::new(
            MessageType::WorkflowUpdate,
            WindowType::WorkflowBuilder,
            payload,
        );
        self.bus
            .broadcast_to_window(WindowType::WorkflowBuilder, &message)
            .await;
    }

    fn emit_event(&self, event_type: &'static str, data: Value) {
        let events = self.events.read().clone();
        if let Some(events) = events {
            tokio::spawn(async move {
                if let Err(err) = events.emit(event_type, data).await {
                    error!(event = event_type, error = %err, "event emission failed");
                }
            });
        }
    }
}

fn mark_node_cancelled(ctx_arc: &Arc<RwLock<ExecutionContext>>, node_id: &str) {
    let mut ctx = ctx_arc.write();
    if let Some(step) = ctx.step_contexts.get_mut(node_id) {
        step.status = StepStatus::Cancelled;
        step.ended_at = Some(Utc::now());
    }
}

// Step boundary gate: blocks while paused, aborts on cancellation. Running
// steps are unaffected by pause; cancellation wins over a held pause.
async fn gate(
    pause_rx: &mut watch::Receiver<bool>,
    cancel_rx: &watch::Receiver<bool>,
) -> std::result::Result<(), DriveError> {
    if *cancel_rx.borrow() {
        return Err(DriveError::Cancelled);
    }
    let mut cancel = cancel_rx.clone();
    tokio::select! {
        _ = pause_rx.wait_for(|paused| !*paused) => Ok(()),
        result = cancel.wait_for(|cancelled| *cancelled) => {
            if result.is_ok() {
                Err(DriveError::Cancelled)
            } else {
                Ok(())
            }
        }
    }
}

// Explicit `depends_on` lists partition steps into layered groups; without
// them every step lands in one group.
fn group_steps_by_dependencies(steps: Vec<Step>) -> Vec<Vec<Step>> {
    let has_dependencies = steps
        .iter()
        .any(|step| step.config.get("depends_on").is_some());
    if !has_dependencies {
        return vec![steps];
    }

    let mut placed: HashSet<String> = HashSet::new();
    let mut remaining: Vec<Step> = steps;
    let mut groups: Vec<Vec<Step>> = Vec::new();

    while !remaining.is_empty() {
        let (ready, rest): (Vec<Step>, Vec<Step>) = remaining.into_iter().partition(|step| {
            step.config
                .get("depends_on")
                .and_then(|v| v.as_array())
                .map(|deps| {
                    deps.iter()
                        .filter_map(|d| d.as_str())
                        .all(|dep| placed.contains(dep))
                })
                .unwrap_or(true)
        });

        if ready.is_empty() {
            // Unsatisfiable dependencies; run the rest together rather than
            // spinning forever.
            groups.push(rest);
            break;
        }
        for step in &ready {
            placed.insert(step.id.clone());
        }
        groups.push(ready);
        remaining = rest;
    }
    groups
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn step_with_deps(id: &str, deps: &[&str]) -> Step {
        Step {
            id: id.to_string(),
            step_type: "wait".to_string(),
            config: if deps.is_empty() {
                json!({"duration": 0.0})
            } else {
                json!({"duration": 0.0, "depends_on": deps})
            },
            on_failure: None,
            condition: None,
            output_variable: None,
        }
    }

    #[test]
    fn test_no_dependencies_single_group() {
        let groups = group_steps_by_dependencies(vec![
            step_with_deps("a", &[]),
            step_with_deps("b", &[]),
        ]);
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].len(), 2);
    }

    #[test]
    fn test_dependency_layers() {
        let groups = group_steps_by_dependencies(vec![
            step_with_deps("a", &[]),
            step_with_deps("b", &["a"]),
            step_with_deps("c", &["a"]),
            step_with_deps("d", &["b", "c"]),
        ]);
        assert_eq!(groups.len(), 3);
        assert_eq!(groups[0][0].id, "a");
        assert_eq!(groups[1].len(), 2);
        assert_eq!(groups[2][0].id, "d");
    }

    #[test]
    fn test_unsatisfiable_dependencies_do_not_spin() {
        let groups = group_steps_by_dependencies(vec![
            step_with_deps("a", &["ghost"]),
            step_with_deps("b", &[]),
        ]);
        assert_eq!(groups.len(), 2);
    }

    #[test]
    fn test_engine_settings_defaults() {
        let settings = EngineSettings::default();
        assert_eq!(settings.max_concurrent_workflows, 10);
        assert_eq!(settings.default_timeout, Some(Duration::from_secs(3600)));
    }
}
