//! End-to-end engine scenarios driven through the public operations.

use agents::{AgentBrain, AgentManager};
use async_trait::async_trait;
use audit::AuditSink;
use orchestrator::{
    ExecutionContext, ExecutionStatus, FailureAction, HandlerEnv, HandlerRegistry, OnFailure,
    OrchestratorError, Step, StepHandler, StepStatus, Workflow, WorkflowEngine, WorkflowKind,
};
use realtime::{ChannelTransport, FanoutBus, WindowType};
use serde_json::{json, Map, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

fn build_engine(registry: HandlerRegistry) -> (Arc<WorkflowEngine>, Arc<FanoutBus>) {
    let brain = Arc::new(AgentBrain::new(None, None));
    let bus = Arc::new(FanoutBus::new());
    let audit = Arc::new(AuditSink::new(true));
    let agents = Arc::new(AgentManager::new(brain, Arc::clone(&bus), Arc::clone(&audit)));
    let engine = WorkflowEngine::new(Arc::new(registry), agents, Arc::clone(&bus), audit);
    (engine, bus)
}

fn flat_workflow(kind: WorkflowKind, steps: Vec<Value>) -> Workflow {
    serde_json::from_value(json!({
        "id": "",
        "name": "test-workflow",
        "kind": kind,
        "steps": steps,
    }))
    .unwrap()
}

async fn wait_terminal(engine: &Arc<WorkflowEngine>, execution_id: &str) -> ExecutionContext {
    loop {
        if let Some(ctx) = engine.get_execution_status(execution_id) {
            if ctx.status.is_terminal() {
                return ctx;
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

async fn wait_running(engine: &Arc<WorkflowEngine>, execution_id: &str) {
    loop {
        if let Some(ctx) = engine.get_execution_status(execution_id) {
            if ctx.status == ExecutionStatus::Running {
                return;
            }
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
}

// S1: transform feeding a condition through an output variable.
#[tokio::test]
async fn sequential_happy_path() {
    let (engine, _bus) = build_engine(HandlerRegistry::with_defaults());
    let workflow_id = engine
        .create_workflow(flat_workflow(
            WorkflowKind::Sequential,
            vec![
                json!({
                    "id": "s1",
                    "type": "transform",
                    "config": {"type": "template", "input": "hi", "template": "say ${input}"},
                    "output_variable": "greeting",
                }),
                json!({
                    "id": "s2",
                    "type": "condition",
                    "config": {"condition": "greeting contains say"},
                }),
            ],
        ))
        .unwrap();

    let execution_id = engine
        .execute_workflow(&workflow_id, "u1", Value::Null)
        .unwrap();
    let ctx = wait_terminal(&engine, &execution_id).await;

    assert_eq!(ctx.status, ExecutionStatus::Completed);
    assert_eq!(ctx.results["s1"], json!({"transformed": "say hi"}));
    assert_eq!(ctx.results["s2"], json!({"condition_result": true}));
    assert_eq!(ctx.completed_steps, vec!["s1", "s2"]);
    assert!(ctx.failed_steps.is_empty());
}

// S2: five 0.2s waits under a concurrency cap of two run as three waves.
#[tokio::test(start_paused = true)]
async fn parallel_with_concurrency_cap() {
    let (engine, _bus) = build_engine(HandlerRegistry::with_defaults());
    let steps: Vec<Value> = (0..5)
        .map(|i| json!({"id": format!("w{i}"), "type": "wait", "config": {"duration": 0.2}}))
        .collect();
    let mut workflow = flat_workflow(WorkflowKind::Parallel, steps);
    workflow.max_parallel_steps = 2;
    let workflow_id = engine.create_workflow(workflow).unwrap();

    let started = Instant::now();
    let execution_id = engine
        .execute_workflow(&workflow_id, "u1", Value::Null)
        .unwrap();
    let ctx = wait_terminal(&engine, &execution_id).await;
    let elapsed = started.elapsed();

    assert_eq!(ctx.status, ExecutionStatus::Completed);
    assert_eq!(ctx.completed_steps.len(), 5);
    assert!(
        elapsed >= Duration::from_millis(550) && elapsed < Duration::from_millis(1000),
        "expected three waves of two, got {elapsed:?}"
    );
}

struct AlwaysFailing {
    attempts: Arc<AtomicUsize>,
}

#[async_trait]
impl StepHandler for AlwaysFailing {
    async fn execute(
        &self,
        _registry: &HandlerRegistry,
        _env: &HandlerEnv,
        _scope: &mut Map<String, Value>,
        _step: &Step,
    ) -> orchestrator::StepResult<Value> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        Err(orchestrator::StepError::failed("upstream returned status 503"))
    }
}

// S3: retry policy exhausts after exactly initial + max_retries attempts.
#[tokio::test]
async fn retry_exhausted_fails_execution() {
    let attempts = Arc::new(AtomicUsize::new(0));
    let mut registry = HandlerRegistry::with_defaults();
    registry.register(
        "flaky_call",
        Arc::new(AlwaysFailing {
            attempts: Arc::clone(&attempts),
        }),
    );
    let (engine, _bus) = build_engine(registry);

    let workflow = flat_workflow(
        WorkflowKind::Sequential,
        vec![json!({
            "id": "s1",
            "type": "flaky_call",
            "config": {},
            "on_failure": {"action": "retry", "max_retries": 2},
        })],
    );
    assert!(matches!(
        workflow.steps[0].on_failure,
        Some(OnFailure {
            action: FailureAction::Retry,
            max_retries: 2,
        })
    ));
    let workflow_id = engine.create_workflow(workflow).unwrap();

    let execution_id = engine
        .execute_workflow(&workflow_id, "u1", Value::Null)
        .unwrap();
    let ctx = wait_terminal(&engine, &execution_id).await;

    assert_eq!(ctx.status, ExecutionStatus::Failed);
    assert_eq!(attempts.load(Ordering::SeqCst), 3);
    let step = &ctx.step_contexts["s1"];
    assert_eq!(step.status, StepStatus::Failed);
    assert_eq!(step.retry_count, 2);
    assert!(step.retry_count <= step.max_retries);
    assert_eq!(ctx.failed_steps, vec!["s1"]);
}

// A continue policy records the failure but lets the execution finish.
#[tokio::test]
async fn continue_policy_keeps_execution_alive() {
    let attempts = Arc::new(AtomicUsize::new(0));
    let mut registry = HandlerRegistry::with_defaults();
    registry.register(
        "flaky_call",
        Arc::new(AlwaysFailing {
            attempts: Arc::clone(&attempts),
        }),
    );
    let (engine, _bus) = build_engine(registry);

    let workflow = flat_workflow(
        WorkflowKind::Sequential,
        vec![
            json!({
                "id": "bad",
                "type": "flaky_call",
                "config": {},
                "on_failure": {"action": "continue"},
            }),
            json!({
                "id": "after",
                "type": "transform",
                "config": {"type": "template", "input": "x", "template": "ok"},
            }),
        ],
    );
    let workflow_id = engine.create_workflow(workflow).unwrap();

    let execution_id = engine
        .execute_workflow(&workflow_id, "u1", Value::Null)
        .unwrap();
    let ctx = wait_terminal(&engine, &execution_id).await;

    assert_eq!(ctx.status, ExecutionStatus::Completed);
    assert_eq!(ctx.failed_steps, vec!["bad"]);
    assert_eq!(ctx.completed_steps, vec!["after"]);
    // Disjoint at terminal status.
    assert!(ctx.completed_steps.iter().all(|s| !ctx.failed_steps.contains(s)));
}

// S4: visual DAG executes in topological order and routes content along
// edges.
#[tokio::test]
async fn visual_dag_routing() {
    let (engine, _bus) = build_engine(HandlerRegistry::with_defaults());
    let workflow: Workflow = serde_json::from_value(json!({
        "id": "",
        "name": "visual",
        "kind": "visual",
        "nodes": [
            {"id": "A", "type": "transform",
             "config": {"transform_type": "template", "template": "X"}},
            {"id": "B", "type": "transform",
             "config": {"transform_type": "template", "template": "${a}Y"},
             "input_sources": [{"node_id": "A", "key": "a"}]},
            {"id": "C", "type": "output",
             "config": {"output_format": "text"},
             "input_sources": [{"node_id": "B", "key": "b"}]},
        ],
        "edges": [
            {"source": "A", "target": "B"},
            {"source": "B", "target": "C"},
        ],
    }))
    .unwrap();
    let workflow_id = engine.create_workflow(workflow).unwrap();

    let execution_id = engine
        .execute_workflow(&workflow_id, "u1", Value::Null)
        .unwrap();
    let ctx = wait_terminal(&engine, &execution_id).await;

    assert_eq!(ctx.status, ExecutionStatus::Completed);
    assert_eq!(ctx.results["A"]["content"], "X");
    assert_eq!(ctx.results["B"]["content"], "XY");
    assert_eq!(ctx.results["C"]["content"], "XY");
    assert_eq!(ctx.completed_steps, vec!["A", "B", "C"]);
}

// S5: cancellation interrupts a long wait and skips everything downstream.
#[tokio::test(start_paused = true)]
async fn cancellation_interrupts_wait() {
    let (engine, bus) = build_engine(HandlerRegistry::with_defaults());
    let (transport, mut rx) = ChannelTransport::new(256);
    bus.connect(Arc::new(transport), WindowType::WorkflowBuilder, None, None)
        .await
        .unwrap();

    let workflow = flat_workflow(
        WorkflowKind::Sequential,
        vec![
            json!({"id": "long_wait", "type": "wait", "config": {"duration": 10.0}}),
            json!({"id": "never", "type": "wait", "config": {"duration": 0.1}}),
        ],
    );
    let workflow_id = engine.create_workflow(workflow).unwrap();

    let started = Instant::now();
    let execution_id = engine
        .execute_workflow(&workflow_id, "u1", Value::Null)
        .unwrap();
    wait_running(&engine, &execution_id).await;
    tokio::time::sleep(Duration::from_millis(500)).await;

    assert!(engine.cancel_execution(&execution_id, "u1").await);
    let ctx = wait_terminal(&engine, &execution_id).await;
    let elapsed = started.elapsed();

    assert_eq!(ctx.status, ExecutionStatus::Cancelled);
    assert!(elapsed < Duration::from_secs(2), "took {elapsed:?}");
    assert_eq!(ctx.step_contexts["long_wait"].status, StepStatus::Cancelled);
    assert_eq!(ctx.step_contexts["never"].status, StepStatus::Skipped);

    // Cancel is idempotent.
    assert!(engine.cancel_execution(&execution_id, "u1").await);

    // No broadcast ever announced the downstream step as running.
    let mut never_started = true;
    while let Ok(frame) = rx.try_recv() {
        let message: Value = serde_json::from_str(&frame).unwrap();
        if message["data"]["step_id"] == "never" && message["data"]["status"] == "running" {
            never_started = false;
        }
    }
    assert!(never_started);
}

// Pause stops new steps; resume lets the execution finish.
#[tokio::test(start_paused = true)]
async fn pause_and_resume() {
    let (engine, _bus) = build_engine(HandlerRegistry::with_defaults());
    let workflow = flat_workflow(
        WorkflowKind::Sequential,
        vec![
            json!({"id": "w1", "type": "wait", "config": {"duration": 0.1}}),
            json!({"id": "w2", "type": "wait", "config": {"duration": 0.1}}),
        ],
    );
    let workflow_id = engine.create_workflow(workflow).unwrap();

    let execution_id = engine
        .execute_workflow(&workflow_id, "u1", Value::Null)
        .unwrap();
    wait_running(&engine, &execution_id).await;
    engine.pause_execution(&execution_id, "u1").await.unwrap();

    // Well past the combined wait time, the paused execution is still alive.
    tokio::time::sleep(Duration::from_secs(2)).await;
    let ctx = engine.get_execution_status(&execution_id).unwrap();
    assert_eq!(ctx.status, ExecutionStatus::Paused);

    engine.resume_execution(&execution_id, "u1").await.unwrap();
    let ctx = wait_terminal(&engine, &execution_id).await;
    assert_eq!(ctx.status, ExecutionStatus::Completed);
    assert_eq!(ctx.completed_steps.len(), 2);
}

#[tokio::test]
async fn resume_requires_paused() {
    let (engine, _bus) = build_engine(HandlerRegistry::with_defaults());
    let workflow = flat_workflow(
        WorkflowKind::Sequential,
        vec![json!({"id": "w1", "type": "wait", "config": {"duration": 0.05}})],
    );
    let workflow_id = engine.create_workflow(workflow).unwrap();
    let execution_id = engine
        .execute_workflow(&workflow_id, "u1", Value::Null)
        .unwrap();
    wait_running(&engine, &execution_id).await;

    assert!(matches!(
        engine.resume_execution(&execution_id, "u1").await,
        Err(OrchestratorError::IllegalTransition { .. })
    ));
    wait_terminal(&engine, &execution_id).await;
}

// Boundary: an empty workflow completes immediately.
#[tokio::test]
async fn empty_workflow_completes() {
    let (engine, _bus) = build_engine(HandlerRegistry::with_defaults());
    let workflow_id = engine
        .create_workflow(flat_workflow(WorkflowKind::Sequential, vec![]))
        .unwrap();
    let execution_id = engine
        .execute_workflow(&workflow_id, "u1", Value::Null)
        .unwrap();
    let ctx = wait_terminal(&engine, &execution_id).await;
    assert_eq!(ctx.status, ExecutionStatus::Completed);
    assert!(ctx.completed_steps.is_empty());
}

// Boundary: a false step condition skips the step but completes the run.
#[tokio::test]
async fn false_condition_skips_step() {
    let (engine, _bus) = build_engine(HandlerRegistry::with_defaults());
    let workflow = flat_workflow(
        WorkflowKind::Conditional,
        vec![json!({
            "id": "gated",
            "type": "transform",
            "config": {"type": "template", "input": "x", "template": "y"},
            "condition": "missing_flag",
        })],
    );
    let workflow_id = engine.create_workflow(workflow).unwrap();
    let execution_id = engine
        .execute_workflow(&workflow_id, "u1", Value::Null)
        .unwrap();
    let ctx = wait_terminal(&engine, &execution_id).await;

    assert_eq!(ctx.status, ExecutionStatus::Completed);
    assert_eq!(ctx.step_contexts["gated"].status, StepStatus::Skipped);
    assert!(ctx.results.is_empty());
}

// Boundary: max_parallel_steps = 1 behaves like sequential execution.
#[tokio::test(start_paused = true)]
async fn parallel_cap_of_one_is_sequential() {
    let (engine, _bus) = build_engine(HandlerRegistry::with_defaults());
    let steps: Vec<Value> = (0..3)
        .map(|i| json!({"id": format!("w{i}"), "type": "wait", "config": {"duration": 0.1}}))
        .collect();
    let mut workflow = flat_workflow(WorkflowKind::Parallel, steps);
    workflow.max_parallel_steps = 1;
    let workflow_id = engine.create_workflow(workflow).unwrap();

    let started = Instant::now();
    let execution_id = engine
        .execute_workflow(&workflow_id, "u1", Value::Null)
        .unwrap();
    let ctx = wait_terminal(&engine, &execution_id).await;

    assert_eq!(ctx.status, ExecutionStatus::Completed);
    assert!(started.elapsed() >= Duration::from_millis(290));
}

// Input seeds the variable scope; caller input reaches interpolation.
#[tokio::test]
async fn input_seeds_variables() {
    let (engine, _bus) = build_engine(HandlerRegistry::with_defaults());
    let workflow = flat_workflow(
        WorkflowKind::Sequential,
        vec![json!({
            "id": "hello",
            "type": "transform",
            "config": {"type": "template", "input": "${name}", "template": "hello ${input}"},
        })],
    );
    let workflow_id = engine.create_workflow(workflow).unwrap();
    let execution_id = engine
        .execute_workflow(&workflow_id, "u1", json!({"name": "world"}))
        .unwrap();
    let ctx = wait_terminal(&engine, &execution_id).await;

    assert_eq!(ctx.results["hello"]["transformed"], "hello world");
}

#[tokio::test]
async fn unknown_workflow_rejected() {
    let (engine, _bus) = build_engine(HandlerRegistry::with_defaults());
    assert!(matches!(
        engine.execute_workflow("ghost", "u1", Value::Null),
        Err(OrchestratorError::WorkflowNotFound(_))
    ));
}

#[tokio::test]
async fn cyclic_visual_workflow_rejected_at_creation() {
    let (engine, _bus) = build_engine(HandlerRegistry::with_defaults());
    let workflow: Workflow = serde_json::from_value(json!({
        "id": "",
        "name": "cyclic",
        "kind": "visual",
        "nodes": [
            {"id": "a", "type": "transform", "config": {}},
            {"id": "b", "type": "transform", "config": {}},
        ],
        "edges": [
            {"source": "a", "target": "b"},
            {"source": "b", "target": "a"},
        ],
    }))
    .unwrap();
    assert!(matches!(
        engine.create_workflow(workflow),
        Err(OrchestratorError::InvalidWorkflow(_))
    ));
}

// Execution timeout cancels in-flight work and marks the run failed.
#[tokio::test(start_paused = true)]
async fn timeout_fails_execution() {
    let (engine, _bus) = build_engine(HandlerRegistry::with_defaults());
    let mut workflow = flat_workflow(
        WorkflowKind::Sequential,
        vec![json!({"id": "forever", "type": "wait", "config": {"duration": 60.0}})],
    );
    workflow.timeout_seconds = Some(1);
    let workflow_id = engine.create_workflow(workflow).unwrap();

    let execution_id = engine
        .execute_workflow(&workflow_id, "u1", Value::Null)
        .unwrap();
    let ctx = wait_terminal(&engine, &execution_id).await;

    assert_eq!(ctx.status, ExecutionStatus::Failed);
    assert!(ctx.error.as_deref().unwrap_or_default().contains("timed out"));
    assert_eq!(ctx.step_contexts["forever"].status, StepStatus::Cancelled);
}

// Status broadcasts on the workflow_builder window progress monotonically.
#[tokio::test]
async fn broadcast_status_progression() {
    let (engine, bus) = build_engine(HandlerRegistry::with_defaults());
    let (transport, mut rx) = ChannelTransport::new(256);
    bus.connect(Arc::new(transport), WindowType::WorkflowBuilder, None, None)
        .await
        .unwrap();

    let workflow = flat_workflow(
        WorkflowKind::Sequential,
        vec![json!({
            "id": "s1",
            "type": "transform",
            "config": {"type": "template", "input": "x", "template": "y"},
        })],
    );
    let workflow_id = engine.create_workflow(workflow).unwrap();
    let execution_id = engine
        .execute_workflow(&workflow_id, "u1", Value::Null)
        .unwrap();
    wait_terminal(&engine, &execution_id).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    let mut execution_statuses = Vec::new();
    while let Ok(frame) = rx.try_recv() {
        let message: Value = serde_json::from_str(&frame).unwrap();
        if message["data"]["execution_id"] == execution_id.as_str()
            && message["data"].get("step_id").is_none()
        {
            execution_statuses.push(message["data"]["status"].as_str().unwrap().to_string());
        }
    }

    assert_eq!(execution_statuses.first().map(String::as_str), Some("running"));
    assert_eq!(execution_statuses.last().map(String::as_str), Some("completed"));
}
