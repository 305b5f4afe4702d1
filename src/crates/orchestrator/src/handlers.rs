//! Step handlers: the dispatch table from step-type tag to behavior.
//!
//! Handlers receive the execution's variable scope and a service
//! environment; composite handlers (`loop`, `parallel`) re-enter the
//! registry for their nested steps. Visual workflows run a parallel set of
//! node executors that pull inputs from named upstream nodes instead of a
//! shared scope.

use crate::error::{StepError, StepResult};
use crate::expr::{evaluate, interpolate, interpolate_str, value_to_string};
use crate::model::{Node, Step};
use agents::AgentManager;
use async_trait::async_trait;
use futures::future::join_all;
use realtime::{BusMessage, FanoutBus, MessageType, WindowType};
use serde_json::{json, Map, Value};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Semaphore};
use tracing::{debug, error};

/// Services available to handlers during one execution.
#[derive(Clone)]
pub struct HandlerEnv {
    /// Agent manager for `agent_task` and visual `ai_agent` nodes.
    pub agents: Arc<AgentManager>,
    /// Fanout bus for `notification`.
    pub bus: Arc<FanoutBus>,
    /// Shared HTTP client for `api_call` and `webhook`.
    pub http: reqwest::Client,
    /// Execution this environment belongs to.
    pub execution_id: String,
    /// Workflow being executed.
    pub workflow_id: String,
    /// Submitting user; notification target.
    pub user_id: String,
    /// Concurrency cap for `parallel`.
    pub max_parallel: usize,
    /// Cancellation signal for the execution. Handlers that suspend on I/O
    /// race against it and surface [`StepError::Cancelled`].
    pub cancel: watch::Receiver<bool>,
}

/// Resolves when the execution's cancellation is signalled. A closed
/// channel never resolves; teardown of an orphaned driver is handled by the
/// engine, not here.
pub(crate) async fn await_cancelled(cancel: &watch::Receiver<bool>) {
    let mut cancel = cancel.clone();
    if cancel.wait_for(|cancelled| *cancelled).await.is_err() {
        std::future::pending::<()>().await;
    }
}

/// A step handler. `(ExecutionContext, Step) → result value`; may suspend.
#[async_trait]
pub trait StepHandler: Send + Sync {
    /// Execute one step against the variable scope.
    async fn execute(
        &self,
        registry: &HandlerRegistry,
        env: &HandlerEnv,
        scope: &mut Map<String, Value>,
        step: &Step,
    ) -> StepResult<Value>;
}

/// Dispatch table from `type_tag` to handler.
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn StepHandler>>,
}

impl HandlerRegistry {
    /// Registry with every built-in handler installed.
    pub fn with_defaults() -> Self {
        let mut registry = Self {
            handlers: HashMap::new(),
        };
        registry.register("agent_task", Arc::new(AgentTaskHandler));
        registry.register("api_call", Arc::new(ApiCallHandler));
        registry.register("condition", Arc::new(ConditionHandler));
        registry.register("loop", Arc::new(LoopHandler));
        registry.register("parallel", Arc::new(ParallelHandler));
        registry.register("wait", Arc::new(WaitHandler));
        registry.register("transform", Arc::new(TransformHandler));
        registry.register("webhook", Arc::new(WebhookHandler));
        registry.register("notification", Arc::new(NotificationHandler));
        registry
    }

    /// Install or replace a handler.
    pub fn register(&mut self, type_tag: impl Into<String>, handler: Arc<dyn StepHandler>) {
        self.handlers.insert(type_tag.into(), handler);
    }

    /// Registered type tags, for workflow validation.
    pub fn known_types(&self) -> HashSet<String> {
        self.handlers.keys().cloned().collect()
    }

    /// Dispatch one step to its handler.
    pub async fn run(
        &self,
        env: &HandlerEnv,
        scope: &mut Map<String, Value>,
        step: &Step,
    ) -> StepResult<Value> {
        let handler = self
            .handlers
            .get(&step.step_type)
            .ok_or_else(|| StepError::failed(format!("unknown step type '{}'", step.step_type)))?;
        debug!(step = %step.id, step_type = %step.step_type, "running step handler");
        handler.execute(self, env, scope, step).await
    }
}

// Config accessors shared by the handlers.

fn required_str<'a>(config: &'a Value, key: &str) -> StepResult<&'a str> {
    config
        .get(key)
        .and_then(|v| v.as_str())
        .ok_or_else(|| StepError::failed(format!("missing required config key '{key}'")))
}

fn required_value<'a>(config: &'a Value, key: &str) -> StepResult<&'a Value> {
    config
        .get(key)
        .ok_or_else(|| StepError::failed(format!("missing required config key '{key}'")))
}

fn nested_steps(config: &Value) -> StepResult<Vec<Step>> {
    let raw = config
        .get("steps")
        .and_then(|v| v.as_array())
        .ok_or_else(|| StepError::failed("missing nested 'steps'"))?;
    raw.iter()
        .map(|v| {
            serde_json::from_value(v.clone())
                .map_err(|e| StepError::failed(format!("invalid nested step: {e}")))
        })
        .collect()
}

struct AgentTaskHandler;

#[async_trait]
impl StepHandler for AgentTaskHandler {
    async fn execute(
        &self,
        _registry: &HandlerRegistry,
        env: &HandlerEnv,
        scope: &mut Map<String, Value>,
        step: &Step,
    ) -> StepResult<Value> {
        let agent_id = required_str(&step.config, "agent_id")?;
        let task = interpolate_str(required_str(&step.config, "task")?, scope);

        let call = env.agents.send_message(
            agent_id,
            &task,
            json!({
                "execution_id": env.execution_id,
                "workflow_id": env.workflow_id,
                "step_id": step.id,
            }),
        );
        tokio::select! {
            outcome = call => {
                let outcome = outcome.map_err(|e| StepError::failed(e.to_string()))?;
                serde_json::to_value(&outcome).map_err(|e| StepError::failed(e.to_string()))
            }
            _ = await_cancelled(&env.cancel) => Err(StepError::Cancelled),
        }
    }
}

struct ApiCallHandler;

#[async_trait]
impl StepHandler for ApiCallHandler {
    async fn execute(
        &self,
        _registry: &HandlerRegistry,
        env: &HandlerEnv,
        scope: &mut Map<String, Value>,
        step: &Step,
    ) -> StepResult<Value> {
        let url = interpolate_str(required_str(&step.config, "url")?, scope);
        let method = step
            .config
            .get("method")
            .and_then(|v| v.as_str())
            .unwrap_or("GET")
            .to_uppercase();

        let mut request = match method.as_str() {
            "GET" => env.http.get(&url),
            "POST" => env.http.post(&url),
            "PUT" => env.http.put(&url),
            "DELETE" => env.http.delete(&url),
            other => return Err(StepError::failed(format!("unsupported method '{other}'"))),
        };

        if let Some(headers) = step.config.get("headers").and_then(|v| v.as_object()) {
            for (name, value) in headers {
                if let Some(value) = value.as_str() {
                    request = request.header(name, value);
                }
            }
        }
        if let Some(data) = step.config.get("data") {
            request = request.json(&interpolate(data, scope));
        }

        let call = async move {
            let response = request
                .send()
                .await
                .map_err(|e| StepError::failed(format!("request failed: {e}")))?;

            let status = response.status().as_u16();
            let headers: Map<String, Value> = response
                .headers()
                .iter()
                .map(|(name, value)| {
                    (
                        name.to_string(),
                        Value::String(value.to_str().unwrap_or_default().to_string()),
                    )
                })
                .collect();

            if status >= 400 {
                return Err(StepError::failed(format!("api call returned status {status}")));
            }

            let text = response
                .text()
                .await
                .map_err(|e| StepError::failed(e.to_string()))?;
            let data = serde_json::from_str::<Value>(&text).unwrap_or(Value::String(text));

            Ok(json!({"status_code": status, "headers": headers, "data": data}))
        };
        tokio::select! {
            result = call => result,
            _ = await_cancelled(&env.cancel) => Err(StepError::Cancelled),
        }
    }
}

struct ConditionHandler;

#[async_trait]
impl StepHandler for ConditionHandler {
    async fn execute(
        &self,
        _registry: &HandlerRegistry,
        _env: &HandlerEnv,
        scope: &mut Map<String, Value>,
        step: &Step,
    ) -> StepResult<Value> {
        let condition = required_str(&step.config, "condition")?;
        Ok(json!({"condition_result": evaluate(condition, scope)}))
    }
}

struct LoopHandler;

#[async_trait]
impl StepHandler for LoopHandler {
    async fn execute(
        &self,
        registry: &HandlerRegistry,
        env: &HandlerEnv,
        scope: &mut Map<String, Value>,
        step: &Step,
    ) -> StepResult<Value> {
        let items = interpolate(required_value(&step.config, "items")?, scope);
        let Value::Array(items) = items else {
            return Err(StepError::failed("loop items must resolve to a sequence"));
        };
        let steps = nested_steps(&step.config)?;

        let mut results = Vec::new();
        for (index, item) in items.iter().enumerate() {
            // Child scope per iteration; only output_variable writes escape.
            let mut child = scope.clone();
            child.insert("loop_item".to_string(), item.clone());
            child.insert("loop_index".to_string(), Value::from(index));

            for nested in &steps {
                let value = registry.run(env, &mut child, nested).await?;
                if let Some(name) = &nested.output_variable {
                    child.insert(name.clone(), value.clone());
                    scope.insert(name.clone(), value.clone());
                }
                results.push(value);
            }
        }

        Ok(json!({"loop_results": results}))
    }
}

struct ParallelHandler;

#[async_trait]
impl StepHandler for ParallelHandler {
    async fn execute(
        &self,
        registry: &HandlerRegistry,
        env: &HandlerEnv,
        scope: &mut Map<String, Value>,
        step: &Step,
    ) -> StepResult<Value> {
        let steps = nested_steps(&step.config)?;
        let semaphore = Arc::new(Semaphore::new(env.max_parallel.max(1)));

        let futures = steps.iter().map(|nested| {
            let semaphore = Arc::clone(&semaphore);
            let mut child = scope.clone();
            async move {
                let _permit = semaphore
                    .acquire()
                    .await
                    .map_err(|_| StepError::failed("concurrency limiter closed"))?;
                let value = registry.run(env, &mut child, nested).await?;
                Ok::<(Option<String>, Value), StepError>((nested.output_variable.clone(), value))
            }
        });

        // join_all preserves definition order in the collected results even
        // though completion order is unspecified.
        let outcomes = join_all(futures).await;
        let mut results = Vec::with_capacity(outcomes.len());
        for outcome in outcomes {
            let (output_variable, value) = outcome?;
            if let Some(name) = output_variable {
                scope.insert(name, value.clone());
            }
            results.push(value);
        }

        Ok(json!({"parallel_results": results}))
    }
}

struct WaitHandler;

#[async_trait]
impl StepHandler for WaitHandler {
    async fn execute(
        &self,
        _registry: &HandlerRegistry,
        env: &HandlerEnv,
        _scope: &mut Map<String, Value>,
        step: &Step,
    ) -> StepResult<Value> {
        let duration = required_value(&step.config, "duration")?
            .as_f64()
            .ok_or_else(|| StepError::failed("duration must be a number of seconds"))?;
        if duration < 0.0 {
            return Err(StepError::failed("duration must be non-negative"));
        }
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_secs_f64(duration)) => {
                Ok(json!({"waited": duration}))
            }
            _ = await_cancelled(&env.cancel) => Err(StepError::Cancelled),
        }
    }
}

struct TransformHandler;

#[async_trait]
impl StepHandler for TransformHandler {
    async fn execute(
        &self,
        _registry: &HandlerRegistry,
        _env: &HandlerEnv,
        scope: &mut Map<String, Value>,
        step: &Step,
    ) -> StepResult<Value> {
        let transform_type = required_str(&step.config, "type")?;
        let input = interpolate(required_value(&step.config, "input")?, scope);

        let transformed = match transform_type {
            "json_parse" => {
                let text = input
                    .as_str()
                    .ok_or_else(|| StepError::failed("json_parse input must be a string"))?;
                serde_json::from_str::<Value>(text)
                    .map_err(|e| StepError::failed(format!("json_parse failed: {e}")))?
            }
            "json_stringify" => Value::String(
                serde_json::to_string(&input).map_err(|e| StepError::failed(e.to_string()))?,
            ),
            "template" => {
                let template = required_str(&step.config, "template")?;
                let mut child = scope.clone();
                child.insert("input".to_string(), input);
                Value::String(interpolate_str(template, &child))
            }
            other => return Err(StepError::failed(format!("unknown transform type '{other}'"))),
        };

        Ok(json!({"transformed": transformed}))
    }
}

struct WebhookHandler;

#[async_trait]
impl StepHandler for WebhookHandler {
    async fn execute(
        &self,
        _registry: &HandlerRegistry,
        env: &HandlerEnv,
        scope: &mut Map<String, Value>,
        step: &Step,
    ) -> StepResult<Value> {
        let url = interpolate_str(required_str(&step.config, "url")?, scope);
        let payload = interpolate(
            step.config.get("payload").unwrap_or(&Value::Null),
            scope,
        );

        let request = env.http.post(&url).json(&payload);
        let call = async move {
            let response = request
                .send()
                .await
                .map_err(|e| StepError::failed(format!("webhook failed: {e}")))?;

            let status = response.status().as_u16();
            if status >= 400 {
                return Err(StepError::failed(format!("webhook returned status {status}")));
            }
            let text = response
                .text()
                .await
                .map_err(|e| StepError::failed(e.to_string()))?;
            let body = serde_json::from_str::<Value>(&text).unwrap_or(Value::String(text));

            Ok(json!({"status_code": status, "response": body}))
        };
        tokio::select! {
            result = call => result,
            _ = await_cancelled(&env.cancel) => Err(StepError::Cancelled),
        }
    }
}

struct NotificationHandler;

#[async_trait]
impl StepHandler for NotificationHandler {
    async fn execute(
        &self,
        _registry: &HandlerRegistry,
        env: &HandlerEnv,
        scope: &mut Map<String, Value>,
        step: &Step,
    ) -> StepResult<Value> {
        let message = interpolate_str(required_str(&step.config, "message")?, scope);
        let notification_type = step
            .config
            .get("type")
            .and_then(|v| v.as_str())
            .unwrap_or("info")
            .to_string();

        let notification = BusMessage::new(
            MessageType::Notification,
            WindowType::Chat,
            json!({
                "type": notification_type,
                "message": message,
                "workflow_id": env.workflow_id,
                "execution_id": env.execution_id,
            }),
        )
        .with_user(env.user_id.clone());
        env.bus.broadcast_to_user(&env.user_id, &notification).await;

        Ok(json!({"notification_sent": true, "type": notification_type}))
    }
}

// ---------------------------------------------------------------------------
// Visual node execution.
//
// Visual nodes pull inputs from named upstream nodes instead of the shared
// scope; failures are embedded in the result value so downstream nodes can
// still observe them.

/// Execute one visual node against its gathered inputs. Never fails; errors
/// are reported through `success: false` in the returned value.
pub async fn run_visual_node(
    env: &HandlerEnv,
    node: &Node,
    input_data: &Map<String, Value>,
    variables: &Map<String, Value>,
) -> Value {
    match node.node_type.as_str() {
        "ai_agent" => run_ai_agent_node(env, node, input_data).await,
        "condition" => {
            let condition = node
                .config
                .get("condition")
                .and_then(|v| v.as_str())
                .unwrap_or_default();
            let result = evaluate(condition, input_data);
            json!({"content": result.to_string(), "success": true, "condition_result": result})
        }
        "transform" => run_transform_node(node, input_data),
        "api_call" => run_api_call_node(env, node, variables).await,
        "user_input" => {
            let input_type = node
                .config
                .get("input_type")
                .and_then(|v| v.as_str())
                .unwrap_or("text");
            let content = variables
                .get("user_input")
                .cloned()
                .unwrap_or_else(|| Value::String("Default input".to_string()));
            json!({"content": content, "success": true, "input_type": input_type})
        }
        "output" => run_output_node(node, input_data),
        other => json!({"content": format!("Unknown node type: {other}"), "success": false}),
    }
}

/// Gather a node's input map from upstream results, keyed as its
/// `input_sources` prescribe.
pub fn gather_node_inputs(
    node: &Node,
    results: &HashMap<String, Value>,
) -> Map<String, Value> {
    let mut input_data = Map::new();
    for source in &node.input_sources {
        if let Some(result) = results.get(&source.node_id) {
            let key = source.key.clone().unwrap_or_else(|| source.node_id.clone());
            let content = result.get("content").cloned().unwrap_or(Value::Null);
            input_data.insert(key, content);
        }
    }
    input_data
}

// Single-input nodes see their one upstream value; multi-input nodes see
// the whole map.
fn primary_input(input_data: &Map<String, Value>) -> Value {
    if input_data.len() == 1 {
        input_data.values().next().cloned().unwrap_or(Value::Null)
    } else {
        Value::Object(input_data.clone())
    }
}

async fn run_ai_agent_node(env: &HandlerEnv, node: &Node, input_data: &Map<String, Value>) -> Value {
    let agent_id = node
        .config
        .get("agent_id")
        .and_then(|v| v.as_str())
        .unwrap_or_default();
    let template = node
        .config
        .get("message")
        .and_then(|v| v.as_str())
        .unwrap_or_default();
    let message = interpolate_str(template, input_data);

    match env
        .agents
        .send_message(
            agent_id,
            &message,
            json!({
                "workflow_id": env.workflow_id,
                "node_id": node.id,
                "node_type": "ai_agent",
            }),
        )
        .await
    {
        Ok(outcome) => json!({
            "content": outcome.response,
            "metadata": outcome.metadata,
            "success": true,
            "agent_id": agent_id,
        }),
        Err(err) => {
            error!(node = %node.id, error = %err, "ai_agent node failed");
            json!({
                "content": format!("AI agent execution failed: {err}"),
                "success": false,
                "error": err.to_string(),
            })
        }
    }
}

fn run_transform_node(node: &Node, input_data: &Map<String, Value>) -> Value {
    let transform_type = node
        .config
        .get("transform_type")
        .and_then(|v| v.as_str())
        .unwrap_or("text");
    let input = primary_input(input_data);

    let content = match transform_type {
        "text" => {
            let operation = node
                .config
                .get("operation")
                .and_then(|v| v.as_str())
                .unwrap_or("identity");
            let text = value_to_string(&input);
            Value::String(match operation {
                "uppercase" => text.to_uppercase(),
                "lowercase" => text.to_lowercase(),
                "capitalize" => {
                    let mut chars = text.chars();
                    match chars.next() {
                        Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
                        None => text,
                    }
                }
                "trim" => text.trim().to_string(),
                _ => text,
            })
        }
        "json" => {
            let operation = node
                .config
                .get("operation")
                .and_then(|v| v.as_str())
                .unwrap_or("identity");
            let data = match &input {
                Value::String(text) => {
                    serde_json::from_str::<Value>(text).unwrap_or_else(|_| input.clone())
                }
                other => other.clone(),
            };
            match operation {
                "extract" => {
                    let path = node.config.get("path").and_then(|v| v.as_str()).unwrap_or("");
                    extract_json_path(&data, path)
                }
                "flatten" => Value::Object(flatten_json(&data, "")),
                _ => data,
            }
        }
        "format" => {
            let format_type = node
                .config
                .get("format_type")
                .and_then(|v| v.as_str())
                .unwrap_or("text");
            let text = value_to_string(&input);
            Value::String(match format_type {
                "markdown" => format!("# {text}"),
                "html" => format!("<p>{text}</p>"),
                "json" => serde_json::to_string_pretty(&input).unwrap_or(text),
                _ => text,
            })
        }
        "template" => {
            let template = node
                .config
                .get("template")
                .and_then(|v| v.as_str())
                .unwrap_or_default();
            Value::String(interpolate_str(template, input_data))
        }
        _ => input,
    };

    json!({"content": content, "success": true, "transform_type": transform_type})
}

async fn run_api_call_node(env: &HandlerEnv, node: &Node, variables: &Map<String, Value>) -> Value {
    let url = interpolate_str(
        node.config.get("url").and_then(|v| v.as_str()).unwrap_or_default(),
        variables,
    );
    let method = node
        .config
        .get("method")
        .and_then(|v| v.as_str())
        .unwrap_or("GET")
        .to_uppercase();
    let body = interpolate(node.config.get("body").unwrap_or(&Value::Null), variables);

    let request = match method.as_str() {
        "GET" => env.http.get(&url),
        "POST" => env.http.post(&url).json(&body),
        other => {
            return json!({
                "content": format!("Unsupported HTTP method: {other}"),
                "success": false,
            })
        }
    };

    match request.send().await {
        Ok(response) => {
            let status = response.status().as_u16();
            let text = response.text().await.unwrap_or_default();
            let content = serde_json::from_str::<Value>(&text).unwrap_or(Value::String(text));
            json!({"content": content, "success": status == 200, "status_code": status})
        }
        Err(err) => json!({
            "content": format!("API call failed: {err}"),
            "success": false,
            "error": err.to_string(),
        }),
    }
}

fn run_output_node(node: &Node, input_data: &Map<String, Value>) -> Value {
    let output_format = node
        .config
        .get("output_format")
        .and_then(|v| v.as_str())
        .unwrap_or("text");
    let input = primary_input(input_data);

    let content = match output_format {
        "json" => Value::String(
            serde_json::to_string_pretty(&input).unwrap_or_else(|_| value_to_string(&input)),
        ),
        "text" => Value::String(value_to_string(&input)),
        _ => input,
    };

    json!({"content": content, "success": true, "output_format": output_format})
}

fn extract_json_path(data: &Value, path: &str) -> Value {
    if path.is_empty() {
        return data.clone();
    }
    let mut current = data;
    for key in path.split('.') {
        match current.get(key) {
            Some(next) => current = next,
            None => return Value::Null,
        }
    }
    current.clone()
}

fn flatten_json(data: &Value, prefix: &str) -> Map<String, Value> {
    let mut flat = Map::new();
    match data {
        Value::Object(map) => {
            for (key, value) in map {
                let nested_prefix = if prefix.is_empty() {
                    key.clone()
                } else {
                    format!("{prefix}.{key}")
                };
                flat.extend(flatten_json(value, &nested_prefix));
            }
        }
        Value::Array(items) => {
            for (index, value) in items.iter().enumerate() {
                let nested_prefix = if prefix.is_empty() {
                    format!("[{index}]")
                } else {
                    format!("{prefix}[{index}]")
                };
                flat.extend(flatten_json(value, &nested_prefix));
            }
        }
        other => {
            flat.insert(prefix.to_string(), other.clone());
        }
    }
    flat
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::InputSource;
    use agents::AgentBrain;
    use audit::AuditSink;

    fn test_env() -> HandlerEnv {
        let brain = Arc::new(AgentBrain::new(None, None));
        let bus = Arc::new(FanoutBus::new());
        let audit = Arc::new(AuditSink::new(false));
        // The sender is dropped; a closed channel never signals cancellation.
        let (_cancel_tx, cancel) = watch::channel(false);
        HandlerEnv {
            agents: Arc::new(AgentManager::new(brain, Arc::clone(&bus), audit)),
            bus,
            http: reqwest::Client::new(),
            execution_id: "e1".to_string(),
            workflow_id: "w1".to_string(),
            user_id: "u1".to_string(),
            max_parallel: 5,
            cancel,
        }
    }

    fn step(step_type: &str, config: Value) -> Step {
        Step {
            id: "s1".to_string(),
            step_type: step_type.to_string(),
            config,
            on_failure: None,
            condition: None,
            output_variable: None,
        }
    }

    #[tokio::test]
    async fn test_transform_template() {
        let registry = HandlerRegistry::with_defaults();
        let env = test_env();
        let mut scope = Map::new();

        let result = registry
            .run(
                &env,
                &mut scope,
                &step(
                    "transform",
                    json!({"type": "template", "input": "hi", "template": "say ${input}"}),
                ),
            )
            .await
            .unwrap();
        assert_eq!(result, json!({"transformed": "say hi"}));
    }

    #[tokio::test]
    async fn test_transform_json_round() {
        let registry = HandlerRegistry::with_defaults();
        let env = test_env();
        let mut scope = Map::new();

        let parsed = registry
            .run(
                &env,
                &mut scope,
                &step("transform", json!({"type": "json_parse", "input": "{\"a\": 1}"})),
            )
            .await
            .unwrap();
        assert_eq!(parsed["transformed"]["a"], 1);

        let stringified = registry
            .run(
                &env,
                &mut scope,
                &step("transform", json!({"type": "json_stringify", "input": {"a": 1}})),
            )
            .await
            .unwrap();
        assert_eq!(stringified["transformed"], "{\"a\":1}");
    }

    #[tokio::test]
    async fn test_condition_handler() {
        let registry = HandlerRegistry::with_defaults();
        let env = test_env();
        let mut scope = Map::new();
        scope.insert("greeting".to_string(), json!("say hi"));

        let result = registry
            .run(
                &env,
                &mut scope,
                &step("condition", json!({"condition": "greeting contains say"})),
            )
            .await
            .unwrap();
        assert_eq!(result, json!({"condition_result": true}));
    }

    #[tokio::test]
    async fn test_loop_empty_sequence() {
        let registry = HandlerRegistry::with_defaults();
        let env = test_env();
        let mut scope = Map::new();
        scope.insert("xs".to_string(), json!([]));

        let result = registry
            .run(
                &env,
                &mut scope,
                &step(
                    "loop",
                    json!({
                        "items": "${xs}",
                        "steps": [{"id": "n", "type": "wait", "config": {"duration": 60.0}}],
                    }),
                ),
            )
            .await
            .unwrap();
        // Nested steps are never invoked for an empty sequence.
        assert_eq!(result, json!({"loop_results": []}));
    }

    #[tokio::test]
    async fn test_loop_child_scope_and_exports() {
        let registry = HandlerRegistry::with_defaults();
        let env = test_env();
        let mut scope = Map::new();
        scope.insert("xs".to_string(), json!(["a", "b"]));

        let result = registry
            .run(
                &env,
                &mut scope,
                &step(
                    "loop",
                    json!({
                        "items": "${xs}",
                        "steps": [{
                            "id": "n",
                            "type": "transform",
                            "config": {"type": "template", "input": "${loop_item}", "template": "${loop_index}:${input}"},
                            "output_variable": "last",
                        }],
                    }),
                ),
            )
            .await
            .unwrap();

        let results = result["loop_results"].as_array().unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0]["transformed"], "0:a");
        assert_eq!(results[1]["transformed"], "1:b");
        // loop_item stayed in the child scope; the explicit export escaped.
        assert!(scope.get("loop_item").is_none());
        assert_eq!(scope["last"]["transformed"], "1:b");
    }

    #[tokio::test]
    async fn test_loop_rejects_non_sequence() {
        let registry = HandlerRegistry::with_defaults();
        let env = test_env();
        let mut scope = Map::new();
        scope.insert("xs".to_string(), json!("not a list"));

        let err = registry
            .run(
                &env,
                &mut scope,
                &step("loop", json!({"items": "${xs}", "steps": []})),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StepError::Failed(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_parallel_preserves_order() {
        let registry = HandlerRegistry::with_defaults();
        let env = test_env();
        let mut scope = Map::new();

        let result = registry
            .run(
                &env,
                &mut scope,
                &step(
                    "parallel",
                    json!({
                        "steps": [
                            {"id": "slow", "type": "wait", "config": {"duration": 0.2}},
                            {"id": "fast", "type": "wait", "config": {"duration": 0.05}},
                        ],
                    }),
                ),
            )
            .await
            .unwrap();

        let results = result["parallel_results"].as_array().unwrap();
        assert_eq!(results[0]["waited"], 0.2);
        assert_eq!(results[1]["waited"], 0.05);
    }

    #[tokio::test]
    async fn test_missing_required_config() {
        let registry = HandlerRegistry::with_defaults();
        let env = test_env();
        let mut scope = Map::new();

        for (step_type, config) in [
            ("agent_task", json!({})),
            ("api_call", json!({})),
            ("condition", json!({})),
            ("transform", json!({"type": "template"})),
            ("wait", json!({})),
        ] {
            let err = registry
                .run(&env, &mut scope, &step(step_type, config))
                .await
                .unwrap_err();
            assert!(matches!(err, StepError::Failed(_)), "{step_type}");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_cancelled_mid_flight() {
        let registry = HandlerRegistry::with_defaults();
        let mut env = test_env();
        let (cancel_tx, cancel_rx) = watch::channel(false);
        env.cancel = cancel_rx;

        let signal = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            let _ = cancel_tx.send(true);
        });

        let mut scope = Map::new();
        let err = registry
            .run(&env, &mut scope, &step("wait", json!({"duration": 60.0})))
            .await
            .unwrap_err();
        assert!(matches!(err, StepError::Cancelled));
        signal.await.unwrap();
    }

    #[tokio::test]
    async fn test_unknown_step_type() {
        let registry = HandlerRegistry::with_defaults();
        let env = test_env();
        let mut scope = Map::new();
        let err = registry
            .run(&env, &mut scope, &step("teleport", json!({})))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("unknown step type"));
    }

    #[test]
    fn test_gather_node_inputs() {
        let node = Node {
            id: "b".to_string(),
            node_type: "transform".to_string(),
            config: Value::Null,
            input_sources: vec![InputSource {
                node_id: "a".to_string(),
                key: Some("x".to_string()),
            }],
        };
        let mut results = HashMap::new();
        results.insert("a".to_string(), json!({"content": "X", "success": true}));

        let inputs = gather_node_inputs(&node, &results);
        assert_eq!(inputs["x"], "X");
    }

    #[tokio::test]
    async fn test_visual_transform_template_node() {
        let env = test_env();
        let node = Node {
            id: "b".to_string(),
            node_type: "transform".to_string(),
            config: json!({"transform_type": "template", "template": "${a}Y"}),
            input_sources: vec![InputSource {
                node_id: "a".to_string(),
                key: Some("a".to_string()),
            }],
        };
        let mut inputs = Map::new();
        inputs.insert("a".to_string(), json!("X"));

        let result = run_visual_node(&env, &node, &inputs, &Map::new()).await;
        assert_eq!(result["content"], "XY");
        assert_eq!(result["success"], true);
    }

    #[tokio::test]
    async fn test_visual_output_node_single_input() {
        let env = test_env();
        let node = Node {
            id: "c".to_string(),
            node_type: "output".to_string(),
            config: json!({"output_format": "text"}),
            input_sources: vec![InputSource {
                node_id: "b".to_string(),
                key: None,
            }],
        };
        let mut inputs = Map::new();
        inputs.insert("b".to_string(), json!("XY"));

        let result = run_visual_node(&env, &node, &inputs, &Map::new()).await;
        assert_eq!(result["content"], "XY");
    }

    #[tokio::test]
    async fn test_visual_unknown_node_type() {
        let env = test_env();
        let node = Node {
            id: "x".to_string(),
            node_type: "mystery".to_string(),
            config: Value::Null,
            input_sources: Vec::new(),
        };
        let result = run_visual_node(&env, &node, &Map::new(), &Map::new()).await;
        assert_eq!(result["success"], false);
    }

    #[test]
    fn test_json_path_and_flatten() {
        let data = json!({"a": {"b": {"c": 7}}, "list": [1, 2]});
        assert_eq!(extract_json_path(&data, "a.b.c"), json!(7));
        assert_eq!(extract_json_path(&data, "a.missing"), Value::Null);

        let flat = flatten_json(&data, "");
        assert_eq!(flat["a.b.c"], json!(7));
        assert_eq!(flat["list[0]"], json!(1));
    }
}
