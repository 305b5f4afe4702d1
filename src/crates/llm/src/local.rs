//! Local LLM adapter.
//!
//! Probes a fixed set of candidate endpoints, one per local runtime family,
//! enumerates the models each serves, and keeps the catalogue fresh with a
//! background health loop. Generation against a model that is not `ready`
//! fails fast instead of hanging on a dead runtime.

use crate::config::{LocalLlmConfig, RuntimeKind};
use crate::error::{LlmError, Result};
use crate::types::{CompletionRequest, CompletionResponse, Provider, ProviderKind};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Health of one discovered model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelStatus {
    /// Serving requests.
    Ready,
    /// Last probe or generation failed.
    Error,
}

/// Catalogue entry for one discovered model.
#[derive(Debug, Clone, Serialize)]
pub struct ModelEntry {
    /// Model name as reported by the runtime.
    pub name: String,
    /// Runtime family serving the model.
    pub runtime: RuntimeKind,
    /// Base URL of the serving endpoint.
    pub base_url: String,
    /// Current health.
    pub status: ModelStatus,
    /// Last successful generation through this model.
    pub last_used: Option<DateTime<Utc>>,
}

/// Client multiplexing over locally running LLM runtimes.
pub struct LocalClient {
    config: LocalLlmConfig,
    http: Client,
    models: DashMap<String, ModelEntry>,
    health_task: Mutex<Option<JoinHandle<()>>>,
}

impl LocalClient {
    /// Create a client. Call [`LocalClient::discover`] before generating.
    pub fn new(config: LocalLlmConfig) -> Result<Self> {
        let http = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| LlmError::Config(e.to_string()))?;

        Ok(Self {
            config,
            http,
            models: DashMap::new(),
            health_task: Mutex::new(None),
        })
    }

    /// Probe every candidate endpoint and refresh the model catalogue.
    pub async fn discover(&self) -> usize {
        for endpoint in &self.config.endpoints {
            match self.probe_endpoint(endpoint.kind, &endpoint.base_url).await {
                Ok(names) => {
                    debug!(
                        runtime = %endpoint.kind,
                        models = names.len(),
                        "endpoint responded"
                    );
                    for name in names {
                        let entry = ModelEntry {
                            name: name.clone(),
                            runtime: endpoint.kind,
                            base_url: endpoint.base_url.clone(),
                            status: ModelStatus::Ready,
                            last_used: self
                                .models
                                .get(&name)
                                .and_then(|existing| existing.last_used),
                        };
                        self.models.insert(name, entry);
                    }
                }
                Err(err) => {
                    debug!(runtime = %endpoint.kind, error = %err, "endpoint not available");
                    // Models previously discovered on this endpoint go to error.
                    for mut entry in self.models.iter_mut() {
                        if entry.base_url == endpoint.base_url {
                            entry.status = ModelStatus::Error;
                        }
                    }
                }
            }
        }

        let ready = self.ready_count();
        info!(ready, total = self.models.len(), "local model discovery complete");
        ready
    }

    /// Start the background health loop. Idempotent; a second call replaces
    /// nothing and the running task keeps its interval.
    pub fn start_health_loop(self: Arc<Self>) {
        let mut guard = self.health_task.lock();
        if guard.is_some() {
            return;
        }
        let client = Arc::clone(&self);
        let interval = self.config.health_interval;
        *guard = Some(tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                client.discover().await;
            }
        }));
    }

    /// Stop the health loop. Idempotent.
    pub fn stop(&self) {
        if let Some(task) = self.health_task.lock().take() {
            task.abort();
        }
    }

    /// Snapshot of the model catalogue.
    pub fn available_models(&self) -> Vec<ModelEntry> {
        self.models.iter().map(|entry| entry.clone()).collect()
    }

    /// Status of a single model, if discovered.
    pub fn model_status(&self, name: &str) -> Option<ModelStatus> {
        self.models.get(name).map(|entry| entry.status)
    }

    fn ready_count(&self) -> usize {
        self.models
            .iter()
            .filter(|entry| entry.status == ModelStatus::Ready)
            .count()
    }

    /// First ready model name, used as the default when a request does not
    /// name one.
    pub fn default_model(&self) -> Option<String> {
        self.models
            .iter()
            .find(|entry| entry.status == ModelStatus::Ready)
            .map(|entry| entry.name.clone())
    }

    async fn probe_endpoint(&self, kind: RuntimeKind, base_url: &str) -> Result<Vec<String>> {
        match kind {
            RuntimeKind::Ollama => {
                let url = format!("{base_url}/api/tags");
                let response = self.http.get(&url).send().await.map_err(LlmError::from)?;
                if !response.status().is_success() {
                    return Err(LlmError::Unreachable(format!(
                        "ollama probe returned {}",
                        response.status()
                    )));
                }
                let tags: OllamaTags = response.json().await?;
                Ok(tags.models.into_iter().map(|m| m.name).collect())
            }
            RuntimeKind::LlamaCpp | RuntimeKind::LmStudio => {
                let url = format!("{base_url}/v1/models");
                let response = self.http.get(&url).send().await.map_err(LlmError::from)?;
                if !response.status().is_success() {
                    return Err(LlmError::Unreachable(format!(
                        "{kind} probe returned {}",
                        response.status()
                    )));
                }
                let listing: OpenAiModelList = response.json().await?;
                Ok(listing.data.into_iter().map(|m| m.id).collect())
            }
        }
    }

    async fn generate_ollama(
        &self,
        entry: &ModelEntry,
        request: &CompletionRequest,
    ) -> Result<(String, usize, String)> {
        let url = format!("{}/api/chat", entry.base_url);
        let body = OllamaChatBody {
            model: entry.name.clone(),
            messages: request
                .messages()
                .iter()
                .map(|turn| OllamaMessage {
                    role: turn.role.as_str().to_string(),
                    content: turn.content.clone(),
                })
                .collect(),
            stream: false,
            options: OllamaOptions {
                temperature: request.temperature,
                top_p: request.top_p,
                num_predict: request.max_tokens,
            },
        };

        let response = self.http.post(&url).json(&body).send().await.map_err(LlmError::from)?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            return Err(match status {
                500 | 502 | 503 | 504 => LlmError::ServerTransient { status },
                _ => LlmError::InvalidResponse(format!("ollama returned {status}")),
            });
        }

        let reply: OllamaChatReply = response.json().await?;
        let tokens =
            reply.prompt_eval_count.unwrap_or(0) + reply.eval_count.unwrap_or(0);
        Ok((reply.message.content, tokens, "stop".to_string()))
    }

    async fn generate_openai_compat(
        &self,
        entry: &ModelEntry,
        request: &CompletionRequest,
    ) -> Result<(String, usize, String)> {
        let url = format!("{}/v1/chat/completions", entry.base_url);
        let body = OpenAiCompatBody {
            model: entry.name.clone(),
            messages: request
                .messages()
                .iter()
                .map(|turn| OllamaMessage {
                    role: turn.role.as_str().to_string(),
                    content: turn.content.clone(),
                })
                .collect(),
            max_tokens: request.max_tokens,
            temperature: request.temperature,
            top_p: request.top_p,
            stream: false,
        };

        let response = self.http.post(&url).json(&body).send().await.map_err(LlmError::from)?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            return Err(match status {
                500 | 502 | 503 | 504 => LlmError::ServerTransient { status },
                _ => LlmError::InvalidResponse(format!("{} returned {status}", entry.runtime)),
            });
        }

        let reply: OpenAiCompatReply = response.json().await?;
        let choice = reply
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| LlmError::InvalidResponse("no choices".to_string()))?;
        let tokens = reply.usage.map(|u| u.total_tokens).unwrap_or(0);
        Ok((
            choice.message.content,
            tokens,
            choice.finish_reason.unwrap_or_else(|| "stop".to_string()),
        ))
    }
}

#[async_trait]
impl Provider for LocalClient {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Local
    }

    async fn generate(&self, request: CompletionRequest) -> Result<CompletionResponse> {
        let started = Instant::now();
        let model = if request.model.is_empty() {
            self.default_model().ok_or_else(|| LlmError::NotReady {
                model: "<default>".to_string(),
            })?
        } else {
            request.model.clone()
        };

        let entry = match self.models.get(&model) {
            Some(entry) if entry.status == ModelStatus::Ready => entry.clone(),
            _ => return Err(LlmError::NotReady { model }),
        };

        let outcome = match entry.runtime {
            RuntimeKind::Ollama => self.generate_ollama(&entry, &request).await,
            RuntimeKind::LlamaCpp | RuntimeKind::LmStudio => {
                self.generate_openai_compat(&entry, &request).await
            }
        };

        match outcome {
            Ok((content, tokens_used, finish_reason)) => {
                if let Some(mut stored) = self.models.get_mut(&model) {
                    stored.last_used = Some(Utc::now());
                }
                let mut metadata = HashMap::new();
                metadata.insert(
                    "runtime".to_string(),
                    serde_json::Value::String(entry.runtime.as_str().to_string()),
                );
                Ok(CompletionResponse {
                    content,
                    model,
                    tokens_used,
                    finish_reason,
                    processing_time: started.elapsed().as_secs_f64(),
                    metadata,
                })
            }
            Err(err) => {
                warn!(model = %model, error = %err, "local generation failed");
                if let Some(mut stored) = self.models.get_mut(&model) {
                    stored.status = ModelStatus::Error;
                }
                Err(err)
            }
        }
    }

    async fn is_available(&self) -> bool {
        self.ready_count() > 0
    }
}

// Wire types for the local runtimes.

#[derive(Debug, Deserialize)]
struct OllamaTags {
    models: Vec<OllamaTagEntry>,
}

#[derive(Debug, Deserialize)]
struct OllamaTagEntry {
    name: String,
}

#[derive(Debug, Deserialize)]
struct OpenAiModelList {
    data: Vec<OpenAiModelEntry>,
}

#[derive(Debug, Deserialize)]
struct OpenAiModelEntry {
    id: String,
}

#[derive(Debug, Serialize)]
struct OllamaChatBody {
    model: String,
    messages: Vec<OllamaMessage>,
    stream: bool,
    options: OllamaOptions,
}

#[derive(Debug, Serialize)]
struct OllamaOptions {
    temperature: f32,
    top_p: f32,
    num_predict: usize,
}

#[derive(Debug, Serialize, Deserialize)]
struct OllamaMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct OllamaChatReply {
    message: OllamaMessage,
    #[serde(default)]
    prompt_eval_count: Option<usize>,
    #[serde(default)]
    eval_count: Option<usize>,
}

#[derive(Debug, Serialize)]
struct OpenAiCompatBody {
    model: String,
    messages: Vec<OllamaMessage>,
    max_tokens: usize,
    temperature: f32,
    top_p: f32,
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct OpenAiCompatReply {
    choices: Vec<OpenAiCompatChoice>,
    usage: Option<OpenAiCompatUsage>,
}

#[derive(Debug, Deserialize)]
struct OpenAiCompatChoice {
    message: OllamaMessage,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenAiCompatUsage {
    total_tokens: usize,
}
