//! Unified completion router over the configured providers.
//!
//! The brain owns persona templates and per-agent conversation memory, picks
//! a provider and model for each request, and wraps the provider response
//! with an advisory confidence score. Fallback to the other provider happens
//! only when the selected one is unavailable *at selection time*; an error
//! returned by a provider is surfaced to the caller untouched.

use crate::error::{AgentError, Result};
use crate::persona::{default_personas, Persona};
use dashmap::DashMap;
use llm::{ChatTurn, CompletionRequest, Provider, ProviderKind};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

/// Default bound on stored conversation turns per agent.
pub const DEFAULT_CONVERSATION_WINDOW: usize = 20;

/// A unified completion request.
#[derive(Debug, Clone)]
pub struct BrainRequest {
    /// Prompt text.
    pub prompt: String,
    /// Agent the conversation memory is keyed by.
    pub agent_id: String,
    /// Optional persona; supplies prompt/model/parameters when set.
    pub persona: Option<Persona>,
    /// Explicit provider override.
    pub provider: Option<ProviderKind>,
    /// Explicit model override.
    pub model: Option<String>,
    /// Extra history appended to the stored window for this call only.
    pub conversation_history: Vec<ChatTurn>,
    /// Caller context carried into response metadata.
    pub context_data: serde_json::Value,
}

impl BrainRequest {
    /// Request with no persona or overrides.
    pub fn new(prompt: impl Into<String>, agent_id: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            agent_id: agent_id.into(),
            persona: None,
            provider: None,
            model: None,
            conversation_history: Vec::new(),
            context_data: serde_json::Value::Null,
        }
    }

    /// Set the persona.
    pub fn with_persona(mut self, persona: Persona) -> Self {
        self.persona = Some(persona);
        self
    }

    /// Force a provider.
    pub fn with_provider(mut self, provider: ProviderKind) -> Self {
        self.provider = Some(provider);
        self
    }

    /// Force a model.
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }
}

/// A unified completion response.
#[derive(Debug, Clone, Serialize)]
pub struct BrainResponse {
    /// Generated text.
    pub content: String,
    /// Provider that served the call.
    pub provider: ProviderKind,
    /// Model that served the call.
    pub model: String,
    /// Agent the call was issued for.
    pub agent_id: String,
    /// Total tokens consumed.
    pub tokens_used: usize,
    /// Wall-clock seconds spent.
    pub processing_time: f64,
    /// Advisory confidence in [0, 1].
    pub confidence: f64,
    /// Provider and selection metadata.
    pub metadata: HashMap<String, serde_json::Value>,
}

/// Rolling per-provider call statistics.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ProviderStats {
    /// Completed requests.
    pub requests: u64,
    /// Failed requests.
    pub errors: u64,
    /// Mean wall-clock seconds per completed request.
    pub avg_response_time: f64,
}

// One slot per agent. The tokio mutex both stores the window and serializes
// calls: at most one completion in flight per agent_id.
struct ConversationSlot {
    turns: tokio::sync::Mutex<Vec<ChatTurn>>,
}

/// Provider-multiplexing completion service with persona and memory.
pub struct AgentBrain {
    remote: Option<Arc<dyn Provider>>,
    local: Option<Arc<dyn Provider>>,
    personas: RwLock<HashMap<String, Persona>>,
    conversations: DashMap<String, Arc<ConversationSlot>>,
    window: usize,
    stats: RwLock<HashMap<ProviderKind, ProviderStats>>,
}

impl AgentBrain {
    /// Create a brain over whichever providers are configured.
    pub fn new(remote: Option<Arc<dyn Provider>>, local: Option<Arc<dyn Provider>>) -> Self {
        let mut personas = HashMap::new();
        for persona in default_personas() {
            personas.insert(persona.name.clone(), persona);
        }
        let mut stats = HashMap::new();
        stats.insert(ProviderKind::Remote, ProviderStats::default());
        stats.insert(ProviderKind::Local, ProviderStats::default());

        Self {
            remote,
            local,
            personas: RwLock::new(personas),
            conversations: DashMap::new(),
            window: DEFAULT_CONVERSATION_WINDOW,
            stats: RwLock::new(stats),
        }
    }

    /// Override the conversation window bound.
    pub fn with_window(mut self, window: usize) -> Self {
        self.window = window.max(1);
        self
    }

    /// Generate a completion for the request.
    pub async fn generate_completion(&self, request: BrainRequest) -> Result<BrainResponse> {
        let started = Instant::now();
        let (kind, provider, substituted) = self.select_provider(&request).await?;
        let model = self.select_model(&request, kind);

        let slot = self
            .conversations
            .entry(request.agent_id.clone())
            .or_insert_with(|| {
                Arc::new(ConversationSlot {
                    turns: tokio::sync::Mutex::new(Vec::new()),
                })
            })
            .clone();

        // Held across the provider call: serializes completions per agent.
        let mut stored = slot.turns.lock().await;

        let mut history: Vec<ChatTurn> = stored.clone();
        history.extend(request.conversation_history.iter().cloned());
        truncate_window(&mut history, self.window);

        let persona = request.persona.as_ref();
        let completion = CompletionRequest {
            prompt: request.prompt.clone(),
            model: model.clone(),
            max_tokens: persona.map(|p| p.max_tokens).unwrap_or(2048),
            temperature: persona.map(|p| p.temperature).unwrap_or(0.7),
            top_p: 0.9,
            stop_sequences: Vec::new(),
            system_message: persona.map(|p| p.system_prompt.clone()),
            conversation_history: history,
        };

        let outcome = provider.generate(completion).await;
        let elapsed = started.elapsed().as_secs_f64();

        match outcome {
            Ok(response) => {
                stored.push(ChatTurn::user(request.prompt.clone()));
                stored.push(ChatTurn::assistant(response.content.clone()));
                truncate_window(&mut stored, self.window);
                drop(stored);

                self.record_stats(kind, elapsed, false);

                let confidence = confidence_score(&response.content);
                let mut metadata: HashMap<String, serde_json::Value> = HashMap::new();
                metadata.insert(
                    "finish_reason".to_string(),
                    serde_json::Value::String(response.finish_reason.clone()),
                );
                metadata.insert(
                    "provider_metadata".to_string(),
                    serde_json::to_value(&response.metadata).unwrap_or_default(),
                );
                if substituted {
                    metadata.insert("provider_substituted".to_string(), serde_json::Value::Bool(true));
                    if let Some(requested) = request.provider {
                        metadata.insert(
                            "requested_provider".to_string(),
                            serde_json::Value::String(requested.to_string()),
                        );
                    }
                }
                if !request.context_data.is_null() {
                    metadata.insert("context_data".to_string(), request.context_data.clone());
                }

                Ok(BrainResponse {
                    content: response.content,
                    provider: kind,
                    model: response.model,
                    agent_id: request.agent_id,
                    tokens_used: response.tokens_used,
                    processing_time: response.processing_time,
                    confidence,
                    metadata,
                })
            }
            Err(source) => {
                drop(stored);
                self.record_stats(kind, elapsed, true);
                Err(AgentError::Brain {
                    provider: kind,
                    source,
                })
            }
        }
    }

    // Selection precedence: caller > persona > remote-if-configured > local.
    // Fallback only when the selected provider is unavailable right now.
    async fn select_provider(
        &self,
        request: &BrainRequest,
    ) -> Result<(ProviderKind, Arc<dyn Provider>, bool)> {
        let desired = request
            .provider
            .or_else(|| request.persona.as_ref().map(|p| p.preferred_provider))
            .unwrap_or(if self.remote.is_some() {
                ProviderKind::Remote
            } else {
                ProviderKind::Local
            });

        if let Some(provider) = self.slot(desired) {
            if provider.is_available().await {
                return Ok((desired, provider, false));
            }
        }

        let other = match desired {
            ProviderKind::Remote => ProviderKind::Local,
            ProviderKind::Local => ProviderKind::Remote,
        };
        if let Some(provider) = self.slot(other) {
            if provider.is_available().await {
                warn!(
                    requested = %desired,
                    substituted = %other,
                    "selected provider unavailable, substituting"
                );
                return Ok((other, provider, true));
            }
        }

        Err(AgentError::NoProvider)
    }

    fn select_model(&self, request: &BrainRequest, kind: ProviderKind) -> String {
        if let Some(model) = &request.model {
            return model.clone();
        }
        if let Some(persona) = &request.persona {
            if persona.preferred_provider == kind {
                return persona.preferred_model.clone();
            }
        }
        match kind {
            ProviderKind::Remote => "gpt-4o".to_string(),
            // Empty selects the local adapter's first ready model.
            ProviderKind::Local => String::new(),
        }
    }

    fn slot(&self, kind: ProviderKind) -> Option<Arc<dyn Provider>> {
        match kind {
            ProviderKind::Remote => self.remote.clone(),
            ProviderKind::Local => self.local.clone(),
        }
    }

    fn record_stats(&self, kind: ProviderKind, elapsed: f64, failed: bool) {
        let mut stats = self.stats.write();
        let entry = stats.entry(kind).or_default();
        entry.requests += 1;
        if failed {
            entry.errors += 1;
        }
        let n = entry.requests as f64;
        entry.avg_response_time = (entry.avg_response_time * (n - 1.0) + elapsed) / n;
    }

    /// Register a persona, replacing any existing one of the same name.
    pub fn add_persona(&self, persona: Persona) {
        debug!(persona = %persona.name, "persona registered");
        self.personas.write().insert(persona.name.clone(), persona);
    }

    /// Look up a persona by name.
    pub fn persona(&self, name: &str) -> Option<Persona> {
        self.personas.read().get(name).cloned()
    }

    /// All registered personas.
    pub fn list_personas(&self) -> Vec<Persona> {
        self.personas.read().values().cloned().collect()
    }

    /// Stored conversation window for an agent.
    pub async fn conversation_history(&self, agent_id: &str) -> Vec<ChatTurn> {
        match self.conversations.get(agent_id) {
            Some(slot) => slot.turns.lock().await.clone(),
            None => Vec::new(),
        }
    }

    /// Drop an agent's stored conversation.
    pub fn clear_conversation(&self, agent_id: &str) {
        self.conversations.remove(agent_id);
    }

    /// Per-provider availability and rolling statistics.
    pub async fn provider_status(&self) -> HashMap<String, serde_json::Value> {
        let stats = self.stats.read().clone();
        let mut status = HashMap::new();
        for kind in [ProviderKind::Remote, ProviderKind::Local] {
            let available = match self.slot(kind) {
                Some(provider) => provider.is_available().await,
                None => false,
            };
            let entry = stats.get(&kind).cloned().unwrap_or_default();
            status.insert(
                kind.to_string(),
                serde_json::json!({
                    "configured": self.slot(kind).is_some(),
                    "available": available,
                    "stats": entry,
                }),
            );
        }
        status
    }

    /// Overall health: "healthy" when every configured provider responds,
    /// "degraded" otherwise.
    pub async fn health_check(&self) -> serde_json::Value {
        let mut providers = serde_json::Map::new();
        let mut overall = "healthy";
        for kind in [ProviderKind::Remote, ProviderKind::Local] {
            let state = match self.slot(kind) {
                None => "not_configured",
                Some(provider) => {
                    if provider.is_available().await {
                        "healthy"
                    } else {
                        overall = "degraded";
                        "unhealthy"
                    }
                }
            };
            providers.insert(kind.to_string(), serde_json::Value::String(state.to_string()));
        }
        serde_json::json!({ "overall": overall, "providers": providers })
    }
}

fn truncate_window(turns: &mut Vec<ChatTurn>, window: usize) {
    if turns.len() > window {
        let excess = turns.len() - window;
        turns.drain(..excess);
    }
}

// Advisory quality heuristic over content length, terminal punctuation, and
// lexical diversity. Only the [0, 1] range is contractual.
fn confidence_score(content: &str) -> f64 {
    let mut score: f64 = 0.5;

    if content.len() > 50 {
        score += 0.1;
    }

    let trimmed = content.trim();
    if trimmed.ends_with('.') || trimmed.ends_with('!') || trimmed.ends_with('?') {
        score += 0.1;
    }

    let words: Vec<&str> = content.split_whitespace().collect();
    if words.len() > 10 {
        let unique: std::collections::HashSet<String> =
            words.iter().map(|w| w.to_lowercase()).collect();
        let diversity = unique.len() as f64 / words.len() as f64;
        score += diversity * 0.2;
    }

    score.min(1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use llm::{CompletionResponse, LlmError};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    struct StubProvider {
        kind: ProviderKind,
        available: AtomicBool,
        fail: AtomicBool,
        calls: AtomicUsize,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
    }

    impl StubProvider {
        fn new(kind: ProviderKind) -> Arc<Self> {
            Arc::new(Self {
                kind,
                available: AtomicBool::new(true),
                fail: AtomicBool::new(false),
                calls: AtomicUsize::new(0),
                in_flight: AtomicUsize::new(0),
                max_in_flight: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl Provider for StubProvider {
        fn kind(&self) -> ProviderKind {
            self.kind
        }

        async fn generate(&self, request: CompletionRequest) -> llm::Result<CompletionResponse> {
            let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(current, Ordering::SeqCst);
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            self.calls.fetch_add(1, Ordering::SeqCst);

            if self.fail.load(Ordering::SeqCst) {
                return Err(LlmError::ServerTransient { status: 503 });
            }
            Ok(CompletionResponse {
                content: format!("echo: {}", request.prompt),
                model: if request.model.is_empty() {
                    "stub-default".to_string()
                } else {
                    request.model
                },
                tokens_used: 7,
                finish_reason: "stop".to_string(),
                processing_time: 0.005,
                metadata: HashMap::new(),
            })
        }

        async fn is_available(&self) -> bool {
            self.available.load(Ordering::SeqCst)
        }
    }

    #[tokio::test]
    async fn test_generates_and_stores_history() {
        let remote = StubProvider::new(ProviderKind::Remote);
        let brain = AgentBrain::new(Some(remote), None);

        let response = brain
            .generate_completion(BrainRequest::new("hello", "a1"))
            .await
            .unwrap();
        assert_eq!(response.content, "echo: hello");
        assert_eq!(response.provider, ProviderKind::Remote);
        assert!((0.0..=1.0).contains(&response.confidence));

        let history = brain.conversation_history("a1").await;
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].content, "hello");
        assert_eq!(history[1].content, "echo: hello");
    }

    #[tokio::test]
    async fn test_window_drops_oldest() {
        let remote = StubProvider::new(ProviderKind::Remote);
        let brain = AgentBrain::new(Some(remote), None).with_window(4);

        for i in 0..4 {
            brain
                .generate_completion(BrainRequest::new(format!("m{i}"), "a1"))
                .await
                .unwrap();
        }

        let history = brain.conversation_history("a1").await;
        assert_eq!(history.len(), 4);
        // The two oldest exchanges were dropped; m2 opens the window.
        assert_eq!(history[0].content, "m2");
    }

    #[tokio::test]
    async fn test_fallback_at_selection_time() {
        let local = StubProvider::new(ProviderKind::Local);
        let brain = AgentBrain::new(None, Some(local));

        let response = brain
            .generate_completion(
                BrainRequest::new("hi", "a1").with_provider(ProviderKind::Remote),
            )
            .await
            .unwrap();

        assert_eq!(response.provider, ProviderKind::Local);
        assert_eq!(
            response.metadata.get("provider_substituted"),
            Some(&serde_json::Value::Bool(true))
        );
        assert_eq!(
            response.metadata.get("requested_provider"),
            Some(&serde_json::Value::String("remote".to_string()))
        );
    }

    #[tokio::test]
    async fn test_no_substitution_after_provider_failure() {
        let remote = StubProvider::new(ProviderKind::Remote);
        remote.fail.store(true, Ordering::SeqCst);
        let local = StubProvider::new(ProviderKind::Local);
        let brain = AgentBrain::new(Some(remote), Some(local.clone()));

        let err = brain
            .generate_completion(BrainRequest::new("hi", "a1"))
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            AgentError::Brain {
                provider: ProviderKind::Remote,
                ..
            }
        ));
        // The local provider was never consulted.
        assert_eq!(local.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_no_provider_configured() {
        let brain = AgentBrain::new(None, None);
        let err = brain
            .generate_completion(BrainRequest::new("hi", "a1"))
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::NoProvider));
    }

    #[tokio::test]
    async fn test_model_precedence() {
        let remote = StubProvider::new(ProviderKind::Remote);
        let brain = AgentBrain::new(Some(remote), None);
        let persona = brain.persona("analyst").unwrap();

        // Caller override wins over persona.
        let response = brain
            .generate_completion(
                BrainRequest::new("hi", "a1")
                    .with_persona(persona.clone())
                    .with_model("gpt-4o-mini"),
            )
            .await
            .unwrap();
        assert_eq!(response.model, "gpt-4o-mini");

        // Persona wins over defaults.
        let response = brain
            .generate_completion(BrainRequest::new("hi", "a2").with_persona(persona))
            .await
            .unwrap();
        assert_eq!(response.model, "gpt-4o");
    }

    #[tokio::test]
    async fn test_per_agent_calls_serialized() {
        let remote = StubProvider::new(ProviderKind::Remote);
        let brain = Arc::new(AgentBrain::new(Some(remote.clone()), None));

        let mut handles = Vec::new();
        for _ in 0..4 {
            let brain = Arc::clone(&brain);
            handles.push(tokio::spawn(async move {
                brain
                    .generate_completion(BrainRequest::new("hi", "same-agent"))
                    .await
                    .unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(remote.max_in_flight.load(Ordering::SeqCst), 1);
        assert_eq!(remote.calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_stats_recorded() {
        let remote = StubProvider::new(ProviderKind::Remote);
        let brain = AgentBrain::new(Some(remote.clone()), None);

        brain
            .generate_completion(BrainRequest::new("hi", "a1"))
            .await
            .unwrap();
        remote.fail.store(true, Ordering::SeqCst);
        let _ = brain.generate_completion(BrainRequest::new("hi", "a1")).await;

        let status = brain.provider_status().await;
        let remote_status = &status["remote"];
        assert_eq!(remote_status["stats"]["requests"], 2);
        assert_eq!(remote_status["stats"]["errors"], 1);
    }

    #[test]
    fn test_confidence_in_range() {
        for content in [
            "",
            "short",
            "A long, complete sentence with plenty of distinct words to score well.",
            "repeat repeat repeat repeat repeat repeat repeat repeat repeat repeat repeat",
        ] {
            let score = confidence_score(content);
            assert!((0.0..=1.0).contains(&score), "score {score} for {content:?}");
        }
    }

    #[tokio::test]
    async fn test_health_check_degrades() {
        let remote = StubProvider::new(ProviderKind::Remote);
        remote.available.store(false, Ordering::SeqCst);
        let brain = AgentBrain::new(Some(remote), None);

        let health = brain.health_check().await;
        assert_eq!(health["overall"], "degraded");
        assert_eq!(health["providers"]["remote"], "unhealthy");
        assert_eq!(health["providers"]["local"], "not_configured");
    }
}
