//! Remote LLM adapter.
//!
//! Talks to a cloud chat-completion API with:
//! - credential rotation across one or more keys
//! - per-credential sliding-window rate accounting (requests and tokens)
//! - per-model max-token caps
//! - retry with exponential backoff on transient server errors and
//!   server-directed sleeps on rate limiting

use crate::config::{Credential, RemoteLlmConfig};
use crate::error::{LlmError, Result};
use crate::types::{CompletionRequest, CompletionResponse, Provider, ProviderKind};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Snapshot of one credential's accounting, for status queries.
#[derive(Debug, Clone, Serialize)]
pub struct CredentialStatus {
    /// Credential identifier.
    pub id: String,
    /// Whether this credential currently serves requests.
    pub active: bool,
    /// Lifetime request count.
    pub usage_count: u64,
    /// Requests inside the current rate window.
    pub window_requests: usize,
    /// Tokens consumed inside the current rate window.
    pub window_tokens: usize,
    /// When the credential last served a request.
    pub last_used: Option<DateTime<Utc>>,
}

struct CredentialState {
    credential: Credential,
    // (request instant, tokens charged) pairs inside the sliding window
    window: VecDeque<(Instant, usize)>,
    usage_count: u64,
    last_used: Option<DateTime<Utc>>,
}

impl CredentialState {
    fn new(credential: Credential) -> Self {
        Self {
            credential,
            window: VecDeque::new(),
            usage_count: 0,
            last_used: None,
        }
    }

    fn slide(&mut self, window: Duration, now: Instant) {
        while let Some(&(at, _)) = self.window.front() {
            if now.duration_since(at) >= window {
                self.window.pop_front();
            } else {
                break;
            }
        }
    }
}

struct RemoteState {
    active: usize,
    credentials: Vec<CredentialState>,
}

/// Client for a cloud chat-completion API.
pub struct RemoteClient {
    config: RemoteLlmConfig,
    http: Client,
    state: Mutex<RemoteState>,
}

impl RemoteClient {
    /// Create a client. Fails if the configuration carries no credentials.
    pub fn new(config: RemoteLlmConfig) -> Result<Self> {
        if config.credentials.is_empty() {
            return Err(LlmError::Config(
                "remote provider requires at least one credential".to_string(),
            ));
        }

        let http = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| LlmError::Config(e.to_string()))?;

        let credentials = config
            .credentials
            .iter()
            .cloned()
            .map(CredentialState::new)
            .collect();

        Ok(Self {
            config,
            http,
            state: Mutex::new(RemoteState {
                active: 0,
                credentials,
            }),
        })
    }

    /// Promote the next credential in rotation order. Returns its id.
    pub fn rotate_credential(&self) -> String {
        let mut state = self.state.lock();
        state.active = (state.active + 1) % state.credentials.len();
        let id = state.credentials[state.active].credential.id.clone();
        debug!(credential = %id, "rotated remote credential");
        id
    }

    /// Accounting snapshot for every credential.
    pub fn credential_status(&self) -> Vec<CredentialStatus> {
        let mut state = self.state.lock();
        let active = state.active;
        let window = self.config.rate_window;
        let now = Instant::now();
        state
            .credentials
            .iter_mut()
            .enumerate()
            .map(|(i, cred)| {
                cred.slide(window, now);
                CredentialStatus {
                    id: cred.credential.id.clone(),
                    active: i == active,
                    usage_count: cred.usage_count,
                    window_requests: cred.window.len(),
                    window_tokens: cred.window.iter().map(|&(_, t)| t).sum(),
                    last_used: cred.last_used,
                }
            })
            .collect()
    }

    /// Max-token cap for a model, if one is configured.
    pub fn token_cap(&self, model: &str) -> Option<usize> {
        self.config.model_token_caps.get(model).copied()
    }

    // Wait until the active credential's window has room for one more request.
    async fn acquire_slot(&self) {
        loop {
            let wait = {
                let mut state = self.state.lock();
                let active = state.active;
                let cred = &mut state.credentials[active];
                let now = Instant::now();
                cred.slide(self.config.rate_window, now);
                if (cred.window.len() as u32) < self.config.rate_limit_requests {
                    None
                } else {
                    // Oldest entry leaving the window frees a slot.
                    let oldest = cred.window.front().map(|&(at, _)| at).unwrap_or(now);
                    Some(
                        self.config
                            .rate_window
                            .saturating_sub(now.duration_since(oldest)),
                    )
                }
            };
            match wait {
                None => return,
                Some(delay) => {
                    warn!(delay_ms = delay.as_millis() as u64, "rate window full, waiting");
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    fn active_credential(&self) -> Credential {
        let state = self.state.lock();
        state.credentials[state.active].credential.clone()
    }

    fn record_usage(&self, tokens: usize) {
        let mut state = self.state.lock();
        let active = state.active;
        let cred = &mut state.credentials[active];
        cred.window.push_back((Instant::now(), tokens));
        cred.usage_count += 1;
        cred.last_used = Some(Utc::now());
    }

    fn build_body(&self, request: &CompletionRequest, model: &str) -> ChatCompletionBody {
        let max_tokens = match self.token_cap(model) {
            Some(cap) => request.max_tokens.min(cap),
            None => request.max_tokens,
        };

        ChatCompletionBody {
            model: model.to_string(),
            messages: request
                .messages()
                .iter()
                .map(|turn| WireMessage {
                    role: turn.role.as_str().to_string(),
                    content: Some(turn.content.clone()),
                })
                .collect(),
            max_tokens,
            temperature: request.temperature,
            top_p: request.top_p,
            stop: if request.stop_sequences.is_empty() {
                None
            } else {
                Some(request.stop_sequences.clone())
            },
            stream: false,
        }
    }

    async fn send_once(
        &self,
        body: &ChatCompletionBody,
        credential: &Credential,
    ) -> Result<ChatCompletionReply> {
        let url = format!("{}/chat/completions", self.config.base_url);
        let mut req = self
            .http
            .post(&url)
            .bearer_auth(&credential.api_key)
            .json(body);
        if let Some(org) = &credential.organization {
            req = req.header("OpenAI-Organization", org);
        }

        let response = req.send().await.map_err(LlmError::from)?;
        let status = response.status().as_u16();

        match status {
            200 => {
                let reply: ChatCompletionReply = response
                    .json()
                    .await
                    .map_err(|e| LlmError::InvalidResponse(e.to_string()))?;
                Ok(reply)
            }
            401 => {
                let text = response.text().await.unwrap_or_default();
                Err(LlmError::InvalidCredential(text))
            }
            402 => {
                let text = response.text().await.unwrap_or_default();
                Err(LlmError::QuotaExceeded(text))
            }
            429 => {
                let retry_after = response
                    .headers()
                    .get("Retry-After")
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.parse::<u64>().ok())
                    .unwrap_or(60);
                Err(LlmError::RateLimited { retry_after })
            }
            500 | 502 | 503 | 504 => Err(LlmError::ServerTransient { status }),
            _ => {
                let text = response.text().await.unwrap_or_default();
                Err(LlmError::InvalidResponse(format!(
                    "unexpected status {status}: {text}"
                )))
            }
        }
    }
}

#[async_trait]
impl Provider for RemoteClient {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Remote
    }

    async fn generate(&self, request: CompletionRequest) -> Result<CompletionResponse> {
        let started = Instant::now();
        let model = if request.model.is_empty() {
            self.config.default_model.clone()
        } else {
            request.model.clone()
        };
        let body = self.build_body(&request, &model);

        let mut attempt: u32 = 0;
        loop {
            self.acquire_slot().await;
            let credential = self.active_credential();

            match self.send_once(&body, &credential).await {
                Ok(reply) => {
                    let choice = reply
                        .choices
                        .into_iter()
                        .next()
                        .ok_or_else(|| LlmError::InvalidResponse("no choices".to_string()))?;
                    let tokens_used = reply.usage.as_ref().map(|u| u.total_tokens).unwrap_or(0);
                    self.record_usage(tokens_used);

                    let mut metadata = HashMap::new();
                    metadata.insert(
                        "credential_id".to_string(),
                        serde_json::Value::String(credential.id.clone()),
                    );
                    metadata.insert(
                        "attempt".to_string(),
                        serde_json::Value::from(attempt + 1),
                    );

                    return Ok(CompletionResponse {
                        content: choice.message.content.unwrap_or_default(),
                        model: reply.model,
                        tokens_used,
                        finish_reason: choice.finish_reason.unwrap_or_else(|| "stop".to_string()),
                        processing_time: started.elapsed().as_secs_f64(),
                        metadata,
                    });
                }
                Err(LlmError::RateLimited { retry_after }) => {
                    attempt += 1;
                    if attempt >= self.config.max_attempts {
                        return Err(LlmError::RateLimited { retry_after });
                    }
                    warn!(retry_after, "rate limited by provider, sleeping");
                    tokio::time::sleep(Duration::from_secs(retry_after)).await;
                }
                Err(err @ LlmError::ServerTransient { .. })
                | Err(err @ LlmError::Unreachable(_)) => {
                    attempt += 1;
                    if attempt >= self.config.max_attempts {
                        return Err(err);
                    }
                    // Base 1s, doubling per attempt, up to 25% jitter.
                    let base_ms = 1000u64 << (attempt - 1);
                    let jitter_ms = (base_ms as f64 * 0.25 * rand::random::<f64>()) as u64;
                    let backoff = Duration::from_millis(base_ms + jitter_ms);
                    warn!(error = %err, backoff_ms = backoff.as_millis() as u64, "transient provider error, backing off");
                    tokio::time::sleep(backoff).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn is_available(&self) -> bool {
        // A configured remote provider is considered available; hard failures
        // surface as typed errors at call time.
        !self.config.credentials.is_empty()
    }
}

// Wire types for the chat-completions surface.

#[derive(Debug, Serialize)]
struct ChatCompletionBody {
    model: String,
    messages: Vec<WireMessage>,
    max_tokens: usize,
    temperature: f32,
    top_p: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    stop: Option<Vec<String>>,
    stream: bool,
}

#[derive(Debug, Serialize, Deserialize)]
struct WireMessage {
    role: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionReply {
    model: String,
    choices: Vec<WireChoice>,
    usage: Option<WireUsage>,
}

#[derive(Debug, Deserialize)]
struct WireChoice {
    message: WireMessage,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireUsage {
    total_tokens: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> RemoteLlmConfig {
        RemoteLlmConfig::new("key-a", "https://api.openai.com/v1", "gpt-4o")
            .with_credential(Credential::new("backup", "key-b"))
    }

    #[test]
    fn test_client_requires_credentials() {
        let mut config = test_config();
        config.credentials.clear();
        assert!(RemoteClient::new(config).is_err());
    }

    #[test]
    fn test_rotation_cycles() {
        let client = RemoteClient::new(test_config()).unwrap();
        assert_eq!(client.active_credential().id, "default");
        assert_eq!(client.rotate_credential(), "backup");
        assert_eq!(client.rotate_credential(), "default");
    }

    #[test]
    fn test_token_cap_clamps_request() {
        let client = RemoteClient::new(test_config()).unwrap();
        let request = CompletionRequest::new("hi", "gpt-3.5-turbo").with_max_tokens(1_000_000);
        let body = client.build_body(&request, "gpt-3.5-turbo");
        assert_eq!(body.max_tokens, 4096);

        let body = client.build_body(&request, "unknown-model");
        assert_eq!(body.max_tokens, 1_000_000);
    }

    #[test]
    fn test_usage_recorded_in_window() {
        let client = RemoteClient::new(test_config()).unwrap();
        client.record_usage(100);
        client.record_usage(50);

        let status = client.credential_status();
        let active = status.iter().find(|s| s.active).unwrap();
        assert_eq!(active.window_requests, 2);
        assert_eq!(active.window_tokens, 150);
        assert_eq!(active.usage_count, 2);
    }

    #[tokio::test]
    async fn test_acquire_slot_open_window() {
        let client = RemoteClient::new(test_config()).unwrap();
        // Window empty: must return without sleeping.
        tokio::time::timeout(Duration::from_millis(50), client.acquire_slot())
            .await
            .expect("open window should not block");
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_slot_waits_for_slide() {
        let config = test_config().with_rate_limit(2);
        let client = RemoteClient::new(config).unwrap();
        client.record_usage(1);
        client.record_usage(1);

        let acquired = tokio::spawn(async move {
            client.acquire_slot().await;
        });
        // The paused clock auto-advances through the sleep; the call must
        // complete once the window slides.
        acquired.await.unwrap();
    }
}
