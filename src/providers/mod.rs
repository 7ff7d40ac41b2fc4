//! Provider adapters: protocol-level clients for remote and local model
//! endpoints
//!
//! Every adapter exposes the same shape (`health_check`, `send`, and an
//! optional `stream`) and never raises across its boundary: transport,
//! HTTP, and response-shape failures all arrive as a `HandoffResponse`
//! with `status == Failed` and a prefixed `error` string the broker can
//! classify for its retry policy.

pub mod anthropic;
pub mod ollama;
pub mod openai;

pub use anthropic::AnthropicAdapter;
pub use ollama::OllamaAdapter;
pub use openai::OpenAiAdapter;

use crate::config::TimeoutConfig;
use crate::types::{
    ContextMessage, HandoffRequest, HandoffResponse, ProviderConfig, ProviderType, Role,
    TokenUsage,
};
use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Streaming knobs passed to `stream`
#[derive(Debug, Clone)]
pub struct StreamOptions {
    /// Overall cap on the streamed response
    pub timeout: Duration,
}

/// Uniform adapter surface over heterogeneous provider protocols
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    /// Cheap availability probe; never raises
    async fn health_check(&self, cfg: &ProviderConfig) -> bool;

    /// One request/response exchange; failures come back as a failed
    /// response, never as an Err
    async fn send(&self, req: &HandoffRequest, cfg: &ProviderConfig) -> HandoffResponse;

    /// Streaming exchange; adapters without a streaming protocol fall
    /// back to `send`
    async fn stream(
        &self,
        req: &HandoffRequest,
        cfg: &ProviderConfig,
        opts: &StreamOptions,
    ) -> HandoffResponse {
        let _ = opts;
        self.send(req, cfg).await
    }
}

/// Broker-side classification of a failed response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Network, timeout, 5xx, rate-limited: retry with backoff
    Transient,

    /// Malformed provider response: retried up to half the budget
    Protocol,

    /// Missing key, unknown provider: terminal
    Configuration,
}

/// Classify a failed response by the error prefix conventions the
/// adapters follow
pub fn classify_failure(response: &HandoffResponse) -> FailureKind {
    let Some(error) = &response.error else {
        return FailureKind::Transient;
    };
    if error.starts_with("config:") {
        FailureKind::Configuration
    } else if error.starts_with("protocol:") {
        FailureKind::Protocol
    } else {
        // network:, timeout:, http NNN: and anything unrecognized
        FailureKind::Transient
    }
}

/// Wire message shared by all three protocols
#[derive(Debug, Serialize)]
pub(crate) struct WireMessage {
    pub role: &'static str,
    pub content: String,
}

/// Flatten a request into wire messages, keeping system content out when
/// the protocol carries it in a dedicated slot
pub(crate) fn build_messages(req: &HandoffRequest, inline_system: bool) -> Vec<WireMessage> {
    let mut messages = Vec::new();

    if inline_system {
        if let Some(system) = &req.system_prompt {
            messages.push(WireMessage {
                role: Role::System.as_str(),
                content: system.clone(),
            });
        }
    }

    for ContextMessage { role, content } in &req.context {
        if !inline_system && *role == Role::System {
            continue;
        }
        messages.push(WireMessage {
            role: role.as_str(),
            content: content.clone(),
        });
    }

    messages.push(WireMessage {
        role: Role::User.as_str(),
        content: req.prompt.clone(),
    });

    messages
}

/// System text for protocols with a dedicated system slot: the request's
/// system prompt plus any system-role context messages
pub(crate) fn extract_system(req: &HandoffRequest) -> Option<String> {
    let mut parts: Vec<&str> = Vec::new();
    if let Some(system) = &req.system_prompt {
        parts.push(system);
    }
    for message in &req.context {
        if message.role == Role::System {
            parts.push(&message.content);
        }
    }
    if parts.is_empty() {
        None
    } else {
        Some(parts.join("\n\n"))
    }
}

/// Synthesize a failed response carrying the elapsed time
pub(crate) fn failed_response(
    req: &HandoffRequest,
    cfg: &ProviderConfig,
    started: Instant,
    error: String,
) -> HandoffResponse {
    let mut response = HandoffResponse::failed(req.id, &cfg.name, &cfg.model, error);
    response.duration_ms = started.elapsed().as_millis() as u64;
    response
}

/// Shape a successful exchange into the uniform response
pub(crate) fn completed_response(
    req: &HandoffRequest,
    cfg: &ProviderConfig,
    started: Instant,
    content: String,
    mut tokens: TokenUsage,
    costs: &CostTable,
) -> HandoffResponse {
    tokens.estimated_cost = Some(costs.estimate(cfg.provider_type, &tokens));
    HandoffResponse {
        request_id: req.id,
        provider: cfg.name.clone(),
        model: cfg.model.clone(),
        content,
        tokens,
        duration_ms: started.elapsed().as_millis() as u64,
        status: crate::types::HandoffStatus::Completed,
        error: None,
        injected_instructions: None,
        completed_at: Some(Utc::now()),
    }
}

/// Map a reqwest transport error to the adapter error-string convention
pub(crate) fn transport_error(e: &reqwest::Error) -> String {
    if e.is_timeout() {
        format!("timeout: {}", e)
    } else if e.is_connect() {
        format!("network: connection failed: {}", e)
    } else {
        format!("network: {}", e)
    }
}

/// Map a non-success HTTP status to the adapter error-string convention
pub(crate) fn http_error(status: reqwest::StatusCode, body: &str) -> String {
    match status.as_u16() {
        401 | 403 => format!("config: authentication rejected (status {}): {}", status, body),
        _ => format!("http {}: {}", status.as_u16(), body),
    }
}

/// Per-million-token USD rates for one provider family
#[derive(Debug, Clone, Copy)]
pub struct CostRates {
    pub input_per_mtok: f64,
    pub output_per_mtok: f64,
}

/// Pluggable cost estimation table keyed by provider type
#[derive(Debug, Clone)]
pub struct CostTable {
    rates: HashMap<ProviderType, CostRates>,
}

impl Default for CostTable {
    fn default() -> Self {
        let mut rates = HashMap::new();
        rates.insert(
            ProviderType::Anthropic,
            CostRates {
                input_per_mtok: 3.0,
                output_per_mtok: 15.0,
            },
        );
        rates.insert(
            ProviderType::OpenAi,
            CostRates {
                input_per_mtok: 2.5,
                output_per_mtok: 10.0,
            },
        );
        // Local inference is free
        Self { rates }
    }
}

impl CostTable {
    /// Estimated USD cost; provider types without a rate cost 0
    pub fn estimate(&self, provider_type: ProviderType, tokens: &TokenUsage) -> f64 {
        match self.rates.get(&provider_type) {
            Some(rates) => {
                tokens.prompt as f64 / 1_000_000.0 * rates.input_per_mtok
                    + tokens.completion as f64 / 1_000_000.0 * rates.output_per_mtok
            }
            None => 0.0,
        }
    }
}

/// Adapter lookup by provider type
///
/// Built once with the configured timeouts; tests substitute adapters to
/// exercise broker behavior without a network.
pub struct AdapterRegistry {
    adapters: std::sync::RwLock<HashMap<ProviderType, Arc<dyn ProviderAdapter>>>,
}

impl AdapterRegistry {
    pub fn new(timeouts: &TimeoutConfig) -> crate::error::Result<Self> {
        let costs = CostTable::default();
        let mut adapters: HashMap<ProviderType, Arc<dyn ProviderAdapter>> = HashMap::new();
        adapters.insert(
            ProviderType::Ollama,
            Arc::new(OllamaAdapter::new(timeouts.request, costs.clone())?),
        );
        adapters.insert(
            ProviderType::Anthropic,
            Arc::new(AnthropicAdapter::new(timeouts.request, costs.clone())?),
        );
        adapters.insert(
            ProviderType::OpenAi,
            Arc::new(OpenAiAdapter::new(timeouts.request, costs)?),
        );
        Ok(Self {
            adapters: std::sync::RwLock::new(adapters),
        })
    }

    pub fn get(&self, provider_type: ProviderType) -> Arc<dyn ProviderAdapter> {
        self.adapters
            .read()
            .expect("adapter registry lock poisoned")
            .get(&provider_type)
            .cloned()
            .expect("registry covers every provider type")
    }

    /// Replace the adapter for a provider type
    pub fn insert(&self, provider_type: ProviderType, adapter: Arc<dyn ProviderAdapter>) {
        self.adapters
            .write()
            .expect("adapter registry lock poisoned")
            .insert(provider_type, adapter);
    }
}
