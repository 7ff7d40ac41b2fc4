//! Core data types for the Hermes handoff pipeline
//!
//! This module defines the request/response shapes carried through the
//! model handoff broker, the durable queue records, and the worker state
//! tracked by the background daemon. These types form the shared data
//! model between the broker, the persistent store, and the child-process
//! executor.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Unique identifier for handoff requests
///
/// Wraps a UUID to provide type safety and prevent mixing request IDs
/// with other UUID-based identifiers in the system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(pub Uuid);

impl RequestId {
    /// Create a new random request ID
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Parse a request ID from a string
    pub fn from_string(s: &str) -> Result<Self, uuid::Error> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Message role in a provider conversation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    /// Wire-format role string shared by all provider protocols
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

/// A single message of conversational context attached to a request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextMessage {
    pub role: Role,
    pub content: String,
}

impl ContextMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

/// Caller-supplied metadata carried on every request
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RequestMetadata {
    /// Session this request belongs to
    pub session_id: Option<String>,

    /// Task identifier from the orchestrating workflow
    pub task_id: Option<String>,

    /// Origin of the request (worker type, hook name, caller)
    pub source: String,

    /// Free-form categorization tags
    pub tags: Vec<String>,

    /// When the request was created
    pub created_at: Option<DateTime<Utc>>,
}

/// Sampling and dispatch options for a request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandoffOptions {
    /// Sampling temperature passed to the provider
    pub temperature: f32,

    /// Maximum completion tokens requested from the provider
    pub max_tokens: usize,

    /// Run in the background via the child-process executor
    pub background: bool,
}

impl Default for HandoffOptions {
    fn default() -> Self {
        Self {
            temperature: 0.7,
            max_tokens: 1024,
            background: false,
        }
    }
}

/// A request handed off to a model provider
///
/// This is the unit of work the broker dispatches. It is serialized
/// verbatim into the `{id}_request.json` rendezvous file when executed
/// out of process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandoffRequest {
    /// Unique identifier
    pub id: RequestId,

    /// Provider name to target, or "auto" for priority-ordered selection
    pub provider_hint: String,

    /// Optional system prompt (extracted into the provider's system slot)
    pub system_prompt: Option<String>,

    /// The user prompt
    pub prompt: String,

    /// Prior conversation context
    pub context: Vec<ContextMessage>,

    /// Instructions to inject into the response for the receiving workflow
    pub callback_instructions: Option<String>,

    /// Caller metadata
    pub metadata: RequestMetadata,

    /// Sampling and dispatch options
    pub options: HandoffOptions,
}

/// Lifecycle status of a handoff request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandoffStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Cancelled,
    Timeout,
}

impl HandoffStatus {
    /// Terminal states never transition again
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            HandoffStatus::Completed
                | HandoffStatus::Failed
                | HandoffStatus::Cancelled
                | HandoffStatus::Timeout
        )
    }
}

impl std::fmt::Display for HandoffStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            HandoffStatus::Pending => "pending",
            HandoffStatus::Processing => "processing",
            HandoffStatus::Completed => "completed",
            HandoffStatus::Failed => "failed",
            HandoffStatus::Cancelled => "cancelled",
            HandoffStatus::Timeout => "timeout",
        };
        write!(f, "{}", s)
    }
}

/// Token usage reported by a provider, with optional cost estimate
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt: usize,
    pub completion: usize,
    pub total: usize,

    /// Estimated cost in USD, when a rate table exists for the provider
    pub estimated_cost: Option<f64>,
}

impl TokenUsage {
    pub fn new(prompt: usize, completion: usize) -> Self {
        Self {
            prompt,
            completion,
            total: prompt + completion,
            estimated_cost: None,
        }
    }
}

/// Response returned by a provider adapter
///
/// Adapters never raise across their boundary: failures arrive as a
/// response with `status == Failed` and `error` populated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandoffResponse {
    /// Request this response answers
    pub request_id: RequestId,

    /// Provider name that served the request
    pub provider: String,

    /// Model that produced the content
    pub model: String,

    /// Completion content (empty on failure)
    pub content: String,

    /// Token accounting
    pub tokens: TokenUsage,

    /// Wall-clock duration of the attempt(s)
    pub duration_ms: u64,

    /// Lifecycle status
    pub status: HandoffStatus,

    /// Error description when status is failed/timeout
    pub error: Option<String>,

    /// Callback instructions appended to the content, kept verbatim for
    /// traceability
    pub injected_instructions: Option<String>,

    /// Completion timestamp
    pub completed_at: Option<DateTime<Utc>>,
}

impl HandoffResponse {
    /// Synthesize a failed response for a request without a provider result
    pub fn failed(request_id: RequestId, provider: &str, model: &str, error: String) -> Self {
        Self {
            request_id,
            provider: provider.to_string(),
            model: model.to_string(),
            content: String::new(),
            tokens: TokenUsage::default(),
            duration_ms: 0,
            status: HandoffStatus::Failed,
            error: Some(error),
            injected_instructions: None,
            completed_at: Some(Utc::now()),
        }
    }
}

/// A queued handoff with its dispatch bookkeeping
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandoffQueueItem {
    pub request: HandoffRequest,
    pub status: HandoffStatus,

    /// Monotonically increasing dispatch position; pending items run in
    /// ascending order when capacity frees
    pub position: u64,

    pub added_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub response: Option<HandoffResponse>,

    /// Retry attempts consumed so far
    pub retries: u32,
}

/// Supported provider protocol families
///
/// A closed set: each variant carries its own wire behavior in the
/// adapter layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderType {
    /// Local Ollama server (`POST {endpoint}/api/chat`)
    Ollama,

    /// Anthropic-style messages API
    Anthropic,

    /// OpenAI-style chat completions API
    OpenAi,
}

impl std::fmt::Display for ProviderType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ProviderType::Ollama => "ollama",
            ProviderType::Anthropic => "anthropic",
            ProviderType::OpenAi => "openai",
        };
        write!(f, "{}", s)
    }
}

/// Configuration for one remote or local model endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Registry key; also the circuit-breaker and rate-limiter key
    pub name: String,

    /// Protocol family
    #[serde(rename = "type")]
    pub provider_type: ProviderType,

    /// Endpoint URL (base URL for ollama, full URL otherwise)
    pub endpoint: String,

    /// Model identifier sent on every request
    pub model: String,

    /// Auto-selection visits providers in ascending priority
    pub priority: u32,

    /// Updated by health checks; unhealthy providers are never selected
    pub healthy: bool,

    /// API key; falls back to the provider family's environment variable
    pub api_key: Option<String>,
}

impl ProviderConfig {
    /// Resolve the API key from config or the conventional env var
    pub fn resolve_api_key(&self) -> Option<String> {
        if let Some(key) = &self.api_key {
            if !key.is_empty() {
                return Some(key.clone());
            }
        }
        let var = match self.provider_type {
            ProviderType::Ollama => return None,
            ProviderType::Anthropic => "ANTHROPIC_API_KEY",
            ProviderType::OpenAi => "OPENAI_API_KEY",
        };
        std::env::var(var).ok().filter(|k| !k.is_empty())
    }
}

/// Aggregate broker metrics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HandoffMetrics {
    pub total_requests: u64,
    pub successful: u64,
    pub failed: u64,
    pub cancelled: u64,

    /// Total tokens across completed requests
    pub total_tokens: u64,

    /// Running mean latency of completed requests
    pub avg_latency_ms: f64,

    /// Completed-request counts keyed by provider name
    pub by_provider: HashMap<String, u64>,
}

impl HandoffMetrics {
    /// Fold one completed request into the running aggregates
    pub fn record_success(&mut self, provider: &str, tokens: u64, duration_ms: u64) {
        self.successful += 1;
        self.total_tokens += tokens;
        *self.by_provider.entry(provider.to_string()).or_insert(0) += 1;
        let n = self.successful as f64;
        self.avg_latency_ms = (self.avg_latency_ms * (n - 1.0) + duration_ms as f64) / n;
    }
}

/// Point-in-time metrics record appended to the history
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub at: DateTime<Utc>,
    pub metrics: HandoffMetrics,
}

/// Per-worker execution state tracked by the daemon
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkerState {
    pub run_count: u64,
    pub success_count: u64,
    pub failure_count: u64,

    /// Rolling mean of run durations
    pub average_duration_ms: f64,

    pub last_run: Option<DateTime<Utc>>,
    pub next_run: Option<DateTime<Utc>>,
    pub is_running: bool,
}

impl WorkerState {
    /// Fold one completed run into the rolling aggregates
    pub fn record_run(&mut self, success: bool, duration_ms: u64) {
        self.run_count += 1;
        if success {
            self.success_count += 1;
        } else {
            self.failure_count += 1;
        }
        let n = self.run_count as f64;
        self.average_duration_ms =
            (self.average_duration_ms * (n - 1.0) + duration_ms as f64) / n;
        self.last_run = Some(Utc::now());
        self.is_running = false;
    }
}
