//! Hermes - Model Handoff and Context Orchestration Core
//!
//! A Rust-based orchestration core for long-running AI agent workflows
//! that provides:
//! - A bounded, persistent, retried, rate-limited, circuit-broken
//!   request broker fanning out to heterogeneous model providers
//! - An intelligent, tier-aware, relevance-scored context cache that
//!   proactively prunes and compresses to prevent forced compaction
//! - A scheduled, resource-gated background worker pool for periodic
//!   maintenance tasks
//!
//! # Architecture
//!
//! The system is organized into several layers:
//! - **Types**: Request/response and queue data structures
//! - **Cache**: Token accounting, relevance scoring, tier management
//! - **Providers**: Protocol-level clients for model endpoints
//! - **Handoff**: The broker, breakers, and child-process executor
//! - **Daemon**: The scheduled worker pool
//!
//! # Example
//!
//! ```ignore
//! use hermes_core::{HermesConfig, Runtime};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = HermesConfig::from_file("hermes.toml".as_ref())?;
//!     let runtime = Runtime::initialize(config).await?;
//!
//!     runtime.daemon().start().await?;
//!     let result = runtime.on_user_prompt_submit("fix the bug in /src/lib.rs", "sess-1").await;
//!     println!("utilization: {:?}", result.new_utilization);
//!
//!     runtime.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod cache;
pub mod config;
pub mod daemon;
pub mod error;
pub mod handoff;
pub mod providers;
pub mod runtime;
pub mod store;
pub mod types;

// Re-export commonly used types
pub use cache::{
    CacheEntry, CacheMetrics, CacheOptimizer, EntryFilter, EntryId, EntryMetadata, EntryType,
    HookResult, PruningDecision, PruningResult, PruningUrgency, RelevanceScore, RelevanceScorer,
    ScoringContext, Tier, TierManager, TokenAccountant, TransitionReport,
};
pub use config::{ConfigError, HermesConfig};
pub use daemon::{
    DaemonJournal, DaemonStatus, ResourceOracle, ResourceSnapshot, SysinfoOracle, WorkerContext,
    WorkerDaemon, WorkerEvent, WorkerKind, WorkerReport, WorkerRunner,
};
pub use error::{HermesError, Result};
pub use handoff::{
    BackgroundHandler, BreakerRegistry, BreakerState, ChildJob, CircuitBreaker, HandoffEvent,
    HandoffManager, JobExecutor, ProcessExecutor, RateLimiter, RateLimiterRegistry, RequestSpec,
};
pub use providers::{
    AdapterRegistry, AnthropicAdapter, CostTable, OllamaAdapter, OpenAiAdapter, ProviderAdapter,
    StreamOptions,
};
pub use runtime::Runtime;
pub use store::{DaemonStateDoc, MetricsDoc, PersistentStore};
pub use types::{
    ContextMessage, HandoffMetrics, HandoffOptions, HandoffQueueItem, HandoffRequest,
    HandoffResponse, HandoffStatus, MetricsSnapshot, ProviderConfig, ProviderType, RequestId,
    RequestMetadata, Role, TokenUsage, WorkerState,
};
