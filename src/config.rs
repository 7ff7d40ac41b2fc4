// Hermes Configuration
//
// Defines the nested configuration map for the cache optimizer, the
// handoff broker, and the worker daemon, including pruning thresholds,
// tier policies, retry/backoff shaping, and per-worker schedules.

use crate::cache::entry::EntryType;
use crate::daemon::workers::WorkerKind;
use crate::types::{ProviderConfig, ProviderType};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

// Custom serde module for Duration (serialize/deserialize as milliseconds)
pub(crate) mod serde_duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

// Custom serde module for Duration (serialize/deserialize as seconds)
pub(crate) mod serde_duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}

/// Entry types and content patterns exempt from pruning and demotion
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreservePatterns {
    /// Entry types that are never pruned or demoted
    pub types: Vec<EntryType>,

    /// Regex patterns; matching content is never pruned or demoted
    pub regexes: Vec<String>,
}

impl Default for PreservePatterns {
    fn default() -> Self {
        Self {
            types: vec![EntryType::SystemPrompt, EntryType::ClaudeMd],
            regexes: Vec::new(),
        }
    }
}

/// Pruning trigger levels and targets
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PruningConfig {
    /// Utilization at which proactive pruning starts
    pub soft_threshold: f64,

    /// Utilization at which pruning becomes mandatory
    pub hard_threshold: f64,

    /// Utilization at which forced compaction is imminent
    pub emergency_threshold: f64,

    /// Utilization target after a soft/hard prune
    pub target_utilization: f64,

    /// Entries scoring below this are eligible for deletion
    pub min_relevance_score: f32,

    /// N most-recently-accessed entries are preserved
    pub preserve_recent_count: usize,

    pub preserve_patterns: PreservePatterns,
}

impl Default for PruningConfig {
    fn default() -> Self {
        Self {
            soft_threshold: 0.6,
            hard_threshold: 0.75,
            emergency_threshold: 0.9,
            target_utilization: 0.5,
            min_relevance_score: 0.3,
            preserve_recent_count: 5,
            preserve_patterns: PreservePatterns::default(),
        }
    }
}

/// Retention policy for one tier
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TierPolicy {
    /// Token scaling when stored at this tier, in (0, 1]
    pub compression_ratio: f32,

    /// Idle time after which an entry moves to the next colder tier
    #[serde(with = "serde_duration_secs")]
    pub transition_after: Duration,
}

/// Per-tier retention policies
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TierPolicies {
    pub hot: TierPolicy,
    pub warm: TierPolicy,
    pub cold: TierPolicy,
    pub archived: TierPolicy,
}

/// Temporal compression settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemporalConfig {
    /// Whether `get` promotes the entry back to hot
    pub promote_on_access: bool,

    pub tiers: TierPolicies,
}

impl Default for TemporalConfig {
    fn default() -> Self {
        Self {
            promote_on_access: true,
            tiers: TierPolicies {
                hot: TierPolicy {
                    compression_ratio: 1.0,
                    transition_after: Duration::from_secs(300), // 5 minutes idle
                },
                warm: TierPolicy {
                    compression_ratio: 0.75,
                    transition_after: Duration::from_secs(1800), // 30 minutes idle
                },
                cold: TierPolicy {
                    compression_ratio: 0.5,
                    transition_after: Duration::from_secs(7200), // 2 hours idle
                },
                archived: TierPolicy {
                    compression_ratio: 0.3,
                    // Terminal tier; the timeout is never consulted
                    transition_after: Duration::from_secs(30 * 24 * 3600),
                },
            },
        }
    }
}

/// Weights for the relevance components; must sum to 1
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ScoringWeights {
    pub recency: f32,
    pub frequency: f32,
    pub semantic: f32,
    pub attention: f32,
    pub expert: f32,
}

impl ScoringWeights {
    pub fn sum(&self) -> f32 {
        self.recency + self.frequency + self.semantic + self.attention + self.expert
    }
}

impl Default for ScoringWeights {
    fn default() -> Self {
        Self {
            recency: 0.3,
            frequency: 0.2,
            semantic: 0.2,
            attention: 0.15,
            expert: 0.15,
        }
    }
}

/// Relevance scorer tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoringConfig {
    /// Recency decay time constant
    #[serde(with = "serde_duration_secs")]
    pub tau_recency: Duration,

    /// Access count at which the frequency component saturates
    pub frequency_max: u32,

    pub weights: ScoringWeights,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            tau_recency: Duration::from_secs(3600), // 1 hour
            frequency_max: 50,
            weights: ScoringWeights::default(),
        }
    }
}

/// Background handoff execution settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackgroundConfig {
    /// Maximum concurrently running background jobs
    pub max_concurrent: usize,

    /// Status-file polling cadence
    #[serde(with = "serde_duration_millis")]
    pub poll_interval: Duration,

    /// Work directory for rendezvous files; defaults to {base}/handoff-work
    pub work_dir: Option<PathBuf>,

    /// Maximum queued background jobs
    pub queue_size: usize,
}

impl Default for BackgroundConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 3,
            poll_interval: Duration::from_millis(500),
            work_dir: None,
            queue_size: 100,
        }
    }
}

/// Exponential backoff for transient provider failures
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    pub max_retries: u32,

    #[serde(with = "serde_duration_millis")]
    pub base_delay: Duration,

    #[serde(with = "serde_duration_millis")]
    pub max_delay: Duration,

    pub backoff_factor: f64,
}

impl RetryConfig {
    /// Delay before attempt `attempt + 1`: min(base * factor^attempt, max)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base = self.base_delay.as_millis() as f64;
        let delay = base * self.backoff_factor.powi(attempt as i32);
        let capped = delay.min(self.max_delay.as_millis() as f64);
        Duration::from_millis(capped as u64)
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            backoff_factor: 2.0,
        }
    }
}

/// External-call timeouts
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutConfig {
    /// Per-attempt provider call timeout
    #[serde(with = "serde_duration_secs")]
    pub request: Duration,

    /// Total timeout across retries
    #[serde(with = "serde_duration_secs")]
    pub total: Duration,

    /// Streaming response timeout
    #[serde(with = "serde_duration_secs")]
    pub stream: Duration,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            request: Duration::from_secs(60),
            total: Duration::from_secs(180),
            stream: Duration::from_secs(120),
        }
    }
}

/// Schedule for one worker type
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerSchedule {
    #[serde(with = "serde_duration_millis")]
    pub interval: Duration,

    /// Stagger offset applied to the first run
    #[serde(with = "serde_duration_millis")]
    pub offset: Duration,

    pub priority: u32,
    pub description: String,
    pub enabled: bool,
}

/// Worker daemon settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkersConfig {
    /// Maximum concurrently running workers
    pub max_concurrent: usize,

    /// Per-run timeout
    #[serde(with = "serde_duration_millis")]
    pub worker_timeout: Duration,

    /// Grace period for running workers at shutdown
    #[serde(with = "serde_duration_millis")]
    pub shutdown_timeout: Duration,

    /// Per-worker schedules
    pub schedules: HashMap<WorkerKind, WorkerSchedule>,
}

impl Default for WorkersConfig {
    fn default() -> Self {
        let mut schedules = HashMap::new();
        schedules.insert(
            WorkerKind::Consolidation,
            WorkerSchedule {
                interval: Duration::from_secs(900),
                offset: Duration::from_secs(30),
                priority: 1,
                description: "Consolidate context tiers and prune low-relevance entries"
                    .to_string(),
                enabled: true,
            },
        );
        schedules.insert(
            WorkerKind::CodebaseMap,
            WorkerSchedule {
                interval: Duration::from_secs(3600),
                offset: Duration::from_secs(60),
                priority: 2,
                description: "Map the project tree by language and size".to_string(),
                enabled: true,
            },
        );
        schedules.insert(
            WorkerKind::Performance,
            WorkerSchedule {
                interval: Duration::from_secs(1800),
                offset: Duration::from_secs(120),
                priority: 3,
                description: "Collect resource and pipeline latency figures".to_string(),
                enabled: true,
            },
        );
        schedules.insert(
            WorkerKind::TestGaps,
            WorkerSchedule {
                interval: Duration::from_secs(7200),
                offset: Duration::from_secs(180),
                priority: 4,
                description: "Locate source directories without test coverage".to_string(),
                enabled: true,
            },
        );
        schedules.insert(
            WorkerKind::SecurityAudit,
            WorkerSchedule {
                interval: Duration::from_secs(21600),
                offset: Duration::from_secs(240),
                priority: 5,
                description: "Scan sources for risky patterns and embedded secrets".to_string(),
                enabled: true,
            },
        );
        schedules.insert(
            WorkerKind::Benchmark,
            WorkerSchedule {
                interval: Duration::from_secs(86400),
                offset: Duration::from_secs(300),
                priority: 6,
                description: "Micro-benchmark token counting and scoring".to_string(),
                enabled: false,
            },
        );

        Self {
            max_concurrent: 2,
            worker_timeout: Duration::from_secs(300),
            shutdown_timeout: Duration::from_secs(10),
            schedules,
        }
    }
}

/// Admission gates for worker execution
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceThresholds {
    /// Maximum 1-minute load average divided by logical core count
    pub max_cpu_load: f64,

    /// Minimum free memory percentage required to start a worker
    pub min_free_memory_percent: f64,
}

impl Default for ResourceThresholds {
    fn default() -> Self {
        Self {
            max_cpu_load: 0.9,
            min_free_memory_percent: 10.0,
        }
    }
}

/// Persistent store settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Base directory for all persisted state; defaults to the platform
    /// data dir under "hermes"
    pub base_dir: Option<PathBuf>,

    /// Dirty-state flush cadence
    #[serde(with = "serde_duration_millis")]
    pub auto_save_interval: Duration,

    /// Queue records beyond this are cleaned up oldest-terminal-first
    pub max_queue_items: usize,
}

impl StoreConfig {
    /// Resolve the effective base directory
    pub fn resolved_base_dir(&self) -> PathBuf {
        self.base_dir.clone().unwrap_or_else(|| {
            dirs::data_local_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("hermes")
        })
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            base_dir: None,
            auto_save_interval: Duration::from_secs(5),
            max_queue_items: 200,
        }
    }
}

/// Circuit breaker shaping, applied per provider
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerConfig {
    /// Failures within the rolling window that open the breaker
    pub failure_threshold: u32,

    #[serde(with = "serde_duration_millis")]
    pub rolling_window: Duration,

    /// Open duration before a half-open probe is permitted
    #[serde(with = "serde_duration_millis")]
    pub cooldown: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            rolling_window: Duration::from_secs(60),
            cooldown: Duration::from_secs(30),
        }
    }
}

/// Leaky-bucket request shaping, applied per provider
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Bucket capacity in requests
    pub capacity: f64,

    /// Refill rate in requests per second
    pub refill_per_sec: f64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            capacity: 10.0,
            refill_per_sec: 2.0,
        }
    }
}

fn default_context_window() -> usize {
    200_000
}

/// Top-level Hermes configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HermesConfig {
    /// Context window size in tokens for utilization accounting
    #[serde(default = "default_context_window")]
    pub context_window_size: usize,

    pub pruning: PruningConfig,
    pub temporal: TemporalConfig,
    pub scoring: ScoringConfig,
    pub background: BackgroundConfig,
    pub retry: RetryConfig,
    pub timeout: TimeoutConfig,
    pub workers: WorkersConfig,
    pub resource_thresholds: ResourceThresholds,
    pub store: StoreConfig,
    pub breaker: BreakerConfig,
    pub rate_limit: RateLimitConfig,

    /// Configured model endpoints
    pub providers: Vec<ProviderConfig>,
}

impl Default for HermesConfig {
    fn default() -> Self {
        Self {
            context_window_size: default_context_window(),
            pruning: PruningConfig::default(),
            temporal: TemporalConfig::default(),
            scoring: ScoringConfig::default(),
            background: BackgroundConfig::default(),
            retry: RetryConfig::default(),
            timeout: TimeoutConfig::default(),
            workers: WorkersConfig::default(),
            resource_thresholds: ResourceThresholds::default(),
            store: StoreConfig::default(),
            breaker: BreakerConfig::default(),
            rate_limit: RateLimitConfig::default(),
            providers: Vec::new(),
        }
    }
}

impl HermesConfig {
    /// Load configuration from TOML file
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml(&contents)
    }

    /// Load configuration from TOML string
    pub fn from_toml(toml_str: &str) -> Result<Self, ConfigError> {
        let config: HermesConfig = toml::from_str(toml_str)?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to TOML file
    pub fn to_file(&self, path: &Path) -> Result<(), ConfigError> {
        let toml_str = toml::to_string_pretty(self)
            .map_err(|e| ConfigError::ValidationError(e.to_string()))?;
        std::fs::write(path, toml_str)?;
        Ok(())
    }

    /// A default configuration with one local provider
    pub fn with_local_provider() -> Self {
        let mut config = Self::default();
        config.providers.push(ProviderConfig {
            name: "local-ollama".to_string(),
            provider_type: ProviderType::Ollama,
            endpoint: "http://localhost:11434".to_string(),
            model: "llama3.1".to_string(),
            priority: 1,
            healthy: true,
            api_key: None,
        });
        config
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), ConfigError> {
        let p = &self.pruning;
        if !(p.soft_threshold < p.hard_threshold && p.hard_threshold < p.emergency_threshold) {
            return Err(ConfigError::ValidationError(
                "pruning: thresholds must satisfy soft < hard < emergency".to_string(),
            ));
        }
        if p.emergency_threshold > 1.0 {
            return Err(ConfigError::ValidationError(
                "pruning: emergency_threshold must be <= 1.0".to_string(),
            ));
        }
        if p.target_utilization >= p.soft_threshold {
            return Err(ConfigError::ValidationError(
                "pruning: target_utilization must be below soft_threshold".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&p.min_relevance_score) {
            return Err(ConfigError::ValidationError(
                "pruning: min_relevance_score must be in [0, 1]".to_string(),
            ));
        }
        for pattern in &p.preserve_patterns.regexes {
            regex::Regex::new(pattern).map_err(|e| {
                ConfigError::ValidationError(format!("pruning: invalid preserve regex: {}", e))
            })?;
        }

        for (name, tier) in [
            ("hot", &self.temporal.tiers.hot),
            ("warm", &self.temporal.tiers.warm),
            ("cold", &self.temporal.tiers.cold),
            ("archived", &self.temporal.tiers.archived),
        ] {
            if !(tier.compression_ratio > 0.0 && tier.compression_ratio <= 1.0) {
                return Err(ConfigError::ValidationError(format!(
                    "temporal: {} compression_ratio must be in (0, 1]",
                    name
                )));
            }
        }

        let weight_sum = self.scoring.weights.sum();
        if (weight_sum - 1.0).abs() > 0.001 {
            return Err(ConfigError::ValidationError(format!(
                "scoring: weights must sum to 1.0, got {}",
                weight_sum
            )));
        }

        if self.background.max_concurrent == 0 {
            return Err(ConfigError::ValidationError(
                "background: max_concurrent must be at least 1".to_string(),
            ));
        }
        if self.workers.max_concurrent == 0 {
            return Err(ConfigError::ValidationError(
                "workers: max_concurrent must be at least 1".to_string(),
            ));
        }

        if self.retry.backoff_factor < 1.0 {
            return Err(ConfigError::ValidationError(
                "retry: backoff_factor must be >= 1.0".to_string(),
            ));
        }
        if self.retry.max_delay < self.retry.base_delay {
            return Err(ConfigError::ValidationError(
                "retry: max_delay must be >= base_delay".to_string(),
            ));
        }

        if self.breaker.failure_threshold == 0 {
            return Err(ConfigError::ValidationError(
                "breaker: failure_threshold must be at least 1".to_string(),
            ));
        }
        if self.rate_limit.capacity <= 0.0 || self.rate_limit.refill_per_sec <= 0.0 {
            return Err(ConfigError::ValidationError(
                "rate_limit: capacity and refill_per_sec must be positive".to_string(),
            ));
        }

        let mut seen = std::collections::HashSet::new();
        for provider in &self.providers {
            if !seen.insert(provider.name.as_str()) {
                return Err(ConfigError::ValidationError(format!(
                    "providers: duplicate provider name '{}'",
                    provider.name
                )));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = HermesConfig::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_threshold_order() {
        let mut config = HermesConfig::default();
        config.pruning.soft_threshold = 0.95;

        let result = config.validate();
        assert!(result.is_err());
        assert!(result
            .unwrap_err()
            .to_string()
            .contains("soft < hard < emergency"));
    }

    #[test]
    fn test_validate_weights_sum() {
        let mut config = HermesConfig::default();
        config.scoring.weights.recency = 0.9;

        let result = config.validate();
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("sum to 1.0"));
    }

    #[test]
    fn test_validate_bad_regex() {
        let mut config = HermesConfig::default();
        config
            .pruning
            .preserve_patterns
            .regexes
            .push("[unclosed".to_string());

        assert!(config.validate().is_err());
    }

    #[test]
    fn test_backoff_delays_capped() {
        let retry = RetryConfig {
            max_retries: 10,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(800),
            backoff_factor: 2.0,
        };

        assert_eq!(retry.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(retry.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(retry.delay_for_attempt(2), Duration::from_millis(400));
        assert_eq!(retry.delay_for_attempt(3), Duration::from_millis(800));
        // Capped from here on
        assert_eq!(retry.delay_for_attempt(4), Duration::from_millis(800));
        assert_eq!(retry.delay_for_attempt(9), Duration::from_millis(800));
    }

    #[test]
    fn test_from_toml() {
        let toml_str = r#"
            context_window_size = 100000

            [pruning]
            soft_threshold = 0.5
            hard_threshold = 0.7
            emergency_threshold = 0.9
            target_utilization = 0.4
            min_relevance_score = 0.25
            preserve_recent_count = 3

            [pruning.preserve_patterns]
            types = ["system_prompt"]
            regexes = ["^IMPORTANT"]

            [retry]
            max_retries = 5
            base_delay = 250
            max_delay = 10000
            backoff_factor = 1.5
        "#;

        let config = HermesConfig::from_toml(toml_str).unwrap();
        assert_eq!(config.context_window_size, 100_000);
        assert_eq!(config.pruning.preserve_recent_count, 3);
        assert_eq!(config.retry.max_retries, 5);
        assert_eq!(config.retry.base_delay, Duration::from_millis(250));
        // Untouched sections fall back to defaults
        assert_eq!(config.workers.max_concurrent, 2);
    }

    #[test]
    fn test_serialize_deserialize() {
        let config = HermesConfig::with_local_provider();
        let toml_str = toml::to_string(&config).unwrap();
        let deserialized: HermesConfig = toml::from_str(&toml_str).unwrap();

        assert_eq!(
            config.pruning.soft_threshold,
            deserialized.pruning.soft_threshold
        );
        assert_eq!(config.providers.len(), deserialized.providers.len());
        assert_eq!(
            config.workers.schedules.len(),
            deserialized.workers.schedules.len()
        );
    }
}
