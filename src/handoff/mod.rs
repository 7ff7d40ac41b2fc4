//! Model handoff pipeline: broker, circuit breakers, rate limiters, and
//! the out-of-process job executor.

pub mod background;
pub mod breaker;
pub mod manager;

pub use background::{
    BackgroundHandler, ChildJob, HandoffEvent, JobExecutor, JobHandle, ProcessExecutor, StatusDoc,
};
pub use breaker::{
    BreakerRegistry, BreakerState, CircuitBreaker, RateDecision, RateLimiter, RateLimiterRegistry,
};
pub use manager::{HandoffManager, RequestSpec};

use crate::error::{HermesError, Result};
use crate::providers::AdapterRegistry;
use crate::types::ProviderConfig;

/// Resolve the provider a request should go to
///
/// A named hint must exist and be healthy. Auto-selection walks healthy
/// providers in ascending priority, health-checking each until one
/// responds.
pub(crate) async fn select_provider(
    providers: &[ProviderConfig],
    hint: &str,
    adapters: &AdapterRegistry,
) -> Result<ProviderConfig> {
    if hint != "auto" {
        let cfg = providers
            .iter()
            .find(|p| p.name == hint)
            .ok_or_else(|| HermesError::Configuration(format!("unknown provider '{}'", hint)))?;
        if !cfg.healthy {
            return Err(HermesError::Configuration(format!(
                "provider '{}' is marked unhealthy",
                hint
            )));
        }
        return Ok(cfg.clone());
    }

    let mut healthy: Vec<&ProviderConfig> = providers.iter().filter(|p| p.healthy).collect();
    healthy.sort_by_key(|p| p.priority);

    for cfg in healthy {
        if adapters.get(cfg.provider_type).health_check(cfg).await {
            return Ok(cfg.clone());
        }
    }

    Err(HermesError::Configuration(
        "no healthy provider available".to_string(),
    ))
}
