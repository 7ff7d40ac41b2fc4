//! Per-provider failure isolation and request-rate shaping
//!
//! Each provider gets its own circuit breaker (closed → open →
//! half-open) and leaky-bucket rate limiter. Registries hand out
//! per-key locks so independent providers never contend.

use crate::config::{BreakerConfig, RateLimitConfig};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Breaker state machine position
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

/// Circuit breaker for a single provider
#[derive(Debug)]
pub struct CircuitBreaker {
    config: BreakerConfig,
    state: BreakerState,
    failures: VecDeque<Instant>,
    opened_at: Option<Instant>,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            state: BreakerState::Closed,
            failures: VecDeque::new(),
            opened_at: None,
        }
    }

    pub fn state(&self) -> BreakerState {
        self.state
    }

    /// Whether a request may proceed
    ///
    /// In the open state, the first call after the cooldown flips the
    /// breaker to half-open and admits exactly one probe; further calls
    /// are refused until the probe reports.
    pub fn allow(&mut self) -> bool {
        match self.state {
            BreakerState::Closed => true,
            BreakerState::Open => {
                let cooled = self
                    .opened_at
                    .map(|at| at.elapsed() >= self.config.cooldown)
                    .unwrap_or(true);
                if cooled {
                    debug!("Breaker cooldown elapsed, permitting half-open probe");
                    self.state = BreakerState::HalfOpen;
                    true
                } else {
                    false
                }
            }
            // A probe is already in flight
            BreakerState::HalfOpen => false,
        }
    }

    pub fn record_success(&mut self) {
        self.state = BreakerState::Closed;
        self.failures.clear();
        self.opened_at = None;
    }

    pub fn record_failure(&mut self) {
        let now = Instant::now();
        match self.state {
            BreakerState::HalfOpen => {
                // Probe failed: back to open for another cooldown
                self.state = BreakerState::Open;
                self.opened_at = Some(now);
            }
            _ => {
                self.failures.push_back(now);
                while let Some(front) = self.failures.front() {
                    if front.elapsed() > self.config.rolling_window {
                        self.failures.pop_front();
                    } else {
                        break;
                    }
                }
                if self.failures.len() as u32 >= self.config.failure_threshold {
                    warn!(
                        "Breaker opening after {} failures within the rolling window",
                        self.failures.len()
                    );
                    self.state = BreakerState::Open;
                    self.opened_at = Some(now);
                }
            }
        }
    }
}

/// Outcome of a rate-limiter admission check
#[derive(Debug, Clone, Copy)]
pub struct RateDecision {
    pub allowed: bool,
    pub retry_after: Option<Duration>,
}

/// Leaky-bucket limiter for a single provider
#[derive(Debug)]
pub struct RateLimiter {
    capacity: f64,
    refill_per_sec: f64,
    tokens: f64,
    last_refill: Instant,
}

impl RateLimiter {
    pub fn new(config: &RateLimitConfig) -> Self {
        Self {
            capacity: config.capacity,
            refill_per_sec: config.refill_per_sec,
            tokens: config.capacity,
            last_refill: Instant::now(),
        }
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        self.last_refill = now;
    }

    /// Take one slot, or report how long until one frees
    pub fn allow(&mut self) -> RateDecision {
        self.refill();
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            RateDecision {
                allowed: true,
                retry_after: None,
            }
        } else {
            let deficit = 1.0 - self.tokens;
            let wait = Duration::from_secs_f64(deficit / self.refill_per_sec);
            RateDecision {
                allowed: false,
                retry_after: Some(wait),
            }
        }
    }
}

/// Per-provider circuit breakers behind per-key locks
pub struct BreakerRegistry {
    config: BreakerConfig,
    breakers: Mutex<HashMap<String, Arc<Mutex<CircuitBreaker>>>>,
}

impl BreakerRegistry {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            breakers: Mutex::new(HashMap::new()),
        }
    }

    /// The breaker for a provider, created on first use
    pub fn breaker(&self, name: &str) -> Arc<Mutex<CircuitBreaker>> {
        let mut map = self.breakers.lock().expect("breaker registry poisoned");
        map.entry(name.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(CircuitBreaker::new(self.config.clone()))))
            .clone()
    }

    pub fn allow(&self, name: &str) -> bool {
        self.breaker(name).lock().expect("breaker poisoned").allow()
    }

    pub fn record_success(&self, name: &str) {
        self.breaker(name)
            .lock()
            .expect("breaker poisoned")
            .record_success();
    }

    pub fn record_failure(&self, name: &str) {
        self.breaker(name)
            .lock()
            .expect("breaker poisoned")
            .record_failure();
    }

    pub fn state(&self, name: &str) -> BreakerState {
        self.breaker(name).lock().expect("breaker poisoned").state()
    }
}

/// Per-provider rate limiters behind per-key locks
pub struct RateLimiterRegistry {
    config: RateLimitConfig,
    limiters: Mutex<HashMap<String, Arc<Mutex<RateLimiter>>>>,
}

impl RateLimiterRegistry {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            limiters: Mutex::new(HashMap::new()),
        }
    }

    pub fn limiter(&self, name: &str) -> Arc<Mutex<RateLimiter>> {
        let mut map = self.limiters.lock().expect("limiter registry poisoned");
        map.entry(name.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(RateLimiter::new(&self.config))))
            .clone()
    }

    pub fn allow(&self, name: &str) -> RateDecision {
        self.limiter(name).lock().expect("limiter poisoned").allow()
    }
}
