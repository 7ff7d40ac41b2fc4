//! Handoff manager: the in-process request broker
//!
//! Owns the queue, selects providers, applies the breaker/rate-limiter
//! admission checks, retries transient failures with exponential
//! backoff, and dispatches background jobs to the child-process
//! executor. All failures surface as failed responses; the broker never
//! throws across its public boundary once a request has been accepted.

use super::background::{BackgroundHandler, ChildJob, HandoffEvent};
use super::breaker::{BreakerRegistry, RateLimiterRegistry};
use super::select_provider;
use crate::config::HermesConfig;
use crate::error::{HermesError, Result};
use crate::providers::{classify_failure, AdapterRegistry, FailureKind, ProviderAdapter};
use crate::store::PersistentStore;
use crate::types::{
    HandoffMetrics, HandoffOptions, HandoffQueueItem, HandoffRequest, HandoffResponse,
    HandoffStatus, MetricsSnapshot, ProviderConfig, ProviderType, RequestId, RequestMetadata,
    Role,
};
use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, RwLock, Weak};
use std::time::Instant;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Completion callback invoked when a request finishes
pub type CompletionCallback = Box<dyn Fn(&HandoffResponse) + Send + Sync>;

/// Caller-facing request description consumed by `create_request`
#[derive(Debug, Clone, Default)]
pub struct RequestSpec {
    /// Provider name, or empty for auto-selection
    pub provider: Option<String>,
    pub system_prompt: Option<String>,
    pub prompt: String,
    pub context: Vec<(Role, String)>,
    pub callback_instructions: Option<String>,
    pub session_id: Option<String>,
    pub task_id: Option<String>,
    pub source: String,
    pub tags: Vec<String>,
    pub options: Option<HandoffOptions>,
}

/// The broker
pub struct HandoffManager {
    config: HermesConfig,
    providers: RwLock<Vec<ProviderConfig>>,
    adapters: AdapterRegistry,
    breakers: BreakerRegistry,
    limiters: RateLimiterRegistry,
    store: Arc<PersistentStore>,
    background: BackgroundHandler,
    metrics: Mutex<HandoffMetrics>,
    callbacks: Mutex<HashMap<RequestId, CompletionCallback>>,
    active: Mutex<HashSet<RequestId>>,
    next_position: AtomicU64,
    shutting_down: AtomicBool,
    weak_self: OnceLock<Weak<HandoffManager>>,
}

impl HandoffManager {
    pub fn new(config: HermesConfig, store: Arc<PersistentStore>) -> Result<Arc<Self>> {
        let work_dir = config
            .background
            .work_dir
            .clone()
            .unwrap_or_else(|| store.handoff_work_dir());
        let background = BackgroundHandler::new(work_dir, config.background.poll_interval)?;
        Self::build(config, store, background)
    }

    /// Construct with a custom background handler (tests substitute the
    /// job executor here)
    pub fn with_background(
        config: HermesConfig,
        store: Arc<PersistentStore>,
        background: BackgroundHandler,
    ) -> Result<Arc<Self>> {
        Self::build(config, store, background)
    }

    fn build(
        config: HermesConfig,
        store: Arc<PersistentStore>,
        background: BackgroundHandler,
    ) -> Result<Arc<Self>> {
        let adapters = AdapterRegistry::new(&config.timeout)?;

        // Positions continue past anything already persisted
        let next_position = store
            .list_by_status(HandoffStatus::Pending)
            .iter()
            .chain(store.list_by_status(HandoffStatus::Processing).iter())
            .map(|i| i.position + 1)
            .max()
            .unwrap_or(0);

        let metrics = store.current_metrics();

        let manager = Arc::new(Self {
            breakers: BreakerRegistry::new(config.breaker.clone()),
            limiters: RateLimiterRegistry::new(config.rate_limit.clone()),
            providers: RwLock::new(config.providers.clone()),
            adapters,
            store,
            background,
            metrics: Mutex::new(metrics),
            callbacks: Mutex::new(HashMap::new()),
            active: Mutex::new(HashSet::new()),
            next_position: AtomicU64::new(next_position),
            shutting_down: AtomicBool::new(false),
            weak_self: OnceLock::new(),
            config,
        });
        let _ = manager.weak_self.set(Arc::downgrade(&manager));
        Ok(manager)
    }

    /// Refresh provider health and re-adopt any jobs left over from a
    /// previous process
    pub async fn initialize(&self) -> Result<()> {
        self.health_check_all().await;

        for (id, status) in self.background.adopt_orphans() {
            if let Some(mut item) = self.store.get_queue_item(id) {
                if !item.status.is_terminal() && status.status.is_terminal() {
                    item.status = status.status;
                    item.completed_at = Some(status.updated_at);
                    item.response = self.background.read_output(id);
                    self.store.upsert_queue_item(item);
                    self.background.cleanup(id);
                }
            }
        }

        info!(
            "Handoff manager initialized with {} providers",
            self.providers.read().expect("providers poisoned").len()
        );
        Ok(())
    }

    /// Replace the adapter used for a provider type
    pub fn insert_adapter(&self, provider_type: ProviderType, adapter: Arc<dyn ProviderAdapter>) {
        self.adapters.insert(provider_type, adapter);
    }

    /// Subscribe to background execution events
    pub fn subscribe(&self) -> broadcast::Receiver<HandoffEvent> {
        self.background.subscribe()
    }

    /// Build a request from a spec, assigning its id and metadata
    pub fn create_request(&self, spec: RequestSpec) -> HandoffRequest {
        HandoffRequest {
            id: RequestId::new(),
            provider_hint: spec.provider.unwrap_or_else(|| "auto".to_string()),
            system_prompt: spec.system_prompt,
            prompt: spec.prompt,
            context: spec
                .context
                .into_iter()
                .map(|(role, content)| crate::types::ContextMessage { role, content })
                .collect(),
            callback_instructions: spec.callback_instructions,
            metadata: RequestMetadata {
                session_id: spec.session_id,
                task_id: spec.task_id,
                source: spec.source,
                tags: spec.tags,
                created_at: Some(Utc::now()),
            },
            options: spec.options.unwrap_or_default(),
        }
    }

    /// Register a completion callback for a request
    pub fn on_complete(&self, id: RequestId, callback: CompletionCallback) {
        self.callbacks
            .lock()
            .expect("callbacks poisoned")
            .insert(id, callback);
    }

    /// Synchronous dispatch: select, admit, call, retry, report
    pub async fn send(&self, req: &HandoffRequest) -> HandoffResponse {
        let started = Instant::now();
        {
            let mut metrics = self.metrics.lock().expect("metrics poisoned");
            metrics.total_requests += 1;
        }

        let providers = self.providers.read().expect("providers poisoned").clone();
        let cfg = match select_provider(&providers, &req.provider_hint, &self.adapters).await {
            Ok(cfg) => cfg,
            Err(e) => {
                return self.finish_failed(
                    req,
                    HandoffResponse::failed(req.id, "", "", format!("config: {}", e)),
                    None,
                );
            }
        };
        let adapter = self.adapters.get(cfg.provider_type);

        let total_deadline = tokio::time::Instant::now() + self.config.timeout.total;
        let mut attempt = 0u32;

        loop {
            // Breaker open short-circuits without touching the adapter
            if !self.breakers.allow(&cfg.name) {
                let response = HandoffResponse::failed(
                    req.id,
                    &cfg.name,
                    &cfg.model,
                    format!("resource: circuit breaker open for '{}'", cfg.name),
                );
                return self.finish_failed(req, response, None);
            }

            // Rate refusal retries with backoff rather than failing fast
            let rate = self.limiters.allow(&cfg.name);
            if !rate.allowed {
                if attempt >= self.config.retry.max_retries {
                    let response = HandoffResponse::failed(
                        req.id,
                        &cfg.name,
                        &cfg.model,
                        format!("resource: rate limit exceeded for '{}'", cfg.name),
                    );
                    return self.finish_failed(req, response, Some(&cfg.name));
                }
                let wait = rate
                    .retry_after
                    .unwrap_or_default()
                    .max(self.config.retry.delay_for_attempt(attempt));
                debug!("Rate limited on '{}', retrying in {:?}", cfg.name, wait);
                tokio::time::sleep(wait).await;
                attempt += 1;
                continue;
            }

            let outcome =
                tokio::time::timeout(self.config.timeout.request, adapter.send(req, &cfg)).await;
            let mut response = match outcome {
                Ok(r) => r,
                Err(_) => HandoffResponse::failed(
                    req.id,
                    &cfg.name,
                    &cfg.model,
                    format!("timeout: attempt exceeded {:?}", self.config.timeout.request),
                ),
            };

            if response.status == HandoffStatus::Completed {
                self.breakers.record_success(&cfg.name);
                response.duration_ms = started.elapsed().as_millis() as u64;
                {
                    let mut metrics = self.metrics.lock().expect("metrics poisoned");
                    metrics.record_success(
                        &cfg.name,
                        response.tokens.total as u64,
                        response.duration_ms,
                    );
                    self.store.set_current_metrics(metrics.clone());
                }
                self.invoke_callback(&response);
                return response;
            }

            let kind = classify_failure(&response);
            let retry_budget = match kind {
                FailureKind::Configuration => 0,
                FailureKind::Protocol => self.config.retry.max_retries / 2,
                FailureKind::Transient => self.config.retry.max_retries,
            };

            if attempt >= retry_budget {
                response.duration_ms = started.elapsed().as_millis() as u64;
                return self.finish_failed(req, response, Some(&cfg.name));
            }

            let delay = self.config.retry.delay_for_attempt(attempt);
            if tokio::time::Instant::now() + delay >= total_deadline {
                response.error = Some(format!(
                    "timeout: total retry budget exhausted after {:?} ({})",
                    self.config.timeout.total,
                    response.error.as_deref().unwrap_or("unknown"),
                ));
                response.duration_ms = started.elapsed().as_millis() as u64;
                return self.finish_failed(req, response, Some(&cfg.name));
            }

            debug!(
                "Attempt {} on '{}' failed ({:?}), retrying in {:?}",
                attempt, cfg.name, kind, delay
            );
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }

    /// Terminal failure bookkeeping: breaker, metrics, callback
    fn finish_failed(
        &self,
        _req: &HandoffRequest,
        response: HandoffResponse,
        breaker_key: Option<&str>,
    ) -> HandoffResponse {
        if let Some(name) = breaker_key {
            self.breakers.record_failure(name);
        }
        {
            let mut metrics = self.metrics.lock().expect("metrics poisoned");
            metrics.failed += 1;
            self.store.set_current_metrics(metrics.clone());
        }
        self.invoke_callback(&response);
        response
    }

    fn invoke_callback(&self, response: &HandoffResponse) {
        let callback = self
            .callbacks
            .lock()
            .expect("callbacks poisoned")
            .remove(&response.request_id);
        if let Some(callback) = callback {
            callback(response);
        }
    }

    /// Enqueue for background execution; starts immediately when a
    /// concurrency slot is free
    pub async fn send_background(&self, req: HandoffRequest) -> Result<RequestId> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(HermesError::Cancelled("manager shutting down".to_string()));
        }

        let pending = self.store.list_by_status(HandoffStatus::Pending).len();
        if pending >= self.config.background.queue_size {
            return Err(HermesError::ResourceRefused(format!(
                "background queue full ({} pending)",
                pending
            )));
        }

        let id = req.id;
        let position = self.next_position.fetch_add(1, Ordering::SeqCst);
        {
            let mut metrics = self.metrics.lock().expect("metrics poisoned");
            metrics.total_requests += 1;
        }

        self.store.upsert_queue_item(HandoffQueueItem {
            request: req,
            status: HandoffStatus::Pending,
            position,
            added_at: Utc::now(),
            started_at: None,
            completed_at: None,
            response: None,
            retries: 0,
        });

        self.start_pending().await;
        Ok(id)
    }

    /// Start pending items, smallest position first, while slots remain
    async fn start_pending(&self) {
        loop {
            if self.shutting_down.load(Ordering::SeqCst) {
                return;
            }
            // Claim under the lock so concurrent drains never double-start
            let next = {
                let mut active = self.active.lock().expect("active poisoned");
                if active.len() >= self.config.background.max_concurrent {
                    return;
                }
                let item = self
                    .store
                    .list_by_status(HandoffStatus::Pending)
                    .into_iter()
                    .find(|item| !active.contains(&item.request.id));
                if let Some(item) = &item {
                    active.insert(item.request.id);
                }
                item
            };
            let Some(mut item) = next else { return };
            let id = item.request.id;

            item.status = HandoffStatus::Processing;
            item.started_at = Some(Utc::now());
            self.store.upsert_queue_item(item.clone());

            let job = ChildJob {
                request: item.request.clone(),
                providers: self.providers.read().expect("providers poisoned").clone(),
                retry: self.config.retry.clone(),
                timeout: self.config.timeout.clone(),
            };

            if let Err(e) = self.background.start(&job).await {
                warn!("Failed to start background handoff {}: {}", id, e);
                self.active.lock().expect("active poisoned").remove(&id);
                item.status = HandoffStatus::Failed;
                item.completed_at = Some(Utc::now());
                item.response = Some(HandoffResponse::failed(
                    id,
                    "",
                    "",
                    format!("config: spawn failed: {}", e),
                ));
                self.store.upsert_queue_item(item);
                let mut metrics = self.metrics.lock().expect("metrics poisoned");
                metrics.failed += 1;
                continue;
            }

            self.spawn_monitor(id);
        }
    }

    /// Watch one background job to completion, then drain the queue
    fn spawn_monitor(&self, id: RequestId) {
        let Some(weak) = self.weak_self.get().cloned() else {
            return;
        };
        let total_timeout = self.config.timeout.total;

        tokio::spawn(async move {
            let Some(manager) = weak.upgrade() else { return };
            let response = manager
                .background
                .wait_for_completion(id, total_timeout)
                .await;

            if let Some(mut item) = manager.store.get_queue_item(id) {
                // Cancellation already finalized the record
                if !item.status.is_terminal() {
                    item.status = response.status;
                    item.completed_at = Some(Utc::now());
                    item.response = Some(response.clone());
                    manager.store.upsert_queue_item(item);

                    let mut metrics = manager.metrics.lock().expect("metrics poisoned");
                    match response.status {
                        HandoffStatus::Completed => metrics.record_success(
                            &response.provider,
                            response.tokens.total as u64,
                            response.duration_ms,
                        ),
                        HandoffStatus::Cancelled => metrics.cancelled += 1,
                        _ => metrics.failed += 1,
                    }
                    manager.store.set_current_metrics(metrics.clone());
                }
            }

            manager.invoke_callback(&response);
            if response.status != HandoffStatus::Timeout {
                manager.background.cleanup(id);
            }
            manager.active.lock().expect("active poisoned").remove(&id);
            manager.start_pending().await;
        });
    }

    pub fn get_status(&self, id: RequestId) -> Option<HandoffStatus> {
        self.store.get_queue_item(id).map(|i| i.status)
    }

    /// Poll the queue until the request completes or the timeout lapses
    ///
    /// On timeout the queue record is marked `Timeout` and None is
    /// returned.
    pub async fn get_response(
        &self,
        id: RequestId,
        timeout: std::time::Duration,
    ) -> Option<HandoffResponse> {
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            match self.store.get_queue_item(id) {
                Some(item) if item.status.is_terminal() => {
                    return item.response.or_else(|| {
                        let mut r = HandoffResponse::failed(
                            id,
                            "",
                            "",
                            format!("terminal without response ({})", item.status),
                        );
                        r.status = item.status;
                        Some(r)
                    });
                }
                Some(_) => {}
                None => return None,
            }

            if tokio::time::Instant::now() >= deadline {
                if let Some(mut item) = self.store.get_queue_item(id) {
                    if !item.status.is_terminal() {
                        item.status = HandoffStatus::Timeout;
                        item.completed_at = Some(Utc::now());
                        self.store.upsert_queue_item(item);
                    }
                }
                return None;
            }
            tokio::time::sleep(self.config.background.poll_interval).await;
        }
    }

    /// Cancel a queued or processing request
    pub async fn cancel(&self, id: RequestId) -> bool {
        let Some(mut item) = self.store.get_queue_item(id) else {
            return false;
        };

        match item.status {
            HandoffStatus::Pending => {
                item.status = HandoffStatus::Cancelled;
                item.completed_at = Some(Utc::now());
                self.store.upsert_queue_item(item);
            }
            HandoffStatus::Processing => {
                if let Err(e) = self.background.cancel(id).await {
                    warn!("Cancel of {} failed: {}", id, e);
                }
                item.status = HandoffStatus::Cancelled;
                item.completed_at = Some(Utc::now());
                self.store.upsert_queue_item(item);
                self.active.lock().expect("active poisoned").remove(&id);
                self.start_pending().await;
            }
            _ => return false,
        }

        let mut metrics = self.metrics.lock().expect("metrics poisoned");
        metrics.cancelled += 1;
        self.store.set_current_metrics(metrics.clone());
        info!("Handoff {} cancelled", id);
        true
    }

    /// Refresh the healthy flag of every configured provider
    pub async fn health_check_all(&self) -> HashMap<String, bool> {
        let snapshot = self.providers.read().expect("providers poisoned").clone();
        let mut results = HashMap::new();

        for cfg in &snapshot {
            let healthy = self.adapters.get(cfg.provider_type).health_check(cfg).await;
            results.insert(cfg.name.clone(), healthy);
        }

        let mut providers = self.providers.write().expect("providers poisoned");
        for cfg in providers.iter_mut() {
            if let Some(healthy) = results.get(&cfg.name) {
                cfg.healthy = *healthy;
            }
        }
        results
    }

    pub fn add_provider(&self, cfg: ProviderConfig) {
        self.providers
            .write()
            .expect("providers poisoned")
            .push(cfg);
    }

    pub fn remove_provider(&self, name: &str) -> bool {
        let mut providers = self.providers.write().expect("providers poisoned");
        let before = providers.len();
        providers.retain(|p| p.name != name);
        providers.len() != before
    }

    /// Whether any configured provider is currently marked healthy
    pub fn any_provider_healthy(&self) -> bool {
        self.providers
            .read()
            .expect("providers poisoned")
            .iter()
            .any(|p| p.healthy)
    }

    /// Append a delimited callback-instruction block to the response
    /// content, recording the text verbatim for traceability
    pub fn inject_instructions(&self, response: &mut HandoffResponse, text: &str) {
        response.content.push_str(&format!(
            "\n\n[HANDOFF CALLBACK INSTRUCTIONS]\n{}\n[/HANDOFF CALLBACK INSTRUCTIONS]",
            text
        ));
        response.injected_instructions = Some(text.to_string());
    }

    /// Drop finished records from the queue
    pub fn clear_completed(&self) -> usize {
        self.store.clear_completed()
    }

    pub fn get_metrics(&self) -> HandoffMetrics {
        self.metrics.lock().expect("metrics poisoned").clone()
    }

    /// Stop accepting work, snapshot metrics, and notify subscribers
    pub async fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
        {
            let metrics = self.metrics.lock().expect("metrics poisoned").clone();
            self.store.append_snapshot(MetricsSnapshot {
                at: Utc::now(),
                metrics: metrics.clone(),
            });
            self.store.set_current_metrics(metrics);
        }
        self.background.shutdown();
        self.store.flush();
        info!("Handoff manager shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoreConfig;
    use crate::providers::StreamOptions;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;
    use tempfile::TempDir;

    /// Adapter that replays a script of statuses ("ok" or an error
    /// string) and counts calls
    struct ScriptedAdapter {
        script: Mutex<VecDeque<std::result::Result<String, String>>>,
        calls: AtomicU32,
    }

    impl ScriptedAdapter {
        fn new(script: Vec<std::result::Result<String, String>>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.into()),
                calls: AtomicU32::new(0),
            })
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ProviderAdapter for ScriptedAdapter {
        async fn health_check(&self, _cfg: &ProviderConfig) -> bool {
            true
        }

        async fn send(&self, req: &HandoffRequest, cfg: &ProviderConfig) -> HandoffResponse {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let step = self
                .script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Err("http 500: script exhausted".to_string()));
            match step {
                Ok(content) => HandoffResponse {
                    request_id: req.id,
                    provider: cfg.name.clone(),
                    model: cfg.model.clone(),
                    content,
                    tokens: crate::types::TokenUsage::new(10, 5),
                    duration_ms: 1,
                    status: HandoffStatus::Completed,
                    error: None,
                    injected_instructions: None,
                    completed_at: Some(Utc::now()),
                },
                Err(error) => HandoffResponse::failed(req.id, &cfg.name, &cfg.model, error),
            }
        }

        async fn stream(
            &self,
            req: &HandoffRequest,
            cfg: &ProviderConfig,
            _opts: &StreamOptions,
        ) -> HandoffResponse {
            self.send(req, cfg).await
        }
    }

    fn test_config(dir: &TempDir) -> HermesConfig {
        let mut config = HermesConfig::default();
        config.store = StoreConfig {
            base_dir: Some(dir.path().to_path_buf()),
            auto_save_interval: Duration::from_secs(3600),
            max_queue_items: 100,
        };
        config.retry.base_delay = Duration::from_millis(10);
        config.retry.max_delay = Duration::from_millis(200);
        config.retry.backoff_factor = 2.0;
        config.retry.max_retries = 3;
        config.background.poll_interval = Duration::from_millis(10);
        config.providers = vec![ProviderConfig {
            name: "mock".to_string(),
            provider_type: ProviderType::Ollama,
            endpoint: "http://localhost:1".to_string(),
            model: "mock-model".to_string(),
            priority: 1,
            healthy: true,
            api_key: None,
        }];
        config
    }

    fn manager_with(config: HermesConfig, adapter: Arc<ScriptedAdapter>) -> Arc<HandoffManager> {
        let store = PersistentStore::open(&config.store).unwrap();
        let manager = HandoffManager::new(config, store).unwrap();
        manager.insert_adapter(ProviderType::Ollama, adapter);
        manager
    }

    fn spec(prompt: &str) -> RequestSpec {
        RequestSpec {
            prompt: prompt.to_string(),
            source: "test".to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_retry_then_success() {
        let dir = TempDir::new().unwrap();
        let adapter = ScriptedAdapter::new(vec![
            Err("http 503: overloaded".to_string()),
            Err("http 503: overloaded".to_string()),
            Ok("ok".to_string()),
        ]);
        let manager = manager_with(test_config(&dir), adapter.clone());

        let req = manager.create_request(spec("retry me"));
        let started = Instant::now();
        let response = manager.send(&req).await;

        assert_eq!(response.status, HandoffStatus::Completed);
        assert_eq!(response.content, "ok");
        assert_eq!(adapter.calls(), 3);
        // Backoff: 10ms then 20ms before the successful third call
        assert!(started.elapsed() >= Duration::from_millis(30));

        let metrics = manager.get_metrics();
        assert_eq!(metrics.successful, 1);
        assert_eq!(metrics.by_provider.get("mock"), Some(&1));
    }

    #[tokio::test]
    async fn test_configuration_error_is_terminal() {
        let dir = TempDir::new().unwrap();
        let adapter = ScriptedAdapter::new(vec![
            Err("config: no API key for provider 'mock'".to_string()),
            Ok("never reached".to_string()),
        ]);
        let manager = manager_with(test_config(&dir), adapter.clone());

        let req = manager.create_request(spec("no key"));
        let response = manager.send(&req).await;

        assert_eq!(response.status, HandoffStatus::Failed);
        assert_eq!(adapter.calls(), 1, "configuration errors never retry");
    }

    #[tokio::test]
    async fn test_breaker_short_circuits_after_threshold() {
        let dir = TempDir::new().unwrap();
        let mut config = test_config(&dir);
        config.retry.max_retries = 0;
        config.breaker.failure_threshold = 2;
        config.breaker.cooldown = Duration::from_millis(100);

        let adapter = ScriptedAdapter::new(vec![
            Err("http 500: boom".to_string()),
            Err("http 500: boom".to_string()),
        ]);
        let manager = manager_with(config, adapter.clone());

        let req1 = manager.create_request(spec("a"));
        let req2 = manager.create_request(spec("b"));
        assert_eq!(manager.send(&req1).await.status, HandoffStatus::Failed);
        assert_eq!(manager.send(&req2).await.status, HandoffStatus::Failed);
        assert_eq!(adapter.calls(), 2);

        // Third call inside the cooldown: refused without an adapter call
        let req3 = manager.create_request(spec("c"));
        let started = Instant::now();
        let response = manager.send(&req3).await;
        assert_eq!(response.status, HandoffStatus::Failed);
        assert!(response.error.unwrap().contains("circuit breaker open"));
        assert_eq!(adapter.calls(), 2);
        assert!(started.elapsed() < Duration::from_millis(50));

        // After the cooldown a probe reaches the adapter again
        tokio::time::sleep(Duration::from_millis(110)).await;
        let req4 = manager.create_request(spec("d"));
        let _ = manager.send(&req4).await;
        assert_eq!(adapter.calls(), 3);
    }

    #[tokio::test]
    async fn test_unknown_provider_hint_fails_fast() {
        let dir = TempDir::new().unwrap();
        let adapter = ScriptedAdapter::new(vec![Ok("unused".to_string())]);
        let manager = manager_with(test_config(&dir), adapter.clone());

        let mut request_spec = spec("x");
        request_spec.provider = Some("nonexistent".to_string());
        let req = manager.create_request(request_spec);
        let response = manager.send(&req).await;

        assert_eq!(response.status, HandoffStatus::Failed);
        assert!(response.error.unwrap().contains("unknown provider"));
        assert_eq!(adapter.calls(), 0);
    }

    #[tokio::test]
    async fn test_inject_instructions_block() {
        let dir = TempDir::new().unwrap();
        let adapter = ScriptedAdapter::new(vec![Ok("answer".to_string())]);
        let manager = manager_with(test_config(&dir), adapter);

        let req = manager.create_request(spec("q"));
        let mut response = manager.send(&req).await;
        manager.inject_instructions(&mut response, "report back to session 7");

        assert!(response.content.starts_with("answer"));
        assert!(response.content.contains("[HANDOFF CALLBACK INSTRUCTIONS]"));
        assert!(response.content.contains("report back to session 7"));
        assert_eq!(
            response.injected_instructions.as_deref(),
            Some("report back to session 7")
        );
    }

    #[tokio::test]
    async fn test_on_complete_callback_fires() {
        let dir = TempDir::new().unwrap();
        let adapter = ScriptedAdapter::new(vec![Ok("done".to_string())]);
        let manager = manager_with(test_config(&dir), adapter);

        let req = manager.create_request(spec("cb"));
        let seen = Arc::new(Mutex::new(None));
        let seen_clone = seen.clone();
        manager.on_complete(
            req.id,
            Box::new(move |response| {
                *seen_clone.lock().unwrap() = Some(response.content.clone());
            }),
        );

        manager.send(&req).await;
        assert_eq!(seen.lock().unwrap().as_deref(), Some("done"));
    }
}
