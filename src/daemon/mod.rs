//! Background worker daemon
//!
//! A cooperative scheduler for the fixed set of maintenance workers:
//! per-worker intervals with staggered first runs, a concurrency cap
//! with FIFO deferral, resource-gated admission, per-run timeouts, and
//! state checkpointing through the persistent store so a restarted
//! daemon resumes its schedule where it left off.

pub mod journal;
pub mod resources;
pub mod workers;

pub use journal::DaemonJournal;
pub use resources::{admit, ResourceOracle, ResourceSnapshot, StaticOracle, SysinfoOracle};
pub use workers::{run_worker, WorkerContext, WorkerKind, WorkerReport};

use crate::config::{ResourceThresholds, WorkersConfig};
use crate::error::{HermesError, Result};
use crate::store::{DaemonStateDoc, PersistentStore};
use crate::types::WorkerState;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Events emitted by the daemon
#[derive(Debug, Clone)]
pub enum WorkerEvent {
    Start(WorkerKind),
    Complete { kind: WorkerKind, duration_ms: u64 },
    Error { kind: WorkerKind, error: String },
    Deferred { kind: WorkerKind, reason: String },
    Shutdown,
}

/// The callable a worker kind maps to
///
/// The default runner executes the built-in routines; tests and
/// embedders may substitute their own.
#[async_trait]
pub trait WorkerRunner: Send + Sync {
    async fn run(&self, kind: WorkerKind, ctx: &WorkerContext) -> Result<WorkerReport>;
}

struct DefaultRunner;

#[async_trait]
impl WorkerRunner for DefaultRunner {
    async fn run(&self, kind: WorkerKind, ctx: &WorkerContext) -> Result<WorkerReport> {
        run_worker(kind, ctx).await
    }
}

/// Status document returned by `get_status`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonStatus {
    pub running: bool,
    pub started_at: Option<DateTime<Utc>>,
    pub workers: HashMap<WorkerKind, WorkerState>,
    pub pending: Vec<WorkerKind>,
    pub headless_available: bool,
}

/// The scheduled background worker pool
pub struct WorkerDaemon {
    config: WorkersConfig,
    thresholds: ResourceThresholds,
    store: Arc<PersistentStore>,
    journal: DaemonJournal,
    oracle: Box<dyn ResourceOracle>,
    runner: Arc<dyn WorkerRunner>,
    ctx: WorkerContext,

    states: Mutex<HashMap<WorkerKind, WorkerState>>,
    enabled: Mutex<HashMap<WorkerKind, bool>>,
    running: Mutex<HashSet<WorkerKind>>,
    pending: Mutex<VecDeque<WorkerKind>>,
    started_at: Mutex<Option<DateTime<Utc>>>,

    events: broadcast::Sender<WorkerEvent>,
    shutdown: CancellationToken,
    weak_self: OnceLock<Weak<WorkerDaemon>>,
}

impl WorkerDaemon {
    pub fn new(
        config: WorkersConfig,
        thresholds: ResourceThresholds,
        store: Arc<PersistentStore>,
        ctx: WorkerContext,
    ) -> Result<Arc<Self>> {
        let journal = DaemonJournal::open(&store.daemon_log_path())?;
        let enabled = config
            .schedules
            .iter()
            .map(|(kind, schedule)| (*kind, schedule.enabled))
            .collect();
        let states = config
            .schedules
            .keys()
            .map(|kind| (*kind, WorkerState::default()))
            .collect();
        let (events, _) = broadcast::channel(128);

        let daemon = Arc::new(Self {
            config,
            thresholds,
            store,
            journal,
            oracle: Box::new(SysinfoOracle::new()),
            runner: Arc::new(DefaultRunner),
            ctx,
            states: Mutex::new(states),
            enabled: Mutex::new(enabled),
            running: Mutex::new(HashSet::new()),
            pending: Mutex::new(VecDeque::new()),
            started_at: Mutex::new(None),
            events,
            shutdown: CancellationToken::new(),
            weak_self: OnceLock::new(),
        });
        let _ = daemon.weak_self.set(Arc::downgrade(&daemon));
        Ok(daemon)
    }

    /// Substitute the resource oracle (tests use a static one)
    pub fn with_oracle(
        self: Arc<Self>,
        oracle: Box<dyn ResourceOracle>,
    ) -> Result<Arc<Self>> {
        let mut daemon =
            Arc::try_unwrap(self).map_err(|_| HermesError::Other("daemon already shared".into()))?;
        daemon.oracle = oracle;
        daemon.weak_self = OnceLock::new();
        let daemon = Arc::new(daemon);
        let _ = daemon.weak_self.set(Arc::downgrade(&daemon));
        Ok(daemon)
    }

    /// Substitute the worker runner
    pub fn with_runner(
        self: Arc<Self>,
        runner: Arc<dyn WorkerRunner>,
    ) -> Result<Arc<Self>> {
        let mut daemon =
            Arc::try_unwrap(self).map_err(|_| HermesError::Other("daemon already shared".into()))?;
        daemon.runner = runner;
        daemon.weak_self = OnceLock::new();
        let daemon = Arc::new(daemon);
        let _ = daemon.weak_self.set(Arc::downgrade(&daemon));
        Ok(daemon)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<WorkerEvent> {
        self.events.subscribe()
    }

    /// Restore checkpointed state and start every enabled schedule
    pub async fn start(&self) -> Result<()> {
        self.restore_state();
        *self.started_at.lock().expect("daemon poisoned") = Some(Utc::now());
        self.journal.info("daemon started");
        info!("Worker daemon starting");

        let now = Utc::now();
        for (kind, schedule) in &self.config.schedules {
            let since_last_run = {
                let states = self.states.lock().expect("daemon poisoned");
                states
                    .get(kind)
                    .and_then(|s| s.last_run)
                    .map(|last| (now - last).to_std().unwrap_or_default())
            };

            // First run: offset-staggered, or sooner when the interval
            // already partly elapsed before the restart
            let initial = match since_last_run {
                Some(elapsed) => schedule
                    .offset
                    .max(schedule.interval.saturating_sub(elapsed)),
                None => schedule.offset.max(Duration::from_millis(1)),
            };

            self.spawn_schedule(*kind, initial, schedule.interval);
        }

        // Periodic drain so resource-deferred workers recover even when
        // nothing is completing
        self.spawn_drain_tick();

        self.checkpoint();
        Ok(())
    }

    fn spawn_schedule(&self, kind: WorkerKind, initial: Duration, interval: Duration) {
        let Some(weak) = self.weak_self.get().cloned() else { return };

        tokio::spawn(async move {
            let mut delay = initial;
            loop {
                let Some(daemon) = weak.upgrade() else { return };
                {
                    let mut states = daemon.states.lock().expect("daemon poisoned");
                    if let Some(state) = states.get_mut(&kind) {
                        state.next_run = Some(
                            Utc::now()
                                + chrono::Duration::from_std(delay)
                                    .unwrap_or_else(|_| chrono::Duration::zero()),
                        );
                    }
                }
                daemon.checkpoint();
                let token = daemon.shutdown.clone();
                drop(daemon);

                tokio::select! {
                    _ = token.cancelled() => return,
                    _ = tokio::time::sleep(delay) => {}
                }

                let Some(daemon) = weak.upgrade() else { return };
                if daemon.shutdown.is_cancelled() {
                    return;
                }
                if daemon.is_enabled(kind) {
                    daemon.fire(kind);
                }
                delay = interval;
            }
        });
    }

    fn spawn_drain_tick(&self) {
        let Some(weak) = self.weak_self.get().cloned() else { return };

        tokio::spawn(async move {
            loop {
                let token = match weak.upgrade() {
                    Some(daemon) => daemon.shutdown.clone(),
                    None => return,
                };
                tokio::select! {
                    _ = token.cancelled() => return,
                    _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                }
                let Some(daemon) = weak.upgrade() else { return };
                daemon.drain_pending();
            }
        });
    }

    fn is_enabled(&self, kind: WorkerKind) -> bool {
        self.enabled
            .lock()
            .expect("daemon poisoned")
            .get(&kind)
            .copied()
            .unwrap_or(false)
    }

    /// Admission path for one due worker
    fn fire(&self, kind: WorkerKind) {
        if self.shutdown.is_cancelled() {
            return;
        }

        // Same-type runs never overlap; the next interval will retry
        if self.running.lock().expect("daemon poisoned").contains(&kind) {
            debug!("Worker {} still running, skipping this tick", kind);
            return;
        }

        let at_capacity = {
            let running = self.running.lock().expect("daemon poisoned");
            running.len() >= self.config.max_concurrent
        };
        if at_capacity {
            self.defer(kind, "concurrency cap reached");
            return;
        }

        if let Err(reason) = admit(&self.oracle.snapshot(), &self.thresholds) {
            self.defer(kind, &reason);
            return;
        }

        self.run_now(kind);
    }

    fn defer(&self, kind: WorkerKind, reason: &str) {
        let mut pending = self.pending.lock().expect("daemon poisoned");
        if !pending.contains(&kind) {
            pending.push_back(kind);
        }
        drop(pending);

        self.journal
            .warn(&format!("worker {} deferred: {}", kind, reason));
        let _ = self.events.send(WorkerEvent::Deferred {
            kind,
            reason: reason.to_string(),
        });
    }

    fn run_now(&self, kind: WorkerKind) {
        {
            let mut running = self.running.lock().expect("daemon poisoned");
            if !running.insert(kind) {
                return;
            }
        }
        {
            let mut states = self.states.lock().expect("daemon poisoned");
            states.entry(kind).or_default().is_running = true;
        }
        self.checkpoint();
        self.journal.info(&format!("worker {} started", kind));
        let _ = self.events.send(WorkerEvent::Start(kind));

        let Some(weak) = self.weak_self.get().cloned() else { return };
        let timeout = self.config.worker_timeout;

        tokio::spawn(async move {
            let Some(daemon) = weak.upgrade() else { return };
            let started = Instant::now();
            let ctx = daemon.ctx.clone();
            let runner = daemon.runner.clone();
            drop(daemon);

            let outcome = tokio::time::timeout(timeout, runner.run(kind, &ctx)).await;
            let duration_ms = started.elapsed().as_millis() as u64;

            let Some(daemon) = weak.upgrade() else { return };
            let (success, error) = match outcome {
                Ok(Ok(_report)) => (true, None),
                Ok(Err(e)) => (false, Some(e.to_string())),
                Err(_) => (false, Some(format!("timed out after {:?}", timeout))),
            };

            {
                let mut states = daemon.states.lock().expect("daemon poisoned");
                states.entry(kind).or_default().record_run(success, duration_ms);
            }
            daemon.running.lock().expect("daemon poisoned").remove(&kind);
            daemon.checkpoint();

            match &error {
                None => {
                    daemon.journal.info(&format!(
                        "worker {} completed in {}ms",
                        kind, duration_ms
                    ));
                    let _ = daemon
                        .events
                        .send(WorkerEvent::Complete { kind, duration_ms });
                }
                Some(error) => {
                    daemon
                        .journal
                        .error(&format!("worker {} failed: {}", kind, error));
                    warn!("Worker {} failed: {}", kind, error);
                    let _ = daemon.events.send(WorkerEvent::Error {
                        kind,
                        error: error.clone(),
                    });
                }
            }

            daemon.drain_pending();
        });
    }

    /// Start as many deferred workers as capacity and resources permit
    fn drain_pending(&self) {
        if self.shutdown.is_cancelled() {
            return;
        }
        loop {
            let next = {
                let running = self.running.lock().expect("daemon poisoned");
                if running.len() >= self.config.max_concurrent {
                    return;
                }
                drop(running);
                let mut pending = self.pending.lock().expect("daemon poisoned");
                pending.pop_front()
            };
            let Some(kind) = next else { return };

            if let Err(reason) = admit(&self.oracle.snapshot(), &self.thresholds) {
                debug!("Drain blocked by resources ({}), re-queueing {}", reason, kind);
                self.pending
                    .lock()
                    .expect("daemon poisoned")
                    .push_front(kind);
                return;
            }
            self.run_now(kind);
        }
    }

    /// Fire a worker immediately, subject to the usual admission gates
    pub fn trigger_worker(&self, kind: WorkerKind) {
        self.fire(kind);
    }

    pub fn set_worker_enabled(&self, kind: WorkerKind, enabled: bool) {
        self.enabled
            .lock()
            .expect("daemon poisoned")
            .insert(kind, enabled);
        self.journal.info(&format!(
            "worker {} {}",
            kind,
            if enabled { "enabled" } else { "disabled" }
        ));
    }

    pub fn get_status(&self) -> DaemonStatus {
        DaemonStatus {
            running: !self.shutdown.is_cancelled()
                && self.started_at.lock().expect("daemon poisoned").is_some(),
            started_at: *self.started_at.lock().expect("daemon poisoned"),
            workers: self.states.lock().expect("daemon poisoned").clone(),
            pending: self
                .pending
                .lock()
                .expect("daemon poisoned")
                .iter()
                .copied()
                .collect(),
            headless_available: self.is_headless_available(),
        }
    }

    /// Whether an AI-capable runtime is reachable for delegated workers
    pub fn is_headless_available(&self) -> bool {
        self.ctx
            .handoff
            .as_ref()
            .map(|manager| manager.any_provider_healthy())
            .unwrap_or(false)
    }

    /// Graceful shutdown: cancel timers, let running workers finish
    /// within the grace period, persist state
    pub async fn stop(&self) {
        self.shutdown.cancel();
        self.journal.info("daemon stopping");

        let deadline = tokio::time::Instant::now() + self.config.shutdown_timeout;
        loop {
            if self.running.lock().expect("daemon poisoned").is_empty() {
                break;
            }
            if tokio::time::Instant::now() >= deadline {
                let stuck: Vec<String> = self
                    .running
                    .lock()
                    .expect("daemon poisoned")
                    .iter()
                    .map(|k| k.to_string())
                    .collect();
                warn!("Shutdown grace period elapsed with workers running: {:?}", stuck);
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        *self.started_at.lock().expect("daemon poisoned") = None;
        self.checkpoint();
        self.store.flush();
        self.journal.info("daemon stopped");
        let _ = self.events.send(WorkerEvent::Shutdown);
        info!("Worker daemon stopped");
    }

    fn restore_state(&self) {
        let Some(doc) = self.store.load_daemon_state() else {
            return;
        };
        let mut states = self.states.lock().expect("daemon poisoned");
        for (kind, mut state) in doc.workers {
            // A restart means nothing is running anymore
            state.is_running = false;
            states.insert(kind, state);
        }
        info!("Restored worker state for {} workers", states.len());
    }

    fn checkpoint(&self) {
        let doc = DaemonStateDoc {
            running: !self.shutdown.is_cancelled()
                && self.started_at.lock().expect("daemon poisoned").is_some(),
            started_at: *self.started_at.lock().expect("daemon poisoned"),
            workers: self.states.lock().expect("daemon poisoned").clone(),
            config: self.config.clone(),
            saved_at: Utc::now(),
        };
        self.store.save_daemon_state(doc);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoreConfig;
    use tempfile::TempDir;

    struct SlowRunner {
        delay: Duration,
    }

    #[async_trait]
    impl WorkerRunner for SlowRunner {
        async fn run(&self, kind: WorkerKind, _ctx: &WorkerContext) -> Result<WorkerReport> {
            tokio::time::sleep(self.delay).await;
            Ok(WorkerReport {
                kind,
                headless: false,
                artifact: None,
                detail: serde_json::json!({}),
            })
        }
    }

    fn test_daemon(
        dir: &TempDir,
        max_concurrent: usize,
        runner_delay: Duration,
    ) -> Arc<WorkerDaemon> {
        let store = PersistentStore::open(&StoreConfig {
            base_dir: Some(dir.path().to_path_buf()),
            auto_save_interval: Duration::from_secs(3600),
            max_queue_items: 100,
        })
        .unwrap();

        let mut config = WorkersConfig::default();
        config.max_concurrent = max_concurrent;
        config.worker_timeout = Duration::from_secs(5);
        config.shutdown_timeout = Duration::from_millis(500);
        // Manual triggering only
        for schedule in config.schedules.values_mut() {
            schedule.enabled = false;
        }

        let ctx = WorkerContext {
            project_dir: dir.path().to_path_buf(),
            metrics_dir: store.metrics_dir(),
            optimizer: None,
            handoff: None,
        };

        WorkerDaemon::new(config, ResourceThresholds::default(), store, ctx)
            .unwrap()
            .with_oracle(Box::new(StaticOracle {
                snapshot: ResourceSnapshot {
                    cpu_load_per_core: 0.1,
                    free_memory_percent: 90.0,
                },
            }))
            .unwrap()
            .with_runner(Arc::new(SlowRunner {
                delay: runner_delay,
            }))
            .unwrap()
    }

    async fn wait_until<F: Fn() -> bool>(predicate: F, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        while tokio::time::Instant::now() < deadline {
            if predicate() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        predicate()
    }

    #[tokio::test]
    async fn test_concurrency_cap_defers_excess_workers() {
        let dir = TempDir::new().unwrap();
        let daemon = test_daemon(&dir, 2, Duration::from_millis(150));
        let mut events = daemon.subscribe();
        daemon.start().await.unwrap();

        let kinds = [
            WorkerKind::CodebaseMap,
            WorkerKind::SecurityAudit,
            WorkerKind::Performance,
            WorkerKind::TestGaps,
            WorkerKind::Consolidation,
        ];
        for kind in kinds {
            daemon.trigger_worker(kind);
        }

        // Cap holds immediately after the burst
        assert!(daemon.running.lock().unwrap().len() <= 2);
        assert!(daemon.get_status().pending.len() >= 3);

        // Every worker eventually completes exactly once
        let daemon_ref = daemon.clone();
        let all_done = wait_until(
            move || {
                let states = daemon_ref.states.lock().unwrap();
                kinds
                    .iter()
                    .all(|k| states.get(k).map(|s| s.run_count == 1).unwrap_or(false))
            },
            Duration::from_secs(5),
        )
        .await;
        assert!(all_done);

        // Observed events: 5 starts, 5 completions, >= 3 deferrals, and
        // never more than 2 in flight
        let mut starts = 0;
        let mut completes = 0;
        let mut deferred = 0;
        let mut in_flight: i32 = 0;
        let mut max_in_flight = 0;
        while let Ok(event) = events.try_recv() {
            match event {
                WorkerEvent::Start(_) => {
                    starts += 1;
                    in_flight += 1;
                    max_in_flight = max_in_flight.max(in_flight);
                }
                WorkerEvent::Complete { .. } | WorkerEvent::Error { .. } => {
                    completes += 1;
                    in_flight -= 1;
                }
                WorkerEvent::Deferred { .. } => deferred += 1,
                WorkerEvent::Shutdown => {}
            }
        }
        assert_eq!(starts, 5);
        assert_eq!(completes, 5);
        assert!(deferred >= 3);
        assert!(max_in_flight <= 2);

        daemon.stop().await;
    }

    #[tokio::test]
    async fn test_resource_gate_defers_worker() {
        let dir = TempDir::new().unwrap();
        let store = PersistentStore::open(&StoreConfig {
            base_dir: Some(dir.path().to_path_buf()),
            auto_save_interval: Duration::from_secs(3600),
            max_queue_items: 100,
        })
        .unwrap();

        let mut config = WorkersConfig::default();
        for schedule in config.schedules.values_mut() {
            schedule.enabled = false;
        }

        let ctx = WorkerContext {
            project_dir: dir.path().to_path_buf(),
            metrics_dir: store.metrics_dir(),
            optimizer: None,
            handoff: None,
        };
        let daemon = WorkerDaemon::new(config, ResourceThresholds::default(), store, ctx)
            .unwrap()
            .with_oracle(Box::new(StaticOracle {
                snapshot: ResourceSnapshot {
                    cpu_load_per_core: 5.0,
                    free_memory_percent: 90.0,
                },
            }))
            .unwrap();

        let mut events = daemon.subscribe();
        daemon.trigger_worker(WorkerKind::CodebaseMap);

        match events.try_recv().unwrap() {
            WorkerEvent::Deferred { kind, reason } => {
                assert_eq!(kind, WorkerKind::CodebaseMap);
                assert!(reason.contains("cpu load"));
            }
            other => panic!("expected deferral, got {:?}", other),
        }
        assert_eq!(daemon.get_status().pending, vec![WorkerKind::CodebaseMap]);
    }

    #[tokio::test]
    async fn test_state_checkpoint_restored_after_restart() {
        let dir = TempDir::new().unwrap();

        {
            let daemon = test_daemon(&dir, 2, Duration::from_millis(10));
            daemon.start().await.unwrap();
            daemon.trigger_worker(WorkerKind::Benchmark);

            let daemon_ref = daemon.clone();
            assert!(
                wait_until(
                    move || {
                        daemon_ref
                            .states
                            .lock()
                            .unwrap()
                            .get(&WorkerKind::Benchmark)
                            .map(|s| s.run_count == 1)
                            .unwrap_or(false)
                    },
                    Duration::from_secs(2),
                )
                .await
            );
            daemon.stop().await;
        }

        let daemon = test_daemon(&dir, 2, Duration::from_millis(10));
        daemon.restore_state();
        let states = daemon.states.lock().unwrap();
        let state = states.get(&WorkerKind::Benchmark).unwrap();
        assert_eq!(state.run_count, 1);
        assert!(state.last_run.is_some());
        assert!(!state.is_running);
    }

    #[tokio::test]
    async fn test_disabled_worker_can_be_reenabled() {
        let dir = TempDir::new().unwrap();
        let daemon = test_daemon(&dir, 2, Duration::from_millis(10));

        assert!(!daemon.is_enabled(WorkerKind::CodebaseMap));
        daemon.set_worker_enabled(WorkerKind::CodebaseMap, true);
        assert!(daemon.is_enabled(WorkerKind::CodebaseMap));
    }

    #[tokio::test]
    async fn test_no_new_work_after_stop() {
        let dir = TempDir::new().unwrap();
        let daemon = test_daemon(&dir, 2, Duration::from_millis(10));
        daemon.start().await.unwrap();
        daemon.stop().await;

        let mut events = daemon.subscribe();
        daemon.trigger_worker(WorkerKind::Performance);
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(events.try_recv().is_err(), "no events after shutdown");
        assert_eq!(
            daemon
                .states
                .lock()
                .unwrap()
                .get(&WorkerKind::Performance)
                .unwrap()
                .run_count,
            0
        );
    }
}
