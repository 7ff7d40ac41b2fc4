//! Persistent store for queue records, broker metrics, and daemon state
//!
//! Write-through with a periodic flush: mutations mark the affected
//! document dirty and a timer writes dirty documents to disk every
//! `auto_save_interval`. `flush()` forces an immediate write; after a
//! successful flush every previously-applied update is observable after
//! restart. Disk failures are logged and the document stays dirty so the
//! next flush retries; the store keeps operating from memory.
//!
//! On-disk layout under the base directory:
//! - `queue.json`: array of HandoffQueueItem records
//! - `metrics.json`: `{history, current}`
//! - `daemon-state.json`: worker daemon checkpoint
//! - `logs/`, `metrics/`, `handoff-work/`: owned by their components

use crate::config::{StoreConfig, WorkersConfig};
use crate::daemon::workers::WorkerKind;
use crate::error::{HermesError, Result};
use crate::types::{
    HandoffMetrics, HandoffQueueItem, HandoffStatus, MetricsSnapshot, RequestId, WorkerState,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

/// Cap on retained metrics snapshots
const MAX_SNAPSHOTS: usize = 1000;

/// Serialize to a temp file and rename into place so concurrent readers
/// always see a complete JSON document
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value)?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, json)
        .map_err(|e| HermesError::Storage(format!("write {}: {}", tmp.display(), e)))?;
    std::fs::rename(&tmp, path)
        .map_err(|e| HermesError::Storage(format!("rename to {}: {}", path.display(), e)))?;
    Ok(())
}

/// Metrics document persisted to metrics.json
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetricsDoc {
    pub history: Vec<MetricsSnapshot>,
    pub current: HandoffMetrics,
}

/// Worker daemon checkpoint persisted to daemon-state.json
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonStateDoc {
    pub running: bool,
    pub started_at: Option<DateTime<Utc>>,
    pub workers: HashMap<WorkerKind, WorkerState>,
    pub config: WorkersConfig,
    pub saved_at: DateTime<Utc>,
}

#[derive(Default)]
struct Versioned {
    gen: u64,
    flushed_gen: u64,
}

impl Versioned {
    fn touch(&mut self) {
        self.gen += 1;
    }

    fn dirty(&self) -> bool {
        self.gen > self.flushed_gen
    }
}

struct StoreInner {
    queue: HashMap<RequestId, HandoffQueueItem>,
    metrics: MetricsDoc,
    daemon_state: Option<DaemonStateDoc>,
    queue_ver: Versioned,
    metrics_ver: Versioned,
    daemon_ver: Versioned,
}

/// Durable storage for the handoff queue, metrics, and daemon state
pub struct PersistentStore {
    base_dir: PathBuf,
    max_queue_items: usize,
    inner: Mutex<StoreInner>,
    flush_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl PersistentStore {
    /// Open the store, loading any existing documents, and start the
    /// flush timer when a runtime is available
    pub fn open(config: &StoreConfig) -> Result<Arc<Self>> {
        let base_dir = config.resolved_base_dir();
        for dir in [
            base_dir.clone(),
            base_dir.join("logs"),
            base_dir.join("metrics"),
            base_dir.join("handoff-work"),
        ] {
            std::fs::create_dir_all(&dir)
                .map_err(|e| HermesError::Storage(format!("create {}: {}", dir.display(), e)))?;
        }

        let queue = Self::load_queue(&base_dir.join("queue.json"));
        let metrics = Self::load_doc::<MetricsDoc>(&base_dir.join("metrics.json"))
            .unwrap_or_default();
        let daemon_state = Self::load_doc::<DaemonStateDoc>(&base_dir.join("daemon-state.json"));

        info!(
            "Persistent store opened at {} ({} queue records)",
            base_dir.display(),
            queue.len()
        );

        let store = Arc::new(Self {
            base_dir,
            max_queue_items: config.max_queue_items,
            inner: Mutex::new(StoreInner {
                queue,
                metrics,
                daemon_state,
                queue_ver: Versioned::default(),
                metrics_ver: Versioned::default(),
                daemon_ver: Versioned::default(),
            }),
            flush_task: Mutex::new(None),
        });

        if tokio::runtime::Handle::try_current().is_ok() {
            let weak = Arc::downgrade(&store);
            let interval = config.auto_save_interval;
            let handle = tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    ticker.tick().await;
                    let Some(store) = weak.upgrade() else { break };
                    store.flush();
                }
            });
            *store.flush_task.lock().expect("store poisoned") = Some(handle);
        }

        Ok(store)
    }

    fn load_queue(path: &Path) -> HashMap<RequestId, HandoffQueueItem> {
        match Self::load_doc::<Vec<HandoffQueueItem>>(path) {
            Some(items) => items.into_iter().map(|i| (i.request.id, i)).collect(),
            None => HashMap::new(),
        }
    }

    fn load_doc<T: for<'de> Deserialize<'de>>(path: &Path) -> Option<T> {
        if !path.exists() {
            return None;
        }
        match std::fs::read_to_string(path) {
            Ok(json) => match serde_json::from_str(&json) {
                Ok(doc) => Some(doc),
                Err(e) => {
                    warn!("Ignoring malformed {}: {}", path.display(), e);
                    None
                }
            },
            Err(e) => {
                warn!("Failed to read {}: {}", path.display(), e);
                None
            }
        }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Default work directory for the background handler
    pub fn handoff_work_dir(&self) -> PathBuf {
        self.base_dir.join("handoff-work")
    }

    /// Per-worker artifact directory
    pub fn metrics_dir(&self) -> PathBuf {
        self.base_dir.join("metrics")
    }

    /// Daemon journal path
    pub fn daemon_log_path(&self) -> PathBuf {
        self.base_dir.join("logs").join("daemon.log")
    }

    // === Queue ===

    /// Insert or update a queue record by request id
    pub fn upsert_queue_item(&self, item: HandoffQueueItem) {
        let mut inner = self.inner.lock().expect("store poisoned");
        inner.queue.insert(item.request.id, item);
        inner.queue_ver.touch();
        Self::cleanup_locked(&mut inner, self.max_queue_items);
    }

    pub fn get_queue_item(&self, id: RequestId) -> Option<HandoffQueueItem> {
        self.inner
            .lock()
            .expect("store poisoned")
            .queue
            .get(&id)
            .cloned()
    }

    /// Records in the given status, ascending by position
    pub fn list_by_status(&self, status: HandoffStatus) -> Vec<HandoffQueueItem> {
        let inner = self.inner.lock().expect("store poisoned");
        let mut items: Vec<HandoffQueueItem> = inner
            .queue
            .values()
            .filter(|i| i.status == status)
            .cloned()
            .collect();
        items.sort_by_key(|i| i.position);
        items
    }

    pub fn remove_queue_item(&self, id: RequestId) -> Option<HandoffQueueItem> {
        let mut inner = self.inner.lock().expect("store poisoned");
        let removed = inner.queue.remove(&id);
        if removed.is_some() {
            inner.queue_ver.touch();
        }
        removed
    }

    /// Remove all terminal records; returns how many were dropped
    pub fn clear_completed(&self) -> usize {
        let mut inner = self.inner.lock().expect("store poisoned");
        let before = inner.queue.len();
        inner.queue.retain(|_, item| !item.status.is_terminal());
        let removed = before - inner.queue.len();
        if removed > 0 {
            inner.queue_ver.touch();
        }
        removed
    }

    /// Oldest completed/failed records are dropped once the queue exceeds
    /// its cap
    fn cleanup_locked(inner: &mut StoreInner, max_queue_items: usize) {
        if inner.queue.len() <= max_queue_items {
            return;
        }
        let mut terminal: Vec<(RequestId, Option<DateTime<Utc>>)> = inner
            .queue
            .values()
            .filter(|i| {
                matches!(i.status, HandoffStatus::Completed | HandoffStatus::Failed)
            })
            .map(|i| (i.request.id, i.completed_at))
            .collect();
        terminal.sort_by_key(|(_, completed_at)| *completed_at);

        let excess = inner.queue.len() - max_queue_items;
        for (id, _) in terminal.into_iter().take(excess) {
            inner.queue.remove(&id);
        }
        inner.queue_ver.touch();
    }

    // === Metrics ===

    pub fn set_current_metrics(&self, metrics: HandoffMetrics) {
        let mut inner = self.inner.lock().expect("store poisoned");
        inner.metrics.current = metrics;
        inner.metrics_ver.touch();
    }

    pub fn append_snapshot(&self, snapshot: MetricsSnapshot) {
        let mut inner = self.inner.lock().expect("store poisoned");
        inner.metrics.history.push(snapshot);
        let len = inner.metrics.history.len();
        if len > MAX_SNAPSHOTS {
            inner.metrics.history.drain(..len - MAX_SNAPSHOTS);
        }
        inner.metrics_ver.touch();
    }

    pub fn current_metrics(&self) -> HandoffMetrics {
        self.inner
            .lock()
            .expect("store poisoned")
            .metrics
            .current
            .clone()
    }

    /// The last `n` snapshots, oldest first
    pub fn recent_snapshots(&self, n: usize) -> Vec<MetricsSnapshot> {
        let inner = self.inner.lock().expect("store poisoned");
        let history = &inner.metrics.history;
        history[history.len().saturating_sub(n)..].to_vec()
    }

    // === Daemon state ===

    pub fn save_daemon_state(&self, doc: DaemonStateDoc) {
        let mut inner = self.inner.lock().expect("store poisoned");
        inner.daemon_state = Some(doc);
        inner.daemon_ver.touch();
    }

    pub fn load_daemon_state(&self) -> Option<DaemonStateDoc> {
        self.inner
            .lock()
            .expect("store poisoned")
            .daemon_state
            .clone()
    }

    // === Flushing ===

    /// Write every dirty document to disk now
    ///
    /// Failures leave the document dirty; the next flush retries.
    pub fn flush(&self) {
        let (queue, metrics, daemon, gens) = {
            let inner = self.inner.lock().expect("store poisoned");
            let queue = inner.queue_ver.dirty().then(|| {
                let mut items: Vec<HandoffQueueItem> = inner.queue.values().cloned().collect();
                items.sort_by_key(|i| i.position);
                items
            });
            let metrics = inner.metrics_ver.dirty().then(|| inner.metrics.clone());
            let daemon = inner
                .daemon_ver
                .dirty()
                .then(|| inner.daemon_state.clone());
            (
                queue,
                metrics,
                daemon,
                (
                    inner.queue_ver.gen,
                    inner.metrics_ver.gen,
                    inner.daemon_ver.gen,
                ),
            )
        };

        let mut flushed = (false, false, false);
        if let Some(items) = queue {
            match write_json_atomic(&self.base_dir.join("queue.json"), &items) {
                Ok(()) => flushed.0 = true,
                Err(e) => warn!("Queue flush failed, will retry: {}", e),
            }
        }
        if let Some(doc) = metrics {
            match write_json_atomic(&self.base_dir.join("metrics.json"), &doc) {
                Ok(()) => flushed.1 = true,
                Err(e) => warn!("Metrics flush failed, will retry: {}", e),
            }
        }
        if let Some(doc) = daemon {
            match write_json_atomic(&self.base_dir.join("daemon-state.json"), &doc) {
                Ok(()) => flushed.2 = true,
                Err(e) => warn!("Daemon state flush failed, will retry: {}", e),
            }
        }

        let mut inner = self.inner.lock().expect("store poisoned");
        if flushed.0 {
            inner.queue_ver.flushed_gen = inner.queue_ver.flushed_gen.max(gens.0);
        }
        if flushed.1 {
            inner.metrics_ver.flushed_gen = inner.metrics_ver.flushed_gen.max(gens.1);
        }
        if flushed.2 {
            inner.daemon_ver.flushed_gen = inner.daemon_ver.flushed_gen.max(gens.2);
        }
        debug!("Store flush complete");
    }

    /// Flush and stop the timer
    pub fn close(&self) {
        if let Some(handle) = self.flush_task.lock().expect("store poisoned").take() {
            handle.abort();
        }
        self.flush();
    }
}

impl Drop for PersistentStore {
    fn drop(&mut self) {
        if let Some(handle) = self.flush_task.lock().expect("store poisoned").take() {
            handle.abort();
        }
    }
}
