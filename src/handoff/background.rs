//! Isolated-process execution for long-running handoff jobs
//!
//! File-based rendezvous protocol: for each job the parent writes
//! `{id}_request.json` and `{id}_status.json` into the work directory,
//! then launches a detached child (this same binary, `handoff-worker`
//! subcommand). The child performs the provider call and atomically
//! writes `{id}_output.json` plus a terminal status. The parent polls
//! the status file and reads the output when it turns terminal. The
//! protocol survives parent restart: orphaned job files can be
//! re-adopted by id.

use super::select_provider;
use crate::config::{RetryConfig, TimeoutConfig};
use crate::error::{HermesError, Result};
use crate::providers::{classify_failure, AdapterRegistry, FailureKind};
use crate::store::write_json_atomic;
use crate::types::{HandoffRequest, HandoffResponse, HandoffStatus, ProviderConfig, RequestId};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Events emitted by the background handler
#[derive(Debug, Clone)]
pub enum HandoffEvent {
    Started(RequestId),
    Complete(RequestId),
    Cancelled(RequestId),
    Shutdown,
}

/// Self-contained job envelope written to `{id}_request.json`
///
/// Carries everything the child needs so the protocol stays
/// language-agnostic: the request plus the provider table and policies.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChildJob {
    pub request: HandoffRequest,
    pub providers: Vec<ProviderConfig>,
    pub retry: RetryConfig,
    pub timeout: TimeoutConfig,
}

/// Status document written to `{id}_status.json`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusDoc {
    pub status: HandoffStatus,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl StatusDoc {
    fn processing() -> Self {
        let now = Utc::now();
        Self {
            status: HandoffStatus::Processing,
            started_at: now,
            updated_at: now,
        }
    }

    fn terminal(status: HandoffStatus, started_at: DateTime<Utc>) -> Self {
        Self {
            status,
            started_at,
            updated_at: Utc::now(),
        }
    }
}

/// Handle to a launched child
#[derive(Debug, Clone)]
pub struct JobHandle {
    pub pid: Option<u32>,
}

/// Seam for launching job children
///
/// The process executor is the production shape; tests substitute an
/// in-process executor that speaks the same file protocol.
#[async_trait]
pub trait JobExecutor: Send + Sync {
    async fn launch(&self, id: RequestId, work_dir: &Path) -> Result<JobHandle>;

    async fn terminate(&self, handle: &JobHandle);
}

/// Launches `hermes handoff-worker <id>` as a detached OS process
pub struct ProcessExecutor;

#[async_trait]
impl JobExecutor for ProcessExecutor {
    async fn launch(&self, id: RequestId, work_dir: &Path) -> Result<JobHandle> {
        let current_exe = std::env::current_exe()
            .map_err(|e| HermesError::Other(format!("failed to locate executable: {}", e)))?;

        let mut cmd = tokio::process::Command::new(current_exe);
        cmd.arg("handoff-worker")
            .arg(id.to_string())
            .arg("--work-dir")
            .arg(work_dir)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null());

        // Detach into its own session so the parent may exit first
        #[cfg(unix)]
        unsafe {
            cmd.pre_exec(|| {
                nix::unistd::setsid()
                    .map_err(|e| std::io::Error::other(format!("setsid failed: {}", e)))?;
                Ok(())
            });
        }

        let child = cmd
            .spawn()
            .map_err(|e| HermesError::Other(format!("failed to spawn handoff worker: {}", e)))?;

        Ok(JobHandle { pid: child.id() })
    }

    async fn terminate(&self, handle: &JobHandle) {
        #[cfg(unix)]
        if let Some(pid) = handle.pid {
            use nix::sys::signal::{kill, Signal};
            use nix::unistd::Pid;
            if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                debug!("SIGTERM to {} failed (already gone?): {}", pid, e);
            }
        }
    }
}

/// Parent-side driver for out-of-process handoff jobs
pub struct BackgroundHandler {
    work_dir: PathBuf,
    poll_interval: Duration,
    executor: Box<dyn JobExecutor>,
    children: Mutex<std::collections::HashMap<RequestId, JobHandle>>,
    events: broadcast::Sender<HandoffEvent>,
}

impl BackgroundHandler {
    pub fn new(work_dir: PathBuf, poll_interval: Duration) -> Result<Self> {
        if !work_dir.exists() {
            std::fs::create_dir_all(&work_dir).map_err(|e| {
                HermesError::Storage(format!("create {}: {}", work_dir.display(), e))
            })?;
        }
        let (events, _) = broadcast::channel(64);
        Ok(Self {
            work_dir,
            poll_interval,
            executor: Box::new(ProcessExecutor),
            children: Mutex::new(std::collections::HashMap::new()),
            events,
        })
    }

    /// Substitute the job executor
    pub fn with_executor(mut self, executor: Box<dyn JobExecutor>) -> Self {
        self.executor = executor;
        self
    }

    pub fn subscribe(&self) -> broadcast::Receiver<HandoffEvent> {
        self.events.subscribe()
    }

    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    fn request_path(&self, id: RequestId) -> PathBuf {
        self.work_dir.join(format!("{}_request.json", id))
    }

    fn status_path(&self, id: RequestId) -> PathBuf {
        self.work_dir.join(format!("{}_status.json", id))
    }

    fn output_path(&self, id: RequestId) -> PathBuf {
        self.work_dir.join(format!("{}_output.json", id))
    }

    /// Write the rendezvous files and launch the child
    pub async fn start(&self, job: &ChildJob) -> Result<()> {
        let id = job.request.id;
        write_json_atomic(&self.request_path(id), job)?;
        write_json_atomic(&self.status_path(id), &StatusDoc::processing())?;

        let handle = self.executor.launch(id, &self.work_dir).await?;
        self.children
            .lock()
            .expect("children poisoned")
            .insert(id, handle);

        info!("Background handoff {} started", id);
        let _ = self.events.send(HandoffEvent::Started(id));
        Ok(())
    }

    /// Read the status document, tolerating a missing file
    pub fn read_status(&self, id: RequestId) -> Option<StatusDoc> {
        let path = self.status_path(id);
        let json = std::fs::read_to_string(&path).ok()?;
        match serde_json::from_str(&json) {
            Ok(doc) => Some(doc),
            Err(e) => {
                // Writers rename atomically, so this is unexpected; the
                // next poll rereads.
                debug!("Unparseable status for {}: {}", id, e);
                None
            }
        }
    }

    pub fn read_output(&self, id: RequestId) -> Option<HandoffResponse> {
        let path = self.output_path(id);
        let json = std::fs::read_to_string(&path).ok()?;
        serde_json::from_str(&json).ok()
    }

    /// Poll until the job reaches a terminal status or the timeout lapses
    ///
    /// On timeout the job is marked `Timeout` but the child is left to
    /// finish on its own.
    pub async fn wait_for_completion(
        &self,
        id: RequestId,
        timeout: Duration,
    ) -> HandoffResponse {
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            if let Some(status) = self.read_status(id) {
                if status.status.is_terminal() {
                    self.children.lock().expect("children poisoned").remove(&id);
                    let _ = self.events.send(HandoffEvent::Complete(id));
                    if let Some(output) = self.read_output(id) {
                        return output;
                    }
                    let mut response = HandoffResponse::failed(
                        id,
                        "",
                        "",
                        "protocol: terminal status without output file".to_string(),
                    );
                    response.status = status.status;
                    return response;
                }
            }

            if tokio::time::Instant::now() >= deadline {
                warn!("Background handoff {} timed out after {:?}", id, timeout);
                let started_at = self
                    .read_status(id)
                    .map(|s| s.started_at)
                    .unwrap_or_else(Utc::now);
                let _ =
                    write_json_atomic(&self.status_path(id), &StatusDoc::terminal(
                        HandoffStatus::Timeout,
                        started_at,
                    ));
                let mut response = HandoffResponse::failed(
                    id,
                    "",
                    "",
                    format!("timeout: no completion within {:?}", timeout),
                );
                response.status = HandoffStatus::Timeout;
                return response;
            }

            tokio::time::sleep(self.poll_interval).await;
        }
    }

    /// Terminate a processing job and mark it cancelled
    pub async fn cancel(&self, id: RequestId) -> Result<()> {
        let handle = self.children.lock().expect("children poisoned").remove(&id);
        if let Some(handle) = handle {
            self.executor.terminate(&handle).await;
        }

        let started_at = self
            .read_status(id)
            .map(|s| s.started_at)
            .unwrap_or_else(Utc::now);
        write_json_atomic(
            &self.status_path(id),
            &StatusDoc::terminal(HandoffStatus::Cancelled, started_at),
        )?;

        info!("Background handoff {} cancelled", id);
        let _ = self.events.send(HandoffEvent::Cancelled(id));
        Ok(())
    }

    /// Delete the three rendezvous files for a finished job
    pub fn cleanup(&self, id: RequestId) {
        for path in [
            self.request_path(id),
            self.status_path(id),
            self.output_path(id),
        ] {
            if path.exists() {
                if let Err(e) = std::fs::remove_file(&path) {
                    warn!("Failed to remove {}: {}", path.display(), e);
                }
            }
        }
    }

    /// Scan the work directory for job files left by a previous run
    ///
    /// Returns each orphaned job id with its last recorded status.
    pub fn adopt_orphans(&self) -> Vec<(RequestId, StatusDoc)> {
        let mut orphans = Vec::new();
        let Ok(dir) = std::fs::read_dir(&self.work_dir) else {
            return orphans;
        };

        for entry in dir.flatten() {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            let Some(id_str) = name.strip_suffix("_status.json") else {
                continue;
            };
            let Ok(id) = RequestId::from_string(id_str) else {
                continue;
            };
            if self.children.lock().expect("children poisoned").contains_key(&id) {
                continue;
            }
            if let Some(status) = self.read_status(id) {
                orphans.push((id, status));
            }
        }

        if !orphans.is_empty() {
            info!("Re-adopted {} orphaned handoff jobs", orphans.len());
        }
        orphans
    }

    pub fn shutdown(&self) {
        let _ = self.events.send(HandoffEvent::Shutdown);
    }
}

/// Child-side entry point: execute one job from its rendezvous files
///
/// Reads `{id}_request.json`, performs the provider call with the job's
/// retry and timeout policies, and atomically writes the output and a
/// terminal status.
pub async fn run_child(id: RequestId, work_dir: &Path) -> Result<()> {
    let request_path = work_dir.join(format!("{}_request.json", id));
    let status_path = work_dir.join(format!("{}_status.json", id));
    let output_path = work_dir.join(format!("{}_output.json", id));

    let json = std::fs::read_to_string(&request_path)
        .map_err(|e| HermesError::Storage(format!("read {}: {}", request_path.display(), e)))?;
    let job: ChildJob = serde_json::from_str(&json)?;

    let started_at = Utc::now();
    let registry = AdapterRegistry::new(&job.timeout)?;

    let response = execute_job(&job, &registry).await;
    let status = response.status;

    write_json_atomic(&output_path, &response)?;
    write_json_atomic(&status_path, &StatusDoc::terminal(status, started_at))?;

    info!("Handoff worker {} finished with status {}", id, status);
    Ok(())
}

/// Provider call with retry-with-backoff, mirroring the broker's policy
async fn execute_job(job: &ChildJob, registry: &AdapterRegistry) -> HandoffResponse {
    let req = &job.request;

    let cfg = match select_provider(&job.providers, &req.provider_hint, registry).await {
        Ok(cfg) => cfg,
        Err(e) => return HandoffResponse::failed(req.id, "", "", format!("config: {}", e)),
    };
    let adapter = registry.get(cfg.provider_type);

    let total_deadline = tokio::time::Instant::now() + job.timeout.total;
    let mut attempt = 0u32;

    loop {
        let outcome =
            tokio::time::timeout(job.timeout.request, adapter.send(req, &cfg)).await;
        let response = match outcome {
            Ok(r) => r,
            Err(_) => {
                let mut r = HandoffResponse::failed(
                    req.id,
                    &cfg.name,
                    &cfg.model,
                    format!("timeout: attempt exceeded {:?}", job.timeout.request),
                );
                r.status = HandoffStatus::Failed;
                r
            }
        };

        if response.status == HandoffStatus::Completed {
            return response;
        }

        let kind = classify_failure(&response);
        let retry_budget = match kind {
            FailureKind::Configuration => 0,
            FailureKind::Protocol => job.retry.max_retries / 2,
            FailureKind::Transient => job.retry.max_retries,
        };

        if attempt >= retry_budget {
            return response;
        }

        let delay = job.retry.delay_for_attempt(attempt);
        if tokio::time::Instant::now() + delay >= total_deadline {
            return response;
        }
        debug!(
            "Handoff {} attempt {} failed ({:?}), retrying in {:?}",
            req.id, attempt, kind, delay
        );
        tokio::time::sleep(delay).await;
        attempt += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{HandoffOptions, RequestMetadata};
    use tempfile::TempDir;

    fn job() -> ChildJob {
        ChildJob {
            request: HandoffRequest {
                id: RequestId::new(),
                provider_hint: "auto".to_string(),
                system_prompt: None,
                prompt: "work".to_string(),
                context: vec![],
                callback_instructions: None,
                metadata: RequestMetadata::default(),
                options: HandoffOptions::default(),
            },
            providers: vec![],
            retry: RetryConfig::default(),
            timeout: TimeoutConfig::default(),
        }
    }

    /// Executor that simulates a child completing after a short delay
    struct FakeChildExecutor;

    #[async_trait]
    impl JobExecutor for FakeChildExecutor {
        async fn launch(&self, id: RequestId, work_dir: &Path) -> Result<JobHandle> {
            let work_dir = work_dir.to_path_buf();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(30)).await;
                let response = HandoffResponse {
                    request_id: id,
                    provider: "fake".to_string(),
                    model: "fake-model".to_string(),
                    content: "done".to_string(),
                    tokens: crate::types::TokenUsage::new(5, 2),
                    duration_ms: 30,
                    status: HandoffStatus::Completed,
                    error: None,
                    injected_instructions: None,
                    completed_at: Some(Utc::now()),
                };
                write_json_atomic(
                    &work_dir.join(format!("{}_output.json", id)),
                    &response,
                )
                .unwrap();
                write_json_atomic(
                    &work_dir.join(format!("{}_status.json", id)),
                    &StatusDoc::terminal(HandoffStatus::Completed, Utc::now()),
                )
                .unwrap();
            });
            Ok(JobHandle { pid: None })
        }

        async fn terminate(&self, _handle: &JobHandle) {}
    }

    fn handler(dir: &TempDir) -> BackgroundHandler {
        BackgroundHandler::new(dir.path().to_path_buf(), Duration::from_millis(10))
            .unwrap()
            .with_executor(Box::new(FakeChildExecutor))
    }

    #[tokio::test]
    async fn test_start_writes_rendezvous_files() {
        let dir = TempDir::new().unwrap();
        let handler = handler(&dir);
        let job = job();
        let id = job.request.id;

        handler.start(&job).await.unwrap();

        assert!(dir.path().join(format!("{}_request.json", id)).exists());
        let status = handler.read_status(id).unwrap();
        assert_eq!(status.status, HandoffStatus::Processing);
    }

    #[tokio::test]
    async fn test_wait_for_completion_reads_output() {
        let dir = TempDir::new().unwrap();
        let handler = handler(&dir);
        let job = job();
        let id = job.request.id;

        let mut events = handler.subscribe();
        handler.start(&job).await.unwrap();

        let response = handler.wait_for_completion(id, Duration::from_secs(2)).await;
        assert_eq!(response.status, HandoffStatus::Completed);
        assert_eq!(response.content, "done");

        // started then complete
        assert!(matches!(events.recv().await.unwrap(), HandoffEvent::Started(i) if i == id));
        assert!(matches!(events.recv().await.unwrap(), HandoffEvent::Complete(i) if i == id));

        handler.cleanup(id);
        assert!(!dir.path().join(format!("{}_request.json", id)).exists());
        assert!(!dir.path().join(format!("{}_status.json", id)).exists());
        assert!(!dir.path().join(format!("{}_output.json", id)).exists());
    }

    #[tokio::test]
    async fn test_timeout_marks_job_without_output() {
        struct NeverFinishes;
        #[async_trait]
        impl JobExecutor for NeverFinishes {
            async fn launch(&self, _id: RequestId, _work_dir: &Path) -> Result<JobHandle> {
                Ok(JobHandle { pid: None })
            }
            async fn terminate(&self, _handle: &JobHandle) {}
        }

        let dir = TempDir::new().unwrap();
        let handler = BackgroundHandler::new(dir.path().to_path_buf(), Duration::from_millis(5))
            .unwrap()
            .with_executor(Box::new(NeverFinishes));
        let job = job();
        let id = job.request.id;

        handler.start(&job).await.unwrap();
        let response = handler
            .wait_for_completion(id, Duration::from_millis(40))
            .await;

        assert_eq!(response.status, HandoffStatus::Timeout);
        assert_eq!(handler.read_status(id).unwrap().status, HandoffStatus::Timeout);
    }

    #[tokio::test]
    async fn test_cancel_writes_terminal_status() {
        let dir = TempDir::new().unwrap();
        let handler = handler(&dir);
        let job = job();
        let id = job.request.id;

        handler.start(&job).await.unwrap();
        handler.cancel(id).await.unwrap();

        assert_eq!(
            handler.read_status(id).unwrap().status,
            HandoffStatus::Cancelled
        );
    }

    #[tokio::test]
    async fn test_adopt_orphans_finds_leftover_jobs() {
        let dir = TempDir::new().unwrap();
        let id = RequestId::new();
        write_json_atomic(
            &dir.path().join(format!("{}_status.json", id)),
            &StatusDoc::terminal(HandoffStatus::Completed, Utc::now()),
        )
        .unwrap();

        let handler = handler(&dir);
        let orphans = handler.adopt_orphans();
        assert_eq!(orphans.len(), 1);
        assert_eq!(orphans[0].0, id);
        assert_eq!(orphans[0].1.status, HandoffStatus::Completed);
    }
}
