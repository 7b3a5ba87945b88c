//! Worker pool: dispatcher loops over the queue.
//!
//! One dispatcher loop per worker descriptor. Each loop claims jobs within
//! its concurrency cap, spawns handler executions with a cancellation token
//! and a wall-clock timeout, and writes the terminal outcome. A supervisor
//! restarts workers whose loop died or whose heartbeat went stale, up to a
//! restart budget.
//!
//! ```text
//! WorkerPool.run(shutdown)
//!     ├─► worker_loop (per descriptor)
//!     │       ├─► Queue.claim(worker_id, types)
//!     │       └─► run_claimed_job (spawned, token + timeout armed)
//!     ├─► cancel listener (hub → running-job tokens)
//!     └─► supervisor (heartbeat checks, restarts)
//! ```

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::common::error::JobError;
use crate::config::{PoolConfig, RetryConfig};
use crate::kernel::deps::WorkerDeps;

use super::events::{JobEvent, JobEventHub};
use super::job::{Job, JobResult, JobType};
use super::queue::JobQueue;
use super::registry::{JobContext, ProgressSink, SharedJobRegistry};
use super::store::{FailOutcome, JobStore};

/// A worker is healthy while its heartbeat is at most this old.
const HEALTHY_HEARTBEAT_WINDOW: Duration = Duration::from_secs(60);

/// Static configuration of one worker.
#[derive(Debug, Clone)]
pub struct WorkerDescriptor {
    pub worker_id: String,
    pub supported_types: Vec<JobType>,
    pub max_concurrency: usize,
    pub heartbeat_interval: Duration,
    /// Empty-queue wait before the next claim; `None` uses the pool default.
    pub idle_poll: Option<Duration>,
    pub enabled: bool,
}

impl WorkerDescriptor {
    pub fn new(worker_id: impl Into<String>, supported_types: Vec<JobType>) -> Self {
        Self {
            worker_id: worker_id.into(),
            supported_types,
            max_concurrency: 4,
            heartbeat_interval: Duration::from_secs(30),
            idle_poll: None,
            enabled: true,
        }
    }

    pub fn with_max_concurrency(mut self, max_concurrency: usize) -> Self {
        self.max_concurrency = max_concurrency.max(1);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    Active,
    Idle,
    Busy,
    Stopped,
    Error,
}

#[derive(Debug, Clone)]
struct WorkerHealth {
    status: WorkerStatus,
    last_heartbeat: DateTime<Utc>,
    started_at: DateTime<Utc>,
    running_jobs: Vec<Uuid>,
    processed: u64,
    failed: u64,
    total_processing_ms: u64,
    restart_count: u32,
}

impl WorkerHealth {
    fn new() -> Self {
        let now = Utc::now();
        Self {
            status: WorkerStatus::Active,
            last_heartbeat: now,
            started_at: now,
            running_jobs: Vec::new(),
            processed: 0,
            failed: 0,
            total_processing_ms: 0,
            restart_count: 0,
        }
    }

    fn is_healthy(&self, now: DateTime<Utc>) -> bool {
        if matches!(self.status, WorkerStatus::Stopped | WorkerStatus::Error) {
            return false;
        }
        now.signed_duration_since(self.last_heartbeat)
            .to_std()
            .map(|age| age <= HEALTHY_HEARTBEAT_WINDOW)
            .unwrap_or(true)
    }
}

/// Read-only view of one worker for the monitoring surface.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerReport {
    pub worker_id: String,
    pub status: WorkerStatus,
    pub last_heartbeat: DateTime<Utc>,
    pub running_jobs: Vec<Uuid>,
    pub processed: u64,
    pub failed: u64,
    pub avg_processing_ms: f64,
    pub error_rate_pct: f64,
    pub uptime_ms: i64,
    pub restart_count: u32,
    pub healthy: bool,
}

/// Point-in-time view of the pool.
#[derive(Debug, Clone, Serialize, Default)]
pub struct PoolHealthSnapshot {
    pub workers: Vec<WorkerReport>,
}

impl PoolHealthSnapshot {
    pub fn total(&self) -> usize {
        self.workers.len()
    }

    pub fn healthy_count(&self) -> usize {
        self.workers.iter().filter(|w| w.healthy).count()
    }

    pub fn stopped_or_error_count(&self) -> usize {
        self.workers
            .iter()
            .filter(|w| matches!(w.status, WorkerStatus::Stopped | WorkerStatus::Error))
            .count()
    }
}

/// Shared pool state: worker health plus the running-job token map. The
/// monitor holds this as a read-only view.
pub struct PoolState {
    workers: RwLock<HashMap<String, WorkerHealth>>,
    running: Mutex<HashMap<Uuid, CancellationToken>>,
    permits: Arc<Semaphore>,
}

impl PoolState {
    fn new(global_concurrency: usize) -> Self {
        Self {
            workers: RwLock::new(HashMap::new()),
            running: Mutex::new(HashMap::new()),
            permits: Arc::new(Semaphore::new(global_concurrency.max(1))),
        }
    }

    fn with_worker<R>(&self, worker_id: &str, f: impl FnOnce(&mut WorkerHealth) -> R) -> Option<R> {
        let mut workers = self.workers.write().unwrap_or_else(|e| e.into_inner());
        workers.get_mut(worker_id).map(f)
    }

    fn register_worker(&self, worker_id: &str) {
        let mut workers = self.workers.write().unwrap_or_else(|e| e.into_inner());
        let entry = workers
            .entry(worker_id.to_string())
            .or_insert_with(WorkerHealth::new);
        entry.status = WorkerStatus::Active;
        entry.last_heartbeat = Utc::now();
    }

    fn beat(&self, worker_id: &str) {
        self.with_worker(worker_id, |w| w.last_heartbeat = Utc::now());
    }

    fn set_status(&self, worker_id: &str, status: WorkerStatus) {
        self.with_worker(worker_id, |w| w.status = status);
    }

    fn note_restart(&self, worker_id: &str) {
        self.with_worker(worker_id, |w| {
            w.restart_count += 1;
            w.last_heartbeat = Utc::now();
            w.status = WorkerStatus::Active;
        });
    }

    fn job_started(&self, worker_id: &str, job_id: Uuid, token: CancellationToken) {
        self.running
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(job_id, token);
        self.with_worker(worker_id, |w| w.running_jobs.push(job_id));
    }

    fn job_finished(&self, worker_id: &str, job_id: Uuid, elapsed: Duration, success: bool) {
        self.running
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&job_id);
        self.with_worker(worker_id, |w| {
            w.running_jobs.retain(|id| *id != job_id);
            w.processed += 1;
            if !success {
                w.failed += 1;
            }
            w.total_processing_ms += elapsed.as_millis() as u64;
        });
    }

    fn cancel_running(&self, job_id: Uuid) {
        if let Some(token) = self
            .running
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&job_id)
        {
            token.cancel();
        }
    }

    fn cancel_all_running(&self) {
        for token in self
            .running
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
        {
            token.cancel();
        }
    }

    pub fn running_count_for(&self, worker_id: &str) -> usize {
        self.workers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(worker_id)
            .map(|w| w.running_jobs.len())
            .unwrap_or(0)
    }

    pub fn running_total(&self) -> usize {
        self.running.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn health_snapshot(&self) -> PoolHealthSnapshot {
        let now = Utc::now();
        let workers = self.workers.read().unwrap_or_else(|e| e.into_inner());
        let mut reports: Vec<WorkerReport> = workers
            .iter()
            .map(|(worker_id, health)| WorkerReport {
                worker_id: worker_id.clone(),
                status: health.status,
                last_heartbeat: health.last_heartbeat,
                running_jobs: health.running_jobs.clone(),
                processed: health.processed,
                failed: health.failed,
                avg_processing_ms: if health.processed > 0 {
                    health.total_processing_ms as f64 / health.processed as f64
                } else {
                    0.0
                },
                error_rate_pct: if health.processed > 0 {
                    health.failed as f64 / health.processed as f64 * 100.0
                } else {
                    0.0
                },
                uptime_ms: now.signed_duration_since(health.started_at).num_milliseconds(),
                restart_count: health.restart_count,
                healthy: health.is_healthy(now),
            })
            .collect();
        reports.sort_by(|a, b| a.worker_id.cmp(&b.worker_id));
        PoolHealthSnapshot { workers: reports }
    }
}

/// Outcome of one claimed-job execution, as seen by the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    Completed,
    Retried,
    Failed,
    Cancelled,
}

/// Execute one claimed job to its outcome and record it.
///
/// The dispatcher owns the token and the timeout; the handler runs in its
/// own task so a panic is contained and mapped to a retryable PROCESSING
/// failure. A cancel or stall that lands mid-flight makes the terminal
/// write a no-op.
pub async fn run_claimed_job(
    store: Arc<dyn JobStore>,
    hub: JobEventHub,
    registry: SharedJobRegistry,
    deps: Arc<WorkerDeps>,
    retry: &RetryConfig,
    job: Job,
    cancel: CancellationToken,
) -> JobOutcome {
    let worker_id = job.worker_id.clone().unwrap_or_default();
    let tenant = job.tenant.clone();
    let job_id = job.id;
    let attempt = job.attempts;
    let timeout = Duration::from_millis(job.timeout_ms.max(0) as u64);
    let started = Instant::now();

    let ctx = JobContext {
        tenant: tenant.clone(),
        job_id,
        attempt,
        deps,
        progress: ProgressSink::new(
            store.clone(),
            hub.clone(),
            tenant.clone(),
            job_id,
            worker_id.clone(),
            cancel.clone(),
        ),
        cancel: cancel.clone(),
    };

    let exec_registry = registry.clone();
    let exec_job = job.clone();
    let mut handle = tokio::spawn(async move { exec_registry.execute(exec_job, ctx).await });

    enum RawOutcome {
        Finished(Result<JobResult, JobError>),
        Panicked,
        TimedOut,
        Cancelled,
    }

    let raw = tokio::select! {
        joined = &mut handle => match joined {
            Ok(result) => RawOutcome::Finished(result),
            Err(e) if e.is_panic() => RawOutcome::Panicked,
            Err(_) => RawOutcome::Cancelled,
        },
        _ = tokio::time::sleep(timeout) => RawOutcome::TimedOut,
        _ = cancel.cancelled() => RawOutcome::Cancelled,
    };

    let elapsed_ms = started.elapsed().as_millis() as i64;

    match raw {
        RawOutcome::Finished(Ok(mut result)) => {
            if result.metrics.duration_ms == 0 {
                result.metrics.duration_ms = elapsed_ms;
            }
            match store.complete(&tenant, job_id, &worker_id, result).await {
                Ok(true) => {
                    debug!(job_id = %job_id, elapsed_ms, "job completed");
                    hub.publish(JobEvent::Completed {
                        job_id,
                        tenant,
                        duration_ms: elapsed_ms,
                    })
                    .await;
                    JobOutcome::Completed
                }
                Ok(false) => {
                    // Cancelled or stalled mid-flight; the outcome is dropped.
                    debug!(job_id = %job_id, "completion dropped, job no longer running");
                    JobOutcome::Cancelled
                }
                Err(e) => {
                    error!(job_id = %job_id, error = %e, "failed to record completion");
                    JobOutcome::Failed
                }
            }
        }
        RawOutcome::Finished(Err(err)) if err.kind == crate::common::error::ErrorKind::Cancelled => {
            // The handler observed cancellation; the cancel path already
            // recorded the status.
            JobOutcome::Cancelled
        }
        RawOutcome::Finished(Err(err)) => {
            record_failure(&store, &hub, retry, &tenant, job_id, &worker_id, attempt, err).await
        }
        RawOutcome::Panicked => {
            warn!(job_id = %job_id, "job handler panicked");
            let err = JobError::processing("job handler panicked").with_context("dispatcher");
            record_failure(&store, &hub, retry, &tenant, job_id, &worker_id, attempt, err).await
        }
        RawOutcome::TimedOut => {
            cancel.cancel();
            handle.abort();
            warn!(job_id = %job_id, timeout_ms = job.timeout_ms, "job timed out");
            let err = JobError::timeout(format!(
                "execution exceeded {} ms wall clock",
                job.timeout_ms
            ))
            .with_context("dispatcher");
            record_failure(&store, &hub, retry, &tenant, job_id, &worker_id, attempt, err).await
        }
        RawOutcome::Cancelled => {
            handle.abort();
            debug!(job_id = %job_id, "job execution cancelled");
            JobOutcome::Cancelled
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn record_failure(
    store: &Arc<dyn JobStore>,
    hub: &JobEventHub,
    retry: &RetryConfig,
    tenant: &str,
    job_id: Uuid,
    worker_id: &str,
    attempt: i32,
    err: JobError,
) -> JobOutcome {
    match store.fail(tenant, job_id, worker_id, err.clone(), retry).await {
        Ok(FailOutcome::Retried { next_attempt_at }) => {
            warn!(job_id = %job_id, attempt, next_attempt_at = %next_attempt_at, error = %err, "job failed, will retry");
            hub.publish(JobEvent::Retry {
                job_id,
                tenant: tenant.to_string(),
                error: Some(err),
                next_attempt_at: Some(next_attempt_at),
            })
            .await;
            JobOutcome::Retried
        }
        Ok(FailOutcome::Failed) => {
            warn!(job_id = %job_id, attempt, error = %err, "job failed terminally");
            hub.publish(JobEvent::Failed {
                job_id,
                tenant: tenant.to_string(),
                error: err,
                attempt,
            })
            .await;
            JobOutcome::Failed
        }
        Ok(FailOutcome::Dropped) => JobOutcome::Cancelled,
        Err(e) => {
            error!(job_id = %job_id, error = %e, "failed to record job failure");
            JobOutcome::Failed
        }
    }
}

/// Runs the configured worker descriptors concurrently in one process.
pub struct WorkerPool {
    queue: Arc<JobQueue>,
    registry: SharedJobRegistry,
    deps: Arc<WorkerDeps>,
    retry: RetryConfig,
    config: PoolConfig,
    descriptors: Vec<WorkerDescriptor>,
    state: Arc<PoolState>,
}

impl WorkerPool {
    pub fn new(
        queue: Arc<JobQueue>,
        registry: SharedJobRegistry,
        deps: Arc<WorkerDeps>,
        retry: RetryConfig,
        config: PoolConfig,
        descriptors: Vec<WorkerDescriptor>,
    ) -> Self {
        let state = Arc::new(PoolState::new(config.max_concurrency));
        Self {
            queue,
            registry,
            deps,
            retry,
            config,
            descriptors,
            state,
        }
    }

    /// Read-only view for the monitor.
    pub fn state(&self) -> Arc<PoolState> {
        self.state.clone()
    }

    /// Run until shutdown is requested, then drain gracefully.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) -> Result<()> {
        let enabled: Vec<WorkerDescriptor> = self
            .descriptors
            .iter()
            .filter(|d| d.enabled)
            .cloned()
            .collect();
        info!(
            workers = enabled.len(),
            max_concurrency = self.config.max_concurrency,
            "worker pool starting"
        );

        // External cancels reach running handlers through their tokens.
        let listener_state = self.state.clone();
        let listener_rx = self.queue.hub().subscribe_all();
        let listener_shutdown = shutdown.clone();
        tokio::spawn(cancel_listener(listener_state, listener_rx, listener_shutdown));

        let mut handles: HashMap<String, JoinHandle<()>> = HashMap::new();
        for descriptor in &enabled {
            self.state.register_worker(&descriptor.worker_id);
            handles.insert(
                descriptor.worker_id.clone(),
                tokio::spawn(worker_loop(self.clone(), descriptor.clone(), shutdown.clone())),
            );
        }

        // Supervisor: restart workers whose loop died or heartbeat stalled.
        let health_interval = Duration::from_millis(self.config.health_check_interval_ms);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(health_interval) => {}
            }

            let snapshot = self.state.health_snapshot();
            for descriptor in &enabled {
                let Some(report) = snapshot
                    .workers
                    .iter()
                    .find(|w| w.worker_id == descriptor.worker_id)
                else {
                    continue;
                };
                let loop_dead = handles
                    .get(&descriptor.worker_id)
                    .map(|h| h.is_finished())
                    .unwrap_or(true);
                if report.healthy && !loop_dead {
                    continue;
                }

                if report.restart_count < self.config.max_restart_attempts {
                    warn!(
                        worker_id = %descriptor.worker_id,
                        restart = report.restart_count + 1,
                        loop_dead,
                        "restarting unhealthy worker"
                    );
                    if let Some(handle) = handles.remove(&descriptor.worker_id) {
                        handle.abort();
                    }
                    self.state.note_restart(&descriptor.worker_id);
                    handles.insert(
                        descriptor.worker_id.clone(),
                        tokio::spawn(worker_loop(
                            self.clone(),
                            descriptor.clone(),
                            shutdown.clone(),
                        )),
                    );
                } else if report.status != WorkerStatus::Error {
                    error!(
                        worker_id = %descriptor.worker_id,
                        attempts = report.restart_count,
                        "worker declared failed after restart budget exhausted"
                    );
                    self.state.set_status(&descriptor.worker_id, WorkerStatus::Error);
                }
            }
        }

        // Graceful shutdown: claim loops observe the token and exit, then
        // in-flight jobs drain.
        for (_, handle) in handles.drain() {
            let _ = handle.await;
        }
        let drain_timeout = Duration::from_millis(self.config.drain_timeout_ms);
        let drain_started = Instant::now();
        while self.state.running_total() > 0 && drain_started.elapsed() < drain_timeout {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        let leftover = self.state.running_total();
        if leftover > 0 {
            warn!(
                running = leftover,
                "drain timeout reached, cancelling in-flight jobs for reaper recovery"
            );
            self.state.cancel_all_running();
        }

        info!("worker pool stopped");
        Ok(())
    }
}

async fn worker_loop(pool: Arc<WorkerPool>, descriptor: WorkerDescriptor, shutdown: CancellationToken) {
    info!(
        worker_id = %descriptor.worker_id,
        types = ?descriptor.supported_types,
        "worker starting"
    );
    let idle_poll = descriptor
        .idle_poll
        .unwrap_or(Duration::from_millis(pool.config.idle_poll_ms));
    let busy_backoff = Duration::from_millis(pool.config.busy_backoff_ms);

    loop {
        if shutdown.is_cancelled() {
            break;
        }
        pool.state.beat(&descriptor.worker_id);

        if pool.state.running_count_for(&descriptor.worker_id) >= descriptor.max_concurrency {
            pool.state.set_status(&descriptor.worker_id, WorkerStatus::Busy);
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(busy_backoff) => {}
            }
            continue;
        }

        let permit = match pool.state.permits.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                // Global ceiling reached.
                pool.state.set_status(&descriptor.worker_id, WorkerStatus::Busy);
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(busy_backoff) => {}
                }
                continue;
            }
        };

        match pool
            .queue
            .claim(&descriptor.worker_id, &descriptor.supported_types)
            .await
        {
            Ok(Some(job)) => {
                pool.state.set_status(&descriptor.worker_id, WorkerStatus::Active);
                spawn_execution(pool.clone(), descriptor.worker_id.clone(), job, permit);
            }
            Ok(None) => {
                drop(permit);
                pool.state.set_status(&descriptor.worker_id, WorkerStatus::Idle);
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(idle_poll) => {}
                }
            }
            Err(e) => {
                drop(permit);
                error!(worker_id = %descriptor.worker_id, error = %e, "claim failed");
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                }
            }
        }
    }

    pool.state
        .set_status(&descriptor.worker_id, WorkerStatus::Stopped);
    info!(worker_id = %descriptor.worker_id, "worker stopped");
}

fn spawn_execution(
    pool: Arc<WorkerPool>,
    worker_id: String,
    job: Job,
    permit: OwnedSemaphorePermit,
) {
    let token = CancellationToken::new();
    pool.state.job_started(&worker_id, job.id, token.clone());

    tokio::spawn(async move {
        let job_id = job.id;
        let started = Instant::now();
        let outcome = run_claimed_job(
            pool.queue.store().clone(),
            pool.queue.hub().clone(),
            pool.registry.clone(),
            pool.deps.clone(),
            &pool.retry,
            job,
            token,
        )
        .await;

        pool.state.job_finished(
            &worker_id,
            job_id,
            started.elapsed(),
            outcome == JobOutcome::Completed,
        );
        drop(permit);
    });
}

async fn cancel_listener(
    state: Arc<PoolState>,
    mut rx: tokio::sync::broadcast::Receiver<JobEvent>,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            event = rx.recv() => match event {
                Ok(JobEvent::Cancelled { job_id, .. }) => state.cancel_running(job_id),
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "cancel listener lagged behind the event stream");
                }
                Err(RecvError::Closed) => break,
            }
        }
    }
}
