//! Durable job store contract.
//!
//! The store owns job rows and is the sole synchronization point of the
//! pipeline. Every state transition is a conditional write: claim is a
//! compare-and-swap on claimable status, and terminal writes check both
//! `status = running` and the claiming worker so a late Complete/Fail after
//! a cancel or stall is dropped.
//!
//! Two implementations carry identical semantics:
//! - [`PostgresJobStore`](super::postgres_store::PostgresJobStore) backed by
//!   `FOR UPDATE SKIP LOCKED` claims, for production;
//! - [`MemoryJobStore`](super::memory_store::MemoryJobStore) for tests and
//!   local development.

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::common::error::JobError;
use crate::common::pagination::{Page, PageResult};
use crate::config::RetryConfig;

use super::job::{Job, JobFilter, JobProgress, JobResult, JobStats, JobStatus, JobType};

/// Outcome of a `fail` write.
#[derive(Debug, Clone, PartialEq)]
pub enum FailOutcome {
    /// Retries remained and the error was retryable; re-queued for the
    /// returned instant.
    Retried { next_attempt_at: DateTime<Utc> },
    /// Terminal failure recorded.
    Failed,
    /// The row was no longer running under this worker (cancelled, stalled,
    /// or re-claimed); the write was dropped.
    Dropped,
}

/// Operator bulk operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BulkAction {
    Cancel,
    Retry,
    Delete,
    Restart,
}

/// Per-id results of a bulk operation.
#[derive(Debug, Clone, Default, Serialize)]
pub struct BulkOutcome {
    pub applied: Vec<Uuid>,
    pub skipped: Vec<Uuid>,
}

/// Durable per-tenant store of job records.
///
/// Tenant isolation is structural: every row-level operation takes the
/// caller's tenant and must never touch another tenant's rows. The sweep
/// operations (`claim`, `mark_stalled`, `failed_retryable_since`,
/// `tenants`) are process-internal and iterate all tenants.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a new job row.
    async fn insert(&self, job: Job) -> Result<Job>;

    /// Fetch one job.
    async fn get(&self, tenant: &str, id: Uuid) -> Result<Option<Job>>;

    /// Atomically claim the next eligible job for a worker.
    ///
    /// Eligible: claimable status, no worker bound, type in `types`, and
    /// `scheduled_for` not in the future (lazily promoting `pending` rows).
    /// Ordered by priority then FIFO on `created_at`. The swap sets
    /// `running`, binds the worker, stamps `started_at`/`last_attempt_at`
    /// and increments `attempts`.
    async fn claim(&self, worker_id: &str, types: &[JobType]) -> Result<Option<Job>>;

    /// Record a progress checkpoint.
    ///
    /// Returns `false` when the job is no longer running under `worker_id`;
    /// the handler must treat that as a cancellation signal. Percentage is
    /// monotonic within the attempt; a lower value keeps the stored maximum.
    async fn update_progress(
        &self,
        tenant: &str,
        id: Uuid,
        worker_id: &str,
        progress: JobProgress,
    ) -> Result<bool>;

    /// Replace the job's opaque metadata bag. Allowed in any status.
    async fn update_metadata(
        &self,
        tenant: &str,
        id: Uuid,
        metadata: serde_json::Value,
    ) -> Result<bool>;

    /// Transition `running` → `completed`. Returns `false` if the
    /// conditional write did not apply.
    async fn complete(
        &self,
        tenant: &str,
        id: Uuid,
        worker_id: &str,
        result: JobResult,
    ) -> Result<bool>;

    /// Transition `running` → `failed`, or re-queue with backoff when the
    /// error is retryable and attempts remain.
    async fn fail(
        &self,
        tenant: &str,
        id: Uuid,
        worker_id: &str,
        error: JobError,
        retry: &RetryConfig,
    ) -> Result<FailOutcome>;

    /// Cancel any non-terminal job. Instant for queued rows; a running
    /// handler observes it at its next checkpoint.
    async fn cancel(&self, tenant: &str, id: Uuid) -> Result<bool>;

    /// Explicit operator retry: `failed | stalled` → `queued`, clearing
    /// worker, error, and progress.
    async fn retry(&self, tenant: &str, id: Uuid) -> Result<bool>;

    /// Re-queue a terminal job from scratch (attempts reset to zero).
    async fn restart(&self, tenant: &str, id: Uuid) -> Result<bool>;

    /// Delete one row.
    async fn delete(&self, tenant: &str, id: Uuid) -> Result<bool>;

    /// Filtered, paginated listing for one tenant.
    async fn query(&self, tenant: &str, filter: &JobFilter, page: &Page)
        -> Result<PageResult<Job>>;

    /// Number of non-terminal jobs for a tenant (quota accounting).
    async fn count_active(&self, tenant: &str) -> Result<i64>;

    /// Aggregated counters; `tenant = None` spans all tenants.
    async fn stats(&self, tenant: Option<&str>, since: DateTime<Utc>) -> Result<JobStats>;

    /// Sweep: mark running rows without activity inside `stall_timeout` as
    /// `stalled` and record a STALLED error. Returns the affected jobs.
    async fn mark_stalled(&self, stall_timeout: Duration) -> Result<Vec<Job>>;

    /// Sweep: delete terminal rows of `status` whose terminal timestamp
    /// precedes `cutoff`. Returns the number deleted.
    async fn delete_terminal_older_than(
        &self,
        tenant: &str,
        status: JobStatus,
        cutoff: DateTime<Utc>,
    ) -> Result<u64>;

    /// Sweep: failed-but-retryable jobs since `since`, for auto-retry.
    async fn failed_retryable_since(&self, since: DateTime<Utc>, limit: i64) -> Result<Vec<Job>>;

    /// Find a live (non-terminal) job carrying an idempotency key.
    async fn find_by_idempotency_key(&self, tenant: &str, key: &str) -> Result<Option<Job>>;

    /// Distinct tenants present in the store, for maintenance sweeps.
    async fn tenants(&self) -> Result<Vec<String>>;

    /// Apply one operator action to a set of ids.
    async fn bulk(&self, tenant: &str, ids: &[Uuid], action: BulkAction) -> Result<BulkOutcome> {
        let mut outcome = BulkOutcome::default();
        for id in ids {
            let applied = match action {
                BulkAction::Cancel => self.cancel(tenant, *id).await?,
                BulkAction::Retry => self.retry(tenant, *id).await?,
                BulkAction::Delete => self.delete(tenant, *id).await?,
                BulkAction::Restart => self.restart(tenant, *id).await?,
            };
            if applied {
                outcome.applied.push(*id);
            } else {
                outcome.skipped.push(*id);
            }
        }
        Ok(outcome)
    }
}
