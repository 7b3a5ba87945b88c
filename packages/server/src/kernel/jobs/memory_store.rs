//! In-memory job store.
//!
//! Carries the same state-machine semantics as the Postgres store behind a
//! process-local map. Used by the test suite and for local development
//! without a database; the whole claim path runs under one write lock, which
//! gives the same single-winner guarantee the SQL implementation gets from
//! `FOR UPDATE SKIP LOCKED`.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::common::error::JobError;
use crate::common::pagination::{Page, PageResult};
use crate::config::RetryConfig;

use super::job::{
    Job, JobFilter, JobProgress, JobResult, JobSort, JobStats, JobStatus, JobType, SortDirection,
};
use super::store::{FailOutcome, JobStore};

#[derive(Default)]
pub struct MemoryJobStore {
    jobs: RwLock<HashMap<Uuid, Job>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<Uuid, Job>> {
        self.jobs.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<Uuid, Job>> {
        self.jobs.write().unwrap_or_else(|e| e.into_inner())
    }

    /// All rows, for test assertions.
    pub fn snapshot(&self) -> Vec<Job> {
        self.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }
}

fn matches_filter(job: &Job, filter: &JobFilter) -> bool {
    if !filter.statuses.is_empty() && !filter.statuses.contains(&job.status) {
        return false;
    }
    if !filter.job_types.is_empty() && !filter.job_types.contains(&job.job_type) {
        return false;
    }
    if !filter.priorities.is_empty() && !filter.priorities.contains(&job.priority) {
        return false;
    }
    if let Some(user) = &filter.user_id {
        if job.user_id.as_deref() != Some(user.as_str()) {
            return false;
        }
    }
    if let Some(case) = &filter.case_id {
        if job.case_id.as_deref() != Some(case.as_str()) {
            return false;
        }
    }
    if let Some(after) = filter.created_after {
        if job.created_at < after {
            return false;
        }
    }
    if let Some(before) = filter.created_before {
        if job.created_at > before {
            return false;
        }
    }
    if let Some(needle) = &filter.search {
        let needle = needle.to_lowercase();
        let payload = job.payload.to_string().to_lowercase();
        let metadata = job.metadata.to_string().to_lowercase();
        if !payload.contains(&needle) && !metadata.contains(&needle) {
            return false;
        }
    }
    true
}

fn sort_jobs(jobs: &mut [Job], sort: JobSort, direction: SortDirection) {
    jobs.sort_by(|a, b| {
        let ordering = match sort {
            JobSort::CreatedAt => a.created_at.cmp(&b.created_at),
            JobSort::StartedAt => a.started_at.cmp(&b.started_at),
            JobSort::CompletedAt => a.completed_at.cmp(&b.completed_at),
            JobSort::Priority => a.priority.rank().cmp(&b.priority.rank()),
            JobSort::Status => a.status.as_str().cmp(b.status.as_str()),
        };
        match direction {
            SortDirection::Asc => ordering,
            SortDirection::Desc => ordering.reverse(),
        }
    });
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn insert(&self, job: Job) -> Result<Job> {
        self.write().insert(job.id, job.clone());
        Ok(job)
    }

    async fn get(&self, tenant: &str, id: Uuid) -> Result<Option<Job>> {
        Ok(self
            .read()
            .get(&id)
            .filter(|j| j.tenant == tenant)
            .cloned())
    }

    async fn claim(&self, worker_id: &str, types: &[JobType]) -> Result<Option<Job>> {
        let now = Utc::now();
        let mut jobs = self.write();

        let mut candidates: Vec<(i16, DateTime<Utc>, Uuid)> = jobs
            .values()
            .filter(|j| {
                j.status.is_claimable()
                    && j.worker_id.is_none()
                    && types.contains(&j.job_type)
                    && j.scheduled_for.map(|at| at <= now).unwrap_or(true)
            })
            .map(|j| (j.priority.rank(), j.created_at, j.id))
            .collect();
        candidates.sort();

        let Some((_, _, id)) = candidates.into_iter().next() else {
            return Ok(None);
        };

        let job = jobs.get_mut(&id).expect("candidate row exists");
        job.status = JobStatus::Running;
        job.worker_id = Some(worker_id.to_string());
        job.attempts += 1;
        job.started_at = Some(now);
        job.last_attempt_at = Some(now);
        job.queued_at = job.queued_at.or(Some(now));
        job.updated_at = now;
        Ok(Some(job.clone()))
    }

    async fn update_progress(
        &self,
        tenant: &str,
        id: Uuid,
        worker_id: &str,
        mut progress: JobProgress,
    ) -> Result<bool> {
        let now = Utc::now();
        let mut jobs = self.write();
        let Some(job) = jobs.get_mut(&id) else {
            return Ok(false);
        };
        if job.tenant != tenant
            || job.status != JobStatus::Running
            || job.worker_id.as_deref() != Some(worker_id)
        {
            return Ok(false);
        }
        if let Some(old) = &job.progress {
            if progress.percentage < old.percentage {
                progress.percentage = old.percentage;
            }
        }
        job.progress = Some(progress);
        job.last_progress_at = Some(now);
        job.updated_at = now;
        Ok(true)
    }

    async fn update_metadata(
        &self,
        tenant: &str,
        id: Uuid,
        metadata: serde_json::Value,
    ) -> Result<bool> {
        let mut jobs = self.write();
        let Some(job) = jobs.get_mut(&id) else {
            return Ok(false);
        };
        if job.tenant != tenant {
            return Ok(false);
        }
        job.metadata = metadata;
        job.updated_at = Utc::now();
        Ok(true)
    }

    async fn complete(
        &self,
        tenant: &str,
        id: Uuid,
        worker_id: &str,
        result: JobResult,
    ) -> Result<bool> {
        let now = Utc::now();
        let mut jobs = self.write();
        let Some(job) = jobs.get_mut(&id) else {
            return Ok(false);
        };
        if job.tenant != tenant
            || job.status != JobStatus::Running
            || job.worker_id.as_deref() != Some(worker_id)
        {
            return Ok(false);
        }
        job.status = JobStatus::Completed;
        job.result = Some(result);
        job.completed_at = Some(now);
        job.worker_id = None;
        job.updated_at = now;
        Ok(true)
    }

    async fn fail(
        &self,
        tenant: &str,
        id: Uuid,
        worker_id: &str,
        error: JobError,
        retry: &RetryConfig,
    ) -> Result<FailOutcome> {
        let now = Utc::now();
        let mut jobs = self.write();
        let Some(job) = jobs.get_mut(&id) else {
            return Ok(FailOutcome::Dropped);
        };
        if job.tenant != tenant
            || job.status != JobStatus::Running
            || job.worker_id.as_deref() != Some(worker_id)
        {
            return Ok(FailOutcome::Dropped);
        }

        if error.retryable && job.attempts <= job.max_retries {
            let next = now + chrono::Duration::from_std(retry.delay_for_attempt(job.attempts))?;
            job.status = JobStatus::Retry;
            job.worker_id = None;
            job.error = Some(error);
            job.progress = None;
            job.scheduled_for = Some(next);
            job.updated_at = now;
            Ok(FailOutcome::Retried {
                next_attempt_at: next,
            })
        } else {
            job.status = JobStatus::Failed;
            job.worker_id = None;
            job.error = Some(error);
            job.failed_at = Some(now);
            job.updated_at = now;
            Ok(FailOutcome::Failed)
        }
    }

    async fn cancel(&self, tenant: &str, id: Uuid) -> Result<bool> {
        let now = Utc::now();
        let mut jobs = self.write();
        let Some(job) = jobs.get_mut(&id) else {
            return Ok(false);
        };
        if job.tenant != tenant || job.is_terminal() {
            return Ok(false);
        }
        job.status = JobStatus::Cancelled;
        job.cancelled_at = Some(now);
        job.worker_id = None;
        job.updated_at = now;
        Ok(true)
    }

    async fn retry(&self, tenant: &str, id: Uuid) -> Result<bool> {
        let now = Utc::now();
        let mut jobs = self.write();
        let Some(job) = jobs.get_mut(&id) else {
            return Ok(false);
        };
        if job.tenant != tenant
            || !matches!(job.status, JobStatus::Failed | JobStatus::Stalled)
        {
            return Ok(false);
        }
        job.status = JobStatus::Queued;
        job.worker_id = None;
        job.error = None;
        job.progress = None;
        job.scheduled_for = None;
        job.failed_at = None;
        job.queued_at = Some(now);
        job.updated_at = now;
        Ok(true)
    }

    async fn restart(&self, tenant: &str, id: Uuid) -> Result<bool> {
        let now = Utc::now();
        let mut jobs = self.write();
        let Some(job) = jobs.get_mut(&id) else {
            return Ok(false);
        };
        if job.tenant != tenant || !job.is_terminal() {
            return Ok(false);
        }
        job.status = JobStatus::Queued;
        job.attempts = 0;
        job.worker_id = None;
        job.error = None;
        job.progress = None;
        job.result = None;
        job.scheduled_for = None;
        job.completed_at = None;
        job.failed_at = None;
        job.cancelled_at = None;
        job.queued_at = Some(now);
        job.updated_at = now;
        Ok(true)
    }

    async fn delete(&self, tenant: &str, id: Uuid) -> Result<bool> {
        let mut jobs = self.write();
        match jobs.get(&id) {
            Some(job) if job.tenant == tenant => {
                jobs.remove(&id);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn query(
        &self,
        tenant: &str,
        filter: &JobFilter,
        page: &Page,
    ) -> Result<PageResult<Job>> {
        let mut matched: Vec<Job> = self
            .read()
            .values()
            .filter(|j| j.tenant == tenant && matches_filter(j, filter))
            .cloned()
            .collect();
        sort_jobs(&mut matched, filter.sort, filter.direction);

        let total = matched.len() as i64;
        let rows: Vec<Job> = matched
            .into_iter()
            .skip(page.offset as usize)
            .take(page.fetch_limit() as usize)
            .collect();
        Ok(PageResult::from_rows(rows, total, page))
    }

    async fn count_active(&self, tenant: &str) -> Result<i64> {
        Ok(self
            .read()
            .values()
            .filter(|j| j.tenant == tenant && !j.is_terminal())
            .count() as i64)
    }

    async fn stats(&self, tenant: Option<&str>, since: DateTime<Utc>) -> Result<JobStats> {
        let jobs = self.read();
        let mut stats = JobStats::default();
        let mut wait_samples = Vec::new();
        let mut processing_samples = Vec::new();

        for job in jobs.values() {
            if let Some(tenant) = tenant {
                if job.tenant != tenant {
                    continue;
                }
            }
            // Window: recent rows plus everything still live.
            if job.is_terminal() && job.created_at < since {
                let terminal_at = job
                    .completed_at
                    .or(job.failed_at)
                    .or(job.cancelled_at)
                    .unwrap_or(job.created_at);
                if terminal_at < since {
                    continue;
                }
            }

            *stats.by_status.entry(job.status).or_insert(0) += 1;
            *stats.by_type.entry(job.job_type).or_insert(0) += 1;
            *stats.by_priority.entry(job.priority).or_insert(0) += 1;

            if let (Some(queued), Some(started)) = (job.queued_at, job.started_at) {
                if started >= since {
                    wait_samples.push((started - queued).num_milliseconds() as f64);
                }
            }
            if let (Some(started), Some(completed)) = (job.started_at, job.completed_at) {
                if completed >= since {
                    processing_samples.push((completed - started).num_milliseconds() as f64);
                    stats.completed_in_window += 1;
                }
            }
            if job.failed_at.map(|at| at >= since).unwrap_or(false) {
                stats.failed_in_window += 1;
            }
        }

        stats.avg_wait_ms = mean(&wait_samples);
        stats.avg_processing_ms = mean(&processing_samples);
        Ok(stats)
    }

    async fn mark_stalled(&self, stall_timeout: Duration) -> Result<Vec<Job>> {
        let now = Utc::now();
        let cutoff = now - chrono::Duration::from_std(stall_timeout)?;
        let mut stalled = Vec::new();
        let mut jobs = self.write();
        for job in jobs.values_mut() {
            if job.status != JobStatus::Running {
                continue;
            }
            let last_activity = job.last_activity_at().unwrap_or(job.created_at);
            if last_activity < cutoff {
                job.status = JobStatus::Stalled;
                job.error = Some(JobError::stalled());
                job.worker_id = None;
                job.updated_at = now;
                stalled.push(job.clone());
            }
        }
        Ok(stalled)
    }

    async fn delete_terminal_older_than(
        &self,
        tenant: &str,
        status: JobStatus,
        cutoff: DateTime<Utc>,
    ) -> Result<u64> {
        let mut jobs = self.write();
        let doomed: Vec<Uuid> = jobs
            .values()
            .filter(|j| {
                if j.tenant != tenant || j.status != status {
                    return false;
                }
                let terminal_at = match status {
                    JobStatus::Completed => j.completed_at,
                    JobStatus::Failed => j.failed_at,
                    JobStatus::Cancelled => j.cancelled_at,
                    _ => None,
                };
                terminal_at.map(|at| at < cutoff).unwrap_or(false)
            })
            .map(|j| j.id)
            .collect();
        for id in &doomed {
            jobs.remove(id);
        }
        Ok(doomed.len() as u64)
    }

    async fn failed_retryable_since(
        &self,
        since: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Job>> {
        let mut failed: Vec<Job> = self
            .read()
            .values()
            .filter(|j| {
                j.status == JobStatus::Failed
                    && j.failed_at.map(|at| at >= since).unwrap_or(false)
                    && j.error.as_ref().map(|e| e.retryable).unwrap_or(false)
            })
            .cloned()
            .collect();
        failed.sort_by_key(|j| j.failed_at);
        failed.truncate(limit as usize);
        Ok(failed)
    }

    async fn find_by_idempotency_key(&self, tenant: &str, key: &str) -> Result<Option<Job>> {
        Ok(self
            .read()
            .values()
            .find(|j| {
                j.tenant == tenant
                    && !j.is_terminal()
                    && j.idempotency_key.as_deref() == Some(key)
            })
            .cloned())
    }

    async fn tenants(&self) -> Result<Vec<String>> {
        let mut tenants: Vec<String> = self
            .read()
            .values()
            .map(|j| j.tenant.clone())
            .collect::<std::collections::BTreeSet<_>>()
            .into_iter()
            .collect();
        tenants.sort();
        Ok(tenants)
    }
}

fn mean(samples: &[f64]) -> Option<f64> {
    if samples.is_empty() {
        None
    } else {
        Some(samples.iter().sum::<f64>() / samples.len() as f64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::jobs::job::JobPriority;

    fn store() -> MemoryJobStore {
        MemoryJobStore::new()
    }

    fn job(tenant: &str, job_type: JobType) -> Job {
        Job::immediate(tenant, job_type, serde_json::json!({"k": "v"}))
    }

    #[tokio::test]
    async fn claim_sets_running_and_increments_attempts() {
        let store = store();
        let inserted = store.insert(job("t1", JobType::EmailArchival)).await.unwrap();

        let claimed = store
            .claim("w1", &[JobType::EmailArchival])
            .await
            .unwrap()
            .unwrap();
        assert_eq!(claimed.id, inserted.id);
        assert_eq!(claimed.status, JobStatus::Running);
        assert_eq!(claimed.worker_id.as_deref(), Some("w1"));
        assert_eq!(claimed.attempts, 1);
        assert!(claimed.started_at.is_some());
    }

    #[tokio::test]
    async fn claim_is_single_winner() {
        let store = store();
        store.insert(job("t1", JobType::Export)).await.unwrap();

        let first = store.claim("w1", &[JobType::Export]).await.unwrap();
        let second = store.claim("w2", &[JobType::Export]).await.unwrap();
        assert!(first.is_some());
        assert!(second.is_none());
    }

    #[tokio::test]
    async fn claim_respects_priority_then_fifo() {
        let store = store();
        let mut normal = job("t1", JobType::Export);
        normal.created_at = Utc::now() - chrono::Duration::seconds(10);
        let mut high = job("t1", JobType::Export);
        high.priority = JobPriority::High;
        high.created_at = Utc::now();
        let normal = store.insert(normal).await.unwrap();
        let high = store.insert(high).await.unwrap();

        let first = store.claim("w", &[JobType::Export]).await.unwrap().unwrap();
        assert_eq!(first.id, high.id);
        let second = store.claim("w", &[JobType::Export]).await.unwrap().unwrap();
        assert_eq!(second.id, normal.id);
    }

    #[tokio::test]
    async fn claim_fifo_within_priority() {
        let store = store();
        let mut older = job("t1", JobType::Export);
        older.created_at = Utc::now() - chrono::Duration::seconds(5);
        let older = store.insert(older).await.unwrap();
        store.insert(job("t1", JobType::Export)).await.unwrap();

        let first = store.claim("w", &[JobType::Export]).await.unwrap().unwrap();
        assert_eq!(first.id, older.id);
    }

    #[tokio::test]
    async fn claim_skips_future_scheduled_jobs() {
        let store = store();
        let mut future = job("t1", JobType::Export);
        future.status = JobStatus::Pending;
        future.scheduled_for = Some(Utc::now() + chrono::Duration::hours(1));
        store.insert(future).await.unwrap();

        assert!(store.claim("w", &[JobType::Export]).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn claim_promotes_due_pending_jobs() {
        let store = store();
        let mut due = job("t1", JobType::Export);
        due.status = JobStatus::Pending;
        due.scheduled_for = Some(Utc::now() - chrono::Duration::seconds(1));
        store.insert(due).await.unwrap();

        let claimed = store.claim("w", &[JobType::Export]).await.unwrap();
        assert!(claimed.is_some());
    }

    #[tokio::test]
    async fn claim_filters_by_supported_types() {
        let store = store();
        store.insert(job("t1", JobType::Export)).await.unwrap();

        assert!(store
            .claim("w", &[JobType::EmailArchival])
            .await
            .unwrap()
            .is_none());
        assert!(store.claim("w", &[JobType::Export]).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn fail_requeues_with_backoff_while_attempts_remain() {
        let store = store();
        let retry = RetryConfig::default();
        store.insert(job("t1", JobType::Export)).await.unwrap();
        let claimed = store.claim("w", &[JobType::Export]).await.unwrap().unwrap();

        let outcome = store
            .fail("t1", claimed.id, "w", JobError::storage("blip"), &retry)
            .await
            .unwrap();
        assert!(matches!(outcome, FailOutcome::Retried { .. }));

        let row = store.get("t1", claimed.id).await.unwrap().unwrap();
        assert_eq!(row.status, JobStatus::Retry);
        assert!(row.worker_id.is_none());
        assert!(row.scheduled_for.unwrap() > Utc::now());
        assert!(row.progress.is_none());
    }

    #[tokio::test]
    async fn fail_terminal_when_not_retryable() {
        let store = store();
        let retry = RetryConfig::default();
        store.insert(job("t1", JobType::Export)).await.unwrap();
        let claimed = store.claim("w", &[JobType::Export]).await.unwrap().unwrap();

        let outcome = store
            .fail(
                "t1",
                claimed.id,
                "w",
                JobError::precondition("account not connected"),
                &retry,
            )
            .await
            .unwrap();
        assert_eq!(outcome, FailOutcome::Failed);

        let row = store.get("t1", claimed.id).await.unwrap().unwrap();
        assert_eq!(row.status, JobStatus::Failed);
        assert_eq!(row.attempts, 1);
        assert!(row.failed_at.is_some());
    }

    #[tokio::test]
    async fn fail_terminal_when_attempts_exhausted() {
        let store = store();
        let retry = RetryConfig {
            initial_ms: 0,
            multiplier: 1,
            max_ms: 0,
        };
        let mut j = job("t1", JobType::Export);
        j.max_retries = 1;
        store.insert(j).await.unwrap();

        // attempt 1: retried
        let claimed = store.claim("w", &[JobType::Export]).await.unwrap().unwrap();
        let outcome = store
            .fail("t1", claimed.id, "w", JobError::storage("x"), &retry)
            .await
            .unwrap();
        assert!(matches!(outcome, FailOutcome::Retried { .. }));

        // attempt 2: exhausted
        let claimed = store.claim("w", &[JobType::Export]).await.unwrap().unwrap();
        assert_eq!(claimed.attempts, 2);
        let outcome = store
            .fail("t1", claimed.id, "w", JobError::storage("x"), &retry)
            .await
            .unwrap();
        assert_eq!(outcome, FailOutcome::Failed);
    }

    #[tokio::test]
    async fn complete_after_cancel_is_dropped() {
        let store = store();
        store.insert(job("t1", JobType::Export)).await.unwrap();
        let claimed = store.claim("w", &[JobType::Export]).await.unwrap().unwrap();

        assert!(store.cancel("t1", claimed.id).await.unwrap());
        let wrote = store
            .complete("t1", claimed.id, "w", JobResult::default())
            .await
            .unwrap();
        assert!(!wrote);

        let row = store.get("t1", claimed.id).await.unwrap().unwrap();
        assert_eq!(row.status, JobStatus::Cancelled);
        assert!(row.cancelled_at.is_some());
    }

    #[tokio::test]
    async fn retry_clears_error_and_progress() {
        let store = store();
        let retry = RetryConfig::default();
        let mut j = job("t1", JobType::Export);
        j.max_retries = 0;
        store.insert(j).await.unwrap();
        let claimed = store.claim("w", &[JobType::Export]).await.unwrap().unwrap();
        store
            .update_progress("t1", claimed.id, "w", JobProgress::steps(1, 4, "step"))
            .await
            .unwrap();
        store
            .fail("t1", claimed.id, "w", JobError::storage("x"), &retry)
            .await
            .unwrap();

        assert!(store.retry("t1", claimed.id).await.unwrap());
        let row = store.get("t1", claimed.id).await.unwrap().unwrap();
        assert_eq!(row.status, JobStatus::Queued);
        assert!(row.worker_id.is_none());
        assert!(row.error.is_none());
        assert!(row.progress.is_none());
    }

    #[tokio::test]
    async fn retry_rejected_for_non_failed_jobs() {
        let store = store();
        let inserted = store.insert(job("t1", JobType::Export)).await.unwrap();
        assert!(!store.retry("t1", inserted.id).await.unwrap());
    }

    #[tokio::test]
    async fn progress_is_monotonic_within_attempt() {
        let store = store();
        store.insert(job("t1", JobType::Export)).await.unwrap();
        let claimed = store.claim("w", &[JobType::Export]).await.unwrap().unwrap();

        store
            .update_progress("t1", claimed.id, "w", JobProgress::steps(3, 4, "late"))
            .await
            .unwrap();
        store
            .update_progress("t1", claimed.id, "w", JobProgress::steps(1, 4, "early"))
            .await
            .unwrap();

        let row = store.get("t1", claimed.id).await.unwrap().unwrap();
        assert_eq!(row.percentage(), 75);
    }

    #[tokio::test]
    async fn progress_rejected_when_not_running() {
        let store = store();
        let inserted = store.insert(job("t1", JobType::Export)).await.unwrap();
        let ok = store
            .update_progress("t1", inserted.id, "w", JobProgress::default())
            .await
            .unwrap();
        assert!(!ok);
    }

    #[tokio::test]
    async fn mark_stalled_transitions_inactive_running_rows() {
        let store = store();
        store.insert(job("t1", JobType::Export)).await.unwrap();
        let claimed = store.claim("w", &[JobType::Export]).await.unwrap().unwrap();

        // Fresh activity: not stalled under a generous timeout.
        let stalled = store.mark_stalled(Duration::from_secs(600)).await.unwrap();
        assert!(stalled.is_empty());

        // Zero timeout: everything running is stale.
        tokio::time::sleep(Duration::from_millis(5)).await;
        let stalled = store.mark_stalled(Duration::from_millis(1)).await.unwrap();
        assert_eq!(stalled.len(), 1);

        let row = store.get("t1", claimed.id).await.unwrap().unwrap();
        assert_eq!(row.status, JobStatus::Stalled);
        assert!(row.worker_id.is_none());
        let err = row.error.unwrap();
        assert!(err.retryable);
    }

    #[tokio::test]
    async fn cleanup_deletes_only_rows_past_cutoff() {
        let store = store();
        store.insert(job("t1", JobType::Export)).await.unwrap();
        let claimed = store.claim("w", &[JobType::Export]).await.unwrap().unwrap();
        store
            .complete("t1", claimed.id, "w", JobResult::default())
            .await
            .unwrap();

        let deleted = store
            .delete_terminal_older_than(
                "t1",
                JobStatus::Completed,
                Utc::now() - chrono::Duration::days(1),
            )
            .await
            .unwrap();
        assert_eq!(deleted, 0);

        let deleted = store
            .delete_terminal_older_than(
                "t1",
                JobStatus::Completed,
                Utc::now() + chrono::Duration::seconds(1),
            )
            .await
            .unwrap();
        assert_eq!(deleted, 1);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn tenant_isolation_on_get_and_query() {
        let store = store();
        let inserted = store.insert(job("t1", JobType::Export)).await.unwrap();

        assert!(store.get("t2", inserted.id).await.unwrap().is_none());
        let page = store
            .query("t2", &JobFilter::default(), &Page::default())
            .await
            .unwrap();
        assert!(page.items.is_empty());
    }

    #[tokio::test]
    async fn idempotency_key_finds_live_jobs_only() {
        let store = store();
        let mut j = job("t1", JobType::EmailArchival);
        j.idempotency_key = Some("email_archival:m1:c1".to_string());
        let inserted = store.insert(j).await.unwrap();

        let found = store
            .find_by_idempotency_key("t1", "email_archival:m1:c1")
            .await
            .unwrap();
        assert_eq!(found.unwrap().id, inserted.id);

        // Terminal rows no longer block the key.
        let claimed = store
            .claim("w", &[JobType::EmailArchival])
            .await
            .unwrap()
            .unwrap();
        store
            .complete("t1", claimed.id, "w", JobResult::default())
            .await
            .unwrap();
        assert!(store
            .find_by_idempotency_key("t1", "email_archival:m1:c1")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn metadata_updates_in_any_status() {
        let store = store();
        let inserted = store.insert(job("t1", JobType::Export)).await.unwrap();

        let ok = store
            .update_metadata("t1", inserted.id, serde_json::json!({"source": "import"}))
            .await
            .unwrap();
        assert!(ok);
        let row = store.get("t1", inserted.id).await.unwrap().unwrap();
        assert_eq!(row.metadata["source"], "import");

        // Tenant-scoped like everything else.
        assert!(!store
            .update_metadata("t2", inserted.id, serde_json::json!({}))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn restart_resets_attempts() {
        let store = store();
        let retry = RetryConfig::default();
        let mut j = job("t1", JobType::Export);
        j.max_retries = 0;
        store.insert(j).await.unwrap();
        let claimed = store.claim("w", &[JobType::Export]).await.unwrap().unwrap();
        store
            .fail("t1", claimed.id, "w", JobError::storage("x"), &retry)
            .await
            .unwrap();

        assert!(store.restart("t1", claimed.id).await.unwrap());
        let row = store.get("t1", claimed.id).await.unwrap().unwrap();
        assert_eq!(row.status, JobStatus::Queued);
        assert_eq!(row.attempts, 0);
        assert!(row.error.is_none());
    }

    #[tokio::test]
    async fn query_filters_and_paginates() {
        let store = store();
        for i in 0..5 {
            let mut j = job("t1", JobType::Export);
            j.case_id = Some(format!("case-{}", i % 2));
            store.insert(j).await.unwrap();
        }

        let filter = JobFilter {
            case_id: Some("case-0".to_string()),
            ..Default::default()
        };
        let page = store.query("t1", &filter, &Page::first(2)).await.unwrap();
        assert_eq!(page.total, 3);
        assert_eq!(page.items.len(), 2);
        assert!(page.has_more);
    }

    #[tokio::test]
    async fn stats_counts_by_status() {
        let store = store();
        store.insert(job("t1", JobType::Export)).await.unwrap();
        store.insert(job("t1", JobType::EmailArchival)).await.unwrap();
        let claimed = store.claim("w", &[JobType::Export]).await.unwrap().unwrap();
        store
            .complete("t1", claimed.id, "w", JobResult::default())
            .await
            .unwrap();

        let since = Utc::now() - chrono::Duration::hours(24);
        let stats = store.stats(Some("t1"), since).await.unwrap();
        assert_eq!(stats.count(JobStatus::Queued), 1);
        assert_eq!(stats.count(JobStatus::Completed), 1);
        assert_eq!(stats.completed_in_window, 1);
        assert!(stats.avg_wait_ms.is_some());
    }
}
