//! PostgreSQL-backed job store.
//!
//! Claiming uses `FOR UPDATE SKIP LOCKED` so concurrent dispatchers never
//! block each other and exactly one wins a row. All terminal writes are
//! conditional on `(status = 'running', worker_id)` so a late outcome after
//! cancel/stall/reclaim is dropped rather than clobbering newer state.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, QueryBuilder, Row};
use uuid::Uuid;

use crate::common::error::JobError;
use crate::common::pagination::{Page, PageResult};
use crate::config::RetryConfig;

use super::job::{
    Job, JobFilter, JobPriority, JobProgress, JobResult, JobSort, JobStats, JobStatus, JobType,
    SortDirection,
};
use super::store::{FailOutcome, JobStore};

const JOB_COLUMNS: &str = "id, tenant, job_type, status, priority, payload, metadata, \
     progress, error, result, attempts, max_retries, timeout_ms, scheduled_for, worker_id, \
     user_id, case_id, idempotency_key, created_at, queued_at, started_at, last_attempt_at, \
     last_progress_at, completed_at, failed_at, cancelled_at, updated_at";

/// Raw row shape; JSONB documents are decoded into their typed forms in
/// [`row_to_job`].
#[derive(sqlx::FromRow)]
struct JobRow {
    id: Uuid,
    tenant: String,
    job_type: JobType,
    status: JobStatus,
    priority: JobPriority,
    payload: serde_json::Value,
    metadata: serde_json::Value,
    progress: Option<serde_json::Value>,
    error: Option<serde_json::Value>,
    result: Option<serde_json::Value>,
    attempts: i32,
    max_retries: i32,
    timeout_ms: i64,
    scheduled_for: Option<DateTime<Utc>>,
    worker_id: Option<String>,
    user_id: Option<String>,
    case_id: Option<String>,
    idempotency_key: Option<String>,
    created_at: DateTime<Utc>,
    queued_at: Option<DateTime<Utc>>,
    started_at: Option<DateTime<Utc>>,
    last_attempt_at: Option<DateTime<Utc>>,
    last_progress_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    failed_at: Option<DateTime<Utc>>,
    cancelled_at: Option<DateTime<Utc>>,
    updated_at: DateTime<Utc>,
}

fn row_to_job(row: JobRow) -> Result<Job> {
    Ok(Job {
        id: row.id,
        tenant: row.tenant,
        job_type: row.job_type,
        status: row.status,
        priority: row.priority,
        payload: row.payload,
        metadata: row.metadata,
        progress: row
            .progress
            .map(serde_json::from_value)
            .transpose()
            .context("invalid progress document")?,
        error: row
            .error
            .map(serde_json::from_value)
            .transpose()
            .context("invalid error document")?,
        result: row
            .result
            .map(serde_json::from_value)
            .transpose()
            .context("invalid result document")?,
        attempts: row.attempts,
        max_retries: row.max_retries,
        timeout_ms: row.timeout_ms,
        scheduled_for: row.scheduled_for,
        worker_id: row.worker_id,
        user_id: row.user_id,
        case_id: row.case_id,
        idempotency_key: row.idempotency_key,
        created_at: row.created_at,
        queued_at: row.queued_at,
        started_at: row.started_at,
        last_attempt_at: row.last_attempt_at,
        last_progress_at: row.last_progress_at,
        completed_at: row.completed_at,
        failed_at: row.failed_at,
        cancelled_at: row.cancelled_at,
        updated_at: row.updated_at,
    })
}

fn sort_column(sort: JobSort) -> &'static str {
    match sort {
        JobSort::CreatedAt => "created_at",
        JobSort::StartedAt => "started_at",
        JobSort::CompletedAt => "completed_at",
        JobSort::Priority => "priority",
        JobSort::Status => "status",
    }
}

pub struct PostgresJobStore {
    pool: PgPool,
}

impl PostgresJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn fetch_optional(&self, tenant: &str, id: Uuid) -> Result<Option<Job>> {
        let row = sqlx::query_as::<_, JobRow>(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs WHERE id = $1 AND tenant = $2"
        ))
        .bind(id)
        .bind(tenant)
        .fetch_optional(&self.pool)
        .await?;
        row.map(row_to_job).transpose()
    }
}

#[async_trait]
impl JobStore for PostgresJobStore {
    async fn insert(&self, job: Job) -> Result<Job> {
        let row = sqlx::query_as::<_, JobRow>(&format!(
            r#"
            INSERT INTO jobs (
                id, tenant, job_type, status, priority, payload, metadata,
                progress, error, result, attempts, max_retries, timeout_ms,
                scheduled_for, worker_id, user_id, case_id, idempotency_key,
                created_at, queued_at, started_at, last_attempt_at,
                last_progress_at, completed_at, failed_at, cancelled_at, updated_at
            )
            VALUES (
                $1, $2, $3, $4, $5, $6, $7,
                $8, $9, $10, $11, $12, $13,
                $14, $15, $16, $17, $18,
                $19, $20, $21, $22,
                $23, $24, $25, $26, $27
            )
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(job.id)
        .bind(&job.tenant)
        .bind(job.job_type)
        .bind(job.status)
        .bind(job.priority)
        .bind(&job.payload)
        .bind(&job.metadata)
        .bind(
            job.progress
                .as_ref()
                .map(serde_json::to_value)
                .transpose()?,
        )
        .bind(job.error.as_ref().map(serde_json::to_value).transpose()?)
        .bind(job.result.as_ref().map(serde_json::to_value).transpose()?)
        .bind(job.attempts)
        .bind(job.max_retries)
        .bind(job.timeout_ms)
        .bind(job.scheduled_for)
        .bind(&job.worker_id)
        .bind(&job.user_id)
        .bind(&job.case_id)
        .bind(&job.idempotency_key)
        .bind(job.created_at)
        .bind(job.queued_at)
        .bind(job.started_at)
        .bind(job.last_attempt_at)
        .bind(job.last_progress_at)
        .bind(job.completed_at)
        .bind(job.failed_at)
        .bind(job.cancelled_at)
        .bind(job.updated_at)
        .fetch_one(&self.pool)
        .await?;

        row_to_job(row)
    }

    async fn get(&self, tenant: &str, id: Uuid) -> Result<Option<Job>> {
        self.fetch_optional(tenant, id).await
    }

    async fn claim(&self, worker_id: &str, types: &[JobType]) -> Result<Option<Job>> {
        let row = sqlx::query_as::<_, JobRow>(&format!(
            r#"
            WITH candidate AS (
                SELECT id
                FROM jobs
                WHERE status IN ('pending', 'queued', 'retry')
                  AND worker_id IS NULL
                  AND job_type = ANY($1)
                  AND (scheduled_for IS NULL OR scheduled_for <= NOW())
                ORDER BY priority, created_at
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            UPDATE jobs
            SET status = 'running',
                worker_id = $2,
                attempts = attempts + 1,
                started_at = NOW(),
                last_attempt_at = NOW(),
                queued_at = COALESCE(queued_at, NOW()),
                updated_at = NOW()
            WHERE id IN (SELECT id FROM candidate)
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(types.to_vec())
        .bind(worker_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(row_to_job).transpose()
    }

    async fn update_progress(
        &self,
        tenant: &str,
        id: Uuid,
        worker_id: &str,
        progress: JobProgress,
    ) -> Result<bool> {
        // Percentage is monotonic within an attempt: a stale lower value
        // keeps the stored maximum but still refreshes the other counters.
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET progress = CASE
                    WHEN progress IS NOT NULL
                         AND (progress->>'percentage')::int > ($4::jsonb->>'percentage')::int
                    THEN jsonb_set($4::jsonb, '{percentage}', progress->'percentage')
                    ELSE $4::jsonb
                END,
                last_progress_at = NOW(),
                updated_at = NOW()
            WHERE id = $1 AND tenant = $2 AND status = 'running' AND worker_id = $3
            "#,
        )
        .bind(id)
        .bind(tenant)
        .bind(worker_id)
        .bind(serde_json::to_value(&progress)?)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn update_metadata(
        &self,
        tenant: &str,
        id: Uuid,
        metadata: serde_json::Value,
    ) -> Result<bool> {
        let outcome = sqlx::query(
            r#"
            UPDATE jobs
            SET metadata = $3::jsonb,
                updated_at = NOW()
            WHERE id = $1 AND tenant = $2
            "#,
        )
        .bind(id)
        .bind(tenant)
        .bind(metadata)
        .execute(&self.pool)
        .await?;

        Ok(outcome.rows_affected() > 0)
    }

    async fn complete(
        &self,
        tenant: &str,
        id: Uuid,
        worker_id: &str,
        result: JobResult,
    ) -> Result<bool> {
        let outcome = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'completed',
                result = $4::jsonb,
                completed_at = NOW(),
                worker_id = NULL,
                updated_at = NOW()
            WHERE id = $1 AND tenant = $2 AND status = 'running' AND worker_id = $3
            "#,
        )
        .bind(id)
        .bind(tenant)
        .bind(worker_id)
        .bind(serde_json::to_value(&result)?)
        .execute(&self.pool)
        .await?;

        Ok(outcome.rows_affected() > 0)
    }

    async fn fail(
        &self,
        tenant: &str,
        id: Uuid,
        worker_id: &str,
        error: JobError,
        retry: &RetryConfig,
    ) -> Result<FailOutcome> {
        // The decision needs attempts/max_retries; the conditional write
        // below keeps the transition safe if the row changed in between.
        let Some(job) = self.fetch_optional(tenant, id).await? else {
            return Ok(FailOutcome::Dropped);
        };

        if error.retryable && job.attempts <= job.max_retries {
            let next_attempt_at =
                Utc::now() + chrono::Duration::from_std(retry.delay_for_attempt(job.attempts))?;
            let outcome = sqlx::query(
                r#"
                UPDATE jobs
                SET status = 'retry',
                    worker_id = NULL,
                    error = $4::jsonb,
                    progress = NULL,
                    scheduled_for = $5,
                    updated_at = NOW()
                WHERE id = $1 AND tenant = $2 AND status = 'running' AND worker_id = $3
                "#,
            )
            .bind(id)
            .bind(tenant)
            .bind(worker_id)
            .bind(serde_json::to_value(&error)?)
            .bind(next_attempt_at)
            .execute(&self.pool)
            .await?;

            if outcome.rows_affected() > 0 {
                Ok(FailOutcome::Retried { next_attempt_at })
            } else {
                Ok(FailOutcome::Dropped)
            }
        } else {
            let outcome = sqlx::query(
                r#"
                UPDATE jobs
                SET status = 'failed',
                    worker_id = NULL,
                    error = $4::jsonb,
                    failed_at = NOW(),
                    updated_at = NOW()
                WHERE id = $1 AND tenant = $2 AND status = 'running' AND worker_id = $3
                "#,
            )
            .bind(id)
            .bind(tenant)
            .bind(worker_id)
            .bind(serde_json::to_value(&error)?)
            .execute(&self.pool)
            .await?;

            if outcome.rows_affected() > 0 {
                Ok(FailOutcome::Failed)
            } else {
                Ok(FailOutcome::Dropped)
            }
        }
    }

    async fn cancel(&self, tenant: &str, id: Uuid) -> Result<bool> {
        let outcome = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'cancelled',
                cancelled_at = NOW(),
                worker_id = NULL,
                updated_at = NOW()
            WHERE id = $1 AND tenant = $2
              AND status NOT IN ('completed', 'failed', 'cancelled')
            "#,
        )
        .bind(id)
        .bind(tenant)
        .execute(&self.pool)
        .await?;

        Ok(outcome.rows_affected() > 0)
    }

    async fn retry(&self, tenant: &str, id: Uuid) -> Result<bool> {
        let outcome = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'queued',
                worker_id = NULL,
                error = NULL,
                progress = NULL,
                scheduled_for = NULL,
                failed_at = NULL,
                queued_at = NOW(),
                updated_at = NOW()
            WHERE id = $1 AND tenant = $2 AND status IN ('failed', 'stalled')
            "#,
        )
        .bind(id)
        .bind(tenant)
        .execute(&self.pool)
        .await?;

        Ok(outcome.rows_affected() > 0)
    }

    async fn restart(&self, tenant: &str, id: Uuid) -> Result<bool> {
        let outcome = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'queued',
                attempts = 0,
                worker_id = NULL,
                error = NULL,
                progress = NULL,
                result = NULL,
                scheduled_for = NULL,
                completed_at = NULL,
                failed_at = NULL,
                cancelled_at = NULL,
                queued_at = NOW(),
                updated_at = NOW()
            WHERE id = $1 AND tenant = $2
              AND status IN ('completed', 'failed', 'cancelled')
            "#,
        )
        .bind(id)
        .bind(tenant)
        .execute(&self.pool)
        .await?;

        Ok(outcome.rows_affected() > 0)
    }

    async fn delete(&self, tenant: &str, id: Uuid) -> Result<bool> {
        let outcome = sqlx::query("DELETE FROM jobs WHERE id = $1 AND tenant = $2")
            .bind(id)
            .bind(tenant)
            .execute(&self.pool)
            .await?;
        Ok(outcome.rows_affected() > 0)
    }

    async fn query(
        &self,
        tenant: &str,
        filter: &JobFilter,
        page: &Page,
    ) -> Result<PageResult<Job>> {
        let mut count_qb = QueryBuilder::new("SELECT COUNT(*) FROM jobs WHERE tenant = ");
        count_qb.push_bind(tenant);
        push_filter(&mut count_qb, filter);
        let total: i64 = count_qb.build_query_scalar().fetch_one(&self.pool).await?;

        let mut qb = QueryBuilder::new(format!("SELECT {JOB_COLUMNS} FROM jobs WHERE tenant = "));
        qb.push_bind(tenant);
        push_filter(&mut qb, filter);
        qb.push(format!(" ORDER BY {} ", sort_column(filter.sort)));
        qb.push(match filter.direction {
            SortDirection::Asc => "ASC",
            SortDirection::Desc => "DESC",
        });
        qb.push(" LIMIT ");
        qb.push_bind(page.fetch_limit());
        qb.push(" OFFSET ");
        qb.push_bind(page.offset);

        let rows: Vec<JobRow> = qb.build_query_as().fetch_all(&self.pool).await?;
        let jobs = rows.into_iter().map(row_to_job).collect::<Result<Vec<_>>>()?;
        Ok(PageResult::from_rows(jobs, total, page))
    }

    async fn count_active(&self, tenant: &str) -> Result<i64> {
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM jobs
            WHERE tenant = $1
              AND status NOT IN ('completed', 'failed', 'cancelled')
            "#,
        )
        .bind(tenant)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    async fn stats(&self, tenant: Option<&str>, since: DateTime<Utc>) -> Result<JobStats> {
        let mut stats = JobStats::default();

        // Window: recent rows plus everything still live.
        for (column, target) in ["status", "job_type", "priority"].iter().zip(0..3) {
            let mut qb = QueryBuilder::new(format!("SELECT {column}, COUNT(*) FROM jobs WHERE "));
            push_stats_scope(&mut qb, tenant, since);
            qb.push(format!(" GROUP BY {column}"));
            let rows = qb.build().fetch_all(&self.pool).await?;
            for row in rows {
                let count: i64 = row.try_get(1)?;
                match target {
                    0 => {
                        let status: JobStatus = row.try_get(0)?;
                        stats.by_status.insert(status, count);
                    }
                    1 => {
                        let job_type: JobType = row.try_get(0)?;
                        stats.by_type.insert(job_type, count);
                    }
                    _ => {
                        let priority: JobPriority = row.try_get(0)?;
                        stats.by_priority.insert(priority, count);
                    }
                }
            }
        }

        let mut qb = QueryBuilder::new(
            "SELECT AVG(EXTRACT(EPOCH FROM (started_at - queued_at)) * 1000)::float8 \
             FROM jobs WHERE started_at >= ",
        );
        qb.push_bind(since);
        qb.push(" AND queued_at IS NOT NULL");
        if let Some(tenant) = tenant {
            qb.push(" AND tenant = ");
            qb.push_bind(tenant);
        }
        stats.avg_wait_ms = qb.build_query_scalar().fetch_one(&self.pool).await?;

        let mut qb = QueryBuilder::new(
            "SELECT AVG(EXTRACT(EPOCH FROM (completed_at - started_at)) * 1000)::float8, COUNT(*) \
             FROM jobs WHERE completed_at >= ",
        );
        qb.push_bind(since);
        if let Some(tenant) = tenant {
            qb.push(" AND tenant = ");
            qb.push_bind(tenant);
        }
        let row = qb.build().fetch_one(&self.pool).await?;
        stats.avg_processing_ms = row.try_get(0)?;
        stats.completed_in_window = row.try_get(1)?;

        let mut qb = QueryBuilder::new("SELECT COUNT(*) FROM jobs WHERE failed_at >= ");
        qb.push_bind(since);
        if let Some(tenant) = tenant {
            qb.push(" AND tenant = ");
            qb.push_bind(tenant);
        }
        stats.failed_in_window = qb.build_query_scalar().fetch_one(&self.pool).await?;

        Ok(stats)
    }

    async fn mark_stalled(&self, stall_timeout: Duration) -> Result<Vec<Job>> {
        let cutoff = Utc::now() - chrono::Duration::from_std(stall_timeout)?;
        let error = serde_json::to_value(JobError::stalled())?;

        let rows = sqlx::query_as::<_, JobRow>(&format!(
            r#"
            UPDATE jobs
            SET status = 'stalled',
                worker_id = NULL,
                error = $2::jsonb,
                updated_at = NOW()
            WHERE status = 'running'
              AND GREATEST(
                    COALESCE(last_attempt_at, created_at),
                    COALESCE(last_progress_at, last_attempt_at, created_at)
                  ) < $1
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(cutoff)
        .bind(error)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(row_to_job).collect()
    }

    async fn delete_terminal_older_than(
        &self,
        tenant: &str,
        status: JobStatus,
        cutoff: DateTime<Utc>,
    ) -> Result<u64> {
        let timestamp_column = match status {
            JobStatus::Completed => "completed_at",
            JobStatus::Failed => "failed_at",
            JobStatus::Cancelled => "cancelled_at",
            _ => anyhow::bail!("cleanup only applies to terminal statuses"),
        };

        let outcome = sqlx::query(&format!(
            "DELETE FROM jobs WHERE tenant = $1 AND status = $2 AND {timestamp_column} < $3"
        ))
        .bind(tenant)
        .bind(status)
        .bind(cutoff)
        .execute(&self.pool)
        .await?;

        Ok(outcome.rows_affected())
    }

    async fn failed_retryable_since(
        &self,
        since: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Job>> {
        let rows = sqlx::query_as::<_, JobRow>(&format!(
            r#"
            SELECT {JOB_COLUMNS} FROM jobs
            WHERE status = 'failed'
              AND failed_at >= $1
              AND COALESCE((error->>'retryable')::boolean, false)
            ORDER BY failed_at
            LIMIT $2
            "#
        ))
        .bind(since)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(row_to_job).collect()
    }

    async fn find_by_idempotency_key(&self, tenant: &str, key: &str) -> Result<Option<Job>> {
        let row = sqlx::query_as::<_, JobRow>(&format!(
            r#"
            SELECT {JOB_COLUMNS} FROM jobs
            WHERE tenant = $1
              AND idempotency_key = $2
              AND status NOT IN ('completed', 'failed', 'cancelled')
            LIMIT 1
            "#
        ))
        .bind(tenant)
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;

        row.map(row_to_job).transpose()
    }

    async fn tenants(&self) -> Result<Vec<String>> {
        let tenants: Vec<String> =
            sqlx::query_scalar("SELECT DISTINCT tenant FROM jobs ORDER BY tenant")
                .fetch_all(&self.pool)
                .await?;
        Ok(tenants)
    }
}

fn push_filter(qb: &mut QueryBuilder<'_, sqlx::Postgres>, filter: &JobFilter) {
    if !filter.statuses.is_empty() {
        qb.push(" AND status = ANY(");
        qb.push_bind(filter.statuses.clone());
        qb.push(")");
    }
    if !filter.job_types.is_empty() {
        qb.push(" AND job_type = ANY(");
        qb.push_bind(filter.job_types.clone());
        qb.push(")");
    }
    if !filter.priorities.is_empty() {
        qb.push(" AND priority = ANY(");
        qb.push_bind(filter.priorities.clone());
        qb.push(")");
    }
    if let Some(user_id) = &filter.user_id {
        qb.push(" AND user_id = ");
        qb.push_bind(user_id.clone());
    }
    if let Some(case_id) = &filter.case_id {
        qb.push(" AND case_id = ");
        qb.push_bind(case_id.clone());
    }
    if let Some(after) = filter.created_after {
        qb.push(" AND created_at >= ");
        qb.push_bind(after);
    }
    if let Some(before) = filter.created_before {
        qb.push(" AND created_at <= ");
        qb.push_bind(before);
    }
    if let Some(search) = &filter.search {
        let pattern = format!("%{}%", search);
        qb.push(" AND (payload::text ILIKE ");
        qb.push_bind(pattern.clone());
        qb.push(" OR metadata::text ILIKE ");
        qb.push_bind(pattern);
        qb.push(")");
    }
}

fn push_stats_scope(
    qb: &mut QueryBuilder<'_, sqlx::Postgres>,
    tenant: Option<&str>,
    since: DateTime<Utc>,
) {
    qb.push("(created_at >= ");
    qb.push_bind(since);
    qb.push(" OR status NOT IN ('completed', 'failed', 'cancelled'))");
    if let Some(tenant) = tenant {
        qb.push(" AND tenant = ");
        qb.push_bind(tenant.to_string());
    }
}
