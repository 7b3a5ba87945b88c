//! Enqueue surface and claim delegation.
//!
//! Thin policy layer over the store: validates the payload shape for the
//! named kind, fills defaults, enforces the per-tenant depth ceiling, and
//! assigns the id. Single-job event streaming is delegated to the hub.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, info};
use uuid::Uuid;

use crate::common::error::EnqueueError;
use crate::common::pagination::{Page, PageResult};

use super::events::{JobEvent, JobEventHub};
use super::job::{Job, JobFilter, JobPriority, JobStats, JobStatus, JobType};
use super::store::{BulkAction, BulkOutcome, JobStore};

/// Typed payload contract for a job kind.
///
/// Implementations are the per-kind schemas validated at enqueue; `derived`
/// surfaces the denormalized query columns and the idempotency key.
pub trait JobPayload: DeserializeOwned {
    const JOB_TYPE: JobType;

    fn derived(&self) -> EnqueueDerived {
        EnqueueDerived::default()
    }
}

/// Values extracted from a validated payload at enqueue time.
#[derive(Debug, Clone, Default)]
pub struct EnqueueDerived {
    pub user_id: Option<String>,
    pub case_id: Option<String>,
    pub idempotency_key: Option<String>,
}

type SchemaValidator = Box<dyn Fn(&serde_json::Value) -> Result<EnqueueDerived, String> + Send + Sync>;

/// Closed set of payload schemas, keyed by job kind.
#[derive(Default)]
pub struct SchemaRegistry {
    validators: HashMap<JobType, SchemaValidator>,
}

impl SchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<C: JobPayload + 'static>(&mut self) {
        self.validators.insert(
            C::JOB_TYPE,
            Box::new(|value| {
                let command: C =
                    serde_json::from_value(value.clone()).map_err(|e| e.to_string())?;
                Ok(command.derived())
            }),
        );
    }

    pub fn validate(
        &self,
        job_type: JobType,
        payload: &serde_json::Value,
    ) -> Result<EnqueueDerived, EnqueueError> {
        let Some(validator) = self.validators.get(&job_type) else {
            return Err(EnqueueError::UnknownType(job_type.to_string()));
        };
        validator(payload).map_err(|reason| EnqueueError::InvalidPayload {
            job_type: job_type.to_string(),
            reason,
        })
    }

    pub fn is_registered(&self, job_type: JobType) -> bool {
        self.validators.contains_key(&job_type)
    }
}

/// Caller-tunable knobs for one enqueue.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EnqueueOptions {
    pub priority: Option<JobPriority>,
    pub timeout_ms: Option<i64>,
    pub max_retries: Option<i32>,
    pub scheduled_for: Option<DateTime<Utc>>,
    pub metadata: Option<serde_json::Value>,
}

/// What the enqueue caller gets back.
#[derive(Debug, Clone, Serialize)]
pub struct EnqueueReceipt {
    pub job_id: Uuid,
    pub status: JobStatus,
    pub estimated_completion: DateTime<Utc>,
    /// True when an idempotency key matched a live job and no new row was
    /// written.
    pub duplicate: bool,
}

/// Queue defaults applied when options leave a knob unset.
#[derive(Debug, Clone)]
pub struct QueueDefaults {
    pub timeout_ms: i64,
    pub max_retries: i32,
    pub depth_ceiling: i64,
}

impl Default for QueueDefaults {
    fn default() -> Self {
        Self {
            timeout_ms: 300_000,
            max_retries: 3,
            depth_ceiling: 10_000,
        }
    }
}

/// Priority+FIFO dispatch built on the store.
pub struct JobQueue {
    store: Arc<dyn JobStore>,
    hub: JobEventHub,
    schemas: SchemaRegistry,
    defaults: QueueDefaults,
}

impl JobQueue {
    pub fn new(
        store: Arc<dyn JobStore>,
        hub: JobEventHub,
        schemas: SchemaRegistry,
        defaults: QueueDefaults,
    ) -> Self {
        Self {
            store,
            hub,
            schemas,
            defaults,
        }
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    pub fn hub(&self) -> &JobEventHub {
        &self.hub
    }

    /// Enqueue a job on behalf of a tenant.
    pub async fn enqueue(
        &self,
        tenant: &str,
        job_type: JobType,
        payload: serde_json::Value,
        options: EnqueueOptions,
    ) -> Result<EnqueueReceipt, EnqueueError> {
        let derived = self.schemas.validate(job_type, &payload)?;

        let depth = self.store.count_active(tenant).await?;
        if depth >= self.defaults.depth_ceiling {
            return Err(EnqueueError::QuotaExceeded {
                tenant: tenant.to_string(),
                depth,
                ceiling: self.defaults.depth_ceiling,
            });
        }

        if let Some(key) = &derived.idempotency_key {
            if let Some(existing) = self.store.find_by_idempotency_key(tenant, key).await? {
                debug!(job_id = %existing.id, key = %key, "enqueue deduplicated by idempotency key");
                return Ok(EnqueueReceipt {
                    job_id: existing.id,
                    status: existing.status,
                    estimated_completion: estimate_completion(&existing),
                    duplicate: true,
                });
            }
        }

        let now = Utc::now();
        let scheduled = options.scheduled_for;
        let status = match scheduled {
            Some(at) if at > now => JobStatus::Pending,
            _ => JobStatus::Queued,
        };

        let mut job = Job::builder()
            .tenant(tenant)
            .job_type(job_type)
            .payload(payload)
            .status(status)
            .priority(options.priority.unwrap_or_default())
            .timeout_ms(options.timeout_ms.unwrap_or(self.defaults.timeout_ms))
            .max_retries(options.max_retries.unwrap_or(self.defaults.max_retries))
            .metadata(options.metadata.unwrap_or_else(|| serde_json::json!({})))
            .build();
        job.scheduled_for = scheduled;
        job.queued_at = (status == JobStatus::Queued).then_some(now);
        job.user_id = derived.user_id;
        job.case_id = derived.case_id;
        job.idempotency_key = derived.idempotency_key;

        let job = self.store.insert(job).await?;
        info!(
            job_id = %job.id,
            tenant = %tenant,
            job_type = %job_type,
            status = job.status.as_str(),
            "job enqueued"
        );

        self.hub
            .publish(JobEvent::Created {
                job_id: job.id,
                tenant: tenant.to_string(),
                job_type,
            })
            .await;
        if job.status == JobStatus::Queued {
            self.hub
                .publish(JobEvent::Queued {
                    job_id: job.id,
                    tenant: tenant.to_string(),
                })
                .await;
        }

        Ok(EnqueueReceipt {
            job_id: job.id,
            status: job.status,
            estimated_completion: estimate_completion(&job),
            duplicate: false,
        })
    }

    /// Claim the next eligible job for a worker.
    pub async fn claim(&self, worker_id: &str, types: &[JobType]) -> Result<Option<Job>> {
        let Some(job) = self.store.claim(worker_id, types).await? else {
            return Ok(None);
        };
        self.hub
            .publish(JobEvent::Started {
                job_id: job.id,
                tenant: job.tenant.clone(),
                worker_id: worker_id.to_string(),
                attempt: job.attempts,
            })
            .await;
        Ok(Some(job))
    }

    pub async fn get(&self, tenant: &str, id: Uuid) -> Result<Option<Job>> {
        self.store.get(tenant, id).await
    }

    pub async fn query(
        &self,
        tenant: &str,
        filter: &JobFilter,
        page: &Page,
    ) -> Result<PageResult<Job>> {
        self.store.query(tenant, filter, page).await
    }

    pub async fn stats(&self, tenant: Option<&str>, since: DateTime<Utc>) -> Result<JobStats> {
        self.store.stats(tenant, since).await
    }

    /// Cancel a job. Queued rows cancel instantly; a running handler
    /// observes the cancellation at its next checkpoint.
    pub async fn cancel(&self, tenant: &str, id: Uuid) -> Result<bool> {
        let cancelled = self.store.cancel(tenant, id).await?;
        if cancelled {
            info!(job_id = %id, tenant = %tenant, "job cancelled");
            self.hub
                .publish(JobEvent::Cancelled {
                    job_id: id,
                    tenant: tenant.to_string(),
                })
                .await;
        }
        Ok(cancelled)
    }

    /// Explicit operator retry of a failed or stalled job.
    pub async fn retry(&self, tenant: &str, id: Uuid) -> Result<bool> {
        let retried = self.store.retry(tenant, id).await?;
        if retried {
            info!(job_id = %id, tenant = %tenant, "job re-queued by operator");
            self.hub
                .publish(JobEvent::Retry {
                    job_id: id,
                    tenant: tenant.to_string(),
                    error: None,
                    next_attempt_at: None,
                })
                .await;
        }
        Ok(retried)
    }

    pub async fn delete(&self, tenant: &str, id: Uuid) -> Result<bool> {
        self.store.delete(tenant, id).await
    }

    pub async fn bulk(
        &self,
        tenant: &str,
        ids: &[Uuid],
        action: BulkAction,
    ) -> Result<BulkOutcome> {
        let outcome = self.store.bulk(tenant, ids, action).await?;
        for id in &outcome.applied {
            match action {
                BulkAction::Cancel => {
                    self.hub
                        .publish(JobEvent::Cancelled {
                            job_id: *id,
                            tenant: tenant.to_string(),
                        })
                        .await
                }
                BulkAction::Retry | BulkAction::Restart => {
                    self.hub
                        .publish(JobEvent::Retry {
                            job_id: *id,
                            tenant: tenant.to_string(),
                            error: None,
                            next_attempt_at: None,
                        })
                        .await
                }
                BulkAction::Delete => {}
            }
        }
        Ok(outcome)
    }

    /// Best-effort, in-process stream of one job's lifecycle events.
    pub async fn subscribe(&self, job_id: Uuid) -> broadcast::Receiver<JobEvent> {
        self.hub.subscribe_job(job_id).await
    }
}

fn estimate_completion(job: &Job) -> DateTime<Utc> {
    let start = job.scheduled_for.unwrap_or_else(Utc::now).max(Utc::now());
    start + chrono::Duration::milliseconds(job.timeout_ms)
}
