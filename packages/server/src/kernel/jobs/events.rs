//! Job lifecycle events and the in-process hub that carries them.
//!
//! Events are facts about the lifecycle, not commands. Delivery is
//! best-effort and in-process only: bounded broadcast channels, lagging
//! receivers drop. The queue publishes enqueue-side events, the dispatcher
//! publishes execution-side events, and the monitor consumes the firehose.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

use crate::common::error::JobError;

use super::job::{JobProgress, JobType};

/// Job lifecycle events.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum JobEvent {
    /// A job record was created.
    Created {
        job_id: Uuid,
        tenant: String,
        job_type: JobType,
    },

    /// The job became eligible for claim.
    Queued { job_id: Uuid, tenant: String },

    /// A worker claimed the job and began execution.
    Started {
        job_id: Uuid,
        tenant: String,
        worker_id: String,
        attempt: i32,
    },

    /// A handler checkpoint recorded progress.
    Progress {
        job_id: Uuid,
        tenant: String,
        progress: JobProgress,
    },

    /// The job completed successfully.
    Completed {
        job_id: Uuid,
        tenant: String,
        duration_ms: i64,
    },

    /// The job failed terminally.
    Failed {
        job_id: Uuid,
        tenant: String,
        error: JobError,
        attempt: i32,
    },

    /// The job was cancelled.
    Cancelled { job_id: Uuid, tenant: String },

    /// A retryable failure re-queued the job for a later attempt.
    Retry {
        job_id: Uuid,
        tenant: String,
        error: Option<JobError>,
        next_attempt_at: Option<DateTime<Utc>>,
    },
}

impl JobEvent {
    pub fn job_id(&self) -> Uuid {
        match self {
            JobEvent::Created { job_id, .. }
            | JobEvent::Queued { job_id, .. }
            | JobEvent::Started { job_id, .. }
            | JobEvent::Progress { job_id, .. }
            | JobEvent::Completed { job_id, .. }
            | JobEvent::Failed { job_id, .. }
            | JobEvent::Cancelled { job_id, .. }
            | JobEvent::Retry { job_id, .. } => *job_id,
        }
    }

    pub fn tenant(&self) -> &str {
        match self {
            JobEvent::Created { tenant, .. }
            | JobEvent::Queued { tenant, .. }
            | JobEvent::Started { tenant, .. }
            | JobEvent::Progress { tenant, .. }
            | JobEvent::Completed { tenant, .. }
            | JobEvent::Failed { tenant, .. }
            | JobEvent::Cancelled { tenant, .. }
            | JobEvent::Retry { tenant, .. } => tenant,
        }
    }
}

/// In-process pub/sub hub for job events.
///
/// A firehose channel carries every event; per-job channels back
/// single-job subscriptions. Cloneable and cheap to share.
#[derive(Clone)]
pub struct JobEventHub {
    firehose: broadcast::Sender<JobEvent>,
    per_job: Arc<RwLock<HashMap<Uuid, broadcast::Sender<JobEvent>>>>,
    capacity: usize,
}

impl JobEventHub {
    pub fn new() -> Self {
        Self::with_capacity(256)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (firehose, _) = broadcast::channel(capacity);
        Self {
            firehose,
            per_job: Arc::new(RwLock::new(HashMap::new())),
            capacity,
        }
    }

    /// Publish an event. No-op for channels without subscribers.
    pub async fn publish(&self, event: JobEvent) {
        let job_id = event.job_id();
        {
            let channels = self.per_job.read().await;
            if let Some(tx) = channels.get(&job_id) {
                let _ = tx.send(event.clone());
            }
        }
        let _ = self.firehose.send(event);
    }

    /// Subscribe to one job's event stream.
    pub async fn subscribe_job(&self, job_id: Uuid) -> broadcast::Receiver<JobEvent> {
        let mut channels = self.per_job.write().await;
        let tx = channels
            .entry(job_id)
            .or_insert_with(|| broadcast::channel(self.capacity).0);
        tx.subscribe()
    }

    /// Subscribe to every event in the process.
    pub fn subscribe_all(&self) -> broadcast::Receiver<JobEvent> {
        self.firehose.subscribe()
    }

    /// Drop per-job channels with no remaining subscribers.
    pub async fn cleanup(&self) {
        let mut channels = self.per_job.write().await;
        channels.retain(|_, tx| tx.receiver_count() > 0);
    }
}

impl Default for JobEventHub {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn started(job_id: Uuid) -> JobEvent {
        JobEvent::Started {
            job_id,
            tenant: "t1".to_string(),
            worker_id: "w1".to_string(),
            attempt: 1,
        }
    }

    #[tokio::test]
    async fn per_job_subscription_receives_only_that_job() {
        let hub = JobEventHub::new();
        let watched = Uuid::new_v4();
        let other = Uuid::new_v4();
        let mut rx = hub.subscribe_job(watched).await;

        hub.publish(started(other)).await;
        hub.publish(started(watched)).await;

        let event = rx.recv().await.unwrap();
        assert_eq!(event.job_id(), watched);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn firehose_receives_everything() {
        let hub = JobEventHub::new();
        let mut rx = hub.subscribe_all();

        hub.publish(started(Uuid::new_v4())).await;
        hub.publish(started(Uuid::new_v4())).await;

        assert!(rx.recv().await.is_ok());
        assert!(rx.recv().await.is_ok());
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_noop() {
        let hub = JobEventHub::new();
        hub.publish(started(Uuid::new_v4())).await;
    }

    #[tokio::test]
    async fn cleanup_drops_abandoned_channels() {
        let hub = JobEventHub::new();
        let job_id = Uuid::new_v4();
        {
            let _rx = hub.subscribe_job(job_id).await;
        }
        hub.cleanup().await;
        assert!(hub.per_job.read().await.is_empty());
    }

    #[test]
    fn events_serialize_with_tag() {
        let event = started(Uuid::new_v4());
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"event\":\"started\""));
        assert!(json.contains("w1"));
    }
}
