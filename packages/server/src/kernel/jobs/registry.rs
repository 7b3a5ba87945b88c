//! Handler registry: maps job kinds to typed handlers.
//!
//! Handlers take `(payload, JobContext)` and run to a terminal outcome. The
//! dispatcher owns the cancellation token and the progress sink; handlers
//! must checkpoint through the sink, which doubles as the cancellation poll.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::common::error::JobError;
use crate::kernel::deps::WorkerDeps;

use super::events::{JobEvent, JobEventHub};
use super::job::{Job, JobProgress, JobResult, JobType};
use super::store::JobStore;

/// Checkpoint writer handed to handlers.
///
/// Every checkpoint persists progress and polls cancellation: when the row
/// is no longer running under this worker (cancelled, stalled, re-claimed),
/// the checkpoint returns the cancellation error and the handler must
/// return it unchanged.
#[derive(Clone)]
pub struct ProgressSink {
    store: Arc<dyn JobStore>,
    hub: JobEventHub,
    tenant: String,
    job_id: Uuid,
    worker_id: String,
    cancel: CancellationToken,
}

impl ProgressSink {
    pub fn new(
        store: Arc<dyn JobStore>,
        hub: JobEventHub,
        tenant: String,
        job_id: Uuid,
        worker_id: String,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            store,
            hub,
            tenant,
            job_id,
            worker_id,
            cancel,
        }
    }

    /// Record a checkpoint. Returns the cancellation error when the job
    /// should stop.
    pub async fn checkpoint(&self, progress: JobProgress) -> Result<(), JobError> {
        if self.cancel.is_cancelled() {
            return Err(JobError::cancelled());
        }

        let still_running = self
            .store
            .update_progress(&self.tenant, self.job_id, &self.worker_id, progress.clone())
            .await
            .map_err(|e| JobError::storage(format!("progress write failed: {e}")))?;

        if !still_running {
            self.cancel.cancel();
            return Err(JobError::cancelled());
        }

        self.hub
            .publish(JobEvent::Progress {
                job_id: self.job_id,
                tenant: self.tenant.clone(),
                progress,
            })
            .await;
        Ok(())
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// Everything a handler execution sees.
#[derive(Clone)]
pub struct JobContext {
    pub tenant: String,
    pub job_id: Uuid,
    pub attempt: i32,
    pub deps: Arc<WorkerDeps>,
    pub progress: ProgressSink,
    pub cancel: CancellationToken,
}

type HandlerFuture = Pin<Box<dyn Future<Output = Result<JobResult, JobError>> + Send>>;
type BoxedHandler = Box<dyn Fn(Job, JobContext) -> HandlerFuture + Send + Sync>;

/// Registry that maps job kinds to handlers.
///
/// Registration deserializes the payload into the handler's typed command;
/// a payload that no longer parses fails non-retryably.
#[derive(Default)]
pub struct JobRegistry {
    handlers: HashMap<JobType, BoxedHandler>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    pub fn register<C, F, Fut>(&mut self, job_type: JobType, handler: F)
    where
        C: DeserializeOwned + Send + 'static,
        F: Fn(C, JobContext) -> Fut + Send + Sync + Clone + 'static,
        Fut: Future<Output = Result<JobResult, JobError>> + Send + 'static,
    {
        let boxed: BoxedHandler = Box::new(move |job, ctx| {
            let handler = handler.clone();
            Box::pin(async move {
                let command: C = job.payload_as()?;
                handler(command, ctx).await
            })
        });
        self.handlers.insert(job_type, boxed);
    }

    /// Execute a claimed job with its registered handler.
    pub async fn execute(&self, job: Job, ctx: JobContext) -> Result<JobResult, JobError> {
        let Some(handler) = self.handlers.get(&job.job_type) else {
            return Err(JobError::validation(format!(
                "no handler registered for job type {}",
                job.job_type
            )));
        };
        handler(job, ctx).await
    }

    pub fn is_registered(&self, job_type: JobType) -> bool {
        self.handlers.contains_key(&job_type)
    }

    pub fn registered_types(&self) -> Vec<JobType> {
        self.handlers.keys().copied().collect()
    }
}

pub type SharedJobRegistry = Arc<JobRegistry>;
