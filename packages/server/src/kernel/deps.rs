//! Worker dependencies.
//!
//! The central dependency container handlers execute against. External
//! services sit behind traits so tests swap them for in-memory or scripted
//! implementations; construction happens explicitly at the entry point,
//! never through globals.

use std::sync::Arc;

use crate::domains::emails::assignments::AssignmentStore;
use crate::domains::emails::export::ExportRenderers;
use crate::kernel::archive::BlobArchiver;
use crate::kernel::jobs::queue::JobQueue;
use crate::kernel::jobs::store::JobStore;
use crate::kernel::mail::{MailAccounts, MailFetcher};

/// Dependencies accessible to job handlers.
#[derive(Clone)]
pub struct WorkerDeps {
    pub store: Arc<dyn JobStore>,
    /// Write-capable queue handle, for handlers that enqueue sibling jobs.
    pub queue: Arc<JobQueue>,
    pub archiver: Arc<BlobArchiver>,
    pub fetcher: Arc<MailFetcher>,
    pub accounts: Arc<dyn MailAccounts>,
    pub assignments: Arc<dyn AssignmentStore>,
    pub renderers: Arc<ExportRenderers>,
    /// Lifetime of export artifacts, milliseconds.
    pub export_ttl_ms: u64,
}

impl WorkerDeps {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn JobStore>,
        queue: Arc<JobQueue>,
        archiver: Arc<BlobArchiver>,
        fetcher: Arc<MailFetcher>,
        accounts: Arc<dyn MailAccounts>,
        assignments: Arc<dyn AssignmentStore>,
        renderers: ExportRenderers,
        export_ttl_ms: u64,
    ) -> Self {
        Self {
            store,
            queue,
            archiver,
            fetcher,
            accounts,
            assignments,
            renderers: Arc::new(renderers),
            export_ttl_ms,
        }
    }
}
