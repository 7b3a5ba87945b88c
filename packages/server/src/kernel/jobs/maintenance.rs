//! Maintenance sweeps: terminal-row aging and stalled-job recovery.
//!
//! Two independent timers against the store. Cleanup deletes old
//! completed/failed rows per tenant; the reaper moves running rows without
//! recent activity to `stalled` so they can be retried.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::{CleanupConfig, StallConfig};

use super::job::{Job, JobStatus};
use super::store::JobStore;

#[derive(Debug, Clone, Default, Serialize)]
pub struct CleanupSweepReport {
    pub tenants: usize,
    pub deleted_completed: u64,
    pub deleted_failed: u64,
}

pub struct Maintenance {
    store: Arc<dyn JobStore>,
    cleanup: CleanupConfig,
    stall: StallConfig,
}

impl Maintenance {
    pub fn new(store: Arc<dyn JobStore>, cleanup: CleanupConfig, stall: StallConfig) -> Self {
        Self {
            store,
            cleanup,
            stall,
        }
    }

    /// Run both timers until shutdown.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) -> Result<()> {
        info!(
            cleanup_interval_ms = self.cleanup.interval_ms,
            stalled_interval_ms = self.stall.interval_ms,
            "maintenance starting"
        );

        let cleanup = self.clone();
        let cleanup_shutdown = shutdown.clone();
        let cleanup_task = tokio::spawn(async move {
            let interval = Duration::from_millis(cleanup.cleanup.interval_ms);
            loop {
                tokio::select! {
                    _ = cleanup_shutdown.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
                if let Err(e) = cleanup.run_cleanup_once().await {
                    warn!(error = %e, "cleanup sweep failed");
                }
            }
        });

        let reaper = self.clone();
        let reaper_shutdown = shutdown.clone();
        let reaper_task = tokio::spawn(async move {
            let interval = Duration::from_millis(reaper.stall.interval_ms);
            loop {
                tokio::select! {
                    _ = reaper_shutdown.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
                if let Err(e) = reaper.run_reaper_once().await {
                    warn!(error = %e, "stalled-job sweep failed");
                }
            }
        });

        let _ = futures::future::join_all([cleanup_task, reaper_task]).await;
        info!("maintenance stopped");
        Ok(())
    }

    /// One cleanup sweep across every tenant.
    pub async fn run_cleanup_once(&self) -> Result<CleanupSweepReport> {
        let now = Utc::now();
        let completed_cutoff =
            now - chrono::Duration::milliseconds(self.cleanup.completed_job_age_ms as i64);
        let failed_cutoff =
            now - chrono::Duration::milliseconds(self.cleanup.failed_job_age_ms as i64);

        let tenants = self.store.tenants().await?;
        let mut report = CleanupSweepReport {
            tenants: tenants.len(),
            ..Default::default()
        };
        for tenant in &tenants {
            report.deleted_completed += self
                .store
                .delete_terminal_older_than(tenant, JobStatus::Completed, completed_cutoff)
                .await?;
            report.deleted_failed += self
                .store
                .delete_terminal_older_than(tenant, JobStatus::Failed, failed_cutoff)
                .await?;
        }

        if report.deleted_completed + report.deleted_failed > 0 {
            info!(
                tenants = report.tenants,
                deleted_completed = report.deleted_completed,
                deleted_failed = report.deleted_failed,
                "cleanup sweep finished"
            );
        }
        Ok(report)
    }

    /// One stalled-job sweep.
    pub async fn run_reaper_once(&self) -> Result<Vec<Job>> {
        let stalled = self
            .store
            .mark_stalled(Duration::from_millis(self.stall.timeout_ms))
            .await?;
        for job in &stalled {
            warn!(
                job_id = %job.id,
                tenant = %job.tenant,
                job_type = %job.job_type,
                "running job marked stalled"
            );
        }
        Ok(stalled)
    }
}
