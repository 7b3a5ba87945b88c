//! Bulk-assignment worker.
//!
//! Partitions the email ids into batches; each assignment insert is
//! idempotent and every newly assigned email gets a sibling archival job.
//! Progress is emitted at batch boundaries, which are also the cancellation
//! checkpoints, so a cancel lands within one batch of taking effect.

use std::time::Duration;

use tracing::{info, warn};

use crate::common::error::JobError;
use crate::kernel::jobs::job::{JobMetrics, JobProgress, JobResult, JobType};
use crate::kernel::jobs::queue::EnqueueOptions;
use crate::kernel::jobs::registry::JobContext;

use super::assignments::EmailAssignment;
use super::commands::BulkAssignCommand;

const BATCH_PAUSE: Duration = Duration::from_secs(1);
const MAX_REPORTED_ERRORS: usize = 10;

pub async fn run(cmd: BulkAssignCommand, ctx: JobContext) -> Result<JobResult, JobError> {
    let deps = ctx.deps.clone();
    let batch_size = cmd.batch_size.max(1);
    let total = cmd.email_ids.len();
    let batch_count = total.div_ceil(batch_size);

    let mut processed = 0usize;
    let mut success = 0usize;
    let mut archival_jobs = 0usize;
    let mut errors: Vec<String> = Vec::new();
    let mut warnings: Vec<String> = Vec::new();

    for (batch_index, batch) in cmd.email_ids.chunks(batch_size).enumerate() {
        if batch_index > 0 {
            // Pace batches; the pause doubles as a cancellation point.
            tokio::select! {
                _ = ctx.cancel.cancelled() => return Err(JobError::cancelled()),
                _ = tokio::time::sleep(BATCH_PAUSE) => {}
            }
        }

        for email_id in batch {
            if ctx.cancel.is_cancelled() {
                return Err(JobError::cancelled());
            }
            processed += 1;

            if cmd.skip_existing
                && deps
                    .assignments
                    .exists(&ctx.tenant, email_id, &cmd.case_id)
                    .await
                    .map_err(|e| JobError::storage(format!("assignment lookup failed: {e}")))?
            {
                success += 1;
                continue;
            }

            let assignment = EmailAssignment::new(
                ctx.tenant.clone(),
                email_id.clone(),
                cmd.case_id.clone(),
                Some(cmd.user_id.clone()),
            );
            match deps.assignments.insert(assignment).await {
                Ok(_) => {
                    success += 1;
                    let payload = serde_json::json!({
                        "user_id": cmd.user_id,
                        "message_id": email_id,
                        "case_id": cmd.case_id,
                    });
                    match deps
                        .queue
                        .enqueue(
                            &ctx.tenant,
                            JobType::EmailArchival,
                            payload,
                            EnqueueOptions::default(),
                        )
                        .await
                    {
                        Ok(receipt) => {
                            if !receipt.duplicate {
                                archival_jobs += 1;
                            }
                        }
                        Err(e) => {
                            // The assignment itself succeeded; surface the
                            // missing archival as a warning.
                            warn!(email_id = %email_id, error = %e, "sibling archival enqueue failed");
                            warnings.push(format!("{email_id}: archival enqueue failed: {e}"));
                        }
                    }
                }
                Err(e) => {
                    warn!(email_id = %email_id, error = %e, "assignment insert failed");
                    errors.push(format!("{email_id}: {e}"));
                }
            }
        }

        ctx.progress
            .checkpoint(JobProgress::items(
                processed as i64,
                total as i64,
                format!("batch {} of {}", batch_index + 1, batch_count),
            ))
            .await?;
    }

    let error_count = errors.len();
    errors.truncate(MAX_REPORTED_ERRORS);
    if error_count > 0 {
        warnings.push(format!("{error_count} of {total} assignments failed"));
    }

    info!(
        case_id = %cmd.case_id,
        total,
        success,
        errors = error_count,
        archival_jobs,
        "bulk assignment finished"
    );

    Ok(JobResult::new(serde_json::json!({
        "total": total,
        "success": success,
        "error": error_count,
        "archivalJobsEnqueued": archival_jobs,
        "topErrors": errors,
    }))
    .with_metrics(JobMetrics {
        items_processed: processed as i64,
        ..Default::default()
    })
    .with_warnings(warnings))
}
