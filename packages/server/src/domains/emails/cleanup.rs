//! Storage-cleanup worker.
//!
//! Age-based reaping of archived emails, per case or across every case with
//! archived objects. Dry-run previews the candidate set without deleting;
//! the same inputs always select the same candidates.

use chrono::Utc;
use serde::Serialize;
use tracing::info;

use crate::common::error::JobError;
use crate::kernel::jobs::job::{JobMetrics, JobProgress, JobResult};
use crate::kernel::jobs::registry::JobContext;

use super::commands::{StorageCleanupCommand, CLEANUP_ALL_SCOPE};

const DEFAULT_CLEANUP_AGE_DAYS: i64 = 30;

#[derive(Debug, Serialize)]
struct CleanupCandidate {
    case_id: String,
    message_id: String,
    attachment_bytes: i64,
}

pub async fn run(cmd: StorageCleanupCommand, ctx: JobContext) -> Result<JobResult, JobError> {
    let deps = ctx.deps.clone();
    let age_days = cmd.cleanup_age_days.unwrap_or(DEFAULT_CLEANUP_AGE_DAYS);
    if age_days < 0 {
        return Err(JobError::validation("cleanup age must be non-negative"));
    }
    let cutoff = Utc::now() - chrono::Duration::days(age_days);

    let cases = if cmd.target_scope == CLEANUP_ALL_SCOPE {
        deps.archiver.list_cases().await?
    } else {
        vec![cmd.target_scope.clone()]
    };

    let total_cases = cases.len();
    let mut examined = 0usize;
    let mut deleted_objects = 0usize;
    let mut candidates: Vec<CleanupCandidate> = Vec::new();

    for (index, case_id) in cases.iter().enumerate() {
        ctx.progress
            .checkpoint(JobProgress::items(
                index as i64,
                total_cases.max(1) as i64,
                format!("scanning case {case_id}"),
            ))
            .await?;

        for message_id in deps.archiver.list_emails(case_id).await? {
            examined += 1;
            let metadata = deps.archiver.email_metadata(case_id, &message_id).await?;
            if metadata.stored_at >= cutoff {
                continue;
            }

            let attachment_bytes: i64 = metadata.attachments.iter().map(|a| a.size).sum();
            candidates.push(CleanupCandidate {
                case_id: case_id.clone(),
                message_id: message_id.clone(),
                attachment_bytes,
            });

            if !cmd.dry_run {
                deleted_objects += deps.archiver.delete_email(case_id, &message_id).await?;
            }
        }
    }

    ctx.progress
        .checkpoint(JobProgress::items(
            total_cases.max(1) as i64,
            total_cases.max(1) as i64,
            "cleanup finished",
        ))
        .await?;

    let candidate_bytes: i64 = candidates.iter().map(|c| c.attachment_bytes).sum();
    info!(
        scope = %cmd.target_scope,
        age_days,
        dry_run = cmd.dry_run,
        examined,
        candidates = candidates.len(),
        deleted_objects,
        "storage cleanup finished"
    );

    Ok(JobResult::new(serde_json::json!({
        "dryRun": cmd.dry_run,
        "scope": cmd.target_scope,
        "cutoff": cutoff,
        "examined": examined,
        "candidates": candidates,
        "deletedObjects": deleted_objects,
    }))
    .with_metrics(JobMetrics {
        items_processed: examined as i64,
        bytes_processed: candidate_bytes,
        ..Default::default()
    }))
}
