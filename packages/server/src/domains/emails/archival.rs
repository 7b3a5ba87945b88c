//! Email-archival worker.
//!
//! Four checkpointed steps: verify the mail account, obtain a credential,
//! fetch the canonical message, archive it. A complete archive for the
//! `(messageId, caseId)` fingerprint short-circuits to success unless the
//! caller forces a restore, which keeps whole-job retries idempotent.

use tracing::{debug, info};

use crate::common::error::JobError;
use crate::kernel::jobs::job::{JobMetrics, JobProgress, JobResult};
use crate::kernel::jobs::registry::JobContext;

use super::commands::ArchiveEmailCommand;

const TOTAL_STEPS: i32 = 4;

pub async fn run(cmd: ArchiveEmailCommand, ctx: JobContext) -> Result<JobResult, JobError> {
    let deps = ctx.deps.clone();

    // Step 1: the upstream account must be connected for this user.
    ctx.progress
        .checkpoint(JobProgress::steps(0, TOTAL_STEPS, "verifying mail account"))
        .await?;
    let token = deps
        .accounts
        .access_token(&ctx.tenant, &cmd.user_id)
        .await
        .map_err(|e| {
            JobError::processing(format!("account lookup failed: {e}")).with_context("archival")
        })?;
    let Some(token) = token else {
        return Err(JobError::precondition(format!(
            "no connected mail account for user {}",
            cmd.user_id
        )));
    };
    ctx.progress
        .checkpoint(JobProgress::steps(1, TOTAL_STEPS, "mail account verified"))
        .await?;

    // Step 2: the credential must still be usable.
    if token.is_expired() {
        return Err(JobError::auth("access token expired before use"));
    }
    ctx.progress
        .checkpoint(JobProgress::steps(2, TOTAL_STEPS, "credential acquired"))
        .await?;

    // Re-archival of an already complete fingerprint is a no-op.
    if !cmd.force_restore && deps.archiver.exists(&cmd.case_id, &cmd.message_id).await? {
        debug!(
            message_id = %cmd.message_id,
            case_id = %cmd.case_id,
            "archive already present, skipping fetch"
        );
        let metadata = deps
            .archiver
            .email_metadata(&cmd.case_id, &cmd.message_id)
            .await?;
        ctx.progress
            .checkpoint(JobProgress::steps(TOTAL_STEPS, TOTAL_STEPS, "already archived"))
            .await?;
        return Ok(JobResult::new(serde_json::json!({
            "storagePath": format!("cases/{}/emails/{}/", cmd.case_id, cmd.message_id),
            "bodies": metadata.bodies.len(),
            "attachments": metadata.attachments.len(),
            "skipped": true,
        })));
    }

    // Step 3: fetch the canonical message.
    let email = deps
        .fetcher
        .fetch(&token.token, &cmd.message_id, !cmd.skip_attachments)
        .await?;
    ctx.progress
        .checkpoint(JobProgress::steps(3, TOTAL_STEPS, "message fetched"))
        .await?;

    // Step 4: archive.
    let outcome = deps
        .archiver
        .store_email(&cmd.case_id, &cmd.message_id, &email)
        .await?;
    ctx.progress
        .checkpoint(JobProgress::steps(TOTAL_STEPS, TOTAL_STEPS, "email archived"))
        .await?;

    info!(
        message_id = %cmd.message_id,
        case_id = %cmd.case_id,
        bodies = outcome.bodies_stored,
        attachments = outcome.attachments_stored,
        bytes = outcome.attachment_bytes,
        "archival completed"
    );

    Ok(JobResult::new(serde_json::json!({
        "storagePath": outcome.storage_path,
        "bodies": outcome.bodies_stored,
        "attachments": outcome.attachments_stored,
        "skipped": false,
    }))
    .with_metrics(JobMetrics {
        bytes_processed: outcome.attachment_bytes,
        items_processed: 1,
        ..Default::default()
    }))
}
