//! Typed payload schemas for the email pipeline's job kinds.
//!
//! These are the shapes validated at enqueue. Optional knobs carry serde
//! defaults so older enqueuers keep working as fields are added.

use serde::{Deserialize, Serialize};

use crate::kernel::jobs::queue::{EnqueueDerived, JobPayload, SchemaRegistry};
use crate::kernel::jobs::JobType;

/// Pull one message from the upstream provider and archive it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchiveEmailCommand {
    pub user_id: String,
    pub message_id: String,
    pub case_id: String,
    /// Re-archive even when a complete archive already exists.
    #[serde(default)]
    pub force_restore: bool,
    #[serde(default)]
    pub skip_attachments: bool,
}

impl ArchiveEmailCommand {
    /// One live archival job per `(messageId, caseId)` fingerprint.
    pub fn idempotency_key(&self) -> String {
        format!("email_archival:{}:{}", self.message_id, self.case_id)
    }
}

impl JobPayload for ArchiveEmailCommand {
    const JOB_TYPE: JobType = JobType::EmailArchival;

    fn derived(&self) -> EnqueueDerived {
        EnqueueDerived {
            user_id: Some(self.user_id.clone()),
            case_id: Some(self.case_id.clone()),
            idempotency_key: Some(self.idempotency_key()),
        }
    }
}

fn default_batch_size() -> usize {
    10
}

fn default_true() -> bool {
    true
}

/// Attach a set of messages to a case in batches.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BulkAssignCommand {
    pub user_id: String,
    pub email_ids: Vec<String>,
    pub case_id: String,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_true")]
    pub skip_existing: bool,
}

impl JobPayload for BulkAssignCommand {
    const JOB_TYPE: JobType = JobType::BulkAssignment;

    fn derived(&self) -> EnqueueDerived {
        EnqueueDerived {
            user_id: Some(self.user_id.clone()),
            case_id: Some(self.case_id.clone()),
            idempotency_key: None,
        }
    }
}

/// Scope marker for cleanup over every case.
pub const CLEANUP_ALL_SCOPE: &str = "all";

/// Age out archived objects for one case, or for all cases.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageCleanupCommand {
    pub user_id: String,
    /// A case id, or [`CLEANUP_ALL_SCOPE`].
    pub target_scope: String,
    /// Age threshold in days; archives older than this are reaped.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cleanup_age_days: Option<i64>,
    /// Preview only: report candidates without deleting.
    #[serde(default)]
    pub dry_run: bool,
}

impl JobPayload for StorageCleanupCommand {
    const JOB_TYPE: JobType = JobType::StorageCleanup;

    fn derived(&self) -> EnqueueDerived {
        EnqueueDerived {
            user_id: Some(self.user_id.clone()),
            case_id: (self.target_scope != CLEANUP_ALL_SCOPE)
                .then(|| self.target_scope.clone()),
            idempotency_key: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExportFormat {
    Json,
    Csv,
    Pdf,
}

impl ExportFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExportFormat::Json => "json",
            ExportFormat::Csv => "csv",
            ExportFormat::Pdf => "pdf",
        }
    }
}

/// Produce a single export artifact for a set of cases.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportCommand {
    pub user_id: String,
    pub case_ids: Vec<String>,
    pub format: ExportFormat,
    #[serde(default = "default_true")]
    pub include_emails: bool,
    #[serde(default)]
    pub include_attachments: bool,
}

impl JobPayload for ExportCommand {
    const JOB_TYPE: JobType = JobType::Export;

    fn derived(&self) -> EnqueueDerived {
        EnqueueDerived {
            user_id: Some(self.user_id.clone()),
            case_id: None,
            idempotency_key: None,
        }
    }
}

/// Pass-through kind kept for shape; analysis runs out of tree.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContentAnalysisCommand {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub case_id: Option<String>,
}

impl JobPayload for ContentAnalysisCommand {
    const JOB_TYPE: JobType = JobType::ContentAnalysis;

    fn derived(&self) -> EnqueueDerived {
        EnqueueDerived {
            case_id: self.case_id.clone(),
            ..Default::default()
        }
    }
}

/// Pass-through kind kept for shape; maintenance sweeps run on their own
/// timers.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MaintenanceCommand {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task: Option<String>,
}

impl JobPayload for MaintenanceCommand {
    const JOB_TYPE: JobType = JobType::Maintenance;
}

/// The closed payload schema set, one entry per job kind.
pub fn build_schemas() -> SchemaRegistry {
    let mut schemas = SchemaRegistry::new();
    schemas.register::<ArchiveEmailCommand>();
    schemas.register::<BulkAssignCommand>();
    schemas.register::<StorageCleanupCommand>();
    schemas.register::<ExportCommand>();
    schemas.register::<ContentAnalysisCommand>();
    schemas.register::<MaintenanceCommand>();
    schemas
}
