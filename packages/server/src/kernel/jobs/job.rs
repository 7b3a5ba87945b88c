//! Job model for background pipeline execution.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use typed_builder::TypedBuilder;
use uuid::Uuid;

use crate::common::error::JobError;

// ============================================================================
// Enums
// ============================================================================

/// The closed set of job kinds the pipeline executes.
///
/// Payload schemas are per kind and validated at enqueue; handlers are looked
/// up by kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "job_type", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    EmailArchival,
    BulkAssignment,
    StorageCleanup,
    Export,
    ContentAnalysis,
    Maintenance,
}

impl JobType {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobType::EmailArchival => "email_archival",
            JobType::BulkAssignment => "bulk_assignment",
            JobType::StorageCleanup => "storage_cleanup",
            JobType::Export => "export",
            JobType::ContentAnalysis => "content_analysis",
            JobType::Maintenance => "maintenance",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "email_archival" => Some(JobType::EmailArchival),
            "bulk_assignment" => Some(JobType::BulkAssignment),
            "storage_cleanup" => Some(JobType::StorageCleanup),
            "export" => Some(JobType::Export),
            "content_analysis" => Some(JobType::ContentAnalysis),
            "maintenance" => Some(JobType::Maintenance),
            _ => None,
        }
    }

    pub fn all() -> &'static [JobType] {
        &[
            JobType::EmailArchival,
            JobType::BulkAssignment,
            JobType::StorageCleanup,
            JobType::Export,
            JobType::ContentAnalysis,
            JobType::Maintenance,
        ]
    }
}

impl std::fmt::Display for JobType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type, Default)]
#[sqlx(type_name = "job_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Scheduled for the future; promoted lazily at claim time.
    Pending,
    /// Eligible for claim.
    #[default]
    Queued,
    /// Claimed and executing on a worker.
    Running,
    /// Re-queued after a retryable failure; claim treats it like `Queued`.
    Retry,
    /// Running exceeded the stall window without progress.
    Stalled,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    /// Statuses a claim may pick up. `Pending` qualifies only once its
    /// `scheduled_for` has passed; the claim query enforces that.
    pub fn is_claimable(&self) -> bool {
        matches!(self, JobStatus::Pending | JobStatus::Queued | JobStatus::Retry)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Retry => "retry",
            JobStatus::Stalled => "stalled",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type, Default)]
#[sqlx(type_name = "job_priority", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum JobPriority {
    Urgent,
    High,
    #[default]
    Normal,
    Low,
}

impl JobPriority {
    /// Convert to integer for ordering (lower = higher priority).
    pub fn rank(&self) -> i16 {
        match self {
            JobPriority::Urgent => 0,
            JobPriority::High => 1,
            JobPriority::Normal => 2,
            JobPriority::Low => 3,
        }
    }
}

// ============================================================================
// Progress / result
// ============================================================================

/// Progress snapshot emitted at handler checkpoints.
///
/// Percentage is monotonic non-decreasing within a single attempt; the store
/// enforces that by refusing to lower it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct JobProgress {
    pub percentage: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_step: Option<String>,
    #[serde(default)]
    pub completed_steps: i32,
    #[serde(default)]
    pub total_steps: i32,
    #[serde(default)]
    pub processed_items: i64,
    #[serde(default)]
    pub total_items: i64,
}

impl JobProgress {
    /// Step-counter progress (`completed` of `total` named steps).
    pub fn steps(completed: i32, total: i32, step: impl Into<String>) -> Self {
        let pct = if total > 0 {
            ((completed as f64 / total as f64) * 100.0).round() as u8
        } else {
            0
        };
        Self {
            percentage: pct.min(100),
            current_step: Some(step.into()),
            completed_steps: completed,
            total_steps: total,
            ..Default::default()
        }
    }

    /// Item-counter progress (`processed` of `total` items).
    pub fn items(processed: i64, total: i64, step: impl Into<String>) -> Self {
        let pct = if total > 0 {
            ((processed as f64 / total as f64) * 100.0).round() as u8
        } else {
            0
        };
        Self {
            percentage: pct.min(100),
            current_step: Some(step.into()),
            processed_items: processed,
            total_items: total,
            ..Default::default()
        }
    }
}

/// Execution metrics recorded with the terminal result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct JobMetrics {
    #[serde(default)]
    pub duration_ms: i64,
    #[serde(default)]
    pub bytes_processed: i64,
    #[serde(default)]
    pub items_processed: i64,
}

/// Terminal outcome of a successful job.
///
/// `warnings` non-empty means "completed with warnings"; the status set
/// stays closed; partial failures of batch work surface here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct JobResult {
    pub data: serde_json::Value,
    #[serde(default)]
    pub metrics: JobMetrics,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

impl JobResult {
    pub fn new(data: serde_json::Value) -> Self {
        Self {
            data,
            metrics: JobMetrics::default(),
            warnings: Vec::new(),
        }
    }

    pub fn with_metrics(mut self, metrics: JobMetrics) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn with_warnings(mut self, warnings: Vec<String>) -> Self {
        self.warnings = warnings;
        self
    }
}

// ============================================================================
// Job model
// ============================================================================

/// A unit of work owned by one tenant.
#[derive(Debug, Clone, Serialize, Deserialize, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct Job {
    #[builder(default = Uuid::new_v4())]
    pub id: Uuid,

    // Core identity
    pub tenant: String,
    pub job_type: JobType,

    // Payload
    #[builder(default = serde_json::Value::Null)]
    pub payload: serde_json::Value,
    #[builder(default = serde_json::json!({}))]
    pub metadata: serde_json::Value,

    // State
    #[builder(default)]
    pub status: JobStatus,
    #[builder(default)]
    pub priority: JobPriority,
    #[builder(default, setter(strip_option))]
    pub progress: Option<JobProgress>,
    #[builder(default, setter(strip_option))]
    pub error: Option<JobError>,
    #[builder(default, setter(strip_option))]
    pub result: Option<JobResult>,

    // Execution settings
    #[builder(default = 0)]
    pub attempts: i32,
    #[builder(default = 3)]
    pub max_retries: i32,
    #[builder(default = 300_000)] // 5 minutes
    pub timeout_ms: i64,

    // Scheduling
    #[builder(default, setter(strip_option))]
    pub scheduled_for: Option<DateTime<Utc>>,
    #[builder(default, setter(strip_option))]
    pub worker_id: Option<String>,

    // Query denormalization (extracted from the typed payload at enqueue)
    #[builder(default, setter(strip_option))]
    pub user_id: Option<String>,
    #[builder(default, setter(strip_option))]
    pub case_id: Option<String>,
    #[builder(default, setter(strip_option))]
    pub idempotency_key: Option<String>,

    // Timestamps
    #[builder(default = Utc::now())]
    pub created_at: DateTime<Utc>,
    #[builder(default, setter(strip_option))]
    pub queued_at: Option<DateTime<Utc>>,
    #[builder(default, setter(strip_option))]
    pub started_at: Option<DateTime<Utc>>,
    #[builder(default, setter(strip_option))]
    pub last_attempt_at: Option<DateTime<Utc>>,
    #[builder(default, setter(strip_option))]
    pub last_progress_at: Option<DateTime<Utc>>,
    #[builder(default, setter(strip_option))]
    pub completed_at: Option<DateTime<Utc>>,
    #[builder(default, setter(strip_option))]
    pub failed_at: Option<DateTime<Utc>>,
    #[builder(default, setter(strip_option))]
    pub cancelled_at: Option<DateTime<Utc>>,
    #[builder(default = Utc::now())]
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// Create an immediate job for a tenant (convenience constructor).
    pub fn immediate(tenant: impl Into<String>, job_type: JobType, payload: serde_json::Value) -> Self {
        Self::builder()
            .tenant(tenant)
            .job_type(job_type)
            .payload(payload)
            .queued_at(Utc::now())
            .build()
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Percentage from the latest progress snapshot, 0 when none recorded.
    pub fn percentage(&self) -> u8 {
        self.progress.as_ref().map(|p| p.percentage).unwrap_or(0)
    }

    /// The instant stall detection measures from: the later of the attempt
    /// start and the last progress update.
    pub fn last_activity_at(&self) -> Option<DateTime<Utc>> {
        match (self.last_attempt_at, self.last_progress_at) {
            (Some(a), Some(p)) => Some(a.max(p)),
            (a, p) => a.or(p),
        }
    }

    /// Typed view of the payload.
    pub fn payload_as<C: serde::de::DeserializeOwned>(&self) -> Result<C, JobError> {
        serde_json::from_value(self.payload.clone()).map_err(|e| {
            JobError::validation(format!(
                "failed to deserialize {} payload: {}",
                self.job_type, e
            ))
        })
    }
}

// ============================================================================
// Query surface
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum JobSort {
    #[default]
    CreatedAt,
    StartedAt,
    CompletedAt,
    Priority,
    Status,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SortDirection {
    Asc,
    #[default]
    Desc,
}

/// Filter for `Query`; all fields conjunctive, empty vectors mean "any".
#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub statuses: Vec<JobStatus>,
    pub job_types: Vec<JobType>,
    pub priorities: Vec<JobPriority>,
    pub user_id: Option<String>,
    pub case_id: Option<String>,
    pub created_after: Option<DateTime<Utc>>,
    pub created_before: Option<DateTime<Utc>>,
    /// Free-text match over payload and metadata.
    pub search: Option<String>,
    pub sort: JobSort,
    pub direction: SortDirection,
}

/// Aggregated counters for the monitoring surface.
#[derive(Debug, Clone, Serialize, Default)]
pub struct JobStats {
    pub by_status: HashMap<JobStatus, i64>,
    pub by_type: HashMap<JobType, i64>,
    pub by_priority: HashMap<JobPriority, i64>,
    /// Average queued→started wait over the window, milliseconds.
    pub avg_wait_ms: Option<f64>,
    /// Average started→completed duration over the window, milliseconds.
    pub avg_processing_ms: Option<f64>,
    pub completed_in_window: i64,
    pub failed_in_window: i64,
}

impl JobStats {
    pub fn count(&self, status: JobStatus) -> i64 {
        self.by_status.get(&status).copied().unwrap_or(0)
    }

    pub fn queued_depth(&self) -> i64 {
        self.count(JobStatus::Queued) + self.count(JobStatus::Retry) + self.count(JobStatus::Pending)
    }

    pub fn running(&self) -> i64 {
        self.count(JobStatus::Running)
    }

    /// Failure share of terminal outcomes in the window, percent.
    pub fn error_rate_pct(&self) -> f64 {
        let done = self.completed_in_window + self.failed_in_window;
        if done == 0 {
            return 0.0;
        }
        self.failed_in_window as f64 / done as f64 * 100.0
    }
}
