//! Email pipeline domain: payload schemas, workers, and assignments.
//!
//! The kernel provides the job infrastructure; this module provides the
//! business logic registered into it. [`build_schemas`] is the enqueue-side
//! contract, [`build_registry`] the execution-side one, and the two stay in
//! lockstep over the closed job-kind set.

pub mod archival;
pub mod assignments;
pub mod bulk_assign;
pub mod cleanup;
pub mod commands;
pub mod export;

pub use assignments::{
    AssignmentStore, EmailAssignment, MemoryAssignmentStore, PgAssignmentStore,
};
pub use commands::{
    build_schemas, ArchiveEmailCommand, BulkAssignCommand, ContentAnalysisCommand, ExportCommand,
    ExportFormat, MaintenanceCommand, StorageCleanupCommand, CLEANUP_ALL_SCOPE,
};
pub use export::{default_renderers, ExportBundle, ExportRenderer, ExportRenderers};

use crate::kernel::jobs::job::{JobProgress, JobResult, JobType};
use crate::kernel::jobs::registry::JobRegistry;

/// Register every email-pipeline handler.
pub fn build_registry() -> JobRegistry {
    let mut registry = JobRegistry::new();

    registry.register::<ArchiveEmailCommand, _, _>(JobType::EmailArchival, archival::run);
    registry.register::<BulkAssignCommand, _, _>(JobType::BulkAssignment, bulk_assign::run);
    registry.register::<StorageCleanupCommand, _, _>(JobType::StorageCleanup, cleanup::run);
    registry.register::<ExportCommand, _, _>(JobType::Export, export::run);

    // Pass-through kinds: acknowledged and completed without work.
    registry.register::<ContentAnalysisCommand, _, _>(
        JobType::ContentAnalysis,
        |_cmd, ctx| async move {
            ctx.progress
                .checkpoint(JobProgress::steps(1, 1, "analysis delegated"))
                .await?;
            Ok(JobResult::new(serde_json::json!({"delegated": true})))
        },
    );
    registry.register::<MaintenanceCommand, _, _>(JobType::Maintenance, |_cmd, ctx| async move {
        ctx.progress
            .checkpoint(JobProgress::steps(1, 1, "maintenance acknowledged"))
            .await?;
        Ok(JobResult::new(serde_json::json!({"acknowledged": true})))
    });

    registry
}
