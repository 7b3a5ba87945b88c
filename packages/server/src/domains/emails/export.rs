//! Case export worker.
//!
//! Gathers archived-email metadata for the requested cases and renders one
//! artifact into object storage under a short-lived key. JSON and CSV render
//! in-core; PDF rendering is a platform collaborator wired in via the same
//! seam, and requesting it without a renderer fails validation.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::info;
use uuid::Uuid;

use crate::common::error::JobError;
use crate::kernel::archive::types::{ArchivedEmailMetadata, CaseArchiveStats};
use crate::kernel::archive::paths::sanitize_segment;
use crate::kernel::jobs::job::{JobMetrics, JobProgress, JobResult};
use crate::kernel::jobs::registry::JobContext;

use super::commands::{ExportCommand, ExportFormat};

/// Everything an export artifact is rendered from.
#[derive(Debug, Clone, Serialize)]
pub struct ExportBundle {
    pub tenant: String,
    pub generated_at: DateTime<Utc>,
    pub include_attachments: bool,
    pub cases: Vec<CaseExport>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CaseExport {
    pub case_id: String,
    pub stats: CaseArchiveStats,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub emails: Vec<ArchivedEmailMetadata>,
}

/// Renders an [`ExportBundle`] into one artifact.
pub trait ExportRenderer: Send + Sync {
    fn content_type(&self) -> &'static str;
    fn file_extension(&self) -> &'static str;
    fn render(&self, bundle: &ExportBundle) -> Result<Vec<u8>, JobError>;
}

pub type ExportRenderers = HashMap<ExportFormat, Arc<dyn ExportRenderer>>;

/// The built-in renderer set: JSON and CSV.
pub fn default_renderers() -> ExportRenderers {
    let mut renderers: ExportRenderers = HashMap::new();
    renderers.insert(ExportFormat::Json, Arc::new(JsonRenderer));
    renderers.insert(ExportFormat::Csv, Arc::new(CsvRenderer));
    renderers
}

pub struct JsonRenderer;

impl ExportRenderer for JsonRenderer {
    fn content_type(&self) -> &'static str {
        "application/json"
    }

    fn file_extension(&self) -> &'static str {
        "json"
    }

    fn render(&self, bundle: &ExportBundle) -> Result<Vec<u8>, JobError> {
        serde_json::to_vec_pretty(bundle)
            .map_err(|e| JobError::processing(format!("json render failed: {e}")))
    }
}

pub struct CsvRenderer;

impl ExportRenderer for CsvRenderer {
    fn content_type(&self) -> &'static str {
        "text/csv"
    }

    fn file_extension(&self) -> &'static str {
        "csv"
    }

    fn render(&self, bundle: &ExportBundle) -> Result<Vec<u8>, JobError> {
        let mut out = String::from(
            "case_id,message_id,subject,from,sent_at,bodies,attachments,attachment_bytes\n",
        );
        for case in &bundle.cases {
            for email in &case.emails {
                let attachment_bytes: i64 = email.attachments.iter().map(|a| a.size).sum();
                let row = [
                    case.case_id.clone(),
                    email.message_id.clone(),
                    email.subject.clone().unwrap_or_default(),
                    email
                        .from
                        .as_ref()
                        .map(|a| a.address.clone())
                        .unwrap_or_default(),
                    email
                        .sent_at
                        .map(|at| at.to_rfc3339())
                        .unwrap_or_default(),
                    email.bodies.join(";"),
                    email.attachments.len().to_string(),
                    attachment_bytes.to_string(),
                ];
                let escaped: Vec<String> = row.iter().map(|field| csv_escape(field)).collect();
                out.push_str(&escaped.join(","));
                out.push('\n');
            }
        }
        Ok(out.into_bytes())
    }
}

fn csv_escape(field: &str) -> String {
    if field.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}

/// Handler for `export` jobs.
pub async fn run(cmd: ExportCommand, ctx: JobContext) -> Result<JobResult, JobError> {
    if cmd.case_ids.is_empty() {
        return Err(JobError::validation("export requires at least one case id"));
    }
    let Some(renderer) = ctx.deps.renderers.get(&cmd.format).cloned() else {
        return Err(JobError::validation(format!(
            "no renderer configured for {} exports",
            cmd.format.as_str()
        )));
    };

    let total_steps = cmd.case_ids.len() as i32 + 1;
    let mut bundle = ExportBundle {
        tenant: ctx.tenant.clone(),
        generated_at: Utc::now(),
        include_attachments: cmd.include_attachments,
        cases: Vec::with_capacity(cmd.case_ids.len()),
    };

    for (index, case_id) in cmd.case_ids.iter().enumerate() {
        ctx.progress
            .checkpoint(JobProgress::steps(
                index as i32,
                total_steps,
                format!("gathering case {case_id}"),
            ))
            .await?;

        let stats = ctx.deps.archiver.stats_for_case(case_id).await?;
        let mut emails = Vec::new();
        if cmd.include_emails {
            for message_id in ctx.deps.archiver.list_emails(case_id).await? {
                let mut metadata = ctx.deps.archiver.email_metadata(case_id, &message_id).await?;
                if !cmd.include_attachments {
                    metadata.attachments.clear();
                }
                emails.push(metadata);
            }
        }
        bundle.cases.push(CaseExport {
            case_id: case_id.clone(),
            stats,
            emails,
        });
    }

    ctx.progress
        .checkpoint(JobProgress::steps(
            total_steps - 1,
            total_steps,
            "rendering artifact",
        ))
        .await?;

    let bytes = renderer.render(&bundle)?;
    let byte_size = bytes.len() as i64;
    let export_id = Uuid::new_v4();
    let object_key = format!(
        "exports/{}/{}/case-export.{}",
        sanitize_segment(&ctx.tenant)
            .map_err(|e| JobError::validation(e.to_string()))?,
        export_id,
        renderer.file_extension()
    );

    ctx.deps
        .archiver
        .object_store()
        .put(&object_key, bytes, renderer.content_type(), &HashMap::new())
        .await
        .map_err(|e| JobError::storage(format!("export write failed: {e}")))?;

    let expires_at = Utc::now() + chrono::Duration::milliseconds(ctx.deps.export_ttl_ms as i64);

    ctx.progress
        .checkpoint(JobProgress::steps(total_steps, total_steps, "export written"))
        .await?;

    info!(
        tenant = %ctx.tenant,
        object_key = %object_key,
        byte_size,
        format = cmd.format.as_str(),
        "export artifact written"
    );

    let emails_exported: i64 = bundle.cases.iter().map(|c| c.emails.len() as i64).sum();
    Ok(JobResult::new(serde_json::json!({
        "objectKey": object_key,
        "byteSize": byte_size,
        "expiresAt": expires_at,
        "cases": bundle.cases.len(),
        "emails": emails_exported,
    }))
    .with_metrics(JobMetrics {
        bytes_processed: byte_size,
        items_processed: emails_exported,
        ..Default::default()
    }))
}
