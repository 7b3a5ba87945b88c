//! Blob archiver: canonical emails in, deterministic object layout out.
//!
//! Writes are replay-safe: re-archiving the same `(messageId, caseId)`
//! fingerprint overwrites the same keys, and the email-root `metadata.json`
//! is written last so a half-written archive is never mistaken for a
//! complete one.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info};

use crate::common::error::JobError;
use crate::kernel::mail::types::FetchedEmail;

use super::object_store::{ObjectStore, StorageError};
use super::paths::{
    self, attachment_key, attachment_metadata_key, case_prefix, email_prefix, PathError,
    HEADERS_FILE, HTML_FILE, METADATA_FILE, RTF_FILE, TEXT_FILE,
};
use super::types::{
    ArchivedAttachment, ArchivedEmailMetadata, CaseArchiveStats, RetrievedAttachment,
    RetrievedEmail, StorageOutcome, STORAGE_VERSION,
};

const JSON_CONTENT_TYPE: &str = "application/json";
const FALLBACK_CONTENT_TYPE: &str = "application/octet-stream";

pub struct BlobArchiver {
    store: Arc<dyn ObjectStore>,
}

impl BlobArchiver {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self { store }
    }

    pub fn object_store(&self) -> &Arc<dyn ObjectStore> {
        &self.store
    }

    /// Whether a complete archive exists for the fingerprint.
    pub async fn exists(&self, case_id: &str, message_id: &str) -> Result<bool, JobError> {
        let prefix = email_prefix(case_id, message_id).map_err(path_error)?;
        self.store
            .exists(&format!("{prefix}{METADATA_FILE}"))
            .await
            .map_err(storage_error)
    }

    /// Archive one canonical email under its deterministic layout.
    pub async fn store_email(
        &self,
        case_id: &str,
        message_id: &str,
        email: &FetchedEmail,
    ) -> Result<StorageOutcome, JobError> {
        let prefix = email_prefix(case_id, message_id).map_err(path_error)?;
        self.store.ensure_container().await.map_err(storage_error)?;

        let mut objects_written = 0usize;
        let mut attachment_bytes = 0i64;
        let mut archived_attachments = Vec::with_capacity(email.content.attachments.len());

        for attachment in &email.content.attachments {
            let stored_name = paths::sanitize_segment(&attachment.name).map_err(path_error)?;
            let key = attachment_key(&prefix, &attachment.id, &attachment.name)
                .map_err(path_error)?;
            let content_type = if attachment.content_type.is_empty() {
                FALLBACK_CONTENT_TYPE
            } else {
                &attachment.content_type
            };

            let custom = HashMap::from([
                ("message_id".to_string(), message_id.to_string()),
                ("case_id".to_string(), case_id.to_string()),
            ]);
            self.store
                .put(&key, attachment.bytes.clone(), content_type, &custom)
                .await
                .map_err(storage_error)?;
            objects_written += 1;
            attachment_bytes += attachment.bytes.len() as i64;

            let record = ArchivedAttachment {
                id: attachment.id.clone(),
                name: stored_name,
                content_type: content_type.to_string(),
                size: attachment.bytes.len() as i64,
                is_inline: attachment.is_inline,
                content_id: attachment.content_id.clone(),
                content_location: attachment.content_location.clone(),
            };
            let meta_key =
                attachment_metadata_key(&prefix, &attachment.id).map_err(path_error)?;
            self.put_json(&meta_key, &record).await?;
            objects_written += 1;
            archived_attachments.push(record);
        }

        let mut bodies = Vec::new();
        for (key, body, content_type) in [
            (HTML_FILE, &email.content.html, "text/html"),
            (TEXT_FILE, &email.content.text, "text/plain"),
            (RTF_FILE, &email.content.rtf, "application/rtf"),
        ] {
            if let Some(body) = body {
                self.store
                    .put(
                        &format!("{prefix}{key}"),
                        body.clone().into_bytes(),
                        content_type,
                        &HashMap::new(),
                    )
                    .await
                    .map_err(storage_error)?;
                objects_written += 1;
                bodies.push(key.split('.').next_back().unwrap_or(key).to_string());
            }
        }

        if let Some(headers) = &email.content.headers {
            self.put_json(&format!("{prefix}{HEADERS_FILE}"), headers).await?;
            objects_written += 1;
        }

        let metadata = ArchivedEmailMetadata {
            message_id: message_id.to_string(),
            case_id: case_id.to_string(),
            subject: email.metadata.subject.clone(),
            from: email.metadata.from.clone(),
            to: email.metadata.to.clone(),
            cc: email.metadata.cc.clone(),
            bcc: email.metadata.bcc.clone(),
            sent_at: email.metadata.sent_at,
            received_at: email.metadata.received_at,
            importance: email.metadata.importance.clone(),
            is_read: email.metadata.is_read,
            is_draft: email.metadata.is_draft,
            conversation_id: email.metadata.conversation_id.clone(),
            bodies: bodies.clone(),
            has_headers: email.content.headers.is_some(),
            attachments: archived_attachments,
            stored_at: Utc::now(),
            storage_version: STORAGE_VERSION,
        };
        self.put_json(&format!("{prefix}{METADATA_FILE}"), &metadata).await?;
        objects_written += 1;

        info!(
            case_id = %case_id,
            message_id = %message_id,
            objects = objects_written,
            bodies = bodies.len(),
            attachments = metadata.attachments.len(),
            "email archived"
        );

        Ok(StorageOutcome {
            storage_path: prefix,
            objects_written,
            bodies_stored: bodies.len(),
            attachments_stored: metadata.attachments.len(),
            attachment_bytes,
            skipped: false,
        })
    }

    /// Rehydrate one archived email.
    pub async fn get_email(
        &self,
        case_id: &str,
        message_id: &str,
    ) -> Result<RetrievedEmail, JobError> {
        let prefix = email_prefix(case_id, message_id).map_err(path_error)?;
        let metadata: ArchivedEmailMetadata =
            self.get_json(&format!("{prefix}{METADATA_FILE}")).await?;

        let mut email = RetrievedEmail {
            html: self.get_optional_text(&format!("{prefix}{HTML_FILE}")).await?,
            text: self.get_optional_text(&format!("{prefix}{TEXT_FILE}")).await?,
            rtf: self.get_optional_text(&format!("{prefix}{RTF_FILE}")).await?,
            headers: None,
            attachments: Vec::with_capacity(metadata.attachments.len()),
            metadata,
        };

        if email.metadata.has_headers {
            email.headers = Some(self.get_json(&format!("{prefix}{HEADERS_FILE}")).await?);
        }

        for record in email.metadata.attachments.clone() {
            let key = attachment_key(&prefix, &record.id, &record.name).map_err(path_error)?;
            let bytes = self.store.get(&key).await.map_err(storage_error)?;
            email.attachments.push(RetrievedAttachment {
                metadata: record,
                bytes,
            });
        }

        Ok(email)
    }

    /// Delete every object of one archived email. Returns the count removed.
    pub async fn delete_email(&self, case_id: &str, message_id: &str) -> Result<usize, JobError> {
        let prefix = email_prefix(case_id, message_id).map_err(path_error)?;
        let objects = self
            .store
            .list_by_prefix(&prefix)
            .await
            .map_err(storage_error)?;
        let count = objects.len();
        for object in objects {
            self.store.delete(&object.key).await.map_err(storage_error)?;
        }
        debug!(case_id = %case_id, message_id = %message_id, objects = count, "email archive deleted");
        Ok(count)
    }

    /// Aggregate stats for one case's archive.
    pub async fn stats_for_case(&self, case_id: &str) -> Result<CaseArchiveStats, JobError> {
        let prefix = case_prefix(case_id).map_err(path_error)?;
        let objects = self
            .store
            .list_by_prefix(&prefix)
            .await
            .map_err(storage_error)?;

        let mut stats = CaseArchiveStats::default();
        for object in &objects {
            stats.total_size += object.size;
            let segments: Vec<&str> = object.key.split('/').collect();
            if object.key.ends_with(METADATA_FILE) {
                // cases/{case}/emails/{msg}/metadata.json
                if segments.len() == 5 {
                    stats.total_emails += 1;
                }
                // cases/{case}/emails/{msg}/attachments/{id}/metadata.json
                if segments.len() == 7 {
                    stats.total_attachments += 1;
                }
            }
        }
        Ok(stats)
    }

    /// Message ids with a complete archive under one case.
    pub async fn list_emails(&self, case_id: &str) -> Result<Vec<String>, JobError> {
        let prefix = case_prefix(case_id).map_err(path_error)?;
        let objects = self
            .store
            .list_by_prefix(&prefix)
            .await
            .map_err(storage_error)?;

        let mut message_ids: Vec<String> = objects
            .into_iter()
            .filter_map(|object| {
                let segments: Vec<&str> = object.key.split('/').collect();
                (segments.len() == 5 && segments[4] == METADATA_FILE)
                    .then(|| segments[3].to_string())
            })
            .collect();
        message_ids.sort();
        message_ids.dedup();
        Ok(message_ids)
    }

    /// Case ids that currently have archived objects.
    pub async fn list_cases(&self) -> Result<Vec<String>, JobError> {
        let objects = self
            .store
            .list_by_prefix("cases/")
            .await
            .map_err(storage_error)?;

        let mut cases: Vec<String> = objects
            .into_iter()
            .filter_map(|object| {
                object
                    .key
                    .split('/')
                    .nth(1)
                    .map(|case| case.to_string())
            })
            .collect();
        cases.sort();
        cases.dedup();
        Ok(cases)
    }

    /// The archived metadata document for one email.
    pub async fn email_metadata(
        &self,
        case_id: &str,
        message_id: &str,
    ) -> Result<ArchivedEmailMetadata, JobError> {
        let prefix = email_prefix(case_id, message_id).map_err(path_error)?;
        self.get_json(&format!("{prefix}{METADATA_FILE}")).await
    }

    async fn put_json<T: serde::Serialize>(&self, key: &str, value: &T) -> Result<(), JobError> {
        let bytes = serde_json::to_vec_pretty(value)
            .map_err(|e| JobError::storage(format!("serialize {key}: {e}")))?;
        self.store
            .put(key, bytes, JSON_CONTENT_TYPE, &HashMap::new())
            .await
            .map_err(storage_error)
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, key: &str) -> Result<T, JobError> {
        let bytes = self.store.get(key).await.map_err(storage_error)?;
        serde_json::from_slice(&bytes)
            .map_err(|e| JobError::storage(format!("corrupt document at {key}: {e}")))
    }

    async fn get_optional_text(&self, key: &str) -> Result<Option<String>, JobError> {
        match self.store.get(key).await {
            Ok(bytes) => Ok(Some(String::from_utf8_lossy(&bytes).into_owned())),
            Err(StorageError::NotFound(_)) => Ok(None),
            Err(e) => Err(storage_error(e)),
        }
    }
}

fn storage_error(err: StorageError) -> JobError {
    match err {
        StorageError::NotFound(key) => JobError::not_found(format!("object missing: {key}")),
        other => JobError::storage(other.to_string()).with_context("object_store"),
    }
}

fn path_error(err: PathError) -> JobError {
    JobError::validation(err.to_string()).with_context("storage_path")
}
