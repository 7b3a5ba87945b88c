//! Persisted forms of archived emails.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::kernel::mail::types::{EmailAddress, Headers};

/// Current layout version written into every metadata document.
pub const STORAGE_VERSION: i32 = 1;

/// Per-attachment record stored next to the raw bytes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchivedAttachment {
    pub id: String,
    /// Sanitized filename, as stored.
    pub name: String,
    pub content_type: String,
    pub size: i64,
    #[serde(default)]
    pub is_inline: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_location: Option<String>,
}

/// The `metadata.json` document at the email root.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchivedEmailMetadata {
    pub message_id: String,
    pub case_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<EmailAddress>,
    #[serde(default)]
    pub to: Vec<EmailAddress>,
    #[serde(default)]
    pub cc: Vec<EmailAddress>,
    #[serde(default)]
    pub bcc: Vec<EmailAddress>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sent_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub received_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub importance: Option<String>,
    #[serde(default)]
    pub is_read: bool,
    #[serde(default)]
    pub is_draft: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
    /// Which body forms were stored ("html", "text", "rtf").
    pub bodies: Vec<String>,
    #[serde(default)]
    pub has_headers: bool,
    pub attachments: Vec<ArchivedAttachment>,
    pub stored_at: DateTime<Utc>,
    pub storage_version: i32,
}

/// Result of one archival write.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StorageOutcome {
    pub storage_path: String,
    pub objects_written: usize,
    pub bodies_stored: usize,
    pub attachments_stored: usize,
    /// Total attachment payload bytes written.
    pub attachment_bytes: i64,
    /// True when an existing archive was kept as-is.
    pub skipped: bool,
}

/// One attachment read back from the archive.
#[derive(Debug, Clone)]
pub struct RetrievedAttachment {
    pub metadata: ArchivedAttachment,
    pub bytes: Vec<u8>,
}

/// A fully rehydrated archived email.
#[derive(Debug, Clone)]
pub struct RetrievedEmail {
    pub metadata: ArchivedEmailMetadata,
    pub html: Option<String>,
    pub text: Option<String>,
    pub rtf: Option<String>,
    pub headers: Option<Headers>,
    pub attachments: Vec<RetrievedAttachment>,
}

/// Aggregates for one case's archive.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CaseArchiveStats {
    pub total_emails: i64,
    pub total_size: i64,
    pub total_attachments: i64,
}
