//! Upstream mail API client using direct HTTP calls.
//!
//! The trait is the integration seam; the HTTP implementation maps the
//! provider's wire shapes into the canonical forms and classifies failures
//! into the pipeline's error taxonomy. Retries and rate limiting live one
//! layer up in the fetcher.

use anyhow::{Context, Result};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, Utc};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use std::time::Duration;

use crate::common::error::{ErrorKind, JobError};

use super::types::{
    collect_headers, EmailAddress, EmailAttachment, EmailContent, EmailMetadata, FetchedEmail,
};

/// Failures from one upstream call.
#[derive(Debug, thiserror::Error)]
pub enum MailApiError {
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("upstream returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("message not found: {0}")]
    NotFound(String),

    #[error("credential refused by upstream")]
    Auth,

    #[error("rate limited by upstream")]
    RateLimited { retry_after: Option<u64> },

    #[error("invalid upstream response: {0}")]
    InvalidResponse(String),
}

impl MailApiError {
    /// Retry only on transport faults, timeouts, rate-limit signals, and the
    /// transient upstream codes.
    pub fn is_retryable(&self) -> bool {
        match self {
            MailApiError::Transport(_) => true,
            MailApiError::RateLimited { .. } => true,
            MailApiError::Status { status, .. } => matches!(status, 502 | 503 | 504 | 429),
            MailApiError::NotFound(_) | MailApiError::Auth | MailApiError::InvalidResponse(_) => {
                false
            }
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            MailApiError::Transport(_) => ErrorKind::UpstreamTransient,
            MailApiError::RateLimited { .. } => ErrorKind::RateLimit,
            MailApiError::Status { status, .. } => match status {
                429 => ErrorKind::RateLimit,
                502 | 503 | 504 => ErrorKind::UpstreamTransient,
                401 | 403 => ErrorKind::Auth,
                404 => ErrorKind::NotFound,
                _ => ErrorKind::Validation,
            },
            MailApiError::NotFound(_) => ErrorKind::NotFound,
            MailApiError::Auth => ErrorKind::Auth,
            MailApiError::InvalidResponse(_) => ErrorKind::Validation,
        }
    }

    pub fn into_job_error(self) -> JobError {
        let kind = self.kind();
        let mut error = JobError::new(kind, self.to_string()).with_context("mail_fetch");
        error.retryable = self.is_retryable();
        error
    }
}

/// Upstream mail provider seam.
///
/// The caller supplies an opaque bearer credential per call; the client
/// never manages refresh.
#[async_trait]
pub trait MailApi: Send + Sync {
    /// Fetch one message in canonical form, without attachment payloads.
    async fn fetch_message(&self, token: &str, message_id: &str)
        -> Result<FetchedEmail, MailApiError>;

    /// Fetch the message's attachments with raw bytes.
    async fn fetch_attachments(
        &self,
        token: &str,
        message_id: &str,
    ) -> Result<Vec<EmailAttachment>, MailApiError>;
}

// Wire shapes for the upstream message API.

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct MessageDto {
    id: String,
    subject: Option<String>,
    importance: Option<String>,
    conversation_id: Option<String>,
    is_read: Option<bool>,
    is_draft: Option<bool>,
    sent_date_time: Option<DateTime<Utc>>,
    received_date_time: Option<DateTime<Utc>>,
    has_attachments: Option<bool>,
    body: Option<BodyDto>,
    unique_body: Option<BodyDto>,
    internet_message_headers: Option<Vec<HeaderDto>>,
    from: Option<RecipientDto>,
    #[serde(default)]
    to_recipients: Vec<RecipientDto>,
    #[serde(default)]
    cc_recipients: Vec<RecipientDto>,
    #[serde(default)]
    bcc_recipients: Vec<RecipientDto>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct BodyDto {
    content_type: Option<String>,
    content: Option<String>,
}

#[derive(Deserialize)]
struct HeaderDto {
    name: String,
    value: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RecipientDto {
    email_address: Option<AddressDto>,
}

#[derive(Deserialize)]
struct AddressDto {
    name: Option<String>,
    address: Option<String>,
}

#[derive(Deserialize)]
struct AttachmentListDto {
    value: Vec<AttachmentDto>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct AttachmentDto {
    id: String,
    name: Option<String>,
    content_type: Option<String>,
    size: Option<i64>,
    is_inline: Option<bool>,
    content_id: Option<String>,
    content_location: Option<String>,
    content_bytes: Option<String>,
}

/// HTTP client for the upstream mail provider.
pub struct HttpMailClient {
    client: Client,
    base_url: String,
}

impl HttpMailClient {
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .context("failed to create HTTP client")?;
        Ok(Self {
            client,
            base_url: base_url.into(),
        })
    }

    async fn get_json<R: for<'de> Deserialize<'de>>(
        &self,
        token: &str,
        path: &str,
    ) -> Result<R, MailApiError> {
        let url = format!("{}{}", self.base_url, path);
        let response = self
            .client
            .get(&url)
            .bearer_auth(token)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(match status {
                StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => MailApiError::Auth,
                StatusCode::NOT_FOUND => MailApiError::NotFound(path.to_string()),
                StatusCode::TOO_MANY_REQUESTS => {
                    let retry_after = response
                        .headers()
                        .get("retry-after")
                        .and_then(|v| v.to_str().ok())
                        .and_then(|v| v.parse().ok());
                    MailApiError::RateLimited { retry_after }
                }
                _ => MailApiError::Status {
                    status: status.as_u16(),
                    body: response.text().await.unwrap_or_default(),
                },
            });
        }

        response
            .json()
            .await
            .map_err(|e| MailApiError::InvalidResponse(e.to_string()))
    }
}

#[async_trait]
impl MailApi for HttpMailClient {
    async fn fetch_message(
        &self,
        token: &str,
        message_id: &str,
    ) -> Result<FetchedEmail, MailApiError> {
        let dto: MessageDto = self
            .get_json(token, &format!("/me/messages/{message_id}"))
            .await?;
        Ok(message_from_dto(dto))
    }

    async fn fetch_attachments(
        &self,
        token: &str,
        message_id: &str,
    ) -> Result<Vec<EmailAttachment>, MailApiError> {
        let dto: AttachmentListDto = self
            .get_json(token, &format!("/me/messages/{message_id}/attachments"))
            .await?;

        dto.value.into_iter().map(attachment_from_dto).collect()
    }
}

fn address_from_dto(dto: RecipientDto) -> Option<EmailAddress> {
    let address = dto.email_address?;
    Some(EmailAddress {
        name: address.name,
        address: address.address.unwrap_or_default(),
    })
}

fn message_from_dto(dto: MessageDto) -> FetchedEmail {
    let mut content = EmailContent::default();
    // The provider reports one primary body with a declared content type;
    // uniqueBody can carry the other form.
    for body in [dto.body, dto.unique_body].into_iter().flatten() {
        let Some(text) = body.content else { continue };
        match body.content_type.as_deref() {
            Some("html") => content.html.get_or_insert(text),
            Some("rtf") => content.rtf.get_or_insert(text),
            _ => content.text.get_or_insert(text),
        };
    }
    if let Some(headers) = dto.internet_message_headers {
        content.headers = Some(collect_headers(
            headers.into_iter().map(|h| (h.name, h.value)),
        ));
    }

    let metadata = EmailMetadata {
        message_id: dto.id,
        subject: dto.subject,
        from: dto.from.and_then(address_from_dto),
        to: dto.to_recipients.into_iter().filter_map(address_from_dto).collect(),
        cc: dto.cc_recipients.into_iter().filter_map(address_from_dto).collect(),
        bcc: dto.bcc_recipients.into_iter().filter_map(address_from_dto).collect(),
        sent_at: dto.sent_date_time,
        received_at: dto.received_date_time,
        importance: dto.importance,
        is_read: dto.is_read.unwrap_or(false),
        is_draft: dto.is_draft.unwrap_or(false),
        conversation_id: dto.conversation_id,
        has_attachments: dto.has_attachments.unwrap_or(false),
        attachment_count: 0,
    };

    FetchedEmail { content, metadata }
}

fn attachment_from_dto(dto: AttachmentDto) -> Result<EmailAttachment, MailApiError> {
    let bytes = match dto.content_bytes {
        Some(encoded) => BASE64
            .decode(encoded.as_bytes())
            .map_err(|e| MailApiError::InvalidResponse(format!("attachment bytes: {e}")))?,
        None => Vec::new(),
    };
    Ok(EmailAttachment {
        size: dto.size.unwrap_or(bytes.len() as i64),
        id: dto.id,
        name: dto.name.unwrap_or_else(|| "attachment".to_string()),
        content_type: dto
            .content_type
            .unwrap_or_else(|| "application/octet-stream".to_string()),
        is_inline: dto.is_inline.unwrap_or(false),
        content_id: dto.content_id,
        content_location: dto.content_location,
        bytes,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_statuses() {
        for status in [429u16, 502, 503, 504] {
            let err = MailApiError::Status {
                status,
                body: String::new(),
            };
            assert!(err.is_retryable(), "{status} should be retryable");
        }
        for status in [400u16, 401, 404, 500] {
            let err = MailApiError::Status {
                status,
                body: String::new(),
            };
            assert!(!err.is_retryable(), "{status} should not be retryable");
        }
    }

    #[test]
    fn error_kinds_map_to_taxonomy() {
        assert_eq!(MailApiError::Auth.kind(), ErrorKind::Auth);
        assert_eq!(
            MailApiError::NotFound("m1".into()).kind(),
            ErrorKind::NotFound
        );
        assert_eq!(
            MailApiError::RateLimited { retry_after: None }.kind(),
            ErrorKind::RateLimit
        );
        assert_eq!(
            MailApiError::Status {
                status: 503,
                body: String::new()
            }
            .kind(),
            ErrorKind::UpstreamTransient
        );
    }

    #[test]
    fn message_dto_maps_bodies_and_headers() {
        let dto: MessageDto = serde_json::from_value(serde_json::json!({
            "id": "m1",
            "subject": "Discovery request",
            "isRead": true,
            "body": {"contentType": "html", "content": "<p>hi</p>"},
            "uniqueBody": {"contentType": "text", "content": "hi"},
            "internetMessageHeaders": [
                {"name": "Received", "value": "hop-1"},
                {"name": "Received", "value": "hop-2"}
            ],
            "from": {"emailAddress": {"name": "Counsel", "address": "c@firm.example"}},
            "toRecipients": [{"emailAddress": {"address": "client@firm.example"}}]
        }))
        .unwrap();

        let email = message_from_dto(dto);
        assert_eq!(email.metadata.message_id, "m1");
        assert_eq!(email.content.html.as_deref(), Some("<p>hi</p>"));
        assert_eq!(email.content.text.as_deref(), Some("hi"));
        assert!(email.metadata.is_read);
        assert_eq!(email.metadata.to.len(), 1);
        let headers = email.content.headers.unwrap();
        assert!(matches!(
            headers.get("Received"),
            Some(crate::kernel::mail::types::HeaderValue::Multi(values)) if values.len() == 2
        ));
    }

    #[test]
    fn attachment_dto_decodes_base64() {
        let dto: AttachmentDto = serde_json::from_value(serde_json::json!({
            "id": "a1",
            "name": "exhibit.txt",
            "contentType": "text/plain",
            "isInline": false,
            "contentBytes": "aGVsbG8="
        }))
        .unwrap();

        let attachment = attachment_from_dto(dto).unwrap();
        assert_eq!(attachment.bytes, b"hello");
        assert_eq!(attachment.size, 5);
    }
}
