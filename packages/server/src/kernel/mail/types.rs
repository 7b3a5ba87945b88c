//! Canonical email forms returned by the upstream mail provider.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A header value: single, or multi-valued with order preserved.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum HeaderValue {
    Single(String),
    Multi(Vec<String>),
}

impl HeaderValue {
    /// Fold another occurrence of the same header into this value.
    pub fn push(&mut self, value: String) {
        match self {
            HeaderValue::Single(existing) => {
                *self = HeaderValue::Multi(vec![std::mem::take(existing), value]);
            }
            HeaderValue::Multi(values) => values.push(value),
        }
    }
}

pub type Headers = BTreeMap<String, HeaderValue>;

/// Fold an ordered `(name, value)` sequence into a header map, preserving
/// the order of repeated values.
pub fn collect_headers<I>(pairs: I) -> Headers
where
    I: IntoIterator<Item = (String, String)>,
{
    let mut headers = Headers::new();
    for (name, value) in pairs {
        match headers.entry(name) {
            std::collections::btree_map::Entry::Vacant(slot) => {
                slot.insert(HeaderValue::Single(value));
            }
            std::collections::btree_map::Entry::Occupied(mut slot) => {
                slot.get_mut().push(value);
            }
        }
    }
    headers
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct EmailAddress {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub address: String,
}

/// Message metadata as reported by the upstream provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct EmailMetadata {
    pub message_id: String,
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
    #[serde(default)]
    pub has_attachments: bool,
    #[serde(default)]
    pub attachment_count: usize,
}

/// One attachment with its raw bytes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmailAttachment {
    pub id: String,
    pub name: String,
    pub content_type: String,
    pub size: i64,
    #[serde(default)]
    pub is_inline: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_location: Option<String>,
    #[serde(skip)]
    pub bytes: Vec<u8>,
}

/// Message content: any subset of the body forms plus headers and the
/// attachment list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct EmailContent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub html: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rtf: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub headers: Option<Headers>,
    #[serde(default)]
    pub attachments: Vec<EmailAttachment>,
}

impl EmailContent {
    pub fn body_count(&self) -> usize {
        [
            self.html.is_some(),
            self.text.is_some(),
            self.rtf.is_some(),
        ]
        .into_iter()
        .filter(|present| *present)
        .count()
    }
}

/// Canonical fetch output: content plus metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct FetchedEmail {
    pub content: EmailContent,
    pub metadata: EmailMetadata,
}
