//! Deterministic storage key layout and path sanitization.
//!
//! Every archived email lives under `cases/{caseId}/emails/{messageId}/`:
//!
//! ```text
//! metadata.json
//! content.html | content.txt | content.rtf
//! headers.json
//! attachments/{attachmentId}/{sanitized-name}
//! attachments/{attachmentId}/metadata.json
//! ```
//!
//! Path segments are sanitized before they reach the object store; a segment
//! that cannot be made safe is rejected outright.

const FORBIDDEN: &[char] = &['<', '>', ':', '"', '/', '\\', '|', '?', '*'];
const MAX_SEGMENT_LEN: usize = 100;

pub const METADATA_FILE: &str = "metadata.json";
pub const HEADERS_FILE: &str = "headers.json";
pub const HTML_FILE: &str = "content.html";
pub const TEXT_FILE: &str = "content.txt";
pub const RTF_FILE: &str = "content.rtf";

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum PathError {
    #[error("path segment is empty after sanitization")]
    Empty,

    #[error("path segment {0:?} is unsafe after sanitization")]
    Unsafe(String),
}

/// Sanitize one path segment: forbidden characters and whitespace become
/// `_`, runs collapse, and the result is truncated to 100 code points.
/// Segments that would still start with `.` or contain a traversal
/// sequence are rejected.
pub fn sanitize_segment(raw: &str) -> Result<String, PathError> {
    let mut out = String::with_capacity(raw.len().min(MAX_SEGMENT_LEN));
    let mut last_was_underscore = false;
    for ch in raw.chars() {
        let mapped = if FORBIDDEN.contains(&ch) || ch.is_whitespace() || ch.is_control() {
            '_'
        } else {
            ch
        };
        if mapped == '_' {
            if last_was_underscore {
                continue;
            }
            last_was_underscore = true;
        } else {
            last_was_underscore = false;
        }
        out.push(mapped);
        if out.chars().count() >= MAX_SEGMENT_LEN {
            break;
        }
    }

    if out.is_empty() {
        return Err(PathError::Empty);
    }
    if out.starts_with('.') || out.contains("..") {
        return Err(PathError::Unsafe(out));
    }
    Ok(out)
}

/// Root prefix for one archived email.
pub fn email_prefix(case_id: &str, message_id: &str) -> Result<String, PathError> {
    Ok(format!(
        "cases/{}/emails/{}/",
        sanitize_segment(case_id)?,
        sanitize_segment(message_id)?
    ))
}

/// Prefix holding every email of one case.
pub fn case_prefix(case_id: &str) -> Result<String, PathError> {
    Ok(format!("cases/{}/emails/", sanitize_segment(case_id)?))
}

/// Key of one attachment's raw bytes.
pub fn attachment_key(
    email_prefix: &str,
    attachment_id: &str,
    name: &str,
) -> Result<String, PathError> {
    Ok(format!(
        "{email_prefix}attachments/{}/{}",
        sanitize_segment(attachment_id)?,
        sanitize_segment(name)?
    ))
}

/// Key of one attachment's metadata document.
pub fn attachment_metadata_key(
    email_prefix: &str,
    attachment_id: &str,
) -> Result<String, PathError> {
    Ok(format!(
        "{email_prefix}attachments/{}/{METADATA_FILE}",
        sanitize_segment(attachment_id)?
    ))
}
