//! Error taxonomy for the background job pipeline.
//!
//! `ErrorKind` is the closed classification every terminal failure carries;
//! it decides retry behavior. `JobError` is the structured record persisted
//! on the job row. `anyhow` stays internal transport for infrastructure
//! plumbing; only `JobError` crosses the job-row boundary.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Classification of a job failure.
///
/// The kind, not the message, drives retry decisions. Kinds map 1:1 to the
/// failure sources of the pipeline: payload validation, missing
/// preconditions, upstream mail provider faults, object storage faults, and
/// dispatcher-enforced outcomes (timeout, cancellation, stall).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Malformed payload or unknown job type.
    Validation,
    /// A required precondition is missing (account not connected, case gone).
    Precondition,
    /// Message, attachment, or case no longer exists upstream.
    NotFound,
    /// Credential refused by the upstream provider.
    Auth,
    /// Upstream signalled rate limiting (429).
    RateLimit,
    /// Transient upstream fault: 502/503/504, timeout, network.
    UpstreamTransient,
    /// Object storage read/write failure.
    Storage,
    /// Dispatcher-enforced wall-clock timeout.
    Timeout,
    /// Explicit user or system cancellation.
    Cancelled,
    /// Reaper-enforced stall detection.
    Stalled,
    /// Uncaught handler fault.
    Processing,
}

impl ErrorKind {
    /// Whether failures of this kind are eligible for automatic retry.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorKind::RateLimit
                | ErrorKind::UpstreamTransient
                | ErrorKind::Storage
                | ErrorKind::Timeout
                | ErrorKind::Stalled
                | ErrorKind::Processing
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Validation => "validation",
            ErrorKind::Precondition => "precondition",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Auth => "auth",
            ErrorKind::RateLimit => "rate_limit",
            ErrorKind::UpstreamTransient => "upstream_transient",
            ErrorKind::Storage => "storage",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Stalled => "stalled",
            ErrorKind::Processing => "processing",
        }
    }
}

/// Structured failure record persisted on a job row.
///
/// `retryable` defaults from the kind but may be overridden by the producer
/// (a handler can mark an individually transient fault permanent once it
/// knows better).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobError {
    pub kind: ErrorKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
    pub retryable: bool,
    pub occurred_at: DateTime<Utc>,
}

impl std::fmt::Display for JobError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind.as_str(), self.message)
    }
}

impl std::error::Error for JobError {}

impl JobError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            details: None,
            context: None,
            retryable: kind.is_retryable(),
            occurred_at: Utc::now(),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, message)
    }

    pub fn precondition(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Precondition, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, message)
    }

    pub fn auth(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Auth, message)
    }

    pub fn storage(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Storage, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, message)
    }

    pub fn cancelled() -> Self {
        Self::new(ErrorKind::Cancelled, "job was cancelled")
    }

    pub fn stalled() -> Self {
        Self::new(ErrorKind::Stalled, "no progress within the stall window")
    }

    pub fn processing(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Processing, message)
    }

    /// Attach machine-readable details (carried in `details`, never shown to
    /// end users).
    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    /// Attach the operation context the failure occurred in.
    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    /// Override the kind-derived retryable flag.
    pub fn non_retryable(mut self) -> Self {
        self.retryable = false;
        self
    }
}

/// Caller-facing errors from the enqueue surface.
#[derive(Debug, thiserror::Error)]
pub enum EnqueueError {
    #[error("unknown job type: {0}")]
    UnknownType(String),

    #[error("invalid payload for {job_type}: {reason}")]
    InvalidPayload { job_type: String, reason: String },

    #[error("queue depth {depth} exceeds ceiling {ceiling} for tenant {tenant}")]
    QuotaExceeded {
        tenant: String,
        depth: i64,
        ceiling: i64,
    },

    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_kinds_are_retryable() {
        assert!(ErrorKind::RateLimit.is_retryable());
        assert!(ErrorKind::UpstreamTransient.is_retryable());
        assert!(ErrorKind::Storage.is_retryable());
        assert!(ErrorKind::Timeout.is_retryable());
        assert!(ErrorKind::Stalled.is_retryable());
        assert!(ErrorKind::Processing.is_retryable());
    }

    #[test]
    fn permanent_kinds_are_not_retryable() {
        assert!(!ErrorKind::Validation.is_retryable());
        assert!(!ErrorKind::Precondition.is_retryable());
        assert!(!ErrorKind::NotFound.is_retryable());
        assert!(!ErrorKind::Auth.is_retryable());
        assert!(!ErrorKind::Cancelled.is_retryable());
    }

    #[test]
    fn job_error_defaults_retryable_from_kind() {
        assert!(JobError::new(ErrorKind::Storage, "write failed").retryable);
        assert!(!JobError::precondition("account not connected").retryable);
    }

    #[test]
    fn non_retryable_overrides_kind_default() {
        let err = JobError::new(ErrorKind::Storage, "bucket misconfigured").non_retryable();
        assert!(!err.retryable);
    }

    #[test]
    fn job_error_roundtrips_through_json() {
        let err = JobError::validation("bad payload")
            .with_details(serde_json::json!({"field": "messageId"}))
            .with_context("enqueue");
        let json = serde_json::to_string(&err).unwrap();
        let back: JobError = serde_json::from_str(&json).unwrap();
        assert_eq!(back.kind, ErrorKind::Validation);
        assert_eq!(back.context.as_deref(), Some("enqueue"));
    }
}
