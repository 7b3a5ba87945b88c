//! Rate-limited, retrying fetch of canonical emails.
//!
//! Wraps the [`MailApi`] seam with the shared admission gate and sub-step
//! retries. These retries are internal to a single job attempt: a transient
//! upstream fault absorbed here never increments the job's attempt counter.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::common::error::JobError;
use crate::config::{RateLimitConfig, RetryConfig};

use super::client::MailApi;
use super::rate_gate::RateGate;
use super::types::FetchedEmail;

pub struct MailFetcher {
    api: Arc<dyn MailApi>,
    gate: RateGate,
    retry: RetryConfig,
    max_attempts: u32,
}

impl MailFetcher {
    pub fn new(api: Arc<dyn MailApi>, rate_limit: RateLimitConfig, retry: RetryConfig) -> Self {
        Self {
            api,
            gate: RateGate::new(rate_limit),
            retry,
            max_attempts: 3,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    /// Fetch one message and (unless skipped) its attachments.
    pub async fn fetch(
        &self,
        token: &str,
        message_id: &str,
        include_attachments: bool,
    ) -> Result<FetchedEmail, JobError> {
        let mut email = self
            .call(message_id, || self.api.fetch_message(token, message_id))
            .await?;

        if include_attachments && email.metadata.has_attachments {
            let attachments = self
                .call(message_id, || self.api.fetch_attachments(token, message_id))
                .await?;
            email.content.attachments = attachments;
        }
        email.metadata.attachment_count = email.content.attachments.len();
        email.metadata.has_attachments = !email.content.attachments.is_empty();

        Ok(email)
    }

    async fn call<T, F, Fut>(&self, message_id: &str, operation: F) -> Result<T, JobError>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<T, super::client::MailApiError>>,
    {
        let mut attempt = 1u32;
        loop {
            self.gate.admit().await;

            match operation().await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_retryable() && attempt < self.max_attempts => {
                    let delay = self.retry.delay_for_attempt(attempt as i32);
                    warn!(
                        message_id = %message_id,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "transient upstream fault, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => {
                    debug!(message_id = %message_id, attempt, error = %err, "upstream fetch failed");
                    return Err(err.into_job_error());
                }
            }
        }
    }
}
