//! Upstream mail account credential contract.
//!
//! The platform's token service owns refresh and revocation; the pipeline
//! only consumes short-lived bearer tokens and never stores credentials.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// A bearer credential for one upstream call.
#[derive(Debug, Clone)]
pub struct AccessToken {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

impl AccessToken {
    pub fn is_expired(&self) -> bool {
        self.expires_at <= Utc::now()
    }
}

/// Directory of connected upstream mail accounts.
///
/// `None` means the `(tenant, user)` pair has no connected account, which is a
/// non-retryable precondition failure for jobs that need mail access.
#[async_trait]
pub trait MailAccounts: Send + Sync {
    async fn access_token(&self, tenant: &str, user_id: &str) -> Result<Option<AccessToken>>;
}

/// Environment-token stand-in for the platform token service, for running
/// the worker binary without the full platform.
pub struct EnvMailAccounts {
    token: Option<String>,
}

impl EnvMailAccounts {
    pub fn from_env() -> Self {
        Self {
            token: std::env::var("MAIL_ACCESS_TOKEN").ok(),
        }
    }
}

#[async_trait]
impl MailAccounts for EnvMailAccounts {
    async fn access_token(&self, _tenant: &str, _user_id: &str) -> Result<Option<AccessToken>> {
        Ok(self.token.as_ref().map(|token| AccessToken {
            token: token.clone(),
            expires_at: Utc::now() + chrono::Duration::minutes(30),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expired_token_reports_expired() {
        let token = AccessToken {
            token: "t".into(),
            expires_at: Utc::now() - chrono::Duration::seconds(1),
        };
        assert!(token.is_expired());

        let token = AccessToken {
            token: "t".into(),
            expires_at: Utc::now() + chrono::Duration::minutes(5),
        };
        assert!(!token.is_expired());
    }
}
