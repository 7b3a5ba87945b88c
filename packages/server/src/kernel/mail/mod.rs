//! Upstream mail provider integration.
//!
//! - [`types`] - canonical email, attachment, and header forms
//! - [`client`] - HTTP client and the [`MailApi`] seam
//! - [`rate_gate`] - shared leaky-bucket admission point
//! - [`fetcher`] - retrying fetch wrapper used by workers
//! - [`credentials`] - bearer-token contract with the platform

pub mod client;
pub mod credentials;
pub mod fetcher;
pub mod rate_gate;
pub mod types;

pub use client::{HttpMailClient, MailApi, MailApiError};
pub use credentials::{AccessToken, EnvMailAccounts, MailAccounts};
pub use fetcher::MailFetcher;
pub use rate_gate::RateGate;
pub use types::{
    collect_headers, EmailAddress, EmailAttachment, EmailContent, EmailMetadata, FetchedEmail,
    HeaderValue, Headers,
};
