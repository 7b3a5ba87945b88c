//! Test dependencies: in-memory wiring of the whole pipeline.
//!
//! Mirrors production construction with the memory store, memory object
//! store, and a scripted upstream mail API, so scenario tests drive the
//! real queue/registry/dispatcher code paths without external services.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::{RateLimitConfig, RetryConfig};
use crate::domains::emails::assignments::MemoryAssignmentStore;
use crate::domains::emails::export::default_renderers;
use crate::domains::emails::{build_registry, build_schemas};
use crate::kernel::archive::{BlobArchiver, MemoryObjectStore};
use crate::kernel::deps::WorkerDeps;
use crate::kernel::jobs::pool::{run_claimed_job, JobOutcome};
use crate::kernel::jobs::{
    JobEventHub, JobQueue, JobStore, JobType, MemoryJobStore, QueueDefaults, SharedJobRegistry,
};
use crate::kernel::mail::client::{MailApi, MailApiError};
use crate::kernel::mail::credentials::{AccessToken, MailAccounts};
use crate::kernel::mail::types::{EmailAttachment, EmailContent, EmailMetadata, FetchedEmail};
use crate::kernel::mail::MailFetcher;

/// Scripted upstream mail API.
///
/// Seed canonical emails with [`insert_email`](Self::insert_email); queue
/// one-shot failures with [`push_failure`](Self::push_failure); they are
/// consumed before the seeded email is served.
#[derive(Default)]
pub struct ScriptedMailApi {
    emails: RwLock<HashMap<String, FetchedEmail>>,
    failures: Mutex<HashMap<String, VecDeque<MailApiError>>>,
    calls: AtomicU32,
}

impl ScriptedMailApi {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_email(&self, mut email: FetchedEmail) {
        email.metadata.has_attachments = !email.content.attachments.is_empty();
        email.metadata.attachment_count = email.content.attachments.len();
        self.emails
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(email.metadata.message_id.clone(), email);
    }

    pub fn push_failure(&self, message_id: &str, error: MailApiError) {
        self.failures
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(message_id.to_string())
            .or_default()
            .push_back(error);
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    fn pop_failure(&self, message_id: &str) -> Option<MailApiError> {
        self.failures
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get_mut(message_id)
            .and_then(|queue| queue.pop_front())
    }
}

#[async_trait]
impl MailApi for ScriptedMailApi {
    async fn fetch_message(
        &self,
        _token: &str,
        message_id: &str,
    ) -> Result<FetchedEmail, MailApiError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(error) = self.pop_failure(message_id) {
            return Err(error);
        }
        let emails = self.emails.read().unwrap_or_else(|e| e.into_inner());
        let Some(email) = emails.get(message_id) else {
            return Err(MailApiError::NotFound(message_id.to_string()));
        };
        let mut without_attachments = email.clone();
        without_attachments.content.attachments.clear();
        Ok(without_attachments)
    }

    async fn fetch_attachments(
        &self,
        _token: &str,
        message_id: &str,
    ) -> Result<Vec<EmailAttachment>, MailApiError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(error) = self.pop_failure(message_id) {
            return Err(error);
        }
        let emails = self.emails.read().unwrap_or_else(|e| e.into_inner());
        emails
            .get(message_id)
            .map(|email| email.content.attachments.clone())
            .ok_or_else(|| MailApiError::NotFound(message_id.to_string()))
    }
}

/// Connected-account directory with fixed tokens.
#[derive(Default)]
pub struct StaticMailAccounts {
    tokens: RwLock<HashMap<(String, String), String>>,
}

impl StaticMailAccounts {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connect(&self, tenant: &str, user_id: &str, token: &str) {
        self.tokens
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert((tenant.to_string(), user_id.to_string()), token.to_string());
    }
}

#[async_trait]
impl MailAccounts for StaticMailAccounts {
    async fn access_token(&self, tenant: &str, user_id: &str) -> Result<Option<AccessToken>> {
        Ok(self
            .tokens
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&(tenant.to_string(), user_id.to_string()))
            .map(|token| AccessToken {
                token: token.clone(),
                expires_at: Utc::now() + chrono::Duration::hours(1),
            }))
    }
}

/// Build a canonical email for tests.
pub fn sample_email(
    message_id: &str,
    html: Option<&str>,
    text: Option<&str>,
    attachments: Vec<(&str, &str, Vec<u8>)>,
) -> FetchedEmail {
    FetchedEmail {
        content: EmailContent {
            html: html.map(|s| s.to_string()),
            text: text.map(|s| s.to_string()),
            rtf: None,
            headers: None,
            attachments: attachments
                .into_iter()
                .map(|(id, name, bytes)| EmailAttachment {
                    id: id.to_string(),
                    name: name.to_string(),
                    content_type: "application/octet-stream".to_string(),
                    size: bytes.len() as i64,
                    is_inline: false,
                    content_id: None,
                    content_location: None,
                    bytes,
                })
                .collect(),
        },
        metadata: EmailMetadata {
            message_id: message_id.to_string(),
            subject: Some(format!("Message {message_id}")),
            ..Default::default()
        },
    }
}

/// The whole pipeline on in-memory backends.
pub struct TestHarness {
    pub store: Arc<MemoryJobStore>,
    pub objects: Arc<MemoryObjectStore>,
    pub archiver: Arc<BlobArchiver>,
    pub assignments: Arc<MemoryAssignmentStore>,
    pub accounts: Arc<StaticMailAccounts>,
    pub mail: Arc<ScriptedMailApi>,
    pub hub: JobEventHub,
    pub queue: Arc<JobQueue>,
    pub registry: SharedJobRegistry,
    pub deps: Arc<WorkerDeps>,
    pub retry: RetryConfig,
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}

impl TestHarness {
    pub fn new() -> Self {
        let store = Arc::new(MemoryJobStore::new());
        let store_dyn: Arc<dyn JobStore> = store.clone();
        let objects = Arc::new(MemoryObjectStore::new());
        let archiver = Arc::new(BlobArchiver::new(objects.clone()));
        let assignments = Arc::new(MemoryAssignmentStore::new());
        let accounts = Arc::new(StaticMailAccounts::new());
        let mail = Arc::new(ScriptedMailApi::new());
        let hub = JobEventHub::new();

        // Fast sub-step retries so transient-fault tests stay quick.
        let retry = RetryConfig {
            initial_ms: 10,
            multiplier: 2,
            max_ms: 100,
        };
        let fetcher = Arc::new(MailFetcher::new(
            mail.clone(),
            RateLimitConfig {
                max_requests: 10_000,
                window_ms: 60_000,
                min_spacing_ms: 0,
            },
            retry.clone(),
        ));

        let queue = Arc::new(JobQueue::new(
            store_dyn.clone(),
            hub.clone(),
            build_schemas(),
            QueueDefaults::default(),
        ));

        let deps = Arc::new(WorkerDeps::new(
            store_dyn,
            queue.clone(),
            archiver.clone(),
            fetcher,
            accounts.clone(),
            assignments.clone(),
            default_renderers(),
            24 * 60 * 60 * 1_000,
        ));

        let registry: SharedJobRegistry = Arc::new(build_registry());

        Self {
            store,
            objects,
            archiver,
            assignments,
            accounts,
            mail,
            hub,
            queue,
            registry,
            deps,
            retry,
        }
    }

    pub fn store_dyn(&self) -> Arc<dyn JobStore> {
        self.store.clone()
    }

    /// Claim and execute one job inline, the way the dispatcher would.
    pub async fn execute_next(
        &self,
        worker_id: &str,
        types: &[JobType],
    ) -> Option<(Uuid, JobOutcome)> {
        let job = self
            .queue
            .claim(worker_id, types)
            .await
            .expect("claim should not error")?;
        let job_id = job.id;
        let outcome = run_claimed_job(
            self.store_dyn(),
            self.hub.clone(),
            self.registry.clone(),
            self.deps.clone(),
            &self.retry,
            job,
            CancellationToken::new(),
        )
        .await;
        Some((job_id, outcome))
    }

    /// Execute jobs until the queue is empty. Returns how many ran.
    pub async fn drain(&self, worker_id: &str, types: &[JobType]) -> usize {
        let mut executed = 0;
        while self.execute_next(worker_id, types).await.is_some() {
            executed += 1;
        }
        executed
    }
}
