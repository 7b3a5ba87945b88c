//! Monitoring surface: health scoring, alerts, optional auto-retry.
//!
//! The monitor consumes read-only views (store counters and the pool's
//! health snapshot) and never holds a write-capable pool handle. Alerts
//! live in a bounded ring buffer that evicts oldest-first.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::MonitorConfig;

use super::events::{JobEvent, JobEventHub};
use super::job::{JobStats, JobStatus, JobType};
use super::pool::{PoolHealthSnapshot, PoolState};
use super::store::JobStore;

const HEALTHY_THRESHOLD: f64 = 70.0;
const STATS_WINDOW: chrono::Duration = chrono::Duration::hours(24);
const RETRY_HISTORY_WINDOW: chrono::Duration = chrono::Duration::hours(1);

// ============================================================================
// Alerts
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertSeverity {
    Info,
    Warning,
    Error,
    Critical,
}

#[derive(Debug, Clone, Serialize)]
pub struct Alert {
    pub id: Uuid,
    pub severity: AlertSeverity,
    pub title: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    pub acknowledged: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_type: Option<JobType>,
    pub metadata: serde_json::Value,
}

impl Alert {
    pub fn new(severity: AlertSeverity, title: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            severity,
            title: title.into(),
            message: message.into(),
            timestamp: Utc::now(),
            acknowledged: false,
            job_id: None,
            job_type: None,
            metadata: serde_json::json!({}),
        }
    }

    pub fn for_job(mut self, job_id: Uuid, job_type: JobType) -> Self {
        self.job_id = Some(job_id);
        self.job_type = Some(job_type);
        self
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Bounded ring buffer of alerts; oldest entries evict first.
pub struct AlertRing {
    alerts: Mutex<VecDeque<Alert>>,
    capacity: usize,
}

impl AlertRing {
    pub fn new(capacity: usize) -> Self {
        Self {
            alerts: Mutex::new(VecDeque::with_capacity(capacity.min(1_024))),
            capacity: capacity.max(1),
        }
    }

    pub fn push(&self, alert: Alert) {
        let mut alerts = self.alerts.lock().unwrap_or_else(|e| e.into_inner());
        if alerts.len() >= self.capacity {
            alerts.pop_front();
        }
        alerts.push_back(alert);
    }

    pub fn list(&self) -> Vec<Alert> {
        self.alerts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .cloned()
            .collect()
    }

    pub fn unacknowledged(&self) -> Vec<Alert> {
        self.alerts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|a| !a.acknowledged)
            .cloned()
            .collect()
    }

    pub fn acknowledge(&self, id: Uuid) -> bool {
        let mut alerts = self.alerts.lock().unwrap_or_else(|e| e.into_inner());
        for alert in alerts.iter_mut() {
            if alert.id == id {
                alert.acknowledged = true;
                return true;
            }
        }
        false
    }

    pub fn len(&self) -> usize {
        self.alerts.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ============================================================================
// Health scoring
// ============================================================================

/// One computed health record.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub computed_at: DateTime<Utc>,
    pub workers_score: f64,
    pub queue_score: f64,
    pub processing_score: f64,
    pub overall_score: f64,
    pub healthy: bool,
    pub queued: i64,
    pub running: i64,
    pub stalled: i64,
    pub error_rate_pct: f64,
    pub healthy_workers: usize,
    pub total_workers: usize,
}

fn score_workers(pool: &PoolHealthSnapshot) -> f64 {
    let total = pool.total();
    if total == 0 {
        return 0.0;
    }
    let base = pool.healthy_count() as f64 / total as f64 * 100.0;
    let penalty = pool.stopped_or_error_count() as f64 * 10.0;
    (base - penalty).clamp(0.0, 100.0)
}

fn score_queue(stats: &JobStats, queue_size_threshold: i64, slow_wait_ms: f64) -> f64 {
    let mut score: f64 = 100.0;
    let queued = stats.queued_depth();
    if queued > queue_size_threshold {
        score -= 30.0;
    }
    if stats.avg_wait_ms.map(|w| w > slow_wait_ms).unwrap_or(false) {
        score -= 20.0;
    }
    if queued > 0 && stats.running() == 0 {
        score -= 40.0;
    }
    score.clamp(0.0, 100.0)
}

fn score_processing(stats: &JobStats, error_rate_threshold_pct: f64) -> f64 {
    let mut score: f64 = 100.0;
    if stats.error_rate_pct() > error_rate_threshold_pct {
        score -= 40.0;
    }
    if stats.completed_in_window == 0 && stats.queued_depth() > 0 {
        score -= 30.0;
    }
    score.clamp(0.0, 100.0)
}

// ============================================================================
// Monitor
// ============================================================================

pub struct Monitor {
    store: Arc<dyn JobStore>,
    pool: Arc<PoolState>,
    hub: JobEventHub,
    config: MonitorConfig,
    alerts: Arc<AlertRing>,
    retry_history: Mutex<HashMap<Uuid, Vec<DateTime<Utc>>>>,
}

impl Monitor {
    pub fn new(
        store: Arc<dyn JobStore>,
        pool: Arc<PoolState>,
        hub: JobEventHub,
        config: MonitorConfig,
    ) -> Self {
        let alerts = Arc::new(AlertRing::new(config.max_alerts_history));
        Self {
            store,
            pool,
            hub,
            config,
            alerts,
            retry_history: Mutex::new(HashMap::new()),
        }
    }

    pub fn alerts(&self) -> Arc<AlertRing> {
        self.alerts.clone()
    }

    /// Run the periodic health check until shutdown.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) -> Result<()> {
        info!(
            interval_ms = self.config.health_check_interval_ms,
            auto_retry = self.config.auto_retry_enabled,
            "monitor starting"
        );
        let interval = Duration::from_millis(self.config.health_check_interval_ms);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }

            match self.check_once().await {
                Ok(report) => {
                    debug!(
                        overall = report.overall_score,
                        healthy = report.healthy,
                        queued = report.queued,
                        running = report.running,
                        "health computed"
                    );
                }
                Err(e) => warn!(error = %e, "health check failed"),
            }
        }
        info!("monitor stopped");
        Ok(())
    }

    /// One full monitoring pass: compute health, raise alerts, auto-retry.
    pub async fn check_once(&self) -> Result<HealthReport> {
        let report = self.compute_health().await?;
        self.raise_alerts(&report);
        if self.config.auto_retry_enabled {
            self.auto_retry_sweep().await?;
        }
        Ok(report)
    }

    pub async fn compute_health(&self) -> Result<HealthReport> {
        let since = Utc::now() - STATS_WINDOW;
        let stats = self.store.stats(None, since).await?;
        let pool = self.pool.health_snapshot();

        let workers_score = score_workers(&pool);
        let queue_score = score_queue(
            &stats,
            self.config.queue_size_threshold,
            self.config.slow_job_ms as f64,
        );
        let processing_score = score_processing(&stats, self.config.error_rate_pct);
        let overall_score = (workers_score + queue_score + processing_score) / 3.0;

        Ok(HealthReport {
            computed_at: Utc::now(),
            workers_score,
            queue_score,
            processing_score,
            overall_score,
            healthy: overall_score >= HEALTHY_THRESHOLD,
            queued: stats.queued_depth(),
            running: stats.running(),
            stalled: stats.count(JobStatus::Stalled),
            error_rate_pct: stats.error_rate_pct(),
            healthy_workers: pool.healthy_count(),
            total_workers: pool.total(),
        })
    }

    fn raise_alerts(&self, report: &HealthReport) {
        if report.queued > self.config.queue_size_threshold {
            self.alerts.push(
                Alert::new(
                    AlertSeverity::Warning,
                    "Queue backlog",
                    format!("{} jobs waiting for dispatch", report.queued),
                )
                .with_metadata(serde_json::json!({"queued": report.queued})),
            );
        }
        if report.queued > 0 && report.running == 0 {
            self.alerts.push(Alert::new(
                AlertSeverity::Critical,
                "Queue stalled",
                "jobs are queued but nothing is running",
            ));
        }
        if report.error_rate_pct > self.config.error_rate_pct {
            self.alerts.push(
                Alert::new(
                    AlertSeverity::Error,
                    "High error rate",
                    format!("{:.1}% of recent jobs failed", report.error_rate_pct),
                )
                .with_metadata(serde_json::json!({"error_rate_pct": report.error_rate_pct})),
            );
        }
        if report.stalled > 0 {
            self.alerts.push(
                Alert::new(
                    AlertSeverity::Warning,
                    "Stalled jobs detected",
                    format!("{} jobs stopped making progress", report.stalled),
                )
                .with_metadata(serde_json::json!({"stalled": report.stalled})),
            );
        }
        if report.total_workers > 0 && report.healthy_workers < report.total_workers {
            self.alerts.push(Alert::new(
                AlertSeverity::Error,
                "Unhealthy workers",
                format!(
                    "{} of {} workers unhealthy",
                    report.total_workers - report.healthy_workers,
                    report.total_workers
                ),
            ));
        }
    }

    /// Retry recently failed retryable jobs of the configured kinds, up to
    /// the per-job hourly budget.
    async fn auto_retry_sweep(&self) -> Result<()> {
        let since = Utc::now() - RETRY_HISTORY_WINDOW;
        let candidates = self.store.failed_retryable_since(since, 100).await?;

        for job in candidates {
            if !self
                .config
                .auto_retry_types
                .iter()
                .any(|t| t == job.job_type.as_str())
            {
                continue;
            }

            let allowed = {
                let mut history = self.retry_history.lock().unwrap_or_else(|e| e.into_inner());
                let entries = history.entry(job.id).or_default();
                entries.retain(|at| *at >= since);
                if entries.len() >= self.config.auto_retry_per_job_threshold as usize {
                    false
                } else {
                    entries.push(Utc::now());
                    true
                }
            };
            if !allowed {
                continue;
            }

            if self.store.retry(&job.tenant, job.id).await? {
                info!(job_id = %job.id, job_type = %job.job_type, "auto-retry issued");
                self.alerts.push(
                    Alert::new(
                        AlertSeverity::Info,
                        "Auto-retry issued",
                        format!("job {} re-queued after retryable failure", job.id),
                    )
                    .for_job(job.id, job.job_type),
                );
                self.hub
                    .publish(JobEvent::Retry {
                        job_id: job.id,
                        tenant: job.tenant.clone(),
                        error: job.error.clone(),
                        next_attempt_at: None,
                    })
                    .await;
            }
        }

        // Drop history entries that aged out entirely.
        let mut history = self.retry_history.lock().unwrap_or_else(|e| e.into_inner());
        history.retain(|_, entries| entries.iter().any(|at| *at >= since));
        Ok(())
    }
}
