//! Queue- and dispatcher-level lifecycle semantics.

use std::sync::Arc;
use std::time::Duration;

use docket_core::common::error::ErrorKind;
use docket_core::domains::emails::MaintenanceCommand;
use docket_core::kernel::jobs::pool::{run_claimed_job, JobOutcome};
use docket_core::kernel::jobs::{
    BulkAction, EnqueueOptions, JobPriority, JobRegistry, JobResult, JobStatus, JobStore, JobType,
    SharedJobRegistry,
};
use docket_core::testing::TestHarness;
use tokio_util::sync::CancellationToken;

const MAINTENANCE: &[JobType] = &[JobType::Maintenance];

async fn enqueue_maintenance(harness: &TestHarness, options: EnqueueOptions) -> uuid::Uuid {
    harness
        .queue
        .enqueue(
            "tenant-a",
            JobType::Maintenance,
            serde_json::json!({}),
            options,
        )
        .await
        .expect("enqueue")
        .job_id
}

#[tokio::test(start_paused = true)]
async fn priority_preempts_fifo_across_priorities() {
    let harness = TestHarness::new();
    let normal = enqueue_maintenance(&harness, EnqueueOptions::default()).await;
    tokio::time::sleep(Duration::from_millis(5)).await;
    let urgent = enqueue_maintenance(
        &harness,
        EnqueueOptions {
            priority: Some(JobPriority::Urgent),
            ..Default::default()
        },
    )
    .await;

    let first = harness.queue.claim("w1", MAINTENANCE).await.unwrap().unwrap();
    assert_eq!(first.id, urgent);
    let second = harness.queue.claim("w1", MAINTENANCE).await.unwrap().unwrap();
    assert_eq!(second.id, normal);
}

#[tokio::test(start_paused = true)]
async fn fifo_within_same_priority() {
    let harness = TestHarness::new();
    let older = enqueue_maintenance(&harness, EnqueueOptions::default()).await;
    tokio::time::sleep(Duration::from_millis(5)).await;
    enqueue_maintenance(&harness, EnqueueOptions::default()).await;

    let first = harness.queue.claim("w1", MAINTENANCE).await.unwrap().unwrap();
    assert_eq!(first.id, older);
}

// Real time: promotion compares the wall-clock schedule.
#[tokio::test]
async fn scheduled_job_promotes_once_due() {
    let harness = TestHarness::new();
    let job_id = enqueue_maintenance(
        &harness,
        EnqueueOptions {
            scheduled_for: Some(chrono::Utc::now() + chrono::Duration::milliseconds(80)),
            ..Default::default()
        },
    )
    .await;

    let job = harness.store.get("tenant-a", job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Pending);
    assert!(harness.queue.claim("w1", MAINTENANCE).await.unwrap().is_none());

    tokio::time::sleep(Duration::from_millis(150)).await;
    let claimed = harness.queue.claim("w1", MAINTENANCE).await.unwrap().unwrap();
    assert_eq!(claimed.id, job_id);
}

fn slow_registry() -> SharedJobRegistry {
    let mut registry = JobRegistry::new();
    registry.register::<MaintenanceCommand, _, _>(JobType::Maintenance, |_cmd, _ctx| async move {
        tokio::time::sleep(Duration::from_secs(3_600)).await;
        Ok(JobResult::default())
    });
    Arc::new(registry)
}

fn panicking_registry() -> SharedJobRegistry {
    let mut registry = JobRegistry::new();
    registry.register::<MaintenanceCommand, _, _>(JobType::Maintenance, |_cmd, _ctx| async move {
        panic!("handler blew up")
    });
    Arc::new(registry)
}

#[tokio::test(start_paused = true)]
async fn timeout_is_enforced_by_the_dispatcher() {
    let harness = TestHarness::new();
    let job_id = enqueue_maintenance(
        &harness,
        EnqueueOptions {
            timeout_ms: Some(100),
            max_retries: Some(0),
            ..Default::default()
        },
    )
    .await;

    let claimed = harness.queue.claim("w1", MAINTENANCE).await.unwrap().unwrap();
    let outcome = run_claimed_job(
        harness.store_dyn(),
        harness.hub.clone(),
        slow_registry(),
        harness.deps.clone(),
        &harness.retry,
        claimed,
        CancellationToken::new(),
    )
    .await;
    assert_eq!(outcome, JobOutcome::Failed);

    let job = harness.store.get("tenant-a", job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    let error = job.error.unwrap();
    assert_eq!(error.kind, ErrorKind::Timeout);
    assert!(error.retryable);
}

#[tokio::test(start_paused = true)]
async fn timed_out_job_requeues_while_attempts_remain() {
    let harness = TestHarness::new();
    let job_id = enqueue_maintenance(
        &harness,
        EnqueueOptions {
            timeout_ms: Some(100),
            ..Default::default()
        },
    )
    .await;

    let claimed = harness.queue.claim("w1", MAINTENANCE).await.unwrap().unwrap();
    let outcome = run_claimed_job(
        harness.store_dyn(),
        harness.hub.clone(),
        slow_registry(),
        harness.deps.clone(),
        &harness.retry,
        claimed,
        CancellationToken::new(),
    )
    .await;
    assert_eq!(outcome, JobOutcome::Retried);

    let job = harness.store.get("tenant-a", job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Retry);
}

#[tokio::test(start_paused = true)]
async fn handler_panic_maps_to_retryable_processing_error() {
    let harness = TestHarness::new();
    let job_id = enqueue_maintenance(
        &harness,
        EnqueueOptions {
            max_retries: Some(0),
            ..Default::default()
        },
    )
    .await;

    let claimed = harness.queue.claim("w1", MAINTENANCE).await.unwrap().unwrap();
    let outcome = run_claimed_job(
        harness.store_dyn(),
        harness.hub.clone(),
        panicking_registry(),
        harness.deps.clone(),
        &harness.retry,
        claimed,
        CancellationToken::new(),
    )
    .await;
    assert_eq!(outcome, JobOutcome::Failed);

    let job = harness.store.get("tenant-a", job_id).await.unwrap().unwrap();
    let error = job.error.unwrap();
    assert_eq!(error.kind, ErrorKind::Processing);
    assert!(error.retryable);
}

#[tokio::test(start_paused = true)]
async fn cancel_on_queued_job_is_instant() {
    let harness = TestHarness::new();
    let job_id = enqueue_maintenance(&harness, EnqueueOptions::default()).await;

    assert!(harness.queue.cancel("tenant-a", job_id).await.unwrap());
    let job = harness.store.get("tenant-a", job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Cancelled);

    assert!(harness.queue.claim("w1", MAINTENANCE).await.unwrap().is_none());
    // Cancelling a terminal job is a no-op.
    assert!(!harness.queue.cancel("tenant-a", job_id).await.unwrap());
}

#[tokio::test(start_paused = true)]
async fn operator_retry_restores_failed_job_to_queued() {
    let harness = TestHarness::new();
    let job_id = enqueue_maintenance(
        &harness,
        EnqueueOptions {
            timeout_ms: Some(50),
            max_retries: Some(0),
            ..Default::default()
        },
    )
    .await;
    let claimed = harness.queue.claim("w1", MAINTENANCE).await.unwrap().unwrap();
    run_claimed_job(
        harness.store_dyn(),
        harness.hub.clone(),
        slow_registry(),
        harness.deps.clone(),
        &harness.retry,
        claimed,
        CancellationToken::new(),
    )
    .await;

    assert!(harness.queue.retry("tenant-a", job_id).await.unwrap());
    let job = harness.store.get("tenant-a", job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Queued);
    assert!(job.worker_id.is_none());
    assert!(job.error.is_none());
    assert!(job.progress.is_none());
}

#[tokio::test(start_paused = true)]
async fn bulk_cancel_applies_per_row() {
    let harness = TestHarness::new();
    let a = enqueue_maintenance(&harness, EnqueueOptions::default()).await;
    let b = enqueue_maintenance(&harness, EnqueueOptions::default()).await;
    harness.execute_next("w1", MAINTENANCE).await.unwrap();

    let outcome = harness
        .queue
        .bulk("tenant-a", &[a, b], BulkAction::Cancel)
        .await
        .unwrap();
    // One of the two already completed; only the other cancels.
    assert_eq!(outcome.applied.len(), 1);
    assert_eq!(outcome.skipped.len(), 1);
}

// Real time: retry backoffs gate claims on the wall clock.
#[tokio::test]
async fn attempts_track_started_transitions() {
    let harness = TestHarness::new();
    let job_id = enqueue_maintenance(
        &harness,
        EnqueueOptions {
            timeout_ms: Some(50),
            max_retries: Some(2),
            ..Default::default()
        },
    )
    .await;

    let registry = slow_registry();
    let mut attempts_seen = 0;
    for _ in 0..50 {
        tokio::time::sleep(Duration::from_millis(50)).await;
        let Some(claimed) = harness.queue.claim("w1", MAINTENANCE).await.unwrap() else {
            continue;
        };
        attempts_seen += 1;
        let outcome = run_claimed_job(
            harness.store_dyn(),
            harness.hub.clone(),
            registry.clone(),
            harness.deps.clone(),
            &harness.retry,
            claimed,
            CancellationToken::new(),
        )
        .await;
        if outcome == JobOutcome::Failed {
            break;
        }
    }

    let job = harness.store.get("tenant-a", job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    // max_retries = 2 allows three started transitions in total.
    assert_eq!(job.attempts, 3);
    assert_eq!(attempts_seen, 3);
}

#[tokio::test(start_paused = true)]
async fn tenants_cannot_see_each_other() {
    let harness = TestHarness::new();
    let job_id = enqueue_maintenance(&harness, EnqueueOptions::default()).await;

    assert!(harness.store.get("tenant-b", job_id).await.unwrap().is_none());
    assert!(!harness.queue.cancel("tenant-b", job_id).await.unwrap());
    assert!(!harness.store.delete("tenant-b", job_id).await.unwrap());

    // Still intact for its owner.
    assert!(harness.store.get("tenant-a", job_id).await.unwrap().is_some());
}
