//! Worker pool behavior: dispatch, concurrency, cancel listener, shutdown.

use std::sync::Arc;
use std::time::Duration;

use docket_core::config::PoolConfig;
use docket_core::kernel::jobs::{
    EnqueueOptions, JobStatus, JobStore, JobType, WorkerDescriptor, WorkerPool, WorkerStatus,
};
use docket_core::testing::{sample_email, TestHarness};
use tokio_util::sync::CancellationToken;

fn pool_config() -> PoolConfig {
    PoolConfig {
        max_concurrency: 4,
        health_check_interval_ms: 500,
        max_restart_attempts: 3,
        heartbeat_interval_ms: 500,
        idle_poll_ms: 100,
        busy_backoff_ms: 50,
        drain_timeout_ms: 5_000,
    }
}

fn build_pool(harness: &TestHarness, descriptors: Vec<WorkerDescriptor>) -> Arc<WorkerPool> {
    Arc::new(WorkerPool::new(
        harness.queue.clone(),
        harness.registry.clone(),
        harness.deps.clone(),
        harness.retry.clone(),
        pool_config(),
        descriptors,
    ))
}

async fn wait_for_status(
    harness: &TestHarness,
    job_id: uuid::Uuid,
    status: JobStatus,
) -> bool {
    for _ in 0..200 {
        let job = harness.store.get("tenant-a", job_id).await.unwrap().unwrap();
        if job.status == status {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}

#[tokio::test(start_paused = true)]
async fn pool_dispatches_enqueued_jobs_to_completion() {
    let harness = TestHarness::new();
    harness.accounts.connect("tenant-a", "user-1", "token-1");
    harness
        .mail
        .insert_email(sample_email("m1", Some("<p>hi</p>"), None, vec![]));

    let archival = harness
        .queue
        .enqueue(
            "tenant-a",
            JobType::EmailArchival,
            serde_json::json!({"user_id": "user-1", "message_id": "m1", "case_id": "c1"}),
            EnqueueOptions::default(),
        )
        .await
        .unwrap()
        .job_id;
    let maintenance = harness
        .queue
        .enqueue(
            "tenant-a",
            JobType::Maintenance,
            serde_json::json!({}),
            EnqueueOptions::default(),
        )
        .await
        .unwrap()
        .job_id;

    let pool = build_pool(
        &harness,
        vec![
            WorkerDescriptor::new("archival-w", vec![JobType::EmailArchival]),
            WorkerDescriptor::new("utility-w", vec![JobType::Maintenance]),
        ],
    );
    let state = pool.state();
    let shutdown = CancellationToken::new();
    let pool_task = tokio::spawn(pool.run(shutdown.clone()));

    assert!(wait_for_status(&harness, archival, JobStatus::Completed).await);
    assert!(wait_for_status(&harness, maintenance, JobStatus::Completed).await);

    let snapshot = state.health_snapshot();
    assert_eq!(snapshot.total(), 2);
    assert_eq!(snapshot.healthy_count(), 2);

    shutdown.cancel();
    pool_task.await.unwrap().unwrap();

    let snapshot = state.health_snapshot();
    assert!(snapshot
        .workers
        .iter()
        .all(|w| w.status == WorkerStatus::Stopped));
}

#[tokio::test(start_paused = true)]
async fn disabled_workers_do_not_claim() {
    let harness = TestHarness::new();
    let job_id = harness
        .queue
        .enqueue(
            "tenant-a",
            JobType::Maintenance,
            serde_json::json!({}),
            EnqueueOptions::default(),
        )
        .await
        .unwrap()
        .job_id;

    let mut descriptor = WorkerDescriptor::new("off-w", vec![JobType::Maintenance]);
    descriptor.enabled = false;
    let pool = build_pool(&harness, vec![descriptor]);
    let shutdown = CancellationToken::new();
    let pool_task = tokio::spawn(pool.run(shutdown.clone()));

    tokio::time::sleep(Duration::from_secs(2)).await;
    let job = harness.store.get("tenant-a", job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Queued);

    shutdown.cancel();
    pool_task.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn pool_cancel_listener_stops_running_job() {
    let harness = TestHarness::new();
    // 100 emails in batches of 10: long enough to cancel mid-flight.
    let ids: Vec<String> = (1..=100).map(|i| format!("e{i}")).collect();
    let job_id = harness
        .queue
        .enqueue(
            "tenant-a",
            JobType::BulkAssignment,
            serde_json::json!({
                "user_id": "user-1",
                "email_ids": ids,
                "case_id": "c1",
                "batch_size": 10,
            }),
            EnqueueOptions::default(),
        )
        .await
        .unwrap()
        .job_id;

    let pool = build_pool(
        &harness,
        vec![WorkerDescriptor::new("bulk-w", vec![JobType::BulkAssignment])],
    );
    let shutdown = CancellationToken::new();
    let pool_task = tokio::spawn(pool.run(shutdown.clone()));

    assert!(wait_for_status(&harness, job_id, JobStatus::Running).await);
    // Let a few batches land, then cancel through the queue surface.
    tokio::time::sleep(Duration::from_millis(2_500)).await;
    assert!(harness.queue.cancel("tenant-a", job_id).await.unwrap());

    assert!(wait_for_status(&harness, job_id, JobStatus::Cancelled).await);
    let assigned = harness.assignments.len();
    assert!(assigned < 100, "assigned={assigned}");

    shutdown.cancel();
    pool_task.await.unwrap().unwrap();

    // No further batches after shutdown either.
    assert_eq!(harness.assignments.len(), assigned);
}

#[tokio::test(start_paused = true)]
async fn graceful_shutdown_lets_in_flight_jobs_finish() {
    let harness = TestHarness::new();
    harness.accounts.connect("tenant-a", "user-1", "token-1");
    harness
        .mail
        .insert_email(sample_email("m1", Some("<p>hi</p>"), None, vec![]));
    let job_id = harness
        .queue
        .enqueue(
            "tenant-a",
            JobType::EmailArchival,
            serde_json::json!({"user_id": "user-1", "message_id": "m1", "case_id": "c1"}),
            EnqueueOptions::default(),
        )
        .await
        .unwrap()
        .job_id;

    let pool = build_pool(
        &harness,
        vec![WorkerDescriptor::new("archival-w", vec![JobType::EmailArchival])],
    );
    let shutdown = CancellationToken::new();
    let pool_task = tokio::spawn(pool.run(shutdown.clone()));

    assert!(wait_for_status(&harness, job_id, JobStatus::Running).await || {
        // Fast handlers may already be done by the first poll.
        let job = harness.store.get("tenant-a", job_id).await.unwrap().unwrap();
        job.status == JobStatus::Completed
    });
    shutdown.cancel();
    pool_task.await.unwrap().unwrap();

    let job = harness.store.get("tenant-a", job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Completed);
}
