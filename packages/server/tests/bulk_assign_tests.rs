//! Bulk-assignment scenarios: batching, skips, sibling archival jobs,
//! cancellation mid-flight.

use docket_core::domains::emails::{AssignmentStore, EmailAssignment};
use docket_core::kernel::jobs::pool::{run_claimed_job, JobOutcome};
use docket_core::kernel::jobs::{EnqueueOptions, JobEvent, JobFilter, JobStatus, JobStore, JobType};
use docket_core::testing::TestHarness;
use tokio_util::sync::CancellationToken;

const BULK: &[JobType] = &[JobType::BulkAssignment];

fn email_ids(n: usize) -> Vec<String> {
    (1..=n).map(|i| format!("e{i}")).collect()
}

async fn enqueue_bulk(
    harness: &TestHarness,
    ids: &[String],
    case_id: &str,
    batch_size: usize,
) -> uuid::Uuid {
    harness
        .queue
        .enqueue(
            "tenant-a",
            JobType::BulkAssignment,
            serde_json::json!({
                "user_id": "user-1",
                "email_ids": ids,
                "case_id": case_id,
                "batch_size": batch_size,
            }),
            EnqueueOptions::default(),
        )
        .await
        .expect("enqueue")
        .job_id
}

async fn archival_job_count(harness: &TestHarness) -> i64 {
    harness
        .store
        .query(
            "tenant-a",
            &JobFilter {
                job_types: vec![JobType::EmailArchival],
                ..Default::default()
            },
            &docket_core::common::pagination::Page::first(200),
        )
        .await
        .unwrap()
        .total
}

#[tokio::test(start_paused = true)]
async fn bulk_assignment_skips_existing_and_enqueues_archival() {
    let harness = TestHarness::new();
    // e1..e3 already assigned to c9.
    for email in ["e1", "e2", "e3"] {
        harness
            .assignments
            .insert(EmailAssignment::new("tenant-a", email, "c9", None))
            .await
            .unwrap();
    }

    let ids = email_ids(10);
    let job_id = enqueue_bulk(&harness, &ids, "c9", 3).await;
    let mut events = harness.hub.subscribe_job(job_id).await;

    let (_, outcome) = harness.execute_next("w1", BULK).await.unwrap();
    assert_eq!(outcome, JobOutcome::Completed);

    let job = harness.store.get("tenant-a", job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    let result = job.result.unwrap();
    assert_eq!(result.data["total"], 10);
    assert_eq!(result.data["success"], 10);
    assert_eq!(result.data["error"], 0);
    assert!(result.warnings.is_empty());

    // Assignments exist for all ten, but only e4..e10 were inserted now.
    assert_eq!(harness.assignments.len(), 10);
    assert_eq!(archival_job_count(&harness).await, 7);

    // Progress at each batch boundary: 30/60/90/100.
    let mut percentages = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let JobEvent::Progress { progress, .. } = event {
            percentages.push(progress.percentage);
        }
    }
    assert_eq!(percentages, vec![30, 60, 90, 100]);
}

#[tokio::test(start_paused = true)]
async fn rerun_after_partial_execution_is_idempotent() {
    let harness = TestHarness::new();
    let ids = email_ids(6);
    enqueue_bulk(&harness, &ids, "c1", 2).await;
    harness.execute_next("w1", BULK).await.unwrap();
    assert_eq!(harness.assignments.len(), 6);
    let archival_after_first = archival_job_count(&harness).await;

    // Re-running the same set assigns nothing new and, with the archival
    // jobs still live, dedupes the siblings too.
    enqueue_bulk(&harness, &ids, "c1", 2).await;
    harness.execute_next("w1", BULK).await.unwrap();
    assert_eq!(harness.assignments.len(), 6);
    assert_eq!(archival_job_count(&harness).await, archival_after_first);
}

#[tokio::test(start_paused = true)]
async fn cancellation_lands_within_one_batch() {
    let harness = TestHarness::new();
    let ids = email_ids(100);
    let job_id = enqueue_bulk(&harness, &ids, "c1", 10).await;

    let claimed = harness.queue.claim("w1", BULK).await.unwrap().unwrap();
    let token = CancellationToken::new();
    let mut events = harness.hub.subscribe_job(job_id).await;

    let store = harness.store_dyn();
    let hub = harness.hub.clone();
    let registry = harness.registry.clone();
    let deps = harness.deps.clone();
    let retry = harness.retry.clone();
    let exec_token = token.clone();
    let task = tokio::spawn(async move {
        run_claimed_job(store, hub, registry, deps, &retry, claimed, exec_token).await
    });

    // Wait for the third batch boundary (30 of 100 processed).
    loop {
        match events.recv().await.expect("event stream open") {
            JobEvent::Progress { progress, .. } if progress.processed_items >= 30 => break,
            _ => {}
        }
    }

    // Cancel: store transition plus the dispatcher-owned token, the same
    // pair the pool's cancel listener applies.
    assert!(harness.queue.cancel("tenant-a", job_id).await.unwrap());
    token.cancel();

    let outcome = task.await.unwrap();
    assert_eq!(outcome, JobOutcome::Cancelled);

    let job = harness.store.get("tenant-a", job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Cancelled);
    assert!(job.cancelled_at.is_some());
    assert!(job.result.is_none());

    // Partial state preserved; nothing from batches after the cancel.
    let assigned = harness.assignments.len();
    assert!(assigned >= 30 && assigned < 100, "assigned={assigned}");
    assert_eq!(archival_job_count(&harness).await, assigned as i64);
}
