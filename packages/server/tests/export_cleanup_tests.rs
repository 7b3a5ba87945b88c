//! Export artifacts and storage-cleanup behavior.

use docket_core::common::error::ErrorKind;
use docket_core::kernel::jobs::pool::JobOutcome;
use docket_core::kernel::jobs::{EnqueueOptions, JobStatus, JobStore, JobType};
use docket_core::testing::{sample_email, TestHarness};

const EXPORT: &[JobType] = &[JobType::Export];
const CLEANUP: &[JobType] = &[JobType::StorageCleanup];

async fn archive_fixture(harness: &TestHarness) {
    harness
        .archiver
        .store_email(
            "c1",
            "m1",
            &sample_email("m1", Some("<p>one</p>"), None, vec![("a1", "one.pdf", vec![0u8; 40])]),
        )
        .await
        .unwrap();
    harness
        .archiver
        .store_email("c1", "m2", &sample_email("m2", None, Some("two"), vec![]))
        .await
        .unwrap();
    harness
        .archiver
        .store_email("c2", "m3", &sample_email("m3", Some("<p>three</p>"), None, vec![]))
        .await
        .unwrap();
}

async fn enqueue_export(harness: &TestHarness, format: &str, case_ids: Vec<&str>) -> uuid::Uuid {
    harness
        .queue
        .enqueue(
            "tenant-a",
            JobType::Export,
            serde_json::json!({
                "user_id": "user-1",
                "case_ids": case_ids,
                "format": format,
            }),
            EnqueueOptions::default(),
        )
        .await
        .unwrap()
        .job_id
}

#[tokio::test(start_paused = true)]
async fn json_export_writes_artifact_under_short_lived_key() {
    let harness = TestHarness::new();
    archive_fixture(&harness).await;

    let job_id = enqueue_export(&harness, "json", vec!["c1", "c2"]).await;
    let (_, outcome) = harness.execute_next("w1", EXPORT).await.unwrap();
    assert_eq!(outcome, JobOutcome::Completed);

    let job = harness.store.get("tenant-a", job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    let result = job.result.unwrap();
    let object_key = result.data["objectKey"].as_str().unwrap().to_string();
    assert!(object_key.starts_with("exports/tenant-a/"));
    assert!(object_key.ends_with(".json"));
    assert!(result.data["byteSize"].as_i64().unwrap() > 0);
    assert!(result.data["expiresAt"].is_string());
    assert_eq!(result.data["emails"], 3);

    use docket_core::kernel::archive::ObjectStore as _;
    let bytes = harness.objects.get(&object_key).await.unwrap();
    let artifact: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(artifact["cases"].as_array().unwrap().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn csv_export_renders_one_row_per_email() {
    let harness = TestHarness::new();
    archive_fixture(&harness).await;

    let job_id = enqueue_export(&harness, "csv", vec!["c1"]).await;
    harness.execute_next("w1", EXPORT).await.unwrap();

    let job = harness.store.get("tenant-a", job_id).await.unwrap().unwrap();
    let object_key = job.result.unwrap().data["objectKey"]
        .as_str()
        .unwrap()
        .to_string();

    use docket_core::kernel::archive::ObjectStore as _;
    let text = String::from_utf8(harness.objects.get(&object_key).await.unwrap()).unwrap();
    // Header plus two c1 emails.
    assert_eq!(text.lines().count(), 3);
}

#[tokio::test(start_paused = true)]
async fn pdf_export_without_renderer_fails_validation() {
    let harness = TestHarness::new();
    archive_fixture(&harness).await;

    let job_id = enqueue_export(&harness, "pdf", vec!["c1"]).await;
    let (_, outcome) = harness.execute_next("w1", EXPORT).await.unwrap();
    assert_eq!(outcome, JobOutcome::Failed);

    let job = harness.store.get("tenant-a", job_id).await.unwrap().unwrap();
    let error = job.error.unwrap();
    assert_eq!(error.kind, ErrorKind::Validation);
    assert!(!error.retryable);
}

#[tokio::test(start_paused = true)]
async fn cleanup_dry_run_previews_without_deleting() {
    let harness = TestHarness::new();
    archive_fixture(&harness).await;
    let objects_before = harness.objects.object_count();

    let job_id = harness
        .queue
        .enqueue(
            "tenant-a",
            JobType::StorageCleanup,
            serde_json::json!({
                "user_id": "user-1",
                "target_scope": "c1",
                "cleanup_age_days": 0,
                "dry_run": true,
            }),
            EnqueueOptions::default(),
        )
        .await
        .unwrap()
        .job_id;
    let (_, outcome) = harness.execute_next("w1", CLEANUP).await.unwrap();
    assert_eq!(outcome, JobOutcome::Completed);

    let job = harness.store.get("tenant-a", job_id).await.unwrap().unwrap();
    let result = job.result.unwrap();
    assert_eq!(result.data["dryRun"], true);
    assert_eq!(result.data["examined"], 2);
    assert_eq!(result.data["candidates"].as_array().unwrap().len(), 2);
    assert_eq!(result.data["deletedObjects"], 0);
    assert_eq!(harness.objects.object_count(), objects_before);
}

#[tokio::test(start_paused = true)]
async fn cleanup_deletes_aged_archives_for_one_case() {
    let harness = TestHarness::new();
    archive_fixture(&harness).await;

    harness
        .queue
        .enqueue(
            "tenant-a",
            JobType::StorageCleanup,
            serde_json::json!({
                "user_id": "user-1",
                "target_scope": "c1",
                "cleanup_age_days": 0,
            }),
            EnqueueOptions::default(),
        )
        .await
        .unwrap();
    harness.execute_next("w1", CLEANUP).await.unwrap();

    // c1 emptied, c2 untouched.
    let c1 = harness.archiver.stats_for_case("c1").await.unwrap();
    assert_eq!(c1.total_emails, 0);
    let c2 = harness.archiver.stats_for_case("c2").await.unwrap();
    assert_eq!(c2.total_emails, 1);
}

#[tokio::test(start_paused = true)]
async fn cleanup_all_iterates_every_case() {
    let harness = TestHarness::new();
    archive_fixture(&harness).await;

    let job_id = harness
        .queue
        .enqueue(
            "tenant-a",
            JobType::StorageCleanup,
            serde_json::json!({
                "user_id": "user-1",
                "target_scope": "all",
                "cleanup_age_days": 0,
            }),
            EnqueueOptions::default(),
        )
        .await
        .unwrap()
        .job_id;
    harness.execute_next("w1", CLEANUP).await.unwrap();

    let job = harness.store.get("tenant-a", job_id).await.unwrap().unwrap();
    assert_eq!(job.result.unwrap().data["examined"], 3);
    assert_eq!(harness.objects.object_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn recent_archives_survive_age_threshold() {
    let harness = TestHarness::new();
    archive_fixture(&harness).await;
    let objects_before = harness.objects.object_count();

    harness
        .queue
        .enqueue(
            "tenant-a",
            JobType::StorageCleanup,
            serde_json::json!({
                "user_id": "user-1",
                "target_scope": "all",
                "cleanup_age_days": 30,
            }),
            EnqueueOptions::default(),
        )
        .await
        .unwrap();
    harness.execute_next("w1", CLEANUP).await.unwrap();

    assert_eq!(harness.objects.object_count(), objects_before);
}
