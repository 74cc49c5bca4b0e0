
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use raster_worker::config::WorkerConfig;
use raster_worker::lease::{FailureKind, Job, LeaseClient};
use raster_worker::worker::{JobResolution, JobSupervisor, SupervisorState};
use test_harness::{geotiff_bytes, test_config, MockQueue};

fn supervisor_with(config: WorkerConfig) -> (JobSupervisor, LeaseClient) {
    let client = LeaseClient::new(&config).unwrap();
    (
        JobSupervisor::new(Arc::new(config), client.clone()),
        client,
    )
}

async fn claim(client: &LeaseClient) -> Job {
    client.claim("test-worker").await.unwrap().unwrap()
}

fn workspace_count(temp: &Path) -> usize {
    std::fs::read_dir(temp).unwrap().count()
}

fn fail_body(queue: &MockQueue, job_id: &str) -> Value {
    let fails: Vec<_> = queue
        .calls_to("fail")
        .into_iter()
        .filter(|c| c.job_id.as_deref() == Some(job_id))
        .collect();
    assert_eq!(fails.len(), 1, "exactly one fail call expected");
    fails[0].body["error"].clone()
}

async fn run_j1(payload: Value) -> (MockQueue, JobResolution, tempfile::TempDir) {
    let queue = MockQueue::start().await;
    queue.push_job("J1", "geotiff_to_png", payload);
    queue.add_input("J1", "scene.tif", geotiff_bytes(100, 100));

    let temp = tempfile::tempdir().unwrap();
    let (supervisor, client) = supervisor_with(test_config(&queue.base_url, temp.path()));
    let job = claim(&client).await;
    let resolution = supervisor.supervise(job, CancellationToken::new()).await;
    (queue, resolution, temp)
}

#[tokio::test]
async fn test_job_completes_with_artifacts() {
    let (queue, resolution, temp) = run_j1(json!({
        "maxSize": 50,
        "generateThumbnails": false,
        "includeStatistics": false,
    }))
    .await;

    assert!(resolution.is_completed(), "failure: {:?}", resolution.failure);
    assert!(resolution.delivered);
    assert_eq!(resolution.artifact_keys.len(), 3);
    for key in &resolution.artifact_keys {
        assert!(key.starts_with("geo-jobs/J1/output/"), "key {}", key);
    }

    assert_eq!(queue.count("complete", "J1"), 1);
    assert_eq!(queue.count("fail", "J1"), 0);
    assert_eq!(queue.uploads().len(), 3);

    let complete = &queue.calls_to("complete")[0].body;
    assert_eq!(complete["outputKeys"].as_array().unwrap().len(), 3);
    let payload = &complete["outputPayload"];
    assert_eq!(payload["taskType"], "geotiff_to_png");
    assert_eq!(payload["workerId"], "test-worker");
    assert_eq!(payload["summary"]["totalInputFiles"], 1);
    assert_eq!(payload["summary"]["successfullyProcessed"], 1);
    assert_eq!(payload["summary"]["totalOutputFiles"], 3);
    assert_eq!(payload["inputValidation"][0]["fileName"], "scene.tif");

    let uploaded_png = queue
        .uploads()
        .into_iter()
        .find(|(key, _)| key.ends_with("-scene.png"))
        .map(|(_, bytes)| bytes)
        .unwrap();
    assert_eq!(&uploaded_png[1..4], b"PNG");

    assert_eq!(workspace_count(temp.path()), 0, "workspace removed");
}

#[tokio::test]
async fn test_statistics_do_not_add_artifacts() {
    let (queue, resolution, _temp) = run_j1(json!({
        "maxSize": 50,
        "generateThumbnails": false,
        "includeStatistics": true,
    }))
    .await;

    assert!(resolution.is_completed());
    assert_eq!(resolution.artifact_keys.len(), 3);
    let metadata = queue
        .uploads()
        .into_iter()
        .find(|(key, _)| key.ends_with("-scene_metadata.json"))
        .map(|(_, bytes)| serde_json::from_slice::<Value>(&bytes).unwrap())
        .unwrap();
    assert_eq!(metadata["statistics"]["sample_size"], 10_000);
}

#[tokio::test]
async fn test_progress_reported_in_order() {
    let (queue, resolution, _temp) = run_j1(json!({"maxSize": 50})).await;

    assert!(resolution.is_completed());
    let percents: Vec<u64> = queue
        .calls_to("progress")
        .iter()
        .map(|c| c.body["progress"].as_u64().unwrap())
        .collect();
    assert_eq!(percents, vec![10, 30, 70, 90]);
}

#[tokio::test]
async fn test_zero_byte_input_fails_job() {
    let queue = MockQueue::start().await;
    queue.push_job("J2", "geotiff_to_png", json!({}));
    queue.add_input("J2", "empty.tif", Vec::new());

    let temp = tempfile::tempdir().unwrap();
    let (supervisor, client) = supervisor_with(test_config(&queue.base_url, temp.path()));
    let job = claim(&client).await;
    let resolution = supervisor.supervise(job, CancellationToken::new()).await;

    assert_eq!(resolution.state, SupervisorState::Failed);
    assert_eq!(
        resolution.failure.as_ref().map(|f| f.kind),
        Some(FailureKind::NoValidInputFiles)
    );
    assert_eq!(queue.count("complete", "J2"), 0);

    let error = fail_body(&queue, "J2");
    assert_eq!(error["kind"], "no_valid_input_files");
    assert_eq!(error["state"], "staging");
    assert_eq!(error["workerId"], "test-worker");
    assert!(queue.uploads().is_empty());
    assert_eq!(workspace_count(temp.path()), 0, "workspace removed");
}

#[tokio::test]
async fn test_no_heartbeat_after_terminal_call() {
    let queue = MockQueue::start().await;
    queue.push_job("J1", "geotiff_to_png", json!({"maxSize": 50}));
    queue.add_input("J1", "scene.tif", geotiff_bytes(100, 100));
    // Long enough for several heartbeats
    queue.set_file_delay(Duration::from_millis(300));

    let temp = tempfile::tempdir().unwrap();
    let (supervisor, client) = supervisor_with(test_config(&queue.base_url, temp.path()));
    let job = claim(&client).await;
    let resolution = supervisor.supervise(job, CancellationToken::new()).await;
    assert!(resolution.is_completed());
    assert!(resolution.heartbeats.sent >= 2);

    tokio::time::sleep(Duration::from_millis(200)).await;

    let terminal_at = queue.calls_to("complete")[0].at;
    let beats = queue.calls_to("heartbeat");
    assert_eq!(beats.len() as u32, resolution.heartbeats.sent);
    assert!(beats.iter().all(|b| b.at < terminal_at));
}

#[tokio::test]
async fn test_unsupported_task_type_fails_without_heartbeat() {
    let queue = MockQueue::start().await;
    queue.push_job("J9", "shapefile_merge", json!({}));

    let temp = tempfile::tempdir().unwrap();
    let (supervisor, client) = supervisor_with(test_config(&queue.base_url, temp.path()));
    let job = claim(&client).await;
    let resolution = supervisor.supervise(job, CancellationToken::new()).await;

    assert_eq!(
        resolution.failure.map(|f| f.kind),
        Some(FailureKind::UnsupportedTaskType)
    );
    let error = fail_body(&queue, "J9");
    assert_eq!(error["kind"], "unsupported_task_type");
    assert_eq!(error["state"], "claimed");
    assert!(queue.calls_to("heartbeat").is_empty());
    assert!(queue.calls_to("input").is_empty());
    assert_eq!(workspace_count(temp.path()), 0);
}

#[tokio::test]
async fn test_invalid_payload_fails_job() {
    let queue = MockQueue::start().await;
    queue.push_job("J1", "geotiff_to_png", json!({"maxSize": 0}));

    let temp = tempfile::tempdir().unwrap();
    let (supervisor, client) = supervisor_with(test_config(&queue.base_url, temp.path()));
    let job = claim(&client).await;
    let resolution = supervisor.supervise(job, CancellationToken::new()).await;

    assert_eq!(
        resolution.failure.map(|f| f.kind),
        Some(FailureKind::InvalidPayload)
    );
    assert_eq!(fail_body(&queue, "J1")["kind"], "invalid_payload");
}

#[tokio::test]
async fn test_deadline_exceeded() {
    let queue = MockQueue::start().await;
    queue.push_job("J1", "geotiff_to_png", json!({}));
    queue.add_input("J1", "scene.tif", geotiff_bytes(10, 10));
    queue.set_file_delay(Duration::from_secs(3));

    let temp = tempfile::tempdir().unwrap();
    let config = WorkerConfig {
        max_processing_time_ms: 200,
        ..test_config(&queue.base_url, temp.path())
    };
    let (supervisor, client) = supervisor_with(config);
    let job = claim(&client).await;

    let resolution = tokio::time::timeout(
        Duration::from_secs(2),
        supervisor.supervise(job, CancellationToken::new()),
    )
    .await
    .expect("supervisor should give up at the deadline");

    assert_eq!(
        resolution.failure.map(|f| f.kind),
        Some(FailureKind::DeadlineExceeded)
    );
    assert_eq!(fail_body(&queue, "J1")["state"], "staging");
    assert_eq!(queue.count("complete", "J1"), 0);
    assert_eq!(workspace_count(temp.path()), 0);
}

#[tokio::test]
async fn test_lease_lost_when_heartbeats_rejected() {
    let queue = MockQueue::start().await;
    queue.push_job("J1", "geotiff_to_png", json!({}));
    queue.add_input("J1", "scene.tif", geotiff_bytes(10, 10));
    queue.set_file_delay(Duration::from_secs(3));
    queue.set_heartbeat_status(409);

    let temp = tempfile::tempdir().unwrap();
    let config = WorkerConfig {
        heartbeat_interval_ms: 50,
        lease_timeout_ms: 150,
        ..test_config(&queue.base_url, temp.path())
    };
    let (supervisor, client) = supervisor_with(config);
    let job = claim(&client).await;

    let resolution = tokio::time::timeout(
        Duration::from_secs(2),
        supervisor.supervise(job, CancellationToken::new()),
    )
    .await
    .expect("lease loss should stop the job");

    assert!(resolution.heartbeats.lease_lost);
    assert_eq!(resolution.heartbeats.sent, 0);
    assert_eq!(
        resolution.failure.map(|f| f.kind),
        Some(FailureKind::LeaseLost)
    );
    assert_eq!(fail_body(&queue, "J1")["kind"], "lease_lost");
}

#[tokio::test]
async fn test_crashed_heartbeat_task_counts_as_lease_lost() {
    let queue = MockQueue::start().await;
    queue.push_job("J1", "geotiff_to_png", json!({}));
    queue.add_input("J1", "scene.tif", geotiff_bytes(10, 10));
    queue.set_file_delay(Duration::from_secs(1));

    // A zero period makes the heartbeat ticker panic on its first poll
    let temp = tempfile::tempdir().unwrap();
    let config = WorkerConfig {
        heartbeat_interval_ms: 0,
        ..test_config(&queue.base_url, temp.path())
    };
    let (supervisor, client) = supervisor_with(config);
    let job = claim(&client).await;

    let resolution = tokio::time::timeout(
        Duration::from_secs(5),
        supervisor.supervise(job, CancellationToken::new()),
    )
    .await
    .expect("a dead heartbeat should stop the job");

    assert!(resolution.heartbeats.lease_lost);
    assert_eq!(
        resolution.failure.map(|f| f.kind),
        Some(FailureKind::LeaseLost)
    );
    assert_eq!(queue.count("complete", "J1"), 0);
    assert_eq!(fail_body(&queue, "J1")["kind"], "lease_lost");
    assert_eq!(workspace_count(temp.path()), 0);
}

#[tokio::test]
async fn test_shutdown_cancels_job() {
    let queue = MockQueue::start().await;
    queue.push_job("J1", "geotiff_to_png", json!({}));
    queue.add_input("J1", "scene.tif", geotiff_bytes(10, 10));
    queue.set_file_delay(Duration::from_secs(3));

    let temp = tempfile::tempdir().unwrap();
    let (supervisor, client) = supervisor_with(test_config(&queue.base_url, temp.path()));
    let job = claim(&client).await;

    let shutdown = CancellationToken::new();
    let handle = tokio::spawn({
        let shutdown = shutdown.clone();
        async move { supervisor.supervise(job, shutdown).await }
    });
    tokio::time::sleep(Duration::from_millis(200)).await;
    shutdown.cancel();

    let resolution = tokio::time::timeout(Duration::from_secs(2), handle)
        .await
        .expect("supervisor should stop promptly")
        .unwrap();

    assert_eq!(
        resolution.failure.map(|f| f.kind),
        Some(FailureKind::Cancelled)
    );
    assert_eq!(fail_body(&queue, "J1")["kind"], "cancelled");
    assert_eq!(workspace_count(temp.path()), 0);
}

#[tokio::test]
async fn test_all_uploads_failing_fails_job() {
    let queue = MockQueue::start().await;
    queue.push_job("J1", "geotiff_to_png", json!({"maxSize": 50}));
    queue.add_input("J1", "scene.tif", geotiff_bytes(20, 20));
    queue.set_fail_uploads(true);

    let temp = tempfile::tempdir().unwrap();
    let (supervisor, client) = supervisor_with(test_config(&queue.base_url, temp.path()));
    let job = claim(&client).await;
    let resolution = supervisor.supervise(job, CancellationToken::new()).await;

    assert_eq!(
        resolution.failure.map(|f| f.kind),
        Some(FailureKind::UploadFailed)
    );
    let error = fail_body(&queue, "J1");
    assert_eq!(error["state"], "publishing");
    assert_eq!(queue.count("complete", "J1"), 0);
}

#[tokio::test]
async fn test_terminal_call_retried_on_server_error() {
    let queue = MockQueue::start().await;
    queue.push_job("J1", "geotiff_to_png", json!({"maxSize": 50}));
    queue.add_input("J1", "scene.tif", geotiff_bytes(20, 20));
    queue.set_terminal_failures(2);

    let temp = tempfile::tempdir().unwrap();
    let (supervisor, client) = supervisor_with(test_config(&queue.base_url, temp.path()));
    let job = claim(&client).await;
    let resolution = supervisor.supervise(job, CancellationToken::new()).await;

    assert!(resolution.is_completed());
    assert!(resolution.delivered);
    assert_eq!(queue.count("complete", "J1"), 3);
    assert_eq!(queue.count("fail", "J1"), 0);
}

#[tokio::test]
async fn test_terminal_call_gives_up_after_attempts() {
    let queue = MockQueue::start().await;
    queue.push_job("J2", "geotiff_to_png", json!({}));
    queue.add_input("J2", "empty.tif", Vec::new());
    queue.set_terminal_failures(10);

    let temp = tempfile::tempdir().unwrap();
    let (supervisor, client) = supervisor_with(test_config(&queue.base_url, temp.path()));
    let job = claim(&client).await;
    let resolution = supervisor.supervise(job, CancellationToken::new()).await;

    assert_eq!(resolution.state, SupervisorState::Failed);
    assert!(!resolution.delivered);
    assert_eq!(queue.count("fail", "J2"), 3);
    assert_eq!(workspace_count(temp.path()), 0);
}
