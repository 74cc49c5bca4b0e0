
use std::collections::HashSet;
use std::time::Duration;

use serde_json::json;
use tokio_util::sync::CancellationToken;

use raster_worker::config::WorkerConfig;
use raster_worker::node::Node;
use test_harness::{
    assert_eventually, geotiff_bytes, test_config, unreachable_base_url, MockQueue,
};

fn push_j1(queue: &MockQueue, id: &str) {
    queue.push_job(id, "geotiff_to_png", json!({"maxSize": 50, "generateThumbnails": false}));
    queue.add_input(id, "scene.tif", geotiff_bytes(20, 20));
}

#[tokio::test]
async fn test_empty_queue_is_polled_at_interval() {
    let queue = MockQueue::start().await;
    let temp = tempfile::tempdir().unwrap();
    let node = Node::new(test_config(&queue.base_url, temp.path())).unwrap();

    let shutdown = CancellationToken::new();
    let handle = tokio::spawn(node.run(shutdown.clone()));
    tokio::time::sleep(Duration::from_millis(500)).await;
    shutdown.cancel();
    let summary = handle.await.unwrap();

    assert_eq!(summary.claimed, 0);
    assert_eq!(summary.claim_errors, 0);
    let claims = queue.calls_to("claim").len();
    // 50ms poll interval over 500ms
    assert!((3..=12).contains(&claims), "claims: {}", claims);
}

#[tokio::test]
async fn test_processes_queued_jobs() {
    let queue = MockQueue::start().await;
    push_j1(&queue, "J1");
    push_j1(&queue, "J2");
    let temp = tempfile::tempdir().unwrap();
    let node = Node::new(test_config(&queue.base_url, temp.path())).unwrap();

    let shutdown = CancellationToken::new();
    let handle = tokio::spawn(node.run(shutdown.clone()));

    assert_eventually(
        || async { queue.calls_to("complete").len() == 2 },
        Duration::from_secs(10),
        "both jobs should complete",
    )
    .await;
    shutdown.cancel();
    let summary = handle.await.unwrap();

    assert_eq!(summary.claimed, 2);
    assert_eq!(summary.completed, 2);
    assert_eq!(summary.failed, 0);
    assert_eq!(summary.undelivered, 0);
    assert_eq!(queue.count("complete", "J1"), 1);
    assert_eq!(queue.count("complete", "J2"), 1);
    assert_eq!(std::fs::read_dir(temp.path()).unwrap().count(), 0);
}

#[tokio::test]
async fn test_shutdown_fails_in_flight_job() {
    let queue = MockQueue::start().await;
    push_j1(&queue, "J1");
    queue.set_file_delay(Duration::from_secs(5));
    let temp = tempfile::tempdir().unwrap();
    let node = Node::new(test_config(&queue.base_url, temp.path())).unwrap();

    let shutdown = CancellationToken::new();
    let handle = tokio::spawn(node.run(shutdown.clone()));

    assert_eventually(
        || async { !queue.calls_to("file").is_empty() },
        Duration::from_secs(5),
        "job should start downloading",
    )
    .await;
    shutdown.cancel();

    let summary = tokio::time::timeout(Duration::from_secs(3), handle)
        .await
        .expect("worker should drain promptly")
        .unwrap();

    assert_eq!(summary.claimed, 1);
    assert_eq!(summary.failed, 1);
    let fails = queue.calls_to("fail");
    assert_eq!(fails.len(), 1);
    assert_eq!(fails[0].body["error"]["kind"], "cancelled");
    assert_eq!(queue.count("complete", "J1"), 0);
}

#[tokio::test]
async fn test_claim_errors_back_off() {
    let temp = tempfile::tempdir().unwrap();
    let node = Node::new(test_config(&unreachable_base_url(), temp.path())).unwrap();

    let shutdown = CancellationToken::new();
    let handle = tokio::spawn(node.run(shutdown.clone()));
    tokio::time::sleep(Duration::from_millis(450)).await;
    shutdown.cancel();
    let summary = handle.await.unwrap();

    assert_eq!(summary.claimed, 0);
    // 100ms back-off after each failure
    assert!(
        (1..=6).contains(&summary.claim_errors),
        "claim errors: {}",
        summary.claim_errors
    );
}

#[tokio::test]
async fn test_two_workers_never_share_a_job() {
    let queue = MockQueue::start().await;
    let ids: Vec<String> = (1..=6).map(|i| format!("J{}", i)).collect();
    for id in &ids {
        push_j1(&queue, id);
    }
    let temp = tempfile::tempdir().unwrap();

    let shutdown = CancellationToken::new();
    let mut handles = Vec::new();
    for w in 0..2 {
        let config = WorkerConfig {
            max_concurrent_jobs: 2,
            ..test_config(&queue.base_url, temp.path()).with_worker_id(format!("worker-{}", w))
        };
        let node = Node::new(config).unwrap();
        handles.push(tokio::spawn(node.run(shutdown.clone())));
    }

    assert_eventually(
        || async { queue.calls_to("complete").len() == 6 },
        Duration::from_secs(15),
        "all jobs should complete",
    )
    .await;
    shutdown.cancel();

    let mut completed = 0;
    for handle in handles {
        completed += handle.await.unwrap().completed;
    }
    assert_eq!(completed, 6);

    let completed_ids: HashSet<String> = queue
        .calls_to("complete")
        .into_iter()
        .filter_map(|c| c.job_id)
        .collect();
    assert_eq!(completed_ids.len(), 6);
    for id in &ids {
        assert_eq!(queue.count("complete", id), 1);
    }
}

#[test]
fn test_invalid_config_is_rejected() {
    let temp = tempfile::tempdir().unwrap();
    let config = WorkerConfig {
        auth_token: String::new(),
        ..test_config("http://localhost:5000", temp.path())
    };
    assert!(Node::new(config).is_err());

    let config = WorkerConfig {
        heartbeat_interval_ms: 5_000,
        lease_timeout_ms: 1_000,
        ..test_config("http://localhost:5000", temp.path())
    };
    assert!(Node::new(config).is_err());
}
