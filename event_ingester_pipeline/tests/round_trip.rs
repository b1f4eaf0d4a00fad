use std::{sync::Arc, time::Duration};

use assert_matches::assert_matches;
use event_ingester_pipeline::{
    AckTracker, DEFAULT_ACK_ATTEMPTS, DEFAULT_PUT_TIMEOUT, FlushOutcome, FlushPolicy, FlushWriter,
    PollConfig, PollLoop,
    test_util::{TestPipeline, fast_backoff},
};
use object_store::{ObjectStore, local::LocalFileSystem};
use pretty_assertions::assert_eq;
use serde_json::{Value, json};

#[test_log::test(tokio::test)]
async fn single_event_round_trip() {
    let pipeline = TestPipeline::new();
    pipeline.push_bodies(&[r#"{"event":"submission_success","id":"X"}"#]);

    let mut poll_loop = pipeline.poll_loop(FlushPolicy::default());
    poll_loop.run_cycle().await.unwrap();

    let objects = pipeline.store.objects().await.unwrap();
    assert_eq!(objects.len(), 1);
    let content: Value = serde_json::from_slice(&objects[0].1).unwrap();
    assert_eq!(
        content,
        json!([{"event": "submission_success", "id": "X"}])
    );
}

#[test_log::test(tokio::test)]
async fn values_survive_unchanged() {
    let pipeline = TestPipeline::new();
    let event = json!({
        "id": "4f1c",
        "received_at": "2023-11-14T22:13:20.123456",
        "anonymous_id": null,
        "context_device_ad_tracking_enabled": true,
        "count": 3,
        "ratio": 0.25,
        "nested": {"a": [1, "two", null]},
    });
    let body = event.to_string();
    pipeline.push_bodies(&[body.as_str()]);

    let mut poll_loop = pipeline.poll_loop(FlushPolicy::default());
    poll_loop.run_cycle().await.unwrap();

    assert_eq!(pipeline.stored_batches().await, vec![vec![event]]);
}

#[test_log::test(tokio::test)]
async fn local_file_system_store() {
    let dir = tempfile::tempdir().unwrap();
    let pipeline = TestPipeline::new();
    pipeline.push_bodies(&[r#"{"id":"a"}"#, r#"{"id":"b"}"#]);

    let store = Arc::new(LocalFileSystem::new_with_prefix(dir.path()).unwrap());
    let queue = Arc::new(pipeline.queue.clone());
    let mut poll_loop = PollLoop::new(
        Arc::clone(&queue) as _,
        FlushWriter::new(
            Arc::clone(&store) as _,
            Arc::clone(&pipeline.time) as _,
            Some("raw".into()),
            DEFAULT_PUT_TIMEOUT,
        ),
        AckTracker::new(queue, DEFAULT_ACK_ATTEMPTS, fast_backoff()),
        FlushPolicy::default(),
        Arc::clone(&pipeline.time) as _,
        PollConfig {
            wait_time: Duration::ZERO,
            ..Default::default()
        },
    );

    let report = poll_loop.run_cycle().await.unwrap();
    let object = assert_matches!(
        report.flush,
        Some(FlushOutcome::Flushed { object, .. }) => object
    );

    let on_disk = dir.path().join(object.to_string());
    assert!(on_disk.starts_with(dir.path().join("raw").join("20231114")));
    let content: Value = serde_json::from_slice(&std::fs::read(&on_disk).unwrap()).unwrap();
    assert_eq!(content, json!([{"id": "a"}, {"id": "b"}]));

    let via_store = store.get(&object).await.unwrap().bytes().await.unwrap();
    assert_eq!(via_store.len(), std::fs::metadata(&on_disk).unwrap().len() as usize);
}
