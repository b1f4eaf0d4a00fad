use std::{num::NonZeroUsize, time::Duration};

use event_ingester_pipeline::{
    FlushPolicy, PollConfig,
    test_util::{TestPipeline, wait_for},
};
use event_ingester_shutdown::ShutdownManager;
use pretty_assertions::assert_eq;
use serde_json::json;
use tokio_util::sync::CancellationToken;

fn lazy_policy() -> FlushPolicy {
    FlushPolicy::every_cycles(NonZeroUsize::new(1_000).unwrap())
}

fn config() -> PollConfig {
    PollConfig {
        wait_time: Duration::from_millis(10),
        ..Default::default()
    }
}

#[test_log::test(tokio::test)]
async fn pending_batch_is_flushed_and_acknowledged() {
    let pipeline = TestPipeline::new();
    pipeline.push_bodies(&[
        r#"{"id":"a"}"#,
        r#"{"id":"b"}"#,
        r#"{"id":"c"}"#,
        r#"{"id":"d"}"#,
    ]);

    let poll_loop = pipeline.poll_loop_with_config(lazy_policy(), config());
    let shutdown = CancellationToken::new();
    let handle = tokio::spawn(poll_loop.run(shutdown.clone()));

    // a second receive only starts once the first batch is accumulated
    let queue = pipeline.queue.clone();
    wait_for("two receive calls", move || queue.receive_calls() >= 2).await;
    assert_eq!(pipeline.store.put_calls(), 0);

    shutdown.cancel();
    let stats = handle.await.unwrap();

    assert_eq!(stats.flushes, 1);
    assert_eq!(stats.events_flushed, 4);
    assert_eq!(stats.acked, 4);
    assert!(pipeline.queue.is_empty());
    assert_eq!(
        pipeline.stored_batches().await,
        vec![vec![
            json!({"id": "a"}),
            json!({"id": "b"}),
            json!({"id": "c"}),
            json!({"id": "d"}),
        ]]
    );
}

#[test_log::test(tokio::test)]
async fn process_waits_for_the_final_flush() {
    let pipeline = TestPipeline::new();
    pipeline.push_bodies(&[r#"{"id":"a"}"#]);
    // slow enough that an early exit would be noticed
    pipeline.store.set_put_delay(Duration::from_millis(100));

    let process_token = CancellationToken::new();
    let shutdown_manager = ShutdownManager::new(process_token.clone());
    let token = shutdown_manager.register();

    let poll_loop = pipeline.poll_loop_with_config(lazy_policy(), config());
    let pipeline_token = token.cancellation_token();
    tokio::spawn(async move {
        poll_loop.run(pipeline_token).await;
        token.complete();
    });

    let queue = pipeline.queue.clone();
    wait_for("two receive calls", move || queue.receive_calls() >= 2).await;

    shutdown_manager.shutdown();
    shutdown_manager.join().await;

    assert!(process_token.is_cancelled());
    assert_eq!(pipeline.store.put_calls(), 1);
    assert!(pipeline.queue.is_empty());
}

#[test_log::test(tokio::test)]
async fn failed_final_flush_leaves_messages_on_the_queue() {
    let pipeline = TestPipeline::new();
    let ids = pipeline.push_bodies(&[r#"{"id":"a"}"#, r#"{"id":"b"}"#]);
    pipeline.store.set_fail_all_puts(true);

    let poll_loop = pipeline.poll_loop_with_config(lazy_policy(), config());
    let shutdown = CancellationToken::new();
    let handle = tokio::spawn(poll_loop.run(shutdown.clone()));

    let queue = pipeline.queue.clone();
    wait_for("two receive calls", move || queue.receive_calls() >= 2).await;
    shutdown.cancel();
    let stats = handle.await.unwrap();

    assert_eq!(stats.flush_failures, 1);
    assert!(pipeline.queue.delete_calls().is_empty());
    assert_eq!(pipeline.queue.remaining_ids(), ids);
}

#[test_log::test(tokio::test)]
async fn already_cancelled_token_stops_immediately() {
    let pipeline = TestPipeline::new();
    let poll_loop = pipeline.poll_loop_with_config(
        lazy_policy(),
        PollConfig {
            wait_time: Duration::from_secs(20),
            ..Default::default()
        },
    );

    let shutdown = CancellationToken::new();
    shutdown.cancel();
    let stats = tokio::time::timeout(Duration::from_secs(1), poll_loop.run(shutdown))
        .await
        .expect("poll loop did not observe cancellation");
    assert_eq!(stats.flushes, 0);
}

#[test_log::test(tokio::test)]
async fn no_receive_is_started_after_shutdown() {
    let pipeline = TestPipeline::new();
    let ids = pipeline.push_bodies(&[r#"{"id":"a"}"#, r#"{"id":"b"}"#]);
    let poll_loop = pipeline.poll_loop_with_config(lazy_policy(), config());

    let shutdown = CancellationToken::new();
    shutdown.cancel();
    let stats = poll_loop.run(shutdown).await;

    // the mock queue answers at once, so a receive issued now would hide both messages
    assert_eq!(pipeline.queue.receive_calls(), 0);
    assert_eq!(pipeline.queue.visible_len(), 2);
    assert_eq!(pipeline.queue.remaining_ids(), ids);
    assert_eq!(stats.received, 0);
}
