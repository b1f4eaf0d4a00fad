use std::{num::NonZeroUsize, time::Duration};

use assert_matches::assert_matches;
use event_ingester_pipeline::{FlushOutcome, FlushPolicy, FlushTrigger, test_util::TestPipeline};
use pretty_assertions::assert_eq;

fn push(pipeline: &TestPipeline, n: usize) {
    for i in 0..n {
        pipeline.queue.push(format!(r#"{{"n":{i}}}"#));
    }
}

#[test_log::test(tokio::test)]
async fn one_flush_per_n_non_empty_cycles() {
    let pipeline = TestPipeline::new();
    let mut poll_loop =
        pipeline.poll_loop(FlushPolicy::every_cycles(NonZeroUsize::new(3).unwrap()));

    let mut flushed = vec![];
    for (cycle, n_messages) in [1, 0, 2, 1, 0, 0, 3, 1, 1, 0].into_iter().enumerate() {
        push(&pipeline, n_messages);
        let report = poll_loop.run_cycle().await.unwrap();
        if let Some(outcome) = report.flush {
            assert_matches!(
                outcome,
                FlushOutcome::Flushed {
                    trigger: FlushTrigger::Cycles,
                    n_events,
                    ..
                } => flushed.push((cycle, n_events))
            );
        }
    }

    // third non-empty cycle at index 3, sixth at index 8
    assert_eq!(flushed, vec![(3, 4), (8, 5)]);
    assert_eq!(pipeline.store.put_calls(), 2);
    assert_eq!(pipeline.queue.delete_calls().len(), 2);
    assert!(pipeline.queue.is_empty());
}

#[test_log::test(tokio::test)]
async fn every_non_empty_cycle_with_the_default_policy() {
    let pipeline = TestPipeline::new();
    let mut poll_loop = pipeline.poll_loop(FlushPolicy::default());

    for n_messages in [2, 0, 0, 1, 0] {
        push(&pipeline, n_messages);
        let report = poll_loop.run_cycle().await.unwrap();
        assert_eq!(report.flush.is_some(), n_messages > 0);
    }
    assert_eq!(pipeline.store.put_calls(), 2);
}

#[test_log::test(tokio::test)]
async fn max_events_trigger() {
    let pipeline = TestPipeline::new();
    let mut poll_loop = pipeline.poll_loop(FlushPolicy {
        cycles: NonZeroUsize::new(100).unwrap(),
        max_events: NonZeroUsize::new(15),
        ..Default::default()
    });
    push(&pipeline, 22);

    assert_eq!(poll_loop.run_cycle().await.unwrap().flush, None);
    // checked per cycle, so the batch overshoots by up to one receive
    assert_matches!(
        poll_loop.run_cycle().await.unwrap().flush,
        Some(FlushOutcome::Flushed {
            trigger: FlushTrigger::MaxEvents,
            n_events: 20,
            ..
        })
    );
    assert_eq!(poll_loop.run_cycle().await.unwrap().flush, None);
    assert_eq!(poll_loop.pending_events(), 2);
}

#[test_log::test(tokio::test)]
async fn max_bytes_trigger() {
    let pipeline = TestPipeline::new();
    let mut poll_loop = pipeline.poll_loop(FlushPolicy {
        cycles: NonZeroUsize::new(100).unwrap(),
        max_bytes: NonZeroUsize::new(100),
        ..Default::default()
    });

    // 46 bytes each
    let body = r#"{"event":"submission_success","id":"abcdefgh"}"#;
    assert_eq!(body.len(), 46);

    pipeline.push_bodies(&[body, body]);
    assert_eq!(poll_loop.run_cycle().await.unwrap().flush, None);
    pipeline.push_bodies(&[body]);
    assert_matches!(
        poll_loop.run_cycle().await.unwrap().flush,
        Some(FlushOutcome::Flushed {
            trigger: FlushTrigger::MaxBytes,
            n_events: 3,
            ..
        })
    );
}

#[test_log::test(tokio::test)]
async fn max_age_fires_on_an_empty_cycle() {
    let pipeline = TestPipeline::new();
    let mut poll_loop = pipeline.poll_loop(FlushPolicy {
        cycles: NonZeroUsize::new(100).unwrap(),
        max_age: Some(Duration::from_secs(20)),
        ..Default::default()
    });
    push(&pipeline, 1);

    assert_eq!(poll_loop.run_cycle().await.unwrap().flush, None);
    pipeline.time.inc(Duration::from_secs(19));
    assert_eq!(poll_loop.run_cycle().await.unwrap().flush, None);
    pipeline.time.inc(Duration::from_secs(1));

    let report = poll_loop.run_cycle().await.unwrap();
    assert_eq!(report.received, 0);
    assert_matches!(
        report.flush,
        Some(FlushOutcome::Flushed {
            trigger: FlushTrigger::MaxAge,
            n_events: 1,
            ..
        })
    );
    assert!(pipeline.queue.is_empty());
}
