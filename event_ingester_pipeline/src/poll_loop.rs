//! The receive, decode, accumulate, flush and acknowledge loop.

use std::{sync::Arc, time::Duration};

use backoff::backoff::Backoff;
use event_ingester_queue::{
    MAX_RECEIVE_MESSAGES, MAX_WAIT_TIME, MessageQueue, QueueError, RawMessage,
};
use event_ingester_time::TimeProvider;
use futures::FutureExt;
use object_store::path::Path;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    BackoffConfig,
    accumulator::{BatchAccumulator, FlushPolicy, FlushTrigger},
    ack::{AckSummary, AckTracker},
    decoder::decode,
    writer::FlushWriter,
};

/// How the loop talks to the queue.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PollConfig {
    /// Messages requested per receive, at most [`MAX_RECEIVE_MESSAGES`]
    pub max_messages: usize,
    /// Long poll duration of a receive, at most [`MAX_WAIT_TIME`]
    pub wait_time: Duration,
    /// Delays between receives after the queue could not be reached
    pub receive_backoff: BackoffConfig,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            max_messages: MAX_RECEIVE_MESSAGES,
            wait_time: MAX_WAIT_TIME,
            receive_backoff: BackoffConfig::default(),
        }
    }
}

/// Counters over the lifetime of a [`PollLoop`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PollStats {
    pub cycles: u64,
    pub receive_failures: u64,
    pub received: u64,
    pub decode_failures: u64,
    pub flushes: u64,
    pub flush_failures: u64,
    pub events_flushed: u64,
    /// Size of all objects written
    pub bytes_flushed: u64,
    pub acked: u64,
    pub ack_failures: u64,
}

/// What happened to a batch the loop tried to flush.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlushOutcome {
    Flushed {
        trigger: FlushTrigger,
        object: Path,
        n_events: usize,
        ack: AckSummary,
    },
    /// The batch was discarded and none of its messages were deleted.
    Failed {
        trigger: FlushTrigger,
        n_events: usize,
    },
}

/// What one poll cycle did.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CycleReport {
    pub received: usize,
    pub decoded: usize,
    pub decode_failures: usize,
    pub flush: Option<FlushOutcome>,
}

/// Drives the pipeline.
///
/// Every cycle receives one bounded batch of messages, decodes them one by one, hands the
/// events to the [`BatchAccumulator`], and flushes when a trigger fires. The messages of a
/// batch are only deleted after the [`FlushWriter`] stored it; a batch that fails to flush is
/// dropped and its messages come back after the queue's visibility timeout.
#[derive(Debug)]
pub struct PollLoop {
    queue: Arc<dyn MessageQueue>,
    accumulator: BatchAccumulator,
    writer: FlushWriter,
    ack_tracker: AckTracker,
    time_provider: Arc<dyn TimeProvider>,
    config: PollConfig,
    stats: PollStats,
}

impl PollLoop {
    pub fn new(
        queue: Arc<dyn MessageQueue>,
        writer: FlushWriter,
        ack_tracker: AckTracker,
        policy: FlushPolicy,
        time_provider: Arc<dyn TimeProvider>,
        config: PollConfig,
    ) -> Self {
        Self {
            queue,
            accumulator: BatchAccumulator::new(policy, Arc::clone(&time_provider)),
            writer,
            ack_tracker,
            time_provider,
            config,
            stats: PollStats::default(),
        }
    }

    pub fn stats(&self) -> PollStats {
        self.stats
    }

    /// Events received but not yet flushed
    pub fn pending_events(&self) -> usize {
        self.accumulator.len()
    }

    /// Run until `shutdown` is cancelled.
    ///
    /// Cancellation interrupts a pending receive or backoff sleep, but never a flush or
    /// acknowledgment in progress. A non-empty batch is flushed and acknowledged before this
    /// returns.
    pub async fn run(mut self, shutdown: CancellationToken) -> PollStats {
        let policy = *self.accumulator.policy();
        info!(
            max_messages = self.config.max_messages,
            wait_time = ?self.config.wait_time,
            flush_cycles = policy.cycles.get(),
            max_events = ?policy.max_events,
            max_bytes = ?policy.max_bytes,
            max_age = ?policy.max_age,
            "starting poll loop"
        );

        let mut receive_backoff = self.config.receive_backoff.backoff();
        loop {
            if shutdown.is_cancelled() {
                break;
            }

            // Shutdown drops a receive still in flight. Messages the queue already handed to it
            // stay hidden and are redelivered after their visibility timeout.
            let received = futures::select_biased! {
                received = self.receive().fuse() => received,
                _ = shutdown.cancelled().fuse() => break,
            };

            match received {
                Ok(messages) => {
                    receive_backoff.reset();
                    self.process(messages).await;
                }
                Err(e) => {
                    let delay = receive_backoff
                        .next_backoff()
                        .unwrap_or(self.config.receive_backoff.max_backoff);
                    warn!(error = %e, ?delay, "failed to receive from queue, backing off");
                    futures::select! {
                        _ = shutdown.cancelled().fuse() => break,
                        _ = tokio::time::sleep(delay).fuse() => {},
                    }
                }
            }
        }

        if self.accumulator.is_empty() {
            info!("poll loop stopped with no pending events");
        } else {
            info!(
                n_events = self.accumulator.len(),
                "poll loop stopping, flushing pending batch"
            );
            self.flush(FlushTrigger::Forced).await;
        }

        let stats = self.stats;
        info!(?stats, "poll loop stopped");
        stats
    }

    /// Receive and process a single batch of messages.
    pub async fn run_cycle(&mut self) -> Result<CycleReport, QueueError> {
        let messages = self.receive().await?;
        Ok(self.process(messages).await)
    }

    /// Flush whatever is pending, regardless of the flush policy.
    pub async fn flush_pending(&mut self) -> Option<FlushOutcome> {
        if self.accumulator.is_empty() {
            return None;
        }
        Some(self.flush(FlushTrigger::Forced).await)
    }

    async fn receive(&mut self) -> Result<Vec<RawMessage>, QueueError> {
        let received = self
            .queue
            .receive(self.config.max_messages, self.config.wait_time)
            .await;
        if received.is_err() {
            self.stats.receive_failures += 1;
        }
        received
    }

    async fn process(&mut self, messages: Vec<RawMessage>) -> CycleReport {
        let mut report = CycleReport {
            received: messages.len(),
            ..Default::default()
        };

        for message in messages {
            match decode(&message.body) {
                Ok(event) => {
                    self.accumulator.add(event, message.message_ref());
                    report.decoded += 1;
                }
                Err(e) => {
                    warn!(
                        message_id = %message.id,
                        error = %e,
                        body_len = message.body.len(),
                        receive_count = ?message.receive_count,
                        "skipping message that failed to decode"
                    );
                    report.decode_failures += 1;
                }
            }
        }
        self.accumulator.complete_cycle();

        self.stats.cycles += 1;
        self.stats.received += report.received as u64;
        self.stats.decode_failures += report.decode_failures as u64;

        if let Some(trigger) = self.accumulator.should_flush(self.time_provider.now()) {
            report.flush = Some(self.flush(trigger).await);
        }

        debug!(
            received = report.received,
            decoded = report.decoded,
            decode_failures = report.decode_failures,
            pending_events = self.accumulator.len(),
            pending_cycles = self.accumulator.pending_cycles(),
            "poll cycle complete"
        );

        report
    }

    async fn flush(&mut self, trigger: FlushTrigger) -> FlushOutcome {
        let batch = self.accumulator.drain();
        let n_events = batch.len();
        debug!(%trigger, n_events, n_bytes = batch.n_bytes(), "flushing batch");

        let flushed = match self.writer.write(batch).await {
            Ok(flushed) => flushed,
            Err(e) => {
                error!(
                    %trigger,
                    n_events,
                    error = %e,
                    "failed to flush batch, discarding it; its messages will be redelivered"
                );
                self.stats.flush_failures += 1;
                return FlushOutcome::Failed { trigger, n_events };
            }
        };
        self.stats.flushes += 1;
        self.stats.events_flushed += flushed.n_events() as u64;
        self.stats.bytes_flushed += flushed.n_bytes() as u64;

        let ack = self.ack_tracker.ack(&flushed).await;
        self.stats.acked += ack.deleted as u64;
        self.stats.ack_failures += ack.failed as u64;

        FlushOutcome::Flushed {
            trigger,
            object: flushed.object().clone(),
            n_events: flushed.n_events(),
            ack,
        }
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use event_ingester_queue::MessageId;
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::test_util::TestPipeline;

    #[test_log::test(tokio::test)]
    async fn cycle_report() {
        let pipeline = TestPipeline::new();
        pipeline.push_bodies(&[r#"{"id":"a"}"#, "garbage", r#"{"id":"b"}"#]);
        let mut poll_loop = pipeline.poll_loop(FlushPolicy::default());

        let report = poll_loop.run_cycle().await.unwrap();
        assert_eq!(report.received, 3);
        assert_eq!(report.decoded, 2);
        assert_eq!(report.decode_failures, 1);
        assert_matches!(
            report.flush,
            Some(FlushOutcome::Flushed {
                trigger: FlushTrigger::Cycles,
                n_events: 2,
                ack: AckSummary { deleted: 2, failed: 0 },
                ..
            })
        );

        let objects = pipeline.store.objects().await.unwrap();
        assert_eq!(
            poll_loop.stats(),
            PollStats {
                cycles: 1,
                received: 3,
                decode_failures: 1,
                flushes: 1,
                events_flushed: 2,
                bytes_flushed: objects[0].1.len() as u64,
                acked: 2,
                ..Default::default()
            }
        );
        assert_eq!(pipeline.queue.remaining_ids(), vec![MessageId::new("msg-000002")]);
    }

    #[test_log::test(tokio::test)]
    async fn receive_errors_surface_from_run_cycle() {
        let pipeline = TestPipeline::new();
        let mut poll_loop = pipeline.poll_loop(FlushPolicy::default());

        pipeline.queue.fail_next_receives(1);
        assert_matches!(poll_loop.run_cycle().await, Err(QueueError::Transport(_)));
        assert_eq!(poll_loop.stats().receive_failures, 1);
        assert_eq!(poll_loop.run_cycle().await.unwrap(), CycleReport::default());
    }

    #[test_log::test(tokio::test)]
    async fn flush_pending_ignores_policy() {
        let pipeline = TestPipeline::new();
        pipeline.push_bodies(&[r#"{"id":"a"}"#]);
        let mut poll_loop = pipeline.poll_loop(FlushPolicy::every_cycles(
            std::num::NonZeroUsize::new(10).unwrap(),
        ));

        assert_eq!(poll_loop.run_cycle().await.unwrap().flush, None);
        assert_eq!(poll_loop.pending_events(), 1);

        assert_matches!(
            poll_loop.flush_pending().await,
            Some(FlushOutcome::Flushed {
                trigger: FlushTrigger::Forced,
                n_events: 1,
                ..
            })
        );
        assert_eq!(poll_loop.flush_pending().await, None);
        assert!(pipeline.queue.is_empty());
    }
}
