//! The ingest pipeline: receive messages from a queue, decode them into events, batch the
//! events, persist each batch as one object, and only then delete the batch's messages.
//!
//! ```text
//!  MessageQueue ──receive──▶ decode ──▶ BatchAccumulator ──drain──▶ FlushWriter ──put──▶ ObjectStore
//!       ▲                                                               │
//!       └──────────────delete_batch──────── AckTracker ◀──FlushedBatch──┘
//! ```
//!
//! Delivery is at least once. A message is deleted only with the [`FlushedBatch`] of the batch
//! it ended up in; anything not deleted (decode failure, flush failure, crash, rejected delete)
//! is received again after the queue's visibility timeout. Duplicate events in storage are
//! possible, lost ones are not.

use std::time::Duration;

use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};

pub mod accumulator;
pub mod ack;
pub mod decoder;
pub mod poll_loop;
#[cfg(any(test, feature = "testing"))]
pub mod test_util;
pub mod writer;

pub use accumulator::{Batch, BatchAccumulator, FlushPolicy, FlushTrigger};
pub use ack::{AckSummary, AckTracker, DEFAULT_ACK_ATTEMPTS, DeleteFailure};
pub use decoder::{DecodeError, DecodedEvent, decode};
pub use poll_loop::{CycleReport, FlushOutcome, PollConfig, PollLoop, PollStats};
pub use writer::{DEFAULT_PUT_TIMEOUT, FlushError, FlushWriter, FlushedBatch};

/// Exponential backoff between retries of a failing queue request.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffConfig {
    /// Delay before the first retry
    pub init_backoff: Duration,
    /// Upper bound for any single delay, before jitter
    pub max_backoff: Duration,
    /// Multiplier applied to the delay after every retry
    pub base: f64,
    /// Each delay is picked at random within this fraction around its nominal value
    pub jitter: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            init_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(30),
            base: 2.,
            jitter: 0.1,
        }
    }
}

impl BackoffConfig {
    /// A fresh backoff that never gives up; callers bound the number of attempts themselves.
    pub(crate) fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoffBuilder::new()
            .with_initial_interval(self.init_backoff.min(self.max_backoff))
            .with_max_interval(self.max_backoff)
            .with_multiplier(self.base.max(1.))
            .with_randomization_factor(self.jitter.clamp(0., 1.))
            .with_max_elapsed_time(None)
            .build()
    }
}

#[cfg(test)]
mod tests {
    use ::backoff::backoff::Backoff;

    use super::*;

    #[test]
    fn backoff_grows_up_to_the_cap() {
        let mut backoff = BackoffConfig {
            jitter: 0.,
            ..Default::default()
        }
        .backoff();
        let delays: Vec<_> = (0..12)
            .map(|_| backoff.next_backoff().unwrap().as_millis())
            .collect();
        assert_eq!(
            delays,
            vec![
                100, 200, 400, 800, 1_600, 3_200, 6_400, 12_800, 25_600, 30_000, 30_000, 30_000
            ]
        );

        backoff.reset();
        assert_eq!(backoff.next_backoff(), Some(Duration::from_millis(100)));
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let mut backoff = BackoffConfig {
            init_backoff: Duration::from_secs(10),
            max_backoff: Duration::from_secs(10),
            base: 2.,
            jitter: 0.5,
        }
        .backoff();
        for _ in 0..100 {
            let delay = backoff.next_backoff().unwrap();
            assert!(
                delay >= Duration::from_secs(5) && delay <= Duration::from_millis(15_001),
                "{delay:?}"
            );
        }
    }

    #[test]
    fn initial_delay_is_capped() {
        let mut backoff = BackoffConfig {
            init_backoff: Duration::from_secs(10),
            max_backoff: Duration::from_secs(1),
            base: 0.5,
            jitter: 0.,
        }
        .backoff();
        assert_eq!(backoff.next_backoff(), Some(Duration::from_secs(1)));
        assert_eq!(backoff.next_backoff(), Some(Duration::from_secs(1)));
    }
}
