//! CLI handling for when and where batches are flushed.

use std::{num::NonZeroUsize, time::Duration};

use snafu::{Snafu, ensure};

use crate::parse_duration;

#[derive(Debug, Snafu)]
pub enum FlushConfigError {
    #[snafu(display("--flush-put-timeout must be greater than zero"))]
    ZeroPutTimeout,

    #[snafu(display("--object-prefix {:?} contains an empty path segment", prefix))]
    InvalidObjectPrefix { prefix: String },
}

/// CLI config for flushing batches.
///
/// A batch is flushed as soon as any configured trigger fires. Triggers are evaluated at the
/// end of each poll cycle.
#[derive(Debug, Clone, clap::Parser)]
pub struct FlushConfig {
    /// Flush after this many poll cycles that received at least one event.
    #[clap(
        long = "flush-cycles",
        env = "EVENT_INGESTER_FLUSH_CYCLES",
        default_value = "1",
        action
    )]
    pub flush_cycles: NonZeroUsize,

    /// Flush once the batch holds this many events.
    #[clap(long = "flush-max-events", env = "EVENT_INGESTER_FLUSH_MAX_EVENTS", action)]
    pub flush_max_events: Option<NonZeroUsize>,

    /// Flush once the message bodies of the batch add up to this many bytes.
    #[clap(long = "flush-max-bytes", env = "EVENT_INGESTER_FLUSH_MAX_BYTES", action)]
    pub flush_max_bytes: Option<NonZeroUsize>,

    /// Flush once the oldest event of the batch was received this long ago.
    ///
    /// Example: "30s", "2m".
    #[clap(
        long = "flush-max-age",
        env = "EVENT_INGESTER_FLUSH_MAX_AGE",
        value_parser = parse_duration,
        action
    )]
    pub flush_max_age: Option<Duration>,

    /// Path prefix of every object written, e.g. "events/raw".
    #[clap(
        long = "object-prefix",
        env = "EVENT_INGESTER_OBJECT_PREFIX",
        default_value = "",
        action
    )]
    pub object_prefix: String,

    /// How long a single object write may take before the batch is given up on.
    #[clap(
        long = "flush-put-timeout",
        env = "EVENT_INGESTER_FLUSH_PUT_TIMEOUT",
        default_value = "30s",
        value_parser = parse_duration,
        action
    )]
    pub put_timeout: Duration,

    /// Attempts for a delete request that fails in transit before its messages are left for
    /// redelivery.
    #[clap(
        long = "ack-attempts",
        env = "EVENT_INGESTER_ACK_ATTEMPTS",
        default_value = "3",
        action
    )]
    pub ack_attempts: NonZeroUsize,
}

impl FlushConfig {
    pub fn validate(&self) -> Result<(), FlushConfigError> {
        ensure!(!self.put_timeout.is_zero(), ZeroPutTimeoutSnafu);

        let prefix = self.object_prefix.trim_matches('/');
        ensure!(
            prefix.is_empty() || prefix.split('/').all(|segment| !segment.is_empty()),
            InvalidObjectPrefixSnafu {
                prefix: &self.object_prefix
            }
        );
        Ok(())
    }

    /// The object prefix without leading or trailing slashes, `None` if empty.
    pub fn object_prefix(&self) -> Option<&str> {
        Some(self.object_prefix.trim_matches('/')).filter(|p| !p.is_empty())
    }

    /// Rough upper bound on how long a batch stays pending under steady traffic: the flush
    /// cycles times the receive wait, capped by the max age plus one receive.
    ///
    /// Cycles that receive nothing do not count towards `--flush-cycles`, so with sparse
    /// traffic and no `--flush-max-age` a batch can stay pending for longer.
    pub fn batch_latency_bound(&self, wait_time: Duration) -> Duration {
        let cycles = u32::try_from(self.flush_cycles.get()).unwrap_or(u32::MAX);
        let by_cycles = wait_time.saturating_mul(cycles);
        match self.flush_max_age {
            Some(max_age) => by_cycles.min(max_age.saturating_add(wait_time)),
            None => by_cycles,
        }
    }

    /// Whether messages are likely to become visible again before their batch is flushed,
    /// which stores their events twice.
    ///
    /// Flags a latency bound of 80% or more of `visibility_timeout`.
    pub fn redelivery_risk(&self, wait_time: Duration, visibility_timeout: Duration) -> bool {
        self.batch_latency_bound(wait_time).as_secs_f64() >= visibility_timeout.as_secs_f64() * 0.8
    }

    /// Whether a pending batch can be held indefinitely while no messages arrive.
    pub fn unbounded_by_age(&self) -> bool {
        self.flush_cycles.get() > 1 && self.flush_max_age.is_none()
    }
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::*;

    fn parse(args: &[&str]) -> FlushConfig {
        FlushConfig::try_parse_from(std::iter::once("ingester").chain(args.iter().copied()))
            .unwrap()
    }

    #[test]
    fn defaults() {
        let config = parse(&[]);
        config.validate().unwrap();

        assert_eq!(config.flush_cycles.get(), 1);
        assert_eq!(config.flush_max_events, None);
        assert_eq!(config.flush_max_bytes, None);
        assert_eq!(config.flush_max_age, None);
        assert_eq!(config.object_prefix(), None);
        assert_eq!(config.put_timeout, Duration::from_secs(30));
        assert_eq!(config.ack_attempts.get(), 3);
        assert!(!config.unbounded_by_age());
    }

    #[test]
    fn zero_flush_cycles_is_rejected() {
        let err = FlushConfig::try_parse_from(["ingester", "--flush-cycles", "0"]).unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::ValueValidation);
    }

    #[test]
    fn zero_put_timeout_is_rejected() {
        let config = parse(&["--flush-put-timeout", "0"]);
        assert!(matches!(
            config.validate(),
            Err(FlushConfigError::ZeroPutTimeout)
        ));
    }

    #[test]
    fn object_prefix() {
        assert_eq!(
            parse(&["--object-prefix", "/events/raw/"]).object_prefix(),
            Some("events/raw")
        );
        assert_eq!(parse(&["--object-prefix", "/"]).object_prefix(), None);

        let config = parse(&["--object-prefix", "events//raw"]);
        assert_eq!(
            config.validate().unwrap_err().to_string(),
            r#"--object-prefix "events//raw" contains an empty path segment"#
        );
    }

    #[test]
    fn latency_bound() {
        let wait = Duration::from_secs(20);

        let config = parse(&["--flush-cycles", "3"]);
        assert_eq!(config.batch_latency_bound(wait), Duration::from_secs(60));
        assert!(config.unbounded_by_age());

        let config = parse(&["--flush-cycles", "100", "--flush-max-age", "1m"]);
        assert_eq!(config.batch_latency_bound(wait), Duration::from_secs(80));
        assert!(!config.unbounded_by_age());
    }

    #[test]
    fn redelivery_risk() {
        let wait = Duration::from_secs(20);

        let config = parse(&[]);
        assert!(!config.redelivery_risk(wait, Duration::from_secs(30)));
        assert!(config.redelivery_risk(wait, Duration::from_secs(25)));

        let config = parse(&["--flush-cycles", "5"]);
        assert!(!config.redelivery_risk(wait, Duration::from_secs(200)));
        assert!(config.redelivery_risk(wait, Duration::from_secs(120)));
    }
}
