//! CLI handling for the queue events are consumed from.

use std::time::Duration;

use event_ingester_queue::MAX_WAIT_TIME;
use non_empty_string::NonEmptyString;
use snafu::{Snafu, ensure};

use crate::{
    endpoint::Endpoint, object_store::FALLBACK_AWS_REGION, parse_duration, parse_optional_string,
};

/// Longest visibility timeout SQS accepts.
pub const MAX_VISIBILITY_TIMEOUT: Duration = Duration::from_secs(12 * 60 * 60);

/// Visibility timeout of a queue created with default attributes, assumed when none is given.
pub const DEFAULT_VISIBILITY_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Snafu)]
pub enum QueueConfigError {
    #[snafu(display("Either --queue-name or --queue-url is required"))]
    MissingQueue,

    #[snafu(display(
        "--wait-time of {} exceeds the maximum of {}",
        humantime::format_duration(*wait_time),
        humantime::format_duration(MAX_WAIT_TIME)
    ))]
    WaitTimeTooLong { wait_time: Duration },

    #[snafu(display(
        "--visibility-timeout of {} exceeds the maximum of {}",
        humantime::format_duration(*visibility_timeout),
        humantime::format_duration(MAX_VISIBILITY_TIMEOUT)
    ))]
    VisibilityTimeoutTooLong { visibility_timeout: Duration },

    #[snafu(display(
        "--receive-backoff-initial ({}) must not exceed --receive-backoff-max ({})",
        humantime::format_duration(*initial),
        humantime::format_duration(*max)
    ))]
    InvalidReceiveBackoff { initial: Duration, max: Duration },

    #[snafu(display("--queue-access-key-id and --queue-secret-access-key must be set together"))]
    IncompleteCredentials,
}

/// CLI config for the queue.
#[derive(Debug, Clone, clap::Parser)]
pub struct QueueConfig {
    /// Name of the queue to consume, resolved to its URL at startup.
    #[clap(long = "queue-name", env = "EVENT_INGESTER_QUEUE_NAME", action)]
    pub queue_name: Option<String>,

    /// URL of the queue to consume. Takes precedence over `--queue-name`.
    #[clap(long = "queue-url", env = "EVENT_INGESTER_QUEUE_URL", action)]
    pub queue_url: Option<String>,

    /// AWS region of the queue.
    #[clap(
        long = "queue-region",
        env = "EVENT_INGESTER_QUEUE_REGION",
        default_value = FALLBACK_AWS_REGION,
        action
    )]
    pub queue_region: String,

    /// Custom endpoint of an SQS compatible service.
    ///
    /// Example: `http://localhost:4566`
    #[clap(long = "queue-endpoint", env = "EVENT_INGESTER_QUEUE_ENDPOINT", action)]
    pub queue_endpoint: Option<Endpoint>,

    /// Static access key for the queue. If unset, the default AWS credential chain applies.
    #[clap(
        long = "queue-access-key-id",
        env = "EVENT_INGESTER_QUEUE_ACCESS_KEY_ID",
        value_parser = parse_optional_string,
        default_value = "",
        action
    )]
    pub queue_access_key_id: std::option::Option<NonEmptyString>,

    /// Secret that goes with `--queue-access-key-id`.
    #[clap(
        long = "queue-secret-access-key",
        env = "EVENT_INGESTER_QUEUE_SECRET_ACCESS_KEY",
        value_parser = parse_optional_string,
        default_value = "",
        action
    )]
    pub queue_secret_access_key: std::option::Option<NonEmptyString>,

    /// Session token that goes with the static credentials.
    #[clap(
        long = "queue-session-token",
        env = "EVENT_INGESTER_QUEUE_SESSION_TOKEN",
        action
    )]
    pub queue_session_token: Option<String>,

    /// How long a receive waits for messages to arrive, at most 20 seconds.
    ///
    /// Accepts seconds ("20") or a duration ("500ms").
    #[clap(
        long = "wait-time",
        env = "EVENT_INGESTER_WAIT_TIME",
        default_value = "20",
        value_parser = parse_duration,
        action
    )]
    pub wait_time: Duration,

    /// How long received messages stay hidden from other consumers.
    ///
    /// Unacknowledged messages are redelivered after this. If unset, the queue's own setting
    /// applies.
    #[clap(
        long = "visibility-timeout",
        env = "EVENT_INGESTER_VISIBILITY_TIMEOUT",
        value_parser = parse_duration,
        action
    )]
    pub visibility_timeout: Option<Duration>,

    /// Messages requested per receive, 1 to 10.
    #[clap(
        long = "max-messages",
        env = "EVENT_INGESTER_MAX_MESSAGES",
        default_value = "10",
        value_parser = clap::value_parser!(u8).range(1..=10),
        action
    )]
    pub max_messages: u8,

    /// First delay before receiving again after the queue could not be reached.
    #[clap(
        long = "receive-backoff-initial",
        env = "EVENT_INGESTER_RECEIVE_BACKOFF_INITIAL",
        default_value = "100ms",
        value_parser = parse_duration,
        action
    )]
    pub receive_backoff_initial: Duration,

    /// Upper bound of the delay between failing receives.
    #[clap(
        long = "receive-backoff-max",
        env = "EVENT_INGESTER_RECEIVE_BACKOFF_MAX",
        default_value = "30s",
        value_parser = parse_duration,
        action
    )]
    pub receive_backoff_max: Duration,
}

impl QueueConfig {
    /// Check the combination of values clap cannot check on its own.
    pub fn validate(&self) -> Result<(), QueueConfigError> {
        ensure!(
            self.queue_name.is_some() || self.queue_url.is_some(),
            MissingQueueSnafu
        );
        self.validate_polling()?;
        ensure!(
            self.queue_access_key_id.is_some() == self.queue_secret_access_key.is_some(),
            IncompleteCredentialsSnafu
        );
        Ok(())
    }

    /// Like [`validate`](Self::validate), but without requiring a queue to be named.
    pub fn validate_polling(&self) -> Result<(), QueueConfigError> {
        ensure!(
            self.wait_time <= MAX_WAIT_TIME,
            WaitTimeTooLongSnafu {
                wait_time: self.wait_time
            }
        );
        if let Some(visibility_timeout) = self.visibility_timeout {
            ensure!(
                visibility_timeout <= MAX_VISIBILITY_TIMEOUT,
                VisibilityTimeoutTooLongSnafu { visibility_timeout }
            );
        }
        ensure!(
            self.receive_backoff_initial <= self.receive_backoff_max,
            InvalidReceiveBackoffSnafu {
                initial: self.receive_backoff_initial,
                max: self.receive_backoff_max,
            }
        );
        Ok(())
    }

    /// The configured visibility timeout, or the SQS default when unset.
    pub fn effective_visibility_timeout(&self) -> Duration {
        self.visibility_timeout.unwrap_or(DEFAULT_VISIBILITY_TIMEOUT)
    }
}
