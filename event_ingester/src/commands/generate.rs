//! Synthetic sample events, for trying out a pipeline end to end.

use std::{sync::Arc, time::Duration};

use anyhow::bail;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use event_ingester_clap_blocks::{logging::LoggingConfig, queue::QueueConfig};
use event_ingester_shutdown::wait_for_signal;
use event_ingester_time::{SystemProvider, TimeProvider};
use rand::{Rng, SeedableRng, rngs::StdRng, seq::SliceRandom};
use serde_json::{Map, Value, json};
use thiserror::Error;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use super::common::{QueueSetupError, connect_queue};

#[derive(Debug, Error)]
pub(crate) enum Error {
    #[error(transparent)]
    Queue(#[from] QueueSetupError),

    #[error("Unable to serialize event: {0}")]
    Serialize(#[from] serde_json::Error),
}

#[derive(Debug, clap::Parser)]
pub(crate) struct Config {
    #[clap(flatten)]
    pub(crate) logging_config: LoggingConfig,

    /// Events generated per second.
    #[clap(
        long = "rate",
        env = "EVENT_INGESTER_GENERATE_RATE",
        default_value = "10",
        value_parser = parse_rate,
        action
    )]
    rate: f64,

    /// Stop after this many events. Runs until interrupted if unset.
    #[clap(long = "count", env = "EVENT_INGESTER_GENERATE_COUNT", action)]
    count: Option<u64>,

    /// Seed for the random generator, for a reproducible sequence of events.
    #[clap(long = "seed", env = "EVENT_INGESTER_GENERATE_SEED", action)]
    seed: Option<u64>,

    /// Also send every event to the queue, not just print it.
    #[clap(long = "send", action)]
    send: bool,

    #[clap(flatten)]
    queue_config: QueueConfig,
}

fn parse_rate(s: &str) -> anyhow::Result<f64> {
    let rate: f64 = s.parse()?;
    if !rate.is_finite() || rate <= 0. {
        bail!("rate must be a positive number of events per second, got {s}");
    }
    if Duration::try_from_secs_f64(1. / rate)?.is_zero() {
        bail!("rate {s} is too high, events would be generated with no delay between them");
    }
    Ok(rate)
}

const EVENT_TYPES: [(&str, &str); 3] = [
    ("submission_success", "submissionSuccess"),
    ("registration_initiated", "registrationInitiated"),
    ("another_event", "anotherEvent"),
];

const PLATFORMS: [&str; 2] = ["android", "ios"];

const OPTIONAL_FIELDS: [&str; 7] = [
    "context_app_version",
    "context_device_ad_tracking_enabled",
    "context_library_name",
    "context_library_version",
    "context_timezone",
    "user_id",
    "context_device_token",
];

/// Produces analytics-style sample events: a fixed set of device context fields plus a random
/// subset of optional ones.
#[derive(Debug)]
pub(crate) struct EventGenerator<R> {
    rng: R,
    time_provider: Arc<dyn TimeProvider>,
}

impl EventGenerator<StdRng> {
    pub(crate) fn new(seed: Option<u64>, time_provider: Arc<dyn TimeProvider>) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self { rng, time_provider }
    }
}

impl<R: Rng> EventGenerator<R> {
    pub(crate) fn next_event(&mut self) -> Map<String, Value> {
        let now = self.time_provider.now().date_time();
        let (event, event_text) = *EVENT_TYPES
            .choose(&mut self.rng)
            .unwrap_or(&EVENT_TYPES[0]);
        let platform = *PLATFORMS.choose(&mut self.rng).unwrap_or(&PLATFORMS[0]);

        // the client clock lags the server a little
        let sent_at = now - chrono::Duration::milliseconds(self.rng.gen_range(100..5_000));
        let timestamp = sent_at - chrono::Duration::milliseconds(self.rng.gen_range(0..10_000));

        let mut fields = Map::new();
        fields.insert("id".into(), self.uuid().into());
        fields.insert("received_at".into(), format_timestamp(now).into());
        fields.insert("anonymous_id".into(), self.uuid().into());
        fields.insert("context_device_manufacturer".into(), "Apple".into());
        fields.insert("context_device_model".into(), "iPhone8,4".into());
        fields.insert("context_device_type".into(), platform.into());
        fields.insert("context_locale".into(), "de-DE".into());
        fields.insert("context_network_wifi".into(), self.rng.r#gen::<bool>().into());
        fields.insert("context_os_name".into(), platform.into());
        fields.insert("event".into(), event.into());
        fields.insert("event_text".into(), event_text.into());
        fields.insert(
            "original_timestamp".into(),
            timestamp.format("%Y-%m-%dT%H:%M:%S%.3f%z").to_string().into(),
        );
        fields.insert("sent_at".into(), format_timestamp(sent_at).into());
        fields.insert("timestamp".into(), format_timestamp(timestamp).into());
        fields.insert("context_network_carrier".into(), "o2-de".into());
        fields.insert("context_traits_taxfix_language".into(), "en-DE".into());

        let n_optional = self.rng.gen_range(0..=OPTIONAL_FIELDS.len());
        for &key in OPTIONAL_FIELDS.choose_multiple(&mut self.rng, n_optional) {
            let value = self.optional_value(key);
            fields.insert(key.into(), value);
        }

        fields
    }

    fn optional_value(&mut self, key: &str) -> Value {
        match key {
            "context_app_version" => json!("1.2.3"),
            "context_device_ad_tracking_enabled" => json!(self.rng.r#gen::<bool>()),
            "context_library_name" => json!("analytics-ios"),
            "context_library_version" => json!("3.6.7"),
            "context_timezone" => json!("Europe/Berlin"),
            "user_id" => json!(self.rng.gen_range(1..=10_000_000_u32).to_string()),
            _ => Value::Null,
        }
    }

    fn uuid(&mut self) -> String {
        uuid::Builder::from_random_bytes(self.rng.r#gen())
            .into_uuid()
            .hyphenated()
            .to_string()
            .to_uppercase()
    }
}

fn format_timestamp(t: DateTime<Utc>) -> String {
    t.format("%Y-%m-%d %H:%M:%S%.6f").to_string()
}

pub(crate) async fn command(config: Config) -> Result<(), Error> {
    let queue = if config.send {
        Some(connect_queue(&config.queue_config).await?)
    } else {
        None
    };

    let mut generator = EventGenerator::new(config.seed, Arc::new(SystemProvider::new()));
    let mut ticker = tokio::time::interval(Duration::from_secs_f64(1. / config.rate));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let signal = wait_for_signal();
    tokio::pin!(signal);

    let mut generated = 0_u64;
    let mut sent = 0_u64;
    let mut send_failures = 0_u64;
    info!(rate = config.rate, count = ?config.count, send = config.send, "generating events");

    while config.count.is_none_or(|count| generated < count) {
        tokio::select! {
            _ = &mut signal => break,
            _ = ticker.tick() => {}
        }

        let body = serde_json::to_string(&generator.next_event())?;
        generated += 1;
        println!("{body}");

        if let Some(queue) = &queue {
            match queue.send(Bytes::from(body)).await {
                Ok(message_id) => {
                    debug!(%message_id, "sent event");
                    sent += 1;
                }
                Err(e) => {
                    warn!(error = %e, "failed to send event");
                    send_failures += 1;
                }
            }
        }
    }

    info!(generated, sent, send_failures, "finished generating events");
    Ok(())
}
