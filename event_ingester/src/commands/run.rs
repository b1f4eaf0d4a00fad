//! Entrypoint for the ingest loop

use std::sync::Arc;

use event_ingester_clap_blocks::{
    flush::{FlushConfig, FlushConfigError},
    logging::LoggingConfig,
    object_store::{ObjectStoreConfig, ObjectStoreType, ParseError},
    queue::{QueueConfig, QueueConfigError},
};
use event_ingester_pipeline::{
    AckTracker, BackoffConfig, FlushPolicy, FlushWriter, PollConfig, PollLoop, PollStats,
};
use event_ingester_queue::MessageQueue;
use event_ingester_shutdown::{ShutdownManager, wait_for_signal};
use event_ingester_time::{SystemProvider, TimeProvider};
use object_store::{ObjectStore, path::Path};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::common::{QueueSetupError, connect_queue};

#[derive(Debug, Error)]
pub(crate) enum Error {
    #[error("Invalid queue configuration: {0}")]
    QueueConfig(#[from] QueueConfigError),

    #[error("Invalid flush configuration: {0}")]
    FlushConfig(#[from] FlushConfigError),

    #[error("Cannot parse object store config: {0}")]
    ObjectStoreParsing(#[from] ParseError),

    #[error(transparent)]
    Queue(#[from] QueueSetupError),

    #[error("Poll loop task failed: {0}")]
    PollLoopTask(#[from] tokio::task::JoinError),
}

pub(crate) type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, clap::Parser)]
pub(crate) struct Config {
    #[clap(flatten)]
    pub(crate) logging_config: LoggingConfig,

    #[clap(flatten)]
    queue_config: QueueConfig,

    #[clap(flatten)]
    object_store_config: ObjectStoreConfig,

    #[clap(flatten)]
    flush_config: FlushConfig,
}

impl Config {
    fn poll_config(&self) -> PollConfig {
        let queue = &self.queue_config;
        PollConfig {
            max_messages: usize::from(queue.max_messages),
            wait_time: queue.wait_time,
            receive_backoff: BackoffConfig {
                init_backoff: queue.receive_backoff_initial,
                max_backoff: queue.receive_backoff_max,
                ..Default::default()
            },
        }
    }

    fn flush_policy(&self) -> FlushPolicy {
        let flush = &self.flush_config;
        FlushPolicy {
            cycles: flush.flush_cycles,
            max_events: flush.flush_max_events,
            max_bytes: flush.flush_max_bytes,
            max_age: flush.flush_max_age,
        }
    }

    /// Everything that can be checked before talking to AWS.
    fn validate(&self) -> Result<()> {
        self.queue_config.validate()?;
        self.flush_config.validate()?;

        let wait_time = self.queue_config.wait_time;
        let visibility_timeout = self.queue_config.effective_visibility_timeout();
        if self.flush_config.redelivery_risk(wait_time, visibility_timeout) {
            warn!(
                flush_cycles = self.flush_config.flush_cycles.get(),
                ?wait_time,
                ?visibility_timeout,
                latency_bound = ?self.flush_config.batch_latency_bound(wait_time),
                "batches may be flushed close to or after the visibility timeout; messages \
                 would be redelivered and stored twice"
            );
        }
        if self.object_store_config.object_store == ObjectStoreType::Memory {
            warn!(
                "--object-store memory keeps flushed batches only until the process exits; \
                 their messages are still deleted from the queue"
            );
        }
        if self.flush_config.unbounded_by_age() {
            warn!(
                flush_cycles = self.flush_config.flush_cycles.get(),
                "no --flush-max-age set; with sparse traffic a pending batch can outlive the \
                 visibility timeout"
            );
        }
        Ok(())
    }

    fn build_poll_loop(
        &self,
        queue: Arc<dyn MessageQueue>,
        object_store: Arc<dyn ObjectStore>,
        time_provider: Arc<dyn TimeProvider>,
    ) -> PollLoop {
        let writer = FlushWriter::new(
            object_store,
            Arc::clone(&time_provider),
            self.flush_config.object_prefix().map(Path::from),
            self.flush_config.put_timeout,
        );
        let ack_tracker = AckTracker::new(
            Arc::clone(&queue),
            self.flush_config.ack_attempts,
            BackoffConfig::default(),
        );

        PollLoop::new(
            queue,
            writer,
            ack_tracker,
            self.flush_policy(),
            time_provider,
            self.poll_config(),
        )
    }
}

pub(crate) async fn command(config: Config) -> Result<()> {
    config.validate()?;

    let object_store = config.object_store_config.make_object_store()?;
    let queue = connect_queue(&config.queue_config).await?;
    let time_provider: Arc<dyn TimeProvider> = Arc::new(SystemProvider::new());
    let poll_loop = config.build_poll_loop(queue, object_store, time_provider);

    let process_shutdown = CancellationToken::new();
    let shutdown_manager = ShutdownManager::new(process_shutdown.clone());
    let token = shutdown_manager.register();
    let pipeline_shutdown = token.cancellation_token();
    let pipeline = tokio::spawn(async move {
        let stats = poll_loop.run(pipeline_shutdown).await;
        token.complete();
        stats
    });

    wait_for_signal().await;
    info!("shutting down, waiting for the pending batch to be flushed");
    shutdown_manager.shutdown();
    shutdown_manager.join().await;

    let PollStats {
        cycles,
        received,
        decode_failures,
        flushes,
        flush_failures,
        events_flushed,
        bytes_flushed,
        acked,
        ack_failures,
        ..
    } = pipeline.await?;
    info!(
        cycles,
        received,
        decode_failures,
        flushes,
        flush_failures,
        events_flushed,
        bytes_flushed,
        acked,
        ack_failures,
        "event ingester stopped"
    );

    Ok(())
}
