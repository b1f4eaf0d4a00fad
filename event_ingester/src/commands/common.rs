//! Setup shared by the subcommands.

use std::sync::Arc;

use event_ingester_clap_blocks::queue::{QueueConfig, QueueConfigError};
use event_ingester_queue::{MessageQueue, QueueError};
use thiserror::Error;

#[derive(Debug, Error)]
pub(crate) enum QueueSetupError {
    #[error("Invalid queue configuration: {0}")]
    Config(#[from] QueueConfigError),

    #[error("Cannot connect to queue: {0}")]
    Connect(#[from] QueueError),

    #[cfg_attr(feature = "aws", allow(dead_code))]
    #[error("SQS support was not compiled in (enable the `aws` feature)")]
    SqsNotCompiledIn,
}

/// Validate `config` and connect to the queue it names.
///
/// Fails if the queue URL cannot be resolved, which usually means a wrong name or region, or
/// credentials without access to the queue.
#[cfg(feature = "aws")]
pub(crate) async fn connect_queue(
    config: &QueueConfig,
) -> Result<Arc<dyn MessageQueue>, QueueSetupError> {
    use event_ingester_queue::sqs::{SqsQueue, SqsQueueConfig};

    config.validate()?;

    let queue = SqsQueue::connect(SqsQueueConfig {
        queue_name: config.queue_name.clone(),
        queue_url: config.queue_url.clone(),
        region: config.queue_region.clone(),
        endpoint: config.queue_endpoint.clone().map(String::from),
        access_key_id: config
            .queue_access_key_id
            .as_ref()
            .map(|s| s.as_str().to_string()),
        secret_access_key: config
            .queue_secret_access_key
            .as_ref()
            .map(|s| s.as_str().to_string()),
        session_token: config.queue_session_token.clone(),
        visibility_timeout: config.visibility_timeout,
    })
    .await?;

    Ok(Arc::new(queue))
}

#[cfg(not(feature = "aws"))]
pub(crate) async fn connect_queue(
    config: &QueueConfig,
) -> Result<Arc<dyn MessageQueue>, QueueSetupError> {
    config.validate()?;
    Err(QueueSetupError::SqsNotCompiledIn)
}
