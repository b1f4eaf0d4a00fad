//! Amazon SQS implementation of [`MessageQueue`].

use std::time::Duration;

use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_sqs::{
    Client,
    config::{Credentials, Region},
    error::DisplayErrorContext,
    types::{
        BatchResultErrorEntry, DeleteMessageBatchRequestEntry, DeleteMessageBatchResultEntry,
        MessageSystemAttributeName,
    },
};
use bytes::Bytes;
use tracing::{info, warn};

use crate::{
    DeleteOutcome, MAX_RECEIVE_MESSAGES, MAX_WAIT_TIME, MessageId, MessageQueue, MessageRef,
    QueueError, RawMessage, ReceiptHandle, check_delete_batch_size,
};

/// Where the queue lives and how to authenticate against it.
#[derive(Debug, Clone, Default)]
pub struct SqsQueueConfig {
    /// Queue name, resolved to a URL at connect time. Ignored if `queue_url` is set.
    pub queue_name: Option<String>,
    pub queue_url: Option<String>,
    pub region: String,
    /// Custom endpoint, e.g. LocalStack or ElasticMQ
    pub endpoint: Option<String>,
    /// Static credentials; the default AWS credential chain is used when unset.
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
    pub session_token: Option<String>,
    /// Per-receive visibility timeout override; the queue default applies when unset.
    pub visibility_timeout: Option<Duration>,
}

#[derive(Debug, Clone)]
pub struct SqsQueue {
    client: Client,
    queue_url: String,
    visibility_timeout: Option<Duration>,
}

impl SqsQueue {
    /// Build a client and resolve the queue URL.
    ///
    /// Fails if the queue cannot be resolved, which usually means a wrong name or region, or
    /// credentials without access to it.
    pub async fn connect(config: SqsQueueConfig) -> Result<Self, QueueError> {
        let mut loader = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(config.region.clone()));

        if let (Some(key_id), Some(secret)) = (&config.access_key_id, &config.secret_access_key) {
            loader = loader.credentials_provider(Credentials::new(
                key_id,
                secret,
                config.session_token.clone(),
                None,
                "event-ingester",
            ));
        }
        if let Some(endpoint) = &config.endpoint {
            loader = loader.endpoint_url(endpoint);
        }

        let client = Client::new(&loader.load().await);

        let queue_url = match (config.queue_url, config.queue_name) {
            (Some(url), _) => url,
            (None, Some(name)) => client
                .get_queue_url()
                .queue_name(&name)
                .send()
                .await
                .map_err(|e| {
                    warn!(queue_name = %name, error = %DisplayErrorContext(&e), "unable to resolve queue url");
                    QueueError::QueueNotFound(name.clone())
                })?
                .queue_url
                .ok_or_else(|| QueueError::QueueNotFound(name.clone()))?,
            (None, None) => {
                return Err(QueueError::Rejected(
                    "either a queue name or a queue url is required".to_string(),
                ));
            }
        };

        info!(%queue_url, region = %config.region, "connected to SQS queue");

        Ok(Self {
            client,
            queue_url,
            visibility_timeout: config.visibility_timeout,
        })
    }
}

fn secs_i32(d: Duration) -> i32 {
    i32::try_from(d.as_secs()).unwrap_or(i32::MAX)
}

fn entry_index(entry_id: &str, n_entries: usize) -> Option<usize> {
    entry_id.parse().ok().filter(|i| *i < n_entries)
}

/// Match the entries of a batch delete response back to the refs of the request.
///
/// Entry ids are request positions and the response lists them in no particular order. A ref
/// the response says nothing about is reported as failed, so it is left for redelivery.
fn delete_outcomes(
    refs: &[MessageRef],
    successful: &[DeleteMessageBatchResultEntry],
    failed: &[BatchResultErrorEntry],
) -> Vec<DeleteOutcome> {
    let mut outcomes: Vec<Option<DeleteOutcome>> = vec![None; refs.len()];
    for ok in successful {
        if let Some(i) = entry_index(ok.id(), refs.len()) {
            outcomes[i] = Some(DeleteOutcome::Deleted(refs[i].id.clone()));
        }
    }
    for failed in failed {
        if let Some(i) = entry_index(failed.id(), refs.len()) {
            outcomes[i] = Some(DeleteOutcome::Failed {
                id: refs[i].id.clone(),
                code: failed.code().to_string(),
                reason: failed.message().unwrap_or("unknown").to_string(),
            });
        }
    }

    outcomes
        .into_iter()
        .zip(refs)
        .map(|(outcome, r)| {
            outcome.unwrap_or_else(|| DeleteOutcome::Failed {
                id: r.id.clone(),
                code: "MissingResult".to_string(),
                reason: "entry absent from delete response".to_string(),
            })
        })
        .collect()
}

#[async_trait]
impl MessageQueue for SqsQueue {
    async fn receive(
        &self,
        max_messages: usize,
        wait: Duration,
    ) -> Result<Vec<RawMessage>, QueueError> {
        let max_messages = max_messages.clamp(1, MAX_RECEIVE_MESSAGES) as i32;
        let mut request = self
            .client
            .receive_message()
            .queue_url(&self.queue_url)
            .max_number_of_messages(max_messages)
            .wait_time_seconds(secs_i32(wait.min(MAX_WAIT_TIME)))
            .message_system_attribute_names(MessageSystemAttributeName::ApproximateReceiveCount);
        if let Some(visibility_timeout) = self.visibility_timeout {
            request = request.visibility_timeout(secs_i32(visibility_timeout));
        }

        let output = request.send().await.map_err(QueueError::transport)?;

        let messages = output
            .messages
            .unwrap_or_default()
            .into_iter()
            .filter_map(|message| {
                let (Some(id), Some(receipt_handle)) =
                    (message.message_id.clone(), message.receipt_handle.clone())
                else {
                    warn!(?message, "received SQS message without id or receipt handle");
                    return None;
                };
                let receive_count = message
                    .attributes
                    .as_ref()
                    .and_then(|a| a.get(&MessageSystemAttributeName::ApproximateReceiveCount))
                    .and_then(|c| c.parse().ok());

                Some(RawMessage {
                    id: MessageId::new(id),
                    receipt_handle: ReceiptHandle::new(receipt_handle),
                    body: Bytes::from(message.body.unwrap_or_default()),
                    receive_count,
                })
            })
            .collect();

        Ok(messages)
    }

    async fn delete_batch(&self, refs: &[MessageRef]) -> Result<Vec<DeleteOutcome>, QueueError> {
        check_delete_batch_size(refs)?;
        if refs.is_empty() {
            return Ok(vec![]);
        }

        // Entry ids only need to be unique within the request; the same message can appear
        // twice with different receipt handles if it was redelivered before being flushed.
        let entries = refs
            .iter()
            .enumerate()
            .map(|(i, r)| {
                DeleteMessageBatchRequestEntry::builder()
                    .id(i.to_string())
                    .receipt_handle(r.receipt_handle.as_str())
                    .build()
                    .map_err(QueueError::transport)
            })
            .collect::<Result<Vec<_>, _>>()?;

        let output = self
            .client
            .delete_message_batch()
            .queue_url(&self.queue_url)
            .set_entries(Some(entries))
            .send()
            .await
            .map_err(QueueError::transport)?;

        Ok(delete_outcomes(refs, output.successful(), output.failed()))
    }

    async fn send(&self, body: Bytes) -> Result<MessageId, QueueError> {
        let body = String::from_utf8(body.to_vec()).map_err(|_| QueueError::NonUtf8Body)?;
        let output = self
            .client
            .send_message()
            .queue_url(&self.queue_url)
            .message_body(body)
            .send()
            .await
            .map_err(QueueError::transport)?;

        Ok(MessageId::new(output.message_id.unwrap_or_default()))
    }
}
