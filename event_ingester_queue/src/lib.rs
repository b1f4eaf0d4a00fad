//! The queue side of the ingester.
//!
//! The pipeline only needs three things from a queue: receive a bounded batch of messages,
//! delete a bounded batch of messages by receipt handle, and (for the `generate` command) send
//! a message. [`MessageQueue`] captures exactly that, with at-least-once delivery and a
//! visibility timeout assumed underneath.
//!
//! Implementations:
//!
//! * [`mock::MockQueue`]: in-memory, with visibility timeout redelivery driven by a
//!   [`TimeProvider`](event_ingester_time::TimeProvider), fault injection and call recording.
//! * `sqs::SqsQueue` (feature `aws`): Amazon SQS.

use std::{fmt::Debug, time::Duration};

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

pub mod mock;
#[cfg(feature = "aws")]
pub mod sqs;

/// The maximum number of messages a single receive call may return.
pub const MAX_RECEIVE_MESSAGES: usize = 10;

/// The maximum number of entries accepted by a single batch delete call.
pub const MAX_DELETE_BATCH_SIZE: usize = 10;

/// The longest a receive call may long-poll for.
pub const MAX_WAIT_TIME: Duration = Duration::from_secs(20);

/// Generic boxed error type for transport failures of the different implementations.
pub type BoxedError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Debug, Error)]
pub enum QueueError {
    /// The queue could not be reached or the request failed in transit. Transient.
    #[error("queue request failed: {0}")]
    Transport(#[source] BoxedError),

    /// The queue answered but refused the whole request.
    #[error("queue rejected request: {0}")]
    Rejected(String),

    #[error("queue {0} does not exist or is not accessible")]
    QueueNotFound(String),

    #[error("batch of {got} entries exceeds the queue limit of {max}")]
    TooManyEntries { got: usize, max: usize },

    #[error("message body is not valid UTF-8")]
    NonUtf8Body,
}

impl QueueError {
    pub fn transport(e: impl Into<BoxedError>) -> Self {
        Self::Transport(e.into())
    }

    /// Whether retrying the same request later may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transport(_))
    }
}

/// Identifier assigned to a message by the queue.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MessageId(String);

impl MessageId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(&self.0, f)
    }
}

/// Token issued on each receive of a message; required to delete it.
///
/// A handle is only valid for the receive that issued it. Once the visibility timeout elapses
/// and the message is received again, the old handle no longer deletes it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ReceiptHandle(String);

impl ReceiptHandle {
    pub fn new(handle: impl Into<String>) -> Self {
        Self(handle.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Everything needed to acknowledge (delete) one received message.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MessageRef {
    pub id: MessageId,
    pub receipt_handle: ReceiptHandle,
}

/// A message as handed out by [`MessageQueue::receive`].
#[derive(Debug, Clone, PartialEq)]
pub struct RawMessage {
    pub id: MessageId,
    pub receipt_handle: ReceiptHandle,
    pub body: Bytes,
    /// How many times the queue has handed out this message, including this time, if known.
    pub receive_count: Option<u32>,
}

impl RawMessage {
    pub fn message_ref(&self) -> MessageRef {
        MessageRef {
            id: self.id.clone(),
            receipt_handle: self.receipt_handle.clone(),
        }
    }
}

/// Per-entry result of [`MessageQueue::delete_batch`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeleteOutcome {
    Deleted(MessageId),
    Failed {
        id: MessageId,
        code: String,
        reason: String,
    },
}

impl DeleteOutcome {
    pub fn id(&self) -> &MessageId {
        match self {
            Self::Deleted(id) => id,
            Self::Failed { id, .. } => id,
        }
    }

    pub fn is_deleted(&self) -> bool {
        matches!(self, Self::Deleted(_))
    }
}

#[async_trait]
pub trait MessageQueue: Debug + Send + Sync + 'static {
    /// Receive up to `max_messages` (at most [`MAX_RECEIVE_MESSAGES`]) messages, waiting up to
    /// `wait` for at least one to become available. An empty result is not an error.
    async fn receive(
        &self,
        max_messages: usize,
        wait: Duration,
    ) -> Result<Vec<RawMessage>, QueueError>;

    /// Delete up to [`MAX_DELETE_BATCH_SIZE`] messages, returning one outcome per entry in
    /// request order.
    ///
    /// A returned `Err` means the request as a whole failed and no outcome is known.
    async fn delete_batch(&self, refs: &[MessageRef]) -> Result<Vec<DeleteOutcome>, QueueError>;

    /// Enqueue a new message.
    async fn send(&self, body: Bytes) -> Result<MessageId, QueueError>;
}

fn check_delete_batch_size(refs: &[MessageRef]) -> Result<(), QueueError> {
    if refs.len() > MAX_DELETE_BATCH_SIZE {
        return Err(QueueError::TooManyEntries {
            got: refs.len(),
            max: MAX_DELETE_BATCH_SIZE,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delete_batch_size_is_enforced() {
        let refs: Vec<_> = (0..11)
            .map(|i| MessageRef {
                id: MessageId::new(i.to_string()),
                receipt_handle: ReceiptHandle::new(format!("rh-{i}")),
            })
            .collect();

        assert!(check_delete_batch_size(&refs[..10]).is_ok());
        let err = check_delete_batch_size(&refs).unwrap_err();
        assert_eq!(
            err.to_string(),
            "batch of 11 entries exceeds the queue limit of 10"
        );
        assert!(!err.is_transient());
    }

    #[test]
    fn transport_errors_are_transient() {
        assert!(QueueError::transport("connection reset").is_transient());
        assert!(!QueueError::Rejected("AccessDenied".into()).is_transient());
    }

    #[test]
    fn message_id_displays_as_its_value() {
        let id = MessageId::new("4f1c-a2");
        assert_eq!(id.to_string(), "4f1c-a2");
        assert_eq!(format!("{id:>9}"), "  4f1c-a2");
    }
}
