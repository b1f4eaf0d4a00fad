use std::{collections::HashSet, sync::Arc, time::Duration};

use async_trait::async_trait;
use bytes::Bytes;
use event_ingester_time::{Time, TimeProvider};
use parking_lot::Mutex;

use crate::{
    DeleteOutcome, MAX_RECEIVE_MESSAGES, MessageId, MessageQueue, MessageRef, QueueError,
    RawMessage, ReceiptHandle, check_delete_batch_size,
};

/// Visibility timeout used by [`MockQueue::new`].
pub const DEFAULT_VISIBILITY_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug)]
struct StoredMessage {
    id: MessageId,
    body: Bytes,
    /// Handle issued by the most recent receive, if any
    receipt_handle: Option<ReceiptHandle>,
    /// `None` if the message has never been received
    invisible_until: Option<Time>,
    receive_count: u32,
}

impl StoredMessage {
    fn is_visible(&self, now: Time) -> bool {
        self.invisible_until.is_none_or(|until| until <= now)
    }
}

#[derive(Debug, Default)]
struct MockQueueState {
    messages: Vec<StoredMessage>,
    next_message: u64,
    next_receipt: u64,

    /// Number of upcoming receive calls that fail with a transport error
    failing_receives: usize,
    /// Number of upcoming delete calls that fail with a transport error
    failing_deletes: usize,
    /// Messages whose deletes are refused per entry
    rejected_deletes: HashSet<MessageId>,

    receive_calls: usize,
    delete_calls: Vec<Vec<MessageRef>>,
}

/// An in-memory [`MessageQueue`] with SQS-like semantics.
///
/// * Received messages become invisible for the visibility timeout, measured on the injected
///   [`TimeProvider`]; moving a `MockProvider` past it makes them receivable again with a new
///   receipt handle.
/// * A delete only succeeds with the receipt handle of the latest receive.
/// * Faults can be injected for receives, whole delete requests, and individual delete entries.
#[derive(Debug, Clone)]
pub struct MockQueue {
    state: Arc<Mutex<MockQueueState>>,
    time_provider: Arc<dyn TimeProvider>,
    visibility_timeout: Duration,
}

impl MockQueue {
    pub fn new(time_provider: Arc<dyn TimeProvider>) -> Self {
        Self::new_with_visibility_timeout(time_provider, DEFAULT_VISIBILITY_TIMEOUT)
    }

    pub fn new_with_visibility_timeout(
        time_provider: Arc<dyn TimeProvider>,
        visibility_timeout: Duration,
    ) -> Self {
        Self {
            state: Default::default(),
            time_provider,
            visibility_timeout,
        }
    }

    /// Enqueue a message, returning its id.
    pub fn push(&self, body: impl Into<Bytes>) -> MessageId {
        let mut state = self.state.lock();
        state.next_message += 1;
        let id = MessageId::new(format!("msg-{:06}", state.next_message));
        state.messages.push(StoredMessage {
            id: id.clone(),
            body: body.into(),
            receipt_handle: None,
            invisible_until: None,
            receive_count: 0,
        });
        id
    }

    /// Fail the next `n` receive calls with a transport error.
    pub fn fail_next_receives(&self, n: usize) {
        self.state.lock().failing_receives = n;
    }

    /// Fail the next `n` delete calls with a transport error.
    pub fn fail_next_deletes(&self, n: usize) {
        self.state.lock().failing_deletes = n;
    }

    /// Refuse every delete entry for `id`, as SQS does for an expired receipt handle.
    pub fn reject_deletes_for(&self, id: &MessageId) {
        self.state.lock().rejected_deletes.insert(id.clone());
    }

    /// Messages not yet deleted, whether currently visible or in flight.
    pub fn len(&self) -> usize {
        self.state.lock().messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Messages that a receive issued now could return.
    pub fn visible_len(&self) -> usize {
        let now = self.time_provider.now();
        self.state
            .lock()
            .messages
            .iter()
            .filter(|m| m.is_visible(now))
            .count()
    }

    /// Ids of the messages not yet deleted, in enqueue order.
    pub fn remaining_ids(&self) -> Vec<MessageId> {
        self.state
            .lock()
            .messages
            .iter()
            .map(|m| m.id.clone())
            .collect()
    }

    pub fn receive_calls(&self) -> usize {
        self.state.lock().receive_calls
    }

    /// Every delete request made, in call order, including failed ones.
    pub fn delete_calls(&self) -> Vec<Vec<MessageRef>> {
        self.state.lock().delete_calls.clone()
    }

    /// All message ids passed to a delete request.
    pub fn deleted_ids(&self) -> Vec<MessageId> {
        self.state
            .lock()
            .delete_calls
            .iter()
            .flatten()
            .map(|r| r.id.clone())
            .collect()
    }

    fn receive_now(&self, max_messages: usize) -> Result<Vec<RawMessage>, QueueError> {
        let now = self.time_provider.now();
        let invisible_until = now + self.visibility_timeout;
        let max_messages = max_messages.min(MAX_RECEIVE_MESSAGES);

        let mut state = self.state.lock();
        if state.failing_receives > 0 {
            state.failing_receives -= 1;
            return Err(QueueError::transport("injected receive failure"));
        }

        let MockQueueState {
            messages,
            next_receipt,
            ..
        } = &mut *state;

        let mut out = Vec::new();
        for message in messages.iter_mut() {
            if out.len() == max_messages {
                break;
            }
            if !message.is_visible(now) {
                continue;
            }

            *next_receipt += 1;
            let receipt_handle = ReceiptHandle::new(format!("{}-rh-{next_receipt}", message.id));
            message.receipt_handle = Some(receipt_handle.clone());
            message.invisible_until = Some(invisible_until);
            message.receive_count += 1;

            out.push(RawMessage {
                id: message.id.clone(),
                receipt_handle,
                body: message.body.clone(),
                receive_count: Some(message.receive_count),
            });
        }

        Ok(out)
    }
}

#[async_trait]
impl MessageQueue for MockQueue {
    async fn receive(
        &self,
        max_messages: usize,
        wait: Duration,
    ) -> Result<Vec<RawMessage>, QueueError> {
        self.state.lock().receive_calls += 1;

        let messages = self.receive_now(max_messages)?;
        if messages.is_empty() && !wait.is_zero() {
            // long poll: wait it out, messages pushed meanwhile show up on the next receive
            tokio::time::sleep(wait).await;
        } else {
            tokio::task::yield_now().await;
        }
        Ok(messages)
    }

    async fn delete_batch(&self, refs: &[MessageRef]) -> Result<Vec<DeleteOutcome>, QueueError> {
        check_delete_batch_size(refs)?;

        let mut state = self.state.lock();
        state.delete_calls.push(refs.to_vec());

        if state.failing_deletes > 0 {
            state.failing_deletes -= 1;
            return Err(QueueError::transport("injected delete failure"));
        }

        let outcomes = refs
            .iter()
            .map(|r| {
                if state.rejected_deletes.contains(&r.id) {
                    return DeleteOutcome::Failed {
                        id: r.id.clone(),
                        code: "ReceiptHandleIsInvalid".to_string(),
                        reason: "delete rejected by test setup".to_string(),
                    };
                }

                let position = state.messages.iter().position(|m| {
                    m.id == r.id && m.receipt_handle.as_ref() == Some(&r.receipt_handle)
                });
                match position {
                    Some(i) => {
                        state.messages.remove(i);
                        DeleteOutcome::Deleted(r.id.clone())
                    }
                    None => DeleteOutcome::Failed {
                        id: r.id.clone(),
                        code: "ReceiptHandleIsInvalid".to_string(),
                        reason: "receipt handle is stale or message already deleted".to_string(),
                    },
                }
            })
            .collect();

        Ok(outcomes)
    }

    async fn send(&self, body: Bytes) -> Result<MessageId, QueueError> {
        Ok(self.push(body))
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use event_ingester_time::MockProvider;

    use super::*;

    fn queue() -> (MockQueue, Arc<MockProvider>) {
        let time_provider = Arc::new(MockProvider::new(Time::from_timestamp_nanos(0)));
        let queue = MockQueue::new_with_visibility_timeout(
            Arc::clone(&time_provider) as _,
            Duration::from_secs(30),
        );
        (queue, time_provider)
    }

    #[test_log::test(tokio::test)]
    async fn receive_is_bounded_and_hides_messages() {
        let (queue, _time) = queue();
        for i in 0..15 {
            queue.push(format!(r#"{{"n":{i}}}"#));
        }

        let first = queue.receive(100, Duration::ZERO).await.unwrap();
        assert_eq!(first.len(), MAX_RECEIVE_MESSAGES);
        let second = queue.receive(10, Duration::ZERO).await.unwrap();
        assert_eq!(second.len(), 5);
        let third = queue.receive(10, Duration::ZERO).await.unwrap();
        assert!(third.is_empty());

        assert_eq!(queue.len(), 15);
        assert_eq!(queue.visible_len(), 0);
        assert_eq!(queue.receive_calls(), 3);
    }

    #[test_log::test(tokio::test)]
    async fn unacknowledged_messages_are_redelivered() {
        let (queue, time) = queue();
        let id = queue.push("{}");

        let first = queue.receive(10, Duration::ZERO).await.unwrap();
        assert_eq!(first[0].receive_count, Some(1));

        time.inc(Duration::from_secs(29));
        assert!(queue.receive(10, Duration::ZERO).await.unwrap().is_empty());

        time.inc(Duration::from_secs(1));
        let second = queue.receive(10, Duration::ZERO).await.unwrap();
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].id, id);
        assert_eq!(second[0].receive_count, Some(2));
        assert_ne!(second[0].receipt_handle, first[0].receipt_handle);

        // the first receipt handle went stale with the redelivery
        let outcomes = queue.delete_batch(&[first[0].message_ref()]).await.unwrap();
        assert_matches!(&outcomes[..], [DeleteOutcome::Failed { code, .. }] if code == "ReceiptHandleIsInvalid");

        let outcomes = queue.delete_batch(&[second[0].message_ref()]).await.unwrap();
        assert_eq!(outcomes, vec![DeleteOutcome::Deleted(id)]);
        assert!(queue.is_empty());
    }

    #[test_log::test(tokio::test)]
    async fn injected_faults() {
        let (queue, _time) = queue();
        let a = queue.push("a");
        let b = queue.push("b");

        queue.fail_next_receives(1);
        assert_matches!(
            queue.receive(10, Duration::ZERO).await,
            Err(QueueError::Transport(_))
        );
        let received = queue.receive(10, Duration::ZERO).await.unwrap();
        let refs: Vec<_> = received.iter().map(RawMessage::message_ref).collect();

        queue.fail_next_deletes(1);
        assert_matches!(queue.delete_batch(&refs).await, Err(QueueError::Transport(_)));

        queue.reject_deletes_for(&a);
        let outcomes = queue.delete_batch(&refs).await.unwrap();
        assert!(!outcomes[0].is_deleted());
        assert_eq!(outcomes[1], DeleteOutcome::Deleted(b.clone()));

        assert_eq!(queue.remaining_ids(), vec![a]);
        assert_eq!(queue.delete_calls().len(), 2);
    }

    #[test_log::test(tokio::test)]
    async fn oversized_delete_is_refused() {
        let (queue, _time) = queue();
        let refs: Vec<_> = (0..11)
            .map(|i| MessageRef {
                id: MessageId::new(format!("m{i}")),
                receipt_handle: ReceiptHandle::new("rh"),
            })
            .collect();

        assert_matches!(
            queue.delete_batch(&refs).await,
            Err(QueueError::TooManyEntries { got: 11, max: 10 })
        );
        assert!(queue.delete_calls().is_empty());
    }
}
