//! Deleting the messages of a flushed batch from the queue.

use std::{num::NonZeroUsize, sync::Arc};

use backoff::backoff::Backoff;
use event_ingester_queue::{
    DeleteOutcome, MAX_DELETE_BATCH_SIZE, MessageId, MessageQueue, MessageRef, QueueError,
};
use thiserror::Error;
use tracing::{debug, warn};

use crate::{BackoffConfig, writer::FlushedBatch};

/// Default number of attempts for a delete request that fails in transit.
pub const DEFAULT_ACK_ATTEMPTS: NonZeroUsize = match NonZeroUsize::new(3) {
    Some(n) => n,
    None => unreachable!(),
};

/// A message that could not be deleted and will be redelivered.
#[derive(Debug, Error)]
pub enum DeleteFailure {
    #[error("queue refused to delete message {id} ({code}): {reason}")]
    Rejected {
        id: MessageId,
        code: String,
        reason: String,
    },

    #[error("delete request for {n_refs} messages failed after {attempts} attempt(s): {source}")]
    RequestFailed {
        n_refs: usize,
        attempts: usize,
        #[source]
        source: QueueError,
    },
}

/// Result of acknowledging one flushed batch.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct AckSummary {
    pub deleted: usize,
    /// Messages left on the queue, to be redelivered after their visibility timeout
    pub failed: usize,
}

impl AckSummary {
    pub fn requested(&self) -> usize {
        self.deleted + self.failed
    }
}

/// Deletes the source messages of flushed batches.
#[derive(Debug)]
pub struct AckTracker {
    queue: Arc<dyn MessageQueue>,
    max_attempts: NonZeroUsize,
    backoff: BackoffConfig,
}

impl AckTracker {
    pub fn new(
        queue: Arc<dyn MessageQueue>,
        max_attempts: NonZeroUsize,
        backoff: BackoffConfig,
    ) -> Self {
        Self {
            queue,
            max_attempts,
            backoff,
        }
    }

    /// Delete every message of `flushed`, in requests of at most [`MAX_DELETE_BATCH_SIZE`].
    ///
    /// Failures are logged and counted, never returned: a message that is not deleted comes
    /// back through the queue and its events are stored again.
    pub async fn ack(&self, flushed: &FlushedBatch) -> AckSummary {
        let mut summary = AckSummary::default();

        for chunk in flushed.refs().chunks(MAX_DELETE_BATCH_SIZE) {
            let outcomes = match self.delete_chunk(chunk).await {
                Ok(outcomes) => outcomes,
                Err(e) => {
                    warn!(
                        object = %flushed.object(),
                        error = %e,
                        "messages not acknowledged, they will be redelivered"
                    );
                    summary.failed += chunk.len();
                    continue;
                }
            };

            for outcome in outcomes {
                match outcome {
                    DeleteOutcome::Deleted(_) => summary.deleted += 1,
                    DeleteOutcome::Failed { id, code, reason } => {
                        let e = DeleteFailure::Rejected { id, code, reason };
                        warn!(
                            object = %flushed.object(),
                            error = %e,
                            "message not acknowledged, it will be redelivered"
                        );
                        summary.failed += 1;
                    }
                }
            }
        }

        debug!(
            object = %flushed.object(),
            deleted = summary.deleted,
            failed = summary.failed,
            "acknowledged flushed batch"
        );
        summary
    }

    async fn delete_chunk(
        &self,
        chunk: &[MessageRef],
    ) -> Result<Vec<DeleteOutcome>, DeleteFailure> {
        let mut backoff = self.backoff.backoff();
        let mut attempts = 0;

        loop {
            attempts += 1;
            match self.queue.delete_batch(chunk).await {
                Ok(outcomes) => return Ok(outcomes),
                Err(e) if e.is_transient() && attempts < self.max_attempts.get() => {
                    let delay = backoff.next_backoff().unwrap_or(self.backoff.max_backoff);
                    warn!(
                        error = %e,
                        attempts,
                        ?delay,
                        n_refs = chunk.len(),
                        "delete request failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(source) => {
                    return Err(DeleteFailure::RequestFailed {
                        n_refs: chunk.len(),
                        attempts,
                        source,
                    });
                }
            }
        }
    }
}
