//! Persisting batches as objects.

use std::{sync::Arc, time::Duration};

use bytes::Bytes;
use event_ingester_queue::MessageRef;
use event_ingester_time::{Time, TimeProvider};
use object_store::{ObjectStore, PutPayload, path::Path};
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

use crate::{accumulator::Batch, decoder::DecodedEvent};

/// Default bound on a single object put.
pub const DEFAULT_PUT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum FlushError {
    #[error("refusing to flush an empty batch")]
    EmptyBatch,

    #[error("failed to serialize batch: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("failed to put object {object}: {source}")]
    Store {
        object: Path,
        #[source]
        source: object_store::Error,
    },

    #[error("put of object {object} did not complete within {timeout:?}")]
    Timeout { object: Path, timeout: Duration },
}

/// Returned by [`FlushWriter::write`] once a batch is durably stored.
///
/// Only the writer can create one, so holding a `FlushedBatch` is proof that its refs are safe
/// to delete from the queue.
#[derive(Debug)]
pub struct FlushedBatch {
    object: Path,
    n_events: usize,
    n_bytes: usize,
    refs: Vec<MessageRef>,
}

impl FlushedBatch {
    pub(crate) fn new(
        object: Path,
        n_events: usize,
        n_bytes: usize,
        refs: Vec<MessageRef>,
    ) -> Self {
        Self {
            object,
            n_events,
            n_bytes,
            refs,
        }
    }

    pub fn object(&self) -> &Path {
        &self.object
    }

    pub fn n_events(&self) -> usize {
        self.n_events
    }

    /// Size of the stored object
    pub fn n_bytes(&self) -> usize {
        self.n_bytes
    }

    pub fn refs(&self) -> &[MessageRef] {
        &self.refs
    }
}

/// Writes each batch as one JSON array object named
/// `[<prefix>/]<YYYYMMDD>/<HHMMSS>-<uuid v4>.json`, with the date and time in UTC.
#[derive(Debug)]
pub struct FlushWriter {
    object_store: Arc<dyn ObjectStore>,
    time_provider: Arc<dyn TimeProvider>,
    prefix: Option<Path>,
    put_timeout: Duration,
}

impl FlushWriter {
    pub fn new(
        object_store: Arc<dyn ObjectStore>,
        time_provider: Arc<dyn TimeProvider>,
        prefix: Option<Path>,
        put_timeout: Duration,
    ) -> Self {
        Self {
            object_store,
            time_provider,
            prefix: prefix.filter(|p| p.parts().next().is_some()),
            put_timeout,
        }
    }

    /// Name for an object created at `now`.
    ///
    /// Names sort by creation time within a day; the random suffix keeps names created in the
    /// same second, by this or any other writer, apart.
    pub fn object_name(&self, now: Time) -> Path {
        let now = now.date_time();
        let day = now.format("%Y%m%d").to_string();
        let file = format!("{}-{}.json", now.format("%H%M%S"), Uuid::new_v4());

        match &self.prefix {
            Some(prefix) => prefix.child(day).child(file),
            None => Path::from_iter([day, file]),
        }
    }

    /// Store `batch` as a single object.
    ///
    /// The batch is consumed either way: on error its events are gone and its messages must be
    /// left on the queue to be redelivered.
    pub async fn write(&self, batch: Batch) -> Result<FlushedBatch, FlushError> {
        if batch.is_empty() {
            return Err(FlushError::EmptyBatch);
        }

        let (events, refs) = batch.into_parts();
        let data = serialize_events(&events)?;
        let n_bytes = data.len();
        let object = self.object_name(self.time_provider.now());

        let put = self.object_store.put(&object, PutPayload::from_bytes(data));
        match tokio::time::timeout(self.put_timeout, put).await {
            Ok(Ok(_)) => {}
            Ok(Err(source)) => return Err(FlushError::Store { object, source }),
            Err(_) => {
                return Err(FlushError::Timeout {
                    object,
                    timeout: self.put_timeout,
                });
            }
        }

        info!(
            %object,
            n_events = events.len(),
            n_bytes,
            n_refs = refs.len(),
            "flushed batch to object store"
        );

        Ok(FlushedBatch::new(object, events.len(), n_bytes, refs))
    }
}

fn serialize_events(events: &[DecodedEvent]) -> Result<Bytes, serde_json::Error> {
    let fields: Vec<_> = events.iter().map(DecodedEvent::fields).collect();
    Ok(Bytes::from(serde_json::to_vec(&fields)?))
}
