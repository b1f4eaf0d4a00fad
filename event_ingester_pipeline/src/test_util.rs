//! Helpers for exercising the pipeline without AWS.

use std::{fmt::Display, sync::Arc, time::Duration};

use async_trait::async_trait;
use bytes::Bytes;
use event_ingester_queue::MessageId;
use event_ingester_time::{MockProvider, Time};
use futures::{StreamExt, TryStreamExt, stream::BoxStream};
use object_store::{
    GetOptions, GetResult, ListResult, MultipartUpload, ObjectMeta, ObjectStore, PutMultipartOpts,
    PutOptions, PutPayload, PutResult, memory::InMemory, path::Path,
};
use parking_lot::Mutex;
use serde_json::Value;

use crate::{
    BackoffConfig,
    accumulator::FlushPolicy,
    ack::{AckTracker, DEFAULT_ACK_ATTEMPTS},
    poll_loop::{PollConfig, PollLoop},
    writer::{DEFAULT_PUT_TIMEOUT, FlushWriter},
};

pub use event_ingester_queue::mock::MockQueue;

#[derive(Debug, Default)]
struct Faults {
    failing_puts: usize,
    fail_all_puts: bool,
    put_delay: Option<Duration>,
    put_calls: usize,
}

/// An [`ObjectStore`] that delegates to an inner store but can be told to fail or stall puts.
#[derive(Debug)]
pub struct FaultyObjectStore {
    inner: Arc<dyn ObjectStore>,
    faults: Mutex<Faults>,
}

impl Default for FaultyObjectStore {
    fn default() -> Self {
        Self::new()
    }
}

impl FaultyObjectStore {
    /// Wrap a fresh [`InMemory`] store.
    pub fn new() -> Self {
        Self::new_with_inner(Arc::new(InMemory::new()))
    }

    pub fn new_with_inner(inner: Arc<dyn ObjectStore>) -> Self {
        Self {
            inner,
            faults: Default::default(),
        }
    }

    pub fn fail_next_puts(&self, n: usize) {
        self.faults.lock().failing_puts = n;
    }

    pub fn set_fail_all_puts(&self, fail: bool) {
        self.faults.lock().fail_all_puts = fail;
    }

    /// Delay every put by `delay` before handing it to the inner store.
    pub fn set_put_delay(&self, delay: Duration) {
        self.faults.lock().put_delay = Some(delay);
    }

    /// Put attempts so far, including failed ones.
    pub fn put_calls(&self) -> usize {
        self.faults.lock().put_calls
    }

    /// Every stored object with its content, ordered by name.
    pub async fn objects(&self) -> object_store::Result<Vec<(Path, Bytes)>> {
        let mut metas: Vec<ObjectMeta> = self.inner.list(None).try_collect().await?;
        metas.sort_unstable_by(|a, b| a.location.cmp(&b.location));

        futures::stream::iter(metas)
            .then(|meta| async move {
                let data = self.inner.get(&meta.location).await?.bytes().await?;
                Ok::<_, object_store::Error>((meta.location, data))
            })
            .try_collect()
            .await
    }

    fn check_put(&self) -> object_store::Result<Option<Duration>> {
        let mut faults = self.faults.lock();
        faults.put_calls += 1;
        if faults.fail_all_puts || faults.failing_puts > 0 {
            faults.failing_puts = faults.failing_puts.saturating_sub(1);
            return Err(object_store::Error::Generic {
                store: "FaultyObjectStore",
                source: "injected put failure".into(),
            });
        }
        Ok(faults.put_delay)
    }
}

impl Display for FaultyObjectStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "FaultyObjectStore({})", self.inner)
    }
}

#[async_trait]
impl ObjectStore for FaultyObjectStore {
    async fn put_opts(
        &self,
        location: &Path,
        payload: PutPayload,
        opts: PutOptions,
    ) -> object_store::Result<PutResult> {
        if let Some(delay) = self.check_put()? {
            tokio::time::sleep(delay).await;
        }
        self.inner.put_opts(location, payload, opts).await
    }

    async fn put_multipart_opts(
        &self,
        location: &Path,
        opts: PutMultipartOpts,
    ) -> object_store::Result<Box<dyn MultipartUpload>> {
        self.inner.put_multipart_opts(location, opts).await
    }

    async fn get_opts(
        &self,
        location: &Path,
        options: GetOptions,
    ) -> object_store::Result<GetResult> {
        self.inner.get_opts(location, options).await
    }

    async fn delete(&self, location: &Path) -> object_store::Result<()> {
        self.inner.delete(location).await
    }

    fn list(&self, prefix: Option<&Path>) -> BoxStream<'_, object_store::Result<ObjectMeta>> {
        self.inner.list(prefix)
    }

    async fn list_with_delimiter(
        &self,
        prefix: Option<&Path>,
    ) -> object_store::Result<ListResult> {
        self.inner.list_with_delimiter(prefix).await
    }

    async fn copy(&self, from: &Path, to: &Path) -> object_store::Result<()> {
        self.inner.copy(from, to).await
    }

    async fn copy_if_not_exists(&self, from: &Path, to: &Path) -> object_store::Result<()> {
        self.inner.copy_if_not_exists(from, to).await
    }
}

/// A frozen clock, an in-memory queue and a faulty object store, wired into a [`PollLoop`].
#[derive(Debug)]
pub struct TestPipeline {
    pub time: Arc<MockProvider>,
    pub queue: MockQueue,
    pub store: Arc<FaultyObjectStore>,
}

impl Default for TestPipeline {
    fn default() -> Self {
        Self::new()
    }
}

impl TestPipeline {
    /// Start the clock at 2023-11-14T22:13:20Z.
    pub fn new() -> Self {
        let time = Arc::new(MockProvider::new(Time::from_timestamp_nanos(
            1_700_000_000_000_000_000,
        )));
        let queue = MockQueue::new(Arc::clone(&time) as _);
        Self {
            time,
            queue,
            store: Arc::new(FaultyObjectStore::new()),
        }
    }

    pub fn push_bodies(&self, bodies: &[&str]) -> Vec<MessageId> {
        bodies
            .iter()
            .map(|body| self.queue.push(Bytes::copy_from_slice(body.as_bytes())))
            .collect()
    }

    pub fn writer(&self) -> FlushWriter {
        FlushWriter::new(
            Arc::clone(&self.store) as _,
            Arc::clone(&self.time) as _,
            None,
            DEFAULT_PUT_TIMEOUT,
        )
    }

    /// A loop that never long-polls and retries quickly.
    pub fn poll_loop(&self, policy: FlushPolicy) -> PollLoop {
        self.poll_loop_with_config(
            policy,
            PollConfig {
                wait_time: Duration::ZERO,
                receive_backoff: fast_backoff(),
                ..Default::default()
            },
        )
    }

    pub fn poll_loop_with_config(&self, policy: FlushPolicy, config: PollConfig) -> PollLoop {
        let queue = Arc::new(self.queue.clone());
        PollLoop::new(
            Arc::clone(&queue) as _,
            self.writer(),
            AckTracker::new(queue, DEFAULT_ACK_ATTEMPTS, fast_backoff()),
            policy,
            Arc::clone(&self.time) as _,
            config,
        )
    }

    /// The content of every stored object, parsed, ordered by object name.
    ///
    /// # Panics
    ///
    /// If the store cannot be listed or an object is not a JSON array.
    pub async fn stored_batches(&self) -> Vec<Vec<Value>> {
        self.store
            .objects()
            .await
            .expect("list stored objects")
            .into_iter()
            .map(|(path, data)| {
                serde_json::from_slice(&data)
                    .unwrap_or_else(|e| panic!("object {path} is not a JSON array: {e}"))
            })
            .collect()
    }
}

/// Backoff for tests: 1ms doubling up to 10ms, without jitter.
pub fn fast_backoff() -> BackoffConfig {
    BackoffConfig {
        init_backoff: Duration::from_millis(1),
        max_backoff: Duration::from_millis(10),
        base: 2.,
        jitter: 0.,
    }
}

/// Wait until `condition` holds, polling every few milliseconds.
///
/// # Panics
///
/// If `condition` does not hold within five seconds.
pub async fn wait_for(what: &str, mut condition: impl FnMut() -> bool + Send) {
    let waited = tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    if waited.is_err() {
        panic!("timed out waiting for {what}");
    }
}
