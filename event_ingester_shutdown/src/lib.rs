//! Ordered shutdown for the ingester process.
//!
//! A SIGTERM/SIGINT must not simply drop the poll loop on the floor: a batch that has been
//! decoded but not yet flushed would have to be re-read from the queue after the visibility
//! timeout. Instead the [`ShutdownManager`] cancels every registered component, then waits for
//! each of them to call [`ShutdownToken::complete`] (after its final flush and acknowledgment)
//! before the process-level token is cancelled and `main` returns.
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::info;

/// Wait for a `SIGTERM` or `SIGINT` to stop the process on UNIX systems
#[cfg(unix)]
pub async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    let (mut term, mut int) = match (
        signal(SignalKind::terminate()),
        signal(SignalKind::interrupt()),
    ) {
        (Ok(term), Ok(int)) => (term, int),
        (Err(e), _) | (_, Err(e)) => {
            info!(%e, "unable to register signal handlers, falling back to ctrl+c");
            let _ = tokio::signal::ctrl_c().await;
            info!("Received SIGINT");
            return;
        }
    };

    tokio::select! {
        _ = term.recv() => info!("Received SIGTERM"),
        _ = int.recv() => info!("Received SIGINT"),
    }
}

/// Wait for a `ctrl+c` to stop the process on Windows systems
#[cfg(windows)]
pub async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("Received SIGINT");
}

/// Coordinates shutdown of the ingest components and the process
#[derive(Debug)]
pub struct ShutdownManager {
    process_shutdown: CancellationToken,
    component_shutdown: CancellationToken,
    tasks: TaskTracker,
}

impl ShutdownManager {
    /// Create a [`ShutdownManager`]
    ///
    /// `process_shutdown` is cancelled once every registered component has completed.
    pub fn new(process_shutdown: CancellationToken) -> Self {
        Self {
            process_shutdown,
            component_shutdown: CancellationToken::new(),
            tasks: TaskTracker::new(),
        }
    }

    /// Create a [`ShutdownManager`] for tests that do not care about the process token
    pub fn new_testing() -> Self {
        Self::new(CancellationToken::new())
    }

    /// Register a component that must finish its work before the process may exit
    ///
    /// The caller must invoke [`complete`][ShutdownToken::complete] on the returned token, or
    /// [`join`][Self::join] never returns.
    pub fn register(&self) -> ShutdownToken {
        let (tx, rx) = oneshot::channel();
        self.tasks.spawn(rx);
        ShutdownToken::new(self.component_shutdown.clone(), tx)
    }

    /// Waits for all registered components to complete, then cancels the process token
    pub async fn join(&self) {
        self.tasks.close();
        self.tasks.wait().await;
        self.process_shutdown.cancel();
    }

    /// Ask every registered component to stop
    pub fn shutdown(&self) {
        self.component_shutdown.cancel();
    }
}

/// Handed to a component by [`ShutdownManager::register`]
///
/// Cloning is cheap; all clones share the same completion signal.
#[derive(Debug, Clone)]
pub struct ShutdownToken {
    token: CancellationToken,
    complete_tx: Arc<Mutex<Option<oneshot::Sender<()>>>>,
}

impl ShutdownToken {
    fn new(token: CancellationToken, complete_tx: oneshot::Sender<()>) -> Self {
        Self {
            token,
            complete_tx: Arc::new(Mutex::new(Some(complete_tx))),
        }
    }

    /// Trigger shutdown of every component, e.g. from an unrecoverable state
    pub fn trigger_shutdown(&self) {
        self.token.cancel();
    }

    /// Completes when the owning [`ShutdownManager`] asks components to stop
    pub async fn wait_for_shutdown(&self) {
        self.token.cancelled().await;
    }

    /// A [`CancellationToken`] cancelled together with this token, for components that take a
    /// plain token (such as the poll loop)
    pub fn cancellation_token(&self) -> CancellationToken {
        self.token.child_token()
    }

    /// Signal back that this component finished cleaning up
    ///
    /// Calling this more than once is a no-op.
    pub fn complete(&self) {
        if let Some(s) = self.complete_tx.lock().take() {
            let _ = s.send(());
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::atomic::{AtomicBool, Ordering},
        time::Duration,
    };

    use futures::FutureExt;
    use tokio_util::sync::CancellationToken;

    use crate::ShutdownManager;

    #[test_log::test(tokio::test)]
    async fn process_token_waits_for_component() {
        let process_token = CancellationToken::new();
        let shutdown_manager = ShutdownManager::new(process_token.clone());

        static FLUSHED: AtomicBool = AtomicBool::new(false);

        let token = shutdown_manager.register();
        tokio::spawn(async move {
            loop {
                futures::select! {
                    _ = token.wait_for_shutdown().fuse() => {
                        // final flush happens here
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        FLUSHED.store(true, Ordering::SeqCst);
                        token.complete();
                        break;
                    }
                    _ = tokio::time::sleep(Duration::from_millis(10)).fuse() => {}
                }
            }
        });

        assert!(!process_token.is_cancelled());
        shutdown_manager.shutdown();
        shutdown_manager.join().await;
        assert!(
            FLUSHED.load(Ordering::SeqCst),
            "component did not finish before the process token was cancelled"
        );
        assert!(process_token.is_cancelled());
    }

    #[test_log::test(tokio::test)]
    async fn cancellation_token_follows_shutdown() {
        let shutdown_manager = ShutdownManager::new_testing();
        let token = shutdown_manager.register();
        let child = token.cancellation_token();
        assert!(!child.is_cancelled());

        token.trigger_shutdown();
        assert!(child.is_cancelled());

        token.complete();
        token.complete();
        shutdown_manager.join().await;
    }
}
