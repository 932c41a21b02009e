//! Shared worker state.

use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::Notify;

/// Shutdown coordination for the worker.
///
/// The signal dispatcher flips the flag; the listener, every connection,
/// and every harvest task observe it. Nothing reservoir-related ever runs
/// inside a signal handler.
#[derive(Debug, Default)]
pub struct DaemonState {
    shutdown: AtomicBool,
    notify: Notify,
}

impl DaemonState {
    /// Create a fresh state with shutdown not requested.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// True once shutdown has been requested.
    #[must_use]
    pub fn is_shutdown_requested(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// Request shutdown and wake every waiter.
    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    /// Wait until shutdown is requested. Returns immediately if it
    /// already was.
    pub async fn wait_shutdown(&self) {
        loop {
            if self.is_shutdown_requested() {
                return;
            }
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register with the notifier, then re-check: a request landing
            // between the check and the registration is not missed.
            notified.as_mut().enable();
            if self.is_shutdown_requested() {
                return;
            }
            notified.await;
        }
    }
}
