use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

/// Token for signaling graceful shutdown to background loops.
#[derive(Clone, Debug)]
pub struct ShutdownToken {
    inner: Arc<ShutdownTokenInner>,
}

#[derive(Debug)]
struct ShutdownTokenInner {
    cancelled: AtomicBool,
    notify: Notify,
}

impl ShutdownToken {
    /// Create a new shutdown token.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(ShutdownTokenInner {
                cancelled: AtomicBool::new(false),
                notify: Notify::new(),
            }),
        }
    }

    /// Signal cancellation.
    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    /// Check if cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Wait until cancelled.
    pub async fn cancelled(&self) {
        // Registered before the flag check so a concurrent cancel is not lost.
        let notified = self.inner.notify.notified();
        if self.is_cancelled() {
            return;
        }
        notified.await;
    }

    /// Sleeps for `duration`. Returns false when shutdown interrupted it.
    pub async fn sleep(&self, duration: Duration) -> bool {
        tokio::select! {
            _ = self.cancelled() => false,
            _ = tokio::time::sleep(duration) => true,
        }
    }
}

impl Default for ShutdownToken {
    fn default() -> Self {
        Self::new()
    }
}

/// Background loops owned by one service, stopped together.
#[derive(Debug)]
pub struct BackgroundTasks {
    name: &'static str,
    token: ShutdownToken,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl BackgroundTasks {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            token: ShutdownToken::new(),
            handles: Mutex::new(Vec::new()),
        }
    }

    pub fn token(&self) -> ShutdownToken {
        self.token.clone()
    }

    pub fn is_running(&self) -> bool {
        !self.handles.lock().is_empty() && !self.token.is_cancelled()
    }

    pub fn len(&self) -> usize {
        self.handles.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Spawns a task tracked for shutdown. Finished tasks are dropped from
    /// tracking on the next spawn.
    pub fn spawn<F>(&self, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(future);
        let mut handles = self.handles.lock();
        handles.retain(|h| !h.is_finished());
        handles.push(handle);
    }

    /// Signals shutdown and waits for each loop to observe it, giving up on a
    /// loop after `timeout`.
    pub async fn shutdown(&self, timeout: Duration) {
        tracing::info!(service = self.name, "initiating graceful shutdown");
        self.token.cancel();

        let handles = std::mem::take(&mut *self.handles.lock());
        for handle in handles {
            match tokio::time::timeout(timeout, handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::warn!(service = self.name, "background task failed: {e:?}"),
                Err(_) => {
                    tracing::warn!(service = self.name, "background task timed out during shutdown")
                }
            }
        }

        tracing::info!(service = self.name, "shutdown complete");
    }
}
