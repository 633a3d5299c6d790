//! Cooperative shutdown signal
//!
//! Cloneable cancel flag shared by every task the coordinator spawns.
//! Cancellation is idempotent and sticky: once cancelled, every current and
//! future waiter returns immediately, and in-flight work is dropped cleanly.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::Notify;

#[derive(Debug, Default, Clone)]
pub struct ShutdownSignal {
    shared: Arc<SharedState>,
}

#[derive(Debug, Default)]
struct SharedState {
    closing: AtomicBool,
    notify: Notify,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.shared.closing.store(true, Ordering::Relaxed);
        self.shared.notify.notify_waiters();
    }

    pub fn cancelled(&self) -> bool {
        self.shared.closing.load(Ordering::Relaxed)
    }

    /// Resolve once cancelled.
    pub async fn wait(&self) {
        while !self.cancelled() {
            self.shared.notify.notified().await;
        }
    }

    /// Run a future unless cancellation wins the race.
    pub async fn select<F, T>(&self, fut: F) -> Option<T>
    where
        F: Future<Output = T>,
    {
        tokio::select! {
            res = fut => Some(res),
            _ = self.wait() => None,
        }
    }

    /// Spawn a task that dies with the signal.
    pub fn spawn<F>(&self, fut: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let signal = self.clone();
        tokio::spawn(async move {
            let _ = signal.select(fut).await;
        });
    }
}
