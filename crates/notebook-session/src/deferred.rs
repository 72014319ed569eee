//! One-shot completion signals.

use std::sync::Arc;

use tokio::sync::watch;

/// A signal that is resolved at most once and can be awaited by any number
/// of waiters, including ones that start waiting after resolution.
#[derive(Clone)]
pub struct Deferred {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for Deferred {
    fn default() -> Self {
        Self::new()
    }
}

impl Deferred {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Deferred { tx: Arc::new(tx) }
    }

    pub fn resolve(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_resolved(&self) -> bool {
        *self.tx.borrow()
    }

    pub fn waiter(&self) -> DeferredWaiter {
        DeferredWaiter {
            rx: self.tx.subscribe(),
        }
    }

    pub async fn wait(&self) {
        self.waiter().wait().await
    }
}

/// Awaitable view of a [`Deferred`], detached from whoever resolves it.
#[derive(Clone)]
pub struct DeferredWaiter {
    rx: watch::Receiver<bool>,
}

impl DeferredWaiter {
    pub fn is_resolved(&self) -> bool {
        *self.rx.borrow()
    }

    pub async fn wait(mut self) {
        // A dropped sender can never resolve; treat it as done rather than hang.
        let _ = self.rx.wait_for(|resolved| *resolved).await;
    }
}
