//! Synchronous event channels for cells, sessions and notebooks.
//!
//! Listeners run on the emitting thread, in subscription order, before
//! `emit` returns. The listener list is snapshotted per emit, so a listener
//! may subscribe or unsubscribe (itself included) without deadlocking.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use tokio::sync::mpsc;

type Listener<T> = Arc<dyn Fn(&T) + Send + Sync>;

struct Listeners<T> {
    next_id: AtomicU64,
    entries: Mutex<Vec<(u64, Listener<T>)>>,
}

trait Unsubscribe: Send + Sync {
    fn remove(&self, id: u64);
}

impl<T: 'static> Unsubscribe for Listeners<T> {
    fn remove(&self, id: u64) {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|(entry_id, _)| *entry_id != id);
    }
}

pub struct Emitter<T> {
    listeners: Arc<Listeners<T>>,
}

impl<T: 'static> Default for Emitter<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: 'static> Emitter<T> {
    pub fn new() -> Self {
        Emitter {
            listeners: Arc::new(Listeners {
                next_id: AtomicU64::new(1),
                entries: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let id = self.listeners.next_id.fetch_add(1, Ordering::Relaxed);
        self.listeners
            .entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((id, Arc::new(listener)));
        let owner: Arc<dyn Unsubscribe> = self.listeners.clone();
        Subscription {
            id,
            owner: Arc::downgrade(&owner),
        }
    }

    pub fn emit(&self, event: &T) {
        let snapshot: Vec<Listener<T>> = self
            .listeners
            .entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(_, listener)| listener.clone())
            .collect();
        for listener in snapshot {
            listener(event);
        }
    }

    pub fn listener_count(&self) -> usize {
        self.listeners
            .entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }
}

impl<T: Clone + Send + 'static> Emitter<T> {
    /// Forward every event into an unbounded channel, for async consumers.
    pub fn subscribe_channel(&self) -> (Subscription, mpsc::UnboundedReceiver<T>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let subscription = self.subscribe(move |event: &T| {
            let _ = tx.send(event.clone());
        });
        (subscription, rx)
    }
}

/// Handle returned by [`Emitter::subscribe`]. Dropping it keeps the listener
/// registered; call [`Subscription::unsubscribe`] to remove it.
pub struct Subscription {
    id: u64,
    owner: Weak<dyn Unsubscribe>,
}

impl Subscription {
    pub fn unsubscribe(self) {
        if let Some(owner) = self.owner.upgrade() {
            owner.remove(self.id);
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_listeners_run_in_subscription_order() {
        let emitter = Emitter::<u32>::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        for tag in ["a", "b"] {
            let seen = seen.clone();
            let _ = emitter.subscribe(move |n| seen.lock().unwrap().push(format!("{}{}", tag, n)));
        }
        emitter.emit(&1);
        emitter.emit(&2);

        assert_eq!(*seen.lock().unwrap(), vec!["a1", "b1", "a2", "b2"]);
    }

    #[test]
    fn test_unsubscribe_stops_delivery() {
        let emitter = Emitter::<u32>::new();
        let count = Arc::new(AtomicU64::new(0));
        let counter = count.clone();
        let sub = emitter.subscribe(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        emitter.emit(&1);
        sub.unsubscribe();
        emitter.emit(&2);

        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(emitter.listener_count(), 0);
    }

    #[test]
    fn test_listener_may_subscribe_during_emit() {
        let emitter = Arc::new(Emitter::<u32>::new());
        let inner = emitter.clone();
        let _ = emitter.subscribe(move |_| {
            let _ = inner.subscribe(|_| {});
        });

        emitter.emit(&1);
        assert_eq!(emitter.listener_count(), 2);
    }

    #[tokio::test]
    async fn test_subscribe_channel_receives_events() {
        let emitter = Emitter::<String>::new();
        let (_sub, mut rx) = emitter.subscribe_channel();

        emitter.emit(&"first".to_string());
        emitter.emit(&"second".to_string());

        assert_eq!(rx.recv().await.unwrap(), "first");
        assert_eq!(rx.recv().await.unwrap(), "second");
    }
}
