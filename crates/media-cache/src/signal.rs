//! Low-memory notification
//!
//! Memory tiers subscribe at construction and drop all cached values when a
//! warning is delivered. Dropping the returned [`Subscription`] unsubscribes.

use std::future::Future;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tracing::debug;

const SIGNAL_CAPACITY: usize = 16;

/// Push-based low-memory signal shared by every tier that should flush
#[derive(Debug, Clone)]
pub struct MemoryPressure {
    tx: broadcast::Sender<()>,
}

impl MemoryPressure {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(SIGNAL_CAPACITY);
        Self { tx }
    }

    /// Deliver a warning; returns how many subscribers will see it
    pub fn notify(&self) -> usize {
        self.tx.send(()).unwrap_or(0)
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Run `on_warning` for every delivered warning until it returns `false`.
    ///
    /// Must be called from within a Tokio runtime. Warnings missed because the
    /// handler fell behind collapse into a single call.
    pub(crate) fn subscribe<F, Fut>(&self, mut on_warning: F) -> Subscription
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = bool> + Send + 'static,
    {
        let mut rx = self.tx.subscribe();
        let task = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(()) | Err(RecvError::Lagged(_)) => {
                        if !on_warning().await {
                            break;
                        }
                    }
                    Err(RecvError::Closed) => break,
                }
            }
            debug!("Memory pressure subscription ended");
        });
        Subscription { task }
    }
}

impl Default for MemoryPressure {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle to a registered listener; unsubscribes on drop
#[derive(Debug)]
pub struct Subscription {
    task: JoinHandle<()>,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    async fn wait_for(count: &AtomicUsize, expected: usize) {
        for _ in 0..100 {
            if count.load(Ordering::SeqCst) >= expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[test]
    fn test_notify_without_subscribers() {
        let signal = MemoryPressure::new();
        assert_eq!(signal.notify(), 0);
        assert_eq!(signal.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_subscriber_receives_warnings() {
        let signal = MemoryPressure::new();
        let count = Arc::new(AtomicUsize::new(0));

        let counter = count.clone();
        let _subscription = signal.subscribe(move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                true
            }
        });

        assert_eq!(signal.subscriber_count(), 1);
        assert_eq!(signal.notify(), 1);
        wait_for(&count, 1).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_dropping_subscription_unsubscribes() {
        let signal = MemoryPressure::new();
        let subscription = signal.subscribe(|| async { true });
        assert_eq!(signal.subscriber_count(), 1);

        drop(subscription);
        for _ in 0..100 {
            if signal.subscriber_count() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(signal.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_handler_returning_false_stops_listening() {
        let signal = MemoryPressure::new();
        let count = Arc::new(AtomicUsize::new(0));

        let counter = count.clone();
        let _subscription = signal.subscribe(move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                false
            }
        });

        signal.notify();
        wait_for(&count, 1).await;
        for _ in 0..100 {
            if signal.subscriber_count() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(signal.notify(), 0);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
