//! Process-wide cancellation built on a `watch` channel.

use std::sync::Arc;
use tokio::sync::watch;

/// Owner side of the cancellation source. Dropping it also cancels.
#[derive(Debug)]
pub struct Shutdown {
    tx: watch::Sender<bool>,
}

/// Cheap, cloneable observer handed to loops and handlers.
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    rx: watch::Receiver<bool>,
    /// Set only for [`ShutdownSignal::never`], which owns its sender.
    _owner: Option<Arc<watch::Sender<bool>>>,
}

impl Shutdown {
    #[must_use]
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx }
    }

    /// Create an observer.
    #[must_use]
    pub fn signal(&self) -> ShutdownSignal {
        ShutdownSignal {
            rx: self.tx.subscribe(),
            _owner: None,
        }
    }

    /// Request shutdown. Idempotent.
    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }

    #[must_use]
    pub fn is_triggered(&self) -> bool {
        *self.tx.borrow()
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownSignal {
    /// A signal that never fires, for callers without a shutdown owner.
    #[must_use]
    pub fn never() -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            rx,
            _owner: Some(Arc::new(tx)),
        }
    }

    /// Check without waiting. A dropped owner counts as cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow() || self.rx.has_changed().is_err()
    }

    /// Wait until shutdown is requested or the owner is dropped.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        // Err means the sender was dropped, which counts as cancellation.
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    #[tokio::test]
    async fn test_trigger_wakes_waiters() {
        let shutdown = Shutdown::new();
        let signal = shutdown.signal();
        assert!(!signal.is_cancelled());

        let waiter = tokio::spawn({
            let signal = signal.clone();
            async move { signal.cancelled().await }
        });

        shutdown.trigger();
        timeout(Duration::from_millis(100), waiter)
            .await
            .expect("timeout")
            .expect("join");
        assert!(signal.is_cancelled());
        assert!(shutdown.is_triggered());
    }

    #[tokio::test]
    async fn test_dropped_owner_cancels() {
        let shutdown = Shutdown::new();
        let signal = shutdown.signal();
        assert!(!signal.is_cancelled());
        drop(shutdown);

        assert!(signal.is_cancelled());
        timeout(Duration::from_millis(100), signal.cancelled())
            .await
            .expect("timeout");
    }

    #[tokio::test]
    async fn test_never_signal() {
        let signal = ShutdownSignal::never();
        assert!(!signal.is_cancelled());
        assert!(timeout(Duration::from_millis(10), signal.cancelled())
            .await
            .is_err());
    }
}
