//! Lazily created, invalidatable shared handle.
//!
//! `get_or_create` returns the current handle or builds one; `invalidate`
//! clears it so the next `get_or_create` rebuilds. Construction is
//! serialized by an async mutex so concurrent callers never build twice.

use std::future::Future;
use std::sync::Arc;
use tokio::sync::Mutex;

pub struct ConnectionCell<T: ?Sized> {
    slot: Mutex<Option<Arc<T>>>,
}

impl<T: ?Sized> ConnectionCell<T> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            slot: Mutex::new(None),
        }
    }

    /// Return the held handle, creating it with `factory` if empty.
    ///
    /// # Errors
    ///
    /// Propagates the factory's error; the cell stays empty.
    pub async fn get_or_create<F, Fut, E>(&self, factory: F) -> Result<Arc<T>, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Arc<T>, E>>,
    {
        let mut slot = self.slot.lock().await;
        if let Some(handle) = slot.as_ref() {
            return Ok(Arc::clone(handle));
        }

        let handle = factory().await?;
        *slot = Some(Arc::clone(&handle));
        Ok(handle)
    }

    /// The held handle, if any, without creating one.
    pub async fn current(&self) -> Option<Arc<T>> {
        self.slot.lock().await.clone()
    }

    /// Drop the held handle, returning it so the caller can close it.
    pub async fn invalidate(&self) -> Option<Arc<T>> {
        self.slot.lock().await.take()
    }
}

impl<T: ?Sized> Default for ConnectionCell<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_created_once() {
        let cell: ConnectionCell<usize> = ConnectionCell::new();
        let builds = AtomicUsize::new(0);

        for _ in 0..3 {
            let handle = cell
                .get_or_create(|| async {
                    builds.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, ()>(Arc::new(7))
                })
                .await
                .unwrap();
            assert_eq!(*handle, 7);
        }

        assert_eq!(builds.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_invalidate_rebuilds() {
        let cell: ConnectionCell<usize> = ConnectionCell::new();
        let first = cell
            .get_or_create(|| async { Ok::<_, ()>(Arc::new(1)) })
            .await
            .unwrap();
        assert_eq!(*cell.invalidate().await.unwrap(), 1);
        assert!(cell.current().await.is_none());

        let second = cell
            .get_or_create(|| async { Ok::<_, ()>(Arc::new(2)) })
            .await
            .unwrap();
        assert_ne!(*first, *second);
    }

    #[tokio::test]
    async fn test_failed_factory_leaves_cell_empty() {
        let cell: ConnectionCell<usize> = ConnectionCell::new();
        let result = cell
            .get_or_create(|| async { Err::<Arc<usize>, _>("unreachable broker") })
            .await;
        assert_eq!(result.unwrap_err(), "unreachable broker");
        assert!(cell.current().await.is_none());
    }
}
