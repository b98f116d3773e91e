use std::future::Future;

use tokio::sync::RwLock;

/// Per-storage job barrier (spec.md §4.B `raise_fence`). Ordinary read/write
/// jobs `enter` the fence, which behaves like a shared lock; a destructive
/// job (move, rename, delete) `raise`s the fence, which drains outstanding
/// jobs and blocks new ones for its duration. A second raise while one is
/// active simply queues behind it, same as a second writer on a `RwLock`.
#[derive(Debug, Default)]
pub struct Fence(RwLock<()>);

impl Fence {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn enter(&self) -> tokio::sync::RwLockReadGuard<'_, ()> {
        self.0.read().await
    }

    pub async fn raise<F, Fut, T>(&self, job: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let _guard = self.0.write().await;
        job().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_fence_drains_before_running() {
        let fence = Arc::new(Fence::new());
        let counter = Arc::new(AtomicUsize::new(0));

        let guard = fence.enter().await;
        counter.fetch_add(1, Ordering::SeqCst);

        let fence2 = Arc::clone(&fence);
        let counter2 = Arc::clone(&counter);
        let raised = tokio::spawn(async move {
            fence2.raise(|| async { counter2.fetch_add(10, Ordering::SeqCst) }).await
        });

        tokio::task::yield_now().await;
        assert_eq!(counter.load(Ordering::SeqCst), 1, "fence must not run while a job is outstanding");

        drop(guard);
        let before = raised.await.unwrap();
        assert_eq!(before, 1, "fence job observed the right value once jobs drained");
        assert_eq!(counter.load(Ordering::SeqCst), 11);
    }
}
