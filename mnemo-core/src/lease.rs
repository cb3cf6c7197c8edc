//! Worker leases.
//!
//! A unit of work runs inside [`WorkLease::scope`]. Every blocking store call
//! started from inside the scope holds a clone of the lease until the call
//! returns, so whatever the lease guards stays taken while SQLite is still
//! busy, even after the future that started the call has been dropped.

use std::any::Any;
use std::future::Future;
use std::sync::Arc;

tokio::task_local! {
    static CURRENT: WorkLease;
}

/// Shared ownership of a guard, released when the last clone drops.
#[derive(Clone)]
pub struct WorkLease {
    _guard: Arc<dyn Any + Send + Sync>,
}

impl std::fmt::Debug for WorkLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkLease")
            .field("holders", &Arc::strong_count(&self._guard))
            .finish()
    }
}

impl WorkLease {
    pub fn new<G: Send + Sync + 'static>(guard: G) -> Self {
        Self {
            _guard: Arc::new(guard),
        }
    }

    /// Run `fut` with this lease as the current one.
    pub async fn scope<F: Future>(self, fut: F) -> F::Output {
        CURRENT.scope(self, fut).await
    }

    /// Lease of the enclosing scope, if any.
    pub fn current() -> Option<Self> {
        CURRENT.try_with(Clone::clone).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::sync::Semaphore;

    #[tokio::test]
    async fn test_no_lease_outside_scope() {
        assert!(WorkLease::current().is_none());
    }

    #[tokio::test]
    async fn test_blocking_clone_outlives_scope() {
        let slots = Arc::new(Semaphore::new(1));
        let permit = slots.clone().acquire_owned().await.unwrap();
        let (started_tx, started_rx) = tokio::sync::oneshot::channel();

        let unit = WorkLease::new(permit).scope(async move {
            let lease = WorkLease::current();
            let handle = tokio::task::spawn_blocking(move || {
                let _lease = lease;
                let _ = started_tx.send(());
                std::thread::sleep(Duration::from_millis(200));
            });
            let _ = handle.await;
        });

        // Drop the unit once its blocking call is running.
        let unit = tokio::spawn(unit);
        started_rx.await.unwrap();
        unit.abort();
        let _ = unit.await;
        assert_eq!(slots.available_permits(), 0);

        let _again = tokio::time::timeout(Duration::from_secs(5), slots.acquire())
            .await
            .unwrap()
            .unwrap();
    }
}
