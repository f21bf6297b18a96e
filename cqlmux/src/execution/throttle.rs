use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::errors::ExecutionError;

/// Weighted admission control for the operations of one cluster.
///
/// Each operation holds `load` units of capacity for its whole duration,
/// retries included. Loads above the capacity are clamped to it, so a single
/// heavy operation runs alone instead of never running.
#[derive(Debug)]
pub(crate) struct Throttle {
    semaphore: Arc<Semaphore>,
    capacity: u32,
}

/// Capacity held by one admitted operation, given back on drop.
#[derive(Debug)]
pub(crate) struct ThrottlePermit {
    _permit: OwnedSemaphorePermit,
}

impl Throttle {
    pub(crate) fn new(capacity: usize) -> Self {
        let capacity = u32::try_from(capacity.max(1)).unwrap_or(u32::MAX);
        let capacity = capacity.min(Semaphore::MAX_PERMITS as u32);
        Throttle {
            semaphore: Arc::new(Semaphore::new(capacity as usize)),
            capacity,
        }
    }

    pub(crate) fn capacity(&self) -> usize {
        self.capacity as usize
    }

    pub(crate) fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Waits until `load` units are free. Returns `Cancelled` if `cancel`
    /// fires first, and `ClusterClosed` once the throttle is closed.
    pub(crate) async fn acquire(
        &self,
        load: usize,
        cancel: Option<&CancellationToken>,
    ) -> Result<ThrottlePermit, ExecutionError> {
        let weight = u32::try_from(load.max(1))
            .unwrap_or(u32::MAX)
            .min(self.capacity);
        if self.semaphore.available_permits() < weight as usize {
            trace!(
                load = weight,
                available = self.semaphore.available_permits(),
                "Waiting for throttle admission"
            );
        }

        let acquire = self.semaphore.clone().acquire_many_owned(weight);
        let permit = match cancel {
            Some(cancel) => tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(ExecutionError::Cancelled),
                permit = acquire => permit,
            },
            None => acquire.await,
        };
        permit
            .map(|permit| ThrottlePermit { _permit: permit })
            .map_err(|_| ExecutionError::ClusterClosed)
    }

    /// Wakes every waiter with `ClusterClosed`.
    pub(crate) fn close(&self) {
        self.semaphore.close();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use assert_matches::assert_matches;
    use futures::future::join_all;

    use super::*;
    use crate::utils::test_utils::setup_tracing;

    #[tokio::test]
    async fn outstanding_weight_never_exceeds_capacity() {
        setup_tracing();
        let throttle = Arc::new(Throttle::new(5));
        let outstanding = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let tasks = (0..40usize).map(|i| {
            let throttle = throttle.clone();
            let outstanding = outstanding.clone();
            let peak = peak.clone();
            tokio::spawn(async move {
                let load = 1 + i % 3;
                let _permit = throttle.acquire(load, None).await.unwrap();
                let now = outstanding.fetch_add(load, Ordering::SeqCst) + load;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(2)).await;
                outstanding.fetch_sub(load, Ordering::SeqCst);
            })
        });
        for result in join_all(tasks).await {
            result.unwrap();
        }

        assert!(peak.load(Ordering::SeqCst) <= 5);
        assert_eq!(throttle.available(), 5);
    }

    #[tokio::test]
    async fn oversized_load_is_clamped_to_capacity() {
        setup_tracing();
        let throttle = Throttle::new(3);
        let permit = throttle.acquire(100, None).await.unwrap();
        assert_eq!(throttle.available(), 0);
        drop(permit);
        assert_eq!(throttle.available(), 3);
    }

    #[tokio::test]
    async fn failed_operation_gives_capacity_back() {
        setup_tracing();
        let throttle = Throttle::new(2);

        async fn failing(throttle: &Throttle) -> Result<(), ExecutionError> {
            let _permit = throttle.acquire(2, None).await?;
            Err(ExecutionError::NoConnection)
        }

        assert_matches!(failing(&throttle).await, Err(ExecutionError::NoConnection));
        assert_eq!(throttle.available(), 2);
    }

    #[tokio::test]
    async fn waiting_for_admission_can_be_cancelled() {
        setup_tracing();
        let throttle = Throttle::new(1);
        let _held = throttle.acquire(1, None).await.unwrap();

        let cancel = CancellationToken::new();
        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            canceller.cancel();
        });
        assert_matches!(
            throttle.acquire(1, Some(&cancel)).await,
            Err(ExecutionError::Cancelled)
        );
        assert_eq!(throttle.available(), 0);
    }

    #[tokio::test]
    async fn closing_rejects_waiters() {
        setup_tracing();
        let throttle = Arc::new(Throttle::new(1));
        let held = throttle.acquire(1, None).await.unwrap();

        let waiter = {
            let throttle = throttle.clone();
            tokio::spawn(async move { throttle.acquire(1, None).await.map(|_| ()) })
        };
        tokio::task::yield_now().await;
        throttle.close();
        assert_matches!(waiter.await.unwrap(), Err(ExecutionError::ClusterClosed));
        drop(held);
    }
}
