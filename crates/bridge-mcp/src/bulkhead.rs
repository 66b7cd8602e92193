use bridge_core::{Error, Result};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Bounded concurrency compartment for one cluster. Calls past
/// `max_concurrent` wait in a queue of at most `queue_capacity`; waiting
/// longer than `queue_timeout` or arriving at a full queue are rejected
/// with distinct kinds so load shedding never looks like backend failure.
pub struct Bulkhead {
    cluster: String,
    semaphore: Arc<Semaphore>,
    max_concurrent: usize,
    queue_capacity: usize,
    queue_timeout: Duration,
    waiting: AtomicUsize,
}

pub struct BulkheadPermit {
    _permit: OwnedSemaphorePermit,
}

impl Bulkhead {
    pub fn new(
        cluster: &str,
        max_concurrent: usize,
        queue_capacity: usize,
        queue_timeout: Duration,
    ) -> Self {
        Self {
            cluster: cluster.to_string(),
            semaphore: Arc::new(Semaphore::new(max_concurrent)),
            max_concurrent,
            queue_capacity,
            queue_timeout,
            waiting: AtomicUsize::new(0),
        }
    }

    pub async fn acquire(&self) -> Result<BulkheadPermit> {
        if let Ok(permit) = self.semaphore.clone().try_acquire_owned() {
            return Ok(BulkheadPermit { _permit: permit });
        }

        // Compartment full: join the bounded queue.
        let waiting = self.waiting.fetch_add(1, Ordering::AcqRel);
        if waiting >= self.queue_capacity {
            self.waiting.fetch_sub(1, Ordering::AcqRel);
            return Err(Error::BulkheadFull {
                cluster: self.cluster.clone(),
            });
        }

        let acquired =
            tokio::time::timeout(self.queue_timeout, self.semaphore.clone().acquire_owned()).await;
        self.waiting.fetch_sub(1, Ordering::AcqRel);

        match acquired {
            Ok(Ok(permit)) => Ok(BulkheadPermit { _permit: permit }),
            Ok(Err(_)) => Err(Error::Internal("bulkhead semaphore closed".into())),
            Err(_) => Err(Error::BulkheadTimeout {
                cluster: self.cluster.clone(),
            }),
        }
    }

    pub fn in_flight(&self) -> usize {
        self.max_concurrent - self.semaphore.available_permits()
    }

    pub fn waiting(&self) -> usize {
        self.waiting.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_allows_up_to_limit() {
        let bulkhead = Bulkhead::new("svc", 2, 4, Duration::from_millis(100));
        let a = bulkhead.acquire().await.unwrap();
        let b = bulkhead.acquire().await.unwrap();
        assert_eq!(bulkhead.in_flight(), 2);
        drop(a);
        drop(b);
        assert_eq!(bulkhead.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_queue_timeout_is_distinct() {
        let bulkhead = Bulkhead::new("svc", 1, 4, Duration::from_millis(50));
        let _held = bulkhead.acquire().await.unwrap();
        let err = bulkhead.acquire().await.unwrap_err();
        assert_eq!(err.kind(), "bulkhead_timeout");
    }

    #[tokio::test]
    async fn test_full_queue_rejects_immediately() {
        let bulkhead = Arc::new(Bulkhead::new("svc", 1, 1, Duration::from_millis(500)));
        let _held = bulkhead.acquire().await.unwrap();

        // One waiter occupies the whole queue.
        let queued = {
            let bulkhead = bulkhead.clone();
            tokio::spawn(async move { bulkhead.acquire().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        let start = std::time::Instant::now();
        let err = bulkhead.acquire().await.unwrap_err();
        assert_eq!(err.kind(), "bulkhead_full");
        // Rejection is immediate, not after the queue timeout.
        assert!(start.elapsed() < Duration::from_millis(100));

        drop(_held);
        assert!(queued.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_waiter_proceeds_when_slot_frees() {
        let bulkhead = Arc::new(Bulkhead::new("svc", 1, 2, Duration::from_millis(500)));
        let held = bulkhead.acquire().await.unwrap();
        let waiter = {
            let bulkhead = bulkhead.clone();
            tokio::spawn(async move { bulkhead.acquire().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(held);
        assert!(waiter.await.unwrap().is_ok());
    }
}
