//! Bounded concurrency for external processes.
//!
//! The worker pool is the only place parallelism is bounded: analysis and
//! fingerprinting run freely on the cooperative runtime, while command
//! spawns each hold one pool permit. Permits are granted in FIFO request
//! order (the tokio semaphore is fair), which is what lets the failure
//! coordinator deny queued-but-not-started work deterministically.

use std::sync::Arc;

use derive_more::{Display, Error};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::trace;

/// Returned when the pool has been aborted and no longer admits work.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Display, Error)]
#[display("worker pool aborted")]
pub struct PoolAborted;

#[derive(Clone, Debug)]
pub struct WorkerPool {
    semaphore: Arc<Semaphore>,
    capacity: usize,
}

/// One slot in the pool; dropped on completion to release the slot.
#[derive(Debug)]
pub struct WorkerPermit {
    _permit: OwnedSemaphorePermit,
}

impl WorkerPool {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Wait for a slot, FIFO. Fails only after [`WorkerPool::abort`].
    pub async fn acquire(&self) -> Result<WorkerPermit, PoolAborted> {
        match Arc::clone(&self.semaphore).acquire_owned().await {
            Ok(permit) => Ok(WorkerPermit { _permit: permit }),
            Err(_closed) => Err(PoolAborted),
        }
    }

    /// Run `task` while holding one slot.
    pub async fn run<T>(&self, task: impl Future<Output = T>) -> Result<T, PoolAborted> {
        let permit = self.acquire().await?;
        let result = task.await;
        drop(permit);
        Ok(result)
    }

    /// Forbid all further acquisitions. Tasks already holding a permit
    /// run to completion.
    pub fn abort(&self) {
        trace!("worker pool aborted");
        self.semaphore.close();
    }
}
