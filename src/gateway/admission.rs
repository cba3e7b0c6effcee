//! Admission control for concurrent runs.
//!
//! Two semaphores bound the system: a queue ticket caps how many requests
//! may exist at once (running plus waiting), and a run slot caps how many
//! execute concurrently. Tickets are tried, never awaited, so a full queue
//! rejects immediately instead of building unbounded backlog. Both permits
//! release through RAII, so no exit path can leak capacity.

use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::debug;

use crate::config::AdmissionConfig;
use crate::error::GatewayError;

/// Bounds concurrent and queued runs.
pub struct AdmissionController {
    queue: Arc<Semaphore>,
    slots: Arc<Semaphore>,
    max_queue_depth: usize,
}

/// An admitted run's hold on capacity. Dropping releases both permits.
pub struct AdmissionSlot {
    _queue: OwnedSemaphorePermit,
    _slot: OwnedSemaphorePermit,
}

impl AdmissionController {
    /// Create a controller with the configured pool and queue sizes.
    pub fn new(config: &AdmissionConfig) -> Self {
        Self {
            queue: Arc::new(Semaphore::new(
                config.max_concurrent_processes + config.max_queue_depth,
            )),
            slots: Arc::new(Semaphore::new(config.max_concurrent_processes)),
            max_queue_depth: config.max_queue_depth,
        }
    }

    /// Admit one run, waiting for a free slot if the pool is busy.
    ///
    /// Rejects immediately when the queue is already full.
    pub async fn admit(&self) -> Result<AdmissionSlot, GatewayError> {
        let queue = self.queue.clone().try_acquire_owned().map_err(|_| {
            GatewayError::AdmissionRejected {
                max_queue_depth: self.max_queue_depth,
            }
        })?;

        debug!(
            waiting = self.slots.available_permits() == 0,
            "Request ticketed, waiting for a run slot"
        );

        // The semaphores are never closed, so acquisition can only fail by
        // queue rejection above.
        let slot = self
            .slots
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| GatewayError::AdmissionRejected {
                max_queue_depth: self.max_queue_depth,
            })?;

        Ok(AdmissionSlot {
            _queue: queue,
            _slot: slot,
        })
    }

    /// Free run slots right now.
    pub fn available_slots(&self) -> usize {
        self.slots.available_permits()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn controller(concurrent: usize, depth: usize) -> AdmissionController {
        AdmissionController::new(&AdmissionConfig {
            max_concurrent_processes: concurrent,
            max_queue_depth: depth,
        })
    }

    #[tokio::test]
    async fn test_admit_within_pool() {
        let admission = controller(2, 1);
        let _a = admission.admit().await.unwrap();
        let _b = admission.admit().await.unwrap();
        assert_eq!(admission.available_slots(), 0);
    }

    #[tokio::test]
    async fn test_full_queue_rejects_immediately() {
        let admission = controller(1, 1);
        let _running = admission.admit().await.unwrap();
        // Fills the single queue ticket but blocks on the run slot.
        let admission = Arc::new(admission);
        let waiter = {
            let admission = admission.clone();
            tokio::spawn(async move {
                let slot = admission.admit().await.unwrap();
                tokio::time::sleep(std::time::Duration::from_millis(50)).await;
                drop(slot);
            })
        };
        tokio::task::yield_now().await;

        let result = admission.admit().await;
        assert!(matches!(
            result,
            Err(GatewayError::AdmissionRejected { max_queue_depth: 1 })
        ));

        drop(_running);
        waiter.await.unwrap();
    }

    #[tokio::test]
    async fn test_dropping_slot_frees_capacity() {
        let admission = controller(1, 0);
        let slot = admission.admit().await.unwrap();
        assert_eq!(admission.available_slots(), 0);
        assert!(admission.admit().await.is_err());

        drop(slot);
        assert_eq!(admission.available_slots(), 1);
        assert!(admission.admit().await.is_ok());
    }
}
