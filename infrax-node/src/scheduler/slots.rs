//! Execution slots
//!
//! A slot is a permit of a counting semaphore sized to `max_concurrent_jobs`.
//! Acquiring is atomic and dropping the slot releases it, exactly once.

use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

#[derive(Debug, Clone)]
pub struct SlotPool {
    semaphore: Arc<Semaphore>,
    total: usize,
}

impl SlotPool {
    pub fn new(total: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(total)),
            total,
        }
    }

    pub fn total(&self) -> usize {
        self.total
    }

    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    pub fn in_use(&self) -> usize {
        self.total.saturating_sub(self.available())
    }

    /// Take a free slot if there is one
    pub fn try_acquire(&self) -> Option<ExecutionSlot> {
        Arc::clone(&self.semaphore)
            .try_acquire_owned()
            .ok()
            .map(ExecutionSlot::new)
    }

    /// Stop handing out slots; slots already handed out stay valid
    pub fn close(&self) {
        self.semaphore.close();
    }
}

/// Right to run one job. Released on drop.
#[derive(Debug)]
pub struct ExecutionSlot {
    _permit: OwnedSemaphorePermit,
}

impl ExecutionSlot {
    fn new(permit: OwnedSemaphorePermit) -> Self {
        Self { _permit: permit }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slots_are_bounded() {
        let pool = SlotPool::new(2);
        let a = pool.try_acquire().unwrap();
        let _b = pool.try_acquire().unwrap();
        assert!(pool.try_acquire().is_none());
        assert_eq!(pool.in_use(), 2);

        drop(a);
        assert_eq!(pool.in_use(), 1);
        assert!(pool.try_acquire().is_some());
    }

    #[test]
    fn test_closed_pool_hands_out_nothing() {
        let pool = SlotPool::new(2);
        let held = pool.try_acquire().unwrap();
        pool.close();
        assert!(pool.try_acquire().is_none());

        drop(held);
        assert!(pool.try_acquire().is_none());
    }
}
