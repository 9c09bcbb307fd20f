//! Bounded multi-producer multi-consumer backlog.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::{Notify, Semaphore};

/// Bounded FIFO shared by the workers of a pool.
///
/// Free slots are semaphore permits: a push takes one, a pop returns one.
pub(crate) struct Backlog<T> {
    items: Mutex<VecDeque<T>>,
    slots: Semaphore,
    ready: Notify,
    capacity: usize,
}

impl<T> Backlog<T> {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            items: Mutex::new(VecDeque::with_capacity(capacity)),
            slots: Semaphore::new(capacity),
            ready: Notify::new(),
            capacity,
        }
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<T>> {
        self.items.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Wait for a free slot, then enqueue. Cancel safe.
    pub async fn push(&self, item: T) {
        // The semaphore is never closed
        if let Ok(permit) = self.slots.acquire().await {
            permit.forget();
        }
        self.lock().push_back(item);
        self.ready.notify_one();
    }

    /// Enqueue if a slot is free, handing the item back otherwise.
    pub fn try_push(&self, item: T) -> Result<(), T> {
        match self.slots.try_acquire() {
            Ok(permit) => {
                permit.forget();
                self.lock().push_back(item);
                self.ready.notify_one();
                Ok(())
            }
            Err(_) => Err(item),
        }
    }

    pub fn try_pop(&self) -> Option<T> {
        let item = self.lock().pop_front();
        if item.is_some() {
            self.slots.add_permits(1);
        }
        item
    }

    /// Wait for an item. Cancel safe: an item is only removed when returned.
    pub async fn pop(&self) -> T {
        loop {
            let notified = self.ready.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(item) = self.try_pop() {
                return item;
            }
            notified.await;
        }
    }

    /// Remove up to `max` items at once.
    pub fn drain_up_to(&self, max: usize) -> Vec<T> {
        let drained: Vec<T> = {
            let mut items = self.lock();
            let n = max.min(items.len());
            items.drain(..n).collect()
        };
        if !drained.is_empty() {
            self.slots.add_permits(drained.len());
        }
        drained
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_push_pop_fifo() {
        let backlog = Backlog::new(4);
        backlog.push(1).await;
        backlog.push(2).await;
        assert_eq!(backlog.len(), 2);
        assert_eq!(backlog.pop().await, 1);
        assert_eq!(backlog.try_pop(), Some(2));
        assert!(backlog.is_empty());
    }

    #[tokio::test]
    async fn test_zero_capacity_holds_one() {
        let backlog = Backlog::new(0);
        assert_eq!(backlog.capacity(), 1);
        assert!(backlog.try_push("a").is_ok());
        assert_eq!(backlog.try_push("b"), Err("b"));
    }

    #[tokio::test]
    async fn test_push_blocks_until_slot_frees() {
        let backlog = Arc::new(Backlog::new(1));
        backlog.push(1).await;

        let blocked = tokio::time::timeout(Duration::from_millis(50), backlog.push(2)).await;
        assert!(blocked.is_err());

        let pusher = {
            let backlog = Arc::clone(&backlog);
            tokio::spawn(async move { backlog.push(3).await })
        };
        assert_eq!(backlog.pop().await, 1);
        pusher.await.unwrap();
        assert_eq!(backlog.drain_up_to(10), vec![3]);
    }

    #[tokio::test]
    async fn test_pop_wakes_on_push() {
        let backlog = Arc::new(Backlog::new(2));
        let popper = {
            let backlog = Arc::clone(&backlog);
            tokio::spawn(async move { backlog.pop().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        backlog.push(7).await;
        assert_eq!(popper.await.unwrap(), 7);
    }
}
