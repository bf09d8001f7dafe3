//! A deduplicating delay queue: schedule an item to fire after a duration, where
//! re-scheduling an already-queued item replaces its fire time rather than queuing twice.
//!
//! Styled after `kube_runtime::scheduler::Scheduler`'s `DelayQueue` + dedup-`HashMap`
//! pairing, simplified to a pull (`async fn next`) interface to match the task-based
//! scheduler driving it, rather than `kube_runtime`'s `Stream`/`Sink` combinator style.

use std::hash::Hash;
use std::time::Duration;
use tokio_util::time::delay_queue::{self, DelayQueue};

pub struct TimerWheel<T> {
    queue: DelayQueue<T>,
    keys: hashbrown::HashMap<T, delay_queue::Key>,
}

impl<T: Eq + Hash + Clone> Default for TimerWheel<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Eq + Hash + Clone> TimerWheel<T> {
    #[must_use]
    pub fn new() -> Self {
        Self { queue: DelayQueue::new(), keys: hashbrown::HashMap::new() }
    }

    /// Schedule `item` to fire after `after`. If already scheduled, its fire time is
    /// reset rather than a second entry being queued.
    pub fn schedule(&mut self, item: T, after: Duration) {
        if let Some(key) = self.keys.get(&item) {
            self.queue.reset(key, after);
        } else {
            let key = self.queue.insert(item.clone(), after);
            self.keys.insert(item, key);
        }
    }

    pub fn cancel(&mut self, item: &T) {
        if let Some(key) = self.keys.remove(item) {
            self.queue.try_remove(&key);
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Wait for the next item to fire. Resolves to `None` only if the queue is empty and
    /// stays empty forever (in practice, callers `select!` this against other event
    /// sources and never observe `None`).
    pub async fn next(&mut self) -> Option<T> {
        use futures::StreamExt;
        let expired = self.queue.next().await?;
        let item = expired.into_inner();
        self.keys.remove(&item);
        Some(item)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn fires_after_the_scheduled_delay() {
        let mut wheel = TimerWheel::new();
        wheel.schedule("a".to_string(), Duration::from_secs(5));
        tokio::time::advance(Duration::from_secs(6)).await;
        assert_eq!(wheel.next().await, Some("a".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn rescheduling_replaces_the_fire_time() {
        let mut wheel = TimerWheel::new();
        wheel.schedule("a".to_string(), Duration::from_secs(10));
        wheel.schedule("a".to_string(), Duration::from_secs(1));
        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(wheel.next().await, Some("a".to_string()));
    }

    #[tokio::test]
    async fn cancel_removes_a_pending_entry() {
        let mut wheel = TimerWheel::new();
        wheel.schedule("a".to_string(), Duration::from_millis(10));
        wheel.cancel(&"a".to_string());
        assert!(wheel.is_empty());
    }
}
