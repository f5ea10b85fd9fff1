//! Pending admission queue for one identifier.
//!
//! Entries are admission tickets: the deferred call stays with the waiting
//! task, which runs it once its ticket is granted.

use std::cmp::Reverse;
use std::collections::BTreeMap;

use tokio::sync::oneshot;
use tokio::time::Instant;

use super::backend::WindowDecision;

/// Ordering key: higher priority first, then earlier enqueue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct QueueKey {
    priority: Reverse<i32>,
    sequence: u64,
}

/// A waiting caller.
#[derive(Debug)]
pub struct QueueEntry {
    pub priority: i32,
    pub enqueued_at: Instant,
    ticket: oneshot::Sender<WindowDecision>,
}

impl QueueEntry {
    /// Whether the waiter has gone away.
    pub fn is_cancelled(&self) -> bool {
        self.ticket.is_closed()
    }

    /// Hand the admission to the waiter. Returns it back if the waiter is gone.
    pub fn grant(self, decision: WindowDecision) -> Result<(), WindowDecision> {
        self.ticket.send(decision)
    }
}

/// Returned when the queue is at capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueFull {
    pub capacity: usize,
}

/// Bounded priority queue of admission tickets.
#[derive(Debug)]
pub struct PendingQueue {
    entries: BTreeMap<QueueKey, QueueEntry>,
    next_sequence: u64,
    capacity: usize,
    /// Token of the drain serving this queue, if one is active
    pub(crate) drain: Option<u64>,
}

impl PendingQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: BTreeMap::new(),
            next_sequence: 0,
            capacity,
            drain: None,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Capacity follows the latest rule seen for the identifier.
    pub fn set_capacity(&mut self, capacity: usize) {
        self.capacity = capacity;
    }

    /// Add a waiter, or fail immediately when full.
    pub fn push(
        &mut self,
        priority: i32,
    ) -> Result<(QueueKey, oneshot::Receiver<WindowDecision>), QueueFull> {
        if self.entries.len() >= self.capacity {
            return Err(QueueFull {
                capacity: self.capacity,
            });
        }

        let key = QueueKey {
            priority: Reverse(priority),
            sequence: self.next_sequence,
        };
        self.next_sequence += 1;

        let (ticket, receiver) = oneshot::channel();
        self.entries.insert(
            key,
            QueueEntry {
                priority,
                enqueued_at: Instant::now(),
                ticket,
            },
        );
        Ok((key, receiver))
    }

    /// Drop entries whose waiters were cancelled.
    pub fn prune_cancelled(&mut self) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.is_cancelled());
        before - self.entries.len()
    }

    /// Remove the next waiter in service order.
    pub fn pop_front(&mut self) -> Option<QueueEntry> {
        self.entries.pop_first().map(|(_, entry)| entry)
    }

    /// Remove one waiter, leaving the order of the rest untouched.
    pub fn remove(&mut self, key: &QueueKey) -> Option<QueueEntry> {
        self.entries.remove(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decision() -> WindowDecision {
        WindowDecision {
            allowed: true,
            count: 1,
            remaining: 0,
            reset_at_ms: 0,
            burst: false,
        }
    }

    #[tokio::test]
    async fn test_priority_then_fifo_order() {
        let mut queue = PendingQueue::new(10);
        let (_, mut low) = queue.push(0).unwrap();
        let (_, mut high_first) = queue.push(5).unwrap();
        let (_, mut high_second) = queue.push(5).unwrap();

        let first = queue.pop_front().unwrap();
        assert_eq!(first.priority, 5);
        first.grant(decision()).unwrap();
        assert!(high_first.try_recv().is_ok());
        assert!(high_second.try_recv().is_err());

        queue.pop_front().unwrap().grant(decision()).unwrap();
        assert!(high_second.try_recv().is_ok());

        queue.pop_front().unwrap().grant(decision()).unwrap();
        assert!(low.try_recv().is_ok());
        assert!(queue.is_empty());
    }

    #[test]
    fn test_overflow_is_rejected() {
        let mut queue = PendingQueue::new(2);
        let _a = queue.push(0).unwrap();
        let _b = queue.push(0).unwrap();

        let err = queue.push(9).unwrap_err();
        assert_eq!(err, QueueFull { capacity: 2 });
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn test_zero_capacity_rejects_everything() {
        let mut queue = PendingQueue::new(0);
        assert!(queue.push(0).is_err());
    }

    #[test]
    fn test_remove_keeps_order_of_others() {
        let mut queue = PendingQueue::new(10);
        let (_, _a) = queue.push(1).unwrap();
        let (b_key, _b) = queue.push(1).unwrap();
        let (_, _c) = queue.push(3).unwrap();

        assert!(queue.remove(&b_key).is_some());
        assert!(queue.remove(&b_key).is_none());

        assert_eq!(queue.pop_front().unwrap().priority, 3);
        assert_eq!(queue.pop_front().unwrap().priority, 1);
        assert!(queue.pop_front().is_none());
    }

    #[test]
    fn test_prune_cancelled() {
        let mut queue = PendingQueue::new(10);
        let (_, a) = queue.push(0).unwrap();
        let (_, _b) = queue.push(0).unwrap();
        drop(a);

        assert_eq!(queue.prune_cancelled(), 1);
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_grant_to_cancelled_waiter_fails() {
        let mut queue = PendingQueue::new(1);
        let (_, receiver) = queue.push(0).unwrap();
        drop(receiver);

        let entry = queue.pop_front().unwrap();
        assert!(entry.is_cancelled());
        assert!(entry.grant(decision()).is_err());
    }
}
