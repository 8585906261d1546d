//! Per-target wait queues.
//!
//! Each target keeps an ordered set of pending allocations keyed by
//! `(priority, created_at, id)`: numerically lower priority first, then
//! earlier creation, then lower id. The ordering is total, so every target
//! has exactly one head.

use super::allocation::AllocationId;
use crate::core::time::Tick;
use std::collections::{BTreeSet, HashMap};

/// Queue ordering key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct QueueKey {
    pub priority: u32,
    pub created_at: Tick,
    pub id: AllocationId,
}

/// Wait queues for every contended target.
#[derive(Debug, Default)]
pub struct WaitQueues {
    queues: HashMap<String, BTreeSet<QueueKey>>,
}

impl WaitQueues {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue an allocation on every target it requests.
    pub fn push<'a>(&mut self, key: QueueKey, targets: impl IntoIterator<Item = &'a String>) {
        for target in targets {
            self.queues.entry(target.clone()).or_default().insert(key);
        }
    }

    /// Remove an allocation from every target queue it sits in.
    pub fn remove<'a>(&mut self, key: &QueueKey, targets: impl IntoIterator<Item = &'a String>) {
        for target in targets {
            if let Some(queue) = self.queues.get_mut(target) {
                queue.remove(key);
                if queue.is_empty() {
                    self.queues.remove(target);
                }
            }
        }
    }

    /// Best-ranked waiter for a target.
    pub fn head(&self, target: &str) -> Option<QueueKey> {
        self.queues
            .get(target)
            .and_then(|queue| queue.iter().next().copied())
    }

    /// Distinct queue heads across all targets, best-ranked first.
    pub fn heads(&self) -> BTreeSet<QueueKey> {
        self.queues
            .values()
            .filter_map(|queue| queue.iter().next().copied())
            .collect()
    }

    /// Number of waiters on a target.
    pub fn depth(&self, target: &str) -> usize {
        self.queues.get(target).map(BTreeSet::len).unwrap_or(0)
    }

    /// Whether nothing is waiting anywhere.
    pub fn is_empty(&self) -> bool {
        self.queues.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(priority: u32, ms: u64, id: u64) -> QueueKey {
        QueueKey {
            priority,
            created_at: Tick::new(ms),
            id: AllocationId(id),
        }
    }

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn ordering_is_priority_then_time_then_id() {
        assert!(key(1, 50, 9) < key(5, 0, 1));
        assert!(key(5, 10, 9) < key(5, 20, 1));
        assert!(key(5, 10, 1) < key(5, 10, 2));
    }

    #[test]
    fn head_follows_priority_not_arrival() {
        let mut q = WaitQueues::new();
        let late_urgent = key(1, 100, 2);
        let early_lazy = key(5, 0, 1);
        q.push(early_lazy, &names(&["a"]));
        q.push(late_urgent, &names(&["a"]));
        assert_eq!(q.head("a"), Some(late_urgent));
        assert_eq!(q.depth("a"), 2);
    }

    #[test]
    fn remove_clears_every_target() {
        let mut q = WaitQueues::new();
        let k = key(1, 0, 1);
        let targets = names(&["a", "b"]);
        q.push(k, &targets);
        assert_eq!(q.heads().len(), 1);
        q.remove(&k, &targets);
        assert!(q.is_empty());
        assert_eq!(q.head("a"), None);
        assert_eq!(q.depth("b"), 0);
    }
}
