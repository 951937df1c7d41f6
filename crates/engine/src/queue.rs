//! Rotation priority queue
//!
//! A binary min-heap of [`Item`]s ordered by `priority` (the unix time a role
//! is next due). A name → slot map is kept in step with every swap so that
//! [`PriorityQueue::pop_by_key`] runs in O(log n). All operations take one
//! internal mutex.

use std::collections::HashMap;

use parking_lot::Mutex;
use thiserror::Error;

/// Queue errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueueError {
    /// An item with the same key is already queued
    #[error("an item with key '{0}' is already queued")]
    Duplicate(String),

    /// Pop from an empty queue
    #[error("queue is empty")]
    Empty,
}

/// Scheduled rotation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Item {
    /// Role name
    pub key: String,
    /// Unix seconds at which the role is due
    pub priority: i64,
    /// WAL id carried over from a failed or interrupted rotation
    pub value: Option<String>,
}

impl Item {
    /// Item without a WAL id
    pub fn new(key: impl Into<String>, priority: i64) -> Self {
        Self {
            key: key.into(),
            priority,
            value: None,
        }
    }

    /// Attach a WAL id
    pub fn with_wal(mut self, wal_id: Option<String>) -> Self {
        self.value = wal_id;
        self
    }
}

#[derive(Debug, Default)]
struct Heap {
    items: Vec<Item>,
    index: HashMap<String, usize>,
}

impl Heap {
    fn swap(&mut self, a: usize, b: usize) {
        self.items.swap(a, b);
        self.index.insert(self.items[a].key.clone(), a);
        self.index.insert(self.items[b].key.clone(), b);
    }

    fn less(&self, a: usize, b: usize) -> bool {
        self.items[a].priority < self.items[b].priority
    }

    fn sift_up(&mut self, mut slot: usize) {
        while slot > 0 {
            let parent = (slot - 1) / 2;
            if !self.less(slot, parent) {
                break;
            }
            self.swap(slot, parent);
            slot = parent;
        }
    }

    fn sift_down(&mut self, mut slot: usize) {
        let len = self.items.len();
        loop {
            let left = 2 * slot + 1;
            if left >= len {
                break;
            }
            let right = left + 1;
            let child = if right < len && self.less(right, left) {
                right
            } else {
                left
            };
            if !self.less(child, slot) {
                break;
            }
            self.swap(slot, child);
            slot = child;
        }
    }

    fn remove(&mut self, slot: usize) -> Option<Item> {
        let last = self.items.len().checked_sub(1)?;
        if slot != last {
            self.swap(slot, last);
        }
        let item = self.items.pop()?;
        self.index.remove(&item.key);
        if slot < self.items.len() {
            self.sift_down(slot);
            self.sift_up(slot);
        }
        Some(item)
    }
}

/// Min-heap of scheduled rotations
#[derive(Debug, Default)]
pub struct PriorityQueue {
    heap: Mutex<Heap>,
}

impl PriorityQueue {
    /// Empty queue
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a copy of `item`
    pub fn push(&self, item: &Item) -> Result<(), QueueError> {
        let mut heap = self.heap.lock();
        if heap.index.contains_key(&item.key) {
            return Err(QueueError::Duplicate(item.key.clone()));
        }
        let slot = heap.items.len();
        heap.index.insert(item.key.clone(), slot);
        heap.items.push(item.clone());
        heap.sift_up(slot);
        Ok(())
    }

    /// Remove the item with the smallest priority
    pub fn pop(&self) -> Result<Item, QueueError> {
        self.heap.lock().remove(0).ok_or(QueueError::Empty)
    }

    /// Remove the item with `key`, if queued
    pub fn pop_by_key(&self, key: &str) -> Option<Item> {
        let mut heap = self.heap.lock();
        let slot = *heap.index.get(key)?;
        heap.remove(slot)
    }

    /// Copy of the item with the smallest priority
    pub fn peek(&self) -> Option<Item> {
        self.heap.lock().items.first().cloned()
    }

    /// Copy of the item with `key`
    pub fn get(&self, key: &str) -> Option<Item> {
        let heap = self.heap.lock();
        heap.index.get(key).map(|&slot| heap.items[slot].clone())
    }

    /// Number of queued items
    pub fn len(&self) -> usize {
        self.heap.lock().items.len()
    }

    /// Whether the queue is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::HashSet;

    #[test]
    fn duplicates_and_empty() {
        let queue = PriorityQueue::new();
        assert_eq!(queue.pop(), Err(QueueError::Empty));
        queue.push(&Item::new("a", 10)).unwrap();
        assert_eq!(
            queue.push(&Item::new("a", 5)),
            Err(QueueError::Duplicate("a".into()))
        );
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn pushed_items_are_copies() {
        let queue = PriorityQueue::new();
        let mut item = Item::new("a", 10);
        queue.push(&item).unwrap();
        item.priority = 1;
        assert_eq!(queue.peek().map(|i| i.priority), Some(10));
    }

    #[test]
    fn pop_by_key_keeps_wal_id() {
        let queue = PriorityQueue::new();
        queue
            .push(&Item::new("a", 10).with_wal(Some("wal-1".into())))
            .unwrap();
        queue.push(&Item::new("b", 5)).unwrap();
        let a = queue.pop_by_key("a").unwrap();
        assert_eq!(a.value.as_deref(), Some("wal-1"));
        assert!(queue.pop_by_key("a").is_none());
        assert_eq!(queue.pop().unwrap().key, "b");
    }

    fn distinct_priorities() -> impl Strategy<Value = Vec<i64>> {
        prop::collection::hash_set(-1_000_000i64..1_000_000, 1..64)
            .prop_map(|set: HashSet<i64>| set.into_iter().collect())
    }

    proptest! {
        #[test]
        fn pops_come_out_in_priority_order(priorities in distinct_priorities()) {
            let queue = PriorityQueue::new();
            for (i, p) in priorities.iter().enumerate() {
                queue.push(&Item::new(format!("role-{i}"), *p)).unwrap();
            }
            let mut last = i64::MIN;
            while let Ok(item) = queue.pop() {
                prop_assert!(item.priority >= last);
                last = item.priority;
            }
            prop_assert!(queue.is_empty());
        }

        #[test]
        fn pop_by_key_leaves_minimum_at_root(
            priorities in distinct_priorities(),
            pick in any::<prop::sample::Index>(),
        ) {
            prop_assume!(priorities.len() >= 2);
            let queue = PriorityQueue::new();
            for (i, p) in priorities.iter().enumerate() {
                queue.push(&Item::new(format!("role-{i}"), *p)).unwrap();
            }
            let victim = pick.index(priorities.len());
            let removed = queue.pop_by_key(&format!("role-{victim}")).unwrap();
            prop_assert_eq!(removed.priority, priorities[victim]);

            let expected = priorities
                .iter()
                .enumerate()
                .filter(|(i, _)| *i != victim)
                .map(|(_, p)| *p)
                .min();
            prop_assert_eq!(queue.peek().map(|i| i.priority), expected);
            prop_assert_eq!(queue.len(), priorities.len() - 1);
        }
    }
}
