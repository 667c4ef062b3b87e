//! Priority-ordered ready queue
//!
//! Entries sort by descending priority, then by a sequence number. Tail
//! inserts take increasing sequence numbers; head inserts take decreasing
//! ones, so a head insert lands before every peer in its tier.

use super::task::TaskId;
use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap};
use tokio::time::Instant;

type QueueKey = (Reverse<i32>, i64);

#[derive(Debug, Clone)]
struct Entry {
    id: TaskId,
    task_type: String,
    not_before: Option<Instant>,
}

#[derive(Debug, Default)]
pub(crate) struct ReadyQueue {
    entries: BTreeMap<QueueKey, Entry>,
    keys: HashMap<TaskId, QueueKey>,
    next_tail: i64,
    next_head: i64,
}

impl ReadyQueue {
    pub(crate) fn new() -> Self {
        Self {
            next_tail: 1,
            next_head: 0,
            ..Default::default()
        }
    }

    pub(crate) fn push_tail(
        &mut self,
        id: TaskId,
        priority: i32,
        task_type: &str,
        not_before: Option<Instant>,
    ) {
        let seq = self.next_tail;
        self.next_tail += 1;
        self.insert((Reverse(priority), seq), id, task_type, not_before);
    }

    pub(crate) fn push_head(
        &mut self,
        id: TaskId,
        priority: i32,
        task_type: &str,
        not_before: Option<Instant>,
    ) {
        let seq = self.next_head;
        self.next_head -= 1;
        self.insert((Reverse(priority), seq), id, task_type, not_before);
    }

    fn insert(&mut self, key: QueueKey, id: TaskId, task_type: &str, not_before: Option<Instant>) {
        self.remove(id);
        self.entries.insert(
            key,
            Entry {
                id,
                task_type: task_type.to_string(),
                not_before,
            },
        );
        self.keys.insert(id, key);
    }

    /// Remove and return the first eligible entry for the worker class
    pub(crate) fn pop(&mut self, worker_class: Option<&str>, now: Instant) -> Option<TaskId> {
        let key = self
            .entries
            .iter()
            .find(|(_, e)| Self::eligible(e, worker_class, now))
            .map(|(k, _)| *k)?;
        let entry = self.entries.remove(&key)?;
        self.keys.remove(&entry.id);
        Some(entry.id)
    }

    pub(crate) fn remove(&mut self, id: TaskId) -> bool {
        match self.keys.remove(&id) {
            Some(key) => self.entries.remove(&key).is_some(),
            None => false,
        }
    }

    #[cfg(test)]
    pub(crate) fn contains(&self, id: TaskId) -> bool {
        self.keys.contains_key(&id)
    }

    /// Earliest backoff expiry among entries the class could take
    pub(crate) fn next_eligible_at(&self, worker_class: Option<&str>) -> Option<Instant> {
        self.entries
            .values()
            .filter(|e| Self::class_matches(e, worker_class))
            .filter_map(|e| e.not_before)
            .min()
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    fn class_matches(entry: &Entry, worker_class: Option<&str>) -> bool {
        worker_class.is_none_or(|class| entry.task_type == class)
    }

    fn eligible(entry: &Entry, worker_class: Option<&str>, now: Instant) -> bool {
        Self::class_matches(entry, worker_class) && entry.not_before.is_none_or(|t| t <= now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_priority_then_fifo() {
        let mut queue = ReadyQueue::new();
        let low = TaskId::new();
        let high_a = TaskId::new();
        let high_b = TaskId::new();
        queue.push_tail(low, 1, "t", None);
        queue.push_tail(high_a, 9, "t", None);
        queue.push_tail(high_b, 9, "t", None);

        let now = Instant::now();
        assert_eq!(queue.pop(None, now), Some(high_a));
        assert_eq!(queue.pop(None, now), Some(high_b));
        assert_eq!(queue.pop(None, now), Some(low));
        assert_eq!(queue.pop(None, now), None);
    }

    #[test]
    fn test_head_insert_within_tier() {
        let mut queue = ReadyQueue::new();
        let a = TaskId::new();
        let b = TaskId::new();
        let retried = TaskId::new();
        let urgent = TaskId::new();
        queue.push_tail(a, 5, "t", None);
        queue.push_tail(b, 5, "t", None);
        queue.push_head(retried, 5, "t", None);
        queue.push_tail(urgent, 8, "t", None);

        let now = Instant::now();
        // Head placement never jumps a higher tier
        assert_eq!(queue.pop(None, now), Some(urgent));
        assert_eq!(queue.pop(None, now), Some(retried));
        assert_eq!(queue.pop(None, now), Some(a));
        assert_eq!(queue.pop(None, now), Some(b));
    }

    #[test]
    fn test_worker_class_filter() {
        let mut queue = ReadyQueue::new();
        let review = TaskId::new();
        let analysis = TaskId::new();
        queue.push_tail(review, 9, "review", None);
        queue.push_tail(analysis, 1, "analysis", None);

        let now = Instant::now();
        assert_eq!(queue.pop(Some("analysis"), now), Some(analysis));
        assert_eq!(queue.pop(Some("analysis"), now), None);
        assert_eq!(queue.pop(None, now), Some(review));
    }

    #[test]
    fn test_not_before_skipped_until_due() {
        let mut queue = ReadyQueue::new();
        let now = Instant::now();
        let delayed = TaskId::new();
        let ready = TaskId::new();
        queue.push_tail(delayed, 9, "t", Some(now + Duration::from_secs(5)));
        queue.push_tail(ready, 1, "t", None);

        assert_eq!(queue.pop(None, now), Some(ready));
        assert_eq!(queue.pop(None, now), None);
        assert_eq!(queue.next_eligible_at(None), Some(now + Duration::from_secs(5)));
        assert_eq!(
            queue.pop(None, now + Duration::from_secs(5)),
            Some(delayed)
        );
    }

    #[test]
    fn test_remove() {
        let mut queue = ReadyQueue::new();
        let id = TaskId::new();
        queue.push_tail(id, 1, "t", None);
        assert!(queue.contains(id));
        assert!(queue.remove(id));
        assert!(!queue.remove(id));
        assert_eq!(queue.len(), 0);
    }
}
