use crate::models::PendingUpdate;
use parking_lot::Mutex;
use std::cmp::Ordering;
use std::collections::BTreeMap;

/// Highest priority first, then earliest arrival.
#[derive(Debug, Clone, Copy)]
struct QueueKey {
    priority: f32,
    seq: u64,
}

impl PartialEq for QueueKey {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for QueueKey {}

impl PartialOrd for QueueKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueueKey {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .priority
            .total_cmp(&self.priority)
            .then_with(|| self.seq.cmp(&other.seq))
    }
}

impl From<&PendingUpdate> for QueueKey {
    fn from(update: &PendingUpdate) -> Self {
        Self {
            priority: update.priority,
            seq: update.seq,
        }
    }
}

/// Bounded priority queue of pending updates. Both ends are reachable in
/// O(log n): the head feeds batches, the tail is evicted on overflow.
pub struct UpdateQueue {
    entries: Mutex<BTreeMap<QueueKey, PendingUpdate>>,
    capacity: usize,
}

impl UpdateQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(BTreeMap::new()),
            capacity: capacity.max(1),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Inserts `update`. When the queue is over capacity afterwards, the
    /// lowest-priority entry (the latest among equals) is evicted and
    /// returned; that may be `update` itself.
    pub fn push(&self, update: PendingUpdate) -> Option<PendingUpdate> {
        let mut entries = self.entries.lock();
        entries.insert(QueueKey::from(&update), update);
        if entries.len() > self.capacity {
            return entries.pop_last().map(|(_, evicted)| evicted);
        }
        None
    }

    /// Removes up to `max` highest-priority entries, marked as processed.
    pub fn pop_batch(&self, max: usize) -> Vec<PendingUpdate> {
        let mut entries = self.entries.lock();
        let take = max.min(entries.len());
        (0..take)
            .filter_map(|_| entries.pop_first())
            .map(|(_, mut update)| {
                update.processed = true;
                update
            })
            .collect()
    }

    /// Highest-priority entries without removing them.
    pub fn peek(&self, max: usize) -> Vec<PendingUpdate> {
        self.entries.lock().values().take(max).cloned().collect()
    }

    /// Drops everything queued. Returns how many entries were removed.
    pub fn clear(&self) -> usize {
        let mut entries = self.entries.lock();
        let removed = entries.len();
        entries.clear();
        removed
    }
}
