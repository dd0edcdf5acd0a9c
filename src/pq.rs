//! Priority Queue with lazy deletion
//!
//! Uses std::collections::BinaryHeap with a HashMap keyed by a stable id.
//! Removal only drops the map entry; the heap key goes stale and is skipped
//! on peek/pop. Ids are never reused, so removing an already-popped id is a
//! harmless no-op.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};

/// Key for the priority queue heap.
/// Uses (deadline, tie, id) for deterministic ordering.
#[derive(Clone, Debug, PartialEq, Eq)]
struct Key {
    deadline: i64,
    tie: u64,
    id: u64,
}

impl PartialOrd for Key {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

// BinaryHeap is a max-heap, so we reverse the ordering for min-heap behavior.
impl Ord for Key {
    fn cmp(&self, other: &Self) -> Ordering {
        self.deadline
            .cmp(&other.deadline)
            .then(self.tie.cmp(&other.tie))
            .then(self.id.cmp(&other.id))
            .reverse()
    }
}

/// A min-priority queue with support for remove by id.
/// The HashMap is the source of truth; stale heap entries are discarded on
/// peek/pop.
pub struct MinPq<M> {
    heap: BinaryHeap<Key>,
    live: HashMap<u64, (i64, u64, M)>, // id -> (deadline, tie, metadata)
}

impl<M> Default for MinPq<M> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M> MinPq<M> {
    pub fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
            live: HashMap::new(),
        }
    }

    /// Add an item to the queue. Returns false if id already exists.
    pub fn add(&mut self, id: u64, deadline: i64, tie: u64, meta: M) -> bool {
        if self.live.contains_key(&id) {
            return false;
        }
        self.live.insert(id, (deadline, tie, meta));
        self.heap.push(Key { deadline, tie, id });
        true
    }

    /// Remove an item by id. Returns the metadata if found.
    pub fn remove(&mut self, id: u64) -> Option<M> {
        self.live.remove(&id).map(|(_, _, m)| m)
    }

    /// Check whether an id is still queued.
    pub fn contains(&self, id: u64) -> bool {
        self.live.contains_key(&id)
    }

    /// Peek the minimum deadline without removing. Returns None if empty.
    pub fn peek_deadline(&mut self) -> Option<i64> {
        self.clean_top();
        self.heap.peek().map(|k| k.deadline)
    }

    /// Pop the minimum item. Returns (id, deadline, metadata).
    pub fn pop(&mut self) -> Option<(u64, i64, M)> {
        loop {
            let k = self.heap.pop()?;
            let Some((dl, _, meta)) = self.live.remove(&k.id) else {
                continue; // stale entry
            };
            return Some((k.id, dl, meta));
        }
    }

    /// Remove stale entries from the top of the heap.
    fn clean_top(&mut self) {
        while let Some(k) = self.heap.peek() {
            if self.live.contains_key(&k.id) {
                break;
            }
            self.heap.pop();
        }
    }

    /// Drop every item.
    pub fn clear(&mut self) {
        self.heap.clear();
        self.live.clear();
    }

    /// Check if the queue is empty.
    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }

    /// Get the number of live items.
    pub fn len(&self) -> usize {
        self.live.len()
    }
}
