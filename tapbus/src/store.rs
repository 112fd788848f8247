//! Bounded history buffer and latest-event-per-type cache.

use std::{
    collections::{HashMap, VecDeque},
    sync::Arc,
};

use crate::Envelope;

/// Fixed-capacity FIFO of recent envelopes; the oldest is evicted first.
#[derive(Debug, Default)]
pub struct History {
    items: VecDeque<Arc<Envelope>>,
    capacity: usize,
}

impl History {
    pub fn new(capacity: usize) -> Self {
        Self {
            items: VecDeque::with_capacity(capacity.min(1024)),
            capacity,
        }
    }

    pub fn push(&mut self, envelope: Arc<Envelope>) {
        if self.capacity == 0 {
            return;
        }
        while self.items.len() >= self.capacity {
            self.items.pop_front();
        }
        self.items.push_back(envelope);
    }

    /// Change the capacity, dropping the oldest entries that no longer fit.
    pub fn set_capacity(&mut self, capacity: usize) {
        self.capacity = capacity;
        while self.items.len() > capacity {
            self.items.pop_front();
        }
    }

    /// The `limit` most recent entries (all when `None`), oldest first.
    pub fn recent(&self, limit: Option<usize>) -> Vec<Arc<Envelope>> {
        let skip = limit.map_or(0, |l| self.items.len().saturating_sub(l));
        self.items.iter().skip(skip).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }
}

/// Latest envelope per event type.
///
/// Eviction follows first-insertion order: when a new type arrives at
/// capacity, the type that was inserted earliest goes. Refreshing an
/// existing type replaces its envelope without moving it in that order, so
/// this is not an LRU.
#[derive(Debug, Default)]
pub struct EventCache {
    entries: HashMap<String, Arc<Envelope>>,
    order: VecDeque<String>,
    capacity: usize,
}

impl EventCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: HashMap::new(),
            order: VecDeque::new(),
            capacity,
        }
    }

    pub fn insert(&mut self, envelope: Arc<Envelope>) {
        if self.capacity == 0 {
            return;
        }
        if let Some(slot) = self.entries.get_mut(envelope.event_type()) {
            *slot = envelope;
            return;
        }
        while self.order.len() >= self.capacity {
            self.evict_oldest();
        }
        let key = envelope.event_type().to_string();
        self.order.push_back(key.clone());
        self.entries.insert(key, envelope);
    }

    pub fn get(&self, event_type: &str) -> Option<Arc<Envelope>> {
        self.entries.get(event_type).cloned()
    }

    pub fn set_capacity(&mut self, capacity: usize) {
        self.capacity = capacity;
        while self.order.len() > capacity {
            self.evict_oldest();
        }
    }

    /// Cached types in eviction order (next to be evicted first).
    pub fn types(&self) -> Vec<String> {
        self.order.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.order.clear();
    }

    fn evict_oldest(&mut self) {
        if let Some(key) = self.order.pop_front() {
            self.entries.remove(&key);
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn env(t: &str, seq: u64) -> Arc<Envelope> {
        Arc::new(Envelope::new(t, json!({ "type": t, "seq": seq }), seq))
    }

    fn seqs(items: &[Arc<Envelope>]) -> Vec<u64> {
        items.iter().map(|e| e.sequence()).collect()
    }

    #[test]
    fn history_keeps_most_recent_in_order() {
        let mut h = History::new(3);
        for i in 0..5 {
            h.push(env("a", i));
        }
        assert_eq!(h.len(), 3);
        assert_eq!(seqs(&h.recent(None)), vec![2, 3, 4]);
    }

    #[test]
    fn history_limit_returns_tail() {
        let mut h = History::new(10);
        for i in 0..5 {
            h.push(env("a", i));
        }
        assert_eq!(seqs(&h.recent(Some(2))), vec![3, 4]);
        assert_eq!(seqs(&h.recent(Some(50))), vec![0, 1, 2, 3, 4]);
        assert!(h.recent(Some(0)).is_empty());
    }

    #[test]
    fn history_shrink_trims_immediately() {
        let mut h = History::new(5);
        for i in 0..5 {
            h.push(env("a", i));
        }
        h.set_capacity(2);
        assert_eq!(seqs(&h.recent(None)), vec![3, 4]);
    }

    #[test]
    fn zero_capacity_history_stores_nothing() {
        let mut h = History::new(0);
        h.push(env("a", 0));
        assert_eq!(h.len(), 0);
    }

    #[test]
    fn cache_evicts_by_insertion_order() {
        let mut c = EventCache::new(2);
        c.insert(env("A", 0));
        c.insert(env("B", 1));
        c.insert(env("C", 2));
        assert!(c.get("A").is_none());
        assert_eq!(c.types(), vec!["B".to_string(), "C".to_string()]);
    }

    #[test]
    fn cache_refresh_does_not_reorder() {
        let mut c = EventCache::new(2);
        c.insert(env("A", 0));
        c.insert(env("B", 1));
        c.insert(env("A", 2));
        c.insert(env("C", 3));
        // A was inserted first, so it goes even though it was refreshed last
        assert!(c.get("A").is_none());
        assert_eq!(c.get("B").map(|e| e.sequence()), Some(1));
        assert_eq!(c.get("C").map(|e| e.sequence()), Some(3));
    }

    #[test]
    fn cache_keeps_latest_envelope() {
        let mut c = EventCache::new(4);
        c.insert(env("A", 0));
        c.insert(env("A", 5));
        assert_eq!(c.len(), 1);
        assert_eq!(c.get("A").map(|e| e.sequence()), Some(5));
    }

    #[test]
    fn cache_shrink_trims_immediately() {
        let mut c = EventCache::new(3);
        c.insert(env("A", 0));
        c.insert(env("B", 1));
        c.insert(env("C", 2));
        c.set_capacity(1);
        assert_eq!(c.types(), vec!["C".to_string()]);
        assert_eq!(c.len(), 1);
    }
}
