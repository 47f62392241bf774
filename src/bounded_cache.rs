//! Bounded cache of event ids already known to be terminal
//!
//! Watchers re-deliver events after every restart from the checkpoint. This
//! cache lets ingestion skip those without a store round trip. It is only a
//! shortcut: the store stays the source of truth, so eviction never changes
//! behaviour.
//!
//! Each entry is ~40 bytes (32-byte key + 8-byte Instant), so the default
//! 100k entries is about 4 MB.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::types::EventId;

pub const DEFAULT_TERMINAL_CACHE_SIZE: usize = 100_000;
pub const DEFAULT_TERMINAL_CACHE_TTL_SECS: u64 = 86_400; // 24 hours

/// TTL + max-size bounded set of event ids
pub struct TerminalCache {
    map: HashMap<[u8; 32], Instant>,
    max_size: usize,
    ttl: Duration,
}

impl Default for TerminalCache {
    fn default() -> Self {
        Self::new(DEFAULT_TERMINAL_CACHE_SIZE, DEFAULT_TERMINAL_CACHE_TTL_SECS)
    }
}

impl TerminalCache {
    pub fn new(max_size: usize, ttl_secs: u64) -> Self {
        Self {
            map: HashMap::new(),
            max_size: max_size.max(1),
            ttl: Duration::from_secs(ttl_secs),
        }
    }

    pub fn contains(&self, event_id: &EventId) -> bool {
        self.map
            .get(&event_id.cache_key())
            .is_some_and(|&t| t.elapsed() < self.ttl)
    }

    /// Insert, evicting expired entries and then the oldest when full
    pub fn insert(&mut self, event_id: &EventId) {
        let now = Instant::now();
        self.map.retain(|_, &mut t| now.duration_since(t) < self.ttl);
        while self.map.len() >= self.max_size {
            let oldest = self.map.iter().min_by_key(|(_, t)| **t).map(|(h, _)| *h);
            match oldest {
                Some(h) => {
                    self.map.remove(&h);
                }
                None => break,
            }
        }
        self.map.insert(event_id.cache_key(), now);
    }

    /// Forget an id (operator requeue)
    pub fn remove(&mut self, event_id: &EventId) {
        self.map.remove(&event_id.cache_key());
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(n: u8) -> EventId {
        EventId::from(format!("0x{:02x}:0x00:0", n))
    }

    #[test]
    fn test_insert_and_contains() {
        let mut cache = TerminalCache::new(10, 3600);
        assert!(!cache.contains(&id(1)));
        cache.insert(&id(1));
        assert!(cache.contains(&id(1)));
        cache.remove(&id(1));
        assert!(!cache.contains(&id(1)));
    }

    #[test]
    fn test_evicts_oldest_when_full() {
        let mut cache = TerminalCache::new(3, 3600);
        for n in 1..=4 {
            cache.insert(&id(n));
            std::thread::sleep(Duration::from_millis(1));
        }
        assert!(!cache.contains(&id(1)));
        assert!(cache.contains(&id(4)));
        assert_eq!(cache.len(), 3);
    }

    #[test]
    fn test_expired_entries_are_not_reported() {
        let mut cache = TerminalCache::new(10, 0);
        cache.insert(&id(1));
        assert!(!cache.contains(&id(1)));
    }
}
