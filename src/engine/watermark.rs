//! Checkpoint watermark
//!
//! The checkpoint may only cover blocks whose recorded events are all
//! terminal. The watermark tracks the highest fully scanned block and the
//! outstanding (non-terminal) events by block, and yields the highest block
//! that is safe to persist.

use std::collections::{BTreeMap, HashSet};

use crate::types::EventId;

#[derive(Debug, Default)]
pub struct Watermark {
    /// Last persisted checkpoint
    committed: Option<u64>,
    /// Highest block whose events have all been recorded
    scanned: Option<u64>,
    outstanding: BTreeMap<u64, HashSet<EventId>>,
}

impl Watermark {
    /// Start from a loaded checkpoint (`None` when the chain has none yet)
    pub fn new(committed: Option<u64>) -> Self {
        Self {
            committed,
            scanned: committed,
            outstanding: BTreeMap::new(),
        }
    }

    /// Restart after a reset or watcher rebuild; outstanding events above
    /// the new checkpoint are kept
    pub fn restart(&mut self, committed: Option<u64>) {
        self.committed = committed;
        self.scanned = committed;
        if let Some(block) = committed {
            self.outstanding = self.outstanding.split_off(&(block + 1));
        }
    }

    pub fn committed(&self) -> Option<u64> {
        self.committed
    }

    /// Register a non-terminal event. Idempotent; ignored at or below the checkpoint.
    pub fn track(&mut self, block: u64, event_id: &EventId) {
        if self.committed.map_or(true, |c| block > c) {
            self.outstanding
                .entry(block)
                .or_default()
                .insert(event_id.clone());
        }
    }

    /// Event reached a terminal state (or left the pipeline)
    pub fn complete(&mut self, block: u64, event_id: &EventId) {
        if let Some(ids) = self.outstanding.get_mut(&block) {
            ids.remove(event_id);
            if ids.is_empty() {
                self.outstanding.remove(&block);
            }
        }
    }

    pub fn scanned(&mut self, to_block: u64) {
        self.scanned = Some(self.scanned.map_or(to_block, |s| s.max(to_block)));
    }

    pub fn outstanding(&self) -> usize {
        self.outstanding.values().map(HashSet::len).sum()
    }

    /// Highest block that may be persisted, if above the current checkpoint
    pub fn candidate(&self) -> Option<u64> {
        let scanned = self.scanned?;
        let limit = match self.outstanding.keys().next() {
            Some(&lowest) => scanned.min(lowest.checked_sub(1)?),
            None => scanned,
        };
        match self.committed {
            Some(committed) if limit <= committed => None,
            _ => Some(limit),
        }
    }

    pub fn commit(&mut self, block: u64) {
        self.committed = Some(self.committed.map_or(block, |c| c.max(block)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(n: u8) -> EventId {
        EventId::from(format!("id-{}", n))
    }

    #[test]
    fn test_advances_to_scanned_when_idle() {
        let mut wm = Watermark::new(Some(10));
        assert_eq!(wm.candidate(), None);
        wm.scanned(20);
        assert_eq!(wm.candidate(), Some(20));
        wm.commit(20);
        assert_eq!(wm.candidate(), None);
    }

    #[test]
    fn test_outstanding_event_holds_checkpoint() {
        let mut wm = Watermark::new(Some(10));
        wm.track(15, &id(1));
        wm.track(18, &id(2));
        wm.scanned(20);
        assert_eq!(wm.candidate(), Some(14));

        wm.complete(18, &id(2));
        assert_eq!(wm.candidate(), Some(14));

        wm.complete(15, &id(1));
        assert_eq!(wm.candidate(), Some(20));
    }

    #[test]
    fn test_track_is_idempotent() {
        let mut wm = Watermark::new(None);
        wm.track(5, &id(1));
        wm.track(5, &id(1));
        assert_eq!(wm.outstanding(), 1);
        wm.complete(5, &id(1));
        assert_eq!(wm.outstanding(), 0);
    }

    #[test]
    fn test_ignores_events_below_checkpoint() {
        let mut wm = Watermark::new(Some(10));
        wm.track(9, &id(1));
        assert_eq!(wm.outstanding(), 0);
    }

    #[test]
    fn test_block_zero_event() {
        let mut wm = Watermark::new(None);
        wm.track(0, &id(1));
        wm.scanned(5);
        assert_eq!(wm.candidate(), None);
        wm.complete(0, &id(1));
        assert_eq!(wm.candidate(), Some(5));
    }

    #[test]
    fn test_never_moves_backwards() {
        let mut wm = Watermark::new(Some(30));
        wm.scanned(20);
        assert_eq!(wm.candidate(), None);
        wm.commit(25);
        assert_eq!(wm.committed(), Some(30));
    }

    #[test]
    fn test_restart_keeps_outstanding_above_checkpoint() {
        let mut wm = Watermark::new(Some(10));
        wm.track(12, &id(1));
        wm.track(20, &id(2));
        wm.scanned(25);
        wm.restart(Some(15));
        assert_eq!(wm.outstanding(), 1);
        wm.scanned(25);
        assert_eq!(wm.candidate(), Some(19));
    }
}
