use std::collections::{BTreeSet, HashMap, VecDeque};
use thiserror::Error;

use crate::common::types::FrameId;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ReplacerError {
    #[error("Frame {0} is outside the replacer's range")]
    FrameIdOutOfRange(FrameId),
    #[error("Frame {0} is not evictable")]
    NotEvictable(FrameId),
}

/// Per-frame access record: the last K access timestamps plus the
/// evictability flag
struct LruKNode {
    history: VecDeque<u64>,
    is_evictable: bool,
}

impl LruKNode {
    fn new() -> Self {
        Self {
            history: VecDeque::new(),
            is_evictable: false,
        }
    }

    /// Timestamp that orders this node within its bucket: the first access
    /// while cold, the K-th most recent access once warm
    fn order_key(&self) -> u64 {
        *self.history.front().unwrap()
    }
}

/// LRU-K page replacement policy.
///
/// Frames fall into two buckets: "cold" frames with fewer than K recorded
/// accesses (infinite backward K-distance) and "warm" frames with a full
/// history. Eviction prefers the cold bucket, ordered by earliest first
/// access; within the warm bucket the victim is the frame whose K-th most
/// recent access is oldest. Both buckets are ordered sets keyed by
/// (timestamp, frame id), so every operation is O(log n).
pub struct LruKReplacer {
    node_store: HashMap<FrameId, LruKNode>,
    cold: BTreeSet<(u64, FrameId)>,
    warm: BTreeSet<(u64, FrameId)>,
    current_timestamp: u64,
    curr_size: usize,
    replacer_size: usize,
    k: usize,
}

impl LruKReplacer {
    pub fn new(num_frames: usize, k: usize) -> Self {
        assert!(k >= 1, "LRU-K requires k >= 1");
        Self {
            node_store: HashMap::with_capacity(num_frames),
            cold: BTreeSet::new(),
            warm: BTreeSet::new(),
            current_timestamp: 0,
            curr_size: 0,
            replacer_size: num_frames,
            k,
        }
    }

    /// Record an access to a frame at the current logical timestamp. The
    /// first access creates the node, not yet evictable.
    pub fn record_access(&mut self, frame_id: FrameId) -> Result<(), ReplacerError> {
        self.current_timestamp += 1;
        self.check_range(frame_id)?;

        let k = self.k;
        let node = self.node_store.entry(frame_id).or_insert_with(LruKNode::new);

        if node.history.is_empty() {
            node.history.push_back(self.current_timestamp);
            let key = (node.order_key(), frame_id);
            if node.history.len() >= k {
                self.warm.insert(key);
            } else {
                self.cold.insert(key);
            }
            return Ok(());
        }

        let was_warm = node.history.len() >= k;
        let old_key = node.order_key();

        node.history.push_back(self.current_timestamp);
        if node.history.len() > k {
            node.history.pop_front();
        }

        let is_warm = node.history.len() >= k;
        let new_key = node.order_key();

        match (was_warm, is_warm) {
            (false, false) => {} // cold key is the first access, unchanged
            (false, true) => {
                self.cold.remove(&(old_key, frame_id));
                self.warm.insert((new_key, frame_id));
            }
            (true, true) => {
                self.warm.remove(&(old_key, frame_id));
                self.warm.insert((new_key, frame_id));
            }
            (true, false) => unreachable!("history never shrinks"),
        }

        Ok(())
    }

    /// Toggle whether a frame is a candidate for eviction. Unknown in-range
    /// frames are a no-op.
    pub fn set_evictable(&mut self, frame_id: FrameId, set_evictable: bool) -> Result<(), ReplacerError> {
        self.current_timestamp += 1;
        self.check_range(frame_id)?;

        if let Some(node) = self.node_store.get_mut(&frame_id) {
            if node.is_evictable && !set_evictable {
                self.curr_size -= 1;
            } else if !node.is_evictable && set_evictable {
                self.curr_size += 1;
            }
            node.is_evictable = set_evictable;
        }
        Ok(())
    }

    /// Pick a victim frame and drop its history, or None when nothing is
    /// evictable. Cold frames win over warm ones.
    pub fn evict(&mut self) -> Option<FrameId> {
        self.current_timestamp += 1;

        let victim = self
            .first_evictable(true)
            .or_else(|| self.first_evictable(false))?;
        self.remove_tracked(victim);
        Some(victim)
    }

    /// Forcibly remove a frame's history. Untracked frames are a no-op;
    /// removing a non-evictable frame is an error.
    pub fn remove(&mut self, frame_id: FrameId) -> Result<(), ReplacerError> {
        self.current_timestamp += 1;
        self.check_range(frame_id)?;

        match self.node_store.get(&frame_id) {
            None => Ok(()),
            Some(node) if !node.is_evictable => Err(ReplacerError::NotEvictable(frame_id)),
            Some(_) => {
                self.remove_tracked(frame_id);
                Ok(())
            }
        }
    }

    /// Number of currently evictable frames
    pub fn size(&self) -> usize {
        self.curr_size
    }

    fn first_evictable(&self, cold: bool) -> Option<FrameId> {
        let bucket = if cold { &self.cold } else { &self.warm };
        bucket
            .iter()
            .find(|(_, fid)| self.node_store[fid].is_evictable)
            .map(|&(_, fid)| fid)
    }

    fn remove_tracked(&mut self, frame_id: FrameId) {
        let node = self.node_store.remove(&frame_id).expect("tracked frame");
        let key = (node.order_key(), frame_id);
        if node.history.len() >= self.k {
            self.warm.remove(&key);
        } else {
            self.cold.remove(&key);
        }
        if node.is_evictable {
            self.curr_size -= 1;
        }
    }

    fn check_range(&self, frame_id: FrameId) -> Result<(), ReplacerError> {
        if frame_id >= self.replacer_size {
            return Err(ReplacerError::FrameIdOutOfRange(frame_id));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_evict_prefers_cold_frames() {
        let mut replacer = LruKReplacer::new(8, 2);

        // Frames 1 and 2 become warm, frame 3 stays cold
        for fid in [1, 2, 1, 2, 3] {
            replacer.record_access(fid).unwrap();
        }
        for fid in [1, 2, 3] {
            replacer.set_evictable(fid, true).unwrap();
        }

        assert_eq!(replacer.evict(), Some(3));
        // Among warm frames, 1 has the older second-most-recent access
        assert_eq!(replacer.evict(), Some(1));
        assert_eq!(replacer.evict(), Some(2));
        assert_eq!(replacer.evict(), None);
    }

    #[test]
    fn test_non_evictable_frames_are_skipped() {
        let mut replacer = LruKReplacer::new(4, 2);
        replacer.record_access(0).unwrap();
        replacer.record_access(1).unwrap();
        replacer.set_evictable(1, true).unwrap();

        assert_eq!(replacer.size(), 1);
        assert_eq!(replacer.evict(), Some(1));
        assert_eq!(replacer.evict(), None);
    }

    #[test]
    fn test_remove_non_evictable_fails() {
        let mut replacer = LruKReplacer::new(4, 2);
        replacer.record_access(0).unwrap();
        assert_eq!(replacer.remove(0), Err(ReplacerError::NotEvictable(0)));

        replacer.set_evictable(0, true).unwrap();
        assert_eq!(replacer.remove(0), Ok(()));
        assert_eq!(replacer.size(), 0);

        // Untracked frame is a no-op
        assert_eq!(replacer.remove(2), Ok(()));
    }

    #[test]
    fn test_out_of_range_frame_id() {
        let mut replacer = LruKReplacer::new(4, 2);
        assert_eq!(
            replacer.record_access(4),
            Err(ReplacerError::FrameIdOutOfRange(4))
        );
        assert_eq!(
            replacer.set_evictable(9, true),
            Err(ReplacerError::FrameIdOutOfRange(9))
        );
    }

    #[test]
    fn test_k_equals_one_degenerates_to_lru() {
        let mut replacer = LruKReplacer::new(4, 1);
        for fid in [0, 1, 2] {
            replacer.record_access(fid).unwrap();
            replacer.set_evictable(fid, true).unwrap();
        }
        // Touch 0 again so it becomes the most recently used
        replacer.record_access(0).unwrap();

        assert_eq!(replacer.evict(), Some(1));
        assert_eq!(replacer.evict(), Some(2));
        assert_eq!(replacer.evict(), Some(0));
    }

    #[test]
    fn test_history_bounded_at_k() {
        let mut replacer = LruKReplacer::new(4, 2);
        // Nine accesses to one frame; only the last two timestamps count
        for _ in 0..9 {
            replacer.record_access(0).unwrap();
        }
        replacer.record_access(1).unwrap();
        replacer.record_access(1).unwrap();
        replacer.set_evictable(0, true).unwrap();
        replacer.set_evictable(1, true).unwrap();

        // Frame 0's K-th most recent access (timestamp 8) is older than
        // frame 1's (timestamp 10)
        assert_eq!(replacer.evict(), Some(0));
    }
}
