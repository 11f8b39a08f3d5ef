use stratadb::storage::buffer::replacer::{LruKReplacer, ReplacerError};

// Frames 1..=5 are touched twice, frame 6 only once: the cold class (fewer
// than K accesses) always loses its members first, ordered by first access.
#[test]
fn test_cold_class_evicted_first() {
    let mut replacer = LruKReplacer::new(7, 2);

    for fid in [1, 2, 3, 4, 5, 6, 1, 2, 3, 4, 5] {
        replacer.record_access(fid).unwrap();
    }
    for fid in 1..=6 {
        replacer.set_evictable(fid, true).unwrap();
    }
    assert_eq!(replacer.size(), 6);

    assert_eq!(replacer.evict(), Some(6));
    assert_eq!(replacer.size(), 5);
}

// Within the warm class the victim is the frame whose K-th most recent
// access lies furthest in the past.
#[test]
fn test_backward_k_distance_ordering() {
    let mut replacer = LruKReplacer::new(7, 2);

    for fid in [1, 2, 3, 1, 2, 3] {
        replacer.record_access(fid).unwrap();
    }
    for fid in 1..=3 {
        replacer.set_evictable(fid, true).unwrap();
    }

    // Second-most-recent accesses: frame 1 at t1, frame 2 at t2, frame 3 at t3
    assert_eq!(replacer.evict(), Some(1));
    assert_eq!(replacer.evict(), Some(2));
    assert_eq!(replacer.evict(), Some(3));
    assert_eq!(replacer.evict(), None);
}

#[test]
fn test_pinned_frames_survive_eviction() {
    let mut replacer = LruKReplacer::new(4, 2);

    for fid in [0, 1, 2] {
        replacer.record_access(fid).unwrap();
    }
    replacer.set_evictable(0, true).unwrap();
    replacer.set_evictable(1, false).unwrap();
    replacer.set_evictable(2, true).unwrap();

    assert_eq!(replacer.size(), 2);
    assert_eq!(replacer.evict(), Some(0));
    assert_eq!(replacer.evict(), Some(2));
    assert_eq!(replacer.evict(), None);

    // Frame 1 is still tracked; making it evictable revives it
    replacer.set_evictable(1, true).unwrap();
    assert_eq!(replacer.evict(), Some(1));
}

#[test]
fn test_remove_semantics() {
    let mut replacer = LruKReplacer::new(4, 2);

    replacer.record_access(1).unwrap();
    assert_eq!(replacer.remove(1), Err(ReplacerError::NotEvictable(1)));

    replacer.set_evictable(1, true).unwrap();
    assert_eq!(replacer.remove(1), Ok(()));
    assert_eq!(replacer.size(), 0);
    assert_eq!(replacer.evict(), None);

    // Untracked frames are a no-op, out-of-range ones an error
    assert_eq!(replacer.remove(3), Ok(()));
    assert_eq!(replacer.remove(10), Err(ReplacerError::FrameIdOutOfRange(10)));
}

// With K = 1 the policy degenerates to classical LRU
#[test]
fn test_k_one_is_plain_lru() {
    let mut replacer = LruKReplacer::new(5, 1);

    for fid in [0, 1, 2, 3] {
        replacer.record_access(fid).unwrap();
        replacer.set_evictable(fid, true).unwrap();
    }
    replacer.record_access(1).unwrap();
    replacer.record_access(0).unwrap();

    assert_eq!(replacer.evict(), Some(2));
    assert_eq!(replacer.evict(), Some(3));
    assert_eq!(replacer.evict(), Some(1));
    assert_eq!(replacer.evict(), Some(0));
}

#[test]
fn test_reaccess_after_eviction_starts_cold() {
    let mut replacer = LruKReplacer::new(4, 2);

    replacer.record_access(0).unwrap();
    replacer.record_access(0).unwrap();
    replacer.record_access(1).unwrap();
    replacer.record_access(1).unwrap();
    replacer.set_evictable(0, true).unwrap();
    replacer.set_evictable(1, true).unwrap();

    assert_eq!(replacer.evict(), Some(0));

    // Frame 0 comes back with an empty history: cold again, evicted before
    // the warm frame 1
    replacer.record_access(0).unwrap();
    replacer.set_evictable(0, true).unwrap();
    assert_eq!(replacer.evict(), Some(0));
    assert_eq!(replacer.evict(), Some(1));
}
