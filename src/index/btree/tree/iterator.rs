use std::sync::Arc;
use log::warn;

use crate::common::types::{PageId, Rid, INVALID_PAGE_ID};
use crate::index::btree::error::BTreeError;
use crate::index::btree::key::IndexKey;
use crate::index::btree::page::LeafPageRef;
use crate::index::btree::tree::base::BPlusTree;
use crate::storage::buffer::BufferPoolManager;

/// Forward iterator over the leaf chain in key order.
///
/// Holds no latches between advances: each step re-latches the current leaf
/// briefly, so a scan observes entries with read-committed semantics and
/// never blocks writers for longer than one access.
pub struct BPlusTreeIter<K: IndexKey> {
    bpm: Arc<BufferPoolManager>,
    page_id: PageId,
    index: usize,
    current: Option<(K, Rid)>,
}

enum Step<K> {
    Entry(PageId, usize, (K, Rid)),
    Follow(PageId),
}

impl<K: IndexKey> BPlusTreeIter<K> {
    pub(crate) fn new(
        bpm: Arc<BufferPoolManager>,
        page_id: PageId,
        index: usize,
        current: Option<(K, Rid)>,
    ) -> Self {
        Self {
            bpm,
            page_id,
            index,
            current,
        }
    }

    pub(crate) fn end_iter(bpm: Arc<BufferPoolManager>) -> Self {
        Self {
            bpm,
            page_id: INVALID_PAGE_ID,
            index: 0,
            current: None,
        }
    }

    pub fn is_end(&self) -> bool {
        self.current.is_none()
    }

    /// Move to the next entry, following the sibling pointer off the end of
    /// a leaf. The current leaf's latch is dropped before the next leaf is
    /// touched, so a scan never holds two latches at once. A failed page
    /// fetch ends the scan.
    fn advance(&mut self) {
        if self.page_id == INVALID_PAGE_ID {
            self.current = None;
            return;
        }

        // Stage one: the next entry within the current leaf, or the sibling
        // pointer to chase once this leaf's latch is back down
        let within = (|| -> Result<Step<K>, BTreeError> {
            let guard = self.bpm.fetch_page_read(self.page_id)?;
            let leaf = LeafPageRef::<K>::attach(guard.data())?;
            if self.index + 1 < leaf.size() {
                let index = self.index + 1;
                Ok(Step::Entry(
                    self.page_id,
                    index,
                    (leaf.key_at(index), leaf.rid_at(index)),
                ))
            } else {
                Ok(Step::Follow(leaf.next_page_id()))
            }
        })();

        let next_page = match within {
            Ok(Step::Entry(page_id, index, entry)) => {
                self.page_id = page_id;
                self.index = index;
                self.current = Some(entry);
                return;
            }
            Ok(Step::Follow(next)) => next,
            Err(e) => {
                warn!("index scan stopped early: {}", e);
                self.page_id = INVALID_PAGE_ID;
                self.current = None;
                return;
            }
        };

        if next_page == INVALID_PAGE_ID {
            self.page_id = INVALID_PAGE_ID;
            self.current = None;
            return;
        }

        // Stage two: first entry of the sibling leaf
        let first = (|| -> Result<Option<(K, Rid)>, BTreeError> {
            let guard = self.bpm.fetch_page_read(next_page)?;
            let leaf = LeafPageRef::<K>::attach(guard.data())?;
            if leaf.size() == 0 {
                return Ok(None);
            }
            Ok(Some((leaf.key_at(0), leaf.rid_at(0))))
        })();

        match first {
            Ok(Some(entry)) => {
                self.page_id = next_page;
                self.index = 0;
                self.current = Some(entry);
            }
            Ok(None) => {
                self.page_id = INVALID_PAGE_ID;
                self.current = None;
            }
            Err(e) => {
                warn!("index scan stopped early: {}", e);
                self.page_id = INVALID_PAGE_ID;
                self.current = None;
            }
        }
    }
}

impl<K: IndexKey> Iterator for BPlusTreeIter<K> {
    type Item = (K, Rid);

    fn next(&mut self) -> Option<Self::Item> {
        let item = self.current.take()?;
        self.advance();
        Some(item)
    }
}

impl<K: IndexKey> BPlusTree<K> {
    /// Iterator positioned at the smallest key
    pub fn begin(&self) -> Result<BPlusTreeIter<K>, BTreeError> {
        let guard = match self.find_leftmost_leaf_read()? {
            Some(guard) => guard,
            None => return Ok(BPlusTreeIter::end_iter(Arc::clone(&self.bpm))),
        };
        let leaf = LeafPageRef::<K>::attach(guard.data())?;
        if leaf.size() == 0 {
            return Ok(BPlusTreeIter::end_iter(Arc::clone(&self.bpm)));
        }
        let current = Some((leaf.key_at(0), leaf.rid_at(0)));
        Ok(BPlusTreeIter::new(
            Arc::clone(&self.bpm),
            guard.page_id(),
            0,
            current,
        ))
    }

    /// Iterator positioned at an exactly matching key, or the end iterator
    /// when the key is absent
    pub fn begin_at(&self, key: &K) -> Result<BPlusTreeIter<K>, BTreeError> {
        let guard = match self.find_leaf_read(key)? {
            Some(guard) => guard,
            None => return Ok(BPlusTreeIter::end_iter(Arc::clone(&self.bpm))),
        };
        let leaf = LeafPageRef::<K>::attach(guard.data())?;
        let index = match leaf.find(key) {
            Some(index) => index,
            None => return Ok(BPlusTreeIter::end_iter(Arc::clone(&self.bpm))),
        };
        let current = Some((leaf.key_at(index), leaf.rid_at(index)));
        Ok(BPlusTreeIter::new(
            Arc::clone(&self.bpm),
            guard.page_id(),
            index,
            current,
        ))
    }

    /// The end iterator
    pub fn end(&self) -> BPlusTreeIter<K> {
        BPlusTreeIter::end_iter(Arc::clone(&self.bpm))
    }
}
