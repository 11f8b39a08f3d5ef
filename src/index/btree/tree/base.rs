use std::marker::PhantomData;
use std::sync::Arc;

use crate::common::types::{PageId, Rid, INVALID_PAGE_ID};
use crate::index::btree::error::BTreeError;
use crate::index::btree::key::IndexKey;
use crate::index::btree::page::{
    internal_capacity, leaf_capacity, page_type_of, HeaderPage, InternalPageRef, LeafPageRef,
    PageType,
};
use crate::storage::buffer::page_guard::{ReadPageGuard, WritePageGuard};
use crate::storage::buffer::BufferPoolManager;

/// One retained ancestor on a write descent: its exclusive guard plus the
/// slot of the child we followed out of it.
pub(crate) struct ParentLink {
    pub guard: WritePageGuard,
    pub child_index: usize,
}

/// Latch-crabbing context for a mutating descent. The header guard and the
/// write set hold exactly the ancestors a split or merge might still touch;
/// everything above the deepest safe node has already been released.
pub(crate) struct Context {
    pub header_page: Option<WritePageGuard>,
    pub write_set: Vec<ParentLink>,
}

impl Context {
    pub fn new() -> Self {
        Self {
            header_page: None,
            write_set: Vec::new(),
        }
    }

    /// The current node is safe: nothing above it can be affected anymore
    pub fn release_ancestors(&mut self) {
        self.header_page = None;
        self.write_set.clear();
    }
}

/// Concurrent B+Tree index over buffer-pool pages, mapping keys to record
/// ids. Unique keys only. The root page id lives on a dedicated header
/// page so that root replacement is just another page write.
pub struct BPlusTree<K: IndexKey> {
    pub(crate) bpm: Arc<BufferPoolManager>,
    pub(crate) header_page_id: PageId,
    pub(crate) leaf_max_size: usize,
    pub(crate) internal_max_size: usize,
    pub(crate) _marker: PhantomData<K>,
}

impl<K: IndexKey> BPlusTree<K> {
    /// Create a new (empty) tree whose header lives on an already allocated
    /// page. Max sizes are validated against what a page can physically
    /// hold for this key type.
    pub fn new(
        bpm: Arc<BufferPoolManager>,
        header_page_id: PageId,
        leaf_max_size: usize,
        internal_max_size: usize,
    ) -> Result<Self, BTreeError> {
        if leaf_max_size < 3 || leaf_max_size > leaf_capacity::<K>() {
            return Err(BTreeError::NodeTooLarge(leaf_max_size));
        }
        if internal_max_size < 3 || internal_max_size > internal_capacity::<K>() {
            return Err(BTreeError::NodeTooLarge(internal_max_size));
        }

        let mut header = bpm.fetch_page_write(header_page_id)?;
        HeaderPage::init(header.data_mut());
        drop(header);

        Ok(Self {
            bpm,
            header_page_id,
            leaf_max_size,
            internal_max_size,
            _marker: PhantomData,
        })
    }

    /// Create a tree with the largest max sizes the page size allows
    pub fn with_default_sizes(
        bpm: Arc<BufferPoolManager>,
        header_page_id: PageId,
    ) -> Result<Self, BTreeError> {
        let leaf_max = leaf_capacity::<K>();
        let internal_max = internal_capacity::<K>();
        Self::new(bpm, header_page_id, leaf_max, internal_max)
    }

    pub fn is_empty(&self) -> Result<bool, BTreeError> {
        Ok(self.get_root_page_id()? == INVALID_PAGE_ID)
    }

    pub fn get_root_page_id(&self) -> Result<PageId, BTreeError> {
        let header = self.bpm.fetch_page_read(self.header_page_id)?;
        Ok(HeaderPage::root_page_id(header.data()))
    }

    /// Point lookup. Read latches crab down: the child's latch is taken
    /// before the parent's is released.
    pub fn get_value(&self, key: &K) -> Result<Option<Rid>, BTreeError> {
        let guard = match self.find_leaf_read(key)? {
            Some(guard) => guard,
            None => return Ok(None),
        };
        let leaf = LeafPageRef::<K>::attach(guard.data())?;
        Ok(leaf.find(key).map(|index| leaf.rid_at(index)))
    }

    /// Read-crab from the root to the leaf that covers `key`; None when the
    /// tree is empty.
    pub(crate) fn find_leaf_read(&self, key: &K) -> Result<Option<ReadPageGuard>, BTreeError> {
        let header = self.bpm.fetch_page_read(self.header_page_id)?;
        let root_id = HeaderPage::root_page_id(header.data());
        if root_id == INVALID_PAGE_ID {
            return Ok(None);
        }

        let mut guard = self.bpm.fetch_page_read(root_id)?;
        drop(header);

        loop {
            match page_type_of(guard.data()) {
                PageType::Leaf => return Ok(Some(guard)),
                PageType::Internal => {
                    let child = {
                        let node = InternalPageRef::<K>::attach(guard.data())?;
                        node.lookup(key).1
                    };
                    // Crab: latch the child before dropping the parent
                    guard = self.bpm.fetch_page_read(child)?;
                }
                PageType::Invalid => {
                    return Err(BTreeError::Corrupted("descent reached an untyped page"))
                }
            }
        }
    }

    /// Read-crab to the leftmost leaf; None when the tree is empty
    pub(crate) fn find_leftmost_leaf_read(&self) -> Result<Option<ReadPageGuard>, BTreeError> {
        let header = self.bpm.fetch_page_read(self.header_page_id)?;
        let root_id = HeaderPage::root_page_id(header.data());
        if root_id == INVALID_PAGE_ID {
            return Ok(None);
        }

        let mut guard = self.bpm.fetch_page_read(root_id)?;
        drop(header);

        loop {
            match page_type_of(guard.data()) {
                PageType::Leaf => return Ok(Some(guard)),
                PageType::Internal => {
                    let child = {
                        let node = InternalPageRef::<K>::attach(guard.data())?;
                        node.child_at(0)
                    };
                    guard = self.bpm.fetch_page_read(child)?;
                }
                PageType::Invalid => {
                    return Err(BTreeError::Corrupted("descent reached an untyped page"))
                }
            }
        }
    }
}
