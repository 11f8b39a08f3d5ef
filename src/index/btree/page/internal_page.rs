use std::marker::PhantomData;
use byteorder::{ByteOrder, LittleEndian};

use crate::common::types::PageId;
use crate::index::btree::error::BTreeError;
use crate::index::btree::key::IndexKey;
use crate::index::btree::page::node::{self, PageType, NODE_HEADER_SIZE};

/// Internal page format (12-byte header):
///
///  ----------------------------------------------
/// | PageType (4) | CurrentSize (4) | MaxSize (4) |
///  ----------------------------------------------
///  ---------------------------------------------------
/// | KEY(0) CHILD(0) | KEY(1) CHILD(1) | ...           |
///  ---------------------------------------------------
///
/// Slot 0 stores only a child pointer; its key bytes are never read. For
/// 1 <= i < size, KEY(i) is strictly greater than every key under CHILD(i-1)
/// and <= every key under CHILD(i). Size counts children, so an internal
/// node with size children carries size - 1 separator keys.

const CHILD_LEN: usize = 4;

fn entry_len<K: IndexKey>() -> usize {
    K::ENCODED_LEN + CHILD_LEN
}

fn entry_offset<K: IndexKey>(index: usize) -> usize {
    NODE_HEADER_SIZE + index * entry_len::<K>()
}

fn read_key<K: IndexKey>(data: &[u8], index: usize) -> K {
    let off = entry_offset::<K>(index);
    K::decode(&data[off..off + K::ENCODED_LEN])
}

fn read_child<K: IndexKey>(data: &[u8], index: usize) -> PageId {
    let off = entry_offset::<K>(index) + K::ENCODED_LEN;
    LittleEndian::read_u32(&data[off..off + 4])
}

/// Rightmost slot i in [1, size) whose key is <= the probe; 0 when none is
fn lookup_slot<K: IndexKey>(data: &[u8], size: usize, key: &K) -> usize {
    let mut lo = 1;
    let mut hi = size;
    while lo < hi {
        let mid = (lo + hi) / 2;
        if &read_key::<K>(data, mid) <= key {
            lo = mid + 1;
        } else {
            hi = mid;
        }
    }
    lo - 1
}

/// Read-only view of an internal page
pub struct InternalPageRef<'a, K> {
    data: &'a [u8],
    _marker: PhantomData<K>,
}

impl<'a, K: IndexKey> InternalPageRef<'a, K> {
    pub fn attach(data: &'a [u8]) -> Result<Self, BTreeError> {
        if node::page_type_of(data) != PageType::Internal {
            return Err(BTreeError::UnexpectedPageType {
                expected: PageType::Internal,
                found: node::raw_page_type(data),
            });
        }
        Ok(Self {
            data,
            _marker: PhantomData,
        })
    }

    pub fn size(&self) -> usize {
        node::read_size(self.data)
    }

    pub fn max_size(&self) -> usize {
        node::read_max_size(self.data)
    }

    pub fn min_size(&self) -> usize {
        (self.max_size() + 1) / 2
    }

    pub fn key_at(&self, index: usize) -> K {
        read_key::<K>(self.data, index)
    }

    pub fn child_at(&self, index: usize) -> PageId {
        read_child::<K>(self.data, index)
    }

    /// Slot of the child covering the key
    pub fn lookup(&self, key: &K) -> (usize, PageId) {
        let slot = lookup_slot::<K>(self.data, self.size(), key);
        (slot, self.child_at(slot))
    }
}

/// Mutable view of an internal page
pub struct InternalPageMut<'a, K> {
    data: &'a mut [u8],
    _marker: PhantomData<K>,
}

impl<'a, K: IndexKey> InternalPageMut<'a, K> {
    pub fn attach(data: &'a mut [u8]) -> Result<Self, BTreeError> {
        if node::page_type_of(data) != PageType::Internal {
            return Err(BTreeError::UnexpectedPageType {
                expected: PageType::Internal,
                found: node::raw_page_type(data),
            });
        }
        Ok(Self {
            data,
            _marker: PhantomData,
        })
    }

    /// Stamp a fresh internal header onto the page and return the view
    pub fn init(data: &'a mut [u8], max_size: usize) -> Self {
        node::write_page_type(data, PageType::Internal);
        node::write_size(data, 0);
        node::write_max_size(data, max_size);
        Self {
            data,
            _marker: PhantomData,
        }
    }

    pub fn size(&self) -> usize {
        node::read_size(self.data)
    }

    pub fn max_size(&self) -> usize {
        node::read_max_size(self.data)
    }

    pub fn min_size(&self) -> usize {
        (self.max_size() + 1) / 2
    }

    pub fn key_at(&self, index: usize) -> K {
        read_key::<K>(self.data, index)
    }

    pub fn set_key_at(&mut self, index: usize, key: &K) {
        let off = entry_offset::<K>(index);
        key.encode(&mut self.data[off..off + K::ENCODED_LEN]);
    }

    pub fn child_at(&self, index: usize) -> PageId {
        read_child::<K>(self.data, index)
    }

    pub fn set_child_at(&mut self, index: usize, child: PageId) {
        let off = entry_offset::<K>(index) + K::ENCODED_LEN;
        LittleEndian::write_u32(&mut self.data[off..off + 4], child);
    }

    pub fn lookup(&self, key: &K) -> (usize, PageId) {
        let slot = lookup_slot::<K>(self.data, self.size(), key);
        (slot, self.child_at(slot))
    }

    /// Slot where a new separator key belongs: first i in [1, size) whose
    /// key is greater, else size
    pub fn insert_slot(&self, key: &K) -> usize {
        let mut lo = 1;
        let mut hi = self.size();
        while lo < hi {
            let mid = (lo + hi) / 2;
            if key < &self.key_at(mid) {
                hi = mid;
            } else {
                lo = mid + 1;
            }
        }
        lo
    }

    /// Insert a (separator, child) pair at a slot, shifting the tail right
    pub fn insert_at(&mut self, index: usize, key: &K, child: PageId) {
        let size = self.size();
        let len = entry_len::<K>();
        self.data.copy_within(
            entry_offset::<K>(index)..entry_offset::<K>(size),
            entry_offset::<K>(index) + len,
        );
        node::write_size(self.data, size + 1);
        self.set_key_at(index, key);
        self.set_child_at(index, child);
    }

    /// Remove the pair at a slot, shifting the tail left
    pub fn remove_at(&mut self, index: usize) {
        let size = self.size();
        self.data.copy_within(
            entry_offset::<K>(index + 1)..entry_offset::<K>(size),
            entry_offset::<K>(index),
        );
        node::write_size(self.data, size - 1);
    }

    /// Shift every slot one position right and install a new slot 0 holding
    /// only a child pointer; the old slot 0 becomes slot 1 under `down_key`.
    /// Used when borrowing from the left sibling.
    pub fn push_front(&mut self, down_key: &K, child: PageId) {
        let size = self.size();
        let len = entry_len::<K>();
        self.data.copy_within(
            entry_offset::<K>(0)..entry_offset::<K>(size),
            entry_offset::<K>(0) + len,
        );
        node::write_size(self.data, size + 1);
        self.set_key_at(1, down_key);
        self.set_child_at(0, child);
    }

    /// Move this node's slots starting at `from` into a freshly initialized
    /// sibling at slots 1.., truncating this node to `from` slots. Slot 0 of
    /// the sibling is left for the caller to fill with the promoted pair's
    /// child.
    pub fn move_tail_to_new(&mut self, new: &mut InternalPageMut<'_, K>, from: usize) {
        let size = self.size();
        let moved = size - from;
        new.data[entry_offset::<K>(1)..entry_offset::<K>(1 + moved)]
            .copy_from_slice(&self.data[entry_offset::<K>(from)..entry_offset::<K>(size)]);
        node::write_size(new.data, 1 + moved);
        node::write_size(self.data, from);
    }

    /// Absorb the right sibling during a merge: the separator pulled down
    /// from the parent keys the sibling's slot-0 child, then the sibling's
    /// remaining slots follow verbatim.
    pub fn merge_from_right(&mut self, right: &mut InternalPageMut<'_, K>, down_key: &K) {
        let size = self.size();
        let right_size = right.size();
        self.data[entry_offset::<K>(size + 1)..entry_offset::<K>(size + right_size)]
            .copy_from_slice(&right.data[entry_offset::<K>(1)..entry_offset::<K>(right_size)]);
        node::write_size(self.data, size + right_size);
        self.set_key_at(size, down_key);
        self.set_child_at(size, right.child_at(0));
        node::write_size(right.data, 0);
    }

    /// Turn a fresh internal page into a root over two children
    pub fn populate_new_root(&mut self, left: PageId, key: &K, right: PageId) {
        node::write_size(self.data, 2);
        self.set_child_at(0, left);
        self.set_key_at(1, key);
        self.set_child_at(1, right);
    }
}
