use std::marker::PhantomData;
use byteorder::{ByteOrder, LittleEndian};

use crate::common::types::{PageId, Rid};
use crate::index::btree::error::BTreeError;
use crate::index::btree::key::IndexKey;
use crate::index::btree::page::node::{
    self, PageType, LEAF_HEADER_SIZE, NEXT_PAGE_ID_OFFSET,
};

/// Leaf page format (keys stored in order, 16-byte header):
///
///  -----------------------------------------------------------
/// | PageType (4) | CurrentSize (4) | MaxSize (4) | NextId (4) |
///  -----------------------------------------------------------
///  -------------------------------------------
/// | KEY(0) RID(0) | KEY(1) RID(1) | ...       |
///  -------------------------------------------
///
/// A leaf holds at most max_size - 1 entries; reaching max_size - 1 and
/// inserting again triggers a split.

const RID_LEN: usize = 8;

fn entry_len<K: IndexKey>() -> usize {
    K::ENCODED_LEN + RID_LEN
}

fn entry_offset<K: IndexKey>(index: usize) -> usize {
    LEAF_HEADER_SIZE + index * entry_len::<K>()
}

fn read_key<K: IndexKey>(data: &[u8], index: usize) -> K {
    let off = entry_offset::<K>(index);
    K::decode(&data[off..off + K::ENCODED_LEN])
}

fn read_rid<K: IndexKey>(data: &[u8], index: usize) -> Rid {
    let off = entry_offset::<K>(index) + K::ENCODED_LEN;
    Rid::new(
        LittleEndian::read_u32(&data[off..off + 4]),
        LittleEndian::read_u32(&data[off + 4..off + 8]),
    )
}

/// First index whose key is >= the probe, or size when all are smaller
fn lower_bound<K: IndexKey>(data: &[u8], size: usize, key: &K) -> usize {
    let mut lo = 0;
    let mut hi = size;
    while lo < hi {
        let mid = (lo + hi) / 2;
        if &read_key::<K>(data, mid) < key {
            lo = mid + 1;
        } else {
            hi = mid;
        }
    }
    lo
}

/// Read-only view of a leaf page
pub struct LeafPageRef<'a, K> {
    data: &'a [u8],
    _marker: PhantomData<K>,
}

impl<'a, K: IndexKey> LeafPageRef<'a, K> {
    pub fn attach(data: &'a [u8]) -> Result<Self, BTreeError> {
        if node::page_type_of(data) != PageType::Leaf {
            return Err(BTreeError::UnexpectedPageType {
                expected: PageType::Leaf,
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
        self.max_size() / 2
    }

    pub fn next_page_id(&self) -> PageId {
        LittleEndian::read_u32(&self.data[NEXT_PAGE_ID_OFFSET..NEXT_PAGE_ID_OFFSET + 4])
    }

    pub fn key_at(&self, index: usize) -> K {
        read_key::<K>(self.data, index)
    }

    pub fn rid_at(&self, index: usize) -> Rid {
        read_rid::<K>(self.data, index)
    }

    /// Index of an exactly matching key
    pub fn find(&self, key: &K) -> Option<usize> {
        let idx = lower_bound::<K>(self.data, self.size(), key);
        if idx < self.size() && &self.key_at(idx) == key {
            Some(idx)
        } else {
            None
        }
    }

    pub fn lower_bound(&self, key: &K) -> usize {
        lower_bound::<K>(self.data, self.size(), key)
    }
}

/// Mutable view of a leaf page
pub struct LeafPageMut<'a, K> {
    data: &'a mut [u8],
    _marker: PhantomData<K>,
}

impl<'a, K: IndexKey> LeafPageMut<'a, K> {
    pub fn attach(data: &'a mut [u8]) -> Result<Self, BTreeError> {
        if node::page_type_of(data) != PageType::Leaf {
            return Err(BTreeError::UnexpectedPageType {
                expected: PageType::Leaf,
                found: node::raw_page_type(data),
            });
        }
        Ok(Self {
            data,
            _marker: PhantomData,
        })
    }

    /// Stamp a fresh leaf header onto the page and return the view
    pub fn init(data: &'a mut [u8], max_size: usize) -> Self {
        node::write_page_type(data, PageType::Leaf);
        node::write_size(data, 0);
        node::write_max_size(data, max_size);
        let mut view = Self {
            data,
            _marker: PhantomData,
        };
        view.set_next_page_id(crate::common::types::INVALID_PAGE_ID);
        view
    }

    pub fn size(&self) -> usize {
        node::read_size(self.data)
    }

    pub fn max_size(&self) -> usize {
        node::read_max_size(self.data)
    }

    pub fn min_size(&self) -> usize {
        self.max_size() / 2
    }

    pub fn next_page_id(&self) -> PageId {
        LittleEndian::read_u32(&self.data[NEXT_PAGE_ID_OFFSET..NEXT_PAGE_ID_OFFSET + 4])
    }

    pub fn set_next_page_id(&mut self, page_id: PageId) {
        LittleEndian::write_u32(
            &mut self.data[NEXT_PAGE_ID_OFFSET..NEXT_PAGE_ID_OFFSET + 4],
            page_id,
        );
    }

    pub fn key_at(&self, index: usize) -> K {
        read_key::<K>(self.data, index)
    }

    pub fn rid_at(&self, index: usize) -> Rid {
        read_rid::<K>(self.data, index)
    }

    pub fn find(&self, key: &K) -> Option<usize> {
        let idx = lower_bound::<K>(self.data, self.size(), key);
        if idx < self.size() && &self.key_at(idx) == key {
            Some(idx)
        } else {
            None
        }
    }

    pub fn lower_bound(&self, key: &K) -> usize {
        lower_bound::<K>(self.data, self.size(), key)
    }

    fn write_entry(&mut self, index: usize, key: &K, rid: Rid) {
        let off = entry_offset::<K>(index);
        key.encode(&mut self.data[off..off + K::ENCODED_LEN]);
        let voff = off + K::ENCODED_LEN;
        LittleEndian::write_u32(&mut self.data[voff..voff + 4], rid.page_id);
        LittleEndian::write_u32(&mut self.data[voff + 4..voff + 8], rid.slot_num);
    }

    /// Insert an entry at its sorted position, shifting the tail right
    pub fn insert(&mut self, key: &K, rid: Rid) {
        let size = self.size();
        let index = self.lower_bound(key);
        let len = entry_len::<K>();
        self.data.copy_within(
            entry_offset::<K>(index)..entry_offset::<K>(size),
            entry_offset::<K>(index) + len,
        );
        self.write_entry(index, key, rid);
        node::write_size(self.data, size + 1);
    }

    /// Remove the entry at an index, shifting the tail left
    pub fn remove_at(&mut self, index: usize) {
        let size = self.size();
        self.data.copy_within(
            entry_offset::<K>(index + 1)..entry_offset::<K>(size),
            entry_offset::<K>(index),
        );
        node::write_size(self.data, size - 1);
    }

    /// Move this leaf's entries starting at `from` onto the end of `other`,
    /// truncating this leaf to `from` entries.
    pub fn move_tail_to(&mut self, other: &mut LeafPageMut<'_, K>, from: usize) {
        let size = self.size();
        let other_size = other.size();
        let moved = size - from;
        other.data[entry_offset::<K>(other_size)..entry_offset::<K>(other_size + moved)]
            .copy_from_slice(&self.data[entry_offset::<K>(from)..entry_offset::<K>(size)]);
        node::write_size(other.data, other_size + moved);
        node::write_size(self.data, from);
    }
}
