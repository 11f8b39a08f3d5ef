mod header_page;
mod internal_page;
mod leaf_page;
mod node;

pub use header_page::HeaderPage;
pub use internal_page::{InternalPageMut, InternalPageRef};
pub use leaf_page::{LeafPageMut, LeafPageRef};
pub use node::{page_type_of, PageType, NODE_HEADER_SIZE, LEAF_HEADER_SIZE};

use crate::common::types::PAGE_SIZE;
use crate::index::btree::key::IndexKey;

/// Largest max_size a leaf page can carry for this key type
pub fn leaf_capacity<K: IndexKey>() -> usize {
    (PAGE_SIZE - LEAF_HEADER_SIZE) / (K::ENCODED_LEN + 8)
}

/// Largest max_size an internal page can carry for this key type
pub fn internal_capacity<K: IndexKey>() -> usize {
    (PAGE_SIZE - NODE_HEADER_SIZE) / (K::ENCODED_LEN + 4)
}
