use thiserror::Error;

use crate::index::btree::page::PageType;
use crate::storage::buffer::BufferPoolError;

#[derive(Error, Debug)]
pub enum BTreeError {
    #[error("Node of {0} entries does not fit in a page")]
    NodeTooLarge(usize),

    #[error("Unexpected page type: expected {expected:?}, found tag {found}")]
    UnexpectedPageType { expected: PageType, found: u32 },

    #[error("Tree structure corrupted: {0}")]
    Corrupted(&'static str),

    #[error("Buffer pool error: {0}")]
    BufferPoolError(#[from] BufferPoolError),
}
