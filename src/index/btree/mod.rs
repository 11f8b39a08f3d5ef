pub mod error;
pub mod key;
pub mod page;
pub mod tree;

pub use error::BTreeError;
pub use key::IndexKey;
pub use tree::{BPlusTree, BPlusTreeIter};
