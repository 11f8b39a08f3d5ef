use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use parking_lot::RwLock;

/// Page size in bytes (4KB)
pub const PAGE_SIZE: usize = 4096;

/// Page ID type
pub type PageId = u32;

/// Buffer pool frame ID type
pub type FrameId = usize;

/// Transaction ID type
pub type TxnId = u32;

/// Table object ID type
pub type TableOid = u32;

/// Sentinel meaning "no page". Page ids are allocated from 0 upward, so by
/// convention id 0 is the first header page a caller creates.
pub const INVALID_PAGE_ID: PageId = PageId::MAX;

/// Sentinel meaning "no transaction"
pub const INVALID_TXN_ID: TxnId = TxnId::MAX;

/// Default number of frames in the buffer pool
pub const DEFAULT_POOL_SIZE: usize = 64;

/// Default K for the LRU-K replacer
pub const DEFAULT_REPLACER_K: usize = 2;

/// Interval between passes of the background deadlock detector
pub const CYCLE_DETECTION_INTERVAL: Duration = Duration::from_millis(50);

/// Record ID: a page id plus the slot within that page
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Rid {
    pub page_id: PageId,
    pub slot_num: u32,
}

impl Rid {
    pub fn new(page_id: PageId, slot_num: u32) -> Self {
        Self { page_id, slot_num }
    }
}

impl fmt::Display for Rid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.page_id, self.slot_num)
    }
}

/// Page structure: one fixed-size block of the database file. The RwLock
/// wrapping a Page is the page latch; pin count and dirty flag live in the
/// buffer pool's frame metadata.
pub struct Page {
    pub data: [u8; PAGE_SIZE],
    pub page_id: PageId,
}

impl Page {
    pub fn new(page_id: PageId) -> Self {
        Self {
            data: [0; PAGE_SIZE],
            page_id,
        }
    }

    pub fn reset(&mut self) {
        self.data.fill(0);
        self.page_id = INVALID_PAGE_ID;
    }
}

/// Smart pointer to a page
pub type PagePtr = Arc<RwLock<Page>>;
