use std::sync::Arc;
use parking_lot::lock_api::{ArcRwLockReadGuard, ArcRwLockWriteGuard};
use parking_lot::RawRwLock;

use crate::common::types::{Page, PageId, PagePtr, PAGE_SIZE};
use crate::storage::buffer::manager::BufferPoolManager;

type PageReadLatch = ArcRwLockReadGuard<RawRwLock, Page>;
type PageWriteLatch = ArcRwLockWriteGuard<RawRwLock, Page>;

/// Pin-only RAII handle over a fetched page. Holds no latch; `data` /
/// `data_mut` take the page latch for the duration of the call. Dropping
/// the guard unpins the page, passing along the dirty hint accumulated
/// through `data_mut`.
pub struct BasicPageGuard {
    bpm: Arc<BufferPoolManager>,
    page: Option<PagePtr>,
    page_id: PageId,
    is_dirty: bool,
}

impl BasicPageGuard {
    pub(crate) fn new(bpm: Arc<BufferPoolManager>, page: PagePtr, page_id: PageId) -> Self {
        Self {
            bpm,
            page: Some(page),
            page_id,
            is_dirty: false,
        }
    }

    pub fn page_id(&self) -> PageId {
        self.page_id
    }

    /// Copy out the page contents under a short shared latch
    pub fn read_data(&self) -> [u8; PAGE_SIZE] {
        let page = self.page.as_ref().expect("guard is live").read();
        page.data
    }

    /// Mutate the page under a short exclusive latch; marks the guard dirty
    pub fn with_data_mut<R>(&mut self, f: impl FnOnce(&mut [u8]) -> R) -> R {
        self.is_dirty = true;
        let mut page = self.page.as_ref().expect("guard is live").write();
        f(&mut page.data)
    }

    /// Trade the pin-only guard for one holding the shared page latch
    pub fn upgrade_read(mut self) -> ReadPageGuard {
        let page = self.page.take().expect("guard is live");
        // The pin transfers to the new guard; our Drop sees the taken page
        // and leaves it alone.
        ReadPageGuard {
            bpm: Arc::clone(&self.bpm),
            page_id: self.page_id,
            latch: Some(page.read_arc()),
        }
    }

    /// Trade the pin-only guard for one holding the exclusive page latch
    pub fn upgrade_write(mut self) -> WritePageGuard {
        let page = self.page.take().expect("guard is live");
        // The pin transfers to the new guard; our Drop sees the taken page
        // and leaves it alone.
        WritePageGuard {
            bpm: Arc::clone(&self.bpm),
            page_id: self.page_id,
            latch: Some(page.write_arc()),
            is_dirty: self.is_dirty,
        }
    }
}

impl Drop for BasicPageGuard {
    fn drop(&mut self) {
        if self.page.take().is_some() {
            let _ = self.bpm.unpin_page(self.page_id, self.is_dirty);
        }
    }
}

/// RAII handle holding the shared latch on a pinned page. Dropping releases
/// the latch and unpins clean.
pub struct ReadPageGuard {
    bpm: Arc<BufferPoolManager>,
    page_id: PageId,
    latch: Option<PageReadLatch>,
}

impl ReadPageGuard {
    pub fn page_id(&self) -> PageId {
        self.page_id
    }

    pub fn data(&self) -> &[u8] {
        &self.latch.as_ref().expect("guard is live").data
    }
}

impl Drop for ReadPageGuard {
    fn drop(&mut self) {
        // Release the latch before giving the pin back
        drop(self.latch.take());
        let _ = self.bpm.unpin_page(self.page_id, false);
    }
}

/// RAII handle holding the exclusive latch on a pinned page. `data_mut`
/// marks the page dirty; dropping releases the latch and unpins with the
/// accumulated dirty hint.
pub struct WritePageGuard {
    bpm: Arc<BufferPoolManager>,
    page_id: PageId,
    latch: Option<PageWriteLatch>,
    is_dirty: bool,
}

impl WritePageGuard {
    pub fn page_id(&self) -> PageId {
        self.page_id
    }

    pub fn data(&self) -> &[u8] {
        &self.latch.as_ref().expect("guard is live").data
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        self.is_dirty = true;
        &mut self.latch.as_mut().expect("guard is live").data
    }
}

impl Drop for WritePageGuard {
    fn drop(&mut self) {
        // Release the latch before giving the pin back
        drop(self.latch.take());
        let _ = self.bpm.unpin_page(self.page_id, self.is_dirty);
    }
}
