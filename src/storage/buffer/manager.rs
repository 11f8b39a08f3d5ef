use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::Arc;
use log::debug;
use parking_lot::{Mutex, RwLock};

use crate::common::types::{FrameId, Page, PageId, PagePtr, INVALID_PAGE_ID};
use crate::storage::buffer::error::BufferPoolError;
use crate::storage::buffer::page_guard::{BasicPageGuard, ReadPageGuard, WritePageGuard};
use crate::storage::buffer::replacer::LruKReplacer;
use crate::storage::disk::DiskManager;

/// Per-frame bookkeeping. Page bytes live behind the frame's page latch;
/// everything here is protected by the pool's metadata mutex.
struct FrameMeta {
    page_id: PageId,
    pin_count: u32,
    is_dirty: bool,
}

impl FrameMeta {
    fn new() -> Self {
        Self {
            page_id: INVALID_PAGE_ID,
            pin_count: 0,
            is_dirty: false,
        }
    }
}

struct BufferPoolInner {
    page_table: HashMap<PageId, FrameId>,
    free_list: VecDeque<FrameId>,
    replacer: LruKReplacer,
    meta: Vec<FrameMeta>,
}

/// Bounded-memory cache of disk pages with pin/unpin reference counting and
/// write-back. One coarse mutex serializes the metadata (page table, free
/// list, replacer, frame bookkeeping); per-page latches are taken through
/// guards outside of it.
pub struct BufferPoolManager {
    pool_size: usize,
    frames: Vec<PagePtr>,
    inner: Mutex<BufferPoolInner>,
    disk_manager: Arc<DiskManager>,
}

impl BufferPoolManager {
    pub fn new(
        pool_size: usize,
        replacer_k: usize,
        db_path: impl AsRef<Path>,
    ) -> Result<Self, BufferPoolError> {
        let disk_manager = Arc::new(DiskManager::new(db_path)?);
        Ok(Self::with_disk_manager(pool_size, replacer_k, disk_manager))
    }

    pub fn with_disk_manager(
        pool_size: usize,
        replacer_k: usize,
        disk_manager: Arc<DiskManager>,
    ) -> Self {
        let mut frames = Vec::with_capacity(pool_size);
        let mut meta = Vec::with_capacity(pool_size);
        let mut free_list = VecDeque::with_capacity(pool_size);

        for frame_id in 0..pool_size {
            frames.push(Arc::new(RwLock::new(Page::new(INVALID_PAGE_ID))));
            meta.push(FrameMeta::new());
            free_list.push_back(frame_id);
        }

        Self {
            pool_size,
            frames,
            inner: Mutex::new(BufferPoolInner {
                page_table: HashMap::new(),
                free_list,
                replacer: LruKReplacer::new(pool_size, replacer_k),
                meta,
            }),
            disk_manager,
        }
    }

    pub fn pool_size(&self) -> usize {
        self.pool_size
    }

    /// Allocate a fresh page id and place it in a frame, pinned. Fails with
    /// BufferPoolFull when every frame is pinned.
    ///
    /// The metadata mutex is taken twice, around the disk work: once to
    /// claim a frame, once to install the new mapping. The claimed frame is
    /// unmapped and invisible to other threads in between.
    pub fn new_page(&self) -> Result<(PageId, PagePtr), BufferPoolError> {
        let (frame_id, needs_flush) = {
            let mut inner = self.inner.lock();
            self.acquire_frame(&mut inner)?
        };

        let prepared = (|| -> Result<PageId, BufferPoolError> {
            if needs_flush {
                let page = self.frames[frame_id].read();
                self.disk_manager.write_page(&page)?;
            }
            let page_id = self.disk_manager.allocate_page()?;
            let mut page = self.frames[frame_id].write();
            page.reset();
            page.page_id = page_id;
            Ok(page_id)
        })();
        let page_id = match prepared {
            Ok(page_id) => page_id,
            Err(e) => {
                self.return_frame(frame_id);
                return Err(e);
            }
        };

        let mut inner = self.inner.lock();
        let meta = &mut inner.meta[frame_id];
        meta.page_id = page_id;
        meta.pin_count = 1;
        meta.is_dirty = false;

        inner.page_table.insert(page_id, frame_id);
        inner.replacer.record_access(frame_id)?;
        inner.replacer.set_evictable(frame_id, false)?;

        Ok((page_id, self.frames[frame_id].clone()))
    }

    /// Fetch a page, reading it from disk if it is not resident. The caller
    /// owns one pin on success.
    ///
    /// The disk read runs with no metadata lock held. If another thread
    /// loaded the same page in the meantime, its copy wins and the claimed
    /// frame goes back to the free list.
    pub fn fetch_page(&self, page_id: PageId) -> Result<PagePtr, BufferPoolError> {
        if page_id == INVALID_PAGE_ID {
            return Err(BufferPoolError::InvalidOperation(
                "cannot fetch the invalid page id".to_string(),
            ));
        }

        let (frame_id, needs_flush) = {
            let mut inner = self.inner.lock();
            if let Some(&frame_id) = inner.page_table.get(&page_id) {
                inner.meta[frame_id].pin_count += 1;
                inner.replacer.record_access(frame_id)?;
                inner.replacer.set_evictable(frame_id, false)?;
                return Ok(self.frames[frame_id].clone());
            }
            self.acquire_frame(&mut inner)?
        };

        let loaded = (|| -> Result<(), BufferPoolError> {
            if needs_flush {
                let page = self.frames[frame_id].read();
                self.disk_manager.write_page(&page)?;
            }
            let mut page = self.frames[frame_id].write();
            self.disk_manager.read_page(page_id, &mut page)?;
            Ok(())
        })();
        if let Err(e) = loaded {
            self.return_frame(frame_id);
            return Err(e);
        }

        let mut inner = self.inner.lock();

        if let Some(&resident) = inner.page_table.get(&page_id) {
            // Lost the race: someone else brought the page in while we were
            // on disk. Pin their copy and hand our frame back.
            inner.meta[resident].pin_count += 1;
            inner.replacer.record_access(resident)?;
            inner.replacer.set_evictable(resident, false)?;
            self.frames[frame_id].write().reset();
            inner.free_list.push_back(frame_id);
            return Ok(self.frames[resident].clone());
        }

        let meta = &mut inner.meta[frame_id];
        meta.page_id = page_id;
        meta.pin_count = 1;
        meta.is_dirty = false;

        inner.page_table.insert(page_id, frame_id);
        inner.replacer.record_access(frame_id)?;
        inner.replacer.set_evictable(frame_id, false)?;

        Ok(self.frames[frame_id].clone())
    }

    /// Drop one pin on a page, OR-ing in the caller's dirty hint. At pin
    /// count zero the frame becomes evictable.
    pub fn unpin_page(&self, page_id: PageId, is_dirty: bool) -> Result<(), BufferPoolError> {
        let mut inner = self.inner.lock();

        let frame_id = *inner
            .page_table
            .get(&page_id)
            .ok_or(BufferPoolError::PageNotFound(page_id))?;

        let meta = &mut inner.meta[frame_id];
        if meta.pin_count == 0 {
            return Err(BufferPoolError::PinCountUnderflow(page_id));
        }
        meta.pin_count -= 1;
        meta.is_dirty |= is_dirty;
        let pin_count = meta.pin_count;

        if pin_count == 0 {
            inner.replacer.set_evictable(frame_id, true)?;
        }

        Ok(())
    }

    /// Write a page through to disk regardless of its dirty flag, then
    /// clear the flag. The write happens under the page latch only; the
    /// metadata mutex is re-taken afterwards to clear the dirty bit, and
    /// only if the page still sits in the same frame.
    pub fn flush_page(&self, page_id: PageId) -> Result<(), BufferPoolError> {
        let frame_id = {
            let inner = self.inner.lock();
            *inner
                .page_table
                .get(&page_id)
                .ok_or(BufferPoolError::PageNotFound(page_id))?
        };

        {
            let page = self.frames[frame_id].read();
            self.disk_manager.write_page(&page)?;
        }

        let mut inner = self.inner.lock();
        if inner.page_table.get(&page_id) == Some(&frame_id) {
            inner.meta[frame_id].is_dirty = false;
        }
        Ok(())
    }

    /// Flush every resident page. Pages evicted between the snapshot and
    /// their flush were written back by the eviction already.
    pub fn flush_all_pages(&self) -> Result<(), BufferPoolError> {
        let page_ids: Vec<PageId> = {
            let inner = self.inner.lock();
            inner.page_table.keys().copied().collect()
        };
        for page_id in page_ids {
            match self.flush_page(page_id) {
                Ok(()) => {}
                Err(BufferPoolError::PageNotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Remove a page from the pool and return its frame to the free list.
    /// Requires pin count zero; unknown pages are a successful no-op.
    pub fn delete_page(&self, page_id: PageId) -> Result<(), BufferPoolError> {
        let mut inner = self.inner.lock();

        let frame_id = match inner.page_table.get(&page_id) {
            Some(&frame_id) => frame_id,
            None => return Ok(()),
        };

        if inner.meta[frame_id].pin_count > 0 {
            return Err(BufferPoolError::PagePinned(page_id));
        }

        inner.replacer.remove(frame_id)?;
        inner.page_table.remove(&page_id);
        inner.meta[frame_id] = FrameMeta::new();
        self.frames[frame_id].write().reset();
        inner.free_list.push_back(frame_id);
        self.disk_manager.deallocate_page(page_id);

        Ok(())
    }

    /// Fetch a page wrapped in a pin-only guard
    pub fn fetch_page_basic(self: &Arc<Self>, page_id: PageId) -> Result<BasicPageGuard, BufferPoolError> {
        let page = self.fetch_page(page_id)?;
        Ok(BasicPageGuard::new(Arc::clone(self), page, page_id))
    }

    /// Fetch a page and take its shared latch
    pub fn fetch_page_read(self: &Arc<Self>, page_id: PageId) -> Result<ReadPageGuard, BufferPoolError> {
        Ok(self.fetch_page_basic(page_id)?.upgrade_read())
    }

    /// Fetch a page and take its exclusive latch
    pub fn fetch_page_write(self: &Arc<Self>, page_id: PageId) -> Result<WritePageGuard, BufferPoolError> {
        Ok(self.fetch_page_basic(page_id)?.upgrade_write())
    }

    /// Allocate a fresh page wrapped in a pin-only guard
    pub fn new_page_guarded(self: &Arc<Self>) -> Result<(PageId, BasicPageGuard), BufferPoolError> {
        let (page_id, page) = self.new_page()?;
        Ok((page_id, BasicPageGuard::new(Arc::clone(self), page, page_id)))
    }

    /// Take a frame from the free list, or evict a victim and unmap it.
    /// The victim's bytes stay in place; when the returned flag is set the
    /// caller must write them back before reusing the frame. Never touches
    /// the disk itself, so the metadata mutex is not held across I/O.
    fn acquire_frame(&self, inner: &mut BufferPoolInner) -> Result<(FrameId, bool), BufferPoolError> {
        if let Some(frame_id) = inner.free_list.pop_front() {
            return Ok((frame_id, false));
        }

        let victim = inner
            .replacer
            .evict()
            .ok_or(BufferPoolError::BufferPoolFull)?;

        let old_page_id = inner.meta[victim].page_id;
        let needs_flush = old_page_id != INVALID_PAGE_ID && inner.meta[victim].is_dirty;
        if old_page_id != INVALID_PAGE_ID {
            if needs_flush {
                debug!("evicting dirty page {} from frame {}", old_page_id, victim);
            }
            inner.page_table.remove(&old_page_id);
        }
        inner.meta[victim] = FrameMeta::new();

        Ok((victim, needs_flush))
    }

    /// Give a claimed but uninstalled frame back after a failed load
    fn return_frame(&self, frame_id: FrameId) {
        let mut inner = self.inner.lock();
        self.frames[frame_id].write().reset();
        inner.free_list.push_back(frame_id);
    }
}
