use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use parking_lot::Mutex;
use thiserror::Error;

use crate::common::types::{Page, PageId, INVALID_PAGE_ID, PAGE_SIZE};

#[derive(Error, Debug)]
pub enum DiskManagerError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Invalid page ID: {0}")]
    InvalidPageId(PageId),
}

/// DiskManager is responsible for the actual disk I/O: page-granular reads
/// and writes against a single database file, plus page allocation by file
/// extension.
pub struct DiskManager {
    db_file: Mutex<File>,
}

impl DiskManager {
    /// Create a new DiskManager over the specified database file
    pub fn new(db_path: impl AsRef<Path>) -> Result<Self, DiskManagerError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(db_path)?;

        Ok(Self {
            db_file: Mutex::new(file),
        })
    }

    /// Read a page from disk. Reading past the end of the file yields a
    /// zeroed page, the fresh-page semantics callers rely on after
    /// allocation.
    pub fn read_page(&self, page_id: PageId, page: &mut Page) -> Result<(), DiskManagerError> {
        if page_id == INVALID_PAGE_ID {
            return Err(DiskManagerError::InvalidPageId(page_id));
        }

        let offset = Self::page_offset(page_id);
        let mut buffer = [0u8; PAGE_SIZE];

        {
            let mut file = self.db_file.lock();

            let file_size = file.metadata()?.len();
            if offset >= file_size {
                page.data.fill(0);
                page.page_id = page_id;
                return Ok(());
            }

            file.seek(SeekFrom::Start(offset))?;
            file.read_exact(&mut buffer)?;
        }

        page.data.copy_from_slice(&buffer);
        page.page_id = page_id;

        Ok(())
    }

    /// Write a page to disk at its offset
    pub fn write_page(&self, page: &Page) -> Result<(), DiskManagerError> {
        if page.page_id == INVALID_PAGE_ID {
            return Err(DiskManagerError::InvalidPageId(page.page_id));
        }

        let offset = Self::page_offset(page.page_id);

        let mut file = self.db_file.lock();
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(&page.data)?;
        file.flush()?;

        Ok(())
    }

    /// Allocate a new page on disk and return its 0-based ID
    pub fn allocate_page(&self) -> Result<PageId, DiskManagerError> {
        let mut file = self.db_file.lock();

        let file_size = file.metadata()?.len();
        let new_page_id = (file_size / PAGE_SIZE as u64) as PageId;

        file.seek(SeekFrom::End(0))?;
        let zeros = [0u8; PAGE_SIZE];
        file.write_all(&zeros)?;
        file.flush()?;

        Ok(new_page_id)
    }

    /// Return a page id to the allocator. The file is never shrunk; a real
    /// system would record the id in free-space metadata for reuse.
    pub fn deallocate_page(&self, _page_id: PageId) {}

    fn page_offset(page_id: PageId) -> u64 {
        page_id as u64 * PAGE_SIZE as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn test_allocate_sequential_ids() {
        let file = NamedTempFile::new().unwrap();
        let disk = DiskManager::new(file.path()).unwrap();

        assert_eq!(disk.allocate_page().unwrap(), 0);
        assert_eq!(disk.allocate_page().unwrap(), 1);
        assert_eq!(disk.allocate_page().unwrap(), 2);
    }

    #[test]
    fn test_write_then_read_round_trip() {
        let file = NamedTempFile::new().unwrap();
        let disk = DiskManager::new(file.path()).unwrap();

        let page_id = disk.allocate_page().unwrap();
        let mut page = Page::new(page_id);
        page.data[0..5].copy_from_slice(b"hello");
        disk.write_page(&page).unwrap();

        let mut read_back = Page::new(INVALID_PAGE_ID);
        disk.read_page(page_id, &mut read_back).unwrap();
        assert_eq!(&read_back.data[0..5], b"hello");
        assert_eq!(read_back.page_id, page_id);
    }

    #[test]
    fn test_read_past_eof_is_zeroed() {
        let file = NamedTempFile::new().unwrap();
        let disk = DiskManager::new(file.path()).unwrap();

        let mut page = Page::new(INVALID_PAGE_ID);
        page.data.fill(0xAB);
        disk.read_page(42, &mut page).unwrap();
        assert!(page.data.iter().all(|&b| b == 0));
        assert_eq!(page.page_id, 42);
    }

    #[test]
    fn test_invalid_page_id_rejected() {
        let file = NamedTempFile::new().unwrap();
        let disk = DiskManager::new(file.path()).unwrap();

        let mut page = Page::new(INVALID_PAGE_ID);
        assert!(disk.read_page(INVALID_PAGE_ID, &mut page).is_err());
        assert!(disk.write_page(&page).is_err());
    }
}
