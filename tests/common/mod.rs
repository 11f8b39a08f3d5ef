use std::collections::HashMap;
use std::sync::Arc;
use anyhow::Result;
use parking_lot::Mutex;
use tempfile::NamedTempFile;

use stratadb::common::types::Rid;
use stratadb::storage::buffer::BufferPoolManager;
use stratadb::transaction::concurrency::{TableHeap, TupleMeta};

// Create a temporary database file for testing
#[allow(dead_code)]
pub fn create_temp_db_file() -> Result<(NamedTempFile, String)> {
    let file = NamedTempFile::new()?;
    let path = file.path().to_str().unwrap().to_string();
    Ok((file, path))
}

// Create a buffer pool manager over a temporary database
#[allow(dead_code)]
pub fn create_test_buffer_pool(pool_size: usize) -> Result<(Arc<BufferPoolManager>, NamedTempFile)> {
    create_test_buffer_pool_k(pool_size, 2)
}

#[allow(dead_code)]
pub fn create_test_buffer_pool_k(
    pool_size: usize,
    replacer_k: usize,
) -> Result<(Arc<BufferPoolManager>, NamedTempFile)> {
    let (file, path) = create_temp_db_file()?;
    let buffer_pool = Arc::new(BufferPoolManager::new(pool_size, replacer_k, path)?);
    Ok((buffer_pool, file))
}

/// In-memory table heap standing in for the executor-side heap in
/// transaction tests
#[allow(dead_code)]
#[derive(Default)]
pub struct MockTableHeap {
    tuples: Mutex<HashMap<Rid, (TupleMeta, Vec<u8>)>>,
}

#[allow(dead_code)]
impl MockTableHeap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, rid: Rid, data: &[u8]) {
        self.tuples
            .lock()
            .insert(rid, (TupleMeta::default(), data.to_vec()));
    }

    pub fn tuple(&self, rid: Rid) -> Option<Vec<u8>> {
        self.tuples.lock().get(&rid).map(|(_, data)| data.clone())
    }
}

impl TableHeap for MockTableHeap {
    fn tuple_meta(&self, rid: Rid) -> TupleMeta {
        self.tuples
            .lock()
            .get(&rid)
            .map(|(meta, _)| *meta)
            .unwrap_or_default()
    }

    fn set_tuple_meta(&self, rid: Rid, meta: TupleMeta) {
        if let Some(entry) = self.tuples.lock().get_mut(&rid) {
            entry.0 = meta;
        }
    }

    fn restore_tuple(&self, rid: Rid, tuple: &[u8]) {
        if let Some(entry) = self.tuples.lock().get_mut(&rid) {
            entry.1 = tuple.to_vec();
        }
    }
}
