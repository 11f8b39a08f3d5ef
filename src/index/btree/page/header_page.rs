use byteorder::{ByteOrder, LittleEndian};

use crate::common::types::{PageId, INVALID_PAGE_ID};

/// The tree's header page stores the current root page id in its first four
/// bytes; INVALID_PAGE_ID means the tree is empty.
pub struct HeaderPage;

impl HeaderPage {
    pub fn init(data: &mut [u8]) {
        Self::set_root_page_id(data, INVALID_PAGE_ID);
    }

    pub fn root_page_id(data: &[u8]) -> PageId {
        LittleEndian::read_u32(&data[0..4])
    }

    pub fn set_root_page_id(data: &mut [u8], page_id: PageId) {
        LittleEndian::write_u32(&mut data[0..4], page_id);
    }
}
