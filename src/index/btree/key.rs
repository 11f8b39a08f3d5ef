use byteorder::{ByteOrder, LittleEndian};

/// Key type stored in the tree's pages: totally ordered, with a fixed-width
/// little-endian encoding so leaf and internal pages can lay entries out as
/// plain arrays.
pub trait IndexKey: Clone + Ord + Send + Sync + 'static {
    const ENCODED_LEN: usize;

    fn encode(&self, buf: &mut [u8]);
    fn decode(buf: &[u8]) -> Self;
}

impl IndexKey for i32 {
    const ENCODED_LEN: usize = 4;

    fn encode(&self, buf: &mut [u8]) {
        LittleEndian::write_i32(buf, *self);
    }

    fn decode(buf: &[u8]) -> Self {
        LittleEndian::read_i32(buf)
    }
}

impl IndexKey for i64 {
    const ENCODED_LEN: usize = 8;

    fn encode(&self, buf: &mut [u8]) {
        LittleEndian::write_i64(buf, *self);
    }

    fn decode(buf: &[u8]) -> Self {
        LittleEndian::read_i64(buf)
    }
}

impl IndexKey for u32 {
    const ENCODED_LEN: usize = 4;

    fn encode(&self, buf: &mut [u8]) {
        LittleEndian::write_u32(buf, *self);
    }

    fn decode(buf: &[u8]) -> Self {
        LittleEndian::read_u32(buf)
    }
}

impl IndexKey for u64 {
    const ENCODED_LEN: usize = 8;

    fn encode(&self, buf: &mut [u8]) {
        LittleEndian::write_u64(buf, *self);
    }

    fn decode(buf: &[u8]) -> Self {
        LittleEndian::read_u64(buf)
    }
}
