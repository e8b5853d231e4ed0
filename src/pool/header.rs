//! # Pool Header and Undo-Log Layout
//!
//! The first bytes of a pool file are a fixed 128-byte header that makes the
//! image self-describing: a 16-byte magic embedding the engine layout tag,
//! a format version, the recorded pool size, the allocator state, and the
//! one engine-visible persistent datum — `head`, the first leaf of the
//! on-media leaf chain.
//!
//! The undo-log region follows the reserved header page. Its own small
//! header says whether a transaction was in flight when the process died;
//! the entries after it are pre-images that restore the pool to the
//! pre-transaction state when replayed in reverse.
//!
//! All multi-byte fields are little-endian zerocopy wrappers so the structs
//! can be read in place from the unaligned mapping.

use eyre::{ensure, Result};
use zerocopy::little_endian::{U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::config::constants::{UNDO_REGION_OFF, UNDO_REGION_SIZE};

/// Layout tag: identifies the file as a pool written by the "stree" engine.
pub const POOL_MAGIC: &[u8; 16] = b"streekv stree v1";

pub const POOL_FORMAT_VERSION: u32 = 1;

pub const POOL_HEADER_SIZE: usize = 128;
pub const UNDO_HEADER_SIZE: usize = 64;
pub const UNDO_ENTRY_HEADER_SIZE: usize = 12;

/// First byte of undo pre-image entries.
pub const UNDO_DATA_OFF: u64 = UNDO_REGION_OFF + UNDO_HEADER_SIZE as u64;

/// Capacity of the undo entry area.
pub const UNDO_DATA_SIZE: u64 = UNDO_REGION_SIZE - UNDO_HEADER_SIZE as u64;

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct PoolHeader {
    magic: [u8; 16],
    version: U32,
    _pad: [u8; 4],
    pool_size: U64,
    heap_top: U64,
    free_head: U64,
    head: U64,
    reserved: [u8; 72],
}

const _: () = assert!(std::mem::size_of::<PoolHeader>() == POOL_HEADER_SIZE);

/// Byte offsets of the mutable header fields, for staged in-place writes.
pub const HDR_HEAP_TOP_OFF: u64 = std::mem::offset_of!(PoolHeader, heap_top) as u64;
pub const HDR_FREE_HEAD_OFF: u64 = std::mem::offset_of!(PoolHeader, free_head) as u64;
pub const HDR_HEAD_OFF: u64 = std::mem::offset_of!(PoolHeader, head) as u64;

impl PoolHeader {
    pub fn new(pool_size: u64, heap_start: u64) -> Self {
        Self {
            magic: *POOL_MAGIC,
            version: U32::new(POOL_FORMAT_VERSION),
            _pad: [0u8; 4],
            pool_size: U64::new(pool_size),
            heap_top: U64::new(heap_start),
            free_head: U64::new(0),
            head: U64::new(0),
            reserved: [0u8; 72],
        }
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<&Self> {
        ensure!(
            bytes.len() >= POOL_HEADER_SIZE,
            "buffer too small for PoolHeader: {} < {}",
            bytes.len(),
            POOL_HEADER_SIZE
        );

        let header = Self::ref_from_bytes(&bytes[..POOL_HEADER_SIZE])
            .map_err(|e| eyre::eyre!("failed to parse PoolHeader: {:?}", e))?;

        ensure!(
            &header.magic == POOL_MAGIC,
            "not a streekv pool (layout tag mismatch)"
        );

        ensure!(
            header.version.get() == POOL_FORMAT_VERSION,
            "unsupported pool format version: {} (expected {})",
            header.version.get(),
            POOL_FORMAT_VERSION
        );

        Ok(header)
    }

    pub fn version(&self) -> u32 {
        self.version.get()
    }

    pub fn set_version(&mut self, version: u32) {
        self.version = U32::new(version);
    }

    pub fn pool_size(&self) -> u64 {
        self.pool_size.get()
    }

    pub fn heap_top(&self) -> u64 {
        self.heap_top.get()
    }

    pub fn set_heap_top(&mut self, top: u64) {
        self.heap_top = U64::new(top);
    }

    pub fn free_head(&self) -> u64 {
        self.free_head.get()
    }

    pub fn set_free_head(&mut self, head: u64) {
        self.free_head = U64::new(head);
    }

    pub fn head(&self) -> u64 {
        self.head.get()
    }

    pub fn set_head(&mut self, head: u64) {
        self.head = U64::new(head);
    }
}

/// State of the undo log. `active != 0` on open means the process died
/// inside a transaction and the entries must be replayed in reverse.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct UndoHeader {
    active: U32,
    entry_count: U32,
    used: U64,
    reserved: [u8; 48],
}

const _: () = assert!(std::mem::size_of::<UndoHeader>() == UNDO_HEADER_SIZE);

impl UndoHeader {
    pub fn cleared() -> Self {
        Self {
            active: U32::new(0),
            entry_count: U32::new(0),
            used: U64::new(0),
            reserved: [0u8; 48],
        }
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<&Self> {
        ensure!(
            bytes.len() >= UNDO_HEADER_SIZE,
            "buffer too small for UndoHeader: {} < {}",
            bytes.len(),
            UNDO_HEADER_SIZE
        );

        Self::ref_from_bytes(&bytes[..UNDO_HEADER_SIZE])
            .map_err(|e| eyre::eyre!("failed to parse UndoHeader: {:?}", e))
    }

    pub fn active(&self) -> u32 {
        self.active.get()
    }

    pub fn set_active(&mut self, active: u32) {
        self.active = U32::new(active);
    }

    pub fn entry_count(&self) -> u32 {
        self.entry_count.get()
    }

    pub fn set_entry_count(&mut self, count: u32) {
        self.entry_count = U32::new(count);
    }

    pub fn used(&self) -> u64 {
        self.used.get()
    }

    pub fn set_used(&mut self, used: u64) {
        self.used = U64::new(used);
    }
}

/// Header of one undo entry; `len` pre-image bytes follow it.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct UndoEntryHeader {
    target: U64,
    len: U32,
}

const _: () = assert!(std::mem::size_of::<UndoEntryHeader>() == UNDO_ENTRY_HEADER_SIZE);

impl UndoEntryHeader {
    pub fn new(target: u64, len: u32) -> Self {
        Self {
            target: U64::new(target),
            len: U32::new(len),
        }
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<&Self> {
        ensure!(
            bytes.len() >= UNDO_ENTRY_HEADER_SIZE,
            "buffer too small for UndoEntryHeader: {} < {}",
            bytes.len(),
            UNDO_ENTRY_HEADER_SIZE
        );

        Self::ref_from_bytes(&bytes[..UNDO_ENTRY_HEADER_SIZE])
            .map_err(|e| eyre::eyre!("failed to parse UndoEntryHeader: {:?}", e))
    }

    pub fn target(&self) -> u64 {
        self.target.get()
    }

    pub fn len(&self) -> u32 {
        self.len.get()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_header_size_is_128() {
        assert_eq!(std::mem::size_of::<PoolHeader>(), 128);
    }

    #[test]
    fn pool_header_roundtrip() {
        let mut header = PoolHeader::new(1 << 20, 4096 + 256 * 1024);
        header.set_head(8192);
        header.set_free_head(12288);

        let bytes = header.as_bytes().to_vec();
        let parsed = PoolHeader::from_bytes(&bytes).unwrap();

        assert_eq!(parsed.version(), POOL_FORMAT_VERSION);
        assert_eq!(parsed.pool_size(), 1 << 20);
        assert_eq!(parsed.head(), 8192);
        assert_eq!(parsed.free_head(), 12288);
    }

    #[test]
    fn pool_header_rejects_foreign_magic() {
        let mut bytes = [0u8; 128];
        bytes[..16].copy_from_slice(b"SQLite format 3\x00");

        let result = PoolHeader::from_bytes(&bytes);
        assert!(result.is_err());
        assert!(result
            .unwrap_err()
            .to_string()
            .contains("layout tag mismatch"));
    }

    #[test]
    fn pool_header_rejects_future_version() {
        let mut header = PoolHeader::new(1 << 20, 4096);
        header.set_version(99);

        let bytes = header.as_bytes().to_vec();
        assert!(PoolHeader::from_bytes(&bytes).is_err());
    }

    #[test]
    fn undo_entry_header_roundtrip() {
        let entry = UndoEntryHeader::new(77, 13);
        let bytes = entry.as_bytes().to_vec();
        let parsed = UndoEntryHeader::from_bytes(&bytes).unwrap();

        assert_eq!(parsed.target(), 77);
        assert_eq!(parsed.len(), 13);
    }
}
