//! # Persistent Leaf and Slot Layout
//!
//! The on-media unit of the engine is the leaf: a fixed array of
//! [`LEAF_KEYS`] slots plus a link to the next leaf in allocation order.
//! Each occupied slot owns one heap buffer holding its record packed as
//! `[key][0x00][value][0x00]` — the sizes are authoritative, the NUL
//! separators only aid debugging a raw pool image.
//!
//! ```text
//! Slot (17 bytes):
//! +------+------------+--------------+----------------+
//! | hash | key_size   | value_size   | buffer (POff)  |
//! | u8   | u32 LE     | u32 LE       | u64 LE         |
//! +------+------------+--------------+----------------+
//!
//! Leaf (17 * LEAF_KEYS + 8 bytes):
//! +--------------------+-----------+
//! | slots[LEAF_KEYS]   | next POff |
//! +--------------------+-----------+
//! ```
//!
//! Invariant: `hash == 0` iff the slot is empty iff `buffer` is null. A
//! nonzero hash is the Pearson fingerprint of the key.
//!
//! All mutation goes through a [`Tx`], so a torn `set` (allocation made,
//! slot half-written, crash) rolls back to the pre-call slot and returns
//! the partial allocation to the heap.

use eyre::{ensure, Result};
use zerocopy::little_endian::{U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::config::constants::LEAF_KEYS;
use crate::pool::{POff, Pool, Tx};

pub const SLOT_SIZE: usize = 17;
pub const LEAF_SIZE: usize = SLOT_SIZE * LEAF_KEYS + 8;

/// Byte offset of the `next` link within a leaf.
pub const LEAF_NEXT_OFF: usize = SLOT_SIZE * LEAF_KEYS;

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct Slot {
    hash: u8,
    key_size: U32,
    value_size: U32,
    buffer: U64,
}

const _: () = assert!(std::mem::size_of::<Slot>() == SLOT_SIZE);

impl Slot {
    pub fn new(hash: u8, key_size: u32, value_size: u32, buffer: POff) -> Self {
        Self {
            hash,
            key_size: U32::new(key_size),
            value_size: U32::new(value_size),
            buffer: U64::new(buffer.get()),
        }
    }

    pub fn empty() -> Self {
        Self::new(0, 0, 0, POff::NULL)
    }

    pub fn hash(&self) -> u8 {
        self.hash
    }

    pub fn key_size(&self) -> u32 {
        self.key_size.get()
    }

    pub fn value_size(&self) -> u32 {
        self.value_size.get()
    }

    pub fn buffer(&self) -> POff {
        POff::new(self.buffer.get())
    }

    pub fn is_empty(&self) -> bool {
        self.hash == 0
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct Leaf {
    slots: [Slot; LEAF_KEYS],
    next: U64,
}

const _: () = assert!(std::mem::size_of::<Leaf>() == LEAF_SIZE);

impl Leaf {
    /// Zero-copy view of the leaf at `off`.
    pub fn read(pool: &Pool, off: POff) -> Result<&Leaf> {
        ensure!(!off.is_null(), "leaf read through null pointer");
        let bytes = pool.bytes(off.get(), LEAF_SIZE)?;
        Self::ref_from_bytes(bytes).map_err(|e| eyre::eyre!("failed to parse leaf at {off}: {e:?}"))
    }

    pub fn slot(&self, idx: usize) -> &Slot {
        &self.slots[idx]
    }

    pub fn next(&self) -> POff {
        POff::new(self.next.get())
    }
}

/// Pool offset of slot `idx` within the leaf at `leaf`.
pub fn slot_off(leaf: POff, idx: usize) -> u64 {
    leaf.get() + (idx * SLOT_SIZE) as u64
}

/// Writes a record into a slot: frees any previous buffer, allocates a
/// packed `[key][0][value][0]` buffer, and stores the new slot fields.
pub fn slot_set(
    tx: &mut Tx<'_>,
    leaf: POff,
    idx: usize,
    hash: u8,
    key: &[u8],
    value: &[u8],
) -> Result<()> {
    ensure!(idx < LEAF_KEYS, "slot index {} out of range", idx);
    ensure!(hash != 0, "attempt to store the empty-slot sentinel hash");

    let old_buffer = Leaf::read(tx.pool(), leaf)?.slot(idx).buffer();
    if !old_buffer.is_null() {
        tx.free(old_buffer)?;
    }

    let size = key.len() + value.len() + 2;
    let buffer = tx.alloc(size)?;

    let mut packed = Vec::with_capacity(size);
    packed.extend_from_slice(key);
    packed.push(0);
    packed.extend_from_slice(value);
    packed.push(0);
    tx.write(buffer.get(), &packed)?;

    let slot = Slot::new(hash, key.len() as u32, value.len() as u32, buffer);
    tx.write(slot_off(leaf, idx), slot.as_bytes())
}

/// Empties a slot, returning its buffer to the heap.
pub fn slot_clear(tx: &mut Tx<'_>, leaf: POff, idx: usize) -> Result<()> {
    ensure!(idx < LEAF_KEYS, "slot index {} out of range", idx);

    let buffer = Leaf::read(tx.pool(), leaf)?.slot(idx).buffer();
    if !buffer.is_null() {
        tx.free(buffer)?;
    }

    tx.write(slot_off(leaf, idx), Slot::empty().as_bytes())
}

/// Moves a slot between leaves at the same index, transferring buffer
/// ownership. Used by the split path; nothing is freed.
pub fn slot_move(tx: &mut Tx<'_>, from: POff, to: POff, idx: usize) -> Result<()> {
    ensure!(idx < LEAF_KEYS, "slot index {} out of range", idx);

    let raw: [u8; SLOT_SIZE] = {
        let leaf = Leaf::read(tx.pool(), from)?;
        let mut raw = [0u8; SLOT_SIZE];
        raw.copy_from_slice(leaf.slot(idx).as_bytes());
        raw
    };

    tx.write(slot_off(to, idx), &raw)?;
    tx.write(slot_off(from, idx), Slot::empty().as_bytes())
}

/// Rewrites a leaf's `next` link.
pub fn set_next(tx: &mut Tx<'_>, leaf: POff, next: POff) -> Result<()> {
    tx.write_u64(leaf.get() + LEAF_NEXT_OFF as u64, next.get())
}

/// The key bytes of an occupied slot.
pub fn slot_key<'p>(pool: &'p Pool, slot: &Slot) -> Result<&'p [u8]> {
    ensure!(!slot.is_empty(), "key read from empty slot");
    pool.bytes(slot.buffer().get(), slot.key_size() as usize)
}

/// The value bytes of an occupied slot.
pub fn slot_value<'p>(pool: &'p Pool, slot: &Slot) -> Result<&'p [u8]> {
    ensure!(!slot.is_empty(), "value read from empty slot");
    let value_off = slot.buffer().get() + slot.key_size() as u64 + 1;
    pool.bytes(value_off, slot.value_size() as usize)
}
