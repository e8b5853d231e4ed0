//! # Persistent Pool
//!
//! The pool is the persistent collaborator everything else builds on: one
//! memory-mapped file holding a self-describing header, an undo log, and a
//! log-structured heap that the engine's leaves and record buffers live in.
//!
//! ## Regions
//!
//! ```text
//! +--------------------------+  0
//! | PoolHeader (128 B)       |  magic + version + pool size +
//! |                          |  heap_top / free_head / head
//! +--------------------------+  4096 (POOL_HEADER_RESERVED)
//! | UndoHeader (64 B)        |  active flag, entry count, bytes used
//! | undo entries             |  pre-images written ahead of mutation
//! +--------------------------+  HEAP_START
//! | heap                     |  [len | payload] blocks, bump-allocated,
//! |                          |  freed blocks chained from free_head
//! +--------------------------+  pool size (fixed at create)
//! ```
//!
//! ## Two pointer flavors
//!
//! Persistent references are [`POff`] — pool-relative byte offsets that stay
//! valid across restarts, with `0` as null. Volatile tree nodes use arena
//! ids instead (see `tree::node`); the types never mix, so a persistent
//! structure cannot accidentally capture a heap address.
//!
//! ## Mutation discipline
//!
//! Reads go through `&Pool`. All writes go through a [`Tx`] obtained from
//! [`Pool::with_tx`]; there is no public mutable byte access. Each staged
//! write persists a pre-image undo record before touching the target, so a
//! transaction that returns an error — or a process that dies mid-way —
//! leaves no trace: the undo log is replayed in reverse, in-process on
//! error, at the next open after a crash.

mod alloc;
mod header;
mod mmap;
mod tx;

pub use alloc::PoolFull;
pub use header::{PoolHeader, POOL_FORMAT_VERSION, POOL_MAGIC};
pub use mmap::PoolFile;
pub use tx::Tx;

use std::fmt;
use std::path::Path;

use eyre::{ensure, Result};

use crate::config::constants::{HEAP_START, MIN_POOL_SIZE, UNDO_REGION_OFF};
use header::{UndoHeader, POOL_HEADER_SIZE, UNDO_HEADER_SIZE};

/// A pool-relative persistent pointer. `0` is null.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct POff(u64);

impl POff {
    pub const NULL: POff = POff(0);

    pub fn new(raw: u64) -> Self {
        POff(raw)
    }

    pub fn get(self) -> u64 {
        self.0
    }

    pub fn is_null(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for POff {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_null() {
            f.write_str("null")
        } else {
            write!(f, "@{}", self.0)
        }
    }
}

/// The mapped pool: header, undo log, and heap.
#[derive(Debug)]
pub struct Pool {
    file: PoolFile,
}

impl Pool {
    /// Creates a fresh pool of `size` bytes at `path`, truncating any
    /// existing file.
    pub fn create<P: AsRef<Path>>(path: P, size: u64) -> Result<Self> {
        ensure!(
            size >= MIN_POOL_SIZE,
            "pool size {} below minimum {}",
            size,
            MIN_POOL_SIZE
        );

        let mut file = PoolFile::create(path, size)?;

        let header = PoolHeader::new(size, HEAP_START);
        file.bytes_mut(0, POOL_HEADER_SIZE)?
            .copy_from_slice(zerocopy::IntoBytes::as_bytes(&header));

        let undo = UndoHeader::cleared();
        file.bytes_mut(UNDO_REGION_OFF, UNDO_HEADER_SIZE)?
            .copy_from_slice(zerocopy::IntoBytes::as_bytes(&undo));

        file.flush_range(0, POOL_HEADER_SIZE)?;
        file.flush_range(UNDO_REGION_OFF, UNDO_HEADER_SIZE)?;

        Ok(Self { file })
    }

    /// Opens an existing pool, validating the layout tag and rolling back
    /// any transaction that was in flight when the process died.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut file = PoolFile::open(path)?;

        let recorded = {
            let header = PoolHeader::from_bytes(file.bytes(0, POOL_HEADER_SIZE)?)?;
            header.pool_size()
        };
        ensure!(
            recorded == file.size(),
            "pool file resized since creation: header says {} bytes, file is {}",
            recorded,
            file.size()
        );

        if tx::replay_undo(&mut file)? {
            tracing::warn!("rolled back a transaction interrupted by a crash");
        }

        Ok(Self { file })
    }

    pub fn size(&self) -> u64 {
        self.file.size()
    }

    pub fn header(&self) -> Result<&PoolHeader> {
        PoolHeader::from_bytes(self.file.bytes(0, POOL_HEADER_SIZE)?)
    }

    /// The persistent root: first leaf of the on-media chain.
    pub fn head(&self) -> Result<POff> {
        Ok(POff::new(self.header()?.head()))
    }

    pub fn bytes(&self, off: u64, len: usize) -> Result<&[u8]> {
        self.file.bytes(off, len)
    }

    pub fn read_u64(&self, off: u64) -> Result<u64> {
        let raw = self.file.bytes(off, 8)?;
        Ok(u64::from_le_bytes(raw.try_into()?))
    }

    /// Runs `f` inside a transaction. On `Ok` the mutations are flushed and
    /// the undo log cleared; on `Err` (or unwind) every staged mutation is
    /// rolled back before the error propagates.
    pub fn with_tx<T>(&mut self, f: impl FnOnce(&mut Tx<'_>) -> Result<T>) -> Result<T> {
        let mut tx = Tx::begin(self)?;
        match f(&mut tx) {
            Ok(value) => {
                tx.commit()?;
                Ok(value)
            }
            Err(err) => {
                drop(tx); // rolls back
                Err(err)
            }
        }
    }

    pub fn flush(&self) -> Result<()> {
        self.file.flush()
    }

    pub fn prefetch(&self, off: u64, len: usize) {
        self.file.prefetch(off, len);
    }
}
