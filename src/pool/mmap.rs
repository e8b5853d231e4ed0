//! # Memory-Mapped Pool File
//!
//! `PoolFile` is the lowest layer of the persistent pool: a single file
//! mapped read-write into the process address space. Everything above it —
//! the header, the undo log, the allocator heap, the leaves — is expressed
//! as byte ranges of this one mapping.
//!
//! ## Safety Model
//!
//! Memory-mapped regions are hazardous when a file can be remapped or
//! externally modified. `PoolFile` leans on the borrow checker instead of
//! runtime guards:
//!
//! ```text
//! bytes(&self, ...) -> &[u8]          // immutable borrow of self
//! bytes_mut(&mut self, ...) -> &mut [u8]  // exclusive borrow
//! ```
//!
//! The pool never grows after creation (the file size is fixed at create
//! time), so there is no remap hazard at all; the mapping is valid for the
//! lifetime of the `PoolFile`.
//!
//! ## Durability
//!
//! `flush_range` msyncs a byte range (rounded out to page boundaries, which
//! the syscall requires). The transaction layer orders these flushes so that
//! undo records always hit media before the bytes they protect.

use std::fs::{File, OpenOptions};
use std::path::Path;

use eyre::{ensure, Result, WrapErr};
use memmap2::MmapMut;

/// Hardware page granularity used to round msync ranges.
const FLUSH_ALIGN: u64 = 4096;

#[derive(Debug)]
pub struct PoolFile {
    file: File,
    mmap: MmapMut,
    size: u64,
}

impl PoolFile {
    /// Creates (or truncates) the file at `path` with exactly `size` bytes
    /// and maps it.
    pub fn create<P: AsRef<Path>>(path: P, size: u64) -> Result<Self> {
        let path = path.as_ref();

        ensure!(size > 0, "pool size must be nonzero");

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .wrap_err_with(|| format!("failed to create pool file '{}'", path.display()))?;

        file.set_len(size)
            .wrap_err_with(|| format!("failed to size pool file to {} bytes", size))?;

        // SAFETY: map_mut is unsafe because the mapping is undefined if the
        // file is truncated or written by another process. This is safe
        // because:
        // 1. The file was just created with truncate=true, so no other
        //    mapping of prior contents exists.
        // 2. Pool files are single-owner; the engine does not share them.
        // 3. The mapping's lifetime is tied to PoolFile and the file size
        //    never changes afterwards, so the mapping stays valid.
        let mmap = unsafe {
            MmapMut::map_mut(&file)
                .wrap_err_with(|| format!("failed to memory-map '{}'", path.display()))?
        };

        Ok(Self { file, mmap, size })
    }

    /// Maps an existing pool file.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .wrap_err_with(|| format!("failed to open pool file '{}'", path.display()))?;

        let size = file
            .metadata()
            .wrap_err_with(|| format!("failed to stat '{}'", path.display()))?
            .len();

        ensure!(size > 0, "cannot open empty pool file '{}'", path.display());

        // SAFETY: same argument as in create(); the file is single-owner
        // and its size is fixed for the lifetime of the mapping.
        let mmap = unsafe {
            MmapMut::map_mut(&file)
                .wrap_err_with(|| format!("failed to memory-map '{}'", path.display()))?
        };

        Ok(Self { file, mmap, size })
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn bytes(&self, off: u64, len: usize) -> Result<&[u8]> {
        self.check_range(off, len)?;
        let off = off as usize;
        Ok(&self.mmap[off..off + len])
    }

    pub fn bytes_mut(&mut self, off: u64, len: usize) -> Result<&mut [u8]> {
        self.check_range(off, len)?;
        let off = off as usize;
        Ok(&mut self.mmap[off..off + len])
    }

    /// Forces a byte range to media. The range is rounded out to page
    /// boundaries because msync rejects unaligned addresses.
    pub fn flush_range(&self, off: u64, len: usize) -> Result<()> {
        self.check_range(off, len)?;

        let start = off - off % FLUSH_ALIGN;
        let end = (off + len as u64).div_ceil(FLUSH_ALIGN) * FLUSH_ALIGN;
        let end = end.min(self.size);

        self.mmap
            .flush_range(start as usize, (end - start) as usize)
            .wrap_err("failed to flush pool range")
    }

    pub fn flush(&self) -> Result<()> {
        self.mmap.flush().wrap_err("failed to flush pool")
    }

    /// Hints the kernel to fault in a range ahead of a sequential walk.
    pub fn prefetch(&self, off: u64, len: usize) {
        if off >= self.size {
            return;
        }
        let len = len.min((self.size - off) as usize);

        #[cfg(unix)]
        // SAFETY: the range was clamped to the mapping above, and madvise
        // with MADV_WILLNEED is advisory: it never mutates the mapping.
        unsafe {
            libc::madvise(
                self.mmap.as_ptr().add(off as usize) as *mut libc::c_void,
                len,
                libc::MADV_WILLNEED,
            );
        }
        #[cfg(not(unix))]
        let _ = len;
    }

    fn check_range(&self, off: u64, len: usize) -> Result<()> {
        ensure!(
            off.checked_add(len as u64).is_some_and(|end| end <= self.size),
            "pool range {}..+{} out of bounds (size={})",
            off,
            len,
            self.size
        );
        Ok(())
    }

    /// Blocks file removal on some platforms until dropped; kept so the
    /// mapping and descriptor share a lifetime.
    pub fn file(&self) -> &File {
        &self.file
    }
}
