//! # Undo-Logged Transactions
//!
//! A [`Tx`] makes a group of pool mutations all-or-nothing against both an
//! early error return and a crash. The discipline is write-ahead undo
//! logging:
//!
//! 1. Before a byte range is first mutated, its current contents are copied
//!    into the undo region and flushed, and the undo header is advanced and
//!    flushed. Only then is the target written.
//! 2. On commit, every mutated range is flushed, then the undo header is
//!    cleared — the single atomic point after which the transaction is
//!    durable.
//! 3. On rollback (error return, unwind, or a crash followed by reopen),
//!    the persisted pre-images are replayed in reverse and the undo header
//!    is cleared, restoring the exact pre-transaction image.
//!
//! Writes into memory the transaction itself allocated skip the undo log:
//! rolling back the allocator state already un-publishes those bytes. That
//! keeps large value copies out of the undo region. The one exception is a
//! block reused from the free list, whose chain link must be preserved —
//! `alloc` stages those 8 bytes explicitly before marking the block fresh.

use eyre::{ensure, Result};
use zerocopy::IntoBytes;

use crate::config::constants::UNDO_REGION_OFF;
use super::header::{
    UndoEntryHeader, UndoHeader, HDR_FREE_HEAD_OFF, HDR_HEAD_OFF, HDR_HEAP_TOP_OFF,
    UNDO_DATA_OFF, UNDO_DATA_SIZE, UNDO_ENTRY_HEADER_SIZE, UNDO_HEADER_SIZE,
};
use super::mmap::PoolFile;
use super::{POff, Pool};

/// An in-flight transaction. Obtained from [`Pool::with_tx`]; dropping it
/// without commit rolls back.
pub struct Tx<'p> {
    pub(super) pool: &'p mut Pool,
    /// Bytes of the undo data area consumed so far.
    pub(super) undo_used: u64,
    pub(super) undo_entries: u32,
    /// Target ranges to flush at commit.
    pub(super) dirty: Vec<(u64, u64)>,
    /// Ranges allocated by this transaction; writes inside them need no
    /// pre-image.
    pub(super) fresh: Vec<(u64, u64)>,
    pub(super) committed: bool,
}

impl<'p> Tx<'p> {
    pub(super) fn begin(pool: &'p mut Pool) -> Result<Self> {
        let mut header = UndoHeader::cleared();
        header.set_active(1);
        write_undo_header(&mut pool.file, &header)?;

        Ok(Self {
            pool,
            undo_used: 0,
            undo_entries: 0,
            dirty: Vec::new(),
            fresh: Vec::new(),
            committed: false,
        })
    }

    /// Read-only view of the pool mid-transaction. Uncommitted writes are
    /// visible, matching the single-writer model.
    pub fn pool(&self) -> &Pool {
        self.pool
    }

    /// Stages and performs a write.
    pub fn write(&mut self, off: u64, bytes: &[u8]) -> Result<()> {
        self.stage(off, bytes.len())?;
        self.pool
            .file
            .bytes_mut(off, bytes.len())?
            .copy_from_slice(bytes);
        self.dirty.push((off, bytes.len() as u64));
        Ok(())
    }

    pub fn write_u64(&mut self, off: u64, value: u64) -> Result<()> {
        self.write(off, &value.to_le_bytes())
    }

    pub fn read_u64(&self, off: u64) -> Result<u64> {
        self.pool.read_u64(off)
    }

    /// Repoints the persistent root at a new first leaf.
    pub fn set_head(&mut self, head: POff) -> Result<()> {
        self.write_u64(HDR_HEAD_OFF, head.get())
    }

    pub(super) fn set_heap_top(&mut self, top: u64) -> Result<()> {
        self.write_u64(HDR_HEAP_TOP_OFF, top)
    }

    pub(super) fn set_free_head(&mut self, head: u64) -> Result<()> {
        self.write_u64(HDR_FREE_HEAD_OFF, head)
    }

    /// Records the pre-image of `off..off+len` unless the range was
    /// allocated by this transaction.
    pub(super) fn stage(&mut self, off: u64, len: usize) -> Result<()> {
        if len == 0 || self.in_fresh(off, len as u64) {
            return Ok(());
        }

        let entry_len = UNDO_ENTRY_HEADER_SIZE as u64 + len as u64;
        ensure!(
            self.undo_used + entry_len <= UNDO_DATA_SIZE,
            "transaction exceeds undo log capacity ({} bytes)",
            UNDO_DATA_SIZE
        );

        let pre_image = self.pool.file.bytes(off, len)?.to_vec();
        let entry_off = UNDO_DATA_OFF + self.undo_used;

        let header = UndoEntryHeader::new(off, len as u32);
        let dst = self
            .pool
            .file
            .bytes_mut(entry_off, UNDO_ENTRY_HEADER_SIZE + len)?;
        dst[..UNDO_ENTRY_HEADER_SIZE].copy_from_slice(header.as_bytes());
        dst[UNDO_ENTRY_HEADER_SIZE..].copy_from_slice(&pre_image);

        // The pre-image must be durable before the target is mutated.
        self.pool
            .file
            .flush_range(entry_off, UNDO_ENTRY_HEADER_SIZE + len)?;

        self.undo_used += entry_len;
        self.undo_entries += 1;

        let mut uh = UndoHeader::cleared();
        uh.set_active(1);
        uh.set_entry_count(self.undo_entries);
        uh.set_used(self.undo_used);
        write_undo_header(&mut self.pool.file, &uh)?;

        Ok(())
    }

    pub(super) fn note_fresh(&mut self, off: u64, len: u64) {
        self.fresh.push((off, len));
    }

    fn in_fresh(&self, off: u64, len: u64) -> bool {
        self.fresh
            .iter()
            .any(|&(f_off, f_len)| off >= f_off && off + len <= f_off + f_len)
    }

    pub(super) fn commit(mut self) -> Result<()> {
        for &(off, len) in &self.dirty {
            self.pool.file.flush_range(off, len as usize)?;
        }

        write_undo_header(&mut self.pool.file, &UndoHeader::cleared())?;

        self.committed = true;
        Ok(())
    }
}

impl Drop for Tx<'_> {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        if let Err(err) = replay_undo(&mut self.pool.file) {
            // Nothing sane to do mid-unwind; the persisted undo log still
            // protects the image, so the next open repairs it.
            tracing::error!("in-process transaction rollback failed: {err:#}");
        }
    }
}

fn write_undo_header(file: &mut PoolFile, header: &UndoHeader) -> Result<()> {
    file.bytes_mut(UNDO_REGION_OFF, UNDO_HEADER_SIZE)?
        .copy_from_slice(header.as_bytes());
    file.flush_range(UNDO_REGION_OFF, UNDO_HEADER_SIZE)
}

/// Replays a pending undo log, if any, restoring the pre-transaction image.
/// Returns whether anything was rolled back. Shared between in-process
/// rollback and crash recovery at open.
pub(super) fn replay_undo(file: &mut PoolFile) -> Result<bool> {
    let (active, entry_count, used) = {
        let header = UndoHeader::from_bytes(file.bytes(UNDO_REGION_OFF, UNDO_HEADER_SIZE)?)?;
        (header.active(), header.entry_count(), header.used())
    };

    if active == 0 {
        return Ok(false);
    }

    ensure!(
        used <= UNDO_DATA_SIZE,
        "undo log claims {} bytes used, capacity is {}",
        used,
        UNDO_DATA_SIZE
    );

    let mut entries = Vec::with_capacity(entry_count as usize);
    let mut off = UNDO_DATA_OFF;
    let end = UNDO_DATA_OFF + used;

    for _ in 0..entry_count {
        ensure!(
            off + UNDO_ENTRY_HEADER_SIZE as u64 <= end,
            "truncated undo entry header"
        );
        let (target, len) = {
            let header =
                UndoEntryHeader::from_bytes(file.bytes(off, UNDO_ENTRY_HEADER_SIZE)?)?;
            (header.target(), header.len() as u64)
        };
        let data_off = off + UNDO_ENTRY_HEADER_SIZE as u64;
        ensure!(data_off + len <= end, "truncated undo entry data");

        entries.push((target, len, data_off));
        off = data_off + len;
    }

    for &(target, len, data_off) in entries.iter().rev() {
        let pre_image = file.bytes(data_off, len as usize)?.to_vec();
        file.bytes_mut(target, len as usize)?
            .copy_from_slice(&pre_image);
        file.flush_range(target, len as usize)?;
    }

    write_undo_header(file, &UndoHeader::cleared())?;

    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::constants::{HEAP_START, MIN_POOL_SIZE};
    use tempfile::tempdir;

    fn test_pool() -> (tempfile::TempDir, Pool) {
        let dir = tempdir().unwrap();
        let pool = Pool::create(dir.path().join("pool"), MIN_POOL_SIZE).unwrap();
        (dir, pool)
    }

    #[test]
    fn committed_writes_survive() {
        let (_dir, mut pool) = test_pool();

        pool.with_tx(|tx| tx.write(HEAP_START, b"hello")).unwrap();

        assert_eq!(pool.bytes(HEAP_START, 5).unwrap(), b"hello");
        assert_eq!(pool.header().unwrap().head(), 0);
    }

    #[test]
    fn failed_transaction_rolls_back() {
        let (_dir, mut pool) = test_pool();

        pool.with_tx(|tx| tx.write(HEAP_START, b"original"))
            .unwrap();

        let result: Result<()> = pool.with_tx(|tx| {
            tx.write(HEAP_START, b"clobber!")?;
            tx.set_head(POff::new(HEAP_START))?;
            eyre::bail!("simulated failure")
        });
        assert!(result.is_err());

        assert_eq!(pool.bytes(HEAP_START, 8).unwrap(), b"original");
        assert!(pool.head().unwrap().is_null());
    }

    #[test]
    fn interrupted_transaction_is_rolled_back_on_open() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("pool");

        {
            let mut pool = Pool::create(&path, MIN_POOL_SIZE).unwrap();
            pool.with_tx(|tx| tx.write(HEAP_START, b"durable!")).unwrap();

            // Forge a crash: stage and mutate, then leak the transaction so
            // neither commit nor the in-process rollback runs.
            let tx = {
                let mut tx = Tx::begin(&mut pool).unwrap();
                tx.write(HEAP_START, b"torn....").unwrap();
                tx.set_head(POff::new(HEAP_START)).unwrap();
                tx
            };
            std::mem::forget(tx);
            pool.flush().unwrap();
        }

        let pool = Pool::open(&path).unwrap();
        assert_eq!(pool.bytes(HEAP_START, 8).unwrap(), b"durable!");
        assert!(pool.head().unwrap().is_null());
    }

    #[test]
    fn repeated_writes_to_one_range_roll_back_to_oldest_pre_image() {
        let (_dir, mut pool) = test_pool();

        pool.with_tx(|tx| tx.write(HEAP_START, b"aaaa")).unwrap();

        let result: Result<()> = pool.with_tx(|tx| {
            tx.write(HEAP_START, b"bbbb")?;
            tx.write(HEAP_START, b"cccc")?;
            eyre::bail!("abort")
        });
        assert!(result.is_err());

        assert_eq!(pool.bytes(HEAP_START, 4).unwrap(), b"aaaa");
    }

    #[test]
    fn set_head_is_transactional() {
        let (_dir, mut pool) = test_pool();

        pool.with_tx(|tx| tx.set_head(POff::new(HEAP_START + 8)))
            .unwrap();
        assert_eq!(pool.head().unwrap(), POff::new(HEAP_START + 8));
    }
}
