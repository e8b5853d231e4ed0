//! # Heap Allocation
//!
//! The pool heap is log-structured: blocks are carved off a bump cursor
//! (`heap_top`) and never returned to it. A freed block instead joins an
//! intrusive chain threaded through the blocks themselves — its first
//! payload bytes become the link — and allocation prefers that chain,
//! first-fit, before bumping.
//!
//! ## Block layout
//!
//! ```text
//! +-----------+----------------------+
//! | len (8 B) | payload (len bytes)  |   len is 8-byte aligned
//! +-----------+----------------------+
//! ^ block     ^ POff handed to callers
//! ```
//!
//! All allocator state (heap cursor, chain head, block links) is mutated
//! through the owning [`Tx`], so an aborted or crashed transaction rolls
//! the allocator back along with everything else. Exhaustion surfaces as
//! the typed [`PoolFull`] error, which the engine maps to the
//! out-of-memory status.

use eyre::{ensure, Result};

use crate::config::constants::HEAP_START;
use super::tx::Tx;
use super::POff;

/// Typed allocation-failure error, recognizable at the engine boundary.
#[derive(Debug, thiserror::Error)]
#[error("pool exhausted: need {requested} bytes, {available} left")]
pub struct PoolFull {
    pub requested: u64,
    pub available: u64,
}

const BLOCK_HEADER: u64 = 8;

fn align8(len: u64) -> u64 {
    (len + 7) & !7
}

impl Tx<'_> {
    /// Allocates `len` payload bytes, reusing a freed block when one fits.
    /// The returned range counts as fresh: writes into it skip the undo
    /// log, because rollback un-publishes the block itself.
    pub fn alloc(&mut self, len: usize) -> Result<POff> {
        let want = align8((len as u64).max(BLOCK_HEADER));

        // First fit over the freed-block chain.
        let mut prev: Option<u64> = None;
        let mut cur = self.pool().header()?.free_head();
        while cur != 0 {
            let block_len = self.read_u64(cur)?;
            let next = self.read_u64(cur + BLOCK_HEADER)?;

            if block_len >= want {
                match prev {
                    None => self.set_free_head(next)?,
                    Some(p) => self.write_u64(p + BLOCK_HEADER, next)?,
                }
                // The chain link lives in the payload; preserve it for
                // rollback before the caller scribbles over it.
                self.stage(cur + BLOCK_HEADER, BLOCK_HEADER as usize)?;
                self.note_fresh(cur + BLOCK_HEADER, block_len);
                return Ok(POff::new(cur + BLOCK_HEADER));
            }

            prev = Some(cur);
            cur = next;
        }

        // Bump from the heap cursor.
        let top = self.pool().header()?.heap_top();
        let pool_size = self.pool().size();
        let needed = BLOCK_HEADER + want;

        if top.checked_add(needed).is_none_or(|end| end > pool_size) {
            return Err(eyre::Report::new(PoolFull {
                requested: want,
                available: pool_size.saturating_sub(top),
            }));
        }

        self.set_heap_top(top + needed)?;
        self.note_fresh(top, needed);
        self.write_u64(top, want)?;

        Ok(POff::new(top + BLOCK_HEADER))
    }

    /// Returns a block to the freed chain. The payload is left in place;
    /// only its first bytes are repurposed as the chain link.
    pub fn free(&mut self, off: POff) -> Result<()> {
        ensure!(!off.is_null(), "free of null pool offset");

        let block = off.get().wrapping_sub(BLOCK_HEADER);
        ensure!(block >= HEAP_START, "free of non-heap offset {}", off);

        let block_len = self.read_u64(block)?;
        let block_end = block
            .checked_add(BLOCK_HEADER)
            .and_then(|b| b.checked_add(block_len));
        ensure!(
            block_len % 8 == 0 && block_end.is_some_and(|end| end <= self.pool().size()),
            "corrupt block header at {} (len={})",
            block,
            block_len
        );

        let old_head = self.pool().header()?.free_head();
        self.write_u64(off.get(), old_head)?;
        self.set_free_head(block)?;

        Ok(())
    }
}
