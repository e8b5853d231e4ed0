//! # streekv Configuration Constants
//!
//! This module centralizes the layout and fan-out constants for the engine.
//! Constants that depend on each other are co-located and the relationships
//! are enforced with compile-time assertions, so a change to one cannot
//! silently invalidate another.
//!
//! ## Dependency Graph
//!
//! ```text
//! LEAF_KEYS (48)
//!       │
//!       └─> LEAF_KEYS_MIDPOINT (LEAF_KEYS / 2)
//!             Index of the split key in the sorted candidate array of
//!             LEAF_KEYS + 1 keys during a leaf split.
//!
//! INNER_KEYS (4)
//!       │
//!       ├─> INNER_KEYS_MIDPOINT (INNER_KEYS / 2)
//!       │     Separator count each side retains after an inner split;
//!       │     the key at this index is promoted upward.
//!       │
//!       └─> INNER_KEYS_UPPER (INNER_KEYS_MIDPOINT + 1)
//!             First key/child index that migrates to the new inner node.
//!
//! POOL_HEADER_RESERVED (4096 bytes)
//!       │
//!       └─> UNDO_REGION_OFF (== POOL_HEADER_RESERVED)
//!             │
//!             └─> HEAP_START (UNDO_REGION_OFF + UNDO_REGION_SIZE)
//!                   First byte available to the allocator.
//!
//! MIN_POOL_SIZE
//!       Must leave room for the header, the undo region, and at least one
//!       leaf worth of heap.
//! ```

/// Maximum number of record slots in one persistent leaf.
pub const LEAF_KEYS: usize = 48;

/// Index of the split key within the sorted array of `LEAF_KEYS + 1`
/// candidate keys gathered during a leaf split.
pub const LEAF_KEYS_MIDPOINT: usize = LEAF_KEYS / 2;

/// Maximum number of separator keys in one volatile inner node. An inner
/// node holds `INNER_KEYS + 1` children.
pub const INNER_KEYS: usize = 4;

/// Separator count each side keeps after an inner-node split.
pub const INNER_KEYS_MIDPOINT: usize = INNER_KEYS / 2;

/// First separator/child index moved to the new node in an inner split.
pub const INNER_KEYS_UPPER: usize = INNER_KEYS_MIDPOINT + 1;

/// Bytes reserved at the front of the pool file for the header.
pub const POOL_HEADER_RESERVED: usize = 4096;

/// Offset of the undo-log region.
pub const UNDO_REGION_OFF: u64 = POOL_HEADER_RESERVED as u64;

/// Total size of the undo-log region, header included. A transaction
/// mutates at most one leaf split worth of slots plus allocator state, so
/// this leaves generous headroom.
pub const UNDO_REGION_SIZE: u64 = 256 * 1024;

/// First heap byte handed out by the allocator.
pub const HEAP_START: u64 = UNDO_REGION_OFF + UNDO_REGION_SIZE;

/// Smallest pool a caller may create.
pub const MIN_POOL_SIZE: u64 = 1024 * 1024;

/// Pool size used when the configuration does not carry a `size` option.
pub const DEFAULT_POOL_SIZE: u64 = 8 * 1024 * 1024;

const _: () = assert!(INNER_KEYS >= 2, "an inner node needs room to split");
const _: () = assert!(INNER_KEYS_UPPER == INNER_KEYS_MIDPOINT + 1);
const _: () = assert!(HEAP_START == UNDO_REGION_OFF + UNDO_REGION_SIZE);
const _: () = assert!(
    MIN_POOL_SIZE > HEAP_START + 4096,
    "minimum pool must leave usable heap"
);
const _: () = assert!(DEFAULT_POOL_SIZE >= MIN_POOL_SIZE);
