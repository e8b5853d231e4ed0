//! # streekv - Persistent B+Tree Key-Value Engine
//!
//! streekv stores variable-length byte-string records in a single
//! memory-mapped pool file and indexes them with a hybrid B+tree: the
//! leaves are persistent, the inner levels are volatile and rebuilt on
//! every open. Committed state survives process death and machine crashes;
//! restart reconstructs the index from the persistent image alone.
//!
//! ## Quick Start
//!
//! ```ignore
//! use streekv::{Config, Kv};
//!
//! let config = Config::new()
//!     .put_string("path", "/dev/shm/demo.pool")
//!     .put_uint64("size", 64 << 20);
//!
//! let mut kv = Kv::open("stree", config)?;
//! kv.put(b"hello", b"world")?;
//! assert_eq!(kv.get(b"hello")?, b"world");
//!
//! kv.get_all(|key, value| {
//!     println!("{key:?} -> {value:?}");
//!     0 // nonzero stops iteration
//! })?;
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────┐
//! │        Public API (Kv, Status)        │  engine.rs, error.rs
//! ├───────────────────────────────────────┤
//! │  Hybrid B+tree                        │  tree/
//! │    volatile: inner nodes, leaf        │
//! │    descriptors (arena ids)            │
//! │    persistent: leaf chain, slots      │
//! ├───────────────────────────────────────┤
//! │  Pool: undo-logged transactions,      │  pool/
//! │  log-structured heap, tagged header   │
//! ├───────────────────────────────────────┤
//! │  Memory-mapped pool file (memmap2)    │  pool/mmap.rs
//! └───────────────────────────────────────┘
//! ```
//!
//! Two pointer flavors keep the strata honest: pool-relative [`pool::POff`]
//! offsets for persistent references, arena ids for volatile nodes. The
//! type system does not let one stand in for the other.
//!
//! ## Crash Consistency
//!
//! Every mutation — put, remove, leaf split — runs inside one undo-logged
//! pool transaction. Pre-images are flushed before targets are written; a
//! crash at any instant either keeps the whole mutation or rolls it back
//! at the next open. The volatile index needs no such care: it is derived
//! state, rebuilt from the leaf chain during recovery.
//!
//! ## Concurrency Model
//!
//! One engine instance is single-writer single-reader, enforced at compile
//! time (`&mut self` writes, `&self` reads). Instances over distinct pools
//! are independent.
//!
//! ## Module Overview
//!
//! - [`engine`]: the operation surface (`Kv`) and open-time engine
//!   selection
//! - [`tree`]: Pearson-hash slot filtering, leaf layout, the volatile
//!   index, split and recovery algorithms, ordered walks
//! - [`pool`]: mapped pool file, allocator, undo-logged transactions
//! - [`config`]: the open-time configuration bag and engine constants
//! - [`error`]: the stable status taxonomy and `errormsg()`

pub mod config;
pub mod engine;
pub mod error;
pub mod pool;
pub mod tree;

pub use config::{Config, ConfigValue};
pub use engine::{Kv, ENGINE_NAME};
pub use error::{errormsg, KvError, Status};
pub use tree::TreeStats;
