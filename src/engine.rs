//! # Public Operations Surface
//!
//! [`Kv`] is the engine facade: it owns the pool and the volatile tree and
//! exposes the stable operation set callers and language bindings build
//! on. One engine is built in, selected by name at open time — the
//! `"stree"` sorted tree — and an unrecognized name fails cleanly, before
//! any file is touched.
//!
//! ## Semantics at a glance
//!
//! - `put` / `remove` / `get` / `exists`: point operations; `remove` is
//!   idempotent, `get` reports a miss as [`Status::NotFound`].
//! - `count_*` / `get_*`: range cardinalities and ordered visits. The
//!   `between` variants are exclusive on both ends. Iteration callbacks
//!   return an `i32`; nonzero stops the walk and the operation reports
//!   [`Status::StoppedByCallback`].
//! - `upper_bound` / `lower_bound` / `get_begin` / `get_next` / `get_prev`:
//!   cursor-style bound queries returning an owned `(key, value)` pair or
//!   `None` as the empty sentinel.
//!
//! ## Error mapping
//!
//! Internal faults surface as `eyre` reports; this module is where they
//! become statuses. Pool exhaustion inside a transactional write maps to
//! `OUT_OF_MEMORY`, any other escaped fault to `UNKNOWN_ERROR`, and in
//! both cases the transaction has already rolled back, so persistent and
//! volatile state are unchanged.
//!
//! ## Concurrency
//!
//! Single writer, single reader, enforced by the borrow checker: reads
//! take `&self`, writes take `&mut self`, and an iteration callback
//! re-entering a write cannot compile. Distinct engine instances over
//! distinct pools are fully independent.

use std::ops::Bound;
use std::path::PathBuf;

use tracing::{info, trace};

use crate::config::constants::{DEFAULT_POOL_SIZE, MIN_POOL_SIZE};
use crate::config::{Config, ConfigValue};
use crate::error::{KvError, Status};
use crate::pool::{Pool, PoolFull};
use crate::tree::{BpTree, TreeStats, Visit};

/// Name of the built-in engine.
pub const ENGINE_NAME: &str = "stree";

type KvResult<T> = Result<T, KvError>;

/// A running engine instance over one pool file.
#[derive(Debug)]
pub struct Kv {
    pool: Pool,
    tree: BpTree,
}

impl Kv {
    /// Opens (or creates) an engine. Consumes the configuration bag.
    ///
    /// Recognized options: `path` (string, required), `size` (u64, pool
    /// bytes when creating), `force_create` (u64, nonzero truncates and
    /// recreates even if the file exists). Anything else is rejected.
    pub fn open(engine: &str, config: Config) -> KvResult<Kv> {
        if engine != ENGINE_NAME {
            return Err(KvError::new(
                Status::WrongEngineName,
                format!("no engine named '{engine}'"),
            ));
        }

        let opts = OpenOptions::parse(config)?;

        let create = opts.force_create || !opts.path.exists();
        let pool = if create {
            if opts.size < MIN_POOL_SIZE {
                return Err(KvError::new(
                    Status::InvalidArgument,
                    format!(
                        "pool size {} below minimum {}",
                        opts.size, MIN_POOL_SIZE
                    ),
                ));
            }
            Pool::create(&opts.path, opts.size).map_err(internal)?
        } else {
            Pool::open(&opts.path).map_err(internal)?
        };

        let tree = BpTree::recover(&pool).map_err(internal)?;

        info!(
            path = %opts.path.display(),
            size = pool.size(),
            created = create,
            "stree engine started"
        );

        Ok(Kv { pool, tree })
    }

    pub fn name(&self) -> &'static str {
        ENGINE_NAME
    }

    /// Releases volatile state and closes the pool. Dropping the instance
    /// is equivalent; this exists for callers that want the close explicit.
    pub fn close(self) {}

    pub fn put(&mut self, key: &[u8], value: &[u8]) -> KvResult<()> {
        trace!(key_len = key.len(), value_len = value.len(), "put");
        self.tree.put(&mut self.pool, key, value).map_err(internal)
    }

    pub fn get(&self, key: &[u8]) -> KvResult<Vec<u8>> {
        let mut out = Vec::new();
        self.get_with(key, |value| out.extend_from_slice(value))?;
        Ok(out)
    }

    /// `get` with the value-sink callback shape used by bindings: the
    /// borrowed bytes are valid only for the duration of the callback.
    pub fn get_with<F: FnOnce(&[u8])>(&self, key: &[u8], sink: F) -> KvResult<()> {
        trace!(key_len = key.len(), "get");
        match self.tree.locate(key).map_err(internal)? {
            Some((leaf_id, idx)) => {
                let value = self.tree.value_at(&self.pool, leaf_id, idx).map_err(internal)?;
                sink(value);
                Ok(())
            }
            None => Err(KvError::new(Status::NotFound, "key not found")),
        }
    }

    pub fn exists(&self, key: &[u8]) -> KvResult<bool> {
        trace!(key_len = key.len(), "exists");
        Ok(self.tree.locate(key).map_err(internal)?.is_some())
    }

    /// Removes `key` if present. Removing an absent key is still `Ok`.
    pub fn remove(&mut self, key: &[u8]) -> KvResult<()> {
        trace!(key_len = key.len(), "remove");
        self.tree.remove(&mut self.pool, key).map_err(internal)?;
        Ok(())
    }

    pub fn count_all(&self) -> KvResult<usize> {
        self.count(Bound::Unbounded, Bound::Unbounded)
    }

    /// Records with key strictly above `key`.
    pub fn count_above(&self, key: &[u8]) -> KvResult<usize> {
        self.count(Bound::Excluded(key), Bound::Unbounded)
    }

    /// Records with key at or above `key`.
    pub fn count_equal_above(&self, key: &[u8]) -> KvResult<usize> {
        self.count(Bound::Included(key), Bound::Unbounded)
    }

    /// Records with key strictly below `key`.
    pub fn count_below(&self, key: &[u8]) -> KvResult<usize> {
        self.count(Bound::Unbounded, Bound::Excluded(key))
    }

    /// Records with key at or below `key`.
    pub fn count_equal_below(&self, key: &[u8]) -> KvResult<usize> {
        self.count(Bound::Unbounded, Bound::Included(key))
    }

    /// Records with `key1 < key < key2`, both ends exclusive.
    pub fn count_between(&self, key1: &[u8], key2: &[u8]) -> KvResult<usize> {
        self.count(Bound::Excluded(key1), Bound::Excluded(key2))
    }

    pub fn get_all<F>(&self, callback: F) -> KvResult<()>
    where
        F: FnMut(&[u8], &[u8]) -> i32,
    {
        self.scan(Bound::Unbounded, Bound::Unbounded, callback)
    }

    pub fn get_above<F>(&self, key: &[u8], callback: F) -> KvResult<()>
    where
        F: FnMut(&[u8], &[u8]) -> i32,
    {
        self.scan(Bound::Excluded(key), Bound::Unbounded, callback)
    }

    pub fn get_equal_above<F>(&self, key: &[u8], callback: F) -> KvResult<()>
    where
        F: FnMut(&[u8], &[u8]) -> i32,
    {
        self.scan(Bound::Included(key), Bound::Unbounded, callback)
    }

    pub fn get_below<F>(&self, key: &[u8], callback: F) -> KvResult<()>
    where
        F: FnMut(&[u8], &[u8]) -> i32,
    {
        self.scan(Bound::Unbounded, Bound::Excluded(key), callback)
    }

    pub fn get_equal_below<F>(&self, key: &[u8], callback: F) -> KvResult<()>
    where
        F: FnMut(&[u8], &[u8]) -> i32,
    {
        self.scan(Bound::Unbounded, Bound::Included(key), callback)
    }

    /// Visits records with `key1 < key < key2`, both ends exclusive.
    pub fn get_between<F>(&self, key1: &[u8], key2: &[u8], callback: F) -> KvResult<()>
    where
        F: FnMut(&[u8], &[u8]) -> i32,
    {
        self.scan(Bound::Excluded(key1), Bound::Excluded(key2), callback)
    }

    /// Smallest record with key strictly greater than `key`.
    pub fn upper_bound(&self, key: &[u8]) -> KvResult<Option<(Vec<u8>, Vec<u8>)>> {
        self.tree
            .first_in(&self.pool, Bound::Excluded(key), Bound::Unbounded)
            .map_err(internal)
    }

    /// Smallest record with key greater than or equal to `key`.
    pub fn lower_bound(&self, key: &[u8]) -> KvResult<Option<(Vec<u8>, Vec<u8>)>> {
        self.tree
            .first_in(&self.pool, Bound::Included(key), Bound::Unbounded)
            .map_err(internal)
    }

    /// The smallest record.
    pub fn get_begin(&self) -> KvResult<Option<(Vec<u8>, Vec<u8>)>> {
        self.tree
            .first_in(&self.pool, Bound::Unbounded, Bound::Unbounded)
            .map_err(internal)
    }

    /// Smallest record above `key`; `key` itself need not exist.
    pub fn get_next(&self, key: &[u8]) -> KvResult<Option<(Vec<u8>, Vec<u8>)>> {
        self.upper_bound(key)
    }

    /// Largest record strictly below `key`; `key` itself need not exist.
    pub fn get_prev(&self, key: &[u8]) -> KvResult<Option<(Vec<u8>, Vec<u8>)>> {
        self.tree
            .last_in(&self.pool, Bound::Unbounded, Bound::Excluded(key))
            .map_err(internal)
    }

    /// Argument validation only; the sorted tree keeps no reclaimable
    /// per-leaf free space to compact.
    pub fn defrag(&mut self, start_percent: u64, amount_percent: u64) -> KvResult<()> {
        if start_percent > 100 || amount_percent > 100 {
            return Err(KvError::new(
                Status::InvalidArgument,
                format!(
                    "defrag percentages out of range: start={start_percent} amount={amount_percent}"
                ),
            ));
        }
        Err(KvError::new(
            Status::NotSupported,
            "stree does not support defragmentation",
        ))
    }

    /// Shape counters: reachable leaves, inner nodes, recycled leaves and
    /// tree depth.
    pub fn stats(&self) -> TreeStats {
        self.tree.stats()
    }

    fn count(&self, lower: Bound<&[u8]>, upper: Bound<&[u8]>) -> KvResult<usize> {
        self.tree
            .count_range(&self.pool, lower, upper)
            .map_err(internal)
    }

    fn scan<F>(&self, lower: Bound<&[u8]>, upper: Bound<&[u8]>, mut callback: F) -> KvResult<()>
    where
        F: FnMut(&[u8], &[u8]) -> i32,
    {
        let complete = self
            .tree
            .walk_range(&self.pool, lower, upper, &mut |key, value| {
                Ok(if callback(key, value) != 0 {
                    Visit::Stop
                } else {
                    Visit::Continue
                })
            })
            .map_err(internal)?;

        if complete {
            Ok(())
        } else {
            Err(KvError::new(
                Status::StoppedByCallback,
                "iteration stopped by callback",
            ))
        }
    }
}

impl Drop for Kv {
    fn drop(&mut self) {
        if let Err(err) = self.pool.flush() {
            tracing::error!("pool flush on close failed: {err:#}");
        }
        info!("stree engine stopped");
    }
}

/// The options `open` extracts from the configuration bag.
struct OpenOptions {
    path: PathBuf,
    size: u64,
    force_create: bool,
}

impl OpenOptions {
    fn parse(config: Config) -> KvResult<OpenOptions> {
        let mut path: Option<PathBuf> = None;
        let mut size = DEFAULT_POOL_SIZE;
        let mut force_create = false;

        for (key, value) in config {
            match key.as_str() {
                "path" => match value {
                    ConfigValue::String(s) => path = Some(PathBuf::from(s)),
                    other => return Err(type_error(&key, "string", &other)),
                },
                "size" => match value {
                    ConfigValue::Uint64(v) => size = v,
                    other => return Err(type_error(&key, "uint64", &other)),
                },
                "force_create" => match value {
                    ConfigValue::Uint64(v) => force_create = v != 0,
                    other => return Err(type_error(&key, "uint64", &other)),
                },
                _ => {
                    return Err(KvError::new(
                        Status::ConfigParsingError,
                        format!("unknown config item '{key}'"),
                    ))
                }
            }
        }

        let Some(path) = path else {
            return Err(KvError::new(
                Status::InvalidArgument,
                "config has no 'path' item",
            ));
        };

        Ok(OpenOptions {
            path,
            size,
            force_create,
        })
    }
}

fn type_error(key: &str, expected: &str, found: &ConfigValue) -> KvError {
    KvError::new(
        Status::ConfigTypeError,
        format!(
            "config item '{key}' has kind {}, expected {expected}",
            found.kind()
        ),
    )
}

/// Boundary mapping from internal faults to the status taxonomy.
fn internal(err: eyre::Report) -> KvError {
    if err.downcast_ref::<PoolFull>().is_some() {
        KvError::new(Status::OutOfMemory, format!("{err:#}"))
    } else {
        KvError::new(Status::UnknownError, format!("{err:#}"))
    }
}
