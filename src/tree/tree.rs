//! # The Hybrid B+Tree
//!
//! This module is the heart of the engine: a B+tree whose leaves are
//! persistent (the pool leaf chain) and whose inner levels are volatile
//! (the node arena), glued together by leaf descriptors that mirror each
//! leaf's hashes and keys for in-memory search.
//!
//! ## Why two strata
//!
//! The persistent image is deliberately dumb: an unordered singly-linked
//! chain of fixed-capacity leaves hanging off the pool root. Everything
//! ordered — separators, parents, balance — lives in volatile memory and
//! is *derived* state. That split is what makes crash consistency
//! tractable:
//!
//! - A mutation only has to make the leaf chain self-consistent inside one
//!   transaction. Torn volatile state cannot exist after a crash because
//!   volatile state does not survive one.
//! - Recovery never repairs the index; it rebuilds it from the chain, so
//!   the inner levels can be rebalanced outside any transaction during
//!   normal operation too.
//!
//! ## Split protocol
//!
//! A full leaf splits in three stages (the middle one transactional):
//!
//! 1. Sort the `LEAF_KEYS + 1` candidate keys; the lower median becomes
//!    the split key.
//! 2. In one transaction: obtain the new leaf (free list first, else
//!    allocate and prepend to the chain), move every slot whose key sorts
//!    strictly above the split key into the new leaf at the same index,
//!    and write the incoming record into whichever side it belongs.
//! 3. After commit, mirror the moves in the descriptors and push the split
//!    key into the volatile parents, splitting inner nodes upward as
//!    needed.
//!
//! Strictly-greater movement keeps the median on the left, so the left
//! leaf can never end up empty.
//!
//! ## Recovery
//!
//! Open walks the chain once: occupied leaves become descriptors tagged
//! with their maximum key, empty leaves go to the free list. Sorting the
//! descriptors by maximum and replaying the split propagation over
//! adjacent pairs rebuilds a balanced index whose separators are exactly
//! the leaf maxima.

use std::ops::Bound;

use eyre::{bail, ensure, Result};
use smallvec::SmallVec;

use crate::config::constants::{
    INNER_KEYS, INNER_KEYS_MIDPOINT, INNER_KEYS_UPPER, LEAF_KEYS, LEAF_KEYS_MIDPOINT,
};
use crate::pool::{POff, Pool, Tx};

use super::hash::pearson;
use super::node::{Arena, Inner, LeafDesc, Node, NodeId};
use super::slot::{
    set_next, slot_clear, slot_move, slot_set, slot_value, Leaf, LEAF_SIZE,
};

/// Callback verdict during an ordered walk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visit {
    Continue,
    Stop,
}

/// Outcome of walking one subtree.
enum WalkState {
    /// Keep going with the next sibling.
    More,
    /// Every further key is above the upper bound; the walk is complete.
    Done,
    /// The callback asked to stop.
    Stopped,
}

/// Point-in-time shape counters, mostly for tests and diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TreeStats {
    pub leaf_count: usize,
    pub inner_count: usize,
    pub free_leaf_count: usize,
    pub depth: usize,
}

/// The volatile half of the engine plus the algorithms that keep it in
/// step with the persistent leaf chain.
#[derive(Debug, Default)]
pub struct BpTree {
    arena: Arena,
    top: Option<NodeId>,
    /// Empty persistent leaves found at recovery, reused before allocating.
    free_leaves: Vec<POff>,
}

impl BpTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuilds the volatile index from the pool's leaf chain.
    pub fn recover(pool: &Pool) -> Result<Self> {
        let mut tree = Self::new();
        let mut tokens: Vec<(NodeId, Vec<u8>)> = Vec::new();

        let mut cur = pool.head()?;
        while !cur.is_null() {
            pool.prefetch(cur.get(), LEAF_SIZE);
            let desc = LeafDesc::mirror(pool, cur)?;
            let next = Leaf::read(pool, cur)?.next();

            match desc.max_key() {
                Some(max) => {
                    let max = max.to_vec();
                    let id = tree.arena.insert(Node::Leaf(desc));
                    tokens.push((id, max));
                }
                None => tree.free_leaves.push(cur),
            }

            cur = next;
        }

        // Chain order is allocation order; key order comes from sorting the
        // leaf maxima, then replaying the split propagation pairwise.
        tokens.sort_by(|a, b| a.1.cmp(&b.1));

        let mut iter = tokens.into_iter();
        if let Some((first, first_max)) = iter.next() {
            tree.top = Some(first);
            let mut prev = first;
            let mut prev_max = first_max;
            for (id, max) in iter {
                tree.propagate(prev, id, prev_max)?;
                prev = id;
                prev_max = max;
            }
        }

        Ok(tree)
    }

    /// Descends to the leaf descriptor that would hold `key`.
    fn leaf_for(&self, key: &[u8]) -> Option<NodeId> {
        let mut cur = self.top?;
        loop {
            match self.arena.node(cur) {
                Node::Leaf(_) => return Some(cur),
                Node::Inner(inner) => {
                    let pos = inner
                        .keys
                        .iter()
                        .position(|sep| sep.as_slice() >= key)
                        .unwrap_or(inner.keys.len());
                    cur = inner.children[pos];
                }
            }
        }
    }

    /// Hash-filtered point lookup. Scans slots in reverse index order so
    /// the most recently written index wins if duplicates ever exist.
    pub fn locate(&self, key: &[u8]) -> Result<Option<(NodeId, usize)>> {
        let Some(leaf_id) = self.leaf_for(key) else {
            return Ok(None);
        };
        let desc = self.arena.leaf(leaf_id)?;
        let hash = pearson(key);

        for i in (0..LEAF_KEYS).rev() {
            if desc.hashes[i] == hash && desc.keys[i].as_slice() == key {
                return Ok(Some((leaf_id, i)));
            }
        }
        Ok(None)
    }

    /// Value bytes of the record at a location returned by [`locate`].
    ///
    /// [`locate`]: BpTree::locate
    pub fn value_at<'p>(
        &self,
        pool: &'p Pool,
        leaf_id: NodeId,
        idx: usize,
    ) -> Result<&'p [u8]> {
        let desc = self.arena.leaf(leaf_id)?;
        let leaf = Leaf::read(pool, desc.leaf)?;
        slot_value(pool, leaf.slot(idx))
    }

    /// Inserts or updates a record.
    pub fn put(&mut self, pool: &mut Pool, key: &[u8], value: &[u8]) -> Result<()> {
        let hash = pearson(key);

        let Some(leaf_id) = self.leaf_for(key) else {
            return self.put_first(pool, key, value, hash);
        };

        // One reverse pass: prefer the slot already holding this key,
        // otherwise fall back to the last empty slot seen.
        let (leaf_off, target) = {
            let desc = self.arena.leaf(leaf_id)?;
            let mut match_slot = None;
            let mut last_empty = None;
            for i in (0..LEAF_KEYS).rev() {
                if desc.hashes[i] == 0 {
                    last_empty = Some(i);
                } else if match_slot.is_none()
                    && desc.hashes[i] == hash
                    && desc.keys[i].as_slice() == key
                {
                    match_slot = Some(i);
                }
            }
            (desc.leaf, match_slot.or(last_empty))
        };

        match target {
            Some(idx) => {
                pool.with_tx(|tx| slot_set(tx, leaf_off, idx, hash, key, value))?;

                let desc = self.arena.leaf_mut(leaf_id)?;
                desc.hashes[idx] = hash;
                desc.keys[idx].clear();
                desc.keys[idx].extend_from_slice(key);
                Ok(())
            }
            None => self.split_leaf(pool, leaf_id, key, value, hash),
        }
    }

    /// First insert into an engine with no reachable leaf.
    fn put_first(&mut self, pool: &mut Pool, key: &[u8], value: &[u8], hash: u8) -> Result<()> {
        let recycled = self.free_leaves.last().copied();

        let leaf_off = pool.with_tx(|tx| {
            let off = match recycled {
                // Recovered free leaves are already zeroed and chained.
                Some(off) => off,
                None => allocate_linked_leaf(tx)?,
            };
            slot_set(tx, off, 0, hash, key, value)?;
            Ok(off)
        })?;
        if recycled.is_some() {
            self.free_leaves.pop();
        }

        let mut desc = LeafDesc::empty(leaf_off);
        desc.hashes[0] = hash;
        desc.keys[0] = key.to_vec();
        self.top = Some(self.arena.insert(Node::Leaf(desc)));
        Ok(())
    }

    /// Removes a record if present. Returns whether anything was removed;
    /// the public surface treats both outcomes as success.
    pub fn remove(&mut self, pool: &mut Pool, key: &[u8]) -> Result<bool> {
        let Some((leaf_id, idx)) = self.locate(key)? else {
            return Ok(false);
        };

        let leaf_off = self.arena.leaf(leaf_id)?.leaf;
        pool.with_tx(|tx| slot_clear(tx, leaf_off, idx))?;

        let desc = self.arena.leaf_mut(leaf_id)?;
        desc.hashes[idx] = 0;
        desc.keys[idx].clear();
        Ok(true)
    }

    fn split_leaf(
        &mut self,
        pool: &mut Pool,
        leaf_id: NodeId,
        key: &[u8],
        value: &[u8],
        hash: u8,
    ) -> Result<()> {
        let (leaf_off, parent, split_key, moves) = {
            let desc = self.arena.leaf(leaf_id)?;
            debug_assert_eq!(desc.occupied(), LEAF_KEYS);

            let mut candidates: SmallVec<[&[u8]; LEAF_KEYS + 1]> =
                desc.keys.iter().map(|k| k.as_slice()).collect();
            candidates.push(key);
            candidates.sort_unstable();
            // Lower median: with equal keys impossible, this keeps the
            // split key itself on the left side.
            let split_key = candidates[LEAF_KEYS_MIDPOINT].to_vec();

            let moves: SmallVec<[usize; LEAF_KEYS]> = (0..LEAF_KEYS)
                .filter(|&i| desc.keys[i].as_slice() > split_key.as_slice())
                .collect();

            (desc.leaf, desc.parent, split_key, moves)
        };

        let goes_right = key > split_key.as_slice();

        let mut moved = [false; LEAF_KEYS];
        for &i in &moves {
            moved[i] = true;
        }
        // Destination slot in the post-move image: first empty position in
        // reverse scan order.
        let target = if goes_right {
            (0..LEAF_KEYS).rev().find(|&i| !moved[i])
        } else {
            moves.last().copied()
        };
        let Some(target) = target else {
            bail!("split of leaf {} found no destination slot", leaf_off);
        };

        let recycled = self.free_leaves.last().copied();
        let new_leaf = pool.with_tx(|tx| {
            let new_leaf = match recycled {
                Some(off) => off,
                None => allocate_linked_leaf(tx)?,
            };
            for &i in &moves {
                slot_move(tx, leaf_off, new_leaf, i)?;
            }
            let dst = if goes_right { new_leaf } else { leaf_off };
            slot_set(tx, dst, target, hash, key, value)?;
            Ok(new_leaf)
        })?;
        if recycled.is_some() {
            self.free_leaves.pop();
        }

        // Volatile surgery happens only after commit. Inner nodes are
        // derived state; recovery rebuilds them from the leaf chain, so a
        // crash between here and the end of propagation loses nothing.
        let mut new_desc = LeafDesc::empty(new_leaf);
        new_desc.parent = parent;
        {
            let old = self.arena.leaf_mut(leaf_id)?;
            for &i in &moves {
                new_desc.hashes[i] = old.hashes[i];
                new_desc.keys[i] = std::mem::take(&mut old.keys[i]);
                old.hashes[i] = 0;
            }
            if goes_right {
                new_desc.hashes[target] = hash;
                new_desc.keys[target] = key.to_vec();
            } else {
                old.hashes[target] = hash;
                old.keys[target] = key.to_vec();
            }
        }
        let new_id = self.arena.insert(Node::Leaf(new_desc));

        self.propagate(leaf_id, new_id, split_key)
    }

    /// Publishes a (left, right, separator) split into the inner levels.
    /// Shared verbatim by recovery, which replays recovered leaves through
    /// it pairwise.
    fn propagate(&mut self, left: NodeId, right: NodeId, sep: Vec<u8>) -> Result<()> {
        match self.arena.node(left).parent() {
            None => {
                let inner = Inner {
                    parent: None,
                    keys: SmallVec::from_iter([sep]),
                    children: SmallVec::from_iter([left, right]),
                };
                let id = self.arena.insert(Node::Inner(inner));
                self.arena.node_mut(left).set_parent(Some(id));
                self.arena.node_mut(right).set_parent(Some(id));
                self.top = Some(id);
                Ok(())
            }
            Some(pid) => {
                {
                    let parent = self.arena.inner_mut(pid)?;
                    let pos = parent
                        .keys
                        .partition_point(|k| k.as_slice() < sep.as_slice());
                    parent.keys.insert(pos, sep);
                    parent.children.insert(pos + 1, right);
                }
                self.arena.node_mut(right).set_parent(Some(pid));

                if self.arena.inner(pid)?.keys.len() > INNER_KEYS {
                    self.split_inner(pid)?;
                }
                Ok(())
            }
        }
    }

    fn split_inner(&mut self, pid: NodeId) -> Result<()> {
        let (promoted, new_inner, moved_children) = {
            let node = self.arena.inner_mut(pid)?;
            ensure!(
                node.keys.len() == INNER_KEYS + 1,
                "inner split on node with {} keys",
                node.keys.len()
            );

            let moved_keys: SmallVec<[Vec<u8>; INNER_KEYS + 1]> =
                node.keys.drain(INNER_KEYS_UPPER..).collect();
            let moved_children: SmallVec<[NodeId; INNER_KEYS + 2]> =
                node.children.drain(INNER_KEYS_UPPER..).collect();

            // Each side keeps INNER_KEYS_MIDPOINT separators; the one in
            // between moves up.
            let promoted = node.keys.remove(INNER_KEYS_MIDPOINT);

            let new_inner = Inner {
                parent: node.parent,
                keys: moved_keys,
                children: moved_children.clone(),
            };
            (promoted, new_inner, moved_children)
        };

        let new_id = self.arena.insert(Node::Inner(new_inner));
        for child in moved_children {
            self.arena.node_mut(child).set_parent(Some(new_id));
        }

        self.propagate(pid, new_id, promoted)
    }

    /// Visits every record with `lower < key < upper` (bounds as given) in
    /// ascending key order. Returns `false` iff the callback stopped the
    /// walk early.
    pub fn walk_range<F>(
        &self,
        pool: &Pool,
        lower: Bound<&[u8]>,
        upper: Bound<&[u8]>,
        f: &mut F,
    ) -> Result<bool>
    where
        F: FnMut(&[u8], &[u8]) -> Result<Visit>,
    {
        let Some(top) = self.top else {
            return Ok(true);
        };
        match self.walk_node(pool, top, lower, upper, f)? {
            WalkState::Stopped => Ok(false),
            WalkState::More | WalkState::Done => Ok(true),
        }
    }

    fn walk_node<F>(
        &self,
        pool: &Pool,
        id: NodeId,
        lower: Bound<&[u8]>,
        upper: Bound<&[u8]>,
        f: &mut F,
    ) -> Result<WalkState>
    where
        F: FnMut(&[u8], &[u8]) -> Result<Visit>,
    {
        match self.arena.node(id) {
            Node::Inner(inner) => {
                for (idx, &child) in inner.children.iter().enumerate() {
                    // Separator idx is an upper bound for child idx: prune
                    // subtrees entirely below the lower bound.
                    if idx < inner.keys.len() && !above_lower(&inner.keys[idx], lower) {
                        continue;
                    }
                    match self.walk_node(pool, child, lower, upper, f)? {
                        WalkState::More => {}
                        other => return Ok(other),
                    }
                }
                Ok(WalkState::More)
            }
            Node::Leaf(desc) => {
                // Slots are physically unordered; sort indices per leaf.
                let mut order: SmallVec<[usize; LEAF_KEYS]> =
                    (0..LEAF_KEYS).filter(|&i| desc.hashes[i] != 0).collect();
                order.sort_unstable_by(|&a, &b| desc.keys[a].cmp(&desc.keys[b]));

                for i in order {
                    let key = desc.keys[i].as_slice();
                    if !above_lower(key, lower) {
                        continue;
                    }
                    if !below_upper(key, upper) {
                        return Ok(WalkState::Done);
                    }

                    let leaf = Leaf::read(pool, desc.leaf)?;
                    let value = slot_value(pool, leaf.slot(i))?;
                    if let Visit::Stop = f(key, value)? {
                        return Ok(WalkState::Stopped);
                    }
                }
                Ok(WalkState::More)
            }
        }
    }

    /// Number of records within the bounds.
    pub fn count_range(&self, pool: &Pool, lower: Bound<&[u8]>, upper: Bound<&[u8]>) -> Result<usize> {
        let mut count = 0usize;
        self.walk_range(pool, lower, upper, &mut |_, _| {
            count += 1;
            Ok(Visit::Continue)
        })?;
        Ok(count)
    }

    /// Smallest in-bounds record.
    pub fn first_in(
        &self,
        pool: &Pool,
        lower: Bound<&[u8]>,
        upper: Bound<&[u8]>,
    ) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        let mut found = None;
        self.walk_range(pool, lower, upper, &mut |key, value| {
            found = Some((key.to_vec(), value.to_vec()));
            Ok(Visit::Stop)
        })?;
        Ok(found)
    }

    /// Largest in-bounds record.
    pub fn last_in(
        &self,
        pool: &Pool,
        lower: Bound<&[u8]>,
        upper: Bound<&[u8]>,
    ) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        let mut found = None;
        self.walk_range(pool, lower, upper, &mut |key, value| {
            found = Some((key.to_vec(), value.to_vec()));
            Ok(Visit::Continue)
        })?;
        Ok(found)
    }

    pub fn stats(&self) -> TreeStats {
        let mut leaf_count = 0;
        let mut inner_count = 0;
        for node in self.arena.iter() {
            if node.is_leaf() {
                leaf_count += 1;
            } else {
                inner_count += 1;
            }
        }

        let mut depth = 0;
        let mut cur = self.top;
        while let Some(id) = cur {
            depth += 1;
            cur = match self.arena.node(id) {
                Node::Leaf(_) => None,
                Node::Inner(inner) => Some(inner.children[0]),
            };
        }

        TreeStats {
            leaf_count,
            inner_count,
            free_leaf_count: self.free_leaves.len(),
            depth,
        }
    }
}

/// Allocates a zeroed leaf and prepends it to the persistent chain.
fn allocate_linked_leaf(tx: &mut Tx<'_>) -> Result<POff> {
    let off = tx.alloc(LEAF_SIZE)?;
    tx.write(off.get(), &vec![0u8; LEAF_SIZE])?;

    let old_head = tx.pool().head()?;
    set_next(tx, off, old_head)?;
    tx.set_head(off)?;
    Ok(off)
}

fn above_lower(key: &[u8], lower: Bound<&[u8]>) -> bool {
    match lower {
        Bound::Unbounded => true,
        Bound::Included(b) => key >= b,
        Bound::Excluded(b) => key > b,
    }
}

fn below_upper(key: &[u8], upper: Bound<&[u8]>) -> bool {
    match upper {
        Bound::Unbounded => true,
        Bound::Included(b) => key <= b,
        Bound::Excluded(b) => key < b,
    }
}
