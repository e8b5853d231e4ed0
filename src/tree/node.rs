//! # Volatile Index Nodes
//!
//! The inner levels of the tree never touch media: they are rebuilt from
//! the persistent leaf chain on every open, so they live in a plain arena
//! of tagged nodes. Arena ids ([`NodeId`]) are the volatile pointer flavor
//! — deliberately a different type from the pool's [`POff`], so the two
//! kinds of reference cannot be confused.
//!
//! Two node shapes share the arena:
//!
//! - [`LeafDesc`] mirrors one persistent leaf's hash array and key bytes
//!   for cache-friendly search, and records which pool leaf it fronts.
//! - [`Inner`] holds up to [`INNER_KEYS`] separator keys and one more
//!   child than keys. Its `SmallVec`s are sized one past the fan-out so an
//!   insert can overflow in place and the split logic can restore the
//!   bound afterwards.
//!
//! Parent links are non-owning back-references (`Option<NodeId>`); the
//! arena owns every node and drops them together at shutdown, so there is
//! no cycle and no unsafe.

use eyre::{bail, Result};
use smallvec::SmallVec;

use crate::config::constants::{INNER_KEYS, LEAF_KEYS};
use crate::pool::{POff, Pool};

use super::slot::{slot_key, Leaf};

/// Arena index of a volatile node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(u32);

impl NodeId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Volatile mirror of one persistent leaf.
#[derive(Debug)]
pub struct LeafDesc {
    pub parent: Option<NodeId>,
    /// Mirror of the persistent slot hashes; 0 marks an empty slot.
    pub hashes: [u8; LEAF_KEYS],
    /// Mirror of the slot keys; meaningful only where `hashes` is nonzero.
    pub keys: Vec<Vec<u8>>,
    /// The pool leaf this descriptor fronts.
    pub leaf: POff,
}

impl LeafDesc {
    pub fn empty(leaf: POff) -> Self {
        Self {
            parent: None,
            hashes: [0u8; LEAF_KEYS],
            keys: vec![Vec::new(); LEAF_KEYS],
            leaf,
        }
    }

    /// Builds the mirror of the persistent leaf at `off`.
    pub fn mirror(pool: &Pool, off: POff) -> Result<Self> {
        let mut desc = Self::empty(off);
        let leaf = Leaf::read(pool, off)?;

        for i in 0..LEAF_KEYS {
            let slot = leaf.slot(i);
            if slot.is_empty() {
                continue;
            }
            desc.hashes[i] = slot.hash();
            desc.keys[i] = slot_key(pool, slot)?.to_vec();
        }

        Ok(desc)
    }

    pub fn occupied(&self) -> usize {
        self.hashes.iter().filter(|&&h| h != 0).count()
    }

    pub fn is_unoccupied(&self) -> bool {
        self.hashes.iter().all(|&h| h == 0)
    }

    /// Lexicographically largest key present, if any.
    pub fn max_key(&self) -> Option<&[u8]> {
        (0..LEAF_KEYS)
            .filter(|&i| self.hashes[i] != 0)
            .map(|i| self.keys[i].as_slice())
            .max()
    }
}

/// Volatile inner node: separators plus children.
#[derive(Debug)]
pub struct Inner {
    pub parent: Option<NodeId>,
    pub keys: SmallVec<[Vec<u8>; INNER_KEYS + 1]>,
    pub children: SmallVec<[NodeId; INNER_KEYS + 2]>,
}

#[derive(Debug)]
pub enum Node {
    Inner(Inner),
    Leaf(LeafDesc),
}

impl Node {
    pub fn parent(&self) -> Option<NodeId> {
        match self {
            Node::Inner(inner) => inner.parent,
            Node::Leaf(desc) => desc.parent,
        }
    }

    pub fn set_parent(&mut self, parent: Option<NodeId>) {
        match self {
            Node::Inner(inner) => inner.parent = parent,
            Node::Leaf(desc) => desc.parent = parent,
        }
    }

    pub fn is_leaf(&self) -> bool {
        matches!(self, Node::Leaf(_))
    }
}

/// Owner of every volatile node. Nodes are only ever freed wholesale, when
/// the arena drops at shutdown (or when recovery rebuilds from scratch).
#[derive(Debug, Default)]
pub struct Arena {
    nodes: Vec<Node>,
}

impl Arena {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, node: Node) -> NodeId {
        let id = NodeId(self.nodes.len() as u32);
        self.nodes.push(node);
        id
    }

    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id.index()]
    }

    pub fn node_mut(&mut self, id: NodeId) -> &mut Node {
        &mut self.nodes[id.index()]
    }

    pub fn leaf(&self, id: NodeId) -> Result<&LeafDesc> {
        match self.node(id) {
            Node::Leaf(desc) => Ok(desc),
            Node::Inner(_) => bail!("node {:?} is an inner node, expected a leaf descriptor", id),
        }
    }

    pub fn leaf_mut(&mut self, id: NodeId) -> Result<&mut LeafDesc> {
        match self.node_mut(id) {
            Node::Leaf(desc) => Ok(desc),
            Node::Inner(_) => bail!("node {:?} is an inner node, expected a leaf descriptor", id),
        }
    }

    pub fn inner(&self, id: NodeId) -> Result<&Inner> {
        match self.node(id) {
            Node::Inner(inner) => Ok(inner),
            Node::Leaf(_) => bail!("node {:?} is a leaf descriptor, expected an inner node", id),
        }
    }

    pub fn inner_mut(&mut self, id: NodeId) -> Result<&mut Inner> {
        match self.node_mut(id) {
            Node::Inner(inner) => Ok(inner),
            Node::Leaf(_) => bail!("node {:?} is a leaf descriptor, expected an inner node", id),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Node> {
        self.nodes.iter()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use smallvec::smallvec;

    #[test]
    fn arena_ids_are_stable() {
        let mut arena = Arena::new();
        let a = arena.insert(Node::Leaf(LeafDesc::empty(POff::new(8))));
        let b = arena.insert(Node::Leaf(LeafDesc::empty(POff::new(16))));

        assert_ne!(a, b);
        assert_eq!(arena.leaf(a).unwrap().leaf, POff::new(8));
        assert_eq!(arena.leaf(b).unwrap().leaf, POff::new(16));
    }

    #[test]
    fn kind_mismatch_is_an_error() {
        let mut arena = Arena::new();
        let leaf = arena.insert(Node::Leaf(LeafDesc::empty(POff::new(8))));
        let inner = arena.insert(Node::Inner(Inner {
            parent: None,
            keys: smallvec![b"m".to_vec()],
            children: smallvec![leaf, leaf],
        }));

        assert!(arena.inner(leaf).is_err());
        assert!(arena.leaf(inner).is_err());
    }

    #[test]
    fn max_key_ignores_empty_slots() {
        let mut desc = LeafDesc::empty(POff::new(8));
        assert_eq!(desc.max_key(), None);
        assert!(desc.is_unoccupied());

        desc.hashes[7] = 1;
        desc.keys[7] = b"mmm".to_vec();
        desc.hashes[21] = 2;
        desc.keys[21] = b"zzz".to_vec();
        // A stale key string behind an empty hash must not win.
        desc.keys[40] = b"~~~~".to_vec();

        assert_eq!(desc.max_key(), Some(&b"zzz"[..]));
        assert_eq!(desc.occupied(), 2);
    }
}
