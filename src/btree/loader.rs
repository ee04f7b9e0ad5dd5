//! Bulk loading for empty trees.
//!
//! The loader takes a strictly increasing stream of values and packs
//! leaves to capacity, maintaining one in-memory "proto node" of
//! (key, child) pairs per internal level. A proto holds up to
//! `C + ceil(C/2)` entries; when it fills up, `C` of them are written
//! out as one internal node and the node's max key is promoted one
//! level up. The slack guarantees that the entries remaining at
//! finish always form valid nodes.

use std::{cell::RefCell, cmp::Ordering, convert::TryFrom, mem, rc::Rc};

use crate::{
    alloc::BlockAlloc,
    btree::{
        node::{InternalNode, LeafNode},
        tree::{RawTree, TreeDesc, TreeInner},
    },
    engine::Engine,
    Result, NIL_BLOCK,
};

#[derive(Clone, Copy, PartialEq)]
enum LoaderState {
    Loading,
    Finished,
    Discarded,
}

/// One-shot builder that fills an empty [RawTree] from a sorted
/// value stream.
pub struct RawLoader {
    tree: Rc<RefCell<TreeInner>>,
    engine: Engine,
    alloc: Rc<dyn BlockAlloc>,
    desc: TreeDesc,
    leaf_cap: usize,
    internal_cap: usize,

    leaf: Option<LeafNode>,
    leaf_count: u32,
    // per-level buffers of (max key, child block).
    protos: Vec<Vec<(Vec<u8>, u64)>>,
    first_leaf: u64,
    prev_leaf: u64,
    count: u64,
    leaves: u64,
    internals: u64,
    last_key: Option<Vec<u8>>,
    // every block produced so far, for discard.
    allocated: Vec<u64>,
    state: LoaderState,
}

impl RawTree {
    /// Start bulk loading. The tree must be empty.
    pub fn bulk_load(&self) -> Result<RawLoader> {
        let inner = self.inner.borrow();
        if inner.anchor.height != 0 {
            return err_at!(BadOperation, msg: "bulk load on non-empty tree");
        }
        Ok(RawLoader {
            tree: Rc::clone(&self.inner),
            engine: inner.engine.clone(),
            alloc: Rc::clone(&inner.alloc),
            desc: inner.desc,
            leaf_cap: inner.leaf_cap,
            internal_cap: inner.internal_cap,

            leaf: None,
            leaf_count: 0,
            protos: vec![],
            first_leaf: NIL_BLOCK,
            prev_leaf: NIL_BLOCK,
            count: 0,
            leaves: 0,
            internals: 0,
            last_key: None,
            allocated: vec![],
            state: LoaderState::Loading,
        })
    }
}

impl RawLoader {
    fn proto_cap(&self) -> usize {
        self.internal_cap + (self.internal_cap + 1) / 2
    }

    fn key_of(&self, value: &[u8]) -> Result<Vec<u8>> {
        let mut key = vec![0; self.desc.key_size];
        (self.desc.derive_key)(value, &mut key)?;
        Ok(key)
    }

    /// Append one value; its key must be strictly greater than every
    /// key inserted before.
    pub fn insert(&mut self, value: &[u8]) -> Result<()> {
        if self.state != LoaderState::Loading {
            return err_at!(BadOperation, msg: "loader already finished");
        }
        if value.len() != self.desc.value_size {
            return err_at!(BadArgument, msg: "value size {}", value.len());
        }
        let key = self.key_of(value)?;
        if let Some(last) = &self.last_key {
            if (self.desc.key_cmp)(&key, last) != Ordering::Greater {
                return err_at!(BadArgument, msg: "bulk load keys must increase strictly");
            }
        }

        if self.leaf.is_none() {
            self.leaf = Some(self.create_leaf()?);
            self.leaf_count = 0;
        }
        let leaf = self.leaf.as_ref().unwrap().clone();
        leaf.set_value(self.leaf_count, value)?;
        self.leaf_count += 1;
        self.count += 1;
        self.last_key = Some(key);

        if self.leaf_count as usize == self.leaf_cap {
            self.flush_leaf()?;
        }
        Ok(())
    }

    /// Finalize the tree: flush the partial tail, collapse the proto
    /// levels and store the anchor.
    pub fn finish(mut self) -> Result<()> {
        if self.state != LoaderState::Loading {
            return err_at!(BadOperation, msg: "loader already finished");
        }
        self.state = LoaderState::Finished;

        if self.count == 0 {
            return Ok(()); // empty stream, tree stays empty.
        }
        if self.leaf_count > 0 {
            self.flush_leaf()?;
        }

        let (root, height) = {
            let mut level = 0;
            loop {
                let is_top = level + 1 >= self.protos.len();
                if is_top && self.protos[level].len() == 1 {
                    break (self.protos[level][0].1, level as u32 + 1);
                }

                let entries = mem::take(&mut self.protos[level]);
                if entries.len() <= self.internal_cap {
                    let (key, index) = self.emit_internal(&entries)?;
                    self.add_proto(level + 1, key, index)?;
                } else {
                    // too many for one node, split evenly.
                    let half = (entries.len() + 1) / 2;
                    let (key, index) = self.emit_internal(&entries[..half])?;
                    self.add_proto(level + 1, key, index)?;
                    let (key, index) = self.emit_internal(&entries[half..])?;
                    self.add_proto(level + 1, key, index)?;
                }
                level += 1;
            }
        };

        let mut tree = self.tree.borrow_mut();
        if tree.anchor.height != 0 {
            return err_at!(BadOperation, msg: "tree mutated during bulk load");
        }
        tree.anchor.root = root;
        tree.anchor.height = height;
        tree.anchor.leftmost = self.first_leaf;
        tree.anchor.rightmost = self.prev_leaf;
        tree.anchor.size = self.count;
        tree.anchor.leaf_nodes = self.leaves;
        tree.anchor.internal_nodes = self.internals;
        tree.store_anchor()
    }

    /// Throw away everything produced so far; the tree stays empty.
    pub fn discard(mut self) -> Result<()> {
        self.discard_blocks()
    }

    fn discard_blocks(&mut self) -> Result<()> {
        if self.state == LoaderState::Loading {
            self.state = LoaderState::Discarded;
            self.leaf = None;
            for index in mem::take(&mut self.allocated).into_iter() {
                self.alloc.free(index, 1)?;
            }
        }
        Ok(())
    }

    fn create_leaf(&mut self) -> Result<LeafNode> {
        let index = self.alloc.allocate(1)?;
        self.allocated.push(index);
        let handle = self.engine.overwrite_zero(index)?;
        let leaf = LeafNode::new(handle, self.desc.value_size);
        leaf.set_prev(NIL_BLOCK)?;
        leaf.set_next(NIL_BLOCK)?;
        self.leaves += 1;
        Ok(leaf)
    }

    // Seal the current leaf: set its size, thread it into the leaf
    // chain and promote its max key.
    fn flush_leaf(&mut self) -> Result<()> {
        let leaf = match self.leaf.take() {
            Some(leaf) => leaf,
            None => return Ok(()),
        };
        leaf.set_size(self.leaf_count)?;
        leaf.set_prev(self.prev_leaf)?;
        if self.prev_leaf != NIL_BLOCK {
            let handle = self.engine.pin(self.prev_leaf, true)?;
            LeafNode::new(handle, self.desc.value_size).set_next(leaf.index())?;
        } else {
            self.first_leaf = leaf.index();
        }
        self.prev_leaf = leaf.index();

        let max_key = self.key_of(&leaf.get_value(self.leaf_count - 1)?)?;
        let index = leaf.index();
        self.leaf_count = 0;
        self.add_proto(0, max_key, index)
    }

    // Buffer a (max key, child) pair at `level`, writing out one full
    // internal node when the buffer overflows.
    fn add_proto(&mut self, level: usize, key: Vec<u8>, child: u64) -> Result<()> {
        while self.protos.len() <= level {
            self.protos.push(vec![]);
        }
        self.protos[level].push((key, child));

        if self.protos[level].len() == self.proto_cap() {
            let entries: Vec<(Vec<u8>, u64)> =
                self.protos[level].drain(..self.internal_cap).collect();
            let (key, index) = self.emit_internal(&entries)?;
            self.add_proto(level + 1, key, index)?;
        }
        Ok(())
    }

    // Write `entries` out as one internal node; returns its max key
    // and block index.
    fn emit_internal(&mut self, entries: &[(Vec<u8>, u64)]) -> Result<(Vec<u8>, u64)> {
        debug_assert!(entries.len() >= 2 && entries.len() <= self.internal_cap);

        let index = self.alloc.allocate(1)?;
        self.allocated.push(index);
        let handle = self.engine.overwrite_zero(index)?;
        let node = InternalNode::new(handle, self.desc.key_size, self.internal_cap);
        for (i, (key, child)) in entries.iter().enumerate() {
            let i = err_at!(FailConvert, u32::try_from(i))?;
            node.set_child(i, *child)?;
            if (i as usize) < entries.len() - 1 {
                node.set_key(i, key)?;
            }
        }
        node.set_child_count(err_at!(FailConvert, u32::try_from(entries.len()))?)?;
        self.internals += 1;

        let max_key = entries.last().unwrap().0.clone();
        Ok((max_key, index))
    }
}

impl Drop for RawLoader {
    fn drop(&mut self) {
        // a loader abandoned mid-way gives its blocks back.
        self.discard_blocks().ok();
    }
}

#[cfg(test)]
#[path = "loader_test.rs"]
mod loader_test;
