//! In-memory block containers used by the paging engine.
//!
//! A live block is always in the [BlockMap]. Additionally it is
//! either pinned (referenced by one or more handles) or linked into
//! the [BlockCache] of unpinned blocks, never both. Dirty blocks are
//! indexed by the [DirtySet] until written back. Buffers of evicted
//! blocks return to the [BlockPool] for reuse.

use std::{
    cell::{Cell, RefCell},
    collections::{BTreeMap, BTreeSet, HashMap},
    rc::Rc,
};

/// One block loaded from disk into memory.
pub struct Block {
    index: u64,
    data: RefCell<Vec<u8>>,
    pins: Cell<u32>,
    dirty: Cell<bool>,
}

impl Block {
    pub fn new(index: u64, buf: Vec<u8>) -> Block {
        Block {
            index,
            data: RefCell::new(buf),
            pins: Cell::new(0),
            dirty: Cell::new(false),
        }
    }

    #[inline]
    pub fn to_index(&self) -> u64 {
        self.index
    }

    #[inline]
    pub fn as_data(&self) -> &RefCell<Vec<u8>> {
        &self.data
    }

    #[inline]
    pub fn is_pinned(&self) -> bool {
        self.pins.get() > 0
    }

    #[inline]
    pub fn to_pins(&self) -> u32 {
        self.pins.get()
    }

    #[inline]
    pub fn incr_pin(&self) {
        self.pins.set(self.pins.get() + 1);
    }

    #[inline]
    pub fn decr_pin(&self) {
        debug_assert!(self.pins.get() > 0);
        self.pins.set(self.pins.get() - 1);
    }

    #[inline]
    pub fn is_dirty(&self) -> bool {
        self.dirty.get()
    }

    /// Take the buffer back, for recycling through the pool.
    pub fn into_data(self) -> Vec<u8> {
        self.data.into_inner()
    }

    #[inline]
    pub fn set_dirty(&self, dirty: bool) {
        self.dirty.set(dirty);
    }
}

/// Index of all live block instances, by block index.
#[derive(Default)]
pub struct BlockMap {
    map: HashMap<u64, Rc<Block>>,
}

impl BlockMap {
    pub fn insert(&mut self, blk: Rc<Block>) {
        let prev = self.map.insert(blk.to_index(), blk);
        debug_assert!(prev.is_none(), "block index must be unique");
    }

    pub fn remove(&mut self, index: u64) -> Option<Rc<Block>> {
        self.map.remove(&index)
    }

    pub fn find(&self, index: u64) -> Option<Rc<Block>> {
        self.map.get(&index).map(Rc::clone)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn indices(&self) -> Vec<u64> {
        self.map.keys().copied().collect()
    }
}

/// LRU list of unpinned clean/dirty blocks, most recently used last.
///
/// Implemented as a pair of maps over a monotonic age counter; the
/// single-threaded engine never needs anything fancier.
#[derive(Default)]
pub struct BlockCache {
    seq: u64,
    by_age: BTreeMap<u64, u64>,   // age -> block index, oldest first
    by_index: HashMap<u64, u64>,  // block index -> age
}

impl BlockCache {
    pub fn add(&mut self, index: u64) {
        debug_assert!(!self.by_index.contains_key(&index));
        let age = self.seq;
        self.seq += 1;
        self.by_age.insert(age, index);
        self.by_index.insert(index, age);
    }

    /// Remove the block from the cache, true if it was cached.
    pub fn remove(&mut self, index: u64) -> bool {
        match self.by_index.remove(&index) {
            Some(age) => {
                self.by_age.remove(&age);
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, index: u64) -> bool {
        self.by_index.contains_key(&index)
    }

    /// Next eviction victim, the least recently used block.
    pub fn lru_candidate(&self) -> Option<u64> {
        self.by_age.values().next().copied()
    }

    pub fn len(&self) -> usize {
        self.by_index.len()
    }

    pub fn clear(&mut self) {
        self.by_age.clear();
        self.by_index.clear();
    }
}

/// Ordered set of dirty block indices. Flushing in index order keeps
/// the write pattern sequential.
#[derive(Default)]
pub struct DirtySet {
    set: BTreeSet<u64>,
}

impl DirtySet {
    pub fn add(&mut self, index: u64) {
        self.set.insert(index);
    }

    pub fn remove(&mut self, index: u64) -> bool {
        self.set.remove(&index)
    }

    pub fn contains(&self, index: u64) -> bool {
        self.set.contains(&index)
    }

    pub fn indices(&self) -> Vec<u64> {
        self.set.iter().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.set.len()
    }
}

/// Bounded pool of reusable block buffers, avoids heap churn when
/// blocks move in and out of memory.
pub struct BlockPool {
    buffers: Vec<Vec<u8>>,
    max: usize,
}

impl BlockPool {
    pub fn new(max: usize) -> BlockPool {
        BlockPool {
            buffers: Vec::new(),
            max,
        }
    }

    /// Take a buffer from the pool, or allocate a fresh one of
    /// `block_size` bytes.
    pub fn acquire(&mut self, block_size: usize) -> Vec<u8> {
        match self.buffers.pop() {
            Some(buf) => buf,
            None => vec![0; block_size],
        }
    }

    /// Return a buffer for future use. Buffers beyond the bound are
    /// dropped.
    pub fn release(&mut self, buf: Vec<u8>) {
        if self.buffers.len() < self.max {
            self.buffers.push(buf);
        }
    }

    pub fn len(&self) -> usize {
        self.buffers.len()
    }
}

#[cfg(test)]
#[path = "block_test.rs"]
mod block_test;
