//! Core of the B+ tree: descent, preemptive splits, bottom-up
//! deletion and cursor maintenance.
//!
//! Every structural change rewrites the registered cursors so that
//! they keep pointing at the same logical value. The alternative,
//! invalidating cursors and re-seeking by key, would make iteration
//! under modification quadratic.

use log::info;

use std::{
    cell::RefCell,
    cmp::Ordering,
    rc::{Rc, Weak},
};

use crate::{
    alloc::BlockAlloc,
    anchor::AnchorCell,
    btree::node::{self, InternalNode, LeafNode},
    codec::Codec,
    engine::Engine,
    Result, NIL_BLOCK,
};

/// Largest supported key size in bytes. Key buffers are stack
/// allocated.
pub const MAX_KEY_SIZE: usize = 256;

pub(crate) const INVALID: u8 = 1;
pub(crate) const DELETED: u8 = 2;
pub(crate) const INPROGRESS: u8 = 4;

type KeyBuf = [u8; MAX_KEY_SIZE];

/// Runtime description of the values stored in a raw tree.
#[derive(Clone, Copy)]
pub struct TreeDesc {
    /// Serialized size of one value.
    pub value_size: usize,
    /// Serialized size of one derived key.
    pub key_size: usize,
    /// Extract the key of `value` into the provided buffer, which is
    /// at least `key_size` bytes long. A value that cannot be decoded
    /// is on-disk corruption and shall fail with
    /// [crate::Error::Corruption].
    pub derive_key: fn(value: &[u8], key: &mut [u8]) -> Result<()>,
    /// Total order over serialized keys.
    pub key_cmp: fn(&[u8], &[u8]) -> Ordering,
}

/// Persistent anchor of a B+ tree.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Anchor {
    pub root: u64,
    pub leftmost: u64,
    pub rightmost: u64,
    /// 0 empty, 1 the root is a leaf, otherwise the root is internal.
    pub height: u32,
    /// Number of values in the tree.
    pub size: u64,
    pub leaf_nodes: u64,
    pub internal_nodes: u64,
}

impl Default for Anchor {
    fn default() -> Anchor {
        Anchor {
            root: NIL_BLOCK,
            leftmost: NIL_BLOCK,
            rightmost: NIL_BLOCK,
            height: 0,
            size: 0,
            leaf_nodes: 0,
            internal_nodes: 0,
        }
    }
}

impl Codec for Anchor {
    const SIZE: usize = 52;

    fn encode(&self, buf: &mut [u8]) {
        self.root.encode(buf);
        self.leftmost.encode(&mut buf[8..]);
        self.rightmost.encode(&mut buf[16..]);
        self.height.encode(&mut buf[24..]);
        self.size.encode(&mut buf[28..]);
        self.leaf_nodes.encode(&mut buf[36..]);
        self.internal_nodes.encode(&mut buf[44..]);
    }

    fn decode(buf: &[u8]) -> Result<Self> {
        Ok(Anchor {
            root: u64::decode(buf)?,
            leftmost: u64::decode(&buf[8..])?,
            rightmost: u64::decode(&buf[16..])?,
            height: u32::decode(&buf[24..])?,
            size: u64::decode(&buf[28..])?,
            leaf_nodes: u64::decode(&buf[36..])?,
            internal_nodes: u64::decode(&buf[44..])?,
        })
    }
}

// Path of a cursor from the root to its current value: one
// (block, child index) pair per internal level, then the leaf and
// the value index within it.
pub(crate) struct CursorState {
    pub(crate) parents: Vec<(u64, u32)>,
    pub(crate) leaf: u64,
    pub(crate) index: u32,
    pub(crate) flags: u8,
}

impl CursorState {
    pub(crate) fn new_invalid() -> CursorState {
        CursorState {
            parents: vec![],
            leaf: NIL_BLOCK,
            index: 0,
            flags: INVALID,
        }
    }

    fn reset_to_zero(&mut self) {
        self.parents.clear();
        self.leaf = NIL_BLOCK;
        self.index = 0;
        self.flags = 0;
    }

    pub(crate) fn reset_to_invalid(&mut self, keep: u8) {
        self.reset_to_zero();
        self.flags = keep | INVALID;
    }
}

pub(crate) struct TreeInner {
    pub(crate) engine: Engine,
    pub(crate) alloc: Rc<dyn BlockAlloc>,
    cell: AnchorCell<Anchor>,
    pub(crate) anchor: Anchor,
    pub(crate) desc: TreeDesc,
    pub(crate) leaf_cap: usize,
    pub(crate) internal_cap: usize,
    cursors: Vec<Weak<RefCell<CursorState>>>,
}

/// Ordered index over fixed-size values, keyed by a fixed-size key
/// derived from each value. Runtime-sized flavour; the statically
/// typed [crate::btree::Tree] wraps it.
pub struct RawTree {
    pub(crate) inner: Rc<RefCell<TreeInner>>,
}

impl Clone for RawTree {
    fn clone(&self) -> RawTree {
        RawTree {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl RawTree {
    /// Set up a fresh, empty tree and store its anchor.
    pub fn create(
        engine: Engine,
        alloc: Rc<dyn BlockAlloc>,
        cell: AnchorCell<Anchor>,
        desc: TreeDesc,
    ) -> Result<RawTree> {
        let inner = TreeInner::new(engine, alloc, cell, desc)?;
        inner.cell.store(&inner.anchor)?;
        info!(
            target: "btree ",
            "created tree, value-size {}, key-size {}, leaf-cap {}, fanout {}",
            desc.value_size, desc.key_size, inner.leaf_cap, inner.internal_cap
        );
        Ok(RawTree {
            inner: Rc::new(RefCell::new(inner)),
        })
    }

    /// Reconstruct a tree from its anchor.
    pub fn load(
        engine: Engine,
        alloc: Rc<dyn BlockAlloc>,
        cell: AnchorCell<Anchor>,
        desc: TreeDesc,
    ) -> Result<RawTree> {
        let mut inner = TreeInner::new(engine, alloc, cell, desc)?;
        inner.anchor = inner.cell.fetch()?;
        Ok(RawTree {
            inner: Rc::new(RefCell::new(inner)),
        })
    }

    pub fn len(&self) -> u64 {
        self.inner.borrow().anchor.size
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn height(&self) -> u32 {
        self.inner.borrow().anchor.height
    }

    pub fn leaf_capacity(&self) -> usize {
        self.inner.borrow().leaf_cap
    }

    pub fn internal_max_children(&self) -> usize {
        self.inner.borrow().internal_cap
    }

    pub fn to_anchor(&self) -> Anchor {
        self.inner.borrow().anchor
    }

    /// Free every node and reset the tree to empty. All cursors are
    /// invalidated.
    pub fn clear(&self) -> Result<()> {
        self.inner.borrow_mut().clear()
    }

    /// Walk the whole tree checking the structural invariants.
    pub fn validate(&self) -> Result<()> {
        self.inner.borrow_mut().validate()
    }
}

impl TreeInner {
    fn new(
        engine: Engine,
        alloc: Rc<dyn BlockAlloc>,
        cell: AnchorCell<Anchor>,
        desc: TreeDesc,
    ) -> Result<TreeInner> {
        if desc.value_size == 0 {
            return err_at!(BadArgument, msg: "zero value size");
        }
        if desc.key_size == 0 || desc.key_size > MAX_KEY_SIZE {
            return err_at!(BadArgument, msg: "key size {}", desc.key_size);
        }

        let block_size = engine.block_size();
        let leaf_cap = node::leaf_capacity(block_size, desc.value_size);
        let internal_cap = node::internal_max_children(block_size, desc.key_size);
        if leaf_cap < 2 {
            return err_at!(BadArgument, msg: "block too small for 2 values per leaf");
        }
        if internal_cap < 4 {
            return err_at!(BadArgument, msg: "block too small for 4 children per node");
        }

        Ok(TreeInner {
            engine,
            alloc,
            cell,
            anchor: Anchor::default(),
            desc,
            leaf_cap,
            internal_cap,
            cursors: vec![],
        })
    }

    #[inline]
    fn leaf_min(&self) -> usize {
        (self.leaf_cap + 1) / 2
    }

    #[inline]
    fn internal_min(&self) -> usize {
        (self.internal_cap + 1) / 2
    }

    pub(crate) fn store_anchor(&self) -> Result<()> {
        self.cell.store(&self.anchor)
    }

    pub(crate) fn register_cursor(&mut self, state: &Rc<RefCell<CursorState>>) {
        self.cursors.push(Rc::downgrade(state));
    }

    // Apply `f` to every live cursor, pruning dead ones. `is_acting`
    // tells the closure whether the state belongs to the cursor that
    // initiated the current operation.
    fn update_cursors<F>(&mut self, acting: Option<&Rc<RefCell<CursorState>>>, mut f: F)
    where
        F: FnMut(bool, &mut CursorState),
    {
        self.cursors.retain(|weak| match weak.upgrade() {
            Some(rc) => {
                let is_acting = match acting {
                    Some(a) => Rc::ptr_eq(a, &rc),
                    None => false,
                };
                f(is_acting, &mut rc.borrow_mut());
                true
            }
            None => false,
        });
    }

    pub(crate) fn read_leaf(&self, index: u64) -> Result<LeafNode> {
        let handle = self.engine.pin(index, true)?;
        Ok(LeafNode::new(handle, self.desc.value_size))
    }

    pub(crate) fn read_internal(&self, index: u64) -> Result<InternalNode> {
        let handle = self.engine.pin(index, true)?;
        Ok(InternalNode::new(handle, self.desc.key_size, self.internal_cap))
    }

    pub(crate) fn create_leaf(&mut self) -> Result<LeafNode> {
        let index = self.alloc.allocate(1)?;
        let handle = self.engine.overwrite_zero(index)?;
        let leaf = LeafNode::new(handle, self.desc.value_size);
        leaf.set_prev(NIL_BLOCK)?;
        leaf.set_next(NIL_BLOCK)?;
        self.anchor.leaf_nodes += 1;
        Ok(leaf)
    }

    pub(crate) fn create_internal(&mut self) -> Result<InternalNode> {
        let index = self.alloc.allocate(1)?;
        let handle = self.engine.overwrite_zero(index)?;
        self.anchor.internal_nodes += 1;
        Ok(InternalNode::new(handle, self.desc.key_size, self.internal_cap))
    }

    fn free_leaf(&mut self, index: u64) -> Result<()> {
        self.alloc.free(index, 1)?;
        self.anchor.leaf_nodes -= 1;
        Ok(())
    }

    fn free_internal(&mut self, index: u64) -> Result<()> {
        self.alloc.free(index, 1)?;
        self.anchor.internal_nodes -= 1;
        Ok(())
    }

    pub(crate) fn key_of(&self, value: &[u8]) -> Result<KeyBuf> {
        let mut buf = [0; MAX_KEY_SIZE];
        (self.desc.derive_key)(value, &mut buf[..self.desc.key_size])?;
        Ok(buf)
    }

    #[inline]
    fn cmp(&self, a: &[u8], b: &[u8]) -> Ordering {
        (self.desc.key_cmp)(&a[..self.desc.key_size], &b[..self.desc.key_size])
    }

    fn key_equal(&self, a: &[u8], b: &[u8]) -> bool {
        self.cmp(a, b) == Ordering::Equal
    }

    // Index of the first value whose key is >= `key`, or the leaf
    // size.
    fn lower_bound_leaf(&self, leaf: &LeafNode, key: &[u8]) -> Result<u32> {
        let (mut lo, mut hi) = (0, leaf.get_size()?);
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            let probe = self.key_of(&leaf.get_value(mid)?)?;
            if self.cmp(&probe, key) == Ordering::Less {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        Ok(lo)
    }

    // Index of the first value whose key is > `key`, or the leaf
    // size.
    fn upper_bound_leaf(&self, leaf: &LeafNode, key: &[u8]) -> Result<u32> {
        let (mut lo, mut hi) = (0, leaf.get_size()?);
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            let probe = self.key_of(&leaf.get_value(mid)?)?;
            if self.cmp(&probe, key) == Ordering::Greater {
                hi = mid;
            } else {
                lo = mid + 1;
            }
        }
        Ok(lo)
    }

    // Child to descend into: the first child whose separator is
    // >= `key`, or the last child.
    fn lower_bound_internal(&self, internal: &InternalNode, key: &[u8]) -> Result<u32> {
        let keys = internal.get_child_count()? - 1;
        let (mut lo, mut hi) = (0, keys);
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            let probe = internal.get_key(mid)?;
            if self.cmp(&probe, key) == Ordering::Less {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        Ok(lo)
    }

    // Same with a strict bound.
    fn upper_bound_internal(&self, internal: &InternalNode, key: &[u8]) -> Result<u32> {
        let keys = internal.get_child_count()? - 1;
        let (mut lo, mut hi) = (0, keys);
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            let probe = internal.get_key(mid)?;
            if self.cmp(&probe, key) == Ordering::Greater {
                hi = mid;
            } else {
                lo = mid + 1;
            }
        }
        Ok(lo)
    }
}

// Seeks and cursor movement.
#[derive(Clone, Copy, PartialEq)]
pub(crate) enum SeekBound {
    Lower,
    Upper,
    Find,
}

impl TreeInner {
    pub(crate) fn seek_min(&mut self, state: &Rc<RefCell<CursorState>>) -> Result<bool> {
        self.seek_edge(state, false)
    }

    pub(crate) fn seek_max(&mut self, state: &Rc<RefCell<CursorState>>) -> Result<bool> {
        self.seek_edge(state, true)
    }

    fn seek_edge(&mut self, state: &Rc<RefCell<CursorState>>, max: bool) -> Result<bool> {
        state.borrow_mut().reset_to_zero();
        if self.anchor.height == 0 {
            state.borrow_mut().reset_to_invalid(0);
            return Ok(false);
        }

        let mut parents = vec![];
        let mut current = self.anchor.root;
        for _level in 1..self.anchor.height {
            let internal = self.read_internal(current)?;
            let idx = if max { internal.get_child_count()? - 1 } else { 0 };
            parents.push((current, idx));
            current = internal.get_child(idx)?;
        }
        let leaf = self.read_leaf(current)?;
        let index = if max { leaf.get_size()? - 1 } else { 0 };

        let mut st = state.borrow_mut();
        st.parents = parents;
        st.leaf = current;
        st.index = index;
        Ok(true)
    }

    pub(crate) fn seek_bound(
        &mut self,
        which: SeekBound,
        key: &[u8],
        state: &Rc<RefCell<CursorState>>,
    ) -> Result<()> {
        state.borrow_mut().reset_to_zero();
        if self.anchor.height == 0 {
            state.borrow_mut().reset_to_invalid(0);
            return Ok(());
        }
        state.borrow_mut().flags |= INPROGRESS;

        let mut parents = vec![];
        let mut current = self.anchor.root;
        for _level in 1..self.anchor.height {
            let internal = self.read_internal(current)?;
            let idx = match which {
                SeekBound::Upper => self.upper_bound_internal(&internal, key)?,
                _ => self.lower_bound_internal(&internal, key)?,
            };
            parents.push((current, idx));
            current = internal.get_child(idx)?;
        }
        let leaf = self.read_leaf(current)?;
        let index = match which {
            SeekBound::Upper => self.upper_bound_leaf(&leaf, key)?,
            _ => self.lower_bound_leaf(&leaf, key)?,
        };
        let size = leaf.get_size()?;
        {
            let mut st = state.borrow_mut();
            st.parents = parents;
            st.leaf = current;
            st.index = index;
        }

        if index == size {
            match which {
                // Parent keys in the upper levels might be stale
                // upper bounds, the sought value can sit in the next
                // leaf.
                SeekBound::Lower | SeekBound::Upper => {
                    if !self.next_leaf_state(state)? {
                        state.borrow_mut().reset_to_invalid(0);
                        return Ok(());
                    }
                    state.borrow_mut().index = 0;
                }
                // A plain find must fail here.
                SeekBound::Find => {
                    state.borrow_mut().reset_to_invalid(0);
                    return Ok(());
                }
            }
        }
        state.borrow_mut().flags &= !INPROGRESS;
        Ok(())
    }

    pub(crate) fn find(&mut self, key: &[u8], state: &Rc<RefCell<CursorState>>) -> Result<()> {
        self.seek_bound(SeekBound::Find, key, state)?;
        if state.borrow().flags & INVALID != 0 {
            return Ok(());
        }
        let (leaf_idx, index) = {
            let st = state.borrow();
            (st.leaf, st.index)
        };
        let leaf = self.read_leaf(leaf_idx)?;
        let probe = self.key_of(&leaf.get_value(index)?)?;
        if !self.key_equal(&probe, key) {
            state.borrow_mut().reset_to_invalid(0);
        }
        Ok(())
    }

    // Move the cursor's path to the next leaf, in key order. Returns
    // false at the last leaf.
    fn next_leaf_state(&mut self, state: &Rc<RefCell<CursorState>>) -> Result<bool> {
        let mut parents = state.borrow().parents.clone();

        let mut pos = None;
        for i in (0..parents.len()).rev() {
            let (blk, idx) = parents[i];
            let internal = self.read_internal(blk)?;
            if idx + 1 < internal.get_child_count()? {
                pos = Some(i);
                break;
            }
        }
        let pos = match pos {
            Some(pos) => pos,
            None => return Ok(false),
        };

        parents[pos].1 += 1;
        let internal = self.read_internal(parents[pos].0)?;
        let mut child = internal.get_child(parents[pos].1)?;
        for entry in parents.iter_mut().skip(pos + 1) {
            *entry = (child, 0);
            let internal = self.read_internal(child)?;
            child = internal.get_child(0)?;
        }

        let mut st = state.borrow_mut();
        st.parents = parents;
        st.leaf = child;
        Ok(true)
    }

    // Move the cursor's path to the previous leaf. Returns false at
    // the first leaf.
    fn prev_leaf_state(&mut self, state: &Rc<RefCell<CursorState>>) -> Result<bool> {
        let mut parents = state.borrow().parents.clone();

        let mut pos = None;
        for i in (0..parents.len()).rev() {
            if parents[i].1 > 0 {
                pos = Some(i);
                break;
            }
        }
        let pos = match pos {
            Some(pos) => pos,
            None => return Ok(false),
        };

        parents[pos].1 -= 1;
        let internal = self.read_internal(parents[pos].0)?;
        let mut child = internal.get_child(parents[pos].1)?;
        for entry in parents.iter_mut().skip(pos + 1) {
            let internal = self.read_internal(child)?;
            let count = internal.get_child_count()?;
            *entry = (child, count - 1);
            child = internal.get_child(count - 1)?;
        }

        let mut st = state.borrow_mut();
        st.parents = parents;
        st.leaf = child;
        Ok(true)
    }

    pub(crate) fn move_next(&mut self, state: &Rc<RefCell<CursorState>>) -> Result<bool> {
        {
            let mut st = state.borrow_mut();
            if st.flags & DELETED != 0 {
                // the erase already "moved" the cursor one step.
                st.flags &= !DELETED;
                if st.flags & INVALID != 0 {
                    return Ok(false);
                }
            } else if st.flags & INVALID != 0 {
                return err_at!(BadCursor, msg: "move_next on invalid cursor");
            } else {
                st.index += 1;
            }
        }

        let (leaf_idx, index) = {
            let st = state.borrow();
            (st.leaf, st.index)
        };
        let leaf = self.read_leaf(leaf_idx)?;
        if index >= leaf.get_size()? {
            if !self.next_leaf_state(state)? {
                state.borrow_mut().reset_to_invalid(0);
                return Ok(false);
            }
            state.borrow_mut().index = 0;
        }
        Ok(true)
    }

    pub(crate) fn move_prev(&mut self, state: &Rc<RefCell<CursorState>>) -> Result<bool> {
        {
            let mut st = state.borrow_mut();
            if st.flags & DELETED != 0 {
                st.flags &= !DELETED;
                if st.flags & INVALID != 0 {
                    return Ok(false);
                }
            } else if st.flags & INVALID != 0 {
                return err_at!(BadCursor, msg: "move_prev on invalid cursor");
            }
        }

        let index = state.borrow().index;
        if index == 0 {
            if !self.prev_leaf_state(state)? {
                state.borrow_mut().reset_to_invalid(0);
                return Ok(false);
            }
            let leaf_idx = state.borrow().leaf;
            let leaf = self.read_leaf(leaf_idx)?;
            state.borrow_mut().index = leaf.get_size()? - 1;
        } else {
            state.borrow_mut().index = index - 1;
        }
        Ok(true)
    }

    pub(crate) fn cursor_get(&mut self, state: &Rc<RefCell<CursorState>>) -> Result<Vec<u8>> {
        let (flags, leaf_idx, index) = {
            let st = state.borrow();
            (st.flags, st.leaf, st.index)
        };
        if flags & (INVALID | DELETED) != 0 {
            return err_at!(BadCursor, msg: "cursor does not point at a value");
        }
        let leaf = self.read_leaf(leaf_idx)?;
        leaf.get_value(index)
    }

    /// Overwrite the current value. The new value must derive the
    /// same key as the old one.
    pub(crate) fn cursor_set(
        &mut self,
        state: &Rc<RefCell<CursorState>>,
        value: &[u8],
    ) -> Result<()> {
        if value.len() != self.desc.value_size {
            return err_at!(BadArgument, msg: "value size {}", value.len());
        }
        let old = self.cursor_get(state)?;
        let (old_key, new_key) = (self.key_of(&old)?, self.key_of(value)?);
        if !self.key_equal(&old_key, &new_key) {
            return err_at!(BadArgument, msg: "set() must not change the key");
        }
        let (leaf_idx, index) = {
            let st = state.borrow();
            (st.leaf, st.index)
        };
        self.read_leaf(leaf_idx)?.set_value(index, value)
    }
}

// Insertion.
impl TreeInner {
    pub(crate) fn insert(
        &mut self,
        value: &[u8],
        overwrite: bool,
        acting: &Rc<RefCell<CursorState>>,
    ) -> Result<bool> {
        if value.len() != self.desc.value_size {
            return err_at!(BadArgument, msg: "value size {}", value.len());
        }

        if self.anchor.height == 0 {
            let leaf = self.create_leaf()?;
            leaf.set_value(0, value)?;
            leaf.set_size(1)?;

            self.anchor.height = 1;
            self.anchor.size = 1;
            self.anchor.root = leaf.index();
            self.anchor.leftmost = leaf.index();
            self.anchor.rightmost = leaf.index();
            self.store_anchor()?;

            let mut st = acting.borrow_mut();
            st.reset_to_zero();
            st.leaf = leaf.index();
            st.index = 0;
            return Ok(true);
        }

        {
            let mut st = acting.borrow_mut();
            st.reset_to_zero();
            st.flags |= INPROGRESS;
        }

        let key = self.key_of(value)?;
        self.seek_insert_location(&key, acting)?;

        let (leaf_idx, insert_index) = {
            let st = acting.borrow();
            (st.leaf, st.index)
        };
        let leaf = self.read_leaf(leaf_idx)?;
        let leaf_size = leaf.get_size()?;

        if insert_index < leaf_size {
            let probe = self.key_of(&leaf.get_value(insert_index)?)?;
            if self.key_equal(&probe, &key) {
                if overwrite {
                    leaf.set_value(insert_index, value)?;
                }
                acting.borrow_mut().flags &= !INPROGRESS;
                return Ok(false);
            }
        }

        if (leaf_size as usize) < self.leaf_cap {
            leaf.insert_nonfull(insert_index, value)?;
            self.update_cursors(Some(acting), |is_acting, st| {
                if st.flags & INVALID != 0 || st.leaf != leaf_idx {
                    return;
                }
                if !is_acting && st.index >= insert_index {
                    st.index += 1;
                }
            });
        } else {
            self.insert_split_leaf(value, insert_index, &leaf, acting)?;
        }

        acting.borrow_mut().flags &= !INPROGRESS;
        self.anchor.size += 1;
        self.store_anchor()?;
        Ok(true)
    }

    fn insert_split_leaf(
        &mut self,
        value: &[u8],
        insert_index: u32,
        leaf: &LeafNode,
        acting: &Rc<RefCell<CursorState>>,
    ) -> Result<()> {
        let leaf_idx = leaf.index();
        let leaf_size = leaf.get_size()?;
        let new_leaf = self.create_leaf()?;
        let new_leaf_idx = new_leaf.index();

        // Split point: the rightmost leaf keeps everything (pure
        // appends degrade into one-value splits on the far right),
        // the leftmost keeps one, everyone else splits evenly.
        let left_size: u32 = if leaf_idx == self.anchor.rightmost {
            leaf_size
        } else if leaf_idx == self.anchor.leftmost {
            1
        } else {
            (leaf_size + 2) / 2
        };

        leaf.insert_full(insert_index, value, left_size, &new_leaf)?;

        // thread the new sibling into the leaf list.
        let old_next = leaf.get_next()?;
        new_leaf.set_next(old_next)?;
        new_leaf.set_prev(leaf_idx)?;
        leaf.set_next(new_leaf_idx)?;
        if old_next != NIL_BLOCK {
            self.read_leaf(old_next)?.set_prev(new_leaf_idx)?;
        }

        let split_key = self.key_of(&leaf.get_value(left_size - 1)?)?;
        if leaf_idx == self.anchor.rightmost {
            self.anchor.rightmost = new_leaf_idx;
        }

        if self.anchor.height == 1 {
            // the root leaf split, grow by one level.
            let new_root = self.create_internal()?;
            new_root.set_child(0, leaf_idx)?;
            new_root.set_child(1, new_leaf_idx)?;
            new_root.set_key(0, &split_key[..self.desc.key_size])?;
            new_root.set_child_count(2)?;
            let new_root_idx = new_root.index();
            self.anchor.root = new_root_idx;
            self.anchor.height = 2;

            self.update_cursors(Some(acting), |is_acting, st| {
                if st.flags & INVALID != 0 {
                    return;
                }
                if !is_acting && st.index >= insert_index {
                    st.index += 1;
                }
                let mut entry_index = 0;
                if st.index >= left_size {
                    st.leaf = new_leaf_idx;
                    st.index -= left_size;
                    entry_index = 1;
                }
                st.parents.insert(0, (new_root_idx, entry_index));
            });
        } else {
            // the parent has room, thanks to the preparatory splits.
            let (parent_idx, index_in_parent) = *acting.borrow().parents.last().unwrap();
            let parent = self.read_internal(parent_idx)?;
            parent.insert_split_result(
                index_in_parent + 1,
                &split_key[..self.desc.key_size],
                new_leaf_idx,
            )?;

            self.update_cursors(Some(acting), |is_acting, st| {
                if st.flags & INVALID != 0 || st.parents.is_empty() {
                    return;
                }
                let last = st.parents.len() - 1;
                let (p_idx, p_index) = st.parents[last];
                if p_idx != parent_idx {
                    return;
                }
                if p_index == index_in_parent {
                    if !is_acting && st.index >= insert_index {
                        st.index += 1;
                    }
                    if st.index >= left_size {
                        st.leaf = new_leaf_idx;
                        st.index -= left_size;
                        st.parents[last].1 += 1;
                    }
                } else if p_index > index_in_parent {
                    st.parents[last].1 += 1;
                }
            });
        }
        Ok(())
    }

    // Walk down to the leaf, splitting every full internal node
    // before entering it. Afterwards the acting cursor holds the
    // insert path and its index is the lower bound within the leaf,
    // which may still be full.
    fn seek_insert_location(
        &mut self,
        key: &KeyBuf,
        acting: &Rc<RefCell<CursorState>>,
    ) -> Result<()> {
        let key = &key[..self.desc.key_size];
        let mut current = self.anchor.root;
        let mut level = self.anchor.height - 1;
        while level > 0 {
            let internal = self.read_internal(current)?;
            let idx = self.lower_bound_internal(&internal, key)?;
            acting.borrow_mut().parents.push((current, idx));

            if internal.get_child_count()? as usize == self.internal_cap {
                let new_internal = self.create_internal()?;
                let split_key = internal.split(&new_internal)?;
                let left_count = internal.get_child_count()?;
                let right_idx = new_internal.index();

                if acting.borrow().parents.len() == 1 {
                    // root split.
                    let new_root = self.create_internal()?;
                    new_root.set_child(0, current)?;
                    new_root.set_child(1, right_idx)?;
                    new_root.set_key(0, &split_key)?;
                    new_root.set_child_count(2)?;
                    let new_root_idx = new_root.index();
                    self.anchor.root = new_root_idx;
                    self.anchor.height += 1;

                    let old_root_idx = current;
                    self.update_cursors(None, |_, st| {
                        if st.flags & INVALID != 0 {
                            return;
                        }
                        debug_assert!(!st.parents.is_empty() && st.parents[0].0 == old_root_idx);
                        let mut entry_index = 0;
                        if st.parents[0].1 >= left_count {
                            st.parents[0].0 = right_idx;
                            st.parents[0].1 -= left_count;
                            entry_index = 1;
                        }
                        st.parents.insert(0, (new_root_idx, entry_index));
                    });
                } else {
                    let (parent_idx, index_in_parent) = {
                        let st = acting.borrow();
                        st.parents[st.parents.len() - 2]
                    };
                    let parent = self.read_internal(parent_idx)?;
                    parent.insert_split_result(index_in_parent + 1, &split_key, right_idx)?;

                    // stack positions of the parent and the split
                    // children, counted from the root.
                    let children_at = (self.anchor.height - 1 - level) as usize;
                    let parent_at = children_at - 1;
                    let left_idx = current;
                    self.update_cursors(None, |_, st| {
                        if st.flags & INVALID != 0 {
                            return;
                        }
                        if children_at >= st.parents.len() {
                            return;
                        }
                        let (p_idx, p_index) = st.parents[parent_at];
                        if p_idx != parent_idx {
                            return;
                        }
                        if p_index == index_in_parent {
                            let (c_idx, c_index) = st.parents[children_at];
                            debug_assert_eq!(c_idx, left_idx);
                            let _ = c_idx;
                            if c_index >= left_count {
                                st.parents[children_at] = (right_idx, c_index - left_count);
                                st.parents[parent_at].1 += 1;
                            }
                        } else if p_index > index_in_parent {
                            st.parents[parent_at].1 += 1;
                        }
                    });
                }
            }

            // re-read through the (possibly rewritten) stack entry.
            let (blk, idx) = *acting.borrow().parents.last().unwrap();
            let internal = self.read_internal(blk)?;
            current = internal.get_child(idx)?;
            level -= 1;
        }

        let leaf = self.read_leaf(current)?;
        let index = self.lower_bound_leaf(&leaf, key)?;
        let mut st = acting.borrow_mut();
        st.leaf = current;
        st.index = index;
        Ok(())
    }
}

// Deletion.
impl TreeInner {
    pub(crate) fn erase(&mut self, acting: &Rc<RefCell<CursorState>>) -> Result<()> {
        let (flags, leaf_idx, index) = {
            let st = acting.borrow();
            (st.flags, st.leaf, st.index)
        };
        if flags & (INVALID | DELETED) != 0 {
            return err_at!(BadCursor, msg: "erase on invalid cursor");
        }

        let leaf = self.read_leaf(leaf_idx)?;
        leaf.remove(index)?;
        self.anchor.size -= 1;

        self.update_cursors(None, |_, st| {
            if st.flags & INVALID != 0 || st.leaf != leaf_idx {
                return;
            }
            if st.index == index {
                st.flags |= DELETED;
            } else if st.index > index {
                st.index -= 1;
            }
        });

        let parents_len = acting.borrow().parents.len();

        // the root is a leaf.
        if parents_len == 0 {
            if leaf.get_size()? == 0 {
                self.free_leaf(leaf_idx)?;
                self.anchor.root = NIL_BLOCK;
                self.anchor.leftmost = NIL_BLOCK;
                self.anchor.rightmost = NIL_BLOCK;
                self.anchor.height = 0;
                self.update_cursors(None, |_, st| {
                    if st.flags & INVALID != 0 {
                        return;
                    }
                    let keep = st.flags & DELETED;
                    st.reset_to_invalid(keep);
                });
            }
            return self.store_anchor();
        }

        // boundary leaves are special: they give up storage only when
        // they become completely empty, which optimizes insert/erase
        // at the two ends.
        if leaf_idx == self.anchor.leftmost || leaf_idx == self.anchor.rightmost {
            if leaf.get_size()? == 0 {
                self.unlink_empty_boundary_leaf(&leaf, acting)?;
            } else if self.anchor.leaf_nodes == 2 && self.anchor.size <= self.leaf_cap as u64 {
                self.merge_last_two_leaves(&leaf, acting)?;
            }
            return self.store_anchor();
        }

        // interior leaf: rebalance when underflowing.
        if leaf.get_size()? as usize >= self.leaf_min() {
            return self.store_anchor();
        }

        let (parent_idx, index_in_parent) = *acting.borrow().parents.last().unwrap();
        let parent = self.read_internal(parent_idx)?;
        let parent_children = parent.get_child_count()?;

        let mut right = None;
        if index_in_parent + 1 < parent_children {
            let node = self.read_leaf(parent.get_child(index_in_parent + 1)?)?;
            let size = node.get_size()? as usize;
            if size > self.leaf_min() || (node.index() == self.anchor.rightmost && size > 1) {
                self.steal_leaf_right(&parent, &leaf, index_in_parent, &node)?;
                return self.store_anchor();
            }
            right = Some(node);
        }
        let mut left = None;
        if index_in_parent > 0 {
            let node = self.read_leaf(parent.get_child(index_in_parent - 1)?)?;
            let size = node.get_size()? as usize;
            if size > self.leaf_min() || (node.index() == self.anchor.leftmost && size > 1) {
                self.steal_leaf_left(&parent, &leaf, index_in_parent, &node)?;
                return self.store_anchor();
            }
            left = Some(node);
        }

        if let Some(right) = right {
            let right_idx = right.index();
            self.merge_leaf_right(&parent, &leaf, index_in_parent, &right)?;
            self.free_leaf(right_idx)?;
            self.propagate_leaf_deletion(acting, right_idx, index_in_parent + 1)?;
        } else if let Some(left) = left {
            let left_idx = left.index();
            self.merge_leaf_left(&parent, &leaf, index_in_parent, &left)?;
            self.free_leaf(left_idx)?;
            self.propagate_leaf_deletion(acting, left_idx, index_in_parent - 1)?;
        } else {
            unreachable!("interior leaf must have a neighbor");
        }
        self.store_anchor()
    }

    // An empty leftmost/rightmost leaf is unlinked; cursors parked on
    // it move to the neighbor.
    fn unlink_empty_boundary_leaf(
        &mut self,
        leaf: &LeafNode,
        acting: &Rc<RefCell<CursorState>>,
    ) -> Result<()> {
        let leaf_idx = leaf.index();
        let (parent_idx, index_in_parent) = *acting.borrow().parents.last().unwrap();
        let parent = self.read_internal(parent_idx)?;

        let leftmost = leaf_idx == self.anchor.leftmost;
        let neighbor_index = if leftmost {
            index_in_parent + 1
        } else {
            index_in_parent - 1
        };
        let neighbor = self.read_leaf(parent.get_child(neighbor_index)?)?;
        let neighbor_idx = neighbor.index();
        let index_in_neighbor = if leftmost { 0 } else { neighbor.get_size()? };

        self.update_cursors(None, |_, st| {
            if st.flags & INVALID != 0 || st.leaf != leaf_idx {
                return;
            }
            st.leaf = neighbor_idx;
            st.index = index_in_neighbor;
            if let Some(last) = st.parents.last_mut() {
                last.1 = neighbor_index;
            }
        });

        if leftmost {
            neighbor.set_prev(NIL_BLOCK)?;
            self.anchor.leftmost = neighbor_idx;
        } else {
            neighbor.set_next(NIL_BLOCK)?;
            self.anchor.rightmost = neighbor_idx;
        }
        self.free_leaf(leaf_idx)?;
        self.propagate_leaf_deletion(acting, leaf_idx, index_in_parent)
    }

    // With only two leaves left and everything fitting into one node,
    // merge them.
    fn merge_last_two_leaves(
        &mut self,
        leaf: &LeafNode,
        acting: &Rc<RefCell<CursorState>>,
    ) -> Result<()> {
        let leaf_idx = leaf.index();
        let (parent_idx, _) = *acting.borrow().parents.last().unwrap();
        let parent = self.read_internal(parent_idx)?;

        if leaf_idx == self.anchor.leftmost {
            let right = self.read_leaf(parent.get_child(1)?)?;
            let right_idx = right.index();
            self.merge_leaf_right(&parent, leaf, 0, &right)?;
            self.free_leaf(right_idx)?;
            self.propagate_leaf_deletion(acting, right_idx, 1)
        } else {
            let left = self.read_leaf(parent.get_child(0)?)?;
            let left_idx = left.index();
            self.merge_leaf_left(&parent, leaf, 1, &left)?;
            self.free_leaf(left_idx)?;
            self.propagate_leaf_deletion(acting, left_idx, 0)
        }
    }

    // Move one value from the right neighbor into `leaf`.
    fn steal_leaf_right(
        &mut self,
        parent: &InternalNode,
        leaf: &LeafNode,
        leaf_pos: u32,
        neighbor: &LeafNode,
    ) -> Result<()> {
        let (leaf_idx, neighbor_idx) = (leaf.index(), neighbor.index());
        let leaf_size = leaf.get_size()?;

        leaf.insert_nonfull(leaf_size, &neighbor.get_value(0)?)?;
        neighbor.remove(0)?;

        let key = self.key_of(&leaf.get_value(leaf_size)?)?;
        parent.set_key(leaf_pos, &key[..self.desc.key_size])?;

        self.update_cursors(None, |_, st| {
            if st.flags & INVALID != 0 || st.leaf != neighbor_idx {
                return;
            }
            if st.index == 0 {
                st.leaf = leaf_idx;
                st.index = leaf_size;
                if let Some(last) = st.parents.last_mut() {
                    last.1 -= 1;
                }
            } else {
                st.index -= 1;
            }
        });
        Ok(())
    }

    // Move one value from the left neighbor into `leaf`.
    fn steal_leaf_left(
        &mut self,
        parent: &InternalNode,
        leaf: &LeafNode,
        leaf_pos: u32,
        neighbor: &LeafNode,
    ) -> Result<()> {
        let (leaf_idx, neighbor_idx) = (leaf.index(), neighbor.index());
        let neighbor_size = neighbor.get_size()?;

        leaf.insert_nonfull(0, &neighbor.get_value(neighbor_size - 1)?)?;
        neighbor.remove(neighbor_size - 1)?;

        let key = self.key_of(&neighbor.get_value(neighbor_size - 2)?)?;
        parent.set_key(leaf_pos - 1, &key[..self.desc.key_size])?;

        self.update_cursors(None, |_, st| {
            if st.flags & INVALID != 0 {
                return;
            }
            if st.leaf == leaf_idx {
                st.index += 1;
            } else if st.leaf == neighbor_idx && st.index >= neighbor_size - 1 {
                st.leaf = leaf_idx;
                st.index -= neighbor_size - 1;
                if let Some(last) = st.parents.last_mut() {
                    last.1 += 1;
                }
            }
        });
        Ok(())
    }

    // Merge the right neighbor into `leaf`.
    fn merge_leaf_right(
        &mut self,
        parent: &InternalNode,
        leaf: &LeafNode,
        leaf_pos: u32,
        neighbor: &LeafNode,
    ) -> Result<()> {
        let (leaf_idx, neighbor_idx) = (leaf.index(), neighbor.index());
        let leaf_size = leaf.get_size()?;
        let neighbor_size = neighbor.get_size()?;
        let parent_children = parent.get_child_count()?;

        leaf.append_from_right(neighbor)?;

        let next = neighbor.get_next()?;
        leaf.set_next(next)?;
        if next != NIL_BLOCK {
            self.read_leaf(next)?.set_prev(leaf_idx)?;
        }
        if self.anchor.rightmost == neighbor_idx {
            self.anchor.rightmost = leaf_idx;
        }

        // the leaf's max value changed.
        if leaf_pos + 1 != parent_children - 1 {
            let key = self.key_of(&leaf.get_value(leaf_size + neighbor_size - 1)?)?;
            parent.set_key(leaf_pos, &key[..self.desc.key_size])?;
        }

        self.update_cursors(None, |_, st| {
            if st.flags & INVALID != 0 || st.leaf != neighbor_idx {
                return;
            }
            st.leaf = leaf_idx;
            st.index += leaf_size;
            if let Some(last) = st.parents.last_mut() {
                last.1 -= 1;
            }
        });
        Ok(())
    }

    // Merge the left neighbor into `leaf`.
    fn merge_leaf_left(
        &mut self,
        _parent: &InternalNode,
        leaf: &LeafNode,
        _leaf_pos: u32,
        neighbor: &LeafNode,
    ) -> Result<()> {
        let (leaf_idx, neighbor_idx) = (leaf.index(), neighbor.index());
        let neighbor_size = neighbor.get_size()?;

        leaf.prepend_from_left(neighbor)?;

        let prev = neighbor.get_prev()?;
        leaf.set_prev(prev)?;
        if prev != NIL_BLOCK {
            self.read_leaf(prev)?.set_next(leaf_idx)?;
        }
        if self.anchor.leftmost == neighbor_idx {
            self.anchor.leftmost = leaf_idx;
        }

        self.update_cursors(None, |_, st| {
            if st.flags & INVALID != 0 {
                return;
            }
            if st.leaf == leaf_idx {
                st.index += neighbor_size;
            } else if st.leaf == neighbor_idx {
                st.leaf = leaf_idx;
                if let Some(last) = st.parents.last_mut() {
                    last.1 += 1;
                }
            }
        });
        Ok(())
    }

    // The leaf at `child_node_index` was merged away; remove it from
    // its parent and rebalance internal nodes up the stack.
    fn propagate_leaf_deletion(
        &mut self,
        acting: &Rc<RefCell<CursorState>>,
        child_node: u64,
        child_node_index: u32,
    ) -> Result<()> {
        let mut child_node = child_node;
        let mut child_node_index = child_node_index;
        let mut stack_index = acting.borrow().parents.len() - 1;
        let mut node_idx = acting.borrow().parents[stack_index].0;

        loop {
            let node = self.read_internal(node_idx)?;
            debug_assert_eq!(node.get_child(child_node_index)?, child_node);
            node.remove_child(child_node_index)?;

            self.update_cursors(None, |_, st| {
                if st.flags & INVALID != 0 || stack_index >= st.parents.len() {
                    return;
                }
                let entry = &mut st.parents[stack_index];
                if entry.0 == node_idx && entry.1 > child_node_index {
                    entry.1 -= 1;
                }
            });

            if stack_index == 0 {
                // a root with a single child is replaced by it.
                if node.get_child_count()? == 1 {
                    self.anchor.root = node.get_child(0)?;
                    self.anchor.height -= 1;
                    self.free_internal(node_idx)?;
                    self.update_cursors(None, |_, st| {
                        if st.flags & INVALID != 0 || st.parents.is_empty() {
                            return;
                        }
                        st.parents.remove(0);
                    });
                }
                break;
            }

            if node.get_child_count()? as usize >= self.internal_min() {
                break;
            }

            let (parent_idx, index_in_parent) = acting.borrow().parents[stack_index - 1];
            let parent = self.read_internal(parent_idx)?;
            let parent_children = parent.get_child_count()?;

            let mut right = None;
            if index_in_parent + 1 < parent_children {
                let neighbor = self.read_internal(parent.get_child(index_in_parent + 1)?)?;
                if neighbor.get_child_count()? as usize > self.internal_min() {
                    self.steal_internal_right(&parent, stack_index, &node, index_in_parent, &neighbor)?;
                    break;
                }
                right = Some(neighbor);
            }
            let mut left = None;
            if index_in_parent > 0 {
                let neighbor = self.read_internal(parent.get_child(index_in_parent - 1)?)?;
                if neighbor.get_child_count()? as usize > self.internal_min() {
                    self.steal_internal_left(&parent, stack_index, &node, index_in_parent, &neighbor)?;
                    break;
                }
                left = Some(neighbor);
            }

            if let Some(neighbor) = left {
                let neighbor_idx = neighbor.index();
                self.merge_internal_left(&parent, stack_index, &node, index_in_parent, &neighbor)?;
                child_node = neighbor_idx;
                child_node_index = index_in_parent - 1;
            } else if let Some(neighbor) = right {
                let neighbor_idx = neighbor.index();
                self.merge_internal_right(
                    &parent,
                    stack_index,
                    &node,
                    index_in_parent,
                    &neighbor,
                )?;
                child_node = neighbor_idx;
                child_node_index = index_in_parent + 1;
            } else {
                unreachable!("internal node must have a neighbor");
            }

            self.free_internal(child_node)?;
            node_idx = parent_idx;
            stack_index -= 1;
        }
        Ok(())
    }

    fn steal_internal_right(
        &mut self,
        parent: &InternalNode,
        stack_index: usize,
        node: &InternalNode,
        node_pos: u32,
        neighbor: &InternalNode,
    ) -> Result<()> {
        let (node_idx, neighbor_idx) = (node.index(), neighbor.index());
        let node_children = node.get_child_count()?;

        node.append_entry(&parent.get_key(node_pos)?, neighbor.get_child(0)?)?;
        parent.set_key(node_pos, &neighbor.get_key(0)?)?;
        neighbor.remove_child(0)?;

        self.update_cursors(None, |_, st| {
            if st.flags & INVALID != 0 || stack_index >= st.parents.len() {
                return;
            }
            if st.parents[stack_index].0 != neighbor_idx {
                return;
            }
            if st.parents[stack_index].1 == 0 {
                st.parents[stack_index] = (node_idx, node_children);
                st.parents[stack_index - 1].1 -= 1;
            } else {
                st.parents[stack_index].1 -= 1;
            }
        });
        Ok(())
    }

    fn steal_internal_left(
        &mut self,
        parent: &InternalNode,
        stack_index: usize,
        node: &InternalNode,
        node_pos: u32,
        neighbor: &InternalNode,
    ) -> Result<()> {
        let (node_idx, neighbor_idx) = (node.index(), neighbor.index());
        let neighbor_children = neighbor.get_child_count()?;

        node.prepend_entry(
            &parent.get_key(node_pos - 1)?,
            neighbor.get_child(neighbor_children - 1)?,
        )?;
        parent.set_key(node_pos - 1, &neighbor.get_key(neighbor_children - 2)?)?;
        neighbor.remove_child(neighbor_children - 1)?;

        self.update_cursors(None, |_, st| {
            if st.flags & INVALID != 0 || stack_index >= st.parents.len() {
                return;
            }
            if st.parents[stack_index].0 == node_idx {
                st.parents[stack_index].1 += 1;
            } else if st.parents[stack_index].0 == neighbor_idx
                && st.parents[stack_index].1 >= neighbor_children - 1
            {
                st.parents[stack_index] = (node_idx, st.parents[stack_index].1 - (neighbor_children - 1));
                st.parents[stack_index - 1].1 += 1;
            }
        });
        Ok(())
    }

    fn merge_internal_right(
        &mut self,
        parent: &InternalNode,
        stack_index: usize,
        node: &InternalNode,
        node_pos: u32,
        neighbor: &InternalNode,
    ) -> Result<()> {
        let (node_idx, neighbor_idx) = (node.index(), neighbor.index());
        let node_children = node.get_child_count()?;
        let parent_children = parent.get_child_count()?;

        node.append_from_right(&parent.get_key(node_pos)?, neighbor)?;
        if node_pos + 1 != parent_children - 1 {
            parent.set_key(node_pos, &parent.get_key(node_pos + 1)?)?;
        }

        self.update_cursors(None, |_, st| {
            if st.flags & INVALID != 0 || stack_index >= st.parents.len() {
                return;
            }
            if st.parents[stack_index].0 == neighbor_idx {
                st.parents[stack_index] = (node_idx, st.parents[stack_index].1 + node_children);
                st.parents[stack_index - 1].1 -= 1;
            }
        });
        Ok(())
    }

    fn merge_internal_left(
        &mut self,
        parent: &InternalNode,
        stack_index: usize,
        node: &InternalNode,
        node_pos: u32,
        neighbor: &InternalNode,
    ) -> Result<()> {
        let (node_idx, neighbor_idx) = (node.index(), neighbor.index());
        let neighbor_children = neighbor.get_child_count()?;

        node.prepend_from_left(&parent.get_key(node_pos - 1)?, neighbor)?;

        self.update_cursors(None, |_, st| {
            if st.flags & INVALID != 0 || stack_index >= st.parents.len() {
                return;
            }
            if st.parents[stack_index].0 == neighbor_idx {
                st.parents[stack_index].0 = node_idx;
                st.parents[stack_index - 1].1 += 1;
            } else if st.parents[stack_index].0 == node_idx {
                st.parents[stack_index].1 += neighbor_children;
            }
        });
        Ok(())
    }
}

// Maintenance.
impl TreeInner {
    fn clear(&mut self) -> Result<()> {
        if self.anchor.height == 0 {
            return Ok(());
        }
        self.update_cursors(None, |_, st| {
            if st.flags & INVALID != 0 {
                return;
            }
            st.reset_to_invalid(DELETED);
        });

        let (old_root, old_height) = (self.anchor.root, self.anchor.height);
        self.anchor = Anchor::default();

        let mut stack = vec![(old_root, old_height - 1)];
        while let Some((index, level)) = stack.pop() {
            if level > 0 {
                let internal = self.read_internal(index)?;
                for i in 0..internal.get_child_count()? {
                    stack.push((internal.get_child(i)?, level - 1));
                }
            }
            self.alloc.free(index, 1)?;
        }
        self.store_anchor()
    }

    fn validate(&mut self) -> Result<()> {
        let anchor = self.anchor;
        if anchor.height == 0 {
            if anchor.size != 0 || anchor.leaf_nodes != 0 || anchor.internal_nodes != 0 {
                return err_at!(Corruption, msg: "empty tree with stale counters");
            }
            return Ok(());
        }

        let (values, leaves, internals) =
            self.validate_subtree(anchor.root, anchor.height - 1, None, None)?;
        if values != anchor.size || leaves != anchor.leaf_nodes || internals != anchor.internal_nodes
        {
            return err_at!(
                Corruption, msg: "counters {}/{}/{}, anchor {}/{}/{}",
                values, leaves, internals, anchor.size, anchor.leaf_nodes, anchor.internal_nodes
            );
        }

        // leaves form a doubly linked list in key order.
        let mut chained = 0;
        let mut prev = NIL_BLOCK;
        let mut current = anchor.leftmost;
        while current != NIL_BLOCK {
            let leaf = self.read_leaf(current)?;
            if leaf.get_prev()? != prev {
                return err_at!(Corruption, msg: "leaf {} bad prev link", current);
            }
            chained += 1;
            prev = current;
            current = leaf.get_next()?;
        }
        if chained != anchor.leaf_nodes || prev != anchor.rightmost {
            return err_at!(Corruption, msg: "leaf chain of {} nodes, last {}", chained, prev);
        }
        Ok(())
    }

    // Check one subtree; every key must be > `lower` and <= `upper`.
    // Returns (values, leaves, internals) below this node.
    fn validate_subtree(
        &mut self,
        index: u64,
        level: u32,
        lower: Option<Vec<u8>>,
        upper: Option<Vec<u8>>,
    ) -> Result<(u64, u64, u64)> {
        let in_bounds = |this: &TreeInner, key: &[u8]| -> bool {
            if let Some(lower) = &lower {
                if this.cmp(key, lower) != Ordering::Greater {
                    return false;
                }
            }
            if let Some(upper) = &upper {
                if this.cmp(key, upper) == Ordering::Greater {
                    return false;
                }
            }
            true
        };

        if level == 0 {
            let leaf = self.read_leaf(index)?;
            let size = leaf.get_size()?;
            if size == 0 {
                return err_at!(Corruption, msg: "empty leaf {}", index);
            }
            let boundary = index == self.anchor.leftmost || index == self.anchor.rightmost;
            if !boundary && (size as usize) < self.leaf_min() {
                return err_at!(Corruption, msg: "leaf {} underflow, {} values", index, size);
            }
            let mut prev: Option<KeyBuf> = None;
            for i in 0..size {
                let key = self.key_of(&leaf.get_value(i)?)?;
                if !in_bounds(self, &key) {
                    return err_at!(Corruption, msg: "leaf {} key out of bounds", index);
                }
                if let Some(prev) = &prev {
                    if self.cmp(prev, &key) != Ordering::Less {
                        return err_at!(Corruption, msg: "leaf {} keys out of order", index);
                    }
                }
                prev = Some(key);
            }
            return Ok((size as u64, 1, 0));
        }

        let internal = self.read_internal(index)?;
        let count = internal.get_child_count()?;
        let root = index == self.anchor.root;
        if root && count < 2 {
            return err_at!(Corruption, msg: "root {} with {} children", index, count);
        }
        // preparatory splits can leave nodes slightly below the
        // nominal minimum, tolerate down to floor(cap / 2).
        if !root && (count as usize) < self.internal_cap / 2 {
            return err_at!(Corruption, msg: "node {} underflow, {} children", index, count);
        }

        let mut totals = (0, 0, 1);
        let mut child_lower = lower.clone();
        for i in 0..count {
            let child_upper = if i + 1 < count {
                let sep = internal.get_key(i)?;
                if !in_bounds(self, &sep) {
                    return err_at!(Corruption, msg: "node {} separator out of bounds", index);
                }
                Some(sep)
            } else {
                upper.clone()
            };
            let child = internal.get_child(i)?;
            let (v, l, n) =
                self.validate_subtree(child, level - 1, child_lower.clone(), child_upper.clone())?;
            totals.0 += v;
            totals.1 += l;
            totals.2 += n;
            child_lower = child_upper;
        }
        Ok(totals)
    }
}
