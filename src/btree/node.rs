//! On-disk node layouts for the B+ tree.
//!
//! A leaf block holds a header (prev, next, size) followed by an
//! array of fixed-size value slots. An internal block holds a header
//! (size = child count) followed by an array of `max_children - 1`
//! key slots and an array of `max_children` child block indices.
//! There is no node-type tag; a block's role follows from its depth,
//! every node below `height - 1` levels of internal nodes is a leaf.

use crate::{engine::BlockHandle, Result};

pub const LEAF_HEADER_SIZE: usize = 20;
pub const INTERNAL_HEADER_SIZE: usize = 4;

/// Number of values a leaf can hold.
pub fn leaf_capacity(block_size: usize, value_size: usize) -> usize {
    (block_size - LEAF_HEADER_SIZE) / value_size
}

/// Number of children an internal node can hold.
pub fn internal_max_children(block_size: usize, key_size: usize) -> usize {
    (block_size - INTERNAL_HEADER_SIZE + key_size) / (key_size + 8)
}

/// View of one leaf block.
#[derive(Clone)]
pub struct LeafNode {
    handle: BlockHandle,
    value_size: usize,
}

impl LeafNode {
    pub fn new(handle: BlockHandle, value_size: usize) -> LeafNode {
        LeafNode { handle, value_size }
    }

    #[inline]
    pub fn index(&self) -> u64 {
        self.handle.to_index()
    }

    pub fn capacity(&self) -> usize {
        leaf_capacity(self.handle.len(), self.value_size)
    }

    pub fn get_prev(&self) -> Result<u64> {
        self.handle.get(0)
    }

    pub fn set_prev(&self, prev: u64) -> Result<()> {
        self.handle.set(0, &prev)
    }

    pub fn get_next(&self) -> Result<u64> {
        self.handle.get(8)
    }

    pub fn set_next(&self, next: u64) -> Result<()> {
        self.handle.set(8, &next)
    }

    pub fn get_size(&self) -> Result<u32> {
        self.handle.get(16)
    }

    pub fn set_size(&self, size: u32) -> Result<()> {
        self.handle.set(16, &size)
    }

    fn value_offset(&self, i: u32) -> usize {
        LEAF_HEADER_SIZE + (i as usize) * self.value_size
    }

    pub fn get_value(&self, i: u32) -> Result<Vec<u8>> {
        self.handle.read_vec(self.value_offset(i), self.value_size)
    }

    pub fn set_value(&self, i: u32, value: &[u8]) -> Result<()> {
        debug_assert_eq!(value.len(), self.value_size);
        self.handle.write_at(self.value_offset(i), value)
    }

    /// Insert `value` at `i`, shifting the tail right. The leaf must
    /// not be full.
    pub fn insert_nonfull(&self, i: u32, value: &[u8]) -> Result<()> {
        let size = self.get_size()?;
        debug_assert!(i <= size && (size as usize) < self.capacity());
        self.handle.copy_within(
            self.value_offset(i)..self.value_offset(size),
            self.value_offset(i + 1),
        )?;
        self.set_value(i, value)?;
        self.set_size(size + 1)
    }

    /// Remove the value at `i`, shifting the tail left.
    pub fn remove(&self, i: u32) -> Result<()> {
        let size = self.get_size()?;
        debug_assert!(i < size);
        self.handle.copy_within(
            self.value_offset(i + 1)..self.value_offset(size),
            self.value_offset(i),
        )?;
        self.set_size(size - 1)
    }

    /// Distribute this full leaf plus one new value over self and the
    /// empty `right` sibling: of the combined ordered sequence, the
    /// first `left_size` values stay here, the rest move right.
    pub fn insert_full(
        &self,
        i: u32,
        value: &[u8],
        left_size: u32,
        right: &LeafNode,
    ) -> Result<()> {
        let size = self.get_size()?;
        debug_assert_eq!(size as usize, self.capacity());
        debug_assert!(i <= size && left_size <= size + 1);

        // combined sequence index -> source.
        let total = size + 1;
        let fetch = |at: u32| -> Result<Vec<u8>> {
            if at < i {
                self.get_value(at)
            } else if at == i {
                Ok(value.to_vec())
            } else {
                self.get_value(at - 1)
            }
        };

        // fill the right node first so that left slots are still
        // intact while reading.
        for at in left_size..total {
            right.set_value(at - left_size, &fetch(at)?)?;
        }
        right.set_size(total - left_size)?;

        // then rearrange the left node, back to front.
        for at in (0..left_size).rev() {
            if at == i {
                self.set_value(at, value)?;
            } else if at > i {
                let tmp = self.get_value(at - 1)?;
                self.set_value(at, &tmp)?;
            } else {
                break; // values below the insert point are in place.
            }
        }
        self.set_size(left_size)
    }

    /// Append every value of `right` to this leaf.
    pub fn append_from_right(&self, right: &LeafNode) -> Result<()> {
        let size = self.get_size()?;
        let rsize = right.get_size()?;
        debug_assert!(size as usize + rsize as usize <= self.capacity());
        for at in 0..rsize {
            self.set_value(size + at, &right.get_value(at)?)?;
        }
        self.set_size(size + rsize)
    }

    /// Prepend every value of `left` to this leaf.
    pub fn prepend_from_left(&self, left: &LeafNode) -> Result<()> {
        let size = self.get_size()?;
        let lsize = left.get_size()?;
        debug_assert!(size as usize + lsize as usize <= self.capacity());
        self.handle.copy_within(
            self.value_offset(0)..self.value_offset(size),
            self.value_offset(lsize),
        )?;
        for at in 0..lsize {
            self.set_value(at, &left.get_value(at)?)?;
        }
        self.set_size(size + lsize)
    }
}

/// View of one internal block.
#[derive(Clone)]
pub struct InternalNode {
    handle: BlockHandle,
    key_size: usize,
    max_children: usize,
}

impl InternalNode {
    pub fn new(handle: BlockHandle, key_size: usize, max_children: usize) -> InternalNode {
        InternalNode {
            handle,
            key_size,
            max_children,
        }
    }

    #[inline]
    pub fn index(&self) -> u64 {
        self.handle.to_index()
    }

    pub fn max_children(&self) -> usize {
        self.max_children
    }

    pub fn get_child_count(&self) -> Result<u32> {
        self.handle.get(0)
    }

    pub fn set_child_count(&self, count: u32) -> Result<()> {
        self.handle.set(0, &count)
    }

    fn key_offset(&self, i: u32) -> usize {
        INTERNAL_HEADER_SIZE + (i as usize) * self.key_size
    }

    fn child_offset(&self, i: u32) -> usize {
        INTERNAL_HEADER_SIZE + (self.max_children - 1) * self.key_size + (i as usize) * 8
    }

    pub fn get_key(&self, i: u32) -> Result<Vec<u8>> {
        self.handle.read_vec(self.key_offset(i), self.key_size)
    }

    pub fn set_key(&self, i: u32, key: &[u8]) -> Result<()> {
        debug_assert_eq!(key.len(), self.key_size);
        self.handle.write_at(self.key_offset(i), key)
    }

    pub fn get_child(&self, i: u32) -> Result<u64> {
        self.handle.get(self.child_offset(i))
    }

    pub fn set_child(&self, i: u32, child: u64) -> Result<()> {
        self.handle.set(self.child_offset(i), &child)
    }

    /// Insert the result of a child split: `child` becomes the child
    /// at `i` and `key`, the max key of the child at `i - 1`, becomes
    /// the separator between them.
    pub fn insert_split_result(&self, i: u32, key: &[u8], child: u64) -> Result<()> {
        let count = self.get_child_count()?;
        debug_assert!(i >= 1 && i <= count && (count as usize) < self.max_children);

        self.handle.copy_within(
            self.key_offset(i - 1)..self.key_offset(count - 1),
            self.key_offset(i),
        )?;
        self.set_key(i - 1, key)?;
        self.handle.copy_within(
            self.child_offset(i)..self.child_offset(count),
            self.child_offset(i + 1),
        )?;
        self.set_child(i, child)?;
        self.set_child_count(count + 1)
    }

    /// Remove the child at `i` together with its dead separator, the
    /// key at `min(i, key_count - 1)`.
    pub fn remove_child(&self, i: u32) -> Result<()> {
        let count = self.get_child_count()?;
        debug_assert!(i < count && count >= 2);

        let key_at = i.min(count - 2);
        self.handle.copy_within(
            self.key_offset(key_at + 1)..self.key_offset(count - 1),
            self.key_offset(key_at),
        )?;
        self.handle.copy_within(
            self.child_offset(i + 1)..self.child_offset(count),
            self.child_offset(i),
        )?;
        self.set_child_count(count - 1)
    }

    /// Append a (separator, child) pair taken from the right
    /// neighbor.
    pub fn append_entry(&self, key: &[u8], child: u64) -> Result<()> {
        let count = self.get_child_count()?;
        debug_assert!((count as usize) < self.max_children);
        self.set_key(count - 1, key)?;
        self.set_child(count, child)?;
        self.set_child_count(count + 1)
    }

    /// Prepend a (separator, child) pair taken from the left
    /// neighbor.
    pub fn prepend_entry(&self, key: &[u8], child: u64) -> Result<()> {
        let count = self.get_child_count()?;
        debug_assert!((count as usize) < self.max_children);
        self.handle.copy_within(
            self.key_offset(0)..self.key_offset(count - 1),
            self.key_offset(1),
        )?;
        self.set_key(0, key)?;
        self.handle.copy_within(
            self.child_offset(0)..self.child_offset(count),
            self.child_offset(1),
        )?;
        self.set_child(0, child)?;
        self.set_child_count(count + 1)
    }

    /// Move the upper half of this full node into the empty `right`
    /// sibling. Returns the separator key between the two, which the
    /// caller inserts into the parent.
    pub fn split(&self, right: &InternalNode) -> Result<Vec<u8>> {
        let count = self.get_child_count()?;
        debug_assert_eq!(count as usize, self.max_children);

        let left_count = (count + 1) / 2;
        let right_count = count - left_count;
        for at in 0..right_count {
            right.set_child(at, self.get_child(left_count + at)?)?;
        }
        for at in 0..right_count - 1 {
            right.set_key(at, &self.get_key(left_count + at)?)?;
        }
        right.set_child_count(right_count)?;

        let split_key = self.get_key(left_count - 1)?;
        self.set_child_count(left_count)?;
        Ok(split_key)
    }

    /// Merge the right neighbor into this node; `sep_key` is the
    /// separator between the two in their parent.
    pub fn append_from_right(&self, sep_key: &[u8], right: &InternalNode) -> Result<()> {
        let count = self.get_child_count()?;
        let rcount = right.get_child_count()?;
        debug_assert!((count + rcount) as usize <= self.max_children);

        self.set_key(count - 1, sep_key)?;
        for at in 0..rcount - 1 {
            self.set_key(count + at, &right.get_key(at)?)?;
        }
        for at in 0..rcount {
            self.set_child(count + at, right.get_child(at)?)?;
        }
        self.set_child_count(count + rcount)
    }

    /// Merge the left neighbor into this node; `sep_key` is the
    /// separator between the two in their parent.
    pub fn prepend_from_left(&self, sep_key: &[u8], left: &InternalNode) -> Result<()> {
        let count = self.get_child_count()?;
        let lcount = left.get_child_count()?;
        debug_assert!((count + lcount) as usize <= self.max_children);

        self.handle.copy_within(
            self.key_offset(0)..self.key_offset(count - 1),
            self.key_offset(lcount),
        )?;
        for at in 0..lcount - 1 {
            self.set_key(at, &left.get_key(at)?)?;
        }
        self.set_key(lcount - 1, sep_key)?;
        self.handle.copy_within(
            self.child_offset(0)..self.child_offset(count),
            self.child_offset(lcount),
        )?;
        for at in 0..lcount {
            self.set_child(at, left.get_child(at)?)?;
        }
        self.set_child_count(count + lcount)
    }
}

#[cfg(test)]
#[path = "node_test.rs"]
mod node_test;
