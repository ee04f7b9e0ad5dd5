//! Module `anchor` implement persistent anchors.
//!
//! An anchor is a fixed-size record embedded inside some owning block
//! that holds the durable state of one data structure, its root
//! pointer, sizes and counters. A structure instance is constructed
//! by pairing an anchor location with an engine (and, usually, an
//! allocator); on every mutation the structure stores the anchor back
//! through its [AnchorCell], which re-encodes the record into the
//! enclosing block and marks that block dirty.
//!
//! A cell keeps its enclosing block pinned for as long as it lives.
//! Drop all cells (and the structures holding them) before rolling a
//! transaction back.

use std::marker::PhantomData;

use crate::{
    codec::Codec,
    engine::{BlockHandle, Engine},
    Result,
};

/// Location of an anchor: a block index and a byte offset inside
/// that block.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct AnchorLoc {
    pub index: u64,
    pub offset: usize,
}

impl AnchorLoc {
    pub fn new(index: u64, offset: usize) -> AnchorLoc {
        AnchorLoc { index, offset }
    }

    /// Materialize a typed cell at this location. The enclosing
    /// block is pinned until the cell is dropped.
    pub fn to_cell<T: Codec>(&self, engine: &Engine) -> Result<AnchorCell<T>> {
        let handle = engine.pin(self.index, true /*initialize*/)?;
        AnchorCell::new(handle, self.offset)
    }
}

/// Typed view of an anchor inside a pinned block.
pub struct AnchorCell<T> {
    handle: BlockHandle,
    offset: usize,
    _typ: PhantomData<T>,
}

impl<T> Clone for AnchorCell<T> {
    fn clone(&self) -> AnchorCell<T> {
        AnchorCell {
            handle: self.handle.clone(),
            offset: self.offset,
            _typ: PhantomData,
        }
    }
}

impl<T: Codec> AnchorCell<T> {
    pub fn new(handle: BlockHandle, offset: usize) -> Result<AnchorCell<T>> {
        if offset + T::SIZE > handle.len() {
            return err_at!(
                BadArgument, msg: "anchor {}+{} beyond block {}", offset, T::SIZE, handle.len()
            );
        }
        Ok(AnchorCell {
            handle,
            offset,
            _typ: PhantomData,
        })
    }

    /// Decode the current anchor value.
    pub fn fetch(&self) -> Result<T> {
        self.handle.get(self.offset)
    }

    /// Encode `value` into the enclosing block, marking it dirty.
    pub fn store(&self, value: &T) -> Result<()> {
        self.handle.set(self.offset, value)
    }

    /// Cell for a field nested inside this anchor, at `field_offset`
    /// bytes from its start. Layouts concatenate fields in
    /// declaration order, so the offset is a compile-time constant of
    /// the outer record.
    pub fn project<U: Codec>(&self, field_offset: usize) -> Result<AnchorCell<U>> {
        if field_offset + U::SIZE > T::SIZE {
            return err_at!(
                BadArgument, msg: "project {}+{} beyond anchor {}", field_offset, U::SIZE, T::SIZE
            );
        }
        AnchorCell::new(self.handle.clone(), self.offset + field_offset)
    }

    pub fn to_loc(&self) -> AnchorLoc {
        AnchorLoc {
            index: self.handle.to_index(),
            offset: self.offset,
        }
    }
}

#[cfg(test)]
#[path = "anchor_test.rs"]
mod anchor_test;
