//! The object table: a dense, growing array mapping references to
//! object locations.
//!
//! A reference is nothing but an index into this table, which is what
//! makes it stable: the heap may move an object on disk by patching
//! the table slot, no reference changes. Dead slots are threaded into
//! a free list whose head lives in the heap anchor.

use arbitrary::Arbitrary;

use std::rc::Rc;

use crate::{
    alloc::BlockAlloc,
    anchor::AnchorCell,
    codec::Codec,
    engine::Engine,
    util, Result, NIL_BLOCK,
};

/// Bytes per serialized table entry: a tag byte plus the payload slot
/// padded to the largest alternative.
pub const ENTRY_SIZE: usize = 18;

/// One slot of the object table.
#[derive(Clone, Copy, Debug, PartialEq, Arbitrary)]
pub enum Entry {
    /// The slot is unused; `next` is the next free slot, or
    /// [crate::NIL_BLOCK]-like `u64::MAX` for none.
    Free { next: u64 },
    /// The slot holds a live object at a cell-aligned byte address;
    /// `size` includes the object header.
    Live { type_tag: u8, addr: u64, size: u64 },
}

impl Codec for Entry {
    const SIZE: usize = ENTRY_SIZE;

    fn encode(&self, buf: &mut [u8]) {
        buf[..Self::SIZE].iter_mut().for_each(|b| *b = 0);
        match self {
            Entry::Free { next } => {
                buf[0] = 0;
                next.encode(&mut buf[1..]);
            }
            Entry::Live { type_tag, addr, size } => {
                buf[0] = 1;
                buf[1] = *type_tag;
                addr.encode(&mut buf[2..]);
                size.encode(&mut buf[10..]);
            }
        }
    }

    fn decode(buf: &[u8]) -> Result<Self> {
        match buf[0] {
            0 => Ok(Entry::Free {
                next: u64::decode(&buf[1..])?,
            }),
            1 => Ok(Entry::Live {
                type_tag: buf[1],
                addr: u64::decode(&buf[2..])?,
                size: u64::decode(&buf[10..])?,
            }),
            n => err_at!(Corruption, msg: "object table entry tag {}", n),
        }
    }
}

impl Entry {
    pub fn is_live(&self) -> bool {
        matches!(self, Entry::Live { .. })
    }
}

/// Persistent anchor of the table: one contiguous block run plus the
/// number of slots in use.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TableAnchor {
    pub base: u64,
    pub blocks: u64,
    pub len: u64,
}

impl Default for TableAnchor {
    fn default() -> TableAnchor {
        TableAnchor {
            base: NIL_BLOCK,
            blocks: 0,
            len: 0,
        }
    }
}

impl Codec for TableAnchor {
    const SIZE: usize = 24;

    fn encode(&self, buf: &mut [u8]) {
        self.base.encode(buf);
        self.blocks.encode(&mut buf[8..]);
        self.len.encode(&mut buf[16..]);
    }

    fn decode(buf: &[u8]) -> Result<Self> {
        Ok(TableAnchor {
            base: u64::decode(buf)?,
            blocks: u64::decode(&buf[8..])?,
            len: u64::decode(&buf[16..])?,
        })
    }
}

pub struct ObjectTable {
    engine: Engine,
    alloc: Rc<dyn BlockAlloc>,
    cell: AnchorCell<TableAnchor>,
    anchor: TableAnchor,
    per_block: u64,
}

impl ObjectTable {
    pub fn create(
        engine: Engine,
        alloc: Rc<dyn BlockAlloc>,
        cell: AnchorCell<TableAnchor>,
    ) -> Result<ObjectTable> {
        let anchor = TableAnchor::default();
        cell.store(&anchor)?;
        let per_block = util::to_u64(engine.block_size() / ENTRY_SIZE)?;
        Ok(ObjectTable {
            engine,
            alloc,
            cell,
            anchor,
            per_block,
        })
    }

    pub fn load(
        engine: Engine,
        alloc: Rc<dyn BlockAlloc>,
        cell: AnchorCell<TableAnchor>,
    ) -> Result<ObjectTable> {
        let anchor = cell.fetch()?;
        let per_block = util::to_u64(engine.block_size() / ENTRY_SIZE)?;
        Ok(ObjectTable {
            engine,
            alloc,
            cell,
            anchor,
            per_block,
        })
    }

    /// Number of slots, live and free.
    pub fn len(&self) -> u64 {
        self.anchor.len
    }

    pub fn is_empty(&self) -> bool {
        self.anchor.len == 0
    }

    fn location(&self, index: u64) -> (u64, usize) {
        let block = self.anchor.base + index / self.per_block;
        // the remainder is bounded by entries-per-block.
        let offset = (index % self.per_block) as usize * ENTRY_SIZE;
        (block, offset)
    }

    pub fn get(&self, index: u64) -> Result<Entry> {
        if index >= self.anchor.len {
            return err_at!(BadArgument, msg: "table index {} of {}", index, self.anchor.len);
        }
        let (block, offset) = self.location(index);
        self.engine.pin(block, true)?.get(offset)
    }

    pub fn set(&mut self, index: u64, entry: Entry) -> Result<()> {
        if index >= self.anchor.len {
            return err_at!(BadArgument, msg: "table index {} of {}", index, self.anchor.len);
        }
        let (block, offset) = self.location(index);
        self.engine.pin(block, true)?.set(offset, &entry)
    }

    /// Append a slot, growing the backing run when needed. Returns
    /// the new slot index.
    pub fn push(&mut self, entry: Entry) -> Result<u64> {
        if self.anchor.len == self.anchor.blocks * self.per_block {
            self.grow()?;
        }
        let index = self.anchor.len;
        self.anchor.len += 1;
        self.cell.store(&self.anchor)?;
        self.set(index, entry)?;
        Ok(index)
    }

    // Double the backing run, copying the entries block by block.
    fn grow(&mut self) -> Result<()> {
        let old_base = self.anchor.base;
        let old_blocks = self.anchor.blocks;
        let new_blocks = (old_blocks * 2).max(1);
        let new_base = self.alloc.allocate(new_blocks)?;

        let block_size = self.engine.block_size();
        for i in 0..new_blocks {
            let handle = self.engine.overwrite_zero(new_base + i)?;
            if i < old_blocks {
                let old = self.engine.pin(old_base + i, true)?;
                handle.write_at(0, &old.read_vec(0, block_size)?)?;
            }
        }
        if old_blocks > 0 {
            self.alloc.free(old_base, old_blocks)?;
        }

        self.anchor.base = new_base;
        self.anchor.blocks = new_blocks;
        self.cell.store(&self.anchor)
    }
}

#[cfg(test)]
#[path = "table_test.rs"]
mod table_test;
