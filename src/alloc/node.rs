//! Single-block allocator for fixed-size structures.
//!
//! A degraded variant of the extent allocator: a bump pointer over
//! the most recently grown region plus a free list threaded through
//! the released blocks themselves, first eight bytes of a free block
//! holding the index of the next free block. Multi-block requests
//! are outside its capabilities.

use std::{cell::RefCell, rc::Rc};

use crate::{
    alloc::BlockAlloc,
    anchor::AnchorCell,
    codec::Codec,
    config::AllocConfig,
    engine::Engine,
    Result, NIL_BLOCK,
};

/// Persistent anchor of the [NodeAllocator].
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Anchor {
    /// Head of the free list, threaded through freed blocks.
    pub free_head: u64,
    /// Next unused block of the current region.
    pub region_next: u64,
    /// End of the current region, exclusive.
    pub region_end: u64,
    pub total: u64,
    pub used: u64,
}

impl Default for Anchor {
    fn default() -> Anchor {
        Anchor {
            free_head: NIL_BLOCK,
            region_next: 0,
            region_end: 0,
            total: 0,
            used: 0,
        }
    }
}

impl Codec for Anchor {
    const SIZE: usize = 40;

    fn encode(&self, buf: &mut [u8]) {
        self.free_head.encode(buf);
        self.region_next.encode(&mut buf[8..]);
        self.region_end.encode(&mut buf[16..]);
        self.total.encode(&mut buf[24..]);
        self.used.encode(&mut buf[32..]);
    }

    fn decode(buf: &[u8]) -> Result<Self> {
        Ok(Anchor {
            free_head: u64::decode(buf)?,
            region_next: u64::decode(&buf[8..])?,
            region_end: u64::decode(&buf[16..])?,
            total: u64::decode(&buf[24..])?,
            used: u64::decode(&buf[32..])?,
        })
    }
}

struct NodeInner {
    engine: Engine,
    cell: AnchorCell<Anchor>,
    anchor: Anchor,
    chunk_blocks: u64,
}

/// Allocator of single blocks. Cheap-to-clone handle.
pub struct NodeAllocator {
    inner: Rc<RefCell<NodeInner>>,
}

impl Clone for NodeAllocator {
    fn clone(&self) -> NodeAllocator {
        NodeAllocator {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl NodeAllocator {
    /// Set up a fresh node allocator, storing its anchor through
    /// `cell`.
    pub fn create(
        engine: Engine,
        cell: AnchorCell<Anchor>,
        config: AllocConfig,
    ) -> Result<NodeAllocator> {
        let anchor = Anchor::default();
        cell.store(&anchor)?;
        let inner = NodeInner {
            engine,
            cell,
            anchor,
            chunk_blocks: config.chunk_blocks.max(1),
        };
        Ok(NodeAllocator {
            inner: Rc::new(RefCell::new(inner)),
        })
    }

    /// Reconstruct a node allocator from its anchor.
    pub fn load(
        engine: Engine,
        cell: AnchorCell<Anchor>,
        config: AllocConfig,
    ) -> Result<NodeAllocator> {
        let anchor = cell.fetch()?;
        let inner = NodeInner {
            engine,
            cell,
            anchor,
            chunk_blocks: config.chunk_blocks.max(1),
        };
        Ok(NodeAllocator {
            inner: Rc::new(RefCell::new(inner)),
        })
    }
}

impl BlockAlloc for NodeAllocator {
    fn allocate(&self, n: u64) -> Result<u64> {
        if n != 1 {
            return err_at!(Unsupported, msg: "node allocator, {} blocks", n);
        }
        let mut inner = self.inner.borrow_mut();

        let index = if inner.anchor.free_head != NIL_BLOCK {
            let index = inner.anchor.free_head;
            let handle = inner.engine.pin(index, true)?;
            inner.anchor.free_head = handle.get(0)?;
            index
        } else {
            if inner.anchor.region_next == inner.anchor.region_end {
                let start = inner.engine.size()?;
                inner.engine.grow(inner.chunk_blocks)?;
                inner.anchor.region_next = start;
                inner.anchor.region_end = start + inner.chunk_blocks;
                inner.anchor.total += inner.chunk_blocks;
            }
            let index = inner.anchor.region_next;
            inner.anchor.region_next += 1;
            index
        };
        inner.anchor.used += 1;
        let anchor = inner.anchor;
        inner.cell.store(&anchor)?;
        Ok(index)
    }

    fn free(&self, first: u64, n: u64) -> Result<()> {
        if n != 1 {
            return err_at!(Unsupported, msg: "node allocator, {} blocks", n);
        }
        let mut inner = self.inner.borrow_mut();
        if inner.anchor.used == 0 {
            return err_at!(BadArgument, msg: "free({}) on empty allocator", first);
        }

        let handle = inner.engine.overwrite_zero(first)?;
        handle.set(0, &inner.anchor.free_head)?;
        drop(handle);
        inner.anchor.free_head = first;
        inner.anchor.used -= 1;
        let anchor = inner.anchor;
        inner.cell.store(&anchor)?;
        Ok(())
    }

    fn data_total(&self) -> u64 {
        self.inner.borrow().anchor.total
    }

    fn data_used(&self) -> u64 {
        self.inner.borrow().anchor.used
    }
}

#[cfg(test)]
#[path = "node_test.rs"]
mod node_test;
