//! Segregated free list over the heap's cell space.
//!
//! Free cell ranges below the largest size class sit on per-class
//! linked lists threaded through the free cells themselves, one list
//! node per range, exactly one cell big. Ranges of the largest class
//! live in an ordered tree keyed by (size, address), which doubles as
//! the best-fit index. The list for class `i` holds ranges of
//! `size_classes[i]` up to one below `size_classes[i + 1]` cells.

use std::rc::Rc;

use crate::{
    alloc::BlockAlloc,
    anchor::AnchorCell,
    btree::{self, Tree, TreeValue},
    codec::Codec,
    engine::Engine,
    heap::{read_bytes, write_bytes, CELL_SIZE},
    Result,
};

/// No cell address; cell addresses are byte offsets and the file
/// never reaches this one.
pub const NIL_CELL: u64 = u64::MAX;

// The free list for index `i` holds cell ranges of sizes
// `size_classes[i] ..= size_classes[i+1] - 1`; the last class spills
// into the large-range tree.
pub(crate) const SIZE_CLASSES: [u16; 16] = [
    1, 2, 3, 4, 6, 8, 12, 16, 24, 32, 48, 64, 96, 128, 192, 256,
];

/// Number of linked lists; the last size class is kept in the tree.
pub const N_LISTS: usize = SIZE_CLASSES.len() - 1;

/// A free range of cells, ordered by (size, address) for best-fit
/// with lowest-address tie-breaking.
#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) struct CellRange {
    pub size: u64, // in cells
    pub addr: u64, // cell-aligned byte address
}

impl Codec for CellRange {
    const SIZE: usize = 16;

    fn encode(&self, buf: &mut [u8]) {
        self.size.encode(buf);
        self.addr.encode(&mut buf[8..]);
    }

    fn decode(buf: &[u8]) -> Result<Self> {
        Ok(CellRange {
            size: u64::decode(buf)?,
            addr: u64::decode(&buf[8..])?,
        })
    }
}

impl TreeValue for CellRange {
    type Key = (u64, u64);

    fn key(&self) -> (u64, u64) {
        (self.size, self.addr)
    }
}

pub(crate) struct SegregatedFreeList {
    engine: Engine,
    heads_cell: AnchorCell<[u64; N_LISTS]>,
    heads: [u64; N_LISTS],
    large: Tree<CellRange>,
}

impl SegregatedFreeList {
    pub(crate) fn create(
        engine: Engine,
        alloc: Rc<dyn BlockAlloc>,
        heads_cell: AnchorCell<[u64; N_LISTS]>,
        large_cell: AnchorCell<btree::Anchor>,
    ) -> Result<SegregatedFreeList> {
        let heads = [NIL_CELL; N_LISTS];
        heads_cell.store(&heads)?;
        let large = Tree::create(engine.clone(), alloc, large_cell)?;
        Ok(SegregatedFreeList {
            engine,
            heads_cell,
            heads,
            large,
        })
    }

    pub(crate) fn load(
        engine: Engine,
        alloc: Rc<dyn BlockAlloc>,
        heads_cell: AnchorCell<[u64; N_LISTS]>,
        large_cell: AnchorCell<btree::Anchor>,
    ) -> Result<SegregatedFreeList> {
        let heads = heads_cell.fetch()?;
        let large = Tree::load(engine.clone(), alloc, large_cell)?;
        Ok(SegregatedFreeList {
            engine,
            heads_cell,
            heads,
            large,
        })
    }

    // Index of the class that contains ranges of `size` cells: the
    // last class whose lower bound is <= size.
    fn size_class_index(size: u64) -> usize {
        let mut index = 0;
        for (i, class) in SIZE_CLASSES.iter().enumerate() {
            if u64::from(*class) <= size {
                index = i;
            } else {
                break;
            }
        }
        index
    }

    fn read_node(&self, addr: u64) -> Result<(u64, u64)> {
        let mut buf = [0; CELL_SIZE];
        read_bytes(&self.engine, addr, &mut buf)?;
        Ok((u64::decode(&buf)?, u64::decode(&buf[8..])?))
    }

    fn write_node(&self, addr: u64, next: u64, size: u64) -> Result<()> {
        let mut buf = [0; CELL_SIZE];
        next.encode(&mut buf);
        size.encode(&mut buf[8..]);
        write_bytes(&self.engine, addr, &buf)
    }

    /// Record a free range of `size` cells at cell-aligned byte
    /// address `addr`.
    pub(crate) fn free(&mut self, addr: u64, size: u64) -> Result<()> {
        debug_assert!(size > 0 && addr % CELL_SIZE as u64 == 0);

        let sc = Self::size_class_index(size);
        if sc == SIZE_CLASSES.len() - 1 {
            self.large.insert(&CellRange { size, addr })?;
        } else {
            self.write_node(addr, self.heads[sc], size)?;
            self.heads[sc] = addr;
            self.heads_cell.store(&self.heads)?;
        }
        Ok(())
    }

    /// Find a range of at least `size` cells, remove it, give back
    /// the remainder, and return its address. None when the free
    /// list cannot satisfy the request.
    pub(crate) fn allocate(&mut self, size: u64) -> Result<Option<u64>> {
        let range = match self.get_free(size)? {
            Some(range) => range,
            None => return Ok(None),
        };
        debug_assert!(range.size >= size);
        if range.size > size {
            self.free(range.addr + size * CELL_SIZE as u64, range.size - size)?;
        }
        Ok(Some(range.addr))
    }

    // Remove some range of >= `size` cells from its structure.
    fn get_free(&mut self, size: u64) -> Result<Option<CellRange>> {
        let last = u64::from(*SIZE_CLASSES.last().unwrap());
        if size >= last {
            // only the tree can hold it; best fit by (size, addr).
            let cursor = self.large.lower_bound(&(size, 0))?;
            if cursor.is_valid() {
                let range = cursor.get()?;
                cursor.erase()?;
                return Ok(Some(range));
            }
            return Ok(None);
        }

        // every list from the first class that guarantees a fit.
        let si = Self::size_class_index(size);
        let sj = if u64::from(SIZE_CLASSES[si]) == size { si } else { si + 1 };
        for i in sj..N_LISTS {
            if let Some(range) = self.pop_list_head(i)? {
                return Ok(Some(range));
            }
        }

        // any large range is big enough.
        let cursor = self.large.seek_min()?;
        if cursor.is_valid() {
            let range = cursor.get()?;
            cursor.erase()?;
            return Ok(Some(range));
        }

        // first-fit search in the one list that only might fit.
        if si != sj {
            return self.remove_first_fit(si, size);
        }
        Ok(None)
    }

    fn pop_list_head(&mut self, index: usize) -> Result<Option<CellRange>> {
        let addr = self.heads[index];
        if addr == NIL_CELL {
            return Ok(None);
        }
        let (next, size) = self.read_node(addr)?;
        self.heads[index] = next;
        self.heads_cell.store(&self.heads)?;
        Ok(Some(CellRange { size, addr }))
    }

    // Scan the whole list for the first large-enough range and
    // unlink it.
    fn remove_first_fit(&mut self, index: usize, size: u64) -> Result<Option<CellRange>> {
        let mut prev = NIL_CELL;
        let mut current = self.heads[index];
        while current != NIL_CELL {
            let (next, node_size) = self.read_node(current)?;
            if node_size >= size {
                if prev == NIL_CELL {
                    self.heads[index] = next;
                    self.heads_cell.store(&self.heads)?;
                } else {
                    let (_, prev_size) = self.read_node(prev)?;
                    self.write_node(prev, next, prev_size)?;
                }
                return Ok(Some(CellRange {
                    size: node_size,
                    addr: current,
                }));
            }
            prev = current;
            current = next;
        }
        Ok(None)
    }

    /// Forget every free range; the sweep phase rebuilds the list
    /// from the marking bitmaps.
    pub(crate) fn clear(&mut self) -> Result<()> {
        self.heads = [NIL_CELL; N_LISTS];
        self.heads_cell.store(&self.heads)?;
        self.large.clear()
    }
}

#[cfg(test)]
#[path = "freelist_test.rs"]
mod freelist_test;
