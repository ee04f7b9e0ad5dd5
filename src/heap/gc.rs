//! Mark-and-sweep collection over the blob heap.
//!
//! A collection runs in three phases. Prepare: the chunk index is
//! cloned into an in-memory set with one marking bitmap per
//! small-object chunk, one bit per cell, and a single flag per
//! large-object chunk. Mark: starting from the caller-supplied
//! roots, an iterative depth-first walk over the object graph sets
//! the bits of every reachable object; an explicit work stack makes
//! arbitrary depth and cycles safe. Sweep: unmarked table slots are
//! reclaimed (firing finalizers), the segregated free list is rebuilt
//! from scratch out of the zero runs of each bitmap, and unmarked
//! large chunks go back to the block allocator.

use log::info;

use std::{cell::RefCell, collections::BTreeMap, rc::Rc};

use crate::{
    alloc::BlockAlloc,
    heap::{table::Entry, Heap, HeapInner, Reference, CELL_SIZE},
    util, Result,
};

/// Outcome of one collection.
#[derive(Clone, Debug, Default)]
pub struct GcStats {
    pub live_objects: u64,
    pub freed_objects: u64,
    pub freed_chunks: u64,
}

// Marking state of one chunk.
struct ChunkMark {
    addr: u64, // first block
    blocks: u64,
    large: bool,
    // anything in this chunk is live; for large chunks this is the
    // only mark.
    marked: bool,
    // one bit per cell, small chunks only.
    bitmap: Vec<u64>,
}

impl ChunkMark {
    fn new(addr: u64, blocks: u64, large: bool, cells: u64) -> Result<ChunkMark> {
        let words = if large {
            0
        } else {
            util::to_usize(util::ceil_div(cells, 64))?
        };
        Ok(ChunkMark {
            addr,
            blocks,
            large,
            marked: false,
            bitmap: vec![0; words],
        })
    }

    fn test(&self, cell: u64) -> bool {
        self.bitmap[(cell / 64) as usize] & (1 << (cell % 64)) != 0
    }

    fn set(&mut self, cell: u64) {
        self.bitmap[(cell / 64) as usize] |= 1 << (cell % 64);
    }
}

/// A running collection, created by [Heap::collect].
///
/// Feed every root through [Collector::visit_root], then call
/// [Collector::finish] to sweep. Dropping the collector without
/// finishing abandons the collection without reclaiming anything.
pub struct Collector {
    heap: Rc<RefCell<HeapInner>>,
    // chunk marks keyed by the chunk's first byte address.
    chunks: BTreeMap<u64, ChunkMark>,
    block_size: u64,
    finished: bool,
}

impl Collector {
    pub(crate) fn begin(heap: &Heap) -> Result<Collector> {
        let mut inner = heap.inner.borrow_mut();
        if inner.collecting {
            return err_at!(BadOperation, msg: "collection already running");
        }

        let block_size = util::to_u64(inner.block_size)?;
        let cells_per_block = inner.cells_per_block();
        let mut chunks = BTreeMap::new();
        let cursor = inner.chunks.cursor();
        if cursor.seek_min()? {
            loop {
                let rec = cursor.get()?;
                let mark =
                    ChunkMark::new(rec.addr, rec.blocks, rec.large, rec.blocks * cells_per_block)?;
                chunks.insert(rec.addr * block_size, mark);
                if !cursor.move_next()? {
                    break;
                }
            }
        }

        inner.collecting = true;
        Ok(Collector {
            heap: Rc::clone(&heap.inner),
            chunks,
            block_size,
            finished: false,
        })
    }

    /// Mark everything reachable from `root`. Objects of types that
    /// carry references contribute their children through the
    /// registered visitor.
    pub fn visit_root(&mut self, root: Reference) -> Result<()> {
        if self.finished {
            return err_at!(BadOperation, msg: "collection already finished");
        }

        let mut stack = vec![root];
        while let Some(reference) = stack.pop() {
            if !self.mark(reference)? {
                continue; // seen before, cycles end here.
            }

            let (type_tag, contains) = {
                let inner = self.heap.borrow();
                let type_tag = match inner.table.get(reference.0)? {
                    Entry::Live { type_tag, .. } => type_tag,
                    Entry::Free { .. } => {
                        return err_at!(Corruption, msg: "marked reference {} died", reference.0)
                    }
                };
                // the tag comes straight off disk, never trust it.
                if type_tag as usize >= inner.types.len() {
                    return err_at!(
                        Corruption, msg: "object table entry with unregistered type {}", type_tag
                    );
                }
                let contains = inner.types[type_tag as usize].contains_references;
                (type_tag, contains)
            };
            if !contains {
                continue;
            }

            let payload = self.heap.borrow_mut().load_object(reference)?;
            let visit = self.heap.borrow().types[type_tag as usize].visit_children.clone();
            if let Some(visit) = visit {
                let mut children = vec![];
                visit(&payload, &mut children);
                stack.extend(children);
            }
        }
        Ok(())
    }

    // Mark the cells of one object; true on the first visit.
    fn mark(&mut self, reference: Reference) -> Result<bool> {
        let (addr, size) = {
            let inner = self.heap.borrow();
            match inner.table.get(reference.0) {
                Ok(Entry::Live { addr, size, .. }) => (addr, size),
                Ok(Entry::Free { .. }) | Err(_) => {
                    return err_at!(Corruption, msg: "marking invalid reference {}", reference.0)
                }
            }
        };

        let (start, mark) = match self.chunks.range_mut(..=addr).next_back() {
            Some((start, mark)) => (*start, mark),
            None => return err_at!(Corruption, msg: "object at {} outside any chunk", addr),
        };
        if addr + size > start + mark.blocks * self.block_size {
            return err_at!(Corruption, msg: "object at {} outside its chunk", addr);
        }

        if mark.large {
            if mark.marked {
                return Ok(false);
            }
            mark.marked = true;
            return Ok(true);
        }

        let cell = (addr - start) / CELL_SIZE as u64;
        if mark.test(cell) {
            return Ok(false);
        }
        mark.marked = true;
        for i in 0..HeapInner::cell_count(size) {
            mark.set(cell + i);
        }
        Ok(true)
    }

    /// Sweep: reclaim every unmarked object, rebuild the free list
    /// and release dead large chunks.
    pub fn finish(mut self) -> Result<GcStats> {
        if self.finished {
            return err_at!(BadOperation, msg: "collection already finished");
        }
        self.finished = true;
        let mut stats = GcStats::default();

        // sweep the object table in slot order.
        let table_len = self.heap.borrow().table.len();
        for slot in 0..table_len {
            let (type_tag, addr) = match self.heap.borrow().table.get(slot)? {
                Entry::Live { type_tag, addr, .. } => (type_tag, addr),
                Entry::Free { .. } => continue,
            };

            let dead = match self.chunks.range(..=addr).next_back() {
                Some((_, mark)) if mark.large => !mark.marked,
                Some((start, mark)) => {
                    !mark.marked || !mark.test((addr - start) / CELL_SIZE as u64)
                }
                None => {
                    return err_at!(Corruption, msg: "object at {} outside any chunk", addr)
                }
            };
            if !dead {
                stats.live_objects += 1;
                continue;
            }
            stats.freed_objects += 1;

            // the finalizer fires before the slot becomes reusable,
            // with the heap unlocked; it must not allocate here.
            let finalizer = {
                let inner = self.heap.borrow();
                // the tag comes straight off disk, never trust it.
                if type_tag as usize >= inner.types.len() {
                    return err_at!(
                        Corruption, msg: "object table entry with unregistered type {}", type_tag
                    );
                }
                inner.types[type_tag as usize].finalizer.clone()
            };
            if let Some(finalizer) = finalizer {
                (finalizer.borrow_mut())(Reference(slot));
            }

            let mut inner = self.heap.borrow_mut();
            let next = inner.next_free_slot;
            inner.table.set(slot, Entry::Free { next })?;
            inner.set_next_free_slot(slot)?;
        }

        // rebuild the free space picture from the bitmaps.
        {
            let mut inner = self.heap.borrow_mut();
            let cells_per_block = inner.cells_per_block();
            inner.free_list.clear()?;

            for (start, mark) in self.chunks.iter() {
                if mark.large {
                    if !mark.marked {
                        inner.alloc.free(mark.addr, mark.blocks)?;
                        inner.chunks.remove(&mark.addr)?;
                        stats.freed_chunks += 1;
                    }
                    continue;
                }

                let total_cells = mark.blocks * cells_per_block;
                if !mark.marked {
                    // the whole chunk is one free run.
                    inner.free_list.free(*start, total_cells)?;
                    continue;
                }
                // contiguous zero runs of the bitmap become free
                // ranges, coalesced by construction.
                let mut i = 0;
                while i < total_cells {
                    if mark.test(i) {
                        i += 1;
                        continue;
                    }
                    let mut j = i + 1;
                    while j < total_cells && !mark.test(j) {
                        j += 1;
                    }
                    inner.free_list.free(start + i * CELL_SIZE as u64, j - i)?;
                    i = j;
                }
            }
            inner.collecting = false;
        }

        info!(
            target: "heap  ",
            "collection done, {} live, {} freed, {} chunks released",
            stats.live_objects, stats.freed_objects, stats.freed_chunks
        );
        Ok(stats)
    }
}

impl Drop for Collector {
    fn drop(&mut self) {
        if !self.finished {
            // an abandoned collection reclaims nothing but must not
            // wedge the heap.
            self.heap.borrow_mut().collecting = false;
        }
    }
}

#[cfg(test)]
#[path = "gc_test.rs"]
mod gc_test;
