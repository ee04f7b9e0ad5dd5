//! Module `alloc` implement free-space management of contiguous
//! block runs within a growing file.
//!
//! The [Allocator] keeps a doubly indexed picture of the file: a map
//! of extents keyed by their starting block, tagged allocated or
//! free, and a free-by-size index used for best-fit selection, ties
//! broken by lowest address. Adjacent free extents are always
//! coalesced. When no free extent satisfies a request the file grows
//! by at least `chunk_blocks` in one step.
//!
//! The extent table is persisted into a chain of metadata blocks on
//! [Allocator::save] and reloaded on open, so the free list and the
//! counters survive close/reopen. Metadata blocks are obtained from
//! raw engine growth, never from the allocator itself, so saving
//! cannot recurse into allocation; once acquired they stay on the
//! chain for reuse.
//!
//! The degraded [NodeAllocator] serves fixed-size structures that
//! only ever need one block at a time.

use log::{debug, info};

use std::{
    cell::RefCell,
    collections::{BTreeMap, BTreeSet},
    convert::TryFrom,
    rc::Rc,
};

use crate::{
    anchor::AnchorLoc,
    codec::Codec,
    config::AllocConfig,
    engine::Engine,
    util, Result, NIL_BLOCK,
};

pub mod node;

pub use node::NodeAllocator;

/// Block allocation services consumed by the data structures. All
/// indices and counts are in blocks.
pub trait BlockAlloc {
    /// Allocate a run of `n` contiguous blocks, returning the first
    /// block index.
    fn allocate(&self, n: u64) -> Result<u64>;

    /// Release a previously allocated run.
    fn free(&self, first: u64, n: u64) -> Result<()>;

    /// Total blocks under allocator management.
    fn data_total(&self) -> u64;

    /// Blocks currently allocated.
    fn data_used(&self) -> u64;

    /// Blocks on the free list.
    fn data_free(&self) -> u64 {
        self.data_total() - self.data_used()
    }
}

/// Persistent anchor of the [Allocator].
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Anchor {
    /// First block of the metadata chain, [NIL_BLOCK] when the
    /// allocator was never saved with extents.
    pub meta_head: u64,
    pub total: u64,
    pub used: u64,
}

impl Default for Anchor {
    fn default() -> Anchor {
        Anchor {
            meta_head: NIL_BLOCK,
            total: 0,
            used: 0,
        }
    }
}

impl Codec for Anchor {
    const SIZE: usize = 24;

    fn encode(&self, buf: &mut [u8]) {
        self.meta_head.encode(buf);
        self.total.encode(&mut buf[8..]);
        self.used.encode(&mut buf[16..]);
    }

    fn decode(buf: &[u8]) -> Result<Self> {
        Ok(Anchor {
            meta_head: u64::decode(buf)?,
            total: u64::decode(&buf[8..])?,
            used: u64::decode(&buf[16..])?,
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
struct Extent {
    size: u64,
    free: bool,
}

// metadata block layout: next u64, count u32, then packed extent
// records (start u64, size u64, free u8).
const META_HEADER_SIZE: usize = 12;
const META_ENTRY_SIZE: usize = 17;

struct AllocInner {
    engine: Engine,
    anchor_loc: AnchorLoc,
    chunk_blocks: u64,

    // every managed block belongs to exactly one extent.
    extents: BTreeMap<u64, Extent>,
    // (size, start) over free extents; best fit is the first entry
    // with size >= request.
    free_index: BTreeSet<(u64, u64)>,
    total: u64,
    used: u64,

    meta_chain: Vec<u64>,
}

/// Best-fit allocator of contiguous block runs. Cheap-to-clone
/// handle, clones share one instance.
pub struct Allocator {
    inner: Rc<RefCell<AllocInner>>,
}

impl Clone for Allocator {
    fn clone(&self) -> Allocator {
        Allocator {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl Allocator {
    /// Set up a fresh allocator and store its (empty) anchor at
    /// `anchor_loc`.
    pub fn create(
        engine: Engine,
        anchor_loc: AnchorLoc,
        config: AllocConfig,
    ) -> Result<Allocator> {
        let chunk_blocks = config.chunk_blocks.max(1);
        anchor_loc.to_cell::<Anchor>(&engine)?.store(&Anchor::default())?;

        let inner = AllocInner {
            engine,
            anchor_loc,
            chunk_blocks,
            extents: BTreeMap::new(),
            free_index: BTreeSet::new(),
            total: 0,
            used: 0,
            meta_chain: vec![],
        };
        Ok(Allocator {
            inner: Rc::new(RefCell::new(inner)),
        })
    }

    /// Reconstruct an allocator from its anchor at `anchor_loc`.
    pub fn load(
        engine: Engine,
        anchor_loc: AnchorLoc,
        config: AllocConfig,
    ) -> Result<Allocator> {
        let chunk_blocks = config.chunk_blocks.max(1);
        let mut inner = AllocInner {
            engine,
            anchor_loc,
            chunk_blocks,
            extents: BTreeMap::new(),
            free_index: BTreeSet::new(),
            total: 0,
            used: 0,
            meta_chain: vec![],
        };
        inner.load_state()?;
        Ok(Allocator {
            inner: Rc::new(RefCell::new(inner)),
        })
    }

    /// Throw the in-memory picture away and rebuild it from the
    /// persisted state. Used after a transaction rollback.
    pub fn reload(&self) -> Result<()> {
        let mut inner = self.inner.borrow_mut();
        inner.extents.clear();
        inner.free_index.clear();
        inner.total = 0;
        inner.used = 0;
        inner.meta_chain.clear();
        inner.load_state()
    }

    /// Persist the extent table into the metadata chain and store the
    /// anchor. Call before committing or flushing the engine.
    pub fn save(&self) -> Result<()> {
        self.inner.borrow_mut().save()
    }

    pub fn to_chunk_blocks(&self) -> u64 {
        self.inner.borrow().chunk_blocks
    }

    pub fn to_anchor_loc(&self) -> AnchorLoc {
        self.inner.borrow().anchor_loc
    }

    pub fn as_engine(&self) -> Engine {
        self.inner.borrow().engine.clone()
    }
}

impl BlockAlloc for Allocator {
    fn allocate(&self, n: u64) -> Result<u64> {
        if n == 0 {
            return err_at!(BadArgument, msg: "allocate zero blocks");
        }
        self.inner.borrow_mut().allocate(n)
    }

    fn free(&self, first: u64, n: u64) -> Result<()> {
        if n == 0 {
            return err_at!(BadArgument, msg: "free zero blocks");
        }
        self.inner.borrow_mut().free(first, n)
    }

    fn data_total(&self) -> u64 {
        self.inner.borrow().total
    }

    fn data_used(&self) -> u64 {
        self.inner.borrow().used
    }
}

impl AllocInner {
    fn allocate(&mut self, n: u64) -> Result<u64> {
        loop {
            if let Some(&(size, start)) = self.free_index.range((n, 0)..).next() {
                self.free_index.remove(&(size, start));
                self.extents.remove(&start);
                self.extents.insert(start, Extent { size: n, free: false });
                if size > n {
                    self.extents.insert(start + n, Extent { size: size - n, free: true });
                    self.free_index.insert((size - n, start + n));
                }
                self.used += n;
                return Ok(start);
            }

            // no free extent satisfies the request, grow the file.
            let k = n.max(self.chunk_blocks);
            let start = self.engine.size()?;
            self.engine.grow(k)?;
            self.total += k;
            self.add_free(start, k);
            debug!(target: "alloc ", "grown file by {} blocks to {}", k, start + k);
        }
    }

    fn free(&mut self, first: u64, n: u64) -> Result<()> {
        let ext = match self.extents.get(&first) {
            Some(ext) => *ext,
            None => return err_at!(BadArgument, msg: "free({}, {}): no extent", first, n),
        };
        if ext.free {
            return err_at!(BadArgument, msg: "free({}, {}): already free", first, n);
        }
        if n > ext.size {
            return err_at!(BadArgument, msg: "free({}, {}): extent is {}", first, n, ext.size);
        }

        self.extents.remove(&first);
        if ext.size > n {
            // an allocated extent is split only at a release request.
            self.extents.insert(first + n, Extent { size: ext.size - n, free: false });
        }
        self.used -= n;
        self.add_free(first, n);
        Ok(())
    }

    // Insert a free run, coalescing with both neighbours.
    fn add_free(&mut self, start: u64, size: u64) {
        let mut start = start;
        let mut size = size;

        if let Some((&prev_start, &prev)) = self.extents.range(..start).next_back() {
            if prev.free && prev_start + prev.size == start {
                self.extents.remove(&prev_start);
                self.free_index.remove(&(prev.size, prev_start));
                start = prev_start;
                size += prev.size;
            }
        }
        if let Some(&next) = self.extents.get(&(start + size)) {
            if next.free {
                self.extents.remove(&(start + size));
                self.free_index.remove(&(next.size, start + size));
                size += next.size;
            }
        }

        self.extents.insert(start, Extent { size, free: true });
        self.free_index.insert((size, start));
    }

    fn load_state(&mut self) -> Result<()> {
        let anchor: Anchor = self.anchor_loc.to_cell(&self.engine)?.fetch()?;

        let mut index = anchor.meta_head;
        while index != NIL_BLOCK {
            self.meta_chain.push(index);
            let handle = self.engine.pin(index, true)?;
            let next: u64 = handle.get(0)?;
            let count: u32 = handle.get(8)?;
            for i in 0..count as usize {
                let offset = META_HEADER_SIZE + i * META_ENTRY_SIZE;
                let start: u64 = handle.get(offset)?;
                let size: u64 = handle.get(offset + 8)?;
                let free: bool = handle.get(offset + 16)?;
                if size == 0 || self.extents.insert(start, Extent { size, free }).is_some() {
                    return err_at!(Corruption, msg: "allocator extent ({}, {})", start, size);
                }
                if free {
                    self.free_index.insert((size, start));
                } else {
                    self.used += size;
                }
                self.total += size;
            }
            index = next;
        }

        if self.total != anchor.total || self.used != anchor.used {
            return err_at!(
                Corruption, msg: "allocator counters {}/{} expected {}/{}",
                self.total, self.used, anchor.total, anchor.used
            );
        }
        info!(
            target: "alloc ",
            "loaded {} extents, {} total, {} used", self.extents.len(), self.total, self.used
        );
        Ok(())
    }

    fn save(&mut self) -> Result<()> {
        let block_size = self.engine.block_size();
        let per_block = (block_size - META_HEADER_SIZE) / META_ENTRY_SIZE;
        let entries: Vec<(u64, Extent)> =
            self.extents.iter().map(|(k, v)| (*k, *v)).collect();
        let needed = util::ceil_div(util::to_u64(entries.len())?, util::to_u64(per_block)?);

        // metadata blocks come from raw growth, not from allocate(),
        // so the state being saved cannot change under our feet.
        while util::to_u64(self.meta_chain.len())? < needed {
            let index = self.engine.size()?;
            self.engine.grow(1)?;
            self.meta_chain.push(index);
        }

        for (i, &index) in self.meta_chain.iter().enumerate() {
            let handle = self.engine.overwrite_zero(index)?;
            let next = self.meta_chain.get(i + 1).copied().unwrap_or(NIL_BLOCK);
            handle.set(0, &next)?;

            let chunk: &[(u64, Extent)] = match entries.get(i * per_block..) {
                Some(rest) => &rest[..rest.len().min(per_block)],
                None => &[],
            };
            let count = err_at!(FailConvert, u32::try_from(chunk.len()))?;
            handle.set(8, &count)?;
            for (j, (start, ext)) in chunk.iter().enumerate() {
                let offset = META_HEADER_SIZE + j * META_ENTRY_SIZE;
                handle.set(offset, start)?;
                handle.set(offset + 8, &ext.size)?;
                handle.set(offset + 16, &ext.free)?;
            }
        }

        let anchor = Anchor {
            meta_head: self.meta_chain.first().copied().unwrap_or(NIL_BLOCK),
            total: self.total,
            used: self.used,
        };
        self.anchor_loc.to_cell::<Anchor>(&self.engine)?.store(&anchor)?;
        Ok(())
    }
}

#[cfg(test)]
#[path = "mod_test.rs"]
mod mod_test;
