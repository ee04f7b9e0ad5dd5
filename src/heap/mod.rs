//! Module `heap` implement garbage-collected storage for
//! variable-sized blobs.
//!
//! Objects are addressed by a [Reference], the index of a slot in the
//! object table. The table maps each live reference to the object's
//! current on-disk address, so storage can move without invalidating
//! references. Storage itself is organised in chunks of blocks
//! obtained from the allocator: small objects share chunks carved
//! into 16-byte cells and managed by a segregated free list, any
//! object above [Heap::max_small_object_cells] occupies a chunk of
//! its own.
//!
//! Every object starts with an 8-byte header holding its own slot
//! index; loads verify the round trip, catching stale references and
//! corrupted tables.
//!
//! Space is reclaimed by mark-and-sweep collection driven by the
//! caller, see [Heap::collect]. Object types are registered up front
//! with a [TypeRegistry]; a type says whether its objects carry
//! references (and how to enumerate them) and may attach a finalizer
//! that fires once per reclaimed object.

use arbitrary::Arbitrary;
use log::info;

use std::{cell::RefCell, rc::Rc};

use crate::{
    alloc::BlockAlloc,
    anchor::AnchorCell,
    btree::{self, Tree, TreeValue},
    codec::{self, Codec},
    config::HeapConfig,
    engine::Engine,
    heap::{
        freelist::{SegregatedFreeList, N_LISTS, NIL_CELL},
        table::{Entry, ObjectTable, TableAnchor},
    },
    util, Result,
};

pub mod freelist;
pub mod gc;
pub mod table;

pub use gc::{Collector, GcStats};

/// The minimum unit of heap allocation, in bytes.
pub const CELL_SIZE: usize = 16;

/// Bytes of bookkeeping in front of every object.
pub const OBJECT_HEADER_SIZE: usize = 8;

/// Chunks holding more blocks than this hold exactly one object.
pub const MAX_SMALL_OBJECT_BLOCKS: u64 = 8;

/// Largest number of registered object types.
pub const MAX_TYPES: usize = 16;

/// No reference; slot indices never reach this value.
pub const NIL_REF: u64 = u64::MAX;

/// Stable handle to one blob in the heap, the index of its object
/// table slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Arbitrary)]
pub struct Reference(pub u64);

impl Codec for Reference {
    const SIZE: usize = 8;

    fn encode(&self, buf: &mut [u8]) {
        self.0.encode(buf)
    }

    fn decode(buf: &[u8]) -> Result<Self> {
        Ok(Reference(u64::decode(buf)?))
    }
}

/// Identifier of a registered object type, bounded at [MAX_TYPES].
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TypeId(pub u8);

/// Description of one object type.
#[derive(Clone)]
pub struct TypeSpec {
    /// Objects of this type vary in size. When false, every insert
    /// must supply exactly `fixed_size` bytes and loads cross-check
    /// the slot against it.
    pub dynamic_size: bool,
    /// Payload size of fixed-size types, in bytes.
    pub fixed_size: usize,
    /// Objects of this type embed references to other heap objects.
    pub contains_references: bool,
    /// Called with the payload; pushes every embedded reference.
    pub visit_children: Option<Rc<dyn Fn(&[u8], &mut Vec<Reference>)>>,
    /// Fired exactly once per reclaimed object, before its slot
    /// becomes reusable. Must not allocate within this heap.
    pub finalizer: Option<Rc<RefCell<dyn FnMut(Reference)>>>,
}

impl TypeSpec {
    /// A plain byte blob: dynamic size, no references, no finalizer.
    pub fn blob() -> TypeSpec {
        TypeSpec {
            dynamic_size: true,
            fixed_size: 0,
            contains_references: false,
            visit_children: None,
            finalizer: None,
        }
    }
}

/// Object types known to a heap, fixed at construction.
#[derive(Clone)]
pub struct TypeRegistry {
    specs: Vec<TypeSpec>,
}

impl Default for TypeRegistry {
    fn default() -> TypeRegistry {
        TypeRegistry::new()
    }
}

impl TypeRegistry {
    /// A fresh registry; type 0 is pre-registered as a plain blob.
    pub fn new() -> TypeRegistry {
        TypeRegistry {
            specs: vec![TypeSpec::blob()],
        }
    }

    /// Register a type, returning its identifier.
    pub fn register(&mut self, spec: TypeSpec) -> Result<TypeId> {
        if self.specs.len() >= MAX_TYPES {
            return err_at!(BadArgument, msg: "more than {} heap types", MAX_TYPES);
        }
        let id = self.specs.len() as u8;
        self.specs.push(spec);
        Ok(TypeId(id))
    }
}

/// The pre-registered blob type.
pub const BLOB_TYPE: TypeId = TypeId(0);

// Persistent chunk record: a run of blocks owned by the heap, either
// a pool of cells or a single large object.
#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) struct ChunkRec {
    pub addr: u64, // first block
    pub blocks: u64,
    pub large: bool,
}

impl Codec for ChunkRec {
    const SIZE: usize = 17;

    fn encode(&self, buf: &mut [u8]) {
        self.addr.encode(buf);
        self.blocks.encode(&mut buf[8..]);
        self.large.encode(&mut buf[16..]);
    }

    fn decode(buf: &[u8]) -> Result<Self> {
        Ok(ChunkRec {
            addr: u64::decode(buf)?,
            blocks: u64::decode(&buf[8..])?,
            large: bool::decode(&buf[16..])?,
        })
    }
}

impl TreeValue for ChunkRec {
    type Key = u64;

    fn key(&self) -> u64 {
        self.addr
    }
}

/// Persistent anchor of the heap. Embeds the object table anchor, the
/// chunk index anchor, the free list heads, the large-range tree
/// anchor and the object-table free list head.
#[derive(Clone)]
pub struct Anchor {
    pub(crate) table: TableAnchor,
    pub(crate) chunks: btree::Anchor,
    pub(crate) heads: [u64; N_LISTS],
    pub(crate) large: btree::Anchor,
    pub(crate) next_free_slot: u64,
}

const TABLE_OFFSET: usize = 0;
const CHUNKS_OFFSET: usize = TableAnchor::SIZE;
const HEADS_OFFSET: usize = CHUNKS_OFFSET + btree::Anchor::SIZE;
const LARGE_OFFSET: usize = HEADS_OFFSET + 8 * N_LISTS;
const NEXT_FREE_OFFSET: usize = LARGE_OFFSET + btree::Anchor::SIZE;

impl Default for Anchor {
    fn default() -> Anchor {
        Anchor {
            table: TableAnchor::default(),
            chunks: btree::Anchor::default(),
            heads: [NIL_CELL; N_LISTS],
            large: btree::Anchor::default(),
            next_free_slot: NIL_REF,
        }
    }
}

impl Codec for Anchor {
    const SIZE: usize = NEXT_FREE_OFFSET + 8;

    fn encode(&self, buf: &mut [u8]) {
        self.table.encode(&mut buf[TABLE_OFFSET..]);
        self.chunks.encode(&mut buf[CHUNKS_OFFSET..]);
        self.heads.encode(&mut buf[HEADS_OFFSET..]);
        self.large.encode(&mut buf[LARGE_OFFSET..]);
        self.next_free_slot.encode(&mut buf[NEXT_FREE_OFFSET..]);
    }

    fn decode(buf: &[u8]) -> Result<Self> {
        Ok(Anchor {
            table: TableAnchor::decode(&buf[TABLE_OFFSET..])?,
            chunks: btree::Anchor::decode(&buf[CHUNKS_OFFSET..])?,
            heads: <[u64; N_LISTS]>::decode(&buf[HEADS_OFFSET..])?,
            large: btree::Anchor::decode(&buf[LARGE_OFFSET..])?,
            next_free_slot: u64::decode(&buf[NEXT_FREE_OFFSET..])?,
        })
    }
}

pub(crate) struct HeapInner {
    pub(crate) engine: Engine,
    pub(crate) alloc: Rc<dyn BlockAlloc>,
    pub(crate) table: ObjectTable,
    pub(crate) chunks: Tree<ChunkRec>,
    pub(crate) free_list: SegregatedFreeList,
    next_free_cell: AnchorCell<u64>,
    pub(crate) next_free_slot: u64,
    pub(crate) types: Vec<TypeSpec>,
    pub(crate) chunk_blocks: u64,
    pub(crate) block_size: usize,
    pub(crate) collecting: bool,
}

/// Garbage-collected blob heap. Cheap-to-clone handle.
pub struct Heap {
    pub(crate) inner: Rc<RefCell<HeapInner>>,
}

impl Clone for Heap {
    fn clone(&self) -> Heap {
        Heap {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl Heap {
    /// Set up a fresh heap, storing its anchor through `cell`.
    pub fn create(
        engine: Engine,
        alloc: Rc<dyn BlockAlloc>,
        cell: AnchorCell<Anchor>,
        config: HeapConfig,
        types: TypeRegistry,
    ) -> Result<Heap> {
        cell.store(&Anchor::default())?;

        let table = ObjectTable::create(
            engine.clone(),
            Rc::clone(&alloc),
            cell.project(TABLE_OFFSET)?,
        )?;
        let chunks = Tree::create(
            engine.clone(),
            Rc::clone(&alloc),
            cell.project(CHUNKS_OFFSET)?,
        )?;
        let free_list = SegregatedFreeList::create(
            engine.clone(),
            Rc::clone(&alloc),
            cell.project(HEADS_OFFSET)?,
            cell.project(LARGE_OFFSET)?,
        )?;
        let next_free_cell: AnchorCell<u64> = cell.project(NEXT_FREE_OFFSET)?;
        next_free_cell.store(&NIL_REF)?;

        let inner = HeapInner::new(engine, alloc, table, chunks, free_list, next_free_cell, NIL_REF, config, types)?;
        info!(
            target: "heap  ",
            "created heap, chunk {} blocks, {} types", inner.chunk_blocks, inner.types.len()
        );
        Ok(Heap {
            inner: Rc::new(RefCell::new(inner)),
        })
    }

    /// Reconstruct a heap from its anchor. The registry must list the
    /// same types that built the heap.
    pub fn load(
        engine: Engine,
        alloc: Rc<dyn BlockAlloc>,
        cell: AnchorCell<Anchor>,
        config: HeapConfig,
        types: TypeRegistry,
    ) -> Result<Heap> {
        let table = ObjectTable::load(
            engine.clone(),
            Rc::clone(&alloc),
            cell.project(TABLE_OFFSET)?,
        )?;
        let chunks = Tree::load(
            engine.clone(),
            Rc::clone(&alloc),
            cell.project(CHUNKS_OFFSET)?,
        )?;
        let free_list = SegregatedFreeList::load(
            engine.clone(),
            Rc::clone(&alloc),
            cell.project(HEADS_OFFSET)?,
            cell.project(LARGE_OFFSET)?,
        )?;
        let next_free_cell: AnchorCell<u64> = cell.project(NEXT_FREE_OFFSET)?;
        let next_free_slot = next_free_cell.fetch()?;

        let inner = HeapInner::new(engine, alloc, table, chunks, free_list, next_free_cell, next_free_slot, config, types)?;
        Ok(Heap {
            inner: Rc::new(RefCell::new(inner)),
        })
    }

    /// Store `data` as a new object of `typ`, returning its
    /// reference.
    pub fn insert(&self, typ: TypeId, data: &[u8]) -> Result<Reference> {
        self.inner.borrow_mut().insert(typ, data)
    }

    /// Copy the payload of `reference` out of the heap.
    pub fn load_object(&self, reference: Reference) -> Result<Vec<u8>> {
        self.inner.borrow_mut().load_object(reference)
    }

    /// Payload size of the object behind `reference`, in bytes.
    pub fn size(&self, reference: Reference) -> Result<u64> {
        let inner = self.inner.borrow();
        if reference.0 >= inner.table.len() {
            return err_at!(BadArgument, msg: "invalid reference {}", reference.0);
        }
        match inner.table.get(reference.0)? {
            Entry::Live { size, .. } => Ok(size - OBJECT_HEADER_SIZE as u64),
            Entry::Free { .. } => {
                err_at!(BadArgument, msg: "invalid reference {}", reference.0)
            }
        }
    }

    /// True if `reference` points at a live object.
    pub fn contains(&self, reference: Reference) -> bool {
        matches!(
            self.inner.borrow().table.get(reference.0),
            Ok(Entry::Live { .. })
        )
    }

    /// Number of live objects.
    pub fn len(&self) -> Result<u64> {
        let inner = self.inner.borrow();
        let mut live = 0;
        for slot in 0..inner.table.len() {
            if inner.table.get(slot)?.is_live() {
                live += 1;
            }
        }
        Ok(live)
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Objects above this many cells get a chunk of their own.
    pub fn max_small_object_cells(&self) -> u64 {
        let inner = self.inner.borrow();
        MAX_SMALL_OBJECT_BLOCKS * (inner.block_size / CELL_SIZE) as u64
    }

    /// Begin a collection. Visit every root through the returned
    /// [Collector], then call [Collector::finish]. Reentrant
    /// collection is forbidden.
    pub fn collect(&self) -> Result<Collector> {
        Collector::begin(self)
    }
}

impl HeapInner {
    fn new(
        engine: Engine,
        alloc: Rc<dyn BlockAlloc>,
        table: ObjectTable,
        chunks: Tree<ChunkRec>,
        free_list: SegregatedFreeList,
        next_free_cell: AnchorCell<u64>,
        next_free_slot: u64,
        config: HeapConfig,
        types: TypeRegistry,
    ) -> Result<HeapInner> {
        if types.specs.is_empty() || types.specs.len() > MAX_TYPES {
            return err_at!(BadArgument, msg: "{} heap types", types.specs.len());
        }
        let block_size = engine.block_size();
        // a chunk must hold a handful of maximal small objects.
        let chunk_blocks = config.chunk_blocks.max(4 * MAX_SMALL_OBJECT_BLOCKS);

        Ok(HeapInner {
            engine,
            alloc,
            table,
            chunks,
            free_list,
            next_free_cell,
            next_free_slot,
            types: types.specs,
            chunk_blocks,
            block_size,
            collecting: false,
        })
    }

    #[inline]
    pub(crate) fn cells_per_block(&self) -> u64 {
        (self.block_size / CELL_SIZE) as u64
    }

    #[inline]
    pub(crate) fn max_small_object_cells(&self) -> u64 {
        MAX_SMALL_OBJECT_BLOCKS * self.cells_per_block()
    }

    pub(crate) fn cell_count(size_bytes: u64) -> u64 {
        util::ceil_div(size_bytes, CELL_SIZE as u64)
    }

    fn insert(&mut self, typ: TypeId, data: &[u8]) -> Result<Reference> {
        if self.collecting {
            return err_at!(BadOperation, msg: "insert during collection");
        }
        let (dynamic_size, fixed_size) = match self.types.get(typ.0 as usize) {
            Some(spec) => (spec.dynamic_size, spec.fixed_size),
            None => return err_at!(BadArgument, msg: "unregistered heap type {}", typ.0),
        };
        if !dynamic_size && data.len() != fixed_size {
            return err_at!(
                BadArgument, msg: "type {} takes {} bytes, got {}",
                typ.0, fixed_size, data.len()
            );
        }

        let object_size = util::to_u64(OBJECT_HEADER_SIZE + data.len())?;
        let cells = Self::cell_count(object_size);
        let addr = self.allocate_cells(cells)?;

        let slot = self.insert_slot(typ, addr, object_size)?;
        write_bytes(&self.engine, addr, &codec::to_bytes(&slot))?;
        write_bytes(&self.engine, addr + OBJECT_HEADER_SIZE as u64, data)?;
        Ok(Reference(slot))
    }

    fn load_object(&mut self, reference: Reference) -> Result<Vec<u8>> {
        if reference.0 >= self.table.len() {
            return err_at!(BadArgument, msg: "invalid reference {}", reference.0);
        }
        let (addr, size) = match self.table.get(reference.0)? {
            Entry::Live { addr, size, .. } => (addr, size),
            Entry::Free { .. } => {
                return err_at!(BadArgument, msg: "invalid reference {}", reference.0)
            }
        };

        let mut header = [0; OBJECT_HEADER_SIZE];
        read_bytes(&self.engine, addr, &mut header)?;
        let slot = u64::decode(&header)?;
        if slot != reference.0 {
            return err_at!(
                Corruption, msg: "object header {} for reference {}", slot, reference.0
            );
        }

        let mut data = vec![0; util::to_usize(size)? - OBJECT_HEADER_SIZE];
        read_bytes(&self.engine, addr + OBJECT_HEADER_SIZE as u64, &mut data)?;
        Ok(data)
    }

    // Find room for `cells` cells and return a cell-aligned byte
    // address.
    fn allocate_cells(&mut self, cells: u64) -> Result<u64> {
        if cells >= self.max_small_object_cells() {
            return self.allocate_large_object_chunk(cells);
        }
        if let Some(addr) = self.free_list.allocate(cells)? {
            return Ok(addr);
        }
        self.allocate_chunk()?;
        match self.free_list.allocate(cells)? {
            Some(addr) => Ok(addr),
            None => err_at!(Fatal, msg: "fresh chunk cannot satisfy {} cells", cells),
        }
    }

    fn allocate_large_object_chunk(&mut self, cells: u64) -> Result<u64> {
        let blocks = util::ceil_div(cells, self.cells_per_block());
        let addr = self.alloc.allocate(blocks)?;
        self.chunks.insert(&ChunkRec {
            addr,
            blocks,
            large: true,
        })?;
        Ok(addr * util::to_u64(self.block_size)?)
    }

    // Acquire a fresh small-object chunk and hand its entire cell
    // range to the free list.
    fn allocate_chunk(&mut self) -> Result<()> {
        let blocks = self.chunk_blocks;
        let addr = self.alloc.allocate(blocks)?;
        self.chunks.insert(&ChunkRec {
            addr,
            blocks,
            large: false,
        })?;
        self.free_list.free(
            addr * util::to_u64(self.block_size)?,
            blocks * self.cells_per_block(),
        )?;
        info!(target: "heap  ", "allocated chunk of {} blocks at {}", blocks, addr);
        Ok(())
    }

    // Take a slot from the table free list, or grow the table.
    fn insert_slot(&mut self, typ: TypeId, addr: u64, size: u64) -> Result<u64> {
        let entry = Entry::Live {
            type_tag: typ.0,
            addr,
            size,
        };
        if self.next_free_slot != NIL_REF {
            let slot = self.next_free_slot;
            let next = match self.table.get(slot)? {
                Entry::Free { next } => next,
                Entry::Live { .. } => {
                    return err_at!(Corruption, msg: "free-list slot {} is live", slot)
                }
            };
            self.table.set(slot, entry)?;
            self.set_next_free_slot(next)?;
            return Ok(slot);
        }
        self.table.push(entry)
    }

    pub(crate) fn set_next_free_slot(&mut self, next: u64) -> Result<()> {
        self.next_free_slot = next;
        self.next_free_cell.store(&next)
    }
}

/// Read bytes at an arbitrary byte address, crossing block
/// boundaries as needed.
pub(crate) fn read_bytes(engine: &Engine, addr: u64, buf: &mut [u8]) -> Result<()> {
    let block_size = util::to_u64(engine.block_size())?;
    let mut addr = addr;
    let mut done = 0;
    while done < buf.len() {
        let block = addr / block_size;
        let offset = util::to_usize(addr % block_size)?;
        let n = (engine.block_size() - offset).min(buf.len() - done);
        let handle = engine.pin(block, true)?;
        handle.read_at(offset, &mut buf[done..done + n])?;
        addr += util::to_u64(n)?;
        done += n;
    }
    Ok(())
}

/// Write bytes at an arbitrary byte address, crossing block
/// boundaries as needed.
pub(crate) fn write_bytes(engine: &Engine, addr: u64, data: &[u8]) -> Result<()> {
    let block_size = util::to_u64(engine.block_size())?;
    let mut addr = addr;
    let mut done = 0;
    while done < data.len() {
        let block = addr / block_size;
        let offset = util::to_usize(addr % block_size)?;
        let n = (engine.block_size() - offset).min(data.len() - done);
        let handle = engine.pin(block, true)?;
        handle.write_at(offset, &data[done..done + n])?;
        addr += util::to_u64(n)?;
        done += n;
    }
    Ok(())
}
