//! Module `engine` implement the paging layer: the file is presented
//! as an array of fixed-size blocks, frequently used blocks are
//! cached in memory, and applications modify blocks in memory and
//! flush them later.
//!
//! Two kinds of engine share this module. The plain file engine reads
//! and writes the database file directly; flushing a dirty block
//! overwrites its slot in the file. The transactional engine deflects
//! every block write into a write-ahead [journal] instead, giving
//! atomic multi-block transactions; committed blocks migrate into the
//! database file only on [Engine::checkpoint].
//!
//! Blocks are accessed through [BlockHandle] values. A handle pins
//! its block in memory; clones of a handle share the block and writes
//! through one clone are immediately visible through the others. When
//! the last handle drops, the block moves into an LRU cache bounded
//! by [crate::config::EngineConfig::cache_blocks].

use log::info;

use std::{cell::RefCell, ops, rc::Rc};

use crate::{
    codec::Codec,
    config::{EngineConfig, JournalConfig},
    engine::{
        block::{Block, BlockCache, BlockMap, BlockPool, DirtySet},
        journal::Journal,
    },
    util,
    vfs::FileIo,
    Result,
};

pub mod block;
pub mod journal;

/// Smallest block size the engine accepts. Anything smaller cannot
/// hold the file header, let alone a tree node.
pub const MIN_BLOCK_SIZE: usize = 128;

/// Performance counters of one engine instance.
#[derive(Clone, Debug, Default)]
pub struct Stats {
    /// Number of block reads that went to the backend.
    pub reads: usize,
    /// Number of block writes that went to the backend.
    pub writes: usize,
    /// Number of pins satisfied from the cache.
    pub cache_hits: usize,
}

// The two engine flavours, selected at construction.
enum Backend {
    File {
        fd: Box<dyn FileIo>,
    },
    Txn {
        dbfd: Box<dyn FileIo>,
        journal: Journal,
        // Size of the database file on disk, in blocks.
        dbfile_size: u64,
        // Current, possibly uncommitted, size of the database in blocks.
        size: u64,
        txn_started: bool,
    },
}

struct EngineInner {
    block_size: usize,
    max_blocks: usize,
    read_only: bool,
    closed: bool,

    blocks: BlockMap,
    cache: BlockCache,
    dirty: DirtySet,
    pool: BlockPool,
    // Number of distinct pinned blocks.
    pinned: usize,

    stats: Stats,
    backend: Backend,
}

/// Paging engine over one database file.
///
/// `Engine` is a cheap-to-clone handle; clones refer to the same
/// underlying instance. All state is owned by that instance, multiple
/// engines in one process are fully independent.
pub struct Engine {
    inner: Rc<RefCell<EngineInner>>,
}

impl Clone for Engine {
    fn clone(&self) -> Engine {
        Engine {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl Engine {
    /// Create a plain file engine over `fd`.
    pub fn file_engine(fd: Box<dyn FileIo>, config: EngineConfig) -> Result<Engine> {
        let read_only = config.read_only || fd.is_read_only();
        let inner = EngineInner::new(config, read_only, Backend::File { fd })?;
        info!(
            target: "engine", "file engine, block-size {}, cache {} blocks",
            inner.block_size, inner.max_blocks
        );
        Ok(Engine {
            inner: Rc::new(RefCell::new(inner)),
        })
    }

    /// Create a transactional engine over the database file `dbfd`
    /// and the journal file `logfd`. An existing journal is replayed;
    /// a partial tail, left behind by a crash, is truncated away.
    pub fn transaction_engine(
        dbfd: Box<dyn FileIo>,
        logfd: Box<dyn FileIo>,
        config: EngineConfig,
        jconfig: JournalConfig,
    ) -> Result<Engine> {
        let read_only = config.read_only || dbfd.is_read_only();
        let block_size = config.block_size;

        let journal = if logfd.file_size()? == 0 {
            if logfd.is_read_only() {
                return err_at!(ReadOnly, msg: "fresh journal on read-only file");
            }
            Journal::create(logfd, block_size, jconfig)?
        } else {
            Journal::open(logfd, block_size, jconfig)?
        };

        let dbfile_size = {
            let bytes = dbfd.file_size()?;
            let bs = util::to_u64(block_size)?;
            if bytes % bs != 0 {
                return err_at!(Corruption, msg: "database size {} not block aligned", bytes);
            }
            bytes / bs
        };
        let size = journal.to_database_size().unwrap_or(dbfile_size);

        let backend = Backend::Txn {
            dbfd,
            journal,
            dbfile_size,
            size,
            txn_started: false,
        };
        let inner = EngineInner::new(config, read_only, backend)?;
        info!(
            target: "engine",
            "transaction engine, block-size {}, database {} blocks", block_size, size
        );
        Ok(Engine {
            inner: Rc::new(RefCell::new(inner)),
        })
    }

    pub fn block_size(&self) -> usize {
        self.inner.borrow().block_size
    }

    pub fn is_read_only(&self) -> bool {
        self.inner.borrow().read_only
    }

    /// True for engines built with [Engine::transaction_engine].
    pub fn is_transactional(&self) -> bool {
        matches!(self.inner.borrow().backend, Backend::Txn { .. })
    }

    /// Size of the database in blocks.
    pub fn size(&self) -> Result<u64> {
        self.inner.borrow().size()
    }

    /// Extend the database by `n` blocks, zero-filled.
    pub fn grow(&self, n: u64) -> Result<()> {
        self.inner.borrow_mut().grow(n)
    }

    /// Shrink the database to exactly `n` blocks. Blocks at or beyond
    /// `n` must not be pinned.
    pub fn truncate(&self, n: u64) -> Result<()> {
        self.inner.borrow_mut().truncate(n)
    }

    /// Pin the block at `index` and return a handle to it. With
    /// `initialize` the block content is loaded from disk (or the
    /// journal) unless it is already in memory; without, the buffer
    /// content is unspecified and the caller is expected to overwrite
    /// it before marking the block dirty.
    pub fn pin(&self, index: u64, initialize: bool) -> Result<BlockHandle> {
        let blk = self.inner.borrow_mut().pin(index, initialize)?;
        Ok(BlockHandle::new(Rc::clone(&self.inner), blk))
    }

    /// Pin the block at `index` with its buffer deterministically
    /// zeroed and marked dirty. Used when logically allocating a
    /// fresh block.
    pub fn overwrite_zero(&self, index: u64) -> Result<BlockHandle> {
        let mut inner = self.inner.borrow_mut();
        let blk = inner.pin(index, false)?;
        blk.as_data().borrow_mut().iter_mut().for_each(|b| *b = 0);
        if let Err(err) = inner.mark_dirty(index) {
            inner.unpin(index);
            return Err(err);
        }
        drop(inner);
        Ok(BlockHandle::new(Rc::clone(&self.inner), blk))
    }

    /// Write all dirty blocks back. Does not imply an fsync.
    pub fn flush(&self) -> Result<()> {
        self.inner.borrow_mut().flush_all()
    }

    /// Fsync the database file (file engine only; the transactional
    /// engine syncs through commit and checkpoint).
    pub fn sync(&self) -> Result<()> {
        match &mut self.inner.borrow_mut().backend {
            Backend::File { fd } => fd.sync(),
            Backend::Txn { .. } => err_at!(BadOperation, msg: "sync on transaction engine"),
        }
    }

    pub fn to_stats(&self) -> Stats {
        self.inner.borrow().stats.clone()
    }

    /// Final flush and close of the underlying files. An engine
    /// closed while a transaction is open behaves like a crash: the
    /// transaction is rolled back on the next open.
    pub fn close(&self) -> Result<()> {
        self.inner.borrow_mut().close()
    }
}

/// Transactional operations. All of these fail with `BadOperation`
/// on a plain file engine.
impl Engine {
    /// Start a transaction.
    pub fn begin(&self) -> Result<()> {
        let mut inner = self.inner.borrow_mut();
        if inner.read_only {
            return err_at!(ReadOnly, msg: "begin");
        }
        match &mut inner.backend {
            Backend::Txn { journal, txn_started, .. } => {
                journal.begin()?;
                *txn_started = true;
                Ok(())
            }
            Backend::File { .. } => err_at!(BadOperation, msg: "begin on file engine"),
        }
    }

    /// Commit the running transaction. All dirty blocks are flushed
    /// into the journal first; the commit record makes them durable.
    pub fn commit(&self) -> Result<()> {
        let mut inner = self.inner.borrow_mut();
        match &inner.backend {
            Backend::Txn { txn_started: false, .. } => {
                return err_at!(BadOperation, msg: "commit without begin")
            }
            Backend::File { .. } => {
                return err_at!(BadOperation, msg: "commit on file engine")
            }
            Backend::Txn { .. } => (),
        }
        inner.flush_all()?;
        match &mut inner.backend {
            Backend::Txn { journal, size, txn_started, .. } => {
                journal.commit(*size)?;
                *txn_started = false;
                Ok(())
            }
            Backend::File { .. } => unreachable!(),
        }
    }

    /// Abort the running transaction. Every block the transaction
    /// touched is discarded from memory, so subsequent reads see the
    /// pre-transaction state. Fails while block handles are live.
    pub fn rollback(&self) -> Result<()> {
        let mut inner = self.inner.borrow_mut();
        match &inner.backend {
            Backend::Txn { txn_started: false, .. } => {
                return err_at!(BadOperation, msg: "rollback without begin")
            }
            Backend::File { .. } => {
                return err_at!(BadOperation, msg: "rollback on file engine")
            }
            Backend::Txn { .. } => (),
        }
        if inner.pinned > 0 {
            return err_at!(BadOperation, msg: "rollback with {} pinned blocks", inner.pinned);
        }

        for index in inner.dirty.indices() {
            inner.discard(index);
        }
        let journaled = match &inner.backend {
            Backend::Txn { journal, .. } => journal.to_uncommitted_blocks(),
            Backend::File { .. } => unreachable!(),
        };
        for index in journaled.into_iter() {
            inner.discard(index);
        }
        match &mut inner.backend {
            Backend::Txn { journal, size, dbfile_size, txn_started, .. } => {
                journal.rollback()?;
                *size = journal.to_database_size().unwrap_or(*dbfile_size);
                *txn_started = false;
                Ok(())
            }
            Backend::File { .. } => unreachable!(),
        }
    }

    /// Migrate all committed blocks from the journal into the
    /// database file and reset the journal to its header. Must not be
    /// called inside a transaction.
    pub fn checkpoint(&self) -> Result<()> {
        let mut inner = self.inner.borrow_mut();
        if inner.read_only {
            return err_at!(ReadOnly, msg: "checkpoint");
        }
        match &mut inner.backend {
            Backend::Txn { dbfd, journal, dbfile_size, size, txn_started } => {
                if *txn_started {
                    return err_at!(BadOperation, msg: "checkpoint inside transaction");
                }
                if journal.checkpoint(dbfd.as_mut())? {
                    let bs = util::to_u64(journal.to_block_size())?;
                    *dbfile_size = dbfd.file_size()? / bs;
                    *size = *dbfile_size;
                }
                Ok(())
            }
            Backend::File { .. } => err_at!(BadOperation, msg: "checkpoint on file engine"),
        }
    }

    pub fn in_transaction(&self) -> bool {
        match &self.inner.borrow().backend {
            Backend::Txn { txn_started, .. } => *txn_started,
            Backend::File { .. } => false,
        }
    }

    /// Current size of the journal file in bytes.
    pub fn journal_size(&self) -> Result<u64> {
        match &self.inner.borrow().backend {
            Backend::Txn { journal, .. } => Ok(journal.to_log_size()),
            Backend::File { .. } => err_at!(BadOperation, msg: "no journal on file engine"),
        }
    }

    /// True if the journal holds committed changes that a checkpoint
    /// would move into the database file.
    pub fn journal_has_changes(&self) -> bool {
        match &self.inner.borrow().backend {
            Backend::Txn { journal, .. } => journal.has_committed_changes(),
            Backend::File { .. } => false,
        }
    }

    pub fn is_sync_on_commit(&self) -> bool {
        match &self.inner.borrow().backend {
            Backend::Txn { journal, .. } => journal.is_sync_on_commit(),
            Backend::File { .. } => false,
        }
    }

    pub fn set_sync_on_commit(&self, enabled: bool) {
        if let Backend::Txn { journal, .. } = &mut self.inner.borrow_mut().backend {
            journal.set_sync_on_commit(enabled);
        }
    }
}

impl EngineInner {
    fn new(config: EngineConfig, read_only: bool, backend: Backend) -> Result<EngineInner> {
        let block_size = config.block_size;
        if block_size < MIN_BLOCK_SIZE || !block_size.is_power_of_two() {
            return err_at!(BadArgument, msg: "block size {}", block_size);
        }
        let max_blocks = config.cache_blocks.max(1);

        Ok(EngineInner {
            block_size,
            max_blocks,
            read_only,
            closed: false,

            blocks: BlockMap::default(),
            cache: BlockCache::default(),
            dirty: DirtySet::default(),
            // a few spare buffers above the cache bound avoid
            // trashing on new/delete.
            pool: BlockPool::new(max_blocks / 8 + 4),
            pinned: 0,

            stats: Stats::default(),
            backend,
        })
    }

    fn size(&self) -> Result<u64> {
        match &self.backend {
            Backend::File { fd } => {
                let bytes = fd.file_size()?;
                let bs = util::to_u64(self.block_size)?;
                if bytes % bs != 0 {
                    return err_at!(Corruption, msg: "file size {} not block aligned", bytes);
                }
                Ok(bytes / bs)
            }
            Backend::Txn { size, .. } => Ok(*size),
        }
    }

    fn grow(&mut self, n: u64) -> Result<()> {
        if self.read_only {
            return err_at!(ReadOnly, msg: "grow");
        }
        match &mut self.backend {
            Backend::File { fd } => {
                let bytes = fd.file_size()?;
                let bs = util::to_u64(self.block_size)?;
                fd.truncate(bytes + n * bs)
            }
            Backend::Txn { size, txn_started, .. } => {
                if !*txn_started {
                    return err_at!(BadOperation, msg: "grow outside transaction");
                }
                *size += n;
                Ok(())
            }
        }
    }

    fn truncate(&mut self, n: u64) -> Result<()> {
        if self.read_only {
            return err_at!(ReadOnly, msg: "truncate");
        }
        if n > self.size()? {
            return err_at!(BadArgument, msg: "truncate {} beyond size", n);
        }

        for index in self.blocks.indices() {
            if index >= n {
                let pinned = match self.blocks.find(index) {
                    Some(blk) => blk.is_pinned(),
                    None => false,
                };
                if pinned {
                    return err_at!(BadOperation, msg: "truncate over pinned block {}", index);
                }
                self.discard(index);
            }
        }

        match &mut self.backend {
            Backend::File { fd } => {
                let bs = util::to_u64(self.block_size)?;
                fd.truncate(n * bs)
            }
            Backend::Txn { size, txn_started, .. } => {
                if !*txn_started {
                    return err_at!(BadOperation, msg: "truncate outside transaction");
                }
                *size = n;
                Ok(())
            }
        }
    }

    fn pin(&mut self, index: u64, initialize: bool) -> Result<Rc<Block>> {
        let size = self.size()?;
        if index >= size {
            return err_at!(BadArgument, msg: "pin {} beyond size {}", index, size);
        }

        if let Some(blk) = self.blocks.find(index) {
            if blk.is_pinned() {
                if !initialize {
                    // the buffer is shared with live handles, letting
                    // the caller clobber it is a programming error.
                    return err_at!(BadArgument, msg: "block {} already pinned", index);
                }
                blk.incr_pin();
                return Ok(blk);
            }
            self.cache.remove(index);
            self.stats.cache_hits += 1;
            blk.incr_pin();
            self.pinned += 1;
            return Ok(blk);
        }

        self.make_room()?;
        let mut buf = self.pool.acquire(self.block_size);
        if initialize {
            if let Err(err) = self.do_read(index, &mut buf) {
                self.pool.release(buf);
                return Err(err);
            }
        }
        let blk = Rc::new(Block::new(index, buf));
        blk.incr_pin();
        self.pinned += 1;
        self.blocks.insert(Rc::clone(&blk));
        Ok(blk)
    }

    fn unpin(&mut self, index: u64) {
        if let Some(blk) = self.blocks.find(index) {
            blk.decr_pin();
            if !blk.is_pinned() {
                self.pinned -= 1;
                self.cache.add(index);
            }
        }
    }

    fn mark_dirty(&mut self, index: u64) -> Result<()> {
        if self.read_only {
            return err_at!(ReadOnly, msg: "mark_dirty block {}", index);
        }
        if let Backend::Txn { txn_started: false, .. } = &self.backend {
            return err_at!(BadOperation, msg: "write outside transaction");
        }
        match self.blocks.find(index) {
            Some(blk) => {
                blk.set_dirty(true);
                self.dirty.add(index);
                Ok(())
            }
            None => err_at!(Fatal, msg: "mark_dirty on absent block {}", index),
        }
    }

    fn flush_block(&mut self, index: u64) -> Result<()> {
        let blk = match self.blocks.find(index) {
            Some(blk) => blk,
            None => return Ok(()),
        };
        if blk.is_dirty() {
            let data = blk.as_data().borrow();
            self.do_write(index, &data)?;
            drop(data);
            // the dirty bit survives only a failed flush.
            blk.set_dirty(false);
            self.dirty.remove(index);
        }
        Ok(())
    }

    fn flush_all(&mut self) -> Result<()> {
        for index in self.dirty.indices() {
            self.flush_block(index)?;
        }
        Ok(())
    }

    // Evict cached blocks until the engine is within its cache bound
    // or no more victims are available.
    fn make_room(&mut self) -> Result<()> {
        while self.blocks.len() >= self.max_blocks {
            match self.cache.lru_candidate() {
                Some(victim) => {
                    self.flush_block(victim)?;
                    self.cache.remove(victim);
                    self.reclaim(victim);
                }
                None => break,
            }
        }
        Ok(())
    }

    // Drop a block from memory without writing it back.
    fn discard(&mut self, index: u64) {
        self.cache.remove(index);
        self.dirty.remove(index);
        self.reclaim(index);
    }

    fn reclaim(&mut self, index: u64) {
        if let Some(blk) = self.blocks.remove(index) {
            if let Ok(blk) = Rc::try_unwrap(blk) {
                self.pool.release(blk.into_data());
            }
        }
    }

    fn do_read(&mut self, index: u64, buf: &mut [u8]) -> Result<()> {
        self.stats.reads += 1;
        let bs = util::to_u64(self.block_size)?;
        match &mut self.backend {
            Backend::File { fd } => fd.read_at(index * bs, buf),
            Backend::Txn { dbfd, journal, dbfile_size, .. } => {
                if journal.read(index, buf)? {
                    return Ok(());
                }
                let committed = journal.to_database_size().unwrap_or(*dbfile_size);
                if index < committed.min(*dbfile_size) {
                    dbfd.read_at(index * bs, buf)
                } else {
                    // beyond the committed size, logically zero.
                    buf.iter_mut().for_each(|b| *b = 0);
                    Ok(())
                }
            }
        }
    }

    fn do_write(&mut self, index: u64, data: &[u8]) -> Result<()> {
        self.stats.writes += 1;
        let bs = util::to_u64(self.block_size)?;
        match &mut self.backend {
            Backend::File { fd } => fd.write_at(index * bs, data),
            Backend::Txn { journal, .. } => journal.write(index, data),
        }
    }

    fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        if matches!(self.backend, Backend::File { .. }) && !self.read_only {
            self.flush_all()?;
        }
        match &mut self.backend {
            Backend::File { fd } => fd.close(),
            Backend::Txn { dbfd, journal, txn_started, .. } => {
                // an open transaction is abandoned; the next open
                // rolls it back while restoring the journal.
                if !*txn_started {
                    journal.close()?;
                }
                dbfd.close()
            }
        }
    }
}

impl Drop for EngineInner {
    fn drop(&mut self) {
        // final flush; errors are for close() to report, not drop.
        self.close().ok();
    }
}

/// Pinned, in-memory view of one block.
///
/// The handle is a shared borrow of the block within its engine;
/// clones co-exist and observe each other's writes immediately. The
/// pin is released when the last clone drops.
pub struct BlockHandle {
    inner: Rc<HandleInner>,
}

struct HandleInner {
    engine: Rc<RefCell<EngineInner>>,
    block: Rc<Block>,
}

impl Drop for HandleInner {
    fn drop(&mut self) {
        if let Ok(mut engine) = self.engine.try_borrow_mut() {
            engine.unpin(self.block.to_index());
        } else {
            debug_assert!(false, "handle dropped inside an engine operation");
        }
    }
}

impl Clone for BlockHandle {
    fn clone(&self) -> BlockHandle {
        BlockHandle {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl BlockHandle {
    fn new(engine: Rc<RefCell<EngineInner>>, block: Rc<Block>) -> BlockHandle {
        BlockHandle {
            inner: Rc::new(HandleInner { engine, block }),
        }
    }

    /// Index of the block within the file.
    pub fn to_index(&self) -> u64 {
        self.inner.block.to_index()
    }

    /// Size of the block in bytes.
    pub fn len(&self) -> usize {
        self.inner.block.as_data().borrow().len()
    }

    pub fn is_dirty(&self) -> bool {
        self.inner.block.is_dirty()
    }

    /// Copy `buf.len()` bytes starting at `offset` out of the block.
    pub fn read_at(&self, offset: usize, buf: &mut [u8]) -> Result<()> {
        let data = self.inner.block.as_data().borrow();
        match data.get(offset..offset + buf.len()) {
            Some(src) => {
                buf.copy_from_slice(src);
                Ok(())
            }
            None => err_at!(BadArgument, msg: "read {}+{} beyond block", offset, buf.len()),
        }
    }

    /// Copy bytes starting at `offset` out of the block into a fresh
    /// vector.
    pub fn read_vec(&self, offset: usize, n: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0; n];
        self.read_at(offset, &mut buf)?;
        Ok(buf)
    }

    /// Overwrite block content at `offset` and mark the block dirty.
    pub fn write_at(&self, offset: usize, src: &[u8]) -> Result<()> {
        {
            let mut data = self.inner.block.as_data().borrow_mut();
            match data.get_mut(offset..offset + src.len()) {
                Some(dst) => dst.copy_from_slice(src),
                None => {
                    return err_at!(
                        BadArgument, msg: "write {}+{} beyond block", offset, src.len()
                    )
                }
            }
        }
        self.mark_dirty()
    }

    /// Move bytes within the block, marking it dirty.
    pub fn copy_within(&self, src: ops::Range<usize>, dest: usize) -> Result<()> {
        {
            let mut data = self.inner.block.as_data().borrow_mut();
            if src.end > data.len() || dest + (src.end - src.start) > data.len() {
                return err_at!(BadArgument, msg: "copy {:?} -> {} beyond block", src, dest);
            }
            data.copy_within(src, dest);
        }
        self.mark_dirty()
    }

    /// Decode a [Codec] value at `offset`.
    pub fn get<T: Codec>(&self, offset: usize) -> Result<T> {
        let data = self.inner.block.as_data().borrow();
        match data.get(offset..offset + T::SIZE) {
            Some(buf) => T::decode(buf),
            None => err_at!(BadArgument, msg: "get {}+{} beyond block", offset, T::SIZE),
        }
    }

    /// Encode a [Codec] value at `offset`, marking the block dirty.
    pub fn set<T: Codec>(&self, offset: usize, val: &T) -> Result<()> {
        {
            let mut data = self.inner.block.as_data().borrow_mut();
            match data.get_mut(offset..offset + T::SIZE) {
                Some(buf) => val.encode(buf),
                None => {
                    return err_at!(BadArgument, msg: "set {}+{} beyond block", offset, T::SIZE)
                }
            }
        }
        self.mark_dirty()
    }

    /// Record that the block content was modified.
    pub fn mark_dirty(&self) -> Result<()> {
        let mut engine = self.inner.engine.borrow_mut();
        engine.mark_dirty(self.inner.block.to_index())
    }

    /// Write this block back to the backend if it is dirty. Does not
    /// imply an fsync.
    pub fn flush(&self) -> Result<()> {
        let mut engine = self.inner.engine.borrow_mut();
        engine.flush_block(self.inner.block.to_index())
    }
}

#[cfg(test)]
#[path = "mod_test.rs"]
mod mod_test;
