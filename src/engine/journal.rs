//! Write-ahead journal for the transactional engine.
//!
//! Changes made to in-memory blocks are not written back to the
//! database file directly; a crash half way through would leave an
//! inconsistent database behind. Instead every block write is
//! deflected into this redo log. Once a transaction commits, the
//! logged blocks can be copied into the database file at leisure, and
//! the copy can be restarted from scratch after a crash because it is
//! idempotent. Logging happens on the physical layer, whole blocks,
//! since every block is an opaque blob of bytes at this level.
//!
//! Log layout, all integers big-endian:
//!
//! ```text
//! offset 0   magic [u8;16], version u32, block_size u32
//! offset 24  records, each prefixed by a one-byte tag:
//!            0x01 begin   (no payload)
//!            0x02 abort   (no payload)
//!            0x03 commit  u64 new database size, in blocks
//!            0x04 write   u64 block index, then block_size payload
//! ```
//!
//! Rollback truncates the log back to the offset where the
//! transaction begun, in the file and in the tail buffer. The
//! `abort` tag remains part of the wire format and is honoured
//! during restore, logs written by older versions carry it.

use log::{debug, info};

use std::{
    collections::BTreeMap,
    convert::TryFrom,
    mem,
};

use crate::{
    codec::{self, Codec},
    config::JournalConfig,
    util,
    vfs::FileIo,
    Result,
};

pub const LOG_MAGIC: [u8; 16] = *b"edms/tx-journal\0";
pub const LOG_VERSION: u32 = 1;

/// Size of the header at the start of the journal file, in bytes.
pub const LOG_HEADER_SIZE: usize = 24;

const TAG_BEGIN: u8 = 1;
const TAG_ABORT: u8 = 2;
const TAG_COMMIT: u8 = 3;
const TAG_WRITE: u8 = 4;

struct LogHeader {
    magic: [u8; 16],
    version: u32,
    block_size: u32,
}

impl Codec for LogHeader {
    const SIZE: usize = 24;

    fn encode(&self, buf: &mut [u8]) {
        self.magic.encode(buf);
        self.version.encode(&mut buf[16..]);
        self.block_size.encode(&mut buf[20..]);
    }

    fn decode(buf: &[u8]) -> Result<Self> {
        Ok(LogHeader {
            magic: <[u8; 16]>::decode(buf)?,
            version: u32::decode(&buf[16..])?,
            block_size: u32::decode(&buf[20..])?,
        })
    }
}

pub struct Journal {
    fd: Box<dyn FileIo>,
    read_only: bool,
    block_size: usize,
    sync_on_commit: bool,

    // -- journal file management --
    // Logical size of the log in bytes, includes the unflushed
    // buffer. Serves as the sequence number for the next record.
    log_size: u64,
    // File offset at which the buffer content will land when flushed,
    // end of file on disk and start of the buffer in memory.
    buffer_offset: u64,
    buffer: Vec<u8>,
    buffer_used: usize,

    // -- committed database state --
    // Size of the database in blocks as of the latest commit. None if
    // the journal holds no committed transaction.
    database_size: Option<u64>,
    // block index -> file offset of the most recent committed payload.
    committed: BTreeMap<u64, u64>,

    // -- current transaction state --
    in_transaction: bool,
    // The begin record is written lazily, on the first block write.
    begin_written: bool,
    // Log offset at which the running transaction begun.
    txn_begin: u64,
    // block index -> payload offset within the running transaction.
    uncommitted: BTreeMap<u64, u64>,
}

impl Journal {
    /// Start a fresh journal on `fd`, writing the log header.
    pub fn create(
        mut fd: Box<dyn FileIo>,
        block_size: usize,
        config: JournalConfig,
    ) -> Result<Journal> {
        let header = LogHeader {
            magic: LOG_MAGIC,
            version: LOG_VERSION,
            block_size: err_at!(FailConvert, u32::try_from(block_size))?,
        };
        fd.truncate(0)?;
        fd.write_at(0, &codec::to_bytes(&header))?;

        Ok(Journal {
            fd,
            read_only: false,
            block_size,
            sync_on_commit: config.sync_on_commit,

            log_size: LOG_HEADER_SIZE as u64,
            buffer_offset: LOG_HEADER_SIZE as u64,
            buffer: vec![0; config.buffer_size.max(Self::MAX_RECORD_HEAD)],
            buffer_used: 0,

            database_size: None,
            committed: BTreeMap::new(),

            in_transaction: false,
            begin_written: false,
            txn_begin: 0,
            uncommitted: BTreeMap::new(),
        })
    }

    /// Load an existing journal from `fd`, validating the header and
    /// replaying committed transactions. A partial record at the tail
    /// is truncated away.
    pub fn open(
        mut fd: Box<dyn FileIo>,
        block_size: usize,
        config: JournalConfig,
    ) -> Result<Journal> {
        let file_size = fd.file_size()?;
        if file_size < LOG_HEADER_SIZE as u64 {
            return err_at!(Corruption, msg: "journal too short {}", file_size);
        }

        let header = {
            let mut buf = [0; LOG_HEADER_SIZE];
            fd.read_at(0, &mut buf)?;
            LogHeader::decode(&buf)?
        };
        if header.magic != LOG_MAGIC {
            return err_at!(Corruption, msg: "journal magic {:?}", header.magic);
        }
        if header.version != LOG_VERSION {
            return err_at!(Corruption, msg: "journal version {}", header.version);
        }
        if header.block_size as usize != block_size {
            return err_at!(
                Corruption, msg: "journal block-size {}, expected {}",
                header.block_size, block_size
            );
        }

        let read_only = fd.is_read_only();
        let mut journal = Journal {
            fd,
            read_only,
            block_size,
            sync_on_commit: config.sync_on_commit,

            log_size: LOG_HEADER_SIZE as u64,
            buffer_offset: LOG_HEADER_SIZE as u64,
            buffer: vec![0; config.buffer_size.max(Self::MAX_RECORD_HEAD)],
            buffer_used: 0,

            database_size: None,
            committed: BTreeMap::new(),

            in_transaction: false,
            begin_written: false,
            txn_begin: 0,
            uncommitted: BTreeMap::new(),
        };
        journal.restore(file_size)?;
        Ok(journal)
    }

    // Largest record head, the write record's tag + block index.
    const MAX_RECORD_HEAD: usize = 9;

    pub fn to_block_size(&self) -> usize {
        self.block_size
    }

    /// Current logical size of the log in bytes. Only a checkpoint
    /// shrinks it back to the header size.
    pub fn to_log_size(&self) -> u64 {
        self.log_size
    }

    pub fn is_sync_on_commit(&self) -> bool {
        self.sync_on_commit
    }

    pub fn set_sync_on_commit(&mut self, enabled: bool) {
        self.sync_on_commit = enabled;
    }

    pub fn is_in_transaction(&self) -> bool {
        self.in_transaction
    }

    /// True if the journal holds committed changes that have not been
    /// checkpointed into the database file yet.
    pub fn has_committed_changes(&self) -> bool {
        self.database_size.is_some()
    }

    /// Committed size of the database in blocks, the argument of the
    /// latest commit known to the log.
    pub fn to_database_size(&self) -> Option<u64> {
        self.database_size
    }

    /// Block indices written by the running transaction. The engine
    /// discards these from its cache on rollback.
    pub fn to_uncommitted_blocks(&self) -> Vec<u64> {
        self.uncommitted.keys().copied().collect()
    }

    /// Read the most recent version of block `index` from the
    /// journal. Within a transaction the uncommitted version wins.
    /// Returns false if the journal does not know the block, in which
    /// case it must be read from the database file.
    pub fn read(&mut self, index: u64, buf: &mut [u8]) -> Result<bool> {
        debug_assert_eq!(buf.len(), self.block_size);

        let fpos = if self.in_transaction {
            self.uncommitted.get(&index).or_else(|| self.committed.get(&index))
        } else {
            self.committed.get(&index)
        };
        match fpos.copied() {
            Some(fpos) => {
                self.read_internal(fpos, buf)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub fn begin(&mut self) -> Result<()> {
        if self.read_only {
            return err_at!(ReadOnly, msg: "journal begin");
        }
        if self.in_transaction {
            return err_at!(BadOperation, msg: "nested transaction");
        }
        self.in_transaction = true;
        self.begin_written = false;
        self.txn_begin = self.log_size;
        Ok(())
    }

    /// Log the given version of block `index`. A block already
    /// written by this transaction is overwritten in place.
    pub fn write(&mut self, index: u64, data: &[u8]) -> Result<()> {
        if !self.in_transaction {
            return err_at!(BadOperation, msg: "journal write outside transaction");
        }
        if data.len() != self.block_size {
            return err_at!(
                BadArgument, msg: "payload {}, block-size {}", data.len(), self.block_size
            );
        }

        if !self.begin_written {
            self.append_to_buffer(&[TAG_BEGIN])?;
            self.begin_written = true;
        }

        match self.uncommitted.get(&index).copied() {
            Some(fpos) => self.write_internal(fpos, data),
            None => {
                let mut head = [0_u8; Self::MAX_RECORD_HEAD];
                head[0] = TAG_WRITE;
                index.encode(&mut head[1..]);
                self.append_to_buffer(&head)?;

                let fpos = self.log_size;
                self.append_to_buffer(data)?;
                self.uncommitted.insert(index, fpos);
                Ok(())
            }
        }
    }

    /// Commit the running transaction, recording `database_size` (in
    /// blocks) as the new committed size. The log buffer is flushed
    /// and, with sync-on-commit, fsynced.
    pub fn commit(&mut self, database_size: u64) -> Result<()> {
        if !self.in_transaction {
            return err_at!(BadOperation, msg: "commit without begin");
        }

        if !self.begin_written {
            self.append_to_buffer(&[TAG_BEGIN])?;
            self.begin_written = true;
        }
        let mut rec = [0_u8; 9];
        rec[0] = TAG_COMMIT;
        database_size.encode(&mut rec[1..]);
        self.append_to_buffer(&rec)?;
        self.flush_buffer()?;
        if self.sync_on_commit {
            self.fd.sync()?;
        }

        let uncommitted = mem::take(&mut self.uncommitted);
        self.committed.extend(uncommitted);
        // entries beyond the new database size are dead.
        self.committed.split_off(&database_size);
        self.database_size = Some(database_size);
        self.in_transaction = false;
        self.begin_written = false;
        Ok(())
    }

    /// Roll the running transaction back by truncating the log, file
    /// and tail buffer, to the offset where the transaction begun.
    pub fn rollback(&mut self) -> Result<()> {
        if !self.in_transaction {
            return err_at!(BadOperation, msg: "rollback without begin");
        }

        if self.txn_begin >= self.buffer_offset {
            self.buffer_used = util::to_usize(self.txn_begin - self.buffer_offset)?;
        } else {
            self.fd.truncate(self.txn_begin)?;
            self.buffer_offset = self.txn_begin;
            self.buffer_used = 0;
        }
        self.log_size = self.txn_begin;
        self.uncommitted.clear();
        self.in_transaction = false;
        self.begin_written = false;
        Ok(())
    }

    /// Copy every committed block into the database file, truncate
    /// the database to the committed size, and reset the log back to
    /// just its header. Returns true if the database file was
    /// modified.
    pub fn checkpoint(&mut self, dbfd: &mut dyn FileIo) -> Result<bool> {
        if self.in_transaction {
            return err_at!(BadOperation, msg: "checkpoint inside transaction");
        }
        if self.read_only || dbfd.is_read_only() {
            return err_at!(ReadOnly, msg: "checkpoint");
        }

        let database_size = match self.database_size {
            Some(n) => n,
            None => return Ok(false),
        };

        let n_blocks = self.committed.len();
        let block_size = util::to_u64(self.block_size)?;
        let mut buf = vec![0; self.block_size];
        let entries: Vec<(u64, u64)> =
            self.committed.iter().map(|(k, v)| (*k, *v)).collect();
        for (index, fpos) in entries.into_iter() {
            self.read_internal(fpos, &mut buf)?;
            dbfd.write_at(index * block_size, &buf)?;
        }
        dbfd.truncate(database_size * block_size)?;
        dbfd.sync()?;

        // The log is reset only after the database is durable; a
        // crash in between replays the same idempotent copy.
        self.fd.truncate(LOG_HEADER_SIZE as u64)?;
        self.fd.sync()?;
        self.log_size = LOG_HEADER_SIZE as u64;
        self.buffer_offset = LOG_HEADER_SIZE as u64;
        self.buffer_used = 0;
        self.committed.clear();
        self.database_size = None;

        info!(
            target: "journal",
            "checkpoint moved {} blocks, database {} blocks", n_blocks, database_size
        );
        Ok(true)
    }

    /// Final flush of the tail buffer, used on clean shutdown.
    pub fn close(&mut self) -> Result<()> {
        if !self.read_only {
            self.flush_buffer()?;
            self.fd.sync()?;
        }
        self.fd.close()
    }
}

impl Journal {
    // Restore the journal state by scanning the log from the header
    // onward. Committed transactions are replayed into the committed
    // index; the first incomplete transaction and everything after it
    // is truncated away.
    fn restore(&mut self, file_size: u64) -> Result<()> {
        let mut offset = LOG_HEADER_SIZE as u64;
        let mut n_txns = 0;

        loop {
            match self.restore_transaction(offset, file_size)? {
                Some(next) => {
                    n_txns += 1;
                    offset = next;
                }
                None => break,
            }
        }

        if offset < file_size {
            debug!(
                target: "journal",
                "truncating partial tail {} -> {}", file_size, offset
            );
            self.fd.truncate(offset)?;
        }
        self.log_size = offset;
        self.buffer_offset = offset;
        self.buffer_used = 0;

        info!(
            target: "journal",
            "restored {} transactions, database {:?} blocks, log {} bytes",
            n_txns, self.database_size, self.log_size
        );
        Ok(())
    }

    // Replay the next transaction starting at `offset`. Returns the
    // offset just after the transaction, or None when the records at
    // `offset` do not form a complete transaction.
    fn restore_transaction(&mut self, offset: u64, file_size: u64) -> Result<Option<u64>> {
        let block_size = util::to_u64(self.block_size)?;

        match self.restore_tag(offset, file_size)? {
            Some(TAG_BEGIN) => (),
            _ => return Ok(None),
        }

        let mut pos = offset + 1;
        let mut writes: Vec<(u64, u64)> = vec![];
        loop {
            match self.restore_tag(pos, file_size)? {
                Some(TAG_WRITE) if pos + 9 + block_size <= file_size => {
                    let index = {
                        let mut buf = [0; 8];
                        self.fd.read_at(pos + 1, &mut buf)?;
                        u64::decode(&buf)?
                    };
                    writes.push((index, pos + 9));
                    pos += 9 + block_size;
                }
                Some(TAG_COMMIT) if pos + 9 <= file_size => {
                    let database_size = {
                        let mut buf = [0; 8];
                        self.fd.read_at(pos + 1, &mut buf)?;
                        u64::decode(&buf)?
                    };
                    for (index, fpos) in writes.into_iter() {
                        self.committed.insert(index, fpos);
                    }
                    self.committed.split_off(&database_size);
                    self.database_size = Some(database_size);
                    return Ok(Some(pos + 9));
                }
                Some(TAG_ABORT) => return Ok(Some(pos + 1)),
                _ => return Ok(None),
            }
        }
    }

    fn restore_tag(&mut self, offset: u64, file_size: u64) -> Result<Option<u8>> {
        if offset >= file_size {
            return Ok(None);
        }
        let mut tag = [0_u8; 1];
        self.fd.read_at(offset, &mut tag)?;
        Ok(Some(tag[0]))
    }

    // Read log content crossing the file/buffer boundary as needed.
    fn read_internal(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let len = util::to_u64(buf.len())?;
        if offset + len > self.log_size {
            return err_at!(Fatal, msg: "journal read {}+{} beyond {}", offset, len, self.log_size);
        }

        if offset >= self.buffer_offset {
            let start = util::to_usize(offset - self.buffer_offset)?;
            buf.copy_from_slice(&self.buffer[start..start + buf.len()]);
        } else if offset + len <= self.buffer_offset {
            self.fd.read_at(offset, buf)?;
        } else {
            let split = util::to_usize(self.buffer_offset - offset)?;
            self.fd.read_at(offset, &mut buf[..split])?;
            let n = buf.len() - split;
            buf[split..].copy_from_slice(&self.buffer[..n]);
        }
        Ok(())
    }

    // Overwrite existing log content, crossing the boundary as needed.
    fn write_internal(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        let len = util::to_u64(data.len())?;
        if offset + len > self.log_size {
            return err_at!(Fatal, msg: "journal write {}+{} beyond {}", offset, len, self.log_size);
        }

        if offset >= self.buffer_offset {
            let start = util::to_usize(offset - self.buffer_offset)?;
            self.buffer[start..start + data.len()].copy_from_slice(data);
        } else if offset + len <= self.buffer_offset {
            self.fd.write_at(offset, data)?;
        } else {
            let split = util::to_usize(self.buffer_offset - offset)?;
            self.fd.write_at(offset, &data[..split])?;
            let n = data.len() - split;
            self.buffer[..n].copy_from_slice(&data[split..]);
        }
        Ok(())
    }

    // Append to the tail of the log, flushing the buffer as often as
    // required.
    fn append_to_buffer(&mut self, data: &[u8]) -> Result<()> {
        let mut data = data;
        self.log_size += util::to_u64(data.len())?;
        while !data.is_empty() {
            let free = self.buffer.len() - self.buffer_used;
            if free == 0 {
                self.flush_buffer()?;
                continue;
            }
            let n = free.min(data.len());
            self.buffer[self.buffer_used..self.buffer_used + n].copy_from_slice(&data[..n]);
            self.buffer_used += n;
            data = &data[n..];
        }
        Ok(())
    }

    // Write the buffer content to disk, no fsync.
    fn flush_buffer(&mut self) -> Result<()> {
        if self.buffer_used > 0 {
            self.fd.write_at(self.buffer_offset, &self.buffer[..self.buffer_used])?;
            self.buffer_offset += util::to_u64(self.buffer_used)?;
            self.buffer_used = 0;
        }
        Ok(())
    }
}

#[cfg(test)]
#[path = "journal_test.rs"]
mod journal_test;
