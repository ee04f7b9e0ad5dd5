//! Module `format` implement the database file layer.
//!
//! Block 0 of every database is reserved for the file header. The
//! header embeds, at well-known offsets, a magic string, the format
//! version, the block size, a digest of the header's own binary
//! layout, an application version, the anchor of the root allocator
//! and a fixed region for application anchors. Two opens of the same
//! file must agree on all of these or the open fails with a
//! corruption error.
//!
//! [Db] pairs an engine with the root allocator and orchestrates the
//! flush/commit order: data-structure anchors live inside block 0 and
//! are written through their cells as structures mutate; the
//! allocator persists its extent table in [Db::flush]/[Db::commit]
//! just before the engine makes everything durable.

use lazy_static::lazy_static;
use log::info;

use crate::{
    alloc::{self, Allocator},
    anchor::AnchorLoc,
    codec::Codec,
    config::AllocConfig,
    engine::Engine,
    Result,
};

pub const DB_MAGIC: [u8; 16] = *b"edms/database\0\0\0";
pub const DB_VERSION: u32 = 1;

/// Size of the application anchor region inside block 0.
pub const USER_ANCHOR_SIZE: usize = 256;

const MAGIC_OFFSET: usize = 0;
const VERSION_OFFSET: usize = 16;
const BLOCK_SIZE_OFFSET: usize = 20;
const DIGEST_OFFSET: usize = 24;
const USER_VERSION_OFFSET: usize = 32;
const ALLOC_ANCHOR_OFFSET: usize = 36;
const USER_ANCHOR_LEN_OFFSET: usize = 60;
const USER_ANCHOR_OFFSET: usize = 64;

/// Total bytes of block 0 claimed by the header.
pub const HEADER_SIZE: usize = USER_ANCHOR_OFFSET + USER_ANCHOR_SIZE;

/// Smallest block size that can host the file header.
pub const MIN_DB_BLOCK_SIZE: usize = 512;

lazy_static! {
    // The header layout, content-addressed: every field name and
    // serialized size, in declaration order. Any change to the layout
    // changes the digest and trips the open-time check.
    static ref FORMAT_DESC: String = [
        ("magic", 16),
        ("version", 4),
        ("block_size", 4),
        ("format_digest", 8),
        ("user_version", 4),
        ("alloc_anchor", alloc::Anchor::SIZE),
        ("user_anchor_len", 4),
        ("user_anchor", USER_ANCHOR_SIZE),
    ]
    .iter()
    .map(|(name, size)| format!("{}:{}", name, size))
    .collect::<Vec<String>>()
    .join(",");
    static ref FORMAT_DIGEST: u64 =
        cityhash_rs::cityhash_110_128(FORMAT_DESC.as_bytes()) as u64;
}

/// A database file: an engine plus the root allocator, tied together
/// by the header in block 0.
pub struct Db {
    engine: Engine,
    alloc: Allocator,
    user_version: u32,
}

impl Db {
    /// Initialize a fresh database on an empty engine. For a
    /// transactional engine the initialization happens inside its own
    /// committed transaction.
    pub fn create(engine: Engine, config: AllocConfig, user_version: u32) -> Result<Db> {
        if engine.block_size() < MIN_DB_BLOCK_SIZE {
            return err_at!(BadArgument, msg: "block size {}", engine.block_size());
        }
        if engine.size()? != 0 {
            return err_at!(BadArgument, msg: "file is not empty");
        }

        if engine.is_transactional() {
            engine.begin()?;
        }
        engine.grow(1)?;
        {
            let handle = engine.overwrite_zero(0)?;
            handle.set(MAGIC_OFFSET, &DB_MAGIC)?;
            handle.set(VERSION_OFFSET, &DB_VERSION)?;
            handle.set(BLOCK_SIZE_OFFSET, &(engine.block_size() as u32))?;
            handle.set(DIGEST_OFFSET, &*FORMAT_DIGEST)?;
            handle.set(USER_VERSION_OFFSET, &user_version)?;
            handle.set(USER_ANCHOR_LEN_OFFSET, &(USER_ANCHOR_SIZE as u32))?;
        }
        let alloc = Allocator::create(
            engine.clone(),
            AnchorLoc::new(0, ALLOC_ANCHOR_OFFSET),
            config,
        )?;

        let db = Db {
            engine,
            alloc,
            user_version,
        };
        if db.engine.is_transactional() {
            db.commit()?;
        } else {
            db.flush()?;
        }
        info!(
            target: "format",
            "created database, block-size {}, user version {}",
            db.engine.block_size(), user_version
        );
        Ok(db)
    }

    /// Open an existing database, validating the header.
    pub fn open(engine: Engine, config: AllocConfig) -> Result<Db> {
        if engine.size()? == 0 {
            return err_at!(Corruption, msg: "missing file header");
        }

        let user_version = {
            let handle = engine.pin(0, true)?;
            let magic: [u8; 16] = handle.get(MAGIC_OFFSET)?;
            if magic != DB_MAGIC {
                return err_at!(Corruption, msg: "database magic {:?}", magic);
            }
            let version: u32 = handle.get(VERSION_OFFSET)?;
            if version != DB_VERSION {
                return err_at!(Corruption, msg: "database version {}", version);
            }
            let block_size: u32 = handle.get(BLOCK_SIZE_OFFSET)?;
            if block_size as usize != engine.block_size() {
                return err_at!(
                    Corruption, msg: "database block-size {}, engine {}",
                    block_size, engine.block_size()
                );
            }
            let digest: u64 = handle.get(DIGEST_OFFSET)?;
            if digest != *FORMAT_DIGEST {
                return err_at!(
                    Corruption, msg: "format digest {:x}, expected {:x}", digest, *FORMAT_DIGEST
                );
            }
            handle.get::<u32>(USER_VERSION_OFFSET)?
        };

        let alloc = Allocator::load(
            engine.clone(),
            AnchorLoc::new(0, ALLOC_ANCHOR_OFFSET),
            config,
        )?;
        info!(
            target: "format",
            "opened database, block-size {}, user version {}",
            engine.block_size(), user_version
        );
        Ok(Db {
            engine,
            alloc,
            user_version,
        })
    }

    pub fn as_engine(&self) -> &Engine {
        &self.engine
    }

    pub fn as_alloc(&self) -> &Allocator {
        &self.alloc
    }

    pub fn to_user_version(&self) -> u32 {
        self.user_version
    }

    /// Location of the application anchor region in block 0.
    /// Applications carve it up with [crate::anchor::AnchorCell]
    /// projections.
    pub fn user_anchor_loc(&self) -> AnchorLoc {
        AnchorLoc::new(0, USER_ANCHOR_OFFSET)
    }

    /// Persist allocator state and write all dirty blocks back. For
    /// file engines only; transactional engines persist through
    /// [Db::commit].
    pub fn flush(&self) -> Result<()> {
        self.alloc.save()?;
        self.engine.flush()
    }

    /// Start a transaction (transactional engines).
    pub fn begin(&self) -> Result<()> {
        self.engine.begin()
    }

    /// Persist allocator state and commit the running transaction.
    pub fn commit(&self) -> Result<()> {
        self.alloc.save()?;
        self.engine.commit()
    }

    /// Roll the running transaction back and restore the allocator's
    /// in-memory picture to the committed state. All structure
    /// wrappers and their cursors must be dropped first; reconstruct
    /// them from their anchors afterwards.
    pub fn rollback(&self) -> Result<()> {
        self.engine.rollback()?;
        self.alloc.reload()
    }

    /// Migrate committed journal content into the database file.
    pub fn checkpoint(&self) -> Result<()> {
        self.engine.checkpoint()
    }

    /// Final flush and close. For a file engine this saves the
    /// allocator; a transactional engine only persists committed
    /// state.
    pub fn close(self) -> Result<()> {
        if !self.engine.is_transactional() && !self.engine.is_read_only() {
            self.flush()?;
        }
        self.engine.close()
    }
}

#[cfg(test)]
#[path = "format_test.rs"]
mod format_test;
