//! Module `config` implement configuration types for engines and the
//! structures layered on top of them.
//!
//! Configuration is used only while creating or opening an instance;
//! the durable parameters, like the block size, are persisted in the
//! file header and validated on subsequent opens.

use serde::Deserialize;

use std::path;

use crate::{util, Result};

/// Default block size in bytes.
pub const BLOCK_SIZE: usize = 4096;

/// Default cache capacity, in blocks.
pub const CACHE_BLOCKS: usize = 1024;

/// Default journal tail-buffer size in bytes.
pub const JOURNAL_BUFFER_SIZE: usize = 1024 * 1024;

/// Default minimum file-growth increment for the block allocator,
/// in blocks.
pub const ALLOC_CHUNK_BLOCKS: u64 = 128;

/// Default chunk size for the blob heap, in blocks.
pub const HEAP_CHUNK_BLOCKS: u64 = 128;

fn default_block_size() -> usize {
    BLOCK_SIZE
}

fn default_cache_blocks() -> usize {
    CACHE_BLOCKS
}

fn default_buffer_size() -> usize {
    JOURNAL_BUFFER_SIZE
}

fn default_sync_on_commit() -> bool {
    true
}

fn default_alloc_chunk_blocks() -> u64 {
    ALLOC_CHUNK_BLOCKS
}

fn default_heap_chunk_blocks() -> u64 {
    HEAP_CHUNK_BLOCKS
}

/// Configuration for the paging engine.
#[derive(Clone, Debug, Deserialize)]
pub struct EngineConfig {
    /// Size of one block in bytes, chosen at create time and fixed
    /// for the lifetime of the file. Must be a power of two.
    ///
    /// Default: [BLOCK_SIZE]
    #[serde(default = "default_block_size")]
    pub block_size: usize,
    /// Maximum number of unpinned blocks cached in memory.
    ///
    /// Default: [CACHE_BLOCKS]
    #[serde(default = "default_cache_blocks")]
    pub cache_blocks: usize,
    /// Open the file in read-only mode.
    ///
    /// Default: false
    #[serde(default)]
    pub read_only: bool,
}

impl Default for EngineConfig {
    fn default() -> EngineConfig {
        EngineConfig {
            block_size: BLOCK_SIZE,
            cache_blocks: CACHE_BLOCKS,
            read_only: false,
        }
    }
}

impl EngineConfig {
    /// Configure the block size, in bytes.
    pub fn set_block_size(&mut self, block_size: usize) -> &mut Self {
        self.block_size = block_size;
        self
    }

    /// Configure the cache capacity, in blocks.
    pub fn set_cache_blocks(&mut self, cache_blocks: usize) -> &mut Self {
        self.cache_blocks = cache_blocks;
        self
    }

    /// Open read-only; mutating operations shall fail.
    pub fn set_read_only(&mut self, read_only: bool) -> &mut Self {
        self.read_only = read_only;
        self
    }
}

/// Configuration for the transactional engine's journal.
#[derive(Clone, Debug, Deserialize)]
pub struct JournalConfig {
    /// Flush the log buffer and fsync after every commit. Disabling
    /// this trades durability of the most recent commits for speed;
    /// integrity is never affected.
    ///
    /// Default: true
    #[serde(default = "default_sync_on_commit")]
    pub sync_on_commit: bool,
    /// In-memory tail buffer size for log records, in bytes.
    ///
    /// Default: [JOURNAL_BUFFER_SIZE]
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
}

impl Default for JournalConfig {
    fn default() -> JournalConfig {
        JournalConfig {
            sync_on_commit: true,
            buffer_size: JOURNAL_BUFFER_SIZE,
        }
    }
}

impl JournalConfig {
    pub fn set_sync_on_commit(&mut self, enabled: bool) -> &mut Self {
        self.sync_on_commit = enabled;
        self
    }

    pub fn set_buffer_size(&mut self, buffer_size: usize) -> &mut Self {
        self.buffer_size = buffer_size;
        self
    }
}

/// Configuration for the block allocator.
#[derive(Clone, Debug, Deserialize)]
pub struct AllocConfig {
    /// Minimum file-growth increment, in blocks.
    ///
    /// Default: [ALLOC_CHUNK_BLOCKS]
    #[serde(default = "default_alloc_chunk_blocks")]
    pub chunk_blocks: u64,
}

impl Default for AllocConfig {
    fn default() -> AllocConfig {
        AllocConfig {
            chunk_blocks: ALLOC_CHUNK_BLOCKS,
        }
    }
}

impl AllocConfig {
    pub fn set_chunk_blocks(&mut self, chunk_blocks: u64) -> &mut Self {
        self.chunk_blocks = chunk_blocks;
        self
    }
}

/// Configuration for the blob heap.
#[derive(Clone, Debug, Deserialize)]
pub struct HeapConfig {
    /// Number of blocks acquired per small-object chunk. Clamped
    /// from below so that a chunk holds at least four maximal small
    /// objects.
    ///
    /// Default: [HEAP_CHUNK_BLOCKS]
    #[serde(default = "default_heap_chunk_blocks")]
    pub chunk_blocks: u64,
}

impl Default for HeapConfig {
    fn default() -> HeapConfig {
        HeapConfig {
            chunk_blocks: HEAP_CHUNK_BLOCKS,
        }
    }
}

impl HeapConfig {
    pub fn set_chunk_blocks(&mut self, chunk_blocks: u64) -> &mut Self {
        self.chunk_blocks = chunk_blocks;
        self
    }
}

/// Umbrella configuration, loadable from a TOML file.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub journal: JournalConfig,
    #[serde(default)]
    pub alloc: AllocConfig,
    #[serde(default)]
    pub heap: HeapConfig,
}

impl Config {
    /// Load configuration from a TOML file. Missing sections and
    /// fields fall back to their defaults.
    pub fn from_file<P>(loc: P) -> Result<Config>
    where
        P: AsRef<path::Path>,
    {
        util::files::load_toml(loc)
    }
}

#[cfg(test)]
#[path = "config_test.rs"]
mod config_test;
