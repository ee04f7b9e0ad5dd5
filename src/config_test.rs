use rand::{prelude::random, rngs::SmallRng, Rng, SeedableRng};

use std::{env, fs};

use super::*;

#[test]
fn test_defaults() {
    let config = Config::default();
    assert_eq!(config.engine.block_size, BLOCK_SIZE);
    assert_eq!(config.engine.cache_blocks, CACHE_BLOCKS);
    assert!(!config.engine.read_only);
    assert!(config.journal.sync_on_commit);
    assert_eq!(config.journal.buffer_size, JOURNAL_BUFFER_SIZE);
    assert_eq!(config.alloc.chunk_blocks, ALLOC_CHUNK_BLOCKS);
    assert_eq!(config.heap.chunk_blocks, HEAP_CHUNK_BLOCKS);
}

#[test]
fn test_builders() {
    let mut config = EngineConfig::default();
    config.set_block_size(512).set_cache_blocks(16).set_read_only(true);
    assert_eq!(config.block_size, 512);
    assert_eq!(config.cache_blocks, 16);
    assert!(config.read_only);

    let mut config = JournalConfig::default();
    config.set_sync_on_commit(false).set_buffer_size(4096);
    assert!(!config.sync_on_commit);
    assert_eq!(config.buffer_size, 4096);
}

#[test]
fn test_from_file() {
    let seed: u64 = random();
    let mut rng = SmallRng::seed_from_u64(seed);
    println!("test_from_file {}", seed);

    let loc = {
        let mut loc = env::temp_dir();
        loc.push(format!("edms-config-{}.toml", rng.gen::<u32>()));
        loc
    };
    let text = concat!(
        "[engine]\n",
        "block_size = 8192\n",
        "[journal]\n",
        "sync_on_commit = false\n",
        "[heap]\n",
        "chunk_blocks = 64\n",
    );
    fs::write(&loc, text).unwrap();

    let config = Config::from_file(&loc).unwrap();
    assert_eq!(config.engine.block_size, 8192);
    assert_eq!(config.engine.cache_blocks, CACHE_BLOCKS); // default
    assert!(!config.journal.sync_on_commit);
    assert_eq!(config.journal.buffer_size, JOURNAL_BUFFER_SIZE);
    assert_eq!(config.alloc.chunk_blocks, ALLOC_CHUNK_BLOCKS);
    assert_eq!(config.heap.chunk_blocks, 64);

    fs::remove_file(&loc).unwrap();
}
