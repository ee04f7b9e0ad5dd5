use rand::{prelude::random, rngs::SmallRng, Rng, SeedableRng};

use std::env;

use super::*;
use crate::{
    vfs::{MemFile, SysFile},
    Error,
};

fn engine_config(block_size: usize, cache_blocks: usize) -> EngineConfig {
    let mut config = EngineConfig::default();
    config.set_block_size(block_size).set_cache_blocks(cache_blocks);
    config
}

fn temp_file(rng: &mut SmallRng, tag: &str) -> std::ffi::OsString {
    let mut loc = env::temp_dir();
    loc.push(format!("edms-engine-{}-{}.db", tag, rng.gen::<u32>()));
    loc.into_os_string()
}

#[test]
fn test_file_engine_basic() {
    let seed: u64 = random();
    println!("test_file_engine_basic {}", seed);

    let engine = Engine::file_engine(Box::new(MemFile::new()), engine_config(512, 32)).unwrap();
    assert_eq!(engine.block_size(), 512);
    assert_eq!(engine.size().unwrap(), 0);
    assert!(!engine.is_read_only());

    engine.grow(4).unwrap();
    assert_eq!(engine.size().unwrap(), 4);

    {
        let handle = engine.overwrite_zero(2).unwrap();
        assert_eq!(handle.to_index(), 2);
        assert_eq!(handle.len(), 512);
        handle.write_at(0, b"hello world").unwrap();
        assert!(handle.is_dirty());
        handle.flush().unwrap();
        assert!(!handle.is_dirty());
    }
    engine.flush().unwrap();

    let handle = engine.pin(2, true).unwrap();
    assert_eq!(&handle.read_vec(0, 11).unwrap(), b"hello world");
    // the rest of the block is zero.
    assert_eq!(handle.read_vec(11, 501).unwrap(), vec![0; 501]);
    drop(handle);

    // grown blocks read as zero.
    let handle = engine.pin(3, true).unwrap();
    assert_eq!(handle.read_vec(0, 512).unwrap(), vec![0; 512]);
    drop(handle);

    engine.close().unwrap();
}

#[test]
fn test_pin_rules() {
    let seed: u64 = random();
    println!("test_pin_rules {}", seed);

    let engine = Engine::file_engine(Box::new(MemFile::new()), engine_config(512, 32)).unwrap();
    engine.grow(2).unwrap();

    // pin beyond the file is a caller bug.
    match engine.pin(2, true) {
        Err(Error::BadArgument(_, _)) => (),
        res => panic!("unexpected {:?}", res.map(|_| ())),
    }

    // multiple initialized pins of one block co-exist and share the
    // buffer; writes through one are visible through the other.
    let a = engine.pin(0, true).unwrap();
    let b = engine.pin(0, true).unwrap();
    a.write_at(0, &[0xAB; 16]).unwrap();
    assert_eq!(b.read_vec(0, 16).unwrap(), vec![0xAB; 16]);
    let c = b.clone();

    // but clobbering a pinned buffer is refused.
    match engine.pin(0, false) {
        Err(Error::BadArgument(_, _)) => (),
        res => panic!("unexpected {:?}", res.map(|_| ())),
    }
    match engine.overwrite_zero(0) {
        Err(Error::BadArgument(_, _)) => (),
        res => panic!("unexpected {:?}", res.map(|_| ())),
    }

    drop(a);
    drop(b);
    drop(c);
    // all pins released, overwriting is fine again.
    engine.overwrite_zero(0).unwrap();

    // out-of-range block access through a handle.
    let handle = engine.pin(1, true).unwrap();
    match handle.write_at(508, &[0; 8]) {
        Err(Error::BadArgument(_, _)) => (),
        res => panic!("unexpected {:?}", res),
    }
}

#[test]
fn test_cache_eviction() {
    let seed: u64 = random();
    let mut rng = SmallRng::seed_from_u64(seed);
    println!("test_cache_eviction {}", seed);

    // tiny cache, 4 blocks.
    let engine = Engine::file_engine(Box::new(MemFile::new()), engine_config(512, 4)).unwrap();
    engine.grow(64).unwrap();

    for index in 0..64 {
        let handle = engine.overwrite_zero(index).unwrap();
        handle.write_at(0, &index.to_be_bytes()).unwrap();
    }
    // dirty blocks were evicted through the cache bound and flushed.
    let stats = engine.to_stats();
    assert!(stats.writes >= 60, "stats.writes {}", stats.writes);

    for _ in 0..100 {
        let index = rng.gen::<u64>() % 64;
        let handle = engine.pin(index, true).unwrap();
        assert_eq!(handle.get::<u64>(0).unwrap(), index);
    }

    engine.flush().unwrap();
    // size in blocks times block-size matches the file size.
    assert_eq!(engine.size().unwrap(), 64);
}

#[test]
fn test_file_engine_reopen() {
    let seed: u64 = random();
    let mut rng = SmallRng::seed_from_u64(seed);
    println!("test_file_engine_reopen {}", seed);

    let loc = temp_file(&mut rng, "reopen");

    {
        let fd = Box::new(SysFile::create(&loc).unwrap());
        let engine = Engine::file_engine(fd, engine_config(512, 8)).unwrap();
        engine.grow(8).unwrap();
        for index in 0..8 {
            let handle = engine.overwrite_zero(index).unwrap();
            handle.set(0, &(index * 7)).unwrap();
        }
        engine.flush().unwrap();
        engine.close().unwrap();
    }
    assert_eq!(std::fs::metadata(&loc).unwrap().len(), 8 * 512);

    let fd = Box::new(SysFile::open(&loc, true).unwrap());
    let engine = Engine::file_engine(fd, engine_config(512, 8)).unwrap();
    assert!(engine.is_read_only());
    assert_eq!(engine.size().unwrap(), 8);
    for index in 0..8 {
        let handle = engine.pin(index, true).unwrap();
        assert_eq!(handle.get::<u64>(0).unwrap(), index * 7);
        match handle.mark_dirty() {
            Err(Error::ReadOnly(_, _)) => (),
            res => panic!("unexpected {:?}", res),
        }
    }
    match engine.grow(1) {
        Err(Error::ReadOnly(_, _)) => (),
        res => panic!("unexpected {:?}", res),
    }
    engine.close().unwrap();

    std::fs::remove_file(&loc).unwrap();
}

#[test]
fn test_txn_engine_basic() {
    let seed: u64 = random();
    println!("test_txn_engine_basic {}", seed);

    let engine = Engine::transaction_engine(
        Box::new(MemFile::new()),
        Box::new(MemFile::new()),
        engine_config(512, 32),
        JournalConfig::default(),
    )
    .unwrap();
    assert!(!engine.in_transaction());
    assert_eq!(engine.size().unwrap(), 0);

    // mutating operations demand a transaction.
    match engine.grow(1) {
        Err(Error::BadOperation(_, _)) => (),
        res => panic!("unexpected {:?}", res),
    }
    match engine.commit() {
        Err(Error::BadOperation(_, _)) => (),
        res => panic!("unexpected {:?}", res),
    }

    engine.begin().unwrap();
    assert!(engine.in_transaction());
    engine.grow(4).unwrap();
    {
        let handle = engine.overwrite_zero(1).unwrap();
        handle.write_at(0, &[0xB0; 32]).unwrap();
    }
    engine.commit().unwrap();
    assert!(!engine.in_transaction());
    assert!(engine.journal_has_changes());

    // committed content is visible outside the transaction.
    let handle = engine.pin(1, true).unwrap();
    assert_eq!(handle.read_vec(0, 32).unwrap(), vec![0xB0; 32]);
    drop(handle);

    // writes become visible to future reads inside the transaction...
    engine.begin().unwrap();
    {
        let handle = engine.pin(1, true).unwrap();
        handle.write_at(0, &[0xB3; 32]).unwrap();
        handle.flush().unwrap();
    }
    let handle = engine.pin(1, true).unwrap();
    assert_eq!(handle.read_vec(0, 32).unwrap(), vec![0xB3; 32]);
    drop(handle);

    // ...until rollback discards them.
    engine.rollback().unwrap();
    let handle = engine.pin(1, true).unwrap();
    assert_eq!(handle.read_vec(0, 32).unwrap(), vec![0xB0; 32]);
    drop(handle);

    engine.close().unwrap();
}

#[test]
fn test_txn_rollback_rules() {
    let seed: u64 = random();
    println!("test_txn_rollback_rules {}", seed);

    let engine = Engine::transaction_engine(
        Box::new(MemFile::new()),
        Box::new(MemFile::new()),
        engine_config(512, 32),
        JournalConfig::default(),
    )
    .unwrap();

    engine.begin().unwrap();
    engine.grow(2).unwrap();
    let handle = engine.overwrite_zero(0).unwrap();

    // rollback with pins held is refused.
    match engine.rollback() {
        Err(Error::BadOperation(_, _)) => (),
        res => panic!("unexpected {:?}", res),
    }
    drop(handle);
    engine.rollback().unwrap();
    assert_eq!(engine.size().unwrap(), 0);

    // checkpoint inside a transaction is refused.
    engine.begin().unwrap();
    engine.grow(1).unwrap();
    match engine.checkpoint() {
        Err(Error::BadOperation(_, _)) => (),
        res => panic!("unexpected {:?}", res),
    }
    engine.commit().unwrap();
    engine.checkpoint().unwrap();
    assert!(!engine.journal_has_changes());
    assert_eq!(engine.journal_size().unwrap(), journal::LOG_HEADER_SIZE as u64);
}

// Full cycle against the file system: commit, crash, reopen, replay,
// checkpoint.
#[test]
fn test_txn_engine_reopen() {
    let seed: u64 = random();
    let mut rng = SmallRng::seed_from_u64(seed);
    println!("test_txn_engine_reopen {}", seed);

    let db_loc = temp_file(&mut rng, "txn-db");
    let log_loc = temp_file(&mut rng, "txn-log");

    {
        let dbfd = Box::new(SysFile::create(&db_loc).unwrap());
        let logfd = Box::new(SysFile::create(&log_loc).unwrap());
        let engine = Engine::transaction_engine(
            dbfd,
            logfd,
            engine_config(512, 32),
            JournalConfig::default(),
        )
        .unwrap();

        engine.begin().unwrap();
        engine.grow(77).unwrap();
        let handle = engine.overwrite_zero(66).unwrap();
        handle.write_at(0, &vec![0xB0; 512]).unwrap();
        drop(handle);
        engine.commit().unwrap();
        engine.close().unwrap();
    }
    // the database file was never checkpointed.
    assert_eq!(std::fs::metadata(&db_loc).unwrap().len(), 0);

    {
        let dbfd = Box::new(SysFile::open(&db_loc, false).unwrap());
        let logfd = Box::new(SysFile::open(&log_loc, false).unwrap());
        let engine = Engine::transaction_engine(
            dbfd,
            logfd,
            engine_config(512, 32),
            JournalConfig::default(),
        )
        .unwrap();
        assert_eq!(engine.size().unwrap(), 77);

        let handle = engine.pin(66, true).unwrap();
        assert_eq!(handle.read_vec(0, 512).unwrap(), vec![0xB0; 512]);
        drop(handle);

        engine.checkpoint().unwrap();
        engine.close().unwrap();
    }
    assert_eq!(std::fs::metadata(&db_loc).unwrap().len(), 77 * 512);
    assert_eq!(
        std::fs::metadata(&log_loc).unwrap().len(),
        journal::LOG_HEADER_SIZE as u64
    );

    // after checkpoint the data lives in the database file.
    {
        let dbfd = Box::new(SysFile::open(&db_loc, false).unwrap());
        let logfd = Box::new(SysFile::open(&log_loc, false).unwrap());
        let engine = Engine::transaction_engine(
            dbfd,
            logfd,
            engine_config(512, 32),
            JournalConfig::default(),
        )
        .unwrap();
        assert_eq!(engine.size().unwrap(), 77);
        let handle = engine.pin(66, true).unwrap();
        assert_eq!(handle.read_vec(0, 512).unwrap(), vec![0xB0; 512]);
        drop(handle);
        engine.close().unwrap();
    }

    std::fs::remove_file(&db_loc).unwrap();
    std::fs::remove_file(&log_loc).unwrap();
}
