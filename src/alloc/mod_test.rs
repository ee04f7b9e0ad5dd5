use rand::{prelude::random, rngs::SmallRng, Rng, SeedableRng};

use std::env;

use super::*;
use crate::{
    config::EngineConfig,
    vfs::{MemFile, SysFile},
    Error,
};

fn test_engine() -> Engine {
    let mut config = EngineConfig::default();
    config.set_block_size(512).set_cache_blocks(32);
    let engine = Engine::file_engine(Box::new(MemFile::new()), config).unwrap();
    engine.grow(1).unwrap();
    engine.overwrite_zero(0).unwrap();
    engine
}

fn test_alloc(engine: &Engine, chunk_blocks: u64) -> Allocator {
    let mut config = AllocConfig::default();
    config.set_chunk_blocks(chunk_blocks);
    Allocator::create(engine.clone(), AnchorLoc::new(0, 64), config).unwrap()
}

#[test]
fn test_allocate_free() {
    let seed: u64 = random();
    println!("test_allocate_free {}", seed);

    let engine = test_engine();
    let alloc = test_alloc(&engine, 8);
    assert_eq!(alloc.data_total(), 0);

    // first allocation grows the file by one chunk; block 0 is the
    // header and stays outside the managed region.
    let a = alloc.allocate(1).unwrap();
    assert_eq!(a, 1);
    assert_eq!(alloc.data_total(), 8);
    assert_eq!(alloc.data_used(), 1);
    assert_eq!(alloc.data_free(), 7);
    assert_eq!(engine.size().unwrap(), 9);

    // sequential allocations carve the same chunk.
    let b = alloc.allocate(3).unwrap();
    assert_eq!(b, 2);
    let c = alloc.allocate(4).unwrap();
    assert_eq!(c, 5);
    assert_eq!(alloc.data_free(), 0);

    // freeing coalesces: a then b gives one run of 4 blocks.
    alloc.free(a, 1).unwrap();
    alloc.free(b, 3).unwrap();
    assert_eq!(alloc.data_free(), 4);
    let d = alloc.allocate(4).unwrap();
    assert_eq!(d, 1);
    assert_eq!(alloc.data_free(), 0);

    alloc.free(d, 4).unwrap();
    alloc.free(c, 4).unwrap();
    // everything free again, a single coalesced extent serves a full
    // chunk-sized request without growing the file.
    assert_eq!(alloc.data_free(), 8);
    assert_eq!(alloc.allocate(8).unwrap(), 1);
    assert_eq!(engine.size().unwrap(), 9);
}

#[test]
fn test_best_fit() {
    let seed: u64 = random();
    println!("test_best_fit {}", seed);

    let engine = test_engine();
    let alloc = test_alloc(&engine, 16);

    let a = alloc.allocate(4).unwrap();
    let b = alloc.allocate(2).unwrap();
    let c = alloc.allocate(4).unwrap();
    let d = alloc.allocate(2).unwrap();
    assert_eq!(alloc.data_free(), 4); // chunk tail

    alloc.free(a, 4).unwrap();
    alloc.free(c, 4).unwrap();

    // exact fit prefers the lowest address among equal sizes.
    assert_eq!(alloc.allocate(4).unwrap(), a);
    assert_eq!(alloc.allocate(4).unwrap(), c);

    alloc.free(a, 4).unwrap();
    alloc.free(c, 4).unwrap();
    // a 3-block request best-fits a 4-block extent, leaving a
    // 1-block remainder at a+3.
    assert_eq!(alloc.allocate(3).unwrap(), a);
    assert_eq!(alloc.allocate(1).unwrap(), a + 3);

    let _ = (b, d);
}

#[test]
fn test_grow_chunking() {
    let seed: u64 = random();
    println!("test_grow_chunking {}", seed);

    let engine = test_engine();
    let alloc = test_alloc(&engine, 8);

    alloc.allocate(1).unwrap();
    assert_eq!(alloc.data_total(), 8);

    // larger than a chunk: the file grows by the request itself and
    // the new region coalesces with the chunk tail.
    let big = alloc.allocate(20).unwrap();
    assert_eq!(big, 2);
    assert_eq!(alloc.data_total(), 28);
    assert_eq!(alloc.data_used(), 21);
    assert_eq!(alloc.data_free(), 7);
    assert_eq!(engine.size().unwrap(), 29);
}

#[test]
fn test_free_errors() {
    let seed: u64 = random();
    println!("test_free_errors {}", seed);

    let engine = test_engine();
    let alloc = test_alloc(&engine, 8);

    let a = alloc.allocate(4).unwrap();

    match alloc.free(a + 1, 1) {
        Err(Error::BadArgument(_, _)) => (),
        res => panic!("unexpected {:?}", res),
    }
    match alloc.free(a, 5) {
        Err(Error::BadArgument(_, _)) => (),
        res => panic!("unexpected {:?}", res),
    }
    match alloc.allocate(0) {
        Err(Error::BadArgument(_, _)) => (),
        res => panic!("unexpected {:?}", res),
    }

    // partial release splits the allocated extent.
    alloc.free(a, 2).unwrap();
    assert_eq!(alloc.data_used(), 2);
    match alloc.free(a, 2) {
        Err(Error::BadArgument(_, _)) => (),
        res => panic!("unexpected {:?}", res),
    }
    alloc.free(a + 2, 2).unwrap();
    assert_eq!(alloc.data_used(), 0);

    match alloc.free(a, 4) {
        Err(Error::BadArgument(_, _)) => (),
        res => panic!("unexpected {:?}", res),
    }
}

#[test]
fn test_save_load() {
    let seed: u64 = random();
    let mut rng = SmallRng::seed_from_u64(seed);
    println!("test_save_load {}", seed);

    let loc = {
        let mut loc = env::temp_dir();
        loc.push(format!("edms-alloc-{}.db", rng.gen::<u32>()));
        loc.into_os_string()
    };

    let (total, used, freed) = {
        let fd = Box::new(SysFile::create(&loc).unwrap());
        let mut config = EngineConfig::default();
        config.set_block_size(512).set_cache_blocks(32);
        let engine = Engine::file_engine(fd, config).unwrap();
        engine.grow(1).unwrap();
        engine.overwrite_zero(0).unwrap();

        let alloc = test_alloc(&engine, 8);
        let mut runs = vec![];
        for _ in 0..20 {
            let n = rng.gen::<u64>() % 4 + 1;
            runs.push((alloc.allocate(n).unwrap(), n));
        }
        let mut freed = vec![];
        for (first, n) in runs.into_iter() {
            if rng.gen::<bool>() {
                alloc.free(first, n).unwrap();
                freed.push((first, n));
            }
        }
        alloc.save().unwrap();
        engine.flush().unwrap();
        engine.close().unwrap();
        (alloc.data_total(), alloc.data_used(), freed)
    };

    let fd = Box::new(SysFile::open(&loc, false).unwrap());
    let mut config = EngineConfig::default();
    config.set_block_size(512).set_cache_blocks(32);
    let engine = Engine::file_engine(fd, config).unwrap();

    let alloc = {
        let mut config = AllocConfig::default();
        config.set_chunk_blocks(8);
        Allocator::load(engine.clone(), AnchorLoc::new(0, 64), config).unwrap()
    };
    assert_eq!(alloc.data_total(), total);
    assert_eq!(alloc.data_used(), used);

    // freed runs are usable again after reopen.
    for (first, n) in freed.into_iter() {
        match alloc.free(first, n) {
            Err(Error::BadArgument(_, _)) => (),
            res => panic!("unexpected {:?}", res),
        }
    }

    std::fs::remove_file(&loc).unwrap();
}
