use super::*;
use crate::{anchor::AnchorLoc, config::EngineConfig, vfs::MemFile, Error};

fn test_engine() -> Engine {
    let mut config = EngineConfig::default();
    config.set_block_size(512).set_cache_blocks(32);
    let engine = Engine::file_engine(Box::new(MemFile::new()), config).unwrap();
    engine.grow(1).unwrap();
    engine.overwrite_zero(0).unwrap();
    engine
}

fn anchor_cell(engine: &Engine) -> AnchorCell<Anchor> {
    AnchorLoc::new(0, 64).to_cell(engine).unwrap()
}

#[test]
fn test_node_allocate_free() {
    let engine = test_engine();
    let mut config = AllocConfig::default();
    config.set_chunk_blocks(4);
    let alloc = NodeAllocator::create(engine.clone(), anchor_cell(&engine), config).unwrap();

    // bump allocation from a fresh region.
    assert_eq!(alloc.allocate(1).unwrap(), 1);
    assert_eq!(alloc.allocate(1).unwrap(), 2);
    assert_eq!(alloc.allocate(1).unwrap(), 3);
    assert_eq!(alloc.data_total(), 4);
    assert_eq!(alloc.data_used(), 3);

    // the free list is LIFO.
    alloc.free(2, 1).unwrap();
    alloc.free(1, 1).unwrap();
    assert_eq!(alloc.data_used(), 1);
    assert_eq!(alloc.allocate(1).unwrap(), 1);
    assert_eq!(alloc.allocate(1).unwrap(), 2);

    // region exhausted, grows by another chunk.
    assert_eq!(alloc.allocate(1).unwrap(), 4);
    assert_eq!(alloc.allocate(1).unwrap(), 5);
    assert_eq!(alloc.data_total(), 8);
}

#[test]
fn test_node_unsupported() {
    let engine = test_engine();
    let alloc =
        NodeAllocator::create(engine.clone(), anchor_cell(&engine), AllocConfig::default())
            .unwrap();

    match alloc.allocate(2) {
        Err(Error::Unsupported(_, _)) => (),
        res => panic!("unexpected {:?}", res),
    }
    let a = alloc.allocate(1).unwrap();
    match alloc.free(a, 2) {
        Err(Error::Unsupported(_, _)) => (),
        res => panic!("unexpected {:?}", res),
    }
}

#[test]
fn test_node_reload() {
    let engine = test_engine();
    let alloc = {
        let mut config = AllocConfig::default();
        config.set_chunk_blocks(4);
        NodeAllocator::create(engine.clone(), anchor_cell(&engine), config).unwrap()
    };

    let a = alloc.allocate(1).unwrap();
    let b = alloc.allocate(1).unwrap();
    alloc.free(a, 1).unwrap();
    let (total, used) = (alloc.data_total(), alloc.data_used());
    drop(alloc);

    // the anchor carries everything needed to come back.
    let mut config = AllocConfig::default();
    config.set_chunk_blocks(4);
    let alloc = NodeAllocator::load(engine.clone(), anchor_cell(&engine), config).unwrap();
    assert_eq!(alloc.data_total(), total);
    assert_eq!(alloc.data_used(), used);
    // the freed block is first in line again.
    assert_eq!(alloc.allocate(1).unwrap(), a);
    let _ = b;
}
