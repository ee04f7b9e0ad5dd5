use rand::{prelude::random, rngs::SmallRng, Rng, SeedableRng};

use std::rc::Rc;

use super::*;
use crate::{
    alloc::{Allocator, BlockAlloc},
    anchor::AnchorLoc,
    btree::{Tree, TreeValue},
    codec::Codec,
    config::{AllocConfig, EngineConfig},
    vfs::MemFile,
    Error, Result,
};

#[derive(Clone, Debug, PartialEq)]
struct Item(u64);

impl Codec for Item {
    const SIZE: usize = 8;

    fn encode(&self, buf: &mut [u8]) {
        self.0.encode(buf)
    }

    fn decode(buf: &[u8]) -> Result<Self> {
        Ok(Item(u64::decode(buf)?))
    }
}

impl TreeValue for Item {
    type Key = u64;

    fn key(&self) -> u64 {
        self.0
    }
}

fn setup() -> (Engine, Rc<Allocator>, Tree<Item>) {
    let mut config = EngineConfig::default();
    config.set_block_size(512).set_cache_blocks(64);
    let engine = Engine::file_engine(Box::new(MemFile::new()), config).unwrap();
    engine.grow(1).unwrap();
    engine.overwrite_zero(0).unwrap();

    let alloc = Rc::new(
        Allocator::create(engine.clone(), AnchorLoc::new(0, 64), AllocConfig::default()).unwrap(),
    );
    let cell = AnchorLoc::new(0, 128).to_cell(&engine).unwrap();
    let dyn_alloc: Rc<dyn BlockAlloc> = alloc.clone();
    let tree = Tree::create(engine.clone(), dyn_alloc, cell).unwrap();
    (engine, alloc, tree)
}

fn collect(tree: &Tree<Item>) -> Vec<u64> {
    let mut keys = vec![];
    let cursor = tree.cursor();
    if cursor.seek_min().unwrap() {
        loop {
            keys.push(cursor.key().unwrap());
            if !cursor.move_next().unwrap() {
                break;
            }
        }
    }
    keys
}

// Bulk loading a sorted stream yields the same tree content as
// per-element insertion.
#[test]
fn test_loader_matches_insertion() {
    let seed: u64 = random();
    let mut rng = SmallRng::seed_from_u64(seed);
    println!("test_loader_matches_insertion {}", seed);

    let mut keys: Vec<u64> = (0..5000).map(|_| rng.gen::<u64>() % 100_000).collect();
    keys.sort_unstable();
    keys.dedup();

    let (_, _, loaded) = setup();
    {
        let mut loader = loaded.bulk_load().unwrap();
        for key in keys.iter() {
            loader.insert(&Item(*key)).unwrap();
        }
        loader.finish().unwrap();
    }
    loaded.validate().unwrap();
    assert_eq!(loaded.len(), keys.len() as u64);
    assert_eq!(collect(&loaded), keys);

    let (_, _, inserted) = setup();
    for key in keys.iter() {
        inserted.insert(&Item(*key)).unwrap();
    }
    assert_eq!(collect(&inserted), collect(&loaded));
}

#[test]
fn test_loader_small() {
    // zero values leave the tree empty.
    let (_, _, tree) = setup();
    tree.bulk_load().unwrap().finish().unwrap();
    assert!(tree.is_empty());
    assert_eq!(tree.height(), 0);

    // a single value makes the root a leaf.
    let mut loader = tree.bulk_load().unwrap();
    loader.insert(&Item(42)).unwrap();
    loader.finish().unwrap();
    assert_eq!(tree.len(), 1);
    assert_eq!(tree.height(), 1);
    tree.validate().unwrap();
    assert_eq!(collect(&tree), vec![42]);
}

#[test]
fn test_loader_rules() {
    let (_, _, tree) = setup();

    // strictly increasing keys only.
    let mut loader = tree.bulk_load().unwrap();
    loader.insert(&Item(10)).unwrap();
    match loader.insert(&Item(10)) {
        Err(Error::BadArgument(_, _)) => (),
        res => panic!("unexpected {:?}", res),
    }
    match loader.insert(&Item(5)) {
        Err(Error::BadArgument(_, _)) => (),
        res => panic!("unexpected {:?}", res),
    }
    loader.discard().unwrap();

    // only empty trees can be bulk loaded.
    tree.insert(&Item(1)).unwrap();
    match tree.bulk_load() {
        Err(Error::BadOperation(_, _)) => (),
        res => panic!("unexpected {:?}", res.map(|_| ())),
    }
}

#[test]
fn test_loader_discard() {
    let (_, alloc, tree) = setup();
    let used_before = alloc.data_used();

    let mut loader = tree.bulk_load().unwrap();
    for key in 0..10_000_u64 {
        loader.insert(&Item(key)).unwrap();
    }
    assert!(alloc.data_used() > used_before);
    loader.discard().unwrap();

    // every produced block was given back, the tree is still empty.
    assert_eq!(alloc.data_used(), used_before);
    assert!(tree.is_empty());

    // dropping a loader mid-way discards as well.
    let mut loader = tree.bulk_load().unwrap();
    for key in 0..1000_u64 {
        loader.insert(&Item(key)).unwrap();
    }
    drop(loader);
    assert_eq!(alloc.data_used(), used_before);
    assert!(tree.is_empty());
}

#[test]
fn test_loader_packs_leaves() {
    let (_, _, tree) = setup();
    let cap = tree.leaf_capacity() as u64;

    let mut loader = tree.bulk_load().unwrap();
    for key in 0..cap * 10 {
        loader.insert(&Item(key)).unwrap();
    }
    loader.finish().unwrap();
    tree.validate().unwrap();

    let anchor = tree.as_raw().to_anchor();
    assert_eq!(anchor.leaf_nodes, 10); // filled to the brim.
    assert_eq!(tree.len(), cap * 10);
    assert_eq!(collect(&tree), (0..cap * 10).collect::<Vec<u64>>());
}
