use rand::{prelude::random, rngs::SmallRng, Rng, SeedableRng};

use std::{env, rc::Rc};

use super::*;
use crate::{
    alloc::BlockAlloc,
    btree::{Tree, TreeValue},
    config::{EngineConfig, JournalConfig},
    vfs::{MemFile, SysFile},
    Error, Result,
};

fn engine_config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.set_block_size(512).set_cache_blocks(32);
    config
}

fn temp_file(rng: &mut SmallRng, tag: &str) -> std::ffi::OsString {
    let mut loc = env::temp_dir();
    loc.push(format!("edms-format-{}-{}.db", tag, rng.gen::<u32>()));
    loc.into_os_string()
}

#[test]
fn test_create_open() {
    let seed: u64 = random();
    let mut rng = SmallRng::seed_from_u64(seed);
    println!("test_create_open {}", seed);

    let loc = temp_file(&mut rng, "create");

    {
        let fd = Box::new(SysFile::create(&loc).unwrap());
        let engine = Engine::file_engine(fd, engine_config()).unwrap();
        let db = Db::create(engine, AllocConfig::default(), 42).unwrap();
        assert_eq!(db.to_user_version(), 42);

        let first = db.as_alloc().allocate(3).unwrap();
        assert_eq!(first, 1);
        db.close().unwrap();
    }

    {
        let fd = Box::new(SysFile::open(&loc, false).unwrap());
        let engine = Engine::file_engine(fd, engine_config()).unwrap();
        let db = Db::open(engine, AllocConfig::default()).unwrap();
        assert_eq!(db.to_user_version(), 42);
        assert_eq!(db.as_alloc().data_used(), 3);
        assert_eq!(db.user_anchor_loc().index, 0);
        db.close().unwrap();
    }

    // opening with a different block size fails the header check.
    {
        let fd = Box::new(SysFile::open(&loc, false).unwrap());
        let mut config = engine_config();
        config.set_block_size(1024);
        let engine = Engine::file_engine(fd, config).unwrap();
        match Db::open(engine, AllocConfig::default()) {
            // 512-block file is not 1024 aligned in blocks read, the
            // engine or the header check trips either way.
            Err(Error::Corruption(_, _)) => (),
            res => panic!("unexpected {:?}", res.map(|_| ())),
        }
    }

    // corrupt the magic.
    {
        use crate::vfs::FileIo;
        let mut fd = SysFile::open(&loc, false).unwrap();
        fd.write_at(0, b"not-a-database!!").unwrap();
    }
    {
        let fd = Box::new(SysFile::open(&loc, false).unwrap());
        let engine = Engine::file_engine(fd, engine_config()).unwrap();
        match Db::open(engine, AllocConfig::default()) {
            Err(Error::Corruption(_, _)) => (),
            res => panic!("unexpected {:?}", res.map(|_| ())),
        }
    }

    std::fs::remove_file(&loc).unwrap();
}

// The full stack: a tree anchored in the user region of a database
// file, surviving close and reopen.
#[test]
fn test_db_with_tree() {
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

    let seed: u64 = random();
    let mut rng = SmallRng::seed_from_u64(seed);
    println!("test_db_with_tree {}", seed);

    let loc = temp_file(&mut rng, "with-tree");

    {
        let fd = Box::new(SysFile::create(&loc).unwrap());
        let engine = Engine::file_engine(fd, engine_config()).unwrap();
        let db = Db::create(engine, AllocConfig::default(), 1).unwrap();

        let cell = db.user_anchor_loc().to_cell(db.as_engine()).unwrap();
        let alloc: Rc<dyn BlockAlloc> = Rc::new(db.as_alloc().clone());
        let tree: Tree<Item> = Tree::create(db.as_engine().clone(), alloc, cell).unwrap();
        for key in 0..2000_u64 {
            tree.insert(&Item(key * 3)).unwrap();
        }
        tree.validate().unwrap();

        drop(tree); // releases the anchor pin before closing.
        db.close().unwrap();
    }

    {
        let fd = Box::new(SysFile::open(&loc, false).unwrap());
        let engine = Engine::file_engine(fd, engine_config()).unwrap();
        let db = Db::open(engine, AllocConfig::default()).unwrap();

        let cell = db.user_anchor_loc().to_cell(db.as_engine()).unwrap();
        let alloc: Rc<dyn BlockAlloc> = Rc::new(db.as_alloc().clone());
        let tree: Tree<Item> = Tree::load(db.as_engine().clone(), alloc, cell).unwrap();
        assert_eq!(tree.len(), 2000);
        tree.validate().unwrap();

        let cursor = tree.find(&4500).unwrap();
        assert_eq!(cursor.get().unwrap(), Item(4500));
        let cursor = tree.lower_bound(&4501).unwrap();
        assert_eq!(cursor.key().unwrap(), 4503);

        drop(tree);
        db.close().unwrap();
    }

    std::fs::remove_file(&loc).unwrap();
}

#[test]
fn test_create_bad_args() {
    let engine = {
        let mut config = EngineConfig::default();
        config.set_block_size(256).set_cache_blocks(8);
        Engine::file_engine(Box::new(MemFile::new()), config).unwrap()
    };
    match Db::create(engine, AllocConfig::default(), 0) {
        Err(Error::BadArgument(_, _)) => (),
        res => panic!("unexpected {:?}", res.map(|_| ())),
    }

    // non-empty file.
    let engine = Engine::file_engine(Box::new(MemFile::new()), engine_config()).unwrap();
    engine.grow(1).unwrap();
    match Db::create(engine, AllocConfig::default(), 0) {
        Err(Error::BadArgument(_, _)) => (),
        res => panic!("unexpected {:?}", res.map(|_| ())),
    }
}

#[test]
fn test_transactional_db() {
    let seed: u64 = random();
    let mut rng = SmallRng::seed_from_u64(seed);
    println!("test_transactional_db {}", seed);

    let db_loc = temp_file(&mut rng, "txn-db");
    let log_loc = temp_file(&mut rng, "txn-log");

    {
        let dbfd = Box::new(SysFile::create(&db_loc).unwrap());
        let logfd = Box::new(SysFile::create(&log_loc).unwrap());
        let engine = Engine::transaction_engine(
            dbfd,
            logfd,
            engine_config(),
            JournalConfig::default(),
        )
        .unwrap();
        let db = Db::create(engine, AllocConfig::default(), 7).unwrap();

        // a committed allocation survives.
        db.begin().unwrap();
        let a = db.as_alloc().allocate(2).unwrap();
        db.commit().unwrap();

        // a rolled back allocation does not; the allocator picture
        // snaps back to the committed state.
        let used = db.as_alloc().data_used();
        db.begin().unwrap();
        db.as_alloc().allocate(5).unwrap();
        assert_eq!(db.as_alloc().data_used(), used + 5);
        db.rollback().unwrap();
        assert_eq!(db.as_alloc().data_used(), used);

        // the freed-and-committed region is reusable.
        db.begin().unwrap();
        db.as_alloc().free(a, 2).unwrap();
        db.commit().unwrap();
        assert_eq!(db.as_alloc().data_used(), used - 2);

        db.close().unwrap();
    }

    // reopen: journal replay hands back the committed allocator.
    {
        let dbfd = Box::new(SysFile::open(&db_loc, false).unwrap());
        let logfd = Box::new(SysFile::open(&log_loc, false).unwrap());
        let engine = Engine::transaction_engine(
            dbfd,
            logfd,
            engine_config(),
            JournalConfig::default(),
        )
        .unwrap();
        let db = Db::open(engine, AllocConfig::default()).unwrap();
        assert_eq!(db.to_user_version(), 7);
        assert_eq!(db.as_alloc().data_used(), 0);

        db.checkpoint().unwrap();
        db.close().unwrap();
    }

    // after checkpoint the database stands on its own.
    {
        let dbfd = Box::new(SysFile::open(&db_loc, false).unwrap());
        let logfd = Box::new(SysFile::open(&log_loc, false).unwrap());
        let engine = Engine::transaction_engine(
            dbfd,
            logfd,
            engine_config(),
            JournalConfig::default(),
        )
        .unwrap();
        let db = Db::open(engine, AllocConfig::default()).unwrap();
        assert_eq!(db.as_alloc().data_used(), 0);
        db.close().unwrap();
    }

    std::fs::remove_file(&db_loc).unwrap();
    std::fs::remove_file(&log_loc).unwrap();
}
