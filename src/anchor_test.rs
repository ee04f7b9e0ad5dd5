use super::*;
use crate::{config::EngineConfig, vfs::MemFile, Error, Result};

#[derive(Clone, Debug, PartialEq, Default)]
struct TestAnchor {
    root: u64,
    count: u64,
    flag: bool,
}

impl Codec for TestAnchor {
    const SIZE: usize = 17;

    fn encode(&self, buf: &mut [u8]) {
        self.root.encode(buf);
        self.count.encode(&mut buf[8..]);
        self.flag.encode(&mut buf[16..]);
    }

    fn decode(buf: &[u8]) -> Result<Self> {
        Ok(TestAnchor {
            root: u64::decode(buf)?,
            count: u64::decode(&buf[8..])?,
            flag: bool::decode(&buf[16..])?,
        })
    }
}

fn test_engine() -> Engine {
    let mut config = EngineConfig::default();
    config.set_block_size(512).set_cache_blocks(8);
    let engine = Engine::file_engine(Box::new(MemFile::new()), config).unwrap();
    engine.grow(1).unwrap();
    engine.overwrite_zero(0).unwrap();
    engine
}

#[test]
fn test_anchor_cell() {
    let engine = test_engine();

    let loc = AnchorLoc::new(0, 40);
    let cell: AnchorCell<TestAnchor> = loc.to_cell(&engine).unwrap();
    assert_eq!(cell.to_loc(), loc);

    // zeroed block decodes as the default anchor.
    assert_eq!(cell.fetch().unwrap(), TestAnchor::default());

    let value = TestAnchor {
        root: 77,
        count: 11,
        flag: true,
    };
    cell.store(&value).unwrap();
    assert_eq!(cell.fetch().unwrap(), value);

    // storing through the cell marked the block dirty; after a flush
    // the value survives eviction and re-read.
    engine.flush().unwrap();
    drop(cell);

    let cell: AnchorCell<TestAnchor> = loc.to_cell(&engine).unwrap();
    assert_eq!(cell.fetch().unwrap(), value);
}

#[test]
fn test_anchor_project() {
    let engine = test_engine();

    let cell: AnchorCell<TestAnchor> = AnchorLoc::new(0, 8).to_cell(&engine).unwrap();
    cell.store(&TestAnchor {
        root: 0xAABB,
        count: 0xCCDD,
        flag: false,
    })
    .unwrap();

    // `count` lives 8 bytes into the record.
    let count: AnchorCell<u64> = cell.project(8).unwrap();
    assert_eq!(count.fetch().unwrap(), 0xCCDD);
    count.store(&42).unwrap();
    assert_eq!(cell.fetch().unwrap().count, 42);
    assert_eq!(cell.fetch().unwrap().root, 0xAABB);

    // projections beyond the record are refused.
    match cell.project::<u64>(10) {
        Err(Error::BadArgument(_, _)) => (),
        res => panic!("unexpected {:?}", res.map(|_| ())),
    }
}

#[test]
fn test_anchor_bounds() {
    let engine = test_engine();
    match AnchorLoc::new(0, 500).to_cell::<TestAnchor>(&engine) {
        Err(Error::BadArgument(_, _)) => (),
        res => panic!("unexpected {:?}", res.map(|_| ())),
    }
}
