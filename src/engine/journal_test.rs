use rand::{prelude::random, rngs::SmallRng, Rng, SeedableRng};

use std::env;

use super::*;
use crate::{
    vfs::{MemFile, SysFile},
    Error,
};

const BLOCK_SIZE: usize = 512;

fn block_data(byte: u8) -> Vec<u8> {
    vec![byte; BLOCK_SIZE]
}

fn temp_file(rng: &mut SmallRng, tag: &str) -> std::ffi::OsString {
    let mut loc = env::temp_dir();
    loc.push(format!("edms-journal-{}-{}.log", tag, rng.gen::<u32>()));
    loc.into_os_string()
}

#[test]
fn test_journal_header() {
    let seed: u64 = random();
    let mut rng = SmallRng::seed_from_u64(seed);
    println!("test_journal_header {}", seed);

    let loc = temp_file(&mut rng, "header");

    let fd = Box::new(SysFile::create(&loc).unwrap());
    let mut jn = Journal::create(fd, BLOCK_SIZE, JournalConfig::default()).unwrap();
    assert_eq!(jn.to_log_size(), LOG_HEADER_SIZE as u64);
    assert!(!jn.is_in_transaction());
    assert!(!jn.has_committed_changes());
    jn.close().unwrap();
    drop(jn);

    // clean reopen.
    let fd = Box::new(SysFile::open(&loc, false).unwrap());
    let jn = Journal::open(fd, BLOCK_SIZE, JournalConfig::default()).unwrap();
    assert_eq!(jn.to_log_size(), LOG_HEADER_SIZE as u64);
    assert_eq!(jn.to_database_size(), None);
    drop(jn);

    // mismatched block size.
    let fd = Box::new(SysFile::open(&loc, false).unwrap());
    match Journal::open(fd, BLOCK_SIZE * 2, JournalConfig::default()) {
        Err(Error::Corruption(_, _)) => (),
        res => panic!("unexpected {:?}", res.map(|_| ())),
    }

    // corrupted magic.
    {
        let mut fd = SysFile::open(&loc, false).unwrap();
        fd.write_at(0, b"garbage-garbage-").unwrap();
    }
    let fd = Box::new(SysFile::open(&loc, false).unwrap());
    match Journal::open(fd, BLOCK_SIZE, JournalConfig::default()) {
        Err(Error::Corruption(_, _)) => (),
        res => panic!("unexpected {:?}", res.map(|_| ())),
    }

    std::fs::remove_file(&loc).unwrap();
}

#[test]
fn test_journal_write_read() {
    let seed: u64 = random();
    let mut rng = SmallRng::seed_from_u64(seed);
    println!("test_journal_write_read {}", seed);

    let fd = Box::new(MemFile::new());
    let mut jn = Journal::create(fd, BLOCK_SIZE, JournalConfig::default()).unwrap();

    let mut buf = vec![0; BLOCK_SIZE];

    // nothing known before the first write.
    assert!(!jn.read(10, &mut buf).unwrap());

    match jn.write(10, &block_data(0xAA)) {
        Err(Error::BadOperation(_, _)) => (),
        res => panic!("unexpected {:?}", res),
    }

    jn.begin().unwrap();
    jn.write(10, &block_data(0xAA)).unwrap();
    jn.write(11, &block_data(0xBB)).unwrap();
    // within the transaction, the uncommitted version is visible.
    assert!(jn.read(10, &mut buf).unwrap());
    assert_eq!(buf, block_data(0xAA));

    // re-writing a block overwrites the record in place.
    let log_size = jn.to_log_size();
    jn.write(10, &block_data(0xAC)).unwrap();
    assert_eq!(jn.to_log_size(), log_size);
    assert!(jn.read(10, &mut buf).unwrap());
    assert_eq!(buf, block_data(0xAC));

    jn.commit(12).unwrap();
    assert!(jn.has_committed_changes());
    assert_eq!(jn.to_database_size(), Some(12));
    assert!(jn.read(11, &mut buf).unwrap());
    assert_eq!(buf, block_data(0xBB));

    // commit drops committed entries beyond the new database size.
    jn.begin().unwrap();
    jn.write(11, &block_data(0xBC)).unwrap();
    jn.commit(11).unwrap();
    assert!(!jn.read(11, &mut buf).unwrap());
    assert!(jn.read(10, &mut buf).unwrap());
    assert_eq!(buf, block_data(0xAC));

    // nested begin is refused.
    jn.begin().unwrap();
    match jn.begin() {
        Err(Error::BadOperation(_, _)) => (),
        res => panic!("unexpected {:?}", res),
    }
    jn.rollback().unwrap();
}

// Scenario: begin; write block 66 = B0, commit(77); begin; write
// 66 = B3; abort. Reading block 66 returns B0 and the log is the size
// it had right after the commit.
#[test]
fn test_journal_rollback() {
    let seed: u64 = random();
    println!("test_journal_rollback {}", seed);

    let fd = Box::new(MemFile::new());
    let mut jn = Journal::create(fd, BLOCK_SIZE, JournalConfig::default()).unwrap();

    jn.begin().unwrap();
    jn.write(66, &block_data(0xB0)).unwrap();
    jn.commit(77).unwrap();
    let committed_size = jn.to_log_size();

    jn.begin().unwrap();
    jn.write(66, &block_data(0xB3)).unwrap();
    assert_eq!(jn.to_uncommitted_blocks(), vec![66]);
    jn.rollback().unwrap();

    let mut buf = vec![0; BLOCK_SIZE];
    assert!(jn.read(66, &mut buf).unwrap());
    assert_eq!(buf, block_data(0xB0));
    assert_eq!(jn.to_log_size(), committed_size);
    assert_eq!(jn.to_database_size(), Some(77));
    assert!(jn.to_uncommitted_blocks().is_empty());
}

// Scenario: commit(77) setting block 66 = B0, drop the journal,
// reopen, checkpoint. The database file ends up 77 blocks long with
// B0 at block 66, and the log shrinks back to its header.
#[test]
fn test_journal_checkpoint() {
    let seed: u64 = random();
    let mut rng = SmallRng::seed_from_u64(seed);
    println!("test_journal_checkpoint {}", seed);

    let log_loc = temp_file(&mut rng, "checkpoint");
    let db_loc = temp_file(&mut rng, "checkpoint-db");

    {
        let fd = Box::new(SysFile::create(&log_loc).unwrap());
        let mut jn = Journal::create(fd, BLOCK_SIZE, JournalConfig::default()).unwrap();
        jn.begin().unwrap();
        jn.write(66, &block_data(0xB0)).unwrap();
        jn.commit(77).unwrap();
        jn.close().unwrap();
    }

    let fd = Box::new(SysFile::open(&log_loc, false).unwrap());
    let mut jn = Journal::open(fd, BLOCK_SIZE, JournalConfig::default()).unwrap();
    assert_eq!(jn.to_database_size(), Some(77));
    let mut buf = vec![0; BLOCK_SIZE];
    assert!(jn.read(66, &mut buf).unwrap());
    assert_eq!(buf, block_data(0xB0));

    let mut dbfd = SysFile::create(&db_loc).unwrap();
    assert!(jn.checkpoint(&mut dbfd).unwrap());

    assert_eq!(dbfd.file_size().unwrap(), 77 * BLOCK_SIZE as u64);
    assert_eq!(jn.to_log_size(), LOG_HEADER_SIZE as u64);
    assert!(!jn.has_committed_changes());
    dbfd.read_at(66 * BLOCK_SIZE as u64, &mut buf).unwrap();
    assert_eq!(buf, block_data(0xB0));

    // idempotent: a second checkpoint has nothing to do.
    assert!(!jn.checkpoint(&mut dbfd).unwrap());

    std::fs::remove_file(&log_loc).unwrap();
    std::fs::remove_file(&db_loc).unwrap();
}

// Scenario: begin a transaction, write 12 blocks through a tiny
// buffer forcing flushes to disk, then "crash" without commit or
// abort. On reopen the transaction is gone and the log holds only
// its header.
#[test]
fn test_journal_crash_restore() {
    let seed: u64 = random();
    let mut rng = SmallRng::seed_from_u64(seed);
    println!("test_journal_crash_restore {}", seed);

    let loc = temp_file(&mut rng, "crash");

    {
        let mut config = JournalConfig::default();
        config.set_buffer_size(64); // force flushes on every write.
        let fd = Box::new(SysFile::create(&loc).unwrap());
        let mut jn = Journal::create(fd, BLOCK_SIZE, config).unwrap();
        jn.begin().unwrap();
        for index in 0..12 {
            jn.write(index, &block_data(index as u8)).unwrap();
        }
        // records definitely reached the file.
        assert!(jn.to_log_size() > LOG_HEADER_SIZE as u64);
        // no commit, no rollback: simulated crash.
        drop(jn);
    }
    assert!(
        std::fs::metadata(&loc).unwrap().len() > LOG_HEADER_SIZE as u64,
        "crash must leave a partial transaction behind"
    );

    let fd = Box::new(SysFile::open(&loc, false).unwrap());
    let mut jn = Journal::open(fd, BLOCK_SIZE, JournalConfig::default()).unwrap();
    assert_eq!(jn.to_log_size(), LOG_HEADER_SIZE as u64);
    assert_eq!(jn.to_database_size(), None);
    let mut buf = vec![0; BLOCK_SIZE];
    for index in 0..12 {
        assert!(!jn.read(index, &mut buf).unwrap());
    }
    assert_eq!(
        std::fs::metadata(&loc).unwrap().len(),
        LOG_HEADER_SIZE as u64
    );

    std::fs::remove_file(&loc).unwrap();
}

// Replaying the log from scratch yields the same committed index and
// size as the live journal.
#[test]
fn test_journal_replay_equivalence() {
    let seed: u64 = random();
    let mut rng = SmallRng::seed_from_u64(seed);
    println!("test_journal_replay_equivalence {}", seed);

    let loc = temp_file(&mut rng, "replay");

    let mut live: Vec<(u64, Vec<u8>)> = vec![];
    let database_size = {
        let fd = Box::new(SysFile::create(&loc).unwrap());
        let mut jn = Journal::create(fd, BLOCK_SIZE, JournalConfig::default()).unwrap();

        let mut database_size = 0;
        for _ in 0..10 {
            jn.begin().unwrap();
            let n_writes = rng.gen::<usize>() % 7;
            let mut txn: Vec<(u64, Vec<u8>)> = vec![];
            for _ in 0..n_writes {
                let index = rng.gen::<u64>() % 40;
                let data = block_data(rng.gen());
                jn.write(index, &data).unwrap();
                txn.push((index, data));
            }
            if rng.gen::<bool>() {
                database_size = 40;
                jn.commit(database_size).unwrap();
                for (index, data) in txn.into_iter() {
                    live.retain(|(i, _)| *i != index);
                    live.push((index, data));
                }
            } else {
                jn.rollback().unwrap();
            }
        }
        jn.close().unwrap();
        database_size
    };

    let fd = Box::new(SysFile::open(&loc, false).unwrap());
    let mut jn = Journal::open(fd, BLOCK_SIZE, JournalConfig::default()).unwrap();
    match database_size {
        0 => assert_eq!(jn.to_database_size(), None),
        n => assert_eq!(jn.to_database_size(), Some(n)),
    }
    let mut buf = vec![0; BLOCK_SIZE];
    for (index, data) in live.into_iter() {
        assert!(jn.read(index, &mut buf).unwrap(), "block {}", index);
        assert_eq!(&buf, &data, "block {}", index);
    }

    std::fs::remove_file(&loc).unwrap();
}
