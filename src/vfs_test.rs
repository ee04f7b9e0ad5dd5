use rand::{prelude::random, rngs::SmallRng, Rng, SeedableRng};

use std::env;

use super::*;
use crate::Error;

#[test]
fn test_mem_file() {
    let seed: u64 = random();
    let mut rng = SmallRng::seed_from_u64(seed);
    println!("test_mem_file {}", seed);

    let mut fd = MemFile::new();
    assert_eq!(fd.file_size().unwrap(), 0);

    let data: Vec<u8> = (0..4096).map(|_| rng.gen()).collect();
    fd.write_at(0, &data).unwrap();
    assert_eq!(fd.file_size().unwrap(), 4096);

    let mut buf = vec![0; 4096];
    fd.read_at(0, &mut buf).unwrap();
    assert_eq!(buf, data);

    // sparse write extends with zeroes.
    fd.write_at(8192, &data).unwrap();
    assert_eq!(fd.file_size().unwrap(), 8192 + 4096);
    fd.read_at(4096, &mut buf).unwrap();
    assert_eq!(buf, vec![0; 4096]);

    // read past the end.
    assert!(fd.read_at(8192 + 4096, &mut buf).is_err());

    // truncate down, then up; growth is zero-filled.
    fd.truncate(4096).unwrap();
    assert_eq!(fd.file_size().unwrap(), 4096);
    fd.truncate(8192).unwrap();
    fd.read_at(4096, &mut buf).unwrap();
    assert_eq!(buf, vec![0; 4096]);

    fd.set_read_only(true);
    match fd.write_at(0, &data) {
        Err(Error::ReadOnly(_, _)) => (),
        res => panic!("unexpected {:?}", res),
    }
    match fd.truncate(0) {
        Err(Error::ReadOnly(_, _)) => (),
        res => panic!("unexpected {:?}", res),
    }

    fd.close().unwrap();
}

#[test]
fn test_sys_file() {
    let seed: u64 = random();
    let mut rng = SmallRng::seed_from_u64(seed);
    println!("test_sys_file {}", seed);

    let file = {
        let mut loc = env::temp_dir();
        loc.push(format!("edms-vfs-{}.data", rng.gen::<u32>()));
        loc.into_os_string()
    };

    let mut fd = SysFile::create(&file).unwrap();
    assert!(!fd.is_read_only());
    assert_eq!(fd.file_size().unwrap(), 0);

    let data: Vec<u8> = (0..4096).map(|_| rng.gen()).collect();
    fd.write_at(4096, &data).unwrap();
    assert_eq!(fd.file_size().unwrap(), 8192);

    let mut buf = vec![0; 4096];
    fd.read_at(4096, &mut buf).unwrap();
    assert_eq!(buf, data);
    fd.read_at(0, &mut buf).unwrap();
    assert_eq!(buf, vec![0; 4096]);

    fd.sync().unwrap();
    fd.close().unwrap();
    drop(fd);

    let mut fd = SysFile::open(&file, true /*read_only*/).unwrap();
    assert!(fd.is_read_only());
    fd.read_at(4096, &mut buf).unwrap();
    assert_eq!(buf, data);
    match fd.write_at(0, &data) {
        Err(Error::ReadOnly(_, _)) => (),
        res => panic!("unexpected {:?}", res),
    }
    fd.close().unwrap();
    drop(fd);

    fs::remove_file(&file).unwrap();
}
