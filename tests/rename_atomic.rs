//! Rename must replace the destination in one step: readers see old or new content, never a mix.

use platform_env::{
    Env, EnvConfig, ManualClock, MemBackend, RandomAccessFile, SequentialFile, WritableFile,
    WriteMode,
};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

const OLD: u8 = b'o';
const NEW: u8 = b'n';
const SIZE: usize = 8 * 1024;
const SMALL: usize = 16;

fn check_uniform(buf: &[u8]) {
    let first = buf[0];
    assert!(first == OLD || first == NEW, "unexpected byte {first}");
    assert!(buf.iter().all(|&b| b == first), "reader observed a partial swap");
}

#[test]
fn rename_over_existing_overwrites() {
    let td = tempfile::tempdir().unwrap();
    let env = Env::with_defaults();
    let src = td.path().join("CURRENT.tmp");
    let dst = td.path().join("CURRENT");
    env.write_file_atomic(&dst, b"old").unwrap();
    std::fs::write(&src, b"from-src").unwrap();
    env.rename_file(&src, &dst).unwrap();
    assert!(!env.file_exists(&src));
    assert_eq!(env.read_file(&dst).unwrap(), b"from-src");
}

#[test]
fn rename_missing_source_is_not_found() {
    let td = tempfile::tempdir().unwrap();
    let env = Env::with_defaults();
    let err = env.rename_file(&td.path().join("a"), &td.path().join("b")).unwrap_err();
    assert_eq!(err.kind(), platform_env::ErrorKind::NotFound);
}

#[test]
fn concurrent_readers_never_see_partial_content_on_disk() {
    let td = tempfile::tempdir().unwrap();
    let env = Arc::new(Env::with_defaults());
    let dst = td.path().join("table");
    env.write_file_atomic(&dst, &[OLD; SIZE]).unwrap();

    let stop = Arc::new(AtomicBool::new(false));
    let readers: Vec<_> = (0..4)
        .map(|_| {
            let env = Arc::clone(&env);
            let stop = Arc::clone(&stop);
            let dst = dst.clone();
            std::thread::spawn(move || {
                while !stop.load(Ordering::Relaxed) {
                    let data = env.read_file(&dst).unwrap();
                    // Old content is large, new content is small: any other pairing is a torn read.
                    match (data.len(), data[0]) {
                        (SIZE, OLD) | (SMALL, NEW) => check_uniform(&data),
                        (len, b) => panic!("torn read: {len} bytes starting with {b}"),
                    }
                }
            })
        })
        .collect();

    for i in 0..500 {
        if i % 2 == 0 {
            env.write_file_atomic(&dst, &[NEW; SMALL]).unwrap();
        } else {
            env.write_file_atomic(&dst, &[OLD; SIZE]).unwrap();
        }
    }
    stop.store(true, Ordering::Relaxed);
    for r in readers {
        r.join().unwrap();
    }
}

#[test]
fn open_sequential_handle_reports_its_own_length_after_replace() {
    let env = Env::with_backend(MemBackend::new(), ManualClock::shared(), &EnvConfig::default()).unwrap();
    let dst = Path::new("/MANIFEST");
    env.write_file_atomic(dst, &[OLD; SIZE]).unwrap();
    let mut reader = env.open_sequential(dst).unwrap();
    env.write_file_atomic(dst, &[NEW; SMALL]).unwrap();

    assert_eq!(reader.len().unwrap(), SIZE as u64);
    let mut buf = vec![0u8; SIZE];
    assert_eq!(reader.read(&mut buf).unwrap(), SIZE);
    check_uniform(&buf);
    assert_eq!(buf[0], OLD);
    assert_eq!(env.file_size(dst).unwrap(), SMALL as u64);
}

#[test]
fn open_handle_keeps_old_content_in_memory_backend() {
    let env = Env::with_backend(MemBackend::new(), ManualClock::shared(), &EnvConfig::default()).unwrap();
    let dst = Path::new("/CURRENT");
    let mut w = env.open_for_write(dst, WriteMode::Truncate).unwrap();
    w.append(&[OLD; 64]).unwrap();
    w.close().unwrap();
    let reader = env.open_random(dst).unwrap();

    let mut w = env.open_for_write(Path::new("/CURRENT.new"), WriteMode::CreateNew).unwrap();
    w.append(&[NEW; 128]).unwrap();
    w.close().unwrap();
    env.rename_file(Path::new("/CURRENT.new"), dst).unwrap();

    let mut buf = [0u8; 128];
    assert_eq!(reader.read_at(0, &mut buf).unwrap(), 64);
    check_uniform(&buf[..64]);
    assert_eq!(buf[0], OLD);
    assert_eq!(env.read_file(dst).unwrap(), vec![NEW; 128]);
}
