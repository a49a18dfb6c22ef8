use platform_env::{Env, ErrorKind, LockableFile};

#[test]
fn try_lock_uncontended() {
    let dir = tempfile::tempdir().unwrap();
    let env = Env::with_defaults();
    let lock = env.lock_file(&dir.path().join("LOCK")).unwrap();
    assert_eq!(lock.path(), dir.path().join("LOCK"));
}

#[test]
fn try_lock_contended_returns_already_locked() {
    let dir = tempfile::tempdir().unwrap();
    let env = Env::with_defaults();
    let path = dir.path().join("LOCK");
    let first = env.lock_file(&path).unwrap();
    let second = env.lock_file(&path).err().unwrap();
    assert_eq!(second.kind(), ErrorKind::AlreadyLocked);
    drop(first);
    let third = env.lock_file(&path);
    assert!(third.is_ok());
}

#[test]
fn lock_file_is_kept_after_unlock() {
    let dir = tempfile::tempdir().unwrap();
    let env = Env::with_defaults();
    let path = dir.path().join("LOCK");
    env.lock_file(&path).unwrap().unlock().unwrap();
    assert!(env.file_exists(&path));
}

#[test]
fn relocking_same_handle_fails() {
    let dir = tempfile::tempdir().unwrap();
    let env = Env::with_defaults();
    let mut h = env.open_lockable(&dir.path().join("LOCK")).unwrap();
    assert!(!h.is_locked());
    h.try_lock().unwrap();
    assert_eq!(h.try_lock().unwrap_err().kind(), ErrorKind::AlreadyLocked);
    h.unlock().unwrap();
}

#[test]
#[should_panic(expected = "does not hold")]
fn double_unlock_panics() {
    let dir = tempfile::tempdir().unwrap();
    let env = Env::with_defaults();
    let mut h = env.open_lockable(&dir.path().join("LOCK")).unwrap();
    h.try_lock().unwrap();
    h.unlock().unwrap();
    let _ = h.unlock();
}

#[test]
fn lock_is_exclusive_across_threads() {
    let dir = tempfile::tempdir().unwrap();
    let env = std::sync::Arc::new(Env::with_defaults());
    let path = dir.path().join("LOCK");
    let guard = env.lock_file(&path).unwrap();
    let env2 = std::sync::Arc::clone(&env);
    let p2 = path.clone();
    let kind = std::thread::spawn(move || env2.lock_file(&p2).map(|_| ()).unwrap_err().kind())
        .join()
        .unwrap();
    assert_eq!(kind, ErrorKind::AlreadyLocked);
    guard.unlock().unwrap();
}

#[test]
fn lock_hands_off_between_threads_without_overlap() {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    let dir = tempfile::tempdir().unwrap();
    let env = Arc::new(Env::with_defaults());
    let path = dir.path().join("LOCK");
    let inside = Arc::new(AtomicBool::new(false));
    let acquired = Arc::new(AtomicUsize::new(0));

    let workers: Vec<_> = (0..4)
        .map(|_| {
            let env = Arc::clone(&env);
            let path = path.clone();
            let inside = Arc::clone(&inside);
            let acquired = Arc::clone(&acquired);
            std::thread::spawn(move || {
                let mut h = env.open_lockable(&path).unwrap();
                let mut mine = 0;
                while mine < 100 {
                    match h.try_lock() {
                        Ok(()) => {
                            assert!(!inside.swap(true, Ordering::SeqCst), "two holders at once");
                            inside.store(false, Ordering::SeqCst);
                            h.unlock().unwrap();
                            mine += 1;
                            acquired.fetch_add(1, Ordering::SeqCst);
                        }
                        Err(e) => {
                            assert_eq!(e.kind(), ErrorKind::AlreadyLocked);
                            std::thread::yield_now();
                        }
                    }
                }
            })
        })
        .collect();
    for w in workers {
        w.join().unwrap();
    }
    assert_eq!(acquired.load(Ordering::SeqCst), 400);
    // Every handle released: a fresh one gets the lock at once.
    env.lock_file(&path).unwrap().unlock().unwrap();
}
