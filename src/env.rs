//! The environment facade.
//!
//! [`Env`] bundles one backend, one clock, the background scheduler and the optional
//! rate limiter. It is built once and shared by reference or `Arc`; there is no global
//! instance. Every path goes through the backend's normalisation before it reaches a
//! syscall.

use crate::clock::{self, SharedClock, SystemClock};
use crate::config::EnvConfig;
use crate::errors::{EnvError, Result};
use crate::file::{
    DirEntry, FileLock, LockableFile, ReadCapability, ReadHandle, SequentialFile, WritableFile,
    WriteMode,
};
use crate::platform::{Backend, PlatformBackend, tmp_sibling_name};
use crate::rate_limiter::{RateLimitedFile, RateLimiter};
use crate::scheduler::{Priority, Scheduler, SchedulerOptions, TaskFailureHook};
use anyhow::Context;
use std::borrow::Cow;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tracing::{debug, info, trace, warn};

pub struct Env<B: Backend = PlatformBackend> {
    // Declared first so workers are joined while the backend is still alive.
    scheduler: Scheduler,
    backend: Arc<B>,
    clock: SharedClock,
    rate_limiter: Option<Arc<RateLimiter>>,
}

impl<B: Backend> fmt::Debug for Env<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Env")
            .field("backend", &self.backend.name())
            .field("clock", &self.clock)
            .field("rate_limited", &self.rate_limiter.is_some())
            .finish()
    }
}

impl Env<PlatformBackend> {
    /// Environment for the platform this crate was built for.
    pub fn open(config: &EnvConfig) -> anyhow::Result<Self> {
        Self::with_backend(PlatformBackend::new(), SystemClock::shared(), config)
    }

    /// Platform environment with default settings.
    pub fn with_defaults() -> Self {
        Self::build(PlatformBackend::new(), SystemClock::shared(), &EnvConfig::default(), None)
    }

    /// Platform environment plus a temporary directory that lives as long as the returned guard.
    #[cfg(feature = "test-helpers")]
    pub fn scratch() -> anyhow::Result<(Self, tempfile::TempDir)> {
        let dir = tempfile::tempdir().context("create scratch directory")?;
        Ok((Self::with_defaults(), dir))
    }
}

impl<B: Backend> Env<B> {
    pub fn with_backend(backend: B, clock: SharedClock, config: &EnvConfig) -> anyhow::Result<Self> {
        config.validate().context("invalid environment config")?;
        Ok(Self::build(backend, clock, config, None))
    }

    /// Like [`Env::with_backend`], routing background task failures to `hook` as well as the log.
    pub fn with_failure_hook(
        backend: B,
        clock: SharedClock,
        config: &EnvConfig,
        hook: TaskFailureHook,
    ) -> anyhow::Result<Self> {
        config.validate().context("invalid environment config")?;
        Ok(Self::build(backend, clock, config, Some(hook)))
    }

    fn build(backend: B, clock: SharedClock, config: &EnvConfig, hook: Option<TaskFailureHook>) -> Self {
        let backend = Arc::new(backend);
        let for_low = Arc::clone(&backend);
        let scheduler = Scheduler::new(SchedulerOptions {
            low_threads: config.low_threads,
            high_threads: config.high_threads,
            user_threads: config.user_threads,
            lower_low_priority: config.lower_low_priority,
            on_failure: hook,
            on_low_thread_start: Some(Arc::new(move || for_low.lower_thread_priority())),
        });
        let rate_limiter = config
            .rate_limit
            .as_ref()
            .map(|rl| Arc::new(RateLimiter::new(rl, Arc::clone(&clock))));
        info!(
            backend = backend.name(),
            low = config.low_threads,
            high = config.high_threads,
            user = config.user_threads,
            rate_limited = rate_limiter.is_some(),
            "environment ready"
        );
        Self { scheduler, backend, clock, rate_limiter }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn clock(&self) -> &SharedClock {
        &self.clock
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn rate_limiter(&self) -> Option<&Arc<RateLimiter>> {
        self.rate_limiter.as_ref()
    }

    fn native<'a>(&self, path: &'a Path) -> Cow<'a, Path> {
        self.backend.normalize_path(path)
    }

    // ---- file handles ----

    pub fn open_for_read(
        &self,
        path: &Path,
        capability: ReadCapability,
    ) -> Result<ReadHandle<B::SequentialFile, B::RandomAccessFile>> {
        Ok(match capability {
            ReadCapability::Sequential => ReadHandle::Sequential(self.open_sequential(path)?),
            ReadCapability::Random => ReadHandle::Random(self.open_random(path)?),
        })
    }

    pub fn open_sequential(&self, path: &Path) -> Result<B::SequentialFile> {
        let p = self.native(path);
        trace!(path = %p.display(), "open sequential");
        self.backend.open_sequential(&p)
    }

    pub fn open_random(&self, path: &Path) -> Result<B::RandomAccessFile> {
        let p = self.native(path);
        trace!(path = %p.display(), "open random");
        self.backend.open_random(&p)
    }

    pub fn open_for_write(&self, path: &Path, mode: WriteMode) -> Result<B::WritableFile> {
        let p = self.native(path);
        trace!(path = %p.display(), ?mode, "open for write");
        self.backend.open_writable(&p, mode)
    }

    /// Writable handle whose appends go through the shared rate limiter, if one is configured.
    pub fn open_for_write_rate_limited(
        &self,
        path: &Path,
        mode: WriteMode,
    ) -> Result<RateLimitedFile<B::WritableFile>> {
        let inner = self.open_for_write(path, mode)?;
        Ok(match &self.rate_limiter {
            Some(rl) => RateLimitedFile::new(inner, Arc::clone(rl)),
            None => RateLimitedFile::unlimited(inner),
        })
    }

    pub fn open_lockable(&self, path: &Path) -> Result<B::LockableFile> {
        let p = self.native(path);
        self.backend.open_lockable(&p)
    }

    /// Open and lock `path` in one step. Fails with `AlreadyLocked` if any handle holds it.
    pub fn lock_file(&self, path: &Path) -> Result<FileLock<B::LockableFile>> {
        let mut f = self.open_lockable(path)?;
        f.try_lock()?;
        Ok(FileLock::new(f))
    }

    // ---- files and directories ----

    pub fn delete_file(&self, path: &Path) -> Result<()> {
        let p = self.native(path);
        debug!(path = %p.display(), "delete file");
        self.backend.delete_file(&p)
    }

    /// Atomically replace `dst` with `src`.
    pub fn rename_file(&self, src: &Path, dst: &Path) -> Result<()> {
        let (s, d) = (self.native(src), self.native(dst));
        debug!(src = %s.display(), dst = %d.display(), "rename");
        self.backend.rename_file(&s, &d)
    }

    pub fn link_file(&self, src: &Path, dst: &Path) -> Result<()> {
        let (s, d) = (self.native(src), self.native(dst));
        self.backend.link_file(&s, &d)
    }

    pub fn create_dir(&self, path: &Path) -> Result<()> {
        self.backend.create_dir(&self.native(path))
    }

    pub fn create_dir_if_missing(&self, path: &Path) -> Result<()> {
        self.backend.create_dir_if_missing(&self.native(path))
    }

    pub fn delete_dir(&self, path: &Path) -> Result<()> {
        self.backend.delete_dir(&self.native(path))
    }

    pub fn list_dir(&self, path: &Path) -> Result<Vec<DirEntry>> {
        self.backend.list_dir(&self.native(path))
    }

    /// Never fails; anything that cannot be confirmed counts as absent.
    pub fn file_exists(&self, path: &Path) -> bool {
        self.backend.file_exists(&self.native(path))
    }

    pub fn file_size(&self, path: &Path) -> Result<u64> {
        self.backend.file_size(&self.native(path))
    }

    pub fn modified_time(&self, path: &Path) -> Result<SystemTime> {
        self.backend.modified_time(&self.native(path))
    }

    pub fn free_space(&self, path: &Path) -> Result<u64> {
        self.backend.free_space(&self.native(path))
    }

    pub fn absolute_path(&self, path: &Path) -> Result<PathBuf> {
        self.backend.absolute_path(&self.native(path))
    }

    pub fn sync_dir(&self, path: &Path) -> Result<()> {
        self.backend.sync_dir(&self.native(path))
    }

    /// Replace `path` with `data` so that a crash leaves either the old file or the new one.
    ///
    /// Writes a temp sibling, syncs it, renames it over `path` and syncs the parent
    /// directory. The temp file is removed if any step before the rename fails.
    pub fn write_file_atomic(&self, path: &Path, data: &[u8]) -> Result<()> {
        let target = self.native(path);
        let tmp = tmp_sibling_name(&target);
        let staged = (|| -> Result<()> {
            let mut f = self.backend.open_writable(&tmp, WriteMode::CreateNew)?;
            f.append(data)?;
            f.sync()?;
            f.close()
        })();
        let renamed = staged.and_then(|()| self.backend.rename_file(&tmp, &target));
        if let Err(e) = renamed {
            if self.backend.file_exists(&tmp) {
                if let Err(cleanup) = self.backend.delete_file(&tmp) {
                    warn!(tmp = %tmp.display(), error = %cleanup, "failed to remove temp file");
                }
            }
            return Err(e);
        }
        let parent = match target.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };
        self.backend.sync_dir(parent)?;
        debug!(path = %target.display(), bytes = data.len(), "atomic write complete");
        Ok(())
    }

    /// Read a whole file. The size comes from the open handle, so a concurrent atomic
    /// replace yields either the old or the new contents in full. Fails with
    /// `Corruption` if the opened file shrinks while being read.
    pub fn read_file(&self, path: &Path) -> Result<Vec<u8>> {
        let p = self.native(path);
        let mut f = self.backend.open_sequential(&p)?;
        let expected = f.len()?;
        let len = usize::try_from(expected)
            .map_err(|_| EnvError::corruption(&p, format!("size {expected} does not fit in memory")))?;
        let mut buf = vec![0u8; len];
        let got = f.read(&mut buf)?;
        if got < len {
            return Err(EnvError::corruption(
                &p,
                format!("expected {expected} bytes, read {got}"),
            ));
        }
        Ok(buf)
    }

    // ---- time and threads ----

    pub fn now_nanos(&self) -> u64 {
        self.clock.now_nanos()
    }

    pub fn now_micros(&self) -> u64 {
        self.clock.now_micros()
    }

    pub fn wall_clock_secs(&self) -> u64 {
        self.clock.wall_clock_secs()
    }

    pub fn time_to_string(&self, secs: u64) -> String {
        clock::time_to_string(secs)
    }

    pub fn sleep(&self, duration: Duration) {
        self.clock.sleep(duration);
    }

    pub fn thread_id(&self) -> u64 {
        self.backend.current_thread_id()
    }

    /// Queue `task` on `priority` and return immediately. Errors and panics inside the
    /// task are logged and discarded.
    pub fn schedule<F>(&self, priority: Priority, task: F)
    where
        F: FnOnce() -> anyhow::Result<()> + Send + 'static,
    {
        self.scheduler.schedule(priority, task);
    }

    pub fn inc_background_threads_if_needed(&self, priority: Priority, n: usize) {
        self.scheduler.inc_background_threads_if_needed(priority, n);
    }

    pub fn background_threads(&self, priority: Priority) -> usize {
        self.scheduler.background_threads(priority)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::errors::ErrorKind;
    use crate::file::RandomAccessFile;
    use crate::platform::MemBackend;
    use crate::rate_limiter::RateLimiterConfig;
    use std::sync::Mutex;
    use std::sync::mpsc;

    fn mem_env() -> Env<MemBackend> {
        Env::with_backend(MemBackend::new(), ManualClock::shared(), &EnvConfig::default()).unwrap()
    }

    #[test]
    fn write_then_read_both_capabilities() {
        let env = mem_env();
        env.create_dir(Path::new("/db")).unwrap();
        let mut w = env.open_for_write(Path::new("/db/000001.log"), WriteMode::Truncate).unwrap();
        w.append(b"hello world").unwrap();
        w.close().unwrap();

        let mut s = env
            .open_for_read(Path::new("/db/000001.log"), ReadCapability::Sequential)
            .unwrap()
            .into_sequential()
            .unwrap();
        let mut buf = [0u8; 5];
        assert_eq!(s.read(&mut buf).unwrap(), 5);
        s.skip(1).unwrap();
        assert_eq!(s.read(&mut buf).unwrap(), 5);
        assert_eq!(&buf, b"world");
        assert_eq!(s.read(&mut buf).unwrap(), 0);

        let r = env
            .open_for_read(Path::new("/db/000001.log"), ReadCapability::Random)
            .unwrap()
            .into_random()
            .unwrap();
        let mut tail = [0u8; 16];
        assert_eq!(r.read_at(6, &mut tail).unwrap(), 5);
    }

    #[test]
    fn missing_file_is_not_found() {
        let env = mem_env();
        let err = env.open_sequential(Path::new("/nope")).err().unwrap();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert!(!env.file_exists(Path::new("/nope")));
    }

    #[test]
    fn atomic_write_replaces_and_leaves_no_temp() {
        let env = mem_env();
        env.create_dir(Path::new("/db")).unwrap();
        env.write_file_atomic(Path::new("/db/CURRENT"), b"MANIFEST-000001\n").unwrap();
        env.write_file_atomic(Path::new("/db/CURRENT"), b"MANIFEST-000002\n").unwrap();
        assert_eq!(env.read_file(Path::new("/db/CURRENT")).unwrap(), b"MANIFEST-000002\n");
        let names: Vec<_> = env.list_dir(Path::new("/db")).unwrap().into_iter().map(|e| e.name).collect();
        assert_eq!(names, vec!["CURRENT".to_string()]);
    }

    #[test]
    fn atomic_write_survives_crash() {
        let env = mem_env();
        env.create_dir(Path::new("/db")).unwrap();
        env.write_file_atomic(Path::new("/db/CURRENT"), b"v1").unwrap();
        env.backend().simulate_crash();
        assert_eq!(env.read_file(Path::new("/db/CURRENT")).unwrap(), b"v1");
    }

    #[test]
    fn atomic_write_into_missing_dir_cleans_up() {
        let env = mem_env();
        let err = env.write_file_atomic(Path::new("/missing/CURRENT"), b"x").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn lock_file_guard_releases_on_drop() {
        let env = mem_env();
        let guard = env.lock_file(Path::new("/LOCK")).unwrap();
        assert_eq!(env.lock_file(Path::new("/LOCK")).err().unwrap().kind(), ErrorKind::AlreadyLocked);
        drop(guard);
        env.lock_file(Path::new("/LOCK")).unwrap().unlock().unwrap();
    }

    #[test]
    fn schedule_runs_on_worker_thread() {
        let env = mem_env();
        let here = env.thread_id();
        let backend_ids = Arc::new(Mutex::new(Vec::new()));
        let (tx, rx) = mpsc::channel();
        let ids = Arc::clone(&backend_ids);
        let env = Arc::new(env);
        let env2 = Arc::clone(&env);
        env.schedule(Priority::High, move || {
            ids.lock().unwrap().push(env2.thread_id());
            tx.send(()).unwrap();
            Ok(())
        });
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_ne!(backend_ids.lock().unwrap()[0], here);
    }

    #[test]
    fn rate_limited_writer_uses_configured_limiter() {
        let clock = ManualClock::shared();
        let cfg = EnvConfig::default().with_rate_limit(RateLimiterConfig::new(10_000));
        let env = Env::with_backend(MemBackend::new(), clock.clone(), &cfg).unwrap();
        let mut w = env.open_for_write_rate_limited(Path::new("/sst"), WriteMode::Truncate).unwrap();
        w.append(&[1u8; 1_500]).unwrap();
        w.close().unwrap();
        assert_eq!(env.file_size(Path::new("/sst")).unwrap(), 1_500);
        assert_eq!(env.rate_limiter().unwrap().total_bytes_through(), 1_500);
        assert!(clock.elapsed() >= Duration::from_millis(100));
    }

    #[test]
    fn invalid_config_rejected() {
        let cfg = EnvConfig::default().with_threads(Priority::Low, 0);
        assert!(Env::with_backend(MemBackend::new(), ManualClock::shared(), &cfg).is_err());
    }

    #[test]
    fn clock_passthrough() {
        let clock = ManualClock::shared();
        let env = Env::with_backend(MemBackend::new(), clock.clone(), &EnvConfig::default()).unwrap();
        env.sleep(Duration::from_micros(1500));
        assert_eq!(env.now_micros(), 1500);
        assert_eq!(env.now_nanos(), 1_500_000);
        assert!(!env.time_to_string(env.wall_clock_secs()).is_empty());
    }
}
