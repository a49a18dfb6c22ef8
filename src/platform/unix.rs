//! POSIX backend.
//! Positional reads via pread, advisory locks via flock, free space via statvfs,
//! and directory fsync after renames so the new name survives a crash.

use super::Backend;
use super::common::{self, LockRegistry, StdSequentialFile, StdWritableFile, fill_buf, lock_key};
use crate::errors::{EnvError, Result, io_err};
use crate::file::{DirEntry, LockableFile, RandomAccessFile, WriteMode};
use std::fs::{File, OpenOptions};
use std::io;
use std::os::fd::AsRawFd;
use std::os::unix::fs::{FileExt, OpenOptionsExt};
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::{debug, trace, warn};

#[derive(Debug, Default)]
pub struct PosixBackend {
    locks: LockRegistry,
}

impl PosixBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

pub struct PosixRandomAccessFile {
    file: File,
    path: PathBuf,
}

impl RandomAccessFile for PosixRandomAccessFile {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        fill_buf(&self.path, buf, |chunk, done| self.file.read_at(chunk, offset + done as u64))
    }

    fn path(&self) -> &Path {
        &self.path
    }
}

pub struct PosixLockFile {
    file: File,
    path: PathBuf,
    key: PathBuf,
    registry: LockRegistry,
    locked: bool,
}

impl LockableFile for PosixLockFile {
    fn try_lock(&mut self) -> Result<()> {
        if self.locked || !self.registry.acquire(&self.key) {
            trace!(path = %self.path.display(), "try-lock held in-process");
            return Err(EnvError::already_locked(&self.path));
        }
        let rc = unsafe { libc::flock(self.file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
        if rc != 0 {
            self.registry.release(&self.key);
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EWOULDBLOCK) {
                trace!(path = %self.path.display(), "try-lock held by another process");
                return Err(EnvError::already_locked(&self.path));
            }
            return Err(EnvError::from_io("lock", &self.path, err));
        }
        self.locked = true;
        debug!(path = %self.path.display(), "lock acquired");
        Ok(())
    }

    fn unlock(&mut self) -> Result<()> {
        if !self.locked {
            panic!("unlock of {} which this handle does not hold", self.path.display());
        }
        // The OS lock goes first: a registry slot must never be free while flock is held.
        let rc = unsafe { libc::flock(self.file.as_raw_fd(), libc::LOCK_UN) };
        self.locked = false;
        self.registry.release(&self.key);
        if rc != 0 {
            return Err(EnvError::from_io("unlock", &self.path, io::Error::last_os_error()));
        }
        debug!(path = %self.path.display(), "lock released");
        Ok(())
    }

    fn is_locked(&self) -> bool {
        self.locked
    }

    fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for PosixLockFile {
    fn drop(&mut self) {
        if self.locked {
            // Closing the fd releases flock as well; this just keeps the registry honest.
            let _ = unsafe { libc::flock(self.file.as_raw_fd(), libc::LOCK_UN) };
            self.registry.release(&self.key);
        }
    }
}

fn fsync_dir(dir: &Path) -> io::Result<()> {
    File::open(dir)?.sync_all()
}

fn parent_or_dot(path: &Path) -> &Path {
    match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    }
}

impl Backend for PosixBackend {
    type SequentialFile = StdSequentialFile;
    type RandomAccessFile = PosixRandomAccessFile;
    type WritableFile = StdWritableFile;
    type LockableFile = PosixLockFile;

    fn name(&self) -> &'static str {
        "posix"
    }

    fn open_sequential(&self, path: &Path) -> Result<StdSequentialFile> {
        StdSequentialFile::open(path)
    }

    fn open_random(&self, path: &Path) -> Result<PosixRandomAccessFile> {
        let file = File::open(path).map_err(io_err("open for random read", path))?;
        Ok(PosixRandomAccessFile { file, path: path.to_path_buf() })
    }

    fn open_writable(&self, path: &Path, mode: WriteMode) -> Result<StdWritableFile> {
        StdWritableFile::open(path, mode)
    }

    fn open_lockable(&self, path: &Path) -> Result<PosixLockFile> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .custom_flags(libc::O_CLOEXEC)
            .mode(0o644)
            .open(path)
            .map_err(io_err("open lock file", path))?;
        Ok(PosixLockFile {
            file,
            path: path.to_path_buf(),
            key: lock_key(path),
            registry: self.locks.clone(),
            locked: false,
        })
    }

    fn delete_file(&self, path: &Path) -> Result<()> {
        common::delete_file(path)
    }

    fn rename_file(&self, src: &Path, dst: &Path) -> Result<()> {
        // rename(2) replaces dst atomically.
        std::fs::rename(src, dst).map_err(io_err("rename", src))?;
        if let Err(e) = fsync_dir(parent_or_dot(dst)) {
            // The rename itself succeeded; do not turn it into a failure.
            warn!(dst = %dst.display(), error = %e, "fsync of parent after rename failed");
        }
        Ok(())
    }

    fn link_file(&self, src: &Path, dst: &Path) -> Result<()> {
        common::link_file(src, dst)
    }

    fn create_dir(&self, path: &Path) -> Result<()> {
        common::create_dir(path)
    }

    fn create_dir_if_missing(&self, path: &Path) -> Result<()> {
        common::create_dir_if_missing(path)
    }

    fn delete_dir(&self, path: &Path) -> Result<()> {
        common::delete_dir(path)
    }

    fn list_dir(&self, path: &Path) -> Result<Vec<DirEntry>> {
        common::list_dir(path)
    }

    fn sync_dir(&self, path: &Path) -> Result<()> {
        fsync_dir(path).map_err(io_err("fsync dir", path))
    }

    fn file_exists(&self, path: &Path) -> bool {
        common::file_exists(path)
    }

    fn file_size(&self, path: &Path) -> Result<u64> {
        common::file_size(path)
    }

    fn modified_time(&self, path: &Path) -> Result<SystemTime> {
        common::modified_time(path)
    }

    fn free_space(&self, path: &Path) -> Result<u64> {
        use std::ffi::CString;
        use std::mem::MaybeUninit;
        use std::os::unix::ffi::OsStrExt;
        let c_path = CString::new(path.as_os_str().as_bytes()).map_err(|_| {
            EnvError::from_io(
                "statvfs",
                path,
                io::Error::new(io::ErrorKind::InvalidInput, "path contains null byte"),
            )
        })?;
        unsafe {
            let mut stat: MaybeUninit<libc::statvfs> = MaybeUninit::uninit();
            if libc::statvfs(c_path.as_ptr(), stat.as_mut_ptr()) != 0 {
                return Err(EnvError::from_io("statvfs", path, io::Error::last_os_error()));
            }
            let stat = stat.assume_init();
            Ok((stat.f_bavail as u64).saturating_mul(stat.f_frsize as u64))
        }
    }

    fn absolute_path(&self, path: &Path) -> Result<PathBuf> {
        common::absolute_path(path)
    }

    fn current_thread_id(&self) -> u64 {
        unsafe { libc::pthread_self() as usize as u64 }
    }

    fn lower_thread_priority(&self) {
        #[cfg(target_os = "linux")]
        {
            let tid = unsafe { libc::syscall(libc::SYS_gettid) } as libc::id_t;
            let rc = unsafe { libc::setpriority(libc::PRIO_PROCESS, tid, 19) };
            if rc != 0 {
                warn!(error = %io::Error::last_os_error(), "setpriority failed for background thread");
            } else {
                debug!(tid, "lowered background thread priority");
            }
        }
    }
}
