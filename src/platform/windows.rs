//! Windows backend.
//!
//! Notes:
//! - Forward slashes are rewritten to backslashes before any syscall.
//! - Positional reads use `seek_read`, which takes the offset per call, so concurrent
//!   readers on one handle do not race on a shared cursor.
//! - Locks use LockFileEx (through fs2); directory fsync is not supported via std and is a no-op.

use super::Backend;
use super::common::{self, LockRegistry, StdSequentialFile, StdWritableFile, fill_buf, lock_key};
use crate::errors::{EnvError, Result, io_err};
use crate::file::{DirEntry, LockableFile, RandomAccessFile, WriteMode};
use std::borrow::Cow;
use std::fs::{File, OpenOptions};
use std::io;
use std::os::windows::fs::FileExt;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::{debug, trace, warn};

#[derive(Debug, Default)]
pub struct WindowsBackend {
    locks: LockRegistry,
}

impl WindowsBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

pub struct WindowsRandomAccessFile {
    file: File,
    path: PathBuf,
}

impl RandomAccessFile for WindowsRandomAccessFile {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        fill_buf(&self.path, buf, |chunk, done| self.file.seek_read(chunk, offset + done as u64))
    }

    fn path(&self) -> &Path {
        &self.path
    }
}

pub struct WindowsLockFile {
    file: File,
    path: PathBuf,
    key: PathBuf,
    registry: LockRegistry,
    locked: bool,
}

impl LockableFile for WindowsLockFile {
    fn try_lock(&mut self) -> Result<()> {
        if self.locked || !self.registry.acquire(&self.key) {
            trace!(path = %self.path.display(), "try-lock held in-process");
            return Err(EnvError::already_locked(&self.path));
        }
        if let Err(e) = fs2::FileExt::try_lock_exclusive(&self.file) {
            self.registry.release(&self.key);
            if e.raw_os_error() == fs2::lock_contended_error().raw_os_error() {
                trace!(path = %self.path.display(), "try-lock held by another process");
                return Err(EnvError::already_locked(&self.path));
            }
            return Err(EnvError::from_io("lock", &self.path, e));
        }
        self.locked = true;
        debug!(path = %self.path.display(), "lock acquired");
        Ok(())
    }

    fn unlock(&mut self) -> Result<()> {
        if !self.locked {
            panic!("unlock of {} which this handle does not hold", self.path.display());
        }
        let released = fs2::FileExt::unlock(&self.file);
        self.locked = false;
        self.registry.release(&self.key);
        released.map_err(io_err("unlock", &self.path))?;
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

impl Drop for WindowsLockFile {
    fn drop(&mut self) {
        if self.locked {
            let _ = fs2::FileExt::unlock(&self.file);
            self.registry.release(&self.key);
        }
    }
}

impl Backend for WindowsBackend {
    type SequentialFile = StdSequentialFile;
    type RandomAccessFile = WindowsRandomAccessFile;
    type WritableFile = StdWritableFile;
    type LockableFile = WindowsLockFile;

    fn name(&self) -> &'static str {
        "windows"
    }

    fn normalize_path<'a>(&self, path: &'a Path) -> Cow<'a, Path> {
        match path.to_str() {
            Some(s) if s.contains('/') => Cow::Owned(PathBuf::from(s.replace('/', "\\"))),
            _ => Cow::Borrowed(path),
        }
    }

    fn open_sequential(&self, path: &Path) -> Result<StdSequentialFile> {
        StdSequentialFile::open(path)
    }

    fn open_random(&self, path: &Path) -> Result<WindowsRandomAccessFile> {
        let file = File::open(path).map_err(io_err("open for random read", path))?;
        Ok(WindowsRandomAccessFile { file, path: path.to_path_buf() })
    }

    fn open_writable(&self, path: &Path, mode: WriteMode) -> Result<StdWritableFile> {
        StdWritableFile::open(path, mode)
    }

    fn open_lockable(&self, path: &Path) -> Result<WindowsLockFile> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(io_err("open lock file", path))?;
        Ok(WindowsLockFile {
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
        // std maps this to MoveFileExW(MOVEFILE_REPLACE_EXISTING).
        std::fs::rename(src, dst).map_err(io_err("rename", src))
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
        if !path.is_dir() {
            return Err(EnvError::NotFound { path: path.to_path_buf() });
        }
        Ok(())
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
        use std::iter::once;
        use std::os::windows::ffi::OsStrExt;
        use windows_sys::Win32::Storage::FileSystem::GetDiskFreeSpaceExW;
        let wide: Vec<u16> = path.as_os_str().encode_wide().chain(once(0)).collect();
        let mut free_avail: u64 = 0;
        let mut total: u64 = 0;
        let mut total_free: u64 = 0;
        let ok = unsafe {
            GetDiskFreeSpaceExW(
                wide.as_ptr(),
                &mut free_avail as *mut u64,
                &mut total as *mut u64,
                &mut total_free as *mut u64,
            )
        };
        if ok == 0 {
            return Err(EnvError::from_io("free space", path, io::Error::last_os_error()));
        }
        Ok(free_avail)
    }

    fn absolute_path(&self, path: &Path) -> Result<PathBuf> {
        common::absolute_path(path)
    }

    fn current_thread_id(&self) -> u64 {
        u64::from(unsafe { windows_sys::Win32::System::Threading::GetCurrentThreadId() })
    }

    fn lower_thread_priority(&self) {
        use windows_sys::Win32::System::Threading::{
            GetCurrentThread, SetThreadPriority, THREAD_PRIORITY_BELOW_NORMAL,
        };
        let ok = unsafe { SetThreadPriority(GetCurrentThread(), THREAD_PRIORITY_BELOW_NORMAL) };
        if ok == 0 {
            warn!(error = %io::Error::last_os_error(), "SetThreadPriority failed for background thread");
        }
    }
}
