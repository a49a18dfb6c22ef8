//! Backend selection.
//! This module hides OS differences (POSIX/Windows) behind the [`Backend`] contract so
//! the rest of the crate stays platform-agnostic. Exactly one OS backend is compiled in
//! and exported as [`PlatformBackend`]; [`MemBackend`] is always available for tests.

use crate::errors::Result;
use crate::file::{DirEntry, LockableFile, RandomAccessFile, SequentialFile, WritableFile, WriteMode};
use std::borrow::Cow;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

mod common;
pub mod mem;
mod temp;

#[cfg(unix)]
mod unix;
#[cfg(windows)]
mod windows;

pub use common::{StdSequentialFile, StdWritableFile};
pub use mem::MemBackend;
pub(crate) use temp::tmp_sibling_name;

#[cfg(unix)]
pub use unix::{PosixBackend, PosixLockFile, PosixRandomAccessFile};
#[cfg(unix)]
pub type PlatformBackend = unix::PosixBackend;

#[cfg(windows)]
pub use windows::{WindowsBackend, WindowsLockFile, WindowsRandomAccessFile};
#[cfg(windows)]
pub type PlatformBackend = windows::WindowsBackend;

/// Capability set every backend supplies.
///
/// Paths reaching these methods were already passed through [`Backend::normalize_path`].
/// Implementations must be safe to call from many threads at once.
pub trait Backend: Send + Sync + 'static {
    type SequentialFile: SequentialFile;
    type RandomAccessFile: RandomAccessFile;
    type WritableFile: WritableFile;
    type LockableFile: LockableFile;

    fn name(&self) -> &'static str;

    /// Convert a forward-slash path into the form native syscalls expect.
    fn normalize_path<'a>(&self, path: &'a Path) -> Cow<'a, Path> {
        Cow::Borrowed(path)
    }

    fn open_sequential(&self, path: &Path) -> Result<Self::SequentialFile>;
    fn open_random(&self, path: &Path) -> Result<Self::RandomAccessFile>;
    fn open_writable(&self, path: &Path, mode: WriteMode) -> Result<Self::WritableFile>;
    /// Open (creating if needed) a lock file. The returned handle is not locked yet.
    fn open_lockable(&self, path: &Path) -> Result<Self::LockableFile>;

    fn delete_file(&self, path: &Path) -> Result<()>;
    /// Replace `dst` with `src` in one step; readers see old or new content, never a mix.
    fn rename_file(&self, src: &Path, dst: &Path) -> Result<()>;
    fn link_file(&self, src: &Path, dst: &Path) -> Result<()>;

    fn create_dir(&self, path: &Path) -> Result<()>;
    fn create_dir_if_missing(&self, path: &Path) -> Result<()>;
    fn delete_dir(&self, path: &Path) -> Result<()>;
    fn list_dir(&self, path: &Path) -> Result<Vec<DirEntry>>;
    fn sync_dir(&self, path: &Path) -> Result<()>;

    fn file_exists(&self, path: &Path) -> bool;
    fn file_size(&self, path: &Path) -> Result<u64>;
    fn modified_time(&self, path: &Path) -> Result<SystemTime>;
    fn free_space(&self, path: &Path) -> Result<u64>;
    fn absolute_path(&self, path: &Path) -> Result<PathBuf>;

    fn current_thread_id(&self) -> u64;

    /// Lower the OS scheduling priority of the calling thread. Best-effort.
    fn lower_thread_priority(&self) {}
}
