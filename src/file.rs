//! File handle capability sets.
//!
//! A backend supplies one concrete type per capability; the facade hands those
//! types out directly so hot I/O paths are statically dispatched.
//!
//! Ownership rules:
//! - a handle is owned by whoever opened it and released on drop;
//! - `WritableFile::close` may be called once to observe close errors;
//! - only `RandomAccessFile::read_at` may be called concurrently on one handle.

use crate::errors::{EnvError, Result};
use std::path::{Path, PathBuf};

/// How `open_for_write` treats an existing file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    /// Create or truncate to zero length.
    Truncate,
    /// Create if missing, otherwise continue at the end.
    Append,
    /// Fail with `AlreadyExists` if the path exists.
    CreateNew,
}

/// Read capability requested through `Env::open_for_read`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadCapability {
    Sequential,
    Random,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryType {
    File,
    Directory,
}

/// Snapshot of one directory entry taken when the listing was produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub entry_type: EntryType,
    pub size: u64,
}

impl DirEntry {
    pub fn is_dir(&self) -> bool {
        self.entry_type == EntryType::Directory
    }
}

pub trait SequentialFile: Send {
    /// Fill `buf` as far as the file allows. Returns 0 only at end of stream.
    fn read(&mut self, buf: &mut [u8]) -> Result<usize>;

    /// Advance the read position by `n` bytes. Skipping past the end is not an error.
    fn skip(&mut self, n: u64) -> Result<()>;

    /// Size of the file this handle has open, which may differ from whatever the path
    /// names now if it was replaced after opening.
    fn len(&self) -> Result<u64>;

    fn path(&self) -> &Path;
}

pub trait RandomAccessFile: Send + Sync {
    /// Positional read; a short count means end of file was reached.
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize>;

    fn path(&self) -> &Path;

    /// Like `read_at` but a short read is reported as corruption (truncated file).
    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let n = self.read_at(offset, buf)?;
        if n < buf.len() {
            return Err(EnvError::corruption(
                self.path(),
                format!("truncated read at offset {offset}: wanted {} bytes, got {n}", buf.len()),
            ));
        }
        Ok(())
    }
}

pub trait WritableFile: Send {
    fn append(&mut self, data: &[u8]) -> Result<()>;

    /// Push buffered bytes to the OS. No durability guarantee.
    fn flush(&mut self) -> Result<()>;

    /// Make appended data durable (fdatasync semantics).
    fn sync(&mut self) -> Result<()>;

    /// Make data and metadata durable (fsync semantics).
    fn fsync(&mut self) -> Result<()> {
        self.sync()
    }

    fn truncate(&mut self, size: u64) -> Result<()>;

    /// Reserve `len` bytes on disk ahead of writes. Backends without support ignore it.
    fn allocate(&mut self, _len: u64) -> Result<()> {
        Ok(())
    }

    /// Logical size: bytes appended so far, adjusted by truncation.
    fn len(&self) -> u64;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Flush and release the OS handle. Panics if called twice.
    fn close(&mut self) -> Result<()>;

    fn path(&self) -> &Path;
}

/// Advisory, process-exclusive lock on a path.
pub trait LockableFile: Send {
    /// Take the lock without blocking; `AlreadyLocked` if any other handle holds it.
    fn try_lock(&mut self) -> Result<()>;

    /// Release the lock. Panics if this handle does not hold it.
    fn unlock(&mut self) -> Result<()>;

    fn is_locked(&self) -> bool;

    fn path(&self) -> &Path;
}

/// Handle returned by `Env::open_for_read`.
pub enum ReadHandle<S, R> {
    Sequential(S),
    Random(R),
}

impl<S: SequentialFile, R: RandomAccessFile> ReadHandle<S, R> {
    pub fn path(&self) -> PathBuf {
        match self {
            ReadHandle::Sequential(s) => s.path().to_path_buf(),
            ReadHandle::Random(r) => r.path().to_path_buf(),
        }
    }

    pub fn into_sequential(self) -> Option<S> {
        match self {
            ReadHandle::Sequential(s) => Some(s),
            ReadHandle::Random(_) => None,
        }
    }

    pub fn into_random(self) -> Option<R> {
        match self {
            ReadHandle::Random(r) => Some(r),
            ReadHandle::Sequential(_) => None,
        }
    }
}

/// Lock guard returned by `Env::lock_file`; releases on drop.
pub struct FileLock<L: LockableFile> {
    inner: L,
}

impl<L: LockableFile> FileLock<L> {
    pub(crate) fn new(inner: L) -> Self {
        Self { inner }
    }

    pub fn path(&self) -> &Path {
        self.inner.path()
    }

    /// Release explicitly to observe unlock errors.
    pub fn unlock(mut self) -> Result<()> {
        self.inner.unlock()
    }
}

impl<L: LockableFile> Drop for FileLock<L> {
    fn drop(&mut self) {
        if self.inner.is_locked() {
            if let Err(e) = self.inner.unlock() {
                tracing::warn!(path = %self.inner.path().display(), error = %e, "unlock on drop failed");
            }
        }
    }
}
