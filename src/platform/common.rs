//! std::fs-backed pieces shared by the POSIX and Windows backends.
//!
//! Handle types here own a `std::fs::File`; directory helpers are thin wrappers that
//! classify io errors. OS-specific behaviour (positional reads, locking, free space)
//! lives in the per-platform modules.

use crate::errors::{EnvError, Result, io_err};
use crate::file::{DirEntry, EntryType, SequentialFile, WritableFile, WriteMode};
use std::collections::HashSet;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::SystemTime;
use tracing::{trace, warn};

const WRITE_BUFFER: usize = 64 * 1024;

/// Paths locked by this process.
///
/// OS advisory locks do not conflict between handles of one process on every
/// platform, so conflicts inside the process are decided here first.
#[derive(Debug, Clone, Default)]
pub(crate) struct LockRegistry(Arc<Mutex<HashSet<PathBuf>>>);

impl LockRegistry {
    /// Returns false if `key` is already held.
    pub(crate) fn acquire(&self, key: &Path) -> bool {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).insert(key.to_path_buf())
    }

    pub(crate) fn release(&self, key: &Path) {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).remove(key);
    }
}

/// Registry key for a lock file: canonical path when resolvable.
pub(crate) fn lock_key(path: &Path) -> PathBuf {
    dunce::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
}

/// Repeat `read_once` until `buf` is full or it reports end of file.
pub(crate) fn fill_buf<F>(path: &Path, buf: &mut [u8], mut read_once: F) -> Result<usize>
where
    F: FnMut(&mut [u8], usize) -> io::Result<usize>,
{
    let mut total = 0;
    while total < buf.len() {
        match read_once(&mut buf[total..], total) {
            Ok(0) => break,
            Ok(n) => total += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(EnvError::from_io("read", path, e)),
        }
    }
    Ok(total)
}

pub struct StdSequentialFile {
    file: File,
    path: PathBuf,
}

impl StdSequentialFile {
    pub(crate) fn open(path: &Path) -> Result<Self> {
        let file = File::open(path).map_err(io_err("open for sequential read", path))?;
        trace!(path = %path.display(), "opened sequential file");
        Ok(Self { file, path: path.to_path_buf() })
    }
}

impl SequentialFile for StdSequentialFile {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let file = &mut self.file;
        fill_buf(&self.path, buf, |chunk, _| file.read(chunk))
    }

    fn skip(&mut self, n: u64) -> Result<()> {
        let delta = i64::try_from(n).unwrap_or(i64::MAX);
        self.file
            .seek(SeekFrom::Current(delta))
            .map(|_| ())
            .map_err(io_err("skip", &self.path))
    }

    fn len(&self) -> Result<u64> {
        self.file
            .metadata()
            .map(|m| m.len())
            .map_err(io_err("stat open file", &self.path))
    }

    fn path(&self) -> &Path {
        &self.path
    }
}

pub struct StdWritableFile {
    writer: Option<BufWriter<File>>,
    path: PathBuf,
    len: u64,
    append_mode: bool,
    preallocated: bool,
}

impl StdWritableFile {
    pub(crate) fn open(path: &Path, mode: WriteMode) -> Result<Self> {
        let mut opts = OpenOptions::new();
        match mode {
            WriteMode::Truncate => opts.write(true).create(true).truncate(true),
            WriteMode::Append => opts.append(true).create(true),
            WriteMode::CreateNew => opts.write(true).create_new(true),
        };
        let file = opts.open(path).map_err(io_err("open for write", path))?;
        let len = file.metadata().map_err(io_err("stat", path))?.len();
        trace!(path = %path.display(), ?mode, len, "opened writable file");
        Ok(Self {
            writer: Some(BufWriter::with_capacity(WRITE_BUFFER, file)),
            path: path.to_path_buf(),
            len,
            append_mode: mode == WriteMode::Append,
            preallocated: false,
        })
    }

    fn writer(&mut self) -> &mut BufWriter<File> {
        match self.writer.as_mut() {
            Some(w) => w,
            None => panic!("use of closed file handle {}", self.path.display()),
        }
    }

    fn finish(&mut self) -> Result<()> {
        let len = self.len;
        let preallocated = self.preallocated;
        let w = self.writer();
        w.flush().map_err(io_err("flush", &self.path))?;
        if preallocated {
            // Drop preallocated tail so the on-disk size matches what was written.
            self.writer()
                .get_ref()
                .set_len(len)
                .map_err(io_err("truncate preallocation", &self.path))?;
        }
        self.writer = None;
        Ok(())
    }
}

impl WritableFile for StdWritableFile {
    fn append(&mut self, data: &[u8]) -> Result<()> {
        self.writer().write_all(data).map_err(io_err("append", &self.path))?;
        self.len += data.len() as u64;
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.writer().flush().map_err(io_err("flush", &self.path))
    }

    fn sync(&mut self) -> Result<()> {
        self.flush()?;
        self.writer().get_ref().sync_data().map_err(io_err("sync", &self.path))
    }

    fn fsync(&mut self) -> Result<()> {
        self.flush()?;
        self.writer().get_ref().sync_all().map_err(io_err("fsync", &self.path))
    }

    fn truncate(&mut self, size: u64) -> Result<()> {
        self.flush()?;
        let w = self.writer();
        w.get_ref().set_len(size).map_err(io_err("truncate", &self.path))?;
        self.writer()
            .get_mut()
            .seek(SeekFrom::Start(size))
            .map_err(io_err("seek after truncate", &self.path))?;
        self.len = size;
        Ok(())
    }

    fn allocate(&mut self, len: u64) -> Result<()> {
        if self.append_mode {
            // O_APPEND writes would land after the reserved tail.
            trace!(path = %self.path.display(), "skip preallocation for append-mode file");
            return Ok(());
        }
        let want = self.len.saturating_add(len);
        fs2::FileExt::allocate(self.writer().get_ref(), want).map_err(io_err("allocate", &self.path))?;
        self.preallocated = true;
        Ok(())
    }

    fn len(&self) -> u64 {
        self.len
    }

    fn close(&mut self) -> Result<()> {
        if self.writer.is_none() {
            panic!("file handle {} closed twice", self.path.display());
        }
        self.finish()
    }

    fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for StdWritableFile {
    fn drop(&mut self) {
        if self.writer.is_some() {
            if let Err(e) = self.finish() {
                warn!(path = %self.path.display(), error = %e, "close on drop failed");
            }
        }
    }
}

pub(crate) fn delete_file(path: &Path) -> Result<()> {
    fs::remove_file(path).map_err(io_err("delete file", path))
}

pub(crate) fn link_file(src: &Path, dst: &Path) -> Result<()> {
    fs::hard_link(src, dst).map_err(io_err("link", dst))
}

pub(crate) fn create_dir(path: &Path) -> Result<()> {
    fs::create_dir(path).map_err(io_err("create dir", path))
}

pub(crate) fn create_dir_if_missing(path: &Path) -> Result<()> {
    match fs::create_dir_all(path) {
        Ok(()) => Ok(()),
        Err(e) if path.is_dir() => {
            trace!(path = %path.display(), error = %e, "directory appeared concurrently");
            Ok(())
        }
        Err(e) => Err(EnvError::from_io("create dir", path, e)),
    }
}

pub(crate) fn delete_dir(path: &Path) -> Result<()> {
    fs::remove_dir(path).map_err(io_err("delete dir", path))
}

pub(crate) fn list_dir(path: &Path) -> Result<Vec<DirEntry>> {
    let rd = fs::read_dir(path).map_err(io_err("list dir", path))?;
    let mut out = Vec::new();
    for entry in rd {
        let entry = entry.map_err(io_err("list dir", path))?;
        let meta = match entry.metadata() {
            Ok(m) => m,
            // Removed between readdir and stat; the snapshot simply omits it.
            Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
            Err(e) => return Err(EnvError::from_io("stat", &entry.path(), e)),
        };
        let entry_type = if meta.is_dir() { EntryType::Directory } else { EntryType::File };
        out.push(DirEntry {
            name: entry.file_name().to_string_lossy().into_owned(),
            entry_type,
            size: if meta.is_dir() { 0 } else { meta.len() },
        });
    }
    out.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(out)
}

pub(crate) fn file_exists(path: &Path) -> bool {
    path.try_exists().unwrap_or(false)
}

pub(crate) fn file_size(path: &Path) -> Result<u64> {
    fs::metadata(path).map(|m| m.len()).map_err(io_err("stat", path))
}

pub(crate) fn modified_time(path: &Path) -> Result<SystemTime> {
    fs::metadata(path)
        .and_then(|m| m.modified())
        .map_err(io_err("stat", path))
}

pub(crate) fn absolute_path(path: &Path) -> Result<PathBuf> {
    if path.is_absolute() {
        return Ok(dunce::simplified(path).to_path_buf());
    }
    let cwd = std::env::current_dir().map_err(io_err("current dir", path))?;
    Ok(dunce::simplified(&cwd.join(path)).to_path_buf())
}
