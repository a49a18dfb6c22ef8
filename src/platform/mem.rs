//! In-memory backend for tests.
//!
//! Files are shared byte buffers, so a rename swaps whole buffers under one mutex and
//! readers holding an old handle keep seeing the old content in full. Each file tracks
//! how many bytes were synced; [`MemBackend::simulate_crash`] discards everything else.

use super::Backend;
use super::common::LockRegistry;
use crate::errors::{EnvError, Result};
use crate::file::{DirEntry, EntryType, LockableFile, RandomAccessFile, SequentialFile, WritableFile, WriteMode};
use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeMap, BTreeSet};
use std::hash::{Hash, Hasher};
use std::io;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::SystemTime;
use tracing::debug;

#[derive(Debug)]
struct FileData {
    data: Vec<u8>,
    synced_len: usize,
    modified: SystemTime,
}

impl FileData {
    fn new() -> Self {
        Self {
            data: Vec::new(),
            synced_len: 0,
            modified: SystemTime::now(),
        }
    }
}

type FileRef = Arc<RwLock<FileData>>;

fn read_data(f: &FileRef) -> RwLockReadGuard<'_, FileData> {
    f.read().unwrap_or_else(PoisonError::into_inner)
}

fn write_data(f: &FileRef) -> RwLockWriteGuard<'_, FileData> {
    f.write().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Default)]
struct Tree {
    files: BTreeMap<PathBuf, FileRef>,
    dirs: BTreeSet<PathBuf>,
}

impl Tree {
    fn is_dir(&self, path: &Path) -> bool {
        is_root(path) || self.dirs.contains(path)
    }

    fn parent_exists(&self, path: &Path) -> bool {
        match path.parent() {
            None => true,
            Some(p) => self.is_dir(p),
        }
    }

    fn has_children(&self, dir: &Path) -> bool {
        self.files.keys().any(|p| p.parent() == Some(dir)) || self.dirs.iter().any(|p| p.parent() == Some(dir))
    }
}

fn is_root(path: &Path) -> bool {
    path.as_os_str().is_empty() || path.components().all(|c| matches!(c, Component::RootDir | Component::Prefix(_)))
}

/// Canonical key: collapses duplicate separators, `.` segments and trailing slashes.
fn key(path: &Path) -> PathBuf {
    path.components().filter(|c| !matches!(c, Component::CurDir)).collect()
}

fn io_kind(op: &'static str, path: &Path, kind: io::ErrorKind) -> EnvError {
    EnvError::from_io(op, path, io::Error::from(kind))
}

fn not_found(path: &Path) -> EnvError {
    EnvError::NotFound { path: path.to_path_buf() }
}

#[derive(Debug, Default)]
pub struct MemBackend {
    tree: Arc<Mutex<Tree>>,
    locks: LockRegistry,
}

impl MemBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn tree(&self) -> MutexGuard<'_, Tree> {
        self.tree.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Drop every byte that was never synced, as a power loss would.
    pub fn simulate_crash(&self) {
        let tree = self.tree();
        let mut lost = 0usize;
        for f in tree.files.values() {
            let mut d = write_data(f);
            let synced = d.synced_len;
            lost += d.data.len().saturating_sub(synced);
            d.data.truncate(synced);
        }
        debug!(files = tree.files.len(), lost_bytes = lost, "simulated crash");
    }

    fn lookup(&self, path: &Path) -> Result<FileRef> {
        let k = key(path);
        self.tree().files.get(&k).cloned().ok_or_else(|| not_found(path))
    }
}

pub struct MemSequentialFile {
    file: FileRef,
    pos: u64,
    path: PathBuf,
}

impl SequentialFile for MemSequentialFile {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let d = read_data(&self.file);
        let start = usize::try_from(self.pos).unwrap_or(usize::MAX).min(d.data.len());
        let n = buf.len().min(d.data.len() - start);
        buf[..n].copy_from_slice(&d.data[start..start + n]);
        self.pos += n as u64;
        Ok(n)
    }

    fn skip(&mut self, n: u64) -> Result<()> {
        self.pos = self.pos.saturating_add(n);
        Ok(())
    }

    fn len(&self) -> Result<u64> {
        Ok(read_data(&self.file).data.len() as u64)
    }

    fn path(&self) -> &Path {
        &self.path
    }
}

pub struct MemRandomAccessFile {
    file: FileRef,
    path: PathBuf,
}

impl RandomAccessFile for MemRandomAccessFile {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        let d = read_data(&self.file);
        let start = usize::try_from(offset).unwrap_or(usize::MAX).min(d.data.len());
        let n = buf.len().min(d.data.len() - start);
        buf[..n].copy_from_slice(&d.data[start..start + n]);
        Ok(n)
    }

    fn path(&self) -> &Path {
        &self.path
    }
}

pub struct MemWritableFile {
    file: FileRef,
    path: PathBuf,
    closed: bool,
}

impl MemWritableFile {
    fn check_open(&self) {
        if self.closed {
            panic!("use of closed file handle {}", self.path.display());
        }
    }
}

impl WritableFile for MemWritableFile {
    fn append(&mut self, data: &[u8]) -> Result<()> {
        self.check_open();
        let mut d = write_data(&self.file);
        d.data.extend_from_slice(data);
        d.modified = SystemTime::now();
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.check_open();
        Ok(())
    }

    fn sync(&mut self) -> Result<()> {
        self.check_open();
        let mut d = write_data(&self.file);
        d.synced_len = d.data.len();
        Ok(())
    }

    fn truncate(&mut self, size: u64) -> Result<()> {
        self.check_open();
        let size = usize::try_from(size).unwrap_or(usize::MAX);
        let mut d = write_data(&self.file);
        d.data.resize(size, 0);
        d.synced_len = d.synced_len.min(size);
        d.modified = SystemTime::now();
        Ok(())
    }

    fn len(&self) -> u64 {
        read_data(&self.file).data.len() as u64
    }

    fn close(&mut self) -> Result<()> {
        if self.closed {
            panic!("file handle {} closed twice", self.path.display());
        }
        self.closed = true;
        Ok(())
    }

    fn path(&self) -> &Path {
        &self.path
    }
}

pub struct MemLockFile {
    path: PathBuf,
    key: PathBuf,
    registry: LockRegistry,
    locked: bool,
}

impl LockableFile for MemLockFile {
    fn try_lock(&mut self) -> Result<()> {
        if self.locked || !self.registry.acquire(&self.key) {
            return Err(EnvError::already_locked(&self.path));
        }
        self.locked = true;
        Ok(())
    }

    fn unlock(&mut self) -> Result<()> {
        if !self.locked {
            panic!("unlock of {} which this handle does not hold", self.path.display());
        }
        self.locked = false;
        self.registry.release(&self.key);
        Ok(())
    }

    fn is_locked(&self) -> bool {
        self.locked
    }

    fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for MemLockFile {
    fn drop(&mut self) {
        if self.locked {
            self.registry.release(&self.key);
        }
    }
}

impl Backend for MemBackend {
    type SequentialFile = MemSequentialFile;
    type RandomAccessFile = MemRandomAccessFile;
    type WritableFile = MemWritableFile;
    type LockableFile = MemLockFile;

    fn name(&self) -> &'static str {
        "memory"
    }

    fn open_sequential(&self, path: &Path) -> Result<MemSequentialFile> {
        Ok(MemSequentialFile {
            file: self.lookup(path)?,
            pos: 0,
            path: path.to_path_buf(),
        })
    }

    fn open_random(&self, path: &Path) -> Result<MemRandomAccessFile> {
        Ok(MemRandomAccessFile {
            file: self.lookup(path)?,
            path: path.to_path_buf(),
        })
    }

    fn open_writable(&self, path: &Path, mode: WriteMode) -> Result<MemWritableFile> {
        let k = key(path);
        let mut tree = self.tree();
        if tree.is_dir(&k) {
            return Err(io_kind("open for write", path, io::ErrorKind::IsADirectory));
        }
        if !tree.parent_exists(&k) {
            return Err(not_found(path));
        }
        let file = match (tree.files.get(&k).cloned(), mode) {
            (Some(_), WriteMode::CreateNew) => {
                return Err(EnvError::AlreadyExists { path: path.to_path_buf() });
            }
            (Some(existing), WriteMode::Truncate) => {
                let mut d = write_data(&existing);
                d.data.clear();
                d.synced_len = 0;
                d.modified = SystemTime::now();
                drop(d);
                existing
            }
            (Some(existing), WriteMode::Append) => existing,
            (None, _) => {
                let f: FileRef = Arc::new(RwLock::new(FileData::new()));
                tree.files.insert(k, Arc::clone(&f));
                f
            }
        };
        Ok(MemWritableFile {
            file,
            path: path.to_path_buf(),
            closed: false,
        })
    }

    fn open_lockable(&self, path: &Path) -> Result<MemLockFile> {
        let k = key(path);
        {
            let mut tree = self.tree();
            if !tree.parent_exists(&k) {
                return Err(not_found(path));
            }
            tree.files
                .entry(k.clone())
                .or_insert_with(|| Arc::new(RwLock::new(FileData::new())));
        }
        Ok(MemLockFile {
            path: path.to_path_buf(),
            key: k,
            registry: self.locks.clone(),
            locked: false,
        })
    }

    fn delete_file(&self, path: &Path) -> Result<()> {
        let k = key(path);
        let mut tree = self.tree();
        if tree.dirs.contains(&k) {
            return Err(io_kind("delete file", path, io::ErrorKind::IsADirectory));
        }
        tree.files.remove(&k).map(|_| ()).ok_or_else(|| not_found(path))
    }

    fn rename_file(&self, src: &Path, dst: &Path) -> Result<()> {
        let (ks, kd) = (key(src), key(dst));
        let mut tree = self.tree();
        if !tree.parent_exists(&kd) {
            return Err(not_found(dst));
        }
        if let Some(f) = tree.files.remove(&ks) {
            if tree.dirs.contains(&kd) {
                tree.files.insert(ks, f);
                return Err(io_kind("rename", dst, io::ErrorKind::IsADirectory));
            }
            tree.files.insert(kd, f);
            return Ok(());
        }
        if !tree.dirs.contains(&ks) {
            return Err(not_found(src));
        }
        if tree.files.contains_key(&kd) || (tree.dirs.contains(&kd) && tree.has_children(&kd)) {
            return Err(io_kind("rename", dst, io::ErrorKind::DirectoryNotEmpty));
        }
        // Move the directory and everything below it.
        let moved_dirs: Vec<PathBuf> = tree.dirs.iter().filter(|d| d.starts_with(&ks)).cloned().collect();
        let rebase = |p: &Path| match p.strip_prefix(&ks) {
            Ok(rel) if !rel.as_os_str().is_empty() => kd.join(rel),
            _ => kd.clone(),
        };
        for d in moved_dirs {
            tree.dirs.remove(&d);
            tree.dirs.insert(rebase(d.as_path()));
        }
        let moved_files: Vec<PathBuf> = tree.files.keys().filter(|f| f.starts_with(&ks)).cloned().collect();
        for f in moved_files {
            if let Some(data) = tree.files.remove(&f) {
                tree.files.insert(rebase(f.as_path()), data);
            }
        }
        Ok(())
    }

    fn link_file(&self, src: &Path, dst: &Path) -> Result<()> {
        let (ks, kd) = (key(src), key(dst));
        let mut tree = self.tree();
        let f = tree.files.get(&ks).cloned().ok_or_else(|| not_found(src))?;
        if tree.files.contains_key(&kd) || tree.dirs.contains(&kd) {
            return Err(EnvError::AlreadyExists { path: dst.to_path_buf() });
        }
        if !tree.parent_exists(&kd) {
            return Err(not_found(dst));
        }
        tree.files.insert(kd, f);
        Ok(())
    }

    fn create_dir(&self, path: &Path) -> Result<()> {
        let k = key(path);
        let mut tree = self.tree();
        if tree.is_dir(&k) || tree.files.contains_key(&k) {
            return Err(EnvError::AlreadyExists { path: path.to_path_buf() });
        }
        if !tree.parent_exists(&k) {
            return Err(not_found(path));
        }
        tree.dirs.insert(k);
        Ok(())
    }

    fn create_dir_if_missing(&self, path: &Path) -> Result<()> {
        let k = key(path);
        let mut tree = self.tree();
        for anc in k.ancestors().collect::<Vec<_>>().into_iter().rev() {
            if is_root(anc) || tree.dirs.contains(anc) {
                continue;
            }
            if tree.files.contains_key(anc) {
                return Err(EnvError::AlreadyExists { path: anc.to_path_buf() });
            }
            tree.dirs.insert(anc.to_path_buf());
        }
        Ok(())
    }

    fn delete_dir(&self, path: &Path) -> Result<()> {
        let k = key(path);
        let mut tree = self.tree();
        if !tree.dirs.contains(&k) {
            return Err(not_found(path));
        }
        if tree.has_children(&k) {
            return Err(io_kind("delete dir", path, io::ErrorKind::DirectoryNotEmpty));
        }
        tree.dirs.remove(&k);
        Ok(())
    }

    fn list_dir(&self, path: &Path) -> Result<Vec<DirEntry>> {
        let k = key(path);
        let tree = self.tree();
        if !tree.is_dir(&k) {
            return Err(not_found(path));
        }
        let name_of = |p: &Path| p.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
        let mut out: Vec<DirEntry> = tree
            .dirs
            .iter()
            .filter(|d| d.parent() == Some(k.as_path()))
            .map(|d| DirEntry { name: name_of(d.as_path()), entry_type: EntryType::Directory, size: 0 })
            .chain(tree.files.iter().filter(|(p, _)| p.parent() == Some(k.as_path())).map(|(p, f)| DirEntry {
                name: name_of(p.as_path()),
                entry_type: EntryType::File,
                size: read_data(f).data.len() as u64,
            }))
            .collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(out)
    }

    fn sync_dir(&self, path: &Path) -> Result<()> {
        if self.tree().is_dir(&key(path)) { Ok(()) } else { Err(not_found(path)) }
    }

    fn file_exists(&self, path: &Path) -> bool {
        let k = key(path);
        let tree = self.tree();
        tree.files.contains_key(&k) || tree.is_dir(&k)
    }

    fn file_size(&self, path: &Path) -> Result<u64> {
        let f = self.lookup(path)?;
        Ok(read_data(&f).data.len() as u64)
    }

    fn modified_time(&self, path: &Path) -> Result<SystemTime> {
        let f = self.lookup(path)?;
        Ok(read_data(&f).modified)
    }

    fn free_space(&self, path: &Path) -> Result<u64> {
        if self.file_exists(path) { Ok(u64::MAX) } else { Err(not_found(path)) }
    }

    fn absolute_path(&self, path: &Path) -> Result<PathBuf> {
        let k = key(path);
        if k.has_root() { Ok(k) } else { Ok(Path::new("/").join(k)) }
    }

    fn current_thread_id(&self) -> u64 {
        let mut h = DefaultHasher::new();
        std::thread::current().id().hash(&mut h);
        h.finish()
    }
}
