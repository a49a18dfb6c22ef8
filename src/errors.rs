//! Typed error definitions for the environment layer.
//! Every fallible operation maps its failure onto one of a small set of categories
//! so storage code can branch on them without inspecting OS error codes.

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EnvError {
    #[error("Path not found: {path}")]
    NotFound { path: PathBuf },

    #[error("Access denied on {path}")]
    AccessDenied { path: PathBuf },

    #[error("Already exists: {path}")]
    AlreadyExists { path: PathBuf },

    #[error("Lock already held on {path}")]
    AlreadyLocked { path: PathBuf },

    #[error("No space left on device while writing {path}")]
    NoSpace { path: PathBuf },

    #[error("I/O error during {op} on '{path}': {source}")]
    Io {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Corruption in {path}: {detail}")]
    Corruption { path: PathBuf, detail: String },
}

/// Fieldless mirror of [`EnvError`] for cheap matching.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    NotFound,
    AccessDenied,
    AlreadyExists,
    AlreadyLocked,
    NoSpace,
    Io,
    Corruption,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::NotFound => "not found",
            ErrorKind::AccessDenied => "access denied",
            ErrorKind::AlreadyExists => "already exists",
            ErrorKind::AlreadyLocked => "already locked",
            ErrorKind::NoSpace => "no space",
            ErrorKind::Io => "io error",
            ErrorKind::Corruption => "corruption",
        };
        f.write_str(s)
    }
}

pub type Result<T> = std::result::Result<T, EnvError>;

impl EnvError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EnvError::NotFound { .. } => ErrorKind::NotFound,
            EnvError::AccessDenied { .. } => ErrorKind::AccessDenied,
            EnvError::AlreadyExists { .. } => ErrorKind::AlreadyExists,
            EnvError::AlreadyLocked { .. } => ErrorKind::AlreadyLocked,
            EnvError::NoSpace { .. } => ErrorKind::NoSpace,
            EnvError::Io { .. } => ErrorKind::Io,
            EnvError::Corruption { .. } => ErrorKind::Corruption,
        }
    }

    pub fn corruption(path: &Path, detail: impl Into<String>) -> Self {
        EnvError::Corruption {
            path: path.to_path_buf(),
            detail: detail.into(),
        }
    }

    pub fn already_locked(path: &Path) -> Self {
        EnvError::AlreadyLocked {
            path: path.to_path_buf(),
        }
    }

    /// Classify an `io::Error` raised by `op` on `path`.
    ///
    /// `ErrorKind` decides first; raw OS codes catch the cases std still reports
    /// as `Other` on some targets (quota exhaustion, read-only media, lock violations).
    pub fn from_io(op: &'static str, path: &Path, e: io::Error) -> Self {
        let path = path.to_path_buf();
        match e.kind() {
            io::ErrorKind::NotFound => return EnvError::NotFound { path },
            io::ErrorKind::PermissionDenied | io::ErrorKind::ReadOnlyFilesystem => {
                return EnvError::AccessDenied { path };
            }
            io::ErrorKind::AlreadyExists => return EnvError::AlreadyExists { path },
            io::ErrorKind::StorageFull | io::ErrorKind::QuotaExceeded => {
                return EnvError::NoSpace { path };
            }
            _ => {}
        }

        if let Some(code) = e.raw_os_error() {
            #[cfg(unix)]
            match code {
                libc::ENOSPC | libc::EDQUOT => return EnvError::NoSpace { path },
                libc::EACCES | libc::EPERM | libc::EROFS => return EnvError::AccessDenied { path },
                libc::ENOENT => return EnvError::NotFound { path },
                libc::EEXIST => return EnvError::AlreadyExists { path },
                _ => {}
            }
            #[cfg(windows)]
            match code {
                // ERROR_DISK_FULL, ERROR_HANDLE_DISK_FULL
                112 | 39 => return EnvError::NoSpace { path },
                // ERROR_ACCESS_DENIED, ERROR_WRITE_PROTECT
                5 | 19 => return EnvError::AccessDenied { path },
                // ERROR_FILE_NOT_FOUND, ERROR_PATH_NOT_FOUND
                2 | 3 => return EnvError::NotFound { path },
                // ERROR_FILE_EXISTS, ERROR_ALREADY_EXISTS
                80 | 183 => return EnvError::AlreadyExists { path },
                // ERROR_LOCK_VIOLATION
                33 => return EnvError::AlreadyLocked { path },
                _ => {}
            }
        }

        EnvError::Io { op, path, source: e }
    }
}

/// Adapter for `.map_err(...)`: converts io::Error into an [`EnvError`] tagged with op/path.
pub fn io_err<'a>(op: &'static str, path: &'a Path) -> impl FnOnce(io::Error) -> EnvError + 'a {
    move |e| EnvError::from_io(op, path, e)
}
