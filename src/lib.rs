//! OS-agnostic environment layer for storage engines.
//!
//! Everything a storage engine needs from the operating system goes through [`Env`]:
//! file handles with explicit capabilities, directory operations, atomic replace,
//! process-level locks, a monotonic clock, prioritised background threads and a
//! token-bucket rate limiter for background writes.
//!
//! The OS backend is chosen at build time ([`PlatformBackend`]); [`MemBackend`] is an
//! in-memory stand-in that can simulate a crash.
//!
//! ```no_run
//! use platform_env::{Env, EnvConfig, Priority, WriteMode, WritableFile};
//! use std::path::Path;
//!
//! let env = Env::open(&EnvConfig::default())?;
//! env.create_dir_if_missing(Path::new("db"))?;
//! let mut log = env.open_for_write(Path::new("db/000001.log"), WriteMode::Append)?;
//! log.append(b"record")?;
//! log.sync()?;
//! log.close()?;
//! env.schedule(Priority::Low, || Ok(()));
//! # Ok::<(), anyhow::Error>(())
//! ```

pub mod clock;
pub mod config;
pub mod env;
pub mod errors;
pub mod file;
pub mod logging;
pub mod platform;
pub mod rate_limiter;
pub mod scheduler;

pub use clock::{Clock, ManualClock, SharedClock, SystemClock, time_to_string};
pub use config::{EnvConfig, LogLevel, load_config, load_config_from_xml_path};
pub use env::Env;
pub use errors::{EnvError, ErrorKind, Result};
pub use file::{
    DirEntry, EntryType, FileLock, LockableFile, RandomAccessFile, ReadCapability, ReadHandle,
    SequentialFile, WritableFile, WriteMode,
};
pub use logging::init_tracing;
pub use platform::{Backend, MemBackend, PlatformBackend};
pub use rate_limiter::{RateLimitMode, RateLimitedFile, RateLimiter, RateLimiterConfig};
pub use scheduler::{CancelFlag, Priority, Scheduler, TaskFailure, TaskFailureHook};
