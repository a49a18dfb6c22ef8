//! Core configuration types.
//! - EnvConfig holds pool sizes, the optional rate limit and logging settings.
//! - LogLevel represents verbosity with simple parsing helpers.

use anyhow::{Result, bail};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use super::DEFAULT_THREADS;
use crate::rate_limiter::RateLimiterConfig;
use crate::scheduler::Priority;

/// Verbosity levels accepted in config and by `init_tracing`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum LogLevel {
    /// Only errors
    Quiet,
    /// Warnings and errors (default)
    #[default]
    Normal,
    Info,
    /// Pool growth, lock traffic
    Debug,
    /// Per-call I/O tracing
    Trace,
}

impl LogLevel {
    /// Parse common string names into our LogLevel (case-insensitive).
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "quiet" | "error" | "none" => Some(LogLevel::Quiet),
            "normal" | "warn" => Some(LogLevel::Normal),
            "info" | "verbose" => Some(LogLevel::Info),
            "debug" => Some(LogLevel::Debug),
            "trace" => Some(LogLevel::Trace),
            _ => None,
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LogLevel::Quiet => "quiet",
            LogLevel::Normal => "normal",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        };
        f.write_str(s)
    }
}

impl FromStr for LogLevel {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s).ok_or_else(|| format!("invalid log level: '{s}'"))
    }
}

/// Settings consumed by `Env::open`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvConfig {
    pub low_threads: usize,
    pub high_threads: usize,
    pub user_threads: usize,
    /// Ask the OS to deprioritise LOW workers.
    pub lower_low_priority: bool,
    /// Shared limiter for background writes; `None` disables limiting.
    pub rate_limit: Option<RateLimiterConfig>,
    pub log_level: LogLevel,
    pub log_file: Option<PathBuf>,
}

impl Default for EnvConfig {
    fn default() -> Self {
        Self {
            low_threads: DEFAULT_THREADS,
            high_threads: DEFAULT_THREADS,
            user_threads: DEFAULT_THREADS,
            lower_low_priority: false,
            rate_limit: None,
            log_level: LogLevel::Normal,
            log_file: None,
        }
    }
}

impl EnvConfig {
    pub fn threads(&self, priority: Priority) -> usize {
        match priority {
            Priority::Low => self.low_threads,
            Priority::High => self.high_threads,
            Priority::User => self.user_threads,
        }
    }

    /// Builder-style helper used mostly by tests.
    pub fn with_threads(mut self, priority: Priority, n: usize) -> Self {
        match priority {
            Priority::Low => self.low_threads = n,
            Priority::High => self.high_threads = n,
            Priority::User => self.user_threads = n,
        }
        self
    }

    pub fn with_rate_limit(mut self, rate: RateLimiterConfig) -> Self {
        self.rate_limit = Some(rate);
        self
    }

    /// Reject settings the scheduler or limiter cannot run with.
    pub fn validate(&self) -> Result<()> {
        for p in Priority::ALL {
            if self.threads(p) == 0 {
                bail!("{p} thread count must be at least 1");
            }
        }
        if let Some(rl) = &self.rate_limit {
            if rl.bytes_per_second == 0 {
                bail!("rate limit bytes_per_second must be non-zero");
            }
            if rl.refill_period.is_zero() {
                bail!("rate limit refill period must be non-zero");
            }
            if rl.burst_bytes == Some(0) {
                bail!("rate limit burst must be non-zero");
            }
        }
        Ok(())
    }
}
