//! Time source for the environment.
//!
//! `SystemClock` reads the OS monotonic and wall clocks and really sleeps.
//! `ManualClock` keeps logical time so rate-limiter and scheduling tests are
//! deterministic: `sleep()` advances time instead of blocking.

use chrono::{DateTime, Local, TimeZone};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

pub trait Clock: Send + Sync + fmt::Debug {
    /// Monotonic nanoseconds since an arbitrary, fixed origin.
    fn now_nanos(&self) -> u64;

    /// Seconds since the Unix epoch.
    fn wall_clock_secs(&self) -> u64;

    /// Block the calling thread for `duration`.
    fn sleep(&self, duration: Duration);

    fn now_micros(&self) -> u64 {
        self.now_nanos() / 1_000
    }

    fn elapsed_since(&self, earlier_nanos: u64) -> Duration {
        Duration::from_nanos(self.now_nanos().saturating_sub(earlier_nanos))
    }
}

pub type SharedClock = Arc<dyn Clock>;

/// Format epoch seconds as a local `YYYY/MM/DD-HH:MM:SS` timestamp.
pub fn time_to_string(secs: u64) -> String {
    let secs = i64::try_from(secs).unwrap_or(i64::MAX);
    match Local.timestamp_opt(secs, 0).single() {
        Some(dt) => dt.format("%Y/%m/%d-%H:%M:%S").to_string(),
        None => {
            let utc: Option<DateTime<chrono::Utc>> = DateTime::from_timestamp(secs, 0);
            utc.map(|d| d.format("%Y/%m/%d-%H:%M:%S").to_string())
                .unwrap_or_else(|| format!("{secs}s"))
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SystemClock {
    origin: Instant,
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl SystemClock {
    pub fn new() -> Self {
        Self { origin: Instant::now() }
    }

    pub fn shared() -> SharedClock {
        Arc::new(Self::new())
    }
}

impl Clock for SystemClock {
    fn now_nanos(&self) -> u64 {
        u64::try_from(self.origin.elapsed().as_nanos()).unwrap_or(u64::MAX)
    }

    fn wall_clock_secs(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0)
    }

    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// Logical clock driven by `advance()` and `sleep()`.
#[derive(Debug)]
pub struct ManualClock {
    nanos: AtomicU64,
    epoch_secs: u64,
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            nanos: AtomicU64::new(0),
            epoch_secs: 1_700_000_000,
        }
    }

    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    pub fn advance(&self, duration: Duration) {
        let n = u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX);
        self.nanos.fetch_add(n, Ordering::SeqCst);
    }

    pub fn elapsed(&self) -> Duration {
        Duration::from_nanos(self.nanos.load(Ordering::SeqCst))
    }
}

impl Clock for ManualClock {
    fn now_nanos(&self) -> u64 {
        self.nanos.load(Ordering::SeqCst)
    }

    fn wall_clock_secs(&self) -> u64 {
        self.epoch_secs + self.elapsed().as_secs()
    }

    fn sleep(&self, duration: Duration) {
        self.advance(duration);
        // Let other threads observe the new time before we re-check our condition.
        std::thread::yield_now();
    }
}
