//! Token-bucket admission control for background I/O.
//!
//! The bucket holds at most `burst_bytes` tokens and gains `bytes_per_second *
//! refill_period` tokens for every whole refill period that has elapsed. Fractions of a
//! byte are carried to the next period, so rates below one byte per period still hold.
//! A full bucket does not bank time: the period clock restarts when it is full.
//! Refill is lazy: it happens inside `request`, there is no timer thread.
//!
//! Blocking requesters are served strictly in arrival order. Each one draws a ticket;
//! only the ticket being served may take tokens, and it sleeps on the clock while the
//! bucket refills. Everyone else parks on a condvar until their turn.

use crate::clock::SharedClock;
use crate::errors::Result;
use crate::file::WritableFile;
use std::path::Path;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::{debug, trace};

pub const DEFAULT_REFILL_PERIOD: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RateLimitMode {
    /// Callers wait until their full request is granted.
    #[default]
    Blocking,
    /// Callers get whatever is available right now, possibly zero.
    NonBlocking,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimiterConfig {
    pub bytes_per_second: u64,
    pub refill_period: Duration,
    /// Bucket capacity. `None` means one refill period's worth of tokens.
    pub burst_bytes: Option<u64>,
    pub mode: RateLimitMode,
}

impl RateLimiterConfig {
    pub fn new(bytes_per_second: u64) -> Self {
        Self {
            bytes_per_second,
            refill_period: DEFAULT_REFILL_PERIOD,
            burst_bytes: None,
            mode: RateLimitMode::Blocking,
        }
    }
}

const NANOS_PER_SEC: u128 = 1_000_000_000;

struct Bucket {
    available: u64,
    last_refill_nanos: u64,
    bytes_per_second: u64,
    /// Sub-byte remainder, in byte-nanoseconds (always below one byte).
    carry: u128,
    next_ticket: u64,
    serving: u64,
    total_bytes: u64,
    total_requests: u64,
}

pub struct RateLimiter {
    clock: SharedClock,
    refill_period: Duration,
    burst: u64,
    mode: RateLimitMode,
    state: Mutex<Bucket>,
    turn: Condvar,
}

/// Whole bytes one refill period is worth, at least 1. Only used for the default burst.
fn tokens_per_period(bytes_per_second: u64, period: Duration) -> u64 {
    let per = (bytes_per_second as u128 * period.as_nanos()) / NANOS_PER_SEC;
    (per.min(u64::MAX as u128) as u64).max(1)
}

impl RateLimiter {
    /// # Panics
    /// If `bytes_per_second`, `refill_period` or an explicit `burst_bytes` is zero.
    pub fn new(config: &RateLimiterConfig, clock: SharedClock) -> Self {
        assert!(config.bytes_per_second > 0, "rate limiter needs a non-zero rate");
        assert!(!config.refill_period.is_zero(), "rate limiter needs a non-zero refill period");
        let burst = config
            .burst_bytes
            .unwrap_or_else(|| tokens_per_period(config.bytes_per_second, config.refill_period));
        assert!(burst > 0, "rate limiter needs a non-zero burst");
        let now = clock.now_nanos();
        debug!(
            bytes_per_second = config.bytes_per_second,
            refill_ms = config.refill_period.as_millis() as u64,
            burst,
            mode = ?config.mode,
            "rate limiter created"
        );
        Self {
            clock,
            refill_period: config.refill_period,
            burst,
            mode: config.mode,
            state: Mutex::new(Bucket {
                available: burst,
                last_refill_nanos: now,
                bytes_per_second: config.bytes_per_second,
                carry: 0,
                next_ticket: 0,
                serving: 0,
                total_bytes: 0,
                total_requests: 0,
            }),
            turn: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Bucket> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn period_nanos(&self) -> u64 {
        self.refill_period.as_nanos().min(u64::MAX as u128) as u64
    }

    /// Byte-nanoseconds credited per refill period at the current rate.
    fn credit_per_period(&self, b: &Bucket) -> u128 {
        b.bytes_per_second as u128 * self.period_nanos() as u128
    }

    fn refill(&self, b: &mut Bucket, now: u64) {
        if b.available >= self.burst {
            b.last_refill_nanos = now;
            b.carry = 0;
            return;
        }
        let period = self.period_nanos();
        let elapsed = now.saturating_sub(b.last_refill_nanos);
        if elapsed < period {
            return;
        }
        let periods = elapsed / period;
        let credit = self.credit_per_period(b).saturating_mul(periods as u128).saturating_add(b.carry);
        let add = (credit / NANOS_PER_SEC).min(u64::MAX as u128) as u64;
        b.carry = credit % NANOS_PER_SEC;
        b.available = b.available.saturating_add(add).min(self.burst);
        b.last_refill_nanos = b.last_refill_nanos.saturating_add(periods * period);
        if b.available == self.burst {
            b.last_refill_nanos = now;
            b.carry = 0;
        }
    }

    /// Clock time at which the bucket will hold `deficit` more bytes than it does now.
    fn ready_at(&self, b: &Bucket, deficit: u64) -> u64 {
        let needed = (deficit as u128 * NANOS_PER_SEC).saturating_sub(b.carry);
        let periods = needed.div_ceil(self.credit_per_period(b));
        let wait = (periods * self.period_nanos() as u128).min(u64::MAX as u128) as u64;
        b.last_refill_nanos.saturating_add(wait)
    }

    /// Ask for `bytes` tokens.
    ///
    /// Blocking mode returns `bytes` once all of them were granted; requests larger than
    /// the burst are granted in burst-sized installments. Non-blocking mode returns the
    /// number granted right now, which may be less than `bytes` or zero.
    pub fn request(&self, bytes: u64) -> u64 {
        if bytes == 0 {
            return 0;
        }
        match self.mode {
            RateLimitMode::Blocking => self.request_blocking(bytes),
            RateLimitMode::NonBlocking => self.request_now(bytes),
        }
    }

    fn request_now(&self, bytes: u64) -> u64 {
        let mut b = self.lock();
        let now = self.clock.now_nanos();
        self.refill(&mut b, now);
        let granted = bytes.min(b.available);
        b.available -= granted;
        b.total_requests += 1;
        b.total_bytes += granted;
        trace!(requested = bytes, granted, "non-blocking rate limit request");
        granted
    }

    fn request_blocking(&self, bytes: u64) -> u64 {
        let mut b = self.lock();
        let ticket = b.next_ticket;
        b.next_ticket += 1;
        b.total_requests += 1;
        while b.serving != ticket {
            b = self.turn.wait(b).unwrap_or_else(PoisonError::into_inner);
        }

        let mut remaining = bytes;
        while remaining > 0 {
            let chunk = remaining.min(self.burst);
            let now = self.clock.now_nanos();
            self.refill(&mut b, now);
            if b.available >= chunk {
                b.available -= chunk;
                b.total_bytes += chunk;
                remaining -= chunk;
                continue;
            }
            let deficit = chunk - b.available;
            let wake_at = self.ready_at(&b, deficit);
            let wait = Duration::from_nanos(wake_at.saturating_sub(now));
            trace!(ticket, deficit, wait_us = wait.as_micros() as u64, "rate limiter waiting for refill");
            drop(b);
            self.clock.sleep(wait);
            b = self.lock();
        }

        b.serving += 1;
        drop(b);
        self.turn.notify_all();
        bytes
    }

    /// Change the refill rate. Takes effect at the next refill.
    ///
    /// # Panics
    /// If `bytes_per_second` is zero.
    pub fn set_bytes_per_second(&self, bytes_per_second: u64) {
        assert!(bytes_per_second > 0, "rate limiter needs a non-zero rate");
        let mut b = self.lock();
        let now = self.clock.now_nanos();
        self.refill(&mut b, now);
        b.bytes_per_second = bytes_per_second;
        debug!(bytes_per_second, "rate limiter rate changed");
    }

    pub fn bytes_per_second(&self) -> u64 {
        self.lock().bytes_per_second
    }

    pub fn refill_period(&self) -> Duration {
        self.refill_period
    }

    pub fn burst_bytes(&self) -> u64 {
        self.burst
    }

    pub fn mode(&self) -> RateLimitMode {
        self.mode
    }

    pub fn total_bytes_through(&self) -> u64 {
        self.lock().total_bytes
    }

    pub fn total_requests(&self) -> u64 {
        self.lock().total_requests
    }

    pub(crate) fn clock(&self) -> &SharedClock {
        &self.clock
    }
}

/// Writable handle whose appends are charged against a shared limiter.
/// Without a limiter it passes appends straight through.
pub struct RateLimitedFile<W: WritableFile> {
    inner: W,
    limiter: Option<Arc<RateLimiter>>,
}

impl<W: WritableFile> RateLimitedFile<W> {
    pub fn new(inner: W, limiter: Arc<RateLimiter>) -> Self {
        Self { inner, limiter: Some(limiter) }
    }

    pub(crate) fn unlimited(inner: W) -> Self {
        Self { inner, limiter: None }
    }

    pub fn limiter(&self) -> Option<&Arc<RateLimiter>> {
        self.limiter.as_ref()
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

impl<W: WritableFile> WritableFile for RateLimitedFile<W> {
    fn append(&mut self, data: &[u8]) -> Result<()> {
        let Some(limiter) = &self.limiter else {
            return self.inner.append(data);
        };
        let mut off = 0usize;
        while off < data.len() {
            let want = (data.len() - off) as u64;
            let granted = limiter.request(want) as usize;
            if granted == 0 {
                limiter.clock().sleep(limiter.refill_period());
                continue;
            }
            self.inner.append(&data[off..off + granted])?;
            off += granted;
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.inner.flush()
    }

    fn sync(&mut self) -> Result<()> {
        self.inner.sync()
    }

    fn fsync(&mut self) -> Result<()> {
        self.inner.fsync()
    }

    fn truncate(&mut self, size: u64) -> Result<()> {
        self.inner.truncate(size)
    }

    fn allocate(&mut self, len: u64) -> Result<()> {
        self.inner.allocate(len)
    }

    fn len(&self) -> u64 {
        self.inner.len()
    }

    fn close(&mut self) -> Result<()> {
        self.inner.close()
    }

    fn path(&self) -> &Path {
        self.inner.path()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};
    use std::sync::Mutex as StdMutex;

    fn limiter(rate: u64, mode: RateLimitMode) -> (Arc<ManualClock>, RateLimiter) {
        let clock = ManualClock::shared();
        let cfg = RateLimiterConfig {
            mode,
            ..RateLimiterConfig::new(rate)
        };
        let l = RateLimiter::new(&cfg, clock.clone());
        (clock, l)
    }

    #[test]
    fn default_burst_is_one_period() {
        let (_, l) = limiter(10_000, RateLimitMode::Blocking);
        assert_eq!(l.burst_bytes(), 1_000);
    }

    #[test]
    fn full_burst_is_immediate_then_next_byte_waits_a_period() {
        let (clock, l) = limiter(10_000, RateLimitMode::Blocking);
        let start = clock.now_nanos();
        assert_eq!(l.request(l.burst_bytes()), 1_000);
        assert_eq!(clock.now_nanos(), start, "burst must not wait");
        assert_eq!(l.request(1), 1);
        assert!(clock.elapsed_since(start) >= l.refill_period());
    }

    #[test]
    fn burst_after_idle_still_waits_a_full_period() {
        let (clock, l) = limiter(10_000, RateLimitMode::Blocking);
        clock.advance(Duration::from_millis(150));
        let start = clock.now_nanos();
        assert_eq!(l.request(l.burst_bytes()), 1_000);
        assert_eq!(clock.now_nanos(), start);
        assert_eq!(l.request(1), 1);
        assert!(clock.elapsed_since(start) >= l.refill_period());
    }

    #[test]
    fn sub_byte_per_period_rate_is_not_rounded_up() {
        let clock = ManualClock::shared();
        let cfg = RateLimiterConfig {
            burst_bytes: Some(10),
            ..RateLimiterConfig::new(1)
        };
        let l = RateLimiter::new(&cfg, clock.clone());
        assert_eq!(l.request(10), 10);
        let start = clock.now_nanos();
        assert_eq!(l.request(10), 10);
        assert!(clock.elapsed_since(start) >= Duration::from_secs(10));
        assert!(clock.elapsed_since(start) < Duration::from_millis(10_200));
    }

    #[test]
    fn default_burst_is_at_least_one_byte() {
        let (_, l) = limiter(1, RateLimitMode::NonBlocking);
        assert_eq!(l.burst_bytes(), 1);
    }

    #[test]
    fn oversized_request_paid_in_installments() {
        let (clock, l) = limiter(10_000, RateLimitMode::Blocking);
        let start = clock.now_nanos();
        assert_eq!(l.request(3_500), 3_500);
        // 1000 up front, then three more periods for the remaining 2500.
        assert!(clock.elapsed_since(start) >= Duration::from_millis(300));
        assert_eq!(l.total_bytes_through(), 3_500);
        assert_eq!(l.total_requests(), 1);
    }

    #[test]
    fn non_blocking_grants_partial_then_zero() {
        let (clock, l) = limiter(10_000, RateLimitMode::NonBlocking);
        assert_eq!(l.request(600), 600);
        assert_eq!(l.request(600), 400);
        assert_eq!(l.request(1), 0);
        clock.advance(Duration::from_millis(50));
        assert_eq!(l.request(1), 0, "refill happens only on whole periods");
        clock.advance(Duration::from_millis(50));
        assert_eq!(l.request(5_000), 1_000);
    }

    #[test]
    fn bucket_never_exceeds_burst() {
        let (clock, l) = limiter(10_000, RateLimitMode::NonBlocking);
        clock.advance(Duration::from_secs(60));
        assert_eq!(l.request(u64::MAX), 1_000);
    }

    #[test]
    fn rate_change_applies_to_next_refill() {
        let (clock, l) = limiter(10_000, RateLimitMode::NonBlocking);
        let cfg_burst = l.burst_bytes();
        assert_eq!(l.request(cfg_burst), cfg_burst);
        l.set_bytes_per_second(2_000);
        clock.advance(Duration::from_millis(100));
        assert_eq!(l.request(cfg_burst), 200);
        assert_eq!(l.bytes_per_second(), 2_000);
    }

    #[test]
    fn blocking_waiters_served_in_arrival_order() {
        let clock = ManualClock::shared();
        let cfg = RateLimiterConfig::new(1_000);
        let l = Arc::new(RateLimiter::new(&cfg, clock.clone()));
        // Drain so every later request has to wait.
        l.request(l.burst_bytes());
        let order = Arc::new(StdMutex::new(Vec::new()));
        let mut handles = Vec::new();
        for i in 0..4 {
            let worker_l = Arc::clone(&l);
            let order = Arc::clone(&order);
            handles.push(std::thread::spawn(move || {
                worker_l.request(50);
                order.lock().unwrap().push(i);
            }));
            // Make sure thread i has its ticket before i+1 starts.
            while l.total_requests() < (i + 2) as u64 {
                std::thread::yield_now();
            }
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3]);
    }

    struct VecFile {
        data: Vec<u8>,
        appends: usize,
    }

    impl WritableFile for VecFile {
        fn append(&mut self, data: &[u8]) -> Result<()> {
            self.data.extend_from_slice(data);
            self.appends += 1;
            Ok(())
        }
        fn flush(&mut self) -> Result<()> {
            Ok(())
        }
        fn sync(&mut self) -> Result<()> {
            Ok(())
        }
        fn truncate(&mut self, size: u64) -> Result<()> {
            self.data.truncate(size as usize);
            Ok(())
        }
        fn len(&self) -> u64 {
            self.data.len() as u64
        }
        fn close(&mut self) -> Result<()> {
            Ok(())
        }
        fn path(&self) -> &Path {
            Path::new("vec")
        }
    }

    #[test]
    fn rate_limited_file_charges_every_byte() {
        let (clock, l) = limiter(10_000, RateLimitMode::NonBlocking);
        let l = Arc::new(l);
        let mut f = RateLimitedFile::new(VecFile { data: Vec::new(), appends: 0 }, Arc::clone(&l));
        let start = clock.now_nanos();
        let payload = vec![7u8; 2_500];
        f.append(&payload).unwrap();
        assert_eq!(f.len(), 2_500);
        assert_eq!(l.total_bytes_through(), 2_500);
        assert!(clock.elapsed_since(start) >= Duration::from_millis(200));
        let inner = f.into_inner();
        assert_eq!(inner.data, payload);
        assert_eq!(inner.appends, 3);
    }
}
