//! Monotonic time sources for delay accounting
//!
//! Every timestamp in the engine (delay-section entry, per-CPU state-change
//! stamps, rollover deadlines) comes from a [`Clock`] in nanoseconds since a
//! process-local epoch. Production code uses [`MonotonicClock`]; tests inject
//! a [`ManualClock`] so that dwell times, delay intervals and rollover
//! boundaries are exact rather than wall-clock approximate.

use std::fmt::Debug;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Nanoseconds per microsecond; delay intervals are accrued in microseconds.
pub const NSEC_PER_USEC: u64 = 1_000;

/// A monotonic nanosecond clock
///
/// Implementations must be monotonic: a later call never returns a smaller
/// value than an earlier one. The epoch is arbitrary but fixed for the
/// lifetime of the clock.
pub trait Clock: Debug + Send + Sync {
    /// Current time in nanoseconds since the clock's epoch
    fn now_ns(&self) -> u64;
}

/// Production clock backed by `std::time::Instant`
///
/// The epoch is the moment the clock was created.
#[derive(Debug)]
pub struct MonotonicClock {
    origin: Instant,
}

impl MonotonicClock {
    /// Create a clock whose epoch is "now"
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    fn now_ns(&self) -> u64 {
        self.origin.elapsed().as_nanos() as u64
    }
}

/// Manually advanced clock for deterministic tests
///
/// # Thread Safety
///
/// `ManualClock` is thread-safe; `advance` uses an atomic fetch_add, so
/// concurrent advancers compose (the clock never goes backwards).
///
/// # Example
///
/// ```
/// use demora::clock::{Clock, ManualClock};
///
/// let clock = ManualClock::new();
/// assert_eq!(clock.now_ns(), 0);
/// clock.advance_us(1_000);
/// assert_eq!(clock.now_ns(), 1_000_000);
/// ```
#[derive(Debug)]
pub struct ManualClock {
    ns: AtomicU64,
}

impl ManualClock {
    /// Create a clock starting at nanosecond 0
    pub const fn new() -> Self {
        Self {
            ns: AtomicU64::new(0),
        }
    }

    /// Advance the clock by `delta` nanoseconds
    pub fn advance_ns(&self, delta: u64) {
        self.ns.fetch_add(delta, Ordering::SeqCst);
    }

    /// Advance the clock by `delta` microseconds
    pub fn advance_us(&self, delta: u64) {
        self.advance_ns(delta * NSEC_PER_USEC);
    }

    /// Set the clock to an absolute nanosecond value
    ///
    /// Only meaningful in single-threaded test setup; `advance_ns` is the
    /// concurrency-safe way to move time forward.
    pub fn set_ns(&self, ns: u64) {
        self.ns.store(ns, Ordering::SeqCst);
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now_ns(&self) -> u64 {
        self.ns.load(Ordering::SeqCst)
    }
}
