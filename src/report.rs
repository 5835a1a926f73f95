//! Read-only snapshots of a domain's delay statistics
//!
//! The textual snapshot is three lines: cumulative delay in microseconds
//! (total, direct, background), then the three decayed some-delay averages,
//! then the three full-delay averages, each formatted `integer.fraction`
//! with a two-digit fraction like classic load averages. With diagnostics
//! enabled the snapshot also carries the raw per-CPU task counts.
//!
//! Capturing a snapshot first gives the domain a chance to roll its decay
//! windows over, so averages keep decaying on an idle domain that sees no
//! transitions at all. Snapshots are always well-formed, including for a
//! domain that never accumulated any data.

use std::fmt;
use std::io::{self, Write};

use serde::Serialize;

use crate::decay::{self, NR_WINDOWS};
use crate::domain::DelayDomain;
use crate::task::TaskState;
use crate::tracker::DelayTracker;

/// A decayed average in load-average fixed point
///
/// Displays as `integer.fraction` with exactly two fraction digits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecayedAverage(pub(crate) u64);

impl DecayedAverage {
    /// Integer percent part
    pub fn integer(self) -> u64 {
        decay::load_int(self.0)
    }

    /// Two-digit fractional percent part
    pub fn fraction(self) -> u64 {
        decay::load_frac(self.0)
    }
}

impl fmt::Display for DecayedAverage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:02}", self.integer(), self.fraction())
    }
}

impl Serialize for DecayedAverage {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// Raw task counts of one CPU, diagnostics only
#[derive(Debug, Clone, Serialize)]
pub struct CpuCounts {
    pub iowait: u32,
    pub runnable: u32,
    pub delayed: u32,
    pub delayed_active: u32,
}

/// Snapshot of one domain's counters and averages
#[derive(Debug, Clone, Serialize)]
pub struct DomainReport {
    /// Cumulative delay over all CPUs, µs
    pub total_us: u64,
    /// Direct (foreground) share of the total, µs
    pub direct_us: u64,
    /// Background share of the total, µs
    pub background_us: u64,
    /// Some-delay averages over the 1m, 5m and 15m windows
    pub avg_some: [DecayedAverage; NR_WINDOWS],
    /// Full-delay averages over the 1m, 5m and 15m windows
    pub avg_full: [DecayedAverage; NR_WINDOWS],
    /// Per-CPU task counts, present when diagnostics are enabled
    #[serde(skip_serializing_if = "Option::is_none")]
    pub percpu: Option<Vec<CpuCounts>>,
}

impl DomainReport {
    pub(crate) fn capture(domain: &DelayDomain, now: u64, with_percpu: bool) -> Self {
        decay::maybe_rollover(domain, now);

        let (direct_us, background_us) = domain.aggregate_us();
        let load = |avgs: &[std::sync::atomic::AtomicU64; NR_WINDOWS], i: usize| {
            DecayedAverage(avgs[i].load(std::sync::atomic::Ordering::Relaxed))
        };

        let percpu = with_percpu.then(|| {
            (0..domain.nr_cpus())
                .map(|cpu| {
                    let dc = domain.cpu(cpu);
                    CpuCounts {
                        iowait: dc.task_count(TaskState::Iowait),
                        runnable: dc.task_count(TaskState::Runnable),
                        delayed: dc.task_count(TaskState::Delayed),
                        delayed_active: dc.task_count(TaskState::DelayedActive),
                    }
                })
                .collect()
        });

        Self {
            total_us: direct_us + background_us,
            direct_us,
            background_us,
            avg_some: std::array::from_fn(|i| load(&domain.avg_some, i)),
            avg_full: std::array::from_fn(|i| load(&domain.avg_full, i)),
            percpu,
        }
    }

    /// Write the textual snapshot
    pub fn write_text<W: Write>(&self, w: &mut W) -> io::Result<()> {
        writeln!(
            w,
            "{} {} {}",
            self.total_us, self.direct_us, self.background_us
        )?;
        writeln!(
            w,
            "{} {} {}",
            self.avg_some[0], self.avg_some[1], self.avg_some[2]
        )?;
        writeln!(
            w,
            "{} {} {}",
            self.avg_full[0], self.avg_full[1], self.avg_full[2]
        )?;
        if let Some(percpu) = &self.percpu {
            for counts in percpu {
                writeln!(
                    w,
                    "{} {} {} {}",
                    counts.iowait, counts.runnable, counts.delayed, counts.delayed_active
                )?;
            }
        }
        Ok(())
    }

    /// The textual snapshot as a string
    pub fn to_text(&self) -> String {
        let mut out = Vec::new();
        self.write_text(&mut out).expect("write to Vec cannot fail");
        String::from_utf8(out).expect("report text is ASCII")
    }
}

impl DelayTracker {
    /// Capture a snapshot of `domain`, rolling its windows over first
    pub fn report(&self, domain: &DelayDomain) -> DomainReport {
        DomainReport::capture(domain, self.now_ns(), self.diagnostics())
    }
}
