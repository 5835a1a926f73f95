//! Fixed-point decayed averages and the period rollover
//!
//! Delay percentages are folded into exponentially decaying averages the way
//! classic load averages are computed: an 11-bit fixed-point representation,
//! one sample every five seconds, and one decay constant per reporting
//! window (one, five and fifteen minutes). The value folded in is the
//! percentage of tracked time a domain spent in the `Some` and `Full` delay
//! states during the period, so a domain pinned at full delay converges
//! toward an average of 100.
//!
//! The rollover is lock-free. Any CPU that notices the deadline has passed
//! computes how many whole periods elapsed and tries to advance the deadline
//! with a single compare-and-swap; exactly one wins and performs the fold,
//! everyone else falls through. The cumulative `times[]` accumulators are
//! harvested with atomic swaps, which leaves a narrow window where a
//! concurrent transition lands its dwell time just after the swap and gets
//! counted in the following period instead. That imprecision is a deliberate
//! trade for keeping the transition hot path lock-free; do not add a lock
//! here.

use std::sync::atomic::Ordering;

use crate::domain::{DelayDomain, DomainState};

/// Number of decay windows per average
pub const NR_WINDOWS: usize = 3;

/// Reporting window lengths, seconds
pub const WINDOW_SECS: [u64; NR_WINDOWS] = [60, 300, 900];

/// Sampling period between rollovers, nanoseconds
pub const SAMPLE_PERIOD_NS: u64 = 5_000_000_000;

/// Fixed-point fraction bits
pub const FSHIFT: u32 = 11;

/// 1.0 in fixed-point representation
pub const FIXED_1: u64 = 1 << FSHIFT;

/// Per-window decay constants: `FIXED_1 * exp(-period / window)` for the
/// 1m, 5m and 15m windows at a 5s period
pub const EXP: [u64; NR_WINDOWS] = [1884, 2014, 2037];

/// One decay step: fold `active` into `load` with decay constant `exp`
pub(crate) fn calc_load(load: u64, exp: u64, active: u64) -> u64 {
    (load * exp + active * (FIXED_1 - exp)) >> FSHIFT
}

/// Integer part of a fixed-point average
pub(crate) fn load_int(x: u64) -> u64 {
    x >> FSHIFT
}

/// Two-digit fractional part of a fixed-point average
pub(crate) fn load_frac(x: u64) -> u64 {
    load_int((x & (FIXED_1 - 1)) * 100)
}

/// Fold any elapsed periods into a domain's decayed averages
///
/// Cheap no-op while the deadline has not passed (one atomic load and a
/// comparison). Callers are the coarse-state change path and report reads;
/// calling it any number of times within one period leaves the averages
/// untouched.
pub(crate) fn maybe_rollover(md: &DelayDomain, now: u64) {
    let expires = md.period_expires.load(Ordering::Relaxed);
    if now < expires {
        return;
    }

    // Account for long pauses: fold one period with real data and synthetic
    // idle periods for the rest, then land the deadline back on the grid.
    let missed_periods = 1 + (now - expires) / SAMPLE_PERIOD_NS;
    let next = expires + missed_periods * SAMPLE_PERIOD_NS;

    if md
        .period_expires
        .compare_exchange(expires, next, Ordering::Relaxed, Ordering::Relaxed)
        .is_err()
    {
        // Another CPU won the race and does the fold.
        return;
    }

    let mut none = md.times[DomainState::None as usize].swap(0, Ordering::Relaxed);
    let mut some = md.times[DomainState::Some as usize].swap(0, Ordering::Relaxed);
    let mut full = md.times[DomainState::Full as usize].swap(0, Ordering::Relaxed);

    for _ in 0..missed_periods {
        let total = (none + some + full).max(1);

        let pct = (some * 100 / total) * FIXED_1;
        for (i, exp) in EXP.iter().enumerate() {
            let avg = md.avg_some[i].load(Ordering::Relaxed);
            md.avg_some[i].store(calc_load(avg, *exp, pct), Ordering::Relaxed);
        }

        let pct = (full * 100 / total) * FIXED_1;
        for (i, exp) in EXP.iter().enumerate() {
            let avg = md.avg_full[i].load(Ordering::Relaxed);
            md.avg_full[i].store(calc_load(avg, *exp, pct), Ordering::Relaxed);
        }

        // Only the first iteration carries real data; the remaining missed
        // periods dilute the averages exactly as wall-clock idle would.
        none = 0;
        some = 0;
        full = 0;
    }
}
