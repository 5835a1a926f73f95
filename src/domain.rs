//! Containment domains and their per-CPU coarse delay states
//!
//! A [`DelayDomain`] represents one containment boundary (the whole system,
//! or one node of a resource-isolation hierarchy) over which delay is
//! measured. Each domain owns a fixed block of [`DomainCpu`] counters, one
//! per logical CPU, counting how many of its tasks sit in each productivity
//! state on that CPU and summarizing them into a coarse state: `None` (no
//! delayed tasks), `Some` (delayed tasks next to working tasks) or `Full`
//! (delay with nothing productive making headway).
//!
//! Per-CPU counters are single-writer: only the owning CPU mutates them,
//! under that CPU's run-queue lock, so every access uses `Relaxed` ordering.
//! The cumulative `times[]` accumulators and the rollover deadline are shared
//! across CPUs and use atomic read-modify-write; see `decay` for the accepted
//! imprecision there.

use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Weak};

use crate::clock::NSEC_PER_USEC;
use crate::decay;
use crate::error::DelayError;
use crate::task::{TaskState, NR_TASK_STATES};

/// Coarse delay state of a domain on one CPU
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum DomainState {
    /// No delayed tasks
    None = 0,
    /// Delayed tasks alongside working tasks
    Some = 1,
    /// Delayed tasks with no working tasks
    Full = 2,
}

/// Number of coarse domain states
pub const NR_DOMAIN_STATES: usize = 3;

impl DomainState {
    pub(crate) fn from_u8(raw: u8) -> Self {
        match raw {
            0 => DomainState::None,
            1 => DomainState::Some,
            _ => DomainState::Full,
        }
    }
}

/// Delay state of one domain on one CPU
///
/// Owned by the enclosing [`DelayDomain`]; mutated exclusively by the owning
/// CPU while it holds that CPU's run-queue lock.
#[derive(Debug)]
pub struct DomainCpu {
    /// Task counts per productivity state
    tasks: [AtomicU32; NR_TASK_STATES],

    /// Current coarse state on this CPU
    state: AtomicU8,

    /// When the coarse state last changed, ns
    state_start: AtomicU64,

    /// Direct delay attributed to this CPU, µs
    direct_us: AtomicU64,

    /// Background delay attributed to this CPU, µs
    background_us: AtomicU64,
}

impl DomainCpu {
    fn new(now: u64) -> Self {
        Self {
            tasks: std::array::from_fn(|_| AtomicU32::new(0)),
            state: AtomicU8::new(DomainState::None as u8),
            state_start: AtomicU64::new(now),
            direct_us: AtomicU64::new(0),
            background_us: AtomicU64::new(0),
        }
    }

    /// Number of this domain's tasks in `state` on this CPU
    pub fn task_count(&self, state: TaskState) -> u32 {
        self.tasks[state as usize].load(Ordering::Relaxed)
    }

    /// Current coarse state on this CPU
    pub fn state(&self) -> DomainState {
        DomainState::from_u8(self.state.load(Ordering::Relaxed))
    }

    /// Direct delay attributed to this CPU so far, µs
    pub fn direct_us(&self) -> u64 {
        self.direct_us.load(Ordering::Relaxed)
    }

    /// Background delay attributed to this CPU so far, µs
    pub fn background_us(&self) -> u64 {
        self.background_us.load(Ordering::Relaxed)
    }
}

/// One containment boundary over which delay statistics aggregate
///
/// Domains form a tree mirroring the containment hierarchy. The parent link
/// is a `Weak` back-reference: a domain never keeps its parent alive, and an
/// ancestor walk that finds the parent already gone simply stops. Handed out
/// as `Arc<DelayDomain>`; dropping the last `Arc` frees the per-CPU block
/// with it.
#[derive(Debug)]
pub struct DelayDomain {
    /// Per-CPU delay states in the domain
    cpus: Box<[DomainCpu]>,

    /// Cumulative time per coarse state awaiting rollover, µs
    pub(crate) times: [AtomicU64; NR_DOMAIN_STATES],

    /// Next rollover deadline, ns
    pub(crate) period_expires: AtomicU64,

    /// Decaying some-delay averages over the three windows, fixed point
    pub(crate) avg_some: [AtomicU64; decay::NR_WINDOWS],

    /// Decaying full-delay averages over the three windows, fixed point
    pub(crate) avg_full: [AtomicU64; decay::NR_WINDOWS],

    parent: Option<Weak<DelayDomain>>,
}

impl DelayDomain {
    /// Allocate a domain with one counter block per CPU
    ///
    /// All-or-nothing: either a fully initialized domain is returned or
    /// nothing was allocated.
    pub(crate) fn new(
        nr_cpus: usize,
        parent: Option<Weak<DelayDomain>>,
        now: u64,
    ) -> Result<Self, DelayError> {
        let mut cpus = Vec::new();
        cpus.try_reserve_exact(nr_cpus)
            .map_err(|_| DelayError::Allocation)?;
        for _ in 0..nr_cpus {
            cpus.push(DomainCpu::new(now));
        }
        Ok(Self {
            cpus: cpus.into_boxed_slice(),
            times: std::array::from_fn(|_| AtomicU64::new(0)),
            period_expires: AtomicU64::new(now + decay::SAMPLE_PERIOD_NS),
            avg_some: std::array::from_fn(|_| AtomicU64::new(0)),
            avg_full: std::array::from_fn(|_| AtomicU64::new(0)),
            parent,
        })
    }

    /// Number of CPUs this domain tracks
    pub fn nr_cpus(&self) -> usize {
        self.cpus.len()
    }

    /// Per-CPU counter block
    ///
    /// # Panics
    ///
    /// Panics if `cpu` is out of range for this domain.
    pub fn cpu(&self, cpu: usize) -> &DomainCpu {
        &self.cpus[cpu]
    }

    /// Parent domain, if it is still alive
    pub fn parent(&self) -> Option<Arc<DelayDomain>> {
        self.parent.as_ref()?.upgrade()
    }

    /// Whether this is the terminal ancestor
    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }

    /// Delay totals summed over all CPUs: (direct, background), µs
    pub fn aggregate_us(&self) -> (u64, u64) {
        let mut direct = 0;
        let mut background = 0;
        for dc in self.cpus.iter() {
            direct += dc.direct_us();
            background += dc.background_us();
        }
        (direct, background)
    }

    /// Cumulative per-state dwell time not yet folded by a rollover, µs
    pub fn pending_times_us(&self) -> [u64; NR_DOMAIN_STATES] {
        std::array::from_fn(|i| self.times[i].load(Ordering::Relaxed))
    }

    pub(crate) fn add_delay(&self, cpu: usize, us: u64, direct: bool) {
        let dc = &self.cpus[cpu];
        if direct {
            dc.direct_us.fetch_add(us, Ordering::Relaxed);
        } else {
            dc.background_us.fetch_add(us, Ordering::Relaxed);
        }
    }

    /// Summarize one CPU's task counts into a coarse state.
    ///
    /// The domain is somewhat delayed when tasks are delayed but others are
    /// still running the workload, and fully delayed when all non-idle tasks
    /// on the CPU are delayed or a delayed task is itself occupying the CPU.
    /// An I/O-waiting task is not productive, but its presence softens a
    /// `Full` classification to `Some` in both branches.
    fn derive_state(dc: &DomainCpu) -> DomainState {
        let count = |s: TaskState| dc.task_count(s);

        if count(TaskState::DelayedActive) > 0 {
            if count(TaskState::Iowait) > 0 {
                DomainState::Some
            } else {
                DomainState::Full
            }
        } else if count(TaskState::Delayed) > 0 {
            if count(TaskState::Runnable) > 0 || count(TaskState::Iowait) > 0 {
                DomainState::Some
            } else {
                DomainState::Full
            }
        } else {
            DomainState::None
        }
    }

    /// Apply one task transition to this domain's counters on `cpu`.
    ///
    /// Caller must hold the CPU's run-queue lock. Returns true when the old
    /// state's counter was already zero, which means task bookkeeping and
    /// domain bookkeeping have diverged; the caller decides how loudly to
    /// complain. Dwell time is charged to the state that was active for the
    /// elapsed interval, not the state being entered.
    pub(crate) fn cpu_update(
        &self,
        cpu: usize,
        old: TaskState,
        new: TaskState,
        now: u64,
    ) -> bool {
        let dc = &self.cpus[cpu];
        let mut underflow = false;

        if old != TaskState::None {
            let slot = &dc.tasks[old as usize];
            let cur = slot.load(Ordering::Relaxed);
            if cur == 0 {
                underflow = true;
            } else {
                slot.store(cur - 1, Ordering::Relaxed);
            }
        }
        if new != TaskState::None {
            let slot = &dc.tasks[new as usize];
            slot.store(slot.load(Ordering::Relaxed) + 1, Ordering::Relaxed);
        }

        let state = Self::derive_state(dc);
        let prev = dc.state();
        if prev == state {
            return underflow;
        }

        let delta_us = now.saturating_sub(dc.state_start.load(Ordering::Relaxed)) / NSEC_PER_USEC;

        decay::maybe_rollover(self, now);
        self.times[prev as usize].fetch_add(delta_us, Ordering::Relaxed);

        dc.state.store(state as u8, Ordering::Relaxed);
        dc.state_start.store(now, Ordering::Relaxed);

        underflow
    }
}
