//! Per-task productivity state and delay bookkeeping
//!
//! Each schedulable unit of work carries a [`DelayTask`] record: the unit of
//! observation for the whole engine. The record remembers which of the five
//! productivity states the task was last seen in, when its current delay
//! period began, how much delay it has accrued (split into direct and
//! background time), and which tracking mode it latched when it first left
//! the base state.
//!
//! All fields are plain atomics. They are only ever written while the
//! tracker holds the run-queue lock of the task's current CPU, which makes
//! every field single-writer; `Relaxed` ordering is therefore sufficient
//! throughout. Readers outside the lock (reports, tests) observe totals that
//! are at worst one transition stale.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

use crate::domain::DelayDomain;

/// Sentinel for "no tracking mode latched yet"
pub(crate) const LATCH_CLEAR: u8 = u8::MAX;

/// Productivity state of a single task
///
/// Exactly one state holds at any instant. The discriminants are ordered so
/// that the memory-delay boundary is a single comparison: a task is delayed
/// iff its state is at or above [`TaskState::Delayed`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum TaskState {
    /// Idle, unqueued, untracked
    None = 0,
    /// Waiting for I/O completion, not memory delayed
    Iowait = 1,
    /// On a run queue, not memory delayed
    Runnable = 2,
    /// Memory delayed, not currently executing
    Delayed = 3,
    /// Memory delayed and actively executing on a CPU
    DelayedActive = 4,
}

/// Number of task productivity states
pub const NR_TASK_STATES: usize = 5;

impl TaskState {
    /// Whether this state is on the delayed side of the boundary
    pub fn is_delayed(self) -> bool {
        self >= TaskState::Delayed
    }

    pub(crate) fn from_u8(raw: u8) -> Self {
        match raw {
            0 => TaskState::None,
            1 => TaskState::Iowait,
            2 => TaskState::Runnable,
            3 => TaskState::Delayed,
            _ => TaskState::DelayedActive,
        }
    }

    /// All states, in discriminant order
    pub const ALL: [TaskState; NR_TASK_STATES] = [
        TaskState::None,
        TaskState::Iowait,
        TaskState::Runnable,
        TaskState::Delayed,
        TaskState::DelayedActive,
    ];
}

/// Per-task delay accounting record
///
/// Created through `DelayTracker::register_task` and handed back to the
/// scheduler collaborator as an `Arc`; the tracker never outlives its tasks'
/// usefulness since every hook takes the task by reference.
#[derive(Debug)]
pub struct DelayTask {
    id: u64,

    /// Logical CPU the task is currently assigned to
    cpu: AtomicUsize,

    /// Last state recorded by a transition; consistency diagnostic only
    recorded: AtomicU8,

    /// Inside a memory-delay section (survives sleeps and migrations)
    in_delay: AtomicBool,

    /// Whether the current delay section is direct (foreground) work
    is_direct: AtomicBool,

    /// Blocked waiting for I/O
    in_iowait: AtomicBool,

    /// Present on a run queue
    queued: AtomicBool,

    /// Currently executing on its CPU
    on_cpu: AtomicBool,

    /// When the current delay period began, ns
    delay_start: AtomicU64,

    /// Accrued direct delay, µs
    direct_us: AtomicU64,

    /// Accrued background delay, µs
    background_us: AtomicU64,

    /// Tracking mode latched at the first transition out of the base state;
    /// `LATCH_CLEAR` while the task sits idle and unlatched
    latch: AtomicU8,

    /// Containment domain the task currently belongs to
    domain: RwLock<Arc<DelayDomain>>,
}

impl DelayTask {
    pub(crate) fn new(id: u64, cpu: usize, domain: Arc<DelayDomain>) -> Self {
        Self {
            id,
            cpu: AtomicUsize::new(cpu),
            recorded: AtomicU8::new(TaskState::None as u8),
            in_delay: AtomicBool::new(false),
            is_direct: AtomicBool::new(false),
            in_iowait: AtomicBool::new(false),
            queued: AtomicBool::new(false),
            on_cpu: AtomicBool::new(false),
            delay_start: AtomicU64::new(0),
            direct_us: AtomicU64::new(0),
            background_us: AtomicU64::new(0),
            latch: AtomicU8::new(LATCH_CLEAR),
            domain: RwLock::new(domain),
        }
    }

    /// Stable task identifier (diagnostics and tests)
    pub fn id(&self) -> u64 {
        self.id
    }

    /// CPU the task is currently assigned to
    pub fn cpu(&self) -> usize {
        self.cpu.load(Ordering::Relaxed)
    }

    pub(crate) fn set_cpu(&self, cpu: usize) {
        self.cpu.store(cpu, Ordering::Relaxed);
    }

    /// State last recorded for this task
    pub fn state(&self) -> TaskState {
        TaskState::from_u8(self.recorded.load(Ordering::Relaxed))
    }

    pub(crate) fn set_recorded(&self, state: TaskState) {
        self.recorded.store(state as u8, Ordering::Relaxed);
    }

    /// Whether the task is inside a memory-delay section
    pub fn in_delay(&self) -> bool {
        self.in_delay.load(Ordering::Relaxed)
    }

    pub(crate) fn set_in_delay(&self, v: bool) {
        self.in_delay.store(v, Ordering::Relaxed);
    }

    pub(crate) fn is_direct(&self) -> bool {
        self.is_direct.load(Ordering::Relaxed)
    }

    pub(crate) fn set_is_direct(&self, v: bool) {
        self.is_direct.store(v, Ordering::Relaxed);
    }

    pub(crate) fn in_iowait(&self) -> bool {
        self.in_iowait.load(Ordering::Relaxed)
    }

    pub(crate) fn set_in_iowait(&self, v: bool) {
        self.in_iowait.store(v, Ordering::Relaxed);
    }

    pub(crate) fn queued(&self) -> bool {
        self.queued.load(Ordering::Relaxed)
    }

    pub(crate) fn set_queued(&self, v: bool) {
        self.queued.store(v, Ordering::Relaxed);
    }

    pub(crate) fn on_cpu(&self) -> bool {
        self.on_cpu.load(Ordering::Relaxed)
    }

    pub(crate) fn set_on_cpu(&self, v: bool) {
        self.on_cpu.store(v, Ordering::Relaxed);
    }

    pub(crate) fn delay_start(&self) -> u64 {
        self.delay_start.load(Ordering::Relaxed)
    }

    pub(crate) fn set_delay_start(&self, ns: u64) {
        self.delay_start.store(ns, Ordering::Relaxed);
    }

    /// Total direct (foreground) delay accrued, µs
    pub fn direct_delay_us(&self) -> u64 {
        self.direct_us.load(Ordering::Relaxed)
    }

    /// Total background delay accrued, µs
    pub fn background_delay_us(&self) -> u64 {
        self.background_us.load(Ordering::Relaxed)
    }

    /// Total delay accrued, µs
    pub fn total_delay_us(&self) -> u64 {
        self.direct_delay_us() + self.background_delay_us()
    }

    pub(crate) fn add_delay(&self, us: u64, direct: bool) {
        if direct {
            self.direct_us.fetch_add(us, Ordering::Relaxed);
        } else {
            self.background_us.fetch_add(us, Ordering::Relaxed);
        }
    }

    pub(crate) fn latch(&self) -> u8 {
        self.latch.load(Ordering::Relaxed)
    }

    pub(crate) fn set_latch(&self, raw: u8) {
        self.latch.store(raw, Ordering::Relaxed);
    }

    /// Domain the task currently belongs to
    pub fn domain(&self) -> Arc<DelayDomain> {
        self.domain.read().expect("domain lock poisoned").clone()
    }

    pub(crate) fn set_domain(&self, domain: Arc<DelayDomain>) {
        *self.domain.write().expect("domain lock poisoned") = domain;
    }

    /// Derive the state the task occupies in its queue bookkeeping
    ///
    /// This is the classification used when a task is detached from and
    /// re-attached to queue accounting (migration, domain moves): delayed
    /// tasks stay delayed regardless of queue membership, queued tasks are
    /// runnable, I/O sleepers are iowait, and anything else is already in
    /// the base state.
    pub(crate) fn queue_state(&self) -> TaskState {
        if self.in_delay() {
            if self.on_cpu() {
                TaskState::DelayedActive
            } else {
                TaskState::Delayed
            }
        } else if self.queued() {
            TaskState::Runnable
        } else if self.in_iowait() {
            TaskState::Iowait
        } else {
            TaskState::None
        }
    }
}
