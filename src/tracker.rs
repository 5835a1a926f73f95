//! The process-wide delay tracking context and its scheduler hook surface
//!
//! [`DelayTracker`] is the explicit context object everything hangs off: the
//! clock, the per-CPU run-queue locks, the always-present root domain, the
//! global tracking mode and the diagnostics toggle. There are no ambient
//! globals; construct one tracker before scheduling begins and keep it alive
//! for as long as tasks reference it.
//!
//! The scheduler collaborator drives the engine through a small set of
//! hooks, each of which takes the run-queue lock of the task's current CPU
//! so that the accounted transition is atomic with scheduling decisions on
//! that CPU (a concurrent migration or context switch cannot interleave):
//!
//! - [`wakeup`](DelayTracker::wakeup) / [`sleep`](DelayTracker::sleep) for
//!   the sleep edges (these maintain queue membership themselves),
//! - [`enqueue`](DelayTracker::enqueue) / [`dequeue`](DelayTracker::dequeue)
//!   for explicit queue add/remove of fresh or fully dequeued tasks,
//! - [`migrate`](DelayTracker::migrate) for run-queue movement, which
//!   unqueues and requeues around an unchanged delay status,
//! - [`context_switch`](DelayTracker::context_switch) for the switch path,
//! - [`begin_delay`](DelayTracker::begin_delay) /
//!   [`end_delay`](DelayTracker::end_delay) (or the RAII
//!   [`delay_section`](DelayTracker::delay_section)) for memory-delay
//!   sections,
//! - [`move_to_domain`](DelayTracker::move_to_domain) when the containment
//!   hierarchy moves a task between domains.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, warn};

use crate::clock::{Clock, MonotonicClock, NSEC_PER_USEC};
use crate::control::TrackingMode;
use crate::domain::DelayDomain;
use crate::error::DelayError;
use crate::task::{DelayTask, TaskState, LATCH_CLEAR};

/// Process-wide delay accounting context
///
/// # Concurrency
///
/// One run-queue `Mutex` per logical CPU serializes all transitions for
/// tasks on that CPU; per-CPU counters are single-writer under it. The
/// cumulative domain counters and the rollover deadline are shared atomics
/// and deliberately tolerate a narrow cross-CPU race (see `decay`).
///
/// # Lifetime
///
/// The tracker must outlive any in-flight hook call; domain destruction is
/// by `Arc` release and an ancestor walk that meets a dead parent stops.
#[derive(Debug)]
pub struct DelayTracker {
    clock: Arc<dyn Clock>,
    nr_cpus: usize,
    rq: Box<[Mutex<()>]>,
    root: Arc<DelayDomain>,
    mode: AtomicU8,
    diagnostics: AtomicBool,
    state_warned: AtomicBool,
    counter_warned: AtomicBool,
    next_task_id: AtomicU64,
}

impl DelayTracker {
    /// Create a tracker for `nr_cpus` logical CPUs with the production clock
    ///
    /// Tracking starts in [`TrackingMode::Hierarchical`]; diagnostics follow
    /// `debug_assertions` and can be toggled at runtime with
    /// [`set_diagnostics`](Self::set_diagnostics).
    pub fn new(nr_cpus: usize) -> Result<Self, DelayError> {
        Self::with_clock(nr_cpus, Arc::new(MonotonicClock::new()))
    }

    /// Create a tracker with an injected clock (tests use `ManualClock`)
    pub fn with_clock(nr_cpus: usize, clock: Arc<dyn Clock>) -> Result<Self, DelayError> {
        let now = clock.now_ns();
        let root = Arc::new(DelayDomain::new(nr_cpus, None, now)?);
        let rq = (0..nr_cpus).map(|_| Mutex::new(())).collect::<Vec<_>>();
        Ok(Self {
            clock,
            nr_cpus,
            rq: rq.into_boxed_slice(),
            root,
            mode: AtomicU8::new(TrackingMode::Hierarchical as u8),
            diagnostics: AtomicBool::new(cfg!(debug_assertions)),
            state_warned: AtomicBool::new(false),
            counter_warned: AtomicBool::new(false),
            next_task_id: AtomicU64::new(1),
        })
    }

    /// Number of logical CPUs covered by this tracker
    pub fn nr_cpus(&self) -> usize {
        self.nr_cpus
    }

    /// The root domain: terminal ancestor of every propagation walk
    pub fn root(&self) -> &Arc<DelayDomain> {
        &self.root
    }

    /// Current time on the tracker's clock, ns
    pub(crate) fn now_ns(&self) -> u64 {
        self.clock.now_ns()
    }

    /// Current global tracking mode
    pub fn mode(&self) -> TrackingMode {
        TrackingMode::from_u8(self.mode.load(Ordering::Relaxed))
    }

    /// Set the global tracking mode
    ///
    /// Takes effect lazily: tasks already latched keep their mode until they
    /// return to the base state.
    pub fn set_mode(&self, mode: TrackingMode) {
        self.mode.store(mode as u8, Ordering::Relaxed);
    }

    /// Apply a single-character control directive (`0`, `1` or `2`)
    ///
    /// Malformed input is rejected and the previous mode stays in effect.
    pub fn apply_control(&self, input: &str) -> Result<TrackingMode, DelayError> {
        let mode = TrackingMode::parse(input)?;
        self.set_mode(mode);
        debug!(?mode, "tracking mode set");
        Ok(mode)
    }

    /// Toggle the consistency diagnostics at runtime
    pub fn set_diagnostics(&self, enabled: bool) {
        self.diagnostics.store(enabled, Ordering::Relaxed);
    }

    pub(crate) fn diagnostics(&self) -> bool {
        self.diagnostics.load(Ordering::Relaxed)
    }

    /// Allocate a domain below `parent`
    ///
    /// For the containment-hierarchy collaborator. The child holds only a
    /// weak back-reference; dropping every `Arc` to a domain frees it, and
    /// walks through it afterwards terminate early.
    pub fn new_domain(&self, parent: &Arc<DelayDomain>) -> Result<Arc<DelayDomain>, DelayError> {
        let domain = DelayDomain::new(
            self.nr_cpus,
            Some(Arc::downgrade(parent)),
            self.now_ns(),
        )?;
        debug!(nr_cpus = self.nr_cpus, "allocated delay domain");
        Ok(Arc::new(domain))
    }

    /// Register a new task on `cpu`, belonging to `domain`
    ///
    /// Tasks are created idle (state `None`) and accrue nothing until their
    /// first transition.
    pub fn register_task(
        &self,
        cpu: usize,
        domain: &Arc<DelayDomain>,
    ) -> Result<Arc<DelayTask>, DelayError> {
        if cpu >= self.nr_cpus {
            return Err(DelayError::UnknownCpu {
                cpu,
                nr_cpus: self.nr_cpus,
            });
        }
        let id = self.next_task_id.fetch_add(1, Ordering::Relaxed);
        Ok(Arc::new(DelayTask::new(id, cpu, Arc::clone(domain))))
    }

    /// Note a sleeping task becoming runnable
    ///
    /// Routes through `Iowait` or `None` depending on what the task was
    /// sleeping on, and queues it. Delayed tasks remain delayed even when
    /// they become runnable; only their queue membership is refreshed.
    pub fn wakeup(&self, task: &DelayTask) {
        let _rq = self.lock_cpu(task.cpu());
        if task.in_delay() {
            task.set_queued(true);
            task.set_in_iowait(false);
            return;
        }
        task.set_queued(true);
        if task.in_iowait() {
            task.set_in_iowait(false);
            self.task_change(task, TaskState::Iowait, TaskState::Runnable);
        } else {
            self.task_change(task, TaskState::None, TaskState::Runnable);
        }
    }

    /// Note a runnable task going to sleep
    ///
    /// `iowait` says whether the sleep is an I/O wait, which keeps the task
    /// visible to the coarse-state classification. Delayed tasks remain
    /// delayed; only their flags are refreshed.
    pub fn sleep(&self, task: &DelayTask, iowait: bool) {
        let _rq = self.lock_cpu(task.cpu());
        task.set_queued(false);
        if task.in_delay() {
            task.set_in_iowait(iowait);
            return;
        }
        task.set_in_iowait(iowait);
        if iowait {
            self.task_change(task, TaskState::Runnable, TaskState::Iowait);
        } else {
            self.task_change(task, TaskState::Runnable, TaskState::None);
        }
    }

    /// Add a fresh or fully dequeued task to run-queue bookkeeping
    pub fn enqueue(&self, task: &DelayTask) {
        let _rq = self.lock_cpu(task.cpu());
        task.set_queued(true);
        let state = task.queue_state();
        if state != TaskState::None {
            self.task_change(task, TaskState::None, state);
        }
    }

    /// Remove a task from scheduling entirely, without blocking it
    pub fn dequeue(&self, task: &DelayTask) {
        let _rq = self.lock_cpu(task.cpu());
        let state = task.queue_state();
        // Clear membership first so a task that lands back in the base
        // state also releases its latched mode.
        task.set_queued(false);
        if state != TaskState::None {
            self.task_change(task, state, TaskState::None);
        }
    }

    /// Move a task to another CPU's run queue
    ///
    /// Queue movement is represented as unqueue-then-requeue around an
    /// unchanged productivity classification: delay status never changes
    /// because a task changed CPUs, and an interrupted delay interval is
    /// closed against the old CPU and reopened on the new one, so totals
    /// are preserved.
    pub fn migrate(&self, task: &DelayTask, new_cpu: usize) -> Result<(), DelayError> {
        if new_cpu >= self.nr_cpus {
            return Err(DelayError::UnknownCpu {
                cpu: new_cpu,
                nr_cpus: self.nr_cpus,
            });
        }
        {
            let _rq = self.lock_cpu(task.cpu());
            let state = task.queue_state();
            if state != TaskState::None {
                self.task_change(task, state, TaskState::None);
            }
        }
        {
            let _rq = self.lock_cpu(new_cpu);
            task.set_cpu(new_cpu);
            let state = task.queue_state();
            if state != TaskState::None {
                self.task_change(task, TaskState::None, state);
            }
        }
        Ok(())
    }

    /// Note a context switch on `cpu`
    ///
    /// A switch does not change the balance between delayed and productive
    /// tasks, only whether a delay is actively occupying the CPU: a delayed
    /// task switching out goes `DelayedActive -> Delayed`, one switching in
    /// goes `Delayed -> DelayedActive`. `None` stands for the idle task.
    pub fn context_switch(
        &self,
        cpu: usize,
        prev: Option<&DelayTask>,
        next: Option<&DelayTask>,
    ) {
        let _rq = self.lock_cpu(cpu);
        if let Some(prev) = prev {
            prev.set_on_cpu(false);
            if prev.in_delay() {
                self.task_change(prev, TaskState::DelayedActive, TaskState::Delayed);
            }
        }
        if let Some(next) = next {
            next.set_on_cpu(true);
            if next.in_delay() {
                self.task_change(next, TaskState::Delayed, TaskState::DelayedActive);
            }
        }
    }

    /// Mark the beginning of a memory-delay section for a running task
    ///
    /// Returns true when the task was already inside a delay section; pass
    /// the value back to [`end_delay`](Self::end_delay) so nested sections
    /// are no-ops, or use [`delay_section`](Self::delay_section) and let the
    /// guard handle both ends. `direct` attributes the coming interval to
    /// foreground work rather than background work done on the task's
    /// behalf.
    pub fn begin_delay(&self, task: &DelayTask, direct: bool) -> bool {
        let _rq = self.lock_cpu(task.cpu());
        if task.in_delay() {
            return true;
        }
        task.set_in_delay(true);
        task.set_is_direct(direct);
        self.task_change(task, TaskState::Runnable, TaskState::DelayedActive);
        false
    }

    /// Mark the end of a memory-delay section
    ///
    /// `nested` is the value the matching [`begin_delay`](Self::begin_delay)
    /// returned.
    pub fn end_delay(&self, task: &DelayTask, nested: bool) {
        if nested {
            return;
        }
        let _rq = self.lock_cpu(task.cpu());
        task.set_in_delay(false);
        self.task_change(task, TaskState::DelayedActive, TaskState::Runnable);
    }

    /// RAII wrapper around a delay section
    ///
    /// # Example
    ///
    /// ```
    /// use demora::tracker::DelayTracker;
    ///
    /// let tracker = DelayTracker::new(1).unwrap();
    /// let task = tracker.register_task(0, tracker.root()).unwrap();
    /// tracker.enqueue(&task);
    /// {
    ///     let _section = tracker.delay_section(&task, true);
    ///     // ... wait for a refault, run reclaim ...
    /// }
    /// ```
    pub fn delay_section<'a>(&'a self, task: &'a DelayTask, direct: bool) -> DelaySection<'a> {
        let nested = self.begin_delay(task, direct);
        DelaySection {
            tracker: self,
            task,
            nested,
        }
    }

    /// Move a task to a different containment domain
    ///
    /// Performed as a leave-as-X / enter-as-X pair under the task's
    /// run-queue lock so dwell time is neither double-counted nor lost: an
    /// open delay interval is closed against the old domain chain and
    /// reopened on the new one.
    pub fn move_to_domain(&self, task: &DelayTask, to: &Arc<DelayDomain>) {
        let _rq = self.lock_cpu(task.cpu());
        let state = task.queue_state();
        self.task_change(task, state, TaskState::None);
        task.set_domain(Arc::clone(to));
        self.task_change(task, TaskState::None, state);
    }

    fn lock_cpu(&self, cpu: usize) -> MutexGuard<'_, ()> {
        self.rq[cpu].lock().expect("run-queue lock poisoned")
    }

    /// Core transition: task bookkeeping plus the domain propagation walk.
    ///
    /// Caller holds the run-queue lock for the task's CPU.
    fn task_change(&self, task: &DelayTask, old: TaskState, new: TaskState) {
        let cpu = task.cpu();
        let now = self.now_ns();

        // First transition of an unlatched task adopts the global mode; it
        // stays fixed until the task returns to the base state below.
        let mut latch = task.latch();
        if latch == LATCH_CLEAR {
            latch = self.mode.load(Ordering::Relaxed);
            task.set_latch(latch);
        }
        let mode = TrackingMode::from_u8(latch);

        if self.diagnostics() {
            let recorded = task.state();
            if recorded != old && !self.state_warned.swap(true, Ordering::Relaxed) {
                warn!(
                    cpu,
                    task = task.id(),
                    recorded = ?recorded,
                    expected = ?old,
                    new = ?new,
                    "task state diverged from accounting; trusting the caller"
                );
            }
        }
        task.set_recorded(new);

        if new == TaskState::None
            && !task.in_delay()
            && !task.queued()
            && !task.in_iowait()
        {
            task.set_latch(LATCH_CLEAR);
        }

        if !mode.is_enabled() {
            return;
        }

        // Crossing the delay boundary opens or closes a wall-clock interval.
        let mut delay_us = 0;
        if !old.is_delayed() && new.is_delayed() {
            task.set_delay_start(now);
        } else if old.is_delayed() && !new.is_delayed() {
            delay_us = now.saturating_sub(task.delay_start()) / NSEC_PER_USEC;
            task.add_delay(delay_us, task.is_direct());
        }

        // Update the task's domain and, in hierarchical mode, every ancestor
        // still alive. The closed delay interval is forwarded to each domain
        // in the chain.
        let mut domain = task.domain();
        loop {
            if delay_us > 0 {
                domain.add_delay(cpu, delay_us, task.is_direct());
            }
            let underflow = domain.cpu_update(cpu, old, new, now);
            if underflow
                && self.diagnostics()
                && !self.counter_warned.swap(true, Ordering::Relaxed)
            {
                warn!(
                    cpu,
                    task = task.id(),
                    old = ?old,
                    new = ?new,
                    "domain task counter underflow; accounting diverged"
                );
            }
            if !mode.is_hierarchical() {
                break;
            }
            match domain.parent() {
                Some(parent) => domain = parent,
                None => break,
            }
        }
    }
}

/// Guard returned by [`DelayTracker::delay_section`]
///
/// Ends the delay section on drop; nested guards are no-ops end to end.
#[derive(Debug)]
pub struct DelaySection<'a> {
    tracker: &'a DelayTracker,
    task: &'a DelayTask,
    nested: bool,
}

impl Drop for DelaySection<'_> {
    fn drop(&mut self) {
        self.tracker.end_delay(self.task, self.nested);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::domain::DomainState;

    fn tracker_with_clock() -> (DelayTracker, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new());
        let tracker = DelayTracker::with_clock(2, Arc::clone(&clock) as Arc<dyn Clock>).unwrap();
        (tracker, clock)
    }

    #[test]
    fn test_single_task_direct_delay_interval() {
        let (tracker, clock) = tracker_with_clock();
        let task = tracker.register_task(0, tracker.root()).unwrap();

        tracker.enqueue(&task);
        let nested = tracker.begin_delay(&task, true);
        assert!(!nested);
        clock.advance_us(1_000);
        tracker.end_delay(&task, nested);

        assert_eq!(task.direct_delay_us(), 1_000);
        assert_eq!(task.background_delay_us(), 0);
        assert_eq!(tracker.root().aggregate_us(), (1_000, 0));
        // FULL held for the whole 1000µs.
        assert_eq!(
            tracker.root().pending_times_us()[DomainState::Full as usize],
            1_000
        );
    }

    #[test]
    fn test_background_delay_attribution() {
        let (tracker, clock) = tracker_with_clock();
        let task = tracker.register_task(0, tracker.root()).unwrap();

        tracker.enqueue(&task);
        let nested = tracker.begin_delay(&task, false);
        clock.advance_us(250);
        tracker.end_delay(&task, nested);

        assert_eq!(task.direct_delay_us(), 0);
        assert_eq!(task.background_delay_us(), 250);
        assert_eq!(tracker.root().aggregate_us(), (0, 250));
    }

    #[test]
    fn test_nested_delay_sections_are_noops() {
        let (tracker, clock) = tracker_with_clock();
        let task = tracker.register_task(0, tracker.root()).unwrap();

        tracker.enqueue(&task);
        let outer = tracker.begin_delay(&task, true);
        clock.advance_us(100);
        let inner = tracker.begin_delay(&task, true);
        assert!(inner);
        clock.advance_us(100);
        tracker.end_delay(&task, inner);
        clock.advance_us(100);
        tracker.end_delay(&task, outer);

        // One section of 300µs, not three fragments.
        assert_eq!(task.direct_delay_us(), 300);
    }

    #[test]
    fn test_delay_survives_context_switch() {
        let (tracker, clock) = tracker_with_clock();
        let a = tracker.register_task(0, tracker.root()).unwrap();
        let b = tracker.register_task(0, tracker.root()).unwrap();

        tracker.enqueue(&a);
        tracker.enqueue(&b);
        tracker.context_switch(0, None, Some(&a));

        let nested = tracker.begin_delay(&a, true);
        clock.advance_us(400);
        // a blocks inside the section; b runs.
        tracker.context_switch(0, Some(&a), Some(&b));
        assert_eq!(a.state(), TaskState::Delayed);
        clock.advance_us(200);
        tracker.context_switch(0, Some(&b), Some(&a));
        assert_eq!(a.state(), TaskState::DelayedActive);
        clock.advance_us(400);
        tracker.end_delay(&a, nested);

        // The whole span counts, switched out or not.
        assert_eq!(a.direct_delay_us(), 1_000);
    }

    #[test]
    fn test_migration_preserves_delay_totals() {
        let (tracker, clock) = tracker_with_clock();
        let task = tracker.register_task(0, tracker.root()).unwrap();

        tracker.enqueue(&task);
        tracker.context_switch(0, None, Some(&task));
        let nested = tracker.begin_delay(&task, true);
        clock.advance_us(600);
        tracker.context_switch(0, Some(&task), None);
        tracker.migrate(&task, 1).unwrap();
        clock.advance_us(400);
        tracker.context_switch(1, None, Some(&task));
        tracker.end_delay(&task, nested);

        assert_eq!(task.cpu(), 1);
        assert_eq!(task.direct_delay_us(), 1_000);
        // The first 600µs landed on cpu 0, the rest on cpu 1.
        let (direct0, _) = (
            tracker.root().cpu(0).direct_us(),
            tracker.root().cpu(0).background_us(),
        );
        let direct1 = tracker.root().cpu(1).direct_us();
        assert_eq!(direct0, 600);
        assert_eq!(direct1, 400);
    }

    #[test]
    fn test_disabled_mode_latches_and_counts_nothing() {
        let (tracker, clock) = tracker_with_clock();
        tracker.set_mode(TrackingMode::Disabled);
        let task = tracker.register_task(0, tracker.root()).unwrap();

        tracker.enqueue(&task);
        let nested = tracker.begin_delay(&task, true);
        clock.advance_us(1_000);
        tracker.end_delay(&task, nested);
        tracker.dequeue(&task);

        assert_eq!(task.total_delay_us(), 0);
        assert_eq!(tracker.root().aggregate_us(), (0, 0));
        assert_eq!(tracker.root().pending_times_us(), [0, 0, 0]);
    }

    #[test]
    fn test_mode_flip_does_not_affect_latched_task() {
        let (tracker, clock) = tracker_with_clock();
        let task = tracker.register_task(0, tracker.root()).unwrap();

        tracker.enqueue(&task); // latches Hierarchical
        tracker.set_mode(TrackingMode::Disabled);

        let nested = tracker.begin_delay(&task, true);
        clock.advance_us(500);
        tracker.end_delay(&task, nested);

        // Still accounted under the latched mode.
        assert_eq!(task.direct_delay_us(), 500);

        // Return to base, come back: now the flip applies.
        tracker.sleep(&task, false);
        tracker.wakeup(&task);
        let nested = tracker.begin_delay(&task, true);
        clock.advance_us(500);
        tracker.end_delay(&task, nested);
        assert_eq!(task.direct_delay_us(), 500);
    }

    #[test]
    fn test_divergent_old_state_is_tolerated() {
        let (tracker, _clock) = tracker_with_clock();
        let task = tracker.register_task(0, tracker.root()).unwrap();

        // Caller reports a sleep for a task that was never runnable: the
        // supplied state wins, the underflowing counter clamps at zero and
        // the engine keeps going.
        tracker.sleep(&task, false);
        tracker.enqueue(&task);
        assert_eq!(task.state(), TaskState::Runnable);
        assert_eq!(tracker.root().cpu(0).task_count(TaskState::Runnable), 1);
    }

    #[test]
    fn test_register_task_rejects_bad_cpu() {
        let (tracker, _clock) = tracker_with_clock();
        assert!(matches!(
            tracker.register_task(7, tracker.root()),
            Err(DelayError::UnknownCpu { cpu: 7, nr_cpus: 2 })
        ));
    }

    #[test]
    fn test_delay_section_guard_ends_on_drop() {
        let (tracker, clock) = tracker_with_clock();
        let task = tracker.register_task(0, tracker.root()).unwrap();
        tracker.enqueue(&task);
        {
            let _section = tracker.delay_section(&task, true);
            clock.advance_us(123);
        }
        assert_eq!(task.direct_delay_us(), 123);
        assert_eq!(task.state(), TaskState::Runnable);
    }
}
