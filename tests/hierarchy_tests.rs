//! Ancestor propagation and domain lifetime integration tests

use std::sync::Arc;

use demora::clock::{Clock, ManualClock};
use demora::control::TrackingMode;
use demora::task::TaskState;
use demora::tracker::DelayTracker;

fn tracker(nr_cpus: usize) -> (DelayTracker, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::new());
    let tracker = DelayTracker::with_clock(nr_cpus, Arc::clone(&clock) as Arc<dyn Clock>)
        .expect("tracker construction");
    (tracker, clock)
}

#[test]
fn hierarchical_transition_updates_child_and_root() {
    let (tracker, _clock) = tracker(1);
    let child = tracker.new_domain(tracker.root()).unwrap();
    let task = tracker.register_task(0, &child).unwrap();

    tracker.enqueue(&task);

    assert_eq!(child.cpu(0).task_count(TaskState::Runnable), 1);
    assert_eq!(tracker.root().cpu(0).task_count(TaskState::Runnable), 1);
}

#[test]
fn local_mode_stops_at_the_immediate_domain() {
    let (tracker, _clock) = tracker(1);
    tracker.set_mode(TrackingMode::Local);
    let child = tracker.new_domain(tracker.root()).unwrap();
    let task = tracker.register_task(0, &child).unwrap();

    tracker.enqueue(&task);

    assert_eq!(child.cpu(0).task_count(TaskState::Runnable), 1);
    assert_eq!(tracker.root().cpu(0).task_count(TaskState::Runnable), 0);
}

#[test]
fn delay_interval_lands_on_every_ancestor() {
    let (tracker, clock) = tracker(1);
    let mid = tracker.new_domain(tracker.root()).unwrap();
    let leaf = tracker.new_domain(&mid).unwrap();
    let task = tracker.register_task(0, &leaf).unwrap();

    tracker.enqueue(&task);
    let nested = tracker.begin_delay(&task, true);
    clock.advance_us(640);
    tracker.end_delay(&task, nested);

    assert_eq!(leaf.aggregate_us(), (640, 0));
    assert_eq!(mid.aggregate_us(), (640, 0));
    assert_eq!(tracker.root().aggregate_us(), (640, 0));
}

#[test]
fn walk_stops_when_an_ancestor_is_gone() {
    let (tracker, _clock) = tracker(1);
    let mid = tracker.new_domain(tracker.root()).unwrap();
    let leaf = tracker.new_domain(&mid).unwrap();
    let task = tracker.register_task(0, &leaf).unwrap();

    // The hierarchy collaborator destroys the middle domain while the leaf
    // lives on; the walk must terminate at the break instead of reaching
    // the root.
    drop(mid);

    tracker.enqueue(&task);

    assert_eq!(leaf.cpu(0).task_count(TaskState::Runnable), 1);
    assert_eq!(tracker.root().cpu(0).task_count(TaskState::Runnable), 0);
}

#[test]
fn move_between_domains_transfers_the_counters() {
    let (tracker, _clock) = tracker(1);
    let from = tracker.new_domain(tracker.root()).unwrap();
    let to = tracker.new_domain(tracker.root()).unwrap();
    let task = tracker.register_task(0, &from).unwrap();

    tracker.enqueue(&task);
    assert_eq!(from.cpu(0).task_count(TaskState::Runnable), 1);

    tracker.move_to_domain(&task, &to);

    assert_eq!(from.cpu(0).task_count(TaskState::Runnable), 0);
    assert_eq!(to.cpu(0).task_count(TaskState::Runnable), 1);
    // Root saw a leave and an enter; net unchanged.
    assert_eq!(tracker.root().cpu(0).task_count(TaskState::Runnable), 1);
}

#[test]
fn move_during_delay_splits_the_interval() {
    let (tracker, clock) = tracker(1);
    let from = tracker.new_domain(tracker.root()).unwrap();
    let to = tracker.new_domain(tracker.root()).unwrap();
    let task = tracker.register_task(0, &from).unwrap();

    tracker.enqueue(&task);
    tracker.context_switch(0, None, Some(&task));
    let nested = tracker.begin_delay(&task, true);
    clock.advance_us(300);

    // The containment hierarchy moves the task mid-delay: the 300µs so far
    // close against the old chain, the rest accrues on the new one.
    tracker.move_to_domain(&task, &to);
    assert_eq!(task.state(), TaskState::DelayedActive);
    clock.advance_us(700);
    tracker.end_delay(&task, nested);

    assert_eq!(from.aggregate_us(), (300, 0));
    assert_eq!(to.aggregate_us(), (700, 0));
    // The root saw both halves; the task's own total is intact.
    assert_eq!(tracker.root().aggregate_us(), (1_000, 0));
    assert_eq!(task.direct_delay_us(), 1_000);
}

#[test]
fn disabled_task_updates_nothing_anywhere() {
    let (tracker, clock) = tracker(1);
    tracker.set_mode(TrackingMode::Disabled);
    let child = tracker.new_domain(tracker.root()).unwrap();
    let task = tracker.register_task(0, &child).unwrap();

    tracker.enqueue(&task);
    let nested = tracker.begin_delay(&task, true);
    clock.advance_us(1_000);
    tracker.end_delay(&task, nested);

    assert_eq!(child.cpu(0).task_count(TaskState::Runnable), 0);
    assert_eq!(child.aggregate_us(), (0, 0));
    assert_eq!(tracker.root().aggregate_us(), (0, 0));
    assert_eq!(task.total_delay_us(), 0);
}
