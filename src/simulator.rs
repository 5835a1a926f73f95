//! Synthetic scheduler workload for exercising the engine end to end
//!
//! The simulator stands in for the scheduler and containment-hierarchy
//! collaborators: one driver thread per logical CPU context-switches a small
//! set of tasks, opens delay sections of random length, parks tasks in I/O
//! wait and bounces them between run queues, all against a shared
//! [`DelayTracker`]. Seeded, so a given configuration replays the same
//! transition sequence (wall-clock delay lengths still vary run to run).

use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::control::TrackingMode;
use crate::domain::DelayDomain;
use crate::error::DelayError;
use crate::task::DelayTask;
use crate::tracker::DelayTracker;

/// Simulator configuration with builder-style setters
///
/// # Example
///
/// ```
/// use demora::simulator::SimulatorConfig;
///
/// let config = SimulatorConfig::new()
///     .with_cpus(2)
///     .with_tasks_per_cpu(3)
///     .with_steps(100)
///     .with_seed(42);
/// assert_eq!(config.nr_cpus, 2);
/// ```
#[derive(Debug, Clone)]
pub struct SimulatorConfig {
    /// Logical CPUs to drive (one thread each)
    pub nr_cpus: usize,

    /// Tasks pinned to each CPU
    pub tasks_per_cpu: usize,

    /// Containment domains, root included; tasks are spread round-robin
    pub nr_domains: usize,

    /// Scheduling steps per CPU
    pub steps: u64,

    /// Probability a step opens a delay section
    pub delay_probability: f64,

    /// Probability a delay section is direct (foreground) work
    pub direct_probability: f64,

    /// Probability a step parks the task in I/O wait
    pub iowait_probability: f64,

    /// Probability a step bounces the task to another run queue
    pub migrate_probability: f64,

    /// RNG seed for the transition sequence
    pub seed: u64,

    /// Tracking mode applied before the workload starts
    pub mode: TrackingMode,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            nr_cpus: 4,
            tasks_per_cpu: 4,
            nr_domains: 2,
            steps: 1_000,
            delay_probability: 0.25,
            direct_probability: 0.7,
            iowait_probability: 0.1,
            migrate_probability: 0.05,
            seed: 0,
            mode: TrackingMode::Hierarchical,
        }
    }
}

impl SimulatorConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_cpus(mut self, nr_cpus: usize) -> Self {
        self.nr_cpus = nr_cpus;
        self
    }

    pub fn with_tasks_per_cpu(mut self, tasks: usize) -> Self {
        self.tasks_per_cpu = tasks;
        self
    }

    pub fn with_domains(mut self, nr_domains: usize) -> Self {
        self.nr_domains = nr_domains;
        self
    }

    pub fn with_steps(mut self, steps: u64) -> Self {
        self.steps = steps;
        self
    }

    pub fn with_delay_probability(mut self, p: f64) -> Self {
        self.delay_probability = p;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_mode(mut self, mode: TrackingMode) -> Self {
        self.mode = mode;
        self
    }
}

/// What a simulation run actually did
#[derive(Debug, Clone, Copy, Default, serde::Serialize)]
pub struct SimulationStats {
    pub steps: u64,
    pub delay_sections: u64,
    pub iowait_naps: u64,
    pub migrations: u64,
}

impl SimulationStats {
    fn merge(&mut self, other: SimulationStats) {
        self.steps += other.steps;
        self.delay_sections += other.delay_sections;
        self.iowait_naps += other.iowait_naps;
        self.migrations += other.migrations;
    }
}

/// Multi-threaded synthetic workload over a [`DelayTracker`]
#[derive(Debug)]
pub struct Simulator {
    config: SimulatorConfig,
    tracker: DelayTracker,
    domains: Vec<Arc<DelayDomain>>,
}

impl Simulator {
    /// Build the tracker and domain tree for `config`
    pub fn new(config: SimulatorConfig) -> Result<Self, DelayError> {
        let tracker = DelayTracker::new(config.nr_cpus)?;
        tracker.set_mode(config.mode);

        let mut domains = vec![Arc::clone(tracker.root())];
        for _ in 1..config.nr_domains.max(1) {
            domains.push(tracker.new_domain(tracker.root())?);
        }

        Ok(Self {
            config,
            tracker,
            domains,
        })
    }

    pub fn tracker(&self) -> &DelayTracker {
        &self.tracker
    }

    /// Root first, then the child domains in creation order
    pub fn domains(&self) -> &[Arc<DelayDomain>] {
        &self.domains
    }

    /// Drive the workload to completion, one thread per CPU
    pub fn run(&self) -> SimulationStats {
        let mut total = SimulationStats::default();
        crossbeam::thread::scope(|scope| {
            let handles: Vec<_> = (0..self.config.nr_cpus)
                .map(|cpu| scope.spawn(move |_| self.drive_cpu(cpu)))
                .collect();
            for handle in handles {
                total.merge(handle.join().expect("simulator CPU thread panicked"));
            }
        })
        .expect("simulator scope panicked");
        total
    }

    /// One CPU's scheduling loop
    fn drive_cpu(&self, cpu: usize) -> SimulationStats {
        let config = &self.config;
        let mut rng = StdRng::seed_from_u64(
            config.seed ^ (cpu as u64).wrapping_mul(0x9e37_79b9_7f4a_7c15),
        );
        let mut stats = SimulationStats::default();

        let tasks: Vec<Arc<DelayTask>> = (0..config.tasks_per_cpu)
            .map(|i| {
                let domain = &self.domains[i % self.domains.len()];
                let task = self
                    .tracker
                    .register_task(cpu, domain)
                    .expect("cpu index comes from the tracker's own range");
                self.tracker.enqueue(&task);
                task
            })
            .collect();

        if tasks.is_empty() {
            return stats;
        }

        let mut current: Option<usize> = None;

        for _ in 0..config.steps {
            stats.steps += 1;
            let idx = rng.gen_range(0..tasks.len());
            let task = &tasks[idx];

            if current != Some(idx) {
                let prev = current.map(|i| &*tasks[i]);
                self.tracker.context_switch(cpu, prev, Some(task));
                current = Some(idx);
            }

            if rng.gen_bool(config.delay_probability) {
                let direct = rng.gen_bool(config.direct_probability);
                let section = self.tracker.delay_section(task, direct);
                spin_for(Duration::from_micros(rng.gen_range(10..200)));
                drop(section);
                stats.delay_sections += 1;
            }

            if rng.gen_bool(config.iowait_probability) {
                self.tracker.context_switch(cpu, Some(task), None);
                current = None;
                self.tracker.sleep(task, true);
                stats.iowait_naps += 1;
                std::thread::sleep(Duration::from_micros(rng.gen_range(50..500)));
                self.tracker.wakeup(task);
            }

            if rng.gen_bool(config.migrate_probability) && config.nr_cpus > 1 {
                // Bounce through another run queue and come straight back,
                // keeping the task owned by this driver thread.
                if current == Some(idx) {
                    self.tracker.context_switch(cpu, Some(task), None);
                    current = None;
                }
                let other = (cpu + 1 + rng.gen_range(0..config.nr_cpus - 1)) % config.nr_cpus;
                self.tracker
                    .migrate(task, other)
                    .expect("other cpu within range");
                self.tracker
                    .migrate(task, cpu)
                    .expect("home cpu within range");
                stats.migrations += 1;
            }
        }

        if let Some(idx) = current {
            self.tracker.context_switch(cpu, Some(&tasks[idx]), None);
        }
        for task in &tasks {
            self.tracker.dequeue(task);
        }

        stats
    }
}

fn spin_for(duration: Duration) {
    let until = Instant::now() + duration;
    while Instant::now() < until {
        std::hint::spin_loop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_simulation_accrues_delay() {
        let config = SimulatorConfig::new()
            .with_cpus(2)
            .with_tasks_per_cpu(2)
            .with_domains(2)
            .with_steps(50)
            .with_delay_probability(1.0)
            .with_seed(7);
        let sim = Simulator::new(config).unwrap();
        let stats = sim.run();

        assert_eq!(stats.steps, 100);
        assert!(stats.delay_sections > 0);
        let (direct, background) = sim.tracker().root().aggregate_us();
        assert!(direct + background > 0);
    }

    #[test]
    fn test_disabled_simulation_accrues_nothing() {
        let config = SimulatorConfig::new()
            .with_cpus(1)
            .with_tasks_per_cpu(2)
            .with_steps(30)
            .with_delay_probability(1.0)
            .with_mode(TrackingMode::Disabled)
            .with_seed(7);
        let sim = Simulator::new(config).unwrap();
        sim.run();
        assert_eq!(sim.tracker().root().aggregate_us(), (0, 0));
    }

    #[test]
    fn test_all_cpus_idle_after_run() {
        let config = SimulatorConfig::new()
            .with_cpus(2)
            .with_tasks_per_cpu(3)
            .with_steps(40)
            .with_seed(3);
        let sim = Simulator::new(config).unwrap();
        sim.run();
        for domain in sim.domains() {
            for cpu in 0..domain.nr_cpus() {
                for state in crate::task::TaskState::ALL {
                    assert_eq!(domain.cpu(cpu).task_count(state), 0);
                }
            }
        }
    }
}
