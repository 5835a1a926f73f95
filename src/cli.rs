//! CLI argument parsing for Demora

use clap::{Parser, ValueEnum};

/// Output format for delay reports
#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum OutputFormat {
    /// Human-readable text format (default)
    Text,
    /// JSON format for machine parsing
    Json,
}

#[derive(Parser, Debug)]
#[command(name = "demora")]
#[command(version)]
#[command(about = "Memory-delay accounting driven by a synthetic scheduler workload", long_about = None)]
pub struct Cli {
    /// Logical CPUs to simulate (one driver thread each)
    #[arg(long, default_value = "4")]
    pub cpus: usize,

    /// Tasks pinned to each CPU
    #[arg(long = "tasks-per-cpu", default_value = "4")]
    pub tasks_per_cpu: usize,

    /// Containment domains, root included
    #[arg(long, default_value = "2")]
    pub domains: usize,

    /// Scheduling steps per CPU
    #[arg(long, default_value = "1000")]
    pub steps: u64,

    /// Probability a step opens a memory-delay section
    #[arg(long = "delay-probability", default_value = "0.25")]
    pub delay_probability: f64,

    /// Tracking control directive: 0 off, 1 local, 2 hierarchical
    #[arg(long = "control", default_value = "2")]
    pub control: String,

    /// Output format (text or json)
    #[arg(long = "format", value_enum, default_value = "text")]
    pub format: OutputFormat,

    /// Seed for the workload's transition sequence
    #[arg(long, default_value = "0")]
    pub seed: u64,

    /// Append per-CPU task counts to each report
    #[arg(long = "percpu")]
    pub percpu: bool,

    /// Enable trace-level debug output
    #[arg(short, long)]
    pub debug: bool,
}
