use anyhow::Result;
use clap::Parser;
use demora::cli::{Cli, OutputFormat};
use demora::control::TrackingMode;
use demora::simulator::{Simulator, SimulatorConfig};
use tracing_subscriber::EnvFilter;

/// Initialize tracing subscriber for debug output
fn init_tracing(debug: bool) {
    if debug {
        tracing_subscriber::fmt()
            .with_env_filter(
                EnvFilter::from_default_env().add_directive(tracing::Level::TRACE.into()),
            )
            .with_writer(std::io::stderr)
            .init();
    }
}

fn domain_label(index: usize) -> String {
    if index == 0 {
        "root".to_string()
    } else {
        format!("domain-{}", index)
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.debug);

    let mode = TrackingMode::parse(&cli.control)?;

    let config = SimulatorConfig::new()
        .with_cpus(cli.cpus)
        .with_tasks_per_cpu(cli.tasks_per_cpu)
        .with_domains(cli.domains)
        .with_steps(cli.steps)
        .with_delay_probability(cli.delay_probability)
        .with_seed(cli.seed)
        .with_mode(mode);

    let sim = Simulator::new(config)?;
    sim.tracker().set_diagnostics(cli.percpu);
    let stats = sim.run();

    match cli.format {
        OutputFormat::Text => {
            for (index, domain) in sim.domains().iter().enumerate() {
                let report = sim.tracker().report(domain);
                println!("[{}]", domain_label(index));
                print!("{}", report.to_text());
            }
            println!(
                "steps={} delay_sections={} iowait_naps={} migrations={}",
                stats.steps, stats.delay_sections, stats.iowait_naps, stats.migrations
            );
        }
        OutputFormat::Json => {
            let domains: Vec<serde_json::Value> = sim
                .domains()
                .iter()
                .enumerate()
                .map(|(index, domain)| {
                    let report = sim.tracker().report(domain);
                    serde_json::json!({
                        "name": domain_label(index),
                        "report": report,
                    })
                })
                .collect();
            let output = serde_json::json!({
                "domains": domains,
                "workload": stats,
            });
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
    }

    Ok(())
}
