//! Quiver - dependency-graph valuation runner
//!
//! # Usage
//!
//! ```bash
//! quiver run --config quiver.toml
//! quiver run --config quiver.toml --cycles 5 --verbose
//! quiver run --config quiver.toml --json
//! ```

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use quiver_cli::runner;
use quiver_cli::RunnerConfig;
use quiver_engine::{CycleReport, DeltaKind, RootOutcome};

/// Quiver - dependency-graph valuation runner
#[derive(Parser, Debug)]
#[command(name = "quiver")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run valuation cycles
    Run {
        /// Configuration file
        #[arg(short, long)]
        config: PathBuf,

        /// Override the number of cycles
        #[arg(long)]
        cycles: Option<u32>,

        /// Print reports as JSON
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize logging
    let filter = if args.verbose {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("quiver_engine=debug,quiver_cli=debug"))
    } else {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("quiver_engine=info,quiver_cli=info"))
    };
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    match args.command {
        Command::Run {
            config,
            cycles,
            json,
        } => {
            let mut config = RunnerConfig::from_file(&config)?;
            if let Some(cycles) = cycles {
                config.cycles = cycles;
                config.validate()?;
            }
            tracing::info!(
                name = %config.engine.name,
                targets = config.targets.len(),
                cycles = config.cycles,
                "Starting valuation run"
            );

            let reports = runner::run(&config).await?;
            for report in &reports {
                if json {
                    println!("{}", report.execution.to_json()?);
                } else {
                    print_report(report);
                }
            }
        }
    }

    Ok(())
}

fn print_report(report: &CycleReport) {
    println!(
        "{} ({} batches, {} jobs, {} changed, {:.1} ms)",
        report.cycle,
        report.execution.batches,
        report.execution.jobs,
        report.delta.changed().count(),
        report.execution.duration.as_secs_f64() * 1000.0
    );
    for root in &report.execution.roots {
        let marker = match report.delta.kind(&root.requirement) {
            Some(DeltaKind::Unchanged) | None => ' ',
            Some(_) => '*',
        };
        match &root.outcome {
            RootOutcome::Value(value) => match value.as_f64() {
                Some(v) => println!("{} {:<48} {:>16.6}", marker, root.requirement.to_string(), v),
                None => println!("{} {:<48} {:?}", marker, root.requirement.to_string(), value),
            },
            RootOutcome::Failed(chain) => {
                println!("  {:<48} FAILED {}", root.requirement.to_string(), chain)
            }
            RootOutcome::Cancelled => {
                println!("  {:<48} CANCELLED", root.requirement.to_string())
            }
        }
    }
    for unsatisfied in &report.unsatisfied {
        println!(
            "  {:<48} UNSATISFIED {}",
            unsatisfied.requirement.to_string(),
            unsatisfied.reason
        );
    }
}
