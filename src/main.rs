//! akh-kernel CLI: run demonstration agents on the production-rule kernel.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use miette::{IntoDiagnostic, Result};
use serde::Serialize;

use akh_kernel::cycle::{CycleStats, Diagnostic, RunType};
use akh_kernel::demo::Demo;
use akh_kernel::kernel::{Kernel, KernelConfig};

#[derive(Parser)]
#[command(name = "akh-kernel", version, about = "Production-rule execution kernel")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a demonstration agent and print statistics.
    Run {
        /// Which agent to load.
        #[arg(long, value_enum)]
        demo: Demo,

        /// Number of decision cycles to run.
        #[arg(long, default_value = "10")]
        decisions: u64,

        /// TOML file with kernel configuration.
        #[arg(long)]
        config: Option<PathBuf>,

        /// Print the report as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Print the default configuration as TOML.
    Config,
}

#[derive(Serialize)]
struct Report {
    demo: Demo,
    decisions_run: u64,
    stop_reason: Option<String>,
    halted: bool,
    output: String,
    goal_stack_depth: usize,
    stats: CycleStats,
    diagnostics: Vec<Diagnostic>,
}

fn main() -> Result<()> {
    miette::set_hook(Box::new(|_| {
        Box::new(
            miette::MietteHandlerOpts::new()
                .terminal_links(true)
                .unicode(true)
                .context_lines(3)
                .build(),
        )
    }))
    .ok(); // Ignore error if hook already set (e.g., in tests)

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            demo,
            decisions,
            config,
            json,
        } => {
            let config = match config {
                Some(path) => KernelConfig::load(&path)?,
                None => KernelConfig::default(),
            };
            let mut kernel = Kernel::new(config)?;
            demo.load(&mut kernel)?;
            let outcome = kernel.run(decisions, RunType::Decisions)?;

            let report = Report {
                demo,
                decisions_run: outcome.decisions,
                stop_reason: outcome.stop_reason,
                halted: outcome.halted,
                output: kernel.take_printed_output(),
                goal_stack_depth: kernel.goal_stack().len(),
                stats: kernel.stats(),
                diagnostics: kernel.diagnostics().to_vec(),
            };

            if json {
                let text = serde_json::to_string_pretty(&report).into_diagnostic()?;
                println!("{text}");
            } else {
                print_report(&report);
            }
        }

        Commands::Config => {
            let text = KernelConfig::default().to_toml_string()?;
            print!("{text}");
        }
    }

    Ok(())
}

fn print_report(report: &Report) {
    println!("Demo: {:?}", report.demo);
    println!("  decisions run:     {}", report.decisions_run);
    if let Some(reason) = &report.stop_reason {
        println!("  stopped:           {reason}");
    }
    if report.halted {
        println!("  halted:            yes");
    }
    println!("  goal stack depth:  {}", report.goal_stack_depth);
    let s = &report.stats;
    println!("  elaborations:      {}", s.elaboration_cycles);
    println!("  production firings: {}", s.production_firings);
    println!("  wme additions:     {}", s.wme_additions);
    println!("  wme removals:      {}", s.wme_removals);
    println!("  max wm size:       {}", s.max_wm_size);
    if !report.output.is_empty() {
        println!("Output:");
        println!("{}", report.output);
    }
    if !report.diagnostics.is_empty() {
        println!("Diagnostics ({}):", report.diagnostics.len());
        for d in &report.diagnostics {
            println!(
                "  [{:?}] cycle {}: {}",
                d.kind, d.decision_cycle, d.message
            );
        }
    }
}
