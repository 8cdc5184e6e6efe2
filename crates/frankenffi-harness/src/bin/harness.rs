//! CLI entrypoint for the FrankenFFI scenario harness.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use frankenffi_core::structured_log::LogEmitter;
use frankenffi_harness::artifacts::{index_path, write_report};
use frankenffi_harness::scenarios::{probe, run_request_scenario, run_storm};
use frankenffi_membrane::{LogFilter, RuntimeConfig};
use serde::Serialize;

/// Scenario runner for FrankenFFI.
#[derive(Debug, Parser)]
#[command(name = "frankenffi-harness")]
#[command(about = "Drive FrankenFFI scenarios and emit JSON reports")]
struct Cli {
    /// Write the report here (plus a `.artifacts.json` index) instead of stdout.
    #[arg(long, global = true)]
    output: Option<PathBuf>,
    /// Append JSONL step logs to this file instead of stderr.
    #[arg(long, global = true)]
    log: Option<PathBuf>,
    /// Run id used in trace ids and the artifact index.
    #[arg(long, global = true, default_value = "frankenffi")]
    run_id: String,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Request-scoped tasks: context, confined segments and a native call per request.
    Scenario {
        /// Request ids, one task each.
        #[arg(long = "request", default_values = ["REQ-1", "REQ-2"])]
        requests: Vec<String>,
        /// Carrier threads (defaults to FRANKENFFI_CARRIERS or available parallelism).
        #[arg(long)]
        carriers: Option<usize>,
    },
    /// Many short tasks on a small carrier pool.
    Storm {
        #[arg(long, default_value_t = 100_000)]
        tasks: usize,
        #[arg(long)]
        carriers: Option<usize>,
    },
    /// Resolve a symbol and report where it came from.
    Probe {
        #[arg(long)]
        symbol: String,
        /// Library searched before the configured path and the process.
        #[arg(long)]
        library: Option<PathBuf>,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let mut config = RuntimeConfig::from_env();

    let mut log = match &cli.log {
        Some(path) => LogEmitter::to_file(path, cli.run_id.as_str(), LogFilter::Debug)?,
        None => LogEmitter::to_stderr(cli.run_id.as_str(), config.log.max(LogFilter::Info)),
    };

    let passed = match cli.command {
        Command::Scenario { requests, carriers } => {
            if let Some(n) = carriers {
                config = config.with_carriers(n);
            }
            let requests: Vec<&str> = requests.iter().map(String::as_str).collect();
            let report = run_request_scenario(&config, &requests, &mut log)?;
            publish(&cli.output, cli.log.as_ref(), &cli.run_id, &report, &mut log)?;
            report.passed
        }
        Command::Storm { tasks, carriers } => {
            if let Some(n) = carriers {
                config = config.with_carriers(n);
            }
            let report = run_storm(&config, tasks, &mut log)?;
            publish(&cli.output, cli.log.as_ref(), &cli.run_id, &report, &mut log)?;
            report.passed
        }
        Command::Probe { symbol, library } => {
            let report = probe(&config, &symbol, library.as_deref(), &mut log)?;
            publish(&cli.output, cli.log.as_ref(), &cli.run_id, &report, &mut log)?;
            report.passed
        }
    };

    if !passed {
        return Err("scenario failed; see report".into());
    }
    Ok(())
}

fn publish<R: Serialize>(
    output: &Option<PathBuf>,
    log_path: Option<&PathBuf>,
    run_id: &str,
    report: &R,
    log: &mut LogEmitter,
) -> Result<(), Box<dyn std::error::Error>> {
    log.flush()?;
    match output {
        Some(path) => {
            let extra: Vec<(&std::path::Path, &str)> = log_path
                .map(|p| (p.as_path(), "log"))
                .into_iter()
                .collect();
            let index = write_report(report, path, run_id, &extra)?;
            eprintln!(
                "Wrote report to {} ({} artifacts indexed in {})",
                path.display(),
                index.artifacts.len(),
                index_path(path).display()
            );
        }
        None => println!("{}", serde_json::to_string_pretty(report)?),
    }
    Ok(())
}
