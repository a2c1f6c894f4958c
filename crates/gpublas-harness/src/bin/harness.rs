//! CLI entrypoint for gpublas tooling.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use gpublas_membrane::OracleTrace;
use gpublas_membrane::config::{DEFAULT_EXCLUDED_LIBRARIES, HELP, OPTIONS_ENV};
use gpublas_membrane::regions::PROC_SELF_MAPS;
use gpublas_harness::trace_audit::{load_sites, replay_recorded, replay_sites};
use gpublas_harness::{RegionsReport, StatsReport, TraceSummary, explain};
use serde::Serialize;

/// Offline tooling for gpublas.
#[derive(Debug, Parser)]
#[command(name = "gpublas-harness")]
#[command(about = "Inspect gpublas oracle traces, options and reports")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Validate an oracle trace and print its summary.
    CheckTrace {
        /// Oracle trace (JSON Lines).
        #[arg(long)]
        trace: PathBuf,
    },
    /// Replay an oracle trace through two fresh engines and compare.
    Replay {
        /// Oracle trace (JSON Lines).
        #[arg(long)]
        trace: PathBuf,
        /// Call-site sequence, one address per line. Defaults to the trace's
        /// own call order.
        #[arg(long)]
        sites: Option<PathBuf>,
        /// Output JSON path (if omitted, prints to stdout).
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// List the address ranges a pattern set excludes from tracking.
    Regions {
        /// Library name substring; repeatable. Defaults to the built-in runtime list.
        #[arg(long = "pattern")]
        patterns: Vec<String>,
        /// Maps-format file to scan.
        #[arg(long, default_value = PROC_SELF_MAPS)]
        maps: PathBuf,
    },
    /// Parse an options string the way the library does.
    Options {
        /// Options text (defaults to the environment variable).
        #[arg(long)]
        text: Option<String>,
        /// Also load the oracle trace named by `heuristic=oracle:<file>`.
        #[arg(long)]
        load_oracle: bool,
    },
    /// Decode a hit/miss report written at teardown.
    Stats {
        /// Report path.
        #[arg(long)]
        report: PathBuf,
    },
}

fn emit<T: Serialize>(value: &T, output: Option<&Path>) -> Result<(), Box<dyn std::error::Error>> {
    let json = serde_json::to_string_pretty(value)?;
    match output {
        Some(path) => {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(path, json + "\n")?;
            eprintln!("Wrote {}", path.display());
        }
        None => println!("{json}"),
    }
    Ok(())
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    match cli.command {
        Command::CheckTrace { trace } => {
            let loaded = OracleTrace::load(&trace)?;
            emit(&TraceSummary::of(&loaded), None)?;
        }
        Command::Replay {
            trace,
            sites,
            output,
        } => {
            let loaded = Arc::new(OracleTrace::load(&trace)?);
            let report = match sites {
                Some(path) => replay_sites(&loaded, &load_sites(&path)?),
                None => replay_recorded(&loaded),
            };
            emit(&report, output.as_deref())?;
            if !report.deterministic() {
                return Err(format!(
                    "replay diverged at {} of {} steps",
                    report.mismatches.len(),
                    report.steps
                )
                .into());
            }
        }
        Command::Regions { patterns, maps } => {
            let patterns = if patterns.is_empty() {
                DEFAULT_EXCLUDED_LIBRARIES
                    .iter()
                    .map(|s| (*s).to_string())
                    .collect()
            } else {
                patterns
            };
            emit(&RegionsReport::scan(&maps, &patterns)?, None)?;
        }
        Command::Options { text, load_oracle } => {
            let text = text.unwrap_or_else(|| std::env::var(OPTIONS_ENV).unwrap_or_default());
            let report = explain(&text, load_oracle)?;
            if report.help {
                eprint!("{HELP}");
            }
            emit(&report, None)?;
        }
        Command::Stats { report } => {
            emit(&StatsReport::load(&report)?, None)?;
        }
    }

    Ok(())
}
