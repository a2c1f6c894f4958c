//! Offline tooling for gpublas.
//!
//! This crate provides:
//! - Trace audit: validate an oracle trace and prove its replay is deterministic
//! - Region listing: show which mappings a set of patterns excludes from tracking
//! - Options explain: parse a `GPUBLAS_OPTIONS` string the way the library will
//! - Stats reading: decode the hit/miss report written at teardown

#![forbid(unsafe_code)]

pub mod options_explain;
pub mod regions_report;
pub mod stats_report;
pub mod trace_audit;

pub use options_explain::{OptionsReport, explain};
pub use regions_report::{RegionRow, RegionsReport};
pub use stats_report::StatsReport;
pub use trace_audit::{ReplayMismatch, ReplayReport, TraceSummary};

use thiserror::Error;

/// Failure of a harness command.
#[derive(Debug, Error)]
pub enum HarnessError {
    #[error(transparent)]
    Heuristic(#[from] gpublas_membrane::HeuristicError),
    #[error(transparent)]
    Regions(#[from] gpublas_membrane::RegionError),
    #[error(transparent)]
    Config(#[from] gpublas_membrane::ConfigError),
    #[error(transparent)]
    Report(#[from] gpublas_membrane::ReportError),
    #[error("cannot read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{path}:{line}: invalid call-site '{text}'")]
    CallSite {
        path: String,
        line: usize,
        text: String,
    },
}
