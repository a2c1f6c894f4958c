//! Explain a `GPUBLAS_OPTIONS` string.

use std::path::Path;

use gpublas_membrane::{HeuristicSpec, Options, OracleTrace};
use serde::Serialize;

use crate::HarnessError;
use crate::trace_audit::TraceSummary;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OptionsReport {
    pub tracking: bool,
    pub heuristic: Option<String>,
    pub seed: Option<u64>,
    pub track: Option<String>,
    pub stats: Option<String>,
    pub trace_copy: bool,
    pub debug_exec: bool,
    pub debug_execfail: bool,
    pub help: bool,
    pub exclusion_patterns: Vec<String>,
    pub warnings: Vec<String>,
    /// Present when the oracle trace was loaded to check it.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub oracle: Option<TraceSummary>,
}

fn describe(spec: &HeuristicSpec) -> String {
    match spec {
        HeuristicSpec::Random => "random".to_string(),
        HeuristicSpec::AlwaysDevice => "true".to_string(),
        HeuristicSpec::AlwaysHost => "false".to_string(),
        HeuristicSpec::Oracle(path) => format!("oracle:{}", path.display()),
    }
}

fn display(path: &Path) -> String {
    path.display().to_string()
}

/// Parse `text` exactly as the library does at start-up. With `load_oracle`
/// an oracle trace is also loaded, so a broken trace is reported here rather
/// than by an aborting process.
pub fn explain(text: &str, load_oracle: bool) -> Result<OptionsReport, HarnessError> {
    let parsed = Options::parse(text)?;
    let options = parsed.options;
    let oracle = match (&options.heuristic, load_oracle) {
        (Some(HeuristicSpec::Oracle(path)), true) => {
            Some(TraceSummary::of(&OracleTrace::load(path)?))
        }
        _ => None,
    };
    Ok(OptionsReport {
        tracking: options.tracking_enabled(),
        heuristic: options.heuristic.as_ref().map(describe),
        seed: options.seed,
        track: options.track.as_deref().map(display),
        stats: options.stats.as_deref().map(display),
        trace_copy: options.trace_copy,
        debug_exec: options.debug_exec,
        debug_execfail: options.debug_execfail,
        help: options.help,
        exclusion_patterns: options.exclusion_patterns(),
        warnings: parsed.warnings,
        oracle,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_string_disables_tracking() {
        let report = explain("", false).expect("explain");
        assert!(!report.tracking);
        assert_eq!(report.heuristic, None);
        assert!(report.exclusion_patterns.iter().any(|p| p == "libcuda"));
    }

    #[test]
    fn flags_and_warnings_are_reported() {
        let report = explain("trace_copy;heuristic=random;seed=7;bogus", false).expect("explain");
        assert!(report.tracking);
        assert!(report.trace_copy);
        assert_eq!(report.heuristic.as_deref(), Some("random"));
        assert_eq!(report.seed, Some(7));
        assert_eq!(report.warnings.len(), 1);
        assert!(report.warnings[0].contains("bogus"));
    }

    #[test]
    fn missing_oracle_only_fails_when_loaded() {
        let text = "heuristic=oracle:/nonexistent/gpublas.jsonl";
        let report = explain(text, false).expect("parse only");
        assert_eq!(
            report.heuristic.as_deref(),
            Some("oracle:/nonexistent/gpublas.jsonl")
        );
        assert!(matches!(explain(text, true), Err(HarnessError::Heuristic(_))));
    }

    #[test]
    fn invalid_heuristic_is_an_error() {
        assert!(matches!(explain("heuristic=maybe", false), Err(HarnessError::Config(_))));
    }
}
