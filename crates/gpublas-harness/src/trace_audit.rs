//! Oracle trace validation and replay checks.

use std::path::Path;
use std::sync::Arc;

use gpublas_membrane::{CallSite, Heuristic, OracleTrace};
use serde::Serialize;

use crate::HarnessError;

/// Shape of a loaded trace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TraceSummary {
    pub source: String,
    pub decisions: usize,
    pub call_sites: usize,
    pub device_decisions: usize,
    pub host_decisions: usize,
    pub sha256: String,
}

impl TraceSummary {
    #[must_use]
    pub fn of(trace: &OracleTrace) -> Self {
        let device_decisions = trace.entries().iter().filter(|e| e.device).count();
        Self {
            source: trace.source().to_string(),
            decisions: trace.len(),
            call_sites: trace.call_sites(),
            device_decisions,
            host_decisions: trace.len() - device_decisions,
            sha256: trace.digest().to_string(),
        }
    }
}

/// One step where the two replays or the recording disagree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReplayMismatch {
    pub step: usize,
    pub call_site: CallSite,
    pub recorded: Option<bool>,
    pub first: bool,
    pub second: bool,
}

/// Outcome of replaying a call-site sequence through two fresh engines.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReplayReport {
    pub sha256: String,
    pub steps: usize,
    pub device_decisions: usize,
    pub mismatches: Vec<ReplayMismatch>,
}

impl ReplayReport {
    #[must_use]
    pub fn deterministic(&self) -> bool {
        self.mismatches.is_empty()
    }
}

/// Replay the trace's own call order. Each step must reproduce the recorded
/// decision in both engines.
#[must_use]
pub fn replay_recorded(trace: &Arc<OracleTrace>) -> ReplayReport {
    let steps: Vec<(CallSite, Option<bool>)> = trace
        .entries()
        .iter()
        .map(|e| (e.call_site, Some(e.device)))
        .collect();
    replay(trace, &steps)
}

/// Replay an arbitrary call-site sequence. Nothing is recorded for these
/// steps, so only the two engines are compared.
#[must_use]
pub fn replay_sites(trace: &Arc<OracleTrace>, sites: &[CallSite]) -> ReplayReport {
    let steps: Vec<(CallSite, Option<bool>)> = sites.iter().map(|&s| (s, None)).collect();
    replay(trace, &steps)
}

fn replay(trace: &Arc<OracleTrace>, steps: &[(CallSite, Option<bool>)]) -> ReplayReport {
    let first = Heuristic::oracle(Arc::clone(trace));
    let second = Heuristic::oracle(Arc::clone(trace));
    let mut mismatches = Vec::new();
    let mut device_decisions = 0;

    for (step, &(call_site, recorded)) in steps.iter().enumerate() {
        let a = first.decide(call_site, 0);
        let b = second.decide(call_site, 0);
        if a {
            device_decisions += 1;
        }
        if a != b || recorded.is_some_and(|r| r != a) {
            mismatches.push(ReplayMismatch {
                step,
                call_site,
                recorded,
                first: a,
                second: b,
            });
        }
    }

    ReplayReport {
        sha256: trace.digest().to_string(),
        steps: steps.len(),
        device_decisions,
        mismatches,
    }
}

/// Read a call-site list: one address per line, `#` comments allowed.
pub fn load_sites(path: &Path) -> Result<Vec<CallSite>, HarnessError> {
    let text = std::fs::read_to_string(path).map_err(|source| HarnessError::Read {
        path: path.display().to_string(),
        source,
    })?;
    parse_sites(&path.display().to_string(), &text)
}

pub fn parse_sites(source: &str, text: &str) -> Result<Vec<CallSite>, HarnessError> {
    let mut sites = Vec::new();
    for (idx, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let site = CallSite::parse(line).ok_or_else(|| HarnessError::CallSite {
            path: source.to_string(),
            line: idx + 1,
            text: line.to_string(),
        })?;
        sites.push(site);
    }
    Ok(sites)
}
