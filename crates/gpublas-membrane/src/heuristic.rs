//! Host/device placement heuristics.
//!
//! [`Heuristic::decide`] answers, for one intercepted allocation, whether the
//! object should be built in managed (device-visible) memory. The policy is
//! chosen once when the process context is built and never changes.
//!
//! Oracle replay reproduces decisions recorded in an earlier run. The trace is
//! JSON Lines, one decision per line, in call order:
//!
//! ```text
//! {"call_site": "0x4005d6", "size": 4096, "device": true}
//! {"call_site": "0x4005d6", "size": 4096, "device": false}
//! ```
//!
//! Each call-site replays its own recorded sequence; once exhausted its last
//! decision repeats. Call-sites absent from the trace stay on the host.
//! Loading fails hard on a missing or malformed trace: a replay that silently
//! diverges from the recording would poison any comparison built on it.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::config::HeuristicSpec;
use crate::record::CallSite;

#[derive(Debug, Error)]
pub enum HeuristicError {
    #[error("cannot read oracle trace {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("oracle trace line {line}: {message}")]
    Malformed { line: usize, message: String },
    #[error("oracle trace {0} contains no decisions")]
    Empty(String),
}

/// Selected decision policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HeuristicPolicy {
    AlwaysDevice,
    AlwaysHost,
    Random,
    Oracle,
}

/// One recorded decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OracleEntry {
    pub call_site: CallSite,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<usize>,
    pub device: bool,
}

/// Immutable decision trace loaded from a previous run.
#[derive(Debug, Clone)]
pub struct OracleTrace {
    source: String,
    entries: Vec<OracleEntry>,
    by_site: HashMap<CallSite, Vec<bool>>,
    digest: String,
}

impl OracleTrace {
    pub fn load(path: &Path) -> Result<Self, HeuristicError> {
        let bytes = std::fs::read(path).map_err(|source| HeuristicError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&path.display().to_string(), &bytes)
    }

    pub fn parse(source: &str, bytes: &[u8]) -> Result<Self, HeuristicError> {
        let text = std::str::from_utf8(bytes).map_err(|e| HeuristicError::Malformed {
            line: 0,
            message: format!("not UTF-8: {e}"),
        })?;

        let mut entries = Vec::new();
        let mut by_site: HashMap<CallSite, Vec<bool>> = HashMap::new();
        for (idx, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let entry: OracleEntry =
                serde_json::from_str(line).map_err(|e| HeuristicError::Malformed {
                    line: idx + 1,
                    message: e.to_string(),
                })?;
            by_site.entry(entry.call_site).or_default().push(entry.device);
            entries.push(entry);
        }

        if entries.is_empty() {
            return Err(HeuristicError::Empty(source.to_string()));
        }

        Ok(Self {
            source: source.to_string(),
            entries,
            by_site,
            digest: sha256_hex(bytes),
        })
    }

    #[must_use]
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Recorded decisions in call order.
    #[must_use]
    pub fn entries(&self) -> &[OracleEntry] {
        &self.entries
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of distinct call-sites in the trace.
    #[must_use]
    pub fn call_sites(&self) -> usize {
        self.by_site.len()
    }

    /// SHA-256 of the raw trace bytes, lowercase hex.
    #[must_use]
    pub fn digest(&self) -> &str {
        &self.digest
    }

    /// Decision for the `nth` call (zero-based) from `site`.
    #[must_use]
    pub fn decision(&self, site: CallSite, nth: usize) -> bool {
        match self.by_site.get(&site) {
            Some(seq) => seq.get(nth).or_else(|| seq.last()).copied().unwrap_or(false),
            None => false,
        }
    }
}

fn sha256_hex(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    let mut out = String::with_capacity(64);
    for b in digest {
        let _ = write!(out, "{b:02x}");
    }
    out
}

/// Placement decision engine.
#[derive(Debug)]
pub struct Heuristic {
    policy: HeuristicPolicy,
    oracle: Option<Arc<OracleTrace>>,
    cursors: Mutex<HashMap<CallSite, usize>>,
    rng: Mutex<SmallRng>,
}

impl Heuristic {
    fn with_policy(policy: HeuristicPolicy, oracle: Option<Arc<OracleTrace>>, seed: u64) -> Self {
        Self {
            policy,
            oracle,
            cursors: Mutex::new(HashMap::new()),
            rng: Mutex::new(SmallRng::seed_from_u64(seed)),
        }
    }

    #[must_use]
    pub fn always_device() -> Self {
        Self::with_policy(HeuristicPolicy::AlwaysDevice, None, 0)
    }

    #[must_use]
    pub fn always_host() -> Self {
        Self::with_policy(HeuristicPolicy::AlwaysHost, None, 0)
    }

    #[must_use]
    pub fn random(seed: u64) -> Self {
        Self::with_policy(HeuristicPolicy::Random, None, seed)
    }

    /// Replay `trace` from its beginning.
    #[must_use]
    pub fn oracle(trace: Arc<OracleTrace>) -> Self {
        Self::with_policy(HeuristicPolicy::Oracle, Some(trace), 0)
    }

    /// Build the engine an options string asked for. Loads the oracle trace.
    pub fn from_spec(spec: &HeuristicSpec, seed: Option<u64>) -> Result<Self, HeuristicError> {
        Ok(match spec {
            HeuristicSpec::AlwaysDevice => Self::always_device(),
            HeuristicSpec::AlwaysHost => Self::always_host(),
            HeuristicSpec::Random => Self::random(seed.unwrap_or_else(clock_seed)),
            HeuristicSpec::Oracle(path) => Self::oracle(Arc::new(OracleTrace::load(path)?)),
        })
    }

    #[must_use]
    pub fn policy(&self) -> HeuristicPolicy {
        self.policy
    }

    #[must_use]
    pub fn trace(&self) -> Option<&Arc<OracleTrace>> {
        self.oracle.as_ref()
    }

    /// True to place the object allocated at `call_site` on the device.
    pub fn decide(&self, call_site: CallSite, _size: usize) -> bool {
        match self.policy {
            HeuristicPolicy::AlwaysDevice => true,
            HeuristicPolicy::AlwaysHost => false,
            HeuristicPolicy::Random => self.rng.lock().gen_bool(0.5),
            HeuristicPolicy::Oracle => {
                let Some(trace) = self.oracle.as_deref() else {
                    return false;
                };
                let nth = {
                    let mut cursors = self.cursors.lock();
                    let cursor = cursors.entry(call_site).or_insert(0);
                    let nth = *cursor;
                    *cursor += 1;
                    nth
                };
                trace.decision(call_site, nth)
            }
        }
    }
}

fn clock_seed() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map_or(0x9E37_79B9_7F4A_7C15, |d| d.as_nanos() as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    const TRACE: &str = "\
# recorded run
{\"call_site\": \"0x10\", \"size\": 64, \"device\": true}
{\"call_site\": \"0x20\", \"device\": false}
{\"call_site\": \"0x10\", \"size\": 64, \"device\": false}
{\"call_site\": \"0x20\", \"device\": true}
";

    fn trace() -> Arc<OracleTrace> {
        Arc::new(OracleTrace::parse("inline", TRACE.as_bytes()).unwrap())
    }

    #[test]
    fn fixed_policies() {
        assert!(Heuristic::always_device().decide(CallSite(1), 8));
        assert!(!Heuristic::always_host().decide(CallSite(1), 8));
    }

    #[test]
    fn random_is_reproducible_for_a_seed() {
        let a = Heuristic::random(42);
        let b = Heuristic::random(42);
        let seq_a: Vec<bool> = (0..64).map(|i| a.decide(CallSite(i), 8)).collect();
        let seq_b: Vec<bool> = (0..64).map(|i| b.decide(CallSite(i), 8)).collect();
        assert_eq!(seq_a, seq_b);
        assert!(seq_a.iter().any(|&d| d));
        assert!(seq_a.iter().any(|&d| !d));
    }

    #[test]
    fn oracle_replays_per_site_sequence_then_repeats_last() {
        let h = Heuristic::oracle(trace());
        assert!(h.decide(CallSite(0x10), 64));
        assert!(!h.decide(CallSite(0x20), 8));
        assert!(!h.decide(CallSite(0x10), 64));
        assert!(h.decide(CallSite(0x20), 8));
        assert!(h.decide(CallSite(0x20), 8));
        assert!(!h.decide(CallSite(0x10), 64));
        assert!(!h.decide(CallSite(0x99), 64));
    }

    #[test]
    fn oracle_replay_is_deterministic_across_runs() {
        let t = trace();
        let calls = [0x10, 0x20, 0x20, 0x10, 0x30, 0x10, 0x20];
        let run = |h: Heuristic| -> Vec<bool> {
            calls.iter().map(|&s| h.decide(CallSite(s), 0)).collect()
        };
        assert_eq!(
            run(Heuristic::oracle(Arc::clone(&t))),
            run(Heuristic::oracle(t))
        );
    }

    #[test]
    fn trace_metadata() {
        let t = trace();
        assert_eq!(t.len(), 4);
        assert_eq!(t.call_sites(), 2);
        assert_eq!(t.digest().len(), 64);
        assert_eq!(t.entries()[0].size, Some(64));
        assert_eq!(t.entries()[1].size, None);
    }

    #[test]
    fn malformed_trace_fails() {
        let err = OracleTrace::parse("bad", b"{\"call_site\": \"0x10\"}\n").unwrap_err();
        assert!(matches!(err, HeuristicError::Malformed { line: 1, .. }));
        let err = OracleTrace::parse("empty", b"# nothing\n\n").unwrap_err();
        assert!(matches!(err, HeuristicError::Empty(_)));
    }

    #[test]
    fn missing_trace_fails() {
        let spec = HeuristicSpec::Oracle(PathBuf::from("/nonexistent/trace.jsonl"));
        assert!(matches!(
            Heuristic::from_spec(&spec, None),
            Err(HeuristicError::Read { .. })
        ));
    }

    #[test]
    fn from_spec_selects_policy() {
        assert_eq!(
            Heuristic::from_spec(&HeuristicSpec::Random, Some(1)).unwrap().policy(),
            HeuristicPolicy::Random
        );
        assert_eq!(
            Heuristic::from_spec(&HeuristicSpec::AlwaysHost, None).unwrap().policy(),
            HeuristicPolicy::AlwaysHost
        );
    }
}
