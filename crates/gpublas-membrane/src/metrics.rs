//! Atomic placement counters and the teardown report.
//!
//! Counters only ever grow; there is no reset. Relaxed ordering is enough
//! since they are diagnostic, but they are atomic so concurrent BLAS calls
//! never lose an increment.

use std::io::Write;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;
use thiserror::Error;

/// Header line of the statistics report.
pub const REPORT_HEADER: &str = "Hits,Misses";

#[derive(Debug, Error)]
pub enum ReportError {
    #[error("cannot write statistics report {path}: {source}")]
    Write {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("statistics report is malformed: {0}")]
    Malformed(String),
}

/// Process-wide placement counters.
#[derive(Debug)]
pub struct PlacementMetrics {
    /// Buffers already device-visible (no copy).
    pub hits: AtomicU64,
    /// Buffers that needed a host-to-device copy.
    pub misses: AtomicU64,
    /// Bytes ever handed out by the managed allocator.
    pub managed_bytes: AtomicU64,
    pub bytes_to_device: AtomicU64,
    pub bytes_to_host: AtomicU64,
    pub device_allocs: AtomicU64,
    pub device_frees: AtomicU64,
    /// Calls that rolled back earlier placements.
    pub rollbacks: AtomicU64,
    /// Allocator calls passed through untracked because of an excluded region.
    pub excluded_bypasses: AtomicU64,
}

impl PlacementMetrics {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            managed_bytes: AtomicU64::new(0),
            bytes_to_device: AtomicU64::new(0),
            bytes_to_host: AtomicU64::new(0),
            device_allocs: AtomicU64::new(0),
            device_frees: AtomicU64::new(0),
            rollbacks: AtomicU64::new(0),
            excluded_bypasses: AtomicU64::new(0),
        }
    }

    /// Increment a counter by 1.
    pub fn inc(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Add `n` to a counter.
    pub fn add(counter: &AtomicU64, n: usize) {
        counter.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub fn get(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            hits: Self::get(&self.hits),
            misses: Self::get(&self.misses),
            managed_bytes: Self::get(&self.managed_bytes),
            bytes_to_device: Self::get(&self.bytes_to_device),
            bytes_to_host: Self::get(&self.bytes_to_host),
            device_allocs: Self::get(&self.device_allocs),
            device_frees: Self::get(&self.device_frees),
            rollbacks: Self::get(&self.rollbacks),
            excluded_bypasses: Self::get(&self.excluded_bypasses),
        }
    }

    /// Two-line report: header, then hit and miss counts.
    #[must_use]
    pub fn render_report(&self) -> String {
        let snap = self.snapshot();
        format!("{REPORT_HEADER}\n{},{}\n", snap.hits, snap.misses)
    }

    pub fn write_report(&self, path: &Path) -> Result<(), ReportError> {
        let wrap = |source| ReportError::Write {
            path: path.display().to_string(),
            source,
        };
        let mut file = std::fs::File::create(path).map_err(wrap)?;
        file.write_all(self.render_report().as_bytes()).map_err(wrap)?;
        file.flush().map_err(wrap)
    }
}

impl Default for PlacementMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time copy of all counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub managed_bytes: u64,
    pub bytes_to_device: u64,
    pub bytes_to_host: u64,
    pub device_allocs: u64,
    pub device_frees: u64,
    pub rollbacks: u64,
    pub excluded_bypasses: u64,
}

/// Parse a report produced by [`PlacementMetrics::render_report`] into `(hits, misses)`.
pub fn parse_report(text: &str) -> Result<(u64, u64), ReportError> {
    let mut lines = text.lines();
    match lines.next() {
        Some(h) if h.trim() == REPORT_HEADER => {}
        other => {
            return Err(ReportError::Malformed(format!(
                "expected header '{REPORT_HEADER}', found {other:?}"
            )));
        }
    }
    let values = lines
        .next()
        .ok_or_else(|| ReportError::Malformed("missing counts line".into()))?;
    let (hits, misses) = values
        .trim()
        .split_once(',')
        .ok_or_else(|| ReportError::Malformed(format!("bad counts line '{values}'")))?;
    let parse = |s: &str| {
        s.trim()
            .parse::<u64>()
            .map_err(|_| ReportError::Malformed(format!("bad count '{s}'")))
    };
    Ok((parse(hits)?, parse(misses)?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_start_at_zero() {
        let m = PlacementMetrics::new();
        assert_eq!(m.snapshot(), MetricsSnapshot::default());
    }

    #[test]
    fn increments_and_adds() {
        let m = PlacementMetrics::new();
        PlacementMetrics::inc(&m.hits);
        PlacementMetrics::inc(&m.misses);
        PlacementMetrics::inc(&m.misses);
        PlacementMetrics::add(&m.bytes_to_device, 16);
        let snap = m.snapshot();
        assert_eq!(snap.hits, 1);
        assert_eq!(snap.misses, 2);
        assert_eq!(snap.bytes_to_device, 16);
    }

    #[test]
    fn report_has_header_and_counts() {
        let m = PlacementMetrics::new();
        PlacementMetrics::inc(&m.hits);
        PlacementMetrics::add(&m.misses, 3);
        let report = m.render_report();
        assert_eq!(report, "Hits,Misses\n1,3\n");
        assert_eq!(parse_report(&report).unwrap(), (1, 3));
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!(parse_report("").is_err());
        assert!(parse_report("Hits,Misses\n").is_err());
        assert!(parse_report("Hits,Misses\n1;2\n").is_err());
        assert!(parse_report("Hits,Misses\nx,2\n").is_err());
    }

    #[test]
    fn concurrent_increments_are_not_lost() {
        let m = std::sync::Arc::new(PlacementMetrics::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let m = std::sync::Arc::clone(&m);
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        PlacementMetrics::inc(&m.misses);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(m.snapshot().misses, 8000);
    }

    #[test]
    fn write_report_to_file() {
        let m = PlacementMetrics::new();
        PlacementMetrics::inc(&m.hits);
        let path = std::env::temp_dir().join(format!("gpublas-report-{}.csv", std::process::id()));
        m.write_report(&path).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        let _ = std::fs::remove_file(&path);
        assert_eq!(parse_report(&text).unwrap(), (1, 0));
    }
}
