//! Reader for the teardown hit/miss report.

use std::path::Path;

use gpublas_membrane::parse_report;
use serde::Serialize;

use crate::HarnessError;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct StatsReport {
    pub hits: u64,
    pub misses: u64,
    pub placements: u64,
    /// Hits over placements; 0 when nothing was placed.
    pub hit_rate: f64,
}

impl StatsReport {
    pub fn parse(text: &str) -> Result<Self, HarnessError> {
        let (hits, misses) = parse_report(text)?;
        let placements = hits + misses;
        let hit_rate = if placements == 0 {
            0.0
        } else {
            hits as f64 / placements as f64
        };
        Ok(Self {
            hits,
            misses,
            placements,
            hit_rate,
        })
    }

    pub fn load(path: &Path) -> Result<Self, HarnessError> {
        let text = std::fs::read_to_string(path).map_err(|source| HarnessError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::parse(&text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_over_placements() {
        let report = StatsReport::parse("Hits,Misses\n3,1\n").expect("report");
        assert_eq!(report.placements, 4);
        assert!((report.hit_rate - 0.75).abs() < f64::EPSILON);
    }

    #[test]
    fn empty_run_has_zero_rate() {
        let report = StatsReport::parse("Hits,Misses\n0,0\n").expect("report");
        assert_eq!(report.hit_rate, 0.0);
    }

    #[test]
    fn malformed_report_is_rejected() {
        assert!(matches!(
            StatsReport::parse("hits misses\n1 2\n"),
            Err(HarnessError::Report(_))
        ));
    }
}
