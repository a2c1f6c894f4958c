//! Excluded-region listing.

use std::fmt::Write as _;
use std::path::Path;

use gpublas_membrane::ExcludedRegions;
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::HarnessError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RegionRow {
    pub start: String,
    pub end: String,
    pub bytes: usize,
    pub library: String,
}

/// Regions a pattern set excludes, plus a fingerprint of the address table
/// so two scans can be compared at a glance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RegionsReport {
    pub source: String,
    pub patterns: Vec<String>,
    pub regions: Vec<RegionRow>,
    pub total_bytes: usize,
    pub sha256: String,
}

impl RegionsReport {
    /// Scan `maps` (maps-format text) for `patterns`.
    pub fn scan(maps: &Path, patterns: &[String]) -> Result<Self, HarnessError> {
        let regions = ExcludedRegions::scan_file(maps, patterns)?;
        Ok(Self::from_regions(&maps.display().to_string(), patterns, &regions))
    }

    #[must_use]
    pub fn from_regions(source: &str, patterns: &[String], regions: &ExcludedRegions) -> Self {
        let mut hasher = Sha256::new();
        let rows: Vec<RegionRow> = regions
            .regions()
            .iter()
            .map(|r| {
                hasher.update(r.start.to_le_bytes());
                hasher.update(r.end.to_le_bytes());
                RegionRow {
                    start: format!("{:#x}", r.start),
                    end: format!("{:#x}", r.end),
                    bytes: r.len(),
                    library: r.library.clone(),
                }
            })
            .collect();
        let mut sha256 = String::with_capacity(64);
        for b in hasher.finalize() {
            let _ = write!(sha256, "{b:02x}");
        }
        Self {
            source: source.to_string(),
            patterns: patterns.to_vec(),
            total_bytes: rows.iter().map(|r| r.bytes).sum(),
            regions: rows,
            sha256,
        }
    }
}
