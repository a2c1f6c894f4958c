//! Address ranges excluded from object tracking.
//!
//! The accelerator runtime allocates through the same `malloc` we intercept.
//! Tracking those calls would recurse into the runtime from inside itself, so
//! every mapping whose backing file matches a runtime library pattern is
//! recorded here once at start-up and the interceptor passes calls from (or
//! into) those ranges straight to the real allocator.
//!
//! The input is the `/proc/<pid>/maps` text format:
//!
//! ```text
//! 7f3a2c000000-7f3a2c021000 r-xp 00000000 08:01 131090  /usr/lib/libcuda.so.1
//! ```

use std::path::Path;

use thiserror::Error;

/// Live memory map of the current process.
pub const PROC_SELF_MAPS: &str = "/proc/self/maps";

#[derive(Debug, Error)]
pub enum RegionError {
    #[error("cannot read memory map {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed memory map line {line}: '{text}'")]
    Malformed { line: usize, text: String },
}

impl RegionError {
    /// Negative status for the C boundary.
    #[must_use]
    pub const fn code(&self) -> i32 {
        match self {
            Self::Read { .. } => -1,
            Self::Malformed { .. } => -2,
        }
    }
}

/// One excluded address range `[start, end)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExcludedRegion {
    pub start: usize,
    pub end: usize,
    pub library: String,
}

impl ExcludedRegion {
    #[must_use]
    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.start && addr < self.end
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.end == self.start
    }
}

/// Sorted, non-overlapping set of excluded ranges.
#[derive(Debug, Clone, Default)]
pub struct ExcludedRegions {
    regions: Vec<ExcludedRegion>,
}

impl ExcludedRegions {
    /// No exclusions.
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    /// Scan the live memory map of this process.
    pub fn scan<S: AsRef<str>>(patterns: &[S]) -> Result<Self, RegionError> {
        Self::scan_file(Path::new(PROC_SELF_MAPS), patterns)
    }

    /// Scan a maps-format file.
    pub fn scan_file<S: AsRef<str>>(path: &Path, patterns: &[S]) -> Result<Self, RegionError> {
        let text = std::fs::read_to_string(path).map_err(|source| RegionError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_maps(&text, patterns)
    }

    /// Build from maps-format text. Lines without a path never match.
    pub fn from_maps<S: AsRef<str>>(text: &str, patterns: &[S]) -> Result<Self, RegionError> {
        let mut regions = Vec::new();

        for (idx, line) in text.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let entry = parse_maps_line(line).ok_or_else(|| RegionError::Malformed {
                line: idx + 1,
                text: line.to_string(),
            })?;
            let Some(path) = entry.path else {
                continue;
            };
            if patterns.iter().any(|p| {
                let p = p.as_ref();
                !p.is_empty() && path.contains(p)
            }) {
                regions.push(ExcludedRegion {
                    start: entry.start,
                    end: entry.end,
                    library: path.to_string(),
                });
            }
        }

        Ok(Self::normalized(regions))
    }

    /// Build from explicit ranges (sorted and merged).
    #[must_use]
    pub fn from_regions(regions: Vec<ExcludedRegion>) -> Self {
        Self::normalized(regions)
    }

    fn normalized(mut regions: Vec<ExcludedRegion>) -> Self {
        regions.retain(|r| r.end > r.start);
        regions.sort_by_key(|r| r.start);

        let mut merged: Vec<ExcludedRegion> = Vec::with_capacity(regions.len());
        for region in regions {
            match merged.last_mut() {
                Some(last) if region.start <= last.end => {
                    last.end = last.end.max(region.end);
                    if last.library != region.library && !last.library.contains(&region.library) {
                        last.library.push(';');
                        last.library.push_str(&region.library);
                    }
                }
                _ => merged.push(region),
            }
        }

        Self { regions: merged }
    }

    /// Number of (merged) regions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.regions.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }

    #[must_use]
    pub fn regions(&self) -> &[ExcludedRegion] {
        &self.regions
    }

    /// The region containing `addr`, if any.
    #[must_use]
    pub fn find(&self, addr: usize) -> Option<&ExcludedRegion> {
        let idx = self.regions.partition_point(|r| r.end <= addr);
        self.regions.get(idx).filter(|r| r.contains(addr))
    }

    #[must_use]
    pub fn contains(&self, addr: usize) -> bool {
        self.find(addr).is_some()
    }
}

struct MapsEntry<'a> {
    start: usize,
    end: usize,
    path: Option<&'a str>,
}

fn parse_maps_line(line: &str) -> Option<MapsEntry<'_>> {
    let mut fields = line.split_ascii_whitespace();
    let range = fields.next()?;
    let (start, end) = range.split_once('-')?;
    let start = usize::from_str_radix(start, 16).ok()?;
    let end = usize::from_str_radix(end, 16).ok()?;

    // perms, offset, dev, inode
    for _ in 0..4 {
        fields.next()?;
    }

    // The pathname may contain spaces; take the remainder of the line.
    let path = line
        .splitn(6, |c: char| c.is_ascii_whitespace())
        .nth(5)
        .map(str::trim)
        .filter(|p| !p.is_empty());

    Some(MapsEntry { start, end, path })
}
