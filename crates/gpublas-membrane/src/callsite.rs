//! Call-site table: recognizes recurring allocation patterns.
//!
//! Records are keyed by the composite [`SiteKey`] `(symbol, call-site,
//! requested size)` and the target placement, so repeated allocations from
//! the same pattern share one `Arc<AllocationRecord>` instead of rebuilding
//! it. Entries live for the whole process; there is no eviction.
//!
//! A tracking definition file can *pin* patterns: pinned keys always go to
//! the managed (device-visible) allocator regardless of the heuristic.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::record::{AllocSym, AllocationRecord, CallSite, Placement};

/// Composite lookup key for an allocation pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SiteKey {
    pub alloc: AllocSym,
    pub call_site: CallSite,
    #[serde(rename = "size")]
    pub requested: usize,
}

impl SiteKey {
    #[must_use]
    pub const fn new(alloc: AllocSym, call_site: CallSite, requested: usize) -> Self {
        Self {
            alloc,
            call_site,
            requested,
        }
    }
}

#[derive(Debug, Error)]
pub enum DefinitionError {
    #[error("cannot read tracking definition {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("tracking definition line {line}: {message}")]
    Parse { line: usize, message: String },
}

/// Patterns loaded from an object-tracking definition file.
///
/// One JSON object per line: `{"alloc": "malloc", "call_site": "0x4005d6", "size": 4096}`.
/// Blank lines and lines starting with `#` are skipped.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TrackingDefinition {
    pub entries: Vec<SiteKey>,
}

impl TrackingDefinition {
    pub fn load(path: &Path) -> Result<Self, DefinitionError> {
        let text = std::fs::read_to_string(path).map_err(|source| DefinitionError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::parse(&text)
    }

    pub fn parse(text: &str) -> Result<Self, DefinitionError> {
        let mut entries = Vec::new();
        for (idx, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let key: SiteKey = serde_json::from_str(line).map_err(|e| DefinitionError::Parse {
                line: idx + 1,
                message: e.to_string(),
            })?;
            entries.push(key);
        }
        Ok(Self { entries })
    }
}

/// Deduplicating store of allocation records.
#[derive(Debug, Default)]
pub struct CallSiteTable {
    records: HashMap<(SiteKey, Placement), Arc<AllocationRecord>>,
    pinned: HashSet<SiteKey>,
}

impl CallSiteTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Existing record for `key` at `target`, if any.
    #[must_use]
    pub fn lookup(&self, key: &SiteKey, target: Placement) -> Option<Arc<AllocationRecord>> {
        self.records.get(&(*key, target)).cloned()
    }

    /// Return the record for `(key, target)`, building it with `make` only if
    /// absent. Returns `(record, inserted)`.
    pub fn lookup_or_insert(
        &mut self,
        key: SiteKey,
        target: Placement,
        make: impl FnOnce() -> AllocationRecord,
    ) -> (Arc<AllocationRecord>, bool) {
        if let Some(existing) = self.records.get(&(key, target)) {
            return (Arc::clone(existing), false);
        }
        let record = Arc::new(make());
        self.records.insert((key, target), Arc::clone(&record));
        (record, true)
    }

    /// Pin every entry of a definition to device placement.
    pub fn pin(&mut self, definition: &TrackingDefinition) -> usize {
        let before = self.pinned.len();
        self.pinned.extend(definition.entries.iter().copied());
        self.pinned.len() - before
    }

    #[must_use]
    pub fn is_pinned(&self, key: &SiteKey) -> bool {
        self.pinned.contains(key)
    }

    #[must_use]
    pub fn pinned_len(&self) -> usize {
        self.pinned.len()
    }

    /// Number of distinct records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
