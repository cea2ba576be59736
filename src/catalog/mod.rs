//! Catalog of eligible source files for one streaming run.
//!
//! The catalog is built once per process by [`discover`] and never mutated afterwards.
//! Its order is fully determined by the file set:
//!
//! - groups by (machine, operation), ascending
//! - `good` records before `bad` records within a group (`unknown` counts as good)
//! - within a quality group, by the composite [`filename::SortKey`]; if any file in the
//!   group lacks a parseable key the whole group falls back to file-name order

pub mod discover;
pub mod filename;

pub use discover::{discover, discover_checked, scan};

use serde::Serialize;
use std::collections::BTreeSet;
use std::fmt;
use std::path::PathBuf;

/// Classification derived from the enclosing directory name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Quality {
    /// File lives under a `good` directory
    Good,
    /// File lives under a `bad` directory
    Bad,
    /// Any other enclosing directory
    Unknown,
}

impl Quality {
    /// Quality for an enclosing directory name.
    pub fn from_dir_name(name: &str) -> Self {
        match name {
            "good" => Quality::Good,
            "bad" => Quality::Bad,
            _ => Quality::Unknown,
        }
    }

    /// Lowercase label as published.
    pub fn as_str(self) -> &'static str {
        match self {
            Quality::Good => "good",
            Quality::Bad => "bad",
            Quality::Unknown => "unknown",
        }
    }
}

impl fmt::Display for Quality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One discovered source file. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileRecord {
    /// Absolute path in shared storage
    pub path: PathBuf,
    /// Machine id parsed from the name
    pub machine: String,
    /// Operation code parsed from the name
    pub operation: String,
    /// Quality from the enclosing directory
    pub quality: Quality,
    /// Raw file name
    pub filename: String,
    /// Size in bytes
    pub size: u64,
}

/// Ordered, non-growing list of [`FileRecord`]s.
#[derive(Debug, Clone, Default)]
pub struct Catalog {
    records: Vec<FileRecord>,
}

impl Catalog {
    /// Wrap records that are already in catalog order.
    pub(crate) fn from_ordered(records: Vec<FileRecord>) -> Self {
        Self { records }
    }

    /// Catalog with no entries, the result of a failed readiness wait.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether there is nothing to stream.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Entry at `index`.
    pub fn get(&self, index: usize) -> Option<&FileRecord> {
        self.records.get(index)
    }

    /// Entries in catalog order.
    pub fn iter(&self) -> std::slice::Iter<'_, FileRecord> {
        self.records.iter()
    }

    /// Entries as a slice.
    pub fn records(&self) -> &[FileRecord] {
        &self.records
    }

    /// Aggregate counts for logging.
    pub fn summary(&self) -> CatalogSummary {
        let mut summary = CatalogSummary::default();
        for record in &self.records {
            summary.machines.insert(record.machine.clone());
            summary.operations.insert(record.operation.clone());
            summary.total_bytes += record.size;
            match record.quality {
                Quality::Good => summary.good += 1,
                Quality::Bad => summary.bad += 1,
                Quality::Unknown => summary.unknown += 1,
            }
        }
        summary
    }
}

impl<'a> IntoIterator for &'a Catalog {
    type Item = &'a FileRecord;
    type IntoIter = std::slice::Iter<'a, FileRecord>;

    fn into_iter(self) -> Self::IntoIter {
        self.records.iter()
    }
}

/// Counts by machine, operation and quality.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CatalogSummary {
    /// Distinct machines
    pub machines: BTreeSet<String>,
    /// Distinct operations
    pub operations: BTreeSet<String>,
    /// Records labelled good
    pub good: usize,
    /// Records labelled bad
    pub bad: usize,
    /// Records with no recognised quality directory
    pub unknown: usize,
    /// Sum of file sizes
    pub total_bytes: u64,
}

impl CatalogSummary {
    /// Total number of records.
    pub fn files(&self) -> usize {
        self.good + self.bad + self.unknown
    }
}

impl fmt::Display for CatalogSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let join = |set: &BTreeSet<String>| set.iter().cloned().collect::<Vec<_>>().join(", ");
        write!(
            f,
            "{} files ({} bytes); machines: [{}]; operations: [{}]; good: {}, bad: {}, unknown: {}",
            self.files(),
            self.total_bytes,
            join(&self.machines),
            join(&self.operations),
            self.good,
            self.bad,
            self.unknown
        )
    }
}
