//! Shared-storage scan that turns a directory tree into a [`Catalog`].

use super::filename::{ParsedName, SortKey};
use super::{Catalog, FileRecord, Quality};
use crate::config::{FilterConfig, StorageConfig, StreamConfig};
use crate::error::{AppResult, StreamError};
use crate::readiness::ReadinessGate;
use std::collections::BTreeMap;
use tracing::{debug, error, info, warn};
use walkdir::WalkDir;

/// Wait for readiness, then scan. Returns an empty catalog if the wait times out or the
/// scan finds nothing; callers treat that as fatal.
pub async fn discover(config: &StreamConfig, gate: &dyn ReadinessGate) -> Catalog {
    match discover_checked(config, gate).await {
        Ok(catalog) => catalog,
        Err(err) => {
            error!(error = %err, "Catalog discovery failed");
            Catalog::empty()
        }
    }
}

/// Like [`discover`], but reports why no catalog was produced.
pub async fn discover_checked(
    config: &StreamConfig,
    gate: &dyn ReadinessGate,
) -> AppResult<Catalog> {
    let timeout = config.streamer.ready_timeout();
    if !gate.wait_ready(timeout).await.is_ready() {
        return Err(StreamError::ReadinessTimeout(timeout));
    }

    let storage = config.storage.clone();
    let filter = config.filter.clone();
    let catalog = tokio::task::spawn_blocking(move || scan(&storage, &filter))
        .await
        .map_err(|e| StreamError::Staging(format!("catalog scan task failed: {e}")))?;

    if catalog.is_empty() {
        return Err(StreamError::CatalogEmpty);
    }
    Ok(catalog)
}

/// Recursively enumerate data files under the shared root and order them.
///
/// Unparseable names, unreadable entries and empty files are skipped with a warning.
pub fn scan(storage: &StorageConfig, filter: &FilterConfig) -> Catalog {
    let root = &storage.shared_root;
    if !root.is_dir() {
        error!(root = %root.display(), "Shared storage root does not exist");
        return Catalog::empty();
    }
    info!(root = %root.display(), "Discovering files");

    let mut groups: BTreeMap<(String, String), QualityGroups> = BTreeMap::new();
    let mut seen = 0usize;

    for entry in WalkDir::new(root).follow_links(true) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                warn!(error = %err, "Skipping unreadable entry");
                continue;
            }
        };
        if !entry.file_type().is_file() || !storage.is_data_file(entry.path()) {
            continue;
        }
        seen += 1;

        let filename = entry.file_name().to_string_lossy().into_owned();
        let parsed = match ParsedName::parse(&filename) {
            Ok(parsed) => parsed,
            Err(err) => {
                warn!(path = %entry.path().display(), error = %err, "Skipping file with unexpected name");
                continue;
            }
        };

        if !filter.accepts(&parsed.machine, &parsed.operation) {
            debug!(
                machine = %parsed.machine,
                operation = %parsed.operation,
                %filename,
                "Skipping filtered machine or operation"
            );
            continue;
        }

        let size = match entry.metadata() {
            Ok(meta) => meta.len(),
            Err(err) => {
                warn!(path = %entry.path().display(), error = %err, "Skipping file without metadata");
                continue;
            }
        };
        if size == 0 {
            warn!(path = %entry.path().display(), "Skipping empty file");
            continue;
        }

        let quality = entry
            .path()
            .parent()
            .and_then(|dir| dir.file_name())
            .map_or(Quality::Unknown, |name| {
                Quality::from_dir_name(&name.to_string_lossy())
            });

        let key = parsed.sort_key();
        let record = FileRecord {
            path: entry.path().to_path_buf(),
            machine: parsed.machine,
            operation: parsed.operation,
            quality,
            filename,
            size,
        };
        groups
            .entry((record.machine.clone(), record.operation.clone()))
            .or_default()
            .push(record, key);
    }

    let mut records = Vec::new();
    for (_, group) in groups {
        records.extend(group.into_ordered());
    }

    let catalog = Catalog::from_ordered(records);
    info!(
        found = seen,
        eligible = catalog.len(),
        summary = %catalog.summary(),
        "Discovered files after filtering"
    );
    catalog
}

type Keyed = (FileRecord, Option<SortKey>);

/// Good (and unknown) records, then bad records, for one (machine, operation).
#[derive(Default)]
struct QualityGroups {
    good: Vec<Keyed>,
    bad: Vec<Keyed>,
}

impl QualityGroups {
    fn push(&mut self, record: FileRecord, key: Option<SortKey>) {
        match record.quality {
            Quality::Bad => self.bad.push((record, key)),
            Quality::Good | Quality::Unknown => self.good.push((record, key)),
        }
    }

    fn into_ordered(self) -> impl Iterator<Item = FileRecord> {
        sort_group(self.good)
            .into_iter()
            .chain(sort_group(self.bad))
    }
}

fn sort_group(mut group: Vec<Keyed>) -> Vec<FileRecord> {
    if group.iter().all(|(_, key)| key.is_some()) {
        group.sort_by(|(a, ka), (b, kb)| {
            ka.cmp(kb)
                .then_with(|| a.filename.cmp(&b.filename))
                .then_with(|| a.path.cmp(&b.path))
        });
    } else {
        group.sort_by(|(a, _), (b, _)| a.filename.cmp(&b.filename).then_with(|| a.path.cmp(&b.path)));
    }
    group.into_iter().map(|(record, _)| record).collect()
}
