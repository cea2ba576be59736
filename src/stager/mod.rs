//! Data stager: populates shared storage once, signals readiness, then reports health.
//!
//! One run walks a linear state machine with no re-entry:
//!
//! ```text
//! CHECK_EXISTING ──(data found)──────────────────────────► SIGNAL_READY ─► MONITOR
//!        └──(no data)─► FETCH ─► FILTER_AND_COPY ─(n > 0)─┘
//! ```
//!
//! A failed fetch, or a copy that produced no files, stops the run before readiness is
//! signaled. The scratch location is removed after every fetch attempt.

pub mod fetch;

pub use fetch::{fetcher_from_config, Fetcher, GitFetcher, LocalFetcher};

use crate::config::{FilterConfig, StagerConfig, StorageConfig, StreamConfig};
use crate::error::{AppResult, StreamError};
use crate::readiness::FileMarker;
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};
use walkdir::WalkDir;

/// Quality directories copied from the corpus, in copy order.
const QUALITY_DIRS: [&str; 2] = ["good", "bad"];

/// Stager states, in the order a run may visit them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StagerState {
    /// Look for data left by an earlier run
    CheckExisting,
    /// Retrieve the corpus into scratch
    Fetch,
    /// Copy the eligible subset into shared storage
    FilterAndCopy,
    /// Publish the readiness marker
    SignalReady,
    /// Periodic health reporting
    Monitor,
}

impl fmt::Display for StagerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            StagerState::CheckExisting => "CHECK_EXISTING",
            StagerState::Fetch => "FETCH",
            StagerState::FilterAndCopy => "FILTER_AND_COPY",
            StagerState::SignalReady => "SIGNAL_READY",
            StagerState::Monitor => "MONITOR",
        };
        f.write_str(label)
    }
}

/// Where the staged files came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageSource {
    /// A previous run had already populated shared storage
    Existing,
    /// This run fetched and copied the corpus
    Fetched,
}

/// Result of a successful staging pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageReport {
    /// How shared storage got its data
    pub source: StageSource,
    /// Data files present (existing) or copied (fetched)
    pub files: usize,
    /// States visited, in order
    pub transitions: Vec<StagerState>,
}

/// Outcome of [`DataStager::filter_and_copy`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CopyTally {
    /// Files copied into shared storage
    pub copied: usize,
    /// Files that failed to copy
    pub failed: usize,
}

/// The staging process.
#[derive(Clone)]
pub struct DataStager {
    storage: StorageConfig,
    filter: FilterConfig,
    settings: StagerConfig,
    fetcher: Option<Arc<dyn Fetcher>>,
    marker: FileMarker,
}

impl DataStager {
    /// Stager using the configured source, if any.
    pub fn from_config(config: &StreamConfig) -> Self {
        let fetcher = config.stager.source.as_ref().map(fetcher_from_config);
        Self::with_fetcher(config, fetcher)
    }

    /// Stager with an explicit fetcher (`None` means staging can only reuse existing data).
    pub fn with_fetcher(config: &StreamConfig, fetcher: Option<Arc<dyn Fetcher>>) -> Self {
        Self {
            storage: config.storage.clone(),
            filter: config.filter.clone(),
            settings: config.stager.clone(),
            fetcher,
            marker: FileMarker::from_config(config),
        }
    }

    /// The readiness marker this stager writes.
    pub fn marker(&self) -> &FileMarker {
        &self.marker
    }

    /// Stage (if needed), signal readiness, then report health until `shutdown` fires.
    pub async fn run(&self, shutdown: oneshot::Receiver<()>) -> AppResult<StageReport> {
        let mut report = self.stage().await?;
        report.transitions.push(StagerState::Monitor);
        info!(state = %StagerState::Monitor, "Starting monitoring loop");
        self.monitor(shutdown).await;
        Ok(report)
    }

    /// Run the state machine up to and including SIGNAL_READY.
    pub async fn stage(&self) -> AppResult<StageReport> {
        let mut transitions = vec![StagerState::CheckExisting];
        info!(
            state = %StagerState::CheckExisting,
            root = %self.storage.shared_root.display(),
            "Starting data stager"
        );

        let (source, files) = if self.check_existing() {
            let files = self.count_files()?;
            info!(files, "Data already exists in shared storage, skipping fetch");
            (StageSource::Existing, files)
        } else {
            info!("No existing data found in shared storage");
            transitions.push(StagerState::Fetch);
            let fetched = self.fetch().await;
            let tally = match fetched {
                Ok(()) => {
                    transitions.push(StagerState::FilterAndCopy);
                    let this = self.clone();
                    tokio::task::spawn_blocking(move || this.filter_and_copy())
                        .await
                        .map_err(|e| StreamError::Staging(format!("copy task failed: {e}")))
                }
                Err(err) => Err(err),
            };
            self.cleanup_scratch();

            let tally = tally?;
            if tally.copied == 0 {
                error!(failed = tally.failed, "No files copied into shared storage");
                return Err(StreamError::Staging(
                    "no eligible files were copied into shared storage".to_string(),
                ));
            }
            info!(copied = tally.copied, failed = tally.failed, "Loaded corpus into shared storage");
            (StageSource::Fetched, tally.copied)
        };

        transitions.push(StagerState::SignalReady);
        self.marker.signal_ready()?;
        info!(files, "Data setup complete, streamer can discover files");

        Ok(StageReport {
            source,
            files,
            transitions,
        })
    }

    /// Whether any included machine subtree already holds a data file.
    pub fn check_existing(&self) -> bool {
        for machine in &self.filter.included_machines {
            let machine_root = self.storage.shared_root.join(machine);
            if !machine_root.is_dir() {
                continue;
            }
            let found = WalkDir::new(&machine_root)
                .into_iter()
                .filter_map(Result::ok)
                .any(|entry| entry.file_type().is_file() && self.storage.is_data_file(entry.path()));
            if found {
                info!(machine_root = %machine_root.display(), "Found existing data");
                return true;
            }
        }
        false
    }

    /// Retrieve the corpus into the scratch location, bounded by the fetch timeout.
    pub async fn fetch(&self) -> AppResult<()> {
        let fetcher = self.fetcher.as_ref().ok_or_else(|| {
            StreamError::Staging("no corpus source configured ([stager.source])".to_string())
        })?;

        let scratch = &self.settings.scratch_dir;
        if scratch.exists() {
            debug!(scratch = %scratch.display(), "Removing stale scratch directory");
            std::fs::remove_dir_all(scratch)?;
        }
        if let Some(parent) = scratch.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let timeout = self.settings.fetch_timeout();
        info!(state = %StagerState::Fetch, source = %fetcher.describe(), ?timeout, "Fetching corpus");
        match tokio::time::timeout(timeout, fetcher.fetch(scratch)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => {
                error!(error = %err, "Corpus fetch failed");
                Err(err)
            }
            Err(_) => {
                error!(?timeout, "Corpus fetch timed out");
                Err(StreamError::FetchTimeout(timeout))
            }
        }
    }

    /// Copy eligible files from scratch into shared storage.
    ///
    /// Visits each included machine, each non-excluded operation directory, and the `good`
    /// and `bad` directories beneath it. A file that fails to copy is logged and counted,
    /// and the copy continues.
    pub fn filter_and_copy(&self) -> CopyTally {
        let corpus_root = self.settings.scratch_dir.join(&self.settings.source_subdir);
        info!(state = %StagerState::FilterAndCopy, corpus = %corpus_root.display(), "Copying filtered data");
        let mut tally = CopyTally::default();

        for machine in &self.filter.included_machines {
            let source_machine = corpus_root.join(machine);
            if !source_machine.is_dir() {
                warn!(%machine, path = %source_machine.display(), "Machine directory not found in corpus");
                continue;
            }

            let operations = match operation_dirs(&source_machine, &self.filter) {
                Ok(ops) => ops,
                Err(err) => {
                    error!(%machine, error = %err, "Cannot list operations");
                    continue;
                }
            };
            info!(%machine, operations = ?operations, "Processing machine");

            for operation in operations {
                for quality in QUALITY_DIRS {
                    let source_dir = source_machine.join(&operation).join(quality);
                    if !source_dir.is_dir() {
                        debug!(path = %source_dir.display(), "Quality directory does not exist");
                        continue;
                    }
                    let target_dir = self
                        .storage
                        .shared_root
                        .join(machine)
                        .join(&operation)
                        .join(quality);
                    let group = self.copy_quality_dir(&source_dir, &target_dir);
                    if group.copied > 0 {
                        info!(%machine, %operation, quality, copied = group.copied, "Copied files");
                    }
                    tally.copied += group.copied;
                    tally.failed += group.failed;
                }
            }
        }

        info!(copied = tally.copied, failed = tally.failed, "Data copy complete");
        tally
    }

    fn copy_quality_dir(&self, source_dir: &Path, target_dir: &Path) -> CopyTally {
        let mut tally = CopyTally::default();
        if let Err(err) = std::fs::create_dir_all(target_dir) {
            error!(path = %target_dir.display(), error = %err, "Cannot create target directory");
            return tally;
        }
        let entries = match std::fs::read_dir(source_dir) {
            Ok(entries) => entries,
            Err(err) => {
                error!(path = %source_dir.display(), error = %err, "Cannot read quality directory");
                return tally;
            }
        };

        for entry in entries.filter_map(Result::ok) {
            let path = entry.path();
            if !path.is_file() || !self.storage.is_data_file(&path) {
                continue;
            }
            let target = target_dir.join(entry.file_name());
            match std::fs::copy(&path, &target) {
                Ok(_) => tally.copied += 1,
                Err(err) => {
                    error!(source = %path.display(), error = %err, "Failed to copy file");
                    tally.failed += 1;
                }
            }
        }
        tally
    }

    /// Number of data files under the included machine subtrees.
    pub fn count_files(&self) -> AppResult<usize> {
        let mut total = 0;
        for machine in &self.filter.included_machines {
            let machine_root = self.storage.shared_root.join(machine);
            if !machine_root.exists() {
                continue;
            }
            for entry in WalkDir::new(&machine_root) {
                let entry = entry.map_err(std::io::Error::from)?;
                if entry.file_type().is_file() && self.storage.is_data_file(entry.path()) {
                    total += 1;
                }
            }
        }
        Ok(total)
    }

    /// Report the file count every health interval until `shutdown` fires.
    ///
    /// A failed report waits the shorter retry interval instead. Never re-stages.
    pub async fn monitor(&self, mut shutdown: oneshot::Receiver<()>) {
        loop {
            let this = self.clone();
            let counted = tokio::task::spawn_blocking(move || this.count_files())
                .await
                .map_err(|e| StreamError::Staging(format!("health check task failed: {e}")))
                .and_then(|r| r);

            let delay = match counted {
                Ok(files) => {
                    info!(files, "Health check: files available in shared storage");
                    self.settings.health_interval()
                }
                Err(err) => {
                    error!(error = %err, "Health check failed");
                    self.settings.health_retry()
                }
            };

            tokio::select! {
                _ = &mut shutdown => {
                    info!("Stager monitor shutting down");
                    break;
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    fn cleanup_scratch(&self) {
        let scratch = &self.settings.scratch_dir;
        if !scratch.exists() {
            return;
        }
        match std::fs::remove_dir_all(scratch) {
            Ok(()) => info!(scratch = %scratch.display(), "Cleaned up scratch directory"),
            Err(err) => warn!(scratch = %scratch.display(), error = %err, "Error cleaning up scratch directory"),
        }
    }
}

/// Operation directories under a machine, minus exclusions, sorted.
fn operation_dirs(machine_dir: &Path, filter: &FilterConfig) -> std::io::Result<Vec<String>> {
    let mut operations: Vec<String> = std::fs::read_dir(machine_dir)?
        .filter_map(Result::ok)
        .filter(|entry| entry.path().is_dir())
        .map(|entry| entry.file_name().to_string_lossy().into_owned())
        .filter(|name| !name.starts_with('.') && !filter.excluded_operations.contains(name))
        .collect();
    operations.sort();
    Ok(operations)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use tempfile::TempDir;

    fn config(root: &Path, scratch: &Path) -> StreamConfig {
        let mut config = StreamConfig::default();
        config.storage.shared_root = root.to_path_buf();
        config.stager.scratch_dir = scratch.to_path_buf();
        config
    }

    fn write(path: PathBuf) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, b"payload").unwrap();
    }

    #[test]
    fn filter_and_copy_respects_filters() {
        let shared = TempDir::new().unwrap();
        let scratch = TempDir::new().unwrap();
        let corpus = scratch.path().join("data");
        write(corpus.join("M01/OP01/good/M01_Aug_2019_OP01_000.h5"));
        write(corpus.join("M01/OP01/bad/M01_Aug_2019_OP01_001.h5"));
        write(corpus.join("M01/OP01/good/readme.md"));
        write(corpus.join("M01/OP00/good/M01_Aug_2019_OP00_000.h5"));
        write(corpus.join("M01/OP02/other/M01_Aug_2019_OP02_000.h5"));
        write(corpus.join("M03/OP01/good/M03_Aug_2019_OP01_000.h5"));

        let stager = DataStager::with_fetcher(&config(shared.path(), scratch.path()), None);
        let tally = stager.filter_and_copy();

        assert_eq!(tally, CopyTally { copied: 2, failed: 0 });
        assert!(shared.path().join("M01/OP01/good/M01_Aug_2019_OP01_000.h5").is_file());
        assert!(shared.path().join("M01/OP01/bad/M01_Aug_2019_OP01_001.h5").is_file());
        assert!(!shared.path().join("M01/OP00").exists());
        assert!(!shared.path().join("M03").exists());
        assert_eq!(stager.count_files().unwrap(), 2);
    }

    #[test]
    fn check_existing_only_looks_at_included_machines() {
        let shared = TempDir::new().unwrap();
        let scratch = TempDir::new().unwrap();
        let stager = DataStager::with_fetcher(&config(shared.path(), scratch.path()), None);
        assert!(!stager.check_existing());

        write(shared.path().join("M03/OP01/good/M03_Aug_2019_OP01_000.h5"));
        assert!(!stager.check_existing());

        write(shared.path().join("M02/OP04/bad/M02_Aug_2019_OP04_000.h5"));
        assert!(stager.check_existing());
    }

    #[tokio::test]
    async fn stage_without_source_or_data_fails_before_signaling() {
        let shared = TempDir::new().unwrap();
        let scratch = TempDir::new().unwrap();
        let stager = DataStager::with_fetcher(&config(shared.path(), &scratch.path().join("s")), None);

        let err = stager.stage().await.unwrap_err();
        assert!(matches!(err, StreamError::Staging(_)));
        assert!(!stager.marker().is_ready());
    }

    #[test]
    fn states_render_like_the_state_machine() {
        assert_eq!(StagerState::FilterAndCopy.to_string(), "FILTER_AND_COPY");
        assert_eq!(StagerState::CheckExisting.to_string(), "CHECK_EXISTING");
    }
}
