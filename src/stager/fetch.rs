//! Corpus fetchers.
//!
//! The stager only needs "put the raw corpus at this path". Timeouts are applied by the
//! caller, which drops the fetch future and then removes the scratch directory.

use crate::config::SourceConfig;
use crate::error::{AppResult, StreamError};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::process::Command;
use tracing::{debug, info};
use walkdir::WalkDir;

/// Retrieves the full source corpus into a scratch directory.
///
/// # Cancel safety
///
/// The stager drops the future when the fetch timeout elapses and immediately cleans up
/// `dest`. Implementations must stop writing into `dest` once dropped. Work offloaded to a
/// blocking thread keeps running after the drop, so it has to watch a cancellation flag.
#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Populate `dest`, which does not exist yet.
    async fn fetch(&self, dest: &Path) -> AppResult<()>;

    /// Human-readable source description for logs.
    fn describe(&self) -> String;
}

/// Shallow `git clone` of a corpus repository.
#[derive(Debug, Clone)]
pub struct GitFetcher {
    url: String,
}

impl GitFetcher {
    /// Fetcher for the repository at `url`.
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

#[async_trait]
impl Fetcher for GitFetcher {
    async fn fetch(&self, dest: &Path) -> AppResult<()> {
        info!(url = %self.url, dest = %dest.display(), "Cloning corpus repository");
        let output = Command::new("git")
            .args(["clone", "--depth", "1", &self.url])
            .arg(dest)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await?;

        if !output.status.success() {
            return Err(StreamError::Staging(format!(
                "git clone of {} failed ({}): {}",
                self.url,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        info!(dest = %dest.display(), "Cloned corpus repository");
        Ok(())
    }

    fn describe(&self) -> String {
        format!("git:{}", self.url)
    }
}

/// Recursive copy of a corpus that already sits on local disk.
#[derive(Debug, Clone)]
pub struct LocalFetcher {
    source: PathBuf,
}

impl LocalFetcher {
    /// Fetcher copying from `source`.
    pub fn new(source: impl Into<PathBuf>) -> Self {
        Self {
            source: source.into(),
        }
    }
}

#[async_trait]
impl Fetcher for LocalFetcher {
    async fn fetch(&self, dest: &Path) -> AppResult<()> {
        if !self.source.is_dir() {
            return Err(StreamError::Staging(format!(
                "corpus directory {} does not exist",
                self.source.display()
            )));
        }
        info!(source = %self.source.display(), dest = %dest.display(), "Copying local corpus");
        let source = self.source.clone();
        let dest = dest.to_path_buf();
        let cancel = CancelOnDrop::default();
        let flag = Arc::clone(&cancel.0);
        let copied = tokio::task::spawn_blocking(move || copy_tree(&source, &dest, &flag))
            .await
            .map_err(|e| StreamError::Staging(format!("corpus copy task failed: {e}")))??;
        info!(files = copied, "Copied local corpus");
        Ok(())
    }

    fn describe(&self) -> String {
        format!("local:{}", self.source.display())
    }
}

/// Fetcher for the configured source.
pub fn fetcher_from_config(source: &SourceConfig) -> Arc<dyn Fetcher> {
    match source {
        SourceConfig::Git { url } => Arc::new(GitFetcher::new(url.clone())),
        SourceConfig::Local { path } => Arc::new(LocalFetcher::new(path.clone())),
    }
}

/// Copy every file under `source` to the same relative path under `dest`.
/// Raises its flag when dropped, including when the owning fetch future is abandoned.
#[derive(Default)]
struct CancelOnDrop(Arc<AtomicBool>);

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        self.0.store(true, Ordering::Release);
    }
}

/// Copy `source` into `dest`, checking `cancel` before every entry.
fn copy_tree(source: &Path, dest: &Path, cancel: &AtomicBool) -> AppResult<usize> {
    let mut copied = 0;
    for entry in WalkDir::new(source) {
        if cancel.load(Ordering::Acquire) {
            return Err(StreamError::Staging(format!(
                "corpus copy cancelled after {copied} files"
            )));
        }
        let entry = entry.map_err(std::io::Error::from)?;
        let Ok(rel) = entry.path().strip_prefix(source) else {
            continue;
        };
        let target = dest.join(rel);
        if entry.file_type().is_dir() {
            std::fs::create_dir_all(&target)?;
        } else if entry.file_type().is_file() {
            std::fs::copy(entry.path(), &target)?;
            copied += 1;
        } else {
            debug!(path = %entry.path().display(), "Skipping non-regular entry");
        }
    }
    Ok(copied)
}
