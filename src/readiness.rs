//! Readiness channel between the stager and the streamer.
//!
//! The two processes share nothing but the storage area, so readiness is a sentinel file
//! under the shared root. The stager writes it once staging has succeeded; the streamer
//! polls for it with a bounded wait. Polling is hidden behind [`ReadinessGate`] so a
//! push-based gate can replace it without touching callers.

use crate::config::StreamConfig;
use crate::error::AppResult;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

const MARKER_PREFIX: &str = "Ready at ";

/// Outcome of a bounded wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    /// The marker was observed.
    Ready,
    /// The timeout elapsed first.
    TimedOut,
}

impl Readiness {
    /// `true` for [`Readiness::Ready`].
    pub fn is_ready(self) -> bool {
        matches!(self, Readiness::Ready)
    }
}

/// Something a process can wait on until shared storage is populated.
#[async_trait]
pub trait ReadinessGate: Send + Sync {
    /// Wait up to `timeout`. Never errors on timeout; reports [`Readiness::TimedOut`].
    async fn wait_ready(&self, timeout: Duration) -> Readiness;
}

/// Filesystem sentinel at `<shared_root>/<ready_marker>`.
#[derive(Debug, Clone)]
pub struct FileMarker {
    path: PathBuf,
    poll_interval: Duration,
    progress_interval: Duration,
}

impl FileMarker {
    /// Marker at `path`, polled every `poll_interval`.
    pub fn new(path: impl Into<PathBuf>, poll_interval: Duration) -> Self {
        Self {
            path: path.into(),
            poll_interval,
            progress_interval: Duration::from_secs(30),
        }
    }

    /// Marker described by the storage and streamer sections.
    pub fn from_config(config: &StreamConfig) -> Self {
        Self::new(
            config.storage.ready_marker_path(),
            config.streamer.ready_poll_interval(),
        )
        .with_progress_interval(config.streamer.progress_log_interval())
    }

    /// Minimum spacing between "still waiting" log lines.
    pub fn with_progress_interval(mut self, interval: Duration) -> Self {
        self.progress_interval = interval;
        self
    }

    /// Location of the sentinel.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether the sentinel currently exists.
    pub fn is_ready(&self) -> bool {
        self.path.is_file()
    }

    /// Create the sentinel. Calling it again just refreshes the timestamp.
    ///
    /// The content is written to a sibling temp file and renamed into place, so a poller
    /// never observes a half-written marker.
    pub fn signal_ready(&self) -> AppResult<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, format!("{MARKER_PREFIX}{}\n", Utc::now().to_rfc3339()))?;
        std::fs::rename(&tmp, &self.path)?;
        info!(marker = %self.path.display(), "Signaled readiness");
        Ok(())
    }

    /// Creation time recorded in the sentinel, if present and readable.
    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        let content = std::fs::read_to_string(&self.path).ok()?;
        let stamp = content.trim().strip_prefix(MARKER_PREFIX)?;
        DateTime::parse_from_rfc3339(stamp)
            .ok()
            .map(|dt| dt.with_timezone(&Utc))
    }
}

#[async_trait]
impl ReadinessGate for FileMarker {
    async fn wait_ready(&self, timeout: Duration) -> Readiness {
        let started = Instant::now();
        let deadline = started + timeout;
        let mut last_progress = started;

        info!(marker = %self.path.display(), ?timeout, "Waiting for shared storage");
        loop {
            if self.is_ready() {
                let waited = started.elapsed();
                match self.created_at() {
                    Some(at) => info!(?waited, created_at = %at, "Shared storage is ready"),
                    None => info!(?waited, "Shared storage is ready"),
                }
                return Readiness::Ready;
            }

            let now = Instant::now();
            if now >= deadline {
                warn!(
                    marker = %self.path.display(),
                    ?timeout,
                    "Gave up waiting for readiness marker"
                );
                return Readiness::TimedOut;
            }

            if now.duration_since(last_progress) >= self.progress_interval {
                info!(
                    elapsed_secs = now.duration_since(started).as_secs(),
                    "Still waiting for readiness marker"
                );
                last_progress = now;
            } else {
                debug!("Readiness marker absent");
            }

            let remaining = deadline.saturating_duration_since(now);
            tokio::time::sleep(self.poll_interval.min(remaining)).await;
        }
    }
}
