//! Configuration System using Figment
//!
//! This module provides strongly-typed configuration loading for both processes.
//! Configuration is loaded from:
//! 1. `config/stream.toml` (base configuration, optional)
//! 2. Environment variables (prefixed with `VIBRATION_STREAM_`, sections split on `__`)
//!
//! Every field carries a default, so an absent file yields a runnable configuration.
//!
//! # Example
//! ```no_run
//! use vibration_stream::config::StreamConfig;
//!
//! let config = StreamConfig::load()?;
//! config.validate()?;
//! println!("Streaming from {}", config.storage.shared_root.display());
//! # Ok::<(), vibration_stream::error::StreamError>(())
//! ```

use crate::error::{AppResult, StreamError};
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default location of the configuration file.
pub const DEFAULT_CONFIG_PATH: &str = "config/stream.toml";

/// Environment variable prefix for overrides.
pub const ENV_PREFIX: &str = "VIBRATION_STREAM_";

/// Upper bound on the readiness poll interval.
const MAX_POLL_INTERVAL_MS: u64 = 5_000;

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// Application settings
    pub application: ApplicationConfig,
    /// Shared storage layout
    pub storage: StorageConfig,
    /// Machine/operation filtering
    pub filter: FilterConfig,
    /// Data stager settings
    pub stager: StagerConfig,
    /// Streamer settings
    pub streamer: StreamerConfig,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplicationConfig {
    /// Application name
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Log output format (pretty, compact, json)
    pub log_format: String,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: "vibration-stream".to_string(),
            log_level: "info".to_string(),
            log_format: "compact".to_string(),
        }
    }
}

/// Shared storage layout: `<shared_root>/<machine>/<operation>/<good|bad>/<file>`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Root of the shared area both processes see
    pub shared_root: PathBuf,
    /// Extension of data files, without the leading dot
    pub data_extension: String,
    /// File name of the readiness sentinel under `shared_root`
    pub ready_marker: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            shared_root: PathBuf::from("/shared-data"),
            data_extension: "h5".to_string(),
            ready_marker: ".ready".to_string(),
        }
    }
}

impl StorageConfig {
    /// Full path of the readiness marker.
    pub fn ready_marker_path(&self) -> PathBuf {
        self.shared_root.join(&self.ready_marker)
    }

    /// Whether `path` carries the configured data extension.
    pub fn is_data_file(&self, path: &Path) -> bool {
        path.extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case(self.data_extension.trim_start_matches('.')))
    }
}

/// Which machines and operations take part in a run
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterConfig {
    /// Machines to stage and stream
    pub included_machines: BTreeSet<String>,
    /// Operations to leave out
    pub excluded_operations: BTreeSet<String>,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            included_machines: ["M01", "M02"].into_iter().map(String::from).collect(),
            excluded_operations: ["OP00", "OP06", "OP09", "OP13"]
                .into_iter()
                .map(String::from)
                .collect(),
        }
    }
}

impl FilterConfig {
    /// Whether a (machine, operation) pair passes the inclusion and exclusion sets.
    pub fn accepts(&self, machine: &str, operation: &str) -> bool {
        self.included_machines.contains(machine) && !self.excluded_operations.contains(operation)
    }
}

/// Where the raw corpus comes from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum SourceConfig {
    /// Shallow clone of a git repository
    Git {
        /// Repository URL
        url: String,
    },
    /// Copy of a directory already on local disk
    Local {
        /// Corpus directory
        path: PathBuf,
    },
}

/// Data stager configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StagerConfig {
    /// Corpus source; required for a fresh fetch
    pub source: Option<SourceConfig>,
    /// Private scratch location for the fetched corpus
    pub scratch_dir: PathBuf,
    /// Directory inside the corpus that holds the machine directories
    pub source_subdir: PathBuf,
    /// Fetch timeout in seconds
    pub fetch_timeout_secs: u64,
    /// Interval between health reports in seconds
    pub health_interval_secs: u64,
    /// Backoff after a failed health report in seconds
    pub health_retry_secs: u64,
}

impl Default for StagerConfig {
    fn default() -> Self {
        Self {
            source: None,
            scratch_dir: PathBuf::from("/tmp/vibration-stream-scratch"),
            source_subdir: PathBuf::from("data"),
            fetch_timeout_secs: 300,
            health_interval_secs: 300,
            health_retry_secs: 60,
        }
    }
}

impl StagerConfig {
    /// Fetch timeout as a `Duration`.
    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }

    /// Health report interval as a `Duration`.
    pub fn health_interval(&self) -> Duration {
        Duration::from_secs(self.health_interval_secs)
    }

    /// Health report backoff as a `Duration`.
    pub fn health_retry(&self) -> Duration {
        Duration::from_secs(self.health_retry_secs)
    }
}

/// One projected column of the dataset
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AxisConfig {
    /// Axis label, used in the published value name
    pub name: String,
    /// Zero-based column in the dataset
    pub column: usize,
}

impl AxisConfig {
    /// Build an axis mapping.
    pub fn new(name: impl Into<String>, column: usize) -> Self {
        Self {
            name: name.into(),
            column,
        }
    }
}

/// Streamer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamerConfig {
    /// Rows per published batch
    pub batch_size: usize,
    /// Publication period in milliseconds
    pub tick_interval_ms: u64,
    /// How long to wait for the readiness marker, in seconds
    pub ready_timeout_secs: u64,
    /// Readiness poll period in milliseconds
    pub ready_poll_interval_ms: u64,
    /// Minimum spacing of "still waiting" log lines, in seconds
    pub progress_log_interval_secs: u64,
    /// Dataset path inside each data file
    pub dataset: String,
    /// Columns to project and publish
    pub axes: Vec<AxisConfig>,
    /// Consecutive open failures before a file is skipped (0 = never skip)
    pub max_open_attempts: u32,
}

impl Default for StreamerConfig {
    fn default() -> Self {
        Self {
            batch_size: 10,
            tick_interval_ms: 1000,
            ready_timeout_secs: 600,
            ready_poll_interval_ms: 2000,
            progress_log_interval_secs: 30,
            dataset: "vibration_data".to_string(),
            axes: vec![
                AxisConfig::new("X", 0),
                AxisConfig::new("Y", 1),
                AxisConfig::new("Z", 2),
            ],
            max_open_attempts: 5,
        }
    }
}

impl StreamerConfig {
    /// Tick period as a `Duration`.
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    /// Readiness timeout as a `Duration`.
    pub fn ready_timeout(&self) -> Duration {
        Duration::from_secs(self.ready_timeout_secs)
    }

    /// Readiness poll period as a `Duration`.
    pub fn ready_poll_interval(&self) -> Duration {
        Duration::from_millis(self.ready_poll_interval_ms)
    }

    /// Progress log spacing as a `Duration`.
    pub fn progress_log_interval(&self) -> Duration {
        Duration::from_secs(self.progress_log_interval_secs)
    }
}

impl StreamConfig {
    /// Load configuration from `config/stream.toml` and environment variables
    ///
    /// Environment variables override the file with prefix `VIBRATION_STREAM_`.
    /// Example: `VIBRATION_STREAM_STREAMER__BATCH_SIZE=20`
    pub fn load() -> AppResult<Self> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load configuration from a specific file path
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let config = Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()?;
        Ok(config)
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> AppResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.to_lowercase().as_str()) {
            return Err(invalid(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        let valid_formats = ["pretty", "compact", "json"];
        if !valid_formats.contains(&self.application.log_format.to_lowercase().as_str()) {
            return Err(invalid(format!(
                "Invalid log_format '{}'. Must be one of: {}",
                self.application.log_format,
                valid_formats.join(", ")
            )));
        }

        if self.storage.data_extension.trim_start_matches('.').is_empty() {
            return Err(invalid("data_extension must not be empty".to_string()));
        }

        if self.filter.included_machines.is_empty() {
            return Err(invalid("included_machines must name at least one machine".to_string()));
        }

        let streamer = &self.streamer;
        if streamer.batch_size == 0 {
            return Err(invalid("batch_size must be greater than zero".to_string()));
        }
        if streamer.tick_interval_ms == 0 {
            return Err(invalid("tick_interval_ms must be greater than zero".to_string()));
        }
        if streamer.ready_poll_interval_ms == 0 || streamer.ready_poll_interval_ms > MAX_POLL_INTERVAL_MS
        {
            return Err(invalid(format!(
                "ready_poll_interval_ms must be within 1..={MAX_POLL_INTERVAL_MS}, got {}",
                streamer.ready_poll_interval_ms
            )));
        }
        if streamer.axes.is_empty() {
            return Err(invalid("at least one axis must be configured".to_string()));
        }

        let mut names = HashSet::new();
        for axis in &streamer.axes {
            if !names.insert(axis.name.as_str()) {
                return Err(invalid(format!("Duplicate axis name: {}", axis.name)));
            }
        }

        Ok(())
    }
}

fn invalid(message: String) -> StreamError {
    StreamError::Configuration(message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;

    #[test]
    fn defaults_are_valid() {
        let config = StreamConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.streamer.batch_size, 10);
        assert_eq!(config.storage.ready_marker_path(), PathBuf::from("/shared-data/.ready"));
        assert!(config.filter.accepts("M01", "OP01"));
        assert!(!config.filter.accepts("M03", "OP01"));
        assert!(!config.filter.accepts("M02", "OP06"));
    }

    #[test]
    fn loads_file_and_env_overrides() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "stream.toml",
                r#"
                [storage]
                shared_root = "/data/shared"

                [filter]
                included_machines = ["M03"]

                [stager.source]
                kind = "git"
                url = "https://example.org/corpus.git"

                [[streamer.axes]]
                name = "X"
                column = 0
                "#,
            )?;
            jail.set_env("VIBRATION_STREAM_STREAMER__BATCH_SIZE", "25");

            let config = StreamConfig::load_from("stream.toml").map_err(|e| e.to_string())?;
            assert_eq!(config.storage.shared_root, PathBuf::from("/data/shared"));
            assert!(config.filter.included_machines.contains("M03"));
            assert_eq!(config.streamer.batch_size, 25);
            assert_eq!(config.streamer.axes, vec![AxisConfig::new("X", 0)]);
            assert_eq!(
                config.stager.source,
                Some(SourceConfig::Git {
                    url: "https://example.org/corpus.git".to_string()
                })
            );
            // untouched sections keep their defaults
            assert_eq!(config.storage.data_extension, "h5");
            Ok(())
        });
    }

    #[test]
    fn missing_file_yields_defaults() {
        Jail::expect_with(|_jail| {
            let config = StreamConfig::load_from("absent.toml").map_err(|e| e.to_string())?;
            assert_eq!(config.streamer.tick_interval_ms, 1000);
            Ok(())
        });
    }

    #[test]
    fn rejects_invalid_values() {
        let mut config = StreamConfig::default();
        config.streamer.batch_size = 0;
        assert!(config.validate().is_err());

        let mut config = StreamConfig::default();
        config.application.log_level = "loud".to_string();
        assert!(config.validate().is_err());

        let mut config = StreamConfig::default();
        config.streamer.ready_poll_interval_ms = 30_000;
        assert!(config.validate().is_err());

        let mut config = StreamConfig::default();
        config.streamer.axes.push(AxisConfig::new("X", 3));
        assert!(matches!(config.validate(), Err(StreamError::Configuration(_))));
    }

    #[test]
    fn recognises_data_files() {
        let storage = StorageConfig::default();
        assert!(storage.is_data_file(Path::new("/a/M01_Aug_2019_OP01_000.h5")));
        assert!(storage.is_data_file(Path::new("/a/M01_Aug_2019_OP01_000.H5")));
        assert!(!storage.is_data_file(Path::new("/a/.ready")));
        assert!(!storage.is_data_file(Path::new("/a/notes.txt")));
    }
}
