//! Rotation engine: walks the catalog batch by batch, forever.
//!
//! The engine owns the [`Cursor`] and the single open dataset handle. Each call to
//! [`RotationEngine::next_batch`] either continues the current file or rolls over to the
//! next catalog entry (wrapping after the last one) and then reads one batch. Batches never
//! cross a file boundary; the last batch of a file may be short.
//!
//! If a rollover target cannot be opened the tick fails and the cursor stays put, so the
//! same rollover is attempted on the next tick. After `max_open_attempts` consecutive
//! failures the target is skipped (`0` disables skipping).
//!
//! Rollover metadata stays pending until a tick carrying it is returned, so a read that
//! fails right after a rollover does not lose the new file's metadata.

use crate::catalog::{Catalog, FileRecord, Quality};
use crate::config::{AxisConfig, StreamerConfig};
use crate::error::{AppResult, StreamError};
use crate::reader::{DatasetHandle, DatasetReader};
use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};

/// Streaming position.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Cursor {
    /// Index into the catalog
    pub file_index: usize,
    /// Row offset of the next batch within the current file
    pub sample_offset: usize,
}

/// File-level values republished on every rollover.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileMetadata {
    /// Catalog index of the file
    pub file_index: usize,
    /// Catalog length
    pub total_files: usize,
    /// Raw file name
    pub filename: String,
    /// Machine id
    pub machine: String,
    /// Operation code
    pub operation: String,
    /// Quality label
    pub quality: Quality,
    /// Rows in the file
    pub row_count: usize,
}

impl FileMetadata {
    fn new(file_index: usize, total_files: usize, record: &FileRecord, row_count: usize) -> Self {
        Self {
            file_index,
            total_files,
            filename: record.filename.clone(),
            machine: record.machine.clone(),
            operation: record.operation.clone(),
            quality: record.quality,
            row_count,
        }
    }
}

/// One projected column of a batch.
#[derive(Debug, Clone, PartialEq)]
pub struct AxisSeries {
    /// Axis label
    pub name: String,
    /// Values, one per row
    pub values: Vec<f64>,
}

/// Rows `[sample_offset, sample_offset + len)` of one file, split per axis.
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    /// Catalog index of the source file
    pub file_index: usize,
    /// First row of the batch
    pub sample_offset: usize,
    /// Number of rows
    pub len: usize,
    /// Per-axis values
    pub axes: Vec<AxisSeries>,
    /// Wall-clock time the batch was read
    pub timestamp: DateTime<Utc>,
    /// Whether this is the file's last batch
    pub is_final: bool,
}

/// Everything one tick produced.
#[derive(Debug, Clone, PartialEq)]
pub struct Tick {
    /// Metadata of a newly opened file, to publish before the batch
    pub rollover: Option<FileMetadata>,
    /// Whether the rollover wrapped around to an earlier catalog entry
    pub wrapped: bool,
    /// The batch itself
    pub batch: Batch,
}

struct OpenFile<H> {
    handle: H,
    row_count: usize,
}

/// Cursor, open handle and batch geometry for one streaming run.
pub struct RotationEngine<R: DatasetReader> {
    catalog: Catalog,
    reader: R,
    batch_size: usize,
    axes: Vec<AxisConfig>,
    max_open_attempts: u32,
    cursor: Cursor,
    current: Option<OpenFile<R::Handle>>,
    started: bool,
    open_failures: u32,
    pending_rollover: Option<(FileMetadata, bool)>,
}

impl<R: DatasetReader> RotationEngine<R> {
    /// Engine over a non-empty catalog.
    pub fn new(catalog: Catalog, reader: R, settings: &StreamerConfig) -> AppResult<Self> {
        if catalog.is_empty() {
            return Err(StreamError::CatalogEmpty);
        }
        if settings.batch_size == 0 {
            return Err(StreamError::Configuration(
                "batch_size must be greater than zero".to_string(),
            ));
        }
        Ok(Self {
            catalog,
            reader,
            batch_size: settings.batch_size,
            axes: settings.axes.clone(),
            max_open_attempts: settings.max_open_attempts,
            cursor: Cursor::default(),
            current: None,
            started: false,
            open_failures: 0,
            pending_rollover: None,
        })
    }

    /// Current position.
    pub fn cursor(&self) -> Cursor {
        self.cursor
    }

    /// The catalog being streamed.
    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    /// Rows per batch.
    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Record under the cursor.
    pub fn current_record(&self) -> Option<&FileRecord> {
        self.catalog.get(self.cursor.file_index)
    }

    /// Produce the next batch, rolling over first if the current file is exhausted.
    pub fn next_batch(&mut self) -> AppResult<Tick> {
        if self.needs_rollover() {
            self.pending_rollover = Some(self.roll_over()?);
        }

        let batch_size = self.batch_size;
        let file_index = self.cursor.file_index;
        let start = self.cursor.sample_offset;
        let open = self
            .current
            .as_mut()
            .ok_or_else(|| StreamError::Reader("no dataset open after rollover".to_string()))?;
        let end = start.saturating_add(batch_size).min(open.row_count);

        let block = open.handle.read_rows(start, end)?;
        let axes = self
            .axes
            .iter()
            .map(|axis| {
                block.column(axis.column).map(|values| AxisSeries {
                    name: axis.name.clone(),
                    values,
                })
            })
            .collect::<AppResult<Vec<_>>>()?;

        let batch = Batch {
            file_index,
            sample_offset: start,
            len: end - start,
            axes,
            timestamp: Utc::now(),
            is_final: end == open.row_count,
        };
        self.cursor.sample_offset = start.saturating_add(batch_size);

        let (rollover, wrapped) = match self.pending_rollover.take() {
            Some((meta, wrapped)) => (Some(meta), wrapped),
            None => (None, false),
        };
        Ok(Tick {
            rollover,
            wrapped,
            batch,
        })
    }

    /// Undo `tick` so its batch, and its rollover metadata if any, come out of the next
    /// call again.
    ///
    /// Used when publishing the tick failed. Has no effect once the engine has moved to
    /// another file.
    pub fn rewind(&mut self, tick: &Tick) {
        let batch = &tick.batch;
        if batch.file_index != self.cursor.file_index || self.current.is_none() {
            return;
        }
        self.cursor.sample_offset = batch.sample_offset;
        if let Some(meta) = &tick.rollover {
            self.pending_rollover = Some((meta.clone(), tick.wrapped));
        }
    }

    fn needs_rollover(&self) -> bool {
        match &self.current {
            Some(open) => self.cursor.sample_offset >= open.row_count,
            None => true,
        }
    }

    /// Open the next catalog entry. On failure the cursor is left where it was.
    fn roll_over(&mut self) -> AppResult<(FileMetadata, bool)> {
        let total = self.catalog.len();
        let origin = self.cursor.file_index;
        let was_started = self.started;
        let mut target = if self.started {
            (origin + 1) % total
        } else {
            origin
        };

        // release the previous file before opening the next
        self.current = None;

        let mut empty_seen = 0;
        loop {
            let record = self
                .catalog
                .get(target)
                .ok_or_else(|| StreamError::Reader(format!("catalog index {target} out of range")))?;

            let handle = match self.reader.open(&record.path) {
                Ok(handle) => handle,
                Err(err) => {
                    self.open_failures += 1;
                    if self.max_open_attempts > 0 && self.open_failures >= self.max_open_attempts {
                        error!(
                            file_index = target,
                            file = %record.filename,
                            attempts = self.open_failures,
                            error = %err,
                            "Giving up on file, skipping to next catalog entry"
                        );
                        self.mark_exhausted(target);
                    } else {
                        warn!(
                            file_index = target,
                            file = %record.filename,
                            attempt = self.open_failures,
                            error = %err,
                            "Failed to open next file, will retry next tick"
                        );
                    }
                    return Err(err);
                }
            };
            self.open_failures = 0;

            let row_count = handle.row_count();
            if row_count == 0 {
                warn!(file_index = target, file = %record.filename, "File has no rows, skipping");
                drop(handle);
                self.mark_exhausted(target);
                empty_seen += 1;
                if empty_seen >= total {
                    return Err(StreamError::Reader(
                        "every file in the catalog is empty".to_string(),
                    ));
                }
                target = (target + 1) % total;
                continue;
            }

            let wrapped = was_started && target <= origin;
            if wrapped {
                info!(total_files = total, "Completed all files, restarting from first file");
            }
            info!(
                file_index = target,
                total_files = total,
                machine = %record.machine,
                operation = %record.operation,
                quality = %record.quality,
                rows = row_count,
                "Loaded file {}/{}",
                target + 1,
                total
            );
            debug!(columns = handle.column_count(), path = %record.path.display(), "Dataset layout");

            let meta = FileMetadata::new(target, total, record, row_count);
            self.cursor = Cursor {
                file_index: target,
                sample_offset: 0,
            };
            self.current = Some(OpenFile { handle, row_count });
            self.started = true;
            return Ok((meta, wrapped));
        }
    }

    /// Park the cursor on `index` with nothing open, so the next rollover moves past it.
    fn mark_exhausted(&mut self, index: usize) {
        self.cursor = Cursor {
            file_index: index,
            sample_offset: 0,
        };
        self.current = None;
        self.started = true;
        self.open_failures = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reader::MockDatasetReader;
    use std::path::PathBuf;

    fn record(name: &str) -> FileRecord {
        FileRecord {
            path: PathBuf::from(format!("/shared-data/{name}")),
            machine: "M01".to_string(),
            operation: "OP01".to_string(),
            quality: Quality::Good,
            filename: name.to_string(),
            size: 1,
        }
    }

    fn settings(batch_size: usize, max_open_attempts: u32) -> StreamerConfig {
        StreamerConfig {
            batch_size,
            max_open_attempts,
            ..Default::default()
        }
    }

    fn engine(
        files: &[(&str, usize)],
        batch_size: usize,
        max_open_attempts: u32,
    ) -> (RotationEngine<MockDatasetReader>, MockDatasetReader) {
        let reader = MockDatasetReader::new();
        for (name, rows) in files {
            reader.insert_ramp(format!("/shared-data/{name}"), *rows, 3);
        }
        let catalog = Catalog::from_ordered(files.iter().map(|(n, _)| record(n)).collect());
        let engine =
            RotationEngine::new(catalog, reader.clone(), &settings(batch_size, max_open_attempts))
                .unwrap();
        (engine, reader)
    }

    #[test]
    fn first_tick_opens_first_file() {
        let (mut engine, _) = engine(&[("a.h5", 25), ("b.h5", 5)], 10, 3);
        let tick = engine.next_batch().unwrap();

        let meta = tick.rollover.unwrap();
        assert_eq!(meta.file_index, 0);
        assert_eq!(meta.row_count, 25);
        assert!(!tick.wrapped);
        assert_eq!(tick.batch.axes.len(), 3);
        assert_eq!(tick.batch.axes[0].values, (0..10).map(f64::from).collect::<Vec<_>>());
        assert_eq!(engine.cursor(), Cursor { file_index: 0, sample_offset: 10 });
    }

    #[test]
    fn short_final_batch_then_rollover() {
        let (mut engine, _) = engine(&[("a.h5", 25), ("b.h5", 5)], 10, 3);
        let lens: Vec<usize> = (0..3).map(|_| engine.next_batch().unwrap().batch.len).collect();
        assert_eq!(lens, vec![10, 10, 5]);

        let tick = engine.next_batch().unwrap();
        assert_eq!(tick.rollover.as_ref().map(|m| m.filename.as_str()), Some("b.h5"));
        assert_eq!(tick.batch.sample_offset, 0);
        assert_eq!(tick.batch.len, 5);
        assert!(tick.batch.is_final);
    }

    #[test]
    fn wraps_to_first_file() {
        let (mut engine, _) = engine(&[("a.h5", 10), ("b.h5", 10)], 10, 3);
        engine.next_batch().unwrap();
        engine.next_batch().unwrap();
        let tick = engine.next_batch().unwrap();
        assert!(tick.wrapped);
        assert_eq!(tick.rollover.unwrap().file_index, 0);
    }

    #[test]
    fn single_file_catalog_loops_on_itself() {
        let (mut engine, reader) = engine(&[("a.h5", 4)], 3, 3);
        for _ in 0..6 {
            engine.next_batch().unwrap();
        }
        assert_eq!(reader.opened().len(), 3);
        assert_eq!(engine.cursor().file_index, 0);
    }

    #[test]
    fn keeps_one_handle_open() {
        let (mut engine, reader) = engine(&[("a.h5", 2), ("b.h5", 2), ("c.h5", 2)], 2, 3);
        for _ in 0..7 {
            engine.next_batch().unwrap();
            assert_eq!(reader.live_handles(), 1);
        }
    }

    #[test]
    fn open_failure_keeps_cursor_and_retries() {
        let (mut engine, reader) = engine(&[("a.h5", 5), ("b.h5", 5)], 5, 0);
        reader.fail_opens("/shared-data/b.h5", Some(2));
        engine.next_batch().unwrap();

        assert!(matches!(engine.next_batch(), Err(StreamError::FileOpen { .. })));
        assert_eq!(engine.cursor(), Cursor { file_index: 0, sample_offset: 5 });
        assert!(engine.next_batch().is_err());

        let tick = engine.next_batch().unwrap();
        assert_eq!(tick.rollover.unwrap().file_index, 1);
    }

    #[test]
    fn persistent_open_failure_is_skipped_after_limit() {
        let (mut engine, reader) = engine(&[("a.h5", 5), ("b.h5", 5), ("c.h5", 5)], 5, 2);
        reader.fail_opens("/shared-data/b.h5", None);
        engine.next_batch().unwrap();

        assert!(engine.next_batch().is_err());
        assert!(engine.next_batch().is_err());
        let tick = engine.next_batch().unwrap();
        assert_eq!(tick.rollover.unwrap().filename, "c.h5");
    }

    #[test]
    fn empty_files_roll_straight_through() {
        let (mut engine, _) = engine(&[("a.h5", 0), ("b.h5", 3)], 5, 3);
        let tick = engine.next_batch().unwrap();
        assert_eq!(tick.rollover.unwrap().filename, "b.h5");
        assert_eq!(tick.batch.len, 3);
    }

    #[test]
    fn all_empty_catalog_errors_instead_of_spinning() {
        let (mut engine, _) = engine(&[("a.h5", 0), ("b.h5", 0)], 5, 3);
        assert!(matches!(engine.next_batch(), Err(StreamError::Reader(_))));
    }

    #[test]
    fn rewind_replays_batch() {
        let (mut engine, _) = engine(&[("a.h5", 20)], 10, 3);
        engine.next_batch().unwrap();
        let tick = engine.next_batch().unwrap();
        engine.rewind(&tick);

        let again = engine.next_batch().unwrap();
        assert_eq!(again.batch.sample_offset, 10);
        assert_eq!(again.batch.axes, tick.batch.axes);
        assert!(again.rollover.is_none());
    }

    #[test]
    fn rewind_of_rollover_tick_replays_metadata() {
        let (mut engine, _) = engine(&[("a.h5", 4), ("b.h5", 4)], 4, 3);
        engine.next_batch().unwrap();
        let tick = engine.next_batch().unwrap();
        assert_eq!(tick.rollover.as_ref().map(|m| m.file_index), Some(1));
        engine.rewind(&tick);

        let again = engine.next_batch().unwrap();
        assert_eq!(again.rollover, tick.rollover);
        assert_eq!(again.batch.sample_offset, 0);
    }

    #[test]
    fn failed_read_after_rollover_keeps_metadata_pending() {
        let (mut engine, reader) = engine(&[("a.h5", 4), ("b.h5", 4)], 4, 3);
        reader.fail_reads("/shared-data/b.h5", Some(1));
        engine.next_batch().unwrap();

        assert!(matches!(engine.next_batch(), Err(StreamError::Reader(_))));
        assert_eq!(engine.cursor(), Cursor { file_index: 1, sample_offset: 0 });

        let tick = engine.next_batch().unwrap();
        let meta = tick.rollover.unwrap();
        assert_eq!(meta.filename, "b.h5");
        assert_eq!(meta.row_count, 4);
        assert_eq!(tick.batch.sample_offset, 0);
        assert_eq!(reader.opened().len(), 2);

        let next = engine.next_batch().unwrap();
        assert_eq!(next.rollover.unwrap().file_index, 0);
    }

    #[test]
    fn rejects_empty_catalog() {
        let result = RotationEngine::new(Catalog::empty(), MockDatasetReader::new(), &settings(10, 3));
        assert!(matches!(result, Err(StreamError::CatalogEmpty)));
    }
}
