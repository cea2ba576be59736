//! Fixed-interval publication loop.
//!
//! Every tick asks the [`RotationEngine`] for the next batch and writes it to the
//! [`TelemetrySink`] as one group, file metadata first when the tick rolled over. A failing
//! tick is logged and counted; the loop only ends when the shutdown channel fires, and that
//! is only observed between ticks so a batch is never half-published.

use crate::error::AppResult;
use crate::reader::DatasetReader;
use crate::rotation::{Batch, FileMetadata, RotationEngine, Tick};
use crate::sink::{TelemetrySink, TelemetryValue};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Published variable names.
pub mod names {
    /// Catalog length
    pub const TOTAL_FILES: &str = "TotalFiles";
    /// Catalog index of the current file
    pub const CURRENT_FILE_INDEX: &str = "CurrentFileIndex";
    /// File name of the current file
    pub const CURRENT_FILE_NAME: &str = "CurrentFileName";
    /// Machine id of the current file
    pub const CURRENT_MACHINE: &str = "CurrentMachine";
    /// Operation code of the current file
    pub const CURRENT_OPERATION: &str = "CurrentOperation";
    /// Quality label of the current file
    pub const CURRENT_QUALITY: &str = "CurrentQuality";
    /// Rows in the current file
    pub const TOTAL_SAMPLES: &str = "TotalSamples";
    /// First row of the last published batch
    pub const CURRENT_SAMPLE_INDEX: &str = "CurrentSampleIndex";
    /// Publication time of the last batch, seconds since the Unix epoch
    pub const TIMESTAMP: &str = "Timestamp";

    /// Array variable for one axis, e.g. `VibrationXBatch`.
    pub fn axis_batch(axis: &str) -> String {
        format!("Vibration{axis}Batch")
    }
}

/// Values announcing a newly opened file.
pub fn metadata_values(meta: &FileMetadata) -> Vec<(String, TelemetryValue)> {
    vec![
        (names::TOTAL_FILES.into(), TelemetryValue::count(meta.total_files)),
        (names::CURRENT_FILE_INDEX.into(), TelemetryValue::count(meta.file_index)),
        (names::CURRENT_FILE_NAME.into(), meta.filename.as_str().into()),
        (names::CURRENT_MACHINE.into(), meta.machine.as_str().into()),
        (names::CURRENT_OPERATION.into(), meta.operation.as_str().into()),
        (names::CURRENT_QUALITY.into(), meta.quality.as_str().into()),
        (names::TOTAL_SAMPLES.into(), TelemetryValue::count(meta.row_count)),
    ]
}

/// Values carrying one batch.
pub fn batch_values(batch: &Batch) -> Vec<(String, TelemetryValue)> {
    let mut values: Vec<(String, TelemetryValue)> = batch
        .axes
        .iter()
        .map(|axis| (names::axis_batch(&axis.name), axis.values.clone().into()))
        .collect();
    values.push((
        names::CURRENT_SAMPLE_INDEX.into(),
        TelemetryValue::count(batch.sample_offset),
    ));
    let seconds = batch.timestamp.timestamp_micros() as f64 / 1_000_000.0;
    values.push((names::TIMESTAMP.into(), seconds.into()));
    values
}

/// Counters kept by the loop.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoopStats {
    /// Ticks attempted
    pub ticks: u64,
    /// Ticks whose batch reached the sink
    pub published: u64,
    /// Ticks that failed in the engine or the sink
    pub failed: u64,
    /// Times the catalog wrapped around
    pub wraps: u64,
}

/// Drives a [`RotationEngine`] into a [`TelemetrySink`] at a fixed rate.
pub struct PublicationLoop<R: DatasetReader, S: TelemetrySink> {
    engine: RotationEngine<R>,
    sink: S,
    interval: Duration,
    progress_interval: Duration,
    stats: LoopStats,
}

impl<R: DatasetReader, S: TelemetrySink> PublicationLoop<R, S> {
    /// Loop ticking every `interval`.
    pub fn new(engine: RotationEngine<R>, sink: S, interval: Duration) -> Self {
        Self {
            engine,
            sink,
            interval,
            progress_interval: Duration::from_secs(30),
            stats: LoopStats::default(),
        }
    }

    /// Minimum spacing of progress log lines.
    pub fn with_progress_interval(mut self, progress_interval: Duration) -> Self {
        self.progress_interval = progress_interval;
        self
    }

    /// The engine being driven.
    pub fn engine(&self) -> &RotationEngine<R> {
        &self.engine
    }

    /// Counters so far.
    pub fn stats(&self) -> LoopStats {
        self.stats
    }

    /// Publish the catalog size before the first tick.
    pub async fn announce(&mut self) -> AppResult<()> {
        let total = self.engine.catalog().len();
        self.sink
            .write(names::TOTAL_FILES, TelemetryValue::count(total))
            .await?;
        info!(total_files = total, "Announced catalog");
        Ok(())
    }

    /// Run one tick: fetch a batch and publish it as one group.
    ///
    /// On a sink failure the tick is rewound in the engine so the next tick republishes
    /// the batch, together with any file metadata that did not get through.
    pub async fn tick(&mut self) -> AppResult<Tick> {
        self.stats.ticks += 1;
        let tick = match self.engine.next_batch() {
            Ok(tick) => tick,
            Err(err) => {
                self.stats.failed += 1;
                return Err(err);
            }
        };

        let mut values = tick.rollover.as_ref().map(metadata_values).unwrap_or_default();
        values.extend(batch_values(&tick.batch));

        if let Err(err) = self.sink.write_all(values).await {
            self.stats.failed += 1;
            self.engine.rewind(&tick);
            return Err(err);
        }

        self.stats.published += 1;
        if tick.wrapped {
            self.stats.wraps += 1;
        }
        debug!(
            file_index = tick.batch.file_index,
            sample_offset = tick.batch.sample_offset,
            rows = tick.batch.len,
            "Published batch"
        );
        Ok(tick)
    }

    /// Tick until `shutdown` fires. Per-tick errors are logged and never end the loop.
    pub async fn run(mut self, mut shutdown: oneshot::Receiver<()>) -> LoopStats {
        if let Err(err) = self.announce().await {
            warn!(error = %err, "Failed to publish catalog size");
        }

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last_progress = Instant::now();

        info!(
            interval_ms = self.interval.as_millis() as u64,
            batch_size = self.engine.batch_size(),
            "Starting publication loop"
        );

        loop {
            tokio::select! {
                biased;
                _ = &mut shutdown => {
                    info!("Shutdown signal received, stopping publication loop");
                    break;
                }
                _ = ticker.tick() => {}
            }

            match self.tick().await {
                Ok(_) => {}
                Err(err) if err.is_fatal() => {
                    error!(error = %err, "Tick failed with unrecoverable error, continuing");
                }
                Err(err) => warn!(error = %err, "Tick failed, retrying next tick"),
            }

            if last_progress.elapsed() >= self.progress_interval {
                last_progress = Instant::now();
                let cursor = self.engine.cursor();
                info!(
                    file = self.engine.current_record().map(|r| r.filename.as_str()).unwrap_or("-"),
                    file_index = cursor.file_index,
                    sample_offset = cursor.sample_offset,
                    published = self.stats.published,
                    failed = self.stats.failed,
                    "Streaming progress"
                );
            }
        }

        info!(
            ticks = self.stats.ticks,
            published = self.stats.published,
            failed = self.stats.failed,
            "Publication loop stopped"
        );
        self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{Catalog, FileRecord, Quality};
    use crate::config::StreamerConfig;
    use crate::reader::MockDatasetReader;
    use crate::sink::MemorySink;
    use std::path::PathBuf;
    use tracing_test::traced_test;

    fn publication(rows: &[usize]) -> (PublicationLoop<MockDatasetReader, MemorySink>, MemorySink) {
        let (publication, sink, _) = publication_with_reader(rows);
        (publication, sink)
    }

    fn publication_with_reader(
        rows: &[usize],
    ) -> (
        PublicationLoop<MockDatasetReader, MemorySink>,
        MemorySink,
        MockDatasetReader,
    ) {
        let reader = MockDatasetReader::new();
        let records = rows
            .iter()
            .enumerate()
            .map(|(i, n)| {
                let path = PathBuf::from(format!("/shared-data/f{i}.h5"));
                reader.insert_ramp(path.clone(), *n, 3);
                FileRecord {
                    path,
                    machine: "M01".to_string(),
                    operation: "OP02".to_string(),
                    quality: Quality::Bad,
                    filename: format!("f{i}.h5"),
                    size: 1,
                }
            })
            .collect();
        let settings = StreamerConfig {
            batch_size: 4,
            ..Default::default()
        };
        let engine =
            RotationEngine::new(Catalog::from_ordered(records), reader.clone(), &settings).unwrap();
        let sink = MemorySink::new();
        let publication = PublicationLoop::new(engine, sink.clone(), Duration::from_millis(100));
        (publication, sink, reader)
    }

    #[tokio::test]
    async fn rollover_tick_publishes_metadata_before_batch() {
        let (mut publication, sink) = publication(&[6]);
        publication.tick().await.unwrap();

        let order: Vec<String> = sink.history().into_iter().map(|(n, _)| n).collect();
        let meta = order.iter().position(|n| n == "CurrentFileName").unwrap();
        let batch = order.iter().position(|n| n == "VibrationXBatch").unwrap();
        assert!(meta < batch);
        assert_eq!(sink.get("CurrentQuality"), Some(TelemetryValue::from("bad")));
        assert_eq!(sink.get("TotalSamples"), Some(TelemetryValue::Int(6)));
        assert_eq!(
            sink.get("VibrationXBatch"),
            Some(TelemetryValue::from(vec![0.0, 1.0, 2.0, 3.0]))
        );
    }

    #[tokio::test]
    async fn plain_tick_publishes_batch_only() {
        let (mut publication, sink) = publication(&[6]);
        publication.tick().await.unwrap();
        publication.tick().await.unwrap();

        assert_eq!(sink.history_of("CurrentFileName").len(), 1);
        assert_eq!(sink.get("CurrentSampleIndex"), Some(TelemetryValue::Int(4)));
        assert_eq!(
            sink.get("VibrationYBatch"),
            Some(TelemetryValue::from(vec![1_000_004.0, 1_000_005.0]))
        );
    }

    #[tokio::test]
    async fn sink_failure_republishes_same_batch_and_metadata() {
        let (mut publication, sink) = publication(&[8]);
        sink.fail_next(1);

        assert!(publication.tick().await.is_err());
        assert!(sink.history().is_empty());

        publication.tick().await.unwrap();
        assert_eq!(sink.get("CurrentFileName"), Some(TelemetryValue::from("f0.h5")));
        assert_eq!(sink.get("CurrentSampleIndex"), Some(TelemetryValue::Int(0)));
        assert_eq!(publication.stats().failed, 1);
        assert_eq!(publication.stats().published, 1);
    }

    #[tokio::test]
    async fn read_failure_after_rollover_still_publishes_new_file_metadata() {
        let (mut publication, sink, reader) = publication_with_reader(&[4, 4]);
        reader.fail_reads("/shared-data/f1.h5", Some(1));

        publication.tick().await.unwrap();
        assert!(publication.tick().await.is_err());
        let tick = publication.tick().await.unwrap();
        assert_eq!(tick.batch.file_index, 1);

        assert_eq!(
            sink.history_of("CurrentFileName"),
            vec![TelemetryValue::from("f0.h5"), TelemetryValue::from("f1.h5")]
        );
        assert_eq!(
            sink.history_of("CurrentFileIndex"),
            vec![TelemetryValue::Int(0), TelemetryValue::Int(1)]
        );

        let order: Vec<String> = sink.history().into_iter().map(|(n, _)| n).collect();
        let last_name = order.iter().rposition(|n| n == "CurrentFileName").unwrap();
        let last_batch = order.iter().rposition(|n| n == "VibrationXBatch").unwrap();
        assert!(last_name < last_batch);
    }

    #[tokio::test(start_paused = true)]
    #[traced_test]
    async fn recoverable_tick_errors_are_warnings() {
        let (publication, _sink, reader) = publication_with_reader(&[8]);
        reader.fail_reads("/shared-data/f0.h5", Some(1));
        let (tx, rx) = oneshot::channel();

        let handle = tokio::spawn(publication.run(rx));
        tokio::time::sleep(Duration::from_millis(250)).await;
        tx.send(()).unwrap();
        let stats = handle.await.unwrap();

        assert_eq!(stats.failed, 1);
        assert!(logs_contain("Tick failed, retrying next tick"));
        assert!(!logs_contain("unrecoverable"));
    }

    #[tokio::test(start_paused = true)]
    async fn run_survives_failures_and_stops_on_shutdown() {
        let (publication, sink) = publication(&[4, 4]);
        sink.fail_next(2);
        let (tx, rx) = oneshot::channel();

        let handle = tokio::spawn(publication.run(rx));
        tokio::time::sleep(Duration::from_millis(1050)).await;
        tx.send(()).unwrap();
        let stats = handle.await.unwrap();

        // the announce write consumed one injected failure, the first tick the other
        assert!(stats.ticks >= 10);
        assert_eq!(stats.failed, 1);
        assert!(stats.wraps >= 1);
        assert_eq!(sink.get("TotalFiles"), Some(TelemetryValue::Int(2)));
    }
}
