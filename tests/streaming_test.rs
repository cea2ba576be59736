//! Streaming integration tests
//!
//! Builds a shared-storage tree in a temp directory, backs its files with in-memory
//! tables, and drives discovery, rotation and the publication loop end to end.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::oneshot;
use vibration_stream::catalog::{self, Catalog, Quality};
use vibration_stream::config::StreamConfig;
use vibration_stream::reader::MockDatasetReader;
use vibration_stream::readiness::FileMarker;
use vibration_stream::rotation::RotationEngine;
use vibration_stream::sink::{MemorySink, TelemetryValue};
use vibration_stream::streamer::Streamer;
use vibration_stream::StreamError;

// =============================================================================
// Test Helpers
// =============================================================================

fn touch(path: &Path) {
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, b"hdf5").unwrap();
}

fn config(root: &Path) -> StreamConfig {
    let mut config = StreamConfig::default();
    config.storage.shared_root = root.to_path_buf();
    config.streamer.ready_poll_interval_ms = 100;
    config.streamer.ready_timeout_secs = 2;
    config
}

/// Shared-storage tree plus a reader with `rows` rows for every file.
fn staged_tree(root: &Path, files: &[&str], rows: usize) -> MockDatasetReader {
    let reader = MockDatasetReader::new();
    for rel in files {
        let path = root.join(rel);
        touch(&path);
        reader.insert_ramp(path, rows, 3);
    }
    reader
}

/// Spin until the loop has published `TotalFiles`, without letting paused time advance.
async fn wait_for_announce(sink: &MemorySink) {
    while sink.get("TotalFiles").is_none() {
        tokio::task::yield_now().await;
    }
}

fn filenames(catalog: &Catalog) -> Vec<&str> {
    catalog.iter().map(|r| r.filename.as_str()).collect()
}

// =============================================================================
// Discovery
// =============================================================================

#[test]
fn catalog_orders_groups_and_quality() {
    let root = TempDir::new().unwrap();
    staged_tree(
        root.path(),
        &[
            "M02/OP01/good/M02_Aug_2019_OP01_000.h5",
            "M01/OP02/bad/M01_Aug_2019_OP02_000.h5",
            "M01/OP01/bad/M01_Aug_2019_OP01_000.h5",
            "M01/OP01/good/M01_Aug_2019_OP01_001.h5",
            "M01/OP01/good/M01_Feb_2019_OP01_000.h5",
            "M01/OP06/good/M01_Aug_2019_OP06_000.h5",
            "M03/OP01/good/M03_Aug_2019_OP01_000.h5",
        ],
        1,
    );

    let config = config(root.path());
    let found = catalog::scan(&config.storage, &config.filter);
    assert_eq!(
        filenames(&found),
        vec![
            "M01_Feb_2019_OP01_000.h5",
            "M01_Aug_2019_OP01_001.h5",
            "M01_Aug_2019_OP01_000.h5",
            "M01_Aug_2019_OP02_000.h5",
            "M02_Aug_2019_OP01_000.h5",
        ]
    );
    assert_eq!(found.get(2).unwrap().quality, Quality::Bad);

    let summary = found.summary();
    assert_eq!(summary.good, 3);
    assert_eq!(summary.bad, 2);
    assert_eq!(summary.machines.len(), 2);
}

#[test]
fn scanning_twice_gives_identical_catalogs() {
    let root = TempDir::new().unwrap();
    staged_tree(
        root.path(),
        &[
            "M01/OP01/good/M01_Aug_2019_OP01_000.h5",
            "M01/OP01/good/M01_Aug_2019_OP01_001.h5",
            "M02/OP03/bad/M02_Feb_2019_OP03_000.h5",
        ],
        1,
    );
    let config = config(root.path());
    let first = catalog::scan(&config.storage, &config.filter);
    let second = catalog::scan(&config.storage, &config.filter);
    assert_eq!(first.records(), second.records());
}

#[tokio::test(start_paused = true)]
async fn readiness_timeout_yields_empty_catalog() {
    let root = TempDir::new().unwrap();
    staged_tree(root.path(), &["M01/OP01/good/M01_Aug_2019_OP01_000.h5"], 1);
    let config = config(root.path());
    let marker = FileMarker::from_config(&config);

    let found = catalog::discover(&config, &marker).await;
    assert!(found.is_empty());

    let err = catalog::discover_checked(&config, &marker).await.unwrap_err();
    assert!(matches!(err, StreamError::ReadinessTimeout(_)));
}

#[tokio::test]
async fn ready_but_empty_storage_is_catalog_empty() {
    let root = TempDir::new().unwrap();
    let config = config(root.path());
    let marker = FileMarker::from_config(&config);
    marker.signal_ready().unwrap();

    let err = catalog::discover_checked(&config, &marker).await.unwrap_err();
    assert!(matches!(err, StreamError::CatalogEmpty));
    assert!(err.is_fatal());
}

// =============================================================================
// Rotation over a discovered catalog
// =============================================================================

#[test]
fn full_pass_visits_every_row_once() {
    let root = TempDir::new().unwrap();
    let files = [
        "M01/OP01/good/M01_Aug_2019_OP01_000.h5",
        "M01/OP02/good/M01_Aug_2019_OP02_000.h5",
        "M02/OP01/bad/M02_Aug_2019_OP01_000.h5",
    ];
    let reader = staged_tree(root.path(), &files, 23);
    let mut config = config(root.path());
    config.streamer.batch_size = 10;

    let found = catalog::scan(&config.storage, &config.filter);
    let mut engine = RotationEngine::new(found, reader, &config.streamer).unwrap();

    // ceil(23 / 10) = 3 batches per file
    let mut seen: Vec<(usize, Vec<f64>)> = Vec::new();
    for _ in 0..9 {
        let tick = engine.next_batch().unwrap();
        assert!(tick.batch.len <= 10);
        seen.push((tick.batch.file_index, tick.batch.axes[0].values.clone()));
    }

    for file_index in 0..3 {
        let rows: Vec<f64> = seen
            .iter()
            .filter(|(i, _)| *i == file_index)
            .flat_map(|(_, v)| v.iter().copied())
            .collect();
        assert_eq!(rows, (0..23).map(f64::from).collect::<Vec<_>>());
    }

    let wrapped = engine.next_batch().unwrap();
    assert!(wrapped.wrapped);
    assert_eq!(wrapped.batch.file_index, 0);
}

// =============================================================================
// Streamer end to end
// =============================================================================

#[tokio::test(start_paused = true)]
async fn streamer_publishes_until_shutdown() {
    let root = TempDir::new().unwrap();
    let reader = staged_tree(
        root.path(),
        &[
            "M01/OP01/good/M01_Aug_2019_OP01_000.h5",
            "M01/OP01/bad/M01_Aug_2019_OP01_001.h5",
        ],
        15,
    );
    let config = config(root.path());
    let marker = FileMarker::from_config(&config);
    marker.signal_ready().unwrap();

    let sink = MemorySink::new();
    let streamer = Streamer::new(config, reader, sink.clone());
    let (tx, rx) = oneshot::channel();
    let handle = tokio::spawn(async move { streamer.run(&marker, rx).await });
    wait_for_announce(&sink).await;

    // ticks at 0s, 1s, 2s, 3s, 4s
    tokio::time::sleep(Duration::from_millis(4500)).await;
    tx.send(()).unwrap();
    let stats = handle.await.unwrap().unwrap();

    assert_eq!(stats.published, 5);
    assert_eq!(stats.failed, 0);
    assert_eq!(sink.get("TotalFiles"), Some(TelemetryValue::Int(2)));

    let names: Vec<TelemetryValue> = sink.history_of("CurrentFileName");
    assert_eq!(
        names,
        vec![
            TelemetryValue::from("M01_Aug_2019_OP01_000.h5"),
            TelemetryValue::from("M01_Aug_2019_OP01_001.h5"),
            TelemetryValue::from("M01_Aug_2019_OP01_000.h5"),
        ]
    );
    assert_eq!(
        sink.history_of("CurrentSampleIndex"),
        vec![0, 10, 0, 10, 0]
            .into_iter()
            .map(TelemetryValue::Int)
            .collect::<Vec<_>>()
    );
    assert_eq!(
        sink.history_of("VibrationZBatch").last(),
        Some(&TelemetryValue::from(
            (0..10).map(|r| f64::from(2_000_000 + r)).collect::<Vec<_>>()
        ))
    );
}

#[tokio::test(start_paused = true)]
async fn streamer_survives_unreadable_file() {
    let root = TempDir::new().unwrap();
    let files = [
        "M01/OP01/good/M01_Aug_2019_OP01_000.h5",
        "M01/OP01/good/M01_Aug_2019_OP01_001.h5",
        "M01/OP01/good/M01_Aug_2019_OP01_002.h5",
    ];
    let reader = staged_tree(root.path(), &files, 10);
    let broken: PathBuf = root.path().join(files[1]);
    reader.fail_opens(broken, None);

    let mut config = config(root.path());
    config.streamer.max_open_attempts = 2;
    let marker = FileMarker::from_config(&config);
    marker.signal_ready().unwrap();

    let sink = MemorySink::new();
    let streamer = Streamer::new(config, reader, sink.clone());
    let (tx, rx) = oneshot::channel();
    let handle = tokio::spawn(async move { streamer.run(&marker, rx).await });
    wait_for_announce(&sink).await;

    tokio::time::sleep(Duration::from_millis(5500)).await;
    tx.send(()).unwrap();
    let stats = handle.await.unwrap().unwrap();

    // 0s: file 0; 1s, 2s: file 1 fails twice and is skipped; 3s: file 2; 4s: file 0; 5s: file 1 fails
    assert_eq!(stats.ticks, 6);
    assert_eq!(stats.failed, 3);
    assert_eq!(
        sink.history_of("CurrentFileIndex"),
        vec![TelemetryValue::Int(0), TelemetryValue::Int(2), TelemetryValue::Int(0)]
    );
}
