//! In-memory dataset reader for tests and dry runs.
//!
//! Tables are registered by path. Opens and reads can be made to fail a number of times
//! (or forever), and the reader tracks how many handles are alive.

use super::{check_range, DatasetHandle, DatasetReader, RowBlock};
use crate::error::{AppResult, StreamError};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Row-major table.
#[derive(Debug)]
struct Table {
    columns: usize,
    values: Vec<f64>,
}

/// Remaining injected failures for one path.
#[derive(Debug, Clone, Copy)]
enum Injected {
    Times(u32),
    Always,
}

impl Injected {
    fn from_times(times: Option<u32>) -> Self {
        times.map_or(Injected::Always, Injected::Times)
    }
}

/// Consume one injected failure for `path`, if any remain.
fn take_failure(failures: &mut HashMap<PathBuf, Injected>, path: &Path) -> bool {
    match failures.get_mut(path) {
        Some(Injected::Always) => true,
        Some(Injected::Times(0)) | None => false,
        Some(Injected::Times(n)) => {
            *n -= 1;
            true
        }
    }
}

#[derive(Debug, Default)]
struct MockState {
    tables: HashMap<PathBuf, Arc<Table>>,
    open_failures: HashMap<PathBuf, Injected>,
    read_failures: HashMap<PathBuf, Injected>,
    opened: Vec<PathBuf>,
}

/// Shared, cloneable in-memory reader.
#[derive(Debug, Clone, Default)]
pub struct MockDatasetReader {
    state: Arc<Mutex<MockState>>,
    live_handles: Arc<AtomicUsize>,
}

impl MockDatasetReader {
    /// Empty reader; every open fails until tables are registered.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a table of `columns` columns from row-major `values`.
    pub fn insert(&self, path: impl Into<PathBuf>, columns: usize, values: Vec<f64>) {
        self.state
            .lock()
            .tables
            .insert(path.into(), Arc::new(Table { columns, values }));
    }

    /// Register a `rows` × `columns` table where column `c` of row `r` is
    /// `c * 1_000_000 + r`, so column 0 holds the row index.
    pub fn insert_ramp(&self, path: impl Into<PathBuf>, rows: usize, columns: usize) {
        let values = (0..rows)
            .flat_map(|r| (0..columns).map(move |c| (c * 1_000_000 + r) as f64))
            .collect();
        self.insert(path, columns, values);
    }

    /// Make the next `times` opens of `path` fail (`None` = every open).
    pub fn fail_opens(&self, path: impl Into<PathBuf>, times: Option<u32>) {
        self.state
            .lock()
            .open_failures
            .insert(path.into(), Injected::from_times(times));
    }

    /// Make the next `times` row reads from `path` fail (`None` = every read).
    pub fn fail_reads(&self, path: impl Into<PathBuf>, times: Option<u32>) {
        self.state
            .lock()
            .read_failures
            .insert(path.into(), Injected::from_times(times));
    }

    /// Paths opened successfully, in order.
    pub fn opened(&self) -> Vec<PathBuf> {
        self.state.lock().opened.clone()
    }

    /// Handles currently alive.
    pub fn live_handles(&self) -> usize {
        self.live_handles.load(Ordering::SeqCst)
    }
}

impl DatasetReader for MockDatasetReader {
    type Handle = MockHandle;

    fn open(&self, path: &Path) -> AppResult<MockHandle> {
        let mut state = self.state.lock();

        if take_failure(&mut state.open_failures, path) {
            return Err(StreamError::FileOpen {
                path: path.to_path_buf(),
                reason: "injected open failure".to_string(),
            });
        }

        let table = state
            .tables
            .get(path)
            .cloned()
            .ok_or_else(|| StreamError::FileOpen {
                path: path.to_path_buf(),
                reason: "no such table".to_string(),
            })?;
        state.opened.push(path.to_path_buf());
        self.live_handles.fetch_add(1, Ordering::SeqCst);

        Ok(MockHandle {
            path: path.to_path_buf(),
            table,
            state: Arc::clone(&self.state),
            live_handles: Arc::clone(&self.live_handles),
        })
    }
}

/// Handle onto a registered table.
#[derive(Debug)]
pub struct MockHandle {
    path: PathBuf,
    table: Arc<Table>,
    state: Arc<Mutex<MockState>>,
    live_handles: Arc<AtomicUsize>,
}

impl DatasetHandle for MockHandle {
    fn row_count(&self) -> usize {
        self.table.values.len() / self.table.columns.max(1)
    }

    fn column_count(&self) -> usize {
        self.table.columns
    }

    fn read_rows(&mut self, start: usize, end: usize) -> AppResult<RowBlock> {
        check_range(start, end, self.row_count())?;
        if take_failure(&mut self.state.lock().read_failures, &self.path) {
            return Err(StreamError::Reader(format!(
                "injected read failure for {}",
                self.path.display()
            )));
        }
        let cols = self.table.columns;
        RowBlock::new(cols, self.table.values[start * cols..end * cols].to_vec())
    }
}

impl Drop for MockHandle {
    fn drop(&mut self) {
        self.live_handles.fetch_sub(1, Ordering::SeqCst);
    }
}
