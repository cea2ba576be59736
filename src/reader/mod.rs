//! Row-level access to dataset files.
//!
//! The rotation engine only needs four things from a file: open it, ask for its row
//! count, read a row range, and close it. Closing is `Drop`, so at most one handle is
//! alive as long as the engine drops the old handle before opening the next.

pub mod hdf5_reader;
pub mod mock;

pub use hdf5_reader::Hdf5Reader;
pub use mock::MockDatasetReader;

use crate::error::{AppResult, StreamError};
use std::path::Path;

/// Opens dataset files.
pub trait DatasetReader: Send {
    /// Handle type for one open file.
    type Handle: DatasetHandle;

    /// Open `path`. Missing or corrupt files fail with [`StreamError::FileOpen`].
    fn open(&self, path: &Path) -> AppResult<Self::Handle>;
}

/// One open dataset file. Dropping the handle closes the file.
pub trait DatasetHandle: Send {
    /// Number of rows.
    fn row_count(&self) -> usize;

    /// Number of columns per row.
    fn column_count(&self) -> usize;

    /// Rows `[start, end)`. `end` must not exceed [`row_count`](Self::row_count).
    fn read_rows(&mut self, start: usize, end: usize) -> AppResult<RowBlock>;
}

/// Dense row-major block of `f64` values.
#[derive(Debug, Clone, PartialEq)]
pub struct RowBlock {
    columns: usize,
    values: Vec<f64>,
}

impl RowBlock {
    /// Block from row-major `values` with `columns` values per row.
    pub fn new(columns: usize, values: Vec<f64>) -> AppResult<Self> {
        if columns == 0 || values.len() % columns != 0 {
            return Err(StreamError::Reader(format!(
                "{} values do not form rows of {columns} columns",
                values.len()
            )));
        }
        Ok(Self { columns, values })
    }

    /// Number of rows.
    pub fn rows(&self) -> usize {
        self.values.len() / self.columns
    }

    /// Number of columns.
    pub fn columns(&self) -> usize {
        self.columns
    }

    /// Values of one column, top to bottom.
    pub fn column(&self, index: usize) -> AppResult<Vec<f64>> {
        if index >= self.columns {
            return Err(StreamError::Reader(format!(
                "column {index} out of range for {} columns",
                self.columns
            )));
        }
        Ok(self
            .values
            .iter()
            .skip(index)
            .step_by(self.columns)
            .copied()
            .collect())
    }
}

/// Reject ranges outside `[0, rows]` or reversed.
pub(crate) fn check_range(start: usize, end: usize, rows: usize) -> AppResult<()> {
    if start > end || end > rows {
        return Err(StreamError::Reader(format!(
            "row range {start}..{end} outside 0..{rows}"
        )));
    }
    Ok(())
}
