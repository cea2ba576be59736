//! HDF5 dataset reader.
//!
//! Each data file holds a 2-D `f64` dataset (rows × columns), by default at
//! `/vibration_data`. Only the requested row range is read from disk.

use super::{check_range, DatasetHandle, DatasetReader, RowBlock};
use crate::error::{AppResult, StreamError};
use std::path::Path;

/// Opens the configured dataset inside HDF5 files.
#[derive(Debug, Clone)]
pub struct Hdf5Reader {
    dataset: String,
}

impl Hdf5Reader {
    /// Reader for the dataset at `dataset` (e.g. `vibration_data`).
    pub fn new(dataset: impl Into<String>) -> Self {
        Self {
            dataset: dataset.into(),
        }
    }
}

/// Open HDF5 file plus its dataset. The file closes when the handle drops.
#[cfg(feature = "storage_hdf5")]
pub struct Hdf5Handle {
    _file: hdf5::File,
    dataset: hdf5::Dataset,
    rows: usize,
    columns: usize,
}

#[cfg(feature = "storage_hdf5")]
impl DatasetReader for Hdf5Reader {
    type Handle = Hdf5Handle;

    fn open(&self, path: &Path) -> AppResult<Hdf5Handle> {
        let open_err = |reason: String| StreamError::FileOpen {
            path: path.to_path_buf(),
            reason,
        };

        let file = hdf5::File::open(path).map_err(|e| open_err(e.to_string()))?;
        let dataset = file
            .dataset(&self.dataset)
            .map_err(|e| open_err(format!("dataset '{}': {e}", self.dataset)))?;

        let shape = dataset.shape();
        let (rows, columns) = match shape.as_slice() {
            [rows, columns] => (*rows, *columns),
            [rows] => (*rows, 1),
            other => {
                return Err(open_err(format!(
                    "dataset '{}' has unsupported shape {other:?}",
                    self.dataset
                )))
            }
        };

        Ok(Hdf5Handle {
            _file: file,
            dataset,
            rows,
            columns,
        })
    }
}

#[cfg(feature = "storage_hdf5")]
impl DatasetHandle for Hdf5Handle {
    fn row_count(&self) -> usize {
        self.rows
    }

    fn column_count(&self) -> usize {
        self.columns
    }

    fn read_rows(&mut self, start: usize, end: usize) -> AppResult<RowBlock> {
        check_range(start, end, self.rows)?;
        if start == end {
            return RowBlock::new(self.columns, Vec::new());
        }

        let values: Vec<f64> = if self.dataset.ndim() == 1 {
            self.dataset
                .read_slice_1d::<f64, _>(start..end)
                .map_err(|e| StreamError::Reader(e.to_string()))?
                .iter()
                .copied()
                .collect()
        } else {
            self.dataset
                .read_slice_2d::<f64, _>((start..end, ..))
                .map_err(|e| StreamError::Reader(e.to_string()))?
                .iter()
                .copied()
                .collect()
        };
        RowBlock::new(self.columns, values)
    }
}

/// Placeholder handle when HDF5 support is compiled out.
#[cfg(not(feature = "storage_hdf5"))]
pub struct Hdf5Handle;

#[cfg(not(feature = "storage_hdf5"))]
impl DatasetReader for Hdf5Reader {
    type Handle = Hdf5Handle;

    fn open(&self, _path: &Path) -> AppResult<Hdf5Handle> {
        Err(StreamError::FeatureNotEnabled("storage_hdf5".to_string()))
    }
}

#[cfg(not(feature = "storage_hdf5"))]
impl DatasetHandle for Hdf5Handle {
    fn row_count(&self) -> usize {
        0
    }

    fn column_count(&self) -> usize {
        0
    }

    fn read_rows(&mut self, _start: usize, _end: usize) -> AppResult<RowBlock> {
        Err(StreamError::FeatureNotEnabled("storage_hdf5".to_string()))
    }
}

#[cfg(all(test, feature = "storage_hdf5"))]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn reads_row_ranges() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("M01_Aug_2019_OP01_000.h5");
        {
            let file = hdf5::File::create(&path).unwrap();
            let data: Vec<f64> = (0..30).map(f64::from).collect();
            file.new_dataset::<f64>()
                .shape((10, 3))
                .create("vibration_data")
                .unwrap()
                .write_raw(&data)
                .unwrap();
        }

        let mut handle = Hdf5Reader::new("vibration_data").open(&path).unwrap();
        assert_eq!(handle.row_count(), 10);
        assert_eq!(handle.column_count(), 3);

        let block = handle.read_rows(8, 10).unwrap();
        assert_eq!(block.rows(), 2);
        assert_eq!(block.column(0).unwrap(), vec![24.0, 27.0]);
    }

    #[test]
    fn missing_file_is_open_error() {
        let dir = TempDir::new().unwrap();
        let err = Hdf5Reader::new("vibration_data")
            .open(&dir.path().join("absent.h5"))
            .err()
            .unwrap();
        assert!(matches!(err, StreamError::FileOpen { .. }));
    }
}
