//! Positional file-name schema: `<machine>_<month>_<year>_<operation>_<sequence>.<ext>`
//!
//! Example: `M01_Aug_2019_OP01_000.h5`. Machine and operation are required for a file to be
//! catalogued; month, year and sequence only feed the ordering key.

use crate::error::{AppResult, StreamError};

/// Separator between name components.
pub const DELIMITER: char = '_';

/// Components required before a name is usable (machine, month, year, operation).
pub const MIN_COMPONENTS: usize = 4;

/// Components of a data file name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedName {
    /// Machine id, e.g. `M01`
    pub machine: String,
    /// Free-text month token, e.g. `Aug`
    pub month: String,
    /// Year token, e.g. `2019`
    pub year: String,
    /// Operation code, e.g. `OP01`
    pub operation: String,
    /// Zero-padded sequence token, e.g. `000`
    pub sequence: Option<String>,
}

/// Parsed ordering key within one quality group.
///
/// Field order is the comparison order: machine, year, month, operation, sequence.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct SortKey {
    /// Machine id
    pub machine: String,
    /// Calendar year
    pub year: i32,
    /// Month number, January = 1
    pub month: u32,
    /// Operation code
    pub operation: String,
    /// Sequence number
    pub sequence: u32,
}

impl ParsedName {
    /// Split a file name (with or without extension) into its components.
    pub fn parse(filename: &str) -> AppResult<Self> {
        let stem = filename
            .rsplit_once('.')
            .map_or(filename, |(stem, _ext)| stem);
        let parts: Vec<&str> = stem.split(DELIMITER).collect();

        if parts.len() < MIN_COMPONENTS || parts.iter().take(MIN_COMPONENTS).any(|p| p.is_empty())
        {
            return Err(StreamError::FilenameParse {
                filename: filename.to_string(),
                reason: format!(
                    "expected at least {MIN_COMPONENTS} '{DELIMITER}'-separated components, found {}",
                    parts.len()
                ),
            });
        }

        Ok(Self {
            machine: parts[0].to_string(),
            month: parts[1].to_string(),
            year: parts[2].to_string(),
            operation: parts[3].to_string(),
            sequence: parts
                .get(4)
                .filter(|s| !s.is_empty())
                .map(|s| s.to_string()),
        })
    }

    /// Composite ordering key, or `None` if month, year or sequence fail to parse.
    pub fn sort_key(&self) -> Option<SortKey> {
        Some(SortKey {
            machine: self.machine.clone(),
            year: self.year.parse().ok()?,
            month: month_priority(&self.month)?,
            operation: self.operation.clone(),
            sequence: self.sequence.as_deref()?.parse().ok()?,
        })
    }
}

/// Month token to its calendar position (January = 1). Case-insensitive.
pub fn month_priority(token: &str) -> Option<u32> {
    match token.to_ascii_lowercase().as_str() {
        "jan" | "january" => Some(1),
        "feb" | "february" => Some(2),
        "mar" | "march" => Some(3),
        "apr" | "april" => Some(4),
        "may" => Some(5),
        "jun" | "june" => Some(6),
        "jul" | "july" => Some(7),
        "aug" | "august" => Some(8),
        "sep" | "sept" | "september" => Some(9),
        "oct" | "october" => Some(10),
        "nov" | "november" => Some(11),
        "dec" | "december" => Some(12),
        _ => None,
    }
}
