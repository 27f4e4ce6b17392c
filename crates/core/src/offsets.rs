//! Subject → day-offset table.
//!
//! Loaded once per run from a CSV with the columns `patient_identifier` and `random_number`.
//! Loading is all-or-nothing: any missing column or malformed row fails the whole table with
//! a configuration error, which aborts the run before a single file is touched.
//!
//! Duplicate identifiers are accepted; the last occurrence wins.

use crate::constants::{OFFSET_DAYS_COLUMN, OFFSET_ID_COLUMN};
use crate::{DeidError, DeidResult, SubjectId};
use std::collections::HashMap;
use std::io::Read;
use std::path::Path;

#[derive(Clone, Debug, Default)]
pub struct OffsetTable {
    offsets: HashMap<SubjectId, i64>,
}

impl OffsetTable {
    /// Load the table from a CSV file.
    ///
    /// # Errors
    ///
    /// Returns `DeidError::Config` if the file is missing or unreadable, a required column is
    /// absent, or any row is malformed.
    pub fn from_csv_path(path: &Path) -> DeidResult<Self> {
        if !path.is_file() {
            return Err(DeidError::Config(format!(
                "CSV file '{}' not found",
                path.display()
            )));
        }
        let file = std::fs::File::open(path).map_err(|e| {
            DeidError::Config(format!("cannot open CSV file '{}': {e}", path.display()))
        })?;
        let table = Self::from_reader(file)?;
        tracing::info!("loaded {} offset entries from {}", table.len(), path.display());
        Ok(table)
    }

    /// Load the table from any CSV source.
    ///
    /// # Errors
    ///
    /// See [`OffsetTable::from_csv_path`].
    pub fn from_reader<R: Read>(reader: R) -> DeidResult<Self> {
        let mut rdr = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .from_reader(reader);

        let headers = rdr
            .headers()
            .map_err(|e| DeidError::Config(format!("cannot read CSV header: {e}")))?
            .clone();
        let column = |name: &str| {
            headers.iter().position(|h| h == name).ok_or_else(|| {
                DeidError::Config(format!("CSV file missing required column: '{name}'"))
            })
        };
        let id_idx = column(OFFSET_ID_COLUMN)?;
        let days_idx = column(OFFSET_DAYS_COLUMN)?;

        let mut offsets = HashMap::new();
        for (row, record) in rdr.records().enumerate() {
            // Row numbers are 1-based and count the header line.
            let line = row + 2;
            let record =
                record.map_err(|e| DeidError::Config(format!("line {line}: malformed row: {e}")))?;

            let raw_id = record.get(id_idx).unwrap_or_default();
            let id = SubjectId::new(raw_id).map_err(|_| {
                DeidError::Config(format!("line {line}: empty {OFFSET_ID_COLUMN}"))
            })?;

            let raw_days = record.get(days_idx).unwrap_or_default();
            let days: i64 = raw_days.parse().map_err(|_| {
                DeidError::Config(format!(
                    "line {line}: invalid {OFFSET_DAYS_COLUMN} '{raw_days}'"
                ))
            })?;

            if let Some(previous) = offsets.insert(id.clone(), days) {
                tracing::debug!(
                    "duplicate identifier '{}' on line {}: {} replaces {}",
                    id,
                    line,
                    days,
                    previous
                );
            }
        }

        Ok(Self { offsets })
    }

    pub fn get(&self, id: &str) -> Option<i64> {
        self.offsets.get(id).copied()
    }

    pub fn len(&self) -> usize {
        self.offsets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.offsets.is_empty()
    }
}

impl FromIterator<(SubjectId, i64)> for OffsetTable {
    fn from_iter<I: IntoIterator<Item = (SubjectId, i64)>>(iter: I) -> Self {
        Self {
            offsets: iter.into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_loads_rows_and_trims_values() {
        let csv = "patient_identifier,random_number\n AB12 , -10\nCD34,300\n";
        let table = OffsetTable::from_reader(csv.as_bytes()).unwrap();

        assert_eq!(table.len(), 2);
        assert_eq!(table.get("AB12"), Some(-10));
        assert_eq!(table.get("CD34"), Some(300));
        assert_eq!(table.get("ZZ99"), None);
    }

    #[test]
    fn test_extra_columns_and_order_do_not_matter() {
        let csv = "random_number,site,patient_identifier\n7,001,AB12\n";
        let table = OffsetTable::from_reader(csv.as_bytes()).unwrap();
        assert_eq!(table.get("AB12"), Some(7));
    }

    #[test]
    fn test_duplicate_identifier_last_occurrence_wins() {
        let csv = "patient_identifier,random_number\nAB12,5\nAB12,-3\n";
        let table = OffsetTable::from_reader(csv.as_bytes()).unwrap();
        assert_eq!(table.len(), 1);
        assert_eq!(table.get("AB12"), Some(-3));
    }

    #[test]
    fn test_missing_column_is_config_error() {
        let csv = "patient_identifier,days\nAB12,5\n";
        let err = OffsetTable::from_reader(csv.as_bytes()).expect_err("missing column");
        assert!(err.is_fatal());
        assert!(err.to_string().contains("random_number"));
    }

    #[test]
    fn test_invalid_offset_fails_whole_table() {
        let csv = "patient_identifier,random_number\nAB12,5\nCD34,ten\n";
        let err = OffsetTable::from_reader(csv.as_bytes()).expect_err("bad offset");
        assert!(matches!(err, DeidError::Config(ref m) if m.contains("line 3")));
    }

    #[test]
    fn test_missing_file_is_config_error() {
        let temp = TempDir::new().unwrap();
        let err = OffsetTable::from_csv_path(&temp.path().join("absent.csv"))
            .expect_err("missing file");
        assert!(err.is_fatal());
    }

    #[test]
    fn test_from_csv_path() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("offsets.csv");
        fs::write(&path, "patient_identifier,random_number\nAB12,300\n").unwrap();

        let table = OffsetTable::from_csv_path(&path).unwrap();
        assert_eq!(table.get("AB12"), Some(300));
    }
}
