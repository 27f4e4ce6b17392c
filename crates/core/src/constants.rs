//! Constants used throughout the de-identification core crate.
//!
//! EDF header layout, fixed date policies, CSV column names and filename conventions live
//! here so every stage agrees on them.

use std::ops::Range;

/// Minimum size of a valid EDF header in bytes.
pub const HEADER_MIN_LEN: usize = 256;

/// EDF version field.
pub const VERSION_RANGE: Range<usize> = 0..8;

/// Local patient identification (80 bytes).
pub const PATIENT_ID_RANGE: Range<usize> = 8..88;

/// Local recording identification (80 bytes); holds the `Startdate DD-MMM-YYYY` text.
pub const RECORDING_ID_RANGE: Range<usize> = 88..168;

/// Start date, `dd.mm.yy`.
pub const START_DATE_RANGE: Range<usize> = 168..176;

/// Start time, `hh.mm.ss`.
pub const START_TIME_RANGE: Range<usize> = 176..184;

/// Two-digit years at or above this pivot belong to the 1900s, the rest to the 2000s.
pub const TWO_DIGIT_YEAR_PIVOT: u32 = 85;

/// First year representable by a `dd.mm.yy` field under the pivot rule.
pub const FIRST_REPRESENTABLE_YEAR: i32 = 1985;

/// Last year representable by a `dd.mm.yy` field under the pivot rule.
pub const LAST_REPRESENTABLE_YEAR: i32 = 2084;

/// Default maximum-date ceiling (`year`, `month`, `day`).
pub const DEFAULT_MAX_DATE: (i32, u32, u32) = (2085, 1, 1);

/// Month abbreviations used in the `Startdate DD-MMM-YYYY` field.
pub const MONTH_ABBREVIATIONS: [&str; 12] = [
    "Jan", "Feb", "Mar", "Apr", "May", "Jun", "Jul", "Aug", "Sep", "Oct", "Nov", "Dec",
];

/// Leading keyword of the human-readable start date field.
pub const STARTDATE_KEYWORD: &str = "Startdate";

/// Default structured identifier prefix (`PREFIX-<site>-<id>-<suffix>`).
pub const DEFAULT_ID_PREFIX: &str = "PRV";

/// Offset table column holding the subject identifier.
pub const OFFSET_ID_COLUMN: &str = "patient_identifier";

/// Offset table column holding the day offset.
pub const OFFSET_DAYS_COLUMN: &str = "random_number";

/// Recording file extension.
pub const EDF_EXTENSION: &str = ".edf";

/// Outputs of older single-file runs, never treated as inputs.
pub const MODIFIED_EDF_SUFFIX: &str = "_modified.edf";

/// Annotation sidecar filename suffix.
pub const ANNOTATIONS_SUFFIX: &str = "-annotations.xml";

/// Default batch report filename.
pub const DEFAULT_REPORT_FILENAME: &str = "batch_processing_results.csv";

/// Budget for one per-file subprocess in a batch run.
pub const SUBPROCESS_TIMEOUT_SECS: u64 = 60;

/// ISO date format used in reports.
pub const REPORT_DATE_FORMAT: &str = "%Y-%m-%d";

/// Time format used in reports.
pub const REPORT_TIME_FORMAT: &str = "%H:%M:%S";
