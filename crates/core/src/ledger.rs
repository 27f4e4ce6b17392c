//! Per-file results and the batch report.
//!
//! Every processed file produces exactly one [`ShiftResult`]. The [`ResultLedger`] collects
//! them in processing order, renders them as the report CSV and reads that CSV back for the
//! annotation stages, which take their day offsets from the dates the header stage actually
//! wrote ([`RealizedShifts`]) rather than from the offset table.

use crate::annotations::AnnotationClassification;
use crate::constants::{REPORT_DATE_FORMAT, REPORT_TIME_FORMAT};
use crate::{DeidError, DeidResult, ShiftStatus, SubjectId};
use chrono::{NaiveDate, NaiveTime};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::io::Read;
use std::path::{Path, PathBuf};

/// Report CSV columns, in order.
pub const REPORT_COLUMNS: [&str; 10] = [
    "edf_file",
    "patient_identifier",
    "original_edf_startdate",
    "original_edf_starttime",
    "new_edf_startdate",
    "new_edf_starttime",
    "random_days_offset",
    "status",
    "error_message",
    "output_file",
];

/// Outcome of processing one file.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShiftResult {
    /// Input basename.
    pub file: String,
    pub identifier: Option<SubjectId>,
    pub original_date: Option<NaiveDate>,
    pub original_time: Option<NaiveTime>,
    pub new_date: Option<NaiveDate>,
    pub new_time: Option<NaiveTime>,
    pub offset_days: Option<i64>,
    pub status: ShiftStatus,
    pub error_message: Option<String>,
    pub output_path: Option<PathBuf>,
}

impl ShiftResult {
    /// Result for a file whose processing did not finish within `secs` seconds.
    pub fn timeout(file: &Path, secs: u64) -> Self {
        ShiftDraft::new(file).fail(&DeidError::Timeout(secs))
    }

    /// Result for a file that failed before anything about it was known.
    pub fn from_error(file: &Path, err: &DeidError) -> Self {
        ShiftDraft::new(file).fail(err)
    }

    pub fn is_success(&self) -> bool {
        self.status == ShiftStatus::Success
    }
}

/// Fields gathered while a file is being processed.
///
/// Stages fill in what they learn as they go so that a failure part-way through still reports
/// the identifier, offset and dates resolved up to that point.
#[derive(Clone, Debug, Default)]
pub struct ShiftDraft {
    pub file: String,
    pub identifier: Option<SubjectId>,
    pub original_date: Option<NaiveDate>,
    pub original_time: Option<NaiveTime>,
    pub new_date: Option<NaiveDate>,
    pub new_time: Option<NaiveTime>,
    pub offset_days: Option<i64>,
}

impl ShiftDraft {
    pub fn new(path: &Path) -> Self {
        let file = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        Self {
            file,
            ..Self::default()
        }
    }

    pub fn succeed(self, output_path: PathBuf) -> ShiftResult {
        self.finish(ShiftStatus::Success, None, Some(output_path))
    }

    pub fn fail(self, err: &DeidError) -> ShiftResult {
        self.finish(err.status(), Some(err.to_string()), None)
    }

    /// Skip without an error, e.g. nothing to shift.
    pub fn skip(self, reason: impl Into<String>) -> ShiftResult {
        self.finish(ShiftStatus::Skipped, Some(reason.into()), None)
    }

    fn finish(
        self,
        status: ShiftStatus,
        error_message: Option<String>,
        output_path: Option<PathBuf>,
    ) -> ShiftResult {
        ShiftResult {
            file: self.file,
            identifier: self.identifier,
            original_date: self.original_date,
            original_time: self.original_time,
            new_date: self.new_date,
            new_time: self.new_time,
            offset_days: self.offset_days,
            status,
            error_message,
            output_path,
        }
    }
}

/// One report CSV row. Absent values are empty strings.
#[derive(Debug, Serialize, Deserialize)]
struct ReportRow {
    edf_file: String,
    patient_identifier: String,
    original_edf_startdate: String,
    original_edf_starttime: String,
    new_edf_startdate: String,
    new_edf_starttime: String,
    random_days_offset: String,
    status: String,
    error_message: String,
    output_file: String,
}

fn is_blank(value: &str) -> bool {
    value.trim().is_empty()
}

fn text<T: ToString>(value: Option<T>) -> String {
    value.map(|v| v.to_string()).unwrap_or_default()
}

impl From<&ShiftResult> for ReportRow {
    fn from(r: &ShiftResult) -> Self {
        Self {
            edf_file: r.file.clone(),
            patient_identifier: text(r.identifier.as_ref()),
            original_edf_startdate: text(r.original_date.map(|d| d.format(REPORT_DATE_FORMAT))),
            original_edf_starttime: text(r.original_time.map(|t| t.format(REPORT_TIME_FORMAT))),
            new_edf_startdate: text(r.new_date.map(|d| d.format(REPORT_DATE_FORMAT))),
            new_edf_starttime: text(r.new_time.map(|t| t.format(REPORT_TIME_FORMAT))),
            random_days_offset: text(r.offset_days),
            status: r.status.to_string(),
            error_message: r.error_message.clone().unwrap_or_default(),
            output_file: text(r.output_path.as_ref().map(|p| p.display())),
        }
    }
}

impl ReportRow {
    fn into_result(self, line: usize) -> DeidResult<ShiftResult> {
        let bad = |column: &str, value: &str| {
            DeidError::Config(format!("report line {line}: invalid {column} '{value}'"))
        };
        let date = |column: &str, value: &str| -> DeidResult<Option<NaiveDate>> {
            if is_blank(value) {
                return Ok(None);
            }
            NaiveDate::parse_from_str(value.trim(), REPORT_DATE_FORMAT)
                .map(Some)
                .map_err(|_| bad(column, value))
        };
        let time = |column: &str, value: &str| -> DeidResult<Option<NaiveTime>> {
            if is_blank(value) {
                return Ok(None);
            }
            NaiveTime::parse_from_str(value.trim(), REPORT_TIME_FORMAT)
                .map(Some)
                .map_err(|_| bad(column, value))
        };

        let offset_days = if is_blank(&self.random_days_offset) {
            None
        } else {
            Some(
                self.random_days_offset
                    .trim()
                    .parse::<i64>()
                    .map_err(|_| bad("random_days_offset", &self.random_days_offset))?,
            )
        };

        Ok(ShiftResult {
            identifier: SubjectId::new(&self.patient_identifier).ok(),
            original_date: date("original_edf_startdate", &self.original_edf_startdate)?,
            original_time: time("original_edf_starttime", &self.original_edf_starttime)?,
            new_date: date("new_edf_startdate", &self.new_edf_startdate)?,
            new_time: time("new_edf_starttime", &self.new_edf_starttime)?,
            offset_days,
            status: self
                .status
                .parse()
                .map_err(|_| bad("status", &self.status))?,
            error_message: Some(self.error_message).filter(|m| !is_blank(m)),
            output_path: Some(self.output_file)
                .filter(|p| !is_blank(p))
                .map(PathBuf::from),
            file: self.edf_file,
        })
    }
}

/// Dates the header stage actually wrote for one subject.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RealizedShift {
    pub original_date: NaiveDate,
    pub new_date: NaiveDate,
}

impl RealizedShift {
    pub fn offset_days(&self) -> i64 {
        (self.new_date - self.original_date).num_days()
    }
}

/// Realized shifts keyed by subject identifier.
#[derive(Clone, Debug, Default)]
pub struct RealizedShifts {
    shifts: HashMap<SubjectId, RealizedShift>,
}

impl RealizedShifts {
    pub fn get(&self, id: &str) -> Option<RealizedShift> {
        self.shifts.get(id).copied()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.shifts.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.shifts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shifts.is_empty()
    }
}

impl FromIterator<(SubjectId, RealizedShift)> for RealizedShifts {
    fn from_iter<I: IntoIterator<Item = (SubjectId, RealizedShift)>>(iter: I) -> Self {
        let mut shifts = HashMap::new();
        for (id, shift) in iter {
            shifts.entry(id).or_insert(shift);
        }
        Self { shifts }
    }
}

/// Counts per status.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LedgerSummary {
    pub total: usize,
    pub success: usize,
    pub skipped: usize,
    pub failed: usize,
    pub timeout: usize,
}

impl fmt::Display for LedgerSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} processed, {} success, {} skipped, {} failed, {} timeout",
            self.total, self.success, self.skipped, self.failed, self.timeout
        )
    }
}

/// Header of the annotation classification report.
pub const CLASSIFICATION_COLUMNS: [&str; 4] = [
    "patient_identifier",
    "annotator",
    "creatorId",
    "more_than_one_layer",
];

/// One row of the annotation classification report.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ClassificationRow {
    pub patient_identifier: String,
    pub annotator: String,
    #[serde(rename = "creatorId")]
    pub creator_id: String,
    /// `yes`, `no`, or empty when the subject has no processed annotation file.
    pub more_than_one_layer: String,
}

impl ClassificationRow {
    fn new(id: &str, classification: Option<&AnnotationClassification>) -> Self {
        match classification {
            Some(c) => Self {
                patient_identifier: id.to_owned(),
                annotator: c.annotator.clone().unwrap_or_default(),
                creator_id: c.creator_id.clone().unwrap_or_default(),
                more_than_one_layer: if c.multiple_layers { "yes" } else { "no" }.to_owned(),
            },
            None => Self {
                patient_identifier: id.to_owned(),
                annotator: String::new(),
                creator_id: String::new(),
                more_than_one_layer: String::new(),
            },
        }
    }
}

/// Ordered collection of per-file results.
#[derive(Clone, Debug, Default)]
pub struct ResultLedger {
    records: Vec<ShiftResult>,
    first_by_identifier: HashMap<SubjectId, usize>,
}

impl ResultLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a result.
    ///
    /// A later result for an identifier already held is kept as its own row, but
    /// [`ResultLedger::get`] keeps returning the first. Returns `false` in that case.
    pub fn record(&mut self, result: ShiftResult) -> bool {
        let index = self.records.len();
        let first = match &result.identifier {
            Some(id) if self.first_by_identifier.contains_key(id.as_str()) => {
                tracing::debug!("{}: identifier '{}' already recorded", result.file, id);
                false
            }
            Some(id) => {
                self.first_by_identifier.insert(id.clone(), index);
                true
            }
            None => true,
        };
        self.records.push(result);
        first
    }

    pub fn records(&self) -> &[ShiftResult] {
        &self.records
    }

    pub fn get(&self, id: &str) -> Option<&ShiftResult> {
        self.first_by_identifier
            .get(id)
            .and_then(|&i| self.records.get(i))
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn summary(&self) -> LedgerSummary {
        let mut summary = LedgerSummary {
            total: self.records.len(),
            ..LedgerSummary::default()
        };
        for r in &self.records {
            match r.status {
                ShiftStatus::Success => summary.success += 1,
                ShiftStatus::Skipped => summary.skipped += 1,
                ShiftStatus::Failed => summary.failed += 1,
                ShiftStatus::Timeout => summary.timeout += 1,
            }
        }
        summary
    }

    /// Original and new dates of the first successful row per identifier.
    pub fn realized_shifts(&self) -> RealizedShifts {
        self.records
            .iter()
            .filter(|r| r.is_success())
            .filter_map(|r| {
                Some((
                    r.identifier.clone()?,
                    RealizedShift {
                        original_date: r.original_date?,
                        new_date: r.new_date?,
                    },
                ))
            })
            .collect()
    }

    /// Outer-join classifications onto the ledger's identifiers.
    ///
    /// One row per ledger row in ledger order, followed by any classified identifier the
    /// ledger does not hold (sorted). Unmatched ledger rows get empty classification columns;
    /// rows without an identifier also get an empty `patient_identifier`.
    pub fn merge_classifications(
        &self,
        classifications: &HashMap<SubjectId, AnnotationClassification>,
    ) -> Vec<ClassificationRow> {
        let mut rows: Vec<ClassificationRow> = self
            .records
            .iter()
            .map(|r| match &r.identifier {
                Some(id) => ClassificationRow::new(id.as_str(), classifications.get(id.as_str())),
                None => ClassificationRow::new("", None),
            })
            .collect();

        let mut extra: Vec<&SubjectId> = classifications
            .keys()
            .filter(|id| !self.first_by_identifier.contains_key(id.as_str()))
            .collect();
        extra.sort();
        rows.extend(
            extra
                .into_iter()
                .map(|id| ClassificationRow::new(id.as_str(), classifications.get(id.as_str()))),
        );
        rows
    }

    /// Write the report CSV atomically.
    ///
    /// # Errors
    ///
    /// Returns `DeidError::Csv` if serialisation fails or `DeidError::Files` if the write fails.
    pub fn write_report(&self, path: &Path) -> DeidResult<()> {
        let rows: Vec<ReportRow> = self.records.iter().map(ReportRow::from).collect();
        write_csv(path, &REPORT_COLUMNS, &rows)?;
        tracing::info!("wrote {} report rows to {}", rows.len(), path.display());
        Ok(())
    }

    /// Read a report CSV written by [`ResultLedger::write_report`].
    ///
    /// # Errors
    ///
    /// Returns `DeidError::Config` if the file is missing, a required column is absent, or a
    /// row cannot be parsed.
    pub fn read_report(path: &Path) -> DeidResult<Self> {
        if !path.is_file() {
            return Err(DeidError::Config(format!(
                "CSV file '{}' not found",
                path.display()
            )));
        }
        let file = std::fs::File::open(path).map_err(|e| {
            DeidError::Config(format!("cannot open CSV file '{}': {e}", path.display()))
        })?;
        Self::from_report_reader(file)
    }

    /// # Errors
    ///
    /// See [`ResultLedger::read_report`].
    pub fn from_report_reader<R: Read>(reader: R) -> DeidResult<Self> {
        let mut rdr = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .from_reader(reader);

        let headers = rdr
            .headers()
            .map_err(|e| DeidError::Config(format!("cannot read CSV header: {e}")))?
            .clone();
        if let Some(missing) = REPORT_COLUMNS
            .iter()
            .find(|c| !headers.iter().any(|h| h == **c))
        {
            return Err(DeidError::Config(format!(
                "CSV file missing required column: '{missing}'"
            )));
        }

        let mut ledger = Self::new();
        for (row, record) in rdr.deserialize::<ReportRow>().enumerate() {
            let line = row + 2;
            let record = record
                .map_err(|e| DeidError::Config(format!("report line {line}: malformed row: {e}")))?;
            ledger.record(record.into_result(line)?);
        }
        Ok(ledger)
    }
}

/// Write the classification report CSV atomically.
///
/// # Errors
///
/// Returns `DeidError::Csv` if serialisation fails or `DeidError::Files` if the write fails.
pub fn write_classification_report(rows: &[ClassificationRow], path: &Path) -> DeidResult<()> {
    write_csv(path, &CLASSIFICATION_COLUMNS, rows)?;
    tracing::info!("wrote {} classification rows to {}", rows.len(), path.display());
    Ok(())
}

/// The header is written explicitly so an empty table still carries its columns.
fn write_csv<T: Serialize>(path: &Path, columns: &[&str], rows: &[T]) -> DeidResult<()> {
    let mut wtr = csv::WriterBuilder::new()
        .has_headers(false)
        .from_writer(Vec::new());
    wtr.write_record(columns)?;
    for row in rows {
        wtr.serialize(row)?;
    }
    let bytes = wtr
        .into_inner()
        .map_err(|e| deid_files::FilesError::Io(e.into_error()))?;
    deid_files::write_atomic(path, &bytes)?;
    Ok(())
}
