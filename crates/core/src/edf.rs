//! EDF header date shifting.
//!
//! The EDF header stores its start date and time as fixed-width ASCII fields:
//!
//! ```text
//! bytes   0..8     version
//! bytes   8..88    local patient identification
//! bytes  88..168   local recording identification ("Startdate DD-MMM-YYYY ...")
//! bytes 168..176   start date  dd.mm.yy
//! bytes 176..184   start time  hh.mm.ss
//! ```
//!
//! [`shift_header`] is the pure in-memory transformation: it decodes the start date, adds
//! the subject's day offset, enforces the maximum-date ceiling and re-encodes only the
//! affected fields. Every other byte of the buffer is carried over verbatim.
//!
//! [`EdfShifter`] wraps it with file handling: read the source fully, resolve the subject,
//! look up the offset, shift, and write the result to a new file. The source is never opened
//! for writing and nothing is written unless the shift succeeds.

use crate::config::{CoreConfig, IdentifierSource, TimeMode};
use crate::constants::{
    FIRST_REPRESENTABLE_YEAR, HEADER_MIN_LEN, LAST_REPRESENTABLE_YEAR, MONTH_ABBREVIATIONS,
    PATIENT_ID_RANGE, RECORDING_ID_RANGE, STARTDATE_KEYWORD, START_DATE_RANGE,
    START_TIME_RANGE, TWO_DIGIT_YEAR_PIVOT, VERSION_RANGE,
};
use crate::identifier::IdentifierResolver;
use crate::ledger::{ShiftDraft, ShiftResult};
use crate::offsets::OffsetTable;
use crate::{DeidError, DeidResult, SubjectId};
use chrono::{Datelike, NaiveDate, NaiveDateTime, NaiveTime, TimeDelta, Timelike};
use deid_files::OutputService;
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// In-memory copy of one EDF file, header included.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HeaderRecord {
    bytes: Vec<u8>,
}

impl HeaderRecord {
    /// Wrap a full file buffer.
    ///
    /// # Errors
    ///
    /// Returns `DeidError::Format` if the buffer is shorter than 256 bytes.
    pub fn from_bytes(bytes: Vec<u8>) -> DeidResult<Self> {
        if bytes.len() < HEADER_MIN_LEN {
            return Err(DeidError::Format(format!(
                "EDF file is too small ({} < {HEADER_MIN_LEN} bytes)",
                bytes.len()
            )));
        }
        Ok(Self { bytes })
    }

    pub fn version(&self) -> String {
        self.text(VERSION_RANGE)
    }

    pub fn patient_identification(&self) -> String {
        self.text(PATIENT_ID_RANGE)
    }

    pub fn recording_identification(&self) -> String {
        self.text(RECORDING_ID_RANGE)
    }

    pub fn start_date_text(&self) -> String {
        self.text(START_DATE_RANGE)
    }

    pub fn start_time_text(&self) -> String {
        self.text(START_TIME_RANGE)
    }

    /// # Errors
    ///
    /// Returns `DeidError::Format` if the field is not a valid `dd.mm.yy` date.
    pub fn start_date(&self) -> DeidResult<NaiveDate> {
        decode_edf_date(&self.start_date_text())
    }

    /// # Errors
    ///
    /// Returns `DeidError::Format` if the field is not a valid `hh.mm.ss` time.
    pub fn start_time(&self) -> DeidResult<NaiveTime> {
        decode_edf_time(&self.start_time_text())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }

    /// ASCII content of a field, non-ASCII bytes dropped, surrounding spaces trimmed.
    fn text(&self, range: Range<usize>) -> String {
        self.bytes[range]
            .iter()
            .filter(|b| b.is_ascii())
            .map(|&b| char::from(b))
            .collect::<String>()
            .trim()
            .to_owned()
    }

    /// Overwrite a whole field with `value`, left-justified and space-padded.
    fn write_field(&mut self, range: Range<usize>, value: &str) -> DeidResult<()> {
        let width = range.len();
        if !value.is_ascii() || value.len() > width {
            return Err(DeidError::Format(format!(
                "value '{value}' does not fit a {width}-byte ASCII field"
            )));
        }
        let field = &mut self.bytes[range];
        field.fill(b' ');
        field[..value.len()].copy_from_slice(value.as_bytes());
        Ok(())
    }
}

/// Decode an EDF `dd.mm.yy` date.
///
/// Two-digit years `>= 85` map to 19yy, the rest to 20yy.
///
/// # Errors
///
/// Returns `DeidError::Format` if the text is not three dot-separated numbers forming a
/// valid calendar date.
pub fn decode_edf_date(text: &str) -> DeidResult<NaiveDate> {
    let invalid = || DeidError::Format(format!("error parsing date '{text}'"));
    let [day, month, year] = split_triplet(text).ok_or_else(invalid)?;
    if year > 99 {
        return Err(invalid());
    }
    let full_year = if year >= TWO_DIGIT_YEAR_PIVOT {
        1900 + year
    } else {
        2000 + year
    };
    let full_year = i32::try_from(full_year).map_err(|_| invalid())?;
    NaiveDate::from_ymd_opt(full_year, month, day).ok_or_else(invalid)
}

/// Encode a date as EDF `dd.mm.yy`.
///
/// # Errors
///
/// Returns `DeidError::Format` if the year falls outside the window the two-digit form can
/// represent unambiguously (1985–2084).
pub fn encode_edf_date(date: NaiveDate) -> DeidResult<String> {
    if !(FIRST_REPRESENTABLE_YEAR..=LAST_REPRESENTABLE_YEAR).contains(&date.year()) {
        return Err(DeidError::Format(format!(
            "date {date} cannot be encoded as dd.mm.yy \
             (representable years {FIRST_REPRESENTABLE_YEAR}-{LAST_REPRESENTABLE_YEAR})"
        )));
    }
    Ok(format!(
        "{:02}.{:02}.{:02}",
        date.day(),
        date.month(),
        date.year() % 100
    ))
}

/// Decode an EDF `hh.mm.ss` time.
///
/// # Errors
///
/// Returns `DeidError::Format` if the text is not a valid time of day.
pub fn decode_edf_time(text: &str) -> DeidResult<NaiveTime> {
    let invalid = || DeidError::Format(format!("error parsing time '{text}'"));
    let [hour, minute, second] = split_triplet(text).ok_or_else(invalid)?;
    NaiveTime::from_hms_opt(hour, minute, second).ok_or_else(invalid)
}

/// Encode a time as EDF `hh.mm.ss`.
pub fn encode_edf_time(time: NaiveTime) -> String {
    format!(
        "{:02}.{:02}.{:02}",
        time.hour(),
        time.minute(),
        time.second()
    )
}

/// Render the human-readable `Startdate DD-MMM-YYYY` field text.
pub fn format_startdate_field(date: NaiveDate) -> String {
    let month = MONTH_ABBREVIATIONS[date.month0() as usize];
    format!(
        "{STARTDATE_KEYWORD} {:02}-{month}-{:04}",
        date.day(),
        date.year()
    )
}

fn split_triplet(text: &str) -> Option<[u32; 3]> {
    let mut parts = text.trim().split('.');
    let mut next = || {
        parts
            .next()
            .filter(|p| !p.is_empty() && p.len() <= 2 && p.bytes().all(|b| b.is_ascii_digit()))
            .and_then(|p| p.parse::<u32>().ok())
    };
    let triplet = [next()?, next()?, next()?];
    if parts.next().is_some() {
        return None;
    }
    Some(triplet)
}

/// Parameters of the pure header shift.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ShiftPolicy {
    /// Latest allowed new start date (inclusive).
    pub max_date: NaiveDate,
    pub time_mode: TimeMode,
    /// Rewrite the 80-byte recording field as `Startdate DD-MMM-YYYY`.
    pub rewrite_startdate_field: bool,
}

/// Outcome of a successful [`shift_header`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ShiftedHeader {
    pub bytes: Vec<u8>,
    pub original_date: NaiveDate,
    /// `None` when the time field is preserved and could not be decoded.
    pub original_time: Option<NaiveTime>,
    pub new_date: NaiveDate,
    pub new_time: Option<NaiveTime>,
}

/// Shift the start date in an EDF buffer by `offset_days`.
///
/// With a zero offset no field is re-encoded and the returned bytes equal the input.
///
/// # Errors
///
/// - `DeidError::Format`: buffer under 256 bytes, unparseable date (or time, when the time
///   is shifted), or a new date the `dd.mm.yy` form cannot represent
/// - `DeidError::BoundExceeded`: the new date is later than `policy.max_date`
pub fn shift_header(
    buffer: &[u8],
    offset_days: i64,
    policy: &ShiftPolicy,
) -> DeidResult<ShiftedHeader> {
    let mut header = HeaderRecord::from_bytes(buffer.to_vec())?;

    let original_date = header.start_date()?;
    let original_time = match policy.time_mode {
        TimeMode::Preserve => header.start_time().ok(),
        TimeMode::ShiftWithDate => Some(header.start_time()?),
    };

    let delta = TimeDelta::try_days(offset_days)
        .ok_or_else(|| DeidError::Format(format!("offset of {offset_days} days is out of range")))?;
    let original = NaiveDateTime::new(original_date, original_time.unwrap_or(NaiveTime::MIN));
    let shifted = original.checked_add_signed(delta).ok_or_else(|| {
        DeidError::Format(format!(
            "shifting {original_date} by {offset_days} days leaves the calendar range"
        ))
    })?;

    let new_date = shifted.date();
    let new_time = match policy.time_mode {
        TimeMode::Preserve => original_time,
        TimeMode::ShiftWithDate => Some(shifted.time()),
    };

    if new_date > policy.max_date {
        return Err(DeidError::BoundExceeded {
            new_date,
            max_date: policy.max_date,
        });
    }

    if offset_days != 0 {
        header.write_field(START_DATE_RANGE, &encode_edf_date(new_date)?)?;
        if let (TimeMode::ShiftWithDate, Some(time)) = (policy.time_mode, new_time) {
            header.write_field(START_TIME_RANGE, &encode_edf_time(time))?;
        }
        if policy.rewrite_startdate_field {
            header.write_field(RECORDING_ID_RANGE, &format_startdate_field(new_date))?;
        }
    }

    Ok(ShiftedHeader {
        bytes: header.into_bytes(),
        original_date,
        original_time,
        new_date,
        new_time,
    })
}

/// File-level EDF date shifting service.
#[derive(Clone, Debug)]
pub struct EdfShifter {
    cfg: Arc<CoreConfig>,
    resolver: IdentifierResolver,
    offsets: Arc<OffsetTable>,
}

impl EdfShifter {
    /// # Errors
    ///
    /// Returns `DeidError::Config` if the identifier patterns cannot be built.
    pub fn new(cfg: Arc<CoreConfig>, offsets: Arc<OffsetTable>) -> DeidResult<Self> {
        let resolver = IdentifierResolver::new(cfg.identifier_prefix())?;
        Ok(Self {
            cfg,
            resolver,
            offsets,
        })
    }

    /// Shift `input` and write the result under `output`'s directory.
    pub fn process_file(&self, input: &Path, output: &OutputService) -> ShiftResult {
        self.run(input, |bytes| Ok(output.write(input, bytes)?))
    }

    /// Shift `input` and write the result to an explicit `destination`.
    pub fn shift_to(&self, input: &Path, destination: &Path) -> ShiftResult {
        self.run(input, |bytes| {
            deid_files::write_new_file(input, destination, bytes)?;
            Ok(destination.to_path_buf())
        })
    }

    fn run(
        &self,
        input: &Path,
        write: impl FnOnce(&[u8]) -> DeidResult<PathBuf>,
    ) -> ShiftResult {
        let mut draft = ShiftDraft::new(input);
        match self.try_run(input, &mut draft, write) {
            Ok(output_path) => {
                tracing::info!(
                    "shifted {} ({}): {} -> {}",
                    draft.file,
                    draft.identifier.as_ref().map(SubjectId::as_str).unwrap_or("?"),
                    draft.original_date.map(|d| d.to_string()).unwrap_or_default(),
                    draft.new_date.map(|d| d.to_string()).unwrap_or_default()
                );
                draft.succeed(output_path)
            }
            Err(e) => {
                tracing::warn!("{}: {}", draft.file, e);
                draft.fail(&e)
            }
        }
    }

    fn try_run(
        &self,
        input: &Path,
        draft: &mut ShiftDraft,
        write: impl FnOnce(&[u8]) -> DeidResult<PathBuf>,
    ) -> DeidResult<PathBuf> {
        let header = HeaderRecord::from_bytes(deid_files::read_source(input)?)?;

        let identifier = self.resolve_identifier(&draft.file, &header)?;
        draft.identifier = Some(identifier.clone());

        let offset_days = self.offsets.get(identifier.as_str()).ok_or_else(|| {
            DeidError::Lookup(format!(
                "patient identifier '{identifier}' not found in offset table"
            ))
        })?;
        draft.offset_days = Some(offset_days);

        // Record what is known before the bound check so a rejected file still reports it.
        draft.original_date = header.start_date().ok();
        draft.original_time = header.start_time().ok();

        let shifted = shift_header(header.as_bytes(), offset_days, &self.cfg.shift_policy())
            .inspect_err(|e| {
                if let DeidError::BoundExceeded { new_date, .. } = e {
                    draft.new_date = Some(*new_date);
                }
            })?;
        draft.new_date = Some(shifted.new_date);
        draft.new_time = shifted.new_time;

        write(&shifted.bytes)
    }

    fn resolve_identifier(&self, file_name: &str, header: &HeaderRecord) -> DeidResult<SubjectId> {
        match self.cfg.identifier_source() {
            IdentifierSource::HeaderField => self
                .resolver
                .from_header_field(&header.patient_identification()),
            IdentifierSource::Filename => self.resolver.from_recording_filename(file_name),
        }
    }
}
