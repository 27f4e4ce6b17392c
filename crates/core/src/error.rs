use chrono::NaiveDate;
use deid_types::ShiftStatus;

#[derive(Debug, thiserror::Error)]
pub enum DeidError {
    #[error("configuration error: {0}")]
    Config(String),
    #[error("format error: {0}")]
    Format(String),
    #[error("lookup error: {0}")]
    Lookup(String),
    #[error("identifier not resolvable from '{raw}'")]
    UnresolvedIdentifier { raw: String },
    #[error("new date {new_date} exceeds maximum allowed date {max_date}")]
    BoundExceeded {
        new_date: NaiveDate,
        max_date: NaiveDate,
    },
    #[error("createTime date {found} does not match EDF start date {expected}")]
    Consistency { found: NaiveDate, expected: NaiveDate },
    #[error("process timed out after {0} seconds")]
    Timeout(u64),
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
    #[error("file storage error: {0}")]
    Files(#[from] deid_files::FilesError),
}

impl DeidError {
    /// Only configuration errors abort a run; everything else is recorded per file.
    pub fn is_fatal(&self) -> bool {
        matches!(self, DeidError::Config(_))
    }

    /// Ledger status recorded for a file that failed with this error.
    pub fn status(&self) -> ShiftStatus {
        match self {
            DeidError::Lookup(_)
            | DeidError::UnresolvedIdentifier { .. }
            | DeidError::Consistency { .. } => ShiftStatus::Skipped,
            DeidError::Timeout(_) => ShiftStatus::Timeout,
            DeidError::Config(_)
            | DeidError::Format(_)
            | DeidError::BoundExceeded { .. }
            | DeidError::Csv(_)
            | DeidError::Files(_) => ShiftStatus::Failed,
        }
    }
}

pub type DeidResult<T> = std::result::Result<T, DeidError>;
