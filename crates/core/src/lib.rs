//! # Deid Core
//!
//! Date-shift de-identification of EDF recordings and their annotation sidecars.
//!
//! Each subject gets a random day offset. The recording's header start date is moved by that
//! offset, and the annotation sidecar's `createTime` values follow by the offset the header
//! stage actually applied, so the two files stay mutually consistent:
//! - [`identifier`]: subject identifiers from header fields and filenames
//! - [`offsets`]: the subject to day-offset table
//! - [`edf`]: byte-exact header shifting with a maximum-date ceiling
//! - [`annotations`]: `createTime` shifting and identifier removal for sidecars
//! - [`ledger`]: per-file results and the report CSV
//!
//! **No process concerns**: argument parsing, directory scans and subprocess orchestration
//! belong in the `deid` and `deid-run` binaries.

pub mod annotations;
pub mod config;
pub mod constants;
pub mod edf;
pub mod error;
pub mod identifier;
pub mod ledger;
pub mod offsets;

pub use annotations::{
    parse_create_time, shift_annotations, strip_identifiers, AnnotationClassification,
    AnnotationShift, AnnotationShifter, AnnotationStripper, ShiftedDocument, StripOutcome,
    StrippedDocument,
};
pub use config::{CoreConfig, IdentifierSource, TimeMode};
pub use deid_types::{NonEmptyText, ShiftStatus, SubjectId, TextError};
pub use edf::{shift_header, EdfShifter, HeaderRecord, ShiftPolicy, ShiftedHeader};
pub use error::{DeidError, DeidResult};
pub use identifier::IdentifierResolver;
pub use ledger::{
    write_classification_report, ClassificationRow, LedgerSummary, RealizedShift,
    RealizedShifts, ResultLedger, ShiftDraft, ShiftResult, CLASSIFICATION_COLUMNS, REPORT_COLUMNS,
};
pub use offsets::OffsetTable;
