//! Core runtime configuration.
//!
//! Configuration is resolved once at process startup (from CLI flags or environment values)
//! and then passed into the core services. Services never read process-wide environment
//! variables themselves.

use crate::constants::{
    DEFAULT_ID_PREFIX, DEFAULT_MAX_DATE, FIRST_REPRESENTABLE_YEAR, REPORT_DATE_FORMAT,
};
use crate::edf::ShiftPolicy;
use crate::{DeidError, DeidResult, NonEmptyText};
use chrono::NaiveDate;

/// How the EDF start-time field is treated when the start date is shifted.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum TimeMode {
    /// The time field bytes are left untouched.
    #[default]
    Preserve,
    /// The time field is decoded, shifted together with the date and re-encoded.
    ShiftWithDate,
}

impl TimeMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            TimeMode::Preserve => "preserve",
            TimeMode::ShiftWithDate => "shift-with-date",
        }
    }
}

impl std::str::FromStr for TimeMode {
    type Err = DeidError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "preserve" => Ok(TimeMode::Preserve),
            "shift-with-date" => Ok(TimeMode::ShiftWithDate),
            other => Err(DeidError::Config(format!(
                "unknown time mode '{other}' (expected 'preserve' or 'shift-with-date')"
            ))),
        }
    }
}

/// Where the EDF stage reads the subject identifier from.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum IdentifierSource {
    /// The 80-byte local patient identification field of the header.
    #[default]
    HeaderField,
    /// The recording filename (`PREFIX-<site>-<id>-<suffix>.<ext>`).
    Filename,
}

impl IdentifierSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            IdentifierSource::HeaderField => "header",
            IdentifierSource::Filename => "filename",
        }
    }
}

impl std::str::FromStr for IdentifierSource {
    type Err = DeidError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "header" => Ok(IdentifierSource::HeaderField),
            "filename" => Ok(IdentifierSource::Filename),
            other => Err(DeidError::Config(format!(
                "unknown identifier source '{other}' (expected 'header' or 'filename')"
            ))),
        }
    }
}

/// Core configuration resolved at startup.
#[derive(Clone, Debug)]
pub struct CoreConfig {
    max_date: NaiveDate,
    time_mode: TimeMode,
    identifier_source: IdentifierSource,
    identifier_prefix: NonEmptyText,
    rewrite_startdate_field: bool,
}

impl CoreConfig {
    /// Create a new `CoreConfig`.
    ///
    /// # Errors
    ///
    /// Returns `DeidError::Config` if:
    /// - `max_date` lies before the first date a `dd.mm.yy` field can represent
    /// - `identifier_prefix` is empty or contains characters other than ASCII alphanumerics
    pub fn new(
        max_date: NaiveDate,
        time_mode: TimeMode,
        identifier_source: IdentifierSource,
        identifier_prefix: &str,
        rewrite_startdate_field: bool,
    ) -> DeidResult<Self> {
        if max_date < first_representable_date() {
            return Err(DeidError::Config(format!(
                "maximum date {max_date} lies before {}",
                first_representable_date()
            )));
        }

        let identifier_prefix = NonEmptyText::new(identifier_prefix)
            .map_err(|_| DeidError::Config("identifier prefix cannot be empty".into()))?;
        if !identifier_prefix
            .as_str()
            .bytes()
            .all(|b| b.is_ascii_alphanumeric())
        {
            return Err(DeidError::Config(format!(
                "identifier prefix '{identifier_prefix}' must be ASCII alphanumeric"
            )));
        }

        Ok(Self {
            max_date,
            time_mode,
            identifier_source,
            identifier_prefix,
            rewrite_startdate_field,
        })
    }

    pub fn max_date(&self) -> NaiveDate {
        self.max_date
    }

    pub fn time_mode(&self) -> TimeMode {
        self.time_mode
    }

    pub fn identifier_source(&self) -> IdentifierSource {
        self.identifier_source
    }

    pub fn identifier_prefix(&self) -> &str {
        self.identifier_prefix.as_str()
    }

    pub fn rewrite_startdate_field(&self) -> bool {
        self.rewrite_startdate_field
    }

    /// The subset of configuration the pure header shift needs.
    pub fn shift_policy(&self) -> ShiftPolicy {
        ShiftPolicy {
            max_date: self.max_date,
            time_mode: self.time_mode,
            rewrite_startdate_field: self.rewrite_startdate_field,
        }
    }
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            max_date: default_max_date(),
            time_mode: TimeMode::default(),
            identifier_source: IdentifierSource::default(),
            identifier_prefix: NonEmptyText::new(DEFAULT_ID_PREFIX)
                .expect("default prefix is non-empty"),
            rewrite_startdate_field: false,
        }
    }
}

/// The default maximum-date ceiling, 2085-01-01.
pub fn default_max_date() -> NaiveDate {
    let (y, m, d) = DEFAULT_MAX_DATE;
    NaiveDate::from_ymd_opt(y, m, d).expect("default max date is a valid calendar date")
}

fn first_representable_date() -> NaiveDate {
    NaiveDate::from_ymd_opt(FIRST_REPRESENTABLE_YEAR, 1, 1).expect("valid calendar date")
}

/// Normalise an optional raw value: trimmed, with empty strings treated as absent.
fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Parse the maximum date from an optional `YYYY-MM-DD` value.
///
/// If `value` is `None` or blank, returns [`default_max_date`].
pub fn max_date_from_env_value(value: Option<String>) -> DeidResult<NaiveDate> {
    match non_blank(value) {
        Some(v) => NaiveDate::parse_from_str(&v, REPORT_DATE_FORMAT)
            .map_err(|e| DeidError::Config(format!("invalid maximum date '{v}': {e}"))),
        None => Ok(default_max_date()),
    }
}

/// Parse the time mode from an optional value, defaulting to [`TimeMode::Preserve`].
pub fn time_mode_from_env_value(value: Option<String>) -> DeidResult<TimeMode> {
    non_blank(value)
        .map(|v| v.parse::<TimeMode>())
        .transpose()
        .map(Option::unwrap_or_default)
}

/// Parse the identifier source from an optional value, defaulting to the header field.
pub fn identifier_source_from_env_value(value: Option<String>) -> DeidResult<IdentifierSource> {
    non_blank(value)
        .map(|v| v.parse::<IdentifierSource>())
        .transpose()
        .map(Option::unwrap_or_default)
}

/// Parse a boolean flag (`1`/`true`/`yes` or `0`/`false`/`no`), defaulting to `false`.
pub fn flag_from_env_value(value: Option<String>) -> DeidResult<bool> {
    match non_blank(value).map(|v| v.to_ascii_lowercase()).as_deref() {
        None | Some("0" | "false" | "no") => Ok(false),
        Some("1" | "true" | "yes") => Ok(true),
        Some(other) => Err(DeidError::Config(format!("invalid boolean flag '{other}'"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).expect("valid date")
    }

    #[test]
    fn test_default_config_values() {
        let cfg = CoreConfig::default();
        assert_eq!(cfg.max_date(), date(2085, 1, 1));
        assert_eq!(cfg.time_mode(), TimeMode::Preserve);
        assert_eq!(cfg.identifier_source(), IdentifierSource::HeaderField);
        assert_eq!(cfg.identifier_prefix(), "PRV");
        assert!(!cfg.rewrite_startdate_field());
    }

    #[test]
    fn test_new_rejects_bad_prefix() {
        let err = CoreConfig::new(
            date(2030, 1, 1),
            TimeMode::Preserve,
            IdentifierSource::Filename,
            "PR-V",
            false,
        )
        .expect_err("prefix with '-' must be rejected");
        assert!(err.is_fatal(), "config errors are fatal");

        assert!(CoreConfig::new(
            date(2030, 1, 1),
            TimeMode::Preserve,
            IdentifierSource::Filename,
            "   ",
            false
        )
        .is_err());
    }

    #[test]
    fn test_new_rejects_max_date_before_window() {
        let result = CoreConfig::new(
            date(1980, 1, 1),
            TimeMode::Preserve,
            IdentifierSource::HeaderField,
            "PRV",
            false,
        );
        assert!(matches!(result, Err(DeidError::Config(_))));
    }

    #[test]
    fn test_env_value_parsers() {
        assert_eq!(max_date_from_env_value(None).unwrap(), date(2085, 1, 1));
        assert_eq!(
            max_date_from_env_value(Some(" 2030-06-01 ".into())).unwrap(),
            date(2030, 6, 1)
        );
        assert!(max_date_from_env_value(Some("01.06.30".into())).is_err());

        assert_eq!(time_mode_from_env_value(Some("".into())).unwrap(), TimeMode::Preserve);
        assert_eq!(
            time_mode_from_env_value(Some("shift-with-date".into())).unwrap(),
            TimeMode::ShiftWithDate
        );
        assert!(time_mode_from_env_value(Some("sometimes".into())).is_err());

        assert_eq!(
            identifier_source_from_env_value(Some("filename".into())).unwrap(),
            IdentifierSource::Filename
        );
        assert_eq!(
            identifier_source_from_env_value(None).unwrap(),
            IdentifierSource::HeaderField
        );

        assert!(flag_from_env_value(Some("YES".into())).unwrap());
        assert!(!flag_from_env_value(None).unwrap());
        assert!(flag_from_env_value(Some("maybe".into())).is_err());
    }

    #[test]
    fn test_mode_names_parse_back() {
        for mode in [TimeMode::Preserve, TimeMode::ShiftWithDate] {
            assert_eq!(mode.as_str().parse::<TimeMode>().unwrap(), mode);
        }
        for source in [IdentifierSource::HeaderField, IdentifierSource::Filename] {
            assert_eq!(source.as_str().parse::<IdentifierSource>().unwrap(), source);
        }
    }

    #[test]
    fn test_shift_policy_mirrors_config() {
        let cfg = CoreConfig::new(
            date(2040, 12, 31),
            TimeMode::ShiftWithDate,
            IdentifierSource::HeaderField,
            "PRV",
            true,
        )
        .unwrap();
        let policy = cfg.shift_policy();
        assert_eq!(policy.max_date, date(2040, 12, 31));
        assert_eq!(policy.time_mode, TimeMode::ShiftWithDate);
        assert!(policy.rewrite_startdate_field);
    }
}
