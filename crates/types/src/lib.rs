//! Validated value types shared across the de-identification workspace.

/// Errors that can occur when creating validated text types.
#[derive(Debug, thiserror::Error)]
pub enum TextError {
    /// The input text was empty or contained only whitespace
    #[error("Text cannot be empty")]
    Empty,
    /// The input was not a recognised status keyword
    #[error("Unknown status: {0}")]
    UnknownStatus(String),
}

/// A string type that guarantees non-empty content.
///
/// The input is trimmed of leading and trailing whitespace during construction.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NonEmptyText(String);

impl NonEmptyText {
    /// Creates a new `NonEmptyText` from the given input.
    ///
    /// Returns `Err(TextError::Empty)` if the trimmed input is empty.
    pub fn new(input: impl AsRef<str>) -> Result<Self, TextError> {
        let trimmed = input.as_ref().trim();
        if trimmed.is_empty() {
            return Err(TextError::Empty);
        }
        Ok(Self(trimmed.to_owned()))
    }

    /// Returns the inner string as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for NonEmptyText {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for NonEmptyText {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl serde::Serialize for NonEmptyText {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> serde::Deserialize<'de> for NonEmptyText {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        NonEmptyText::new(&s).map_err(serde::de::Error::custom)
    }
}

/// Canonical subject identifier.
///
/// Correlates a recording, its annotation sidecar and its offset-table row. Always trimmed
/// and never empty.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct SubjectId(NonEmptyText);

impl SubjectId {
    pub fn new(input: impl AsRef<str>) -> Result<Self, TextError> {
        NonEmptyText::new(input).map(Self)
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

impl std::fmt::Display for SubjectId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl AsRef<str> for SubjectId {
    fn as_ref(&self) -> &str {
        self.as_str()
    }
}

impl std::borrow::Borrow<str> for SubjectId {
    fn borrow(&self) -> &str {
        self.as_str()
    }
}

/// Outcome of processing a single file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShiftStatus {
    Success,
    Skipped,
    Failed,
    Timeout,
}

impl ShiftStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ShiftStatus::Success => "success",
            ShiftStatus::Skipped => "skipped",
            ShiftStatus::Failed => "failed",
            ShiftStatus::Timeout => "timeout",
        }
    }
}

impl std::fmt::Display for ShiftStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ShiftStatus {
    type Err = TextError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "success" => Ok(ShiftStatus::Success),
            "skipped" => Ok(ShiftStatus::Skipped),
            "failed" => Ok(ShiftStatus::Failed),
            "timeout" => Ok(ShiftStatus::Timeout),
            other => Err(TextError::UnknownStatus(other.to_owned())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_non_empty_text_trims_input() {
        let text = NonEmptyText::new("  AB12 \t").expect("non-empty input");
        assert_eq!(text.as_str(), "AB12");
    }

    #[test]
    fn test_non_empty_text_rejects_whitespace() {
        assert!(matches!(NonEmptyText::new("   "), Err(TextError::Empty)));
    }

    #[test]
    fn test_subject_id_serialises_as_plain_string() {
        let id = SubjectId::new("AB12").expect("valid id");
        let json = serde_json::to_string(&id).expect("serialise");
        assert_eq!(json, "\"AB12\"");

        let back: SubjectId = serde_json::from_str("\" CD34 \"").expect("deserialise");
        assert_eq!(back.as_str(), "CD34");
    }

    #[test]
    fn test_subject_id_rejects_empty_json_string() {
        let result = serde_json::from_str::<SubjectId>("\"\"");
        assert!(result.is_err(), "empty identifier must not deserialise");
    }

    #[test]
    fn test_status_parses_and_displays() {
        for status in [
            ShiftStatus::Success,
            ShiftStatus::Skipped,
            ShiftStatus::Failed,
            ShiftStatus::Timeout,
        ] {
            let parsed: ShiftStatus = status.as_str().parse().expect("known status");
            assert_eq!(parsed, status);
        }
        assert!("error".parse::<ShiftStatus>().is_err());
    }
}
