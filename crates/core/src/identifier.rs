//! Subject identifier resolution.
//!
//! A subject identifier appears in two shapes: embedded in the 80-byte EDF patient field
//! (`PRV-001-AB12-45 X X X`) and embedded in filenames (`PRV-001-AB12-45.edf`,
//! `PRV-001-AB12-45-annotations.xml`). All three resolve to the `<id>` group of the
//! structured pattern `PREFIX-<site>-<id>-<suffix>`.
//!
//! Resolution is a pure function of the input string.

use crate::constants::ANNOTATIONS_SUFFIX;
use crate::{DeidError, DeidResult, SubjectId};
use regex::Regex;

/// Compiled identifier patterns for one configured prefix.
#[derive(Clone, Debug)]
pub struct IdentifierResolver {
    structured: Regex,
    recording_filename: Regex,
    annotation_filename: Regex,
}

impl IdentifierResolver {
    /// Build the resolver for `prefix` (for example `PRV`).
    ///
    /// # Errors
    ///
    /// Returns `DeidError::Config` if the patterns cannot be compiled.
    pub fn new(prefix: &str) -> DeidResult<Self> {
        let p = regex::escape(prefix);
        let compile = |pattern: String| {
            Regex::new(&pattern)
                .map_err(|e| DeidError::Config(format!("invalid identifier pattern: {e}")))
        };

        Ok(Self {
            structured: compile(format!(r"{p}-[^-\s]+-([^-\s]+)-[^-\s]+"))?,
            recording_filename: compile(format!(r"{p}-[^-]+-([^-]+)-[^-]+\.[^.]+$"))?,
            annotation_filename: compile(format!(
                r"{p}-[^-]+-([^-]+)-[^-]+{}$",
                regex::escape(ANNOTATIONS_SUFFIX)
            ))?,
        })
    }

    /// Resolve from a decoded header field.
    ///
    /// Falls back to the first whitespace-delimited token of exactly four ASCII
    /// alphanumeric characters when the structured pattern does not match.
    ///
    /// # Errors
    ///
    /// Returns `DeidError::UnresolvedIdentifier` carrying the raw field.
    pub fn from_header_field(&self, raw: &str) -> DeidResult<SubjectId> {
        if let Some(id) = capture_id(&self.structured, raw) {
            return Ok(id);
        }

        raw.split_whitespace()
            .find(|token| token.len() == 4 && token.bytes().all(|b| b.is_ascii_alphanumeric()))
            .and_then(|token| SubjectId::new(token).ok())
            .ok_or_else(|| unresolved(raw))
    }

    /// Resolve from a recording filename, `PREFIX-<site>-<id>-<suffix>.<ext>`.
    ///
    /// # Errors
    ///
    /// Returns `DeidError::UnresolvedIdentifier` carrying the filename.
    pub fn from_recording_filename(&self, file_name: &str) -> DeidResult<SubjectId> {
        capture_id(&self.recording_filename, file_name).ok_or_else(|| unresolved(file_name))
    }

    /// Resolve from a sidecar filename, `PREFIX-<site>-<id>-<suffix>-annotations.xml`.
    ///
    /// # Errors
    ///
    /// Returns `DeidError::UnresolvedIdentifier` carrying the filename.
    pub fn from_annotation_filename(&self, file_name: &str) -> DeidResult<SubjectId> {
        capture_id(&self.annotation_filename, file_name).ok_or_else(|| unresolved(file_name))
    }
}

fn capture_id(pattern: &Regex, raw: &str) -> Option<SubjectId> {
    pattern
        .captures(raw)
        .and_then(|caps| caps.get(1))
        .and_then(|m| SubjectId::new(m.as_str()).ok())
}

fn unresolved(raw: &str) -> DeidError {
    DeidError::UnresolvedIdentifier {
        raw: raw.to_owned(),
    }
}
