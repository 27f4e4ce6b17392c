//! Annotation sidecar editing.
//!
//! Annotation files are edited as text: regular expressions locate attribute value spans and
//! only those spans change, so formatting, attribute order, comments and entities survive
//! untouched. `roxmltree` is used to check that the input is well-formed XML and to read
//! attribute values for classification, never to write.
//!
//! Two operations:
//! - [`shift_annotations`] moves every `createTime` by a whole number of days, guarded by a
//!   check that the first timestamp falls on the recording's original start date.
//! - [`strip_identifiers`] removes `createTime`, `annotator` and `creatorId` attributes and
//!   `channels` elements, after recording who annotated the file.

use crate::config::CoreConfig;
use crate::identifier::IdentifierResolver;
use crate::ledger::{RealizedShifts, ResultLedger, ShiftDraft, ShiftResult};
use crate::{DeidError, DeidResult, SubjectId};
use chrono::{NaiveDate, NaiveDateTime, TimeDelta};
use deid_files::OutputService;
use regex::Regex;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock};

static CREATE_TIME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"\screateTime\s*=\s*(?:"([^"]*)"|'([^']*)')"#)
        .expect("createTime pattern is valid")
});

static IDENTIFYING_ATTRIBUTE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"\s+(?:createTime|annotator|creatorId)\s*=\s*(?:"[^"]*"|'[^']*')"#)
        .expect("attribute pattern is valid")
});

static CHANNELS_ELEMENT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)\s*<channels\b(?:[^>]*/>|[^>]*>.*?</channels\s*>)")
        .expect("channels pattern is valid")
});

const CREATE_TIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.f";

/// Result of [`shift_annotations`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AnnotationShift {
    Shifted(ShiftedDocument),
    /// The offset is zero; nothing to rewrite.
    ZeroOffset,
    /// The document carries no `createTime` attribute.
    NoTimestamps,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ShiftedDocument {
    pub text: String,
    /// First `createTime` of the input, before shifting.
    pub first_timestamp: NaiveDateTime,
    pub updated_count: usize,
}

/// Who annotated a file, gathered before identifying attributes are removed.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AnnotationClassification {
    /// First `annotator` value seen.
    pub annotator: Option<String>,
    /// First `creatorId` value seen.
    pub creator_id: Option<String>,
    /// More than one distinct `layer` value across annotations.
    pub multiple_layers: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StrippedDocument {
    pub text: String,
    pub classification: AnnotationClassification,
}

/// Parse a `createTime` value, `YYYY-MM-DDTHH:MM:SS[.fff][Z]`.
///
/// # Errors
///
/// Returns `DeidError::Format` if the value does not match.
pub fn parse_create_time(value: &str) -> DeidResult<NaiveDateTime> {
    let trimmed = value.trim();
    let naive = trimmed.strip_suffix('Z').unwrap_or(trimmed);
    NaiveDateTime::parse_from_str(naive, CREATE_TIME_FORMAT)
        .map_err(|e| DeidError::Format(format!("error parsing createTime '{value}': {e}")))
}

/// Well-formedness check. Sidecars may carry a DOCTYPE; it is not validated against.
fn validate_xml(text: &str) -> DeidResult<roxmltree::Document<'_>> {
    let options = roxmltree::ParsingOptions {
        allow_dtd: true,
        ..Default::default()
    };
    roxmltree::Document::parse_with_options(text, options)
        .map_err(|e| DeidError::Format(format!("XML parsing error: {e}")))
}

/// Shift every `createTime` value in `text` by `offset_days`.
///
/// The date part of each value is replaced; the time, fractional seconds and zone suffix are
/// kept as written.
///
/// # Errors
///
/// - `DeidError::Format`: the text is not well-formed XML, the located values disagree with
///   the parsed document, or any value cannot be parsed
/// - `DeidError::Consistency`: the first timestamp's date differs from `original_date`
pub fn shift_annotations(
    text: &str,
    original_date: NaiveDate,
    offset_days: i64,
) -> DeidResult<AnnotationShift> {
    let doc = validate_xml(text)?;
    let declared = doc
        .descendants()
        .filter(|n| n.is_element() && n.attribute("createTime").is_some())
        .count();

    let spans: Vec<regex::Match<'_>> = CREATE_TIME
        .captures_iter(text)
        .filter_map(|caps| caps.get(1).or_else(|| caps.get(2)))
        .collect();
    if spans.len() != declared {
        return Err(DeidError::Format(format!(
            "found {} createTime values in the text but {declared} in the document",
            spans.len()
        )));
    }

    let Some(first) = spans.first() else {
        return Ok(AnnotationShift::NoTimestamps);
    };
    let first_timestamp = parse_create_time(first.as_str())?;
    if first_timestamp.date() != original_date {
        return Err(DeidError::Consistency {
            found: first_timestamp.date(),
            expected: original_date,
        });
    }

    if offset_days == 0 {
        return Ok(AnnotationShift::ZeroOffset);
    }
    let delta = TimeDelta::try_days(offset_days)
        .ok_or_else(|| DeidError::Format(format!("offset of {offset_days} days is out of range")))?;

    let mut out = String::with_capacity(text.len());
    let mut cursor = 0;
    for span in &spans {
        let value = span.as_str();
        let shifted = parse_create_time(value)?
            .checked_add_signed(delta)
            .ok_or_else(|| DeidError::Format(format!("cannot shift createTime '{value}'")))?;

        let lead = value.len() - value.trim_start().len();
        let date_end = lead
            + value
                .trim_start()
                .find('T')
                .ok_or_else(|| DeidError::Format(format!("malformed createTime '{value}'")))?;
        out.push_str(&text[cursor..span.start()]);
        out.push_str(&value[..lead]);
        out.push_str(&shifted.format("%Y-%m-%d").to_string());
        out.push_str(&value[date_end..]);
        cursor = span.end();
    }
    out.push_str(&text[cursor..]);

    tracing::debug!("shifted {} createTime values by {} days", spans.len(), offset_days);
    Ok(AnnotationShift::Shifted(ShiftedDocument {
        text: out,
        first_timestamp,
        updated_count: spans.len(),
    }))
}

/// Remove identifying attributes and `channels` elements from `text`.
///
/// # Errors
///
/// Returns `DeidError::Format` if the text is not well-formed XML, the root has no
/// `annotation` children, or the edited text no longer parses.
pub fn strip_identifiers(text: &str) -> DeidResult<StrippedDocument> {
    let classification = classify(&validate_xml(text)?)?;

    let without_channels = CHANNELS_ELEMENT.replace_all(text, "");
    let stripped = IDENTIFYING_ATTRIBUTE
        .replace_all(&without_channels, "")
        .into_owned();

    validate_xml(&stripped).map_err(|e| {
        DeidError::Format(format!("document is malformed after removing identifiers: {e}"))
    })?;

    Ok(StrippedDocument {
        text: stripped,
        classification,
    })
}

fn classify(doc: &roxmltree::Document<'_>) -> DeidResult<AnnotationClassification> {
    let annotations: Vec<_> = doc
        .root_element()
        .children()
        .filter(|n| n.has_tag_name("annotation"))
        .collect();
    if annotations.is_empty() {
        return Err(DeidError::Format("no annotation elements found".into()));
    }

    let first = |name: &str| {
        annotations
            .iter()
            .find_map(|n| n.attribute(name))
            .map(str::to_owned)
    };
    let layers: HashSet<&str> = annotations
        .iter()
        .filter_map(|n| n.attribute("layer"))
        .collect();

    Ok(AnnotationClassification {
        annotator: first("annotator"),
        creator_id: first("creatorId"),
        multiple_layers: layers.len() > 1,
    })
}

/// File-level `createTime` shifting driven by a header-stage report.
#[derive(Clone, Debug)]
pub struct AnnotationShifter {
    resolver: IdentifierResolver,
    realized: Arc<RealizedShifts>,
}

impl AnnotationShifter {
    /// # Errors
    ///
    /// Returns `DeidError::Config` if the identifier patterns cannot be built.
    pub fn new(cfg: &CoreConfig, realized: Arc<RealizedShifts>) -> DeidResult<Self> {
        Ok(Self {
            resolver: IdentifierResolver::new(cfg.identifier_prefix())?,
            realized,
        })
    }

    pub fn process_file(&self, input: &Path, output: &OutputService) -> ShiftResult {
        let mut draft = ShiftDraft::new(input);
        match self.try_process(input, output, &mut draft) {
            Ok(FileOutcome::Written(path)) => {
                tracing::info!("shifted createTime values in {}", draft.file);
                draft.succeed(path)
            }
            Ok(FileOutcome::Skipped(reason)) => {
                tracing::info!("{}: {}", draft.file, reason);
                draft.skip(reason)
            }
            Err(e) => {
                tracing::warn!("{}: {}", draft.file, e);
                draft.fail(&e)
            }
        }
    }

    fn try_process(
        &self,
        input: &Path,
        output: &OutputService,
        draft: &mut ShiftDraft,
    ) -> DeidResult<FileOutcome> {
        let identifier = self.resolver.from_annotation_filename(&draft.file)?;
        draft.identifier = Some(identifier.clone());

        let realized = self.realized.get(identifier.as_str()).ok_or_else(|| {
            DeidError::Lookup(format!(
                "patient identifier '{identifier}' not found in report results"
            ))
        })?;
        draft.offset_days = Some(realized.offset_days());
        draft.original_date = Some(realized.original_date);

        let text = deid_files::read_source_text(input)?;
        match shift_annotations(&text, realized.original_date, realized.offset_days())? {
            AnnotationShift::Shifted(doc) => {
                draft.original_time = Some(doc.first_timestamp.time());
                draft.new_date = Some(realized.new_date);
                draft.new_time = draft.original_time;
                Ok(FileOutcome::Written(output.write(input, doc.text.as_bytes())?))
            }
            AnnotationShift::ZeroOffset => Ok(FileOutcome::Skipped("No date offset needed")),
            AnnotationShift::NoTimestamps => {
                Ok(FileOutcome::Skipped("No createTime attributes found"))
            }
        }
    }
}

enum FileOutcome {
    Written(PathBuf),
    Skipped(&'static str),
}

/// Outcome of stripping one annotation file.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StripOutcome {
    pub identifier: SubjectId,
    pub classification: AnnotationClassification,
    pub output_path: PathBuf,
}

/// File-level identifier removal for subjects present in a header-stage report.
#[derive(Clone, Debug)]
pub struct AnnotationStripper {
    resolver: IdentifierResolver,
    ledger: Arc<ResultLedger>,
}

impl AnnotationStripper {
    /// # Errors
    ///
    /// Returns `DeidError::Config` if the identifier patterns cannot be built.
    pub fn new(cfg: &CoreConfig, ledger: Arc<ResultLedger>) -> DeidResult<Self> {
        Ok(Self {
            resolver: IdentifierResolver::new(cfg.identifier_prefix())?,
            ledger,
        })
    }

    /// # Errors
    ///
    /// - `DeidError::UnresolvedIdentifier` / `DeidError::Lookup`: the file is skipped
    /// - `DeidError::Format` / `DeidError::Files`: the file failed
    pub fn process_file(&self, input: &Path, output: &OutputService) -> DeidResult<StripOutcome> {
        let file = ShiftDraft::new(input).file;
        let identifier = self.resolver.from_annotation_filename(&file)?;
        if self.ledger.get(identifier.as_str()).is_none() {
            return Err(DeidError::Lookup(format!(
                "patient identifier '{identifier}' not found in report"
            )));
        }

        let text = deid_files::read_source_text(input)?;
        let stripped = strip_identifiers(&text)?;
        let output_path = output.write(input, stripped.text.as_bytes())?;
        tracing::info!("removed identifying attributes from {}", file);

        Ok(StripOutcome {
            identifier,
            classification: stripped.classification,
            output_path,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::RealizedShift;
    use deid_types::ShiftStatus;
    use std::fs;
    use tempfile::TempDir;

    const SIDECAR: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<annotations version="2">
  <!-- exported -->
  <annotation id="1" createTime="2020-01-01T13:40:00Z" annotator="Dr X" creatorId="u-17" layer="sleep">
    <channels>
      <channel name="Fp1"/>
    </channels>
    <label>N2</label>
  </annotation>
  <annotation id="2"   createTime = '2020-01-02T00:10:05.250Z' annotator="Dr Y" layer="sleep"/>
  <annotation id="3" createTime="2020-01-31T23:59:59Z" creatorId="u-18" layer="artefact"><channels/></annotation>
</annotations>
"#;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).expect("valid date")
    }

    fn shifted(result: AnnotationShift) -> ShiftedDocument {
        match result {
            AnnotationShift::Shifted(doc) => doc,
            other => panic!("expected a shifted document, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_create_time_variants() {
        assert!(parse_create_time("2020-08-20T18:24:35Z").is_ok());
        assert!(parse_create_time("2020-08-20T18:24:35.123Z").is_ok());
        assert!(parse_create_time("2020-08-20T18:24:35").is_ok());
        assert!(parse_create_time("20.08.2020 18:24").is_err());
    }

    #[test]
    fn test_shift_rewrites_only_date_prefixes() {
        let doc = shifted(shift_annotations(SIDECAR, date(2020, 1, 1), 300).unwrap());

        assert_eq!(doc.updated_count, 3);
        assert_eq!(doc.first_timestamp.date(), date(2020, 1, 1));

        let expected = SIDECAR
            .replace("2020-01-01T13:40:00Z", "2020-10-27T13:40:00Z")
            .replace("2020-01-02T00:10:05.250Z", "2020-10-28T00:10:05.250Z")
            .replace("2020-01-31T23:59:59Z", "2020-11-26T23:59:59Z");
        assert_eq!(doc.text, expected, "only createTime date prefixes change");
    }

    #[test]
    fn test_shift_backwards_across_year() {
        let xml = r#"<annotations><annotation createTime="2021-01-03T08:00:00Z"/></annotations>"#;
        let doc = shifted(shift_annotations(xml, date(2021, 1, 3), -10).unwrap());
        assert!(doc.text.contains(r#"createTime="2020-12-24T08:00:00Z""#));
    }

    #[test]
    fn test_consistency_gate() {
        let err = shift_annotations(SIDECAR, date(2020, 1, 2), 300).expect_err("date mismatch");
        assert!(matches!(
            err,
            DeidError::Consistency { found, expected }
                if found == date(2020, 1, 1) && expected == date(2020, 1, 2)
        ));
        assert_eq!(err.status(), ShiftStatus::Skipped);
    }

    #[test]
    fn test_zero_offset_and_missing_timestamps() {
        assert_eq!(
            shift_annotations(SIDECAR, date(2020, 1, 1), 0).unwrap(),
            AnnotationShift::ZeroOffset
        );
        let bare = "<annotations><annotation id=\"1\"/></annotations>";
        assert_eq!(
            shift_annotations(bare, date(2020, 1, 1), 5).unwrap(),
            AnnotationShift::NoTimestamps
        );
    }

    #[test]
    fn test_unparseable_later_timestamp_fails_whole_file() {
        let xml = r#"<a><annotation createTime="2020-01-01T00:00:00Z"/><annotation createTime="yesterday"/></a>"#;
        assert!(matches!(
            shift_annotations(xml, date(2020, 1, 1), 3),
            Err(DeidError::Format(_))
        ));
    }

    #[test]
    fn test_malformed_xml_is_format_error() {
        let err = shift_annotations("<annotations><annotation>", date(2020, 1, 1), 3).unwrap_err();
        assert!(matches!(err, DeidError::Format(ref m) if m.contains("XML parsing error")));
    }

    #[test]
    fn test_doctype_sidecar_is_accepted() {
        let xml = "<?xml version=\"1.0\"?>\n<!DOCTYPE annotations>\n<annotations><annotation createTime=\"2020-01-01T00:00:00Z\" annotator=\"Dr X\"/></annotations>";

        let doc = shifted(shift_annotations(xml, date(2020, 1, 1), 3).unwrap());
        assert!(doc.text.starts_with("<?xml version=\"1.0\"?>\n<!DOCTYPE annotations>\n"));
        assert!(doc.text.contains(r#"createTime="2020-01-04T00:00:00Z""#));

        let stripped = strip_identifiers(xml).unwrap();
        assert_eq!(stripped.classification.annotator.as_deref(), Some("Dr X"));
        assert!(stripped.text.contains("<!DOCTYPE annotations>"));
    }

    #[test]
    fn test_prefixed_attribute_name_is_not_a_create_time() {
        let xml = r#"<annotations><annotation data-createTime="x" createTime="2020-01-01T00:00:00Z"/></annotations>"#;

        let doc = shifted(shift_annotations(xml, date(2020, 1, 1), 3).unwrap());
        assert_eq!(doc.updated_count, 1);
        assert_eq!(
            doc.text,
            r#"<annotations><annotation data-createTime="x" createTime="2020-01-04T00:00:00Z"/></annotations>"#
        );
    }

    #[test]
    fn test_create_time_outside_attribute_is_rejected() {
        let xml = r#"<a><annotation createTime="2020-01-01T00:00:00Z"/><!-- createTime="2019-01-01T00:00:00Z" --></a>"#;
        assert!(matches!(
            shift_annotations(xml, date(2020, 1, 1), 3),
            Err(DeidError::Format(_))
        ));
    }

    #[test]
    fn test_strip_identifiers() {
        let stripped = strip_identifiers(SIDECAR).unwrap();

        assert!(!stripped.text.contains("createTime"));
        assert!(!stripped.text.contains("annotator"));
        assert!(!stripped.text.contains("creatorId"));
        assert!(!stripped.text.contains("channel"));
        assert!(stripped.text.contains(r#"<annotation id="1" layer="sleep">"#));
        assert!(stripped.text.contains("<label>N2</label>"));
        assert!(stripped.text.contains("<!-- exported -->"));

        assert_eq!(
            stripped.classification,
            AnnotationClassification {
                annotator: Some("Dr X".into()),
                creator_id: Some("u-17".into()),
                multiple_layers: true,
            }
        );
    }

    #[test]
    fn test_strip_single_layer_without_annotator() {
        let xml = r#"<annotations><annotation layer="a"/><annotation layer="a" creatorId="c"/></annotations>"#;
        let stripped = strip_identifiers(xml).unwrap();
        assert_eq!(stripped.classification.annotator, None);
        assert_eq!(stripped.classification.creator_id.as_deref(), Some("c"));
        assert!(!stripped.classification.multiple_layers);
        assert_eq!(
            stripped.text,
            r#"<annotations><annotation layer="a"/><annotation layer="a"/></annotations>"#
        );
    }

    #[test]
    fn test_strip_requires_annotations() {
        let err = strip_identifiers("<annotations/>").unwrap_err();
        assert!(matches!(err, DeidError::Format(_)));
    }

    fn realized(id: &str, original: NaiveDate, new: NaiveDate) -> Arc<RealizedShifts> {
        Arc::new(
            [(
                SubjectId::new(id).unwrap(),
                RealizedShift {
                    original_date: original,
                    new_date: new,
                },
            )]
            .into_iter()
            .collect(),
        )
    }

    #[test]
    fn test_shifter_process_file() {
        let temp = TempDir::new().unwrap();
        let input = temp.path().join("PRV-001-AB12-45-annotations.xml");
        fs::write(&input, SIDECAR).unwrap();
        let output = OutputService::new(&temp.path().join("modified_xml")).unwrap();

        let svc = AnnotationShifter::new(
            &CoreConfig::default(),
            realized("AB12", date(2020, 1, 1), date(2020, 10, 27)),
        )
        .unwrap();
        let result = svc.process_file(&input, &output);

        assert_eq!(result.status, ShiftStatus::Success, "{:?}", result.error_message);
        assert_eq!(result.offset_days, Some(300));
        let written = fs::read_to_string(result.output_path.unwrap()).unwrap();
        assert!(written.contains("2020-10-27T13:40:00Z"));
        assert_eq!(fs::read_to_string(&input).unwrap(), SIDECAR, "source untouched");
    }

    #[test]
    fn test_shifter_skips() {
        let temp = TempDir::new().unwrap();
        let output = OutputService::new(&temp.path().join("out")).unwrap();
        let svc = AnnotationShifter::new(
            &CoreConfig::default(),
            realized("AB12", date(2020, 1, 1), date(2020, 1, 1)),
        )
        .unwrap();

        let unknown = temp.path().join("PRV-001-ZZ99-45-annotations.xml");
        fs::write(&unknown, SIDECAR).unwrap();
        let result = svc.process_file(&unknown, &output);
        assert_eq!(result.status, ShiftStatus::Skipped);
        assert!(result.error_message.unwrap().contains("not found"));

        let zero = temp.path().join("PRV-001-AB12-45-annotations.xml");
        fs::write(&zero, SIDECAR).unwrap();
        let result = svc.process_file(&zero, &output);
        assert_eq!(result.status, ShiftStatus::Skipped);
        assert_eq!(result.error_message.as_deref(), Some("No date offset needed"));

        let bare = temp.path().join("PRV-002-AB12-46-annotations.xml");
        fs::write(&bare, "<annotations><annotation/></annotations>").unwrap();
        let result = svc.process_file(&bare, &output);
        assert_eq!(result.error_message.as_deref(), Some("No createTime attributes found"));

        assert_eq!(fs::read_dir(output.output_directory()).unwrap().count(), 0);
    }

    #[test]
    fn test_stripper_requires_known_identifier() {
        let temp = TempDir::new().unwrap();
        let output = OutputService::new(&temp.path().join("out")).unwrap();

        let mut ledger = ResultLedger::new();
        let mut draft = ShiftDraft::new(Path::new("PRV-001-AB12-45.edf"));
        draft.identifier = Some(SubjectId::new("AB12").unwrap());
        ledger.record(draft.succeed(PathBuf::from("x.edf")));
        let svc = AnnotationStripper::new(&CoreConfig::default(), Arc::new(ledger)).unwrap();

        let known = temp.path().join("PRV-001-AB12-45-annotations.xml");
        fs::write(&known, SIDECAR).unwrap();
        let outcome = svc.process_file(&known, &output).unwrap();
        assert_eq!(outcome.identifier.as_str(), "AB12");
        assert!(outcome.classification.multiple_layers);
        assert!(!fs::read_to_string(&outcome.output_path).unwrap().contains("creatorId"));

        let unknown = temp.path().join("PRV-001-CD34-45-annotations.xml");
        fs::write(&unknown, SIDECAR).unwrap();
        let err = svc.process_file(&unknown, &output).unwrap_err();
        assert_eq!(err.status(), ShiftStatus::Skipped);
    }
}
