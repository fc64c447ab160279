//! Tolerant extraction from the provider's loosely typed payloads.
//!
//! The remote API returns arrays of JSON objects whose key casing and field
//! population drift between accounts and checklist templates. This module
//! pulls the few typed fields the pipeline relies on (report id, completion
//! instant, certificate, per-question answers) while preserving the raw
//! object for the ruleset-resolution heuristics downstream.
//!
//! Everything here is pure; truncation limits match the column widths in the
//! store schema.

use chrono::{DateTime, NaiveDate, Utc};
use serde_json::{Map, Value};
use sha1::{Digest, Sha1};
use thiserror::Error;

/// Key aliases checked, in order, for the report identifier.
const REPORT_ID_ALIASES: [&str; 7] = [
    "ID",
    "Id",
    "auditId",
    "audit_id",
    "id",
    "reportId",
    "report_id",
];

/// Key aliases checked, in order, for the certification number.
const CERT_ALIASES: [&str; 6] = [
    "CertificationNumber",
    "certification_number",
    "CertificateNumber",
    "Certificate_Number",
    "certificate_number",
    "cert_number",
];

/// Maximum persisted answer value length, in characters.
pub const MAX_ANSWER_LEN: usize = 4_000;

/// Maximum persisted section length, in characters.
pub const MAX_SECTION_LEN: usize = 200;

/// Maximum persisted question text length, in characters.
pub const MAX_QUESTION_TEXT_LEN: usize = 1_000;

/// Maximum persisted certificate length, in characters.
pub const MAX_CERT_LEN: usize = 100;

/// Maximum derived question key length, in characters.
pub const MAX_QUESTION_KEY_LEN: usize = 256;

/// A summary record with its typed extracts and the preserved raw object.
#[derive(Debug, Clone)]
pub struct SummaryItem {
    /// Report identifier.
    pub report_id: String,
    /// Completion instant, UTC.
    pub completed_at: DateTime<Utc>,
    /// Certification number, when the summary already carries one.
    pub certification_number: Option<String>,
    /// Optional metadata used by the ruleset resolver.
    pub metadata: ReportMetadata,
    /// The raw record, kept for downstream heuristics.
    pub raw: Map<String, Value>,
}

impl SummaryItem {
    /// Extracts a summary item from one record of the summary payload.
    ///
    /// Returns `None` when the record is not an object or lacks either a
    /// report id or a parseable completion instant; such records are
    /// dropped by ingest eligibility.
    #[must_use]
    pub fn try_extract(value: &Value) -> Option<Self> {
        let map = value.as_object()?;
        let report_id = extract_report_id(map)?;
        let completed_at = extract_completed_at(map)?;
        let certification_number = extract_certificate(map);
        let metadata = ReportMetadata::extract(map);

        Some(Self {
            report_id,
            completed_at,
            certification_number,
            metadata,
            raw: map.clone(),
        })
    }
}

/// Optional report metadata columns populated by ingest and consumed by the
/// ruleset resolver.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReportMetadata {
    /// Explicit rule set name, when the provider exposes one.
    pub rule_set_name: Option<String>,
    /// Technology type, e.g. `Solar PV`.
    pub technology_type: Option<String>,
    /// Assessment type.
    pub assessment_type: Option<String>,
    /// Checklist/template name.
    pub template_name: Option<String>,
}

impl ReportMetadata {
    /// Scans the record for metadata-bearing keys, case-insensitively.
    #[must_use]
    pub fn extract(map: &Map<String, Value>) -> Self {
        let mut meta = Self::default();
        for (key, value) in map {
            let Some(text) = value_as_string(value) else {
                continue;
            };
            let lowered = key.to_lowercase();
            if meta.rule_set_name.is_none() && lowered.contains("ruleset") {
                meta.rule_set_name = Some(text.clone());
            }
            if meta.technology_type.is_none() && lowered.contains("technology") {
                meta.technology_type = Some(text.clone());
            }
            if meta.assessment_type.is_none() && lowered.contains("assessment") {
                meta.assessment_type = Some(text.clone());
            }
            if meta.template_name.is_none()
                && (lowered.contains("template") || lowered.contains("checklist"))
            {
                meta.template_name = Some(text);
            }
        }
        meta
    }

    /// The populated metadata values, for heuristic scanning.
    #[must_use]
    pub fn values(&self) -> Vec<&str> {
        [
            self.rule_set_name.as_deref(),
            self.technology_type.as_deref(),
            self.assessment_type.as_deref(),
            self.template_name.as_deref(),
        ]
        .into_iter()
        .flatten()
        .collect()
    }
}

/// Scalar-to-string coercion used for identifiers and metadata.
///
/// Objects, arrays and nulls yield `None`; blank strings yield `None`.
fn value_as_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => {
            let trimmed = s.trim();
            if trimmed.is_empty() {
                None
            } else {
                Some(trimmed.to_string())
            }
        },
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Null | Value::Array(_) | Value::Object(_) => None,
    }
}

/// Finds the report id under any of its known aliases.
#[must_use]
pub fn extract_report_id(map: &Map<String, Value>) -> Option<String> {
    REPORT_ID_ALIASES
        .iter()
        .find_map(|alias| map.get(*alias).and_then(value_as_string))
}

/// Finds the certification number under any of its known aliases.
#[must_use]
pub fn extract_certificate(map: &Map<String, Value>) -> Option<String> {
    CERT_ALIASES
        .iter()
        .find_map(|alias| map.get(*alias).and_then(value_as_string))
        .map(|cert| truncate_chars(&cert, MAX_CERT_LEN))
}

/// Extracts the completion instant: `Updated_On` first, then `EndTime`,
/// then `Date`.
#[must_use]
pub fn extract_completed_at(map: &Map<String, Value>) -> Option<DateTime<Utc>> {
    ["Updated_On", "EndTime", "Date"]
        .iter()
        .find_map(|alias| {
            map.get(*alias)
                .and_then(Value::as_str)
                .and_then(parse_provider_timestamp)
        })
}

/// Parses the provider's `YYYY-MM-DD HH:MM:SS` timestamps as UTC.
///
/// The provider omits both the `T` separator and any zone designator; the
/// value is rebuilt as RFC 3339 before parsing. Values that already parse
/// as RFC 3339, and date-only values (taken as midnight UTC), are accepted
/// too.
#[must_use]
pub fn parse_provider_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }

    if let Ok(parsed) = DateTime::parse_from_rfc3339(trimmed) {
        return Some(parsed.with_timezone(&Utc));
    }

    if let Some((date, time)) = trimmed.split_once(' ') {
        let rebuilt = format!("{date}T{time}Z");
        if let Ok(parsed) = DateTime::parse_from_rfc3339(&rebuilt) {
            return Some(parsed.with_timezone(&Utc));
        }
    }

    NaiveDate::parse_from_str(trimmed, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt| dt.and_utc())
}

/// One extracted per-question answer from a detail payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractedAnswer {
    /// Stable question key (provider id or derived slug).
    pub question_key: String,
    /// Answer value in string form; `None` when the provider sent null.
    pub answer_value: Option<String>,
    /// Section, optionally suffixed with the group name.
    pub section: Option<String>,
    /// Trimmed question text.
    pub question_text: Option<String>,
}

/// The typed result of walking a details payload.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DetailExtract {
    /// Certificate number found in the detail rows, if any.
    pub certificate: Option<String>,
    /// Answers in payload order, de-duplicated by question key.
    pub answers: Vec<ExtractedAnswer>,
}

/// The details payload had no usable `Detail` rows.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("details payload contained no Detail rows")]
pub struct NoDetailRows;

/// Walks a details payload: certificate extraction plus per-row answer
/// extraction with first-occurrence de-duplication.
///
/// # Errors
///
/// Returns [`NoDetailRows`] when no row is tagged `RecordType = "Detail"`;
/// the caller treats that as a non-retryable per-item failure.
pub fn extract_details(rows: &[Value]) -> Result<DetailExtract, NoDetailRows> {
    let detail_rows: Vec<&Map<String, Value>> = rows
        .iter()
        .filter_map(Value::as_object)
        .filter(|row| {
            row.get("RecordType")
                .and_then(Value::as_str)
                .is_some_and(|kind| kind == "Detail")
        })
        .collect();

    if detail_rows.is_empty() {
        return Err(NoDetailRows);
    }

    let mut extract = DetailExtract::default();
    let mut seen_keys = std::collections::BTreeSet::new();

    for row in detail_rows {
        let question_id = row.get("QUESTION_ID").and_then(value_as_string);
        let question_text = row
            .get("Question")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|q| !q.is_empty());

        if extract.certificate.is_none() && is_certificate_row(question_id.as_deref(), question_text)
        {
            extract.certificate = row
                .get("Answer")
                .and_then(value_as_string)
                .map(|cert| truncate_chars(&cert, MAX_CERT_LEN));
        }

        let Some(question_key) = derive_question_key(question_id.as_deref(), question_text) else {
            continue;
        };
        if !seen_keys.insert(question_key.clone()) {
            continue;
        }

        extract.answers.push(ExtractedAnswer {
            question_key,
            answer_value: coerce_answer_value(row.get("Answer")),
            section: build_section(
                row.get("Section").and_then(Value::as_str),
                row.get("GroupName").and_then(Value::as_str),
            ),
            question_text: question_text.map(|q| truncate_chars(q, MAX_QUESTION_TEXT_LEN)),
        });
    }

    Ok(extract)
}

/// A detail row carries the certificate when its question id is `"1"` or its
/// question text mentions "certificate number".
fn is_certificate_row(question_id: Option<&str>, question_text: Option<&str>) -> bool {
    if question_id == Some("1") {
        return true;
    }
    question_text.is_some_and(|q| q.to_lowercase().contains("certificate number"))
}

/// Derives the stable question key for a detail row.
///
/// A non-empty `QUESTION_ID` wins as-is (trimmed). Otherwise the question
/// text is slugged; overlong slugs are truncated and suffixed with a SHA-1
/// fragment so the result stays unique, stable, and within
/// [`MAX_QUESTION_KEY_LEN`]. The derivation is idempotent over its own
/// output.
#[must_use]
pub fn derive_question_key(
    question_id: Option<&str>,
    question_text: Option<&str>,
) -> Option<String> {
    if let Some(id) = question_id {
        let trimmed = id.trim();
        if !trimmed.is_empty() {
            return Some(trimmed.to_string());
        }
    }

    let slug = slug_question_text(question_text?);
    if slug.is_empty() {
        return None;
    }
    if slug.len() <= MAX_QUESTION_KEY_LEN {
        return Some(slug);
    }

    let digest = Sha1::digest(slug.as_bytes());
    let suffix = hex::encode(digest);
    // 40 hex chars plus the separating underscore. The kept prefix must not
    // end in an underscore or re-derivation would collapse the separator.
    let keep = MAX_QUESTION_KEY_LEN - suffix.len() - 1;
    let prefix = slug[..keep].trim_end_matches('_');
    Some(format!("{prefix}_{suffix}"))
}

/// Lowercase, collapse whitespace, then replace non-alphanumeric runs with
/// single underscores and trim them from the ends.
fn slug_question_text(text: &str) -> String {
    let lowered = text.to_lowercase();
    let collapsed = lowered.split_whitespace().collect::<Vec<_>>().join(" ");

    let mut slug = String::with_capacity(collapsed.len());
    let mut in_run = false;
    for ch in collapsed.chars() {
        if ch.is_ascii_lowercase() || ch.is_ascii_digit() {
            slug.push(ch);
            in_run = false;
        } else if !in_run {
            slug.push('_');
            in_run = true;
        }
    }

    slug.trim_matches('_').to_string()
}

/// Coerces a raw answer into its persisted string form.
///
/// Null and absent stay `None`; scalars stringify; structured values are
/// JSON-serialised. The result is truncated to [`MAX_ANSWER_LEN`].
#[must_use]
pub fn coerce_answer_value(value: Option<&Value>) -> Option<String> {
    let rendered = match value? {
        Value::Null => return None,
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        structured @ (Value::Array(_) | Value::Object(_)) => {
            serde_json::to_string(structured).unwrap_or_default()
        },
    };
    Some(truncate_chars(&rendered, MAX_ANSWER_LEN))
}

/// Builds the persisted section: trimmed `Section`, with ` | GroupName`
/// appended when the group is present, non-empty and not literally `N/A`.
#[must_use]
pub fn build_section(section: Option<&str>, group_name: Option<&str>) -> Option<String> {
    let section = section.map(str::trim).filter(|s| !s.is_empty());
    let group = group_name
        .map(str::trim)
        .filter(|g| !g.is_empty() && *g != "N/A");

    let combined = match (section, group) {
        (Some(s), Some(g)) => format!("{s} | {g}"),
        (Some(s), None) => s.to_string(),
        (None, Some(g)) => g.to_string(),
        (None, None) => return None,
    };
    Some(truncate_chars(&combined, MAX_SECTION_LEN))
}

/// Truncates to at most `max` characters on a char boundary.
#[must_use]
pub fn truncate_chars(s: &str, max: usize) -> String {
    match s.char_indices().nth(max) {
        Some((idx, _)) => s[..idx].to_string(),
        None => s.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use serde_json::json;

    use super::*;

    fn obj(value: Value) -> Map<String, Value> {
        value.as_object().expect("expected object").clone()
    }

    #[test]
    fn test_report_id_alias_precedence() {
        let map = obj(json!({"id": "low", "ID": "high"}));
        assert_eq!(extract_report_id(&map), Some("high".to_string()));

        let map = obj(json!({"audit_id": 42}));
        assert_eq!(extract_report_id(&map), Some("42".to_string()));

        let map = obj(json!({"name": "no id here"}));
        assert_eq!(extract_report_id(&map), None);
    }

    #[test]
    fn test_provider_timestamp_parsing() {
        let expected = Utc.with_ymd_and_hms(2024, 8, 1, 10, 0, 0).unwrap();
        assert_eq!(
            parse_provider_timestamp("2024-08-01 10:00:00"),
            Some(expected)
        );
        assert_eq!(
            parse_provider_timestamp("2024-08-01T10:00:00Z"),
            Some(expected)
        );
        assert_eq!(
            parse_provider_timestamp("2024-08-01"),
            Utc.with_ymd_and_hms(2024, 8, 1, 0, 0, 0).single()
        );
        assert_eq!(parse_provider_timestamp("not a date"), None);
        assert_eq!(parse_provider_timestamp(""), None);
    }

    #[test]
    fn test_completed_at_prefers_updated_on() {
        let map = obj(json!({
            "Updated_On": "2024-08-01 10:00:00",
            "EndTime": "2024-08-02 11:00:00",
        }));
        assert_eq!(
            extract_completed_at(&map),
            Utc.with_ymd_and_hms(2024, 8, 1, 10, 0, 0).single()
        );

        let map = obj(json!({"EndTime": "2024-08-02 11:00:00"}));
        assert_eq!(
            extract_completed_at(&map),
            Utc.with_ymd_and_hms(2024, 8, 2, 11, 0, 0).single()
        );
    }

    #[test]
    fn test_summary_item_requires_id_and_instant() {
        assert!(SummaryItem::try_extract(&json!({"ID": "R1"})).is_none());
        assert!(
            SummaryItem::try_extract(&json!({"Updated_On": "2024-08-01 10:00:00"})).is_none()
        );
        assert!(SummaryItem::try_extract(&json!("not an object")).is_none());

        let item = SummaryItem::try_extract(&json!({
            "ID": "R1",
            "Updated_On": "2024-08-01 10:00:00",
            "TechnologyType": "Solar PV",
        }))
        .expect("item should extract");
        assert_eq!(item.report_id, "R1");
        assert_eq!(item.metadata.technology_type.as_deref(), Some("Solar PV"));
    }

    #[test]
    fn test_question_key_prefers_question_id() {
        assert_eq!(
            derive_question_key(Some(" 7 "), Some("Install type")),
            Some("7".to_string())
        );
        assert_eq!(
            derive_question_key(Some("  "), Some("Install type")),
            Some("install_type".to_string())
        );
        assert_eq!(derive_question_key(None, None), None);
    }

    #[test]
    fn test_question_key_slugging() {
        assert_eq!(
            derive_question_key(None, Some("  Is the   array (DC) safe?  ")),
            Some("is_the_array_dc_safe".to_string())
        );
        assert_eq!(
            derive_question_key(None, Some("???")),
            None,
            "punctuation-only text has no key"
        );
    }

    #[test]
    fn test_question_key_length_and_idempotence() {
        let long_text = "word ".repeat(120);
        let key = derive_question_key(None, Some(&long_text)).expect("key derives");
        assert!(key.len() <= MAX_QUESTION_KEY_LEN);
        assert!(key.contains('_'));

        // Law: derivation applied to its own output is a fixed point.
        let again = derive_question_key(None, Some(&key)).expect("rederives");
        assert_eq!(again, key);

        let short = derive_question_key(None, Some("Install type")).expect("key derives");
        let short_again = derive_question_key(None, Some(&short)).expect("rederives");
        assert_eq!(short_again, short);
    }

    #[test]
    fn test_answer_coercion() {
        assert_eq!(coerce_answer_value(None), None);
        assert_eq!(coerce_answer_value(Some(&Value::Null)), None);
        assert_eq!(
            coerce_answer_value(Some(&json!("Bolt-on"))),
            Some("Bolt-on".to_string())
        );
        assert_eq!(coerce_answer_value(Some(&json!(4))), Some("4".to_string()));
        assert_eq!(
            coerce_answer_value(Some(&json!(true))),
            Some("true".to_string())
        );
        assert_eq!(
            coerce_answer_value(Some(&json!({"a": 1}))),
            Some("{\"a\":1}".to_string())
        );

        let long = "x".repeat(5_000);
        let coerced = coerce_answer_value(Some(&json!(long))).expect("coerces");
        assert_eq!(coerced.len(), MAX_ANSWER_LEN);
    }

    #[test]
    fn test_section_building() {
        assert_eq!(
            build_section(Some(" Roof "), Some("Array 1")),
            Some("Roof | Array 1".to_string())
        );
        assert_eq!(build_section(Some("Roof"), Some("N/A")), Some("Roof".to_string()));
        assert_eq!(build_section(Some("Roof"), Some("  ")), Some("Roof".to_string()));
        assert_eq!(build_section(None, None), None);
    }

    #[test]
    fn test_extract_details_certificate_and_dedupe() {
        let rows = vec![
            json!({"RecordType": "Header", "Title": "ignored"}),
            json!({
                "RecordType": "Detail",
                "QUESTION_ID": "1",
                "Question": "MCS Certificate Number",
                "Answer": "  MCS-123  ",
            }),
            json!({
                "RecordType": "Detail",
                "QUESTION_ID": "7",
                "Question": "Install type",
                "Answer": "Bolt-on",
                "Section": "Roof",
            }),
            json!({
                "RecordType": "Detail",
                "QUESTION_ID": "7",
                "Question": "Install type (duplicate)",
                "Answer": "On-roof",
            }),
        ];

        let extract = extract_details(&rows).expect("details extract");
        assert_eq!(extract.certificate.as_deref(), Some("MCS-123"));
        assert_eq!(extract.answers.len(), 2);
        assert_eq!(extract.answers[0].question_key, "1");
        assert_eq!(extract.answers[1].question_key, "7");
        assert_eq!(extract.answers[1].answer_value.as_deref(), Some("Bolt-on"));
        assert_eq!(extract.answers[1].section.as_deref(), Some("Roof"));
    }

    #[test]
    fn test_extract_details_certificate_by_question_text() {
        let rows = vec![json!({
            "RecordType": "Detail",
            "QUESTION_ID": "14",
            "Question": "Certificate Number (MCS)",
            "Answer": "MCS-999",
        })];
        let extract = extract_details(&rows).expect("details extract");
        assert_eq!(extract.certificate.as_deref(), Some("MCS-999"));
    }

    #[test]
    fn test_extract_details_requires_detail_rows() {
        let rows = vec![json!({"RecordType": "Header"})];
        assert_eq!(extract_details(&rows), Err(NoDetailRows));
        assert_eq!(extract_details(&[]), Err(NoDetailRows));
    }
}
