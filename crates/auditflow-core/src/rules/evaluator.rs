//! Pure rule evaluation.
//!
//! Evaluation takes a validated [`RuleDocument`] and a persisted answer map
//! and produces findings, counts, the outcome, and the derived score value.
//! It performs no I/O and holds no state; given equal inputs the result is
//! identical, which is what makes rerun idempotency checkable.

use std::collections::BTreeMap;

use serde_json::Value;
use thiserror::Error;

use crate::model::Severity;

use super::document::{AnswerNormalization, Condition, RuleDocument};

/// Outcome label used when no outcome rule matches.
pub const OUTCOME_UNKNOWN: &str = "Unknown";

/// Errors raised during evaluation.
///
/// Documents are validated at load, so in practice this only fires for
/// documents constructed in code that bypassed validation.
#[derive(Debug, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum EvaluationError {
    /// A rule uses an operator the evaluator does not implement.
    #[error("bad rule {rule_id}: unknown operator `{op}`")]
    UnknownOperator {
        /// Offending rule id.
        rule_id: String,
        /// The unrecognised operator.
        op: String,
    },
}

/// One finding produced by a non-compliant rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvaluatedFinding {
    /// Rule that produced the finding.
    pub rule_id: String,
    /// Question key the rule inspected.
    pub question_key: String,
    /// The answer value as evaluated (pre-normalisation).
    pub answer_value: Option<String>,
    /// Severity of the finding.
    pub severity: Severity,
    /// Optional short code from the rule.
    pub finding_code: Option<String>,
    /// Populated only for Major findings.
    pub major_non_compliant_text: Option<String>,
    /// Populated only for Minor findings.
    pub minor_non_compliant_text: Option<String>,
}

/// The complete result of evaluating one report against one rule set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Evaluation {
    /// Findings in rule declaration order.
    pub findings: Vec<EvaluatedFinding>,
    /// Count of Major findings.
    pub major_count: u32,
    /// Count of Minor findings.
    pub minor_count: u32,
    /// Outcome label from the first matching outcome rule, or
    /// [`OUTCOME_UNKNOWN`].
    pub outcome: String,
    /// Derived score value, if the derivation yields one.
    pub score_value: Option<String>,
}

/// Effective normalisation for one rule: the document defaults with the
/// rule's overrides applied.
#[derive(Debug, Clone, Copy)]
struct EffectiveNormalization {
    trim: bool,
    case_insensitive: bool,
    empty_is_null: bool,
}

impl EffectiveNormalization {
    fn for_rule(defaults: AnswerNormalization, condition: &Condition) -> Self {
        Self {
            trim: condition.trim.unwrap_or(defaults.trim),
            case_insensitive: condition.case_insensitive.unwrap_or(defaults.case_insensitive),
            empty_is_null: defaults.empty_is_null,
        }
    }
}

/// Normalises an answer (or operand) under the effective options.
///
/// Order is fixed: null check, string form, trim, empty-to-null, lowercase.
fn normalize(raw: Option<&str>, opts: EffectiveNormalization) -> Option<String> {
    let mut value = raw?.to_string();
    if opts.trim {
        value = value.trim().to_string();
    }
    if opts.empty_is_null && value.is_empty() {
        return None;
    }
    if opts.case_insensitive {
        value = value.to_lowercase();
    }
    Some(value)
}

/// String form of a rule operand, mirroring how answers were coerced at
/// enrichment time.
fn operand_as_string(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        structured @ (Value::Array(_) | Value::Object(_)) => {
            serde_json::to_string(structured).ok()
        },
    }
}

/// Applies one rule's predicate to the normalised answer.
fn is_non_compliant(
    rule_id: &str,
    condition: &Condition,
    answer_norm: Option<&str>,
    opts: EffectiveNormalization,
) -> Result<bool, EvaluationError> {
    match condition.op.as_str() {
        "missing" => Ok(answer_norm.is_none_or(str::is_empty)),
        "equals" => {
            let operand = condition
                .value
                .as_ref()
                .and_then(operand_as_string)
                .and_then(|v| normalize(Some(&v), opts));
            Ok(match (answer_norm, operand) {
                (Some(answer), Some(operand)) => answer == operand,
                _ => false,
            })
        },
        "in" => {
            let Some(answer) = answer_norm else {
                return Ok(false);
            };
            let members = condition.values.as_deref().unwrap_or_default();
            Ok(members
                .iter()
                .filter_map(operand_as_string)
                .filter_map(|v| normalize(Some(&v), opts))
                .any(|member| member == answer))
        },
        other => Err(EvaluationError::UnknownOperator {
            rule_id: rule_id.to_string(),
            op: other.to_string(),
        }),
    }
}

/// Evaluates a rule document against an answer map.
///
/// Rules run in declaration order; disabled rules are skipped; each rule
/// yields at most one finding. The outcome is decided positionally and the
/// score value derived per the document's `scoring.scoreValue`.
///
/// # Errors
///
/// Returns [`EvaluationError::UnknownOperator`] for operators that escaped
/// load-time validation.
pub fn evaluate(
    doc: &RuleDocument,
    answers: &BTreeMap<String, Option<String>>,
) -> Result<Evaluation, EvaluationError> {
    let mut findings = Vec::new();
    let mut major_count = 0u32;
    let mut minor_count = 0u32;

    for rule in &doc.rules {
        if !rule.enabled {
            continue;
        }

        let raw_answer = answers.get(&rule.question_key).and_then(Option::as_deref);
        let opts = EffectiveNormalization::for_rule(doc.answer_normalization, &rule.non_compliant_when);
        let answer_norm = normalize(raw_answer, opts);

        if !is_non_compliant(&rule.rule_id, &rule.non_compliant_when, answer_norm.as_deref(), opts)? {
            continue;
        }

        let (major_text, minor_text) = match rule.finding.severity {
            Severity::Major => {
                major_count += 1;
                (rule.finding.major_non_compliant_text.clone(), None)
            },
            Severity::Minor => {
                minor_count += 1;
                (None, rule.finding.minor_non_compliant_text.clone())
            },
        };

        findings.push(EvaluatedFinding {
            rule_id: rule.rule_id.clone(),
            question_key: rule.question_key.clone(),
            answer_value: raw_answer.map(str::to_string),
            severity: rule.finding.severity,
            finding_code: rule.finding.code.clone(),
            major_non_compliant_text: major_text,
            minor_non_compliant_text: minor_text,
        });
    }

    let outcome = doc
        .scoring
        .outcome_rules
        .iter()
        .find(|rule| rule.when.matches(major_count, minor_count))
        .map_or_else(|| OUTCOME_UNKNOWN.to_string(), |rule| rule.outcome.clone());

    let score_value = derive_score_value(doc, &outcome);

    Ok(Evaluation {
        findings,
        major_count,
        minor_count,
        outcome,
        score_value,
    })
}

/// Derives the persisted score value from the outcome and the document's
/// `scoring.scoreValue` spec.
fn derive_score_value(doc: &RuleDocument, outcome: &str) -> Option<String> {
    let spec = &doc.scoring.score_value;
    match spec.from.as_str() {
        "fixed" => spec.fixed_value.as_ref().and_then(operand_as_string),
        "outcome" => match spec.value_type.as_deref() {
            // A numeric score value stringifies the outcome label too; the
            // document author is responsible for numeric outcomes.
            Some("text") | Some("numeric") => Some(outcome.to_string()),
            _ => None,
        },
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn doc(rules: Value, scoring: Value) -> RuleDocument {
        serde_json::from_value(json!({
            "ruleSetName": "PV",
            "ruleSetVersion": "v2",
            "rules": rules,
            "scoring": scoring,
        }))
        .expect("document parses")
    }

    fn answers(pairs: &[(&str, Option<&str>)]) -> BTreeMap<String, Option<String>> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), v.map(str::to_string)))
            .collect()
    }

    fn default_scoring() -> Value {
        json!({
            "outcomeRules": [
                {"when": {"majorCountGte": 1}, "outcome": "Fail"},
                {"when": {"always": true}, "outcome": "Pass"}
            ],
            "scoreValue": {"from": "outcome", "type": "text"}
        })
    }

    #[test]
    fn test_equals_case_insensitive_major() {
        let doc = doc(
            json!([{
                "ruleId": "PV-7-BO",
                "questionKey": "7",
                "nonCompliantWhen": {"op": "equals", "value": "Bolt-on", "caseInsensitive": true},
                "finding": {
                    "severity": "Major",
                    "code": "PV-7-BO",
                    "message": "Bolt-on not permitted",
                    "majorNonCompliantText": "Installation must not be bolt-on."
                }
            }]),
            default_scoring(),
        );

        let result = evaluate(&doc, &answers(&[("7", Some("BOLT-ON"))])).expect("evaluates");
        assert_eq!(result.major_count, 1);
        assert_eq!(result.minor_count, 0);
        assert_eq!(result.outcome, "Fail");
        assert_eq!(result.score_value.as_deref(), Some("Fail"));

        let finding = &result.findings[0];
        assert_eq!(finding.severity, Severity::Major);
        assert_eq!(
            finding.major_non_compliant_text.as_deref(),
            Some("Installation must not be bolt-on.")
        );
        assert_eq!(finding.minor_non_compliant_text, None);
        assert_eq!(finding.answer_value.as_deref(), Some("BOLT-ON"));
    }

    #[test]
    fn test_equals_ignores_null_answers() {
        let doc = doc(
            json!([{
                "ruleId": "PV-7-BO",
                "questionKey": "7",
                "nonCompliantWhen": {"op": "equals", "value": "Bolt-on"},
                "finding": {"severity": "Major", "message": "m"}
            }]),
            default_scoring(),
        );

        let result = evaluate(&doc, &answers(&[("7", None)])).expect("evaluates");
        assert!(result.findings.is_empty());
        assert_eq!(result.outcome, "Pass");

        let result = evaluate(&doc, &answers(&[])).expect("evaluates");
        assert!(result.findings.is_empty());
    }

    #[test]
    fn test_missing_operator() {
        let doc = doc(
            json!([{
                "ruleId": "PV-9",
                "questionKey": "9",
                "nonCompliantWhen": {"op": "missing"},
                "finding": {"severity": "Minor", "message": "m", "minorNonCompliantText": "t"}
            }]),
            default_scoring(),
        );

        let result = evaluate(&doc, &answers(&[])).expect("evaluates");
        assert_eq!(result.minor_count, 1);
        assert_eq!(
            result.findings[0].minor_non_compliant_text.as_deref(),
            Some("t")
        );
        assert_eq!(result.findings[0].major_non_compliant_text, None);

        let result = evaluate(&doc, &answers(&[("9", Some("  "))])).expect("evaluates");
        assert_eq!(result.minor_count, 1, "whitespace trims to empty, so missing");

        let result = evaluate(&doc, &answers(&[("9", Some("present"))])).expect("evaluates");
        assert_eq!(result.minor_count, 0);
    }

    #[test]
    fn test_in_operator_normalises_members() {
        let doc = doc(
            json!([{
                "ruleId": "PV-3",
                "questionKey": "3",
                "nonCompliantWhen": {"op": "in", "values": [" No ", "Not present", 0]},
                "finding": {"severity": "Major", "message": "m"}
            }]),
            default_scoring(),
        );

        let result = evaluate(&doc, &answers(&[("3", Some("no"))])).expect("evaluates");
        assert_eq!(result.major_count, 1);

        let result = evaluate(&doc, &answers(&[("3", Some("0"))])).expect("evaluates");
        assert_eq!(result.major_count, 1, "numeric members coerce to strings");

        let result = evaluate(&doc, &answers(&[("3", Some("Yes"))])).expect("evaluates");
        assert_eq!(result.major_count, 0);
    }

    #[test]
    fn test_disabled_rules_skipped() {
        let doc = doc(
            json!([{
                "ruleId": "PV-7",
                "questionKey": "7",
                "enabled": false,
                "nonCompliantWhen": {"op": "missing"},
                "finding": {"severity": "Major", "message": "m"}
            }]),
            default_scoring(),
        );

        let result = evaluate(&doc, &answers(&[])).expect("evaluates");
        assert!(result.findings.is_empty());
        assert_eq!(result.outcome, "Pass");
    }

    #[test]
    fn test_outcome_positional_precedence_and_default() {
        let doc = doc(
            json!([{
                "ruleId": "r",
                "questionKey": "q",
                "nonCompliantWhen": {"op": "missing"},
                "finding": {"severity": "Minor", "message": "m"}
            }]),
            json!({
                "outcomeRules": [
                    {"when": {"minorCountGte": 1}, "outcome": "PassWithObservations"},
                    {"when": {"majorCountGte": 1}, "outcome": "Fail"}
                ],
                "scoreValue": {"from": "outcome", "type": "text"}
            }),
        );

        let result = evaluate(&doc, &answers(&[])).expect("evaluates");
        assert_eq!(result.outcome, "PassWithObservations");

        // Nothing matches: no findings at all.
        let result = evaluate(&doc, &answers(&[("q", Some("x"))])).expect("evaluates");
        assert_eq!(result.outcome, OUTCOME_UNKNOWN);
    }

    #[test]
    fn test_score_value_derivations() {
        let fixed = doc(
            json!([]),
            json!({
                "outcomeRules": [{"when": {"always": true}, "outcome": "Pass"}],
                "scoreValue": {"from": "fixed", "type": "numeric", "fixedValue": 100}
            }),
        );
        let result = evaluate(&fixed, &answers(&[])).expect("evaluates");
        assert_eq!(result.score_value.as_deref(), Some("100"));

        let fixed_absent = doc(
            json!([]),
            json!({
                "outcomeRules": [{"when": {"always": true}, "outcome": "Pass"}],
                "scoreValue": {"from": "fixed", "type": "numeric"}
            }),
        );
        let result = evaluate(&fixed_absent, &answers(&[])).expect("evaluates");
        assert_eq!(result.score_value, None);

        let numeric_outcome = doc(
            json!([]),
            json!({
                "outcomeRules": [{"when": {"always": true}, "outcome": "85"}],
                "scoreValue": {"from": "outcome", "type": "numeric"}
            }),
        );
        let result = evaluate(&numeric_outcome, &answers(&[])).expect("evaluates");
        assert_eq!(result.score_value.as_deref(), Some("85"));

        let unrecognised = doc(
            json!([]),
            json!({
                "outcomeRules": [{"when": {"always": true}, "outcome": "Pass"}],
                "scoreValue": {"from": "somewhere-else"}
            }),
        );
        let result = evaluate(&unrecognised, &answers(&[])).expect("evaluates");
        assert_eq!(result.score_value, None);
    }

    #[test]
    fn test_unknown_operator_errors() {
        let doc = doc(
            json!([{
                "ruleId": "r1",
                "questionKey": "q",
                "nonCompliantWhen": {"op": "matchesRegex", "value": ".*"},
                "finding": {"severity": "Major", "message": "m"}
            }]),
            default_scoring(),
        );

        assert_eq!(
            evaluate(&doc, &answers(&[("q", Some("x"))])),
            Err(EvaluationError::UnknownOperator {
                rule_id: "r1".to_string(),
                op: "matchesRegex".to_string(),
            })
        );
    }

    #[test]
    fn test_findings_count_law() {
        // Round-trip law: counts equal findings by severity.
        let doc = doc(
            json!([
                {
                    "ruleId": "a",
                    "questionKey": "1",
                    "nonCompliantWhen": {"op": "missing"},
                    "finding": {"severity": "Major", "message": "m"}
                },
                {
                    "ruleId": "b",
                    "questionKey": "2",
                    "nonCompliantWhen": {"op": "missing"},
                    "finding": {"severity": "Minor", "message": "m"}
                },
                {
                    "ruleId": "c",
                    "questionKey": "3",
                    "nonCompliantWhen": {"op": "missing"},
                    "finding": {"severity": "Major", "message": "m"}
                }
            ]),
            default_scoring(),
        );

        let result = evaluate(&doc, &answers(&[])).expect("evaluates");
        let majors = result
            .findings
            .iter()
            .filter(|f| f.severity == Severity::Major)
            .count();
        let minors = result
            .findings
            .iter()
            .filter(|f| f.severity == Severity::Minor)
            .count();
        assert_eq!(result.major_count as usize, majors);
        assert_eq!(result.minor_count as usize, minors);
        assert_eq!(result.outcome, "Fail");
    }
}
