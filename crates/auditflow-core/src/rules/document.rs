//! Rule document model and load-time validation.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::model::Severity;

/// Errors raised while validating a parsed rule document.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum RuleDocumentError {
    /// The document's name does not match the requested rule set.
    #[error("rule set name mismatch: document says {found}, expected {expected}")]
    NameMismatch {
        /// Name in the document.
        found: String,
        /// Name the caller asked for.
        expected: String,
    },

    /// The document's version does not match the requested rule set.
    #[error("rule set version mismatch: document says {found}, expected {expected}")]
    VersionMismatch {
        /// Version in the document.
        found: String,
        /// Version the caller asked for.
        expected: String,
    },

    /// `scoring.outcomeRules` must contain at least one rule.
    #[error("rule set {name}.{version} has no outcome rules")]
    NoOutcomeRules {
        /// Rule set name.
        name: String,
        /// Rule set version.
        version: String,
    },

    /// A rule uses an operator the evaluator does not implement, or is
    /// missing the operand that operator requires.
    #[error("bad rule {rule_id}: {reason}")]
    BadRule {
        /// Offending rule id.
        rule_id: String,
        /// What is wrong with it.
        reason: String,
    },
}

/// Default normalisation applied to answers before rule predicates run.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct AnswerNormalization {
    /// Trim outer whitespace.
    pub trim: bool,
    /// Lowercase before comparison.
    pub case_insensitive: bool,
    /// Treat the empty string as null.
    pub empty_is_null: bool,
}

impl Default for AnswerNormalization {
    fn default() -> Self {
        Self {
            trim: true,
            case_insensitive: true,
            empty_is_null: true,
        }
    }
}

/// Predicate attached to a rule; true means non-compliant.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Operator: `missing`, `equals` or `in`.
    pub op: String,

    /// Operand for `equals`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,

    /// Operands for `in`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub values: Option<Vec<Value>>,

    /// Per-rule override of the document's trim default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trim: Option<bool>,

    /// Per-rule override of the document's case-insensitivity default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub case_insensitive: Option<bool>,
}

/// Finding emitted when a rule's predicate holds.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct FindingSpec {
    /// Severity of the finding.
    pub severity: Severity,

    /// Optional short code, e.g. `PV-7-BO`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,

    /// Human-readable message.
    pub message: String,

    /// Text persisted when the severity is Major.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub major_non_compliant_text: Option<String>,

    /// Text persisted when the severity is Minor.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub minor_non_compliant_text: Option<String>,
}

/// One rule of a rule set.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Rule {
    /// Stable rule identifier within the document.
    pub rule_id: String,

    /// The answer key this rule inspects.
    pub question_key: String,

    /// Disabled rules are skipped entirely.
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Extra keys counted toward eligibility overlap only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub question_keys_any: Option<Vec<String>>,

    /// Non-compliance predicate.
    pub non_compliant_when: Condition,

    /// Finding emitted on non-compliance.
    pub finding: FindingSpec,
}

const fn default_enabled() -> bool {
    true
}

/// One positional outcome rule; the first match wins.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OutcomeRule {
    /// Match condition.
    pub when: OutcomeWhen,
    /// Outcome label when matched.
    pub outcome: String,
}

/// Recognised outcome-rule condition shapes.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OutcomeWhen {
    /// Unconditional match.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub always: Option<bool>,

    /// Matches when the major count is at least this.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub major_count_gte: Option<u32>,

    /// Matches when the minor count is at least this.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub minor_count_gte: Option<u32>,
}

impl OutcomeWhen {
    /// Evaluates the condition against the finding counts.
    #[must_use]
    pub fn matches(&self, major_count: u32, minor_count: u32) -> bool {
        if self.always == Some(true) {
            return true;
        }
        if let Some(threshold) = self.major_count_gte {
            if major_count >= threshold {
                return true;
            }
        }
        if let Some(threshold) = self.minor_count_gte {
            if minor_count >= threshold {
                return true;
            }
        }
        false
    }
}

/// How the persisted score value is derived.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ScoreValueSpec {
    /// `text` or `numeric`.
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub value_type: Option<String>,

    /// `fixed` or `outcome`.
    pub from: String,

    /// Literal value when `from = "fixed"`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fixed_value: Option<Value>,
}

/// Outcome rules plus score-value derivation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Scoring {
    /// Positional outcome rules.
    pub outcome_rules: Vec<OutcomeRule>,
    /// Score value derivation.
    pub score_value: ScoreValueSpec,
}

/// A parsed, immutable rule document.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RuleDocument {
    /// Rule set name, e.g. `PV`.
    pub rule_set_name: String,

    /// Rule set version, e.g. `v2`.
    pub rule_set_version: String,

    /// Default normalisation for answers and operands.
    #[serde(default)]
    pub answer_normalization: AnswerNormalization,

    /// Rules, evaluated in declaration order.
    pub rules: Vec<Rule>,

    /// Outcome and score-value configuration.
    pub scoring: Scoring,

    /// Keys counted toward eligibility but never evaluated.
    #[serde(default)]
    pub ignore_question_keys: Vec<String>,

    /// Notification template override for this rule set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template_name: Option<String>,
}

impl RuleDocument {
    /// Validates the document against the identity it was loaded under and
    /// the evaluator's operator vocabulary.
    ///
    /// # Errors
    ///
    /// Returns [`RuleDocumentError`] when the identity does not match, no
    /// outcome rules are present, or any rule uses an unknown operator or
    /// lacks its operand.
    pub fn validate(&self, expected_name: &str, expected_version: &str) -> Result<(), RuleDocumentError> {
        if !self.rule_set_name.eq_ignore_ascii_case(expected_name) {
            return Err(RuleDocumentError::NameMismatch {
                found: self.rule_set_name.clone(),
                expected: expected_name.to_string(),
            });
        }
        if self.rule_set_version != expected_version {
            return Err(RuleDocumentError::VersionMismatch {
                found: self.rule_set_version.clone(),
                expected: expected_version.to_string(),
            });
        }
        if self.scoring.outcome_rules.is_empty() {
            return Err(RuleDocumentError::NoOutcomeRules {
                name: self.rule_set_name.clone(),
                version: self.rule_set_version.clone(),
            });
        }

        for rule in &self.rules {
            match rule.non_compliant_when.op.as_str() {
                "missing" => {},
                "equals" => {
                    if rule.non_compliant_when.value.is_none() {
                        return Err(RuleDocumentError::BadRule {
                            rule_id: rule.rule_id.clone(),
                            reason: "operator `equals` requires `value`".to_string(),
                        });
                    }
                },
                "in" => {
                    if rule.non_compliant_when.values.is_none() {
                        return Err(RuleDocumentError::BadRule {
                            rule_id: rule.rule_id.clone(),
                            reason: "operator `in` requires `values`".to_string(),
                        });
                    }
                },
                other => {
                    return Err(RuleDocumentError::BadRule {
                        rule_id: rule.rule_id.clone(),
                        reason: format!("unknown operator `{other}`"),
                    });
                },
            }
        }

        Ok(())
    }

    /// The eligibility key set: every enabled rule's `questionKey`, all
    /// `questionKeysAny` entries, and `ignoreQuestionKeys`.
    ///
    /// Used both by the resolver's overlap fallback and by the score
    /// stage's precondition.
    #[must_use]
    pub fn eligibility_keys(&self) -> BTreeSet<String> {
        let mut keys = BTreeSet::new();
        for rule in &self.rules {
            if rule.enabled {
                keys.insert(rule.question_key.clone());
            }
            if let Some(any) = &rule.question_keys_any {
                keys.extend(any.iter().cloned());
            }
        }
        keys.extend(self.ignore_question_keys.iter().cloned());
        keys
    }
}
