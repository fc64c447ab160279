//! Score stage: persisted answers → findings + upserted score.
//!
//! The scoring ledger is keyed `reportId|name|version`, so a report can be
//! scored once per rule set version and re-scoring under a new version is a
//! fresh item. The ledger insert is the first statement of the
//! transaction; a duplicate commits nothing else.

use std::collections::BTreeMap;

use auditflow_core::model::{JOB_SCORING, RuleSetKey, SkipReason};
use auditflow_core::rules::{self, EvaluationError, LoadedRuleSet};
use thiserror::Error;
use tracing::debug;

use crate::store::{MarkOutcome, NewFinding, NewScore, StateStore, StoreError};

/// Errors raised while scoring one report.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ScoreError {
    /// A store failure inside the per-item transaction.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// The rule document failed to evaluate. This is a run-level failure:
    /// the document is broken for every report, not just this one.
    #[error(transparent)]
    Evaluation(#[from] EvaluationError),
}

/// What scoring one report did.
#[derive(Debug)]
pub enum ScoreOutcome {
    /// Findings and score committed this run.
    Scored {
        /// Count of Major findings.
        major_count: u32,
        /// Count of Minor findings.
        minor_count: u32,
        /// Outcome label.
        outcome: String,
    },
    /// The scoring ledger already has `(report, rule set)`.
    AlreadyProcessed,
    /// Preconditions failed; the report is not eligible for this pass.
    Skipped(SkipReason),
}

/// Scores one report against a resolved rule set.
///
/// Preconditions: the answer map is non-empty and shares at least one key
/// with the rule set's eligibility set. Either failing is a structured
/// skip, not an error.
///
/// # Errors
///
/// Returns [`ScoreError`]; evaluation failures abort the run.
pub fn score_report(
    store: &StateStore,
    run_id: &str,
    report_id: &str,
    rule_set: &RuleSetKey,
    loaded: &LoadedRuleSet,
    answers: &BTreeMap<String, Option<String>>,
) -> Result<ScoreOutcome, ScoreError> {
    if answers.is_empty() {
        return Ok(ScoreOutcome::Skipped(SkipReason::NoAnswers));
    }
    if !answers
        .keys()
        .any(|key| loaded.eligibility_keys.contains(key))
    {
        return Ok(ScoreOutcome::Skipped(SkipReason::NoEligibilityOverlap {
            rule_set: rule_set.clone(),
        }));
    }

    let evaluation = rules::evaluate(&loaded.document, answers)?;

    let item_key = rule_set.score_item_key(report_id);
    let outcome = store.with_tx(|tx| {
        match store.try_mark_processed(tx, JOB_SCORING, &item_key, run_id)? {
            MarkOutcome::AlreadyProcessed => return Ok(None),
            MarkOutcome::Processed => {},
        }

        for finding in &evaluation.findings {
            store.insert_finding_or_coalesce_text(
                tx,
                &NewFinding {
                    report_id,
                    rule_set,
                    question_key: &finding.question_key,
                    answer_value: finding.answer_value.as_deref(),
                    severity: finding.severity,
                    finding_code: finding.finding_code.as_deref(),
                    major_non_compliant_text: finding.major_non_compliant_text.as_deref(),
                    minor_non_compliant_text: finding.minor_non_compliant_text.as_deref(),
                    score_run_id: run_id,
                },
            )?;
        }

        store.upsert_score(
            tx,
            &NewScore {
                report_id,
                rule_set,
                major_count: evaluation.major_count,
                minor_count: evaluation.minor_count,
                score_value: evaluation.score_value.as_deref(),
                outcome: &evaluation.outcome,
                score_run_id: run_id,
            },
        )?;

        Ok(Some(()))
    })?;

    if outcome.is_none() {
        debug!(report_id, rule_set = %rule_set, "scoring ledger already has item");
        return Ok(ScoreOutcome::AlreadyProcessed);
    }

    debug!(
        report_id,
        rule_set = %rule_set,
        major = evaluation.major_count,
        minor = evaluation.minor_count,
        outcome = %evaluation.outcome,
        "report scored"
    );
    Ok(ScoreOutcome::Scored {
        major_count: evaluation.major_count,
        minor_count: evaluation.minor_count,
        outcome: evaluation.outcome,
    })
}
