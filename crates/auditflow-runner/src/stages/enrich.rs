//! Enrich stage: per-report details → certificate + answers.
//!
//! The enrichment ledger is checked before the details call so replays do
//! not spend remote requests on reports that are already enriched. The
//! ledger row itself is only written once answers exist, inside the same
//! transaction as the answers, so a crash between fetch and commit leaves
//! the report retryable.

use auditflow_core::model::JOB_ENRICHMENT;
use auditflow_core::payload::{self, MAX_QUESTION_KEY_LEN};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

use crate::api::AuditApi;
use crate::http::ApiError;
use crate::store::{NewAnswer, StateStore, StoreError};

/// Errors raised while enriching one report.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum EnrichError {
    /// The details call failed. Fatal-auth failures abort the run; every
    /// other class is a per-item failure.
    #[error(transparent)]
    Api(#[from] ApiError),

    /// The details payload had no `Detail` rows; non-retryable per item.
    #[error(transparent)]
    NoDetails(#[from] payload::NoDetailRows),

    /// A store failure inside the per-item transaction.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// What enriching one report did.
#[derive(Debug)]
pub enum EnrichOutcome {
    /// The report was enriched (or re-verified) this run.
    Enriched {
        /// Answers persisted for the report after the transaction (the
        /// would-be count in dry-run mode).
        answer_count: u64,
        /// True when answers exist but the certificate is still empty.
        cert_missing: bool,
        /// Derived question keys that failed the stability diagnostics.
        key_anomalies: u64,
        /// The raw detail rows, kept for the ruleset resolver.
        payload_rows: Vec<Value>,
        /// The extracted answer map. Scoring re-reads the store in live
        /// runs; dry runs score from this since nothing was written.
        answer_map: std::collections::BTreeMap<String, Option<String>>,
    },
    /// The enrichment ledger already has the report; nothing was fetched.
    AlreadyProcessed,
}

/// Enriches one report.
///
/// # Errors
///
/// Returns [`EnrichError`]; see the per-variant docs for scope.
pub async fn enrich_report(
    store: &StateStore,
    api: &dyn AuditApi,
    run_id: &str,
    report_id: &str,
    validate_keys: bool,
) -> Result<EnrichOutcome, EnrichError> {
    if store.is_processed(JOB_ENRICHMENT, report_id)? {
        debug!(report_id, "enrichment ledger already has report");
        return Ok(EnrichOutcome::AlreadyProcessed);
    }

    let rows = api.fetch_details(report_id).await?;
    let extract = payload::extract_details(&rows)?;

    let key_anomalies = if validate_keys {
        audit_key_stability(report_id, &extract.answers)
    } else {
        0
    };

    let certificate = extract.certificate.clone();
    let (answer_count, cert_missing) = store.with_tx(|tx| {
        if let Some(cert) = certificate.as_deref() {
            store.update_report_cert_if_empty(tx, report_id, cert)?;
        }

        for answer in &extract.answers {
            store.insert_answer_if_absent(
                tx,
                &NewAnswer {
                    report_id,
                    question_key: &answer.question_key,
                    answer_value: answer.answer_value.as_deref(),
                    section: answer.section.as_deref(),
                    question_text: answer.question_text.as_deref(),
                    enrich_run_id: run_id,
                },
            )?;
        }

        let answer_count = if store.is_dry_run() {
            extract.answers.len() as u64
        } else {
            store.count_answers(tx, report_id)?
        };
        // In live mode the conditional update already ran in this
        // transaction, so the read-back covers the extracted certificate.
        let cert_now = store
            .report_certificate(tx, report_id)?
            .or_else(|| certificate.clone());

        let mut cert_missing = false;
        if answer_count > 0 {
            let _ = store.try_mark_processed(tx, JOB_ENRICHMENT, report_id, run_id)?;
            cert_missing = cert_now.is_none();
        }
        Ok((answer_count, cert_missing))
    })?;

    let answer_map = extract
        .answers
        .iter()
        .map(|a| (a.question_key.clone(), a.answer_value.clone()))
        .collect();

    debug!(report_id, answer_count, cert_missing, "report enriched");
    Ok(EnrichOutcome::Enriched {
        answer_count,
        cert_missing,
        key_anomalies,
        payload_rows: rows,
        answer_map,
    })
}

/// Diagnostic pass: every derived key must be a fixed point of its own
/// derivation and fit the column.
fn audit_key_stability(report_id: &str, answers: &[payload::ExtractedAnswer]) -> u64 {
    let mut anomalies = 0u64;
    for answer in answers {
        let rederived = payload::derive_question_key(None, Some(&answer.question_key));
        let stable = rederived.as_deref() == Some(answer.question_key.as_str());
        // Keys taken verbatim from QUESTION_ID are exempt from slug
        // stability; they only need to fit.
        let numeric_id = answer.question_key.chars().all(|c| c.is_ascii_alphanumeric());
        if answer.question_key.len() > MAX_QUESTION_KEY_LEN || (!stable && !numeric_id) {
            anomalies += 1;
            warn!(
                report_id,
                question_key = %answer.question_key,
                "derived question key failed stability check"
            );
        }
    }
    anomalies
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use async_trait::async_trait;
    use auditflow_core::payload::ReportMetadata;
    use auditflow_core::time::SystemClock;
    use chrono::{TimeZone, Utc};
    use serde_json::json;

    use crate::api::SummaryWindow;
    use crate::store::NewReport;

    use super::*;

    struct FixedDetails {
        rows: Vec<Value>,
    }

    #[async_trait]
    impl AuditApi for FixedDetails {
        async fn fetch_summary(&self, _window: SummaryWindow) -> Result<Vec<Value>, ApiError> {
            Ok(Vec::new())
        }

        async fn fetch_details(&self, _report_id: &str) -> Result<Vec<Value>, ApiError> {
            Ok(self.rows.clone())
        }
    }

    fn store_with_report(report_id: &str) -> StateStore {
        let store = StateStore::in_memory(Arc::new(SystemClock)).expect("failed to open store");
        store
            .with_tx(|tx| {
                store.insert_report(
                    tx,
                    &NewReport {
                        report_id,
                        completed_at: Utc.with_ymd_and_hms(2024, 8, 1, 10, 0, 0).unwrap(),
                        certification_number: None,
                        ingest_run_id: "run-0",
                        metadata: &ReportMetadata::default(),
                    },
                )
            })
            .expect("insert runs");
        store
    }

    fn detail_rows() -> Vec<Value> {
        vec![
            json!({"RecordType": "Header"}),
            json!({
                "RecordType": "Detail",
                "QUESTION_ID": "1",
                "Question": "MCS Certificate Number",
                "Answer": "MCS-123",
            }),
            json!({
                "RecordType": "Detail",
                "QUESTION_ID": "7",
                "Question": "Install type",
                "Answer": "Bolt-on",
            }),
        ]
    }

    #[tokio::test]
    async fn test_enrich_with_certificate() {
        let store = store_with_report("R1");
        let api = FixedDetails { rows: detail_rows() };

        let outcome = enrich_report(&store, &api, "run-1", "R1", false)
            .await
            .expect("enrich runs");

        match outcome {
            EnrichOutcome::Enriched {
                answer_count,
                cert_missing,
                ..
            } => {
                assert_eq!(answer_count, 2);
                assert!(!cert_missing);
            },
            EnrichOutcome::AlreadyProcessed => panic!("must enrich"),
        }

        let report = store.get_report("R1").expect("reads").expect("row exists");
        assert_eq!(report.certification_number.as_deref(), Some("MCS-123"));
        assert!(store.is_processed(JOB_ENRICHMENT, "R1").expect("reads"));

        let answers = store.load_answers("R1").expect("reads");
        assert_eq!(answers.len(), 2);
        assert!(answers.contains_key("1"));
        assert!(answers.contains_key("7"));
    }

    #[tokio::test]
    async fn test_enrich_skips_ledgered_report() {
        let store = store_with_report("R1");
        let api = FixedDetails { rows: detail_rows() };

        enrich_report(&store, &api, "run-1", "R1", false)
            .await
            .expect("enrich runs");
        let outcome = enrich_report(&store, &api, "run-2", "R1", false)
            .await
            .expect("enrich runs");
        assert!(matches!(outcome, EnrichOutcome::AlreadyProcessed));
    }

    #[tokio::test]
    async fn test_enrich_cert_missing_counted() {
        let store = store_with_report("R1");
        let api = FixedDetails {
            rows: vec![json!({
                "RecordType": "Detail",
                "QUESTION_ID": "7",
                "Question": "Install type",
                "Answer": "On-roof",
            })],
        };

        let outcome = enrich_report(&store, &api, "run-1", "R1", false)
            .await
            .expect("enrich runs");
        match outcome {
            EnrichOutcome::Enriched { cert_missing, .. } => assert!(cert_missing),
            EnrichOutcome::AlreadyProcessed => panic!("must enrich"),
        }
    }

    #[tokio::test]
    async fn test_enrich_requires_detail_rows() {
        let store = store_with_report("R1");
        let api = FixedDetails {
            rows: vec![json!({"RecordType": "Header"})],
        };

        let err = enrich_report(&store, &api, "run-1", "R1", false)
            .await
            .expect_err("must fail");
        assert!(matches!(err, EnrichError::NoDetails(_)));
        assert!(
            !store.is_processed(JOB_ENRICHMENT, "R1").expect("reads"),
            "failed enrich leaves the report retryable"
        );
    }
}
