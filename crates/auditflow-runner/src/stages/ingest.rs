//! Ingest stage: summary payload → report rows → watermark.
//!
//! Eligibility is bounded below by `max(start override, watermark)`
//! (strictly greater than) and optionally above by the end override.
//! Selection is ascending by `(completed_at, report_id)`, capped at the
//! batch size and then extended across the trailing completion-instant tie
//! group - without the extension, advancing the watermark to the boundary
//! instant would silently drop the tied remainder forever.

use auditflow_core::model::JOB_INGESTION;
use auditflow_core::payload::SummaryItem;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::store::{MarkOutcome, NewReport, StateStore, StoreError};

/// Bounds and limits for one ingest pass.
#[derive(Debug, Clone, Copy)]
pub struct IngestBounds {
    /// Current watermark value (the epoch when the row does not exist).
    pub watermark: DateTime<Utc>,
    /// Whether the watermark row existed before this run.
    pub watermark_exists: bool,
    /// Optional operator override of the lower bound.
    pub start_override: Option<DateTime<Utc>>,
    /// Optional inclusive upper bound.
    pub upper_bound: Option<DateTime<Utc>>,
    /// Maximum items before tie expansion.
    pub batch_size: usize,
}

impl IngestBounds {
    /// The effective lower bound: items must complete strictly after it.
    #[must_use]
    pub fn lower_bound(&self) -> DateTime<Utc> {
        match self.start_override {
            Some(start) if start > self.watermark => start,
            _ => self.watermark,
        }
    }
}

/// What one ingest pass did.
#[derive(Debug)]
pub struct IngestResult {
    /// Records in the summary payload.
    pub fetched: u64,
    /// Records that passed extraction and the bounds.
    pub eligible: u64,
    /// The selected batch, in processing order; feeds the worker queue.
    pub selected: Vec<SummaryItem>,
    /// Items whose report row committed this run.
    pub ingested: u64,
    /// Items already in the ingestion ledger.
    pub already_processed: u64,
    /// Items whose transaction failed.
    pub failed: u64,
    /// Watermark written at the end of the pass, when it advanced.
    pub new_watermark: Option<DateTime<Utc>>,
}

/// Sorts eligible items and selects the batch with tie expansion.
#[must_use]
pub fn select_batch(mut eligible: Vec<SummaryItem>, batch_size: usize) -> Vec<SummaryItem> {
    eligible.sort_by(|a, b| {
        a.completed_at
            .cmp(&b.completed_at)
            .then_with(|| a.report_id.cmp(&b.report_id))
    });

    if eligible.len() <= batch_size || batch_size == 0 {
        return eligible;
    }

    let boundary = eligible[batch_size - 1].completed_at;
    let cut = eligible[batch_size..]
        .iter()
        .take_while(|item| item.completed_at == boundary)
        .count();
    eligible.truncate(batch_size + cut);
    eligible
}

/// Runs the ingest pass over a summary payload.
///
/// Per selected item, one transaction: acquire the ingestion ledger, then
/// insert the report. The watermark only advances when every item ended
/// cleanly (committed or already ledgered), to the greatest completion
/// instant among them; a previously absent watermark row is seeded even
/// when nothing was selected.
///
/// # Errors
///
/// Returns [`StoreError`] only for failures outside per-item transactions
/// (watermark write). Per-item failures are counted, logged and swallowed.
pub fn run_ingest(
    store: &StateStore,
    run_id: &str,
    payload: &[Value],
    bounds: &IngestBounds,
) -> Result<IngestResult, StoreError> {
    let fetched = payload.len() as u64;
    let lower = bounds.lower_bound();

    let eligible: Vec<SummaryItem> = payload
        .iter()
        .filter_map(SummaryItem::try_extract)
        .filter(|item| item.completed_at > lower)
        .filter(|item| {
            bounds
                .upper_bound
                .is_none_or(|upper| item.completed_at <= upper)
        })
        .collect();
    let eligible_count = eligible.len() as u64;

    let selected = select_batch(eligible, bounds.batch_size);
    debug!(
        fetched,
        eligible = eligible_count,
        selected = selected.len(),
        lower_bound = %lower,
        "ingest selection complete"
    );

    let mut ingested = 0u64;
    let mut already_processed = 0u64;
    let mut failed = 0u64;
    let mut max_clean_instant: Option<DateTime<Utc>> = None;

    for item in &selected {
        let outcome = store.with_tx(|tx| {
            match store.try_mark_processed(tx, JOB_INGESTION, &item.report_id, run_id)? {
                MarkOutcome::AlreadyProcessed => Ok(MarkOutcome::AlreadyProcessed),
                MarkOutcome::Processed => {
                    store.insert_report(
                        tx,
                        &NewReport {
                            report_id: &item.report_id,
                            completed_at: item.completed_at,
                            certification_number: item.certification_number.as_deref(),
                            ingest_run_id: run_id,
                            metadata: &item.metadata,
                        },
                    )?;
                    Ok(MarkOutcome::Processed)
                },
            }
        });

        match outcome {
            Ok(MarkOutcome::Processed) => {
                ingested += 1;
                max_clean_instant = Some(max_clean_instant.map_or(item.completed_at, |m| {
                    m.max(item.completed_at)
                }));
            },
            Ok(MarkOutcome::AlreadyProcessed) => {
                already_processed += 1;
                max_clean_instant = Some(max_clean_instant.map_or(item.completed_at, |m| {
                    m.max(item.completed_at)
                }));
            },
            Err(err) => {
                failed += 1;
                warn!(report_id = %item.report_id, error = %err, "report ingest failed");
            },
        }
    }

    let mut new_watermark = None;
    if failed == 0 {
        match max_clean_instant {
            Some(instant) => {
                let advanced = instant.max(bounds.watermark);
                store.upsert_watermark(JOB_INGESTION, advanced)?;
                new_watermark = Some(advanced);
                info!(watermark = %advanced, "watermark advanced");
            },
            None if !bounds.watermark_exists => {
                // Seed the row so operators can observe the job even when
                // the first run found nothing.
                store.upsert_watermark(JOB_INGESTION, bounds.watermark)?;
            },
            None => {},
        }
    } else {
        warn!(failed, "ingest failures present, watermark not advanced");
    }

    Ok(IngestResult {
        fetched,
        eligible: eligible_count,
        selected,
        ingested,
        already_processed,
        failed,
        new_watermark,
    })
}
