//! Pipeline orchestrator.
//!
//! One call to [`Pipeline::run`] executes one batch: acquire the
//! run-history row, prefetch the configured rule sets, read the watermark,
//! fetch and ingest the summary, then drain the per-report queue (enrich →
//! resolve → score) with a small cooperative worker pool, optionally
//! materialise the outbox, and finalise the run row with a one-line
//! counter summary.
//!
//! Per-item failures are counted and logged; only fatal authentication,
//! summary-fetch exhaustion, and broken rule documents abort the run.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use auditflow_core::model::{RunStatus, RuleSetKey, SkipReason};
use auditflow_core::rules::{
    EvaluationError, LoadedRuleSet, ResolverConfigError, RuleLoadError, RuleSetCache,
    RulesetResolver,
};
use auditflow_core::time::Clock;
use thiserror::Error;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::api::{AuditApi, SummaryWindow};
use crate::config::{MaterialiseScope, RunnerConfig};
use crate::http::ApiError;
use crate::outbox::{self, OutboxScope};
use crate::stages::enrich::{self, EnrichError, EnrichOutcome};
use crate::stages::ingest::{self, IngestBounds};
use crate::stages::score::{self, ScoreError, ScoreOutcome};
use crate::store::{MetadataColumns, StateStore, StoreError};

/// Worker tasks draining the per-report queue. Matches the SQL pool size;
/// this is a contract with the remote API's rate expectations, not a
/// tuning knob.
pub const DETAILS_CONCURRENCY: usize = 3;

/// Job name recorded in run history.
pub const PIPELINE_JOB_NAME: &str = "GoAuditsPipeline";

/// Run-fatal failures.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum RunError {
    /// The ruleset version map override failed to parse.
    #[error("configuration error: {0}")]
    ResolverConfig(#[from] ResolverConfigError),

    /// A configured rule set failed to load or validate.
    #[error("configuration error: {0}")]
    RuleSet(#[from] RuleLoadError),

    /// The summary fetch failed (after retries, or structurally).
    #[error("summary fetch failed: {0}")]
    SummaryFetch(#[source] ApiError),

    /// The remote rejected our credentials mid-run.
    #[error("run aborted: {0}")]
    FatalAuth(#[source] ApiError),

    /// A store failure outside any per-item transaction.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// A rule document failed to evaluate; it is broken for every report.
    #[error("scoring aborted: {0}")]
    Evaluation(#[from] EvaluationError),
}

/// Live counters for one run. Workers update them concurrently.
#[derive(Debug, Default)]
pub struct RunCounters {
    fetched: AtomicU64,
    eligible: AtomicU64,
    selected: AtomicU64,
    ingested: AtomicU64,
    ingest_already_processed: AtomicU64,
    ingest_failed: AtomicU64,
    details_processed: AtomicU64,
    details_already_processed: AtomicU64,
    details_failed: AtomicU64,
    cert_missing: AtomicU64,
    key_anomalies: AtomicU64,
    score_processed: AtomicU64,
    score_already_processed: AtomicU64,
    score_failed: AtomicU64,
    skipped_not_eligible: AtomicU64,
    outbox_inserted: AtomicU64,
    outbox_skipped: AtomicU64,
    outbox_missing_recipient: AtomicU64,
}

/// Immutable snapshot of the counters, taken at run end.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[allow(missing_docs)]
pub struct CounterSnapshot {
    pub fetched: u64,
    pub eligible: u64,
    pub selected: u64,
    pub ingested: u64,
    pub ingest_already_processed: u64,
    pub ingest_failed: u64,
    pub details_processed: u64,
    pub details_already_processed: u64,
    pub details_failed: u64,
    pub cert_missing: u64,
    pub key_anomalies: u64,
    pub score_processed: u64,
    pub score_already_processed: u64,
    pub score_failed: u64,
    pub skipped_not_eligible: u64,
    pub outbox_inserted: u64,
    pub outbox_skipped: u64,
    pub outbox_missing_recipient: u64,
}

impl RunCounters {
    fn add(counter: &AtomicU64, value: u64) {
        counter.fetch_add(value, Ordering::Relaxed);
    }

    fn bump(counter: &AtomicU64) {
        Self::add(counter, 1);
    }

    /// Snapshot every counter.
    #[must_use]
    pub fn snapshot(&self) -> CounterSnapshot {
        let read = |c: &AtomicU64| c.load(Ordering::Relaxed);
        CounterSnapshot {
            fetched: read(&self.fetched),
            eligible: read(&self.eligible),
            selected: read(&self.selected),
            ingested: read(&self.ingested),
            ingest_already_processed: read(&self.ingest_already_processed),
            ingest_failed: read(&self.ingest_failed),
            details_processed: read(&self.details_processed),
            details_already_processed: read(&self.details_already_processed),
            details_failed: read(&self.details_failed),
            cert_missing: read(&self.cert_missing),
            key_anomalies: read(&self.key_anomalies),
            score_processed: read(&self.score_processed),
            score_already_processed: read(&self.score_already_processed),
            score_failed: read(&self.score_failed),
            skipped_not_eligible: read(&self.skipped_not_eligible),
            outbox_inserted: read(&self.outbox_inserted),
            outbox_skipped: read(&self.outbox_skipped),
            outbox_missing_recipient: read(&self.outbox_missing_recipient),
        }
    }
}

impl CounterSnapshot {
    /// The one-line run summary recorded in run history.
    #[must_use]
    pub fn summary_line(&self) -> String {
        let mut line = format!(
            "Fetched={} Eligible={} Selected={} Ingested={} IngestAlreadyProcessed={} \
             IngestFailed={} DetailsProcessed={} DetailsAlreadyProcessed={} DetailsFailed={} \
             CertMissing={} ScoreProcessed={} ScoreAlreadyProcessed={} ScoreFailed={} \
             SkippedNotEligible={} EmailOutboxInserted={} EmailOutboxSkipped={} \
             EmailMissingRecipient={}",
            self.fetched,
            self.eligible,
            self.selected,
            self.ingested,
            self.ingest_already_processed,
            self.ingest_failed,
            self.details_processed,
            self.details_already_processed,
            self.details_failed,
            self.cert_missing,
            self.score_processed,
            self.score_already_processed,
            self.score_failed,
            self.skipped_not_eligible,
            self.outbox_inserted,
            self.outbox_skipped,
            self.outbox_missing_recipient,
        );
        if self.key_anomalies > 0 {
            line.push_str(&format!(" KeyAnomalies={}", self.key_anomalies));
        }
        line
    }
}

/// Identity of an in-flight run.
#[derive(Debug, Clone)]
pub struct RunHandle {
    /// Run id recorded in run history and every ledger row.
    pub run_id: String,
    /// Correlation id carried in every log event of the run.
    pub correlation_id: String,
}

/// The result of a finished run.
#[derive(Debug, Clone)]
pub struct RunSummary {
    /// Final status.
    pub status: RunStatus,
    /// The one-line counter summary.
    pub message: String,
    /// Final counters.
    pub counters: CounterSnapshot,
}

/// The pipeline, bound to its collaborators.
pub struct Pipeline {
    store: Arc<StateStore>,
    api: Arc<dyn AuditApi>,
    clock: Arc<dyn Clock>,
    rules: Arc<RuleSetCache>,
    resolver: RulesetResolver,
    config: RunnerConfig,
}

impl Pipeline {
    /// Binds the pipeline to its collaborators and parses the resolver
    /// configuration.
    ///
    /// # Errors
    ///
    /// Returns [`RunError::ResolverConfig`] when the version-map override
    /// is malformed.
    pub fn new(
        config: RunnerConfig,
        store: Arc<StateStore>,
        api: Arc<dyn AuditApi>,
        clock: Arc<dyn Clock>,
        rules: Arc<RuleSetCache>,
    ) -> Result<Self, RunError> {
        let resolver = match config.ruleset_map_json.as_deref() {
            Some(raw) => RulesetResolver::from_map_json(raw)?,
            None => RulesetResolver::default(),
        };
        Ok(Self {
            store,
            api,
            clock,
            rules,
            resolver,
            config,
        })
    }

    /// Inserts the `Running` run-history row and returns the run identity.
    ///
    /// # Errors
    ///
    /// Returns [`RunError::Store`] when the row cannot be written.
    pub fn begin_run(&self) -> Result<RunHandle, RunError> {
        let handle = RunHandle {
            run_id: Uuid::new_v4().to_string(),
            correlation_id: Uuid::new_v4().to_string(),
        };
        self.store.insert_run(
            &handle.run_id,
            PIPELINE_JOB_NAME,
            RunStatus::Running,
            None,
            &handle.correlation_id,
        )?;
        info!(
            run_id = %handle.run_id,
            correlation_id = %handle.correlation_id,
            dry_run = self.store.is_dry_run(),
            "run started"
        );
        Ok(handle)
    }

    /// Best-effort finalisation used by the signal handler.
    pub fn abort_run(&self, handle: &RunHandle, reason: &str) {
        if let Err(err) = self
            .store
            .finish_run(&handle.run_id, RunStatus::Failed, reason)
        {
            warn!(run_id = %handle.run_id, error = %err, "failed to record run abort");
        }
    }

    /// Convenience: begin and execute one run.
    ///
    /// # Errors
    ///
    /// See [`Pipeline::execute`].
    pub async fn run(&self) -> Result<RunSummary, RunError> {
        let handle = self.begin_run()?;
        self.execute(&handle).await
    }

    /// Executes the batch for an already-begun run and finalises its
    /// run-history row, success or failure.
    ///
    /// # Errors
    ///
    /// Returns the run-fatal [`RunError`]; the run row has already been
    /// marked `Failed` with the counter summary and error appended.
    pub async fn execute(&self, handle: &RunHandle) -> Result<RunSummary, RunError> {
        let counters = Arc::new(RunCounters::default());

        match self.execute_inner(handle, &counters).await {
            Ok(()) => {
                let snapshot = counters.snapshot();
                let message = snapshot.summary_line();
                self.store
                    .finish_run(&handle.run_id, RunStatus::Succeeded, &message)?;
                info!(run_id = %handle.run_id, %message, "run succeeded");
                Ok(RunSummary {
                    status: RunStatus::Succeeded,
                    message,
                    counters: snapshot,
                })
            },
            Err(err) => {
                let snapshot = counters.snapshot();
                let message = format!("{} | Error: {err}", snapshot.summary_line());
                if let Err(finish_err) =
                    self.store
                        .finish_run(&handle.run_id, RunStatus::Failed, &message)
                {
                    warn!(
                        run_id = %handle.run_id,
                        error = %finish_err,
                        "failed to record run failure"
                    );
                }
                error!(run_id = %handle.run_id, %message, "run failed");
                Err(err)
            },
        }
    }

    async fn execute_inner(
        &self,
        handle: &RunHandle,
        counters: &Arc<RunCounters>,
    ) -> Result<(), RunError> {
        // Configured rule sets load before any remote work; a malformed
        // document is a startup failure, not a mid-batch surprise.
        let mut rule_sets: BTreeMap<String, Arc<LoadedRuleSet>> = BTreeMap::new();
        let mut eligibility: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        let mut templates: BTreeMap<RuleSetKey, String> = BTreeMap::new();
        for key in self.resolver.known_rule_sets() {
            let loaded = self.rules.load(&key)?;
            eligibility.insert(key.name.clone(), loaded.eligibility_keys.clone());
            if let Some(template) = &loaded.document.template_name {
                templates.insert(key.clone(), template.clone());
            }
            rule_sets.insert(key.name.clone(), loaded);
        }

        let columns = self.store.probe_metadata_columns()?;

        let (watermark, watermark_exists) =
            self.store.get_watermark(auditflow_core::model::JOB_INGESTION)?;
        info!(watermark = %watermark, exists = watermark_exists, "watermark read");

        let bounds = IngestBounds {
            watermark,
            watermark_exists,
            start_override: self.config.start_override,
            upper_bound: self.config.end_override,
            batch_size: self.config.batch_size,
        };

        let window = SummaryWindow {
            start_date: bounds.lower_bound().date_naive(),
            end_date: self
                .config
                .end_override
                .unwrap_or_else(|| self.clock.now_utc())
                .date_naive(),
        };
        let payload = self.api.fetch_summary(window).await.map_err(|err| {
            if err.is_fatal_auth() {
                RunError::FatalAuth(err)
            } else {
                RunError::SummaryFetch(err)
            }
        })?;

        let ingest_result = ingest::run_ingest(&self.store, &handle.run_id, &payload, &bounds)?;
        RunCounters::add(&counters.fetched, ingest_result.fetched);
        RunCounters::add(&counters.eligible, ingest_result.eligible);
        RunCounters::add(&counters.selected, ingest_result.selected.len() as u64);
        RunCounters::add(&counters.ingested, ingest_result.ingested);
        RunCounters::add(
            &counters.ingest_already_processed,
            ingest_result.already_processed,
        );
        RunCounters::add(&counters.ingest_failed, ingest_result.failed);

        let context = Arc::new(WorkerContext {
            store: Arc::clone(&self.store),
            api: Arc::clone(&self.api),
            resolver: self.resolver.clone(),
            rule_sets,
            eligibility,
            columns,
            run_id: handle.run_id.clone(),
            correlation_id: handle.correlation_id.clone(),
            validate_keys: self.config.validate_keys,
            counters: Arc::clone(counters),
            queue: Mutex::new(ingest_result.selected.into_iter().collect()),
            fatal: Mutex::new(None),
            scored_reports: Mutex::new(Vec::new()),
        });

        let workers: Vec<_> = (0..DETAILS_CONCURRENCY)
            .map(|worker| {
                let context = Arc::clone(&context);
                tokio::spawn(async move { context.drain(worker).await })
            })
            .collect();
        for worker in workers {
            if let Err(join_err) = worker.await {
                error!(error = %join_err, "worker task panicked");
            }
        }

        if let Some(fatal) = context.take_fatal() {
            return Err(fatal);
        }

        if self.config.materialise_email {
            let scope = match self.config.materialise_scope {
                MaterialiseScope::All => OutboxScope::All,
                MaterialiseScope::Batch => OutboxScope::Batch(context.scored_report_ids()),
            };
            let counts = outbox::materialise(&self.store, &scope, &templates)?;
            RunCounters::add(&counters.outbox_inserted, counts.inserted);
            RunCounters::add(&counters.outbox_skipped, counts.skipped_already_exists);
            RunCounters::add(
                &counters.outbox_missing_recipient,
                counts.missing_recipient,
            );
        }

        Ok(())
    }
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("resolver", &self.resolver)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Shared state of the worker pool.
struct WorkerContext {
    store: Arc<StateStore>,
    api: Arc<dyn AuditApi>,
    resolver: RulesetResolver,
    rule_sets: BTreeMap<String, Arc<LoadedRuleSet>>,
    eligibility: BTreeMap<String, BTreeSet<String>>,
    columns: MetadataColumns,
    run_id: String,
    correlation_id: String,
    validate_keys: bool,
    counters: Arc<RunCounters>,
    queue: Mutex<VecDeque<auditflow_core::payload::SummaryItem>>,
    fatal: Mutex<Option<RunError>>,
    scored_reports: Mutex<Vec<String>>,
}

impl WorkerContext {
    fn next_item(&self) -> Option<auditflow_core::payload::SummaryItem> {
        self.queue.lock().expect("queue lock poisoned").pop_front()
    }

    fn fatal_pending(&self) -> bool {
        self.fatal.lock().expect("fatal lock poisoned").is_some()
    }

    fn set_fatal(&self, err: RunError) {
        let mut slot = self.fatal.lock().expect("fatal lock poisoned");
        if slot.is_none() {
            *slot = Some(err);
        }
    }

    fn take_fatal(&self) -> Option<RunError> {
        self.fatal.lock().expect("fatal lock poisoned").take()
    }

    fn scored_report_ids(&self) -> Vec<String> {
        self.scored_reports
            .lock()
            .expect("scored lock poisoned")
            .clone()
    }

    async fn drain(&self, worker: usize) {
        while !self.fatal_pending() {
            let Some(item) = self.next_item() else {
                break;
            };
            self.process(worker, &item).await;
        }
    }

    async fn process(&self, worker: usize, item: &auditflow_core::payload::SummaryItem) {
        let report_id = item.report_id.as_str();
        let counters = &self.counters;

        let (payload_rows, extracted_answers) = match enrich::enrich_report(
            &self.store,
            self.api.as_ref(),
            &self.run_id,
            report_id,
            self.validate_keys,
        )
        .await
        {
            Ok(EnrichOutcome::Enriched {
                answer_count,
                cert_missing,
                key_anomalies,
                payload_rows,
                answer_map,
            }) => {
                RunCounters::bump(&counters.details_processed);
                if cert_missing {
                    RunCounters::bump(&counters.cert_missing);
                }
                RunCounters::add(&counters.key_anomalies, key_anomalies);
                info!(
                    worker,
                    report_id,
                    correlation_id = %self.correlation_id,
                    answers = answer_count,
                    cert_missing,
                    "report enriched"
                );
                (Some(payload_rows), Some(answer_map))
            },
            Ok(EnrichOutcome::AlreadyProcessed) => {
                RunCounters::bump(&counters.details_already_processed);
                (None, None)
            },
            Err(EnrichError::Api(err)) if err.is_fatal_auth() => {
                self.set_fatal(RunError::FatalAuth(err));
                return;
            },
            Err(err) => {
                RunCounters::bump(&counters.details_failed);
                warn!(
                    worker,
                    report_id,
                    correlation_id = %self.correlation_id,
                    error = %err,
                    "report enrichment failed"
                );
                return;
            },
        };

        let metadata = match self.store.load_report_metadata(report_id, &self.columns) {
            Ok(metadata) => metadata,
            Err(err) => {
                RunCounters::bump(&counters.score_failed);
                warn!(worker, report_id, error = %err, "metadata load failed");
                return;
            },
        };
        // Scoring reads persisted answers so it also works when enrich was
        // skipped by the ledger. Dry runs wrote nothing, so they score from
        // the extracted map instead.
        let answers = if self.store.is_dry_run() {
            match extracted_answers {
                Some(map) => map,
                None => match self.store.load_answers(report_id) {
                    Ok(answers) => answers,
                    Err(err) => {
                        RunCounters::bump(&counters.score_failed);
                        warn!(worker, report_id, error = %err, "answer load failed");
                        return;
                    },
                },
            }
        } else {
            match self.store.load_answers(report_id) {
                Ok(answers) => answers,
                Err(err) => {
                    RunCounters::bump(&counters.score_failed);
                    warn!(worker, report_id, error = %err, "answer load failed");
                    return;
                },
            }
        };

        if answers.is_empty() {
            RunCounters::bump(&counters.skipped_not_eligible);
            info!(
                worker,
                report_id,
                correlation_id = %self.correlation_id,
                reason = %SkipReason::NoAnswers,
                "report skipped by scoring"
            );
            return;
        }

        let observed: BTreeSet<String> = answers.keys().cloned().collect();
        let rule_set = match self.resolver.resolve(
            &metadata,
            payload_rows.as_deref(),
            &observed,
            &self.eligibility,
        ) {
            Ok(rule_set) => rule_set,
            Err(reason) => {
                RunCounters::bump(&counters.skipped_not_eligible);
                info!(
                    worker,
                    report_id,
                    correlation_id = %self.correlation_id,
                    reason = %reason,
                    "report skipped by scoring"
                );
                return;
            },
        };

        let Some(loaded) = self.rule_sets.get(&rule_set.name) else {
            // The resolver only resolves configured names, so this is
            // unreachable unless the maps diverge.
            RunCounters::bump(&counters.score_failed);
            warn!(worker, report_id, rule_set = %rule_set, "resolved rule set is not loaded");
            return;
        };

        match score::score_report(
            &self.store,
            &self.run_id,
            report_id,
            &rule_set,
            loaded,
            &answers,
        ) {
            Ok(ScoreOutcome::Scored {
                major_count,
                minor_count,
                outcome,
            }) => {
                RunCounters::bump(&counters.score_processed);
                self.scored_reports
                    .lock()
                    .expect("scored lock poisoned")
                    .push(report_id.to_string());
                info!(
                    worker,
                    report_id,
                    correlation_id = %self.correlation_id,
                    rule_set = %rule_set,
                    major_count,
                    minor_count,
                    %outcome,
                    "report scored"
                );
            },
            Ok(ScoreOutcome::AlreadyProcessed) => {
                RunCounters::bump(&counters.score_already_processed);
            },
            Ok(ScoreOutcome::Skipped(reason)) => {
                RunCounters::bump(&counters.skipped_not_eligible);
                info!(
                    worker,
                    report_id,
                    correlation_id = %self.correlation_id,
                    reason = %reason,
                    "report skipped by scoring"
                );
            },
            Err(ScoreError::Evaluation(err)) => {
                self.set_fatal(RunError::Evaluation(err));
            },
            Err(ScoreError::Store(err)) => {
                RunCounters::bump(&counters.score_failed);
                warn!(
                    worker,
                    report_id,
                    correlation_id = %self.correlation_id,
                    error = %err,
                    "report scoring failed"
                );
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_summary_line_shape() {
        let counters = RunCounters::default();
        RunCounters::add(&counters.fetched, 3);
        RunCounters::bump(&counters.ingested);
        let line = counters.snapshot().summary_line();

        assert!(line.starts_with("Fetched=3 "));
        assert!(line.contains("Ingested=1"));
        assert!(line.contains("EmailOutboxInserted=0"));
        assert!(
            !line.contains("KeyAnomalies"),
            "diagnostic counter only appears when nonzero"
        );

        RunCounters::add(&counters.key_anomalies, 2);
        assert!(counters.snapshot().summary_line().ends_with("KeyAnomalies=2"));
    }
}
