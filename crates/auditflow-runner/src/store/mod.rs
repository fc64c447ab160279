//! Domain state store over the SQL gateway.
//!
//! Four concerns: the watermark, run history, the idempotency ledger, and
//! the domain rows (reports, answers, findings, scores, outbox). Pool-wide
//! operations take `&self`; anything that must be atomic with other writes
//! for the same item takes an explicit transaction, and the ledger insert
//! is what makes replays idempotent.
//!
//! In dry-run mode every mutator becomes a no-op (ledger checks fall back
//! to `SELECT`) so a run can be rehearsed against production data.

mod gateway;

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::Arc;

use auditflow_core::model::{RunStatus, RuleSetKey, Severity};
use auditflow_core::payload::ReportMetadata;
use auditflow_core::time::Clock;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{OptionalExtension, Transaction, params};

pub use gateway::{POOL_SIZE, SqlPool, StoreError};

/// Maximum persisted run-history message length, in characters.
pub const MAX_RUN_MESSAGE_LEN: usize = 4_000;

/// The optional metadata columns probed once per run.
const OPTIONAL_METADATA_COLUMNS: [&str; 4] = [
    "rule_set_name",
    "technology_type",
    "assessment_type",
    "template_name",
];

/// Result of a ledger acquisition attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkOutcome {
    /// This run acquired the item.
    Processed,
    /// Another (or an earlier) run already committed the item.
    AlreadyProcessed,
}

/// A new report row from ingest.
#[derive(Debug, Clone)]
pub struct NewReport<'a> {
    /// Report identifier.
    pub report_id: &'a str,
    /// Completion instant.
    pub completed_at: DateTime<Utc>,
    /// Certificate carried by the summary, if any.
    pub certification_number: Option<&'a str>,
    /// Run that ingested the report.
    pub ingest_run_id: &'a str,
    /// Optional resolver metadata.
    pub metadata: &'a ReportMetadata,
}

/// A new answer row from enrich.
#[derive(Debug, Clone)]
pub struct NewAnswer<'a> {
    /// Report identifier.
    pub report_id: &'a str,
    /// Stable question key.
    pub question_key: &'a str,
    /// Answer value in string form.
    pub answer_value: Option<&'a str>,
    /// Section label.
    pub section: Option<&'a str>,
    /// Question text.
    pub question_text: Option<&'a str>,
    /// Run that enriched the report.
    pub enrich_run_id: &'a str,
}

/// A new finding row from scoring.
#[derive(Debug, Clone)]
pub struct NewFinding<'a> {
    /// Report identifier.
    pub report_id: &'a str,
    /// Rule set that produced the finding.
    pub rule_set: &'a RuleSetKey,
    /// Question key the rule inspected.
    pub question_key: &'a str,
    /// The answer as evaluated.
    pub answer_value: Option<&'a str>,
    /// Finding severity.
    pub severity: Severity,
    /// Optional short code.
    pub finding_code: Option<&'a str>,
    /// Major text; populated only for Major findings.
    pub major_non_compliant_text: Option<&'a str>,
    /// Minor text; populated only for Minor findings.
    pub minor_non_compliant_text: Option<&'a str>,
    /// Run that scored the report.
    pub score_run_id: &'a str,
}

/// A new or replacing score row.
#[derive(Debug, Clone)]
pub struct NewScore<'a> {
    /// Report identifier.
    pub report_id: &'a str,
    /// Rule set the report was scored against.
    pub rule_set: &'a RuleSetKey,
    /// Count of Major findings.
    pub major_count: u32,
    /// Count of Minor findings.
    pub minor_count: u32,
    /// Derived score value.
    pub score_value: Option<&'a str>,
    /// Outcome label.
    pub outcome: &'a str,
    /// Run that scored the report.
    pub score_run_id: &'a str,
}

/// A persisted report row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportRow {
    /// Report identifier.
    pub report_id: String,
    /// Completion instant.
    pub completed_at: DateTime<Utc>,
    /// Certificate, once known.
    pub certification_number: Option<String>,
    /// Run that ingested the report.
    pub ingest_run_id: String,
}

/// A persisted score row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScoreRow {
    /// Count of Major findings.
    pub major_count: u32,
    /// Count of Minor findings.
    pub minor_count: u32,
    /// Derived score value.
    pub score_value: Option<String>,
    /// Outcome label.
    pub outcome: String,
    /// Run that last scored the report.
    pub score_run_id: String,
    /// When the report was last scored.
    pub scored_at: DateTime<Utc>,
}

/// A persisted finding row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FindingRow {
    /// Question key the finding is about.
    pub question_key: String,
    /// The answer as evaluated.
    pub answer_value: Option<String>,
    /// Severity string as persisted.
    pub severity: String,
    /// Optional short code.
    pub finding_code: Option<String>,
    /// Major text.
    pub major_non_compliant_text: Option<String>,
    /// Minor text.
    pub minor_non_compliant_text: Option<String>,
}

/// A persisted run-history row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunRecord {
    /// Run identifier.
    pub run_id: String,
    /// Job name.
    pub job_name: String,
    /// Final (or current) status.
    pub status: String,
    /// Summary message.
    pub message: Option<String>,
    /// Correlation id carried through logs.
    pub correlation_id: Option<String>,
    /// When the run started.
    pub started_at: DateTime<Utc>,
    /// When the run finished, once it has.
    pub completed_at: Option<DateTime<Utc>>,
}

/// The set of optional metadata columns present in this deployment's
/// `reports` table, probed once per run.
#[derive(Debug, Clone)]
pub struct MetadataColumns {
    available: BTreeSet<String>,
}

impl MetadataColumns {
    /// True when the named column exists.
    #[must_use]
    pub fn has(&self, column: &str) -> bool {
        self.available.contains(column)
    }
}

/// The domain state store.
pub struct StateStore {
    pool: SqlPool,
    clock: Arc<dyn Clock>,
    dry_run: bool,
}

impl StateStore {
    /// Opens the store at `path` with the standard pool size.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the database cannot be opened.
    pub fn open(
        path: impl AsRef<Path>,
        clock: Arc<dyn Clock>,
        dry_run: bool,
    ) -> Result<Self, StoreError> {
        Ok(Self {
            pool: SqlPool::open(path, POOL_SIZE)?,
            clock,
            dry_run,
        })
    }

    /// In-memory store for tests.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when initialisation fails.
    pub fn in_memory(clock: Arc<dyn Clock>) -> Result<Self, StoreError> {
        Ok(Self {
            pool: SqlPool::in_memory()?,
            clock,
            dry_run: false,
        })
    }

    /// Whether this store swallows mutations.
    #[must_use]
    pub const fn is_dry_run(&self) -> bool {
        self.dry_run
    }

    pub(crate) const fn pool(&self) -> &SqlPool {
        &self.pool
    }

    pub(crate) fn now(&self) -> DateTime<Utc> {
        self.clock.now_utc()
    }

    /// Runs `f` inside one per-item transaction.
    ///
    /// # Errors
    ///
    /// Propagates `f`'s error after rollback.
    pub fn with_tx<T>(
        &self,
        f: impl FnOnce(&Transaction<'_>) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        self.pool.with_transaction(f)
    }

    // ------------------------------------------------------------------
    // Watermark
    // ------------------------------------------------------------------

    /// Reads the watermark for a job. An absent row reads as the Unix
    /// epoch with `exists = false`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on query failure.
    pub fn get_watermark(&self, job_name: &str) -> Result<(DateTime<Utc>, bool), StoreError> {
        let instant: Option<String> = self.pool.with_connection(|conn| {
            Ok(conn
                .query_row(
                    "SELECT utc_instant FROM watermark WHERE job_name = ?1",
                    params![job_name],
                    |row| row.get(0),
                )
                .optional()?)
        })?;

        match instant {
            Some(raw) => Ok((decode_instant(&raw)?, true)),
            None => Ok((DateTime::UNIX_EPOCH, false)),
        }
    }

    /// Upserts the watermark for a job.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on write failure.
    pub fn upsert_watermark(
        &self,
        job_name: &str,
        instant: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        if self.dry_run {
            return Ok(());
        }
        let updated_at = encode_instant(self.now());
        self.pool.with_connection(|conn| {
            conn.execute(
                "INSERT INTO watermark (job_name, utc_instant, updated_at)
                 VALUES (?1, ?2, ?3)
                 ON CONFLICT(job_name) DO UPDATE SET
                    utc_instant = excluded.utc_instant,
                    updated_at = excluded.updated_at",
                params![job_name, encode_instant(instant), updated_at],
            )?;
            Ok(())
        })
    }

    // ------------------------------------------------------------------
    // Run history
    // ------------------------------------------------------------------

    /// Inserts the run-history row at run start.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on write failure.
    pub fn insert_run(
        &self,
        run_id: &str,
        job_name: &str,
        status: RunStatus,
        message: Option<&str>,
        correlation_id: &str,
    ) -> Result<(), StoreError> {
        if self.dry_run {
            return Ok(());
        }
        let started_at = encode_instant(self.now());
        self.pool.with_connection(|conn| {
            conn.execute(
                "INSERT INTO run_history (run_id, job_name, status, message, correlation_id, started_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    run_id,
                    job_name,
                    status.as_str(),
                    message.map(truncate_message),
                    correlation_id,
                    started_at
                ],
            )?;
            Ok(())
        })
    }

    /// Finalises a run-history row exactly once.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on write failure.
    pub fn finish_run(
        &self,
        run_id: &str,
        status: RunStatus,
        message: &str,
    ) -> Result<(), StoreError> {
        if self.dry_run {
            return Ok(());
        }
        let completed_at = encode_instant(self.now());
        self.pool.with_connection(|conn| {
            conn.execute(
                "UPDATE run_history
                 SET status = ?2, message = ?3, completed_at = ?4
                 WHERE run_id = ?1",
                params![run_id, status.as_str(), truncate_message(message), completed_at],
            )?;
            Ok(())
        })
    }

    /// Reads a run-history row.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on query failure.
    pub fn get_run(&self, run_id: &str) -> Result<Option<RunRecord>, StoreError> {
        self.pool.with_connection(|conn| {
            let record = conn
                .query_row(
                    "SELECT run_id, job_name, status, message, correlation_id, started_at, completed_at
                     FROM run_history WHERE run_id = ?1",
                    params![run_id],
                    |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, String>(2)?,
                            row.get::<_, Option<String>>(3)?,
                            row.get::<_, Option<String>>(4)?,
                            row.get::<_, String>(5)?,
                            row.get::<_, Option<String>>(6)?,
                        ))
                    },
                )
                .optional()?;

            match record {
                None => Ok(None),
                Some((run_id, job_name, status, message, correlation_id, started, completed)) => {
                    Ok(Some(RunRecord {
                        run_id,
                        job_name,
                        status,
                        message,
                        correlation_id,
                        started_at: decode_instant(&started)?,
                        completed_at: completed.as_deref().map(decode_instant).transpose()?,
                    }))
                },
            }
        })
    }

    // ------------------------------------------------------------------
    // Ledger
    // ------------------------------------------------------------------

    /// Attempts to acquire an item in the ledger. Duplicate keys are the
    /// designed idempotency signal, never an error.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on unexpected write failure.
    pub fn try_mark_processed(
        &self,
        tx: &Transaction<'_>,
        job_name: &str,
        item_key: &str,
        run_id: &str,
    ) -> Result<MarkOutcome, StoreError> {
        if self.dry_run {
            let exists: Option<i64> = tx
                .query_row(
                    "SELECT 1 FROM ledger WHERE job_name = ?1 AND item_key = ?2",
                    params![job_name, item_key],
                    |row| row.get(0),
                )
                .optional()?;
            return Ok(if exists.is_some() {
                MarkOutcome::AlreadyProcessed
            } else {
                MarkOutcome::Processed
            });
        }

        let changed = tx.execute(
            "INSERT OR IGNORE INTO ledger (job_name, item_key, run_id, processed_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![job_name, item_key, run_id, encode_instant(self.now())],
        )?;
        Ok(if changed == 1 {
            MarkOutcome::Processed
        } else {
            MarkOutcome::AlreadyProcessed
        })
    }

    /// Pool-scoped ledger check, used before spending a details call on a
    /// report that is already enriched.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on query failure.
    pub fn is_processed(&self, job_name: &str, item_key: &str) -> Result<bool, StoreError> {
        self.pool.with_connection(|conn| {
            let exists: Option<i64> = conn
                .query_row(
                    "SELECT 1 FROM ledger WHERE job_name = ?1 AND item_key = ?2",
                    params![job_name, item_key],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(exists.is_some())
        })
    }

    // ------------------------------------------------------------------
    // Reports
    // ------------------------------------------------------------------

    /// Inserts a report row. The ingest ledger gates duplicates, so a key
    /// collision here is a genuine item failure.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on write failure.
    pub fn insert_report(
        &self,
        tx: &Transaction<'_>,
        report: &NewReport<'_>,
    ) -> Result<(), StoreError> {
        if self.dry_run {
            return Ok(());
        }
        tx.execute(
            "INSERT INTO reports (report_id, completed_at, certification_number, ingest_run_id,
                                  rule_set_name, technology_type, assessment_type, template_name)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                report.report_id,
                encode_instant(report.completed_at),
                report.certification_number,
                report.ingest_run_id,
                report.metadata.rule_set_name,
                report.metadata.technology_type,
                report.metadata.assessment_type,
                report.metadata.template_name,
            ],
        )?;
        Ok(())
    }

    /// Sets the certificate only when the column is currently empty.
    /// Returns whether a row was updated.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on write failure.
    pub fn update_report_cert_if_empty(
        &self,
        tx: &Transaction<'_>,
        report_id: &str,
        certification_number: &str,
    ) -> Result<bool, StoreError> {
        if self.dry_run {
            return Ok(false);
        }
        let changed = tx.execute(
            "UPDATE reports SET certification_number = ?2
             WHERE report_id = ?1
               AND (certification_number IS NULL OR certification_number = '')",
            params![report_id, certification_number],
        )?;
        Ok(changed == 1)
    }

    /// Reads a report's certificate inside a transaction.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on query failure.
    pub fn report_certificate(
        &self,
        tx: &Transaction<'_>,
        report_id: &str,
    ) -> Result<Option<String>, StoreError> {
        let cert: Option<Option<String>> = tx
            .query_row(
                "SELECT certification_number FROM reports WHERE report_id = ?1",
                params![report_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(cert.flatten().filter(|c| !c.is_empty()))
    }

    /// Reads a report row.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on query failure.
    pub fn get_report(&self, report_id: &str) -> Result<Option<ReportRow>, StoreError> {
        self.pool.with_connection(|conn| {
            let row = conn
                .query_row(
                    "SELECT report_id, completed_at, certification_number, ingest_run_id
                     FROM reports WHERE report_id = ?1",
                    params![report_id],
                    |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, Option<String>>(2)?,
                            row.get::<_, String>(3)?,
                        ))
                    },
                )
                .optional()?;
            match row {
                None => Ok(None),
                Some((report_id, completed, certification_number, ingest_run_id)) => {
                    Ok(Some(ReportRow {
                        report_id,
                        completed_at: decode_instant(&completed)?,
                        certification_number,
                        ingest_run_id,
                    }))
                },
            }
        })
    }

    /// Probes the `reports` table once per run for the optional metadata
    /// columns this deployment actually has.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on query failure.
    pub fn probe_metadata_columns(&self) -> Result<MetadataColumns, StoreError> {
        self.pool.with_connection(|conn| {
            let mut stmt = conn.prepare("PRAGMA table_info(reports)")?;
            let present: BTreeSet<String> = stmt
                .query_map([], |row| row.get::<_, String>(1))?
                .collect::<Result<_, _>>()?;
            let available = OPTIONAL_METADATA_COLUMNS
                .iter()
                .filter(|col| present.contains(**col))
                .map(|col| (*col).to_string())
                .collect();
            Ok(MetadataColumns { available })
        })
    }

    /// Loads a report's resolver metadata, selecting only the columns the
    /// probe found.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on query failure.
    pub fn load_report_metadata(
        &self,
        report_id: &str,
        columns: &MetadataColumns,
    ) -> Result<ReportMetadata, StoreError> {
        let wanted: Vec<&str> = OPTIONAL_METADATA_COLUMNS
            .iter()
            .copied()
            .filter(|col| columns.has(col))
            .collect();
        if wanted.is_empty() {
            return Ok(ReportMetadata::default());
        }

        let sql = format!(
            "SELECT {} FROM reports WHERE report_id = ?1",
            wanted.join(", ")
        );
        self.pool.with_connection(|conn| {
            let values: Option<Vec<Option<String>>> = conn
                .query_row(&sql, params![report_id], |row| {
                    (0..wanted.len())
                        .map(|idx| row.get::<_, Option<String>>(idx))
                        .collect()
                })
                .optional()?;

            let Some(values) = values else {
                return Ok(ReportMetadata::default());
            };

            let mut metadata = ReportMetadata::default();
            for (column, value) in wanted.iter().zip(values) {
                let value = value.filter(|v| !v.is_empty());
                match *column {
                    "rule_set_name" => metadata.rule_set_name = value,
                    "technology_type" => metadata.technology_type = value,
                    "assessment_type" => metadata.assessment_type = value,
                    "template_name" => metadata.template_name = value,
                    _ => {},
                }
            }
            Ok(metadata)
        })
    }

    // ------------------------------------------------------------------
    // Answers
    // ------------------------------------------------------------------

    /// Inserts an answer unless the `(report, key)` pair already exists.
    /// Returns whether a row was inserted.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on write failure.
    pub fn insert_answer_if_absent(
        &self,
        tx: &Transaction<'_>,
        answer: &NewAnswer<'_>,
    ) -> Result<bool, StoreError> {
        if self.dry_run {
            return Ok(false);
        }
        let changed = tx.execute(
            "INSERT OR IGNORE INTO report_answers
                (report_id, question_key, answer_value, section, question_text, enrich_run_id)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                answer.report_id,
                answer.question_key,
                answer.answer_value,
                answer.section,
                answer.question_text,
                answer.enrich_run_id,
            ],
        )?;
        Ok(changed == 1)
    }

    /// Counts persisted answers for a report inside a transaction.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on query failure.
    pub fn count_answers(
        &self,
        tx: &Transaction<'_>,
        report_id: &str,
    ) -> Result<u64, StoreError> {
        let count: i64 = tx.query_row(
            "SELECT count(*) FROM report_answers WHERE report_id = ?1",
            params![report_id],
            |row| row.get(0),
        )?;
        Ok(count.max(0) as u64)
    }

    /// Loads a report's answers as `question_key -> answer_value`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on query failure.
    pub fn load_answers(
        &self,
        report_id: &str,
    ) -> Result<BTreeMap<String, Option<String>>, StoreError> {
        self.pool.with_connection(|conn| {
            let mut stmt = conn.prepare(
                "SELECT question_key, answer_value FROM report_answers WHERE report_id = ?1",
            )?;
            let answers = stmt
                .query_map(params![report_id], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, Option<String>>(1)?))
                })?
                .collect::<Result<BTreeMap<_, _>, _>>()?;
            Ok(answers)
        })
    }

    // ------------------------------------------------------------------
    // Findings and scores
    // ------------------------------------------------------------------

    /// Inserts a finding; on a duplicate key only the severity-specific
    /// text column is back-filled via coalesce.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on write failure.
    pub fn insert_finding_or_coalesce_text(
        &self,
        tx: &Transaction<'_>,
        finding: &NewFinding<'_>,
    ) -> Result<(), StoreError> {
        if self.dry_run {
            return Ok(());
        }
        let changed = tx.execute(
            "INSERT OR IGNORE INTO findings
                (report_id, rule_set_name, rule_set_version, question_key, answer_value,
                 severity, finding_code, major_non_compliant_text, minor_non_compliant_text,
                 score_run_id, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                finding.report_id,
                finding.rule_set.name,
                finding.rule_set.version,
                finding.question_key,
                finding.answer_value,
                finding.severity.as_str(),
                finding.finding_code,
                finding.major_non_compliant_text,
                finding.minor_non_compliant_text,
                finding.score_run_id,
                encode_instant(self.now()),
            ],
        )?;

        if changed == 0 {
            tx.execute(
                "UPDATE findings SET
                    major_non_compliant_text = COALESCE(major_non_compliant_text, ?5),
                    minor_non_compliant_text = COALESCE(minor_non_compliant_text, ?6)
                 WHERE report_id = ?1 AND rule_set_name = ?2 AND rule_set_version = ?3
                   AND question_key = ?4",
                params![
                    finding.report_id,
                    finding.rule_set.name,
                    finding.rule_set.version,
                    finding.question_key,
                    finding.major_non_compliant_text,
                    finding.minor_non_compliant_text,
                ],
            )?;
        }
        Ok(())
    }

    /// Upserts the score row: insert first time, overwrite counts, value,
    /// outcome, run id and instant on replays.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on write failure.
    pub fn upsert_score(
        &self,
        tx: &Transaction<'_>,
        score: &NewScore<'_>,
    ) -> Result<(), StoreError> {
        if self.dry_run {
            return Ok(());
        }
        tx.execute(
            "INSERT INTO scores
                (report_id, rule_set_name, rule_set_version, major_count, minor_count,
                 score_value, outcome, score_run_id, scored_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
             ON CONFLICT(report_id, rule_set_name, rule_set_version) DO UPDATE SET
                major_count = excluded.major_count,
                minor_count = excluded.minor_count,
                score_value = excluded.score_value,
                outcome = excluded.outcome,
                score_run_id = excluded.score_run_id,
                scored_at = excluded.scored_at",
            params![
                score.report_id,
                score.rule_set.name,
                score.rule_set.version,
                score.major_count,
                score.minor_count,
                score.score_value,
                score.outcome,
                score.score_run_id,
                encode_instant(self.now()),
            ],
        )?;
        Ok(())
    }

    /// Reads the score row for `(report, rule set)`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on query failure.
    pub fn get_score(
        &self,
        report_id: &str,
        rule_set: &RuleSetKey,
    ) -> Result<Option<ScoreRow>, StoreError> {
        self.pool.with_connection(|conn| {
            let row = conn
                .query_row(
                    "SELECT major_count, minor_count, score_value, outcome, score_run_id, scored_at
                     FROM scores
                     WHERE report_id = ?1 AND rule_set_name = ?2 AND rule_set_version = ?3",
                    params![report_id, rule_set.name, rule_set.version],
                    |row| {
                        Ok((
                            row.get::<_, i64>(0)?,
                            row.get::<_, i64>(1)?,
                            row.get::<_, Option<String>>(2)?,
                            row.get::<_, String>(3)?,
                            row.get::<_, String>(4)?,
                            row.get::<_, String>(5)?,
                        ))
                    },
                )
                .optional()?;
            match row {
                None => Ok(None),
                Some((major, minor, score_value, outcome, score_run_id, scored_at)) => {
                    Ok(Some(ScoreRow {
                        major_count: major.max(0) as u32,
                        minor_count: minor.max(0) as u32,
                        score_value,
                        outcome,
                        score_run_id,
                        scored_at: decode_instant(&scored_at)?,
                    }))
                },
            }
        })
    }

    /// Reads all findings for `(report, rule set)`, ordered by key.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on query failure.
    pub fn findings_for(
        &self,
        report_id: &str,
        rule_set: &RuleSetKey,
    ) -> Result<Vec<FindingRow>, StoreError> {
        self.pool.with_connection(|conn| {
            let mut stmt = conn.prepare(
                "SELECT question_key, answer_value, severity, finding_code,
                        major_non_compliant_text, minor_non_compliant_text
                 FROM findings
                 WHERE report_id = ?1 AND rule_set_name = ?2 AND rule_set_version = ?3
                 ORDER BY question_key",
            )?;
            let rows = stmt
                .query_map(params![report_id, rule_set.name, rule_set.version], |row| {
                    Ok(FindingRow {
                        question_key: row.get(0)?,
                        answer_value: row.get(1)?,
                        severity: row.get(2)?,
                        finding_code: row.get(3)?,
                        major_non_compliant_text: row.get(4)?,
                        minor_non_compliant_text: row.get(5)?,
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    // ------------------------------------------------------------------
    // External-domain lookups
    // ------------------------------------------------------------------

    /// Upserts an installation lookup row. The installer-sync job owns
    /// these tables in production; this exists for tests and backfill.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on write failure.
    pub fn upsert_installation(
        &self,
        certificate_number: &str,
        installer_id: &str,
    ) -> Result<(), StoreError> {
        self.pool.with_connection(|conn| {
            conn.execute(
                "INSERT INTO installation (certificate_number, installer_id)
                 VALUES (?1, ?2)
                 ON CONFLICT(certificate_number) DO UPDATE SET installer_id = excluded.installer_id",
                params![certificate_number, installer_id],
            )?;
            Ok(())
        })
    }

    /// Upserts an installer lookup row; see [`Self::upsert_installation`].
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on write failure.
    pub fn upsert_installer(
        &self,
        installer_id: &str,
        company_name: Option<&str>,
        contact_email: Option<&str>,
    ) -> Result<(), StoreError> {
        self.pool.with_connection(|conn| {
            conn.execute(
                "INSERT INTO installer (installer_id, company_name, contact_email)
                 VALUES (?1, ?2, ?3)
                 ON CONFLICT(installer_id) DO UPDATE SET
                    company_name = excluded.company_name,
                    contact_email = excluded.contact_email",
                params![installer_id, company_name, contact_email],
            )?;
            Ok(())
        })
    }
}

impl std::fmt::Debug for StateStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateStore")
            .field("pool", &self.pool)
            .field("dry_run", &self.dry_run)
            .finish_non_exhaustive()
    }
}

pub(crate) fn encode_instant(instant: DateTime<Utc>) -> String {
    instant.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn decode_instant(raw: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            StoreError::Database(rusqlite::Error::FromSqlConversionFailure(
                0,
                rusqlite::types::Type::Text,
                Box::new(e),
            ))
        })
}

fn truncate_message(message: &str) -> String {
    auditflow_core::payload::truncate_chars(message, MAX_RUN_MESSAGE_LEN)
}

#[cfg(test)]
mod tests {
    use auditflow_core::model::{JOB_INGESTION, JOB_SCORING};
    use auditflow_core::time::SystemClock;
    use chrono::TimeZone;

    use super::*;

    fn store() -> StateStore {
        StateStore::in_memory(Arc::new(SystemClock)).expect("failed to open store")
    }

    fn sample_instant() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 8, 1, 10, 0, 0).unwrap()
    }

    #[test]
    fn test_watermark_roundtrip() {
        let store = store();

        let (instant, exists) = store.get_watermark(JOB_INGESTION).expect("reads");
        assert!(!exists);
        assert_eq!(instant, DateTime::UNIX_EPOCH);

        store
            .upsert_watermark(JOB_INGESTION, sample_instant())
            .expect("writes");
        let (instant, exists) = store.get_watermark(JOB_INGESTION).expect("reads");
        assert!(exists);
        assert_eq!(instant, sample_instant());

        // Upsert overwrites.
        let later = sample_instant() + chrono::Duration::hours(1);
        store.upsert_watermark(JOB_INGESTION, later).expect("writes");
        let (instant, _) = store.get_watermark(JOB_INGESTION).expect("reads");
        assert_eq!(instant, later);
    }

    #[test]
    fn test_ledger_duplicate_is_not_an_error() {
        let store = store();

        let first = store
            .with_tx(|tx| store.try_mark_processed(tx, JOB_INGESTION, "R1", "run-1"))
            .expect("tx runs");
        assert_eq!(first, MarkOutcome::Processed);

        let second = store
            .with_tx(|tx| store.try_mark_processed(tx, JOB_INGESTION, "R1", "run-2"))
            .expect("tx runs");
        assert_eq!(second, MarkOutcome::AlreadyProcessed);

        assert!(store.is_processed(JOB_INGESTION, "R1").expect("reads"));
        assert!(!store.is_processed(JOB_SCORING, "R1").expect("reads"));
    }

    #[test]
    fn test_report_insert_and_cert_guard() {
        let store = store();
        let metadata = ReportMetadata::default();

        store
            .with_tx(|tx| {
                store.insert_report(
                    tx,
                    &NewReport {
                        report_id: "R1",
                        completed_at: sample_instant(),
                        certification_number: None,
                        ingest_run_id: "run-1",
                        metadata: &metadata,
                    },
                )
            })
            .expect("insert runs");

        let updated = store
            .with_tx(|tx| store.update_report_cert_if_empty(tx, "R1", "MCS-123"))
            .expect("update runs");
        assert!(updated);

        // A second enrich must not overwrite.
        let updated = store
            .with_tx(|tx| store.update_report_cert_if_empty(tx, "R1", "MCS-999"))
            .expect("update runs");
        assert!(!updated);

        let report = store.get_report("R1").expect("reads").expect("row exists");
        assert_eq!(report.certification_number.as_deref(), Some("MCS-123"));
    }

    #[test]
    fn test_answers_ignore_duplicates() {
        let store = store();

        let inserted = store
            .with_tx(|tx| {
                store.insert_answer_if_absent(
                    tx,
                    &NewAnswer {
                        report_id: "R1",
                        question_key: "7",
                        answer_value: Some("Bolt-on"),
                        section: Some("Roof"),
                        question_text: Some("Install type"),
                        enrich_run_id: "run-1",
                    },
                )
            })
            .expect("insert runs");
        assert!(inserted);

        let inserted = store
            .with_tx(|tx| {
                store.insert_answer_if_absent(
                    tx,
                    &NewAnswer {
                        report_id: "R1",
                        question_key: "7",
                        answer_value: Some("changed"),
                        section: None,
                        question_text: None,
                        enrich_run_id: "run-2",
                    },
                )
            })
            .expect("insert runs");
        assert!(!inserted, "duplicate keys are ignored");

        let answers = store.load_answers("R1").expect("reads");
        assert_eq!(answers.len(), 1);
        assert_eq!(
            answers.get("7").and_then(Option::as_deref),
            Some("Bolt-on"),
            "first write wins"
        );
    }

    #[test]
    fn test_finding_coalesce_backfills_only_null_text() {
        let store = store();
        let rule_set = RuleSetKey::new("PV", "v2");

        store
            .with_tx(|tx| {
                store.insert_finding_or_coalesce_text(
                    tx,
                    &NewFinding {
                        report_id: "R1",
                        rule_set: &rule_set,
                        question_key: "7",
                        answer_value: Some("Bolt-on"),
                        severity: Severity::Major,
                        finding_code: Some("PV-7-BO"),
                        major_non_compliant_text: None,
                        minor_non_compliant_text: None,
                        score_run_id: "run-1",
                    },
                )
            })
            .expect("insert runs");

        // Replay with text present: only the null column is back-filled.
        store
            .with_tx(|tx| {
                store.insert_finding_or_coalesce_text(
                    tx,
                    &NewFinding {
                        report_id: "R1",
                        rule_set: &rule_set,
                        question_key: "7",
                        answer_value: Some("different"),
                        severity: Severity::Major,
                        finding_code: Some("OTHER"),
                        major_non_compliant_text: Some("Installation must not be bolt-on."),
                        minor_non_compliant_text: None,
                        score_run_id: "run-2",
                    },
                )
            })
            .expect("insert runs");

        let findings = store.findings_for("R1", &rule_set).expect("reads");
        assert_eq!(findings.len(), 1);
        let finding = &findings[0];
        assert_eq!(
            finding.major_non_compliant_text.as_deref(),
            Some("Installation must not be bolt-on.")
        );
        assert_eq!(finding.answer_value.as_deref(), Some("Bolt-on"), "no other column mutates");
        assert_eq!(finding.finding_code.as_deref(), Some("PV-7-BO"));
    }

    #[test]
    fn test_score_upsert_overwrites() {
        let store = store();
        let rule_set = RuleSetKey::new("PV", "v2");

        store
            .with_tx(|tx| {
                store.upsert_score(
                    tx,
                    &NewScore {
                        report_id: "R1",
                        rule_set: &rule_set,
                        major_count: 1,
                        minor_count: 0,
                        score_value: Some("Fail"),
                        outcome: "Fail",
                        score_run_id: "run-1",
                    },
                )
            })
            .expect("upsert runs");

        store
            .with_tx(|tx| {
                store.upsert_score(
                    tx,
                    &NewScore {
                        report_id: "R1",
                        rule_set: &rule_set,
                        major_count: 0,
                        minor_count: 2,
                        score_value: Some("Pass"),
                        outcome: "Pass",
                        score_run_id: "run-2",
                    },
                )
            })
            .expect("upsert runs");

        let score = store
            .get_score("R1", &rule_set)
            .expect("reads")
            .expect("row exists");
        assert_eq!(score.major_count, 0);
        assert_eq!(score.minor_count, 2);
        assert_eq!(score.outcome, "Pass");
        assert_eq!(score.score_run_id, "run-2");
    }

    #[test]
    fn test_metadata_probe_and_load() {
        let store = store();
        let columns = store.probe_metadata_columns().expect("probe runs");
        assert!(columns.has("rule_set_name"));
        assert!(columns.has("template_name"));
        assert!(!columns.has("nonexistent"));

        let metadata = ReportMetadata {
            technology_type: Some("Solar PV".to_string()),
            ..ReportMetadata::default()
        };
        store
            .with_tx(|tx| {
                store.insert_report(
                    tx,
                    &NewReport {
                        report_id: "R1",
                        completed_at: sample_instant(),
                        certification_number: None,
                        ingest_run_id: "run-1",
                        metadata: &metadata,
                    },
                )
            })
            .expect("insert runs");

        let loaded = store
            .load_report_metadata("R1", &columns)
            .expect("loads");
        assert_eq!(loaded.technology_type.as_deref(), Some("Solar PV"));
        assert_eq!(loaded.rule_set_name, None);

        let absent = store
            .load_report_metadata("missing", &columns)
            .expect("loads");
        assert_eq!(absent, ReportMetadata::default());
    }

    #[test]
    fn test_run_history_lifecycle() {
        let store = store();

        store
            .insert_run("run-1", "pipeline", RunStatus::Running, None, "corr-1")
            .expect("insert runs");
        let record = store.get_run("run-1").expect("reads").expect("row exists");
        assert_eq!(record.status, "Running");
        assert!(record.completed_at.is_none());

        let long_message = "x".repeat(5_000);
        store
            .finish_run("run-1", RunStatus::Succeeded, &long_message)
            .expect("finish runs");
        let record = store.get_run("run-1").expect("reads").expect("row exists");
        assert_eq!(record.status, "Succeeded");
        assert!(record.completed_at.is_some());
        assert_eq!(
            record.message.map(|m| m.len()),
            Some(MAX_RUN_MESSAGE_LEN),
            "messages truncate to the column width"
        );
    }
}
