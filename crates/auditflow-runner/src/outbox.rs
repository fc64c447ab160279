//! Notification outbox materialisation.
//!
//! Derives pending outbox rows from scored reports joined with the
//! installation and installer lookups. Presence is keyed on
//! `(report_id, rule_set_name, rule_set_version)` via a `NOT EXISTS`
//! sub-query, which is what makes the step idempotent; rows with no
//! resolvable recipient are still inserted and counted so the gap is
//! visible downstream.

use std::collections::BTreeMap;

use auditflow_core::model::RuleSetKey;
use rusqlite::{Connection, params};
use tracing::{debug, info};

use crate::store::{StateStore, StoreError};

/// Which scores the materialisation considers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboxScope {
    /// Every score without an outbox row.
    All,
    /// Only scores for the given report ids, via a temp table.
    Batch(Vec<String>),
}

/// Counters returned by one materialisation pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OutboxCounts {
    /// Rows inserted (or that would have been, in dry-run).
    pub inserted: u64,
    /// Scores that already had an outbox row.
    pub skipped_already_exists: u64,
    /// Inserted rows with no resolvable recipient email.
    pub missing_recipient: u64,
}

/// A persisted outbox row, for tests and operational inspection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboxRow {
    /// Report the notification is about.
    pub report_id: String,
    /// Rule set name.
    pub rule_set_name: String,
    /// Rule set version.
    pub rule_set_version: String,
    /// Certificate number copied from the report.
    pub certificate_number: Option<String>,
    /// Recipient resolved through the installer lookup.
    pub recipient_email: Option<String>,
    /// Installer company name.
    pub company_name: Option<String>,
    /// Notification template.
    pub template_name: String,
    /// Delivery status; always `Pending` at materialisation.
    pub status: String,
    /// Delivery attempts so far.
    pub attempt_count: u32,
}

/// Default template for a rule set: `<name-kebab>-outcome-<version>`.
#[must_use]
pub fn default_template_name(rule_set: &RuleSetKey) -> String {
    format!("{}-outcome-{}", kebab_case(&rule_set.name), rule_set.version)
}

fn kebab_case(name: &str) -> String {
    let mut out = String::with_capacity(name.len() + 4);
    let mut prev_lower = false;
    for ch in name.chars() {
        if ch.is_ascii_uppercase() {
            if prev_lower {
                out.push('-');
            }
            out.push(ch.to_ascii_lowercase());
            prev_lower = false;
        } else {
            out.push(ch);
            prev_lower = ch.is_ascii_lowercase() || ch.is_ascii_digit();
        }
    }
    out
}

/// One candidate row produced by the join.
struct Candidate {
    report_id: String,
    rule_set: RuleSetKey,
    certificate_number: Option<String>,
    recipient_email: Option<String>,
    company_name: Option<String>,
}

/// Materialises pending outbox rows for the given scope.
///
/// Returns `(inserted, skippedAlreadyExists, missingRecipient)`. In
/// dry-run mode the counts are computed but nothing is written.
///
/// # Errors
///
/// Returns [`StoreError`] on query or write failure.
pub fn materialise(
    store: &StateStore,
    scope: &OutboxScope,
    templates: &BTreeMap<RuleSetKey, String>,
) -> Result<OutboxCounts, StoreError> {
    let slot = store.pool().connection();
    let mut guard = slot.lock().expect("sql connection lock poisoned");
    let tx = guard.transaction()?;

    if let OutboxScope::Batch(report_ids) = scope {
        tx.execute_batch(
            "CREATE TEMP TABLE IF NOT EXISTS outbox_batch_ids (report_id TEXT PRIMARY KEY);
             DELETE FROM outbox_batch_ids;",
        )?;
        let mut insert = tx.prepare("INSERT OR IGNORE INTO outbox_batch_ids (report_id) VALUES (?1)")?;
        for report_id in report_ids {
            insert.execute(params![report_id])?;
        }
        drop(insert);
    }

    let scope_filter = match scope {
        OutboxScope::All => "",
        OutboxScope::Batch(_) => {
            " AND s.report_id IN (SELECT report_id FROM outbox_batch_ids)"
        },
    };

    let total_in_scope: i64 = tx.query_row(
        &format!("SELECT count(*) FROM scores s WHERE 1=1{scope_filter}"),
        [],
        |row| row.get(0),
    )?;

    let candidates = {
        let mut stmt = tx.prepare(&format!(
            "SELECT s.report_id, s.rule_set_name, s.rule_set_version,
                    r.certification_number, ins.contact_email, ins.company_name
             FROM scores s
             JOIN reports r ON r.report_id = s.report_id
             LEFT JOIN installation inst ON inst.certificate_number = r.certification_number
             LEFT JOIN installer ins ON ins.installer_id = inst.installer_id
             WHERE NOT EXISTS (
                 SELECT 1 FROM outbox o
                 WHERE o.report_id = s.report_id
                   AND o.rule_set_name = s.rule_set_name
                   AND o.rule_set_version = s.rule_set_version
             ){scope_filter}
             ORDER BY s.report_id, s.rule_set_name, s.rule_set_version"
        ))?;
        let rows = stmt
            .query_map([], |row| {
                Ok(Candidate {
                    report_id: row.get(0)?,
                    rule_set: RuleSetKey::new(
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                    ),
                    certificate_number: row.get(3)?,
                    recipient_email: row.get(4)?,
                    company_name: row.get(5)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        rows
    };

    let mut counts = OutboxCounts {
        inserted: 0,
        skipped_already_exists: (total_in_scope.max(0) as u64)
            .saturating_sub(candidates.len() as u64),
        missing_recipient: 0,
    };

    let created_at = crate::store::encode_instant(store.now());
    for candidate in &candidates {
        if candidate.recipient_email.is_none() {
            counts.missing_recipient += 1;
        }
        counts.inserted += 1;

        if store.is_dry_run() {
            continue;
        }

        let template_name = templates
            .get(&candidate.rule_set)
            .cloned()
            .unwrap_or_else(|| default_template_name(&candidate.rule_set));

        tx.execute(
            "INSERT INTO outbox
                (report_id, rule_set_name, rule_set_version, certificate_number,
                 recipient_email, company_name, template_name, status, attempt_count, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 'Pending', 0, ?8)",
            params![
                candidate.report_id,
                candidate.rule_set.name,
                candidate.rule_set.version,
                candidate.certificate_number,
                candidate.recipient_email,
                candidate.company_name,
                template_name,
                created_at,
            ],
        )?;
        debug!(
            report_id = %candidate.report_id,
            rule_set = %candidate.rule_set,
            template = %template_name,
            "outbox row materialised"
        );
    }

    tx.commit()?;
    info!(
        inserted = counts.inserted,
        skipped = counts.skipped_already_exists,
        missing_recipient = counts.missing_recipient,
        "outbox materialisation complete"
    );
    Ok(counts)
}

/// Reads every outbox row, ordered by insertion.
///
/// # Errors
///
/// Returns [`StoreError`] on query failure.
pub fn outbox_entries(store: &StateStore) -> Result<Vec<OutboxRow>, StoreError> {
    let slot = store.pool().connection();
    let guard = slot.lock().expect("sql connection lock poisoned");
    read_entries(&guard)
}

fn read_entries(conn: &Connection) -> Result<Vec<OutboxRow>, StoreError> {
    let mut stmt = conn.prepare(
        "SELECT report_id, rule_set_name, rule_set_version, certificate_number,
                recipient_email, company_name, template_name, status, attempt_count
         FROM outbox ORDER BY outbox_id",
    )?;
    let rows = stmt
        .query_map([], |row| {
            Ok(OutboxRow {
                report_id: row.get(0)?,
                rule_set_name: row.get(1)?,
                rule_set_version: row.get(2)?,
                certificate_number: row.get(3)?,
                recipient_email: row.get(4)?,
                company_name: row.get(5)?,
                template_name: row.get(6)?,
                status: row.get(7)?,
                attempt_count: row.get::<_, i64>(8)?.max(0) as u32,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}
