//! Shared domain vocabulary.

use serde::{Deserialize, Serialize};

/// Ledger job name used by the ingest stage.
pub const JOB_INGESTION: &str = "GoAuditsIngestion";

/// Ledger job name used by the enrich stage.
pub const JOB_ENRICHMENT: &str = "GoAuditsEnrichment";

/// Ledger job name used by the score stage.
pub const JOB_SCORING: &str = "GoAuditsScoring";

/// Severity of a non-compliance finding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Severity {
    /// Major non-compliance.
    Major,
    /// Minor non-compliance.
    Minor,
}

impl Severity {
    /// Canonical string form as persisted in the findings table.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Major => "Major",
            Self::Minor => "Minor",
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle status of a pipeline run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunStatus {
    /// The run has started and not yet finished.
    Running,
    /// The run finished with its invariants intact.
    Succeeded,
    /// The run aborted; the watermark was not advanced past safe state.
    Failed,
}

impl RunStatus {
    /// Canonical string form as persisted in run history.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Running => "Running",
            Self::Succeeded => "Succeeded",
            Self::Failed => "Failed",
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of a versioned rule set.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RuleSetKey {
    /// Rule set name, e.g. `PV`.
    pub name: String,
    /// Rule set version, e.g. `v2`.
    pub version: String,
}

impl RuleSetKey {
    /// Creates a key from name and version.
    #[must_use]
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
        }
    }

    /// Ledger item key for scoring a report against this rule set:
    /// `reportId|name|version`.
    #[must_use]
    pub fn score_item_key(&self, report_id: &str) -> String {
        format!("{report_id}|{}|{}", self.name, self.version)
    }
}

impl std::fmt::Display for RuleSetKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.name, self.version)
    }
}

/// Why a report was skipped by the score stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    /// No persisted answers exist for the report.
    NoAnswers,
    /// No rule set could be resolved from metadata, payload or key overlap.
    NoRuleSet {
        /// Human-readable account of what was tried.
        details: String,
    },
    /// A rule set resolved but none of the report's answer keys appear in
    /// its eligibility set.
    NoEligibilityOverlap {
        /// The rule set that was resolved.
        rule_set: RuleSetKey,
    },
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NoAnswers => f.write_str("no persisted answers"),
            Self::NoRuleSet { details } => write!(f, "no rule set resolved: {details}"),
            Self::NoEligibilityOverlap { rule_set } => {
                write!(f, "no answer keys overlap rule set {rule_set}")
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_score_item_key_shape() {
        let key = RuleSetKey::new("PV", "v2");
        assert_eq!(key.score_item_key("R1"), "R1|PV|v2");
    }

    #[test]
    fn test_status_strings() {
        assert_eq!(RunStatus::Running.as_str(), "Running");
        assert_eq!(RunStatus::Succeeded.as_str(), "Succeeded");
        assert_eq!(RunStatus::Failed.as_str(), "Failed");
        assert_eq!(Severity::Major.as_str(), "Major");
        assert_eq!(Severity::Minor.as_str(), "Minor");
    }
}
