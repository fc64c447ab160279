//! Ruleset resolution.
//!
//! Decides which `(name, version)` rule set applies to a report, in order:
//!
//! 1. heuristics over the report's metadata values,
//! 2. the same heuristics over the raw detail payload rows,
//! 3. overlap of the report's observed answer keys with each known rule
//!    set's eligibility keys (strictly greater count wins; ties stay
//!    unresolved).
//!
//! Unresolved reports are skipped by scoring with a structured reason.

use std::collections::{BTreeMap, BTreeSet};

use serde_json::Value;
use thiserror::Error;

use crate::model::{RuleSetKey, SkipReason};
use crate::payload::ReportMetadata;

/// Rule set name used for photovoltaic installations.
pub const RULESET_PV: &str = "PV";

/// Rule set name used for heat pump installations.
pub const RULESET_HEAT_PUMP: &str = "HeatPump";

/// Substrings that classify a metadata value as photovoltaic.
const PV_HINTS: [&str; 3] = ["pv", "photovoltaic", "solar"];

/// Substrings that classify a metadata value as heat pump.
const HEAT_PUMP_HINTS: [&str; 3] = ["heat pump", "heatpump", "hp"];

/// The version-map override string could not be parsed.
#[derive(Debug, Error)]
#[error("invalid ruleset map JSON: {source}")]
pub struct ResolverConfigError {
    #[source]
    source: serde_json::Error,
}

/// Resolves which rule set applies to a report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RulesetResolver {
    version_map: BTreeMap<String, String>,
}

impl Default for RulesetResolver {
    fn default() -> Self {
        let mut version_map = BTreeMap::new();
        version_map.insert(RULESET_PV.to_string(), "v2".to_string());
        version_map.insert(RULESET_HEAT_PUMP.to_string(), "v3".to_string());
        Self { version_map }
    }
}

impl RulesetResolver {
    /// Builds a resolver from a `{"name": "version"}` JSON override.
    ///
    /// # Errors
    ///
    /// Returns [`ResolverConfigError`] when the string is not a JSON object
    /// of strings.
    pub fn from_map_json(raw: &str) -> Result<Self, ResolverConfigError> {
        let version_map: BTreeMap<String, String> =
            serde_json::from_str(raw).map_err(|source| ResolverConfigError { source })?;
        Ok(Self { version_map })
    }

    /// The rule sets this resolver can resolve to.
    pub fn known_rule_sets(&self) -> impl Iterator<Item = RuleSetKey> + '_ {
        self.version_map
            .iter()
            .map(|(name, version)| RuleSetKey::new(name.clone(), version.clone()))
    }

    /// Looks up the configured version for a rule set name.
    #[must_use]
    pub fn version_for(&self, name: &str) -> Option<RuleSetKey> {
        self.version_map
            .get(name)
            .map(|version| RuleSetKey::new(name, version.clone()))
    }

    /// Full resolution over every source available for the report.
    ///
    /// `eligibility_by_name` carries each known rule set's eligibility key
    /// set (from the rule document cache); `observed_keys` are the report's
    /// persisted answer keys.
    ///
    /// # Errors
    ///
    /// Returns a [`SkipReason`] describing why no rule set applies.
    pub fn resolve(
        &self,
        metadata: &ReportMetadata,
        payload_rows: Option<&[Value]>,
        observed_keys: &BTreeSet<String>,
        eligibility_by_name: &BTreeMap<String, BTreeSet<String>>,
    ) -> Result<RuleSetKey, SkipReason> {
        if let Some(name) = Self::classify_values(metadata.values()) {
            return self.keyed(name, "report metadata");
        }

        if let Some(rows) = payload_rows {
            if let Some(name) = self.classify_payload(rows) {
                return self.keyed(name, "details payload");
            }
        }

        if let Some(name) = Self::resolve_by_overlap(observed_keys, eligibility_by_name) {
            return self.keyed(name, "question-key overlap");
        }

        Err(SkipReason::NoRuleSet {
            details: "metadata, payload and question-key overlap all inconclusive".to_string(),
        })
    }

    fn keyed(&self, name: &str, source: &str) -> Result<RuleSetKey, SkipReason> {
        self.version_for(name).ok_or_else(|| SkipReason::NoRuleSet {
            details: format!("{source} matched {name} but no version is configured"),
        })
    }

    /// Classifies a set of metadata values. PV hints are checked before
    /// heat pump hints.
    fn classify_values<'a>(values: impl IntoIterator<Item = &'a str>) -> Option<&'static str> {
        for value in values {
            let lowered = value.to_lowercase();
            if PV_HINTS.iter().any(|hint| lowered.contains(hint)) {
                return Some(RULESET_PV);
            }
            if HEAT_PUMP_HINTS.iter().any(|hint| lowered.contains(hint)) {
                return Some(RULESET_HEAT_PUMP);
            }
        }
        None
    }

    /// Scans detail payload rows for the same metadata-bearing keys the
    /// summary extraction recognises.
    fn classify_payload(&self, rows: &[Value]) -> Option<&'static str> {
        for row in rows {
            let Some(map) = row.as_object() else {
                continue;
            };
            let metadata = ReportMetadata::extract(map);
            if let Some(name) = Self::classify_values(metadata.values()) {
                return Some(name);
            }
        }
        None
    }

    /// Overlap fallback: the rule set whose eligibility keys intersect the
    /// observed keys strictly more than every other wins; a tie (including
    /// all-zero) stays unresolved.
    fn resolve_by_overlap<'a>(
        observed_keys: &BTreeSet<String>,
        eligibility_by_name: &'a BTreeMap<String, BTreeSet<String>>,
    ) -> Option<&'a str> {
        let mut best: Option<(&str, usize)> = None;
        let mut tied = false;

        for (name, eligibility) in eligibility_by_name {
            let overlap = eligibility.intersection(observed_keys).count();
            if overlap == 0 {
                continue;
            }
            match best {
                Some((_, best_count)) if overlap > best_count => {
                    best = Some((name, overlap));
                    tied = false;
                },
                Some((_, best_count)) if overlap == best_count => {
                    tied = true;
                },
                Some(_) => {},
                None => {
                    best = Some((name, overlap));
                },
            }
        }

        match (best, tied) {
            (Some((name, _)), false) => Some(name),
            _ => None,
        }
    }
}
