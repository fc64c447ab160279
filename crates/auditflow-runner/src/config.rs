//! Runner configuration from the environment.
//!
//! All knobs come from environment variables; unrecognised variables are
//! ignored. `from_env` is called once at startup and the resulting
//! [`RunnerConfig`] is passed around immutably.

use std::path::PathBuf;

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use thiserror::Error;

/// Default bearer-token secret name.
pub const DEFAULT_BEARER_SECRET_NAME: &str = "goaudits-bearer-token";

/// Default summary endpoint.
pub const DEFAULT_SUMMARY_URL: &str = "https://api.goaudits.com/v1/auditlist/summary";

/// Default details endpoint.
pub const DEFAULT_DETAILS_URL: &str = "https://api.goaudits.com/v1/auditlist/details";

/// Default rule document directory.
pub const DEFAULT_RULESET_DIR: &str = "rulesets";

/// Default maximum items per run, before tie expansion.
pub const DEFAULT_BATCH_SIZE: usize = 50;

/// Errors raised while resolving configuration.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ConfigError {
    /// A required variable is absent.
    #[error("missing required environment variable {name}")]
    MissingVar {
        /// The variable name.
        name: &'static str,
    },

    /// A variable is present but unparseable.
    #[error("invalid value for {name}: {reason}")]
    InvalidVar {
        /// The variable name.
        name: &'static str,
        /// What went wrong.
        reason: String,
    },
}

/// Scope of the outbox materialisation step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MaterialiseScope {
    /// Every score without an outbox row.
    #[default]
    All,
    /// Only the reports touched by this run.
    Batch,
}

/// Fully resolved runner configuration.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Directory holding the database file.
    pub sql_host: PathBuf,
    /// Database name; the store opens `<sql_host>/<sql_db>.db`.
    pub sql_db: String,
    /// Secret file or directory consumed by the secret provider.
    pub secret_uri: PathBuf,
    /// Name of the bearer-token secret.
    pub bearer_secret_name: String,
    /// Remote summary endpoint.
    pub summary_url: String,
    /// Remote details endpoint.
    pub details_url: String,
    /// Rule document directory.
    pub ruleset_dir: PathBuf,
    /// Maximum items per run before tie expansion.
    pub batch_size: usize,
    /// Optional lower-bound override for item eligibility.
    pub start_override: Option<DateTime<Utc>>,
    /// Optional upper bound for item eligibility; end-of-day when the
    /// variable held a bare date.
    pub end_override: Option<DateTime<Utc>>,
    /// Raw ruleset version map override, if set.
    pub ruleset_map_json: Option<String>,
    /// Provider filter id sent with summary requests.
    pub summary_filter_id: i64,
    /// When set, no mutating SQL runs; counters are still computed.
    pub dry_run: bool,
    /// When set, enrich re-derives every question key and logs anomalies.
    pub validate_keys: bool,
    /// Whether to materialise the notification outbox.
    pub materialise_email: bool,
    /// Scope of the materialisation.
    pub materialise_scope: MaterialiseScope,
}

impl RunnerConfig {
    /// Resolves configuration from the process environment.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when a required variable is absent or a
    /// present variable fails to parse.
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            sql_host: PathBuf::from(required("SQL_HOST")?),
            sql_db: required("SQL_DB")?,
            secret_uri: PathBuf::from(strip_file_scheme(&required("SECRET_URI")?)),
            bearer_secret_name: optional("BEARER_SECRET_NAME")
                .unwrap_or_else(|| DEFAULT_BEARER_SECRET_NAME.to_string()),
            summary_url: optional("SUMMARY_URL")
                .unwrap_or_else(|| DEFAULT_SUMMARY_URL.to_string()),
            details_url: optional("DETAILS_URL")
                .unwrap_or_else(|| DEFAULT_DETAILS_URL.to_string()),
            ruleset_dir: PathBuf::from(
                optional("RULESET_DIR").unwrap_or_else(|| DEFAULT_RULESET_DIR.to_string()),
            ),
            batch_size: parse_var("BATCH_SIZE", DEFAULT_BATCH_SIZE)?,
            start_override: parse_instant("START_DATE", DayBoundary::Start)?,
            end_override: parse_instant("END_DATE", DayBoundary::End)?,
            ruleset_map_json: optional("RULESET_MAP_JSON"),
            summary_filter_id: parse_var("SUMMARY_FILTER_ID", 0)?,
            dry_run: parse_flag("DRYRUN"),
            validate_keys: parse_flag("VALIDATE_KEYS"),
            materialise_email: parse_flag("MATERIALISE_EMAIL"),
            materialise_scope: parse_scope()?,
        })
    }

    /// Path of the database file.
    #[must_use]
    pub fn db_path(&self) -> PathBuf {
        self.sql_host.join(format!("{}.db", self.sql_db))
    }
}

fn required(name: &'static str) -> Result<String, ConfigError> {
    optional(name).ok_or(ConfigError::MissingVar { name })
}

fn optional(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn strip_file_scheme(uri: &str) -> String {
    uri.strip_prefix("file://").unwrap_or(uri).to_string()
}

fn parse_var<T>(name: &'static str, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match optional(name) {
        None => Ok(default),
        Some(raw) => raw.parse().map_err(|e: T::Err| ConfigError::InvalidVar {
            name,
            reason: e.to_string(),
        }),
    }
}

fn parse_flag(name: &str) -> bool {
    optional(name)
        .is_some_and(|v| matches!(v.to_lowercase().as_str(), "1" | "true" | "yes"))
}

fn parse_scope() -> Result<MaterialiseScope, ConfigError> {
    match optional("MATERIALISE_SCOPE").as_deref() {
        None => Ok(MaterialiseScope::default()),
        Some(raw) => match raw.to_lowercase().as_str() {
            "all" => Ok(MaterialiseScope::All),
            "batch" => Ok(MaterialiseScope::Batch),
            other => Err(ConfigError::InvalidVar {
                name: "MATERIALISE_SCOPE",
                reason: format!("expected `all` or `batch`, got `{other}`"),
            }),
        },
    }
}

/// Which end of the day a bare date resolves to.
enum DayBoundary {
    Start,
    End,
}

fn parse_instant(
    name: &'static str,
    boundary: DayBoundary,
) -> Result<Option<DateTime<Utc>>, ConfigError> {
    let Some(raw) = optional(name) else {
        return Ok(None);
    };

    if let Ok(parsed) = DateTime::parse_from_rfc3339(&raw) {
        return Ok(Some(parsed.with_timezone(&Utc)));
    }
    if let Ok(parsed) = NaiveDateTime::parse_from_str(&raw, "%Y-%m-%dT%H:%M:%S") {
        return Ok(Some(parsed.and_utc()));
    }
    if let Ok(date) = NaiveDate::parse_from_str(&raw, "%Y-%m-%d") {
        let time = match boundary {
            DayBoundary::Start => date.and_hms_opt(0, 0, 0),
            DayBoundary::End => date.and_hms_opt(23, 59, 59),
        };
        return Ok(time.map(|t| t.and_utc()));
    }

    Err(ConfigError::InvalidVar {
        name,
        reason: format!("`{raw}` is not an ISO date or datetime"),
    })
}
