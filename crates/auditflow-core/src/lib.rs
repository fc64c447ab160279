//! # auditflow-core
//!
//! Core library for auditflow - a batch pipeline that ingests audit reports
//! from a remote provider, enriches them with per-question answers, and
//! scores them against versioned rule documents.
//!
//! This crate holds everything that is independent of the runner's I/O:
//!
//! - **Time & jitter**: injectable clock and randomness so retry schedules
//!   and watermark arithmetic are testable
//! - **Retry policy**: the typed exponential backoff schedule used for all
//!   remote calls
//! - **Payload extraction**: tolerant parsing of the provider's loosely
//!   typed summary and detail payloads
//! - **Rules**: rule document model, loader cache, pure evaluator, and the
//!   ruleset resolution heuristics
//!
//! ## Example
//!
//! ```rust
//! use std::collections::BTreeMap;
//!
//! use auditflow_core::rules::{RuleDocument, evaluate};
//!
//! # fn example(doc: &RuleDocument) -> Result<(), auditflow_core::rules::EvaluationError> {
//! let mut answers: BTreeMap<String, Option<String>> = BTreeMap::new();
//! answers.insert("7".to_string(), Some("Bolt-on".to_string()));
//! let evaluation = evaluate(doc, &answers)?;
//! println!("outcome: {}", evaluation.outcome);
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod model;
pub mod payload;
pub mod retry;
pub mod rules;
pub mod time;

pub use model::{RunStatus, Severity};
pub use retry::RetryPolicy;
pub use time::{Clock, JitterSource, SystemClock};
