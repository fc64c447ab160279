//! # auditflow-runner
//!
//! The batch runner: one process executes one pipeline run (ingest → enrich
//! → score, plus optional notification-outbox materialisation) against the
//! state store and exits. External scheduling starts the next batch.
//!
//! The library surface exists so integration tests can drive the pipeline
//! with a stubbed remote API and a temporary store; the binary in `main.rs`
//! wires the production implementations together.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod api;
pub mod config;
pub mod http;
pub mod outbox;
pub mod pipeline;
pub mod secrets;
pub mod stages;
pub mod store;

pub use config::RunnerConfig;
pub use pipeline::Pipeline;
pub use store::StateStore;
