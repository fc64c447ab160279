//! The three pipeline stages.
//!
//! Ingest runs sequentially before the worker pool starts; enrich and score
//! run per report inside the workers. Each stage performs its side effects
//! in a single per-item transaction and uses the ledger to stay idempotent
//! across replays.

pub mod enrich;
pub mod ingest;
pub mod score;
