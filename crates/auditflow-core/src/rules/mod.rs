//! Versioned rule documents and the scoring machinery built on them.
//!
//! A rule set is an immutable, named, versioned JSON document. The loader
//! caches parsed documents (and their eligibility key sets) for the process
//! lifetime; the evaluator is a pure function from document and answer map
//! to findings, counts, outcome and derived score value; the resolver
//! decides which rule set applies to a report.

mod document;
mod evaluator;
mod loader;
mod resolver;

pub use document::{
    AnswerNormalization, Condition, FindingSpec, OutcomeRule, OutcomeWhen, Rule, RuleDocument,
    RuleDocumentError, ScoreValueSpec, Scoring,
};
pub use evaluator::{EvaluatedFinding, Evaluation, EvaluationError, evaluate};
pub use loader::{LoadedRuleSet, RuleLoadError, RuleSetCache};
pub use resolver::{ResolverConfigError, RulesetResolver};
