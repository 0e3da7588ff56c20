//! Rule matching: ordered trigger rules gated by a pluggable expression
//! evaluator and time-windowed occurrence throttles.

#![warn(clippy::unwrap_used)]

pub mod computed;
pub mod evaluator;
pub mod expression;
pub mod occurrence;

pub use evaluator::{MatchedRule, RuleEvaluator, RuleInput, RuleOutcome, UnmatchedRule, UnmatchedSource};
pub use expression::{ComparisonEvaluator, EvaluationContext, EvaluatorError, ExpressionEvaluator};
pub use occurrence::{InMemoryOccurrenceCounter, OccurrenceCounter, OccurrenceError};
