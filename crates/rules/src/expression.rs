//! Expression evaluator contract and the variable context handed to it.
//!
//! The evaluator is pluggable. [`ComparisonEvaluator`] is a small built-in
//! implementation for hosts without a full expression engine: it accepts
//! comparisons joined by `&&` and `||` (`&&` binds tighter), e.g.
//! `user.level >= 3 && params.source == "onboarding" || device.platform == "ios"`.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use paywall_core::types::{DeviceAttributes, EventData};
use paywall_core::PassableValue;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum EvaluatorError {
    #[error("cannot parse expression `{expression}`: {reason}")]
    Parse { expression: String, reason: String },

    #[error("expression did not produce a boolean: {0}")]
    NonBoolean(String),

    #[error("evaluator unavailable: {0}")]
    Unavailable(String),
}

/// Variables visible to a rule expression: `user`, `device` and `params`.
#[derive(Debug, Clone, Default)]
pub struct EvaluationContext {
    variables: HashMap<String, PassableValue>,
}

impl EvaluationContext {
    pub fn build(
        event: &EventData,
        device: &DeviceAttributes,
        user: &HashMap<String, PassableValue>,
        computed: HashMap<String, PassableValue>,
    ) -> Self {
        let mut device_map = device.extra.clone();
        device_map.insert("locale".into(), device.locale.clone().into());
        device_map.insert("app_version".into(), device.app_version.clone().into());
        device_map.insert("platform".into(), device.platform.clone().into());
        device_map.extend(computed);

        let mut params = event.parameters.clone();
        params.insert("$event_name".into(), event.name.clone().into());

        let mut variables = HashMap::new();
        variables.insert("user".to_string(), PassableValue::Map(user.clone()));
        variables.insert("device".to_string(), PassableValue::Map(device_map));
        variables.insert("params".to_string(), PassableValue::Map(params));
        Self { variables }
    }

    /// Resolves a dotted path such as `device.daysSince_app_open`.
    pub fn lookup(&self, path: &str) -> Option<&PassableValue> {
        let (root, rest) = match path.split_once('.') {
            Some((root, rest)) => (root, Some(rest)),
            None => (path, None),
        };
        let value = self.variables.get(root)?;
        match rest {
            Some(rest) => value.get_path(rest),
            None => Some(value),
        }
    }
}

#[async_trait]
pub trait ExpressionEvaluator: Send + Sync {
    async fn evaluate(
        &self,
        expression: &str,
        context: &EvaluationContext,
    ) -> Result<bool, EvaluatorError>;
}

// ─── Built-in comparison evaluator ──────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Operator {
    Eq,
    NotEq,
    Gte,
    Lte,
    Gt,
    Lt,
}

// Two-character operators first so `>=` isn't read as `>`.
const OPERATORS: [(&str, Operator); 6] = [
    ("==", Operator::Eq),
    ("!=", Operator::NotEq),
    (">=", Operator::Gte),
    ("<=", Operator::Lte),
    (">", Operator::Gt),
    ("<", Operator::Lt),
];

#[derive(Debug, Clone, Default)]
pub struct ComparisonEvaluator;

impl ComparisonEvaluator {
    pub fn new() -> Self {
        Self
    }

    pub fn shared() -> Arc<dyn ExpressionEvaluator> {
        Arc::new(Self)
    }

    fn evaluate_sync(
        &self,
        expression: &str,
        context: &EvaluationContext,
    ) -> Result<bool, EvaluatorError> {
        let mut any = false;
        for disjunct in split_unquoted(expression, "||") {
            let mut all = true;
            for clause in split_unquoted(disjunct, "&&") {
                if !self.evaluate_clause(expression, clause.trim(), context)? {
                    all = false;
                }
            }
            any |= all;
        }
        Ok(any)
    }

    fn evaluate_clause(
        &self,
        expression: &str,
        clause: &str,
        context: &EvaluationContext,
    ) -> Result<bool, EvaluatorError> {
        if clause.is_empty() {
            return Err(parse_error(expression, "empty clause"));
        }
        match clause {
            "true" => return Ok(true),
            "false" => return Ok(false),
            _ => {}
        }

        let Some((index, token, operator)) = find_operator(clause) else {
            // Bare variable (or `!variable`) is a truthiness check.
            let (negate, path) = match clause.strip_prefix('!') {
                Some(path) => (true, path.trim()),
                None => (false, clause),
            };
            let truthy = match context.lookup(path) {
                Some(PassableValue::Bool(b)) => *b,
                Some(PassableValue::Null) | None => false,
                Some(_) => true,
            };
            return Ok(truthy != negate);
        };

        let path = clause[..index].trim();
        let literal = clause[index + token.len()..].trim();
        if path.is_empty() || literal.is_empty() {
            return Err(parse_error(expression, "comparison is missing an operand"));
        }
        let expected = parse_literal(literal)
            .ok_or_else(|| parse_error(expression, &format!("invalid literal `{literal}`")))?;
        let actual = context.lookup(path).cloned().unwrap_or(PassableValue::Null);
        Ok(compare(&actual, operator, &expected))
    }
}

#[async_trait]
impl ExpressionEvaluator for ComparisonEvaluator {
    async fn evaluate(
        &self,
        expression: &str,
        context: &EvaluationContext,
    ) -> Result<bool, EvaluatorError> {
        self.evaluate_sync(expression, context)
    }
}

fn parse_error(expression: &str, reason: &str) -> EvaluatorError {
    EvaluatorError::Parse {
        expression: expression.to_string(),
        reason: reason.to_string(),
    }
}

/// Splits on `separator` wherever it appears outside a quoted literal.
fn split_unquoted<'a>(input: &'a str, separator: &str) -> Vec<&'a str> {
    let mut parts = Vec::new();
    let mut quote: Option<char> = None;
    let mut start = 0;
    let mut chars = input.char_indices();
    while let Some((index, c)) = chars.next() {
        match quote {
            Some(open) if c == open => quote = None,
            Some(_) => {}
            None if c == '"' || c == '\'' => quote = Some(c),
            None if input[index..].starts_with(separator) => {
                parts.push(&input[start..index]);
                start = index + separator.len();
                // Separators are ASCII, so skipping bytes skips chars.
                for _ in 1..separator.len() {
                    chars.next();
                }
            }
            None => {}
        }
    }
    parts.push(&input[start..]);
    parts
}

fn find_operator(clause: &str) -> Option<(usize, &'static str, Operator)> {
    OPERATORS
        .iter()
        .filter_map(|(token, op)| clause.find(token).map(|idx| (idx, *token, *op)))
        .min_by_key(|(idx, token, _)| (*idx, std::cmp::Reverse(token.len())))
}

fn parse_literal(literal: &str) -> Option<PassableValue> {
    match literal {
        "true" => return Some(PassableValue::Bool(true)),
        "false" => return Some(PassableValue::Bool(false)),
        "null" => return Some(PassableValue::Null),
        _ => {}
    }
    for quote in ['"', '\''] {
        if literal.len() >= 2 && literal.starts_with(quote) && literal.ends_with(quote) {
            return Some(PassableValue::String(literal[1..literal.len() - 1].to_string()));
        }
    }
    if let Ok(i) = literal.parse::<i64>() {
        return Some(PassableValue::Int(i));
    }
    literal.parse::<f64>().ok().map(PassableValue::Float)
}

fn compare(actual: &PassableValue, operator: Operator, expected: &PassableValue) -> bool {
    let numeric = actual
        .as_f64()
        .zip(expected.as_f64())
        .and_then(|(a, e)| a.partial_cmp(&e));
    match operator {
        Operator::Eq => match numeric {
            Some(ordering) => ordering == std::cmp::Ordering::Equal,
            None => actual == expected,
        },
        Operator::NotEq => match numeric {
            Some(ordering) => ordering != std::cmp::Ordering::Equal,
            None => actual != expected,
        },
        Operator::Gt => numeric == Some(std::cmp::Ordering::Greater),
        Operator::Gte => matches!(
            numeric,
            Some(std::cmp::Ordering::Greater | std::cmp::Ordering::Equal)
        ),
        Operator::Lt => numeric == Some(std::cmp::Ordering::Less),
        Operator::Lte => matches!(
            numeric,
            Some(std::cmp::Ordering::Less | std::cmp::Ordering::Equal)
        ),
    }
}
