//! Condition grammar used by gates, conditionals, loops, and contracts.
//!
//! Expressions are parsed into an explicit AST (no dynamic evaluation) and
//! evaluated against a read-only JSON view whose roots are `state`,
//! `outputs`, `input`, and `output`. `ConditionEvaluator` never fails: a
//! malformed expression evaluates to `false` and the error is counted.

mod eval;
mod lexer;
mod parser;

pub use eval::{lookup, truthy};
pub use parser::{CompareOp, Expr, MAX_DEPTH, Operand, parse};

use serde_json::Value;

/// Number of error messages retained by an evaluator.
pub const MAX_RECORDED_ERRORS: usize = 20;

/// Errors raised while parsing a condition.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConditionError {
    #[error("empty condition")]
    Empty,

    #[error("condition is too long ({0} bytes)")]
    TooLong(usize),

    #[error("condition nests too deeply")]
    TooDeep,

    #[error("syntax error at {position}: {message}")]
    Syntax { position: usize, message: String },

    #[error("path segment '{0}' is not allowed")]
    ForbiddenPath(String),

    #[error("malformed clause '{0}': expected 'condition => target'")]
    MalformedClause(String),
}

impl ConditionError {
    pub fn code(&self) -> &'static str {
        match self {
            ConditionError::Empty => "condition_empty",
            ConditionError::TooLong(_) => "condition_too_long",
            ConditionError::TooDeep => "condition_too_deep",
            ConditionError::Syntax { .. } => "condition_syntax",
            ConditionError::ForbiddenPath(_) => "condition_forbidden_path",
            ConditionError::MalformedClause(_) => "condition_malformed_clause",
        }
    }
}

/// A routing clause: `condition => target`.
#[derive(Debug, Clone, PartialEq)]
pub struct Clause {
    pub condition: Expr,
    pub target: String,
}

/// Parse a `condition => target` clause.
pub fn parse_clause(source: &str) -> Result<Clause, ConditionError> {
    let Some((condition, target)) = source.rsplit_once("=>") else {
        return Err(ConditionError::MalformedClause(source.to_string()));
    };
    let target = target.trim();
    if target.is_empty() || target.chars().any(char::is_whitespace) {
        return Err(ConditionError::MalformedClause(source.to_string()));
    }
    Ok(Clause {
        condition: parse(condition)?,
        target: target.to_string(),
    })
}

// ---------------------------------------------------------------------------
// Evaluator
// ---------------------------------------------------------------------------

/// Fault-tolerant condition evaluator with bounded error bookkeeping.
#[derive(Debug, Default, Clone)]
pub struct ConditionEvaluator {
    error_count: usize,
    errors: Vec<String>,
}

impl ConditionEvaluator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Evaluate `source` against `view`; malformed input yields `false`.
    pub fn evaluate(&mut self, source: &str, view: &Value) -> bool {
        match parse(source) {
            Ok(expr) => eval::evaluate(&expr, view),
            Err(e) => {
                self.record(source, &e);
                false
            }
        }
    }

    /// Evaluate clauses in order and return the first matching target.
    pub fn first_match(&mut self, clauses: &[String], view: &Value) -> Option<String> {
        for source in clauses {
            match parse_clause(source) {
                Ok(clause) => {
                    if eval::evaluate(&clause.condition, view) {
                        return Some(clause.target);
                    }
                }
                Err(e) => self.record(source, &e),
            }
        }
        None
    }

    /// Total errors observed, including ones past the recording cap.
    pub fn error_count(&self) -> usize {
        self.error_count
    }

    /// The first `MAX_RECORDED_ERRORS` error messages.
    pub fn errors(&self) -> &[String] {
        &self.errors
    }

    fn record(&mut self, source: &str, error: &ConditionError) {
        self.error_count += 1;
        if self.errors.len() < MAX_RECORDED_ERRORS {
            self.errors.push(format!("{source}: {error}"));
        }
        tracing::debug!(code = error.code(), "condition rejected: {error}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn clause_parsing() {
        let clause = parse_clause("state.score > 5 => A").unwrap();
        assert_eq!(clause.target, "A");
        assert!(parse_clause("state.score > 5").is_err());
        assert!(parse_clause("state.score > 5 => ").is_err());
        assert!(parse_clause("x => two words").is_err());
    }

    #[test]
    fn first_match_routes_in_order() {
        let clauses = vec![
            "state.score > 8 => A".to_string(),
            "state.score > 5 => B".to_string(),
        ];
        let mut evaluator = ConditionEvaluator::new();
        assert_eq!(
            evaluator.first_match(&clauses, &json!({"state": {"score": 9}})).as_deref(),
            Some("A")
        );
        assert_eq!(
            evaluator.first_match(&clauses, &json!({"state": {"score": 6}})).as_deref(),
            Some("B")
        );
        assert_eq!(evaluator.first_match(&clauses, &json!({"state": {"score": 1}})), None);
        assert_eq!(evaluator.error_count(), 0);
    }

    #[test]
    fn malformed_input_is_false_and_counted() {
        let mut evaluator = ConditionEvaluator::new();
        let view = json!({});
        for _ in 0..25 {
            assert!(!evaluator.evaluate("(((", &view));
        }
        assert_eq!(evaluator.error_count(), 25);
        assert_eq!(evaluator.errors().len(), MAX_RECORDED_ERRORS);
    }

    #[test]
    fn malformed_clause_is_skipped() {
        let mut evaluator = ConditionEvaluator::new();
        let clauses = vec!["bogus clause".to_string(), "true => B".to_string()];
        assert_eq!(evaluator.first_match(&clauses, &json!({})).as_deref(), Some("B"));
        assert_eq!(evaluator.error_count(), 1);
    }
}
