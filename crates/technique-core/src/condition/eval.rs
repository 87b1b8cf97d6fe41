//! Evaluation of parsed conditions against a read-only JSON view.

use std::cmp::Ordering;

use serde_json::Value;

use super::parser::{CompareOp, Expr, Operand};

/// Evaluate `expr` against `view`. Never fails.
pub fn evaluate(expr: &Expr, view: &Value) -> bool {
    match expr {
        Expr::Or(terms) => terms.iter().any(|t| evaluate(t, view)),
        Expr::And(terms) => terms.iter().all(|t| evaluate(t, view)),
        Expr::Not(inner) => !evaluate(inner, view),
        Expr::Truthy(operand) => truthy(&resolve(operand, view)),
        Expr::Compare { left, op, right } => {
            compare(&resolve(left, view), *op, &resolve(right, view))
        }
    }
}

/// Look up a dotted path. Objects are indexed by key, arrays by position.
pub fn lookup<'v>(view: &'v Value, segments: &[String]) -> Option<&'v Value> {
    let mut current = view;
    for segment in segments {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

fn resolve(operand: &Operand, view: &Value) -> Value {
    match operand {
        // Absent paths read as null.
        Operand::Path(segments) => lookup(view, segments).cloned().unwrap_or(Value::Null),
        Operand::Exists(segments) => Value::Bool(lookup(view, segments).is_some()),
        Operand::Literal(value) => value.clone(),
    }
}

/// JavaScript-style truthiness.
pub fn truthy(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Null => false,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0 && !f.is_nan()),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

fn compare(left: &Value, op: CompareOp, right: &Value) -> bool {
    let ordering = match (left, right) {
        (Value::Number(a), Value::Number(b)) => match (a.as_f64(), b.as_f64()) {
            (Some(a), Some(b)) => a.partial_cmp(&b),
            _ => None,
        },
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        _ => None,
    };

    match op {
        CompareOp::Eq => ordering.map_or_else(|| same_kind_equal(left, right), |o| o == Ordering::Equal),
        CompareOp::Ne => !ordering.map_or_else(|| same_kind_equal(left, right), |o| o == Ordering::Equal),
        CompareOp::Lt => ordering == Some(Ordering::Less),
        CompareOp::Le => matches!(ordering, Some(Ordering::Less | Ordering::Equal)),
        CompareOp::Gt => ordering == Some(Ordering::Greater),
        CompareOp::Ge => matches!(ordering, Some(Ordering::Greater | Ordering::Equal)),
    }
}

/// Equality for values without an ordering. Mismatched kinds are unequal.
fn same_kind_equal(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::Bool(a), Value::Bool(b)) => a == b,
        (Value::Null, Value::Null) => true,
        (Value::Array(_), Value::Array(_)) | (Value::Object(_), Value::Object(_)) => left == right,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::condition::parser::parse;
    use serde_json::json;

    fn eval(src: &str, view: &Value) -> bool {
        evaluate(&parse(src).unwrap(), view)
    }

    #[test]
    fn numeric_and_string_comparisons() {
        let view = json!({"state": {"score": 7, "name": "beta"}});
        assert!(eval("state.score > 5", &view));
        assert!(eval("state.score == 7", &view));
        assert!(!eval("state.score < 7", &view));
        assert!(eval("state.name >= 'alpha'", &view));
        assert!(eval("state.name != \"gamma\"", &view));
    }

    #[test]
    fn mismatched_types_are_unequal() {
        let view = json!({"state": {"score": "7", "flag": true}});
        assert!(!eval("state.score == 7", &view));
        assert!(eval("state.score != 7", &view));
        assert!(!eval("state.score > 1", &view));
        assert!(eval("state.flag == true", &view));
        assert!(!eval("state.flag > false", &view));
    }

    #[test]
    fn missing_paths_read_as_null() {
        let view = json!({"state": {}});
        assert!(eval("state.missing == null", &view));
        assert!(!eval("state.missing", &view));
        assert!(!eval("state.missing.exists", &view));
        assert!(eval("NOT state.missing.exists", &view));
    }

    #[test]
    fn exists_and_truthiness() {
        let view = json!({"outputs": {"p1": {"ok": false, "items": [1, 2]}}});
        assert!(eval("outputs.p1.exists", &view));
        assert!(eval("outputs.p1.ok.exists", &view));
        assert!(!eval("outputs.p1.ok", &view));
        assert!(eval("outputs.p1.items.1 == 2", &view));
        assert!(eval("outputs.p1.items", &view));
    }

    #[test]
    fn boolean_connectives() {
        let view = json!({"state": {"a": 1, "b": 0}});
        assert!(eval("state.a OR state.b", &view));
        assert!(!eval("state.a AND state.b", &view));
        assert!(eval("(state.a || state.b) && !state.b", &view));
    }
}
