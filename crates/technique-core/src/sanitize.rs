//! Disallowed-key validation for externally supplied maps.
//!
//! Any map that crosses a trust boundary (seed input, replay snapshots,
//! primitive outputs merged by operators, condition paths) is checked for
//! keys that are structural-pollution vectors in downstream consumers:
//! prototype keys, accessor definitions, and symbol-style keys.

use serde_json::{Map, Value};

/// Keys that are rejected outright.
const FORBIDDEN_KEYS: [&str; 3] = ["__proto__", "constructor", "prototype"];

/// Accessor definition keys.
const ACCESSOR_KEYS: [&str; 4] = [
    "__definegetter__",
    "__definesetter__",
    "__lookupgetter__",
    "__lookupsetter__",
];

/// Maximum nesting depth walked before a value is rejected.
pub const MAX_VALIDATION_DEPTH: usize = 128;

/// Why a key is disallowed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyViolation {
    /// A prototype key or a lookalike of one.
    Forbidden,
    /// An accessor/getter/setter definition.
    Accessor,
    /// A symbol-style key (`Symbol(...)`, `@@name`).
    Symbol,
    /// Nesting exceeds `MAX_VALIDATION_DEPTH`.
    TooDeep,
}

/// A disallowed key found inside a value, with its dotted path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyFinding {
    pub path: String,
    pub violation: KeyViolation,
}

/// Classify a single key. Returns `None` for acceptable keys.
pub fn classify_key(key: &str) -> Option<KeyViolation> {
    let trimmed = key.trim();
    let lowered = trimmed.to_ascii_lowercase();

    if FORBIDDEN_KEYS.contains(&lowered.as_str()) || lowered.contains("__proto__") {
        return Some(KeyViolation::Forbidden);
    }
    // Lookalikes: `_proto_`, `___proto___`, `proto__` and friends.
    let stripped = lowered.trim_matches('_');
    if stripped == "proto" && lowered != stripped {
        return Some(KeyViolation::Forbidden);
    }

    if ACCESSOR_KEYS.contains(&lowered.as_str())
        || lowered.starts_with("get:")
        || lowered.starts_with("set:")
        || lowered.starts_with("get ")
        || lowered.starts_with("set ")
    {
        return Some(KeyViolation::Accessor);
    }

    if trimmed.starts_with("Symbol(") || trimmed.starts_with("@@") {
        return Some(KeyViolation::Symbol);
    }

    None
}

/// Whether a key is disallowed for any reason.
pub fn is_disallowed_key(key: &str) -> bool {
    classify_key(key).is_some()
}

/// Walk a value and return the first disallowed key, if any.
///
/// Nested objects and objects inside arrays are inspected. The walk is
/// iterative, so hostile nesting cannot overflow the stack.
pub fn find_disallowed_key(value: &Value) -> Option<KeyFinding> {
    let mut stack: Vec<(&Value, String, usize)> = vec![(value, String::new(), 0)];

    while let Some((current, path, depth)) = stack.pop() {
        if depth > MAX_VALIDATION_DEPTH {
            return Some(KeyFinding {
                path,
                violation: KeyViolation::TooDeep,
            });
        }
        match current {
            Value::Object(map) => {
                for (key, child) in map {
                    let child_path = join_path(&path, key);
                    if let Some(violation) = classify_key(key) {
                        return Some(KeyFinding {
                            path: child_path,
                            violation,
                        });
                    }
                    stack.push((child, child_path, depth + 1));
                }
            }
            Value::Array(items) => {
                for (i, child) in items.iter().enumerate() {
                    stack.push((child, join_path(&path, &i.to_string()), depth + 1));
                }
            }
            _ => {}
        }
    }

    None
}

/// Copy a map, dropping disallowed keys at every level.
///
/// Returns the cleaned map and the dotted paths of dropped keys.
pub fn strip_disallowed(map: &Map<String, Value>) -> (Map<String, Value>, Vec<String>) {
    let mut dropped = Vec::new();
    let cleaned = strip_map(map, "", 0, &mut dropped);
    (cleaned, dropped)
}

fn strip_map(
    map: &Map<String, Value>,
    prefix: &str,
    depth: usize,
    dropped: &mut Vec<String>,
) -> Map<String, Value> {
    let mut out = Map::new();
    for (key, value) in map {
        let path = join_path(prefix, key);
        if is_disallowed_key(key) || depth > MAX_VALIDATION_DEPTH {
            dropped.push(path);
            continue;
        }
        out.insert(key.clone(), strip_value(value, &path, depth + 1, dropped));
    }
    out
}

fn strip_value(value: &Value, path: &str, depth: usize, dropped: &mut Vec<String>) -> Value {
    match value {
        Value::Object(map) => Value::Object(strip_map(map, path, depth, dropped)),
        Value::Array(items) => Value::Array(
            items
                .iter()
                .enumerate()
                .map(|(i, v)| strip_value(v, &join_path(path, &i.to_string()), depth + 1, dropped))
                .collect(),
        ),
        other => other.clone(),
    }
}

fn join_path(prefix: &str, key: &str) -> String {
    if prefix.is_empty() {
        key.to_string()
    } else {
        format!("{prefix}.{key}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn classifies_prototype_keys_and_lookalikes() {
        assert_eq!(classify_key("__proto__"), Some(KeyViolation::Forbidden));
        assert_eq!(classify_key("__PROTO__"), Some(KeyViolation::Forbidden));
        assert_eq!(classify_key(" __proto__ "), Some(KeyViolation::Forbidden));
        assert_eq!(classify_key("_proto_"), Some(KeyViolation::Forbidden));
        assert_eq!(classify_key("constructor"), Some(KeyViolation::Forbidden));
        assert_eq!(classify_key("Prototype"), Some(KeyViolation::Forbidden));
        assert_eq!(classify_key("proto"), None);
        assert_eq!(classify_key("score"), None);
    }

    #[test]
    fn classifies_accessor_and_symbol_keys() {
        assert_eq!(classify_key("__defineGetter__"), Some(KeyViolation::Accessor));
        assert_eq!(classify_key("get:value"), Some(KeyViolation::Accessor));
        assert_eq!(classify_key("set total"), Some(KeyViolation::Accessor));
        assert_eq!(classify_key("Symbol(iterator)"), Some(KeyViolation::Symbol));
        assert_eq!(classify_key("@@toStringTag"), Some(KeyViolation::Symbol));
        assert_eq!(classify_key("getter"), None);
    }

    #[test]
    fn finds_nested_keys_inside_arrays() {
        let value = json!({"a": {"b": [{"ok": 1}, {"__proto__": {"polluted": true}}]}});
        let finding = find_disallowed_key(&value).unwrap();
        assert_eq!(finding.violation, KeyViolation::Forbidden);
        assert_eq!(finding.path, "a.b.1.__proto__");
    }

    #[test]
    fn clean_values_pass() {
        let value = json!({"topic": "rust", "nested": {"items": [1, 2, {"x": "y"}]}});
        assert!(find_disallowed_key(&value).is_none());
    }

    #[test]
    fn strip_drops_keys_and_reports_paths() {
        let map = json!({"keep": 1, "constructor": 2, "inner": {"Symbol(x)": 3, "ok": 4}});
        let (cleaned, dropped) = strip_disallowed(map.as_object().unwrap());
        assert_eq!(Value::Object(cleaned), json!({"keep": 1, "inner": {"ok": 4}}));
        assert_eq!(dropped.len(), 2);
        assert!(dropped.contains(&"inner.Symbol(x)".to_string()));
    }
}
