//! Composition model: primitives, operators, relationships.
//!
//! A `Composition` is authored externally and treated as read-only input by
//! both the plan compiler and the execution engine. It references primitives
//! by id; the primitive bodies (intent, contract) are supplied separately.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

// ---------------------------------------------------------------------------
// Primitive
// ---------------------------------------------------------------------------

/// The smallest unit of work, with a declared input/output contract.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Primitive {
    /// Stable primitive ID referenced by compositions.
    pub id: String,
    /// Human-readable name.
    pub name: String,
    /// What the primitive is meant to accomplish.
    #[serde(default)]
    pub intent: String,
    /// Input fields that must be present before the executor is invoked.
    #[serde(default)]
    pub inputs_required: Vec<String>,
    /// Output fields the primitive is expected to produce.
    #[serde(default)]
    pub outputs: Vec<String>,
    /// Optional typed contract checked around execution.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contract: Option<PrimitiveContract>,
}

impl Primitive {
    /// Create a primitive with no contract.
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            intent: String::new(),
            inputs_required: Vec::new(),
            outputs: Vec::new(),
            contract: None,
        }
    }

    pub fn with_intent(mut self, intent: impl Into<String>) -> Self {
        self.intent = intent.into();
        self
    }

    pub fn with_inputs(mut self, inputs: &[&str]) -> Self {
        self.inputs_required = inputs.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn with_outputs(mut self, outputs: &[&str]) -> Self {
        self.outputs = outputs.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn with_contract(mut self, contract: PrimitiveContract) -> Self {
        self.contract = Some(contract);
        self
    }
}

/// Typed input/output schema with pre- and postconditions.
///
/// Conditions use the composition condition grammar and are evaluated
/// against `input.*` (preconditions) or `input.*` and `output.*`
/// (postconditions).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PrimitiveContract {
    #[serde(default)]
    pub input_types: BTreeMap<String, ValueType>,
    #[serde(default)]
    pub output_types: BTreeMap<String, ValueType>,
    #[serde(default)]
    pub preconditions: Vec<String>,
    #[serde(default)]
    pub postconditions: Vec<String>,
}

/// JSON value type used by primitive contracts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueType {
    String,
    Number,
    Integer,
    Boolean,
    Object,
    Array,
    Null,
    Any,
}

impl ValueType {
    /// Whether `value` conforms to this type.
    pub fn matches(&self, value: &Value) -> bool {
        match self {
            ValueType::String => value.is_string(),
            ValueType::Number => value.is_number(),
            ValueType::Integer => value.is_i64() || value.is_u64(),
            ValueType::Boolean => value.is_boolean(),
            ValueType::Object => value.is_object(),
            ValueType::Array => value.is_array(),
            ValueType::Null => value.is_null(),
            ValueType::Any => true,
        }
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ValueType::String => "string",
            ValueType::Number => "number",
            ValueType::Integer => "integer",
            ValueType::Boolean => "boolean",
            ValueType::Object => "object",
            ValueType::Array => "array",
            ValueType::Null => "null",
            ValueType::Any => "any",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// Operator
// ---------------------------------------------------------------------------

/// The closed set of built-in operator types plus namespaced custom types.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum OperatorType {
    Sequence,
    Parallel,
    Fanout,
    Fanin,
    Reduce,
    Gate,
    Conditional,
    Loop,
    Retry,
    Backoff,
    Quorum,
    Consensus,
    Timebox,
    BudgetCap,
    CircuitBreaker,
    Cache,
    Replay,
    Monitor,
    /// A `namespace:identifier` type registered at runtime.
    Custom(String),
}

impl OperatorType {
    /// All built-in operator types, in registry order.
    pub const BUILTIN: [OperatorType; 18] = [
        OperatorType::Sequence,
        OperatorType::Parallel,
        OperatorType::Fanout,
        OperatorType::Fanin,
        OperatorType::Reduce,
        OperatorType::Gate,
        OperatorType::Conditional,
        OperatorType::Loop,
        OperatorType::Retry,
        OperatorType::Backoff,
        OperatorType::Quorum,
        OperatorType::Consensus,
        OperatorType::Timebox,
        OperatorType::BudgetCap,
        OperatorType::CircuitBreaker,
        OperatorType::Cache,
        OperatorType::Replay,
        OperatorType::Monitor,
    ];

    pub fn as_str(&self) -> &str {
        match self {
            OperatorType::Sequence => "sequence",
            OperatorType::Parallel => "parallel",
            OperatorType::Fanout => "fanout",
            OperatorType::Fanin => "fanin",
            OperatorType::Reduce => "reduce",
            OperatorType::Gate => "gate",
            OperatorType::Conditional => "conditional",
            OperatorType::Loop => "loop",
            OperatorType::Retry => "retry",
            OperatorType::Backoff => "backoff",
            OperatorType::Quorum => "quorum",
            OperatorType::Consensus => "consensus",
            OperatorType::Timebox => "timebox",
            OperatorType::BudgetCap => "budget_cap",
            OperatorType::CircuitBreaker => "circuit_breaker",
            OperatorType::Cache => "cache",
            OperatorType::Replay => "replay",
            OperatorType::Monitor => "monitor",
            OperatorType::Custom(name) => name.as_str(),
        }
    }

    pub fn is_custom(&self) -> bool {
        matches!(self, OperatorType::Custom(_))
    }
}

impl fmt::Display for OperatorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OperatorType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(builtin) = OperatorType::BUILTIN.iter().find(|t| t.as_str() == s) {
            return Ok(builtin.clone());
        }
        if s.contains(':') {
            return Ok(OperatorType::Custom(s.to_string()));
        }
        Err(format!("unknown operator type: '{s}'"))
    }
}

impl TryFrom<String> for OperatorType {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<OperatorType> for String {
    fn from(value: OperatorType) -> Self {
        value.as_str().to_string()
    }
}

/// A control-flow node wiring primitives together.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operator {
    pub id: String,
    #[serde(rename = "type")]
    pub operator_type: OperatorType,
    /// Primitive or operator IDs feeding this operator.
    #[serde(default)]
    pub inputs: Vec<String>,
    /// Primitive or operator IDs this operator feeds.
    #[serde(default)]
    pub outputs: Vec<String>,
    /// Condition expressions (grammar depends on the operator type).
    #[serde(default)]
    pub conditions: Vec<String>,
    /// Operator-specific parameters.
    #[serde(default)]
    pub parameters: Map<String, Value>,
}

impl Operator {
    pub fn new(id: impl Into<String>, operator_type: OperatorType) -> Self {
        Self {
            id: id.into(),
            operator_type,
            inputs: Vec::new(),
            outputs: Vec::new(),
            conditions: Vec::new(),
            parameters: Map::new(),
        }
    }

    pub fn with_inputs(mut self, inputs: &[&str]) -> Self {
        self.inputs = inputs.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn with_outputs(mut self, outputs: &[&str]) -> Self {
        self.outputs = outputs.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn with_conditions(mut self, conditions: &[&str]) -> Self {
        self.conditions = conditions.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn with_parameter(mut self, key: &str, value: Value) -> Self {
        self.parameters.insert(key.to_string(), value);
        self
    }

    /// Read a numeric parameter, accepting any JSON number.
    pub fn param_f64(&self, key: &str) -> Option<f64> {
        self.parameters.get(key).and_then(Value::as_f64)
    }

    /// Read a non-negative integer parameter.
    pub fn param_u64(&self, key: &str) -> Option<u64> {
        self.parameters.get(key).and_then(|v| {
            v.as_u64()
                .or_else(|| v.as_f64().filter(|f| f.is_finite() && *f >= 0.0).map(|f| f as u64))
        })
    }

    pub fn param_str(&self, key: &str) -> Option<&str> {
        self.parameters.get(key).and_then(Value::as_str)
    }

    /// Every ID this operator references, inputs first.
    pub fn referenced_ids(&self) -> impl Iterator<Item = &String> {
        self.inputs.iter().chain(self.outputs.iter())
    }
}

// ---------------------------------------------------------------------------
// Relationship
// ---------------------------------------------------------------------------

/// Explicit dependency declaration independent of operators.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Relationship {
    pub from_id: String,
    pub to_id: String,
    #[serde(rename = "type", default)]
    pub relationship_type: RelationshipType,
}

impl Relationship {
    pub fn depends_on(from_id: impl Into<String>, to_id: impl Into<String>) -> Self {
        Self {
            from_id: from_id.into(),
            to_id: to_id.into(),
            relationship_type: RelationshipType::DependsOn,
        }
    }
}

/// Kind of explicit relationship. Every kind orders `from_id` before `to_id`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelationshipType {
    #[default]
    DependsOn,
    Enables,
    Validates,
}

// ---------------------------------------------------------------------------
// Composition
// ---------------------------------------------------------------------------

/// Graph versions below this value use legacy plan compilation.
pub const CURRENT_GRAPH_VERSION: u32 = 2;

fn default_graph_version() -> u32 {
    CURRENT_GRAPH_VERSION
}

/// A named graph of primitives, operators, and relationships.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Composition {
    pub id: String,
    #[serde(default)]
    pub name: String,
    /// Primitive IDs in declaration order. Must be unique.
    pub primitive_ids: Vec<String>,
    #[serde(default)]
    pub operators: Vec<Operator>,
    #[serde(default)]
    pub relationships: Vec<Relationship>,
    /// Compatibility switch for legacy edge-operator compilation.
    #[serde(default = "default_graph_version")]
    pub graph_version: u32,
}

impl Composition {
    pub fn new(id: impl Into<String>, primitive_ids: &[&str]) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            primitive_ids: primitive_ids.iter().map(|s| s.to_string()).collect(),
            operators: Vec::new(),
            relationships: Vec::new(),
            graph_version: CURRENT_GRAPH_VERSION,
        }
    }

    pub fn with_operator(mut self, operator: Operator) -> Self {
        self.operators.push(operator);
        self
    }

    pub fn with_relationship(mut self, relationship: Relationship) -> Self {
        self.relationships.push(relationship);
        self
    }

    pub fn with_graph_version(mut self, graph_version: u32) -> Self {
        self.graph_version = graph_version;
        self
    }

    pub fn is_legacy_graph(&self) -> bool {
        self.graph_version < CURRENT_GRAPH_VERSION
    }

    pub fn has_primitive(&self, id: &str) -> bool {
        self.primitive_ids.iter().any(|p| p == id)
    }

    pub fn operator(&self, id: &str) -> Option<&Operator> {
        self.operators.iter().find(|o| o.id == id)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn operator_type_round_trips_through_strings() {
        for t in OperatorType::BUILTIN.iter() {
            let parsed: OperatorType = t.as_str().parse().unwrap();
            assert_eq!(&parsed, t);
        }
        let custom: OperatorType = "acme:score".parse().unwrap();
        assert_eq!(custom, OperatorType::Custom("acme:score".to_string()));
        assert!("bogus".parse::<OperatorType>().is_err());
    }

    #[test]
    fn composition_deserializes_with_defaults() {
        let value = json!({
            "id": "c1",
            "primitive_ids": ["a", "b"],
            "operators": [
                {"id": "op1", "type": "sequence", "inputs": ["a", "b"]}
            ]
        });
        let comp: Composition = serde_json::from_value(value).unwrap();
        assert_eq!(comp.graph_version, CURRENT_GRAPH_VERSION);
        assert_eq!(comp.operators[0].operator_type, OperatorType::Sequence);
        assert!(comp.relationships.is_empty());
        assert!(!comp.is_legacy_graph());
    }

    #[test]
    fn unknown_operator_type_fails_deserialization() {
        let value = json!({"id": "op", "type": "teleport"});
        assert!(serde_json::from_value::<Operator>(value).is_err());
    }

    #[test]
    fn value_type_matching() {
        assert!(ValueType::Integer.matches(&json!(3)));
        assert!(!ValueType::Integer.matches(&json!(3.5)));
        assert!(ValueType::Number.matches(&json!(3.5)));
        assert!(ValueType::Any.matches(&json!(null)));
        assert!(!ValueType::Object.matches(&json!([])));
    }

    #[test]
    fn param_u64_accepts_float_and_rejects_negative() {
        let op = Operator::new("r", OperatorType::Retry)
            .with_parameter("max_retries", json!(3.0))
            .with_parameter("neg", json!(-2));
        assert_eq!(op.param_u64("max_retries"), Some(3));
        assert_eq!(op.param_u64("neg"), None);
    }
}
