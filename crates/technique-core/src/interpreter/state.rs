//! Per-execution state store.
//!
//! Holds the shared execution state (seeded from the input, updated with
//! every usable primitive output), operator-private entries keyed by
//! operator id, and the engine's bookkeeping for outcomes and assembled
//! inputs. The whole store is serializable so checkpoints can snapshot it.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use technique_types::execution::StepStatus;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionState {
    /// Seed input, as supplied by the caller.
    #[serde(default)]
    pub input: Map<String, Value>,
    /// Shared state: seed input plus merged primitive outputs.
    #[serde(default)]
    pub shared: Map<String, Value>,
    /// Operator-private entries.
    #[serde(default)]
    pub operators: BTreeMap<String, Map<String, Value>>,
    /// Latest usable output per primitive.
    #[serde(default)]
    pub outputs: BTreeMap<String, Map<String, Value>>,
    /// Latest outcome per executed primitive.
    #[serde(default)]
    pub statuses: BTreeMap<String, StepStatus>,
    /// Primitives that were not run.
    #[serde(default)]
    pub skipped: BTreeSet<String>,
    /// Attempts made per primitive.
    #[serde(default)]
    pub attempts: BTreeMap<String, u32>,
    /// Values contributed by operators to a primitive's input.
    #[serde(default)]
    pub assembled: BTreeMap<String, Map<String, Value>>,
    /// Primitives in the order they completed.
    #[serde(default)]
    pub completed: Vec<String>,
}

impl ExecutionState {
    pub fn seeded(input: Map<String, Value>) -> Self {
        Self {
            shared: input.clone(),
            input,
            ..Self::default()
        }
    }

    /// Mutable operator-private entry, created empty on first access.
    pub fn operator_entry(&mut self, operator_id: &str) -> &mut Map<String, Value> {
        self.operators.entry(operator_id.to_string()).or_default()
    }

    /// Record a primitive outcome. Usable outputs merge into shared state.
    pub fn record_outcome(&mut self, primitive_id: &str, status: StepStatus, output: &Map<String, Value>) {
        self.statuses.insert(primitive_id.to_string(), status);
        self.skipped.remove(primitive_id);
        if status.is_usable() {
            self.outputs.insert(primitive_id.to_string(), output.clone());
            for (key, value) in output {
                self.shared.insert(key.clone(), value.clone());
            }
        }
        self.completed.retain(|p| p != primitive_id);
        self.completed.push(primitive_id.to_string());
    }

    pub fn mark_skipped(&mut self, primitive_id: &str) {
        self.skipped.insert(primitive_id.to_string());
    }

    pub fn is_failed(&self, primitive_id: &str) -> bool {
        self.statuses.get(primitive_id) == Some(&StepStatus::Failed)
    }

    pub fn is_skipped(&self, primitive_id: &str) -> bool {
        self.skipped.contains(primitive_id)
    }

    /// Merge operator-assembled values into a primitive's pending input.
    pub fn assemble(&mut self, primitive_id: &str, values: &Map<String, Value>) {
        let slot = self.assembled.entry(primitive_id.to_string()).or_default();
        for (key, value) in values {
            slot.insert(key.clone(), value.clone());
        }
    }

    /// Next attempt number for a primitive (1-based).
    pub fn next_attempt(&mut self, primitive_id: &str) -> u32 {
        let attempt = self.attempts.entry(primitive_id.to_string()).or_insert(0);
        *attempt += 1;
        *attempt
    }

    /// Read-only view for condition evaluation.
    pub fn condition_view(&self) -> Value {
        json!({
            "state": Value::Object(self.shared.clone()),
            "outputs": serde_json::to_value(&self.outputs).unwrap_or(Value::Null),
            "input": Value::Object(self.input.clone()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map(v: Value) -> Map<String, Value> {
        v.as_object().cloned().unwrap()
    }

    #[test]
    fn usable_outputs_merge_into_shared_state() {
        let mut state = ExecutionState::seeded(map(json!({"topic": "rust"})));
        state.record_outcome("a", StepStatus::Success, &map(json!({"score": 3})));
        state.record_outcome("b", StepStatus::Failed, &map(json!({"score": 99})));
        assert_eq!(state.shared["score"], 3);
        assert_eq!(state.shared["topic"], "rust");
        assert!(state.is_failed("b"));
        assert!(!state.outputs.contains_key("b"));
        assert_eq!(state.completed, vec!["a", "b"]);
    }

    #[test]
    fn operator_entry_is_created_on_demand() {
        let mut state = ExecutionState::default();
        state.operator_entry("op").insert("k".into(), json!(1));
        state.operator_entry("op").insert("j".into(), json!(2));
        assert_eq!(Value::Object(state.operators["op"].clone()), json!({"k": 1, "j": 2}));
    }

    #[test]
    fn condition_view_exposes_roots() {
        let mut state = ExecutionState::seeded(map(json!({"score": 7})));
        state.record_outcome("p1", StepStatus::Success, &map(json!({"ok": true})));
        let view = state.condition_view();
        assert_eq!(view["state"]["score"], 7);
        assert_eq!(view["outputs"]["p1"]["ok"], true);
        assert_eq!(view["input"]["score"], 7);
    }

    #[test]
    fn snapshot_round_trips() {
        let mut state = ExecutionState::seeded(map(json!({"x": 1})));
        state.mark_skipped("c");
        state.next_attempt("a");
        let value = serde_json::to_value(&state).unwrap();
        let restored: ExecutionState = serde_json::from_value(value).unwrap();
        assert_eq!(restored, state);
    }
}
