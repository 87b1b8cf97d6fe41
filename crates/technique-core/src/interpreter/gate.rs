//! `gate`: downstream work runs only when every condition holds.
//!
//! Gates synthesized from adequacy gaps carry `parameters.evidence_key`;
//! they pass once `state.evidence.<key>` is truthy. A gate with
//! `parameters.blocking = false` reports failure without stopping the run.

use serde_json::{Map, Value, json};
use technique_types::execution::ExecutionStep;

use super::{Decision, OperatorContext, OperatorInterpreter};
use crate::condition::truthy;

pub struct GateInterpreter;

impl OperatorInterpreter for GateInterpreter {
    fn after_execute(&self, _steps: &[ExecutionStep], ctx: &mut OperatorContext<'_>) -> Decision {
        let operator = ctx.operator;
        let mut failed: Vec<String> = operator
            .conditions
            .iter()
            .filter(|c| !ctx.holds(c))
            .cloned()
            .collect();

        if let Some(key) = operator.param_str("evidence_key") {
            let present = ctx
                .state
                .shared
                .get("evidence")
                .and_then(|e| e.get(key))
                .is_some_and(truthy);
            if !present {
                failed.push(format!("evidence '{key}' missing"));
            }
        }

        let passed = failed.is_empty();
        let private = ctx.private();
        private.insert("passed".to_string(), Value::Bool(passed));
        private.insert("unmet".to_string(), json!(failed));

        if passed {
            let mut outputs = Map::new();
            outputs.insert("gatePassed".to_string(), Value::Bool(true));
            return Decision::with_outputs(outputs);
        }

        let blocking = operator
            .parameters
            .get("blocking")
            .and_then(Value::as_bool)
            .unwrap_or(true);
        if !blocking {
            tracing::warn!(
                operator_id = operator.id.as_str(),
                unmet = ?failed,
                "non-blocking gate not satisfied"
            );
            let mut outputs = Map::new();
            outputs.insert("gatePassed".to_string(), Value::Bool(false));
            return Decision::with_outputs(outputs);
        }

        let mut reason = format!("gate '{}' not satisfied: {}", operator.id, failed.join("; "));
        if let Some(commands) = operator.parameters.get("evidence_commands").and_then(Value::as_array) {
            let commands: Vec<&str> = commands.iter().filter_map(Value::as_str).collect();
            if !commands.is_empty() {
                reason.push_str(&format!(" (gather evidence with: {})", commands.join(", ")));
            }
        }
        Decision::terminate(reason)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interpreter::testing::{Harness, outputs};
    use technique_types::composition::{Operator, OperatorType};

    fn gate(conditions: &[&str]) -> Operator {
        Operator::new("g", OperatorType::Gate)
            .with_outputs(&["next"])
            .with_conditions(conditions)
    }

    #[test]
    fn passes_when_all_conditions_hold() {
        let mut h = Harness::new(gate(&["state.score > 3", "state.ready"]))
            .with_shared(json!({"score": 5, "ready": true}));
        assert_eq!(outputs(&h.after(&GateInterpreter, &[])), json!({"gatePassed": true}));
    }

    #[test]
    fn blocks_when_any_condition_fails() {
        let mut h = Harness::new(gate(&["state.score > 3", "state.ready"]))
            .with_shared(json!({"score": 5, "ready": false}));
        let decision = h.after(&GateInterpreter, &[]);
        assert!(matches!(decision, Decision::Terminate { reason } if reason.contains("state.ready")));
    }

    #[test]
    fn evidence_key_gates_on_supplied_evidence() {
        let op = gate(&[])
            .with_parameter("evidence_key", json!("bench"))
            .with_parameter("evidence_commands", json!(["cargo bench"]));
        let mut h = Harness::new(op.clone());
        let decision = h.after(&GateInterpreter, &[]);
        assert!(matches!(decision, Decision::Terminate { reason } if reason.contains("cargo bench")));

        let mut h = Harness::new(op).with_shared(json!({"evidence": {"bench": true}}));
        assert_eq!(outputs(&h.after(&GateInterpreter, &[])), json!({"gatePassed": true}));
    }

    #[test]
    fn non_blocking_gate_continues() {
        let op = gate(&["state.missing"]).with_parameter("blocking", json!(false));
        let mut h = Harness::new(op);
        assert_eq!(outputs(&h.after(&GateInterpreter, &[])), json!({"gatePassed": false}));
    }
}
