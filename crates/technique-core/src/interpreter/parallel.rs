//! `parallel` and `fanin`: merge the outputs of concurrently run primitives.
//!
//! Collision strategies (`parameters.collision_strategy`):
//! `flatten` (default) gathers colliding values into an array, `namespace`
//! prefixes every key with its primitive id, `reject`/`terminate` stop on
//! the first collision. Non-ASCII and disallowed keys are dropped and listed
//! under [`SKIPPED_KEYS_FIELD`].

use std::collections::HashSet;

use serde_json::{Map, Value, json};
use technique_types::execution::ExecutionStep;

use super::{Decision, OperatorContext, OperatorInterpreter, latest_steps};
use crate::sanitize::is_disallowed_key;

/// Output field listing dropped keys as `primitive:key`.
pub const SKIPPED_KEYS_FIELD: &str = "__parallel_skipped_keys";

/// Collisions tracked before the merge gives up and checkpoints.
pub const MAX_TRACKED_COLLISIONS: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CollisionStrategy {
    Flatten,
    Namespace,
    Reject,
    Terminate,
}

impl CollisionStrategy {
    fn from_param(value: Option<&str>) -> Self {
        match value {
            None | Some("flatten") => CollisionStrategy::Flatten,
            Some("namespace") => CollisionStrategy::Namespace,
            Some("reject") => CollisionStrategy::Reject,
            Some("terminate") => CollisionStrategy::Terminate,
            Some(other) => {
                tracing::warn!(strategy = other, "unknown collision strategy, using flatten");
                CollisionStrategy::Flatten
            }
        }
    }
}

pub struct ParallelInterpreter;

impl OperatorInterpreter for ParallelInterpreter {
    fn after_execute(&self, steps: &[ExecutionStep], ctx: &mut OperatorContext<'_>) -> Decision {
        let strategy = CollisionStrategy::from_param(ctx.operator.param_str("collision_strategy"));
        let usable: Vec<&ExecutionStep> = latest_steps(steps, ctx.governed)
            .into_iter()
            .filter(|s| s.status.is_usable())
            .collect();

        let mut merged = Map::new();
        let mut collided: HashSet<String> = HashSet::new();
        let mut collisions = 0usize;
        let mut skipped_keys: Vec<Value> = Vec::new();

        for (idx, step) in usable.iter().enumerate() {
            let pid = &step.primitive_id;
            for (key, value) in &step.output {
                if !key.is_ascii() || is_disallowed_key(key) {
                    skipped_keys.push(Value::String(format!("{pid}:{key}")));
                    continue;
                }
                if strategy == CollisionStrategy::Namespace {
                    merged.insert(format!("{pid}.{key}"), value.clone());
                    continue;
                }
                let Some(existing) = merged.get_mut(key) else {
                    merged.insert(key.clone(), value.clone());
                    continue;
                };
                match strategy {
                    CollisionStrategy::Reject => {
                        return Decision::terminate(format!("output key '{key}' collides (rejected)"));
                    }
                    CollisionStrategy::Terminate => {
                        return Decision::terminate(format!("output key '{key}' collides"));
                    }
                    _ => {}
                }

                collisions += 1;
                if collisions > MAX_TRACKED_COLLISIONS {
                    let raw: Map<String, Value> = usable
                        .iter()
                        .map(|s| (s.primitive_id.clone(), Value::Object(s.output.clone())))
                        .collect();
                    let remaining: Vec<&str> =
                        usable[idx..].iter().map(|s| s.primitive_id.as_str()).collect();
                    tracing::warn!(
                        operator_id = ctx.operator.id.as_str(),
                        collisions,
                        "collision bookkeeping limit reached"
                    );
                    return Decision::Checkpoint {
                        state: json!({
                            "rawOutputs": raw,
                            "partial": merged,
                            "remaining": remaining,
                        }),
                        terminate: true,
                    };
                }

                if collided.contains(key) {
                    if let Value::Array(items) = existing {
                        items.push(value.clone());
                    }
                } else {
                    let first = existing.take();
                    *existing = Value::Array(vec![first, value.clone()]);
                    collided.insert(key.clone());
                }
            }
        }

        if !skipped_keys.is_empty() {
            merged.insert(SKIPPED_KEYS_FIELD.to_string(), Value::Array(skipped_keys));
        }

        let mut collided: Vec<String> = collided.into_iter().collect();
        collided.sort();
        let private = ctx.private();
        private.insert("merged".to_string(), Value::Object(merged.clone()));
        private.insert("collisions".to_string(), json!(collided));

        Decision::with_outputs(merged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interpreter::testing::{Harness, outputs, step};
    use technique_types::composition::{Operator, OperatorType};
    use technique_types::execution::StepStatus;

    fn harness(strategy: Option<&str>) -> Harness {
        let mut op = Operator::new("par", OperatorType::Parallel).with_inputs(&["a", "b"]);
        if let Some(s) = strategy {
            op = op.with_parameter("collision_strategy", json!(s));
        }
        Harness::new(op)
    }

    fn steps() -> Vec<ExecutionStep> {
        vec![
            step("a", StepStatus::Success, json!({"value": 1, "only_a": true})),
            step("b", StepStatus::Success, json!({"value": 2})),
        ]
    }

    #[test]
    fn flatten_gathers_collisions_into_arrays() {
        let mut h = harness(None);
        let out = outputs(&h.after(&ParallelInterpreter, &steps()));
        assert_eq!(out["value"], json!([1, 2]));
        assert_eq!(out["only_a"], json!(true));
        assert_eq!(h.state.operators["par"]["collisions"], json!(["value"]));
    }

    #[test]
    fn flatten_appends_third_value() {
        let mut h = Harness::new(Operator::new("par", OperatorType::Fanin).with_inputs(&["a", "b", "c"]));
        let mut all = steps();
        all.push(step("c", StepStatus::Success, json!({"value": 3})));
        let out = outputs(&h.after(&ParallelInterpreter, &all));
        assert_eq!(out["value"], json!([1, 2, 3]));
    }

    #[test]
    fn namespace_prefixes_keys() {
        let mut h = harness(Some("namespace"));
        let out = outputs(&h.after(&ParallelInterpreter, &steps()));
        assert_eq!(out["a.value"], json!(1));
        assert_eq!(out["b.value"], json!(2));
        assert!(out.get("value").is_none());
    }

    #[test]
    fn reject_stops_on_collision() {
        let mut h = harness(Some("reject"));
        assert!(matches!(h.after(&ParallelInterpreter, &steps()), Decision::Terminate { .. }));
        let mut h = harness(Some("terminate"));
        assert!(matches!(h.after(&ParallelInterpreter, &steps()), Decision::Terminate { .. }));
    }

    #[test]
    fn unsafe_keys_are_dropped_and_listed() {
        let mut h = harness(None);
        let all = vec![
            step("a", StepStatus::Success, json!({"__proto__": {"x": 1}, "ok": 1})),
            step("b", StepStatus::Success, json!({"naïve": 2})),
        ];
        let out = outputs(&h.after(&ParallelInterpreter, &all));
        assert_eq!(out[SKIPPED_KEYS_FIELD], json!(["a:__proto__", "b:naïve"]));
        assert_eq!(out["ok"], json!(1));
    }

    #[test]
    fn failed_steps_do_not_contribute() {
        let mut h = harness(None);
        let all = vec![
            step("a", StepStatus::Success, json!({"value": 1})),
            step("b", StepStatus::Failed, json!({"value": 2})),
        ];
        let out = outputs(&h.after(&ParallelInterpreter, &all));
        assert_eq!(out["value"], json!(1));
    }

    #[test]
    fn collision_overflow_checkpoints_and_terminates() {
        let mut h = harness(None);
        let many: Map<String, Value> = (0..=MAX_TRACKED_COLLISIONS)
            .map(|i| (format!("k{i}"), json!(i)))
            .collect();
        let all = vec![
            step("a", StepStatus::Success, Value::Object(many.clone())),
            step("b", StepStatus::Success, Value::Object(many)),
        ];
        match h.after(&ParallelInterpreter, &all) {
            Decision::Checkpoint { state, terminate } => {
                assert!(terminate);
                assert!(state["rawOutputs"]["a"].is_object());
                assert!(state["partial"].is_object());
                assert_eq!(state["remaining"], json!(["b"]));
            }
            other => panic!("expected checkpoint, got {other:?}"),
        }
    }
}
