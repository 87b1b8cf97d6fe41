//! `loop`: re-run the governed body until a condition holds.
//!
//! The exit condition is `conditions[0]`, falling back to
//! `parameters.until`. Without either, the body runs exactly
//! `max_iterations` times. Iteration counts live under a versioned private
//! entry (`v2.iterations`); older layouts are migrated on first access.

use serde_json::{Map, Value, json};
use technique_types::execution::ExecutionStep;

use super::{Decision, OperatorContext, OperatorInterpreter};

pub const DEFAULT_MAX_ITERATIONS: u64 = 10;

/// Flag set in private state when an older layout was migrated.
pub const MIGRATED_FLAG: &str = "__operator_state_migrated";

const STATE_VERSION: &str = "v2";

pub struct LoopInterpreter;

/// Read the iteration count, migrating legacy layouts in place.
fn iterations(private: &mut Map<String, Value>) -> u64 {
    if let Some(n) = private
        .get(STATE_VERSION)
        .and_then(|v| v.get("iterations"))
        .and_then(Value::as_u64)
    {
        return n;
    }

    let legacy = private
        .remove("iterations")
        .and_then(|v| v.as_u64())
        .unwrap_or(0);
    let has_entry = private.contains_key(STATE_VERSION);
    let migrated = legacy > 0 || has_entry;
    private.insert(STATE_VERSION.to_string(), json!({ "iterations": legacy }));
    if migrated {
        private.insert(MIGRATED_FLAG.to_string(), Value::Bool(true));
    }
    legacy
}

fn set_iterations(private: &mut Map<String, Value>, n: u64) {
    private.insert(STATE_VERSION.to_string(), json!({ "iterations": n }));
}

impl OperatorInterpreter for LoopInterpreter {
    fn after_execute(&self, _steps: &[ExecutionStep], ctx: &mut OperatorContext<'_>) -> Decision {
        let max = ctx
            .operator
            .param_u64("max_iterations")
            .unwrap_or(DEFAULT_MAX_ITERATIONS)
            .max(1);
        let condition = ctx
            .operator
            .conditions
            .first()
            .cloned()
            .or_else(|| ctx.operator.param_str("until").map(str::to_string));

        let done = {
            let private = ctx.private();
            let n = iterations(private) + 1;
            set_iterations(private, n);
            n
        };

        let completed = |iterations: u64| {
            let mut outputs = Map::new();
            outputs.insert("loopCompleted".to_string(), Value::Bool(true));
            outputs.insert("iterations".to_string(), json!(iterations));
            Decision::with_outputs(outputs)
        };

        match condition {
            Some(condition) => {
                if ctx.holds(&condition) {
                    completed(done)
                } else if done >= max {
                    Decision::terminate(format!(
                        "loop '{}' reached {max} iterations without '{condition}'",
                        ctx.operator.id
                    ))
                } else {
                    Decision::Retry { delay_ms: 0 }
                }
            }
            None if done >= max => completed(done),
            None => Decision::Retry { delay_ms: 0 },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interpreter::testing::{Harness, outputs};
    use technique_types::composition::{Operator, OperatorType};

    fn looping(conditions: &[&str], max: u64) -> Operator {
        Operator::new("loop", OperatorType::Loop)
            .with_inputs(&["body"])
            .with_conditions(conditions)
            .with_parameter("max_iterations", json!(max))
    }

    #[test]
    fn retries_until_condition_holds() {
        let mut h = Harness::new(looping(&["state.done == true"], 5));
        assert_eq!(h.after(&LoopInterpreter, &[]), Decision::Retry { delay_ms: 0 });
        assert_eq!(h.after(&LoopInterpreter, &[]), Decision::Retry { delay_ms: 0 });
        h.state.shared.insert("done".into(), json!(true));
        let out = outputs(&h.after(&LoopInterpreter, &[]));
        assert_eq!(out, json!({"loopCompleted": true, "iterations": 3}));
        assert_eq!(h.state.operators["loop"]["v2"]["iterations"], 3);
    }

    #[test]
    fn terminates_at_max_iterations() {
        let mut h = Harness::new(looping(&["state.done"], 2));
        assert_eq!(h.after(&LoopInterpreter, &[]), Decision::Retry { delay_ms: 0 });
        assert!(matches!(h.after(&LoopInterpreter, &[]), Decision::Terminate { .. }));
    }

    #[test]
    fn unconditioned_loop_runs_max_times() {
        let mut h = Harness::new(looping(&[], 3));
        assert_eq!(h.after(&LoopInterpreter, &[]), Decision::Retry { delay_ms: 0 });
        assert_eq!(h.after(&LoopInterpreter, &[]), Decision::Retry { delay_ms: 0 });
        assert_eq!(outputs(&h.after(&LoopInterpreter, &[]))["iterations"], 3);
    }

    #[test]
    fn until_parameter_is_the_fallback_condition() {
        let op = looping(&[], 4).with_parameter("until", json!("state.ok"));
        let mut h = Harness::new(op).with_shared(json!({"ok": true}));
        assert_eq!(outputs(&h.after(&LoopInterpreter, &[]))["loopCompleted"], true);
    }

    #[test]
    fn legacy_state_is_migrated() {
        let mut h = Harness::new(looping(&[], 10));
        h.state.operator_entry("loop").insert("iterations".into(), json!(4));
        assert_eq!(h.after(&LoopInterpreter, &[]), Decision::Retry { delay_ms: 0 });
        let private = &h.state.operators["loop"];
        assert_eq!(private["v2"]["iterations"], 5);
        assert_eq!(private[MIGRATED_FLAG], true);
        assert!(!private.contains_key("iterations"));
    }

    #[test]
    fn malformed_versioned_entry_is_reset() {
        let mut h = Harness::new(looping(&[], 10));
        h.state.operator_entry("loop").insert("v2".into(), json!("garbage"));
        h.after(&LoopInterpreter, &[]);
        let private = &h.state.operators["loop"];
        assert_eq!(private["v2"]["iterations"], 1);
        assert_eq!(private[MIGRATED_FLAG], true);
    }
}
