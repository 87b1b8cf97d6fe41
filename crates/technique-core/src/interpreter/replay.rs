//! `replay`: hydrate shared state from a recorded snapshot.

use serde_json::{Map, Value, json};
use technique_types::execution::ExecutionStep;

use super::{Decision, OperatorContext, OperatorInterpreter};
use crate::sanitize::strip_disallowed;

pub struct ReplayInterpreter;

impl OperatorInterpreter for ReplayInterpreter {
    fn before_execute(&self, ctx: &mut OperatorContext<'_>) -> Decision {
        if ctx.private().contains_key("hydrated") {
            return Decision::proceed();
        }
        let snapshot = ctx.operator.parameters.get("snapshot");
        let source = snapshot
            .and_then(|s| s.get("state"))
            .and_then(Value::as_object)
            .or_else(|| snapshot.and_then(Value::as_object));

        let Some(source) = source else {
            tracing::warn!(operator_id = ctx.operator.id.as_str(), "replay has no snapshot object");
            ctx.private().insert("hydrated".to_string(), json!(0));
            return Decision::proceed();
        };

        let (clean, dropped) = strip_disallowed(source);
        if !dropped.is_empty() {
            tracing::warn!(
                operator_id = ctx.operator.id.as_str(),
                dropped = ?dropped,
                "replay snapshot contained disallowed keys"
            );
        }
        let keys: Vec<String> = clean.keys().cloned().collect();
        let hydrated = keys.len();
        for (key, value) in clean {
            ctx.state.shared.insert(key, value);
        }

        let private = ctx.private();
        private.insert("hydrated".to_string(), json!(hydrated));
        private.insert("keys".to_string(), json!(keys));
        private.insert("dropped".to_string(), json!(dropped));

        let mut outputs = Map::new();
        outputs.insert("hydrated".to_string(), json!(hydrated));
        Decision::with_outputs(outputs)
    }

    fn after_execute(&self, _steps: &[ExecutionStep], _ctx: &mut OperatorContext<'_>) -> Decision {
        let mut outputs = Map::new();
        outputs.insert("replayCompleted".to_string(), Value::Bool(true));
        Decision::with_outputs(outputs)
    }
}
