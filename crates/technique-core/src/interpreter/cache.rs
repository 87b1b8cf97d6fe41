//! `cache`: serve governed primitives from stored outputs.
//!
//! Entries are keyed by `"<parameters.key>:<primitive id>"` (or the primitive
//! id alone) and may be pre-seeded through `parameters.entries`. A hit
//! skips the primitive and serves the stored output.

use serde_json::{Map, Value, json};
use technique_types::composition::Primitive;
use technique_types::execution::ExecutionStep;

use super::{Decision, OperatorContext, OperatorInterpreter};
use crate::sanitize::strip_disallowed;

pub struct CacheInterpreter;

fn cache_key(ctx: &OperatorContext<'_>, primitive_id: &str) -> String {
    match ctx.operator.param_str("key") {
        Some(prefix) => format!("{prefix}:{primitive_id}"),
        None => primitive_id.to_string(),
    }
}

/// Seed the private entry table from `parameters.entries` on first use.
fn ensure_entries(ctx: &mut OperatorContext<'_>) {
    if ctx.private().get("entries").is_some_and(Value::is_object) {
        return;
    }
    let seed = ctx
        .operator
        .parameters
        .get("entries")
        .and_then(Value::as_object)
        .map(|m| strip_disallowed(m).0)
        .unwrap_or_default();
    ctx.private().insert("entries".to_string(), Value::Object(seed));
}

fn lookup(ctx: &mut OperatorContext<'_>, key: &str) -> Option<Map<String, Value>> {
    ensure_entries(ctx);
    ctx.private()
        .get("entries")
        .and_then(|e| e.get(key))
        .and_then(Value::as_object)
        .cloned()
}

fn store(ctx: &mut OperatorContext<'_>, key: String, output: Map<String, Value>) {
    ensure_entries(ctx);
    if let Some(Value::Object(entries)) = ctx.private().get_mut("entries") {
        entries.insert(key, Value::Object(output));
    }
}

fn bump(ctx: &mut OperatorContext<'_>, counter: &str) {
    let private = ctx.private();
    let n = private.get(counter).and_then(Value::as_u64).unwrap_or(0) + 1;
    private.insert(counter.to_string(), json!(n));
}

impl OperatorInterpreter for CacheInterpreter {
    fn before_execute(&self, ctx: &mut OperatorContext<'_>) -> Decision {
        let Some(current) = ctx.current else {
            return Decision::proceed();
        };
        let key = cache_key(ctx, current);
        match lookup(ctx, &key) {
            Some(served) => {
                bump(ctx, "hits");
                ctx.private().insert("last".to_string(), json!("cacheHit"));
                tracing::debug!(operator_id = ctx.operator.id.as_str(), key = key.as_str(), "cache hit");
                Decision::Skip { served: Some(served) }
            }
            None => {
                bump(ctx, "misses");
                ctx.private().insert("last".to_string(), json!("cacheMiss"));
                Decision::proceed()
            }
        }
    }

    fn after_primitive_execute(
        &self,
        primitive: &Primitive,
        step: &ExecutionStep,
        ctx: &mut OperatorContext<'_>,
    ) -> Decision {
        if step.status.is_usable() {
            let key = cache_key(ctx, &primitive.id);
            let (output, _) = strip_disallowed(&step.output);
            store(ctx, key, output);
        }
        Decision::proceed()
    }

    fn after_execute(&self, _steps: &[ExecutionStep], ctx: &mut OperatorContext<'_>) -> Decision {
        let private = ctx.private();
        let mut outputs = Map::new();
        outputs.insert("cacheHits".to_string(), private.get("hits").cloned().unwrap_or(json!(0)));
        outputs.insert("cacheMisses".to_string(), private.get("misses").cloned().unwrap_or(json!(0)));
        Decision::with_outputs(outputs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interpreter::testing::{Harness, outputs, step};
    use technique_types::composition::{Operator, OperatorType};
    use technique_types::execution::StepStatus;

    #[test]
    fn miss_then_hit() {
        let mut h = Harness::new(
            Operator::new("c", OperatorType::Cache)
                .with_inputs(&["lookup"])
                .with_parameter("key", json!("v1")),
        );
        assert_eq!(h.before(&CacheInterpreter, Some("lookup")), Decision::proceed());
        assert_eq!(h.state.operators["c"]["last"], "cacheMiss");
        h.after_primitive(&CacheInterpreter, &step("lookup", StepStatus::Success, json!({"v": 42})));

        match h.before(&CacheInterpreter, Some("lookup")) {
            Decision::Skip { served: Some(served) } => assert_eq!(served["v"], 42),
            other => panic!("expected a cache hit, got {other:?}"),
        }
        assert!(h.state.operators["c"]["entries"].get("v1:lookup").is_some());
        assert_eq!(
            outputs(&h.after(&CacheInterpreter, &[])),
            json!({"cacheHits": 1, "cacheMisses": 1})
        );
    }

    #[test]
    fn seeded_entries_are_served_and_sanitized() {
        let mut h = Harness::new(
            Operator::new("c", OperatorType::Cache)
                .with_inputs(&["lookup"])
                .with_parameter("entries", json!({"lookup": {"v": 1, "__proto__": {"x": 1}}})),
        );
        match h.before(&CacheInterpreter, Some("lookup")) {
            Decision::Skip { served: Some(served) } => {
                assert_eq!(Value::Object(served), json!({"v": 1}));
            }
            other => panic!("expected a cache hit, got {other:?}"),
        }
    }

    #[test]
    fn failed_results_are_not_cached() {
        let mut h = Harness::new(Operator::new("c", OperatorType::Cache).with_inputs(&["lookup"]));
        h.before(&CacheInterpreter, Some("lookup"));
        h.after_primitive(&CacheInterpreter, &step("lookup", StepStatus::Failed, json!({"v": 1})));
        assert_eq!(h.before(&CacheInterpreter, Some("lookup")), Decision::proceed());
    }
}
