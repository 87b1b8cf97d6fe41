//! `sequence`: governed primitives must complete in declared order.

use serde_json::{Value, json};
use technique_types::composition::Primitive;
use technique_types::execution::ExecutionStep;

use super::{Decision, OperatorContext, OperatorInterpreter};

pub struct SequenceInterpreter;

fn completed() -> Decision {
    let mut outputs = serde_json::Map::new();
    outputs.insert("sequenceCompleted".to_string(), Value::Bool(true));
    Decision::with_outputs(outputs)
}

impl OperatorInterpreter for SequenceInterpreter {
    fn after_primitive_execute(
        &self,
        primitive: &Primitive,
        step: &ExecutionStep,
        ctx: &mut OperatorContext<'_>,
    ) -> Decision {
        let governed = ctx.governed;
        let next = ctx
            .private()
            .get("next")
            .and_then(Value::as_u64)
            .unwrap_or(0) as usize;

        // A re-run of the primitive that just completed keeps its slot.
        if step.attempt > 1 && next > 0 && governed.get(next - 1) == Some(&primitive.id) {
            return Decision::proceed();
        }

        match governed.get(next) {
            Some(expected) if *expected == primitive.id => {
                ctx.private().insert("next".to_string(), json!(next + 1));
                if next + 1 == governed.len() {
                    completed()
                } else {
                    Decision::proceed()
                }
            }
            Some(expected) => Decision::terminate(format!(
                "sequence out of order: expected '{expected}', got '{}'",
                primitive.id
            )),
            None => Decision::terminate(format!(
                "sequence already complete; unexpected '{}'",
                primitive.id
            )),
        }
    }

    fn after_execute(&self, _steps: &[ExecutionStep], ctx: &mut OperatorContext<'_>) -> Decision {
        let next = ctx.private().get("next").and_then(Value::as_u64).unwrap_or(0) as usize;
        if next >= ctx.governed.len() {
            completed()
        } else {
            Decision::proceed()
        }
    }
}
