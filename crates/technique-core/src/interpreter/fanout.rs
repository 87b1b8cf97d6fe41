//! `fanout`: broadcast the single input's payload to every declared output.

use serde_json::{Value, json};
use technique_types::composition::Primitive;
use technique_types::execution::ExecutionStep;

use super::{Decision, OperatorContext, OperatorInterpreter};

pub struct FanoutInterpreter;

impl OperatorInterpreter for FanoutInterpreter {
    fn after_primitive_execute(
        &self,
        primitive: &Primitive,
        step: &ExecutionStep,
        ctx: &mut OperatorContext<'_>,
    ) -> Decision {
        if !step.status.is_usable() {
            return Decision::proceed();
        }
        let targets = ctx.downstream;
        let private = ctx.private();
        private.insert("source".to_string(), json!(primitive.id));
        private.insert("payload".to_string(), Value::Object(step.output.clone()));
        private.insert("targets".to_string(), json!(targets));

        let mut outputs = step.output.clone();
        outputs.insert("fanoutSource".to_string(), json!(primitive.id));
        Decision::with_outputs(outputs)
    }
}
