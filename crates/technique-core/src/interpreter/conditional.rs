//! `conditional`: route to the first branch whose condition holds.
//!
//! Each entry of `conditions` is a `condition => target` clause. Without a
//! match, `parameters.default` is taken; without a default, every
//! downstream primitive is skipped.

use serde_json::json;
use technique_types::execution::ExecutionStep;

use super::{Decision, OperatorContext, OperatorInterpreter};

pub struct ConditionalInterpreter;

impl OperatorInterpreter for ConditionalInterpreter {
    fn after_execute(&self, _steps: &[ExecutionStep], ctx: &mut OperatorContext<'_>) -> Decision {
        let view = ctx.state.condition_view();
        let matched = ctx.conditions.first_match(&ctx.operator.conditions, &view);
        let target = matched.or_else(|| ctx.operator.param_str("default").map(str::to_string));

        let Some(target) = target else {
            ctx.private().insert("branch".to_string(), json!(null));
            return Decision::Skip { served: None };
        };

        if !ctx.downstream.iter().any(|d| *d == target) {
            return Decision::terminate(format!(
                "branch target '{target}' is not downstream of '{}'",
                ctx.operator.id
            ));
        }
        ctx.private().insert("branch".to_string(), json!(target));
        Decision::Branch { target }
    }
}
