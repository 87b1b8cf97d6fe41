//! `budget_cap`: stop once the summed cost of governed outputs exceeds a cap.

use serde_json::{Map, Value, json};
use technique_types::composition::Primitive;
use technique_types::execution::ExecutionStep;

use super::{Decision, OperatorContext, OperatorInterpreter};

pub struct BudgetCapInterpreter;

fn max_budget(ctx: &OperatorContext<'_>) -> Option<f64> {
    ctx.operator
        .param_f64("max_budget")
        .filter(|b| b.is_finite() && *b >= 0.0)
}

fn spent(ctx: &mut OperatorContext<'_>) -> f64 {
    ctx.private().get("spent").and_then(Value::as_f64).unwrap_or(0.0)
}

fn exceeded(ctx: &OperatorContext<'_>, spent: f64, cap: f64) -> Decision {
    let reason = format!("budget '{}' exceeded: spent {spent} of {cap}", ctx.operator.id);
    match ctx.operator.param_str("on_exceeded") {
        Some("checkpoint") => Decision::Checkpoint {
            state: json!({"budgetExceeded": true, "budgetSpent": spent, "maxBudget": cap}),
            terminate: true,
        },
        _ => Decision::terminate(reason),
    }
}

impl OperatorInterpreter for BudgetCapInterpreter {
    fn before_execute(&self, ctx: &mut OperatorContext<'_>) -> Decision {
        let Some(cap) = max_budget(ctx) else {
            return Decision::terminate(format!(
                "budget '{}' has no valid max_budget",
                ctx.operator.id
            ));
        };
        let spent = spent(ctx);
        if spent > cap {
            return exceeded(ctx, spent, cap);
        }
        Decision::proceed()
    }

    fn after_primitive_execute(
        &self,
        primitive: &Primitive,
        step: &ExecutionStep,
        ctx: &mut OperatorContext<'_>,
    ) -> Decision {
        let field = ctx.operator.param_str("cost_field").unwrap_or("cost").to_string();
        let cost = step
            .output
            .get(&field)
            .and_then(Value::as_f64)
            .filter(|c| c.is_finite() && *c >= 0.0);
        let Some(cost) = cost else {
            if step.output.contains_key(&field) {
                tracing::warn!(
                    primitive_id = primitive.id.as_str(),
                    field = field.as_str(),
                    "ignoring invalid cost value"
                );
            }
            return Decision::proceed();
        };

        let total = spent(ctx) + cost;
        ctx.private().insert("spent".to_string(), json!(total));
        match max_budget(ctx) {
            Some(cap) if total > cap => exceeded(ctx, total, cap),
            _ => Decision::proceed(),
        }
    }

    fn after_execute(&self, _steps: &[ExecutionStep], ctx: &mut OperatorContext<'_>) -> Decision {
        let spent = spent(ctx);
        let Some(cap) = max_budget(ctx) else {
            return Decision::proceed();
        };
        if spent > cap {
            return exceeded(ctx, spent, cap);
        }
        let mut outputs = Map::new();
        outputs.insert("budgetSpent".to_string(), json!(spent));
        outputs.insert("budgetRemaining".to_string(), json!(cap - spent));
        Decision::with_outputs(outputs)
    }
}
