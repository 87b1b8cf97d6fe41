//! `monitor`: summarize the outcomes of watched primitives.

use serde_json::{Map, Value, json};
use technique_types::execution::{ExecutionStep, StepStatus};

use super::{Decision, OperatorContext, OperatorInterpreter};

pub struct MonitorInterpreter;

impl OperatorInterpreter for MonitorInterpreter {
    fn after_execute(&self, _steps: &[ExecutionStep], ctx: &mut OperatorContext<'_>) -> Decision {
        let signals: Vec<String> = match ctx.operator.parameters.get("signals").and_then(Value::as_array) {
            Some(items) => items.iter().filter_map(Value::as_str).map(str::to_string).collect(),
            None => ctx.governed.to_vec(),
        };

        let (mut success, mut partial, mut failed, mut skipped, mut pending) = (0, 0, 0, 0, 0);
        for pid in &signals {
            match ctx.state.statuses.get(pid) {
                Some(StepStatus::Success) => success += 1,
                Some(StepStatus::Partial) => partial += 1,
                Some(StepStatus::Failed) => failed += 1,
                None if ctx.state.is_skipped(pid) => skipped += 1,
                None => pending += 1,
            }
        }
        let summary = json!({
            "signals": signals.len(),
            "success": success,
            "partial": partial,
            "failed": failed,
            "skipped": skipped,
            "pending": pending,
        });
        tracing::info!(operator_id = ctx.operator.id.as_str(), %summary, "monitor summary");
        ctx.private().insert("summary".to_string(), summary.clone());

        let mut outputs = Map::new();
        outputs.insert("monitor".to_string(), summary);
        Decision::with_outputs(outputs)
    }
}
