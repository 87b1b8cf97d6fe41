//! `timebox`: stop governed work once a deadline passes.
//!
//! The deadline is fixed on the first `before_execute`, from an absolute
//! RFC 3339 `deadline` or a relative `timeout_ms`, and stored in private
//! state. Every later hook compares it against the context clock.

use chrono::{DateTime, Duration, Utc};
use serde_json::{Value, json};
use technique_types::composition::Primitive;
use technique_types::execution::ExecutionStep;

use super::{Decision, OperatorContext, OperatorInterpreter};

pub struct TimeboxInterpreter;

fn stored_deadline(ctx: &mut OperatorContext<'_>) -> Option<DateTime<Utc>> {
    ctx.private()
        .get("deadline")
        .and_then(Value::as_str)
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|d| d.with_timezone(&Utc))
}

fn overrun(ctx: &mut OperatorContext<'_>) -> Option<Decision> {
    let deadline = stored_deadline(ctx)?;
    if ctx.now <= deadline {
        return None;
    }
    let deadline = deadline.to_rfc3339();
    ctx.private().insert("timedOut".to_string(), Value::Bool(true));
    tracing::warn!(operator_id = ctx.operator.id.as_str(), %deadline, "timebox expired");
    Some(match ctx.operator.param_str("on_timeout") {
        Some("checkpoint") => Decision::Checkpoint {
            state: json!({"timedOut": true, "deadline": deadline}),
            terminate: true,
        },
        _ => Decision::terminate(format!("timebox '{}' expired at {deadline}", ctx.operator.id)),
    })
}

impl OperatorInterpreter for TimeboxInterpreter {
    fn before_execute(&self, ctx: &mut OperatorContext<'_>) -> Decision {
        if !ctx.private().contains_key("deadline") && !ctx.private().contains_key("unbounded") {
            let deadline = if let Some(raw) = ctx.operator.param_str("deadline") {
                match DateTime::parse_from_rfc3339(raw) {
                    Ok(d) => Some(d.with_timezone(&Utc)),
                    Err(e) => {
                        return Decision::terminate(format!(
                            "timebox '{}' has an invalid deadline '{raw}': {e}",
                            ctx.operator.id
                        ));
                    }
                }
            } else {
                ctx.operator
                    .param_u64("timeout_ms")
                    .and_then(|ms| i64::try_from(ms).ok())
                    .and_then(Duration::try_milliseconds)
                    .and_then(|d| ctx.now.checked_add_signed(d))
            };

            match deadline {
                Some(d) => {
                    ctx.private().insert("deadline".to_string(), json!(d.to_rfc3339()));
                }
                None => {
                    tracing::warn!(
                        operator_id = ctx.operator.id.as_str(),
                        "timebox has neither deadline nor timeout_ms"
                    );
                    ctx.private().insert("unbounded".to_string(), Value::Bool(true));
                }
            }
        }
        overrun(ctx).unwrap_or_else(Decision::proceed)
    }

    fn after_primitive_execute(
        &self,
        _primitive: &Primitive,
        _step: &ExecutionStep,
        ctx: &mut OperatorContext<'_>,
    ) -> Decision {
        overrun(ctx).unwrap_or_else(Decision::proceed)
    }

    fn after_execute(&self, _steps: &[ExecutionStep], ctx: &mut OperatorContext<'_>) -> Decision {
        overrun(ctx).unwrap_or_else(Decision::proceed)
    }
}
