//! `circuit_breaker`: stop calling governed primitives after repeated failures.
//!
//! Closed: calls run and failures are counted. A failure count beyond
//! `failure_threshold` opens the breaker. Open: calls are skipped until
//! `reset_timeout_ms` has elapsed, then one half-open trial call runs. A
//! success there closes the breaker; a failure reopens it.

use chrono::{DateTime, Duration, Utc};
use serde_json::{Map, Value, json};
use technique_types::composition::Primitive;
use technique_types::execution::ExecutionStep;

use super::{Decision, OperatorContext, OperatorInterpreter};

pub const DEFAULT_FAILURE_THRESHOLD: u64 = 3;
pub const DEFAULT_RESET_TIMEOUT_MS: u64 = 30_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl BreakerState {
    fn as_str(self) -> &'static str {
        match self {
            BreakerState::Closed => "closed",
            BreakerState::Open => "open",
            BreakerState::HalfOpen => "half_open",
        }
    }

    fn read(private: &Map<String, Value>) -> Self {
        match private.get("state").and_then(Value::as_str) {
            Some("open") => BreakerState::Open,
            Some("half_open") => BreakerState::HalfOpen,
            _ => BreakerState::Closed,
        }
    }
}

pub struct CircuitBreakerInterpreter;

fn set_state(ctx: &mut OperatorContext<'_>, state: BreakerState) {
    tracing::debug!(
        operator_id = ctx.operator.id.as_str(),
        state = state.as_str(),
        "circuit breaker transition"
    );
    ctx.private()
        .insert("state".to_string(), json!(state.as_str()));
}

fn open(ctx: &mut OperatorContext<'_>, failures: u64) -> Decision {
    set_state(ctx, BreakerState::Open);
    let opened_at = ctx.now.to_rfc3339();
    ctx.private().insert("opened_at".to_string(), json!(opened_at));
    Decision::terminate(format!(
        "circuit '{}' opened after {failures} failures",
        ctx.operator.id
    ))
}

impl OperatorInterpreter for CircuitBreakerInterpreter {
    fn before_execute(&self, ctx: &mut OperatorContext<'_>) -> Decision {
        let state = BreakerState::read(ctx.private());
        if state != BreakerState::Open {
            return Decision::proceed();
        }
        let reset = ctx
            .operator
            .param_u64("reset_timeout_ms")
            .unwrap_or(DEFAULT_RESET_TIMEOUT_MS);
        let opened_at = ctx
            .private()
            .get("opened_at")
            .and_then(Value::as_str)
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|d| d.with_timezone(&Utc));
        let elapsed = opened_at.is_none_or(|at| {
            let reset = i64::try_from(reset).ok().and_then(Duration::try_milliseconds);
            reset.is_none_or(|r| ctx.now - at >= r)
        });
        if elapsed {
            set_state(ctx, BreakerState::HalfOpen);
            Decision::proceed()
        } else {
            Decision::Skip { served: None }
        }
    }

    fn after_primitive_execute(
        &self,
        _primitive: &Primitive,
        step: &ExecutionStep,
        ctx: &mut OperatorContext<'_>,
    ) -> Decision {
        let state = BreakerState::read(ctx.private());
        if step.status.is_usable() {
            if state != BreakerState::Closed {
                set_state(ctx, BreakerState::Closed);
            }
            ctx.private().insert("failures".to_string(), json!(0));
            return Decision::proceed();
        }

        let failures = ctx
            .private()
            .get("failures")
            .and_then(Value::as_u64)
            .unwrap_or(0)
            + 1;
        ctx.private().insert("failures".to_string(), json!(failures));
        let threshold = ctx
            .operator
            .param_u64("failure_threshold")
            .unwrap_or(DEFAULT_FAILURE_THRESHOLD);
        if state == BreakerState::HalfOpen || failures > threshold {
            return open(ctx, failures);
        }
        Decision::proceed()
    }

    fn after_execute(&self, _steps: &[ExecutionStep], ctx: &mut OperatorContext<'_>) -> Decision {
        let private = ctx.private();
        let mut outputs = Map::new();
        outputs.insert(
            "circuitState".to_string(),
            json!(BreakerState::read(private).as_str()),
        );
        outputs.insert(
            "failures".to_string(),
            private.get("failures").cloned().unwrap_or(json!(0)),
        );
        Decision::with_outputs(outputs)
    }
}
