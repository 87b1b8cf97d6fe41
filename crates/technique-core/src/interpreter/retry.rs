//! `retry` and `backoff`: re-run a failed governed primitive after a delay.
//!
//! Both types share one interpreter; they differ in parameter names and the
//! default delay strategy. Delays are bounded to `[0, MAX_RETRY_DELAY_MS]`
//! whatever the inputs.

use serde_json::Value;
use technique_types::composition::Primitive;
use technique_types::execution::ExecutionStep;

use super::{Decision, OperatorContext, OperatorInterpreter};

/// Upper bound for any retry delay.
pub const MAX_RETRY_DELAY_MS: u64 = 60_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackoffStrategy {
    Fixed,
    Exponential,
    ExponentialJitter,
}

impl BackoffStrategy {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "fixed" => Some(BackoffStrategy::Fixed),
            "exponential" => Some(BackoffStrategy::Exponential),
            "exponential_jitter" | "exponential-jitter" => Some(BackoffStrategy::ExponentialJitter),
            _ => None,
        }
    }
}

/// Delay before attempt `attempt + 1`.
///
/// Non-finite inputs yield the ceiling; negative results yield zero.
pub fn backoff_delay_ms(strategy: BackoffStrategy, base: f64, attempt: f64, jitter: f64) -> u64 {
    if !base.is_finite() || !attempt.is_finite() || !jitter.is_finite() {
        return MAX_RETRY_DELAY_MS;
    }
    let raw = match strategy {
        BackoffStrategy::Fixed => base,
        BackoffStrategy::Exponential => base * 2f64.powf((attempt - 1.0).max(0.0)),
        BackoffStrategy::ExponentialJitter => base * 2f64.powf((attempt - 1.0).max(0.0)) + jitter,
    };
    if raw.is_nan() || raw >= MAX_RETRY_DELAY_MS as f64 {
        return MAX_RETRY_DELAY_MS;
    }
    if raw <= 0.0 {
        return 0;
    }
    raw as u64
}

pub struct RetryInterpreter {
    limit_param: &'static str,
    default_limit: u64,
    /// `true` when the limit counts retries, `false` when it counts attempts.
    counts_retries: bool,
    delay_params: &'static [&'static str],
    default_delay: f64,
    default_strategy: BackoffStrategy,
}

impl RetryInterpreter {
    pub const fn retry() -> Self {
        Self {
            limit_param: "max_retries",
            default_limit: 3,
            counts_retries: true,
            delay_params: &["delay_ms", "base_delay_ms"],
            default_delay: 0.0,
            default_strategy: BackoffStrategy::Fixed,
        }
    }

    pub const fn backoff() -> Self {
        Self {
            limit_param: "max_attempts",
            default_limit: 3,
            counts_retries: false,
            delay_params: &["base_delay_ms", "delay_ms"],
            default_delay: 100.0,
            default_strategy: BackoffStrategy::ExponentialJitter,
        }
    }

    fn strategy(&self, ctx: &OperatorContext<'_>) -> BackoffStrategy {
        match ctx.operator.param_str("strategy") {
            Some(s) => BackoffStrategy::parse(s).unwrap_or_else(|| {
                tracing::warn!(
                    operator_id = ctx.operator.id.as_str(),
                    strategy = s,
                    "unknown backoff strategy, using default"
                );
                self.default_strategy
            }),
            None => self.default_strategy,
        }
    }

    fn base_delay(&self, ctx: &OperatorContext<'_>) -> f64 {
        self.delay_params
            .iter()
            .find_map(|key| ctx.operator.parameters.get(*key).and_then(Value::as_f64))
            .unwrap_or(self.default_delay)
    }

    fn allows(&self, attempt: u64, limit: u64) -> bool {
        if self.counts_retries {
            attempt <= limit
        } else {
            attempt < limit
        }
    }
}

impl OperatorInterpreter for RetryInterpreter {
    fn after_primitive_execute(
        &self,
        primitive: &Primitive,
        step: &ExecutionStep,
        ctx: &mut OperatorContext<'_>,
    ) -> Decision {
        if step.status.is_usable() {
            return Decision::proceed();
        }
        let limit = ctx.operator.param_u64(self.limit_param).unwrap_or(self.default_limit);
        let attempt = u64::from(step.attempt);
        if !self.allows(attempt, limit) {
            return Decision::terminate(format!(
                "'{}' failed after {attempt} attempts ({} = {limit})",
                primitive.id, self.limit_param
            ));
        }

        let strategy = self.strategy(ctx);
        let base = self.base_delay(ctx);
        let jitter = match strategy {
            BackoffStrategy::ExponentialJitter if base.is_finite() && base > 0.0 => {
                rand::random::<f64>() * base
            }
            _ => 0.0,
        };
        let delay_ms = backoff_delay_ms(strategy, base, attempt as f64, jitter);

        let private = ctx.private();
        private.insert("lastAttempt".to_string(), Value::from(attempt));
        private.insert("lastDelayMs".to_string(), Value::from(delay_ms));
        tracing::debug!(
            primitive_id = primitive.id.as_str(),
            attempt,
            delay_ms,
            "scheduling retry"
        );
        Decision::Retry { delay_ms }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interpreter::testing::{Harness, step_attempt};
    use proptest::prelude::*;
    use serde_json::json;
    use technique_types::composition::{Operator, OperatorType};
    use technique_types::execution::StepStatus;

    fn failed(attempt: u32) -> ExecutionStep {
        step_attempt("p", StepStatus::Failed, json!({}), attempt)
    }

    #[test]
    fn delay_strategies() {
        assert_eq!(backoff_delay_ms(BackoffStrategy::Fixed, 250.0, 4.0, 0.0), 250);
        assert_eq!(backoff_delay_ms(BackoffStrategy::Exponential, 100.0, 1.0, 0.0), 100);
        assert_eq!(backoff_delay_ms(BackoffStrategy::Exponential, 100.0, 3.0, 0.0), 400);
        assert_eq!(backoff_delay_ms(BackoffStrategy::ExponentialJitter, 100.0, 2.0, 17.0), 217);
    }

    #[test]
    fn delay_edge_cases() {
        assert_eq!(backoff_delay_ms(BackoffStrategy::Exponential, f64::NAN, 1.0, 0.0), MAX_RETRY_DELAY_MS);
        assert_eq!(
            backoff_delay_ms(BackoffStrategy::Exponential, 100.0, f64::INFINITY, 0.0),
            MAX_RETRY_DELAY_MS
        );
        assert_eq!(backoff_delay_ms(BackoffStrategy::Fixed, -5.0, 1.0, 0.0), 0);
        assert_eq!(backoff_delay_ms(BackoffStrategy::Exponential, 100.0, 40.0, 0.0), MAX_RETRY_DELAY_MS);
    }

    #[test]
    fn retry_allows_max_retries_then_terminates() {
        let op = Operator::new("r", OperatorType::Retry)
            .with_inputs(&["p"])
            .with_parameter("max_retries", json!(2))
            .with_parameter("delay_ms", json!(50));
        let mut h = Harness::new(op);
        assert_eq!(h.after_primitive(&RetryInterpreter::retry(), &failed(1)), Decision::Retry { delay_ms: 50 });
        assert_eq!(h.after_primitive(&RetryInterpreter::retry(), &failed(2)), Decision::Retry { delay_ms: 50 });
        assert!(matches!(
            h.after_primitive(&RetryInterpreter::retry(), &failed(3)),
            Decision::Terminate { .. }
        ));
    }

    #[test]
    fn success_needs_no_retry() {
        let op = Operator::new("r", OperatorType::Retry).with_inputs(&["p"]);
        let mut h = Harness::new(op);
        let ok = step_attempt("p", StepStatus::Success, json!({}), 1);
        assert_eq!(h.after_primitive(&RetryInterpreter::retry(), &ok), Decision::proceed());
    }

    #[test]
    fn backoff_counts_attempts_and_grows() {
        let op = Operator::new("b", OperatorType::Backoff)
            .with_inputs(&["p"])
            .with_parameter("max_attempts", json!(3))
            .with_parameter("strategy", json!("exponential"))
            .with_parameter("base_delay_ms", json!(100));
        let mut h = Harness::new(op);
        let backoff = RetryInterpreter::backoff();
        assert_eq!(h.after_primitive(&backoff, &failed(1)), Decision::Retry { delay_ms: 100 });
        assert_eq!(h.after_primitive(&backoff, &failed(2)), Decision::Retry { delay_ms: 200 });
        assert!(matches!(h.after_primitive(&backoff, &failed(3)), Decision::Terminate { .. }));
    }

    #[test]
    fn jittered_backoff_stays_in_range() {
        let op = Operator::new("b", OperatorType::Backoff)
            .with_inputs(&["p"])
            .with_parameter("max_attempts", json!(10));
        let mut h = Harness::new(op);
        match h.after_primitive(&RetryInterpreter::backoff(), &failed(2)) {
            Decision::Retry { delay_ms } => assert!((200..300).contains(&delay_ms)),
            other => panic!("expected retry, got {other:?}"),
        }
    }

    proptest! {
        #[test]
        fn delay_is_always_bounded(
            base in prop::num::f64::ANY,
            attempt in prop::num::f64::ANY,
            jitter in prop::num::f64::ANY,
        ) {
            for strategy in [BackoffStrategy::Fixed, BackoffStrategy::Exponential, BackoffStrategy::ExponentialJitter] {
                let delay = backoff_delay_ms(strategy, base, attempt, jitter);
                prop_assert!(delay <= MAX_RETRY_DELAY_MS);
            }
        }
    }
}
