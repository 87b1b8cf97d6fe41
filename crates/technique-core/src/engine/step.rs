//! One primitive attempt: contract checks around an executor call.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use futures_util::FutureExt;
use serde_json::{Map, Value, json};
use technique_types::composition::Primitive;
use technique_types::execution::{ExecutionIssue, ExecutionStep, IssueCode, StepStatus};

use crate::condition::ConditionEvaluator;
use crate::executor::{BoxPrimitiveExecutor, ExecutionContext, ExecutorError};
use crate::sanitize::strip_disallowed;

/// Everything a spawned attempt needs, owned.
pub(crate) struct StepJob {
    pub primitive: Primitive,
    pub input: Map<String, Value>,
    /// Required inputs that could not be resolved.
    pub missing: Vec<String>,
    pub ctx: ExecutionContext,
    pub executor: Option<Arc<BoxPrimitiveExecutor>>,
    pub timeout: Option<Duration>,
    /// Latest usable outputs, for condition views.
    pub outputs: Value,
}

/// Run an attempt to completion. Never fails; problems become step issues.
pub(crate) async fn run_step(job: StepJob) -> ExecutionStep {
    let started_at = Utc::now();
    let clock = Instant::now();
    let primitive_id = job.primitive.id.clone();
    let attempt = job.ctx.attempt;
    let input = job.input.clone();

    let (status, output, issues) = match AssertUnwindSafe(attempt_contract(job)).catch_unwind().await {
        Ok(outcome) => outcome,
        Err(_) => (
            StepStatus::Failed,
            Map::new(),
            vec![
                ExecutionIssue::new(IssueCode::PrimitiveExecutionFailed, "executor panicked")
                    .for_primitive(primitive_id.as_str()),
            ],
        ),
    };

    ExecutionStep {
        primitive_id,
        input,
        output,
        status,
        issues,
        attempt,
        started_at,
        completed_at: Utc::now(),
        duration_ms: clock.elapsed().as_millis() as u64,
    }
}

/// A failed step that never reached the executor.
pub(crate) fn failed_step(
    primitive_id: &str,
    input: Map<String, Value>,
    attempt: u32,
    code: IssueCode,
    message: impl Into<String>,
) -> ExecutionStep {
    let now = Utc::now();
    ExecutionStep {
        primitive_id: primitive_id.to_string(),
        input,
        output: Map::new(),
        status: StepStatus::Failed,
        issues: vec![ExecutionIssue::new(code, message).for_primitive(primitive_id)],
        attempt,
        started_at: now,
        completed_at: now,
        duration_ms: 0,
    }
}

/// A successful step whose output was provided by an operator.
pub(crate) fn served_step(primitive_id: &str, input: Map<String, Value>, output: Map<String, Value>, attempt: u32) -> ExecutionStep {
    let now = Utc::now();
    ExecutionStep {
        primitive_id: primitive_id.to_string(),
        input,
        output,
        status: StepStatus::Success,
        issues: Vec::new(),
        attempt,
        started_at: now,
        completed_at: now,
        duration_ms: 0,
    }
}

type Outcome = (StepStatus, Map<String, Value>, Vec<ExecutionIssue>);

async fn attempt_contract(job: StepJob) -> Outcome {
    let pid = job.primitive.id.as_str();
    let fail = |code: IssueCode, message: String| {
        (
            StepStatus::Failed,
            Map::new(),
            vec![ExecutionIssue::new(code, message).for_primitive(pid)],
        )
    };

    if !job.missing.is_empty() {
        return fail(
            IssueCode::ContractInputMissingRequired,
            format!("missing required inputs: {}", job.missing.join(", ")),
        );
    }

    let mut conditions = ConditionEvaluator::new();
    let view = json!({
        "input": Value::Object(job.input.clone()),
        "state": Value::Object(job.ctx.state.clone()),
        "outputs": job.outputs.clone(),
    });

    if let Some(contract) = &job.primitive.contract {
        for (key, expected) in &contract.input_types {
            if let Some(value) = job.input.get(key)
                && !expected.matches(value)
            {
                return fail(
                    IssueCode::ContractPreconditionFailed,
                    format!("input '{key}' is not of type {expected:?}"),
                );
            }
        }
        if let Some(failed) = contract.preconditions.iter().find(|c| !conditions.evaluate(c, &view)) {
            return fail(
                IssueCode::ContractPreconditionFailed,
                format!("precondition failed: {failed}"),
            );
        }
    }

    let Some(executor) = job.executor.as_ref() else {
        return fail(
            IssueCode::PrimitiveExecutorMissing,
            ExecutorError::Missing(pid.to_string()).to_string(),
        );
    };

    let call = executor.execute(&job.primitive, &job.input, &job.ctx);
    let result = match job.timeout {
        Some(limit) => match tokio::time::timeout(limit, call).await {
            Ok(result) => result,
            Err(_) => Err(ExecutorError::Timeout(limit.as_millis() as u64)),
        },
        None => call.await,
    };

    let raw = match result {
        Ok(output) => output,
        Err(e) => return fail(e.issue_code(), e.to_string()),
    };

    let (output, dropped) = strip_disallowed(&raw);
    if !dropped.is_empty() {
        tracing::warn!(primitive_id = pid, dropped = ?dropped, "dropped disallowed output keys");
    }

    if let Some(contract) = &job.primitive.contract {
        for (key, expected) in &contract.output_types {
            match output.get(key) {
                Some(value) if expected.matches(value) => {}
                Some(_) => {
                    return fail(
                        IssueCode::ContractOutputTypeInvalid,
                        format!("output '{key}' is not of type {expected:?}"),
                    );
                }
                None => {
                    return fail(
                        IssueCode::ContractOutputTypeInvalid,
                        format!("output '{key}' is missing"),
                    );
                }
            }
        }

        let mut view = view;
        view["output"] = Value::Object(output.clone());
        let unmet: Vec<&String> = contract
            .postconditions
            .iter()
            .filter(|c| !conditions.evaluate(c, &view))
            .collect();
        if !unmet.is_empty() {
            let issues = unmet
                .iter()
                .map(|c| {
                    ExecutionIssue::new(IssueCode::ContractPostconditionFailed, format!("postcondition failed: {c}"))
                        .for_primitive(pid)
                })
                .collect();
            return (StepStatus::Partial, output, issues);
        }
    }

    (StepStatus::Success, output, Vec::new())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::FnExecutor;
    use technique_types::composition::{PrimitiveContract, ValueType};
    use uuid::Uuid;

    fn job(primitive: Primitive, input: Value, executor: Option<BoxPrimitiveExecutor>) -> StepJob {
        StepJob {
            primitive,
            input: input.as_object().cloned().unwrap(),
            missing: vec![],
            ctx: ExecutionContext {
                execution_id: Uuid::now_v7(),
                composition_id: "c".into(),
                attempt: 1,
                state: Map::new(),
            },
            executor: executor.map(Arc::new),
            timeout: None,
            outputs: json!({}),
        }
    }

    fn echo() -> BoxPrimitiveExecutor {
        BoxPrimitiveExecutor::new(FnExecutor::new(|_: &Primitive, input: &Map<String, Value>, _: &ExecutionContext| {
            Ok(input.clone())
        }))
    }

    fn contract() -> PrimitiveContract {
        PrimitiveContract {
            input_types: [("n".to_string(), ValueType::Number)].into(),
            output_types: [("n".to_string(), ValueType::Number)].into(),
            preconditions: vec!["input.n > 0".into()],
            postconditions: vec!["output.n < 10".into()],
        }
    }

    #[tokio::test]
    async fn missing_required_input_skips_executor() {
        let mut j = job(Primitive::new("p", "p"), json!({}), Some(echo()));
        j.missing = vec!["topic".into()];
        let step = run_step(j).await;
        assert_eq!(step.status, StepStatus::Failed);
        assert!(step.has_issue(IssueCode::ContractInputMissingRequired));
    }

    #[tokio::test]
    async fn contract_outcomes() {
        let p = Primitive::new("p", "p").with_contract(contract());

        let ok = run_step(job(p.clone(), json!({"n": 3}), Some(echo()))).await;
        assert_eq!(ok.status, StepStatus::Success);

        let wrong_type = run_step(job(p.clone(), json!({"n": "3"}), Some(echo()))).await;
        assert!(wrong_type.has_issue(IssueCode::ContractPreconditionFailed));

        let precondition = run_step(job(p.clone(), json!({"n": -1}), Some(echo()))).await;
        assert!(precondition.has_issue(IssueCode::ContractPreconditionFailed));

        let post = run_step(job(p, json!({"n": 30}), Some(echo()))).await;
        assert_eq!(post.status, StepStatus::Partial);
        assert!(post.has_issue(IssueCode::ContractPostconditionFailed));
        assert_eq!(post.output["n"], 30);
    }

    #[tokio::test]
    async fn output_type_and_sanitizing() {
        let p = Primitive::new("p", "p").with_contract(PrimitiveContract {
            output_types: [("n".to_string(), ValueType::Number)].into(),
            ..PrimitiveContract::default()
        });
        let step = run_step(job(p, json!({"m": 1, "__proto__": {"x": 1}}), Some(echo()))).await;
        assert!(step.has_issue(IssueCode::ContractOutputTypeInvalid));

        let step = run_step(job(Primitive::new("q", "q"), json!({"m": 1, "__proto__": 1}), Some(echo()))).await;
        assert_eq!(step.status, StepStatus::Success);
        assert!(!step.output.contains_key("__proto__"));
    }

    #[tokio::test]
    async fn missing_executor_and_panics_are_failures() {
        let step = run_step(job(Primitive::new("p", "p"), json!({}), None)).await;
        assert!(step.has_issue(IssueCode::PrimitiveExecutorMissing));

        let boom = BoxPrimitiveExecutor::new(FnExecutor::new(
            |_: &Primitive, _: &Map<String, Value>, _: &ExecutionContext| -> Result<Map<String, Value>, ExecutorError> {
                panic!("boom")
            },
        ));
        let step = run_step(job(Primitive::new("p", "p"), json!({}), Some(boom))).await;
        assert!(step.has_issue(IssueCode::PrimitiveExecutionFailed));
    }
}
