//! Operator interpreters: the runtime behavior behind each operator type.
//!
//! The engine drives every operator through three hooks:
//!
//! - `before_execute` before each governed primitive attempt (or once,
//!   before the first downstream primitive, when the operator governs
//!   nothing),
//! - `after_primitive_execute` after each governed primitive attempt,
//! - `after_execute` once every governed primitive has finished.
//!
//! Each hook returns a [`Decision`]. Interpreters keep their own state in the
//! operator-private entry of the [`ExecutionState`]; they never perform I/O.

mod aggregate;
mod budget;
mod cache;
mod circuit;
mod conditional;
mod fanout;
mod gate;
mod looping;
mod monitor;
mod noop;
mod parallel;
mod replay;
mod retry;
mod sequence;
mod state;
mod timebox;

pub use parallel::{MAX_TRACKED_COLLISIONS, SKIPPED_KEYS_FIELD};
pub use retry::{BackoffStrategy, MAX_RETRY_DELAY_MS, backoff_delay_ms};
pub use state::ExecutionState;

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use technique_types::composition::{Composition, Operator, OperatorType, Primitive};
use technique_types::execution::ExecutionStep;
use uuid::Uuid;

use crate::condition::ConditionEvaluator;

// ---------------------------------------------------------------------------
// Decision
// ---------------------------------------------------------------------------

/// What an operator wants the engine to do next.
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    /// Proceed. `outputs` are assembled into downstream inputs.
    Continue { outputs: Map<String, Value> },
    /// Do not run. `served` outputs stand in for the primitive's result.
    Skip { served: Option<Map<String, Value>> },
    /// Run only `target` among the downstream primitives.
    Branch { target: String },
    /// Run the primitive again after `delay_ms`.
    Retry { delay_ms: u64 },
    /// Persist `state`; stop afterwards when `terminate` is set.
    Checkpoint { state: Value, terminate: bool },
    Terminate { reason: String },
    Escalate { reason: String },
}

impl Decision {
    /// `Continue` with no outputs.
    pub fn proceed() -> Self {
        Decision::Continue { outputs: Map::new() }
    }

    pub fn with_outputs(outputs: Map<String, Value>) -> Self {
        Decision::Continue { outputs }
    }

    pub fn terminate(reason: impl Into<String>) -> Self {
        Decision::Terminate {
            reason: reason.into(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Decision::Continue { .. } => "continue",
            Decision::Skip { .. } => "skip",
            Decision::Branch { .. } => "branch",
            Decision::Retry { .. } => "retry",
            Decision::Checkpoint { terminate: true, .. } => "checkpoint_terminate",
            Decision::Checkpoint { .. } => "checkpoint",
            Decision::Terminate { .. } => "terminate",
            Decision::Escalate { .. } => "escalate",
        }
    }

    /// Whether this decision stops forward progress.
    pub fn halts(&self) -> bool {
        matches!(
            self,
            Decision::Terminate { .. }
                | Decision::Escalate { .. }
                | Decision::Checkpoint { terminate: true, .. }
        )
    }

    /// Precedence when several operators decide at the same point.
    pub fn precedence(&self) -> u8 {
        match self {
            Decision::Terminate { .. } | Decision::Escalate { .. } => 6,
            Decision::Checkpoint { terminate: true, .. } => 5,
            Decision::Retry { .. } => 4,
            Decision::Checkpoint { .. } => 3,
            Decision::Branch { .. } => 2,
            Decision::Skip { .. } => 1,
            Decision::Continue { .. } => 0,
        }
    }
}

// ---------------------------------------------------------------------------
// Context
// ---------------------------------------------------------------------------

/// Everything an interpreter may inspect or update during a hook.
pub struct OperatorContext<'a> {
    pub execution_id: Uuid,
    pub operator: &'a Operator,
    pub composition: &'a Composition,
    pub state: &'a mut ExecutionState,
    pub conditions: &'a mut ConditionEvaluator,
    /// Primitives this operator governs, in declaration order.
    pub governed: &'a [String],
    /// Primitives downstream of this operator.
    pub downstream: &'a [String],
    /// Primitive about to run (`before_execute` only).
    pub current: Option<&'a str>,
    pub attempt: u32,
    pub started_at: DateTime<Utc>,
    pub now: DateTime<Utc>,
}

impl OperatorContext<'_> {
    /// This operator's private state entry.
    pub fn private(&mut self) -> &mut Map<String, Value> {
        self.state.operator_entry(&self.operator.id)
    }

    /// Evaluate a condition against the current state view.
    pub fn holds(&mut self, condition: &str) -> bool {
        let view = self.state.condition_view();
        self.conditions.evaluate(condition, &view)
    }
}

// ---------------------------------------------------------------------------
// Interpreter trait
// ---------------------------------------------------------------------------

/// Runtime behavior of one operator type. Every hook defaults to `Continue`.
pub trait OperatorInterpreter: Send + Sync {
    fn before_execute(&self, _ctx: &mut OperatorContext<'_>) -> Decision {
        Decision::proceed()
    }

    fn after_primitive_execute(
        &self,
        _primitive: &Primitive,
        _step: &ExecutionStep,
        _ctx: &mut OperatorContext<'_>,
    ) -> Decision {
        Decision::proceed()
    }

    fn after_execute(&self, _steps: &[ExecutionStep], _ctx: &mut OperatorContext<'_>) -> Decision {
        Decision::proceed()
    }

    /// `false` for types with no runtime behavior.
    fn changes_behavior(&self) -> bool {
        true
    }
}

static SEQUENCE: sequence::SequenceInterpreter = sequence::SequenceInterpreter;
static PARALLEL: parallel::ParallelInterpreter = parallel::ParallelInterpreter;
static FANOUT: fanout::FanoutInterpreter = fanout::FanoutInterpreter;
static GATE: gate::GateInterpreter = gate::GateInterpreter;
static CONDITIONAL: conditional::ConditionalInterpreter = conditional::ConditionalInterpreter;
static LOOP: looping::LoopInterpreter = looping::LoopInterpreter;
static RETRY: retry::RetryInterpreter = retry::RetryInterpreter::retry();
static BACKOFF: retry::RetryInterpreter = retry::RetryInterpreter::backoff();
static QUORUM: aggregate::QuorumInterpreter = aggregate::QuorumInterpreter;
static CONSENSUS: aggregate::ConsensusInterpreter = aggregate::ConsensusInterpreter;
static TIMEBOX: timebox::TimeboxInterpreter = timebox::TimeboxInterpreter;
static BUDGET_CAP: budget::BudgetCapInterpreter = budget::BudgetCapInterpreter;
static CIRCUIT_BREAKER: circuit::CircuitBreakerInterpreter = circuit::CircuitBreakerInterpreter;
static CACHE: cache::CacheInterpreter = cache::CacheInterpreter;
static REPLAY: replay::ReplayInterpreter = replay::ReplayInterpreter;
static MONITOR: monitor::MonitorInterpreter = monitor::MonitorInterpreter;
static NOOP: noop::NoopInterpreter = noop::NoopInterpreter;

/// The interpreter for an operator type. Types without runtime behavior
/// (`reduce` and custom types) get the no-op interpreter.
pub fn interpreter_for(operator_type: &OperatorType) -> &'static dyn OperatorInterpreter {
    match operator_type {
        OperatorType::Sequence => &SEQUENCE,
        OperatorType::Parallel | OperatorType::Fanin => &PARALLEL,
        OperatorType::Fanout => &FANOUT,
        OperatorType::Gate => &GATE,
        OperatorType::Conditional => &CONDITIONAL,
        OperatorType::Loop => &LOOP,
        OperatorType::Retry => &RETRY,
        OperatorType::Backoff => &BACKOFF,
        OperatorType::Quorum => &QUORUM,
        OperatorType::Consensus => &CONSENSUS,
        OperatorType::Timebox => &TIMEBOX,
        OperatorType::BudgetCap => &BUDGET_CAP,
        OperatorType::CircuitBreaker => &CIRCUIT_BREAKER,
        OperatorType::Cache => &CACHE,
        OperatorType::Replay => &REPLAY,
        OperatorType::Monitor => &MONITOR,
        OperatorType::Reduce | OperatorType::Custom(_) => &NOOP,
    }
}

/// Operator types whose governed primitives run as one concurrent unit.
pub fn runs_governed_concurrently(operator_type: &OperatorType) -> bool {
    matches!(
        operator_type,
        OperatorType::Parallel | OperatorType::Fanin | OperatorType::Quorum | OperatorType::Consensus
    )
}

/// Operator types whose downstream primitives run as one concurrent unit.
pub fn runs_downstream_concurrently(operator_type: &OperatorType) -> bool {
    matches!(operator_type, OperatorType::Fanout)
}

/// Latest step per governed primitive, in governed order.
pub(crate) fn latest_steps<'s>(steps: &'s [ExecutionStep], governed: &[String]) -> Vec<&'s ExecutionStep> {
    governed
        .iter()
        .filter_map(|pid| steps.iter().rev().find(|s| &s.primitive_id == pid))
        .collect()
}

// ---------------------------------------------------------------------------
// Test support
// ---------------------------------------------------------------------------

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;
    use technique_types::execution::StepStatus;

    /// Owns everything an `OperatorContext` borrows.
    pub struct Harness {
        pub operator: Operator,
        pub composition: Composition,
        pub state: ExecutionState,
        pub conditions: ConditionEvaluator,
        pub governed: Vec<String>,
        pub downstream: Vec<String>,
        pub now: DateTime<Utc>,
    }

    impl Harness {
        pub fn new(operator: Operator) -> Self {
            let mut ids: Vec<&str> = Vec::new();
            for id in operator.inputs.iter().chain(operator.outputs.iter()) {
                if !ids.contains(&id.as_str()) {
                    ids.push(id.as_str());
                }
            }
            let composition = Composition::new("test", &ids).with_operator(operator.clone());
            Self {
                governed: operator.inputs.clone(),
                downstream: operator.outputs.clone(),
                operator,
                composition,
                state: ExecutionState::default(),
                conditions: ConditionEvaluator::new(),
                now: Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap(),
            }
        }

        pub fn with_shared(mut self, shared: Value) -> Self {
            self.state = ExecutionState::seeded(shared.as_object().cloned().unwrap_or_default());
            self
        }

        pub fn ctx(&mut self, current: Option<&'static str>) -> OperatorContext<'_> {
            OperatorContext {
                execution_id: Uuid::nil(),
                operator: &self.operator,
                composition: &self.composition,
                state: &mut self.state,
                conditions: &mut self.conditions,
                governed: &self.governed,
                downstream: &self.downstream,
                current,
                attempt: 1,
                started_at: self.now,
                now: self.now,
            }
        }

        pub fn before(&mut self, interp: &dyn OperatorInterpreter, current: Option<&'static str>) -> Decision {
            let mut ctx = self.ctx(current);
            interp.before_execute(&mut ctx)
        }

        pub fn after_primitive(&mut self, interp: &dyn OperatorInterpreter, step: &ExecutionStep) -> Decision {
            let primitive = Primitive::new(step.primitive_id.clone(), step.primitive_id.clone());
            let mut ctx = self.ctx(None);
            interp.after_primitive_execute(&primitive, step, &mut ctx)
        }

        pub fn after(&mut self, interp: &dyn OperatorInterpreter, steps: &[ExecutionStep]) -> Decision {
            let mut ctx = self.ctx(None);
            interp.after_execute(steps, &mut ctx)
        }
    }

    pub fn step(primitive_id: &str, status: StepStatus, output: Value) -> ExecutionStep {
        step_attempt(primitive_id, status, output, 1)
    }

    pub fn step_attempt(primitive_id: &str, status: StepStatus, output: Value, attempt: u32) -> ExecutionStep {
        let now = Utc::now();
        ExecutionStep {
            primitive_id: primitive_id.to_string(),
            input: Map::new(),
            output: output.as_object().cloned().unwrap_or_default(),
            status,
            issues: Vec::new(),
            attempt,
            started_at: now,
            completed_at: now,
            duration_ms: 0,
        }
    }

    pub fn outputs(decision: &Decision) -> Value {
        match decision {
            Decision::Continue { outputs } => Value::Object(outputs.clone()),
            other => json!({"unexpected": other.kind()}),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn halting_decisions() {
        assert!(Decision::terminate("x").halts());
        assert!(Decision::Escalate { reason: "x".into() }.halts());
        assert!(Decision::Checkpoint { state: Value::Null, terminate: true }.halts());
        assert!(!Decision::Checkpoint { state: Value::Null, terminate: false }.halts());
        assert!(!Decision::Retry { delay_ms: 0 }.halts());
    }

    #[test]
    fn precedence_prefers_halts_then_retry() {
        let retry = Decision::Retry { delay_ms: 10 };
        let branch = Decision::Branch { target: "a".into() };
        assert!(Decision::terminate("x").precedence() > retry.precedence());
        assert!(retry.precedence() > branch.precedence());
        assert!(branch.precedence() > Decision::Skip { served: None }.precedence());
        assert!(Decision::Skip { served: None }.precedence() > Decision::proceed().precedence());
    }

    #[test]
    fn reduce_and_custom_types_are_noops() {
        assert!(!interpreter_for(&OperatorType::Reduce).changes_behavior());
        assert!(!interpreter_for(&OperatorType::Custom("acme:x".into())).changes_behavior());
        assert!(interpreter_for(&OperatorType::Loop).changes_behavior());
    }
}
