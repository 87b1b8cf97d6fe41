//! The execution loop: units in order, operator hooks around every attempt.

use std::collections::{BTreeMap, BTreeSet};
use std::ops::{ControlFlow, Range};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use technique_types::checkpoint::{Checkpoint, CheckpointReason};
use technique_types::composition::Primitive;
use technique_types::event::{CoverageGapReason, OperatorEvent};
use technique_types::execution::{ExecutionIssue, ExecutionStatus, ExecutionStep, IssueCode};
use tokio::task::JoinSet;
use uuid::Uuid;

use super::setup::Blueprint;
use super::snapshot::RunSnapshot;
use super::step::{StepJob, failed_step, run_step, served_step};
use super::{ExecutionEngine, ExecutionResult, MAX_ATTEMPTS};
use crate::checkpoint::{CheckpointError, CheckpointStore};
use crate::condition::ConditionEvaluator;
use crate::executor::ExecutionContext;
use crate::interpreter::{
    Decision, ExecutionState, MAX_RETRY_DELAY_MS, OperatorContext, OperatorInterpreter,
};

/// Where in the lifecycle a decision was made.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    /// An operator governing nothing, fired before its first downstream
    /// primitive.
    Entry,
    /// `before_execute` for a governed attempt.
    Before,
    AfterPrimitive,
    AfterExecute,
}

/// What the combined decisions mean for the primitive at hand.
#[derive(Debug, Clone, PartialEq)]
enum Control {
    Proceed,
    Skip,
    Serve(Map<String, Value>),
    Retry(u64),
}

impl Control {
    fn rank(&self) -> u8 {
        match self {
            Control::Proceed => 0,
            Control::Skip => 1,
            Control::Serve(_) => 2,
            Control::Retry(_) => 3,
        }
    }
}

enum Prepared {
    Job(StepJob),
    Served(ExecutionStep),
    NotRun,
}

type Flow<T = ()> = ControlFlow<ExecutionStatus, T>;

pub(crate) struct Run<'e, S: CheckpointStore> {
    engine: &'e ExecutionEngine<S>,
    bp: &'e Blueprint,
    execution_id: Uuid,
    started_at: DateTime<Utc>,
    clock: Instant,
    continue_on_failure: bool,
    state: ExecutionState,
    conditions: ConditionEvaluator,
    started: BTreeSet<String>,
    finished: BTreeSet<String>,
    operator_steps: BTreeMap<String, Vec<ExecutionStep>>,
    absorbed: BTreeSet<String>,
    steps: Vec<ExecutionStep>,
    issues: Vec<ExecutionIssue>,
    checkpoint_ids: Vec<String>,
    operator_outputs: BTreeMap<String, Map<String, Value>>,
    since_checkpoint: u32,
    unit: Range<usize>,
}

impl<'e, S: CheckpointStore> Run<'e, S> {
    pub fn new(
        engine: &'e ExecutionEngine<S>,
        bp: &'e Blueprint,
        execution_id: Uuid,
        snapshot: RunSnapshot,
        continue_on_failure: bool,
    ) -> Self {
        Self {
            engine,
            bp,
            execution_id,
            started_at: Utc::now(),
            clock: Instant::now(),
            continue_on_failure,
            state: snapshot.state,
            conditions: ConditionEvaluator::new(),
            started: snapshot.started,
            finished: snapshot.finished,
            operator_steps: snapshot.operator_steps,
            absorbed: snapshot.absorbed,
            steps: Vec::new(),
            issues: Vec::new(),
            checkpoint_ids: Vec::new(),
            operator_outputs: BTreeMap::new(),
            since_checkpoint: 0,
            unit: 0..0,
        }
    }

    /// Attach a run-level issue.
    pub fn note(&mut self, issue: ExecutionIssue) {
        self.issues.push(issue);
    }

    pub async fn drive(mut self, units: Vec<Range<usize>>) -> ExecutionResult {
        self.report_coverage_gaps();

        let mut status = None;
        for unit in units {
            if let ControlFlow::Break(halted) = self.run_unit(unit).await {
                status = Some(halted);
                break;
            }
        }
        let status = status.unwrap_or_else(|| {
            let failed = self
                .state
                .statuses
                .keys()
                .any(|p| self.state.is_failed(p) && !self.absorbed.contains(p));
            if failed {
                ExecutionStatus::Failed
            } else {
                ExecutionStatus::Completed
            }
        });
        self.finish(status)
    }

    // -----------------------------------------------------------------------
    // Units
    // -----------------------------------------------------------------------

    async fn run_unit(&mut self, unit: Range<usize>) -> Flow {
        let bp = self.bp;
        self.unit = unit.clone();
        let members: Vec<&'e str> = bp.order[unit.clone()].iter().map(String::as_str).collect();

        let mut jobs = Vec::new();
        let mut ready = Vec::new();
        for pid in members.iter().copied() {
            match self.prepare(pid).await? {
                Prepared::Job(job) => jobs.push(job),
                Prepared::Served(step) => ready.push(step),
                Prepared::NotRun => {}
            }
        }

        if jobs.len() > 1 {
            tracing::debug!(
                execution_id = %self.execution_id,
                members = jobs.len(),
                "running concurrent unit"
            );
        }
        ready.extend(launch(jobs).await);
        ready.sort_by_key(|s| members.iter().position(|m| *m == s.primitive_id));

        for step in ready {
            self.complete(step).await?;
        }
        self.settle().await?;

        let failed: Vec<&str> = members
            .iter()
            .copied()
            .filter(|m| self.state.is_failed(m) && !self.absorbed.contains(*m))
            .collect();
        if !failed.is_empty() {
            tracing::warn!(
                execution_id = %self.execution_id,
                failed = ?failed,
                "unit finished with failed primitives"
            );
            if self.engine.config.checkpoint_on_failure {
                self.save_checkpoint(CheckpointReason::Failure, unit.start).await;
            }
            if !self.continue_on_failure {
                return ControlFlow::Break(ExecutionStatus::Failed);
            }
        }

        if let Some(interval) = self.engine.config.checkpoint_interval
            && interval > 0
            && self.since_checkpoint >= interval
        {
            self.save_checkpoint(CheckpointReason::ScheduledInterval, unit.end).await;
        }
        ControlFlow::Continue(())
    }

    /// Decide whether a primitive runs, and build its attempt if so.
    async fn prepare(&mut self, pid: &'e str) -> Flow<Prepared> {
        let bp = self.bp;
        if self.state.is_skipped(pid) {
            return ControlFlow::Continue(Prepared::NotRun);
        }

        let blocked: Vec<&str> = bp
            .parents
            .get(pid)
            .into_iter()
            .flatten()
            .map(String::as_str)
            .filter(|p| self.state.is_skipped(p) || (self.state.is_failed(p) && !self.absorbed.contains(*p)))
            .collect();
        if !blocked.is_empty() {
            if self.continue_on_failure {
                let attempt = self.state.next_attempt(pid);
                let step = failed_step(
                    pid,
                    Map::new(),
                    attempt,
                    IssueCode::CompositionMissingDependency,
                    format!("dependencies did not succeed: {}", blocked.join(", ")),
                );
                self.record(&step);
            } else {
                tracing::debug!(primitive_id = pid, blocked = ?blocked, "skipping primitive");
                self.state.mark_skipped(pid);
            }
            return ControlFlow::Continue(Prepared::NotRun);
        }

        // Operators that govern nothing fire once, before the first
        // primitive they feed.
        for idx in 0..bp.bindings.len() {
            let binding = &bp.bindings[idx];
            if !binding.governed.is_empty() || self.finished.contains(&binding.operator.id) || !binding.feeds(pid) {
                continue;
            }
            self.ensure_started(idx);
            let mut decision = self.hook(idx, None, 1, |i, ctx| i.before_execute(ctx));
            if let Decision::Continue { outputs } = &decision {
                self.apply_outputs(idx, outputs);
                decision = self.hook(idx, None, 1, |i, ctx| i.after_execute(&[], ctx));
            }
            let kind = decision.kind();
            if let Control::Retry(_) = self.resolve(vec![(idx, decision)], Stage::Entry, Some(pid)).await? {
                tracing::warn!(operator_id = binding.operator.id.as_str(), "retry ignored: operator governs nothing");
            }
            self.finish_operator(idx, kind);
        }
        if self.state.is_skipped(pid) {
            return ControlFlow::Continue(Prepared::NotRun);
        }

        let upcoming = self.state.attempts.get(pid).copied().unwrap_or(0) + 1;
        let mut decisions = Vec::new();
        for idx in 0..bp.bindings.len() {
            let binding = &bp.bindings[idx];
            if binding.governs(pid) && !self.finished.contains(&binding.operator.id) {
                self.ensure_started(idx);
                decisions.push((idx, self.hook(idx, Some(pid), upcoming, |i, ctx| i.before_execute(ctx))));
            }
        }
        match self.resolve(decisions, Stage::Before, Some(pid)).await? {
            Control::Serve(output) => {
                let attempt = self.state.next_attempt(pid);
                let input = self.state.assembled.get(pid).cloned().unwrap_or_default();
                tracing::debug!(primitive_id = pid, attempt, "serving primitive from operator");
                return ControlFlow::Continue(Prepared::Served(served_step(pid, input, output, attempt)));
            }
            Control::Skip => {
                self.state.mark_skipped(pid);
                return ControlFlow::Continue(Prepared::NotRun);
            }
            Control::Proceed | Control::Retry(_) => {}
        }
        if self.state.is_skipped(pid) {
            return ControlFlow::Continue(Prepared::NotRun);
        }

        let attempt = self.state.next_attempt(pid);
        let Some(primitive) = bp.primitives.get(pid) else {
            let step = failed_step(
                pid,
                Map::new(),
                attempt,
                IssueCode::PrimitiveExecutorMissing,
                format!("no definition for primitive '{pid}'"),
            );
            return ControlFlow::Continue(Prepared::Served(step));
        };
        let (input, missing) = self.assemble_input(primitive);
        ControlFlow::Continue(Prepared::Job(StepJob {
            primitive: primitive.clone(),
            input,
            missing,
            ctx: ExecutionContext {
                execution_id: self.execution_id,
                composition_id: bp.composition.id.clone(),
                attempt,
                state: self.state.shared.clone(),
            },
            executor: self.engine.executors.resolve(pid),
            timeout: self.engine.config.step_timeout_secs.map(Duration::from_secs),
            outputs: serde_json::to_value(&self.state.outputs).unwrap_or(Value::Null),
        }))
    }

    /// Operator-assembled values plus each required key, resolved from the
    /// nearest completed ancestor and then from the seed input.
    fn assemble_input(&self, primitive: &Primitive) -> (Map<String, Value>, Vec<String>) {
        let mut input = self.state.assembled.get(&primitive.id).cloned().unwrap_or_default();
        let ancestors = self.bp.ancestors.get(&primitive.id);
        let mut missing = Vec::new();

        for key in &primitive.inputs_required {
            if input.contains_key(key) {
                continue;
            }
            let upstream = self
                .state
                .completed
                .iter()
                .rev()
                .filter(|c| ancestors.is_some_and(|a| a.contains(*c)))
                .find_map(|c| self.state.outputs.get(c).and_then(|o| o.get(key)));
            match upstream.or_else(|| self.state.input.get(key)) {
                Some(value) => {
                    input.insert(key.clone(), value.clone());
                }
                None => missing.push(key.clone()),
            }
        }
        (input, missing)
    }

    /// Record an attempt and run its after hooks, retrying while an
    /// operator asks for it.
    async fn complete(&mut self, mut step: ExecutionStep) -> Flow {
        loop {
            let pid = step.primitive_id.clone();
            let Some(delay_ms) = self.after_primitive(&step).await? else {
                return ControlFlow::Continue(());
            };
            match self.retry(&pid, delay_ms).await? {
                Some(next) => step = next,
                None => return ControlFlow::Continue(()),
            }
        }
    }

    /// Returns the retry delay when an operator asks for another attempt.
    async fn after_primitive(&mut self, step: &ExecutionStep) -> Flow<Option<u64>> {
        let bp = self.bp;
        self.record(step);

        let Some(primitive) = bp.primitives.get(&step.primitive_id) else {
            return ControlFlow::Continue(None);
        };
        let mut decisions = Vec::new();
        for idx in 0..bp.bindings.len() {
            let binding = &bp.bindings[idx];
            if binding.governs(&primitive.id) && !self.finished.contains(&binding.operator.id) {
                decisions.push((
                    idx,
                    self.hook(idx, None, step.attempt, |i, ctx| i.after_primitive_execute(primitive, step, ctx)),
                ));
            }
        }
        match self.resolve(decisions, Stage::AfterPrimitive, Some(&primitive.id)).await? {
            Control::Retry(delay) => ControlFlow::Continue(Some(delay)),
            _ => ControlFlow::Continue(None),
        }
    }

    /// Run another attempt of `pid`. `None` when the attempt was not run.
    async fn retry(&mut self, pid: &str, delay_ms: u64) -> Flow<Option<ExecutionStep>> {
        let bp = self.bp;
        let Some(pid) = bp.order.iter().find(|p| *p == pid).map(String::as_str) else {
            return ControlFlow::Continue(None);
        };
        let attempts = self.state.attempts.get(pid).copied().unwrap_or(0);
        if attempts >= MAX_ATTEMPTS {
            self.note(
                ExecutionIssue::new(
                    IssueCode::OperatorRetryExhausted,
                    format!("primitive '{pid}' reached {MAX_ATTEMPTS} attempts"),
                )
                .for_primitive(pid),
            );
            return ControlFlow::Break(ExecutionStatus::Terminated);
        }

        let delay_ms = delay_ms.min(MAX_RETRY_DELAY_MS);
        tracing::info!(primitive_id = pid, attempt = attempts + 1, delay_ms, "retrying primitive");
        if delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
        }

        // A retried primitive runs again even if an earlier decision skipped it.
        self.state.skipped.remove(pid);
        match self.prepare(pid).await? {
            Prepared::Job(job) => ControlFlow::Continue(launch(vec![job]).await.pop()),
            Prepared::Served(step) => ControlFlow::Continue(Some(step)),
            Prepared::NotRun => ControlFlow::Continue(None),
        }
    }

    /// Run `after_execute` for every operator whose governed primitives have
    /// all settled.
    async fn settle(&mut self) -> Flow {
        let bp = self.bp;
        while let Some(idx) = self.next_settled() {
            let binding = &bp.bindings[idx];
            let op_id = binding.operator.id.as_str();

            if !binding.governed.iter().any(|g| self.state.statuses.contains_key(g)) {
                tracing::debug!(operator_id = op_id, "no governed primitive ran");
                self.finish_operator(idx, "skip");
                continue;
            }

            self.ensure_started(idx);
            let steps = self.operator_steps.get(op_id).cloned().unwrap_or_default();
            let decision = self.hook(idx, None, 1, |i, ctx| i.after_execute(&steps, ctx));
            let kind = decision.kind();
            let absorbs = binding.absorbs_failures() && matches!(decision, Decision::Continue { .. });

            match self.resolve(vec![(idx, decision)], Stage::AfterExecute, None).await? {
                Control::Retry(delay) => {
                    let target = binding
                        .operator
                        .param_str("target")
                        .filter(|t| binding.governs(t))
                        .or_else(|| binding.governed.first().map(String::as_str));
                    let Some(target) = target else {
                        self.finish_operator(idx, kind);
                        continue;
                    };
                    match self.retry(target, delay).await? {
                        Some(step) => self.complete(step).await?,
                        None => self.finish_operator(idx, kind),
                    }
                }
                _ => {
                    if absorbs {
                        for g in &binding.governed {
                            if self.state.is_failed(g) {
                                self.absorbed.insert(g.clone());
                            }
                        }
                    }
                    self.finish_operator(idx, kind);
                }
            }
        }
        ControlFlow::Continue(())
    }

    fn next_settled(&self) -> Option<usize> {
        self.bp.bindings.iter().position(|b| {
            !b.governed.is_empty()
                && !self.finished.contains(&b.operator.id)
                && b
                    .governed
                    .iter()
                    .all(|g| self.state.statuses.contains_key(g) || self.state.is_skipped(g))
        })
    }

    // -----------------------------------------------------------------------
    // Decisions
    // -----------------------------------------------------------------------

    fn hook<F>(&mut self, idx: usize, current: Option<&str>, attempt: u32, f: F) -> Decision
    where
        F: FnOnce(&dyn OperatorInterpreter, &mut OperatorContext<'_>) -> Decision,
    {
        let bp = self.bp;
        let binding = &bp.bindings[idx];
        let mut ctx = OperatorContext {
            execution_id: self.execution_id,
            operator: &binding.operator,
            composition: &bp.composition,
            state: &mut self.state,
            conditions: &mut self.conditions,
            governed: &binding.governed,
            downstream: &binding.downstream,
            current,
            attempt,
            started_at: self.started_at,
            now: Utc::now(),
        };
        f(binding.interpreter, &mut ctx)
    }

    /// Apply decisions made at one point. Outputs of every `Continue` are
    /// assembled; a halting decision wins by precedence; other decisions
    /// apply their effects and the strongest control for `current` is
    /// returned.
    async fn resolve(&mut self, decisions: Vec<(usize, Decision)>, stage: Stage, current: Option<&str>) -> Flow<Control> {
        let bp = self.bp;
        let mut pending = Vec::new();
        for (idx, decision) in decisions {
            match decision {
                Decision::Continue { outputs } => self.apply_outputs(idx, &outputs),
                other => pending.push((idx, other)),
            }
        }

        let halting = pending
            .iter()
            .enumerate()
            .filter(|(_, (_, d))| d.halts())
            .min_by_key(|(_, (_, d))| std::cmp::Reverse(d.precedence()))
            .map(|(pos, _)| pos);
        if let Some(pos) = halting {
            let (idx, decision) = pending.swap_remove(pos);
            return ControlFlow::Break(self.halt(idx, decision, stage).await);
        }

        let mut control = Control::Proceed;
        let mut offer = |next: Control| {
            if next.rank() > control.rank() {
                control = next;
            }
        };
        for (idx, decision) in pending {
            let binding = &bp.bindings[idx];
            let op_id = binding.operator.id.as_str();
            match decision {
                Decision::Skip { served } => {
                    if stage == Stage::Before && current.is_some_and(|p| binding.governs(p)) {
                        offer(served.map_or(Control::Skip, Control::Serve));
                    } else {
                        self.skip_downstream(idx, None);
                    }
                }
                Decision::Branch { target } => {
                    tracing::info!(operator_id = op_id, target = target.as_str(), "operator selected branch");
                    self.emit(OperatorEvent::OperatorBranch {
                        execution_id: self.execution_id,
                        operator_id: op_id.to_string(),
                        target: target.clone(),
                    });
                    self.skip_downstream(idx, Some(&target));
                }
                Decision::Retry { delay_ms } => match stage {
                    Stage::AfterPrimitive | Stage::AfterExecute => offer(Control::Retry(delay_ms)),
                    Stage::Entry | Stage::Before => {
                        tracing::warn!(operator_id = op_id, "retry ignored before the primitive ran");
                    }
                },
                Decision::Checkpoint { state, .. } => {
                    self.state.operator_entry(op_id).insert("checkpoint".into(), state);
                    let next_index = self.resume_index(stage);
                    self.save_checkpoint(CheckpointReason::Manual, next_index).await;
                }
                Decision::Continue { .. } | Decision::Terminate { .. } | Decision::Escalate { .. } => {}
            }
        }
        ControlFlow::Continue(control)
    }

    async fn halt(&mut self, idx: usize, decision: Decision, stage: Stage) -> ExecutionStatus {
        let bp = self.bp;
        let binding = &bp.bindings[idx];
        let op_id = binding.operator.id.as_str();
        let kind = decision.kind();

        let issue = match decision {
            Decision::Terminate { reason } if binding.is_retry() => {
                ExecutionIssue::new(IssueCode::OperatorRetryExhausted, reason)
            }
            Decision::Terminate { reason } => ExecutionIssue::new(IssueCode::OperatorTerminated, reason),
            Decision::Escalate { reason } => ExecutionIssue::new(IssueCode::OperatorEscalated, reason),
            Decision::Checkpoint { state, .. } => {
                self.state.operator_entry(op_id).insert("checkpoint".into(), state);
                let next_index = self.resume_index(stage);
                self.save_checkpoint(CheckpointReason::Manual, next_index).await;
                ExecutionIssue::new(
                    IssueCode::OperatorTerminated,
                    format!("operator '{op_id}' checkpointed and stopped the execution"),
                )
            }
            other => ExecutionIssue::new(IssueCode::OperatorTerminated, format!("unexpected {} decision", other.kind())),
        };

        tracing::warn!(
            execution_id = %self.execution_id,
            operator_id = op_id,
            code = issue.code.as_str(),
            "operator halted execution: {}",
            issue.message
        );
        self.issues.push(issue.for_operator(op_id));
        self.finish_operator(idx, kind);
        ExecutionStatus::Terminated
    }

    fn apply_outputs(&mut self, idx: usize, outputs: &Map<String, Value>) {
        if outputs.is_empty() {
            return;
        }
        let binding = &self.bp.bindings[idx];
        for target in &binding.downstream {
            self.state.assemble(target, outputs);
        }
        let slot = self.operator_outputs.entry(binding.operator.id.clone()).or_default();
        for (key, value) in outputs {
            slot.insert(key.clone(), value.clone());
        }
    }

    fn skip_downstream(&mut self, idx: usize, except: Option<&str>) {
        let binding = &self.bp.bindings[idx];
        for target in &binding.downstream {
            if Some(target.as_str()) != except && !self.state.statuses.contains_key(target) {
                self.state.mark_skipped(target);
            }
        }
    }

    fn resume_index(&self, stage: Stage) -> usize {
        match stage {
            Stage::Entry | Stage::Before => self.unit.start,
            Stage::AfterPrimitive | Stage::AfterExecute => self.unit.end,
        }
    }

    // -----------------------------------------------------------------------
    // Bookkeeping
    // -----------------------------------------------------------------------

    fn record(&mut self, step: &ExecutionStep) {
        let bp = self.bp;
        tracing::debug!(
            execution_id = %self.execution_id,
            primitive_id = step.primitive_id.as_str(),
            attempt = step.attempt,
            status = ?step.status,
            duration_ms = step.duration_ms,
            "primitive attempt finished"
        );
        self.state.record_outcome(&step.primitive_id, step.status, &step.output);
        for binding in bp.bindings.iter().filter(|b| b.governs(&step.primitive_id)) {
            self.operator_steps
                .entry(binding.operator.id.clone())
                .or_default()
                .push(step.clone());
        }
        self.steps.push(step.clone());
        self.since_checkpoint += 1;
    }

    fn ensure_started(&mut self, idx: usize) {
        let operator = &self.bp.bindings[idx].operator;
        if self.started.insert(operator.id.clone()) {
            self.emit(OperatorEvent::OperatorStarted {
                execution_id: self.execution_id,
                operator_id: operator.id.clone(),
                operator_type: operator.operator_type.as_str().to_string(),
            });
        }
    }

    fn finish_operator(&mut self, idx: usize, decision: &str) {
        let operator = &self.bp.bindings[idx].operator;
        if self.finished.insert(operator.id.clone()) {
            self.emit(OperatorEvent::OperatorCompleted {
                execution_id: self.execution_id,
                operator_id: operator.id.clone(),
                decision: decision.to_string(),
            });
        }
    }

    fn report_coverage_gaps(&self) {
        for binding in self.bp.bindings.iter().filter(|b| !b.interpreter.changes_behavior()) {
            tracing::debug!(
                operator_id = binding.operator.id.as_str(),
                operator_type = binding.operator.operator_type.as_str(),
                "operator type has no runtime behavior"
            );
            self.emit(OperatorEvent::OperatorCoverageGap {
                execution_id: self.execution_id,
                operator_id: binding.operator.id.clone(),
                operator_type: binding.operator.operator_type.as_str().to_string(),
                reason: CoverageGapReason::NoopInterpreter,
            });
        }
    }

    fn emit(&self, event: OperatorEvent) {
        if let Some(sink) = &self.engine.sink {
            sink.emit(&event);
        }
    }

    async fn save_checkpoint(&mut self, reason: CheckpointReason, next_index: usize) {
        let bp = self.bp;
        let snapshot = RunSnapshot {
            state: self.state.clone(),
            started: self.started.clone(),
            finished: self.finished.clone(),
            operator_steps: self.operator_steps.clone(),
            absorbed: self.absorbed.clone(),
        };
        let (state, missing_state_keys) = snapshot.to_checkpoint_state();
        if !missing_state_keys.is_empty() {
            tracing::warn!(missing = ?missing_state_keys, "checkpoint omits oversized values");
        }
        let checkpoint = Checkpoint {
            id: Uuid::now_v7().to_string(),
            execution_id: self.execution_id,
            composition_id: bp.composition.id.clone(),
            graph_version: bp.composition.graph_version,
            order: bp.order.clone(),
            next_index,
            state,
            missing_state_keys,
            continue_on_failure: self.continue_on_failure,
            reason,
            created_at: Utc::now(),
        };
        self.since_checkpoint = 0;

        let saved = if self.engine.store_accepted() {
            self.engine.store.save_checkpoint(&checkpoint).await
        } else {
            Err(CheckpointError::NotDurable)
        };
        match saved {
            Ok(()) => {
                tracing::info!(
                    execution_id = %self.execution_id,
                    checkpoint_id = checkpoint.id.as_str(),
                    reason = reason.as_str(),
                    next_index,
                    "checkpoint saved"
                );
                self.checkpoint_ids.push(checkpoint.id);
            }
            Err(e) => {
                tracing::error!(
                    execution_id = %self.execution_id,
                    code = e.code(),
                    error = %e,
                    "failed to save checkpoint"
                );
                let code = match e {
                    CheckpointError::NotDurable => IssueCode::CheckpointStoreNotDurable,
                    _ => IssueCode::CheckpointSaveFailed,
                };
                self.issues.push(ExecutionIssue::new(code, format!("checkpoint save failed: {e}")));
                if let Some(handler) = &self.engine.on_checkpoint_error {
                    handler(&e, &checkpoint);
                }
            }
        }
    }

    fn finish(self, status: ExecutionStatus) -> ExecutionResult {
        let mut issues = Vec::new();
        for pid in &self.bp.order {
            if let Some(step) = self.steps.iter().rev().find(|s| &s.primitive_id == pid) {
                issues.extend(step.issues.iter().cloned());
            }
        }
        issues.extend(self.issues);

        tracing::info!(
            execution_id = %self.execution_id,
            composition_id = self.bp.composition.id.as_str(),
            status = ?status,
            steps = self.steps.len(),
            duration_ms = self.clock.elapsed().as_millis() as u64,
            "composition execution finished"
        );

        ExecutionResult {
            execution_id: self.execution_id,
            composition_id: self.bp.composition.id.clone(),
            status,
            order: self.bp.order.clone(),
            steps: self.steps,
            outputs: self.state.outputs.clone(),
            operator_outputs: self.operator_outputs,
            issues,
            checkpoint_ids: self.checkpoint_ids,
            skipped: self.state.skipped.iter().cloned().collect(),
            condition_errors: self.conditions.error_count(),
            state: self.state,
        }
    }
}

/// Run attempts concurrently and return their steps in job order.
async fn launch(jobs: Vec<StepJob>) -> Vec<ExecutionStep> {
    let placeholders: Vec<(String, u32)> = jobs.iter().map(|j| (j.primitive.id.clone(), j.ctx.attempt)).collect();
    let mut results: Vec<Option<ExecutionStep>> = vec![None; jobs.len()];

    let mut set = JoinSet::new();
    for (i, job) in jobs.into_iter().enumerate() {
        set.spawn(async move { (i, run_step(job).await) });
    }
    while let Some(joined) = set.join_next().await {
        match joined {
            Ok((i, step)) => results[i] = Some(step),
            Err(e) => tracing::error!(error = %e, "primitive task did not complete"),
        }
    }

    results
        .into_iter()
        .zip(placeholders)
        .map(|(step, (pid, attempt))| {
            step.unwrap_or_else(|| {
                failed_step(&pid, Map::new(), attempt, IssueCode::PrimitiveExecutionFailed, "primitive task was aborted")
            })
        })
        .collect()
}
