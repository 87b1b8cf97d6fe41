//! Execution engine: runs a composition's primitives in dependency order
//! while operator interpreters steer control flow.
//!
//! An execution is set up in three phases before any primitive runs:
//! input validation, composition validation and ordering, and (on resume)
//! checkpoint validation. Setup problems are returned as [`EngineError`];
//! everything after that is reported inside [`ExecutionResult`].

mod error;
mod run;
mod setup;
mod snapshot;
mod step;

pub use error::EngineError;
pub use snapshot::MAX_CHECKPOINT_VALUE_BYTES;

use std::collections::BTreeMap;
use std::sync::Arc;

use dashmap::DashSet;
use serde::Serialize;
use serde_json::{Map, Value};
use technique_types::checkpoint::Checkpoint;
use technique_types::composition::{Composition, Primitive};
use technique_types::config::EngineConfig;
use technique_types::execution::{ExecutionIssue, ExecutionStatus, ExecutionStep, IssueCode};
use technique_types::plan::AdequacyReport;
use uuid::Uuid;

use crate::checkpoint::{CheckpointError, CheckpointStore, MemoryCheckpointStore};
use crate::event::OperatorEventSink;
use crate::executor::ExecutorRegistry;
use crate::interpreter::ExecutionState;
use crate::semantics::SemanticsRegistry;

use run::Run;
use setup::{Blueprint, validate_input};
use snapshot::RunSnapshot;

/// Attempts allowed per primitive before a retry is refused.
pub const MAX_ATTEMPTS: u32 = 1000;

/// Callback invoked when a checkpoint cannot be saved.
pub type CheckpointErrorHandler = Arc<dyn Fn(&CheckpointError, &Checkpoint) + Send + Sync>;

// ---------------------------------------------------------------------------
// Request / result
// ---------------------------------------------------------------------------

/// What to run.
#[derive(Debug, Clone)]
pub struct ExecutionRequest<'a> {
    pub composition: &'a Composition,
    pub primitives: &'a [Primitive],
    /// Seed input; becomes the initial shared state.
    pub input: Map<String, Value>,
    /// Gaps to enforce as synthesized gates.
    pub adequacy: Option<&'a AdequacyReport>,
}

impl<'a> ExecutionRequest<'a> {
    pub fn new(composition: &'a Composition, primitives: &'a [Primitive]) -> Self {
        Self {
            composition,
            primitives,
            input: Map::new(),
            adequacy: None,
        }
    }

    pub fn with_input(mut self, input: Map<String, Value>) -> Self {
        self.input = input;
        self
    }

    pub fn with_adequacy(mut self, report: &'a AdequacyReport) -> Self {
        self.adequacy = Some(report);
        self
    }
}

/// Outcome of an execution that got past setup.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionResult {
    pub execution_id: Uuid,
    pub composition_id: String,
    pub status: ExecutionStatus,
    /// Execution order, concurrent units contiguous.
    pub order: Vec<String>,
    /// Every attempt, in completion order.
    pub steps: Vec<ExecutionStep>,
    pub state: ExecutionState,
    /// Latest usable output per primitive.
    pub outputs: BTreeMap<String, Map<String, Value>>,
    /// Values each operator contributed to downstream inputs.
    pub operator_outputs: BTreeMap<String, Map<String, Value>>,
    pub issues: Vec<ExecutionIssue>,
    pub checkpoint_ids: Vec<String>,
    pub skipped: Vec<String>,
    /// Malformed conditions seen by operators during the run.
    pub condition_errors: usize,
}

impl ExecutionResult {
    /// Latest attempt of a primitive.
    pub fn step(&self, primitive_id: &str) -> Option<&ExecutionStep> {
        self.steps.iter().rev().find(|s| s.primitive_id == primitive_id)
    }

    /// Every attempt of a primitive.
    pub fn attempts(&self, primitive_id: &str) -> impl Iterator<Item = &ExecutionStep> {
        self.steps.iter().filter(move |s| s.primitive_id == primitive_id)
    }

    pub fn has_issue(&self, code: IssueCode) -> bool {
        self.issues.iter().any(|i| i.code == code)
    }

    pub fn is_completed(&self) -> bool {
        self.status == ExecutionStatus::Completed
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// Runs compositions against registered primitive executors.
pub struct ExecutionEngine<S: CheckpointStore = MemoryCheckpointStore> {
    store: Arc<S>,
    executors: ExecutorRegistry,
    registry: SemanticsRegistry,
    config: EngineConfig,
    sink: Option<Arc<dyn OperatorEventSink>>,
    on_checkpoint_error: Option<CheckpointErrorHandler>,
    consumed: DashSet<String>,
}

impl<S: CheckpointStore> ExecutionEngine<S> {
    pub fn new(store: S, executors: ExecutorRegistry) -> Self {
        Self {
            store: Arc::new(store),
            executors,
            registry: SemanticsRegistry::builtin(),
            config: EngineConfig::default(),
            sink: None,
            on_checkpoint_error: None,
            consumed: DashSet::new(),
        }
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_registry(mut self, registry: SemanticsRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn with_event_sink(mut self, sink: Arc<dyn OperatorEventSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn with_checkpoint_error_handler<F>(mut self, handler: F) -> Self
    where
        F: Fn(&CheckpointError, &Checkpoint) + Send + Sync + 'static,
    {
        self.on_checkpoint_error = Some(Arc::new(handler));
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Run a composition from the start.
    pub async fn execute(&self, request: ExecutionRequest<'_>) -> Result<ExecutionResult, EngineError> {
        validate_input(&request.input)?;
        let blueprint = Blueprint::build(
            request.composition,
            request.primitives,
            request.adequacy,
            &self.registry,
        )?;
        self.check_store()?;

        let execution_id = Uuid::now_v7();
        tracing::info!(
            execution_id = %execution_id,
            composition_id = request.composition.id.as_str(),
            primitives = blueprint.order.len(),
            operators = blueprint.bindings.len(),
            "starting composition execution"
        );

        let run = Run::new(
            self,
            &blueprint,
            execution_id,
            RunSnapshot {
                state: ExecutionState::seeded(request.input),
                ..RunSnapshot::default()
            },
            self.config.continue_on_failure,
        );
        let units = blueprint.units_from(0);
        Ok(run.drive(units).await)
    }

    /// Continue an execution from a checkpoint. A checkpoint can be
    /// resumed at most once per engine.
    pub async fn resume(
        &self,
        request: ExecutionRequest<'_>,
        checkpoint: &Checkpoint,
    ) -> Result<ExecutionResult, EngineError> {
        if checkpoint.composition_id != request.composition.id {
            return Err(EngineError::resume(
                "composition_checkpoint_mismatch",
                format!(
                    "checkpoint '{}' belongs to composition '{}', not '{}'",
                    checkpoint.id, checkpoint.composition_id, request.composition.id
                ),
            ));
        }
        if checkpoint.next_index > checkpoint.order.len() {
            return Err(EngineError::resume(
                "composition_checkpoint_invalid_index",
                format!(
                    "next index {} is past the end of a {}-step order",
                    checkpoint.next_index,
                    checkpoint.order.len()
                ),
            ));
        }

        let blueprint = Blueprint::build(
            request.composition,
            request.primitives,
            request.adequacy,
            &self.registry,
        )?;
        if blueprint.order != checkpoint.order {
            return Err(EngineError::resume(
                "composition_checkpoint_mismatch",
                "execution order no longer matches the checkpoint",
            ));
        }
        self.check_store()?;

        let snapshot: RunSnapshot = serde_json::from_value(checkpoint.state.clone())
            .map_err(|e| EngineError::resume("composition_checkpoint_corrupt", e.to_string()))?;
        validate_input(&snapshot.state.input)?;
        validate_input(&snapshot.state.shared)?;

        if !self.consumed.insert(checkpoint.id.clone()) {
            return Err(EngineError::resume(
                "composition_checkpoint_consumed",
                format!("checkpoint '{}' was already resumed", checkpoint.id),
            ));
        }

        tracing::info!(
            execution_id = %checkpoint.execution_id,
            checkpoint_id = checkpoint.id.as_str(),
            next_index = checkpoint.next_index,
            reason = checkpoint.reason.as_str(),
            "resuming composition execution"
        );

        let mut run = Run::new(
            self,
            &blueprint,
            checkpoint.execution_id,
            snapshot,
            checkpoint.continue_on_failure,
        );
        if !checkpoint.missing_state_keys.is_empty() {
            run.note(ExecutionIssue::new(
                IssueCode::CheckpointStateIncomplete,
                format!("checkpoint omitted: {}", checkpoint.missing_state_keys.join(", ")),
            ));
        }
        let units = blueprint.units_from(checkpoint.next_index);
        Ok(run.drive(units).await)
    }

    /// Load a checkpoint from the store and resume it.
    pub async fn resume_from_store(
        &self,
        request: ExecutionRequest<'_>,
        checkpoint_id: &str,
    ) -> Result<ExecutionResult, EngineError> {
        let checkpoint = self
            .store
            .get_checkpoint(checkpoint_id)
            .await?
            .ok_or_else(|| CheckpointError::NotFound(checkpoint_id.to_string()))?;
        self.resume(request, &checkpoint).await
    }

    /// Whether checkpoints may be written to the configured store.
    fn store_accepted(&self) -> bool {
        self.store.is_durable() || self.config.allow_insecure_checkpoint_store
    }

    fn check_store(&self) -> Result<(), EngineError> {
        if self.config.checkpointing_enabled() && !self.store_accepted() {
            return Err(EngineError::setup(
                "checkpoint_store_not_durable",
                "checkpointing is enabled but the checkpoint store is not durable",
            ));
        }
        Ok(())
    }
}
