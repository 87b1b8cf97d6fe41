//! Execution records: per-primitive steps and coded issues.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

// ---------------------------------------------------------------------------
// Issue codes
// ---------------------------------------------------------------------------

/// Stable, machine-readable codes attached to execution issues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueCode {
    ContractInputMissingRequired,
    ContractPreconditionFailed,
    ContractOutputTypeInvalid,
    ContractPostconditionFailed,
    PrimitiveExecutionFailed,
    PrimitiveExecutionTimeout,
    PrimitiveExecutorMissing,
    ExecutionOutputInvalid,
    CompositionMissingDependency,
    OperatorTerminated,
    OperatorEscalated,
    OperatorRetryExhausted,
    CheckpointSaveFailed,
    CheckpointStoreNotDurable,
    CheckpointStoreMissing,
    CheckpointStateIncomplete,
}

impl IssueCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            IssueCode::ContractInputMissingRequired => "contract_input_missing_required",
            IssueCode::ContractPreconditionFailed => "contract_precondition_failed",
            IssueCode::ContractOutputTypeInvalid => "contract_output_type_invalid",
            IssueCode::ContractPostconditionFailed => "contract_postcondition_failed",
            IssueCode::PrimitiveExecutionFailed => "primitive_execution_failed",
            IssueCode::PrimitiveExecutionTimeout => "primitive_execution_timeout",
            IssueCode::PrimitiveExecutorMissing => "primitive_executor_missing",
            IssueCode::ExecutionOutputInvalid => "execution_output_invalid",
            IssueCode::CompositionMissingDependency => "composition_missing_dependency",
            IssueCode::OperatorTerminated => "operator_terminated",
            IssueCode::OperatorEscalated => "operator_escalated",
            IssueCode::OperatorRetryExhausted => "operator_retry_exhausted",
            IssueCode::CheckpointSaveFailed => "checkpoint_save_failed",
            IssueCode::CheckpointStoreNotDurable => "checkpoint_store_not_durable",
            IssueCode::CheckpointStoreMissing => "checkpoint_store_missing",
            IssueCode::CheckpointStateIncomplete => "checkpoint_state_incomplete",
        }
    }
}

impl fmt::Display for IssueCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A coded problem observed during execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionIssue {
    pub code: IssueCode,
    pub message: String,
    /// Primitive the issue belongs to, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub primitive_id: Option<String>,
    /// Operator that raised the issue, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operator_id: Option<String>,
}

impl ExecutionIssue {
    pub fn new(code: IssueCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            primitive_id: None,
            operator_id: None,
        }
    }

    pub fn for_primitive(mut self, primitive_id: impl Into<String>) -> Self {
        self.primitive_id = Some(primitive_id.into());
        self
    }

    pub fn for_operator(mut self, operator_id: impl Into<String>) -> Self {
        self.operator_id = Some(operator_id.into());
        self
    }
}

// ---------------------------------------------------------------------------
// ExecutionStep
// ---------------------------------------------------------------------------

/// Outcome of one primitive execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Success,
    /// Ran, but under-delivered (postcondition failure).
    Partial,
    /// Did not run, or crashed.
    Failed,
}

impl StepStatus {
    /// Whether downstream primitives may consume this step's output.
    pub fn is_usable(&self) -> bool {
        matches!(self, StepStatus::Success | StepStatus::Partial)
    }
}

/// Record of one primitive execution attempt. Immutable once emitted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionStep {
    pub primitive_id: String,
    pub input: Map<String, Value>,
    pub output: Map<String, Value>,
    pub status: StepStatus,
    #[serde(default)]
    pub issues: Vec<ExecutionIssue>,
    /// 1-based attempt number for this primitive within the execution.
    pub attempt: u32,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub duration_ms: u64,
}

impl ExecutionStep {
    pub fn is_success(&self) -> bool {
        self.status == StepStatus::Success
    }

    pub fn has_issue(&self, code: IssueCode) -> bool {
        self.issues.iter().any(|i| i.code == code)
    }
}

// ---------------------------------------------------------------------------
// Run status
// ---------------------------------------------------------------------------

/// Terminal status of an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Completed,
    Failed,
    Terminated,
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ExecutionStatus::Completed => "completed",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::Terminated => "terminated",
        };
        f.write_str(s)
    }
}
