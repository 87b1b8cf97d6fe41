//! Primitive executors: the side-effecting work behind each primitive.
//!
//! The engine never performs I/O itself. It hands each primitive's private
//! input to a [`PrimitiveExecutor`] resolved from an [`ExecutorRegistry`]
//! and records the result as an `ExecutionStep`.

pub mod box_executor;
pub mod model;
pub mod registry;

pub use box_executor::{BoxPrimitiveExecutor, PrimitiveExecutorDyn};
pub use model::{ChatModel, ModelExecutor, ModelExecutorConfig};
pub use registry::{ExecutorRegistry, FnExecutor};

use serde_json::{Map, Value};
use technique_types::composition::Primitive;
use technique_types::execution::IssueCode;
use uuid::Uuid;

/// Read-only facts about the execution a primitive runs in.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub execution_id: Uuid,
    pub composition_id: String,
    /// 1-based attempt number for this primitive.
    pub attempt: u32,
    /// Snapshot of the shared execution state when the attempt started.
    pub state: Map<String, Value>,
}

/// Errors a primitive executor may report.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ExecutorError {
    #[error("execution failed: {0}")]
    Failed(String),

    #[error("execution timed out after {0}ms")]
    Timeout(u64),

    #[error("executor returned invalid output: {0}")]
    InvalidOutput(String),

    #[error("no executor registered for primitive '{0}'")]
    Missing(String),
}

impl ExecutorError {
    pub fn code(&self) -> &'static str {
        self.issue_code().as_str()
    }

    /// The step issue this error is reported as.
    pub fn issue_code(&self) -> IssueCode {
        match self {
            ExecutorError::Failed(_) => IssueCode::PrimitiveExecutionFailed,
            ExecutorError::Timeout(_) => IssueCode::PrimitiveExecutionTimeout,
            ExecutorError::InvalidOutput(_) => IssueCode::ExecutionOutputInvalid,
            ExecutorError::Missing(_) => IssueCode::PrimitiveExecutorMissing,
        }
    }
}

/// Runs one primitive.
///
/// Uses native async fn in traits (Rust 2024 edition, no async_trait macro).
/// For dynamic dispatch use [`BoxPrimitiveExecutor`].
pub trait PrimitiveExecutor: Send + Sync {
    fn execute(
        &self,
        primitive: &Primitive,
        input: &Map<String, Value>,
        ctx: &ExecutionContext,
    ) -> impl std::future::Future<Output = Result<Map<String, Value>, ExecutorError>> + Send;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_codes_map_to_issue_codes() {
        assert_eq!(ExecutorError::Failed("x".into()).code(), "primitive_execution_failed");
        assert_eq!(ExecutorError::Timeout(10).code(), "primitive_execution_timeout");
        assert_eq!(ExecutorError::InvalidOutput("x".into()).code(), "execution_output_invalid");
        assert_eq!(
            ExecutorError::Missing("p".into()).issue_code(),
            IssueCode::PrimitiveExecutorMissing
        );
    }
}
