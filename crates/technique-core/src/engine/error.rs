use crate::checkpoint::CheckpointError;
use crate::compiler::CompileError;

/// Errors that stop an execution before any primitive runs.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Pre-flight validation failed; `code` names the specific check.
    #[error("composition setup failed ({code}): {message}")]
    SetupFailed { code: &'static str, message: String },

    /// A checkpoint cannot be resumed from.
    #[error("resume rejected ({code}): {message}")]
    ResumeRejected { code: &'static str, message: String },

    #[error(transparent)]
    Compile(#[from] CompileError),

    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),
}

impl EngineError {
    pub(crate) fn setup(code: &'static str, message: impl Into<String>) -> Self {
        EngineError::SetupFailed {
            code,
            message: message.into(),
        }
    }

    pub(crate) fn resume(code: &'static str, message: impl Into<String>) -> Self {
        EngineError::ResumeRejected {
            code,
            message: message.into(),
        }
    }

    /// Top-level error code.
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::SetupFailed { .. } => "composition_setup_failed",
            EngineError::ResumeRejected { code, .. } => code,
            EngineError::Compile(e) => e.code(),
            EngineError::Checkpoint(e) => e.code(),
        }
    }

    /// The specific check that failed; equal to `code()` except for setup
    /// failures.
    pub fn sub_code(&self) -> &'static str {
        match self {
            EngineError::SetupFailed { code, .. } => code,
            other => other.code(),
        }
    }
}
