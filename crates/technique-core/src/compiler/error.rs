use crate::semantics::SemanticsError;

/// Structural errors in a composition. Compilation and execution both stop
/// on the first one; no partial plan is produced.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CompileError {
    #[error("duplicate primitive id '{0}'")]
    DuplicatePrimitive(String),

    #[error("duplicate operator id '{0}'")]
    DuplicateOperator(String),

    #[error("composition references unknown primitive '{0}'")]
    UnknownPrimitive(String),

    #[error("operator '{operator_id}' references unknown ids: {}", missing.join(", "))]
    MissingOperatorRefs {
        operator_id: String,
        missing: Vec<String>,
    },

    #[error("relationships reference unknown ids: {}", missing.join(", "))]
    MissingRelationshipRefs { missing: Vec<String> },

    #[error("operator '{operator_id}' needs at least {expected} inputs, got {actual}")]
    TooFewInputs {
        operator_id: String,
        expected: usize,
        actual: usize,
    },

    #[error("operator '{operator_id}' accepts at most {expected} inputs, got {actual}")]
    TooManyInputs {
        operator_id: String,
        expected: usize,
        actual: usize,
    },

    #[error("operator '{operator_id}' needs at least {expected} outputs, got {actual}")]
    MissingOutputs {
        operator_id: String,
        expected: usize,
        actual: usize,
    },

    #[error("operator '{operator_id}' accepts at most {expected} outputs, got {actual}")]
    TooManyOutputs {
        operator_id: String,
        expected: usize,
        actual: usize,
    },

    #[error("operator '{operator_id}' is missing parameters: {}", missing.join(", "))]
    MissingParameters {
        operator_id: String,
        missing: Vec<String>,
    },

    #[error(transparent)]
    Semantics(#[from] SemanticsError),

    #[error("cycle detected involving '{0}'")]
    CycleDetected(String),
}

impl CompileError {
    /// Stable machine-readable code.
    pub fn code(&self) -> &'static str {
        match self {
            CompileError::DuplicatePrimitive(_) => "composition_duplicate_primitive",
            CompileError::DuplicateOperator(_) => "composition_duplicate_operator",
            CompileError::UnknownPrimitive(_) => "composition_unknown_primitive",
            CompileError::MissingOperatorRefs { .. } => "composition_missing_operator_refs",
            CompileError::MissingRelationshipRefs { .. } => "composition_missing_relationship_refs",
            CompileError::TooFewInputs { .. } => "operator_too_few_inputs",
            CompileError::TooManyInputs { .. } => "operator_too_many_inputs",
            CompileError::MissingOutputs { .. } => "operator_missing_outputs",
            CompileError::TooManyOutputs { .. } => "operator_too_many_outputs",
            CompileError::MissingParameters { .. } => "operator_missing_parameters",
            CompileError::Semantics(e) => e.code(),
            CompileError::CycleDetected(_) => "composition_cycle_detected",
        }
    }
}
