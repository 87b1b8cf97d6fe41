//! Operator semantics registry.
//!
//! Maps every operator type to its role, compile mode, arity bounds, and
//! required parameters. The built-in table is fixed; custom
//! `namespace:identifier` types may be added until the registry is locked.

use std::collections::HashMap;

use technique_types::composition::OperatorType;

// ---------------------------------------------------------------------------
// Semantics
// ---------------------------------------------------------------------------

/// How the plan compiler treats an operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompileMode {
    /// Translates into dependency edges between primitives.
    Edge,
    /// Materializes a gate node in the work plan.
    Checkpoint,
}

/// Broad category of an operator, used for descriptions and plan titles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperatorRole {
    Structural,
    Control,
    Resilience,
    Aggregation,
    Observation,
}

/// Declared behavior of one operator type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperatorSemantics {
    pub role: OperatorRole,
    pub description: String,
    pub compile: CompileMode,
    pub min_inputs: usize,
    pub max_inputs: Option<usize>,
    pub min_outputs: usize,
    pub max_outputs: Option<usize>,
    pub required_parameters: Vec<String>,
}

impl OperatorSemantics {
    pub fn new(role: OperatorRole, compile: CompileMode, description: &str) -> Self {
        Self {
            role,
            description: description.to_string(),
            compile,
            min_inputs: 0,
            max_inputs: None,
            min_outputs: 0,
            max_outputs: None,
            required_parameters: Vec::new(),
        }
    }

    pub fn inputs(mut self, min: usize, max: Option<usize>) -> Self {
        self.min_inputs = min;
        self.max_inputs = max;
        self
    }

    pub fn outputs(mut self, min: usize, max: Option<usize>) -> Self {
        self.min_outputs = min;
        self.max_outputs = max;
        self
    }

    pub fn requires(mut self, params: &[&str]) -> Self {
        self.required_parameters = params.iter().map(|p| p.to_string()).collect();
        self
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors from registry lookups and registration.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SemanticsError {
    #[error("invalid custom operator type '{0}': expected namespace:identifier")]
    InvalidCustomType(String),

    #[error("custom operator type '{0}' cannot override a built-in")]
    BuiltinOverride(String),

    #[error("semantics registry is locked; cannot register '{0}'")]
    RegistryLocked(String),

    #[error("no semantics registered for operator type '{0}'")]
    Missing(String),
}

impl SemanticsError {
    pub fn code(&self) -> &'static str {
        match self {
            SemanticsError::InvalidCustomType(_) => "semantics_invalid_custom_type",
            SemanticsError::BuiltinOverride(_) => "semantics_builtin_override",
            SemanticsError::RegistryLocked(_) => "semantics_registry_locked",
            SemanticsError::Missing(_) => "operator_semantics_missing",
        }
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Operator type to semantics lookup table.
#[derive(Debug, Clone)]
pub struct SemanticsRegistry {
    entries: HashMap<String, OperatorSemantics>,
    locked: bool,
}

impl Default for SemanticsRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

impl SemanticsRegistry {
    /// Registry holding the built-in operator table.
    pub fn builtin() -> Self {
        use CompileMode::{Checkpoint, Edge};
        use OperatorRole::*;

        let mut entries = HashMap::new();
        let mut put = |t: OperatorType, s: OperatorSemantics| {
            entries.insert(t.as_str().to_string(), s);
        };

        put(
            OperatorType::Sequence,
            OperatorSemantics::new(Structural, Edge, "run inputs in declared order").inputs(2, None),
        );
        put(
            OperatorType::Parallel,
            OperatorSemantics::new(Structural, Edge, "run inputs concurrently and merge outputs")
                .inputs(2, None),
        );
        put(
            OperatorType::Fanout,
            OperatorSemantics::new(Structural, Edge, "broadcast one input to many outputs")
                .inputs(1, Some(1))
                .outputs(2, None),
        );
        put(
            OperatorType::Fanin,
            OperatorSemantics::new(Structural, Edge, "join many inputs into one output")
                .inputs(2, None)
                .outputs(1, Some(1)),
        );
        put(
            OperatorType::Reduce,
            OperatorSemantics::new(Aggregation, Edge, "fold many inputs into one output")
                .inputs(2, None)
                .outputs(1, Some(1)),
        );
        put(
            OperatorType::Gate,
            OperatorSemantics::new(Control, Checkpoint, "block outputs until all conditions hold")
                .outputs(1, None),
        );
        put(
            OperatorType::Conditional,
            OperatorSemantics::new(Control, Checkpoint, "route to the first matching branch")
                .outputs(1, None),
        );
        put(
            OperatorType::Loop,
            OperatorSemantics::new(Control, Checkpoint, "repeat a target until a condition holds")
                .inputs(1, None),
        );
        put(
            OperatorType::Timebox,
            OperatorSemantics::new(Control, Checkpoint, "bound governed work by a deadline")
                .inputs(1, None),
        );
        put(
            OperatorType::BudgetCap,
            OperatorSemantics::new(Control, Checkpoint, "stop when accumulated cost exceeds a cap")
                .inputs(1, None)
                .requires(&["max_budget"]),
        );
        put(
            OperatorType::CircuitBreaker,
            OperatorSemantics::new(Resilience, Checkpoint, "stop calling after repeated failures")
                .inputs(1, None),
        );
        put(
            OperatorType::Retry,
            OperatorSemantics::new(Resilience, Edge, "re-run failed inputs").inputs(1, None),
        );
        put(
            OperatorType::Backoff,
            OperatorSemantics::new(Resilience, Edge, "re-run failed inputs with growing delays")
                .inputs(1, None),
        );
        put(
            OperatorType::Quorum,
            OperatorSemantics::new(Aggregation, Edge, "require a majority of agreeing results")
                .inputs(2, None)
                .requires(&["field"]),
        );
        put(
            OperatorType::Consensus,
            OperatorSemantics::new(Aggregation, Edge, "require unanimous or plurality agreement")
                .inputs(2, None)
                .requires(&["field"]),
        );
        put(
            OperatorType::Cache,
            OperatorSemantics::new(Resilience, Edge, "serve stored results for repeated work"),
        );
        put(
            OperatorType::Replay,
            OperatorSemantics::new(Observation, Edge, "hydrate state from a recorded snapshot")
                .requires(&["snapshot"]),
        );
        put(
            OperatorType::Monitor,
            OperatorSemantics::new(Observation, Edge, "summarize outcomes of watched signals")
                .inputs(1, None),
        );

        Self {
            entries,
            locked: false,
        }
    }

    /// Look up the semantics for an operator type.
    pub fn get(&self, operator_type: &OperatorType) -> Result<&OperatorSemantics, SemanticsError> {
        self.entries
            .get(operator_type.as_str())
            .ok_or_else(|| SemanticsError::Missing(operator_type.to_string()))
    }

    /// Register a custom `namespace:identifier` operator type.
    pub fn register(
        &mut self,
        type_name: &str,
        semantics: OperatorSemantics,
    ) -> Result<(), SemanticsError> {
        if self.locked {
            return Err(SemanticsError::RegistryLocked(type_name.to_string()));
        }
        if OperatorType::BUILTIN.iter().any(|t| t.as_str() == type_name) {
            return Err(SemanticsError::BuiltinOverride(type_name.to_string()));
        }
        if !is_valid_custom_type(type_name) {
            return Err(SemanticsError::InvalidCustomType(type_name.to_string()));
        }
        self.entries.insert(type_name.to_string(), semantics);
        Ok(())
    }

    /// Freeze the registry. Further registrations fail.
    pub fn lock(&mut self) {
        self.locked = true;
    }

    pub fn is_locked(&self) -> bool {
        self.locked
    }
}

/// Whether `name` matches `^[a-z][a-z0-9_-]*:[a-z][a-z0-9_-]*$`.
pub fn is_valid_custom_type(name: &str) -> bool {
    fn segment_ok(segment: &str) -> bool {
        let mut chars = segment.chars();
        match chars.next() {
            Some(c) if c.is_ascii_lowercase() => {}
            _ => return false,
        }
        chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-')
    }

    match name.split_once(':') {
        Some((namespace, ident)) => segment_ok(namespace) && segment_ok(ident),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_builtin_has_semantics() {
        let registry = SemanticsRegistry::builtin();
        for t in OperatorType::BUILTIN.iter() {
            assert!(registry.get(t).is_ok(), "missing semantics for {t}");
        }
    }

    #[test]
    fn compile_modes_match_operator_families() {
        let registry = SemanticsRegistry::builtin();
        assert_eq!(registry.get(&OperatorType::Sequence).unwrap().compile, CompileMode::Edge);
        assert_eq!(registry.get(&OperatorType::Gate).unwrap().compile, CompileMode::Checkpoint);
        assert_eq!(
            registry.get(&OperatorType::BudgetCap).unwrap().required_parameters,
            vec!["max_budget".to_string()]
        );
        let fanout = registry.get(&OperatorType::Fanout).unwrap();
        assert_eq!((fanout.min_inputs, fanout.max_inputs), (1, Some(1)));
    }

    #[test]
    fn custom_type_validation() {
        assert!(is_valid_custom_type("acme:score"));
        assert!(is_valid_custom_type("acme-labs:score_v2"));
        assert!(!is_valid_custom_type("Acme:score"));
        assert!(!is_valid_custom_type("acme"));
        assert!(!is_valid_custom_type("acme:9score"));
        assert!(!is_valid_custom_type("a:b:c"));
    }

    #[test]
    fn register_rejects_bad_names_and_overrides() {
        let mut registry = SemanticsRegistry::builtin();
        let s = OperatorSemantics::new(OperatorRole::Control, CompileMode::Edge, "custom");

        let err = registry.register("sequence", s.clone()).unwrap_err();
        assert_eq!(err.code(), "semantics_builtin_override");

        let err = registry.register("NoColon", s.clone()).unwrap_err();
        assert_eq!(err.code(), "semantics_invalid_custom_type");

        registry.register("acme:score", s.clone()).unwrap();
        let custom = OperatorType::Custom("acme:score".to_string());
        assert_eq!(registry.get(&custom).unwrap().description, "custom");
    }

    #[test]
    fn locked_registry_refuses_registration() {
        let mut registry = SemanticsRegistry::builtin();
        registry.lock();
        let s = OperatorSemantics::new(OperatorRole::Control, CompileMode::Edge, "custom");
        let err = registry.register("acme:late", s).unwrap_err();
        assert_eq!(err.code(), "semantics_registry_locked");
        assert!(registry.is_locked());
    }

    #[test]
    fn unknown_custom_type_is_missing() {
        let registry = SemanticsRegistry::builtin();
        let err = registry
            .get(&OperatorType::Custom("acme:unknown".to_string()))
            .unwrap_err();
        assert_eq!(err.code(), "operator_semantics_missing");
    }
}
