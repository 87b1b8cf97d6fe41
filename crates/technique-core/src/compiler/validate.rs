//! Structural validation of a composition against its primitives and the
//! operator semantics registry.

use std::collections::HashSet;

use technique_types::composition::{Composition, Primitive};

use super::CompileError;
use crate::semantics::SemanticsRegistry;

/// Check ids, references, arity, and required parameters.
///
/// Checks run in a fixed order and the first failure is returned.
pub fn validate_composition(
    composition: &Composition,
    primitives: &[Primitive],
    registry: &SemanticsRegistry,
) -> Result<(), CompileError> {
    let mut primitive_ids = HashSet::new();
    for id in &composition.primitive_ids {
        if !primitive_ids.insert(id.as_str()) {
            return Err(CompileError::DuplicatePrimitive(id.clone()));
        }
    }

    let supplied: HashSet<&str> = primitives.iter().map(|p| p.id.as_str()).collect();
    if let Some(unknown) = composition
        .primitive_ids
        .iter()
        .find(|id| !supplied.contains(id.as_str()))
    {
        return Err(CompileError::UnknownPrimitive(unknown.clone()));
    }

    let mut operator_ids = HashSet::new();
    for op in &composition.operators {
        if primitive_ids.contains(op.id.as_str()) || !operator_ids.insert(op.id.as_str()) {
            return Err(CompileError::DuplicateOperator(op.id.clone()));
        }
    }

    let known = |id: &str| primitive_ids.contains(id) || operator_ids.contains(id);

    for op in &composition.operators {
        let missing = unique_missing(op.referenced_ids().map(String::as_str), &known);
        if !missing.is_empty() {
            return Err(CompileError::MissingOperatorRefs {
                operator_id: op.id.clone(),
                missing,
            });
        }
    }

    let missing = unique_missing(
        composition
            .relationships
            .iter()
            .flat_map(|r| [r.from_id.as_str(), r.to_id.as_str()]),
        &known,
    );
    if !missing.is_empty() {
        return Err(CompileError::MissingRelationshipRefs { missing });
    }

    for op in &composition.operators {
        let semantics = registry.get(&op.operator_type)?;
        let inputs = op.inputs.len();
        let outputs = op.outputs.len();

        if inputs < semantics.min_inputs {
            return Err(CompileError::TooFewInputs {
                operator_id: op.id.clone(),
                expected: semantics.min_inputs,
                actual: inputs,
            });
        }
        if let Some(max) = semantics.max_inputs.filter(|max| inputs > *max) {
            return Err(CompileError::TooManyInputs {
                operator_id: op.id.clone(),
                expected: max,
                actual: inputs,
            });
        }
        if outputs < semantics.min_outputs {
            return Err(CompileError::MissingOutputs {
                operator_id: op.id.clone(),
                expected: semantics.min_outputs,
                actual: outputs,
            });
        }
        if let Some(max) = semantics.max_outputs.filter(|max| outputs > *max) {
            return Err(CompileError::TooManyOutputs {
                operator_id: op.id.clone(),
                expected: max,
                actual: outputs,
            });
        }

        let missing: Vec<String> = semantics
            .required_parameters
            .iter()
            .filter(|p| op.parameters.get(p.as_str()).is_none_or(|v| v.is_null()))
            .cloned()
            .collect();
        if !missing.is_empty() {
            return Err(CompileError::MissingParameters {
                operator_id: op.id.clone(),
                missing,
            });
        }
    }

    Ok(())
}

fn unique_missing<'a>(
    ids: impl Iterator<Item = &'a str>,
    known: &impl Fn(&str) -> bool,
) -> Vec<String> {
    let mut missing: Vec<String> = Vec::new();
    for id in ids {
        if !known(id) && !missing.iter().any(|m| m == id) {
            missing.push(id.to_string());
        }
    }
    missing
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use technique_types::composition::{Operator, OperatorType, Relationship};

    fn prims(ids: &[&str]) -> Vec<Primitive> {
        ids.iter().map(|id| Primitive::new(*id, *id)).collect()
    }

    fn check(comp: &Composition, primitives: &[Primitive]) -> Result<(), CompileError> {
        validate_composition(comp, primitives, &SemanticsRegistry::builtin())
    }

    #[test]
    fn accepts_valid_composition() {
        let comp = Composition::new("c", &["a", "b"]).with_operator(
            Operator::new("seq", OperatorType::Sequence).with_inputs(&["a", "b"]),
        );
        assert!(check(&comp, &prims(&["a", "b"])).is_ok());
    }

    #[test]
    fn rejects_duplicate_primitive() {
        let comp = Composition::new("c", &["a", "a"]);
        assert_eq!(check(&comp, &prims(&["a"])).unwrap_err().code(), "composition_duplicate_primitive");
    }

    #[test]
    fn rejects_unsupplied_primitive() {
        let comp = Composition::new("c", &["a", "b"]);
        let err = check(&comp, &prims(&["a"])).unwrap_err();
        assert_eq!(err, CompileError::UnknownPrimitive("b".to_string()));
    }

    #[test]
    fn rejects_unknown_operator_refs() {
        let comp = Composition::new("c", &["a", "b"]).with_operator(
            Operator::new("seq", OperatorType::Sequence).with_inputs(&["a", "ghost", "ghost"]),
        );
        let err = check(&comp, &prims(&["a", "b"])).unwrap_err();
        assert_eq!(err.code(), "composition_missing_operator_refs");
        assert!(matches!(err, CompileError::MissingOperatorRefs { missing, .. } if missing == vec!["ghost"]));
    }

    #[test]
    fn rejects_unknown_relationship_refs() {
        let comp =
            Composition::new("c", &["a"]).with_relationship(Relationship::depends_on("a", "zz"));
        let err = check(&comp, &prims(&["a"])).unwrap_err();
        assert_eq!(err.code(), "composition_missing_relationship_refs");
    }

    #[test]
    fn enforces_arity() {
        let comp = Composition::new("c", &["a", "b"])
            .with_operator(Operator::new("seq", OperatorType::Sequence).with_inputs(&["a"]));
        assert_eq!(check(&comp, &prims(&["a", "b"])).unwrap_err().code(), "operator_too_few_inputs");

        let comp = Composition::new("c", &["a", "b", "x"]).with_operator(
            Operator::new("fan", OperatorType::Fanout)
                .with_inputs(&["a", "b"])
                .with_outputs(&["x", "a"]),
        );
        assert_eq!(
            check(&comp, &prims(&["a", "b", "x"])).unwrap_err().code(),
            "operator_too_many_inputs"
        );

        let comp = Composition::new("c", &["a", "b"])
            .with_operator(Operator::new("g", OperatorType::Gate).with_inputs(&["a"]));
        assert_eq!(check(&comp, &prims(&["a", "b"])).unwrap_err().code(), "operator_missing_outputs");

        let comp = Composition::new("c", &["a", "b", "x"]).with_operator(
            Operator::new("in", OperatorType::Fanin)
                .with_inputs(&["a", "b"])
                .with_outputs(&["x", "a"]),
        );
        assert_eq!(
            check(&comp, &prims(&["a", "b", "x"])).unwrap_err().code(),
            "operator_too_many_outputs"
        );
    }

    #[test]
    fn requires_parameters() {
        let comp = Composition::new("c", &["a", "b"]).with_operator(
            Operator::new("q", OperatorType::Quorum)
                .with_inputs(&["a", "b"])
                .with_parameter("field", json!(null)),
        );
        let err = check(&comp, &prims(&["a", "b"])).unwrap_err();
        assert_eq!(err.code(), "operator_missing_parameters");
    }

    #[test]
    fn unregistered_custom_type_is_fatal() {
        let comp = Composition::new("c", &["a"]).with_operator(
            Operator::new("x", OperatorType::Custom("acme:thing".to_string())).with_inputs(&["a"]),
        );
        assert_eq!(check(&comp, &prims(&["a"])).unwrap_err().code(), "operator_semantics_missing");
    }
}
