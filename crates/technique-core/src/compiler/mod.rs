//! Plan compiler: turns a composition into a hierarchical work plan.
//!
//! Edge-compiled operators become dependency edges between step nodes.
//! Checkpoint-compiled operators (and, for legacy graphs, the structural
//! operators) become gate nodes of their own. An optional adequacy report
//! adds one gate per evidence gap in front of the step it protects.

mod error;
mod validate;

pub use error::CompileError;
pub use validate::validate_composition;

use std::collections::{HashMap, HashSet};

use technique_types::composition::{Composition, Operator, OperatorType, Primitive};
use technique_types::plan::{
    AdequacyReport, TAG_ADEQUACY_GATE, TAG_LEGACY_OPERATOR, TAG_VERIFICATION_GATE, WorkNode,
    WorkNodeKind, WorkPlan,
};

use crate::graph::{Endpoint, RefResolver, link, operator_edges, stable_topological_order};
use crate::semantics::{CompileMode, SemanticsRegistry};

/// Operators that legacy graphs materialize as plan nodes.
const LEGACY_STRUCTURAL: [OperatorType; 5] = [
    OperatorType::Sequence,
    OperatorType::Parallel,
    OperatorType::Fanout,
    OperatorType::Fanin,
    OperatorType::Reduce,
];

pub fn step_node_id(primitive_id: &str) -> String {
    format!("step:{primitive_id}")
}

pub fn gate_node_id(operator_id: &str) -> String {
    format!("gate:{operator_id}")
}

pub fn adequacy_node_id(gap_id: &str) -> String {
    format!("adequacy:{gap_id}")
}

// ---------------------------------------------------------------------------
// PlanCompiler
// ---------------------------------------------------------------------------

/// Compiles compositions against a semantics registry.
pub struct PlanCompiler<'r> {
    registry: &'r SemanticsRegistry,
    adequacy: Option<&'r AdequacyReport>,
}

impl<'r> PlanCompiler<'r> {
    pub fn new(registry: &'r SemanticsRegistry) -> Self {
        Self {
            registry,
            adequacy: None,
        }
    }

    /// Insert adequacy gates for every gap in `report`.
    pub fn with_adequacy(mut self, report: &'r AdequacyReport) -> Self {
        self.adequacy = Some(report);
        self
    }

    /// Validate and compile `composition` into a work plan.
    pub fn compile(
        &self,
        composition: &Composition,
        primitives: &[Primitive],
    ) -> Result<WorkPlan, CompileError> {
        validate_composition(composition, primitives, self.registry)?;

        let names: HashMap<&str, &str> = primitives
            .iter()
            .map(|p| (p.id.as_str(), p.name.as_str()))
            .collect();

        let mut materialized: Vec<&Operator> = Vec::new();
        for op in &composition.operators {
            if self.is_materialized(composition, op)? {
                materialized.push(op);
            }
        }
        let resolver = RefResolver::new(composition)
            .with_materialized(materialized.iter().map(|op| op.id.as_str()));

        // Nodes in declaration order: steps, then materialized operators.
        let mut nodes: Vec<WorkNode> = composition
            .primitive_ids
            .iter()
            .map(|pid| WorkNode {
                id: step_node_id(pid),
                title: names.get(pid.as_str()).copied().unwrap_or(pid.as_str()).to_string(),
                kind: WorkNodeKind::Step,
                primitive_id: Some(pid.clone()),
                operator_id: None,
                operator_conditions: Vec::new(),
                depends_on: Vec::new(),
                tags: Vec::new(),
            })
            .collect();
        for op in &materialized {
            let tag = if self.registry.get(&op.operator_type)?.compile == CompileMode::Checkpoint {
                TAG_VERIFICATION_GATE
            } else {
                TAG_LEGACY_OPERATOR
            };
            nodes.push(WorkNode {
                id: gate_node_id(&op.id),
                title: format!("{} {}", op.operator_type, op.id),
                kind: WorkNodeKind::Gate,
                primitive_id: None,
                operator_id: Some(op.id.clone()),
                operator_conditions: op.conditions.clone(),
                depends_on: Vec::new(),
                tags: vec![tag.to_string()],
            });
        }

        let mut raw: Vec<(Endpoint<'_>, Endpoint<'_>)> = Vec::new();
        let materialized_ids: HashSet<&str> = materialized.iter().map(|op| op.id.as_str()).collect();
        for op in &composition.operators {
            if materialized_ids.contains(op.id.as_str()) {
                let gate = Endpoint::Operator(op.id.as_str());
                for input in &op.inputs {
                    for source in resolver.sources(input) {
                        raw.push((source, gate));
                    }
                }
                for output in &op.outputs {
                    for target in resolver.targets(output) {
                        raw.push((gate, target));
                    }
                }
            } else {
                raw.extend(operator_edges(op, &resolver));
            }
        }
        for rel in &composition.relationships {
            link(&mut raw, &resolver, &rel.from_id, &rel.to_id);
        }

        let mut seen = HashSet::new();
        let mut edges: Vec<(String, String)> = Vec::new();
        for (from, to) in raw {
            let edge = (endpoint_node_id(from), endpoint_node_id(to));
            if seen.insert(edge.clone()) {
                edges.push(edge);
            }
        }

        let node_ids: Vec<String> = nodes.iter().map(|n| n.id.clone()).collect();
        let order = stable_topological_order(&node_ids, &edges)?;

        if let Some(report) = self.adequacy {
            self.insert_adequacy_gates(composition, report, &order, &mut nodes, &mut edges);
        }

        let node_ids: Vec<String> = nodes.iter().map(|n| n.id.clone()).collect();
        let order = stable_topological_order(&node_ids, &edges)?;

        let mut by_id: HashMap<String, WorkNode> =
            nodes.into_iter().map(|n| (n.id.clone(), n)).collect();
        for (from, to) in &edges {
            if let Some(node) = by_id.get_mut(to) {
                if !node.depends_on.contains(from) {
                    node.depends_on.push(from.clone());
                }
            }
        }
        let ordered: Vec<WorkNode> = order.iter().filter_map(|id| by_id.remove(id)).collect();

        tracing::debug!(
            composition_id = composition.id.as_str(),
            nodes = ordered.len(),
            edges = edges.len(),
            "compiled work plan"
        );

        Ok(WorkPlan {
            id: format!("plan:{}", composition.id),
            composition_id: composition.id.clone(),
            title: if composition.name.is_empty() {
                composition.id.clone()
            } else {
                composition.name.clone()
            },
            graph_version: composition.graph_version,
            nodes: ordered,
        })
    }

    fn is_materialized(&self, composition: &Composition, op: &Operator) -> Result<bool, CompileError> {
        let semantics = self.registry.get(&op.operator_type)?;
        Ok(semantics.compile == CompileMode::Checkpoint
            || (composition.is_legacy_graph() && LEGACY_STRUCTURAL.contains(&op.operator_type)))
    }

    fn insert_adequacy_gates(
        &self,
        composition: &Composition,
        report: &AdequacyReport,
        order: &[String],
        nodes: &mut Vec<WorkNode>,
        edges: &mut Vec<(String, String)>,
    ) {
        let first_step = order
            .iter()
            .find(|id| id.starts_with("step:"))
            .cloned();
        let mut seen = HashSet::new();

        for gap in &report.gaps {
            if !seen.insert(gap.id.as_str()) {
                tracing::warn!(gap_id = gap.id.as_str(), "duplicate adequacy gap ignored");
                continue;
            }
            let protected = if composition.has_primitive(&gap.signal_id) {
                Some(step_node_id(&gap.signal_id))
            } else {
                first_step.clone()
            };

            let gate_id = adequacy_node_id(&gap.id);
            if let Some(step) = &protected {
                // Sit right before the protected step: inherit its dependencies.
                let inherited: Vec<String> = edges
                    .iter()
                    .filter(|(_, to)| to == step)
                    .map(|(from, _)| from.clone())
                    .collect();
                for from in inherited {
                    edges.push((from, gate_id.clone()));
                }
                edges.push((gate_id.clone(), step.clone()));
            }

            nodes.push(WorkNode {
                id: gate_id,
                title: gap.description.clone(),
                kind: WorkNodeKind::AdequacyGate,
                primitive_id: protected
                    .as_deref()
                    .and_then(|s| s.strip_prefix("step:"))
                    .map(str::to_string),
                operator_id: None,
                operator_conditions: Vec::new(),
                depends_on: Vec::new(),
                tags: vec![
                    TAG_ADEQUACY_GATE.to_string(),
                    format!("severity:{}", gap.severity.as_str()),
                ],
            });
        }
    }
}

fn endpoint_node_id(endpoint: Endpoint<'_>) -> String {
    match endpoint {
        Endpoint::Primitive(p) => step_node_id(p),
        Endpoint::Operator(o) => gate_node_id(o),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use technique_types::composition::Relationship;
    use technique_types::plan::{AdequacyGap, GapSeverity};

    fn prims(ids: &[&str]) -> Vec<Primitive> {
        ids.iter().map(|id| Primitive::new(*id, format!("Prim {id}"))).collect()
    }

    fn compile(comp: &Composition, primitives: &[Primitive]) -> Result<WorkPlan, CompileError> {
        let registry = SemanticsRegistry::builtin();
        PlanCompiler::new(&registry).compile(comp, primitives)
    }

    fn ids(plan: &WorkPlan) -> Vec<&str> {
        plan.nodes.iter().map(|n| n.id.as_str()).collect()
    }

    #[test]
    fn sequence_compiles_to_edges() {
        let comp = Composition::new("c", &["c", "b", "a"]).with_operator(
            Operator::new("seq", OperatorType::Sequence).with_inputs(&["a", "b", "c"]),
        );
        let plan = compile(&comp, &prims(&["a", "b", "c"])).unwrap();
        assert_eq!(ids(&plan), vec!["step:a", "step:b", "step:c"]);
        assert_eq!(plan.node("step:c").unwrap().depends_on, vec!["step:b"]);
        assert!(plan.gates().next().is_none());
        assert_eq!(plan.node("step:a").unwrap().title, "Prim a");
    }

    #[test]
    fn conditional_materializes_gate_node() {
        let comp = Composition::new("c", &["s", "a", "b"]).with_operator(
            Operator::new("route", OperatorType::Conditional)
                .with_inputs(&["s"])
                .with_outputs(&["a", "b"])
                .with_conditions(&["state.score > 5 => a"]),
        );
        let plan = compile(&comp, &prims(&["s", "a", "b"])).unwrap();
        let gate = plan.node("gate:route").unwrap();
        assert!(gate.has_tag(TAG_VERIFICATION_GATE));
        assert_eq!(gate.operator_id.as_deref(), Some("route"));
        assert_eq!(gate.operator_conditions, vec!["state.score > 5 => a"]);
        assert_eq!(gate.depends_on, vec!["step:s"]);
        assert_eq!(plan.node("step:a").unwrap().depends_on, vec!["gate:route"]);
        assert!(plan.position("gate:route") < plan.position("step:a"));
    }

    #[test]
    fn legacy_graph_materializes_structural_operators() {
        let comp = Composition::new("c", &["a", "b", "c"])
            .with_graph_version(1)
            .with_operator(
                Operator::new("par", OperatorType::Parallel)
                    .with_inputs(&["a", "b"])
                    .with_outputs(&["c"]),
            );
        let plan = compile(&comp, &prims(&["a", "b", "c"])).unwrap();
        let node = plan.node("gate:par").unwrap();
        assert!(node.has_tag(TAG_LEGACY_OPERATOR));
        assert_eq!(node.depends_on, vec!["step:a", "step:b"]);
        assert_eq!(plan.node("step:c").unwrap().depends_on, vec!["gate:par"]);
    }

    #[test]
    fn operator_reference_resolves_to_gate() {
        let comp = Composition::new("c", &["a", "b", "c"])
            .with_operator(
                Operator::new("g", OperatorType::Gate)
                    .with_inputs(&["a"])
                    .with_outputs(&["b"]),
            )
            .with_relationship(Relationship::depends_on("g", "c"));
        let plan = compile(&comp, &prims(&["a", "b", "c"])).unwrap();
        assert!(plan.node("step:c").unwrap().depends_on.contains(&"gate:g".to_string()));
    }

    #[test]
    fn duplicate_edges_are_merged() {
        let comp = Composition::new("c", &["a", "b"])
            .with_operator(Operator::new("seq", OperatorType::Sequence).with_inputs(&["a", "b"]))
            .with_relationship(Relationship::depends_on("a", "b"));
        let plan = compile(&comp, &prims(&["a", "b"])).unwrap();
        assert_eq!(plan.node("step:b").unwrap().depends_on, vec!["step:a"]);
    }

    #[test]
    fn cycle_produces_no_plan() {
        let comp = Composition::new("c", &["a", "b"])
            .with_relationship(Relationship::depends_on("a", "b"))
            .with_relationship(Relationship::depends_on("b", "a"));
        let err = compile(&comp, &prims(&["a", "b"])).unwrap_err();
        assert_eq!(err.code(), "composition_cycle_detected");
    }

    #[test]
    fn adequacy_gate_precedes_protected_step() {
        let comp = Composition::new("c", &["a", "b"])
            .with_operator(Operator::new("seq", OperatorType::Sequence).with_inputs(&["a", "b"]));
        let report = AdequacyReport {
            gaps: vec![
                AdequacyGap {
                    id: "g1".to_string(),
                    description: "no evidence for b".to_string(),
                    signal_id: "b".to_string(),
                    severity: GapSeverity::High,
                    evidence_commands: vec!["cargo bench".to_string()],
                },
                AdequacyGap {
                    id: "g2".to_string(),
                    description: "general gap".to_string(),
                    signal_id: "unrelated".to_string(),
                    severity: GapSeverity::Low,
                    evidence_commands: vec![],
                },
            ],
        };
        let registry = SemanticsRegistry::builtin();
        let plan = PlanCompiler::new(&registry)
            .with_adequacy(&report)
            .compile(&comp, &prims(&["a", "b"]))
            .unwrap();

        let g1 = plan.node("adequacy:g1").unwrap();
        assert!(g1.has_tag(TAG_ADEQUACY_GATE));
        assert!(g1.has_tag("severity:high"));
        assert_eq!(g1.depends_on, vec!["step:a"]);
        assert!(plan.node("step:b").unwrap().depends_on.contains(&"adequacy:g1".to_string()));

        // Unmatched signal protects the first step.
        assert_eq!(plan.position("adequacy:g2"), Some(0));
        assert_eq!(ids(&plan), vec!["adequacy:g2", "step:a", "adequacy:g1", "step:b"]);
    }
}
