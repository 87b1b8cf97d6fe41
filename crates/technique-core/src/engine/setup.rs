//! Pre-flight work: input validation, ordering, operator bindings, and
//! concurrent units.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::ops::Range;

use petgraph::graph::DiGraph;
use petgraph::visit::{Dfs, Reversed};
use serde_json::{Map, Value, json};
use technique_types::composition::{Composition, Operator, OperatorType, Primitive};
use technique_types::plan::{AdequacyReport, GapSeverity};

use super::EngineError;
use crate::compiler::{adequacy_node_id, validate_composition};
use crate::graph::{RefResolver, primitive_edges, stable_topological_order};
use crate::interpreter::{
    OperatorInterpreter, interpreter_for, runs_downstream_concurrently, runs_governed_concurrently,
};
use crate::sanitize::{KeyViolation, find_disallowed_key};
use crate::semantics::SemanticsRegistry;

/// Reject seed input carrying disallowed keys anywhere in its structure.
pub(crate) fn validate_input(input: &Map<String, Value>) -> Result<(), EngineError> {
    let value = Value::Object(input.clone());
    let Some(finding) = find_disallowed_key(&value) else {
        return Ok(());
    };
    let code = match finding.violation {
        KeyViolation::Forbidden => "composition_input_forbidden_key",
        KeyViolation::Accessor => "composition_input_accessor",
        KeyViolation::Symbol => "composition_input_symbol_keys",
        KeyViolation::TooDeep => "composition_input_too_deep",
    };
    Err(EngineError::setup(code, format!("input key '{}' is not allowed", finding.path)))
}

/// An operator with its resolved primitive sets.
pub(crate) struct Binding {
    pub operator: Operator,
    pub governed: Vec<String>,
    pub downstream: Vec<String>,
    pub interpreter: &'static dyn OperatorInterpreter,
}

impl Binding {
    pub fn governs(&self, primitive_id: &str) -> bool {
        self.governed.iter().any(|g| g == primitive_id)
    }

    pub fn feeds(&self, primitive_id: &str) -> bool {
        self.downstream.iter().any(|d| d == primitive_id)
    }

    /// Whether a terminate from this operator means retries ran out.
    pub fn is_retry(&self) -> bool {
        matches!(self.operator.operator_type, OperatorType::Retry | OperatorType::Backoff)
    }

    /// Whether this operator tolerates failed governed primitives.
    pub fn absorbs_failures(&self) -> bool {
        matches!(self.operator.operator_type, OperatorType::Quorum | OperatorType::Consensus)
    }
}

/// Everything derived from a composition before execution starts.
pub(crate) struct Blueprint {
    /// The composition plus any synthesized adequacy gates.
    pub composition: Composition,
    pub primitives: HashMap<String, Primitive>,
    /// Execution order; members of a concurrent unit are contiguous.
    pub order: Vec<String>,
    pub units: Vec<Range<usize>>,
    pub parents: HashMap<String, Vec<String>>,
    pub ancestors: HashMap<String, HashSet<String>>,
    pub bindings: Vec<Binding>,
}

impl Blueprint {
    pub fn build(
        composition: &Composition,
        primitives: &[Primitive],
        adequacy: Option<&AdequacyReport>,
        registry: &SemanticsRegistry,
    ) -> Result<Self, EngineError> {
        validate_composition(composition, primitives, registry)?;

        let edges = primitive_edges(composition);
        let sorted = stable_topological_order(&composition.primitive_ids, &edges)?;

        let mut composition = composition.clone();
        if let Some(report) = adequacy {
            add_adequacy_gates(&mut composition, report, &sorted);
        }

        let resolver = RefResolver::new(&composition);
        let bindings: Vec<Binding> = composition
            .operators
            .iter()
            .map(|op| Binding {
                governed: resolver.governed_primitives(op).into_iter().map(str::to_string).collect(),
                downstream: resolver.downstream_primitives(op).into_iter().map(str::to_string).collect(),
                interpreter: interpreter_for(&op.operator_type),
                operator: op.clone(),
            })
            .collect();

        let mut parents: HashMap<String, Vec<String>> = HashMap::new();
        for (from, to) in &edges {
            parents.entry(to.clone()).or_default().push(from.clone());
        }
        let ancestors = ancestor_sets(&composition.primitive_ids, &edges);
        let (order, units) = group_units(&sorted, &bindings, &ancestors);

        Ok(Self {
            primitives: primitives.iter().map(|p| (p.id.clone(), p.clone())).collect(),
            composition,
            order,
            units,
            parents,
            ancestors,
            bindings,
        })
    }

    /// Units still to run from `next_index`. A unit cut by the index is
    /// resumed from the index.
    pub fn units_from(&self, next_index: usize) -> Vec<Range<usize>> {
        self.units
            .iter()
            .filter(|u| u.end > next_index)
            .map(|u| u.start.max(next_index)..u.end)
            .collect()
    }
}

/// Synthesize one blocking-or-advisory gate per adequacy gap.
fn add_adequacy_gates(composition: &mut Composition, report: &AdequacyReport, order: &[String]) {
    let mut seen = HashSet::new();
    for gap in &report.gaps {
        let id = adequacy_node_id(&gap.id);
        if !seen.insert(gap.id.clone()) || composition.operator(&id).is_some() {
            tracing::warn!(gap_id = gap.id.as_str(), "skipping duplicate adequacy gap");
            continue;
        }
        let protected = if composition.has_primitive(&gap.signal_id) {
            Some(gap.signal_id.as_str())
        } else {
            order.first().map(String::as_str)
        };
        let Some(protected) = protected else {
            tracing::warn!(gap_id = gap.id.as_str(), "adequacy gap has nothing to protect");
            continue;
        };
        let gate = Operator::new(id, OperatorType::Gate)
            .with_outputs(&[protected])
            .with_parameter("gap", json!(gap.id))
            .with_parameter("description", json!(gap.description))
            .with_parameter("evidence_key", json!(gap.id))
            .with_parameter("evidence_commands", json!(gap.evidence_commands))
            .with_parameter("severity", json!(gap.severity.as_str()))
            .with_parameter("blocking", json!(gap.severity >= GapSeverity::High));
        composition.operators.push(gate);
    }
}

/// Transitive dependencies of every primitive.
fn ancestor_sets(nodes: &[String], edges: &[(String, String)]) -> HashMap<String, HashSet<String>> {
    let mut graph = DiGraph::<&str, ()>::new();
    let index: HashMap<&str, _> = nodes.iter().map(|n| (n.as_str(), graph.add_node(n.as_str()))).collect();
    for (from, to) in edges {
        if let (Some(&f), Some(&t)) = (index.get(from.as_str()), index.get(to.as_str())) {
            graph.add_edge(f, t, ());
        }
    }

    let mut out = HashMap::new();
    for (name, &node) in &index {
        let mut found = HashSet::new();
        let mut dfs = Dfs::new(Reversed(&graph), node);
        while let Some(next) = dfs.next(Reversed(&graph)) {
            if next != node {
                found.insert(graph[next].to_string());
            }
        }
        out.insert(name.to_string(), found);
    }
    out
}

/// Pull the members of each concurrent operator together into one unit
/// when every member's dependencies are already satisfied at the first
/// member's position.
fn group_units(
    sorted: &[String],
    bindings: &[Binding],
    ancestors: &HashMap<String, HashSet<String>>,
) -> (Vec<String>, Vec<Range<usize>>) {
    let position: HashMap<&str, usize> = sorted.iter().enumerate().map(|(i, p)| (p.as_str(), i)).collect();
    let groups: Vec<Vec<&str>> = bindings
        .iter()
        .filter_map(|b| {
            let members = if runs_governed_concurrently(&b.operator.operator_type) {
                &b.governed
            } else if runs_downstream_concurrently(&b.operator.operator_type) {
                &b.downstream
            } else {
                return None;
            };
            let mut members: Vec<&str> = members.iter().map(String::as_str).collect();
            members.sort_by_key(|m| position.get(m).copied().unwrap_or(usize::MAX));
            (members.len() >= 2).then_some(members)
        })
        .collect();

    let mut emitted: BTreeSet<&str> = BTreeSet::new();
    let mut order = Vec::with_capacity(sorted.len());
    let mut units = Vec::new();

    for p in sorted {
        if emitted.contains(p.as_str()) {
            continue;
        }
        let ready = |group: &&Vec<&str>| {
            group.contains(&p.as_str())
                && group.iter().all(|m| !emitted.contains(m))
                && group.iter().all(|m| {
                    ancestors
                        .get(*m)
                        .is_none_or(|deps| deps.iter().all(|d| emitted.contains(d.as_str())))
                })
        };
        let members: Vec<&str> = match groups.iter().find(ready) {
            Some(group) => group.clone(),
            None => vec![p.as_str()],
        };
        let start = order.len();
        for m in members {
            emitted.insert(m);
            order.push(m.to_string());
        }
        units.push(start..order.len());
    }
    (order, units)
}

#[cfg(test)]
mod tests {
    use super::*;
    use technique_types::composition::Relationship;
    use technique_types::plan::AdequacyGap;

    fn primitives(ids: &[&str]) -> Vec<Primitive> {
        ids.iter().map(|id| Primitive::new(*id, *id)).collect()
    }

    #[test]
    fn input_validation_sub_codes() {
        let check = |v: Value| validate_input(v.as_object().unwrap()).map_err(|e| e.sub_code());
        assert_eq!(check(json!({"a": {"b": [{"ok": 1}]}})), Ok(()));
        assert_eq!(check(json!({"a": {"__proto__": 1}})), Err("composition_input_forbidden_key"));
        assert_eq!(check(json!({"__defineGetter__": 1})), Err("composition_input_accessor"));
        assert_eq!(check(json!({"x": [{"@@iterator": 1}]})), Err("composition_input_symbol_keys"));
    }

    #[test]
    fn parallel_members_form_one_unit() {
        let comp = Composition::new("c", &["a", "b", "c", "d"])
            .with_operator(
                Operator::new("par", OperatorType::Parallel)
                    .with_inputs(&["b", "d"])
                    .with_outputs(&["c"]),
            )
            .with_relationship(Relationship::depends_on("a", "b"));
        let bp = Blueprint::build(&comp, &primitives(&["a", "b", "c", "d"]), None, &SemanticsRegistry::builtin())
            .unwrap();
        assert_eq!(bp.order, vec!["a", "b", "d", "c"]);
        assert_eq!(bp.units, vec![0..1, 1..3, 3..4]);
        assert_eq!(bp.parents["c"], vec!["b", "d"]);
        assert!(bp.ancestors["c"].contains("a"));
    }

    #[test]
    fn dependent_members_run_separately() {
        let comp = Composition::new("c", &["a", "b"])
            .with_operator(Operator::new("par", OperatorType::Parallel).with_inputs(&["a", "b"]))
            .with_relationship(Relationship::depends_on("a", "b"));
        let bp = Blueprint::build(&comp, &primitives(&["a", "b"]), None, &SemanticsRegistry::builtin()).unwrap();
        assert_eq!(bp.units, vec![0..1, 1..2]);
    }

    #[test]
    fn adequacy_gaps_become_gates() {
        let comp = Composition::new("c", &["a", "b"]).with_relationship(Relationship::depends_on("a", "b"));
        let report = AdequacyReport {
            gaps: vec![
                AdequacyGap {
                    id: "bench".into(),
                    description: "no benchmark".into(),
                    signal_id: "b".into(),
                    severity: GapSeverity::High,
                    evidence_commands: vec![],
                },
                AdequacyGap {
                    id: "docs".into(),
                    description: "no docs".into(),
                    signal_id: "unknown".into(),
                    severity: GapSeverity::Low,
                    evidence_commands: vec![],
                },
            ],
        };
        let bp = Blueprint::build(&comp, &primitives(&["a", "b"]), Some(&report), &SemanticsRegistry::builtin())
            .unwrap();
        let bench = bp.bindings.iter().find(|b| b.operator.id == "adequacy:bench").unwrap();
        assert_eq!(bench.downstream, vec!["b"]);
        assert_eq!(bench.operator.parameters["blocking"], true);
        let docs = bp.bindings.iter().find(|b| b.operator.id == "adequacy:docs").unwrap();
        assert_eq!(docs.downstream, vec!["a"]);
        assert_eq!(docs.operator.parameters["blocking"], false);
    }

    #[test]
    fn cycles_fail_before_execution() {
        let comp = Composition::new("c", &["a", "b"])
            .with_relationship(Relationship::depends_on("a", "b"))
            .with_relationship(Relationship::depends_on("b", "a"));
        let err = Blueprint::build(&comp, &primitives(&["a", "b"]), None, &SemanticsRegistry::builtin())
            .err()
            .unwrap();
        assert_eq!(err.code(), "composition_cycle_detected");
    }
}
