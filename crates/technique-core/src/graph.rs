//! Composition graph helpers shared by the plan compiler and the engine.
//!
//! Operators may reference other operators by id. `RefResolver` flattens
//! such references down to primitives (or to materialized operator nodes),
//! `operator_edges` turns an edge-compiled operator into dependency edges,
//! and `stable_topological_order` orders nodes with `petgraph` cycle
//! detection and a declaration-order tie-break.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};

use petgraph::algo::toposort;
use petgraph::graph::DiGraph;
use technique_types::composition::{Composition, Operator, OperatorType};

use crate::compiler::CompileError;

// ---------------------------------------------------------------------------
// Reference resolution
// ---------------------------------------------------------------------------

/// A resolved graph endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Endpoint<'a> {
    Primitive(&'a str),
    /// An operator that is represented by its own node.
    Operator(&'a str),
}

/// Resolves operator-id references to concrete endpoints.
///
/// A reference to a materialized operator resolves to that operator. Any
/// other operator reference is flattened: used as a source it stands for its
/// outputs (or its inputs when it has none); used as a target it stands for
/// its inputs (or its outputs when it has none).
pub struct RefResolver<'a> {
    primitives: HashSet<&'a str>,
    operators: HashMap<&'a str, &'a Operator>,
    materialized: HashSet<&'a str>,
}

impl<'a> RefResolver<'a> {
    pub fn new(composition: &'a Composition) -> Self {
        Self {
            primitives: composition.primitive_ids.iter().map(String::as_str).collect(),
            operators: composition
                .operators
                .iter()
                .map(|op| (op.id.as_str(), op))
                .collect(),
            materialized: HashSet::new(),
        }
    }

    /// Treat the given operator ids as standalone nodes.
    pub fn with_materialized(mut self, ids: impl IntoIterator<Item = &'a str>) -> Self {
        self.materialized.extend(ids);
        self
    }

    pub fn is_primitive(&self, id: &str) -> bool {
        self.primitives.contains(id)
    }

    pub fn operator(&self, id: &str) -> Option<&'a Operator> {
        self.operators.get(id).copied()
    }

    /// Endpoints an edge leaving `id` starts from.
    pub fn sources(&self, id: &'a str) -> Vec<Endpoint<'a>> {
        let mut out = Vec::new();
        self.resolve(id, Side::Source, &mut HashSet::new(), &mut out);
        out
    }

    /// Endpoints an edge entering `id` lands on.
    pub fn targets(&self, id: &'a str) -> Vec<Endpoint<'a>> {
        let mut out = Vec::new();
        self.resolve(id, Side::Target, &mut HashSet::new(), &mut out);
        out
    }

    /// Primitives an operator governs: its inputs, flattened.
    pub fn governed_primitives(&self, operator: &'a Operator) -> Vec<&'a str> {
        let mut out = Vec::new();
        for id in &operator.inputs {
            for endpoint in self.sources(id) {
                if let Endpoint::Primitive(p) = endpoint {
                    if !out.contains(&p) {
                        out.push(p);
                    }
                }
            }
        }
        out
    }

    /// Primitives downstream of an operator: its outputs, flattened.
    pub fn downstream_primitives(&self, operator: &'a Operator) -> Vec<&'a str> {
        let mut out = Vec::new();
        for id in &operator.outputs {
            for endpoint in self.targets(id) {
                if let Endpoint::Primitive(p) = endpoint {
                    if !out.contains(&p) {
                        out.push(p);
                    }
                }
            }
        }
        out
    }

    fn resolve(
        &self,
        id: &'a str,
        side: Side,
        visiting: &mut HashSet<&'a str>,
        out: &mut Vec<Endpoint<'a>>,
    ) {
        if self.primitives.contains(id) {
            push_unique(out, Endpoint::Primitive(id));
            return;
        }
        if self.materialized.contains(id) {
            push_unique(out, Endpoint::Operator(id));
            return;
        }
        let Some(&op) = self.operators.get(id) else {
            return;
        };
        // Operators referencing each other in a loop resolve to nothing
        // further; the cycle surfaces during ordering.
        if !visiting.insert(id) {
            return;
        }
        let (preferred, fallback) = match side {
            Side::Source => (&op.outputs, &op.inputs),
            Side::Target => (&op.inputs, &op.outputs),
        };
        let refs = if preferred.is_empty() { fallback } else { preferred };
        for next in refs {
            self.resolve(next, side, visiting, out);
        }
        visiting.remove(id);
    }
}

#[derive(Debug, Clone, Copy)]
enum Side {
    Source,
    Target,
}

fn push_unique<T: PartialEq>(out: &mut Vec<T>, item: T) {
    if !out.contains(&item) {
        out.push(item);
    }
}

// ---------------------------------------------------------------------------
// Edge construction
// ---------------------------------------------------------------------------

/// Dependency edges contributed by an operator that compiles to edges.
///
/// `sequence` chains its inputs in order and links the last input to each
/// output. Every other operator links each input to each output.
pub fn operator_edges<'a>(
    operator: &'a Operator,
    resolver: &RefResolver<'a>,
) -> Vec<(Endpoint<'a>, Endpoint<'a>)> {
    let mut edges = Vec::new();

    if operator.operator_type == OperatorType::Sequence {
        for pair in operator.inputs.windows(2) {
            link(&mut edges, resolver, &pair[0], &pair[1]);
        }
        if let Some(last) = operator.inputs.last() {
            for output in &operator.outputs {
                link(&mut edges, resolver, last, output);
            }
        }
        return edges;
    }

    for input in &operator.inputs {
        for output in &operator.outputs {
            link(&mut edges, resolver, input, output);
        }
    }
    edges
}

/// Edges from every source of `from` to every target of `to`.
pub fn link<'a>(
    edges: &mut Vec<(Endpoint<'a>, Endpoint<'a>)>,
    resolver: &RefResolver<'a>,
    from: &'a str,
    to: &'a str,
) {
    let sources = resolver.sources(from);
    let targets = resolver.targets(to);
    for s in &sources {
        for t in &targets {
            edges.push((*s, *t));
        }
    }
}

/// Primitive-level dependency edges for a composition.
///
/// Every operator contributes edges (checkpoint operators order their inputs
/// before their outputs, as their gate node would), followed by explicit
/// relationships. Duplicates are removed, first occurrence wins.
pub fn primitive_edges(composition: &Composition) -> Vec<(String, String)> {
    let resolver = RefResolver::new(composition);
    let mut raw = Vec::new();
    for op in &composition.operators {
        raw.extend(operator_edges(op, &resolver));
    }
    for rel in &composition.relationships {
        link(&mut raw, &resolver, &rel.from_id, &rel.to_id);
    }

    let mut seen = HashSet::new();
    raw.into_iter()
        .filter_map(|(from, to)| match (from, to) {
            (Endpoint::Primitive(f), Endpoint::Primitive(t)) => Some((f.to_string(), t.to_string())),
            _ => None,
        })
        .filter(|edge| seen.insert(edge.clone()))
        .collect()
}

// ---------------------------------------------------------------------------
// Ordering
// ---------------------------------------------------------------------------

/// Topologically order `nodes`, breaking ties by declaration index.
///
/// Edges naming unknown nodes are ignored. A cycle (including a self-edge)
/// fails with `CompileError::CycleDetected`.
pub fn stable_topological_order(
    nodes: &[String],
    edges: &[(String, String)],
) -> Result<Vec<String>, CompileError> {
    let index: HashMap<&str, usize> = nodes
        .iter()
        .enumerate()
        .map(|(i, n)| (n.as_str(), i))
        .collect();

    let mut graph = DiGraph::<&str, ()>::new();
    let node_indices: Vec<_> = nodes.iter().map(|n| graph.add_node(n.as_str())).collect();
    let mut successors: Vec<Vec<usize>> = vec![Vec::new(); nodes.len()];
    let mut in_degree = vec![0usize; nodes.len()];

    for (from, to) in edges {
        let (Some(&f), Some(&t)) = (index.get(from.as_str()), index.get(to.as_str())) else {
            continue;
        };
        graph.add_edge(node_indices[f], node_indices[t], ());
        successors[f].push(t);
        in_degree[t] += 1;
    }

    toposort(&graph, None).map_err(|cycle| {
        CompileError::CycleDetected(graph[cycle.node_id()].to_string())
    })?;

    let mut ready: BinaryHeap<Reverse<usize>> = in_degree
        .iter()
        .enumerate()
        .filter(|(_, d)| **d == 0)
        .map(|(i, _)| Reverse(i))
        .collect();
    let mut order = Vec::with_capacity(nodes.len());

    while let Some(Reverse(i)) = ready.pop() {
        order.push(nodes[i].clone());
        for &next in &successors[i] {
            in_degree[next] -= 1;
            if in_degree[next] == 0 {
                ready.push(Reverse(next));
            }
        }
    }

    Ok(order)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
