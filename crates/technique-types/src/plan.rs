//! Compiled work plans and adequacy (evidence-gap) reports.

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Work plan
// ---------------------------------------------------------------------------

/// Tag applied to materialized checkpoint-operator nodes.
pub const TAG_VERIFICATION_GATE: &str = "verification-gate";

/// Tag applied to legacy edge-operator nodes.
pub const TAG_LEGACY_OPERATOR: &str = "legacy-operator";

/// Tag applied to nodes synthesized from an adequacy report.
pub const TAG_ADEQUACY_GATE: &str = "adequacy-gate";

/// Hierarchical work plan compiled from a composition.
///
/// The plan is the root; `nodes` are its children in a stable topological
/// order, each listing the node IDs it depends on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkPlan {
    pub id: String,
    pub composition_id: String,
    pub title: String,
    pub graph_version: u32,
    pub nodes: Vec<WorkNode>,
}

impl WorkPlan {
    pub fn node(&self, id: &str) -> Option<&WorkNode> {
        self.nodes.iter().find(|n| n.id == id)
    }

    pub fn position(&self, id: &str) -> Option<usize> {
        self.nodes.iter().position(|n| n.id == id)
    }

    pub fn gates(&self) -> impl Iterator<Item = &WorkNode> {
        self.nodes.iter().filter(|n| n.kind != WorkNodeKind::Step)
    }
}

/// What a plan node represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkNodeKind {
    /// A primitive execution.
    Step,
    /// A materialized operator (checkpoint-compiled, or legacy edge operator).
    Gate,
    /// A gate synthesized from an adequacy gap.
    AdequacyGate,
}

/// One node of a work plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkNode {
    pub id: String,
    pub title: String,
    pub kind: WorkNodeKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub primitive_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operator_id: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub operator_conditions: Vec<String>,
    /// Deduplicated node IDs this node depends on.
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub tags: Vec<String>,
}

impl WorkNode {
    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.iter().any(|t| t == tag)
    }
}

// ---------------------------------------------------------------------------
// Adequacy report
// ---------------------------------------------------------------------------

/// Severity of a missing-evidence item.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GapSeverity {
    Low,
    #[default]
    Medium,
    High,
    Critical,
}

impl GapSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            GapSeverity::Low => "low",
            GapSeverity::Medium => "medium",
            GapSeverity::High => "high",
            GapSeverity::Critical => "critical",
        }
    }
}

/// One missing-evidence item produced by an external epistemic subsystem.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdequacyGap {
    pub id: String,
    pub description: String,
    /// Signal the gap concerns. When it names a primitive, the gate protects it.
    pub signal_id: String,
    #[serde(default)]
    pub severity: GapSeverity,
    #[serde(default)]
    pub evidence_commands: Vec<String>,
}

/// List of missing-evidence items.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AdequacyReport {
    #[serde(default)]
    pub gaps: Vec<AdequacyGap>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn adequacy_gap_defaults_severity() {
        let gap: AdequacyGap = serde_json::from_value(json!({
            "id": "g1",
            "description": "no benchmark evidence",
            "signal_id": "bench"
        }))
        .unwrap();
        assert_eq!(gap.severity, GapSeverity::Medium);
        assert!(gap.evidence_commands.is_empty());
    }

    #[test]
    fn severity_orders_by_impact() {
        assert!(GapSeverity::Critical > GapSeverity::High);
        assert!(GapSeverity::Low < GapSeverity::Medium);
    }
}
