//! Operator lifecycle events.
//!
//! `OperatorEvent` is emitted by the execution engine to an optional sink.
//! Events are purely observational and never influence control flow. All
//! variants are Clone + Send + Sync for use with tokio broadcast channels.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Why an operator was flagged for coverage review.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CoverageGapReason {
    /// The operator's type has no runtime behavior.
    NoopInterpreter,
}

/// Events emitted while operators drive an execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OperatorEvent {
    /// An operator's `before_execute` hook ran.
    OperatorStarted {
        execution_id: Uuid,
        operator_id: String,
        operator_type: String,
    },

    /// An operator selected a branch target.
    OperatorBranch {
        execution_id: Uuid,
        operator_id: String,
        target: String,
    },

    /// An operator finished (its `after_execute` hook ran, or it halted).
    OperatorCompleted {
        execution_id: Uuid,
        operator_id: String,
        /// Kind of the final decision (e.g. "continue", "terminate").
        decision: String,
    },

    /// An operator's declared type changes no runtime behavior.
    OperatorCoverageGap {
        execution_id: Uuid,
        operator_id: String,
        operator_type: String,
        reason: CoverageGapReason,
    },
}

impl OperatorEvent {
    /// Snake-case event type, matching the serialized `type` tag.
    pub fn kind(&self) -> &'static str {
        match self {
            OperatorEvent::OperatorStarted { .. } => "operator_started",
            OperatorEvent::OperatorBranch { .. } => "operator_branch",
            OperatorEvent::OperatorCompleted { .. } => "operator_completed",
            OperatorEvent::OperatorCoverageGap { .. } => "operator_coverage_gap",
        }
    }

    pub fn operator_id(&self) -> &str {
        match self {
            OperatorEvent::OperatorStarted { operator_id, .. }
            | OperatorEvent::OperatorBranch { operator_id, .. }
            | OperatorEvent::OperatorCompleted { operator_id, .. }
            | OperatorEvent::OperatorCoverageGap { operator_id, .. } => operator_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn coverage_gap_serializes_with_tag_and_reason() {
        let event = OperatorEvent::OperatorCoverageGap {
            execution_id: Uuid::nil(),
            operator_id: "op".to_string(),
            operator_type: "reduce".to_string(),
            reason: CoverageGapReason::NoopInterpreter,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "operator_coverage_gap");
        assert_eq!(json["reason"], "noop_interpreter");
        assert_eq!(event.kind(), "operator_coverage_gap");
    }

    #[test]
    fn branch_event_round_trips() {
        let event = OperatorEvent::OperatorBranch {
            execution_id: Uuid::nil(),
            operator_id: "cond".to_string(),
            target: "A".to_string(),
        };
        let json = serde_json::to_string(&event).unwrap();
        let parsed: OperatorEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, event);
        assert_eq!(parsed.operator_id(), "cond");
    }
}
