//! Checkpoint snapshot of an in-flight execution.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Why a checkpoint was taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CheckpointReason {
    ScheduledInterval,
    Failure,
    Manual,
}

impl CheckpointReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            CheckpointReason::ScheduledInterval => "scheduled-interval",
            CheckpointReason::Failure => "failure",
            CheckpointReason::Manual => "manual",
        }
    }
}

/// Durable snapshot of execution state enabling resume.
///
/// Created by the engine at checkpoint boundaries and consumed once by
/// `resume`. `order` is the primitive execution order; `next_index` is the
/// position execution continues from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub id: String,
    pub execution_id: Uuid,
    pub composition_id: String,
    pub graph_version: u32,
    pub order: Vec<String>,
    pub next_index: usize,
    /// Snapshot of the execution state store.
    pub state: Value,
    /// State keys that could not be captured in the snapshot.
    #[serde(default)]
    pub missing_state_keys: Vec<String>,
    pub continue_on_failure: bool,
    pub reason: CheckpointReason,
    pub created_at: DateTime<Utc>,
}

impl Checkpoint {
    /// Primitive IDs still to execute after this checkpoint.
    pub fn remaining(&self) -> &[String] {
        self.order.get(self.next_index..).unwrap_or(&[])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample(next_index: usize) -> Checkpoint {
        Checkpoint {
            id: "cp-1".to_string(),
            execution_id: Uuid::nil(),
            composition_id: "comp".to_string(),
            graph_version: 2,
            order: vec!["a".to_string(), "b".to_string()],
            next_index,
            state: json!({}),
            missing_state_keys: vec![],
            continue_on_failure: false,
            reason: CheckpointReason::ScheduledInterval,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn reason_serializes_kebab_case() {
        let json = serde_json::to_string(&CheckpointReason::ScheduledInterval).unwrap();
        assert_eq!(json, "\"scheduled-interval\"");
    }

    #[test]
    fn remaining_handles_out_of_range_index() {
        assert_eq!(sample(1).remaining(), &["b".to_string()]);
        assert!(sample(2).remaining().is_empty());
        assert!(sample(9).remaining().is_empty());
    }
}
