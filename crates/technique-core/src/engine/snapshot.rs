//! Serialized run state stored inside checkpoints.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use technique_types::execution::ExecutionStep;

use crate::interpreter::ExecutionState;

/// Values larger than this are left out of checkpoint snapshots.
pub const MAX_CHECKPOINT_VALUE_BYTES: usize = 1024 * 1024;

/// Everything needed to continue a run from a unit boundary.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub(crate) struct RunSnapshot {
    pub state: ExecutionState,
    #[serde(default)]
    pub started: BTreeSet<String>,
    #[serde(default)]
    pub finished: BTreeSet<String>,
    #[serde(default)]
    pub operator_steps: BTreeMap<String, Vec<ExecutionStep>>,
    #[serde(default)]
    pub absorbed: BTreeSet<String>,
}

impl RunSnapshot {
    /// Serialize, leaving out oversized values. Returns the snapshot and the
    /// dotted paths of omitted values.
    pub fn to_checkpoint_state(mut self) -> (Value, Vec<String>) {
        let mut missing = Vec::new();
        prune(&mut self.state.input, "input", &mut missing);
        prune(&mut self.state.shared, "state", &mut missing);
        for (id, entry) in self.state.operators.iter_mut() {
            prune(entry, &format!("operators.{id}"), &mut missing);
        }
        self.state.outputs.retain(|pid, output| {
            let keep = !oversized(&Value::Object(output.clone()));
            if !keep {
                missing.push(format!("outputs.{pid}"));
            }
            keep
        });

        match serde_json::to_value(&self) {
            Ok(value) => (value, missing),
            Err(e) => {
                tracing::error!(error = %e, "failed to serialize run snapshot");
                missing.push("*".to_string());
                (Value::Null, missing)
            }
        }
    }
}

fn prune(map: &mut Map<String, Value>, prefix: &str, missing: &mut Vec<String>) {
    map.retain(|key, value| {
        let keep = !oversized(value);
        if !keep {
            missing.push(format!("{prefix}.{key}"));
        }
        keep
    });
}

fn oversized(value: &Value) -> bool {
    serde_json::to_vec(value).map_or(true, |bytes| bytes.len() > MAX_CHECKPOINT_VALUE_BYTES)
}
