//! Engine configuration.
//!
//! `EngineConfig` represents the `engine.toml` file that controls
//! checkpointing, failure handling, and in-memory retention limits.

use serde::{Deserialize, Serialize};

/// Execution engine settings. All fields have sensible defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Take a checkpoint every N executed steps (None = never).
    #[serde(default)]
    pub checkpoint_interval: Option<u32>,

    /// Take a checkpoint when a step fails.
    #[serde(default)]
    pub checkpoint_on_failure: bool,

    /// Keep executing after a step failure.
    #[serde(default)]
    pub continue_on_failure: bool,

    /// Allow checkpointing into a store that is not durable.
    #[serde(default)]
    pub allow_insecure_checkpoint_store: bool,

    /// Per-primitive execution timeout in seconds (None = unbounded).
    #[serde(default)]
    pub step_timeout_secs: Option<u64>,

    /// In-memory store retention per execution.
    #[serde(default = "default_max_checkpoints_per_execution")]
    pub max_checkpoints_per_execution: usize,

    /// In-memory store retention across all executions.
    #[serde(default = "default_max_checkpoints_total")]
    pub max_checkpoints_total: usize,
}

fn default_max_checkpoints_per_execution() -> usize {
    20
}

fn default_max_checkpoints_total() -> usize {
    200
}

impl EngineConfig {
    /// Whether any checkpoint trigger is configured.
    pub fn checkpointing_enabled(&self) -> bool {
        self.checkpoint_interval.is_some_and(|n| n > 0) || self.checkpoint_on_failure
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            checkpoint_interval: None,
            checkpoint_on_failure: false,
            continue_on_failure: false,
            allow_insecure_checkpoint_store: false,
            step_timeout_secs: None,
            max_checkpoints_per_execution: default_max_checkpoints_per_execution(),
            max_checkpoints_total: default_max_checkpoints_total(),
        }
    }
}
