//! Bounded in-memory checkpoint store.
//!
//! Retention is capped per execution and globally; when either cap is
//! exceeded the oldest checkpoints are evicted first. Nothing survives the
//! process, so the store reports itself as not durable.

use std::collections::VecDeque;
use std::sync::Mutex;

use technique_types::checkpoint::Checkpoint;
use technique_types::config::EngineConfig;
use uuid::Uuid;

use super::{CheckpointError, CheckpointStore};

#[derive(Debug)]
pub struct MemoryCheckpointStore {
    /// Insertion order, oldest first.
    entries: Mutex<VecDeque<Checkpoint>>,
    max_per_execution: usize,
    max_total: usize,
}

impl MemoryCheckpointStore {
    pub fn new(max_per_execution: usize, max_total: usize) -> Self {
        Self {
            entries: Mutex::new(VecDeque::new()),
            max_per_execution: max_per_execution.max(1),
            max_total: max_total.max(1),
        }
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        Self::new(config.max_checkpoints_per_execution, config.max_checkpoints_total)
    }

    /// Number of checkpoints currently retained.
    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, VecDeque<Checkpoint>>, CheckpointError> {
        self.entries
            .lock()
            .map_err(|e| CheckpointError::Storage(format!("store lock poisoned: {e}")))
    }
}

impl Default for MemoryCheckpointStore {
    fn default() -> Self {
        Self::from_config(&EngineConfig::default())
    }
}

impl CheckpointStore for MemoryCheckpointStore {
    async fn save_checkpoint(&self, checkpoint: &Checkpoint) -> Result<(), CheckpointError> {
        let mut entries = self.lock()?;
        entries.retain(|c| c.id != checkpoint.id);
        entries.push_back(checkpoint.clone());

        let execution_id = checkpoint.execution_id;
        while entries.iter().filter(|c| c.execution_id == execution_id).count() > self.max_per_execution {
            let Some(pos) = entries.iter().position(|c| c.execution_id == execution_id) else {
                break;
            };
            if let Some(evicted) = entries.remove(pos) {
                tracing::debug!(checkpoint_id = evicted.id.as_str(), "evicted checkpoint (per-execution cap)");
            }
        }
        while entries.len() > self.max_total {
            if let Some(evicted) = entries.pop_front() {
                tracing::debug!(checkpoint_id = evicted.id.as_str(), "evicted checkpoint (global cap)");
            }
        }
        Ok(())
    }

    async fn get_checkpoint(&self, id: &str) -> Result<Option<Checkpoint>, CheckpointError> {
        Ok(self.lock()?.iter().find(|c| c.id == id).cloned())
    }

    async fn list_checkpoints(&self, execution_id: &Uuid) -> Result<Vec<Checkpoint>, CheckpointError> {
        Ok(self
            .lock()?
            .iter()
            .filter(|c| &c.execution_id == execution_id)
            .cloned()
            .collect())
    }

    fn is_durable(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;
    use technique_types::checkpoint::CheckpointReason;

    fn checkpoint(id: &str, execution_id: Uuid) -> Checkpoint {
        Checkpoint {
            id: id.to_string(),
            execution_id,
            composition_id: "comp".to_string(),
            graph_version: 2,
            order: vec!["a".to_string()],
            next_index: 0,
            state: json!({}),
            missing_state_keys: vec![],
            continue_on_failure: false,
            reason: CheckpointReason::Manual,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn save_and_get() {
        let store = MemoryCheckpointStore::default();
        let exec = Uuid::now_v7();
        store.save_checkpoint(&checkpoint("cp1", exec)).await.unwrap();
        assert_eq!(store.get_checkpoint("cp1").await.unwrap().unwrap().id, "cp1");
        assert!(store.get_checkpoint("missing").await.unwrap().is_none());
        assert!(!store.is_durable());
    }

    #[tokio::test]
    async fn evicts_oldest_per_execution() {
        let store = MemoryCheckpointStore::new(2, 100);
        let exec = Uuid::now_v7();
        let other = Uuid::now_v7();
        store.save_checkpoint(&checkpoint("other", other)).await.unwrap();
        for id in ["a", "b", "c"] {
            store.save_checkpoint(&checkpoint(id, exec)).await.unwrap();
        }
        let ids: Vec<String> = store
            .list_checkpoints(&exec)
            .await
            .unwrap()
            .into_iter()
            .map(|c| c.id)
            .collect();
        assert_eq!(ids, vec!["b", "c"]);
        assert!(store.get_checkpoint("other").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn evicts_oldest_globally() {
        let store = MemoryCheckpointStore::new(10, 3);
        for i in 0..5 {
            store
                .save_checkpoint(&checkpoint(&format!("cp{i}"), Uuid::now_v7()))
                .await
                .unwrap();
        }
        assert_eq!(store.len(), 3);
        assert!(store.get_checkpoint("cp0").await.unwrap().is_none());
        assert!(store.get_checkpoint("cp4").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn saving_same_id_replaces() {
        let store = MemoryCheckpointStore::default();
        let exec = Uuid::now_v7();
        store.save_checkpoint(&checkpoint("cp", exec)).await.unwrap();
        let mut updated = checkpoint("cp", exec);
        updated.next_index = 1;
        store.save_checkpoint(&updated).await.unwrap();
        assert_eq!(store.len(), 1);
        assert_eq!(store.get_checkpoint("cp").await.unwrap().unwrap().next_index, 1);
    }
}
