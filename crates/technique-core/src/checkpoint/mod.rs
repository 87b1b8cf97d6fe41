//! Checkpoint persistence contract.
//!
//! The engine writes a [`Checkpoint`] at interval, failure, and
//! operator-requested boundaries and reads one back to resume. Durable
//! implementations live in technique-infra (`SqliteCheckpointStore`);
//! [`MemoryCheckpointStore`] is the bounded in-process reference store.

pub mod memory;

pub use memory::MemoryCheckpointStore;

use technique_types::checkpoint::Checkpoint;
use uuid::Uuid;

/// Errors raised by a checkpoint store.
#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    #[error("checkpoint not found: {0}")]
    NotFound(String),

    #[error("checkpoint storage error: {0}")]
    Storage(String),

    #[error("checkpoint serialization error: {0}")]
    Serialization(String),

    #[error("checkpoint store is not durable and insecure stores are not allowed")]
    NotDurable,
}

impl CheckpointError {
    pub fn code(&self) -> &'static str {
        match self {
            CheckpointError::NotFound(_) => "checkpoint_not_found",
            CheckpointError::Storage(_) => "checkpoint_storage_failed",
            CheckpointError::Serialization(_) => "checkpoint_serialization_failed",
            CheckpointError::NotDurable => "checkpoint_store_not_durable",
        }
    }
}

/// Storage for execution checkpoints.
///
/// Uses native async fn in traits (Rust 2024 edition, no async_trait macro).
pub trait CheckpointStore: Send + Sync {
    /// Persist a checkpoint, replacing any existing one with the same id.
    fn save_checkpoint(
        &self,
        checkpoint: &Checkpoint,
    ) -> impl std::future::Future<Output = Result<(), CheckpointError>> + Send;

    /// Load a checkpoint by id.
    fn get_checkpoint(
        &self,
        id: &str,
    ) -> impl std::future::Future<Output = Result<Option<Checkpoint>, CheckpointError>> + Send;

    /// All checkpoints of one execution, oldest first.
    fn list_checkpoints(
        &self,
        execution_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Vec<Checkpoint>, CheckpointError>> + Send;

    /// Whether checkpoints survive a process restart.
    fn is_durable(&self) -> bool;
}
