//! SQLite checkpoint store.
//!
//! Implements `CheckpointStore` from `technique-core`. The execution order,
//! state snapshot, and missing-key list are stored as JSON text; timestamps
//! are fixed-width RFC 3339 so they sort lexically. Retention mirrors the
//! in-memory store: oldest checkpoints are pruned once the per-execution or
//! global cap is exceeded.

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::Value;
use sqlx::Row;
use technique_core::checkpoint::{CheckpointError, CheckpointStore};
use technique_types::checkpoint::{Checkpoint, CheckpointReason};
use technique_types::config::EngineConfig;
use uuid::Uuid;

use super::pool::DatabasePool;

/// Durable checkpoint store backed by SQLite.
pub struct SqliteCheckpointStore {
    pool: DatabasePool,
    max_per_execution: usize,
    max_total: usize,
}

impl SqliteCheckpointStore {
    /// Create a store with the default retention limits.
    pub fn new(pool: DatabasePool) -> Self {
        Self::from_config(pool, &EngineConfig::default())
    }

    /// Create a store with retention taken from the engine config.
    pub fn from_config(pool: DatabasePool, config: &EngineConfig) -> Self {
        Self::with_retention(pool, config.max_checkpoints_per_execution, config.max_checkpoints_total)
    }

    pub fn with_retention(pool: DatabasePool, max_per_execution: usize, max_total: usize) -> Self {
        Self {
            pool,
            max_per_execution: max_per_execution.max(1),
            max_total: max_total.max(1),
        }
    }

    async fn prune(&self, execution_id: &str) -> Result<(), CheckpointError> {
        let per_execution = sqlx::query(
            r#"DELETE FROM checkpoints
               WHERE execution_id = ?
                 AND id NOT IN (
                   SELECT id FROM checkpoints
                   WHERE execution_id = ?
                   ORDER BY created_at DESC, rowid DESC
                   LIMIT ?
                 )"#,
        )
        .bind(execution_id)
        .bind(execution_id)
        .bind(limit(self.max_per_execution))
        .execute(&self.pool.writer)
        .await
        .map_err(storage)?;

        let global = sqlx::query(
            r#"DELETE FROM checkpoints
               WHERE id NOT IN (
                 SELECT id FROM checkpoints
                 ORDER BY created_at DESC, rowid DESC
                 LIMIT ?
               )"#,
        )
        .bind(limit(self.max_total))
        .execute(&self.pool.writer)
        .await
        .map_err(storage)?;

        let evicted = per_execution.rows_affected() + global.rows_affected();
        if evicted > 0 {
            tracing::debug!(execution_id, evicted, "pruned checkpoints");
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Internal row type
// ---------------------------------------------------------------------------

struct CheckpointRow {
    id: String,
    execution_id: String,
    composition_id: String,
    graph_version: i64,
    execution_order: String,
    next_index: i64,
    state: String,
    missing_state_keys: String,
    continue_on_failure: bool,
    reason: String,
    created_at: String,
}

impl CheckpointRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            execution_id: row.try_get("execution_id")?,
            composition_id: row.try_get("composition_id")?,
            graph_version: row.try_get("graph_version")?,
            execution_order: row.try_get("execution_order")?,
            next_index: row.try_get("next_index")?,
            state: row.try_get("state")?,
            missing_state_keys: row.try_get("missing_state_keys")?,
            continue_on_failure: row.try_get("continue_on_failure")?,
            reason: row.try_get("reason")?,
            created_at: row.try_get("created_at")?,
        })
    }

    fn into_checkpoint(self) -> Result<Checkpoint, CheckpointError> {
        let reason: CheckpointReason = serde_json::from_value(Value::String(self.reason.clone()))
            .map_err(|_| CheckpointError::Serialization(format!("invalid checkpoint reason: {}", self.reason)))?;
        let order: Vec<String> = serde_json::from_str(&self.execution_order)
            .map_err(|e| CheckpointError::Serialization(format!("invalid execution order JSON: {e}")))?;
        let state: Value = serde_json::from_str(&self.state)
            .map_err(|e| CheckpointError::Serialization(format!("invalid state JSON: {e}")))?;
        let missing_state_keys: Vec<String> = serde_json::from_str(&self.missing_state_keys)
            .map_err(|e| CheckpointError::Serialization(format!("invalid missing_state_keys JSON: {e}")))?;

        Ok(Checkpoint {
            id: self.id,
            execution_id: parse_uuid(&self.execution_id)?,
            composition_id: self.composition_id,
            graph_version: u32::try_from(self.graph_version)
                .map_err(|_| CheckpointError::Serialization(format!("invalid graph_version: {}", self.graph_version)))?,
            order,
            next_index: usize::try_from(self.next_index)
                .map_err(|_| CheckpointError::Serialization(format!("invalid next_index: {}", self.next_index)))?,
            state,
            missing_state_keys,
            continue_on_failure: self.continue_on_failure,
            reason,
            created_at: parse_datetime(&self.created_at)?,
        })
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn storage(e: sqlx::Error) -> CheckpointError {
    CheckpointError::Storage(e.to_string())
}

fn parse_uuid(s: &str) -> Result<Uuid, CheckpointError> {
    s.parse::<Uuid>()
        .map_err(|e| CheckpointError::Serialization(format!("invalid UUID: {e}")))
}

fn parse_datetime(s: &str) -> Result<DateTime<Utc>, CheckpointError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| CheckpointError::Serialization(format!("invalid datetime: {e}")))
}

fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn limit(n: usize) -> i64 {
    i64::try_from(n).unwrap_or(i64::MAX)
}

fn to_json<T: serde::Serialize + ?Sized>(value: &T, what: &str) -> Result<String, CheckpointError> {
    serde_json::to_string(value).map_err(|e| CheckpointError::Serialization(format!("serialize {what}: {e}")))
}

// ---------------------------------------------------------------------------
// CheckpointStore impl
// ---------------------------------------------------------------------------

impl CheckpointStore for SqliteCheckpointStore {
    async fn save_checkpoint(&self, checkpoint: &Checkpoint) -> Result<(), CheckpointError> {
        let order = to_json(&checkpoint.order, "execution order")?;
        let state = to_json(&checkpoint.state, "state")?;
        let missing = to_json(&checkpoint.missing_state_keys, "missing_state_keys")?;
        let execution_id = checkpoint.execution_id.to_string();

        sqlx::query(
            r#"INSERT INTO checkpoints (id, execution_id, composition_id, graph_version, execution_order,
                                        next_index, state, missing_state_keys, continue_on_failure, reason, created_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
               ON CONFLICT(id) DO UPDATE SET
                 execution_id = excluded.execution_id,
                 composition_id = excluded.composition_id,
                 graph_version = excluded.graph_version,
                 execution_order = excluded.execution_order,
                 next_index = excluded.next_index,
                 state = excluded.state,
                 missing_state_keys = excluded.missing_state_keys,
                 continue_on_failure = excluded.continue_on_failure,
                 reason = excluded.reason,
                 created_at = excluded.created_at"#,
        )
        .bind(&checkpoint.id)
        .bind(&execution_id)
        .bind(&checkpoint.composition_id)
        .bind(i64::from(checkpoint.graph_version))
        .bind(&order)
        .bind(limit(checkpoint.next_index))
        .bind(&state)
        .bind(&missing)
        .bind(checkpoint.continue_on_failure)
        .bind(checkpoint.reason.as_str())
        .bind(format_datetime(&checkpoint.created_at))
        .execute(&self.pool.writer)
        .await
        .map_err(storage)?;

        tracing::debug!(
            checkpoint_id = checkpoint.id.as_str(),
            execution_id = execution_id.as_str(),
            reason = checkpoint.reason.as_str(),
            "saved checkpoint"
        );

        self.prune(&execution_id).await
    }

    async fn get_checkpoint(&self, id: &str) -> Result<Option<Checkpoint>, CheckpointError> {
        let row = sqlx::query("SELECT * FROM checkpoints WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(storage)?;

        match row {
            Some(row) => {
                let r = CheckpointRow::from_row(&row).map_err(storage)?;
                Ok(Some(r.into_checkpoint()?))
            }
            None => Ok(None),
        }
    }

    async fn list_checkpoints(&self, execution_id: &Uuid) -> Result<Vec<Checkpoint>, CheckpointError> {
        let rows = sqlx::query(
            "SELECT * FROM checkpoints WHERE execution_id = ? ORDER BY created_at ASC, rowid ASC",
        )
        .bind(execution_id.to_string())
        .fetch_all(&self.pool.reader)
        .await
        .map_err(storage)?;

        rows.iter()
            .map(|row| {
                CheckpointRow::from_row(row)
                    .map_err(storage)
                    .and_then(CheckpointRow::into_checkpoint)
            })
            .collect()
    }

    fn is_durable(&self) -> bool {
        true
    }
}
