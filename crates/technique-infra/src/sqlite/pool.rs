//! Connections to the checkpoint database.
//!
//! `SqliteCheckpointStore` upserts checkpoints through `writer` and serves
//! `get_checkpoint`/`list_checkpoints` plus resume lookups from `reader`.
//! SQLite admits a single writer, so saves from concurrent executions queue
//! on one connection while resumes read in parallel under WAL.

use std::str::FromStr;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};

use crate::config::default_data_dir;

/// Reader and writer pools over one checkpoint database file.
///
/// - `reader`: read-only, up to 8 connections for checkpoint lookups.
/// - `writer`: one connection for checkpoint upserts and retention deletes.
#[derive(Clone)]
pub struct DatabasePool {
    pub reader: SqlitePool,
    pub writer: SqlitePool,
}

impl DatabasePool {
    /// Open (creating if needed) the checkpoint database and apply the
    /// `checkpoints` table migrations before the reader opens.
    ///
    /// Connections wait up to 5 seconds on a locked database.
    pub async fn new(database_url: &str) -> Result<Self, sqlx::Error> {
        let base_opts = SqliteConnectOptions::from_str(database_url)?
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true)
            .busy_timeout(std::time::Duration::from_secs(5))
            .create_if_missing(true);

        let read_opts = base_opts.clone().read_only(true);
        let write_opts = base_opts;

        let writer = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(write_opts)
            .await?;

        // Migrations must land before the read-only pool opens.
        sqlx::migrate!("../../migrations").run(&writer).await?;

        let reader = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(read_opts)
            .await?;

        Ok(Self { reader, writer })
    }
}

/// Checkpoint database URL inside [`default_data_dir`].
pub fn default_database_url() -> String {
    format!("sqlite://{}/technique.db", default_data_dir().display())
}
