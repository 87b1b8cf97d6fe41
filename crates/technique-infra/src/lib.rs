//! Infrastructure layer for technique compositions.
//!
//! Implements the storage ports defined in `technique-core` (a durable SQLite
//! checkpoint store) and loads engine configuration from the data directory.

pub mod config;
pub mod sqlite;
