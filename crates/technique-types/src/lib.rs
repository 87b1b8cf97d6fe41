//! Shared domain types for technique compositions.
//!
//! This crate contains the data model consumed by the plan compiler and the
//! execution engine: compositions, primitives, operators, execution records,
//! checkpoints, work plans, operator events, and engine configuration.
//!
//! Zero infrastructure dependencies -- only serde, uuid, chrono, thiserror.

pub mod checkpoint;
pub mod composition;
pub mod config;
pub mod event;
pub mod execution;
pub mod llm;
pub mod plan;
