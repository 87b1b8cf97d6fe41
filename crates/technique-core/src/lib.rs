//! Compilation and execution of technique compositions.
//!
//! This crate holds the behavior behind the data model in `technique-types`:
//! the operator semantics registry, the plan compiler, the condition grammar,
//! the operator interpreters, and the execution engine. Storage backends are
//! expressed as traits ("ports") that `technique-infra` implements.

pub mod checkpoint;
pub mod compiler;
pub mod composition;
pub mod condition;
pub mod engine;
pub mod event;
pub mod executor;
pub mod graph;
pub mod interpreter;
pub mod sanitize;
pub mod semantics;
