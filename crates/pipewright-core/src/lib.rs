//! Core domain types and traits for the pipewright workflow runner.
//!
//! This crate contains:
//! - Run identifiers
//! - Workflow definitions (triggers, matrix, steps)
//! - Repository events that may start a workflow
//! - Executor trait and job types
//! - Run and step results

pub mod error;
pub mod event;
pub mod executor;
pub mod id;
pub mod pipeline;

pub use error::{Error, Result};
pub use event::{EventKind, TriggerEvent};
pub use id::RunId;
