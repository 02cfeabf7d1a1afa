//! Core types for a runner session: orchestrator builder, context, and error handling.

pub mod builder;
pub mod context;
pub mod error;

pub use builder::{ExitCode, Orchestrator, OrchestratorBuilder, TestRun};
pub use context::Context;
pub use error::{Error, Result};
