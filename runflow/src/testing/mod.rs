//! Testing utilities for runflow pipelines.
//!
//! This module provides:
//! - Mock middleware, prompts and shell executors
//! - Run and context fixtures

mod fixtures;
mod mocks;

pub use fixtures::{execute_pipeline, run_with_arguments, run_with_stdin, test_context};
pub use mocks::{RecordingMiddleware, ScriptedExecutor, StaticPrompt};
