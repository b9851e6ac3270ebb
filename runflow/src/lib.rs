//! # Runflow
//!
//! A pipeline automation engine built on composable stdio streams.
//!
//! Runflow executes named pipelines: trees of shell-command invocations with
//! conditional logic, variable interpolation and error handling. It provides:
//!
//! - **Composable data streams**: byte channels that can be copied,
//!   intercepted, merged and replaced while a pipeline runs
//! - **Runs**: a unit of execution owning stdin, stdout, stderr, an argument
//!   map and a nested logger
//! - **Middleware chain**: an ordered stack that rewires a run's streams and
//!   spawns child runs recursively
//! - **Shell execution**: processes attached to a run's streams, killed on
//!   cancellation
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use runflow::prelude::*;
//! use serde_json::json;
//!
//! let greet = as_arguments(json!({"shell": {"command": "echo hello"}})).unwrap();
//! let definitions = Definitions::new().with("greet", Definition::new(greet, "runflow.yml"));
//! let ctx = ExecutionContext::builder().definitions(definitions).build();
//!
//! let run = ctx.execute(RunOptions::new().identifier("greet")).await?;
//! println!("{}", run.stdout);
//! ctx.error_report().into_result()?;
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod config;
pub mod context;
pub mod errors;
pub mod expression;
pub mod log;
pub mod middleware;
pub mod observability;
pub mod prompt;
pub mod run;
pub mod shell;
pub mod stream;
pub mod sync;

#[cfg(test)]
pub(crate) mod testing;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::config::Settings;
    pub use crate::context::{Definition, Definitions, ExecutionContext, RunOptions};
    pub use crate::errors::{ErrorReport, PipelineError, StreamError};
    pub use crate::log::{LogLevel, Logger};
    pub use crate::middleware::{default_stack, Middleware, Next};
    pub use crate::prompt::{SelectionPrompt, SelectionRequest};
    pub use crate::run::{as_arguments, Arguments, Run};
    pub use crate::shell::{ProcessExecutor, ShellCommand, ShellExecutor, ShellProcess};
    pub use crate::stream::{pipe, DataStream, PipeReader, PipeWriter};
}
