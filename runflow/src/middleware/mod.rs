//! The middleware chain.
//!
//! Every run is driven through an ordered stack of [`Middleware`]. Each one
//! reads its own argument from the run, rewires the run's streams and
//! decides whether (and when) to continue with [`Next`].
//!
//! Contract:
//! - absent argument: call `next` and return;
//! - malformed argument: log it and behave as if absent;
//! - stream wiring that must outlive `apply` is obtained before `apply`
//!   returns, because the run is closed right after;
//! - waiting on stream content or run completion happens in spawned tasks.

mod catch;
mod disabled;
mod each;
mod inherit;
mod interpolate;
mod plumbing;
mod retry;
mod select;
mod sequence;
mod shell;
mod stdin;
mod wait_for;
mod when;


pub use catch::{CatchEachMiddleware, CatchMiddleware};
pub use disabled::DisabledMiddleware;
pub use each::EachMiddleware;
pub use inherit::InheritMiddleware;
pub use interpolate::InterpolateMiddleware;
pub use retry::{BackoffStrategy, JitterStrategy, RetryMiddleware, RetryPolicy};
pub use select::SelectMiddleware;
pub use sequence::{DoMiddleware, PipeMiddleware};
pub use shell::ShellMiddleware;
pub use stdin::StdinMiddleware;
pub use wait_for::WaitForMiddleware;
pub use when::WhenMiddleware;

use crate::context::{ExecutionContext, RunOptions};
use crate::errors::PipelineError;
use crate::run::{Arguments, Run};
use async_trait::async_trait;
use futures::future::BoxFuture;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

/// One link in the chain of responsibility.
#[async_trait]
pub trait Middleware: Send + Sync {
    /// Name of the middleware, which is also the argument it reads.
    fn name(&self) -> &'static str;

    /// Applies the middleware to `run`.
    async fn apply(&self, run: Arc<Run>, next: Next, ctx: &Arc<ExecutionContext>);
}

/// Continuation running the remainder of the stack.
///
/// Cheap to clone, so the remainder can be run again on fresh child runs.
#[derive(Clone)]
pub struct Next {
    ctx: Arc<ExecutionContext>,
    index: usize,
}

impl Next {
    pub(crate) fn new(ctx: Arc<ExecutionContext>, index: usize) -> Self {
        Self { ctx, index }
    }

    /// Position in the stack this continuation resumes at.
    #[must_use]
    pub fn index(&self) -> usize {
        self.index
    }

    /// Runs the remainder of the stack on `run`.
    pub fn run(&self, run: Arc<Run>) -> BoxFuture<'static, ()> {
        self.ctx.unwind_stack(run, self.index)
    }
}

impl fmt::Debug for Next {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Next").field("index", &self.index).finish()
    }
}

/// The default stack, outermost first.
#[must_use]
pub fn default_stack() -> Vec<Arc<dyn Middleware>> {
    vec![
        Arc::new(DisabledMiddleware),
        Arc::new(InheritMiddleware),
        Arc::new(InterpolateMiddleware),
        Arc::new(WaitForMiddleware),
        Arc::new(WhenMiddleware),
        Arc::new(SelectMiddleware),
        Arc::new(RetryMiddleware),
        Arc::new(CatchMiddleware),
        Arc::new(CatchEachMiddleware),
        Arc::new(StdinMiddleware),
        Arc::new(EachMiddleware),
        Arc::new(DoMiddleware),
        Arc::new(PipeMiddleware),
        Arc::new(ShellMiddleware),
    ]
}

/// Argument keys whose values are child specs; interpolation leaves them to
/// the children.
pub(crate) const CHILD_SPEC_KEYS: [&str; 6] =
    ["catch", "catch-each", "each", "do", "pipe", "select"];

/// A child pipeline to spawn: an identifier and/or invocation arguments.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChildSpec {
    /// Pipeline identifier.
    pub identifier: Option<String>,
    /// Invocation arguments.
    pub arguments: Arguments,
}

impl ChildSpec {
    /// Parses a string identifier or a map with an optional `pipeline` key.
    pub fn parse(middleware: &str, value: &Value) -> Result<Self, PipelineError> {
        match value {
            Value::String(identifier) => Ok(Self {
                identifier: Some(identifier.clone()),
                arguments: Arguments::new(),
            }),
            Value::Object(map) => {
                let mut arguments = map.clone();
                let identifier = match arguments.remove("pipeline") {
                    None | Some(Value::Null) => None,
                    Some(Value::String(identifier)) => Some(identifier),
                    Some(_) => {
                        return Err(PipelineError::malformed(
                            middleware,
                            "\"pipeline\" must be a string",
                        ))
                    }
                };
                Ok(Self {
                    identifier,
                    arguments,
                })
            }
            other => Err(PipelineError::malformed(
                middleware,
                format!("expected a pipeline name or map, got {other}"),
            )),
        }
    }

    /// Parses a list of child specs.
    pub fn parse_list(middleware: &str, value: &Value) -> Result<Vec<Self>, PipelineError> {
        match value {
            Value::Array(items) => items
                .iter()
                .map(|item| Self::parse(middleware, item))
                .collect(),
            other => Err(PipelineError::malformed(
                middleware,
                format!("expected a list, got {other}"),
            )),
        }
    }

    /// Label for prompts and logs.
    #[must_use]
    pub fn label(&self) -> String {
        if let Some(Value::String(description)) = self.arguments.get("description") {
            return description.clone();
        }
        match self.identifier {
            Some(ref identifier) => identifier.clone(),
            None => Value::Object(self.arguments.clone()).to_string(),
        }
    }

    /// Options for spawning this spec as a child of `parent`.
    #[must_use]
    pub fn into_options(self, parent: &Arc<Run>) -> RunOptions {
        RunOptions::new()
            .maybe_identifier(self.identifier)
            .arguments(self.arguments)
            .parent(parent)
    }
}

/// Reads and parses the argument named after the middleware.
///
/// Absent or null arguments yield `None`. A parse failure is logged on the
/// run and also yields `None`, so the middleware behaves as inactive.
pub(crate) fn read_argument<T>(
    run: &Run,
    name: &str,
    parse: impl FnOnce(&Value) -> Result<T, PipelineError>,
) -> Option<T> {
    let value = run.argument_at_path(&[name]).ok()?;
    if value.is_null() {
        return None;
    }
    match parse(&value) {
        Ok(parsed) => Some(parsed),
        Err(err) => {
            run.log().error(err);
            None
        }
    }
}
