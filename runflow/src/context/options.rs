//! Options for spawning a run.

use crate::run::{Arguments, Run};
use crate::stream::{bytes_reader, BoxedReader, BoxedWriter};
use futures::future::BoxFuture;
use std::fmt;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};

/// Callback invoked around a run's execution.
pub type RunHook = Box<dyn FnOnce(&Arc<Run>) + Send>;

/// Replacement for the default middleware unwinding of a run.
pub type ExecuteFn = Box<dyn FnOnce(Arc<Run>) -> BoxFuture<'static, ()> + Send>;

/// Everything [`ExecutionContext::full_run`](super::ExecutionContext::full_run) needs.
///
/// `setup` runs before execution and `tear_down` after it, while the run's
/// streams are still open: stream wiring that must see the complete output
/// (such as forwarding a child's stdout into its parent) belongs there.
#[derive(Default)]
pub struct RunOptions {
    /// Pipeline identifier to resolve against the definitions.
    pub identifier: Option<String>,
    /// Invocation arguments.
    pub arguments: Arguments,
    /// Parent run.
    pub parent: Option<Arc<Run>>,
    /// Destination for the run's log instead of the parent's logger.
    pub log_writer: Option<BoxedWriter>,
    /// Initial stdin content.
    pub stdin: Option<BoxedReader>,
    /// Called before execution.
    pub setup: Option<RunHook>,
    /// Called after execution, before the run is closed.
    pub tear_down: Option<RunHook>,
    /// Overrides the default execution (unwinding the stack from the top).
    pub execute: Option<ExecuteFn>,
}

impl RunOptions {
    /// Creates empty options: an anonymous run with no arguments.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs the pipeline named `identifier`.
    #[must_use]
    pub fn identifier(mut self, identifier: impl Into<String>) -> Self {
        self.identifier = Some(identifier.into());
        self
    }

    /// Sets an optional pipeline identifier.
    #[must_use]
    pub fn maybe_identifier(mut self, identifier: Option<String>) -> Self {
        self.identifier = identifier;
        self
    }

    /// Sets the invocation arguments.
    #[must_use]
    pub fn arguments(mut self, arguments: Arguments) -> Self {
        self.arguments = arguments;
        self
    }

    /// Sets the parent run.
    #[must_use]
    pub fn parent(mut self, parent: &Arc<Run>) -> Self {
        self.parent = Some(Arc::clone(parent));
        self
    }

    /// Copies the run's log into `writer` instead of the parent's logger.
    #[must_use]
    pub fn log_writer<W>(mut self, writer: W) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        self.log_writer = Some(Box::new(writer));
        self
    }

    /// Feeds `reader` into the run's stdin.
    #[must_use]
    pub fn stdin<R>(mut self, reader: R) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        self.stdin = Some(Box::new(reader));
        self
    }

    /// Feeds fixed bytes into the run's stdin.
    #[must_use]
    pub fn stdin_bytes(self, bytes: impl Into<Vec<u8>>) -> Self {
        self.stdin(bytes_reader(bytes))
    }

    /// Sets the setup hook.
    #[must_use]
    pub fn setup<F>(mut self, hook: F) -> Self
    where
        F: FnOnce(&Arc<Run>) + Send + 'static,
    {
        self.setup = Some(Box::new(hook));
        self
    }

    /// Sets the tear-down hook.
    #[must_use]
    pub fn tear_down<F>(mut self, hook: F) -> Self
    where
        F: FnOnce(&Arc<Run>) + Send + 'static,
    {
        self.tear_down = Some(Box::new(hook));
        self
    }

    /// Overrides how the run is executed.
    #[must_use]
    pub fn execute<F>(mut self, execute: F) -> Self
    where
        F: FnOnce(Arc<Run>) -> BoxFuture<'static, ()> + Send + 'static,
    {
        self.execute = Some(Box::new(execute));
        self
    }
}

impl fmt::Debug for RunOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunOptions")
            .field("identifier", &self.identifier)
            .field("arguments", &self.arguments)
            .field("parent", &self.parent.as_ref().map(|p| p.id()))
            .field("log_writer", &self.log_writer.is_some())
            .field("stdin", &self.stdin.is_some())
            .field("setup", &self.setup.is_some())
            .field("tear_down", &self.tear_down.is_some())
            .field("execute", &self.execute.is_some())
            .finish()
    }
}
