//! The unit of pipeline execution.

use super::arguments::{
    merge_into_map, remove_value_at_path, set_value_at_path, value_at_path, Arguments,
};
use crate::context::Definition;
use crate::errors::{PipelineError, StreamError};
use crate::log::Logger;
use crate::stream::DataStream;
use crate::sync::WaitGroup;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::watch;
use tracing::debug;
use uuid::Uuid;

/// Cleanup registered by middleware, invoked when a run is cancelled.
pub type CancelHook = Arc<dyn Fn() -> anyhow::Result<()> + Send + Sync>;

/// One pipeline invocation.
///
/// A run owns its three streams and its logger. Middleware rewire the
/// streams while the run is being set up; [`Run::close`] freezes the wiring
/// and the run completes once everything has drained.
pub struct Run {
    id: Uuid,
    identifier: Option<String>,
    definition: Option<Definition>,
    arguments: RwLock<Arguments>,
    /// Input stream.
    pub stdin: DataStream,
    /// Output stream.
    pub stdout: DataStream,
    /// Error stream.
    pub stderr: DataStream,
    exit_code: Mutex<Option<i32>>,
    log: Arc<Logger>,
    parent: Option<Weak<Run>>,
    closed: AtomicBool,
    completed: watch::Sender<bool>,
    started: AtomicBool,
    cancelled: AtomicBool,
    synchronous: AtomicBool,
    cancel_hooks: Mutex<Vec<CancelHook>>,
    deferred_start: WaitGroup,
    deferred_log_closing: WaitGroup,
}

impl Run {
    /// Creates a run.
    ///
    /// The definition's default arguments are merged under `arguments`; a
    /// type conflict between the two fails construction.
    pub fn new(
        identifier: Option<String>,
        arguments: Arguments,
        definition: Option<Definition>,
        parent: Option<&Arc<Run>>,
    ) -> Result<Arc<Self>, PipelineError> {
        let mut arguments = arguments;
        if let Some(ref definition) = definition {
            merge_into_map(&mut arguments, &definition.arguments)?;
        }

        let indentation = parent.map_or(0, |parent| parent.log.indentation() + 2);
        let log = Arc::new(Logger::new(identifier.clone(), indentation));

        let stream = |name: &str| {
            let log = Arc::clone(&log);
            DataStream::with_error_handler(
                name,
                Arc::new(move |err: StreamError| log.error(err.into())),
            )
        };
        let (stdin, stdout, stderr) = (stream("stdin"), stream("stdout"), stream("stderr"));

        let (completed, _) = watch::channel(false);
        let run = Arc::new(Self {
            id: Uuid::new_v4(),
            identifier,
            definition,
            arguments: RwLock::new(arguments),
            stdin,
            stdout,
            stderr,
            exit_code: Mutex::new(None),
            log,
            parent: parent.map(Arc::downgrade),
            closed: AtomicBool::new(false),
            completed,
            started: AtomicBool::new(false),
            cancelled: AtomicBool::new(false),
            synchronous: AtomicBool::new(false),
            cancel_hooks: Mutex::new(Vec::new()),
            deferred_start: WaitGroup::new(),
            deferred_log_closing: WaitGroup::new(),
        });

        debug!(run_id = %run.id, identifier = ?run.identifier, "run created");
        Ok(run)
    }

    /// Unique id of this run.
    #[must_use]
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Pipeline identifier, if the run was started from one.
    #[must_use]
    pub fn identifier(&self) -> Option<&str> {
        self.identifier.as_deref()
    }

    /// Definition the run was resolved against.
    #[must_use]
    pub fn definition(&self) -> Option<&Definition> {
        self.definition.as_ref()
    }

    /// The run's logger.
    #[must_use]
    pub fn log(&self) -> &Arc<Logger> {
        &self.log
    }

    /// The parent run, while it is still alive.
    #[must_use]
    pub fn parent(&self) -> Option<Arc<Self>> {
        self.parent.as_ref().and_then(Weak::upgrade)
    }

    /// Recorded exit code, if a process ran.
    #[must_use]
    pub fn exit_code(&self) -> Option<i32> {
        *self.exit_code.lock()
    }

    /// Records the exit code.
    pub fn set_exit_code(&self, code: i32) {
        *self.exit_code.lock() = Some(code);
    }

    // --- arguments ---

    /// Returns a deep copy of the arguments.
    #[must_use]
    pub fn arguments_copy(&self) -> Arguments {
        self.arguments.read().clone()
    }

    /// Returns a copy of the value at `path`.
    pub fn argument_at_path(&self, path: &[&str]) -> Result<Value, PipelineError> {
        value_at_path(&self.arguments.read(), path).cloned()
    }

    /// Like [`Run::argument_at_path`], falling back to the ancestors in order.
    ///
    /// The error of this run's own lookup is returned when no ancestor has it.
    pub fn argument_at_path_including_parents(
        &self,
        path: &[&str],
    ) -> Result<Value, PipelineError> {
        let own = self.argument_at_path(path);
        if own.is_ok() {
            return own;
        }

        let mut ancestor = self.parent();
        while let Some(run) = ancestor {
            if let Ok(value) = run.argument_at_path(path) {
                return Ok(value);
            }
            ancestor = run.parent();
        }
        own
    }

    /// Stores `value` at `path`, creating intermediate maps.
    pub fn set_argument_at_path(&self, path: &[&str], value: Value) -> Result<(), PipelineError> {
        set_value_at_path(&mut self.arguments.write(), path, value)
    }

    /// Removes the value at `path`.
    pub fn remove_argument_at_path(&self, path: &[&str]) -> Result<Value, PipelineError> {
        remove_value_at_path(&mut self.arguments.write(), path)
    }

    /// Replaces the whole argument map.
    pub fn set_arguments(&self, arguments: Arguments) {
        *self.arguments.write() = arguments;
    }

    /// Deep-merges `other` under the current arguments.
    pub fn merge_arguments(&self, other: &Arguments) -> Result<(), PipelineError> {
        merge_into_map(&mut self.arguments.write(), other)
    }

    // --- lifecycle ---

    /// Marks the run as executing.
    pub fn mark_started(&self) {
        self.started.store(true, Ordering::SeqCst);
    }

    /// Returns true once execution began.
    #[must_use]
    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    /// Returns true if the run's start is ordered behind dependencies.
    #[must_use]
    pub fn is_synchronous(&self) -> bool {
        self.synchronous.load(Ordering::SeqCst)
    }

    /// Marks the run's start as ordered behind dependencies.
    pub fn set_synchronous(&self, synchronous: bool) {
        self.synchronous.store(synchronous, Ordering::SeqCst);
    }

    /// Work that must finish before the run may complete, registered before it starts.
    #[must_use]
    pub fn deferred_start(&self) -> &WaitGroup {
        &self.deferred_start
    }

    /// Logging work that must finish before the logger is closed.
    #[must_use]
    pub fn deferred_log_closing(&self) -> &WaitGroup {
        &self.deferred_log_closing
    }

    /// Returns true once `close` has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Returns true once every stream drained and the logger is closed.
    #[must_use]
    pub fn is_completed(&self) -> bool {
        *self.completed.borrow()
    }

    /// Closes the streams and completes the run in the background.
    ///
    /// Idempotent. Completion waits for the deferred start group, the three
    /// streams and the deferred log-closing group, in that order.
    pub fn close(self: &Arc<Self>) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        self.log.trace("closing");
        self.stdin.close();
        self.stdout.close();
        self.stderr.close();

        let run = Arc::clone(self);
        tokio::spawn(async move {
            run.deferred_start.wait().await;
            tokio::join!(run.stdin.wait(), run.stdout.wait(), run.stderr.wait());
            run.deferred_log_closing.wait().await;

            run.log.trace("completed");
            run.log.close();
            run.completed.send_replace(true);
            debug!(run_id = %run.id, "run completed");
        });
    }

    /// Waits until the run completed.
    pub async fn wait(&self) {
        tokio::join!(self.stdin.wait(), self.stdout.wait(), self.stderr.wait());
        let mut completed = self.completed.subscribe();
        let _ = completed.wait_for(|done| *done).await;
    }

    /// Registers a hook invoked on cancellation.
    pub fn add_cancel_hook<F>(&self, hook: F)
    where
        F: Fn() -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.cancel_hooks.lock().push(Arc::new(hook));
    }

    /// Returns true once `cancel` has been called.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Invokes every cancel hook and aggregates their failures.
    ///
    /// Cancelling a run that never started is reported as an error, but the
    /// hooks still run.
    pub fn cancel(&self) -> Result<(), PipelineError> {
        self.cancelled.store(true, Ordering::SeqCst);

        let mut errors = Vec::new();
        if !self.is_started() {
            errors.push(PipelineError::NotStarted);
        }

        let hooks = self.cancel_hooks.lock().clone();
        for hook in hooks {
            match catch_unwind(AssertUnwindSafe(|| hook())) {
                Ok(Ok(())) => {}
                Ok(Err(err)) => errors.push(PipelineError::CancelHook(format!("{err:#}"))),
                Err(_) => errors.push(PipelineError::CancelHook("hook panicked".to_string())),
            }
        }

        PipelineError::combine(errors)
    }

    /// Name shown in logs: the `description` argument, else the prettified
    /// identifier, else `anonymous`.
    #[must_use]
    pub fn display_name(&self) -> String {
        if let Ok(Value::String(description)) = self.argument_at_path(&["description"]) {
            return description;
        }
        self.identifier
            .as_deref()
            .map_or_else(|| "anonymous".to_string(), prettify)
    }
}

fn prettify(identifier: &str) -> String {
    let spaced = identifier.replace(['-', '_'], " ");
    let mut chars = spaced.chars();
    chars.next().map_or_else(String::new, |first| {
        first.to_uppercase().chain(chars).collect()
    })
}

fn human_bytes(len: usize) -> String {
    #[allow(clippy::cast_precision_loss)]
    let size = len as f64;
    if len < 1024 {
        format!("{len} B")
    } else if size < 1024.0 * 1024.0 {
        format!("{:.1} KiB", size / 1024.0)
    } else {
        format!("{:.1} MiB", size / (1024.0 * 1024.0))
    }
}

impl fmt::Display for Run {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.display_name())?;
        if !self.is_completed() {
            return Ok(());
        }

        let sizes: Vec<String> = [&self.stdin, &self.stdout, &self.stderr]
            .into_iter()
            .filter(|stream| !stream.is_empty())
            .map(|stream| format!("{} {}", stream.name(), human_bytes(stream.len())))
            .collect();
        if !sizes.is_empty() {
            write!(f, " ({})", sizes.join(", "))?;
        }

        let summary = self.log.summary();
        if !summary.is_empty() {
            write!(f, " [{summary}]")?;
        }
        Ok(())
    }
}

impl fmt::Debug for Run {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Run")
            .field("id", &self.id)
            .field("identifier", &self.identifier)
            .field("closed", &self.is_closed())
            .field("completed", &self.is_completed())
            .field("exit_code", &self.exit_code())
            .finish_non_exhaustive()
    }
}
