//! The execution context: spawns runs and drives them through the stack.

use super::{Definition, Definitions, RunOptions};
use crate::config::Settings;
use crate::errors::{ErrorReport, PipelineError};
use crate::log::LogFields;
use crate::middleware::{default_stack, Middleware, Next};
use crate::prompt::{NonInteractivePrompt, SelectionPrompt};
use crate::run::Run;
use crate::shell::{ProcessExecutor, ShellExecutor};
use crate::stream::DataStream;
use futures::future::{BoxFuture, FutureExt};
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

/// Holds the middleware stack and the definitions, and tracks every run.
pub struct ExecutionContext {
    stack: Vec<Arc<dyn Middleware>>,
    definitions: Definitions,
    settings: Settings,
    prompt: Arc<dyn SelectionPrompt>,
    executor: Arc<dyn ShellExecutor>,
    runs: RwLock<Vec<Arc<Run>>>,
    errors: Arc<Mutex<Vec<PipelineError>>>,
    log_tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ExecutionContext {
    /// Starts building a context.
    #[must_use]
    pub fn builder() -> ExecutionContextBuilder {
        ExecutionContextBuilder::default()
    }

    /// Engine settings.
    #[must_use]
    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Pipeline definitions.
    #[must_use]
    pub fn definitions(&self) -> &Definitions {
        &self.definitions
    }

    /// The middleware stack, outermost first.
    #[must_use]
    pub fn stack(&self) -> &[Arc<dyn Middleware>] {
        &self.stack
    }

    /// Prompt used by selection middleware.
    #[must_use]
    pub fn prompt(&self) -> Arc<dyn SelectionPrompt> {
        Arc::clone(&self.prompt)
    }

    /// Executor used by the shell middleware.
    #[must_use]
    pub fn executor(&self) -> &Arc<dyn ShellExecutor> {
        &self.executor
    }

    /// Resolves a pipeline identifier.
    ///
    /// A definition from the root file wins, then the first public one, then
    /// the first private one.
    pub fn lookup_pipeline_definition(
        &self,
        identifier: &str,
    ) -> Result<&Definition, PipelineError> {
        self.definitions
            .resolve(identifier, self.settings.root_file_name.as_deref())
            .ok_or_else(|| PipelineError::UnknownPipeline(identifier.to_string()))
    }

    /// Creates a run and drives it through the stack.
    ///
    /// Resolves once the run's wiring is set up and the run is closed, not
    /// when it completes; use [`Run::wait`] for that.
    pub fn full_run(
        self: &Arc<Self>,
        options: RunOptions,
    ) -> BoxFuture<'static, Result<Arc<Run>, PipelineError>> {
        let ctx = Arc::clone(self);
        async move {
            let RunOptions {
                identifier,
                arguments,
                parent,
                log_writer,
                stdin,
                setup,
                tear_down,
                execute,
            } = options;

            let definition = match identifier {
                Some(ref id) => Some(ctx.lookup_pipeline_definition(id)?.clone()),
                None => None,
            };
            let run = Run::new(identifier, arguments, definition, parent.as_ref())?;
            run.log().set_level(ctx.settings.log_level);

            let errors = Arc::clone(&ctx.errors);
            run.log()
                .set_error_callback(Arc::new(move |err| errors.lock().push(err)));

            if let Some(mut writer) = log_writer {
                let mut reader = run.log().reader();
                let handle = tokio::spawn(async move {
                    if let Err(err) = tokio::io::copy(&mut reader, &mut writer).await {
                        warn!(error = %err, "copying run log failed");
                    }
                    let _ = writer.shutdown().await;
                });
                ctx.log_tasks.lock().push(handle);
            } else if let Some(parent) = run.parent() {
                parent.log().add_reader_entry(run.log().reader());
            }

            if let Some(stdin) = stdin {
                run.stdin.merge_with(stdin);
            }

            let fields = LogFields::message(format!("starting {run}"))
                .with_field("run_id", run.id().to_string());
            run.log().debug_with_fields(fields);
            ctx.runs.write().push(Arc::clone(&run));
            run.mark_started();

            if let Some(setup) = setup {
                setup(&run);
            }
            match execute {
                Some(execute) => execute(Arc::clone(&run)).await,
                None => ctx.unwind_stack(Arc::clone(&run), 0).await,
            }
            if let Some(tear_down) = tear_down {
                tear_down(&run);
            }

            log_streams(&run);
            run.close();
            Ok(run)
        }
        .boxed()
    }

    /// Applies `stack[index]` to `run`; past the end of the stack this is a no-op.
    pub fn unwind_stack(self: &Arc<Self>, run: Arc<Run>, index: usize) -> BoxFuture<'static, ()> {
        let ctx = Arc::clone(self);
        async move {
            let Some(middleware) = ctx.stack.get(index).cloned() else {
                return;
            };
            trace!(
                middleware = middleware.name(),
                index,
                run_id = %run.id(),
                "applying middleware"
            );
            let next = Next::new(Arc::clone(&ctx), index + 1);
            middleware.apply(run, next, &ctx).await;
        }
        .boxed()
    }

    /// Runs to completion: [`full_run`](Self::full_run), then waits for the
    /// run and for any log writers to drain.
    pub async fn execute(self: &Arc<Self>, options: RunOptions) -> Result<Arc<Run>, PipelineError> {
        let run = self.full_run(options).await?;
        run.wait().await;
        self.wait_for_log_output().await;
        Ok(run)
    }

    /// Every run created so far, in creation order.
    #[must_use]
    pub fn runs(&self) -> Vec<Arc<Run>> {
        self.runs.read().clone()
    }

    /// Runs created for `identifier`.
    #[must_use]
    pub fn runs_with_identifier(&self, identifier: &str) -> Vec<Arc<Run>> {
        self.runs
            .read()
            .iter()
            .filter(|run| run.identifier() == Some(identifier))
            .cloned()
            .collect()
    }

    /// Every error logged so far, attributed to its run.
    #[must_use]
    pub fn errors(&self) -> Vec<PipelineError> {
        self.errors.lock().clone()
    }

    /// Aggregated report of all logged errors.
    #[must_use]
    pub fn error_report(&self) -> ErrorReport {
        ErrorReport::new(self.errors())
    }

    /// Waits for every log-writer copy started so far.
    pub async fn wait_for_log_output(&self) {
        let handles: Vec<_> = self.log_tasks.lock().drain(..).collect();
        for handle in handles {
            let _ = handle.await;
        }
    }
}

/// Logs each stream's content once it completes; gates the run's completion.
fn log_streams(run: &Arc<Run>) {
    let streams: [(&DataStream, bool); 3] = [
        (&run.stdin, false),
        (&run.stdout, false),
        (&run.stderr, true),
    ];
    run.deferred_log_closing().add(streams.len());

    for (stream, is_stderr) in streams {
        let run = Arc::clone(run);
        let stream = stream.clone();
        tokio::spawn(async move {
            stream.wait().await;
            if !stream.is_empty() {
                let content = stream.to_string();
                if is_stderr {
                    let content = content.trim_end().to_string();
                    run.log().error(PipelineError::Stderr(content));
                } else {
                    run.log().trace_with_fields(
                        LogFields::message(stream.name())
                            .with_symbol(">")
                            .with_info(content.trim_end()),
                    );
                }
            }
            run.deferred_log_closing().done();
        });
    }
}

impl std::fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionContext")
            .field(
                "stack",
                &self.stack.iter().map(|m| m.name()).collect::<Vec<_>>(),
            )
            .field("settings", &self.settings)
            .field("runs", &self.runs.read().len())
            .field("errors", &self.errors.lock().len())
            .finish_non_exhaustive()
    }
}

/// Builder for [`ExecutionContext`].
#[derive(Default)]
pub struct ExecutionContextBuilder {
    stack: Option<Vec<Arc<dyn Middleware>>>,
    definitions: Definitions,
    settings: Settings,
    prompt: Option<Arc<dyn SelectionPrompt>>,
    executor: Option<Arc<dyn ShellExecutor>>,
}

impl ExecutionContextBuilder {
    /// Replaces the default middleware stack.
    #[must_use]
    pub fn stack(mut self, stack: Vec<Arc<dyn Middleware>>) -> Self {
        self.stack = Some(stack);
        self
    }

    /// Sets the pipeline definitions.
    #[must_use]
    pub fn definitions(mut self, definitions: Definitions) -> Self {
        self.definitions = definitions;
        self
    }

    /// Sets the engine settings.
    #[must_use]
    pub fn settings(mut self, settings: Settings) -> Self {
        self.settings = settings;
        self
    }

    /// Sets the selection prompt.
    #[must_use]
    pub fn prompt(mut self, prompt: Arc<dyn SelectionPrompt>) -> Self {
        self.prompt = Some(prompt);
        self
    }

    /// Sets the shell executor.
    #[must_use]
    pub fn executor(mut self, executor: Arc<dyn ShellExecutor>) -> Self {
        self.executor = Some(executor);
        self
    }

    /// Builds the context.
    #[must_use]
    pub fn build(self) -> Arc<ExecutionContext> {
        let stack = self.stack.unwrap_or_else(default_stack);
        debug!(middleware = stack.len(), "execution context created");
        Arc::new(ExecutionContext {
            stack,
            definitions: self.definitions,
            settings: self.settings,
            prompt: self.prompt.unwrap_or_else(|| Arc::new(NonInteractivePrompt)),
            executor: self.executor.unwrap_or_else(|| Arc::new(ProcessExecutor)),
            runs: RwLock::new(Vec::new()),
            errors: Arc::new(Mutex::new(Vec::new())),
            log_tasks: Mutex::new(Vec::new()),
        })
    }
}
