//! `catch` and `catch-each`: stderr handlers.
//!
//! Both intercept the run's stderr after the rest of the chain is wired. A
//! handler child is fed the captured content; its stdout is appended to the
//! run's stdout and its stderr takes the place of the captured content.

use super::plumbing::spawn_captured;
use super::{read_argument, ChildSpec, Middleware, Next};
use crate::context::ExecutionContext;
use crate::errors::PipelineError;
use crate::run::Run;
use crate::stream::{read_all, BoxedReader, PipeWriter};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tracing::trace;

/// Where captured stderr goes.
struct Handler {
    ctx: Arc<ExecutionContext>,
    run: Arc<Run>,
    spec: ChildSpec,
    stdout: PipeWriter,
    stderr: PipeWriter,
}

impl Handler {
    /// Intercepts the run's stderr; `None` if its streams are closed.
    fn install(
        run: &Arc<Run>,
        ctx: &Arc<ExecutionContext>,
        spec: ChildSpec,
    ) -> Option<(Self, BoxedReader)> {
        let stdout = run.stdout.write_closer()?;
        let (upstream, stderr) = run.stderr.intercept()?.into_parts();
        let handler = Self {
            ctx: Arc::clone(ctx),
            run: Arc::clone(run),
            spec,
            stdout,
            stderr,
        };
        Some((handler, upstream))
    }

    /// Runs the handler fed `input`. If the handler cannot be spawned, the
    /// input is restored to stderr.
    async fn handle(&mut self, input: Vec<u8>) {
        let options = self
            .spec
            .clone()
            .into_options(&self.run)
            .stdin_bytes(input.clone());
        match spawn_captured(&self.ctx, options).await {
            Ok((_, output)) => output.copy_into(&mut self.stdout, &mut self.stderr).await,
            Err(err) => {
                self.run.log().error(err);
                if let Err(err) = self.stderr.write_all(&input).await {
                    trace!(error = %err, "restoring stderr failed");
                }
            }
        }
    }

    async fn finish(mut self) {
        let _ = self.stdout.shutdown().await;
        let _ = self.stderr.shutdown().await;
    }
}

fn parse_handler(name: &'static str) -> impl FnOnce(&Value) -> Result<ChildSpec, PipelineError> {
    move |value| ChildSpec::parse(name, value)
}

/// Runs a handler child once on the complete stderr, if it is non-empty.
#[derive(Debug, Clone, Copy, Default)]
pub struct CatchMiddleware;

#[async_trait]
impl Middleware for CatchMiddleware {
    fn name(&self) -> &'static str {
        "catch"
    }

    async fn apply(&self, run: Arc<Run>, next: Next, ctx: &Arc<ExecutionContext>) {
        let spec = read_argument(&run, self.name(), parse_handler("catch"));
        next.run(Arc::clone(&run)).await;

        let Some((mut handler, upstream)) =
            spec.and_then(|spec| Handler::install(&run, ctx, spec))
        else {
            return;
        };
        tokio::spawn(async move {
            let content = read_all(upstream).await.unwrap_or_default();
            if !content.is_empty() {
                handler.run.log().debug("caught stderr");
                handler.handle(content).await;
            }
            handler.finish().await;
        });
    }
}

/// Runs a handler child for every non-empty stderr line, in order. Each
/// handler is fed the line with its original terminator, if it had one.
#[derive(Debug, Clone, Copy, Default)]
pub struct CatchEachMiddleware;

#[async_trait]
impl Middleware for CatchEachMiddleware {
    fn name(&self) -> &'static str {
        "catch-each"
    }

    async fn apply(&self, run: Arc<Run>, next: Next, ctx: &Arc<ExecutionContext>) {
        let spec = read_argument(&run, self.name(), parse_handler("catch-each"));
        next.run(Arc::clone(&run)).await;

        let Some((mut handler, upstream)) =
            spec.and_then(|spec| Handler::install(&run, ctx, spec))
        else {
            return;
        };
        tokio::spawn(async move {
            let content = read_all(upstream).await.unwrap_or_default();
            let text = String::from_utf8_lossy(&content);
            for line in text.split_inclusive('\n') {
                if !line.trim().is_empty() {
                    handler.handle(line.as_bytes().to_vec()).await;
                }
            }
            handler.finish().await;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{Definitions, RunOptions};
    use crate::run::as_arguments;
    use crate::testing::{execute_pipeline, test_context, ScriptedExecutor};
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn failing_command(extra: Value) -> RunOptions {
        let mut arguments = as_arguments(json!({"shell": {"command": "build"}})).unwrap();
        arguments.extend(as_arguments(extra).unwrap());
        RunOptions::new().arguments(arguments)
    }

    fn context(stderr: &str) -> Arc<ExecutionContext> {
        let executor = ScriptedExecutor::new()
            .with_stdout("partial\n")
            .with_stderr(stderr);
        test_context(Definitions::new(), Arc::new(executor))
    }

    #[tokio::test]
    async fn test_catch_hands_stderr_to_handler() {
        let ctx = context("boom\n");
        // The handler passes its stdin through to its stdout.
        let options = failing_command(json!({"catch": {"disabled": true}}));
        let run = execute_pipeline(&ctx, options).await;

        assert_eq!(run.stdout.to_string(), "partial\nboom\n");
        assert!(run.stderr.is_empty());
        assert!(ctx.errors().is_empty());
        assert_eq!(ctx.runs().len(), 2);
    }

    #[tokio::test]
    async fn test_catch_without_stderr_runs_nothing() {
        let ctx = context("");
        let options = failing_command(json!({"catch": {"disabled": true}}));
        let run = execute_pipeline(&ctx, options).await;

        assert_eq!(run.stdout.to_string(), "partial\n");
        assert_eq!(ctx.runs().len(), 1);
    }

    #[tokio::test]
    async fn test_uncaught_stderr_is_an_error() {
        let ctx = context("boom\n");
        execute_pipeline(&ctx, failing_command(json!({}))).await;
        assert_eq!(ctx.errors().len(), 1);
    }

    #[tokio::test]
    async fn test_catch_each_handles_lines_in_order() {
        let ctx = context("first\n\nsecond\n");
        let options = failing_command(json!({"catch-each": {"disabled": true}}));
        let run = execute_pipeline(&ctx, options).await;

        assert_eq!(run.stdout.to_string(), "partial\nfirst\nsecond\n");
        assert!(run.stderr.is_empty());
        assert_eq!(ctx.runs().len(), 3);
    }

    #[tokio::test]
    async fn test_catch_each_keeps_line_terminators() {
        let ctx = context("first\r\nlast");
        let options = failing_command(json!({"catch-each": {"disabled": true}}));
        let run = execute_pipeline(&ctx, options).await;

        assert_eq!(run.stdout.to_string(), "partial\nfirst\r\nlast");
        assert!(run.stderr.is_empty());
        assert_eq!(ctx.runs().len(), 3);
    }

    #[tokio::test]
    async fn test_malformed_handler_leaves_stderr() {
        let ctx = context("boom\n");
        let run = execute_pipeline(&ctx, failing_command(json!({"catch": 7}))).await;

        assert_eq!(run.stderr.to_string(), "boom\n");
        let messages: Vec<_> = ctx.errors().iter().map(ToString::to_string).collect();
        assert_eq!(messages.len(), 2);
        assert!(messages[0].contains("malformed arguments for \"catch\""));
    }
}
