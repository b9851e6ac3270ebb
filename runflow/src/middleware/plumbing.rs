//! Stream plumbing shared by the middleware that spawn child runs.
//!
//! ```text
//!   parent stdin ──copy──▶ child stdin
//!   child stdout ──tee───▶ ChildOutput.stdout ──▶ parent stdout (write closer)
//!   child stderr ──move──▶ ChildOutput.stderr ──▶ parent stderr (write closer)
//! ```
//!
//! A child's stderr is moved rather than teed so that it is reported once,
//! by the run where it ends up uncaught.

use crate::context::{ExecutionContext, RunHook, RunOptions};
use crate::errors::PipelineError;
use crate::run::Run;
use crate::stream::{pipe, read_all, PipeReader, PipeWriter};
use std::sync::Arc;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::trace;

/// Passes the run's stdin through to its stdout unchanged.
pub(crate) fn pass_through(run: &Run) {
    if let Some(copy) = run.stdin.copy() {
        run.stdout.merge_with(copy);
    }
}

/// Write closers appending to a run's stdout and stderr.
///
/// The run cannot complete until both are dropped.
pub(crate) struct Outlets {
    pub(crate) stdout: PipeWriter,
    pub(crate) stderr: PipeWriter,
}

impl Outlets {
    /// Takes both closers; `None` if the run's streams are already closed.
    pub(crate) fn take(run: &Run) -> Option<Self> {
        let stdout = run.stdout.write_closer()?;
        let stderr = run.stderr.write_closer()?;
        Some(Self { stdout, stderr })
    }

    /// Releases both closers.
    pub(crate) async fn close(mut self) {
        let _ = self.stdout.shutdown().await;
        let _ = self.stderr.shutdown().await;
    }

    /// Writes buffered output and releases both closers.
    pub(crate) async fn finish_with(mut self, stdout: &[u8], stderr: &[u8]) {
        if let Err(err) = self.stdout.write_all(stdout).await {
            trace!(error = %err, "writing buffered stdout failed");
        }
        if let Err(err) = self.stderr.write_all(stderr).await {
            trace!(error = %err, "writing buffered stderr failed");
        }
        self.close().await;
    }
}

/// A child run's output, readable once the child's streams end.
pub(crate) struct ChildOutput {
    pub(crate) stdout: PipeReader,
    pub(crate) stderr: PipeReader,
}

impl ChildOutput {
    /// Copies stdout and stderr into the given writers, concurrently.
    ///
    /// The writers are left open so several children can share them.
    pub(crate) async fn copy_into<O, E>(mut self, stdout: &mut O, stderr: &mut E)
    where
        O: AsyncWrite + Unpin + Send,
        E: AsyncWrite + Unpin + Send,
    {
        let (out, err) = tokio::join!(
            tokio::io::copy(&mut self.stdout, stdout),
            tokio::io::copy(&mut self.stderr, stderr),
        );
        if let Err(err) = out.and(err) {
            trace!(error = %err, "forwarding child output failed");
        }
    }

    /// Forwards the output into the parent's outlets and releases them.
    pub(crate) async fn forward(self, mut outlets: Outlets) {
        self.copy_into(&mut outlets.stdout, &mut outlets.stderr)
            .await;
        outlets.close().await;
    }

    /// Reads both streams to the end.
    pub(crate) async fn collect(self) -> (Vec<u8>, Vec<u8>) {
        let (out, err) = tokio::join!(read_all(self.stdout), read_all(self.stderr));
        (out.unwrap_or_default(), err.unwrap_or_default())
    }
}

/// Returns a tear-down hook capturing a child's output, and the capture.
pub(crate) fn capture_output() -> (RunHook, ChildOutput) {
    let (out_writer, stdout) = pipe();
    let (mut err_writer, stderr) = pipe();

    let hook: RunHook = Box::new(move |child: &Arc<Run>| {
        child.stdout.start_copying_into(out_writer);
        let Some(interception) = child.stderr.intercept() else {
            err_writer.close();
            return;
        };
        let (mut upstream, downstream) = interception.into_parts();
        drop(downstream);
        tokio::spawn(async move {
            if let Err(err) = tokio::io::copy(&mut upstream, &mut err_writer).await {
                trace!(error = %err, "moving child stderr failed");
            }
            err_writer.close();
        });
    });

    (hook, ChildOutput { stdout, stderr })
}

/// Spawns a child run with its output captured.
///
/// Resolves once the child is set up, like [`ExecutionContext::full_run`].
pub(crate) async fn spawn_captured(
    ctx: &Arc<ExecutionContext>,
    options: RunOptions,
) -> Result<(Arc<Run>, ChildOutput), PipelineError> {
    let (hook, output) = capture_output();
    let child = ctx.full_run(options.tear_down(hook)).await?;
    Ok((child, output))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::RunOptions;
    use crate::testing::run_with_stdin;
    use futures::FutureExt;
    use std::time::Duration;
    use tokio::time::timeout;

    #[tokio::test]
    async fn test_pass_through() {
        let run = run_with_stdin("abc");
        pass_through(&run);
        run.close();
        timeout(Duration::from_secs(5), run.wait()).await.unwrap();
        assert_eq!(run.stdout.to_string(), "abc");
    }

    #[tokio::test]
    async fn test_capture_moves_stderr_and_tees_stdout() {
        let ctx = ExecutionContext::builder().stack(Vec::new()).build();
        let (child, output) = spawn_captured(
            &ctx,
            RunOptions::new().execute(|run| {
                async move {
                    run.stdout.merge_with(crate::stream::bytes_reader("out"));
                    run.stderr.merge_with(crate::stream::bytes_reader("err"));
                }
                .boxed()
            }),
        )
        .await
        .unwrap();

        let (out, err) = timeout(Duration::from_secs(5), output.collect())
            .await
            .unwrap();
        child.wait().await;

        assert_eq!(out, b"out");
        assert_eq!(err, b"err");
        assert_eq!(child.stdout.to_string(), "out");
        assert!(child.stderr.is_empty());
        assert!(ctx.errors().is_empty());
    }

    #[tokio::test]
    async fn test_forward_into_outlets() {
        let parent = run_with_stdin("");
        let outlets = Outlets::take(&parent).unwrap();
        let (mut out, stdout) = pipe();
        let (err, stderr) = pipe();
        out.write_all(b"forwarded").await.unwrap();
        drop(out);
        drop(err);

        ChildOutput { stdout, stderr }.forward(outlets).await;
        parent.close();
        timeout(Duration::from_secs(5), parent.wait())
            .await
            .unwrap();
        assert_eq!(parent.stdout.to_string(), "forwarded");
    }
}
