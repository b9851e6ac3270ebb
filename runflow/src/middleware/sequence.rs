//! `do` and `pipe`: sequences of child runs.
//!
//! ```text
//!   do:    stdin ─┬─▶ c1 ─▶ out      (c1 completes before c2 starts)
//!                 └─▶ c2 ─▶ out
//!   pipe:  stdin ──▶ c1 ──▶ c2 ──▶ … ──▶ cN ──▶ out
//! ```

use super::plumbing::{spawn_captured, Outlets};
use super::{read_argument, ChildSpec, Middleware, Next};
use crate::context::ExecutionContext;
use crate::errors::PipelineError;
use crate::run::Run;
use crate::stream::{read_all, BoxedReader, PipeReader};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use tracing::trace;

fn parse_children(
    name: &'static str,
) -> impl FnOnce(&Value) -> Result<Vec<ChildSpec>, PipelineError> {
    move |value| ChildSpec::parse_list(name, value)
}

/// Runs the listed children one after another, each fed the complete stdin,
/// and appends their outputs in order; then continues the chain.
#[derive(Debug, Clone, Copy, Default)]
pub struct DoMiddleware;

#[async_trait]
impl Middleware for DoMiddleware {
    fn name(&self) -> &'static str {
        "do"
    }

    async fn apply(&self, run: Arc<Run>, next: Next, ctx: &Arc<ExecutionContext>) {
        let Some(specs) = read_argument(&run, self.name(), parse_children("do")) else {
            next.run(run).await;
            return;
        };
        let (Some(stdin), Some(mut outlets)) = (run.stdin.copy(), Outlets::take(&run)) else {
            next.run(run).await;
            return;
        };

        let ctx = Arc::clone(ctx);
        let parent = Arc::clone(&run);
        tokio::spawn(async move {
            let input = read_all(stdin).await.unwrap_or_default();
            for spec in specs {
                let options = spec.into_options(&parent).stdin_bytes(input.clone());
                match spawn_captured(&ctx, options).await {
                    Ok((child, output)) => {
                        output
                            .copy_into(&mut outlets.stdout, &mut outlets.stderr)
                            .await;
                        child.wait().await;
                    }
                    Err(err) => parent.log().error(err),
                }
            }
            outlets.close().await;
        });

        next.run(run).await;
    }
}

/// Chains the listed children stdout-to-stdin, starting from the run's
/// stdin, and appends the last child's stdout; every child's stderr is
/// appended to the run's stderr. Then continues the chain.
#[derive(Debug, Clone, Copy, Default)]
pub struct PipeMiddleware;

#[async_trait]
impl Middleware for PipeMiddleware {
    fn name(&self) -> &'static str {
        "pipe"
    }

    async fn apply(&self, run: Arc<Run>, next: Next, ctx: &Arc<ExecutionContext>) {
        let Some(specs) = read_argument(&run, self.name(), parse_children("pipe")) else {
            next.run(run).await;
            return;
        };
        let (Some(stdin), Some(mut outlets)) = (run.stdin.copy(), Outlets::take(&run)) else {
            next.run(run).await;
            return;
        };

        let mut input: Option<BoxedReader> = Some(Box::new(stdin));
        let mut stderrs: Vec<PipeReader> = Vec::with_capacity(specs.len());
        for spec in specs {
            let Some(reader) = input.take() else {
                break;
            };
            match spawn_captured(ctx, spec.into_options(&run).stdin(reader)).await {
                Ok((_, output)) => {
                    input = Some(Box::new(output.stdout));
                    stderrs.push(output.stderr);
                }
                Err(err) => run.log().error(err),
            }
        }

        tokio::spawn(async move {
            let stdout = async {
                if let Some(mut last) = input {
                    if let Err(err) = tokio::io::copy(&mut last, &mut outlets.stdout).await {
                        trace!(error = %err, "forwarding pipe output failed");
                    }
                }
            };
            let stderr = async {
                for mut reader in stderrs {
                    if let Err(err) = tokio::io::copy(&mut reader, &mut outlets.stderr).await {
                        trace!(error = %err, "forwarding pipe stderr failed");
                    }
                }
            };
            tokio::join!(stdout, stderr);
            outlets.close().await;
        });

        next.run(run).await;
    }
}
