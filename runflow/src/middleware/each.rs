//! `each`: one child run per stdin line.

use super::plumbing::{spawn_captured, Outlets};
use super::{read_argument, ChildSpec, Middleware, Next};
use crate::context::ExecutionContext;
use crate::run::Run;
use crate::stream::read_all;
use async_trait::async_trait;
use futures::future::join_all;
use serde_json::Value;
use std::sync::Arc;

/// Spawns the child spec once per non-empty stdin line, all in parallel.
///
/// Each child gets the line as its `item` argument and as its stdin. Their
/// outputs are appended in line order, then the chain continues.
#[derive(Debug, Clone, Copy, Default)]
pub struct EachMiddleware;

#[async_trait]
impl Middleware for EachMiddleware {
    fn name(&self) -> &'static str {
        "each"
    }

    async fn apply(&self, run: Arc<Run>, next: Next, ctx: &Arc<ExecutionContext>) {
        let Some(spec) = read_argument(&run, self.name(), |value| ChildSpec::parse("each", value))
        else {
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
            let content = read_all(stdin).await.unwrap_or_default();
            let text = String::from_utf8_lossy(&content);
            let lines: Vec<&str> = text
                .lines()
                .filter(|line| !line.trim().is_empty())
                .collect();
            parent.log().debug(format!("running {} items", lines.len()));

            let spawns = lines.iter().map(|line| {
                let mut spec = spec.clone();
                spec.arguments
                    .insert("item".to_string(), Value::String((*line).to_string()));
                let options = spec.into_options(&parent).stdin_bytes(format!("{line}\n"));
                spawn_captured(&ctx, options)
            });
            for spawned in join_all(spawns).await {
                match spawned {
                    Ok((_, output)) => {
                        output
                            .copy_into(&mut outlets.stdout, &mut outlets.stderr)
                            .await;
                    }
                    Err(err) => parent.log().error(err),
                }
            }
            outlets.close().await;
        });

        next.run(run).await;
    }
}
