//! `stdin`: literal stdin content.

use super::{read_argument, Middleware, Next};
use crate::context::ExecutionContext;
use crate::errors::PipelineError;
use crate::run::Run;
use crate::stream::bytes_reader;
use async_trait::async_trait;
use std::sync::Arc;

/// Replaces the run's stdin with the argument's text.
#[derive(Debug, Clone, Copy, Default)]
pub struct StdinMiddleware;

#[async_trait]
impl Middleware for StdinMiddleware {
    fn name(&self) -> &'static str {
        "stdin"
    }

    async fn apply(&self, run: Arc<Run>, next: Next, _ctx: &Arc<ExecutionContext>) {
        let text = read_argument(&run, self.name(), |value| {
            value.as_str().map(str::to_string).ok_or_else(|| {
                PipelineError::malformed("stdin", format!("expected a string, got {value}"))
            })
        });
        if let Some(text) = text {
            run.stdin.replace(bytes_reader(text));
        }
        next.run(run).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::middleware::plumbing::pass_through;
    use crate::testing::run_with_arguments;
    use serde_json::json;
    use std::time::Duration;
    use tokio::time::timeout;

    #[tokio::test]
    async fn test_replaces_stdin() {
        let ctx = ExecutionContext::builder()
            .stack(vec![Arc::new(StdinMiddleware)])
            .build();
        let run = run_with_arguments(json!({"stdin": "replacement"}), "original");

        ctx.unwind_stack(Arc::clone(&run), 0).await;
        pass_through(&run);
        run.close();
        timeout(Duration::from_secs(5), run.wait()).await.unwrap();

        assert_eq!(run.stdin.to_string(), "replacement");
        assert_eq!(run.stdout.to_string(), "replacement");
    }
}
