//! `disabled`: switches a pipeline off.

use super::plumbing::pass_through;
use super::{read_argument, Middleware, Next};
use crate::context::ExecutionContext;
use crate::errors::PipelineError;
use crate::run::Run;
use async_trait::async_trait;
use std::sync::Arc;

/// Passes stdin through and skips the rest of the chain when `disabled: true`.
#[derive(Debug, Clone, Copy, Default)]
pub struct DisabledMiddleware;

#[async_trait]
impl Middleware for DisabledMiddleware {
    fn name(&self) -> &'static str {
        "disabled"
    }

    async fn apply(&self, run: Arc<Run>, next: Next, _ctx: &Arc<ExecutionContext>) {
        let disabled = read_argument(&run, self.name(), |value| {
            value.as_bool().ok_or_else(|| {
                PipelineError::malformed("disabled", format!("expected a bool, got {value}"))
            })
        });

        if disabled == Some(true) {
            run.log().debug("disabled");
            pass_through(&run);
            return;
        }
        next.run(run).await;
    }
}
