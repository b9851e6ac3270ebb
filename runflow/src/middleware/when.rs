//! `when`: conditional execution.

use super::plumbing::pass_through;
use super::{read_argument, Middleware, Next};
use crate::context::ExecutionContext;
use crate::errors::PipelineError;
use crate::expression::evaluate_condition;
use crate::run::Run;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

/// Continues the chain only when the condition holds.
///
/// The argument is a bool or an expression string evaluated without any
/// bound variables. A false condition passes stdin through to stdout.
#[derive(Debug, Clone, Copy, Default)]
pub struct WhenMiddleware;

fn parse_condition(value: &Value) -> Result<bool, PipelineError> {
    match value {
        Value::Bool(condition) => Ok(*condition),
        Value::String(expression) => evaluate_condition(expression),
        other => Err(PipelineError::malformed(
            "when",
            format!("expected a bool or an expression, got {other}"),
        )),
    }
}

#[async_trait]
impl Middleware for WhenMiddleware {
    fn name(&self) -> &'static str {
        "when"
    }

    async fn apply(&self, run: Arc<Run>, next: Next, _ctx: &Arc<ExecutionContext>) {
        if read_argument(&run, self.name(), parse_condition) == Some(false) {
            run.log().debug("condition is false, skipping");
            pass_through(&run);
            return;
        }
        next.run(run).await;
    }
}
