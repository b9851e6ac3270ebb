//! `select`: lets the user pick a child pipeline.

use super::plumbing::{spawn_captured, Outlets};
use super::{read_argument, ChildSpec, Middleware, Next};
use crate::context::ExecutionContext;
use crate::errors::PipelineError;
use crate::prompt::SelectionRequest;
use crate::run::Run;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq)]
struct SelectArguments {
    label: String,
    options: Vec<ChildSpec>,
    initial: usize,
    size: usize,
}

fn malformed(reason: impl Into<String>) -> PipelineError {
    PipelineError::malformed("select", reason)
}

fn parse_count(
    map: &serde_json::Map<String, Value>,
    key: &str,
    default: usize,
) -> Result<usize, PipelineError> {
    match map.get(key) {
        None | Some(Value::Null) => Ok(default),
        Some(value) => value
            .as_u64()
            .and_then(|n| usize::try_from(n).ok())
            .ok_or_else(|| malformed(format!("{key:?} must be a non-negative integer"))),
    }
}

fn parse_select(value: &Value) -> Result<SelectArguments, PipelineError> {
    let map = value
        .as_object()
        .ok_or_else(|| malformed(format!("expected a map, got {value}")))?;
    let label = match map.get("label") {
        Some(Value::String(label)) => label.clone(),
        _ => return Err(malformed("\"label\" must be a string")),
    };
    let options = ChildSpec::parse_list("select", map.get("options").unwrap_or(&Value::Null))?;
    if options.is_empty() {
        return Err(malformed("\"options\" must not be empty"));
    }
    let initial = parse_count(map, "initial", 0)?;
    let size = parse_count(map, "size", options.len())?;

    Ok(SelectArguments {
        label,
        options,
        initial,
        size,
    })
}

/// Prompts for one of the listed child specs, runs it fed the run's stdin and
/// appends its output; then continues the chain.
///
/// A prompt failure aborts only the child branch.
#[derive(Debug, Clone, Copy, Default)]
pub struct SelectMiddleware;

#[async_trait]
impl Middleware for SelectMiddleware {
    fn name(&self) -> &'static str {
        "select"
    }

    async fn apply(&self, run: Arc<Run>, next: Next, ctx: &Arc<ExecutionContext>) {
        let Some(arguments) = read_argument(&run, self.name(), parse_select) else {
            next.run(run).await;
            return;
        };
        let (Some(stdin), Some(outlets)) = (run.stdin.copy(), Outlets::take(&run)) else {
            next.run(run).await;
            return;
        };

        let request = SelectionRequest {
            label: arguments.label,
            items: arguments.options.iter().map(ChildSpec::label).collect(),
            initial: arguments.initial,
            size: arguments.size,
        };
        let mut options = arguments.options;
        let prompt = ctx.prompt();
        let ctx = Arc::clone(ctx);
        let parent = Arc::clone(&run);

        tokio::spawn(async move {
            let answer = tokio::task::spawn_blocking(move || prompt.select(&request)).await;
            let selection = match answer {
                Ok(Ok(selection)) => selection,
                Ok(Err(err)) => return parent.log().error(err),
                Err(err) => return parent.log().error(PipelineError::Prompt(err.to_string())),
            };
            if selection.index >= options.len() {
                return parent.log().error(PipelineError::Prompt(format!(
                    "selection {} out of range",
                    selection.index
                )));
            }

            parent.log().debug(format!("selected {}", selection.item));
            let spec = options.swap_remove(selection.index);
            match spawn_captured(&ctx, spec.into_options(&parent).stdin(stdin)).await {
                Ok((_, output)) => output.forward(outlets).await,
                Err(err) => parent.log().error(err),
            }
        });

        next.run(run).await;
    }
}
