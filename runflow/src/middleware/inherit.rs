//! `inherit`: pulls named arguments down from ancestor runs.

use super::{read_argument, Middleware, Next};
use crate::context::ExecutionContext;
use crate::errors::PipelineError;
use crate::run::{split_path, Run};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

/// Copies each listed argument from the nearest ancestor that has it, unless
/// the run already has its own value (an explicit null counts as a value).
#[derive(Debug, Clone, Copy, Default)]
pub struct InheritMiddleware;

fn parse_names(value: &Value) -> Result<Vec<String>, PipelineError> {
    let malformed = || {
        PipelineError::malformed("inherit", format!("expected a list of names, got {value}"))
    };
    let items = value.as_array().ok_or_else(malformed)?;
    items
        .iter()
        .map(|item| item.as_str().map(str::to_string).ok_or_else(malformed))
        .collect()
}

fn inherit(run: &Run, name: &str) -> Result<(), PipelineError> {
    let path = split_path(name);
    if run.argument_at_path(&path).is_ok() {
        return Ok(());
    }
    let Some(parent) = run.parent() else {
        return Ok(());
    };
    match parent.argument_at_path_including_parents(&path) {
        Ok(value) => run.set_argument_at_path(&path, value),
        Err(_) => {
            run.log().trace(format!("nothing to inherit for {name}"));
            Ok(())
        }
    }
}

#[async_trait]
impl Middleware for InheritMiddleware {
    fn name(&self) -> &'static str {
        "inherit"
    }

    async fn apply(&self, run: Arc<Run>, next: Next, _ctx: &Arc<ExecutionContext>) {
        if let Some(names) = read_argument(&run, self.name(), parse_names) {
            for name in &names {
                if let Err(err) = inherit(&run, name) {
                    run.log().error(err);
                }
            }
        }
        next.run(run).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::run::as_arguments;
    use serde_json::json;

    fn root(arguments: Value) -> Arc<Run> {
        Run::new(None, as_arguments(arguments).unwrap(), None, None).unwrap()
    }

    fn child_of(parent: &Arc<Run>, arguments: Value) -> Arc<Run> {
        Run::new(None, as_arguments(arguments).unwrap(), None, Some(parent)).unwrap()
    }

    fn context() -> Arc<ExecutionContext> {
        ExecutionContext::builder()
            .stack(vec![Arc::new(InheritMiddleware)])
            .build()
    }

    #[tokio::test]
    async fn test_inherits_missing_value() {
        let parent = root(json!({"foo": "bar"}));
        let child = child_of(&parent, json!({"inherit": ["foo"]}));

        context().unwind_stack(Arc::clone(&child), 0).await;
        assert_eq!(child.argument_at_path(&["foo"]).unwrap(), json!("bar"));
    }

    #[tokio::test]
    async fn test_own_value_wins_and_ancestors_are_walked() {
        let top = root(json!({"a": {"b": 1}, "c": 2}));
        let middle = child_of(&top, json!({}));
        let leaf = child_of(
            &middle,
            json!({"inherit": ["a.b", "c", "missing"], "c": null}),
        );

        context().unwind_stack(Arc::clone(&leaf), 0).await;
        assert_eq!(leaf.argument_at_path(&["a", "b"]).unwrap(), json!(1));
        assert_eq!(leaf.argument_at_path(&["c"]).unwrap(), Value::Null);
        assert!(leaf.argument_at_path(&["missing"]).is_err());
        assert_eq!(leaf.log().error_count(), 0);
    }

    #[tokio::test]
    async fn test_root_has_nothing_to_inherit() {
        let top = root(json!({"inherit": ["x"]}));
        context().unwind_stack(Arc::clone(&top), 0).await;
        assert!(top.argument_at_path(&["x"]).is_err());
    }

    #[test]
    fn test_parse_names() {
        assert_eq!(parse_names(&json!(["a", "b"])).unwrap(), vec!["a", "b"]);
        assert!(parse_names(&json!("a")).is_err());
        assert!(parse_names(&json!([1])).is_err());
    }
}
