//! `interpolate`: placeholder substitution in argument strings.
//!
//! - `@{a.b}`: value at path `a.b`; an error is logged if it is missing
//! - `@?{a.b}`: same, but a missing value becomes the empty string
//! - `$!!`: the run's complete stdin
//!
//! Substitution repeats while it changes something, up to the configured
//! number of rounds, so values may themselves contain placeholders. Every
//! round reads the values left by the previous round; a self-referencing
//! value therefore doubles each round until the limit stops it.

use super::plumbing::{spawn_captured, Outlets};
use super::{Middleware, Next, CHILD_SPEC_KEYS};
use crate::context::{ExecutionContext, RunOptions};
use crate::errors::PipelineError;
use crate::run::{split_path, value_at_path, Arguments, Run};
use crate::stream::read_all;
use async_trait::async_trait;
use regex::{Captures, Regex};
use serde_json::Value;
use std::sync::{Arc, LazyLock};

const STDIN_PLACEHOLDER: &str = "$!!";

#[allow(clippy::expect_used)]
static PLACEHOLDER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"@(\?)?\{([^{}]+)\}").expect("placeholder pattern is valid"));

/// Substitutes placeholders in every argument except child specs.
///
/// When `$!!` is used, the rest of the chain runs in a child run once the
/// complete stdin is available.
#[derive(Debug, Clone, Copy, Default)]
pub struct InterpolateMiddleware;

fn render(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// One substitution round over a snapshot of the arguments.
struct Round<'a> {
    snapshot: &'a Arguments,
    missing: Vec<String>,
}

impl Round<'_> {
    fn text(&mut self, text: &str) -> String {
        let snapshot = self.snapshot;
        let missing = &mut self.missing;
        PLACEHOLDER
            .replace_all(text, |caps: &Captures<'_>| {
                let optional = caps.get(1).is_some();
                let key = caps[2].trim();
                match value_at_path(snapshot, &split_path(key)) {
                    Ok(value) => render(value),
                    Err(_) if optional => String::new(),
                    Err(_) => {
                        missing.push(key.to_string());
                        caps[0].to_string()
                    }
                }
            })
            .into_owned()
    }

    fn value(&mut self, value: &Value) -> Value {
        map_strings(value, &mut |text| self.text(text))
    }
}

/// Rebuilds `value` with `f` applied to every string inside it.
fn map_strings(value: &Value, f: &mut impl FnMut(&str) -> String) -> Value {
    match value {
        Value::String(text) => Value::String(f(text)),
        Value::Array(items) => {
            Value::Array(items.iter().map(|item| map_strings(item, f)).collect())
        }
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(key, item)| (key.clone(), map_strings(item, f)))
                .collect(),
        ),
        other => other.clone(),
    }
}

fn contains_stdin_placeholder(value: &Value) -> bool {
    match value {
        Value::String(text) => text.contains(STDIN_PLACEHOLDER),
        Value::Array(items) => items.iter().any(contains_stdin_placeholder),
        Value::Object(map) => map.values().any(contains_stdin_placeholder),
        _ => false,
    }
}

fn interpolated_keys(arguments: &Arguments) -> impl Iterator<Item = (&String, &Value)> {
    arguments
        .iter()
        .filter(|(key, _)| !CHILD_SPEC_KEYS.contains(&key.as_str()))
}

/// Substitutes `@{…}` placeholders until nothing changes or `max_rounds` is
/// reached. Returns the result and the required keys left unresolved.
fn substitute(arguments: Arguments, max_rounds: usize) -> (Arguments, Vec<String>) {
    let mut current = arguments;
    let mut missing = Vec::new();

    for _ in 0..max_rounds.max(1) {
        let mut round = Round {
            snapshot: &current,
            missing: Vec::new(),
        };
        let mut next = current.clone();
        for (key, value) in interpolated_keys(&current) {
            next.insert(key.clone(), round.value(value));
        }
        missing = round.missing;

        if next == current {
            break;
        }
        current = next;
    }

    missing.sort();
    missing.dedup();
    (current, missing)
}

/// Replaces `$!!` with `stdin` everywhere except in child specs.
fn substitute_stdin(arguments: &Arguments, stdin: &str) -> Arguments {
    let mut result = arguments.clone();
    for (key, value) in interpolated_keys(arguments) {
        result.insert(
            key.clone(),
            map_strings(value, &mut |text| text.replace(STDIN_PLACEHOLDER, stdin)),
        );
    }
    result
}

fn needs_stdin(arguments: &Arguments) -> bool {
    interpolated_keys(arguments).any(|(_, value)| contains_stdin_placeholder(value))
}

/// Runs the rest of the chain in a child fed the complete stdin.
fn defer_until_stdin(
    run: Arc<Run>,
    next: Next,
    ctx: &Arc<ExecutionContext>,
) -> Result<(), (Arc<Run>, Next)> {
    let Some(stdin) = run.stdin.copy() else {
        return Err((run, next));
    };
    let Some(outlets) = Outlets::take(&run) else {
        return Err((run, next));
    };

    run.deferred_start().add(1);
    let ctx = Arc::clone(ctx);
    tokio::spawn(async move {
        let input = read_all(stdin).await.unwrap_or_default();
        let text = String::from_utf8_lossy(&input);
        let arguments = substitute_stdin(&run.arguments_copy(), text.trim_end_matches('\n'));

        let options = RunOptions::new()
            .arguments(arguments)
            .parent(&run)
            .stdin_bytes(input.clone())
            .execute(move |child| next.run(child));
        match spawn_captured(&ctx, options).await {
            Ok((child, output)) => {
                output.forward(outlets).await;
                child.wait().await;
                if let Some(code) = child.exit_code() {
                    run.set_exit_code(code);
                }
            }
            Err(err) => run.log().error(err),
        }
        run.deferred_start().done();
    });
    Ok(())
}

#[async_trait]
impl Middleware for InterpolateMiddleware {
    fn name(&self) -> &'static str {
        "interpolate"
    }

    async fn apply(&self, run: Arc<Run>, next: Next, ctx: &Arc<ExecutionContext>) {
        let max_rounds = ctx.settings().interpolation.max_rounds;
        let (arguments, missing) = substitute(run.arguments_copy(), max_rounds);
        for key in missing {
            let err = PipelineError::Interpolation(format!("no value for @{{{key}}}"));
            run.log().error(err);
        }

        let deferred = needs_stdin(&arguments);
        run.set_arguments(arguments);
        if !deferred {
            next.run(run).await;
            return;
        }

        run.log().trace("waiting for complete stdin");
        if let Err((run, next)) = defer_until_stdin(run, next, ctx) {
            next.run(run).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::run::as_arguments;
    use crate::stream::bytes_reader;
    use crate::testing::{execute_pipeline, run_with_arguments};
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn arguments(value: Value) -> Arguments {
        as_arguments(value).unwrap()
    }

    #[test]
    fn test_substitutes_over_rounds() {
        let (result, missing) = substitute(
            arguments(json!({
                "a": "@{b}!",
                "b": "@{c.d}",
                "c": {"d": 42},
                "nested": ["x=@{c.d}", {"flag": "@{flag}"}],
                "flag": true,
            })),
            5,
        );
        assert!(missing.is_empty());
        assert_eq!(result["a"], json!("42!"));
        assert_eq!(result["b"], json!("42"));
        assert_eq!(result["nested"], json!(["x=42", {"flag": "true"}]));
    }

    #[test]
    fn test_optional_and_missing() {
        let input = arguments(json!({"a": "[@?{nope}]", "b": "@{gone}"}));
        let (result, missing) = substitute(input, 5);
        assert_eq!(result["a"], json!("[]"));
        assert_eq!(result["b"], json!("@{gone}"));
        assert_eq!(missing, vec!["gone".to_string()]);
    }

    #[test]
    fn test_child_specs_are_left_alone() {
        let input = arguments(json!({"do": ["@{x}"], "x": 1, "y": "@{x}"}));
        let (result, _) = substitute(input, 5);
        assert_eq!(result["do"], json!(["@{x}"]));
        assert_eq!(result["y"], json!("1"));
    }

    #[test]
    fn test_self_reference_stops_after_max_rounds() {
        let (once, _) = substitute(arguments(json!({"a": "x@{a}"})), 1);
        assert_eq!(once["a"], json!("xx@{a}"));

        let (result, missing) = substitute(arguments(json!({"a": "x@{a}"})), 3);
        assert_eq!(result["a"], json!("xxxxxxxx@{a}"));
        assert!(missing.is_empty());
    }

    #[tokio::test]
    async fn test_missing_value_is_logged() {
        let ctx = ExecutionContext::builder()
            .stack(vec![Arc::new(InterpolateMiddleware)])
            .build();
        let run = run_with_arguments(json!({"msg": "@{who}"}), "");
        ctx.unwind_stack(Arc::clone(&run), 0).await;

        assert_eq!(run.log().error_count(), 1);
        assert_eq!(
            run.log().last_error().unwrap().to_string(),
            "interpolation failed: no value for @{who}"
        );
    }

    struct EchoMessage;

    #[async_trait]
    impl Middleware for EchoMessage {
        fn name(&self) -> &'static str {
            "echo"
        }

        async fn apply(&self, run: Arc<Run>, _next: Next, _ctx: &Arc<ExecutionContext>) {
            let message = render(&run.argument_at_path(&["msg"]).unwrap_or(Value::Null));
            run.stdout.merge_with(bytes_reader(message));
            run.set_exit_code(3);
        }
    }

    #[tokio::test]
    async fn test_complete_stdin_reruns_chain_in_child() {
        let ctx = ExecutionContext::builder()
            .stack(vec![Arc::new(InterpolateMiddleware), Arc::new(EchoMessage)])
            .build();
        let message = json!({"msg": "got <$!!> from @{who}", "who": "me"});
        let options = RunOptions::new()
            .arguments(arguments(message))
            .stdin_bytes("line one\n");
        let run = execute_pipeline(&ctx, options).await;

        assert_eq!(run.stdout.to_string(), "got <line one> from me");
        assert_eq!(run.exit_code(), Some(3));
        assert_eq!(ctx.runs().len(), 2);
        assert!(ctx.errors().is_empty());
    }
}
