//! `shell`: runs a process with the run's stdio.

use super::{read_argument, Middleware, Next};
use crate::config::ShellConfig;
use crate::context::ExecutionContext;
use crate::errors::PipelineError;
use crate::log::LogFields;
use crate::run::Run;
use crate::shell::ShellCommand;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use tracing::debug;

/// Exit code recorded when the process cannot be spawned.
const SPAWN_FAILURE_EXIT_CODE: i32 = 127;

fn malformed(reason: impl Into<String>) -> PipelineError {
    PipelineError::malformed("shell", reason)
}

fn scalar_string(value: &Value) -> Option<String> {
    match value {
        Value::String(text) => Some(text.clone()),
        Value::Number(number) => Some(number.to_string()),
        Value::Bool(flag) => Some(flag.to_string()),
        _ => None,
    }
}

/// Parses `{command, env?, dir?}`; a bare string is shorthand for `{command}`.
///
/// A string command runs through the configured shell; a list is executed
/// directly, its first element being the program.
pub(crate) fn parse_command(
    value: &Value,
    shell: &ShellConfig,
) -> Result<ShellCommand, PipelineError> {
    let (command, options) = match value {
        Value::Object(map) => (map.get("command").unwrap_or(&Value::Null), Some(map)),
        other => (other, None),
    };

    let mut parsed = match command {
        Value::String(script) => {
            ShellCommand::new(&shell.program).with_args([shell.flag.as_str(), script.as_str()])
        }
        Value::Array(items) => {
            let mut words = items
                .iter()
                .map(scalar_string)
                .collect::<Option<Vec<_>>>()
                .ok_or_else(|| malformed("command list must contain only strings"))?
                .into_iter();
            let program = words
                .next()
                .ok_or_else(|| malformed("command list is empty"))?;
            ShellCommand::new(program).with_args(words)
        }
        Value::Null => return Err(malformed("missing \"command\"")),
        other => {
            return Err(malformed(format!(
                "expected a command string or list, got {other}"
            )))
        }
    };

    let Some(options) = options else {
        return Ok(parsed);
    };
    match options.get("env") {
        None | Some(Value::Null) => {}
        Some(Value::Object(env)) => {
            for (key, value) in env {
                let value = scalar_string(value)
                    .ok_or_else(|| malformed(format!("env value for {key:?} must be a scalar")))?;
                parsed = parsed.with_env(key, value);
            }
        }
        Some(_) => return Err(malformed("\"env\" must be a map")),
    }
    match options.get("dir") {
        None | Some(Value::Null) => {}
        Some(Value::String(dir)) => parsed = parsed.with_dir(dir),
        Some(_) => return Err(malformed("\"dir\" must be a string")),
    }
    Ok(parsed)
}

/// Terminal middleware: spawns the process and wires it into the run.
///
/// - process stdin is fed a tee of the run's stdin
/// - process stdout/stderr are appended to the run's stdout/stderr
/// - cancelling the run kills the process
/// - the exit code is recorded before the run completes; non-zero is a warning
#[derive(Debug, Clone, Copy, Default)]
pub struct ShellMiddleware;

#[async_trait]
impl Middleware for ShellMiddleware {
    fn name(&self) -> &'static str {
        "shell"
    }

    async fn apply(&self, run: Arc<Run>, next: Next, ctx: &Arc<ExecutionContext>) {
        let shell = &ctx.settings().shell;
        let Some(command) = read_argument(&run, self.name(), |value| parse_command(value, shell))
        else {
            next.run(run).await;
            return;
        };

        if run.is_cancelled() {
            run.log().warn(PipelineError::Cancelled);
            next.run(run).await;
            return;
        }

        let fields = LogFields::message("running")
            .with_symbol("$")
            .with_info(command.to_string());
        run.log().debug_with_fields(fields);
        let mut process = ctx.executor().init(command);
        if let Err(err) = process.start() {
            run.log().error(err);
            run.set_exit_code(SPAWN_FAILURE_EXIT_CODE);
            next.run(run).await;
            return;
        }

        if let Some(stdin) = process.take_stdin() {
            run.stdin.start_copying_into(stdin);
        }
        if let Some(stdout) = process.take_stdout() {
            run.stdout.merge_with(stdout);
        }
        if let Some(stderr) = process.take_stderr() {
            run.stderr.merge_with(stderr);
        }

        let kill = process.kill_switch();
        run.add_cancel_hook(move || {
            kill.kill();
            Ok(())
        });

        run.deferred_start().add(1);
        let waiting = Arc::clone(&run);
        tokio::spawn(async move {
            match process.wait().await {
                Ok(code) => {
                    debug!(run_id = %waiting.id(), code, "shell finished");
                    waiting.set_exit_code(code);
                    if code != 0 {
                        waiting.log().warn(PipelineError::ExitStatus { code });
                    }
                }
                Err(err) => waiting.log().error(err),
            }
            waiting.deferred_start().done();
        });

        next.run(run).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::RunOptions;
    use crate::run::as_arguments;
    use crate::testing::{execute_pipeline, ScriptedExecutor};
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::time::Duration;
    use tokio::time::timeout;

    fn context(executor: ScriptedExecutor) -> Arc<ExecutionContext> {
        ExecutionContext::builder()
            .stack(vec![Arc::new(ShellMiddleware)])
            .executor(Arc::new(executor))
            .build()
    }

    fn shell(value: Value) -> RunOptions {
        RunOptions::new().arguments(as_arguments(json!({ "shell": value })).unwrap())
    }

    #[test]
    fn test_parse_command_forms() {
        let config = ShellConfig::default();
        let script = parse_command(&json!({"command": "echo hi"}), &config).unwrap();
        assert_eq!(script.program, "sh");
        assert_eq!(script.args, vec!["-c", "echo hi"]);

        let direct = parse_command(
            &json!({"command": ["ls", "-l"], "env": {"N": 3, "V": true}, "dir": "/tmp"}),
            &config,
        )
        .unwrap();
        assert_eq!(direct.program, "ls");
        assert_eq!(direct.args, vec!["-l"]);
        assert_eq!(direct.env.get("N").map(String::as_str), Some("3"));
        assert_eq!(direct.env.get("V").map(String::as_str), Some("true"));
        assert_eq!(direct.dir.as_deref(), Some(std::path::Path::new("/tmp")));

        let bare = parse_command(&json!("make"), &config).unwrap();
        assert_eq!(bare.args, vec!["-c", "make"]);
    }

    #[test]
    fn test_parse_command_errors() {
        let config = ShellConfig::default();
        for value in [
            json!({}),
            json!({"command": []}),
            json!({"command": [{"a": 1}]}),
            json!({"command": "x", "env": ["A"]}),
            json!({"command": "x", "dir": 1}),
        ] {
            assert!(parse_command(&value, &config).is_err(), "{value}");
        }
    }

    #[tokio::test]
    async fn test_process_receives_stdin_and_fills_stdout() {
        let executor = ScriptedExecutor::new();
        let ctx = context(executor.clone());
        let options = shell(json!({"command": "cat"})).stdin_bytes("hello");
        let run = execute_pipeline(&ctx, options).await;

        assert_eq!(run.stdout.to_string(), "hello");
        assert_eq!(run.exit_code(), Some(0));
        assert_eq!(executor.commands()[0].to_string(), "sh -c cat");
        assert!(ctx.errors().is_empty());
    }

    #[tokio::test]
    async fn test_non_zero_exit_is_a_warning() {
        let ctx = context(ScriptedExecutor::new().with_stdout("").with_exit_codes([2]));
        let run = execute_pipeline(&ctx, shell(json!("false"))).await;

        assert_eq!(run.exit_code(), Some(2));
        assert_eq!(run.log().warn_count(), 1);
        assert!(ctx.errors().is_empty());
    }

    #[tokio::test]
    async fn test_stderr_is_reported() {
        let executor = ScriptedExecutor::new()
            .with_stdout("")
            .with_stderr("oops\n");
        let ctx = context(executor);
        execute_pipeline(&ctx, shell(json!("broken"))).await;

        let errors = ctx.errors();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].to_string(), "anonymous: stderr output: oops");
    }

    #[tokio::test]
    async fn test_cancel_kills_process() {
        let ctx = context(ScriptedExecutor::new().with_stdout("").hanging());
        let run = ctx.full_run(shell(json!("sleep 100"))).await.unwrap();
        assert!(!run.is_completed());

        run.cancel().unwrap();
        timeout(Duration::from_secs(5), run.wait()).await.unwrap();
        assert_eq!(run.exit_code(), Some(137));
    }

    #[tokio::test]
    async fn test_cancelled_run_skips_process() {
        let executor = ScriptedExecutor::new();
        let ctx = context(executor.clone());
        let run = execute_pipeline(
            &ctx,
            shell(json!("echo never")).setup(|run| {
                run.cancel().unwrap();
            }),
        )
        .await;

        assert!(executor.commands().is_empty());
        assert_eq!(run.exit_code(), None);
        assert!(run.log().last_error().is_none());
        assert_eq!(run.log().warn_count(), 1);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_real_process() {
        let ctx = ExecutionContext::builder()
            .stack(vec![Arc::new(ShellMiddleware)])
            .build();
        let options = shell(json!({"command": "tr a-z A-Z"})).stdin_bytes("abc");
        let run = execute_pipeline(&ctx, options).await;
        assert_eq!(run.stdout.to_string(), "ABC");
        assert_eq!(run.exit_code(), Some(0));
    }
}
