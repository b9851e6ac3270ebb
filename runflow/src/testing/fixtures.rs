//! Run and context fixtures.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use super::StaticPrompt;
use crate::context::{Definitions, ExecutionContext, RunOptions};
use crate::observability::init_test_tracing;
use crate::run::{as_arguments, Run};
use crate::shell::ShellExecutor;
use crate::stream::bytes_reader;

/// A started root run with `stdin` as its stdin content.
pub fn run_with_stdin(stdin: &str) -> Arc<Run> {
    run_with_arguments(Value::Object(serde_json::Map::new()), stdin)
}

/// A started root run with the given arguments and stdin content.
pub fn run_with_arguments(arguments: Value, stdin: &str) -> Arc<Run> {
    init_test_tracing();
    let arguments = as_arguments(arguments).expect("arguments must be a map");
    let run = Run::new(None, arguments, None, None).expect("run construction failed");
    run.stdin.merge_with(bytes_reader(stdin.to_string()));
    run.mark_started();
    run
}

/// A context with the default stack, the given definitions and executor,
/// and a prompt answering the first item.
pub fn test_context(
    definitions: Definitions,
    executor: Arc<dyn ShellExecutor>,
) -> Arc<ExecutionContext> {
    init_test_tracing();
    ExecutionContext::builder()
        .definitions(definitions)
        .executor(executor)
        .prompt(Arc::new(StaticPrompt::new(0)))
        .build()
}

/// Executes `options` to completion, failing the test after ten seconds.
pub async fn execute_pipeline(ctx: &Arc<ExecutionContext>, options: RunOptions) -> Arc<Run> {
    init_test_tracing();
    tokio::time::timeout(Duration::from_secs(10), ctx.execute(options))
        .await
        .expect("pipeline did not complete in time")
        .expect("pipeline failed to start")
}
