//! `wait-for`: defers a run until its dependencies are ready.

use super::{read_argument, Middleware, Next};
use crate::context::ExecutionContext;
use crate::errors::PipelineError;
use crate::run::Run;
use async_trait::async_trait;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Something a run can wait for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Dependency {
    /// An environment variable becoming set (`$NAME`).
    Env(String),
    /// Every run of a pipeline existing and completing.
    Pipeline(String),
}

impl Dependency {
    fn parse(text: &str) -> Self {
        match text.strip_prefix('$') {
            Some(name) => Self::Env(name.to_string()),
            None => Self::Pipeline(text.to_string()),
        }
    }

    async fn ready(&self, run: &Run, ctx: &ExecutionContext, poll: Duration) {
        match self {
            Self::Env(name) => {
                while std::env::var_os(name).is_none() {
                    tokio::time::sleep(poll).await;
                }
            }
            Self::Pipeline(identifier) => loop {
                let others: Vec<_> = ctx
                    .runs_with_identifier(identifier)
                    .into_iter()
                    .filter(|other| other.id() != run.id())
                    .collect();
                if others.is_empty() {
                    tokio::time::sleep(poll).await;
                    continue;
                }
                for other in others {
                    other.wait().await;
                }
                return;
            },
        }
    }
}

impl fmt::Display for Dependency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Env(name) => write!(f, "${name}"),
            Self::Pipeline(identifier) => f.write_str(identifier),
        }
    }
}

fn parse_dependencies(value: &Value) -> Result<Vec<Dependency>, PipelineError> {
    let malformed = || {
        PipelineError::malformed(
            "wait-for",
            format!("expected a name or a list of names, got {value}"),
        )
    };
    match value {
        Value::String(text) => Ok(vec![Dependency::parse(text)]),
        Value::Array(items) => items
            .iter()
            .map(|item| item.as_str().map(Dependency::parse).ok_or_else(malformed))
            .collect(),
        _ => Err(malformed()),
    }
}

/// Waits until every listed pipeline has run to completion and every
/// `$VARIABLE` is set, then continues the chain.
///
/// The wait happens inline, so the run is neither wired nor closed before
/// its dependencies are ready. Gives up after the configured timeout, logs
/// it and continues.
#[derive(Debug, Clone, Copy, Default)]
pub struct WaitForMiddleware;

#[async_trait]
impl Middleware for WaitForMiddleware {
    fn name(&self) -> &'static str {
        "wait-for"
    }

    async fn apply(&self, run: Arc<Run>, next: Next, ctx: &Arc<ExecutionContext>) {
        let Some(dependencies) = read_argument(&run, self.name(), parse_dependencies) else {
            next.run(run).await;
            return;
        };

        let settings = &ctx.settings().wait_for;
        let (poll, limit) = (settings.poll_interval(), settings.timeout());

        // Waiting inline keeps the run unwired and open, which defers its start.
        run.set_synchronous(true);
        for dependency in &dependencies {
            run.log().debug(format!("waiting for {dependency}"));
            let ready = dependency.ready(&run, ctx, poll);
            if tokio::time::timeout(limit, ready).await.is_err() {
                run.log()
                    .error(PipelineError::Timeout(dependency.to_string()));
            } else {
                debug!(run_id = %run.id(), %dependency, "dependency ready");
            }
        }

        next.run(run).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;
    use crate::context::{Definition, Definitions, RunOptions};
    use crate::run::as_arguments;
    use crate::testing::{execute_pipeline, RecordingMiddleware};
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_parse_dependencies() {
        assert_eq!(
            parse_dependencies(&json!(["build", "$TOKEN"])).unwrap(),
            vec![
                Dependency::Pipeline("build".into()),
                Dependency::Env("TOKEN".into()),
            ]
        );
        assert_eq!(parse_dependencies(&json!("lint")).unwrap().len(), 1);
        assert!(parse_dependencies(&json!({"a": 1})).is_err());
        assert_eq!(Dependency::Env("X".into()).to_string(), "$X");
    }

    fn context(settings: Settings) -> (Arc<ExecutionContext>, Arc<RecordingMiddleware>) {
        let recorder = Arc::new(RecordingMiddleware::new("after"));
        let definitions =
            Definitions::new().with("build", Definition::new(Default::default(), "root.yml"));
        let ctx = ExecutionContext::builder()
            .stack(vec![
                Arc::new(WaitForMiddleware),
                Arc::clone(&recorder) as Arc<dyn Middleware>,
            ])
            .definitions(definitions)
            .settings(settings)
            .build();
        (ctx, recorder)
    }

    fn waiting_on(value: Value) -> RunOptions {
        RunOptions::new().arguments(as_arguments(json!({ "wait-for": value })).unwrap())
    }

    #[tokio::test]
    async fn test_waits_for_pipeline_started_later() {
        let (ctx, recorder) = context(Settings::default());
        let late = {
            let ctx = Arc::clone(&ctx);
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(100)).await;
                ctx.execute(RunOptions::new().identifier("build"))
                    .await
                    .unwrap()
            })
        };

        let waiter = execute_pipeline(&ctx, waiting_on(json!("build"))).await;
        let build = late.await.unwrap();

        assert!(build.is_completed());
        assert!(waiter.is_synchronous());
        assert!(!build.is_synchronous());
        assert_eq!(recorder.seen(), vec![build.id(), waiter.id()]);
        assert!(ctx.errors().is_empty());
    }

    #[tokio::test]
    async fn test_env_variable_already_set() {
        std::env::set_var("RUNFLOW_WAIT_FOR_TEST_READY", "1");
        let (ctx, recorder) = context(Settings::default());
        let run = execute_pipeline(&ctx, waiting_on(json!(["$RUNFLOW_WAIT_FOR_TEST_READY"]))).await;
        assert_eq!(recorder.seen(), vec![run.id()]);
        assert!(ctx.errors().is_empty());
    }

    #[tokio::test]
    async fn test_timeout_is_logged_and_chain_continues() {
        let settings = Settings::default().with_wait_timeout(Duration::from_millis(120));
        let (ctx, recorder) = context(settings);
        let run = execute_pipeline(&ctx, waiting_on(json!("$RUNFLOW_WAIT_FOR_TEST_NEVER"))).await;

        assert_eq!(recorder.seen(), vec![run.id()]);
        let errors = ctx.errors();
        assert_eq!(errors.len(), 1);
        assert_eq!(
            errors[0].to_string(),
            "anonymous: timed out waiting for $RUNFLOW_WAIT_FOR_TEST_NEVER"
        );
    }

    #[tokio::test]
    async fn test_run_stays_open_while_waiting() {
        let (ctx, recorder) = context(Settings::default());
        let pending = {
            let ctx = Arc::clone(&ctx);
            let options = waiting_on(json!("$RUNFLOW_WAIT_FOR_TEST_LATE"));
            tokio::spawn(async move { ctx.full_run(options).await })
        };

        tokio::time::sleep(Duration::from_millis(100)).await;
        let runs = ctx.runs();
        assert_eq!(runs.len(), 1);
        assert!(!runs[0].is_closed());
        assert!(recorder.seen().is_empty());

        std::env::set_var("RUNFLOW_WAIT_FOR_TEST_LATE", "1");
        let run = pending.await.unwrap().unwrap();
        assert!(run.is_closed());
        run.wait().await;

        assert_eq!(recorder.seen(), vec![run.id()]);
        assert!(ctx.errors().is_empty());
    }
}
