//! `retry`: re-runs the rest of the chain until it succeeds.

use super::plumbing::{spawn_captured, Outlets};
use super::{read_argument, Middleware, Next};
use crate::context::{ExecutionContext, RunOptions};
use crate::errors::PipelineError;
use crate::log::LogFields;
use crate::run::Run;
use crate::stream::read_all;
use async_trait::async_trait;
use rand::Rng;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

/// Backoff strategy between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackoffStrategy {
    /// Constant delay between attempts.
    Constant(Duration),
    /// Linear increase: delay * retry.
    Linear(Duration),
    /// Exponential: delay * 2^(retry - 1).
    Exponential(Duration),
}

impl BackoffStrategy {
    /// Calculates the delay before the given retry (1-based).
    #[must_use]
    pub fn delay(&self, retry: u32) -> Duration {
        match self {
            Self::Constant(d) => *d,
            Self::Linear(d) => d.saturating_mul(retry),
            Self::Exponential(d) => {
                d.saturating_mul(2u32.saturating_pow(retry.saturating_sub(1)))
            }
        }
    }
}

/// Jitter strategy for adding randomness to delays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JitterStrategy {
    /// No jitter.
    None,
    /// Full jitter: [0, delay].
    Full,
    /// Equal jitter: [delay/2, delay].
    Equal,
    /// Decorrelated jitter: [delay, 3 * delay].
    Decorrelated,
}

impl JitterStrategy {
    /// Applies jitter to a delay.
    #[must_use]
    pub fn apply(&self, delay: Duration) -> Duration {
        let millis = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        if millis == 0 {
            return delay;
        }
        let mut rng = rand::thread_rng();

        match self {
            Self::None => delay,
            Self::Full => Duration::from_millis(rng.gen_range(0..=millis)),
            Self::Equal => {
                let half = millis / 2;
                Duration::from_millis(half + rng.gen_range(0..=millis - half))
            }
            Self::Decorrelated => {
                Duration::from_millis(rng.gen_range(millis..=millis.saturating_mul(3)))
            }
        }
    }
}

/// How often and how patiently to retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total number of attempts, at least one.
    pub attempts: u32,
    /// Delay growth between attempts.
    pub backoff: BackoffStrategy,
    /// Randomisation applied to each delay.
    pub jitter: JitterStrategy,
}

impl RetryPolicy {
    /// `attempts` tries with no delay in between.
    #[must_use]
    pub fn immediate(attempts: u32) -> Self {
        Self {
            attempts,
            backoff: BackoffStrategy::Constant(Duration::ZERO),
            jitter: JitterStrategy::None,
        }
    }

    /// Delay before the given retry (1-based).
    #[must_use]
    pub fn delay(&self, retry: u32) -> Duration {
        self.jitter.apply(self.backoff.delay(retry))
    }

    /// Parses an attempt count, or a map
    /// `{attempts, delay_ms?, backoff?, jitter?}`.
    pub fn parse(value: &Value) -> Result<Self, PipelineError> {
        let malformed = |reason: String| PipelineError::malformed("retry", reason);
        let attempts_of = |value: &Value| {
            value
                .as_u64()
                .and_then(|n| u32::try_from(n).ok())
                .filter(|n| *n >= 1)
                .ok_or_else(|| {
                    malformed(format!("attempts must be a positive integer, got {value}"))
                })
        };

        let map = match value {
            Value::Number(_) => return Ok(Self::immediate(attempts_of(value)?)),
            Value::Object(map) => map,
            other => return Err(malformed(format!("expected a count or a map, got {other}"))),
        };

        let attempts = attempts_of(map.get("attempts").unwrap_or(&Value::Null))?;
        let delay_of = |value: &Value| {
            value
                .as_u64()
                .map(Duration::from_millis)
                .ok_or_else(|| {
                    let reason = format!("delay_ms must be a non-negative integer, got {value}");
                    malformed(reason)
                })
        };
        let delay = match map.get("delay_ms") {
            None => Duration::ZERO,
            Some(value) => delay_of(value)?,
        };
        let named = |key: &str, default: &'static str| {
            map.get(key).and_then(Value::as_str).unwrap_or(default)
        };
        let backoff = match named("backoff", "constant") {
            "constant" => BackoffStrategy::Constant(delay),
            "linear" => BackoffStrategy::Linear(delay),
            "exponential" => BackoffStrategy::Exponential(delay),
            other => return Err(malformed(format!("unknown backoff {other:?}"))),
        };
        let jitter = match named("jitter", "none") {
            "none" => JitterStrategy::None,
            "full" => JitterStrategy::Full,
            "equal" => JitterStrategy::Equal,
            "decorrelated" => JitterStrategy::Decorrelated,
            other => return Err(malformed(format!("unknown jitter {other:?}"))),
        };

        Ok(Self {
            attempts,
            backoff,
            jitter,
        })
    }
}

/// Buffers stdin and runs the rest of the chain in child runs until one
/// exits with code 0, up to the policy's number of attempts.
///
/// Only the last attempt's output reaches the run; its exit code becomes the
/// run's exit code.
#[derive(Debug, Clone, Copy, Default)]
pub struct RetryMiddleware;

struct Attempt {
    stdout: Vec<u8>,
    stderr: Vec<u8>,
    exit_code: Option<i32>,
}

async fn attempt(
    ctx: &Arc<ExecutionContext>,
    parent: &Arc<Run>,
    next: Next,
    input: Vec<u8>,
) -> Result<Attempt, PipelineError> {
    let options = RunOptions::new()
        .arguments(parent.arguments_copy())
        .parent(parent)
        .stdin_bytes(input)
        .execute(move |child| next.run(child));
    let (child, output) = spawn_captured(ctx, options).await?;
    let (stdout, stderr) = output.collect().await;
    child.wait().await;
    Ok(Attempt {
        stdout,
        stderr,
        exit_code: child.exit_code(),
    })
}

async fn run_attempts(
    ctx: Arc<ExecutionContext>,
    parent: Arc<Run>,
    next: Next,
    policy: RetryPolicy,
    input: Vec<u8>,
) -> Option<Attempt> {
    let mut last = None;
    for number in 1..=policy.attempts {
        if number > 1 {
            tokio::time::sleep(policy.delay(number - 1)).await;
        }

        let outcome = match attempt(&ctx, &parent, next.clone(), input.clone()).await {
            Ok(outcome) => outcome,
            Err(err) => {
                parent.log().error(err);
                break;
            }
        };
        let code = outcome.exit_code.unwrap_or(0);
        last = Some(outcome);
        if code == 0 {
            break;
        }
        let fields = LogFields::message(format!("attempt {number} of {} failed", policy.attempts));
        parent
            .log()
            .warn_with_fields(PipelineError::ExitStatus { code }, fields);
    }
    last
}

#[async_trait]
impl Middleware for RetryMiddleware {
    fn name(&self) -> &'static str {
        "retry"
    }

    async fn apply(&self, run: Arc<Run>, next: Next, ctx: &Arc<ExecutionContext>) {
        let Some(policy) = read_argument(&run, self.name(), RetryPolicy::parse) else {
            next.run(run).await;
            return;
        };
        let (Some(stdin), Some(outlets)) = (run.stdin.copy(), Outlets::take(&run)) else {
            next.run(run).await;
            return;
        };

        run.deferred_start().add(1);
        let ctx = Arc::clone(ctx);
        tokio::spawn(async move {
            let input = read_all(stdin).await.unwrap_or_default();
            match run_attempts(ctx, Arc::clone(&run), next, policy, input).await {
                Some(last) => {
                    if let Some(code) = last.exit_code {
                        run.set_exit_code(code);
                    }
                    outlets.finish_with(&last.stdout, &last.stderr).await;
                }
                None => outlets.finish_with(&[], &[]).await,
            }
            run.deferred_start().done();
        });
    }
}
