//! Mock middleware, prompts and shell executors.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use uuid::Uuid;

use crate::context::ExecutionContext;
use crate::errors::PipelineError;
use crate::middleware::{Middleware, Next};
use crate::prompt::{Selection, SelectionPrompt, SelectionRequest};
use crate::run::Run;
use crate::shell::{KillSwitch, ShellCommand, ShellExecutor, ShellProcess};
use crate::stream::{bytes_reader, pipe, BoxedReader, BoxedWriter, PipeWriter};

/// A middleware that records every run it sees and continues the chain.
#[derive(Debug)]
pub struct RecordingMiddleware {
    name: &'static str,
    seen: Mutex<Vec<Uuid>>,
}

impl RecordingMiddleware {
    /// Creates a recorder with the given name.
    #[must_use]
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            seen: Mutex::new(Vec::new()),
        }
    }

    /// Ids of the runs seen so far, in order.
    #[must_use]
    pub fn seen(&self) -> Vec<Uuid> {
        self.seen.lock().clone()
    }
}

#[async_trait]
impl Middleware for RecordingMiddleware {
    fn name(&self) -> &'static str {
        self.name
    }

    async fn apply(&self, run: Arc<Run>, next: Next, _ctx: &Arc<ExecutionContext>) {
        self.seen.lock().push(run.id());
        next.run(run).await;
    }
}

/// A prompt that always answers with a fixed index and records the requests.
#[derive(Debug, Default)]
pub struct StaticPrompt {
    index: usize,
    requests: Mutex<Vec<SelectionRequest>>,
}

impl StaticPrompt {
    /// Creates a prompt answering `index`.
    #[must_use]
    pub fn new(index: usize) -> Self {
        Self {
            index,
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Requests received so far.
    #[must_use]
    pub fn requests(&self) -> Vec<SelectionRequest> {
        self.requests.lock().clone()
    }
}

impl SelectionPrompt for StaticPrompt {
    fn select(&self, request: &SelectionRequest) -> Result<Selection, PipelineError> {
        self.requests.lock().push(request.clone());
        request
            .items
            .get(self.index)
            .map(|item| Selection {
                index: self.index,
                item: item.clone(),
            })
            .ok_or_else(|| PipelineError::Prompt(format!("no item at index {}", self.index)))
    }
}

/// A shell executor that fakes processes.
///
/// By default a process echoes its stdin to stdout and exits 0. Exit codes
/// queued with [`ScriptedExecutor::with_exit_codes`] are handed out one per
/// process; once drained, processes exit 0.
#[derive(Debug, Clone, Default)]
pub struct ScriptedExecutor {
    stdout: Option<String>,
    stderr: String,
    hang: bool,
    exit_codes: Arc<Mutex<VecDeque<i32>>>,
    commands: Arc<Mutex<Vec<ShellCommand>>>,
}

impl ScriptedExecutor {
    /// Creates an echoing executor.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the echo with fixed stdout content.
    #[must_use]
    pub fn with_stdout(mut self, stdout: impl Into<String>) -> Self {
        self.stdout = Some(stdout.into());
        self
    }

    /// Writes fixed content to stderr.
    #[must_use]
    pub fn with_stderr(mut self, stderr: impl Into<String>) -> Self {
        self.stderr = stderr.into();
        self
    }

    /// Queues exit codes for the next processes.
    #[must_use]
    pub fn with_exit_codes(self, codes: impl IntoIterator<Item = i32>) -> Self {
        self.exit_codes.lock().extend(codes);
        self
    }

    /// Makes processes run until killed.
    #[must_use]
    pub fn hanging(mut self) -> Self {
        self.hang = true;
        self
    }

    /// Commands started so far.
    #[must_use]
    pub fn commands(&self) -> Vec<ShellCommand> {
        self.commands.lock().clone()
    }
}

impl ShellExecutor for ScriptedExecutor {
    fn init(&self, command: ShellCommand) -> Box<dyn ShellProcess> {
        Box::new(ScriptedProcess {
            command,
            script: self.clone(),
            stdin: None,
            stdout: None,
            stderr: None,
            started: false,
            kill: KillSwitch::new(),
        })
    }
}

struct ScriptedProcess {
    command: ShellCommand,
    script: ScriptedExecutor,
    stdin: Option<PipeWriter>,
    stdout: Option<BoxedReader>,
    stderr: Option<BoxedReader>,
    started: bool,
    kill: KillSwitch,
}

#[async_trait]
impl ShellProcess for ScriptedProcess {
    fn start(&mut self) -> Result<(), PipelineError> {
        if self.started {
            return Err(PipelineError::Process(
                "process already started".to_string(),
            ));
        }
        self.started = true;
        self.script.commands.lock().push(self.command.clone());

        let (writer, reader) = pipe();
        self.stdin = Some(writer);
        self.stdout = Some(match self.script.stdout {
            Some(ref text) => Box::new(bytes_reader(text.clone())),
            None => Box::new(reader),
        });
        self.stderr = Some(Box::new(bytes_reader(self.script.stderr.clone())));
        Ok(())
    }

    fn pid(&self) -> Option<u32> {
        self.started.then_some(4242)
    }

    fn take_stdin(&mut self) -> Option<BoxedWriter> {
        self.stdin.take().map(|w| Box::new(w) as BoxedWriter)
    }

    fn take_stdout(&mut self) -> Option<BoxedReader> {
        self.stdout.take()
    }

    fn take_stderr(&mut self) -> Option<BoxedReader> {
        self.stderr.take()
    }

    fn kill_switch(&self) -> KillSwitch {
        self.kill.clone()
    }

    async fn wait(&mut self) -> Result<i32, PipelineError> {
        if !self.started {
            return Err(PipelineError::Process(
                "process was not started".to_string(),
            ));
        }
        if self.script.hang {
            self.kill.killed().await;
            return Ok(128 + 9);
        }
        Ok(self.script.exit_codes.lock().pop_front().unwrap_or(0))
    }
}
