//! Shell process abstraction used by the `shell` middleware.
//!
//! The engine only talks to [`ShellExecutor`] / [`ShellProcess`]; the
//! default [`ProcessExecutor`] runs real OS processes through
//! `tokio::process`.

mod process;

pub use process::ProcessExecutor;

use crate::errors::PipelineError;
use crate::stream::{BoxedReader, BoxedWriter};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;

/// A command ready to be started.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShellCommand {
    /// Program to execute.
    pub program: String,
    /// Arguments passed to the program.
    pub args: Vec<String>,
    /// Extra environment variables.
    pub env: BTreeMap<String, String>,
    /// Working directory.
    pub dir: Option<PathBuf>,
}

impl ShellCommand {
    /// Creates a command without arguments.
    #[must_use]
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Self::default()
        }
    }

    /// Appends arguments.
    #[must_use]
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Adds an environment variable.
    #[must_use]
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Sets the working directory.
    #[must_use]
    pub fn with_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.dir = Some(dir.into());
        self
    }
}

impl fmt::Display for ShellCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            if arg.contains(char::is_whitespace) {
                write!(f, " {arg:?}")?;
            } else {
                write!(f, " {arg}")?;
            }
        }
        Ok(())
    }
}

/// Kills a process from outside the task waiting on it.
#[derive(Debug, Clone)]
pub struct KillSwitch {
    fired: Arc<watch::Sender<bool>>,
}

impl KillSwitch {
    /// Creates an unfired switch.
    #[must_use]
    pub fn new() -> Self {
        let (fired, _) = watch::channel(false);
        Self {
            fired: Arc::new(fired),
        }
    }

    /// Requests the kill.
    pub fn kill(&self) {
        self.fired.send_replace(true);
    }

    /// Returns true once fired.
    #[must_use]
    pub fn is_killed(&self) -> bool {
        *self.fired.borrow()
    }

    /// Resolves once fired.
    pub async fn killed(&self) {
        let mut fired = self.fired.subscribe();
        let _ = fired.wait_for(|fired| *fired).await;
    }
}

impl Default for KillSwitch {
    fn default() -> Self {
        Self::new()
    }
}

/// A process created by a [`ShellExecutor`].
///
/// Stdio handles are available after `start`; each can be taken once.
#[async_trait]
pub trait ShellProcess: Send {
    /// Spawns the process.
    fn start(&mut self) -> Result<(), PipelineError>;

    /// OS process id, once started.
    fn pid(&self) -> Option<u32>;

    /// Takes the process's stdin.
    fn take_stdin(&mut self) -> Option<BoxedWriter>;

    /// Takes the process's stdout.
    fn take_stdout(&mut self) -> Option<BoxedReader>;

    /// Takes the process's stderr.
    fn take_stderr(&mut self) -> Option<BoxedReader>;

    /// Switch that kills this process when fired.
    fn kill_switch(&self) -> KillSwitch;

    /// Waits for exit and returns the exit code.
    async fn wait(&mut self) -> Result<i32, PipelineError>;
}

/// Creates shell processes.
pub trait ShellExecutor: Send + Sync {
    /// Prepares a process for `command` without starting it.
    fn init(&self, command: ShellCommand) -> Box<dyn ShellProcess>;
}
