//! OS processes via `tokio::process`.

use super::{KillSwitch, ShellCommand, ShellExecutor, ShellProcess};
use crate::errors::PipelineError;
use crate::stream::{BoxedReader, BoxedWriter};
use async_trait::async_trait;
use std::process::{ExitStatus, Stdio};
use tokio::process::{Child, Command};
use tracing::{debug, trace};

/// Runs commands as child processes of this one.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessExecutor;

impl ShellExecutor for ProcessExecutor {
    fn init(&self, command: ShellCommand) -> Box<dyn ShellProcess> {
        Box::new(OsProcess {
            command,
            child: None,
            kill: KillSwitch::new(),
        })
    }
}

struct OsProcess {
    command: ShellCommand,
    child: Option<Child>,
    kill: KillSwitch,
}

impl OsProcess {
    fn prepare(&self) -> Command {
        let mut command = Command::new(&self.command.program);
        command
            .args(&self.command.args)
            .envs(&self.command.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(ref dir) = self.command.dir {
            command.current_dir(dir);
        }
        command
    }

    fn started(&mut self) -> Result<&mut Child, PipelineError> {
        self.child
            .as_mut()
            .ok_or_else(|| PipelineError::Process("process was not started".to_string()))
    }
}

fn exit_code(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    -1
}

#[async_trait]
impl ShellProcess for OsProcess {
    fn start(&mut self) -> Result<(), PipelineError> {
        if self.child.is_some() {
            return Err(PipelineError::Process(
                "process already started".to_string(),
            ));
        }
        let child = self.prepare().spawn().map_err(|e| {
            PipelineError::Process(format!("failed to spawn {:?}: {e}", self.command.program))
        })?;
        debug!(command = %self.command, pid = ?child.id(), "process spawned");
        self.child = Some(child);
        Ok(())
    }

    fn pid(&self) -> Option<u32> {
        self.child.as_ref().and_then(Child::id)
    }

    fn take_stdin(&mut self) -> Option<BoxedWriter> {
        let stdin = self.child.as_mut()?.stdin.take()?;
        Some(Box::new(stdin))
    }

    fn take_stdout(&mut self) -> Option<BoxedReader> {
        let stdout = self.child.as_mut()?.stdout.take()?;
        Some(Box::new(stdout))
    }

    fn take_stderr(&mut self) -> Option<BoxedReader> {
        let stderr = self.child.as_mut()?.stderr.take()?;
        Some(Box::new(stderr))
    }

    fn kill_switch(&self) -> KillSwitch {
        self.kill.clone()
    }

    async fn wait(&mut self) -> Result<i32, PipelineError> {
        let kill = self.kill.clone();
        let program = self.command.program.clone();
        let child = self.started()?;

        let status = tokio::select! {
            status = child.wait() => status?,
            () = kill.killed() => {
                trace!(program = %program, "killing process");
                child.kill().await?;
                child.wait().await?
            }
        };

        let code = exit_code(status);
        debug!(program = %program, code, "process exited");
        Ok(code)
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::stream::read_all;
    use std::time::Duration;
    use tokio::io::AsyncWriteExt;
    use tokio::time::timeout;

    fn sh(script: &str) -> ShellCommand {
        ShellCommand::new("sh").with_args(["-c", script])
    }

    #[tokio::test]
    async fn test_stdio_and_exit_code() {
        let mut process = ProcessExecutor.init(sh("tr a-z A-Z; echo oops >&2; exit 3"));
        process.start().unwrap();
        assert!(process.pid().is_some());

        let mut stdin = process.take_stdin().unwrap();
        let stdout = process.take_stdout().unwrap();
        let stderr = process.take_stderr().unwrap();
        assert!(process.take_stdout().is_none());

        stdin.write_all(b"shout").await.unwrap();
        drop(stdin);

        let (out, err) = tokio::join!(read_all(stdout), read_all(stderr));
        let code = timeout(Duration::from_secs(10), process.wait())
            .await
            .unwrap()
            .unwrap();

        assert_eq!(out.unwrap(), b"SHOUT");
        assert_eq!(err.unwrap(), b"oops\n");
        assert_eq!(code, 3);
    }

    #[tokio::test]
    async fn test_env_and_dir() {
        let dir = tempfile::tempdir().unwrap();
        let command = sh("printf '%s:' \"$GREETING\"; pwd")
            .with_env("GREETING", "hello")
            .with_dir(dir.path());
        let mut process = ProcessExecutor.init(command);
        process.start().unwrap();

        let stdout = process.take_stdout().unwrap();
        let out = String::from_utf8(read_all(stdout).await.unwrap()).unwrap();
        process.wait().await.unwrap();

        let expected_dir = dir.path().canonicalize().unwrap();
        let (greeting, pwd) = out.trim_end().split_once(':').unwrap();
        assert_eq!(greeting, "hello");
        let actual_dir = std::path::Path::new(pwd).canonicalize().unwrap();
        assert_eq!(actual_dir, expected_dir);
    }

    #[tokio::test]
    async fn test_kill_switch_stops_process() {
        let mut process = ProcessExecutor.init(sh("sleep 30"));
        process.start().unwrap();
        let switch = process.kill_switch();

        let waiter = tokio::spawn(async move { process.wait().await });
        switch.kill();

        let code = timeout(Duration::from_secs(10), waiter)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(code, 128 + 9);
    }

    #[tokio::test]
    async fn test_spawn_failure() {
        let mut process = ProcessExecutor.init(ShellCommand::new("/definitely/not/a/binary"));
        let err = process.start().unwrap_err();
        assert!(err.to_string().contains("failed to spawn"));
        assert!(process.wait().await.is_err());
    }
}
