//! Command execution for the storage tool and filesystem initialisation.
//!
//! Every external command runs under a deadline. A command that outlives it
//! is killed along with its whole process group and reported as
//! [`Error::Timeout`](crate::Error::Timeout).

use async_trait::async_trait;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use std::fmt;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;

/// A program and its arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<String>,
}

impl Invocation {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Run `script` through `/bin/sh -c`.
    pub fn shell(script: impl Into<String>) -> Self {
        Self::new("/bin/sh").arg("-c").arg(script)
    }
}

impl fmt::Display for Invocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

/// Captured result of a finished command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Output {
    /// Exit code, `None` when killed by a signal
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl Output {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    /// Turn a non-zero exit into [`Error::Subprocess`](crate::Error::Subprocess).
    pub fn check(self, invocation: &Invocation) -> crate::Result<Output> {
        if self.success() {
            return Ok(self);
        }
        Err(crate::Error::Subprocess {
            command: invocation.to_string(),
            status: self
                .code
                .map_or_else(|| "killed".to_string(), |c| format!("exit {}", c)),
            stderr: self.stderr.trim().to_string(),
        })
    }
}

/// Runs external commands. The driver depends on this rather than spawning
/// processes itself so tests can substitute a fake storage tool.
#[async_trait]
pub trait Executor: Send + Sync {
    /// Run to completion. Fails only if the command could not be started or
    /// exceeded `timeout`; a non-zero exit is reported through [`Output`].
    async fn run(&self, invocation: &Invocation, timeout: Duration) -> crate::Result<Output>;

    /// Run and require a zero exit status.
    async fn run_checked(
        &self,
        invocation: &Invocation,
        timeout: Duration,
    ) -> crate::Result<Output> {
        self.run(invocation, timeout).await?.check(invocation)
    }
}

/// Spawns real processes.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemExecutor;

#[async_trait]
impl Executor for SystemExecutor {
    async fn run(&self, invocation: &Invocation, timeout: Duration) -> crate::Result<Output> {
        tracing::debug!(command = %invocation, ?timeout, "Executing");

        let child = Command::new(&invocation.program)
            .args(&invocation.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .kill_on_drop(true)
            .spawn()?;
        let pid = child.id();

        match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(result) => {
                let output = result?;
                Ok(Output {
                    code: output.status.code(),
                    stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                    stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
                })
            }
            Err(_) => {
                // The leader is already killed on drop; take the rest of the group with it.
                if let Some(pid) = pid.and_then(|p| i32::try_from(p).ok()) {
                    if let Err(e) = killpg(Pid::from_raw(pid), Signal::SIGKILL) {
                        tracing::warn!(command = %invocation, "Failed to kill process group: {}", e);
                    }
                }
                tracing::warn!(command = %invocation, ?timeout, "Command timed out");
                Err(crate::Error::Timeout(format!(
                    "`{}` did not finish within {:?}",
                    invocation, timeout
                )))
            }
        }
    }
}
