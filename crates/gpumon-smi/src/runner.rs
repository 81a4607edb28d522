//! Process execution for the diagnostic tool.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::process::Command;

use crate::error::{SmiError, SmiResult};

/// Runs the diagnostic tool with a set of arguments and returns its stdout.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, args: &[String]) -> SmiResult<String>;
}

/// Runs the real binary through `tokio::process`.
///
/// The child is killed if the future is dropped (e.g. when the scheduler
/// aborts a straggling task) so no orphaned `nvidia-smi` processes pile up.
#[derive(Debug, Clone)]
pub struct ProcessRunner {
    program: PathBuf,
    timeout: Duration,
}

impl ProcessRunner {
    pub fn new(program: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            timeout,
        }
    }

    fn command_line(&self, args: &[String]) -> String {
        let mut line = self.program.display().to_string();
        for arg in args {
            line.push(' ');
            line.push_str(arg);
        }
        line
    }
}

#[async_trait]
impl CommandRunner for ProcessRunner {
    async fn run(&self, args: &[String]) -> SmiResult<String> {
        let mut cmd = Command::new(&self.program);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let output = match tokio::time::timeout(self.timeout, cmd.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return Err(SmiError::ToolInvocation {
                    command: self.command_line(args),
                    output: e.to_string(),
                })
            }
            Err(_) => {
                return Err(SmiError::ToolTimeout {
                    command: self.command_line(args),
                    timeout: self.timeout,
                })
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let mut combined = output.status.to_string();
            for stream in [stdout.trim_end(), stderr.trim_end()] {
                if !stream.is_empty() {
                    combined.push('\n');
                    combined.push_str(stream);
                }
            }
            return Err(SmiError::ToolInvocation {
                command: self.command_line(args),
                output: combined,
            });
        }

        tracing::trace!(command = %self.command_line(args), bytes = stdout.len(), "nvidia-smi exited");
        Ok(stdout)
    }
}

/// Canned responses keyed by argument list, for tests.
///
/// Arguments without a scripted response fail like a non-zero exit.
#[derive(Default)]
pub struct ScriptedRunner {
    responses: HashMap<Vec<String>, Result<String, String>>,
    delays: HashMap<Vec<String>, Duration>,
    calls: Mutex<Vec<Vec<String>>>,
}

impl ScriptedRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Respond to `args` with `stdout`.
    pub fn respond<I, S>(mut self, args: I, stdout: impl Into<String>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.responses.insert(collect_args(args), Ok(stdout.into()));
        self
    }

    /// Make `args` fail with the given combined output.
    pub fn fail<I, S>(mut self, args: I, output: impl Into<String>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.responses.insert(collect_args(args), Err(output.into()));
        self
    }

    /// Sleep for `delay` before answering `args`.
    pub fn delay<I, S>(mut self, args: I, delay: Duration) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.delays.insert(collect_args(args), delay);
        self
    }

    /// Every argument list the runner was invoked with, in call order.
    pub fn calls(&self) -> Vec<Vec<String>> {
        self.calls.lock().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }
}

fn collect_args<I, S>(args: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    args.into_iter().map(Into::into).collect()
}

#[async_trait]
impl CommandRunner for ScriptedRunner {
    async fn run(&self, args: &[String]) -> SmiResult<String> {
        self.calls.lock().push(args.to_vec());

        if let Some(delay) = self.delays.get(args) {
            tokio::time::sleep(*delay).await;
        }

        match self.responses.get(args) {
            Some(Ok(stdout)) => Ok(stdout.clone()),
            Some(Err(output)) => Err(SmiError::ToolInvocation {
                command: format!("nvidia-smi {}", args.join(" ")),
                output: output.clone(),
            }),
            None => Err(SmiError::ToolInvocation {
                command: format!("nvidia-smi {}", args.join(" ")),
                output: "no scripted response".to_string(),
            }),
        }
    }
}
