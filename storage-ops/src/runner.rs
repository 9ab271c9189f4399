// SPDX-License-Identifier: GPL-3.0-only

//! The boundary to external tools.
//!
//! The core never invokes programs directly; it emits [`OpDescriptor`]s
//! and hands them to a [`Runner`]. The default [`SystemRunner`] shells out
//! synchronously; tests use [`RecordingRunner`] to capture the exact argv
//! sequences and script their results.

use std::collections::VecDeque;
use std::process::Command;

use serde::{Deserialize, Serialize};

use crate::error::{OpsError, Result};

/// A structured request to run one external program.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpDescriptor {
    pub program: String,
    pub args: Vec<String>,
    /// Text fed to the program's stdin (passphrases, scripted input).
    pub stdin: Option<String>,
    /// Whether the caller wants the output captured and returned.
    pub capture: bool,
}

impl OpDescriptor {
    pub fn new(program: &str, args: &[&str]) -> OpDescriptor {
        OpDescriptor {
            program: program.to_string(),
            args: args.iter().map(|arg| (*arg).to_string()).collect(),
            stdin: None,
            capture: false,
        }
    }

    pub fn with_capture(mut self) -> OpDescriptor {
        self.capture = true;
        self
    }

    pub fn with_stdin(mut self, stdin: impl Into<String>) -> OpDescriptor {
        self.stdin = Some(stdin.into());
        self
    }

    /// The full argv, program included.
    pub fn argv(&self) -> Vec<String> {
        let mut argv = vec![self.program.clone()];
        argv.extend(self.args.iter().cloned());
        argv
    }
}

impl std::fmt::Display for OpDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.argv().join(" "))
    }
}

/// Normalized result of one external program run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunnerOutput {
    pub exit_code: i32,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl RunnerOutput {
    pub fn ok() -> RunnerOutput {
        RunnerOutput {
            exit_code: 0,
            stdout: Vec::new(),
            stderr: Vec::new(),
        }
    }

    pub fn ok_with_stdout(stdout: &str) -> RunnerOutput {
        RunnerOutput {
            exit_code: 0,
            stdout: stdout.as_bytes().to_vec(),
            stderr: Vec::new(),
        }
    }

    pub fn failed(exit_code: i32, stderr: &str) -> RunnerOutput {
        RunnerOutput {
            exit_code,
            stdout: Vec::new(),
            stderr: stderr.as_bytes().to_vec(),
        }
    }

    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    pub fn stdout_text(&self) -> String {
        String::from_utf8_lossy(&self.stdout).to_string()
    }

    pub fn stderr_text(&self) -> String {
        String::from_utf8_lossy(&self.stderr).to_string()
    }
}

/// Executes operation descriptors.
pub trait Runner {
    fn run(&mut self, op: &OpDescriptor) -> Result<RunnerOutput>;
}

/// Runs operations through `std::process` on the local system.
#[derive(Debug, Default)]
pub struct SystemRunner;

impl Runner for SystemRunner {
    fn run(&mut self, op: &OpDescriptor) -> Result<RunnerOutput> {
        use std::io::Write;
        use std::process::Stdio;

        let mut command = Command::new(&op.program);
        command.args(&op.args);
        command.stdout(Stdio::piped());
        command.stderr(Stdio::piped());
        if op.stdin.is_some() {
            command.stdin(Stdio::piped());
        }

        let mut child = command.spawn()?;
        if let (Some(text), Some(mut handle)) = (&op.stdin, child.stdin.take()) {
            handle.write_all(text.as_bytes())?;
        }
        let output = child.wait_with_output()?;
        Ok(RunnerOutput {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: output.stdout,
            stderr: output.stderr,
        })
    }
}

/// Test double: records every descriptor and replays scripted outputs.
///
/// Unscripted operations succeed with empty output.
#[derive(Debug, Default)]
pub struct RecordingRunner {
    pub ops: Vec<OpDescriptor>,
    responses: VecDeque<RunnerOutput>,
}

impl RecordingRunner {
    pub fn new() -> RecordingRunner {
        RecordingRunner::default()
    }

    pub fn push_response(&mut self, output: RunnerOutput) {
        self.responses.push_back(output);
    }

    /// The recorded command lines, rendered for assertions.
    pub fn command_lines(&self) -> Vec<String> {
        self.ops.iter().map(|op| op.to_string()).collect()
    }
}

impl Runner for RecordingRunner {
    fn run(&mut self, op: &OpDescriptor) -> Result<RunnerOutput> {
        self.ops.push(op.clone());
        Ok(self.responses.pop_front().unwrap_or_else(RunnerOutput::ok))
    }
}

/// Check that the given external programs are installed.
pub fn require_tools(programs: &[&str]) -> Result<()> {
    for program in programs {
        if which::which(program).is_err() {
            return Err(OpsError::Dependency((*program).to_string()));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn descriptors_render_their_argv() {
        let op = OpDescriptor::new("mdadm", &["--detail", "/dev/md0"]).with_capture();
        assert_eq!(op.argv(), vec!["mdadm", "--detail", "/dev/md0"]);
        assert_eq!(op.to_string(), "mdadm --detail /dev/md0");
        assert!(op.capture);
    }

    #[test]
    fn recording_runner_replays_scripted_outputs() {
        let mut runner = RecordingRunner::new();
        runner.push_response(RunnerOutput::ok_with_stdout("hello"));

        let first = runner.run(&OpDescriptor::new("true", &[])).unwrap();
        assert_eq!(first.stdout_text(), "hello");
        let second = runner.run(&OpDescriptor::new("true", &[])).unwrap();
        assert!(second.success());
        assert_eq!(runner.ops.len(), 2);
    }
}
