//! Invocation of the external disk and filesystem tools.
//!
//! Every capability imgstow delegates (partition table edits, loop devices,
//! ext2/3/4 resizing, mounting) is reached through a [`ToolRunner`], so the
//! components above it can be exercised against scripted output in tests.
use crate::error::{Error, Result};
use std::fmt;

/// A single external command line, with optional bytes fed on stdin.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ToolCommand {
    pub program: String,
    pub args: Vec<String>,
    pub input: Option<String>,
}

impl ToolCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            input: None,
        }
    }

    pub fn arg(mut self, arg: impl ToString) -> Self {
        self.args.push(arg.to_string());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: ToString,
    {
        self.args.extend(args.into_iter().map(|a| a.to_string()));
        self
    }

    /// Feeds `input` to the command's stdin.
    pub fn input(mut self, input: impl Into<String>) -> Self {
        self.input = Some(input.into());
        self
    }
}

impl fmt::Display for ToolCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

/// Captured result of a finished command.
#[derive(Clone, Debug, Default)]
pub struct ToolOutput {
    pub success: bool,
    /// Exit code, `None` when the process was killed by a signal.
    pub code: Option<i32>,
    pub status: String,
    pub stdout: String,
    pub stderr: String,
}

impl ToolOutput {
    /// Converts a failed run into [`Error::ExternalTool`].
    pub fn check(self, command: &ToolCommand) -> Result<ToolOutput> {
        if self.success {
            Ok(self)
        } else {
            Err(Error::ExternalTool {
                command: command.to_string(),
                status: self.status,
                stderr: self.stderr,
            })
        }
    }
}

/// Runs external commands to completion.
///
/// Implementations return `Ok` for commands that ran but failed; only a
/// command that could not be started at all is an `Err`.
pub trait ToolRunner {
    fn run(&self, command: &ToolCommand) -> Result<ToolOutput>;
}

/// Runs commands on the host through `duct`, capturing stdout and stderr.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemRunner;

impl ToolRunner for SystemRunner {
    fn run(&self, command: &ToolCommand) -> Result<ToolOutput> {
        let mut expr = duct::cmd(command.program.as_str(), &command.args)
            .stdout_capture()
            .stderr_capture()
            .unchecked();
        if let Some(input) = &command.input {
            expr = expr.stdin_bytes(input.clone().into_bytes());
        }

        let output = expr.run().map_err(|e| Error::ExternalTool {
            command: command.to_string(),
            status: "could not be started".to_string(),
            stderr: e.to_string(),
        })?;

        Ok(ToolOutput {
            success: output.status.success(),
            code: output.status.code(),
            status: output.status.to_string(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}
