//! The state shared by every step of one archive or restore run.
//!
//! Instead of process-wide globals, the loop device handle, the mount point in
//! use, the workspace directories and the user-interaction hooks all live on an
//! [`OperationContext`] that is passed to each component.
use crate::error::{Error, Result};
use crate::tools::{ToolCommand, ToolOutput, ToolRunner};
use crate::workspace::WorkspaceLease;
use log::{debug, warn};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Progress notifications for long-running byte copies.
#[derive(Clone, Copy, Debug)]
pub enum ProgressEvent<'a> {
    /// A new stage begins; `total` is 0 when the length is unknown.
    Start { label: &'a str, total: u64 },
    /// Bytes processed so far in the current stage.
    Advance(u64),
    Finish,
}

type PromptFn = Box<dyn Fn(&str) -> bool>;
type ProgressFn = Box<dyn Fn(ProgressEvent<'_>)>;

pub struct OperationContext {
    runner: Box<dyn ToolRunner>,
    auto_yes: bool,
    running: Arc<AtomicBool>,
    prompt: PromptFn,
    progress: ProgressFn,
    pub(crate) loop_device: Option<PathBuf>,
    pub(crate) mounted: Option<PathBuf>,
    workspace: Option<WorkspaceLease>,
}

impl OperationContext {
    /// A context that answers "no" to every prompt and reports no progress.
    pub fn new(runner: impl ToolRunner + 'static) -> Self {
        Self {
            runner: Box::new(runner),
            auto_yes: false,
            running: Arc::new(AtomicBool::new(true)),
            prompt: Box::new(|_| false),
            progress: Box::new(|_| {}),
            loop_device: None,
            mounted: None,
            workspace: None,
        }
    }

    /// Answer every confirmation with "yes" without prompting.
    pub fn with_auto_yes(mut self, auto_yes: bool) -> Self {
        self.auto_yes = auto_yes;
        self
    }

    pub fn with_prompt(mut self, prompt: impl Fn(&str) -> bool + 'static) -> Self {
        self.prompt = Box::new(prompt);
        self
    }

    pub fn with_progress(mut self, progress: impl Fn(ProgressEvent<'_>) + 'static) -> Self {
        self.progress = Box::new(progress);
        self
    }

    /// Shares a cancellation flag; clearing it aborts in-process copy loops.
    pub fn with_cancel_flag(mut self, running: Arc<AtomicBool>) -> Self {
        self.running = running;
        self
    }

    pub fn with_workspace(mut self, workspace: WorkspaceLease) -> Self {
        self.workspace = Some(workspace);
        self
    }

    pub fn auto_yes(&self) -> bool {
        self.auto_yes
    }

    /// Runs an external command and fails on a non-zero exit status.
    pub fn run(&self, command: &ToolCommand) -> Result<ToolOutput> {
        debug!("Running: {command}");
        self.runner.run(command)?.check(command)
    }

    /// Runs an external command, treating the exit codes `accept` allows as
    /// success.
    pub fn run_accepting(
        &self,
        command: &ToolCommand,
        accept: impl Fn(i32) -> bool,
    ) -> Result<ToolOutput> {
        debug!("Running: {command}");
        let mut output = self.runner.run(command)?;
        if output.code.is_some_and(accept) {
            output.success = true;
        }
        output.check(command)
    }

    /// Runs an external command whose failure is tolerated.
    ///
    /// Returns `None` and logs a warning when the command fails.
    pub fn run_tolerant(&self, command: &ToolCommand) -> Option<ToolOutput> {
        match self.run(command) {
            Ok(output) => Some(output),
            Err(e) => {
                warn!("{e}");
                None
            }
        }
    }

    /// Asks the user to confirm; always true in auto-yes mode.
    pub fn confirm(&self, prompt: &str) -> bool {
        self.auto_yes || (self.prompt)(prompt)
    }

    pub fn check_running(&self) -> Result<()> {
        if self.running.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(Error::Cancelled)
        }
    }

    pub fn progress(&self, event: ProgressEvent<'_>) {
        (self.progress)(event)
    }

    /// The loop device currently bound, if any.
    pub fn loop_device(&self) -> Option<&Path> {
        self.loop_device.as_deref()
    }

    pub fn workspace(&self) -> Result<&WorkspaceLease> {
        self.workspace
            .as_ref()
            .ok_or_else(|| Error::precondition("no working directory has been set up"))
    }

    pub(crate) fn take_workspace(&mut self) -> Option<WorkspaceLease> {
        self.workspace.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::scripted::ScriptedRunner;

    #[test]
    fn run_fails_on_non_zero_exit() {
        let ctx = OperationContext::new(ScriptedRunner::new().fail("sgdisk"));
        let err = ctx.run(&ToolCommand::new("sgdisk").arg("-e")).unwrap_err();
        assert!(matches!(err, Error::ExternalTool { .. }));
        assert!(ctx.run_tolerant(&ToolCommand::new("sgdisk")).is_none());
    }

    #[test]
    fn accepted_exit_codes_count_as_success() {
        let runner = ScriptedRunner::new().exit("e2fsck", 1);
        let ctx = OperationContext::new(runner);
        let fsck = ToolCommand::new("e2fsck").args(["-f", "-y", "/dev/loop0"]);
        assert!(ctx.run(&fsck).is_err());
        assert!(ctx.run_accepting(&fsck, |code| code < 4).is_ok());
    }

    #[test]
    fn confirm_uses_prompt_unless_auto_yes() {
        let ctx = OperationContext::new(ScriptedRunner::new());
        assert!(!ctx.confirm("continue?"));

        let ctx = OperationContext::new(ScriptedRunner::new()).with_prompt(|p| p.ends_with('?'));
        assert!(ctx.confirm("continue?"));

        let ctx = OperationContext::new(ScriptedRunner::new()).with_auto_yes(true);
        assert!(ctx.confirm("anything"));
    }

    #[test]
    fn cleared_flag_cancels() {
        let flag = Arc::new(AtomicBool::new(true));
        let ctx = OperationContext::new(ScriptedRunner::new()).with_cancel_flag(flag.clone());
        assert!(ctx.check_running().is_ok());
        flag.store(false, Ordering::SeqCst);
        assert!(matches!(ctx.check_running(), Err(Error::Cancelled)));
    }
}
