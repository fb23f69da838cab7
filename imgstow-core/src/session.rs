//! One imgstow run, from privilege check to cleanup.
//!
//! A [`Session`] owns the [`OperationContext`] for the run. Dropping it, after
//! success, an error or a panic, releases the loop device, unmounts the mount
//! directory and removes the working directories if they ended up empty.
use crate::archive::{self, ArchiveOptions, ArchiveReport};
use crate::context::OperationContext;
use crate::error::{Error, Result};
use crate::loopdev;
use crate::mount;
use crate::platform;
use crate::restore::{self, RestoreOptions, RestoreReport};
use crate::workspace::{self, WorkspaceLease};
use log::{debug, warn};
use std::path::{Path, PathBuf};

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SessionOptions {
    pub work_dir: Option<PathBuf>,
    pub mount_dir: Option<PathBuf>,
}

pub struct Session {
    ctx: OperationContext,
    /// Directories searched for leftovers of earlier runs.
    scan_dirs: Vec<PathBuf>,
    cleaned_up: bool,
}

impl Session {
    /// Checks privileges and leases the working directories.
    ///
    /// Without root privileges the user is asked whether to continue anyway.
    pub fn start(ctx: OperationContext, options: &SessionOptions) -> Result<Self> {
        if !platform::is_root() {
            warn!("imgstow is not running as root; loop devices and mounts will likely fail");
            if !ctx.confirm("Continue without root privileges?") {
                return Err(Error::precondition("not running as root"));
            }
        }

        let lease = WorkspaceLease::acquire(options.work_dir.as_deref(), options.mount_dir.as_deref())?;
        debug!(
            "Working directory {}, mount directory {}",
            lease.work_dir().display(),
            lease.mount_dir().display()
        );

        let mut scan_dirs = vec![std::env::temp_dir()];
        for dir in [lease.work_dir(), lease.mount_dir()] {
            if let Some(parent) = dir.parent() {
                if !scan_dirs.iter().any(|d| d == parent) {
                    scan_dirs.push(parent.to_path_buf());
                }
            }
        }

        Ok(Self {
            ctx: ctx.with_workspace(lease),
            scan_dirs,
            cleaned_up: false,
        })
    }

    pub fn archive(&mut self, options: &ArchiveOptions) -> Result<ArchiveReport> {
        archive::run(&mut self.ctx, options)
    }

    pub fn restore(&mut self, options: &RestoreOptions) -> Result<RestoreReport> {
        restore::run(&mut self.ctx, options)
    }

    /// Ends the run, returning the directories left behind by it or by
    /// earlier runs.
    pub fn finish(mut self) -> Vec<PathBuf> {
        self.cleanup()
    }

    fn cleanup(&mut self) -> Vec<PathBuf> {
        if self.cleaned_up {
            return Vec::new();
        }
        self.cleaned_up = true;

        if let Err(e) = mount::unmount(&mut self.ctx) {
            warn!("Cleanup: {e}");
        }
        if let Err(e) = loopdev::release(&mut self.ctx) {
            warn!("Cleanup: {e}");
        }

        let mut lingering = match self.ctx.take_workspace() {
            Some(lease) => lease.release(),
            None => Vec::new(),
        };
        let own = lingering.clone();
        for dir in &self.scan_dirs {
            let exclude: Vec<&Path> = own.iter().map(PathBuf::as_path).collect();
            lingering.extend(workspace::find_lingering(dir, &exclude));
        }
        lingering.sort();
        lingering.dedup();

        for dir in &lingering {
            warn!(
                "Lingering directory {} was left behind; check it and remove it manually",
                dir.display()
            );
        }
        lingering
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.cleanup();
    }
}
