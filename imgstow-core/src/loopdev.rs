//! Loop device bindings over byte ranges of an image or device.
//!
//! Only one binding is open at a time. Its node is kept on the
//! [`OperationContext`] so that cleanup can always release it, however the
//! run ends.
use crate::context::OperationContext;
use crate::device::ImageTarget;
use crate::error::{Error, Result};
use crate::geometry::Partition;
use crate::tools::ToolCommand;
use log::{debug, warn};
use std::path::{Path, PathBuf};

/// The byte range and options of a loop binding.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LoopSpec {
    pub offset: u64,
    pub size_limit: Option<u64>,
    pub sector_size: Option<u64>,
}

impl LoopSpec {
    /// A binding covering exactly `partition` of `target`.
    pub fn for_partition(target: &ImageTarget, partition: &Partition) -> Self {
        Self {
            offset: partition.offset_bytes(target.sector_size),
            size_limit: Some(partition.size_bytes),
            sector_size: Some(target.sector_size),
        }
    }

    pub fn command(&self, backing: &Path) -> ToolCommand {
        let mut cmd = ToolCommand::new("losetup").args(["--show", "-f", "--nooverlap"]);
        if let Some(sector_size) = self.sector_size {
            cmd = cmd.arg("-b").arg(sector_size);
        }
        cmd = cmd.arg("-o").arg(self.offset);
        if let Some(limit) = self.size_limit {
            cmd = cmd.arg("--sizelimit").arg(limit);
        }
        cmd.arg(backing.display())
    }
}

/// Binds a loop device and records it as the context's current binding.
///
/// A binding still held from an earlier step is released first.
pub fn bind(ctx: &mut OperationContext, backing: &Path, spec: &LoopSpec) -> Result<PathBuf> {
    if ctx.loop_device.is_some() {
        warn!("A loop device was still bound; releasing it first");
        release(ctx)?;
    }

    let command = spec.command(backing);
    let output = ctx.run(&command)?;
    let node = parse_loop_node(&output.stdout).ok_or_else(|| Error::ExternalTool {
        command: command.to_string(),
        status: "no loop device reported".to_string(),
        stderr: output.stderr.clone(),
    })?;

    debug!("Bound {} at offset {} to {}", backing.display(), spec.offset, node.display());
    ctx.loop_device = Some(node.clone());
    Ok(node)
}

/// Binds the loop device covering one partition of `target`.
pub fn bind_partition(
    ctx: &mut OperationContext,
    target: &ImageTarget,
    partition: &Partition,
) -> Result<PathBuf> {
    bind(ctx, &target.path, &LoopSpec::for_partition(target, partition))
}

/// Binds `partition`, runs `f` with the loop node, and releases the binding
/// whether or not `f` succeeded.
///
/// An error from `f` takes precedence over a failed release, which is then
/// only logged.
pub fn with_partition_bound<T>(
    ctx: &mut OperationContext,
    target: &ImageTarget,
    partition: &Partition,
    f: impl FnOnce(&mut OperationContext, &Path) -> Result<T>,
) -> Result<T> {
    let node = bind_partition(ctx, target, partition)?;
    let result = f(ctx, &node);
    let released = release(ctx);
    match (result, released) {
        (Ok(value), Ok(())) => Ok(value),
        (Ok(_), Err(e)) => Err(e),
        (Err(e), released) => {
            if let Err(release_err) = released {
                warn!("{release_err}");
            }
            Err(e)
        }
    }
}

/// Releases the current binding, if any.
pub fn release(ctx: &mut OperationContext) -> Result<()> {
    let Some(node) = ctx.loop_device.take() else {
        return Ok(());
    };
    ctx.run(&ToolCommand::new("losetup").arg("-d").arg(node.display()))?;
    debug!("Released {}", node.display());
    Ok(())
}

fn parse_loop_node(stdout: &str) -> Option<PathBuf> {
    stdout
        .lines()
        .map(str::trim)
        .find(|line| line.starts_with("/dev/"))
        .map(PathBuf::from)
}
