//! Mounting loop-bound partitions on the workspace mount directory.
use crate::context::OperationContext;
use crate::error::Result;
use crate::tools::ToolCommand;
use log::debug;
use std::path::Path;

/// Mounts `node` on `dir` and remembers `dir` for cleanup.
pub fn mount(ctx: &mut OperationContext, node: &Path, dir: &Path) -> Result<()> {
    ctx.run(
        &ToolCommand::new("mount")
            .arg(node.display())
            .arg(dir.display()),
    )?;
    debug!("Mounted {} on {}", node.display(), dir.display());
    ctx.mounted = Some(dir.to_path_buf());
    Ok(())
}

/// Unmounts whatever [`mount`] last attached.
pub fn unmount(ctx: &mut OperationContext) -> Result<()> {
    let Some(dir) = ctx.mounted.take() else {
        return Ok(());
    };
    ctx.run(&ToolCommand::new("umount").arg(dir.display()))?;
    debug!("Unmounted {}", dir.display());
    Ok(())
}
