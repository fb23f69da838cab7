//! The restore pipeline: decode, write to the device, extend, verify.
use crate::compress;
use crate::context::OperationContext;
use crate::copy;
use crate::device::ImageTarget;
use crate::error::{Error, Result};
use crate::geometry;
use crate::loopdev;
use crate::platform;
use crate::resize::{self, ResizeOutcome};
use crate::tools::ToolCommand;
use log::{info, warn};
use std::path::{Path, PathBuf};

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RestoreOptions {
    pub input: PathBuf,
    /// Must be a block device.
    pub output: PathBuf,
    /// Extra `dd` arguments; when set, the device is written through `dd`.
    pub copy_args: Vec<String>,
    pub extend: bool,
    pub verify: bool,
}

impl RestoreOptions {
    pub fn new(input: impl Into<PathBuf>, output: impl Into<PathBuf>) -> Self {
        Self {
            input: input.into(),
            output: output.into(),
            extend: true,
            ..Self::default()
        }
    }
}

/// Consistency-check result of one restored partition.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PartitionCheck {
    pub index: u32,
    pub type_label: String,
    pub passed: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RestoreReport {
    pub written: u64,
    pub extend: Option<ResizeOutcome>,
    pub checks: Vec<PartitionCheck>,
}

/// Runs the restore pipeline from `options.input` onto `options.output`.
pub fn run(ctx: &mut OperationContext, options: &RestoreOptions) -> Result<RestoreReport> {
    if !options.input.is_file() {
        return Err(Error::precondition(format!(
            "input {} does not exist or is not a file",
            options.input.display()
        )));
    }
    let target = ImageTarget::resolve(&options.output)?;
    if !target.is_device() {
        return Err(Error::precondition(format!(
            "{} is not a block device",
            target.path.display()
        )));
    }
    platform::ensure_unmounted(&target.path)?;
    if !ctx.confirm(&format!(
        "All data on {} will be erased. Continue?",
        target.path.display()
    )) {
        return Err(Error::precondition("restore was not confirmed"));
    }

    info!("Restoring {} onto {target}", options.input.display());
    let written = write_image(ctx, &options.input, &target.path, &options.copy_args)?;
    info!("Wrote {written} bytes to {}", target.path.display());
    ctx.run_tolerant(&ToolCommand::new("partprobe").arg(target.path.display()));

    let extend = if options.extend {
        Some(resize::extend(ctx, &target)?)
    } else {
        None
    };
    let checks = if options.verify {
        verify(ctx, &target)
    } else {
        Vec::new()
    };

    Ok(RestoreReport {
        written,
        extend,
        checks,
    })
}

/// Decodes `input` and streams it onto `device`.
fn write_image(ctx: &OperationContext, input: &Path, device: &Path, copy_args: &[String]) -> Result<u64> {
    compress::with_decoded(input, |reader, size| {
        if copy_args.is_empty() {
            return copy::write_to_device(ctx, reader, device, size);
        }
        let command = ToolCommand::new("dd")
            .arg(format!("of={}", device.display()))
            .args(copy_args);
        let label = format!("Writing {}", device.display());
        copy::pipe_into(ctx, reader, &command, &label, size)
    })
}

/// Runs a read-only `fsck` on every Linux or FAT32 partition of `target`.
///
/// Never fails: problems are reported per partition.
pub fn verify(ctx: &mut OperationContext, target: &ImageTarget) -> Vec<PartitionCheck> {
    let geometry = match geometry::inspect(ctx, target) {
        Ok(geometry) => geometry,
        Err(e) => {
            warn!("Cannot verify {}: {e}", target.path.display());
            return Vec::new();
        }
    };
    let target = target.clone().with_sector_size(geometry.sector_size);

    let mut checks = Vec::new();
    for partition in geometry
        .table
        .partitions
        .iter()
        .filter(|p| p.is_linux() || p.is_fat32())
    {
        let passed = loopdev::with_partition_bound(ctx, &target, partition, |ctx, node| {
            Ok(ctx
                .run_tolerant(&ToolCommand::new("fsck").arg("-n").arg(node.display()))
                .is_some())
        })
        .unwrap_or_else(|e| {
            warn!("Could not check partition {}: {e}", partition.index);
            false
        });

        if passed {
            info!("Partition {} ({}) is clean", partition.index, partition.type_label);
        } else {
            warn!("Partition {} ({}) failed verification", partition.index, partition.type_label);
        }
        checks.push(PartitionCheck {
            index: partition.index,
            type_label: partition.type_label.clone(),
            passed,
        });
    }
    checks
}
