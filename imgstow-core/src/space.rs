//! Disk-space estimation for an archive run, checked before anything is
//! modified.
use crate::context::OperationContext;
use crate::device::ImageTarget;
use crate::error::{Error, Result};
use crate::geometry::Geometry;
use crate::platform::{self, DiskSpace};
use crate::resize::{self, ResizeOutcome, ShrinkOptions};
use log::{debug, info};
use std::path::Path;

/// Expected compressed size as a fraction of the uncompressed image.
pub const COMPRESSION_RATIO: f64 = 0.75;

const MIB: u64 = 1024 * 1024;

/// What an archive run is about to do, as far as space is concerned.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SpaceRequest {
    pub input_size: u64,
    /// Bytes up to and including the last sector used by a partition.
    pub end_of_data: u64,
    /// End of the last partition after a dry-run shrink; `None` when not
    /// resizing or when the shrink would be skipped.
    pub shrunk_end: Option<u64>,
    pub in_place: bool,
    pub skip_unpartitioned: bool,
    pub compress: bool,
}

/// Bytes needed in the working directory and next to the output.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SpaceEstimate {
    pub cache: u64,
    pub output: u64,
}

impl SpaceRequest {
    /// Size of the working copy of the image.
    pub fn cache_size(&self) -> u64 {
        if self.in_place {
            0
        } else if !self.skip_unpartitioned {
            self.input_size
        } else {
            self.shrunk_end.unwrap_or(self.end_of_data)
        }
    }

    /// `same_device` tells whether output and working directory share a
    /// filesystem, in which case an uncompressed copy is only renamed.
    pub fn estimate(&self, same_device: bool) -> SpaceEstimate {
        let cache = self.cache_size();
        let base = if self.in_place { self.input_size } else { cache };
        let output = if self.compress {
            (base as f64 * COMPRESSION_RATIO).floor() as u64
        } else if self.in_place || same_device {
            0
        } else {
            base
        };
        SpaceEstimate { cache, output }
    }
}

/// One device's share of the estimate.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Requirement {
    pub disk: DiskSpace,
    pub required: u64,
}

impl Requirement {
    fn check(&self) -> Result<()> {
        debug!(
            "{} ({}): {} bytes required, {} available",
            self.disk.device,
            self.disk.mount_point.display(),
            self.required,
            self.disk.available
        );
        if self.required <= self.disk.available {
            return Ok(());
        }
        Err(Error::InsufficientSpace {
            device: self.disk.device.clone(),
            required_mb: self.required.div_ceil(MIB),
            available_mb: self.disk.available / MIB,
        })
    }
}

/// Splits `estimate` over the work and output devices, summing the two when
/// they are the same.
pub fn requirements(estimate: SpaceEstimate, work: DiskSpace, output: DiskSpace) -> Vec<Requirement> {
    if work.same_device(&output) {
        vec![Requirement {
            disk: work,
            required: estimate.cache + estimate.output,
        }]
    } else {
        vec![
            Requirement {
                disk: work,
                required: estimate.cache,
            },
            Requirement {
                disk: output,
                required: estimate.output,
            },
        ]
    }
}

pub fn check(requirements: &[Requirement]) -> Result<()> {
    requirements.iter().try_for_each(Requirement::check)
}

/// Flags of the archive run that affect its space needs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SpacePlan {
    pub in_place: bool,
    pub skip_unpartitioned: bool,
    pub resize: bool,
    pub compress: bool,
    pub shrink_tail: u64,
}

/// Estimates the run's space needs and checks them against the devices
/// holding `work_dir` and `output_dir`.
pub fn validate(
    ctx: &mut OperationContext,
    target: &ImageTarget,
    geometry: &Geometry,
    plan: &SpacePlan,
    work_dir: &Path,
    output_dir: &Path,
) -> Result<SpaceEstimate> {
    validate_with(ctx, target, geometry, plan, work_dir, output_dir, platform::disk_space)
}

fn validate_with(
    ctx: &mut OperationContext,
    target: &ImageTarget,
    geometry: &Geometry,
    plan: &SpacePlan,
    work_dir: &Path,
    output_dir: &Path,
    disk_space: impl Fn(&Path) -> Result<DiskSpace>,
) -> Result<SpaceEstimate> {
    let shrunk_end = if !plan.in_place && plan.skip_unpartitioned && plan.resize {
        dry_run_end(ctx, target, plan.shrink_tail)?
    } else {
        None
    };
    let request = SpaceRequest {
        input_size: target.size_bytes,
        end_of_data: geometry.end_of_data_bytes(),
        shrunk_end,
        in_place: plan.in_place,
        skip_unpartitioned: plan.skip_unpartitioned,
        compress: plan.compress,
    };

    let work = disk_space(work_dir)?;
    let output = disk_space(output_dir)?;
    let estimate = request.estimate(work.same_device(&output));
    info!(
        "Estimated space: {} MB working copy, {} MB output",
        estimate.cache.div_ceil(MIB),
        estimate.output.div_ceil(MIB)
    );
    check(&requirements(estimate, work, output))?;
    Ok(estimate)
}

fn dry_run_end(ctx: &mut OperationContext, target: &ImageTarget, tail: u64) -> Result<Option<u64>> {
    let options = ShrinkOptions {
        tail,
        dry_run: true,
    };
    Ok(match resize::shrink(ctx, target, &options)? {
        ResizeOutcome::Planned { new_end } => Some(new_end),
        _ => None,
    })
}
