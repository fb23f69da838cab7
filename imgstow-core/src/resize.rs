//! Shrinking and extending the last partition and its ext2/3/4 filesystem.
//!
//! A shrink moves through these states:
//!
//! 1.  Inspect the geometry and pick the last partition. Anything other than
//!     ext2/3/4 is skipped with a warning.
//! 2.  On GPT, move the backup header to the true end of the disk before
//!     touching anything else.
//! 3.  Bind the partition to a loop device and ask `resize2fs` for the
//!     minimum block count, forcing one consistency check and retrying once
//!     if the estimate is unavailable.
//! 4.  Decide: a dry run reports the end offset a shrink would produce; a
//!     partition that would not get smaller is left alone.
//! 5.  Shrink the filesystem, release the loop device, then move the end of
//!     the partition table entry.
//!
//! Extending runs the other way: grow the table entry to the end of the disk,
//! then grow the filesystem on a best-effort basis.
use crate::context::OperationContext;
use crate::device::ImageTarget;
use crate::error::{Error, Result};
use crate::geometry::{self, FsKind};
use crate::loopdev;
use crate::tools::ToolCommand;
use log::{debug, info, warn};
use std::path::Path;

/// Extra free bytes kept after a shrink or truncate by default (1 MiB).
pub const DEFAULT_TAIL: u64 = 1024 * 1024;

/// Space left unallocated at the end of a device after extending.
const EXTEND_RESERVE: u64 = 1_000_000;

/// `e2fsck` exit codes below 4 mean the filesystem is consistent now.
fn fsck_succeeded(code: i32) -> bool {
    code < 4
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ShrinkOptions {
    /// Free bytes to keep after the shrunk filesystem.
    pub tail: u64,
    /// Compute the resulting end offset without changing anything.
    pub dry_run: bool,
}

impl Default for ShrinkOptions {
    fn default() -> Self {
        Self {
            tail: DEFAULT_TAIL,
            dry_run: false,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SkipReason {
    /// The last partition does not hold ext2/3/4.
    UnsupportedFilesystem(String),
    /// The partition is already no larger than the minimum plus tail.
    NothingToGain { current_size: u64, target_size: u64 },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ResizeOutcome {
    Skipped(SkipReason),
    /// Dry-run result: where the last partition would end, exclusive.
    Planned { new_end: u64 },
    Shrunk {
        old_size: u64,
        new_size: u64,
        new_end: u64,
    },
    /// The partition entry now reaches the end of the disk.
    Extended { filesystem_grown: bool },
}

/// The arithmetic of one shrink of the last partition.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ShrinkPlan {
    pub index: u32,
    /// Byte offset of the partition start.
    pub offset: u64,
    pub current_size: u64,
    /// Minimum filesystem size in blocks, as estimated by `resize2fs -P`.
    pub min_blocks: u64,
    pub block_size: u64,
    pub tail: u64,
}

impl ShrinkPlan {
    pub fn target_fs_bytes(&self) -> u64 {
        self.min_blocks * self.block_size
    }

    /// Partition size after the shrink.
    pub fn new_size(&self) -> u64 {
        self.target_fs_bytes() + self.tail
    }

    /// First byte past the shrunk partition. Never before its start.
    pub fn target_end_byte(&self) -> u64 {
        self.offset + self.new_size()
    }

    /// False when shrinking would not make the partition smaller.
    pub fn reduces_size(&self) -> bool {
        self.current_size > self.new_size()
    }
}

/// Shrinks the last partition of `target` to its filesystem's minimum size
/// plus `options.tail`.
pub fn shrink(
    ctx: &mut OperationContext,
    target: &ImageTarget,
    options: &ShrinkOptions,
) -> Result<ResizeOutcome> {
    let geometry = geometry::inspect(ctx, target)?;
    let target = target.clone().with_sector_size(geometry.sector_size);
    let partition = geometry.require_last_partition()?.clone();

    if let FsKind::Other(label) = &partition.fs {
        warn!(
            "Partition {} is not ext2/3/4 ({label}); not resizing it",
            partition.index
        );
        return Ok(ResizeOutcome::Skipped(SkipReason::UnsupportedFilesystem(
            label.clone(),
        )));
    }

    if geometry.is_gpt() && !options.dry_run {
        relocate_gpt_backup(ctx, &target.path)?;
    }

    let tail = options.tail;
    let dry_run = options.dry_run;
    let plan = loopdev::with_partition_bound(ctx, &target, &partition, |ctx, node| {
        let (min_blocks, checked) = estimate_min_blocks(ctx, node)?;
        let plan = ShrinkPlan {
            index: partition.index,
            offset: partition.offset_bytes(target.sector_size),
            current_size: partition.size_bytes,
            min_blocks,
            block_size: filesystem_block_size(ctx, node)?,
            tail,
        };
        debug!("{plan:?}");

        if dry_run || !plan.reduces_size() {
            return Ok(plan);
        }

        if !checked {
            check_filesystem(ctx, node)?;
        }
        info!(
            "Shrinking filesystem on partition {} to {} blocks of {} bytes",
            plan.index, plan.min_blocks, plan.block_size
        );
        ctx.run(
            &ToolCommand::new("resize2fs")
                .arg(node.display())
                .arg(plan.min_blocks),
        )?;
        Ok(plan)
    })?;

    if dry_run {
        return Ok(ResizeOutcome::Planned {
            new_end: plan.target_end_byte(),
        });
    }
    if !plan.reduces_size() {
        info!(
            "Partition {} is already at its minimum size ({} bytes); nothing to shrink",
            plan.index, plan.current_size
        );
        return Ok(ResizeOutcome::Skipped(SkipReason::NothingToGain {
            current_size: plan.current_size,
            target_size: plan.new_size(),
        }));
    }

    // parted takes the inclusive last byte.
    let last_byte = plan.target_end_byte() - 1;
    ctx.run(
        &ToolCommand::new("parted")
            .arg("---pretend-input-tty")
            .arg(target.path.display())
            .args(["unit", "B", "resizepart"])
            .arg(plan.index)
            .arg(format!("{last_byte}B"))
            .input("Yes\n"),
    )?;
    info!(
        "Partition {} shrunk from {} to {} bytes",
        plan.index,
        plan.current_size,
        plan.new_size()
    );

    Ok(ResizeOutcome::Shrunk {
        old_size: plan.current_size,
        new_size: plan.new_size(),
        new_end: plan.target_end_byte(),
    })
}

/// Grows the last partition to the end of `target`, then grows its
/// filesystem.
///
/// The partition entry change is mandatory; the filesystem check and resize
/// that follow are best-effort and only logged when they fail.
pub fn extend(ctx: &mut OperationContext, target: &ImageTarget) -> Result<ResizeOutcome> {
    let geometry = geometry::inspect(ctx, target)?;
    if geometry.is_gpt() {
        relocate_gpt_backup(ctx, &target.path)?;
    }
    let last = geometry.require_last_partition()?;
    let index = last.index;
    let end_sector = extended_end_sector(geometry.total_bytes, geometry.sector_size);

    if end_sector > last.end_sector {
        info!(
            "Extending partition {index} to sector {end_sector} of {}",
            target.path.display()
        );
        ctx.run(
            &ToolCommand::new("parted")
                .arg("-s")
                .arg(target.path.display())
                .args(["unit", "s", "resizepart"])
                .arg(index)
                .arg(format!("{end_sector}s")),
        )?;
        rescan_partitions(ctx, target);
    } else {
        info!("Partition {index} already reaches the end of {}", target.path.display());
    }

    let geometry = geometry::inspect(ctx, target)?;
    let target = target.clone().with_sector_size(geometry.sector_size);
    let Some(partition) = geometry
        .table
        .partitions
        .iter()
        .find(|p| p.index == index)
        .cloned()
    else {
        return Err(Error::geometry(format!(
            "partition {index} disappeared after resizing"
        )));
    };

    if !partition.is_ext() {
        warn!("Partition {index} is not ext2/3/4; its filesystem was not grown");
        return Ok(ResizeOutcome::Extended {
            filesystem_grown: false,
        });
    }

    let grown = loopdev::with_partition_bound(ctx, &target, &partition, |ctx, node| {
        Ok(grow_filesystem(ctx, node))
    })?;
    Ok(ResizeOutcome::Extended {
        filesystem_grown: grown,
    })
}

/// Last sector of an extended partition: one parted megabyte (10^6 bytes)
/// before the end of the device, rounded up to a whole sector.
fn extended_end_sector(total_bytes: u64, sector_size: u64) -> u64 {
    total_bytes.saturating_sub(EXTEND_RESERVE).div_ceil(sector_size)
}

fn grow_filesystem(ctx: &OperationContext, node: &Path) -> bool {
    if let Err(e) = ctx.run_accepting(&fsck_command(node), fsck_succeeded) {
        warn!("Consistency check before growing failed: {e}");
    }
    match ctx.run_tolerant(&ToolCommand::new("resize2fs").arg(node.display())) {
        Some(_) => {
            info!("Filesystem grown to fill its partition");
            true
        }
        None => {
            warn!("The partition was extended but its filesystem could not be grown");
            false
        }
    }
}

/// Moves the GPT backup header and table to the true end of the disk.
pub fn relocate_gpt_backup(ctx: &OperationContext, path: &Path) -> Result<()> {
    debug!("Relocating GPT backup header of {}", path.display());
    ctx.run(&ToolCommand::new("sgdisk").arg("-e").arg(path.display()))?;
    Ok(())
}

fn rescan_partitions(ctx: &OperationContext, target: &ImageTarget) {
    if target.is_device() {
        ctx.run_tolerant(&ToolCommand::new("partprobe").arg(target.path.display()));
    }
}

/// Returns the minimum block count and whether a consistency check ran.
fn estimate_min_blocks(ctx: &OperationContext, node: &Path) -> Result<(u64, bool)> {
    if let Some(blocks) = query_min_blocks(ctx, node) {
        return Ok((blocks, false));
    }

    warn!("Could not estimate the minimum filesystem size of {}", node.display());
    let prompt = format!(
        "Run a consistency check (e2fsck) on {} and try again?",
        node.display()
    );
    if !ctx.confirm(&prompt) {
        return Err(Error::precondition(
            "the filesystem size could not be estimated and the check was declined",
        ));
    }
    check_filesystem(ctx, node)?;

    query_min_blocks(ctx, node).map(|blocks| (blocks, true)).ok_or_else(|| {
        Error::ExternalTool {
            command: format!("resize2fs -P {}", node.display()),
            status: "no estimate after consistency check".to_string(),
            stderr: String::new(),
        }
    })
}

fn query_min_blocks(ctx: &OperationContext, node: &Path) -> Option<u64> {
    let output = ctx
        .run_tolerant(&ToolCommand::new("resize2fs").arg("-P").arg(node.display()))?;
    parse_min_blocks(&output.stdout)
}

fn filesystem_block_size(ctx: &OperationContext, node: &Path) -> Result<u64> {
    let command = ToolCommand::new("tune2fs").arg("-l").arg(node.display());
    let output = ctx.run(&command)?;
    parse_block_size(&output.stdout).ok_or_else(|| Error::ExternalTool {
        command: command.to_string(),
        status: "no block size reported".to_string(),
        stderr: output.stderr,
    })
}

fn check_filesystem(ctx: &OperationContext, node: &Path) -> Result<()> {
    info!("Checking filesystem on {}", node.display());
    ctx.run_accepting(&fsck_command(node), fsck_succeeded)?;
    Ok(())
}

fn fsck_command(node: &Path) -> ToolCommand {
    ToolCommand::new("e2fsck").args(["-f", "-y"]).arg(node.display())
}

/// Parses `Estimated minimum size of the filesystem: N` from `resize2fs -P`.
fn parse_min_blocks(output: &str) -> Option<u64> {
    output.lines().find_map(|line| {
        line.strip_prefix("Estimated minimum size of the filesystem:")
            .and_then(|n| n.trim().parse().ok())
    })
}

/// Parses `Block size: N` from `tune2fs -l`.
fn parse_block_size(output: &str) -> Option<u64> {
    output.lines().find_map(|line| {
        line.strip_prefix("Block size:")
            .and_then(|n| n.trim().parse().ok())
            .filter(|n: &u64| *n > 0)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::TargetKind;
    use crate::geometry::fixtures::{FDISK_GPT, FDISK_MBR, PARTED_BTRFS, PARTED_EXT4, SFDISK_GPT};
    use crate::tools::scripted::ScriptedRunner;
    use std::path::PathBuf;

    const TUNE2FS: &str = "\
tune2fs 1.47.0 (5-Feb-2023)
Filesystem volume name:   <none>
Block count:              5120
Block size:               1024
Fragment size:            1024
";

    fn image() -> ImageTarget {
        ImageTarget {
            path: PathBuf::from("disk.img"),
            kind: TargetKind::File,
            sector_size: 512,
            size_bytes: 10 * 1024 * 1024,
        }
    }

    fn bound_mbr_runner() -> ScriptedRunner {
        ScriptedRunner::new()
            .ok("fdisk -l", FDISK_MBR)
            .ok("parted -s disk.img print", PARTED_EXT4)
            .ok("losetup --show", "/dev/loop4\n")
            .ok("tune2fs -l", TUNE2FS)
    }

    fn mbr_runner(min_blocks: u64) -> ScriptedRunner {
        bound_mbr_runner().ok(
            "resize2fs -P",
            &format!("Estimated minimum size of the filesystem: {min_blocks}\n"),
        )
    }

    // Last partition of the fixtures: sectors 6144..=16383, 5 MiB at 3 MiB.
    const OFFSET: u64 = 6144 * 512;
    const SIZE: u64 = 10240 * 512;

    #[test]
    fn plan_arithmetic() {
        let plan = ShrinkPlan {
            index: 2,
            offset: OFFSET,
            current_size: SIZE,
            min_blocks: 1500,
            block_size: 1024,
            tail: 4096,
        };
        assert_eq!(plan.target_fs_bytes(), 1_536_000);
        assert_eq!(plan.new_size(), 1_540_096);
        assert_eq!(plan.target_end_byte(), OFFSET + 1_540_096);
        assert!(plan.reduces_size());

        let full = ShrinkPlan {
            min_blocks: 5120,
            tail: 0,
            ..plan
        };
        assert!(!full.reduces_size());
        assert!(full.target_end_byte() >= full.offset);
    }

    #[test]
    fn shrink_mbr_runs_resize_then_moves_partition_end() {
        let runner = mbr_runner(1500);
        let mut ctx = OperationContext::new(runner.clone());

        let outcome = shrink(&mut ctx, &image(), &ShrinkOptions { tail: 0, dry_run: false }).unwrap();
        assert_eq!(
            outcome,
            ResizeOutcome::Shrunk {
                old_size: SIZE,
                new_size: 1_536_000,
                new_end: OFFSET + 1_536_000,
            }
        );

        let calls = runner.calls();
        let position = |prefix: &str| calls.iter().position(|c| c.starts_with(prefix)).unwrap();
        assert!(!runner.called("sgdisk"));
        assert!(
            calls.contains(
                &"losetup --show -f --nooverlap -b 512 -o 3145728 --sizelimit 5242880 disk.img"
                    .to_string()
            )
        );
        assert!(position("e2fsck -f -y /dev/loop4") < position("resize2fs /dev/loop4 1500"));
        assert!(position("resize2fs /dev/loop4 1500") < position("losetup -d /dev/loop4"));
        let last_byte = OFFSET + 1_536_000 - 1;
        assert!(position("losetup -d /dev/loop4")
            < position(&format!(
                "parted ---pretend-input-tty disk.img unit B resizepart 2 {last_byte}B"
            )));
        assert!(ctx.loop_device().is_none());
    }

    #[test]
    fn tail_adds_exactly_its_size() {
        let zero = shrink(
            &mut OperationContext::new(mbr_runner(1500)),
            &image(),
            &ShrinkOptions { tail: 0, dry_run: false },
        )
        .unwrap();
        let tailed = shrink(
            &mut OperationContext::new(mbr_runner(1500)),
            &image(),
            &ShrinkOptions { tail: 65536, dry_run: false },
        )
        .unwrap();
        match (zero, tailed) {
            (
                ResizeOutcome::Shrunk { new_size: a, .. },
                ResizeOutcome::Shrunk { new_size: b, .. },
            ) => assert_eq!(b - a, 65536),
            other => panic!("unexpected outcomes: {other:?}"),
        }
    }

    #[test]
    fn gpt_relocates_backup_header_first() {
        let runner = ScriptedRunner::new()
            .ok("fdisk -l", FDISK_GPT)
            .ok("sfdisk --dump", SFDISK_GPT)
            .ok("parted -s disk.img print", PARTED_EXT4)
            .ok("losetup --show", "/dev/loop4\n")
            .ok("resize2fs -P", "Estimated minimum size of the filesystem: 1500\n")
            .ok("tune2fs -l", TUNE2FS);
        let mut ctx = OperationContext::new(runner.clone());

        shrink(&mut ctx, &image(), &ShrinkOptions::default()).unwrap();
        let calls = runner.calls();
        let sgdisk = calls.iter().position(|c| c == "sgdisk -e disk.img").unwrap();
        let losetup = calls.iter().position(|c| c.starts_with("losetup --show")).unwrap();
        assert!(sgdisk < losetup);
    }

    #[test]
    fn dry_run_reports_end_without_mutating() {
        let runner = mbr_runner(1500);
        let mut ctx = OperationContext::new(runner.clone());

        let outcome = shrink(&mut ctx, &image(), &ShrinkOptions { tail: 1024, dry_run: true }).unwrap();
        assert_eq!(
            outcome,
            ResizeOutcome::Planned {
                new_end: OFFSET + 1_536_000 + 1024
            }
        );
        assert!(runner.called("losetup -d /dev/loop4"));
        for mutating in ["e2fsck", "resize2fs /dev/loop4", "parted ---pretend-input-tty", "sgdisk"] {
            assert!(!runner.called(mutating), "{mutating} ran during a dry run");
        }
    }

    #[test]
    fn no_growth_in_the_name_of_shrink() {
        let runner = mbr_runner(5000);
        let mut ctx = OperationContext::new(runner.clone());

        let outcome = shrink(&mut ctx, &image(), &ShrinkOptions::default()).unwrap();
        assert_eq!(
            outcome,
            ResizeOutcome::Skipped(SkipReason::NothingToGain {
                current_size: SIZE,
                target_size: 5000 * 1024 + DEFAULT_TAIL,
            })
        );
        assert!(!runner.called("resize2fs /dev/loop4"));
        assert!(!runner.called("parted ---pretend-input-tty"));
        assert!(runner.called("losetup -d /dev/loop4"));
    }

    #[test]
    fn non_ext_filesystem_is_skipped_untouched() {
        let runner = ScriptedRunner::new()
            .ok("fdisk -l", FDISK_MBR)
            .ok("parted -s disk.img print", PARTED_BTRFS);
        let mut ctx = OperationContext::new(runner.clone());

        let outcome = shrink(&mut ctx, &image(), &ShrinkOptions::default()).unwrap();
        assert_eq!(
            outcome,
            ResizeOutcome::Skipped(SkipReason::UnsupportedFilesystem("primary btrfs".into()))
        );
        assert!(!runner.called("losetup"));
    }

    #[test]
    fn estimate_is_retried_once_after_a_forced_check() {
        let runner = bound_mbr_runner().fail("resize2fs -P").ok(
            "resize2fs -P",
            "Estimated minimum size of the filesystem: 1500\n",
        );
        let mut ctx = OperationContext::new(runner.clone()).with_auto_yes(true);

        let outcome = shrink(&mut ctx, &image(), &ShrinkOptions { tail: 0, dry_run: false }).unwrap();
        assert!(matches!(outcome, ResizeOutcome::Shrunk { .. }));
        let fscks = runner.calls().iter().filter(|c| c.starts_with("e2fsck")).count();
        assert_eq!(fscks, 1);
    }

    #[test]
    fn declined_check_aborts_and_still_unbinds() {
        let runner = bound_mbr_runner().fail("resize2fs -P");
        let mut ctx = OperationContext::new(runner.clone());

        let err = shrink(&mut ctx, &image(), &ShrinkOptions::default()).unwrap_err();
        assert!(err.is_precondition());
        assert!(!runner.called("e2fsck"));
        assert!(runner.called("losetup -d /dev/loop4"));
        assert!(ctx.loop_device().is_none());
    }

    #[test]
    fn failed_filesystem_shrink_leaves_table_alone() {
        let runner = mbr_runner(1500).fail("resize2fs /dev/loop4");
        let mut ctx = OperationContext::new(runner.clone());

        assert!(shrink(&mut ctx, &image(), &ShrinkOptions::default()).is_err());
        assert!(!runner.called("parted ---pretend-input-tty"));
        assert!(runner.called("losetup -d /dev/loop4"));
    }

    #[test]
    fn extend_grows_entry_then_filesystem() {
        let runner = mbr_runner(1500);
        let mut ctx = OperationContext::new(runner.clone());

        let outcome = extend(&mut ctx, &image()).unwrap();
        assert_eq!(outcome, ResizeOutcome::Extended { filesystem_grown: true });

        let calls = runner.calls();
        let position = |line: &str| calls.iter().position(|c| c == line).unwrap();
        assert!(
            position("parted -s disk.img unit s resizepart 2 18527s") < position("e2fsck -f -y /dev/loop4")
        );
        assert!(position("e2fsck -f -y /dev/loop4") < position("resize2fs /dev/loop4"));
        assert!(!runner.called("partprobe"));
        assert!(ctx.loop_device().is_none());
    }

    #[test]
    fn extend_tolerates_filesystem_failures() {
        let runner = mbr_runner(1500).fail("resize2fs /dev/loop4");
        let mut ctx = OperationContext::new(runner.clone());

        let outcome = extend(&mut ctx, &image()).unwrap();
        assert_eq!(outcome, ResizeOutcome::Extended { filesystem_grown: false });
        assert!(runner.called("losetup -d /dev/loop4"));
    }

    #[test]
    fn extend_grows_even_when_the_check_fails() {
        let runner = mbr_runner(1500).exit("e2fsck -f -y /dev/loop4", 8);
        let mut ctx = OperationContext::new(runner.clone());

        let outcome = extend(&mut ctx, &image()).unwrap();
        assert_eq!(outcome, ResizeOutcome::Extended { filesystem_grown: true });
        assert!(runner.called("resize2fs /dev/loop4"));
    }

    const FDISK_RESTORED: &str = "\
Disk /dev/loop9: 60 MiB, 62914560 bytes, 122880 sectors
Units: sectors of 1 * 512 = 512 bytes
Sector size (logical/physical): 512 bytes / 512 bytes
Disklabel type: dos

Device       Start   End Sectors Type
/dev/loop9p1  2048  6143    4096 Linux
/dev/loop9p2  6144 16383   10240 Linux
";

    const FDISK_EXTENDED: &str = "\
Disk /dev/loop9: 60 MiB, 62914560 bytes, 122880 sectors
Units: sectors of 1 * 512 = 512 bytes
Sector size (logical/physical): 512 bytes / 512 bytes
Disklabel type: dos

Device       Start    End Sectors Type
/dev/loop9p1  2048   6143    4096 Linux
/dev/loop9p2  6144 120927  114784 Linux
";

    #[test]
    fn restored_card_is_extended_to_a_megabyte_before_its_end() {
        let runner = ScriptedRunner::new()
            .ok("fdisk -l", FDISK_RESTORED)
            .ok("fdisk -l", FDISK_EXTENDED)
            .ok("parted -s /dev/loop9 print", PARTED_EXT4)
            .ok("losetup --show", "/dev/loop4\n");
        let mut ctx = OperationContext::new(runner.clone());
        let card = ImageTarget {
            path: PathBuf::from("/dev/loop9"),
            kind: TargetKind::Device,
            sector_size: 512,
            size_bytes: 60 * 1024 * 1024,
        };

        let outcome = extend(&mut ctx, &card).unwrap();
        assert_eq!(outcome, ResizeOutcome::Extended { filesystem_grown: true });
        assert!(runner.called("parted -s /dev/loop9 unit s resizepart 2 120927s"));
        assert!(runner.called("partprobe /dev/loop9"));
        assert!(runner.called("losetup --show -f --nooverlap -b 512 -o 3145728 --sizelimit 58769408 /dev/loop9"));
        assert_eq!((120927 - 6144 + 1) * 512, 58_769_408);
    }

    #[test]
    fn extend_leaves_a_full_length_entry_alone() {
        let runner = ScriptedRunner::new()
            .ok("fdisk -l", FDISK_EXTENDED)
            .ok("parted -s /dev/loop9 print", PARTED_EXT4)
            .ok("losetup --show", "/dev/loop4\n");
        let mut ctx = OperationContext::new(runner.clone());
        let card = ImageTarget {
            path: PathBuf::from("/dev/loop9"),
            kind: TargetKind::Device,
            sector_size: 512,
            size_bytes: 60 * 1024 * 1024,
        };

        extend(&mut ctx, &card).unwrap();
        assert!(!runner.called("parted -s /dev/loop9 unit s"));
        assert!(runner.called("resize2fs /dev/loop4"));
    }

    #[test]
    fn extended_end_keeps_one_parted_megabyte_free() {
        assert_eq!(extended_end_sector(62_914_560, 512), 120_927);
        assert_eq!(extended_end_sector(10_485_760, 512), 18_527);
        assert_eq!(extended_end_sector(500_000, 512), 0);
    }

    #[test]
    fn extend_fails_when_partition_entry_cannot_grow() {
        let runner = mbr_runner(1500).fail("parted -s disk.img unit s resizepart");
        let mut ctx = OperationContext::new(runner.clone());
        assert!(extend(&mut ctx, &image()).is_err());
        assert!(!runner.called("losetup"));
    }

    #[test]
    fn parses_resize2fs_and_tune2fs_output() {
        assert_eq!(
            parse_min_blocks("resize2fs 1.47.0 (5-Feb-2023)\nEstimated minimum size of the filesystem: 2371\n"),
            Some(2371)
        );
        assert_eq!(parse_min_blocks("Please run 'e2fsck -f /dev/loop0' first.\n"), None);
        assert_eq!(parse_block_size(TUNE2FS), Some(1024));
        assert_eq!(parse_block_size("Block size: 0\n"), None);
    }
}
