//! Overwriting the free space of Linux partitions with zeros so the image
//! compresses well.
use crate::context::{OperationContext, ProgressEvent};
use crate::device::ImageTarget;
use crate::error::Result;
use crate::geometry::Geometry;
use crate::loopdev;
use crate::mount;
use log::{info, warn};
use nix::sys::statvfs::statvfs;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::Path;

const FILLER_NAME: &str = "imgstow.zero";
const CHUNK: usize = 1024 * 1024;

/// Zero-fills every partition whose type label contains `Linux`.
///
/// A partition that cannot be mounted (swap, an unknown filesystem) is skipped
/// with a warning. Returns the number of partitions filled.
pub fn zero_fill(ctx: &mut OperationContext, target: &ImageTarget, geometry: &Geometry) -> Result<usize> {
    let mount_dir = ctx.workspace()?.mount_dir().to_path_buf();
    let target = target.clone().with_sector_size(geometry.sector_size);
    let mut filled = 0;

    for partition in geometry.table.partitions.iter().filter(|p| p.is_linux()) {
        let done = loopdev::with_partition_bound(ctx, &target, partition, |ctx, node| {
            if let Err(e) = mount::mount(ctx, node, &mount_dir) {
                warn!("Skipping zero-fill of partition {}: {e}", partition.index);
                return Ok(false);
            }
            let written = fill_free_space(ctx, &mount_dir);
            let unmounted = mount::unmount(ctx);
            let written = written?;
            unmounted?;
            info!("Zero-filled {written} bytes on partition {}", partition.index);
            Ok(true)
        })?;
        if done {
            filled += 1;
        }
    }
    Ok(filled)
}

/// Writes zeros into a filler file until the filesystem mounted at `dir` is
/// full, syncs it and deletes it again.
pub fn fill_free_space(ctx: &OperationContext, dir: &Path) -> Result<u64> {
    let stats = statvfs(dir).map_err(io::Error::from)?;
    let available = stats.blocks_available() as u64 * stats.fragment_size() as u64;
    let filler = dir.join(FILLER_NAME);

    let result = write_zeros(ctx, &filler, available);
    let removed = fs::remove_file(&filler);
    let written = result?;
    removed?;
    Ok(written)
}

fn write_zeros(ctx: &OperationContext, path: &Path, available: u64) -> Result<u64> {
    let mut file = File::create(path)?;
    let zeros = vec![0u8; CHUNK];
    let label = format!("Zero-filling {}", path.display());
    ctx.progress(ProgressEvent::Start {
        label: &label,
        total: available,
    });

    let mut written: u64 = 0;
    while written < available {
        ctx.check_running()?;
        let chunk = std::cmp::min(CHUNK as u64, available - written) as usize;
        match file.write(&zeros[..chunk]) {
            Ok(0) => break,
            Ok(n) => written += n as u64,
            Err(e) if is_out_of_space(&e) => break,
            Err(e) => return Err(e.into()),
        }
        ctx.progress(ProgressEvent::Advance(written));
    }
    match file.sync_all() {
        Err(e) if !is_out_of_space(&e) => return Err(e.into()),
        _ => {}
    }
    ctx.progress(ProgressEvent::Finish);
    Ok(written)
}

fn is_out_of_space(e: &io::Error) -> bool {
    e.kind() == io::ErrorKind::StorageFull || e.raw_os_error() == Some(libc::ENOSPC)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::FsKind;
    use crate::geometry::fixtures::two_partition_mbr;
    use crate::tools::scripted::ScriptedRunner;
    use crate::workspace::WorkspaceLease;
    use tempfile::TempDir;

    #[test]
    fn zeros_stop_at_the_reported_free_space() {
        let dir = TempDir::new().unwrap();
        let filler = dir.path().join(FILLER_NAME);
        let ctx = OperationContext::new(ScriptedRunner::new());

        let written = write_zeros(&ctx, &filler, 3 * CHUNK as u64 / 2).unwrap();
        assert_eq!(written, 3 * CHUNK as u64 / 2);
        let content = fs::read(&filler).unwrap();
        assert_eq!(content.len(), 3 * CHUNK / 2);
        assert!(content.iter().all(|b| *b == 0));
    }

    #[test]
    fn unmountable_partitions_are_skipped() {
        let base = TempDir::new().unwrap();
        let lease = WorkspaceLease::acquire(
            Some(&base.path().join("work")),
            Some(&base.path().join("mnt")),
        )
        .unwrap();
        let runner = ScriptedRunner::new()
            .ok("losetup --show", "/dev/loop9\n")
            .fail("mount");
        let mut ctx = OperationContext::new(runner.clone()).with_workspace(lease);
        let target = ImageTarget {
            path: "disk.img".into(),
            kind: crate::device::TargetKind::File,
            sector_size: 512,
            size_bytes: 10 * 1024 * 1024,
        };

        let filled = zero_fill(&mut ctx, &target, &two_partition_mbr(FsKind::Ext)).unwrap();
        assert_eq!(filled, 0);
        let releases = runner.calls().iter().filter(|c| c.starts_with("losetup -d")).count();
        assert_eq!(releases, 2);
        assert!(!runner.called("umount"));
    }
}
