//! Host queries: free space per directory, mount state and privilege level.
//!
//! Disk and mount information comes from `sysinfo`'s disk list, the same view
//! for every query, so that "same device" and "free space" always agree.
use crate::error::{Error, Result};
use std::path::{Path, PathBuf};
use sysinfo::Disks;

/// Free space of the mounted filesystem backing some directory.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DiskSpace {
    /// Device name as reported by the system (e.g. `/dev/sda2`).
    pub device: String,
    pub mount_point: PathBuf,
    /// Bytes available to unprivileged writers.
    pub available: u64,
}

impl DiskSpace {
    /// True when both directories live on the same mounted filesystem.
    pub fn same_device(&self, other: &DiskSpace) -> bool {
        self.mount_point == other.mount_point
    }
}

/// Resolves the filesystem holding `dir` and reports its free space.
///
/// `dir` must exist; it is canonicalised before matching mount points.
pub fn disk_space(dir: &Path) -> Result<DiskSpace> {
    let dir = dir.canonicalize().map_err(|e| {
        Error::precondition(format!("cannot resolve {}: {e}", dir.display()))
    })?;
    let disks = Disks::new_with_refreshed_list();
    let mounts = disks.iter().map(|disk| DiskSpace {
        device: disk.name().to_string_lossy().into_owned(),
        mount_point: disk.mount_point().to_path_buf(),
        available: disk.available_space(),
    });

    backing_mount(&dir, mounts).ok_or_else(|| {
        Error::precondition(format!(
            "could not find the filesystem holding {}",
            dir.display()
        ))
    })
}

/// Picks the mount whose mount point is the longest prefix of `dir`.
fn backing_mount(dir: &Path, mounts: impl IntoIterator<Item = DiskSpace>) -> Option<DiskSpace> {
    mounts
        .into_iter()
        .filter(|m| dir.starts_with(&m.mount_point))
        .max_by_key(|m| m.mount_point.components().count())
}

/// Mount points of `device` or any of its partitions.
pub fn mount_points_of(device: &Path) -> Vec<PathBuf> {
    let disks = Disks::new_with_refreshed_list();
    let device = device.to_string_lossy();
    disks
        .iter()
        .filter(|disk| names_device_or_partition(&disk.name().to_string_lossy(), &device))
        .map(|disk| disk.mount_point().to_path_buf())
        .collect()
}

/// Fails with a precondition error when `device` or one of its partitions is
/// mounted.
pub fn ensure_unmounted(device: &Path) -> Result<()> {
    refuse_mounted(device, &mount_points_of(device))
}

/// Fails with a precondition error naming `mounts` unless it is empty.
pub fn refuse_mounted(device: &Path, mounts: &[PathBuf]) -> Result<()> {
    if mounts.is_empty() {
        return Ok(());
    }
    let list: Vec<String> = mounts.iter().map(|m| m.display().to_string()).collect();
    Err(Error::precondition(format!(
        "{} is mounted on {}; unmount it first",
        device.display(),
        list.join(", ")
    )))
}

/// `/dev/sdb` names itself and `/dev/sdb1`; `/dev/mmcblk0` also names
/// `/dev/mmcblk0p1`, but not `/dev/mmcblk01`.
fn names_device_or_partition(name: &str, device: &str) -> bool {
    let Some(rest) = name.strip_prefix(device) else {
        return false;
    };
    let ends_in_digit = device.chars().last().is_some_and(|c| c.is_ascii_digit());
    let rest = if ends_in_digit {
        match rest.strip_prefix('p') {
            Some(part) => part,
            None if rest.is_empty() => rest,
            None => return false,
        }
    } else {
        rest
    };
    rest.chars().all(|c| c.is_ascii_digit())
}

pub fn is_root() -> bool {
    nix::unistd::geteuid().is_root()
}
