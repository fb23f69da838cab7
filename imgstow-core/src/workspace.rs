//! Working and mount directories leased for the duration of one run.
use crate::error::Result;
use log::warn;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Name prefix of working directories created under the system temp dir.
pub const WORK_DIR_PREFIX: &str = "imgstow-work.";
/// Name prefix of mount directories created under the system temp dir.
pub const MOUNT_DIR_PREFIX: &str = "imgstow-mnt.";

#[derive(Debug)]
struct LeasedDir {
    path: PathBuf,
    created: bool,
}

impl LeasedDir {
    fn acquire(requested: Option<&Path>, prefix: &str) -> io::Result<Self> {
        match requested {
            Some(path) if path.exists() => Ok(Self {
                path: path.to_path_buf(),
                created: false,
            }),
            Some(path) => {
                fs::create_dir_all(path)?;
                Ok(Self {
                    path: path.to_path_buf(),
                    created: true,
                })
            }
            None => {
                let dir = tempfile::Builder::new().prefix(prefix).tempdir()?;
                Ok(Self {
                    path: dir.keep(),
                    created: true,
                })
            }
        }
    }

    /// Removes the directory if we created it and it is empty.
    ///
    /// Returns the path when it had to be left behind.
    fn release(self) -> Option<PathBuf> {
        if !self.created || !self.path.exists() {
            return None;
        }
        match is_empty_dir(&self.path) {
            Ok(true) => match fs::remove_dir(&self.path) {
                Ok(()) => None,
                Err(e) => {
                    warn!("Could not remove {}: {e}", self.path.display());
                    Some(self.path)
                }
            },
            _ => Some(self.path),
        }
    }
}

/// A working directory and a mount directory owned by one run.
///
/// Directories created by the lease are deleted on release only when empty;
/// anything else found inside them is never touched.
#[derive(Debug)]
pub struct WorkspaceLease {
    work: LeasedDir,
    mount: LeasedDir,
}

impl WorkspaceLease {
    /// Uses the requested directories (creating them when absent) or fresh
    /// temporary ones.
    pub fn acquire(work_dir: Option<&Path>, mount_dir: Option<&Path>) -> Result<Self> {
        let work = LeasedDir::acquire(work_dir, WORK_DIR_PREFIX)?;
        let mount = LeasedDir::acquire(mount_dir, MOUNT_DIR_PREFIX)?;
        Ok(Self { work, mount })
    }

    pub fn work_dir(&self) -> &Path {
        &self.work.path
    }

    pub fn mount_dir(&self) -> &Path {
        &self.mount.path
    }

    /// Releases both directories, returning those left behind because they
    /// were not empty.
    pub fn release(self) -> Vec<PathBuf> {
        [self.work.release(), self.mount.release()]
            .into_iter()
            .flatten()
            .collect()
    }
}

fn is_empty_dir(path: &Path) -> io::Result<bool> {
    Ok(fs::read_dir(path)?.next().is_none())
}

/// Lists leftover imgstow directories under `base`, skipping `exclude`.
pub fn find_lingering(base: &Path, exclude: &[&Path]) -> Vec<PathBuf> {
    let Ok(entries) = fs::read_dir(base) else {
        return Vec::new();
    };

    let mut found: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok())
        .filter(|entry| {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            name.starts_with(WORK_DIR_PREFIX) || name.starts_with(MOUNT_DIR_PREFIX)
        })
        .map(|entry| entry.path())
        .filter(|path| path.is_dir() && !exclude.iter().any(|e| *e == path.as_path()))
        .collect();
    found.sort();
    found
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn empty_created_dirs_are_removed() {
        let base = TempDir::new().unwrap();
        let work = base.path().join("work");
        let mount = base.path().join("mnt");

        let lease = WorkspaceLease::acquire(Some(&work), Some(&mount)).unwrap();
        assert!(work.is_dir() && mount.is_dir());

        assert!(lease.release().is_empty());
        assert!(!work.exists());
        assert!(!mount.exists());
    }

    #[test]
    fn foreign_file_added_during_run_is_preserved() {
        let base = TempDir::new().unwrap();
        let work = base.path().join("work");

        let lease = WorkspaceLease::acquire(Some(&work), Some(&base.path().join("m"))).unwrap();
        fs::write(work.join("notes.txt"), b"keep me").unwrap();

        let lingering = lease.release();
        assert_eq!(lingering, vec![work.clone()]);
        assert_eq!(fs::read(work.join("notes.txt")).unwrap(), b"keep me");
    }

    #[test]
    fn pre_existing_dir_is_left_alone() {
        let base = TempDir::new().unwrap();
        let work = base.path().join("work");
        fs::create_dir(&work).unwrap();
        fs::write(work.join("foreign.bin"), b"x").unwrap();

        let lease = WorkspaceLease::acquire(Some(&work), Some(&base.path().join("m"))).unwrap();
        assert!(lease.release().is_empty());
        assert!(work.join("foreign.bin").exists());
    }

    #[test]
    fn lingering_dirs_are_found_by_prefix() {
        let base = TempDir::new().unwrap();
        let old = base.path().join(format!("{WORK_DIR_PREFIX}abc123"));
        let current = base.path().join(format!("{MOUNT_DIR_PREFIX}xyz789"));
        fs::create_dir(&old).unwrap();
        fs::create_dir(&current).unwrap();
        fs::create_dir(base.path().join("unrelated")).unwrap();

        assert_eq!(find_lingering(base.path(), &[current.as_path()]), vec![old]);
    }
}
