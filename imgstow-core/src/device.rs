use crate::error::{Error, Result};
use nix::ioctl_read;
use std::fmt;
use std::fs::File;
use std::os::unix::fs::FileTypeExt;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

ioctl_read!(blkgetsize64, 0x12, 114, u64);

/// Sector size assumed until the partition table has been inspected.
pub const DEFAULT_SECTOR_SIZE: u64 = 512;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TargetKind {
    Device,
    File,
}

/// The block device or image file an operation works on.
///
/// Resolved once at the start of an operation; the size is re-read only after
/// an operation has changed it (truncation).
#[derive(Clone, Debug)]
pub struct ImageTarget {
    /// The system path of the device or image (e.g., `/dev/sdb` or `disk.img`).
    pub path: PathBuf,
    pub kind: TargetKind,
    /// Logical sector size in bytes.
    pub sector_size: u64,
    /// The total size in bytes.
    pub size_bytes: u64,
}

impl ImageTarget {
    /// Resolves `path` to a device or regular file and reads its size.
    pub fn resolve(path: &Path) -> Result<Self> {
        let meta = std::fs::metadata(path).map_err(|e| {
            Error::precondition(format!("cannot access {}: {e}", path.display()))
        })?;
        let file_type = meta.file_type();

        let (kind, size_bytes) = if file_type.is_block_device() {
            (TargetKind::Device, block_device_size(path)?)
        } else if file_type.is_file() {
            (TargetKind::File, meta.len())
        } else {
            return Err(Error::precondition(format!(
                "{} is neither a block device nor a regular file",
                path.display()
            )));
        };

        Ok(Self {
            path: path.to_path_buf(),
            kind,
            sector_size: DEFAULT_SECTOR_SIZE,
            size_bytes,
        })
    }

    pub fn is_device(&self) -> bool {
        self.kind == TargetKind::Device
    }

    /// Returns a copy carrying the inspected sector size.
    pub fn with_sector_size(mut self, sector_size: u64) -> Self {
        self.sector_size = sector_size;
        self
    }

    /// The file name used for archive entries, `image` if there is none.
    pub fn display_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "image".to_string())
    }
}

impl fmt::Display for ImageTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.kind {
            TargetKind::Device => "device",
            TargetKind::File => "image",
        };
        write!(
            f,
            "{} [{kind}, {:.1} MiB, {} B sectors]",
            self.path.display(),
            self.size_bytes as f64 / (1024.0 * 1024.0),
            self.sector_size
        )
    }
}

/// Gets the device size in bytes with the `BLKGETSIZE64` ioctl.
pub fn block_device_size(path: &Path) -> Result<u64> {
    let file = File::open(path)?;
    let mut size_bytes: u64 = 0;
    unsafe {
        blkgetsize64(file.as_raw_fd(), &mut size_bytes).map_err(std::io::Error::from)?;
    }
    if size_bytes == 0 {
        return Err(Error::precondition(format!(
            "{} reports a size of zero",
            path.display()
        )));
    }
    Ok(size_bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn regular_file_resolves_as_image() {
        let file = NamedTempFile::new().unwrap();
        file.as_file().set_len(4096).unwrap();

        let target = ImageTarget::resolve(file.path()).unwrap();
        assert_eq!(target.kind, TargetKind::File);
        assert_eq!(target.size_bytes, 4096);
        assert_eq!(target.sector_size, DEFAULT_SECTOR_SIZE);
        assert!(!target.is_device());
    }

    #[test]
    fn missing_path_is_a_precondition_error() {
        let err = ImageTarget::resolve(Path::new("/nonexistent/imgstow.img")).unwrap_err();
        assert!(err.is_precondition());
    }

    #[test]
    fn directory_is_rejected() {
        let dir = tempfile::TempDir::new().unwrap();
        assert!(ImageTarget::resolve(dir.path()).is_err());
    }
}
