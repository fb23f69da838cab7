//! Partition geometry of a device or image, as reported by the partitioning
//! tools.
//!
//! The layout is derived, never edited here: mutations go through external
//! tools and the geometry is inspected again afterwards.
pub mod parse;

use crate::context::OperationContext;
use crate::device::ImageTarget;
use crate::error::{Error, Result};
use crate::tools::ToolCommand;
use log::{debug, trace};
use std::fmt;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TableKind {
    Mbr,
    Gpt,
}

impl fmt::Display for TableKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TableKind::Mbr => "MBR",
            TableKind::Gpt => "GPT",
        })
    }
}

/// Filesystem family as far as resizing is concerned.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FsKind {
    /// ext2, ext3 or ext4; the only family imgstow resizes.
    Ext,
    Other(String),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Partition {
    /// 1-based, as numbered by the partitioning tools.
    pub index: u32,
    pub start_sector: u64,
    /// Inclusive.
    pub end_sector: u64,
    pub size_bytes: u64,
    /// The partition type label (e.g. `Linux`, `W95 FAT32 (LBA)`).
    pub type_label: String,
    pub fs: FsKind,
}

impl Partition {
    pub fn offset_bytes(&self, sector_size: u64) -> u64 {
        self.start_sector * sector_size
    }

    /// First byte past the partition.
    pub fn end_byte(&self, sector_size: u64) -> u64 {
        (self.end_sector + 1) * sector_size
    }

    pub fn is_ext(&self) -> bool {
        self.fs == FsKind::Ext
    }

    pub fn is_linux(&self) -> bool {
        self.type_label.contains("Linux")
    }

    pub fn is_fat32(&self) -> bool {
        self.type_label.contains("FAT32")
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PartitionTable {
    pub kind: TableKind,
    /// Ordered by start sector.
    pub partitions: Vec<Partition>,
    /// 0 for MBR or when there is no GPT structure.
    pub first_usable_lba: u64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Geometry {
    pub sector_size: u64,
    pub total_bytes: u64,
    pub table: PartitionTable,
}

impl Geometry {
    pub fn is_gpt(&self) -> bool {
        self.table.kind == TableKind::Gpt
    }

    /// The partition reaching furthest into the disk.
    pub fn last_partition(&self) -> Option<&Partition> {
        self.table
            .partitions
            .iter()
            .max_by_key(|p| (p.end_sector, p.index))
    }

    /// Like [`Geometry::last_partition`], for callers that need one.
    pub fn require_last_partition(&self) -> Result<&Partition> {
        self.last_partition()
            .ok_or_else(|| Error::geometry("the partition table holds no partitions"))
    }

    /// Bytes up to and including the last sector of any partition; 0 for an
    /// empty table.
    pub fn end_of_data_bytes(&self) -> u64 {
        self.last_partition()
            .map_or(0, |p| p.end_byte(self.sector_size))
    }

    /// Space kept after the data for a relocated GPT backup table.
    pub fn gpt_reserve_bytes(&self) -> u64 {
        self.table.first_usable_lba * self.sector_size
    }
}

/// Reads the partition geometry of `target`.
///
/// Fails with [`Error::GeometryUnavailable`] when a tool is missing, fails, or
/// prints something unexpected, or when the table has no partitions.
pub fn inspect(ctx: &OperationContext, target: &ImageTarget) -> Result<Geometry> {
    let path = target.path.to_string_lossy().into_owned();

    let listing = query(
        ctx,
        ToolCommand::new("fdisk")
            .args(["-l", "-o", "Device,Start,End,Sectors,Type"])
            .arg(&path),
    )?;
    let listing = parse::parse_fdisk(&listing, &path)?;

    let first_usable_lba = match listing.kind {
        TableKind::Gpt => {
            let dump = query(ctx, ToolCommand::new("sfdisk").arg("--dump").arg(&path))?;
            parse::parse_first_lba(&dump)?
        }
        TableKind::Mbr => 0,
    };

    let summary = query(
        ctx,
        ToolCommand::new("parted").arg("-s").arg(&path).arg("print"),
    )?;

    let mut partitions: Vec<Partition> = listing
        .rows
        .into_iter()
        .map(|row| {
            let fs = parse::classify_filesystem(&summary, row.index)
                .unwrap_or_else(|| FsKind::Other("unknown".to_string()));
            Partition {
                index: row.index,
                start_sector: row.start,
                end_sector: row.end,
                size_bytes: row.sectors * listing.sector_size,
                type_label: row.type_label,
                fs,
            }
        })
        .collect();
    partitions.sort_by_key(|p| p.start_sector);

    let geometry = Geometry {
        sector_size: listing.sector_size,
        total_bytes: listing.total_bytes,
        table: PartitionTable {
            kind: listing.kind,
            partitions,
            first_usable_lba,
        },
    };
    debug!(
        "{}: {} table, {} partition(s), {} B sectors, data ends at byte {}",
        target.path.display(),
        geometry.table.kind,
        geometry.table.partitions.len(),
        geometry.sector_size,
        geometry.end_of_data_bytes()
    );
    trace!("{geometry:#?}");
    Ok(geometry)
}

fn query(ctx: &OperationContext, command: ToolCommand) -> Result<String> {
    ctx.run(&command)
        .map(|output| output.stdout)
        .map_err(|e| Error::geometry(e.to_string()))
}
