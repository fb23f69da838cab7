//! Parsers for the textual output of the partition-table tools.
//!
//! Each parser accepts exactly the format it was written against and reports
//! anything else as [`Error::GeometryUnavailable`].
use super::{FsKind, TableKind};
use crate::error::{Error, Result};

/// One partition row of `fdisk -l -o Device,Start,End,Sectors,Type`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FdiskRow {
    pub index: u32,
    pub start: u64,
    pub end: u64,
    pub sectors: u64,
    pub type_label: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FdiskListing {
    pub total_bytes: u64,
    pub sector_size: u64,
    pub kind: TableKind,
    pub rows: Vec<FdiskRow>,
}

/// Parses `fdisk -l -o Device,Start,End,Sectors,Type <path>`.
pub fn parse_fdisk(output: &str, target_path: &str) -> Result<FdiskListing> {
    let mut total_bytes = None;
    let mut sector_size = None;
    let mut kind = None;
    let mut rows = Vec::new();
    let mut in_table = false;

    for line in output.lines() {
        if in_table {
            if line.trim().is_empty() {
                break;
            }
            rows.push(parse_fdisk_row(line, target_path)?);
            continue;
        }

        if line.starts_with("Disk ") && total_bytes.is_none() {
            total_bytes = line
                .split(',')
                .map(str::trim)
                .find_map(|part| part.strip_suffix(" bytes"))
                .and_then(|n| n.trim().parse::<u64>().ok());
        } else if let Some(rest) = line.strip_prefix("Sector size (logical/physical):") {
            sector_size = rest
                .split_whitespace()
                .next()
                .and_then(|n| n.parse::<u64>().ok());
        } else if let Some(rest) = line.strip_prefix("Disklabel type:") {
            kind = Some(match rest.trim() {
                "dos" => TableKind::Mbr,
                "gpt" => TableKind::Gpt,
                other => {
                    return Err(Error::geometry(format!(
                        "unsupported partition table type '{other}'"
                    )));
                }
            });
        } else if line.split_whitespace().next() == Some("Device") {
            in_table = true;
        }
    }

    let total_bytes =
        total_bytes.ok_or_else(|| Error::geometry("fdisk did not report the disk size"))?;
    let sector_size =
        sector_size.ok_or_else(|| Error::geometry("fdisk did not report the sector size"))?;
    let kind = kind.ok_or_else(|| Error::geometry("no partition table found"))?;
    if rows.is_empty() {
        return Err(Error::geometry("the partition table is empty"));
    }
    if sector_size == 0 || !sector_size.is_power_of_two() {
        return Err(Error::geometry(format!("invalid sector size {sector_size}")));
    }

    Ok(FdiskListing {
        total_bytes,
        sector_size,
        kind,
        rows,
    })
}

fn parse_fdisk_row(line: &str, target_path: &str) -> Result<FdiskRow> {
    let bad_row = || Error::geometry(format!("unexpected fdisk partition line: '{line}'"));

    let mut fields = line.split_whitespace();
    let device = fields.next().ok_or_else(bad_row)?;
    let mut number = || -> Result<u64> {
        fields
            .next()
            .and_then(|f| f.parse::<u64>().ok())
            .ok_or_else(bad_row)
    };
    let start = number()?;
    let end = number()?;
    let sectors = number()?;
    let type_label = fields.collect::<Vec<_>>().join(" ");

    if end < start || type_label.is_empty() {
        return Err(bad_row());
    }

    Ok(FdiskRow {
        index: partition_index(device, target_path).ok_or_else(bad_row)?,
        start,
        end,
        sectors,
        type_label,
    })
}

/// Extracts the partition number from a partition node name such as
/// `disk.img2`, `/dev/sdb1` or `/dev/mmcblk0p3`.
fn partition_index(device: &str, target_path: &str) -> Option<u32> {
    if let Some(suffix) = device.strip_prefix(target_path) {
        if let Ok(n) = suffix.trim_start_matches('p').parse() {
            return Some(n);
        }
    }
    let digits_at = device.trim_end_matches(|c: char| c.is_ascii_digit()).len();
    device[digits_at..].parse().ok()
}

/// Reads `first-lba` from `sfdisk --dump`.
///
/// Returns 0 when the dump describes no GPT (no backup table to reserve
/// space for).
pub fn parse_first_lba(dump: &str) -> Result<u64> {
    let mut is_gpt = false;
    let mut first_lba = None;
    for line in dump.lines() {
        if let Some(label) = line.strip_prefix("label:") {
            is_gpt = label.trim() == "gpt";
        } else if let Some(value) = line.strip_prefix("first-lba:") {
            first_lba = Some(
                value
                    .trim()
                    .parse::<u64>()
                    .map_err(|_| Error::geometry(format!("bad first-lba value '{value}'")))?,
            );
        }
    }

    match (is_gpt, first_lba) {
        (false, _) => Ok(0),
        (true, Some(lba)) => Ok(lba),
        (true, None) => Err(Error::geometry("GPT dump lacks first-lba")),
    }
}

/// Classifies a partition from the human-readable `parted -s <path> print`
/// summary.
///
/// This is a heuristic, not a superblock probe: the last line describing
/// partition `index` is searched for `ext2`, `ext3` or `ext4` tokens, so a
/// different filesystem whose name collides would be misclassified. Returns
/// `None` if no line describes the partition.
pub fn classify_filesystem(summary: &str, index: u32) -> Option<FsKind> {
    let line = summary
        .lines()
        .filter(|line| {
            line.split_whitespace()
                .next()
                .and_then(|n| n.parse::<u32>().ok())
                == Some(index)
        })
        .last()?;

    let tokens: Vec<&str> = line.split_whitespace().collect();
    if tokens
        .iter()
        .any(|t| matches!(*t, "ext2" | "ext3" | "ext4"))
    {
        return Some(FsKind::Ext);
    }

    // Everything after Number Start End Size: type, file system, name, flags.
    let rest = tokens.get(4..).map(|t| t.join(" ")).unwrap_or_default();
    if rest.is_empty() {
        Some(FsKind::Other("unknown".to_string()))
    } else {
        Some(FsKind::Other(rest))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MBR_LISTING: &str = "\
Disk /tmp/t.img: 10 MiB, 10485760 bytes, 20480 sectors
Units: sectors of 1 * 512 = 512 bytes
Sector size (logical/physical): 512 bytes / 512 bytes
I/O size (minimum/optimal): 512 bytes / 512 bytes
Disklabel type: dos
Disk identifier: 0x4c4a8e8b

Device      Start   End Sectors Type
/tmp/t.img1  2048  6143    4096 Linux
/tmp/t.img2  6144 16383   10240 Linux
";

    const GPT_LISTING: &str = "\
Disk /dev/mmcblk0: 29.72 GiB, 31914983424 bytes, 62333952 sectors
Units: sectors of 1 * 512 = 512 bytes
Sector size (logical/physical): 512 bytes / 512 bytes
I/O size (minimum/optimal): 512 bytes / 512 bytes
Disklabel type: gpt
Disk identifier: 6D4F2B0A-8F3A-4C3B-9A0E-0D8F5B3F2A11

Device           Start      End  Sectors Type
/dev/mmcblk0p1    2048   526335   524288 EFI System
/dev/mmcblk0p2  526336 62332927 61806592 Linux filesystem

Partition 2 does not start on physical sector boundary.
";

    #[test]
    fn parses_mbr_listing() {
        let listing = parse_fdisk(MBR_LISTING, "/tmp/t.img").unwrap();
        assert_eq!(listing.total_bytes, 10_485_760);
        assert_eq!(listing.sector_size, 512);
        assert_eq!(listing.kind, TableKind::Mbr);
        assert_eq!(
            listing.rows,
            vec![
                FdiskRow {
                    index: 1,
                    start: 2048,
                    end: 6143,
                    sectors: 4096,
                    type_label: "Linux".into(),
                },
                FdiskRow {
                    index: 2,
                    start: 6144,
                    end: 16383,
                    sectors: 10240,
                    type_label: "Linux".into(),
                },
            ]
        );
    }

    #[test]
    fn parses_gpt_listing_with_multi_word_types() {
        let listing = parse_fdisk(GPT_LISTING, "/dev/mmcblk0").unwrap();
        assert_eq!(listing.kind, TableKind::Gpt);
        assert_eq!(listing.rows.len(), 2);
        assert_eq!(listing.rows[0].type_label, "EFI System");
        assert_eq!(listing.rows[1].index, 2);
        assert_eq!(listing.rows[1].type_label, "Linux filesystem");
    }

    #[test]
    fn image_names_ending_in_digits_keep_their_index() {
        let listing = MBR_LISTING.replace("/tmp/t.img", "/tmp/disk2");
        let listing = parse_fdisk(&listing, "/tmp/disk2").unwrap();
        assert_eq!(listing.rows[0].index, 1);
        assert_eq!(listing.rows[1].index, 2);
    }

    #[test]
    fn empty_table_is_unavailable() {
        let output = "\
Disk /tmp/blank.img: 10 MiB, 10485760 bytes, 20480 sectors
Units: sectors of 1 * 512 = 512 bytes
Sector size (logical/physical): 512 bytes / 512 bytes
Disklabel type: dos
";
        let err = parse_fdisk(output, "/tmp/blank.img").unwrap_err();
        assert!(matches!(err, Error::GeometryUnavailable(_)));
    }

    #[test]
    fn unpartitioned_disk_is_unavailable() {
        let output = "Disk /tmp/raw.img: 1 MiB, 1048576 bytes, 2048 sectors\n";
        assert!(parse_fdisk(output, "/tmp/raw.img").is_err());
    }

    #[test]
    fn malformed_row_is_unavailable() {
        let output = MBR_LISTING.replace("6144 16383", "6144 oops");
        assert!(parse_fdisk(&output, "/tmp/t.img").is_err());
    }

    #[test]
    fn first_lba_from_gpt_dump() {
        let dump = "\
label: gpt
label-id: 6D4F2B0A-8F3A-4C3B-9A0E-0D8F5B3F2A11
device: /tmp/g.img
unit: sectors
first-lba: 34
last-lba: 20446
sector-size: 512

/tmp/g.img1 : start=        2048, size=        4096, type=0FC63DAF-8483-4772-8E79-3D69D8477DE4
";
        assert_eq!(parse_first_lba(dump).unwrap(), 34);
    }

    #[test]
    fn first_lba_is_zero_for_mbr() {
        let dump = "\
label: dos
label-id: 0x4c4a8e8b
device: /tmp/t.img
unit: sectors
sector-size: 512

/tmp/t.img1 : start=        2048, size=        4096, type=83
";
        assert_eq!(parse_first_lba(dump).unwrap(), 0);
        assert!(parse_first_lba("label: gpt\n").is_err());
    }

    #[test]
    fn classifies_ext_from_parted_summary() {
        let summary = "\
Model:  (file)
Disk /tmp/t.img: 10.5MB
Sector size (logical/physical): 512B/512B
Partition Table: msdos
Disk Flags:

Number  Start   End     Size    Type     File system  Flags
 1      1049kB  3146kB  2097kB  primary  fat32        lba
 2      3146kB  8389kB  5243kB  primary  ext4
";
        assert_eq!(classify_filesystem(summary, 2), Some(FsKind::Ext));
        assert_eq!(
            classify_filesystem(summary, 1),
            Some(FsKind::Other("primary fat32 lba".into()))
        );
        assert_eq!(classify_filesystem(summary, 3), None);
    }
}
